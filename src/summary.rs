//! The pkg_summary(5) index of a package repository, and how to obtain one:
//! from the installed set, from a summary file (possibly compressed,
//! possibly remote), or by scanning a directory of binary packages.

use std::collections::BTreeMap;
use std::io::Read;
use std::ops::{Deref, DerefMut};

use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use crate::harness::Harness;
use crate::name::{Pkgbase, Pkgname, Pkgpath};
use crate::pattern::Pkgpattern;
use crate::report::Reporter;
use crate::xargs::xargs_fold;

/// Candidate summary files, best compression first.
const SUMMARY_FILES: [&str; 3] = ["pkg_summary.bz2", "pkg_summary.gz", "pkg_summary.txt"];

/// The subset of pkg_summary(5) variables the tools use.
#[derive(Clone, Debug)]
pub struct Pkgvars {
    pub depends: Vec<Pkgpattern>,
    pub file_name: Option<Utf8PathBuf>,
    pub pkgname: Pkgname,
    pub pkgpath: Pkgpath,
}

/// An ordered map from PKGNAME to its variables. Merging two summaries is
/// commutative up to the invariant that a name maps to one record.
#[derive(Clone, Debug, Default)]
pub struct Summary(BTreeMap<Pkgname, Pkgvars>);

impl Deref for Summary {
    type Target = BTreeMap<Pkgname, Pkgvars>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Summary {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Summary {
    pub fn new() -> Self {
        Summary::default()
    }

    /// Parse concatenated pkg_summary(5) paragraphs. A paragraph is
    /// committed only when it has both a PKGNAME and a PKGPATH; anything
    /// else is silently discarded. A malformed DEPENDS pattern aborts the
    /// parse.
    pub fn parse(text: &str) -> Result<Self> {
        let mut summary = Summary::new();
        let mut depends: Vec<Pkgpattern> = Vec::new();
        let mut file_name: Option<Utf8PathBuf> = None;
        let mut pkgname: Option<Pkgname> = None;
        let mut pkgpath: Option<Pkgpath> = None;

        let mut commit = |depends: &mut Vec<Pkgpattern>,
                          file_name: &mut Option<Utf8PathBuf>,
                          pkgname: &mut Option<Pkgname>,
                          pkgpath: &mut Option<Pkgpath>,
                          summary: &mut Summary| {
            if let (Some(name), Some(path)) = (pkgname.take(), pkgpath.take()) {
                summary.0.insert(
                    name.clone(),
                    Pkgvars {
                        depends: std::mem::take(depends),
                        file_name: file_name.take(),
                        pkgname: name,
                        pkgpath: path,
                    },
                );
            }
            depends.clear();
            file_name.take();
            pkgname.take();
            pkgpath.take();
        };

        for line in text.lines() {
            if line.is_empty() {
                commit(
                    &mut depends,
                    &mut file_name,
                    &mut pkgname,
                    &mut pkgpath,
                    &mut summary,
                );
                continue;
            }
            let Some((variable, value)) = line.split_once('=') else {
                continue;
            };
            match variable {
                "DEPENDS" => depends.push(
                    Pkgpattern::parse(value)
                        .with_context(|| format!("Bad DEPENDS pattern `{value}'"))?,
                ),
                "FILE_NAME" if !value.is_empty() => file_name = Some(Utf8PathBuf::from(value)),
                "PKGNAME" => pkgname = Some(Pkgname::parse(value)),
                "PKGPATH" => pkgpath = value.parse().ok(),
                _ => {}
            }
        }
        commit(
            &mut depends,
            &mut file_name,
            &mut pkgname,
            &mut pkgpath,
            &mut summary,
        );
        Ok(summary)
    }

    /// Write the summary back out in pkg_summary(5) form.
    pub fn emit(&self) -> String {
        let mut out = String::new();
        for vars in self.0.values() {
            for dep in &vars.depends {
                out.push_str(&format!("DEPENDS={dep}\n"));
            }
            if let Some(file) = &vars.file_name {
                out.push_str(&format!("FILE_NAME={file}\n"));
            }
            out.push_str(&format!("PKGNAME={}\n", vars.pkgname));
            out.push_str(&format!("PKGPATH={}\n", vars.pkgpath));
            out.push('\n');
        }
        out
    }

    pub fn merge(&mut self, other: Summary) {
        self.0.extend(other.0);
    }

    /// Query the installed-package database for a summary of everything
    /// installed.
    pub async fn from_installed(pkg_info: &str) -> Result<Self> {
        let mut child = Harness::shell(pkg_info).args(["-X", "*"]).spawn()?;
        let output = child.read_stdout().await?;
        child.wait_exit().await?;
        Summary::parse(&output)
    }

    /// Obtain the summary of a binary package repository, local directory
    /// or URL.
    pub async fn from_packages(
        reporter: &Reporter,
        concurrency: usize,
        packages: &Utf8Path,
        pkg_info: &str,
        pkg_sufx: &str,
    ) -> Result<Self> {
        if packages.as_str().contains("://") {
            Summary::from_remote_packages(reporter, packages).await
        } else {
            Summary::from_local_packages(reporter, concurrency, packages, pkg_info, pkg_sufx).await
        }
    }

    async fn from_local_packages(
        reporter: &Reporter,
        concurrency: usize,
        packages: &Utf8Path,
        pkg_info: &str,
        pkg_sufx: &str,
    ) -> Result<Self> {
        // The newest binary package decides whether a summary file is
        // stale. Computed at most once, and not at all when no summary
        // file exists.
        let mut newest_pkg: Option<std::time::SystemTime> = None;
        let mut newest = |packages: &Utf8Path| -> Result<std::time::SystemTime> {
            if let Some(t) = newest_pkg {
                return Ok(t);
            }
            let mut t = std::time::SystemTime::UNIX_EPOCH;
            for entry in packages
                .read_dir_utf8()
                .with_context(|| format!("Failed to scan {packages}"))?
            {
                let entry = entry?;
                if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                    t = t.max(modified);
                }
            }
            newest_pkg = Some(t);
            Ok(t)
        };

        for summary_file in SUMMARY_FILES {
            let path = packages.join(summary_file);
            let Ok(meta) = path.metadata() else {
                continue;
            };
            let summary_mtime = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            if summary_mtime < newest(packages)? {
                crate::msg!(
                    reporter,
                    "** Ignoring {path} as there are newer packages in {packages}"
                );
                continue;
            }
            crate::verbose_msg!(reporter, "Using summary file: {path}");

            let raw = std::fs::read(&path).with_context(|| format!("Failed to open {path}"))?;
            return Summary::parse(&decompress_by_extension(&path, &raw)?);
        }

        crate::verbose_msg!(reporter, "No valid summaries exist. Scanning {packages} ...");
        let mut files: Vec<String> = Vec::new();
        for entry in packages
            .read_dir_utf8()
            .with_context(|| format!("Failed to scan {packages}"))?
        {
            let entry = entry?;
            if entry.file_name().ends_with(pkg_sufx) {
                files.push(entry.path().to_string());
            }
        }
        files.sort();

        let cmd = vec![
            crate::harness::SHELL.to_owned(),
            "-c".to_owned(),
            format!("exec {pkg_info} -X \"$@\""),
            // $0 of the shell; the rest of argv comes from xargs.
            crate::harness::SHELL.to_owned(),
        ];
        xargs_fold(
            &cmd,
            files,
            |stdout| Summary::parse(stdout),
            |folded: &mut Summary, partial| folded.merge(partial),
            concurrency,
        )
        .await
    }

    async fn from_remote_packages(reporter: &Reporter, packages: &Utf8Path) -> Result<Self> {
        for summary_file in SUMMARY_FILES {
            let url = format!("{packages}/{summary_file}");
            match fetch_remote(&url).await? {
                Some(raw) => {
                    crate::verbose_msg!(reporter, "Using summary file: {url}");
                    return Summary::parse(&decompress_by_extension(Utf8Path::new(&url), &raw)?);
                }
                // Not there; try the next candidate.
                None => continue,
            }
        }
        bail!("No summary files are available: {packages}");
    }
}

/// `Ok(None)` when the file is not available on the server; transport
/// failures propagate.
async fn fetch_remote(url: &str) -> Result<Option<Vec<u8>>> {
    let response = reqwest::get(url)
        .await
        .with_context(|| format!("Failed to fetch {url}"))?;
    if response.status() == reqwest::StatusCode::NOT_FOUND
        || response.status() == reqwest::StatusCode::GONE
    {
        return Ok(None);
    }
    let response = response
        .error_for_status()
        .with_context(|| format!("Failed to fetch {url}"))?;
    Ok(Some(response.bytes().await?.to_vec()))
}

fn decompress_by_extension(path: &Utf8Path, raw: &[u8]) -> Result<String> {
    let mut text = String::new();
    match path.extension() {
        Some("bz2") => {
            bzip2::read::BzDecoder::new(raw)
                .read_to_string(&mut text)
                .with_context(|| format!("Failed to decompress {path}"))?;
        }
        Some("gz") => {
            flate2::read::GzDecoder::new(raw)
                .read_to_string(&mut text)
                .with_context(|| format!("Failed to decompress {path}"))?;
        }
        _ => text = String::from_utf8_lossy(raw).into_owned(),
    }
    Ok(text)
}

/// `pkgpath → pkgbase → summary`: the same records grouped by where they
/// are built and then by base, because one PKGPATH can provide several
/// bases (the py-* pattern).
#[derive(Clone, Debug, Default)]
pub struct Pkgmap(BTreeMap<Pkgpath, BTreeMap<Pkgbase, Summary>>);

impl Deref for Pkgmap {
    type Target = BTreeMap<Pkgpath, BTreeMap<Pkgbase, Summary>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Pkgmap {
    pub fn from_summary(all_packages: &Summary) -> Self {
        let mut map = Pkgmap::default();
        for (name, vars) in all_packages.iter() {
            map.0
                .entry(vars.pkgpath.clone())
                .or_default()
                .entry(name.base.clone())
                .or_default()
                .insert(name.clone(), vars.clone());
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
DEPENDS=glib2>=2.76
DEPENDS=pcre2-[0-9]*
PKGNAME=vte3-0.74.1
PKGPATH=x11/vte3
FILE_NAME=vte3-0.74.1.tgz

PKGNAME=orphan-1.0

PKGNAME=figlet-2.2.5nb1
PKGPATH=misc/figlet
";

    #[test]
    fn paragraphs_without_pkgpath_are_discarded() {
        let summary = Summary::parse(SAMPLE).unwrap();
        let names: Vec<_> = summary.keys().map(ToString::to_string).collect();
        assert_eq!(names, ["figlet-2.2.5nb1", "vte3-0.74.1"]);
    }

    #[test]
    fn fields_survive_parsing() {
        let summary = Summary::parse(SAMPLE).unwrap();
        let vte = &summary[&Pkgname::parse("vte3-0.74.1")];
        assert_eq!(vte.depends.len(), 2);
        assert_eq!(vte.file_name.as_deref(), Some(Utf8Path::new("vte3-0.74.1.tgz")));
        assert_eq!(vte.pkgpath.to_string(), "x11/vte3");
        assert_eq!(vte.pkgname.to_string(), "vte3-0.74.1");
    }

    #[test]
    fn emit_then_parse_is_identity() {
        let summary = Summary::parse(SAMPLE).unwrap();
        let reparsed = Summary::parse(&summary.emit()).unwrap();
        assert_eq!(summary.emit(), reparsed.emit());
        assert_eq!(summary.len(), reparsed.len());
    }

    #[test]
    fn bad_depends_pattern_aborts_the_parse() {
        let text = "DEPENDS=foo{bar\nPKGNAME=x-1.0\nPKGPATH=a/b\n\n";
        assert!(Summary::parse(text).is_err());
    }

    #[test]
    fn final_paragraph_without_trailing_blank_line_is_committed() {
        let text = "PKGNAME=x-1.0\nPKGPATH=a/b";
        let summary = Summary::parse(text).unwrap();
        assert_eq!(summary.len(), 1);
    }

    #[test]
    fn merge_prefers_the_later_record() {
        let mut a = Summary::parse("PKGNAME=x-1.0\nPKGPATH=a/b\n\n").unwrap();
        let b = Summary::parse("PKGNAME=x-1.0\nPKGPATH=c/d\n\n").unwrap();
        a.merge(b);
        assert_eq!(a[&Pkgname::parse("x-1.0")].pkgpath.to_string(), "c/d");
    }

    #[test]
    fn pkgmap_groups_by_path_then_base() {
        let text = "\
PKGNAME=py311-foo-1.0
PKGPATH=devel/py-foo

PKGNAME=py312-foo-1.0
PKGPATH=devel/py-foo

PKGNAME=py312-foo-1.1
PKGPATH=devel/py-foo
";
        let summary = Summary::parse(text).unwrap();
        let map = Pkgmap::from_summary(&summary);
        let path: Pkgpath = "devel/py-foo".parse().unwrap();
        let bases = &map[&path];
        assert_eq!(bases.len(), 2);
        assert_eq!(bases[&Pkgbase::from("py312-foo")].len(), 2);
    }
}
