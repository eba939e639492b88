//! The per-PKGPATH check engine: resolve the latest candidate names a
//! PKGPATH provides (from source Makefiles or a binary summary) and
//! classify each against the installed set as OK, MISSING or MISMATCH.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use camino::Utf8PathBuf;

use crate::build_version::BuildVersion;
use crate::makevars::extract_pkgmk_var;
use crate::name::{Pkgname, Pkgpath};
use crate::nursery::Nursery;
use crate::report::Reporter;
use crate::summary::{Pkgmap, Summary};
use crate::version::Pkgversion;

/// Where the check routes its output. The driver can plug in a progress
/// bar; the plain implementation forwards to a [`Reporter`].
pub trait CheckProgress: Send + Sync {
    fn total(&self, _num: usize) {}
    fn progress(&self) {}
    fn done(&self) {}
    fn msg(&self, text: fmt::Arguments<'_>);
    fn warn(&self, text: fmt::Arguments<'_>);
    fn verbose(&self, text: fmt::Arguments<'_>);
}

impl CheckProgress for Reporter {
    fn msg(&self, text: fmt::Arguments<'_>) {
        Reporter::msg(self, text);
    }

    fn warn(&self, text: fmt::Arguments<'_>) {
        Reporter::warn(self, text);
    }

    fn verbose(&self, text: fmt::Arguments<'_>) {
        Reporter::verbose(self, text);
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CheckOptions {
    /// `-a`: candidates include each PKGPATH's default package.
    pub add_missing: bool,
    /// `-B`: equal versions must also have equal build versions.
    pub check_build_version: bool,
    /// `-u`.
    pub update: bool,
    /// `-r`.
    pub delete_mismatched: bool,
    pub concurrency: usize,
}

#[derive(Clone, Debug, Default)]
pub struct CheckResult {
    /// PKGPATHs that no longer provide anything.
    pub missing_done: BTreeSet<Pkgpath>,
    /// Candidates with no installed counterpart.
    pub missing_todo: BTreeMap<Pkgname, Pkgpath>,
    /// Installed packages that differ from their candidate.
    pub mismatch_todo: BTreeMap<Pkgname, Pkgpath>,
}

enum Backend {
    Source {
        pkgsrcdir: Utf8PathBuf,
    },
    Binary {
        packages: Utf8PathBuf,
        pkg_sufx: String,
        map: Arc<Pkgmap>,
    },
}

pub struct Checker {
    opts: CheckOptions,
    pkg_info: String,
    backend: Backend,
    /// Known binary packages, used for "(has binary package)" annotations
    /// and `-B` in binary mode. Absent when no binary repository is in
    /// play.
    bin_summary: Option<Arc<Summary>>,
    /// name -> pkgpath of everything installed.
    installed: BTreeMap<Pkgname, Pkgpath>,
    /// The same set grouped by pkgpath.
    installed_by_path: BTreeMap<Pkgpath, BTreeSet<Pkgname>>,
    /// Packages deleted during this run; they no longer count as
    /// installed, and as candidates they are skipped.
    deleted: Mutex<BTreeSet<Pkgname>>,
    progress: Arc<dyn CheckProgress>,
}

impl Checker {
    pub fn source(
        opts: CheckOptions,
        pkg_info: impl Into<String>,
        pkgsrcdir: impl Into<Utf8PathBuf>,
        installed_summary: &Summary,
        bin_summary: Option<Arc<Summary>>,
        progress: Arc<dyn CheckProgress>,
    ) -> Arc<Self> {
        Arc::new(Checker {
            opts,
            pkg_info: pkg_info.into(),
            backend: Backend::Source {
                pkgsrcdir: pkgsrcdir.into(),
            },
            bin_summary,
            installed: Self::installed_map(installed_summary),
            installed_by_path: Self::by_path(installed_summary),
            deleted: Mutex::new(BTreeSet::new()),
            progress,
        })
    }

    pub fn binary(
        opts: CheckOptions,
        pkg_info: impl Into<String>,
        packages: impl Into<Utf8PathBuf>,
        pkg_sufx: impl Into<String>,
        bin_summary: Arc<Summary>,
        installed_summary: &Summary,
        progress: Arc<dyn CheckProgress>,
    ) -> Arc<Self> {
        Arc::new(Checker {
            opts,
            pkg_info: pkg_info.into(),
            backend: Backend::Binary {
                packages: packages.into(),
                pkg_sufx: pkg_sufx.into(),
                map: Arc::new(Pkgmap::from_summary(&bin_summary)),
            },
            bin_summary: Some(bin_summary),
            installed: Self::installed_map(installed_summary),
            installed_by_path: Self::by_path(installed_summary),
            deleted: Mutex::new(BTreeSet::new()),
            progress,
        })
    }

    fn installed_map(summary: &Summary) -> BTreeMap<Pkgname, Pkgpath> {
        summary
            .iter()
            .map(|(name, vars)| (name.clone(), vars.pkgpath.clone()))
            .collect()
    }

    fn by_path(summary: &Summary) -> BTreeMap<Pkgpath, BTreeSet<Pkgname>> {
        let mut map: BTreeMap<Pkgpath, BTreeSet<Pkgname>> = BTreeMap::new();
        for (name, vars) in summary.iter() {
            map.entry(vars.pkgpath.clone()).or_default().insert(name.clone());
        }
        map
    }

    /// Forget a package the driver has just deleted, so that subsequent
    /// checks stop treating it as installed.
    pub fn mark_as_deleted(&self, name: Pkgname) {
        self.deleted.lock().unwrap().insert(name);
    }

    fn is_deleted(&self, name: &Pkgname) -> bool {
        self.deleted.lock().unwrap().contains(name)
    }

    /// The lowest installed version of a base, if any.
    fn installed_with_base(&self, base: &crate::name::Pkgbase) -> Option<&Pkgname> {
        let bottom = Pkgname::new(base.clone(), Pkgversion::default());
        self.installed
            .range(bottom..)
            .map(|(name, _)| name)
            .next()
            .filter(|name| name.base == *base)
    }

    fn is_binary_available(&self, name: &Pkgname) -> bool {
        self.bin_summary
            .as_ref()
            .is_some_and(|summary| summary.contains_key(name))
    }

    fn binary_annotation(&self, name: &Pkgname) -> &'static str {
        if self.is_binary_available(name) {
            " (has binary package)"
        } else {
            ""
        }
    }

    /// Check every pkgpath with at least one installed, not-yet-deleted
    /// package.
    pub async fn run_installed(self: Arc<Self>) -> Result<CheckResult> {
        let pkgpaths = self
            .installed
            .iter()
            .filter(|(name, _)| !self.is_deleted(name))
            .map(|(_, path)| path.clone())
            .collect();
        self.run(pkgpaths).await
    }

    /// Check the given pkgpaths, each independently and concurrently.
    pub async fn run(self: Arc<Self>, pkgpaths: BTreeSet<Pkgpath>) -> Result<CheckResult> {
        self.progress.total(pkgpaths.len());

        // Extracting variables from package Makefiles is by far the
        // slowest part of the audit, and every pkgpath is independent of
        // every other.
        let result = Arc::new(Mutex::new(CheckResult::default()));
        let mut nursery = Nursery::new(self.opts.concurrency.max(1));
        for path in pkgpaths {
            let checker = Arc::clone(&self);
            let result = Arc::clone(&result);
            nursery.start_soon(async move { checker.check_one(path, result).await })?;
        }
        nursery.join().await?;
        self.progress.done();

        let result = Arc::try_unwrap(result)
            .expect("all checks have finished")
            .into_inner()
            .unwrap();
        Ok(result)
    }

    async fn check_one(&self, path: Pkgpath, result: Arc<Mutex<CheckResult>>) -> Result<()> {
        let latest_pkgnames = self.find_latest_pkgnames(&path).await?;
        if latest_pkgnames.is_empty() {
            result.lock().unwrap().missing_done.insert(path);
            self.progress.progress();
            return Ok(());
        }

        for name in latest_pkgnames {
            match self.installed_with_base(&name.base) {
                Some(installed) if !self.is_deleted(&name) => {
                    let installed = installed.clone();
                    if installed.version == name.version {
                        self.classify_same_version(&path, &name, &installed, &result)
                            .await?;
                    } else if installed.version < name.version {
                        self.progress.msg(format_args!(
                            "{path} - {installed} < {name}{}",
                            self.binary_annotation(&name)
                        ));
                        result
                            .lock()
                            .unwrap()
                            .mismatch_todo
                            .insert(installed, path.clone());
                    } else if self.opts.check_build_version {
                        // A newer version than the tree offers; with -B we
                        // want exact agreement, so it is a mismatch too.
                        self.progress.msg(format_args!(
                            "{path} - {installed} > {name}{}",
                            self.binary_annotation(&name)
                        ));
                        result
                            .lock()
                            .unwrap()
                            .mismatch_todo
                            .insert(installed, path.clone());
                    } else {
                        self.progress.msg(format_args!(
                            "{path} - {installed} > {name} - ignoring{}",
                            self.binary_annotation(&name)
                        ));
                    }
                }
                _ => {
                    self.progress.msg(format_args!(
                        "{path} - {name} missing{}",
                        self.binary_annotation(&name)
                    ));
                    result
                        .lock()
                        .unwrap()
                        .missing_todo
                        .insert(name, path.clone());
                }
            }
        }
        self.progress.progress();
        Ok(())
    }

    async fn classify_same_version(
        &self,
        path: &Pkgpath,
        name: &Pkgname,
        installed: &Pkgname,
        result: &Arc<Mutex<CheckResult>>,
    ) -> Result<()> {
        if !self.opts.check_build_version {
            self.progress.verbose(format_args!("{path} - {name} OK"));
            return Ok(());
        }

        let latest = self.fetch_build_version(name, path).await?;
        let installed_bv = BuildVersion::from_installed(&self.pkg_info, installed)
            .await?
            .ok_or_else(|| anyhow!("{installed} has no recorded build version"))?;

        match latest {
            Some(latest) if latest == installed_bv => {
                self.progress.verbose(format_args!("{path} - {name} OK"));
            }
            Some(latest) => {
                self.progress
                    .msg(format_args!("{path} - {name} build_version mismatch"));
                self.progress.verbose(format_args!(
                    "--current--\n{latest}--installed--\n{installed_bv}----\n"
                ));
                result
                    .lock()
                    .unwrap()
                    .mismatch_todo
                    .insert(installed.clone(), path.clone());
            }
            None => {
                self.progress
                    .msg(format_args!("{path} - {name} build_version missing"));
            }
        }
        Ok(())
    }

    async fn fetch_build_version(
        &self,
        name: &Pkgname,
        path: &Pkgpath,
    ) -> Result<Option<BuildVersion>> {
        match &self.backend {
            Backend::Source { pkgsrcdir } => BuildVersion::from_source(pkgsrcdir, path).await,
            Backend::Binary {
                packages, pkg_sufx, ..
            } => {
                let summary = self.bin_summary.as_ref().expect("binary backend");
                let Some(vars) = summary.get(name) else {
                    return Ok(None);
                };
                let file = match &vars.file_name {
                    Some(file) => packages.join(file),
                    None => packages.join(format!("{name}{pkg_sufx}")),
                };
                BuildVersion::from_binary(&self.pkg_info, &file).await
            }
        }
    }

    async fn find_latest_pkgnames(&self, path: &Pkgpath) -> Result<BTreeSet<Pkgname>> {
        match &self.backend {
            Backend::Source { pkgsrcdir } => self.latest_from_source(pkgsrcdir, path).await,
            Backend::Binary { map, .. } => Ok(self.latest_from_binary(map, path)),
        }
    }

    /// There is no way to enumerate every PKGNAME a PKGPATH can provide
    /// from source, so take the default PKGNAME and re-query with
    /// `PKGNAME_REQD` for each additionally installed base. The re-query
    /// only happens in update/delete modes; under plain `-a` it would drag
    /// in every variant the PKGPATH provides.
    async fn latest_from_source(
        &self,
        pkgsrcdir: &Utf8PathBuf,
        path: &Pkgpath,
    ) -> Result<BTreeSet<Pkgname>> {
        let pkgdir = path.dir_under(pkgsrcdir);
        if !pkgdir.join("Makefile").exists() {
            self.progress.warn(format_args!(
                "No {path}/Makefile - package moved or obsolete?"
            ));
            return Ok(BTreeSet::new());
        }

        let default_pkgname = extract_pkgmk_var(&pkgdir, "PKGNAME", &Default::default())
            .await?
            .filter(|name| !name.is_empty())
            .map(|name| Pkgname::parse(&name))
            .ok_or_else(|| anyhow!("Unable to extract PKGNAME for {path}"))?;

        let mut pkgnames = BTreeSet::from([default_pkgname.clone()]);
        if self.opts.update || self.opts.delete_mismatched {
            let Some(installed_here) = self.installed_by_path.get(path) else {
                return Ok(pkgnames);
            };
            for installed in installed_here {
                if self.is_deleted(installed) || installed.base == default_pkgname.base {
                    continue;
                }
                // A non-default base. Making up a PKGNAME from the known
                // version would be quicker than running make again, but
                // the variant (a Python version, say) may no longer be
                // supported, and that has to be treated like a removed
                // package.
                let assignments = BTreeMap::from([(
                    "PKGNAME_REQD".to_owned(),
                    format!("{}-[0-9]*", installed.base),
                )]);
                let alternative = extract_pkgmk_var(&pkgdir, "PKGNAME", &assignments)
                    .await?
                    .map(|name| Pkgname::parse(&name))
                    .ok_or_else(|| anyhow!("Unable to extract PKGNAME for {path}"))?;

                // When the Makefile cannot satisfy PKGNAME_REQD it answers
                // with some other base.
                if alternative.base == installed.base {
                    pkgnames.insert(alternative);
                } else {
                    self.progress.warn(format_args!(
                        "{path} had presumably provided a package named like {}-[0-9]* \
                         but it no longer does so. The installed package {installed} \
                         cannot be updated. Delete it and re-run the command.",
                        installed.base
                    ));
                    return Ok(BTreeSet::new());
                }
            }
        }
        Ok(pkgnames)
    }

    /// The binary summary can enumerate every PKGNAME, but it cannot say
    /// which base is the default. Under `-a` the alphabetically greatest
    /// base stands in for it, which is a documented guess, not a fact.
    fn latest_from_binary(&self, map: &Pkgmap, path: &Pkgpath) -> BTreeSet<Pkgname> {
        let Some(pkgbases) = map.get(path) else {
            return BTreeSet::new();
        };

        let mut pkgnames = BTreeSet::new();
        if self.opts.add_missing {
            if let Some(latest) = pkgbases
                .iter()
                .next_back()
                .and_then(|(_, sum)| sum.keys().next_back())
            {
                pkgnames.insert(latest.clone());
            }
        }
        if self.opts.update || self.opts.delete_mismatched {
            // Only bases that are already installed; anything else would
            // turn -a into "install every variant".
            for (base, sum) in pkgbases.iter() {
                let installed = self
                    .installed_with_base(base)
                    .filter(|name| !self.is_deleted(name));
                if installed.is_some() {
                    if let Some(latest) = sum.keys().next_back() {
                        pkgnames.insert(latest.clone());
                    }
                }
            }
        }
        pkgnames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quiet;

    impl CheckProgress for Quiet {
        fn msg(&self, _: fmt::Arguments<'_>) {}
        fn warn(&self, _: fmt::Arguments<'_>) {}
        fn verbose(&self, _: fmt::Arguments<'_>) {}
    }

    fn summary(entries: &[(&str, &str)]) -> Summary {
        let text: String = entries
            .iter()
            .map(|(name, path)| format!("PKGNAME={name}\nPKGPATH={path}\n\n"))
            .collect();
        Summary::parse(&text).unwrap()
    }

    fn binary_checker(
        opts: CheckOptions,
        bin: &[(&str, &str)],
        installed: &[(&str, &str)],
    ) -> Arc<Checker> {
        Checker::binary(
            opts,
            "pkg_info",
            "/nonexistent/packages",
            ".tgz",
            Arc::new(summary(bin)),
            &summary(installed),
            Arc::new(Quiet),
        )
    }

    #[tokio::test]
    async fn update_mode_classifies_against_installed_bases() {
        let checker = binary_checker(
            CheckOptions {
                update: true,
                concurrency: 2,
                ..Default::default()
            },
            &[
                ("figlet-2.2.6", "misc/figlet"),
                ("tmux-3.5", "misc/tmux"),
                ("unrelated-9.9", "misc/unrelated"),
            ],
            &[("figlet-2.2.5", "misc/figlet"), ("tmux-3.5", "misc/tmux")],
        );
        let paths = ["misc/figlet", "misc/tmux"]
            .iter()
            .map(|p| p.parse().unwrap())
            .collect();
        let result = checker.run(paths).await.unwrap();

        let mismatches: Vec<_> = result
            .mismatch_todo
            .iter()
            .map(|(name, path)| format!("{name}@{path}"))
            .collect();
        assert_eq!(mismatches, ["figlet-2.2.5@misc/figlet"]);
        assert!(result.missing_todo.is_empty());
        assert!(result.missing_done.is_empty());
    }

    #[tokio::test]
    async fn add_missing_uses_the_greatest_base_heuristic() {
        let checker = binary_checker(
            CheckOptions {
                add_missing: true,
                concurrency: 2,
                ..Default::default()
            },
            &[
                ("py311-foo-1.0", "devel/py-foo"),
                ("py312-foo-1.0", "devel/py-foo"),
                ("py312-foo-1.1", "devel/py-foo"),
            ],
            &[],
        );
        let paths = ["devel/py-foo"].iter().map(|p| p.parse().unwrap()).collect();
        let result = checker.run(paths).await.unwrap();

        let missing: Vec<_> = result.missing_todo.keys().map(ToString::to_string).collect();
        assert_eq!(missing, ["py312-foo-1.1"]);
    }

    #[tokio::test]
    async fn path_providing_nothing_goes_to_missing_done() {
        let checker = binary_checker(
            CheckOptions {
                add_missing: true,
                concurrency: 1,
                ..Default::default()
            },
            &[],
            &[],
        );
        let paths = ["gone/forever"].iter().map(|p| p.parse().unwrap()).collect();
        let result = checker.run(paths).await.unwrap();
        let gone: Vec<_> = result.missing_done.iter().map(ToString::to_string).collect();
        assert_eq!(gone, ["gone/forever"]);
    }

    #[tokio::test]
    async fn newer_installed_version_is_left_alone_without_build_version_check() {
        let checker = binary_checker(
            CheckOptions {
                update: true,
                concurrency: 1,
                ..Default::default()
            },
            &[("figlet-2.2.4", "misc/figlet")],
            &[("figlet-2.2.5", "misc/figlet")],
        );
        let paths = ["misc/figlet"].iter().map(|p| p.parse().unwrap()).collect();
        let result = checker.run(paths).await.unwrap();
        assert!(result.mismatch_todo.is_empty());
    }

    #[tokio::test]
    async fn deleted_candidates_count_as_missing() {
        let checker = binary_checker(
            CheckOptions {
                update: true,
                add_missing: true,
                concurrency: 1,
                ..Default::default()
            },
            &[("figlet-2.2.5", "misc/figlet")],
            &[("figlet-2.2.5", "misc/figlet")],
        );
        checker.mark_as_deleted(Pkgname::parse("figlet-2.2.5"));
        let paths = ["misc/figlet"].iter().map(|p| p.parse().unwrap()).collect();
        let result = checker.run(paths).await.unwrap();
        // The candidate equals the deleted name, so it is missing now.
        let missing: Vec<_> = result.missing_todo.keys().map(ToString::to_string).collect();
        assert_eq!(missing, ["figlet-2.2.5"]);
    }
}
