//! Build versions: the per-file revision snapshot recorded when a package
//! was built. Two packages of the same PKGNAME can still differ here, which
//! is what `-B` checks for.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Context, Result};
use camino::Utf8Path;

use crate::harness::{FdAction, Harness};
use crate::makevars::BMAKE;
use crate::name::{Pkgname, Pkgpath};

/// A map from file path to its revision string. Equality is plain map
/// equality.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BuildVersion(BTreeMap<String, String>);

impl BuildVersion {
    fn parse(text: &str) -> Self {
        let mut bv = BuildVersion::default();
        for line in text.lines() {
            if line.is_empty() {
                break;
            }
            if let Some((file, tag)) = line.split_once(": ") {
                bv.0.insert(file.to_owned(), tag.trim_start().to_owned());
            }
        }
        bv
    }

    /// From a binary package file, or `None` if the file does not exist.
    pub async fn from_binary(pkg_info: &str, bin_pkg_file: &Utf8Path) -> Result<Option<Self>> {
        if !bin_pkg_file.exists() {
            return Ok(None);
        }
        let mut child = Harness::shell(pkg_info)
            .args(["-q", "-b", bin_pkg_file.as_str()])
            .spawn()?;
        let output = child.read_stdout().await?;
        if child.wait_exit().await? == 0 {
            Ok(Some(BuildVersion::parse(&output)))
        } else {
            Ok(None)
        }
    }

    /// From an installed package, or `None` if it is not installed.
    pub async fn from_installed(pkg_info: &str, name: &Pkgname) -> Result<Option<Self>> {
        let mut child = Harness::shell(pkg_info)
            .args(["-q", "-b", &name.to_string()])
            // The package might not be installed; discarding stderr is the
            // only way to keep pkg_info quiet about it.
            .stderr(FdAction::Close)
            .spawn()?;
        let output = child.read_stdout().await?;
        if child.wait_exit().await? == 0 {
            Ok(Some(BuildVersion::parse(&output)))
        } else {
            Ok(None)
        }
    }

    /// From source, or `None` if the package directory does not exist.
    /// pkgsrc insists on writing to a file, so hand it a temp file name;
    /// and unlink it first, or make will declare it up to date and write
    /// nothing.
    pub async fn from_source(pkgsrcdir: &Utf8Path, path: &Pkgpath) -> Result<Option<Self>> {
        let pkgdir = path.dir_under(pkgsrcdir);
        if !pkgdir.exists() {
            return Ok(None);
        }

        let tmp = tempfile::NamedTempFile::new().context("Failed to create a temporary file")?;
        let tmp_path = tmp
            .path()
            .to_str()
            .context("temporary file path is not UTF-8")?
            .to_owned();
        std::fs::remove_file(&tmp_path).ok();

        let mut make = Harness::cmd(BMAKE)
            .args([format!("_BUILD_VERSION_FILE={tmp_path}"), tmp_path.clone()])
            .cwd(&pkgdir)
            .stdin(FdAction::Close)
            .stdout(FdAction::Close)
            .spawn()?;
        make.wait_success().await?;

        let text = std::fs::read_to_string(&tmp_path)
            .with_context(|| format!("Failed to reopen {tmp_path}"))?;
        Ok(Some(BuildVersion::parse(&text)))
    }
}

impl fmt::Display for BuildVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (file, tag) in &self.0 {
            writeln!(f, "{file}: {tag}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_file_revision_lines() {
        let bv = BuildVersion::parse(
            "mk/bsd.pkg.mk: $NetBSD: bsd.pkg.mk,v 1.2 $\nmisc/figlet/Makefile:  1.33\n\nignored: after blank\n",
        );
        let rendered = bv.to_string();
        assert!(rendered.contains("misc/figlet/Makefile: 1.33"));
        assert!(!rendered.contains("ignored"));
    }

    #[test]
    fn equality_is_map_equality() {
        let a = BuildVersion::parse("f: 1\ng: 2\n");
        let b = BuildVersion::parse("g: 2\nf: 1\n");
        let c = BuildVersion::parse("f: 1\ng: 3\n");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn from_installed_swallows_absent_packages() {
        let missing = BuildVersion::from_installed("false #", &Pkgname::parse("gone-1.0"))
            .await
            .unwrap();
        assert_eq!(missing, None);
    }
}
