//! Queries against the installed-package database, all of them thin
//! wrappers around pkg_info(1). `PKG_INFO` is a configured command string
//! that may carry arguments of its own, so every invocation goes through
//! the shell trampoline.

use std::collections::BTreeSet;

use anyhow::Result;

use crate::harness::{FdAction, Harness};
use crate::name::{Pkgname, Pkgpath};

/// Every installed package name, in index order.
pub async fn installed_pkgnames(pkg_info: &str) -> Result<BTreeSet<Pkgname>> {
    let mut child = Harness::shell(pkg_info).args(["-e", "*"]).spawn()?;
    let output = child.read_stdout().await?;
    // pkg_info -e exits nonzero when nothing matches; an empty database is
    // not an error for us.
    child.wait_exit().await?;

    Ok(output
        .lines()
        .filter(|line| !line.is_empty())
        .map(Pkgname::parse)
        .collect())
}

/// Every PKGPATH with at least one installed package.
pub async fn installed_pkgpaths(pkg_info: &str) -> Result<BTreeSet<Pkgpath>> {
    let mut child = Harness::shell(pkg_info).args(["-aQ", "PKGPATH"]).spawn()?;
    let output = child.read_stdout().await?;
    child.wait_success().await?;

    let mut paths = BTreeSet::new();
    for line in output.lines() {
        if !line.is_empty() {
            paths.insert(line.parse::<Pkgpath>()?);
        }
    }
    Ok(paths)
}

/// The `VAR=VALUE` build-information lines of one installed package (or of
/// the best match for a bare base).
pub async fn build_info(pkg_info: &str, pattern: &str) -> Result<Vec<(String, String)>> {
    let mut child = Harness::shell(pkg_info).args(["-Bq", pattern]).spawn()?;
    let output = child.read_stdout().await?;
    child.wait_exit().await?;

    Ok(output
        .lines()
        .filter_map(|line| {
            line.split_once('=')
                .map(|(var, value)| (var.to_owned(), value.to_owned()))
        })
        .collect())
}

/// Presence check; nothing but the exit code matters.
pub async fn is_pkg_installed(pkg_info: &str, pattern: &str) -> Result<bool> {
    let mut child = Harness::shell(pkg_info)
        .args(["-q", "-e", pattern])
        .stdout(FdAction::Close)
        .spawn()?;
    Ok(child.wait_exit().await? == 0)
}

/// The recorded build-time dependencies (`@blddep` entries) of an
/// installed package.
pub async fn build_depends(pkg_info: &str, pattern: &str) -> Result<BTreeSet<Pkgname>> {
    query_pkg_list(pkg_info, "-Nq", pattern).await
}

/// The installed packages with a run-time dependency on the given one.
pub async fn who_requires(pkg_info: &str, pattern: &str) -> Result<BTreeSet<Pkgname>> {
    query_pkg_list(pkg_info, "-Rq", pattern).await
}

async fn query_pkg_list(pkg_info: &str, flag: &str, pattern: &str) -> Result<BTreeSet<Pkgname>> {
    let mut child = Harness::shell(pkg_info)
        .args([flag, pattern])
        // The package might not be installed; errors about that are noise.
        .stderr(FdAction::Close)
        .spawn()?;
    let output = child.read_stdout().await?;
    child.wait_exit().await?;

    Ok(output
        .lines()
        .map(str::trim)
        // With -q the listing is bare package names, but blank separator
        // lines remain.
        .filter(|line| !line.is_empty() && line.contains('-'))
        .map(Pkgname::parse)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    // The shell trampoline lets us fake pkg_info with printf; the parsers
    // above are what is actually under test.

    #[tokio::test]
    async fn parses_enumerated_names() {
        let names = installed_pkgnames("printf 'foo-1.0\\nbar-2.0nb1\\n' #")
            .await
            .unwrap();
        let rendered: Vec<_> = names.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, ["bar-2.0nb1", "foo-1.0"]);
    }

    #[tokio::test]
    async fn parses_pkgpath_listing() {
        let paths = installed_pkgpaths("printf 'devel/glib2\\n\\ndevel/glib2\\nmisc/tmux\\n' #")
            .await
            .unwrap();
        let rendered: Vec<_> = paths.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, ["devel/glib2", "misc/tmux"]);
    }

    #[tokio::test]
    async fn parses_build_info_lines() {
        let info = build_info("printf 'PKGPATH=misc/tmux\\nmismatch=YES\\n' #", "tmux")
            .await
            .unwrap();
        assert_eq!(
            info,
            [
                ("PKGPATH".to_owned(), "misc/tmux".to_owned()),
                ("mismatch".to_owned(), "YES".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn presence_check_is_exit_code_only() {
        assert!(is_pkg_installed("true #", "anything").await.unwrap());
        assert!(!is_pkg_installed("false #", "anything").await.unwrap());
    }

    #[tokio::test]
    async fn dependency_listing_skips_chatter() {
        let deps = build_depends("printf 'glib2-2.78.0\\n\\nlibffi-3.4.4nb1\\n' #", "x")
            .await
            .unwrap();
        let rendered: Vec<_> = deps.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, ["glib2-2.78.0", "libffi-3.4.4nb1"]);
    }
}
