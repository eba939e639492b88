//! Deriving per-package flag sets from the installed package database.
//!
//! Finding every installed package with `mismatch=YES` means one
//! `pkg_info -Bq` per package; finding three different flags that way would
//! cost three sweeps. The scanner runs the sweep once and serves any number
//! of registered axes from it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use crate::name::{Pkgbase, Pkgname, Pkgpath};
use crate::nursery::Nursery;
use crate::pkgdb;

/// `pkgbase → pkgpath` for every package on which the axis's flag is set.
pub type ScanResult = BTreeMap<Pkgbase, Pkgpath>;

struct Axis {
    flag: String,
    exclude: BTreeSet<Pkgbase>,
    result: Arc<Mutex<ScanResult>>,
}

pub struct PackageScanner {
    pkg_info: String,
    concurrency: usize,
    axes: Vec<Axis>,
}

impl PackageScanner {
    pub fn new(pkg_info: impl Into<String>, concurrency: usize) -> Self {
        PackageScanner {
            pkg_info: pkg_info.into(),
            concurrency,
            axes: Vec::new(),
        }
    }

    /// Register a flag to collect, with a set of bases the caller wants
    /// left out no matter what their flags say. Results come back from
    /// [`PackageScanner::run`] in registration order.
    pub fn add_axis(&mut self, flag: impl Into<String>, exclude: BTreeSet<Pkgbase>) {
        self.axes.push(Axis {
            flag: flag.into(),
            exclude,
            result: Arc::new(Mutex::new(ScanResult::new())),
        });
    }

    /// Run one concurrent sweep over the installed packages and resolve
    /// every axis.
    pub async fn run(self, installed: &BTreeSet<Pkgname>) -> Result<Vec<ScanResult>> {
        let axes = Arc::new(self.axes);
        let mut nursery = Nursery::new(self.concurrency);

        for name in installed {
            let axes = Arc::clone(&axes);
            let pkg_info = self.pkg_info.clone();
            let name = name.clone();
            nursery.start_soon(async move {
                let info = pkgdb::build_info(&pkg_info, &name.to_string())
                    .await
                    .with_context(|| format!("Failed to inspect {name}"))?;

                let path = info
                    .iter()
                    .find(|(var, _)| var == "PKGPATH")
                    .map(|(_, value)| value.parse::<Pkgpath>())
                    .transpose()?;

                for axis in axes.iter() {
                    if axis.exclude.contains(&name.base) {
                        continue;
                    }
                    let flagged = info
                        .iter()
                        .any(|(var, value)| *var == axis.flag && value.eq_ignore_ascii_case("yes"));
                    if flagged {
                        let path = path
                            .clone()
                            .with_context(|| format!("{name} has no PKGPATH recorded"))?;
                        axis.result.lock().unwrap().insert(name.base.clone(), path);
                    }
                }
                Ok(())
            })?;
        }
        nursery.join().await?;

        let axes = Arc::try_unwrap(axes).ok().expect("all tasks have finished");
        Ok(axes
            .into_iter()
            .map(|axis| {
                Arc::try_unwrap(axis.result)
                    .expect("all tasks have finished")
                    .into_inner()
                    .unwrap()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> BTreeSet<Pkgname> {
        list.iter().map(|s| Pkgname::parse(s)).collect()
    }

    // A fake pkg_info: prints a PKGPATH derived from the requested name and
    // flags every package whose base ends in "-flagged".
    const FAKE_PKG_INFO: &str = r#"sh -c 'name="$2"; printf "PKGPATH=cat/%s\n" "${name%-*}"; case "$name" in *flagged*) printf "mismatch=YES\n";; esac' fake"#;

    #[tokio::test]
    async fn axes_collect_flagged_packages_with_their_paths() {
        let mut scanner = PackageScanner::new(FAKE_PKG_INFO, 4);
        scanner.add_axis("mismatch", BTreeSet::new());
        scanner.add_axis("rebuild", BTreeSet::new());

        let installed = names(&["aflagged-1.0", "plain-2.0", "zflagged-3.0"]);
        let results = scanner.run(&installed).await.unwrap();
        assert_eq!(results.len(), 2);

        let mismatch: Vec<_> = results[0]
            .iter()
            .map(|(base, path)| format!("{base}:{path}"))
            .collect();
        assert_eq!(mismatch, ["aflagged:cat/aflagged", "zflagged:cat/zflagged"]);
        assert!(results[1].is_empty());
    }

    #[tokio::test]
    async fn excluded_bases_are_skipped() {
        let mut scanner = PackageScanner::new(FAKE_PKG_INFO, 4);
        scanner.add_axis(
            "mismatch",
            [Pkgbase::from("aflagged")].into_iter().collect(),
        );

        let installed = names(&["aflagged-1.0", "zflagged-3.0"]);
        let results = scanner.run(&installed).await.unwrap();
        let bases: Vec<_> = results[0].keys().map(ToString::to_string).collect();
        assert_eq!(bases, ["zflagged"]);
    }
}
