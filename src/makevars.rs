//! Extracting variables from pkgsrc package Makefiles and from mk.conf by
//! driving make(1) with a tiny ad-hoc makefile on stdin. Values come back
//! NUL-terminated so embedded whitespace survives.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use camino::Utf8Path;

use crate::harness::{FdAction, Harness};

/// pkgsrc's make. NetBSD installs it as plain make; everywhere else it is
/// the bootstrap bmake.
pub const BMAKE: &str = "bmake";

fn query_makefile(vars: &[&str]) -> String {
    let mut makefile = String::from(".PHONY: x\nx:\n");
    for var in vars {
        makefile.push_str(&format!("\t@printf '%s\\0' \"${{{var}}}\"\n"));
    }
    makefile
}

async fn run_extraction(
    argv: Vec<String>,
    cwd: Option<&Utf8Path>,
    stdin_makefile: String,
    vars: &[&str],
) -> Result<BTreeMap<String, String>> {
    let mut builder = Harness::cmd(BMAKE).args(argv);
    if let Some(dir) = cwd {
        builder = builder.cwd(dir);
    }
    let mut make = builder.stdin(FdAction::Pipe).spawn()?;
    make.write_stdin(stdin_makefile.as_bytes()).await?;
    let output = make.read_stdout().await?;
    make.wait_success().await?;

    let mut values = output.split('\0');
    Ok(vars
        .iter()
        .map(|var| {
            (
                (*var).to_owned(),
                values.next().unwrap_or_default().to_owned(),
            )
        })
        .collect())
}

/// Extract variables from the package Makefile in `pkgdir`, or `None` when
/// there is no Makefile there. `assignments` are passed on the make command
/// line (`PKGNAME_REQD=…` and friends).
pub async fn extract_pkgmk_vars(
    pkgdir: &Utf8Path,
    vars: &[&str],
    assignments: &BTreeMap<String, String>,
) -> Result<Option<BTreeMap<String, String>>> {
    if !pkgdir.join("Makefile").exists() {
        return Ok(None);
    }
    if vars.is_empty() {
        return Ok(Some(BTreeMap::new()));
    }

    let mut argv: Vec<String> = ["-f", "-", "-f", "Makefile", "x"]
        .map(str::to_owned)
        .into();
    argv.extend(assignments.iter().map(|(var, value)| format!("{var}={value}")));

    let values = run_extraction(argv, Some(pkgdir), query_makefile(vars), vars)
        .await
        .with_context(|| format!("Failed to extract {vars:?} from {pkgdir}"))?;
    Ok(Some(values))
}

/// Extract a single package Makefile variable.
pub async fn extract_pkgmk_var(
    pkgdir: &Utf8Path,
    var: &str,
    assignments: &BTreeMap<String, String>,
) -> Result<Option<String>> {
    Ok(extract_pkgmk_vars(pkgdir, &[var], assignments)
        .await?
        .and_then(|mut values| values.remove(var)))
}

/// Extract variables from mk.conf, or `None` when the file does not exist.
pub async fn extract_mkconf_vars(
    makeconf: &Utf8Path,
    vars: &[&str],
) -> Result<Option<BTreeMap<String, String>>> {
    if !makeconf.exists() {
        return Ok(None);
    }
    if vars.is_empty() {
        return Ok(Some(BTreeMap::new()));
    }

    let argv: Vec<String> = ["-f", "-", "-f", makeconf.as_str(), "x"]
        .map(str::to_owned)
        .into();
    // Pretend to be the pkgsrc infrastructure so that conditionals in
    // mk.conf behave the same way they do during a build.
    let makefile = format!("BSD_PKG_MK=1\n{}", query_makefile(vars));

    let values = run_extraction(argv, None, makefile, vars)
        .await
        .with_context(|| format!("Failed to extract {vars:?} from {makeconf}"))?;
    Ok(Some(values))
}
