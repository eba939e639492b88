use camino::Utf8PathBuf;
use clap::Parser;

fn parse_var_def(value: &str) -> Result<(String, String), String> {
    value
        .split_once('=')
        .map(|(var, val)| (var.to_owned(), val.to_owned()))
        .ok_or_else(|| format!("Bad variable definition: {value}"))
}

/// Does `make replace` on one package at a time, tsorting the packages
/// being replaced according to their interdependencies, which avoids most
/// duplicate rebuilds.
#[derive(Debug, Clone, Parser)]
#[command(name = "pkgward-rr", about, version)]
pub struct Args {
    /// Force exact pkg match - check the recorded build version
    #[arg(short = 'B')]
    pub check_build_version: bool,

    /// Pass the given variable and value to every make(1)
    #[arg(short = 'D', value_name = "VAR=VAL", value_parser = parse_var_def)]
    pub make_vars: Vec<(String, String)>,

    /// Fetch sources (including depends) only, don't build
    #[arg(short = 'F')]
    pub just_fetch: bool,

    /// Keep running, even on error
    #[arg(short = 'k')]
    pub continue_on_errors: bool,

    /// Log package builds to PATH/{pkgdir}/{pkg}
    #[arg(short = 'L', value_name = "PATH")]
    pub log_dir: Option<Utf8PathBuf>,

    /// Display actions to be taken but don't actually run them
    #[arg(short = 'n')]
    pub dry_run: bool,

    /// Just replace, don't create binary packages
    #[arg(short = 'r')]
    pub just_replace: bool,

    /// Replace even if the ABIs are still compatible ("strict")
    #[arg(short = 's')]
    pub strict: bool,

    /// Check for mismatched packages and mark them as such
    #[arg(short = 'u')]
    pub check_for_updates: bool,

    /// Be verbose. Specify twice to be more verbose
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Exclude the comma-separated packages from being rebuilt
    #[arg(short = 'X', value_name = "PKGS", value_delimiter = ',')]
    pub no_rebuild: Vec<String>,

    /// Exclude the comma-separated packages from the mismatch check
    #[arg(short = 'x', value_name = "PKGS", value_delimiter = ',')]
    pub no_check: Vec<String>,
}
