use camino::Utf8PathBuf;
use clap::Parser;

use pkgward::nursery::default_concurrency;

#[derive(Debug, Clone, Parser)]
#[command(name = "pkgward-chk", about, version)]
pub struct Args {
    /// Add any missing packages
    #[arg(short = 'a')]
    pub add_missing: bool,

    /// Force exact matches, including the recorded build version
    #[arg(short = 'B')]
    pub build_version_strict: bool,

    /// Use binary packages
    #[arg(short = 'b')]
    pub use_binary: bool,

    /// Use FILE as the package list instead of PKGCHK_CONF
    #[arg(short = 'C', value_name = "FILE")]
    pub config: Option<Utf8PathBuf>,

    /// Add the comma-separated TAGS to the tag set
    #[arg(short = 'D', value_name = "TAGS")]
    pub add_tags: Option<String>,

    /// Do not clean up after building from source
    #[arg(short = 'd')]
    pub no_clean: bool,

    /// Fetch distfiles of missing packages, do not build anything
    #[arg(short = 'f')]
    pub fetch: bool,

    /// Generate an initial package list from what is installed
    #[arg(short = 'g')]
    pub generate_conf: bool,

    /// Number of concurrent checks
    #[arg(short = 'j', value_name = "N", default_value_t = default_concurrency())]
    pub concurrency: usize,

    /// Keep going even when an install or delete fails
    #[arg(short = 'k')]
    pub keep_going: bool,

    /// Append a copy of everything printed to FILE
    #[arg(short = 'L', value_name = "FILE")]
    pub log_file: Option<Utf8PathBuf>,

    /// List the binary packages the package list selects, dependencies
    /// first
    #[arg(short = 'l')]
    pub list_bin_pkgs: bool,

    /// Look installed packages up in the pkgsrc TODO file
    #[arg(short = 'N')]
    pub lookup_todo: bool,

    /// Show what would happen without doing it
    #[arg(short = 'n')]
    pub dry_run: bool,

    /// Directory or URL holding the binary packages
    #[arg(short = 'P', value_name = "DIR")]
    pub packages: Option<Utf8PathBuf>,

    /// Print the set of pkgpaths that would be checked, then exit
    #[arg(short = 'p')]
    pub print_pkgpaths: bool,

    /// Only report version differences; do not run anything
    #[arg(short = 'q')]
    pub list_ver_diffs: bool,

    /// Delete installed packages whose versions do not match pkgsrc
    #[arg(short = 'r')]
    pub delete_mismatched: bool,

    /// Build missing packages from source
    #[arg(short = 's')]
    pub build_from_source: bool,

    /// Remove the comma-separated TAGS from the tag set; `*` removes every
    /// automatic tag
    #[arg(short = 'U', value_name = "TAGS")]
    pub remove_tags: Option<String>,

    /// Update mismatched packages: delete them, then install the current
    /// versions
    #[arg(short = 'u')]
    pub update: bool,

    /// Be verbose. Specify twice to be more verbose
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}
