//! Lazily resolved configuration: where pkgsrc lives, which package tools
//! to run, which tags apply to this machine.
//!
//! Every value is computed on first use and memoised. The ambient process
//! environment is captured once at construction, notably `PKG_PATH`, which
//! is unset right away so that it cannot leak into make(1) runs.

use std::collections::BTreeSet;

use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::OnceCell;

use crate::config::Tagset;
use crate::harness::{FdAction, Harness};
use crate::makevars::{extract_mkconf_vars, extract_pkgmk_vars};
use crate::name::{Pkgbase, Pkgname, Pkgpath};
use crate::pkgdb;
use crate::report::Reporter;
use crate::summary::{Pkgmap, Summary};

const MAKECONF_CANDIDATES: [&str; 3] = [
    "/etc/mk.conf",
    "/usr/pkg/etc/mk.conf",
    "/opt/pkg/etc/mk.conf",
];

#[derive(Clone, Debug, Default)]
pub struct EnvOptions {
    /// `-P DIR`: binary packages directory or URL override.
    pub bin_pkg_path: Option<Utf8PathBuf>,
    /// `-C FILE`: config path override.
    pub pkgchk_conf_path: Option<Utf8PathBuf>,
    /// `-D TAGS`.
    pub add_tags: Tagset,
    /// `-U TAGS`; `*` drops everything but explicit additions.
    pub remove_tags: Tagset,
    /// `-j N`.
    pub concurrency: usize,
}

#[derive(Clone, Debug, Default)]
struct MakefileEnv {
    packages: Utf8PathBuf,
    pkg_add: String,
    pkg_admin: String,
    pkg_delete: String,
    pkg_info: String,
    pkg_sufx: String,
    pkgchk_conf: Utf8PathBuf,
    pkgchk_notags: Tagset,
    pkgchk_tags: Tagset,
    pkgchk_update_conf: Utf8PathBuf,
    su_cmd: String,
    fetch_using: Option<Pkgbase>,
}

#[derive(Clone, Debug)]
struct Platform {
    opsys: String,
    os_version: String,
    machine_arch: String,
    hostname: String,
}

fn is_url(path: &Utf8Path) -> bool {
    path.as_str().contains("://")
}

fn url_safe_absolute(path: &Utf8Path) -> Utf8PathBuf {
    if is_url(path) {
        return path.to_owned();
    }
    std::path::absolute(path.as_std_path())
        .ok()
        .and_then(|p| Utf8PathBuf::from_path_buf(p).ok())
        .unwrap_or_else(|| path.to_owned())
}

fn cuname() -> Result<(String, String, String)> {
    // SAFETY: utsname is plain old data filled in by the kernel.
    let mut un: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut un) } != 0 {
        return Err(std::io::Error::last_os_error()).context("uname");
    }
    let field = |raw: &[libc::c_char]| {
        let bytes: Vec<u8> = raw
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    };
    Ok((field(&un.sysname), field(&un.release), field(&un.nodename)))
}

pub struct Environment {
    opts: EnvOptions,
    reporter: Reporter,

    // Ambient values captured at startup.
    pkg_path: String,
    ambient_makeconf: String,
    ambient_pkgsrcdir: String,
    ambient_localbase: String,

    makeconf: OnceCell<Utf8PathBuf>,
    pkgsrcdir: OnceCell<Utf8PathBuf>,
    mkenv: OnceCell<MakefileEnv>,
    platform: OnceCell<Platform>,
    tags: OnceCell<(Tagset, Tagset)>,
    installed_pkgnames: OnceCell<BTreeSet<Pkgname>>,
    installed_pkgpaths: OnceCell<BTreeSet<Pkgpath>>,
    bin_pkg_summary: OnceCell<Summary>,
    bin_pkg_map: OnceCell<Pkgmap>,
}

impl Environment {
    pub fn new(opts: EnvOptions, reporter: Reporter) -> Self {
        // Hide PKG_PATH from every subprocess; pkg_add gets it back
        // explicitly when it is actually wanted.
        let pkg_path = std::env::var("PKG_PATH").unwrap_or_default();
        std::env::remove_var("PKG_PATH");
        reporter.verbose_var("PKG_PATH", &pkg_path);

        Environment {
            pkg_path,
            ambient_makeconf: std::env::var("MAKECONF").unwrap_or_default(),
            ambient_pkgsrcdir: std::env::var("PKGSRCDIR").unwrap_or_default(),
            ambient_localbase: std::env::var("LOCALBASE").unwrap_or_default(),
            opts,
            reporter,
            makeconf: OnceCell::new(),
            pkgsrcdir: OnceCell::new(),
            mkenv: OnceCell::new(),
            platform: OnceCell::new(),
            tags: OnceCell::new(),
            installed_pkgnames: OnceCell::new(),
            installed_pkgpaths: OnceCell::new(),
            bin_pkg_summary: OnceCell::new(),
            bin_pkg_map: OnceCell::new(),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.opts.concurrency.max(1)
    }

    /// The PKG_PATH that was in force when the tool started.
    pub fn pkg_path(&self) -> &str {
        &self.pkg_path
    }

    pub async fn makeconf(&self) -> &Utf8Path {
        self.makeconf
            .get_or_init(|| async {
                let mut found = Utf8PathBuf::from(&self.ambient_makeconf);
                if found.as_str().is_empty() {
                    for candidate in MAKECONF_CANDIDATES {
                        if Utf8Path::new(candidate).exists() {
                            found = Utf8PathBuf::from(candidate);
                            break;
                        }
                    }
                }
                if found.as_str().is_empty() {
                    found = Utf8PathBuf::from("/dev/null");
                }
                self.reporter.verbose_var("MAKECONF", found.as_str());
                found
            })
            .await
    }

    pub async fn pkgsrcdir(&self) -> Result<&Utf8PathBuf> {
        self.pkgsrcdir
            .get_or_try_init(|| async {
                let mut dir = Utf8PathBuf::from(&self.ambient_pkgsrcdir);
                let mut localbase = Utf8PathBuf::from(&self.ambient_localbase);

                if dir.as_str().is_empty() {
                    let makeconf = self.makeconf().await;
                    let mut wanted = vec!["PKGSRCDIR"];
                    if localbase.as_str().is_empty() {
                        wanted.push("LOCALBASE");
                    }
                    if let Some(values) = extract_mkconf_vars(makeconf, &wanted).await? {
                        for (var, value) in &values {
                            self.reporter.verbose_var(var, value);
                        }
                        dir = Utf8PathBuf::from(values.get("PKGSRCDIR").cloned().unwrap_or_default());
                        if localbase.as_str().is_empty() {
                            localbase =
                                Utf8PathBuf::from(values.get("LOCALBASE").cloned().unwrap_or_default());
                        }
                    }
                }
                if dir.as_str().is_empty() {
                    let candidates = [
                        localbase.join("pkgsrc"),
                        Utf8PathBuf::from("/usr/pkgsrc"),
                        Utf8PathBuf::from("."),
                        Utf8PathBuf::from(".."),
                        Utf8PathBuf::from("../.."),
                    ];
                    for candidate in candidates {
                        if candidate.join("mk/bsd.pkg.mk").exists() {
                            dir = url_safe_absolute(&candidate);
                            break;
                        }
                    }
                    self.reporter.verbose_var("PKGSRCDIR", dir.as_str());
                }
                if dir.as_str().is_empty() || !dir.is_dir() {
                    bail!(
                        "Unable to locate PKGSRCDIR ({})",
                        if dir.as_str().is_empty() {
                            "not set"
                        } else {
                            dir.as_str()
                        }
                    );
                }
                Ok(dir)
            })
            .await
    }

    async fn mkenv(&self) -> Result<&MakefileEnv> {
        self.mkenv
            .get_or_try_init(|| async {
                let mut vars = vec![
                    "PACKAGES",
                    "PKG_ADD",
                    "PKG_ADMIN",
                    "PKG_DELETE",
                    "PKG_INFO",
                    "PKG_SUFX",
                    "PKG_SYSCONFDIR",
                    "PKGCHK_CONF",
                    "PKGCHK_NOTAGS",
                    "PKGCHK_TAGS",
                    "PKGCHK_UPDATE_CONF",
                    "FETCH_USING",
                ];
                // Only the unprivileged need a way to become root.
                if unsafe { libc::geteuid() } != 0 {
                    vars.push("SU_CMD");
                }

                let pkgsrcdir = self.pkgsrcdir().await?;
                // Any package directory will do for loading the pkgsrc
                // infrastructure; pkg_install is as stable as they come.
                let sample = pkgsrcdir.join("pkgtools/pkg_install");
                let values = if sample.is_dir() {
                    extract_pkgmk_vars(&sample, &vars, &Default::default())
                        .await?
                        .unwrap_or_default()
                } else if self.makeconf().await.as_str() != "/dev/null" {
                    extract_mkconf_vars(self.makeconf().await, &vars)
                        .await?
                        .unwrap_or_default()
                } else {
                    Default::default()
                };
                for (var, value) in &values {
                    self.reporter.verbose_var(var, value);
                }
                let value = |var: &str| values.get(var).cloned().unwrap_or_default();
                let value_or = |var: &str, fallback: &str| {
                    let v = value(var);
                    if v.is_empty() {
                        fallback.to_owned()
                    } else {
                        v
                    }
                };

                let mut menv = MakefileEnv {
                    packages: match &self.opts.bin_pkg_path {
                        Some(path) => url_safe_absolute(path),
                        None => Utf8PathBuf::from(value("PACKAGES")),
                    },
                    pkg_add: value_or("PKG_ADD", "pkg_add"),
                    pkg_admin: value_or("PKG_ADMIN", "pkg_admin"),
                    pkg_delete: value_or("PKG_DELETE", "pkg_delete"),
                    pkg_info: value_or("PKG_INFO", "pkg_info"),
                    pkg_sufx: value_or("PKG_SUFX", ".tgz"),
                    pkgchk_conf: match &self.opts.pkgchk_conf_path {
                        Some(path) => url_safe_absolute(path),
                        None => Utf8PathBuf::from(value("PKGCHK_CONF")),
                    },
                    pkgchk_notags: Tagset::from_csv(&value("PKGCHK_NOTAGS")),
                    pkgchk_tags: Tagset::from_csv(&value("PKGCHK_TAGS")),
                    pkgchk_update_conf: Utf8PathBuf::from(value("PKGCHK_UPDATE_CONF")),
                    su_cmd: value("SU_CMD"),
                    fetch_using: {
                        let fetcher = value("FETCH_USING");
                        (!fetcher.is_empty()).then(|| Pkgbase::from(fetcher))
                    },
                };

                if menv.packages.as_str().is_empty() {
                    menv.packages = pkgsrcdir.join("packages");
                    self.reporter.verbose_var("PACKAGES", menv.packages.as_str());
                }
                if !is_url(&menv.packages) && menv.packages.join("All").is_dir() {
                    menv.packages = menv.packages.join("All");
                    self.reporter.verbose_var("PACKAGES", menv.packages.as_str());
                }
                if menv.pkgchk_conf.as_str().is_empty() {
                    let sysconf = Utf8PathBuf::from(value("PKG_SYSCONFDIR")).join("pkgchk.conf");
                    menv.pkgchk_conf = if sysconf.exists() {
                        sysconf
                    } else {
                        pkgsrcdir.join("pkgchk.conf")
                    };
                    self.reporter
                        .verbose_var("PKGCHK_CONF", menv.pkgchk_conf.as_str());
                }
                if menv.pkgchk_update_conf.as_str().is_empty() {
                    let hostname = &self.platform().await?.hostname;
                    menv.pkgchk_update_conf =
                        pkgsrcdir.join(format!("pkgchk_update-{hostname}.conf"));
                    self.reporter
                        .verbose_var("PKGCHK_UPDATE_CONF", menv.pkgchk_update_conf.as_str());
                }

                Ok(menv)
            })
            .await
    }

    async fn platform(&self) -> Result<&Platform> {
        self.platform
            .get_or_try_init(|| async {
                let (sysname, release, nodename) = cuname()?;

                // OPSYS and friends should come from the pkgsrc
                // infrastructure; uname(3) is the fallback when the tree is
                // not around.
                let sample = match self.pkgsrcdir().await {
                    Ok(dir) => Some(dir.join("pkgtools/pkg_chk")),
                    Err(_) => None,
                };
                let platform = match sample.filter(|dir| dir.is_dir()) {
                    Some(dir) => {
                        let values = extract_pkgmk_vars(
                            &dir,
                            &["OPSYS", "OS_VERSION", "MACHINE_ARCH"],
                            &Default::default(),
                        )
                        .await?
                        .unwrap_or_default();
                        for (var, value) in &values {
                            self.reporter.verbose_var(var, value);
                        }
                        Platform {
                            opsys: values.get("OPSYS").cloned().unwrap_or_default(),
                            os_version: values.get("OS_VERSION").cloned().unwrap_or_default(),
                            machine_arch: values.get("MACHINE_ARCH").cloned().unwrap_or_default(),
                            hostname: nodename,
                        }
                    }
                    None => {
                        // "uname -p" is not POSIX but it is everywhere, and
                        // utsname.machine is not the same thing.
                        let mut uname = Harness::cmd("uname")
                            .arg("-p")
                            .stdin(FdAction::Close)
                            .spawn()?;
                        let machine_arch = uname.read_stdout().await?.trim().to_owned();
                        uname.wait_success().await?;
                        Platform {
                            opsys: sysname,
                            os_version: release,
                            machine_arch,
                            hostname: nodename,
                        }
                    }
                };
                Ok(platform)
            })
            .await
    }

    pub async fn packages(&self) -> Result<&Utf8PathBuf> {
        Ok(&self.mkenv().await?.packages)
    }

    pub async fn pkg_add(&self) -> Result<&str> {
        Ok(&self.mkenv().await?.pkg_add)
    }

    pub async fn pkg_admin(&self) -> Result<&str> {
        Ok(&self.mkenv().await?.pkg_admin)
    }

    pub async fn pkg_delete(&self) -> Result<&str> {
        Ok(&self.mkenv().await?.pkg_delete)
    }

    pub async fn pkg_info(&self) -> Result<&str> {
        Ok(&self.mkenv().await?.pkg_info)
    }

    pub async fn pkg_sufx(&self) -> Result<&str> {
        Ok(&self.mkenv().await?.pkg_sufx)
    }

    pub async fn pkgchk_conf(&self) -> Result<&Utf8PathBuf> {
        Ok(&self.mkenv().await?.pkgchk_conf)
    }

    pub async fn pkgchk_update_conf(&self) -> Result<&Utf8PathBuf> {
        Ok(&self.mkenv().await?.pkgchk_update_conf)
    }

    pub async fn su_cmd(&self) -> Result<&str> {
        Ok(&self.mkenv().await?.su_cmd)
    }

    pub async fn fetch_using(&self) -> Result<Option<&Pkgbase>> {
        Ok(self.mkenv().await?.fetch_using.as_ref())
    }

    pub async fn opsys(&self) -> Result<&str> {
        Ok(&self.platform().await?.opsys)
    }

    /// (included, excluded) tag sets for config filtering.
    pub async fn tags(&self) -> Result<&(Tagset, Tagset)> {
        self.tags
            .get_or_try_init(|| async {
                let mut included = Tagset::new();

                // `-U '*'` wipes the platform and mk.conf tags but still
                // honours -D, and package-specific -U entries.
                if !self.opts.remove_tags.contains("*") {
                    let platform = self.platform().await?;
                    let short_host = platform
                        .hostname
                        .split('.')
                        .next()
                        .unwrap_or_default()
                        .to_owned();
                    included.insert(short_host);
                    included.insert(platform.hostname.clone());
                    let (os, ver, arch) = (
                        &platform.opsys,
                        &platform.os_version,
                        &platform.machine_arch,
                    );
                    included.insert(format!("{os}-{ver}-{arch}"));
                    included.insert(format!("{os}-{ver}"));
                    included.insert(format!("{os}-{arch}"));
                    included.insert(os.clone());
                    included.insert(ver.clone());
                    included.insert(arch.clone());
                    included.extend_from(&self.mkenv().await?.pkgchk_tags);

                    if self.probe_x11().await {
                        included.insert("x11");
                    }
                }
                included.extend_from(&self.opts.add_tags);

                let mut excluded = Tagset::new();
                excluded.extend_from(&self.opts.remove_tags);
                excluded.extend_from(&self.mkenv().await?.pkgchk_notags);

                self.reporter
                    .verbose(format_args!("set   TAGS={included}"));
                self.reporter
                    .verbose(format_args!("unset TAGS={excluded}"));
                Ok((included, excluded))
            })
            .await
    }

    /// Does this machine have X11? pkg-config is the authority.
    async fn probe_x11(&self) -> bool {
        let probe = Harness::cmd("pkg-config")
            .args(["--exists", "x11"])
            .stdin(FdAction::Close)
            .stdout(FdAction::Close)
            .stderr(FdAction::Close)
            .spawn();
        match probe {
            Ok(mut pkg_config) => matches!(pkg_config.wait().await, Ok(status) if status == crate::harness::Status::Exited(0)),
            Err(_) => false,
        }
    }

    pub async fn installed_pkgnames(&self) -> Result<&BTreeSet<Pkgname>> {
        self.installed_pkgnames
            .get_or_try_init(|| async {
                self.reporter
                    .verbose(format_args!("Enumerate PKGNAME from installed packages"));
                let pkg_info = self.pkg_info().await?;
                pkgdb::installed_pkgnames(pkg_info).await
            })
            .await
    }

    pub async fn installed_pkgpaths(&self) -> Result<&BTreeSet<Pkgpath>> {
        self.installed_pkgpaths
            .get_or_try_init(|| async {
                self.reporter
                    .verbose(format_args!("Enumerate PKGPATH from installed packages"));
                let pkg_info = self.pkg_info().await?;
                pkgdb::installed_pkgpaths(pkg_info).await
            })
            .await
    }

    pub async fn bin_pkg_summary(&self) -> Result<&Summary> {
        self.bin_pkg_summary
            .get_or_try_init(|| async {
                let summary = Summary::from_packages(
                    &self.reporter,
                    self.concurrency(),
                    self.packages().await?,
                    self.pkg_info().await?,
                    self.pkg_sufx().await?,
                )
                .await?;
                self.reporter
                    .verbose(format_args!("Binary packages: {}", summary.len()));
                Ok(summary)
            })
            .await
    }

    pub async fn bin_pkg_map(&self) -> Result<&Pkgmap> {
        self.bin_pkg_map
            .get_or_try_init(|| async { Ok(Pkgmap::from_summary(self.bin_pkg_summary().await?)) })
            .await
    }

    /// Is a binary package for exactly this name on offer?
    pub async fn is_binary_available(&self, name: &Pkgname) -> Result<bool> {
        Ok(self.bin_pkg_summary().await?.contains_key(name))
    }

    /// The binary package file for a name, defaulting to `NAME<PKG_SUFX>`
    /// when the summary does not say otherwise.
    pub async fn binary_package_file_of(&self, name: &Pkgname) -> Result<Option<Utf8PathBuf>> {
        let summary = self.bin_pkg_summary().await?;
        let Some(vars) = summary.get(name) else {
            return Ok(None);
        };
        let packages = self.packages().await?;
        Ok(Some(match &vars.file_name {
            Some(file) => packages.join(file),
            None => packages.join(format!("{name}{}", self.pkg_sufx().await?)),
        }))
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("pkg_path", &self.pkg_path)
            .finish_non_exhaustive()
    }
}

/// Attach the right complaint when a required make variable came back
/// empty.
pub fn required_var(value: String, var: &str, origin: &Utf8Path) -> Result<String> {
    if value.is_empty() {
        Err(anyhow!("Unable to extract {var} for {origin}"))
    } else {
        Ok(value)
    }
}
