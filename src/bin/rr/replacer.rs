//! The rolling replacer: keeps four TODO sets and a mutable dependency
//! graph, and replaces one package at a time in dependency order so the
//! system stays usable throughout.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use camino::Utf8PathBuf;
use colored::Colorize;

use pkgward::check::{CheckOptions, Checker};
use pkgward::env::Environment;
use pkgward::graph::DepGraph;
use pkgward::harness::{stringify_argv, FdAction, Harness, SHELL};
use pkgward::makevars::{extract_pkgmk_var, extract_pkgmk_vars, BMAKE};
use pkgward::name::{Pkgbase, Pkgpath};
use pkgward::nursery::{default_concurrency, Nursery};
use pkgward::pkgdb;
use pkgward::report::Reporter;
use pkgward::summary::Summary;
use pkgward::version::Pkgversion;
use pkgward::{msg, verbose_msg, warn_msg};

use crate::args::Args;

type Todo = BTreeMap<Pkgbase, Pkgpath>;

pub struct RollingReplacer {
    opts: Args,
    env: Environment,
    reporter: Reporter,
    concurrency: usize,
    /// With -s the stricter marker is what triggers rebuilds.
    unsafe_var: &'static str,
    /// Make variables for every invocation (`-D`, plus our own marker).
    base_make_vars: BTreeMap<String, String>,
    no_rebuild: BTreeSet<Pkgbase>,

    mismatch_todo: Todo,
    rebuild_todo: Todo,
    missing_todo: Todo,
    unsafe_todo: Todo,
    replace_todo: Todo,

    succeeded: Vec<Pkgbase>,
    failed: Vec<Pkgbase>,

    /// Built from installed packages, then updated as new depends are
    /// discovered and new packages installed.
    topology: DepGraph<Pkgbase>,
    /// A frozen copy of the graph as initially built; the dry-run unsafe
    /// approximation works against this.
    initial_topology: DepGraph<Pkgbase>,

    /// Bases whose source-declared dependencies have been reconciled with
    /// the graph, and the PKGVERSION the source offered at that point.
    depends_checked: BTreeMap<Pkgbase, Pkgversion>,

    /// (pattern, pkgpath) → pkgbase. pkgsrc does not mutate during a run,
    /// so entries never expire.
    pattern_to_base_cache: Arc<Mutex<HashMap<(String, Pkgpath), Pkgbase>>>,

    /// Packages never disappear during a run; once seen installed, always
    /// installed.
    definitely_installed: BTreeSet<Pkgbase>,
}

impl RollingReplacer {
    pub async fn new(opts: Args, env: Environment, reporter: Reporter) -> Result<Self> {
        let unsafe_var = if opts.strict {
            "unsafe_depends_strict"
        } else {
            "unsafe_depends"
        };

        let mut base_make_vars: BTreeMap<String, String> =
            opts.make_vars.iter().cloned().collect();
        base_make_vars.insert("IN_PKG_ROLLING_REPLACE".to_owned(), "1".to_owned());

        let mut replacer = RollingReplacer {
            no_rebuild: opts.no_rebuild.iter().map(|s| Pkgbase::from(s.as_str())).collect(),
            concurrency: default_concurrency(),
            unsafe_var,
            base_make_vars,
            opts,
            env,
            reporter,
            mismatch_todo: Todo::new(),
            rebuild_todo: Todo::new(),
            missing_todo: Todo::new(),
            unsafe_todo: Todo::new(),
            replace_todo: Todo::new(),
            succeeded: Vec::new(),
            failed: Vec::new(),
            topology: DepGraph::new(),
            initial_topology: DepGraph::new(),
            depends_checked: BTreeMap::new(),
            pattern_to_base_cache: Arc::new(Mutex::new(HashMap::new())),
            definitely_installed: BTreeSet::new(),
        };

        replacer.initial_scan().await?;

        for todo in [
            &replacer.mismatch_todo,
            &replacer.rebuild_todo,
            &replacer.unsafe_todo,
        ] {
            for base in todo.keys() {
                replacer.definitely_installed.insert(base.clone());
            }
        }
        replacer.refresh_todo();

        replacer.topology = replacer.depgraph_installed().await?;
        replacer.initial_topology = replacer.topology.clone();
        replacer.dump_todo()?;

        Ok(replacer)
    }

    /// Populate the mismatch/rebuild/unsafe sets, all from one sweep over
    /// the installed packages. Except under `-u`, where mismatches come from
    /// checking the source tree instead of trusting `mismatch=YES`.
    async fn initial_scan(&mut self) -> Result<()> {
        let pkg_info = self.env.pkg_info().await?.to_owned();
        let installed = self.env.installed_pkgnames().await?.clone();
        let no_check: BTreeSet<Pkgbase> = self
            .opts
            .no_check
            .iter()
            .map(|s| Pkgbase::from(s.as_str()))
            .collect();

        let mut scanner = pkgward::scan::PackageScanner::new(&pkg_info, self.concurrency);
        if !self.opts.check_for_updates {
            msg!(
                self.reporter,
                "Checking for mismatched installed packages (mismatch=YES)"
            );
            scanner.add_axis("mismatch", no_check.clone());
        }
        if !self.opts.just_fetch {
            msg!(
                self.reporter,
                "Checking for rebuild-requested installed packages (rebuild=YES)"
            );
            scanner.add_axis("rebuild", BTreeSet::new());
            msg!(
                self.reporter,
                "Checking for unsafe installed packages ({}=YES)",
                self.unsafe_var
            );
            scanner.add_axis(self.unsafe_var, BTreeSet::new());
        }
        let mut results = scanner.run(&installed).await?.into_iter();

        if !self.opts.check_for_updates {
            self.mismatch_todo = results.next().unwrap_or_default();
        }
        if !self.opts.just_fetch {
            self.rebuild_todo = results.next().unwrap_or_default();
            self.unsafe_todo = results.next().unwrap_or_default();
        }

        if self.opts.check_for_updates {
            self.mismatch_todo = self.check_mismatch_from_source(&pkg_info, &no_check).await?;
        }
        Ok(())
    }

    async fn check_mismatch_from_source(
        &self,
        pkg_info: &str,
        no_check: &BTreeSet<Pkgbase>,
    ) -> Result<Todo> {
        msg!(
            self.reporter,
            "Checking for mismatched installed packages by scanning source tree"
        );
        let installed_summary = Summary::from_installed(pkg_info).await?;
        let checker = Checker::source(
            CheckOptions {
                add_missing: false,
                check_build_version: self.opts.check_build_version,
                update: true,
                delete_mismatched: false,
                concurrency: self.concurrency,
            },
            pkg_info,
            self.env.pkgsrcdir().await?.clone(),
            &installed_summary,
            None,
            Arc::new(self.reporter.clone()),
        );
        let result = checker.run_installed().await?;

        if !result.mismatch_todo.is_empty() && !self.opts.dry_run {
            // Persist the finding so an interrupted run can pick up where
            // it left off. Spawn xargs only when there is something to
            // mark, or we would ask for a password for nothing.
            msg!(self.reporter, "Marking outdated packages as mismatched");
            let pkg_admin = self.env.pkg_admin().await?;
            let mut xargs = self
                .spawn_su(&format!("xargs {pkg_admin} set mismatch=YES"))
                .await?;
            let names: String = result
                .mismatch_todo
                .keys()
                .map(|name| format!("{name}\n"))
                .collect();
            xargs.write_stdin(names.as_bytes()).await?;
            if xargs.wait_exit().await? != 0 {
                warn_msg!(
                    self.reporter,
                    "mismatch variable not set due to permissions; the status will not persist."
                );
            }
        }

        Ok(result
            .mismatch_todo
            .into_iter()
            .filter(|(name, _)| !no_check.contains(&name.base))
            .map(|(name, path)| (name.base, path))
            .collect())
    }

    /// Drive the main loop until nothing is left to replace.
    pub async fn run(mut self) -> Result<()> {
        while !self.replace_todo.is_empty() {
            let (base, path) = self.choose_one()?;

            if !self.depends_checked.contains_key(&base) {
                match self.update_depends_with_source(&base, &path).await {
                    Ok(version) => {
                        self.depends_checked.insert(base, version);
                        // The graph may have changed; pick again under the
                        // new tsort.
                        continue;
                    }
                    Err(error) => self.record_failure(&base, error)?,
                }
            } else {
                msg!(
                    self.reporter,
                    "Selecting {} ({path}) as next package to replace",
                    base.as_str().bold()
                );
                self.vsleep(Duration::from_secs(1)).await;

                let action = if self.opts.just_fetch {
                    self.fetch(&base, &path).await
                } else {
                    self.replace(&base, &path).await
                };
                match action {
                    Ok(()) => self.succeeded.push(base.clone()),
                    Err(error) => self.record_failure(&base, error)?,
                }
            }

            // Off every list, succeeded or not; a failed package would
            // otherwise be reselected forever.
            self.mismatch_todo.remove(&base);
            self.rebuild_todo.remove(&base);
            self.missing_todo.remove(&base);
            self.unsafe_todo.remove(&base);
            self.refresh_todo();
            self.dump_todo()?;
            self.vsleep(Duration::from_secs(2)).await;
        }

        msg!(self.reporter, "No more packages to replace; done.");
        self.report();
        Ok(())
    }

    fn record_failure(&mut self, base: &Pkgbase, error: anyhow::Error) -> Result<()> {
        self.failed.push(base.clone());
        if self.opts.continue_on_errors {
            self.reporter.error(format_args!("{error:#}"));
            Ok(())
        } else {
            self.reporter.error(format_args!("{error:#}"));
            self.reporter.error(format_args!(
                "Please read the errors listed above, fix the problem,\n\
                 then re-run pkgward-rr to continue."
            ));
            self.report();
            Err(anyhow!("replace failed for {base}"))
        }
    }

    fn refresh_todo(&mut self) {
        let mut replace = self.mismatch_todo.clone();
        if self.opts.just_fetch {
            replace.extend(self.missing_todo.clone());
        } else {
            replace.extend(self.rebuild_todo.clone());
            replace.extend(self.missing_todo.clone());
            replace.extend(self.unsafe_todo.clone());
        }
        for base in &self.no_rebuild {
            replace.remove(base);
        }
        for base in &self.failed {
            replace.remove(base);
        }
        self.replace_todo = replace;
    }

    fn dump_todo(&self) -> Result<()> {
        if self.reporter.verbosity() == 0 {
            return Ok(());
        }
        if self.opts.just_fetch {
            verbose_msg!(self.reporter, "Packages to fetch:");
            self.dump_one_todo("MISMATCH_TODO", &self.mismatch_todo)?;
            self.dump_one_todo("MISSING_TODO", &self.missing_todo)?;
        } else {
            verbose_msg!(self.reporter, "Packages to rebuild:");
            self.dump_one_todo("MISMATCH_TODO", &self.mismatch_todo)?;
            self.dump_one_todo("REBUILD_TODO", &self.rebuild_todo)?;
            self.dump_one_todo("MISSING_TODO", &self.missing_todo)?;
            self.dump_one_todo("UNSAFE_TODO", &self.unsafe_todo)?;
        }
        Ok(())
    }

    /// Lists are tsorted so that the packages about to be replaced appear
    /// at the end, where the eye lands.
    fn dump_one_todo(&self, label: &str, todo: &Todo) -> Result<()> {
        let sorted = self
            .topology
            .tsort(true)
            .map_err(|cycle| anyhow!("Found a cycle in the dependency graph: {}", cycle))?;

        let mut entries: Vec<&str> = Vec::new();
        for base in sorted.iter().rev() {
            if todo.contains_key(base) {
                entries.push(base.as_str());
            }
        }
        // Not every TODO member is reachable from the graph yet.
        for base in todo.keys() {
            if !self.topology.has_vertex(base) {
                entries.push(base.as_str());
            }
        }

        if entries.is_empty() {
            verbose_msg!(self.reporter, "{label}=[]");
        } else {
            verbose_msg!(
                self.reporter,
                "{label}=[{}] ({} {})",
                entries.join(" "),
                entries.len(),
                if entries.len() == 1 { "package" } else { "packages" }
            );
        }
        Ok(())
    }

    async fn is_pkg_installed(&mut self, base: &Pkgbase) -> Result<bool> {
        // Nothing is ever deinstalled by this tool, so a positive answer
        // can be cached forever.
        if self.definitely_installed.contains(base) {
            return Ok(true);
        }
        let pkg_info = self.env.pkg_info().await?;
        if pkgdb::is_pkg_installed(pkg_info, base.as_str()).await? {
            self.definitely_installed.insert(base.clone());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Build the dependency graph by breadth-first discovery from the
    /// replace set: cheaper than enumerating the blddeps of everything
    /// installed.
    async fn depgraph_installed(&mut self) -> Result<DepGraph<Pkgbase>> {
        msg!(
            self.reporter,
            "Building dependency graph for installed packages"
        );
        let pkg_info = self.env.pkg_info().await?.to_owned();
        let depgraph: Arc<Mutex<DepGraph<Pkgbase>>> = Arc::new(Mutex::new(DepGraph::new()));

        let mut to_scan: BTreeSet<Pkgbase> = self.replace_todo.keys().cloned().collect();
        while !to_scan.is_empty() {
            let scheduled: Arc<Mutex<BTreeSet<Pkgbase>>> = Arc::new(Mutex::new(BTreeSet::new()));
            let mut nursery = Nursery::new(self.concurrency);
            for base in to_scan {
                // A base scheduled here might not be installed at all: a
                // build-only dependency can have been deinstalled after
                // building. Its dependencies get discovered later, in the
                // new-depends phase.
                if !self.is_pkg_installed(&base).await? {
                    continue;
                }
                let pkg_info = pkg_info.clone();
                let depgraph = Arc::clone(&depgraph);
                let scheduled = Arc::clone(&scheduled);
                nursery.start_soon(async move {
                    // The pkg_info run is the expensive part; keep it
                    // outside any lock.
                    let deps = pkgdb::build_depends(&pkg_info, base.as_str()).await?;
                    if deps.is_empty() {
                        // Still needs a vertex or it could never be
                        // selected.
                        depgraph.lock().unwrap().add_vertex(base);
                    } else {
                        let mut graph = depgraph.lock().unwrap();
                        let mut scheduled = scheduled.lock().unwrap();
                        for dep in deps {
                            if !graph.has_vertex(&dep.base) {
                                scheduled.insert(dep.base.clone());
                            }
                            graph.add_edge(&base, &dep.base);
                        }
                    }
                    Ok(())
                })?;
            }
            nursery.join().await?;
            to_scan = std::mem::take(&mut *scheduled.lock().unwrap());
        }

        let mut depgraph = Arc::try_unwrap(depgraph)
            .expect("discovery has finished")
            .into_inner()
            .unwrap();

        // The blddep entries include BOOTSTRAP_DEPENDS, and FETCH_USING
        // shows up there on everything, forming cycles. Cut every edge
        // into it; a real BUILD_DEPENDS/DEPENDS on it resurfaces in the
        // new-depends phase.
        if let Some(fetch_using) = self.env.fetch_using().await? {
            depgraph.remove_in_edges(fetch_using);
        }

        Ok(depgraph)
    }

    /// The next victim: scan the tsort leaves-first and take the first
    /// base that wants replacing, i.e. the deepest remaining dependency.
    fn choose_one(&self) -> Result<(Pkgbase, Pkgpath)> {
        let sorted = self
            .topology
            .tsort(true)
            .map_err(|cycle| anyhow!("Found a cycle in the dependency graph: {}", cycle))?;
        for base in sorted {
            if let Some(path) = self.replace_todo.get(&base) {
                return Ok((base, path.clone()));
            }
        }
        // Can only mean the graph and the TODO sets disagree.
        bail!("internal inconsistency: no replaceable package is in the dependency graph");
    }

    fn make_vars_for_pkg(&self, base: &Pkgbase) -> BTreeMap<String, String> {
        // PKGNAME_REQD lets the tree derive options from the package name;
        // building py312-foo has to pick python-3.12, not the default.
        let mut vars = self.base_make_vars.clone();
        vars.insert("PKGNAME_REQD".to_owned(), format!("{base}-[0-9]*"));
        vars
    }

    async fn update_depends_with_source(
        &mut self,
        base: &Pkgbase,
        path: &Pkgpath,
    ) -> Result<Pkgversion> {
        msg!(
            self.reporter,
            "Checking if {} has new depends...",
            base.as_str().bold()
        );
        let old_depends = self.topology.out_edges(base).unwrap_or_default();
        let (version, new_depends) = self.source_depends(base, path).await?;

        let differ = old_depends.len() != new_depends.len()
            || old_depends.iter().any(|dep| !new_depends.contains_key(dep))
            || new_depends.keys().any(|dep| !old_depends.contains(dep));

        if differ {
            self.dump_new_depends(base, &old_depends, &new_depends).await;
            self.topology.remove_out_edges(base);

            let mut something_is_missing = false;
            for (dep_base, dep_path) in &new_depends {
                self.topology.add_edge(base, dep_base);
                if !self.is_pkg_installed(dep_base).await? {
                    // Not installed yet, dependencies unknown; discovery
                    // happens when it is selected.
                    self.missing_todo.insert(dep_base.clone(), dep_path.clone());
                    something_is_missing = true;
                }
            }

            if something_is_missing {
                self.refresh_todo();
                self.dump_todo()?;
            }
        }

        Ok(version)
    }

    async fn dump_new_depends(
        &self,
        base: &Pkgbase,
        old_depends: &BTreeSet<Pkgbase>,
        new_depends: &BTreeMap<Pkgbase, Pkgpath>,
    ) {
        let added: Vec<&str> = new_depends
            .keys()
            .filter(|dep| !old_depends.contains(*dep))
            .map(Pkgbase::as_str)
            .collect();
        if !added.is_empty() {
            msg!(
                self.reporter,
                "{} has the following new depends (need to re-tsort):\n[{}]",
                base.as_str().bold(),
                added.join(" ").dimmed()
            );
            self.vsleep(Duration::from_secs(2)).await;
        }
    }

    /// What the source tree says this package depends on right now, plus
    /// its current PKGVERSION.
    async fn source_depends(
        &self,
        base: &Pkgbase,
        path: &Pkgpath,
    ) -> Result<(Pkgversion, BTreeMap<Pkgbase, Pkgpath>)> {
        let pkgsrcdir = self.env.pkgsrcdir().await?.clone();
        let pkgdir = path.dir_under(&pkgsrcdir);
        let mut vars = extract_pkgmk_vars(
            &pkgdir,
            &["PKGVERSION", "BUILD_DEPENDS", "TOOL_DEPENDS", "DEPENDS"],
            &self.make_vars_for_pkg(base),
        )
        .await?
        .ok_or_else(|| anyhow!("Makefile is missing from {pkgdir}"))?;

        let version = Pkgversion::parse(&vars.remove("PKGVERSION").unwrap_or_default());

        let mut deps: HashMap<String, Pkgpath> = HashMap::new();
        for (var, value) in &vars {
            for dep in value.split_whitespace() {
                let parsed = dep.split_once(':').and_then(|(pattern, dep_path)| {
                    dep_path
                        .strip_prefix("../../")
                        .and_then(|rel| rel.parse::<Pkgpath>().ok())
                        .map(|dep_path| (pattern, dep_path))
                });
                match parsed {
                    Some((pattern, dep_path)) => {
                        deps.insert(pattern.to_owned(), dep_path);
                    }
                    None => warn_msg!(self.reporter, "Invalid dependency: `{dep}' in {var}"),
                }
            }
        }

        // Each pattern has to resolve to a PKGBASE. Consulting pkgsrc is
        // expensive, so cheat where possible: memoised answers first, then
        // version-range patterns whose base is literal. Globs cannot be
        // unpicked that way ("foo-[0-9]*" could match "foo-0-bar-1.2nb3"),
        // so they fall through to make.
        let resolved: Arc<Mutex<BTreeMap<Pkgbase, Pkgpath>>> =
            Arc::new(Mutex::new(BTreeMap::new()));
        let mut consult_make: Vec<(String, Pkgpath)> = Vec::new();
        for (pattern_str, dep_path) in deps {
            let cache_key = (pattern_str.clone(), dep_path.clone());
            if let Some(dep_base) = self.pattern_to_base_cache.lock().unwrap().get(&cache_key) {
                resolved.lock().unwrap().insert(dep_base.clone(), dep_path);
                continue;
            }

            let pattern = pkgward::Pkgpattern::parse(&pattern_str)
                .with_context(|| format!("Bad dependency pattern in {pkgdir}"))?;
            match pattern.obvious_base() {
                Some(dep_base) => {
                    self.pattern_to_base_cache
                        .lock()
                        .unwrap()
                        .insert(cache_key, dep_base.clone());
                    resolved.lock().unwrap().insert(dep_base.clone(), dep_path);
                }
                None => consult_make.push((pattern_str, dep_path)),
            }
        }

        let mut nursery = Nursery::new(self.concurrency);
        for (pattern_str, dep_path) in consult_make {
            let resolved = Arc::clone(&resolved);
            let cache = Arc::clone(&self.pattern_to_base_cache);
            let mut make_vars = self.base_make_vars.clone();
            make_vars.insert("PKGNAME_REQD".to_owned(), pattern_str.clone());
            let dep_pkgdir = dep_path.dir_under(&pkgsrcdir);
            nursery.start_soon(async move {
                let dep_base = extract_pkgmk_var(&dep_pkgdir, "PKGBASE", &make_vars)
                    .await?
                    .filter(|value| !value.is_empty())
                    .map(Pkgbase::from)
                    .ok_or_else(|| anyhow!("Cannot retrieve PKGBASE from {dep_pkgdir}"))?;
                cache
                    .lock()
                    .unwrap()
                    .insert((pattern_str, dep_path.clone()), dep_base.clone());
                resolved.lock().unwrap().insert(dep_base, dep_path);
                Ok(())
            })?;
        }
        nursery.join().await?;

        let resolved = Arc::try_unwrap(resolved)
            .expect("resolution has finished")
            .into_inner()
            .unwrap();
        Ok((version, resolved))
    }

    async fn run_make(
        &self,
        base: &Pkgbase,
        path: &Pkgpath,
        targets: &[&str],
        vars: &BTreeMap<String, String>,
    ) -> Result<()> {
        let pkgdir = path.dir_under(self.env.pkgsrcdir().await?);
        if !pkgdir.join("Makefile").exists() {
            bail!("Makefile is missing from {pkgdir}");
        }

        let mut argv: Vec<String> = vec!["-C".to_owned(), pkgdir.to_string()];
        argv.extend(targets.iter().map(|t| (*t).to_owned()));
        argv.extend(vars.iter().map(|(var, value)| format!("{var}={value}")));

        if self.opts.dry_run {
            msg!(
                self.reporter,
                "{}",
                format!("Would run: {BMAKE} {}", stringify_argv(&argv)).dimmed()
            );
            return Ok(());
        }

        if let Some(log_dir) = &self.opts.log_dir {
            // Build output goes both to the terminal and to
            // LOG_DIR/<category>/<pkgname>.
            let version = self
                .depends_checked
                .get(base)
                .cloned()
                .unwrap_or_default();
            let log_subdir = log_dir.join(path.category());
            std::fs::create_dir_all(&log_subdir)
                .with_context(|| format!("Failed to create {log_subdir}"))?;
            let log_file: Utf8PathBuf = log_subdir.join(format!("{base}-{version}"));
            let mut log = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)
                .with_context(|| format!("Failed to open {log_file}"))?;

            let mut make = Harness::cmd(BMAKE)
                .args(argv.iter().cloned())
                .stdin(FdAction::Inherit)
                .stdout(FdAction::Pipe)
                .stderr(FdAction::MergeWithStdout)
                .spawn()?;
            let mut out = make.take_stdout().expect("stdout is piped");
            let mut buf = [0u8; 8192];
            use std::io::Write;
            use tokio::io::AsyncReadExt;
            loop {
                let n = out.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                std::io::stdout().write_all(&buf[..n])?;
                log.write_all(&buf[..n])?;
            }
            if make.wait_exit().await? != 0 {
                bail!("Command failed: {BMAKE} {}", stringify_argv(&argv));
            }
        } else {
            let mut make = Harness::cmd(BMAKE)
                .args(argv.iter().cloned())
                .stdin(FdAction::Inherit)
                .stdout(FdAction::Inherit)
                .stderr(FdAction::Inherit)
                .spawn()?;
            if make.wait_exit().await? != 0 {
                bail!("Command failed: {BMAKE} {}", stringify_argv(&argv));
            }
        }
        Ok(())
    }

    async fn spawn_su(&self, cmd: &str) -> Result<Harness> {
        let su_cmd = self.env.su_cmd().await?;
        let builder = if su_cmd.is_empty() {
            Harness::cmd(SHELL).args(["-c", &format!("exec {cmd}")])
        } else {
            // SU_CMD expects exactly one argument, interpreted as a shell
            // script.
            Harness::cmd(SHELL).args(["-c", &format!("exec {su_cmd} \"$0\""), cmd])
        };
        Ok(builder
            .stdin(FdAction::Pipe)
            .stdout(FdAction::Inherit)
            .spawn()?)
    }

    async fn run_su(&self, cmd: &str) -> Result<()> {
        let mut child = self.spawn_su(cmd).await?;
        child.close_stdin();
        Ok(child.wait_success().await?)
    }

    async fn fetch(&mut self, base: &Pkgbase, path: &Pkgpath) -> Result<()> {
        msg!(self.reporter, "Fetching {}", base.as_str().bold());
        self.run_make(
            base,
            path,
            &["fetch", "depends-fetch"],
            &self.make_vars_for_pkg(base),
        )
        .await
    }

    async fn replace(&mut self, base: &Pkgbase, path: &Pkgpath) -> Result<()> {
        self.clean(base, path).await?;

        let was_installed = self.is_pkg_installed(base).await?;
        if was_installed {
            msg!(self.reporter, "Replacing {}", base.as_str().bold());
        } else {
            msg!(self.reporter, "Installing {}", base.as_str().bold());
        }

        let mut make_vars = self.make_vars_for_pkg(base);
        make_vars.insert(
            "PKGSRC_KEEP_BIN_PKGS".to_owned(),
            if self.opts.just_replace { "NO" } else { "YES" }.to_owned(),
        );

        if was_installed {
            self.run_make(base, path, &["replace"], &make_vars).await?;
        } else {
            self.run_make(base, path, &["install"], &make_vars).await?;
            // Not previously installed means the user never asked for it
            // directly.
            if !self.opts.dry_run {
                let pkg_admin = self.env.pkg_admin().await?;
                self.run_su(&format!("{pkg_admin} set automatic=YES {base}"))
                    .await?;
            }
        }

        self.clean(base, path).await?;

        if !self.opts.dry_run {
            self.audit_replaced(base, was_installed).await?;
        }

        // In dry-run mode a package that is not actually installed cannot
        // be queried for reverse dependencies.
        if !self.opts.dry_run || self.is_pkg_installed(base).await? {
            self.recheck_unsafe(base).await?;
        }
        Ok(())
    }

    /// The flags on the freshly replaced package must all have been
    /// cleared by the build; anything still set means the replace did not
    /// take.
    async fn audit_replaced(&self, base: &Pkgbase, was_installed: bool) -> Result<()> {
        let pkg_info = self.env.pkg_info().await?;
        let mut is_automatic = false;
        for (var, value) in pkgdb::build_info(pkg_info, base.as_str()).await? {
            let yes = value.eq_ignore_ascii_case("yes");
            match var.as_str() {
                "automatic" if yes => is_automatic = true,
                "unsafe_depends_strict" if yes => {
                    bail!("package `{base}' still has unsafe_depends_strict.")
                }
                "unsafe_depends" if yes => bail!("package `{base}' still has unsafe_depends."),
                "rebuild" if yes => bail!("package `{base}' is still requested to be rebuilt."),
                "mismatch" if yes => bail!("package `{base}' is still a mismatched version."),
                _ => {}
            }
        }
        if !was_installed && !is_automatic {
            bail!("package `{base}' is not marked as automatically installed.");
        }
        Ok(())
    }

    /// `make replace` marks dependents whose ABI contract it may have
    /// broken. Pull those markers into the unsafe set, and extend the
    /// graph so the tsort keeps them downstream of this base.
    async fn recheck_unsafe(&mut self, base: &Pkgbase) -> Result<()> {
        msg!(
            self.reporter,
            "Re-checking for unsafe installed packages ({}=YES)",
            self.unsafe_var
        );
        let pkg_info = self.env.pkg_info().await?.to_owned();

        let dependents = if self.opts.dry_run {
            // The replace did not happen, so nothing got marked. Take
            // every reverse dependent from the frozen graph instead: an
            // approximation, because "make replace" only marks on a
            // potential ABI change, but close enough to watch what a real
            // run would do.
            let mut dependents = BTreeSet::new();
            if let Some(ins) = self.initial_topology.in_edges(base) {
                dependents.extend(ins);
            }
            for name in pkgdb::who_requires(&pkg_info, base.as_str()).await? {
                dependents.insert(name.base);
            }
            dependents
        } else {
            pkgdb::who_requires(&pkg_info, base.as_str())
                .await?
                .into_iter()
                .map(|name| name.base)
                .collect()
        };

        let unsafe_pkgs: Arc<Mutex<Todo>> = Arc::new(Mutex::new(Todo::new()));
        let mut nursery = Nursery::new(self.concurrency);
        for dependent in dependents {
            if self.unsafe_todo.contains_key(&dependent) {
                continue;
            }
            let pkg_info = pkg_info.clone();
            let unsafe_pkgs = Arc::clone(&unsafe_pkgs);
            let unsafe_var = self.unsafe_var;
            let dry_run = self.opts.dry_run;
            nursery.start_soon(async move {
                let info = pkgdb::build_info(&pkg_info, dependent.as_str()).await?;
                let path = info
                    .iter()
                    .find(|(var, _)| var == "PKGPATH")
                    .and_then(|(_, value)| value.parse::<Pkgpath>().ok());
                let marked = dry_run
                    || info
                        .iter()
                        .any(|(var, value)| var == unsafe_var && value.eq_ignore_ascii_case("yes"));
                if marked {
                    if let Some(path) = path {
                        unsafe_pkgs.lock().unwrap().insert(dependent, path);
                    }
                }
                Ok(())
            })?;
        }
        nursery.join().await?;

        let unsafe_pkgs = Arc::try_unwrap(unsafe_pkgs)
            .expect("recheck has finished")
            .into_inner()
            .unwrap();
        for (unsafe_base, unsafe_path) in unsafe_pkgs {
            self.topology.add_edge(&unsafe_base, base);
            self.unsafe_todo.insert(unsafe_base, unsafe_path);
        }
        Ok(())
    }

    /// Simulating "make clean" by hand looks tempting and is a trap:
    /// WRKOBJDIR, WRKDIR_BASENAME and {pre,post}-clean hooks all change
    /// what it means.
    async fn clean(&self, base: &Pkgbase, path: &Pkgpath) -> Result<()> {
        self.run_make(base, path, &["clean"], &self.base_make_vars).await
    }

    fn report(&self) {
        if self.reporter.verbosity() > 0 {
            for base in &self.succeeded {
                msg!(self.reporter, "{}", format!("+ {base}").green());
            }
            for base in &self.failed {
                msg!(self.reporter, "{}", format!("- {base}").red());
            }
        }
    }

    /// Give the operator a moment to read, the way an interactive session
    /// wants, but only when being chatty anyway.
    async fn vsleep(&self, duration: Duration) {
        if self.reporter.verbosity() >= 2 && !self.opts.dry_run {
            tokio::time::sleep(duration).await;
        }
    }
}
