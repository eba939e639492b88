use std::collections::{BTreeMap, BTreeSet};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use regex::Regex;

use pkgward::check::{CheckOptions, CheckResult, Checker};
use pkgward::config::{Config, Definition, PkgDef, Tagset};
use pkgward::env::{EnvOptions, Environment};
use pkgward::graph::DepGraph;
use pkgward::harness::{stringify_argv, Harness};
use pkgward::makevars::BMAKE;
use pkgward::name::{Pkgbase, Pkgname, Pkgpath};
use pkgward::pkgdb;
use pkgward::report::Reporter;
use pkgward::summary::{Pkgvars, Summary};
use pkgward::todo_file::TodoFile;
use pkgward::{msg, verbose_msg};

use crate::args::Args;

mod args;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    pkgward::tracing::init(args.verbose);
    tracing::debug!("{args:?}");

    let reporter = Reporter::new(args.verbose);
    if let Some(log_file) = &args.log_file {
        if let Err(error) = reporter.log_to(log_file) {
            reporter.error(format_args!("{error:#}"));
            return ExitCode::FAILURE;
        }
    }

    match run(&args, &reporter).await {
        Ok(()) => ExitCode::from(reporter.exit_code() as u8),
        Err(error) => {
            reporter.error(format_args!("{error:#}"));
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args, reporter: &Reporter) -> Result<()> {
    let audit_mode = args.add_missing
        || args.delete_mismatched
        || args.update
        || args.print_pkgpaths
        || args.fetch
        || args.list_ver_diffs;
    let picked = [
        audit_mode,
        args.generate_conf,
        args.list_bin_pkgs,
        args.lookup_todo,
    ]
    .iter()
    .filter(|picked| **picked)
    .count();
    if picked == 0 {
        bail!("one of -a, -f, -g, -l, -N, -p, -q, -r or -u is required");
    }
    if picked > 1 {
        bail!("-g, -l and -N cannot be combined with other modes");
    }

    let env = Environment::new(
        EnvOptions {
            bin_pkg_path: args.packages.clone(),
            pkgchk_conf_path: args.config.clone(),
            add_tags: Tagset::from_csv(args.add_tags.as_deref().unwrap_or("")),
            remove_tags: Tagset::from_csv(args.remove_tags.as_deref().unwrap_or("")),
            concurrency: args.concurrency,
        },
        reporter.clone(),
    );

    if args.generate_conf {
        generate_conf_from_installed(&env, reporter).await
    } else if args.list_bin_pkgs {
        list_bin_pkgs(&env, reporter).await
    } else if args.lookup_todo {
        lookup_todo(&env).await
    } else {
        audit(args, &env, reporter).await
    }
}

/// When neither -b nor -s is given both are in play, binary preferred.
fn binary_and_source(args: &Args) -> (bool, bool) {
    if !args.use_binary && !args.build_from_source {
        (true, true)
    } else {
        (args.use_binary, args.build_from_source)
    }
}

fn timestamp(format: &str) -> String {
    let format = time::format_description::parse(format).expect("static format");
    time::OffsetDateTime::now_local()
        .unwrap_or_else(|_| time::OffsetDateTime::now_utc())
        .format(&format)
        .unwrap_or_default()
}

/// Log and run an external command through the shell. Returns whether the
/// command succeeded; a failure with `fail_ok` false is an error. With -q
/// nothing runs at all, and with -n the command is only logged.
async fn run_cmd(
    args: &Args,
    reporter: &Reporter,
    cmd: &str,
    cmd_args: &[String],
    fail_ok: bool,
    cwd: Option<&Utf8Path>,
    extra_env: &[(String, String)],
) -> Result<bool> {
    if args.list_ver_diffs {
        return Ok(true);
    }

    let rendered = if cmd_args.is_empty() {
        cmd.to_owned()
    } else {
        format!("{cmd} {}", stringify_argv(cmd_args))
    };
    match cwd {
        Some(dir) => msg!(reporter, "{} {rendered} [CWD: {dir}]", timestamp("[hour]:[minute]")),
        None => msg!(reporter, "{} {rendered}", timestamp("[hour]:[minute]")),
    }
    if args.dry_run {
        return Ok(true);
    }

    let mut builder = Harness::shell(cmd).args(cmd_args.iter().cloned());
    if let Some(dir) = cwd {
        builder = builder.cwd(dir);
    }
    for (var, value) in extra_env {
        builder = builder.env(var, value);
    }
    let mut child = builder.spawn()?;
    let output = child.read_stdout().await?;
    for line in output.lines() {
        msg!(reporter, "{line}");
    }

    if child.wait_exit().await? != 0 {
        if fail_ok {
            msg!(reporter, "** '{rendered}' failed");
            return Ok(false);
        }
        bail!("'{rendered}' failed");
    }
    Ok(true)
}

/// Same, but through SU_CMD when one is configured.
async fn run_cmd_su(
    args: &Args,
    env: &Environment,
    reporter: &Reporter,
    cmd: &str,
    cmd_args: &[String],
    fail_ok: bool,
    extra_env: &[(String, String)],
) -> Result<bool> {
    let su_cmd = env.su_cmd().await?;
    if su_cmd.is_empty() {
        run_cmd(args, reporter, cmd, cmd_args, fail_ok, None, extra_env).await
    } else {
        // SU_CMD takes the whole command as a single shell-script
        // argument.
        let script = format!("{cmd} {}", stringify_argv(cmd_args));
        run_cmd(
            args,
            reporter,
            &su_cmd.to_owned(),
            &[script],
            fail_ok,
            None,
            extra_env,
        )
        .await
    }
}

async fn pkgpaths_to_check(
    args: &Args,
    env: &Environment,
    reporter: &Reporter,
) -> Result<BTreeSet<Pkgpath>> {
    let mut pkgpaths = BTreeSet::new();
    if args.delete_mismatched || args.update {
        pkgpaths = env.installed_pkgpaths().await?.clone();
    }
    if args.add_missing {
        let conf_file = env.pkgchk_conf().await?;
        verbose_msg!(reporter, "Append to pkgpaths based on config {conf_file}");
        let conf = Config::load(conf_file)?;
        let (included, excluded) = env.tags().await?;
        pkgpaths.extend(conf.pkgpaths(included, excluded));
    }
    Ok(pkgpaths)
}

async fn build_checker(
    args: &Args,
    env: &Environment,
    reporter: &Reporter,
) -> Result<Arc<Checker>> {
    let (use_binary, _) = binary_and_source(args);
    let pkg_info = env.pkg_info().await?.to_owned();

    verbose_msg!(reporter, "Getting summary from installed packages");
    let installed = Summary::from_installed(&pkg_info).await?;

    let opts = CheckOptions {
        add_missing: args.add_missing,
        check_build_version: args.build_version_strict,
        update: args.update,
        delete_mismatched: args.delete_mismatched,
        concurrency: args.concurrency,
    };
    let progress: Arc<dyn pkgward::check::CheckProgress> = Arc::new(reporter.clone());

    if use_binary {
        let bin_summary = Arc::new(env.bin_pkg_summary().await?.clone());
        Ok(Checker::binary(
            opts,
            pkg_info,
            env.packages().await?.clone(),
            env.pkg_sufx().await?,
            bin_summary,
            &installed,
            progress,
        ))
    } else {
        Ok(Checker::source(
            opts,
            pkg_info,
            env.pkgsrcdir().await?.clone(),
            &installed,
            None,
            progress,
        ))
    }
}

async fn audit(args: &Args, env: &Environment, reporter: &Reporter) -> Result<()> {
    let pkgpaths = pkgpaths_to_check(args, env, reporter).await?;
    if args.print_pkgpaths {
        for path in &pkgpaths {
            println!("{path}");
        }
        return Ok(());
    }

    let checker = build_checker(args, env, reporter).await?;
    let mut result = Arc::clone(&checker).run(pkgpaths.clone()).await?;

    let update_conf_exists = args.update && env.pkgchk_update_conf().await?.exists();
    if !result.mismatch_todo.is_empty() || update_conf_exists {
        delete_and_recheck(args, env, reporter, &checker, &pkgpaths, &mut result).await?;
    }

    let mut failed_done: BTreeSet<Pkgname> = BTreeSet::new();
    if args.fetch && !result.missing_todo.is_empty() {
        // "make fetch-list" scripts recurse into dependencies, so running
        // them in parallel would race.
        msg!(reporter, "Fetching distfiles");
        for (name, path) in &result.missing_todo {
            if !try_fetch(args, env, reporter, path).await? {
                failed_done.insert(name.clone());
                if !args.keep_going {
                    break;
                }
            }
        }
    }

    let mut install_done: BTreeSet<Pkgname> = BTreeSet::new();
    if (args.add_missing || args.update) && !result.missing_todo.is_empty() {
        msg!(reporter, "Installing packages");
        for (name, path) in &result.missing_todo {
            if try_install(args, env, reporter, name, path).await? {
                install_done.insert(name.clone());
            } else {
                failed_done.insert(name.clone());
                if !args.keep_going {
                    break;
                }
            }
        }
    }

    // A fully clean update run retires the resume file.
    if args.update && failed_done.is_empty() {
        let conf = env.pkgchk_update_conf().await?;
        if conf.exists() && !args.dry_run {
            std::fs::remove_file(conf).with_context(|| format!("Failed to remove {conf}"))?;
        }
    }

    if !result.missing_done.is_empty() {
        let listed: Vec<_> = result.missing_done.iter().map(ToString::to_string).collect();
        msg!(reporter, "Missing: {}", listed.join(" "));
    }
    if !install_done.is_empty() {
        let listed: Vec<_> = install_done.iter().map(ToString::to_string).collect();
        msg!(reporter, "Installed: {}", listed.join(" "));
    }
    if !failed_done.is_empty() {
        let listed: Vec<_> = failed_done.iter().map(ToString::to_string).collect();
        reporter.fatal_later(format_args!("Failed: {}", listed.join(" ")));
    }
    Ok(())
}

async fn delete_and_recheck(
    args: &Args,
    env: &Environment,
    reporter: &Reporter,
    checker: &Arc<Checker>,
    pkgpaths: &BTreeSet<Pkgpath>,
    result: &mut CheckResult,
) -> Result<()> {
    let mut update_conf: BTreeSet<Pkgpath> = BTreeSet::new();
    if args.update {
        // Snapshot the installed set to PKGCHK_UPDATE_CONF so that a
        // failed update can resume without losing deleted packages.
        let conf_file = env.pkgchk_update_conf().await?.clone();
        if conf_file.exists() {
            msg!(reporter, "Merging in previous {conf_file}");
            update_conf = Config::load(&conf_file)?.all_pkgpaths();
        }
        update_conf.extend(env.installed_pkgpaths().await?.iter().cloned());

        if !args.dry_run && !args.list_ver_diffs {
            let mut text = String::new();
            for path in &update_conf {
                text.push_str(&format!("{path}\n"));
            }
            std::fs::write(&conf_file, text)
                .with_context(|| format!("Failed to write {conf_file}"))?;
        }
    }

    if args.delete_mismatched || args.update {
        if !result.mismatch_todo.is_empty() {
            delete_pkgs(args, env, reporter, checker, result).await?;
            msg!(reporter, "Rechecking packages after deletions");
        }
        let mut recheck_paths = pkgpaths.clone();
        if args.update {
            recheck_paths.extend(update_conf);
        }
        if args.add_missing || args.update {
            *result = Arc::clone(checker).run(recheck_paths).await?;
        }
    }
    Ok(())
}

async fn delete_pkgs(
    args: &Args,
    env: &Environment,
    reporter: &Reporter,
    checker: &Arc<Checker>,
    result: &CheckResult,
) -> Result<()> {
    let pkg_info = env.pkg_info().await?.to_owned();
    let pkg_delete = env.pkg_delete().await?.to_owned();
    for name in result.mismatch_todo.keys() {
        if pkgdb::is_pkg_installed(&pkg_info, &name.to_string()).await? {
            let deleted = run_cmd_su(
                args,
                env,
                reporter,
                &pkg_delete,
                &["-r".to_owned(), name.to_string()],
                true,
                &[],
            )
            .await?;
            if deleted && !args.dry_run && !args.list_ver_diffs {
                checker.mark_as_deleted(name.clone());
            }
        }
    }
    Ok(())
}

async fn try_fetch(
    args: &Args,
    env: &Environment,
    reporter: &Reporter,
    path: &Pkgpath,
) -> Result<bool> {
    let pkgdir = path.dir_under(env.pkgsrcdir().await?);
    let cmd = format!("{BMAKE} -C {pkgdir} fetch-list | {}", pkgward::harness::SHELL);
    run_cmd(args, reporter, &cmd, &[], true, None, &[]).await
}

async fn try_install(
    args: &Args,
    env: &Environment,
    reporter: &Reporter,
    name: &Pkgname,
    path: &Pkgpath,
) -> Result<bool> {
    let (use_binary, build_from_source) = binary_and_source(args);
    let pkg_info = env.pkg_info().await?.to_owned();

    if pkgdb::is_pkg_installed(&pkg_info, &name.to_string()).await? {
        // A dependency pulled it in already; it is now wanted in its own
        // right.
        msg!(reporter, "{name} was installed in a previous stage");
        let pkg_admin = env.pkg_admin().await?.to_owned();
        return run_cmd_su(
            args,
            env,
            reporter,
            &pkg_admin,
            &["unset".to_owned(), "automatic".to_owned(), name.to_string()],
            true,
            &[],
        )
        .await;
    }

    if use_binary && env.is_binary_available(name).await? {
        let pkg_add = env.pkg_add().await?.to_owned();
        let file = env
            .binary_package_file_of(name)
            .await?
            .expect("available binary package has a file");
        // pkg_add is the one consumer that wants the captured PKG_PATH
        // back.
        let mut extra_env = Vec::new();
        if !env.pkg_path().is_empty() {
            extra_env.push(("PKG_PATH".to_owned(), env.pkg_path().to_owned()));
        }
        return run_cmd_su(
            args,
            env,
            reporter,
            &pkg_add,
            &[file.to_string()],
            true,
            &extra_env,
        )
        .await;
    }

    if build_from_source {
        let pkgdir = path.dir_under(env.pkgsrcdir().await?);
        let target = if args.no_clean {
            "NOCLEAN=yes"
        } else {
            "CLEANDEPENDS=yes"
        };
        return run_cmd(
            args,
            reporter,
            BMAKE,
            &["update".to_owned(), target.to_owned()],
            true,
            Some(&pkgdir),
            &[],
        )
        .await;
    }

    Ok(false)
}

async fn generate_conf_from_installed(env: &Environment, reporter: &Reporter) -> Result<()> {
    let file = env.pkgchk_conf().await?.clone();
    verbose_msg!(reporter, "Write {file} based on installed packages");

    if file.exists() {
        let old = Utf8PathBuf::from(format!("{file}.old"));
        std::fs::rename(&file, &old).with_context(|| format!("Failed to rename {file}"))?;
    }

    let mut conf = Config::new();
    for path in env.installed_pkgpaths().await? {
        conf.push(Definition::Pkg(PkgDef {
            path: path.clone(),
            patterns_or: Vec::new(),
        }));
    }

    let text = format!(
        "# Generated automatically at {}\n{conf}",
        timestamp("[year]-[month]-[day] [hour]:[minute]:[second]")
    );
    std::fs::write(&file, text).with_context(|| format!("Failed to write {file}"))?;
    Ok(())
}

async fn lookup_todo(env: &Environment) -> Result<()> {
    let pkgsrcdir = env.pkgsrcdir().await?;
    let todo = TodoFile::load(&pkgsrcdir.join("doc/TODO"))?;

    // Python-variant packages are announced under their generic py- name.
    let python_prefix = Regex::new("^py[0-9]+-").expect("static regex");

    for name in env.installed_pkgnames().await? {
        let base = Pkgbase::from(
            python_prefix
                .replace(name.base.as_str(), "py-")
                .into_owned(),
        );
        if let Some(entry) = todo.get(&base) {
            if entry.comment.is_empty() {
                println!("{base}: {}", entry.name);
            } else {
                println!("{base}: {} {}", entry.name, entry.comment);
            }
        }
    }
    Ok(())
}

async fn list_bin_pkgs(env: &Environment, reporter: &Reporter) -> Result<()> {
    let pkg_sufx = env.pkg_sufx().await?.to_owned();
    let summary = env.bin_pkg_summary().await?;
    let pkg_map = env.bin_pkg_map().await?;
    let conf = Config::load(env.pkgchk_conf().await?)?;
    let (included, excluded) = env.tags().await?;

    let mut to_list: BTreeMap<Pkgname, Pkgvars> = BTreeMap::new();
    let mut topology: DepGraph<Pkgname> = DepGraph::new();

    for path in conf.pkgpaths(included, excluded) {
        match pkg_map.get(&path) {
            Some(pkgbases) => {
                // Every base this PKGPATH provides gets its latest binary
                // package listed.
                for sub in pkgbases.values() {
                    if let Some((latest, vars)) = sub.iter().next_back() {
                        to_list.insert(latest.clone(), vars.clone());
                    }
                }
            }
            None => {
                reporter.fatal_later(format_args!("{path} - no binary package found"));
            }
        }
    }

    // Chase DEPENDS through the summary until the dependency closure is in
    // the graph.
    while !to_list.is_empty() {
        for name in to_list.keys() {
            topology.add_vertex(name.clone());
        }

        let mut scheduled: BTreeMap<Pkgname, Pkgvars> = BTreeMap::new();
        for (name, vars) in &to_list {
            verbose_msg!(reporter, "{}: {name}", vars.pkgpath);
            for dep_pattern in &vars.depends {
                match dep_pattern.best(&**summary) {
                    Some(dep) => {
                        verbose_msg!(reporter, "    depends on {dep_pattern}: {dep}");
                        if !topology.has_vertex(dep) {
                            scheduled.insert(dep.clone(), summary[dep].clone());
                        }
                        topology.add_edge(name, dep);
                    }
                    None => {
                        verbose_msg!(reporter, "    depends on {dep_pattern}: (nothing matches)");
                        reporter.fatal_later(format_args!(
                            "{name}: missing dependency {dep_pattern}"
                        ));
                    }
                }
            }
        }
        to_list = scheduled;
    }

    match topology.tsort(false) {
        Ok(sorted) => {
            for name in sorted {
                println!("{name}{pkg_sufx}");
            }
            Ok(())
        }
        Err(cycle) => bail!("{cycle}"),
    }
}
