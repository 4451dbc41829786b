//! Bub CLI - the planner/executor build engine host.

use std::path::Path;
use std::sync::atomic::Ordering;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use bub::builder::{cleaner, reports};
use bub::{Engine, Scheduler};

mod cli;

use cli::Cli;

fn main() {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let build_dir = match cli.build_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };

    if cli.clean {
        return clean_all(&build_dir);
    }

    init_logging(&cli);

    let engine = Engine::load(&build_dir)?;
    tracing::debug!(
        "loaded {} files, {} actions",
        engine.file_count(),
        engine.action_count()
    );

    cleaner::clean_stale(&engine)?;
    reports::emit_static_reports(&engine)?;

    let quiet_progress = cli.details || cli.actions || cli.culprit;
    let mut scheduler =
        Scheduler::new(engine, cli.jobs, cli.test).show_progress(!quiet_progress);

    let bail = scheduler.bail_flag();
    let killer = scheduler.killer_handle();
    ctrlc::set_handler(move || {
        eprintln!("interrupted; terminating workers");
        bail.store(true, Ordering::SeqCst);
        killer.bail("signal");
    })?;

    match scheduler.run() {
        Ok(outcome) => {
            reports::emit_package_depends(&scheduler.engine)?;
            if outcome.updated == 0 {
                eprintln!("Build up to date ({} action(s))", outcome.total);
            } else {
                eprintln!(
                    "Build succeeded: {} of {} action(s) updated",
                    outcome.updated, outcome.total
                );
            }
            Ok(0)
        }
        Err(e) => {
            eprintln!("{e:#}");
            Ok(1)
        }
    }
}

fn init_logging(cli: &Cli) {
    let mut filter = EnvFilter::new(if cli.details { "bub=debug" } else { "bub=info" });
    if cli.statements {
        filter = filter.add_directive("bub::statements=debug".parse().unwrap());
    }
    if cli.deps {
        filter = filter.add_directive("bub::deps=debug".parse().unwrap());
    }
    if cli.actions {
        filter = filter.add_directive("bub::actions=debug".parse().unwrap());
    }
    if cli.culprit {
        filter = filter.add_directive("bub::culprit=debug".parse().unwrap());
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}

/// `--clean`: remove everything the build produces.
fn clean_all(build_dir: &Path) -> Result<i32> {
    for dir in ["obj", "priv", "dist", "deps", "tmp"] {
        let path = build_dir.join(dir);
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
    }
    for file in [
        "compile_commands.json",
        "package-depends",
        "include-paths",
        "files-of-interest",
    ] {
        let path = build_dir.join(file);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
    }
    eprintln!("cleaned {}", build_dir.display());
    Ok(0)
}
