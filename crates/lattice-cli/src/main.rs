//! Lattice CLI - Composite Build Scheduler
//!
//! Commands:
//! - lattice run <build:task>...  - Run tasks across the composite's builds
//! - lattice graph                - Show builds, tasks and cross-build requirements
//! - lattice clear-state          - Forget previous executions (everything re-runs)

mod composite;
mod logging;
mod runner;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use lattice_core::{
    load_config, BuildIdentifier, Coordinator, FailurePolicy, SledSnapshotStore, SnapshotStore, TaskReference,
    TaskState,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use composite::Composite;
use logging::LogLevel;

/// Lattice - composite build scheduler
#[derive(Parser)]
#[command(name = "lattice", version, about = "Composite build scheduler with up-to-date checks")]
struct Cli {
    /// Composite description
    #[arg(short = 'f', long, global = true, default_value = "lattice.json")]
    file: PathBuf,

    /// Log level (overrides LATTICE_LOG)
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tasks (e.g. lattice run app:test lib:jar)
    Run {
        /// Tasks as build:task
        #[arg(required = true)]
        tasks: Vec<String>,
        /// Size of the worker pool (default: config, else CPU cores)
        #[arg(short = 'j', long)]
        jobs: Option<usize>,
        /// Stop every task that has not started once one fails
        #[arg(long)]
        abort_all: bool,
    },
    /// Show builds, tasks and cross-build requirements
    Graph,
    /// Clear persisted task snapshots
    ClearState,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.log_level)?;

    let composite = Composite::load(&cli.file)?;

    match cli.command {
        Commands::Run { tasks, jobs, abort_all } => {
            if !run_tasks(&composite, &tasks, jobs, abort_all).await? {
                std::process::exit(1);
            }
        }
        Commands::Graph => show_graph(&composite)?,
        Commands::ClearState => clear_state(&composite)?,
    }

    Ok(())
}

/// Run the requested tasks; false when any of them failed
async fn run_tasks(composite: &Composite, tasks: &[String], jobs: Option<usize>, abort_all: bool) -> Result<bool> {
    let start = Instant::now();

    let mut targets = Vec::with_capacity(tasks.len());
    for task in tasks {
        match TaskReference::parse(task) {
            Some(target) => targets.push(target),
            None => bail!("invalid task '{task}', expected build:task"),
        }
    }

    let mut config = composite.config(load_config()?);
    if let Some(jobs) = jobs {
        config.max_workers = jobs;
    }
    if abort_all {
        config.failure_policy = FailurePolicy::AbortAll;
    }

    let store = SledSnapshotStore::open(config.state_dir_for(&composite.root))?;
    let mut builder = Coordinator::builder().config(config.clone()).store(Arc::new(store));
    for build in composite.build_definitions() {
        builder = builder.add_build(build);
    }
    let coordinator = builder.build()?;

    println!("🔨 lattice run {} ({} workers)", tasks.join(" "), config.max_workers);
    println!();

    // Request everything first so independent builds run in parallel
    let root = BuildIdentifier::root();
    for target in &targets {
        coordinator.add_task(&root, &target.build, &target.task)?;
    }

    let mut failed = 0;
    for target in &targets {
        match coordinator.await_completion(&target.build, &target.task).await {
            Ok(state) => println!("✓ {target} {state}"),
            Err(err) => {
                failed += 1;
                println!("❌ {err}");
                if let Some(failure) = err.task_failure() {
                    if failure.origin() != &failure.task {
                        println!("   • caused by {}", failure.origin());
                    }
                    if let Some(cycle) = failure.cycle() {
                        let chain: Vec<_> = cycle.iter().map(ToString::to_string).collect();
                        println!("   • cycle: {}", chain.join(" -> "));
                    }
                }
            }
        }
    }

    let summary = coordinator.registry().summary();
    let count = |state: TaskState| summary.iter().filter(|(_, s)| *s == state).count();
    let elapsed = start.elapsed();

    println!();
    if failed == 0 {
        println!(
            "✅ {} tasks: {} executed, {} up-to-date in {:?}",
            summary.len(),
            count(TaskState::Succeeded),
            count(TaskState::UpToDate),
            elapsed
        );
    } else {
        println!(
            "❌ {} executed, {} up-to-date, {} failed in {:?}",
            count(TaskState::Succeeded),
            count(TaskState::UpToDate),
            count(TaskState::Failed),
            elapsed
        );
    }

    Ok(failed == 0)
}

/// Show builds, their tasks in execution order and cross-build requirements
fn show_graph(composite: &Composite) -> Result<()> {
    println!("🕸️  Composite {}", composite.path.display());
    println!();

    for build in composite.build_definitions() {
        println!("📦 {} ({})", build.id, build.root.display());

        let order = match build.execution_order() {
            Ok(order) => order,
            Err(e) => {
                println!("   ⚠️  {e}");
                continue;
            }
        };

        for name in order {
            let Some(task) = build.get(&name) else { continue };
            let mut line = format!("   • {name}");
            if !task.depends_on.is_empty() {
                line.push_str(&format!(" ← {}", task.depends_on.join(", ")));
            }
            for artifact in &task.requires {
                line.push_str(&format!(" ⇐ {artifact}"));
            }
            println!("{line}");
        }
        println!();
    }

    Ok(())
}

fn clear_state(composite: &Composite) -> Result<()> {
    let config = composite.config(load_config()?);
    let store = SledSnapshotStore::open(config.state_dir_for(&composite.root))?;
    let count = store.len();
    let size = store.size_on_disk()?;
    store.clear()?;
    println!(
        "🗑️  Cleared {} task snapshots ({:.1} KB) from {}",
        count,
        size as f64 / 1024.0,
        store.path().display()
    );
    Ok(())
}
