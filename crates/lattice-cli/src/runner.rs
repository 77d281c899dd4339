//! Shell-command task actions
//!
//! Runs a task's command with `sh -c` (or `cmd /C`) in the build root.
//! Artifacts the task requires from other builds are already produced by
//! the time the action starts.

use anyhow::{bail, Context, Result};
use lattice_core::build::BoxFuture;
use lattice_core::{TaskAction, TaskContext};
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;
use tracing::info;

pub struct CommandAction {
    command: Option<Arc<str>>,
}

impl CommandAction {
    pub fn new(command: Option<String>) -> Self {
        Self {
            command: command.map(Arc::from),
        }
    }
}

impl TaskAction for CommandAction {
    fn execute(&self, ctx: TaskContext) -> BoxFuture<Result<()>> {
        let command = self.command.clone();

        Box::pin(async move {
            match command {
                Some(command) => run_command(&ctx, &command).await,
                None => Ok(()),
            }
        })
    }
}

async fn run_command(ctx: &TaskContext, command: &str) -> Result<()> {
    let start = Instant::now();

    // Use sh on Unix, cmd on Windows
    let (shell, shell_arg) = if cfg!(target_os = "windows") {
        ("cmd", "/C")
    } else {
        ("sh", "-c")
    };

    info!(command, root = ?ctx.root(), "running command");
    let output = Command::new(shell)
        .arg(shell_arg)
        .arg(command)
        .current_dir(ctx.root())
        .output()
        .await
        .with_context(|| format!("failed to spawn `{command}`"))?;

    let task = ctx.task();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        println!("[{task}] {line}");
    }
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        eprintln!("[{task}] {line}");
    }

    if !output.status.success() {
        match output.status.code() {
            Some(code) => bail!("`{command}` exited with code {code}"),
            None => bail!("`{command}` was terminated by a signal"),
        }
    }

    info!(duration_ms = start.elapsed().as_millis() as u64, "command finished");
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use lattice_core::{BuildDefinition, BuildIdentifier, Coordinator, TaskDefinition, TaskState};
    use tempfile::TempDir;

    fn coordinator(dir: &TempDir, command: &str) -> Coordinator {
        let action = CommandAction::new(Some(command.to_string()));
        Coordinator::builder()
            .add_build(
                BuildDefinition::new("lib", dir.path()).task(TaskDefinition::with_action("jar", Arc::new(action))),
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_command_runs_in_build_root() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(&dir, "echo built > out.txt");
        let lib = BuildIdentifier::new("lib");

        coordinator.add_task(&BuildIdentifier::root(), &lib, "jar").unwrap();
        let state = coordinator.await_completion(&lib, "jar").await.unwrap();
        assert_eq!(state, TaskState::Succeeded);
        assert_eq!(std::fs::read_to_string(dir.path().join("out.txt")).unwrap().trim(), "built");
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails_task() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(&dir, "exit 3");
        let lib = BuildIdentifier::new("lib");

        coordinator.add_task(&BuildIdentifier::root(), &lib, "jar").unwrap();
        let err = coordinator.await_completion(&lib, "jar").await.unwrap_err();
        assert!(err.to_string().contains("exited with code 3"), "{err}");
    }
}
