//! Error types for the composite scheduler
//!
//! A task failure is recorded once on its registry record as an
//! `Arc<TaskFailure>` and the same allocation is handed to every waiter.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::identity::{BuildIdentifier, TaskReference};

/// Errors surfaced by the cross-build coordinator
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("build {build} requested its own task '{task}' through the cross-build path")]
    SelfReference {
        build: BuildIdentifier,
        task: String,
    },

    #[error("cyclic dependency between builds: {}", format_chain(.chain))]
    CyclicBuildDependency { chain: Vec<TaskReference> },

    #[error("{0}")]
    TaskFailed(Arc<TaskFailure>),

    #[error("unknown build: {0}")]
    UnknownBuild(BuildIdentifier),

    #[error("build {} has no task named '{}'", .0.build, .0.task)]
    UnknownTask(TaskReference),

    #[error("task {0} was awaited before it was requested")]
    NotRequested(TaskReference),

    #[error("worker pool has been shut down")]
    PoolClosed,
}

impl CoordinatorError {
    /// The failure recorded for the awaited task, if that is what this is
    pub fn task_failure(&self) -> Option<&Arc<TaskFailure>> {
        match self {
            CoordinatorError::TaskFailed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Terminal cause recorded on a FAILED task
#[derive(Debug, Error)]
#[error("task {task} failed: {cause}")]
pub struct TaskFailure {
    pub task: TaskReference,
    pub cause: FailureCause,
}

#[derive(Debug, Error)]
pub enum FailureCause {
    #[error("{0:#}")]
    Execution(anyhow::Error),

    #[error("task action panicked: {0}")]
    Panicked(String),

    #[error("dependency {} did not complete", .0.task)]
    DependencyFailed(Arc<TaskFailure>),

    #[error("build aborted after {} failed", .0.task)]
    Aborted(Arc<TaskFailure>),
}

impl TaskFailure {
    pub fn new(task: TaskReference, cause: FailureCause) -> Arc<Self> {
        Arc::new(Self { task, cause })
    }

    /// Failures this one was caused by, innermost last
    fn upstream(&self) -> Option<&Arc<TaskFailure>> {
        match &self.cause {
            FailureCause::DependencyFailed(inner) | FailureCause::Aborted(inner) => Some(inner),
            FailureCause::Execution(err) => err
                .chain()
                .find_map(|e| e.downcast_ref::<CoordinatorError>())
                .and_then(CoordinatorError::task_failure),
            FailureCause::Panicked(_) => None,
        }
    }

    /// The task where this failure started
    pub fn origin(&self) -> &TaskReference {
        let mut current = self;
        while let Some(next) = current.upstream() {
            current = next.as_ref();
        }
        &current.task
    }

    /// The build cycle behind this failure, searching the whole causal chain
    pub fn cycle(&self) -> Option<&[TaskReference]> {
        let mut current = self;
        loop {
            if let FailureCause::Execution(err) = &current.cause {
                let cycle = err.chain().find_map(|e| match e.downcast_ref::<CoordinatorError>() {
                    Some(CoordinatorError::CyclicBuildDependency { chain }) => Some(chain.as_slice()),
                    _ => None,
                });
                if cycle.is_some() {
                    return cycle;
                }
            }
            current = current.upstream()?.as_ref();
        }
    }
}

/// Unable to compute a snapshot. Callers treat this as "must run".
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("cannot read {path:?}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid glob pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("snapshot worker failed: {0}")]
    Worker(String),
}

/// A build's own task graph is malformed
#[derive(Debug, Error)]
pub enum BuildDefinitionError {
    #[error("build {build}: task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency {
        build: BuildIdentifier,
        task: String,
        dependency: String,
    },

    #[error("build {build}: task '{task}' is part of a local dependency cycle")]
    LocalCycle { build: BuildIdentifier, task: String },

    #[error("build {0} is registered twice")]
    Duplicate(BuildIdentifier),

    #[error("build name '{0}' is reserved")]
    Reserved(BuildIdentifier),
}

/// Reading or writing scheduler configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot access config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn format_chain(chain: &[TaskReference]) -> String {
    chain
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn task(s: &str) -> TaskReference {
        TaskReference::parse(s).unwrap()
    }

    #[test]
    fn test_cycle_message_names_full_chain() {
        let err = CoordinatorError::CyclicBuildDependency {
            chain: vec![task("a:compile"), task("b:jar"), task("a:compile")],
        };
        assert_eq!(
            err.to_string(),
            "cyclic dependency between builds: a:compile -> b:jar -> a:compile"
        );
    }

    #[test]
    fn test_origin_follows_nested_failures() {
        let root = TaskFailure::new(task("b:jar"), FailureCause::Execution(anyhow!("javac exited 1")));
        let via_await = TaskFailure::new(
            task("a:compile"),
            FailureCause::Execution(anyhow::Error::new(CoordinatorError::TaskFailed(root.clone()))),
        );
        let dependent = TaskFailure::new(task("a:test"), FailureCause::DependencyFailed(via_await));

        assert_eq!(dependent.origin(), &task("b:jar"));
        assert!(dependent.cycle().is_none());
    }

    #[test]
    fn test_cycle_found_through_chain() {
        let chain = vec![task("a:x"), task("b:y"), task("a:x")];
        let inner = TaskFailure::new(
            task("b:y"),
            FailureCause::Execution(anyhow::Error::new(CoordinatorError::CyclicBuildDependency {
                chain: chain.clone(),
            })),
        );
        let outer = TaskFailure::new(
            task("a:x"),
            FailureCause::Execution(
                anyhow::Error::new(CoordinatorError::TaskFailed(inner)).context("resolving b artifacts"),
            ),
        );
        assert_eq!(outer.cycle(), Some(chain.as_slice()));
    }
}
