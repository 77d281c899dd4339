//! Build-local executors
//!
//! The coordinator hands each build's executor a self-contained unit of
//! work. The work future itself drives the registry transitions and waits
//! for the build's own dependencies, so an executor only has to run it.

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info_span, Instrument};

use crate::build::BoxFuture;
use crate::identity::{BuildIdentifier, TaskReference};

/// Work future for one task; completes once the task is terminal
pub type TaskWork = BoxFuture<()>;

/// Schedules work for the tasks of one build
pub trait BuildExecutor: Send + Sync {
    fn submit(&self, task: TaskReference, work: TaskWork);
}

/// Default executor: each submission becomes a Tokio task.
///
/// Must be used from within a Tokio runtime.
#[derive(Debug)]
pub struct LocalExecutor {
    build: BuildIdentifier,
    submitted: AtomicUsize,
}

impl LocalExecutor {
    pub fn new(build: BuildIdentifier) -> Self {
        Self {
            build,
            submitted: AtomicUsize::new(0),
        }
    }

    pub fn build(&self) -> &BuildIdentifier {
        &self.build
    }

    /// Units of work submitted so far
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }
}

impl BuildExecutor for LocalExecutor {
    fn submit(&self, task: TaskReference, work: TaskWork) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        let span = info_span!("task", build = %task.build, task = %task.task);
        tokio::spawn(work.instrument(span));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_submit_runs_work() {
        let executor = LocalExecutor::new("lib".into());
        let (tx, rx) = oneshot::channel();
        executor.submit(
            TaskReference::parse("lib:jar").unwrap(),
            Box::pin(async move {
                let _ = tx.send(42);
            }),
        );
        assert_eq!(rx.await.unwrap(), 42);
        assert_eq!(executor.submitted(), 1);
    }
}
