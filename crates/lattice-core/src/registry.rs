//! Task State Registry - one record per task per invocation
//!
//! Each record wraps a `tokio::sync::watch` channel: `send_if_modified`
//! gives an atomic compare-and-set on the state, and `wait_for` parks
//! waiters until a terminal state shows up. The map itself is only locked
//! to look up or create records, never across an execution.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::watch;
use tracing::debug;

use crate::error::TaskFailure;
use crate::identity::{BuildIdentifier, TaskReference};

/// Lifecycle of a task within one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    NotScheduled,
    Queued,
    Executing,
    UpToDate,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::UpToDate | TaskState::Succeeded | TaskState::Failed)
    }

    /// Transitions only ever move forward
    pub fn can_advance_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (NotScheduled, Queued)
                | (Queued, Executing)
                | (Queued, UpToDate)
                | (Queued, Failed)
                | (Executing, Succeeded)
                | (Executing, Failed)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskState::NotScheduled => "NOT-SCHEDULED",
            TaskState::Queued => "QUEUED",
            TaskState::Executing => "EXECUTING",
            TaskState::UpToDate => "UP-TO-DATE",
            TaskState::Succeeded => "SUCCEEDED",
            TaskState::Failed => "FAILED",
        })
    }
}

/// Current state plus the recorded cause once FAILED
#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub state: TaskState,
    pub failure: Option<Arc<TaskFailure>>,
}

impl TaskStatus {
    fn initial() -> Self {
        Self {
            state: TaskState::NotScheduled,
            failure: None,
        }
    }
}

/// Registry entry for one task
#[derive(Debug)]
pub struct TaskRecord {
    task: TaskReference,
    status: watch::Sender<TaskStatus>,
    requesters: Mutex<BTreeSet<BuildIdentifier>>,
}

impl TaskRecord {
    fn new(task: TaskReference) -> Self {
        let (status, _) = watch::channel(TaskStatus::initial());
        Self {
            task,
            status,
            requesters: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn task(&self) -> &TaskReference {
        &self.task
    }

    pub fn state(&self) -> TaskState {
        self.status.borrow().state
    }

    pub fn status(&self) -> TaskStatus {
        self.status.borrow().clone()
    }

    /// Builds that have asked for this task so far
    pub fn requesters(&self) -> Vec<BuildIdentifier> {
        self.requesters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn add_requester(&self, build: &BuildIdentifier) {
        self.requesters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(build.clone());
    }

    fn compare_and_set(
        &self,
        from: &[TaskState],
        to: TaskState,
        failure: Option<Arc<TaskFailure>>,
    ) -> bool {
        self.status.send_if_modified(|status| {
            if !from.contains(&status.state) || !status.state.can_advance_to(to) {
                return false;
            }
            status.state = to;
            status.failure = failure;
            true
        })
    }

    /// Park until the record is terminal; returns at once if it already is
    pub async fn wait_for_terminal(&self) -> TaskStatus {
        let mut rx = self.status.subscribe();
        let status = match rx.wait_for(|s| s.state.is_terminal()).await {
            Ok(status) => status.clone(),
            // The sender lives as long as `self`, so the channel cannot close here
            Err(_) => self.status(),
        };
        status
    }
}

/// Shared registry keyed by `TaskReference`
#[derive(Debug, Default)]
pub struct TaskRegistry {
    records: RwLock<HashMap<TaskReference, Arc<TaskRecord>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent, thread-safe creation
    pub fn get_or_create(&self, task: &TaskReference) -> Arc<TaskRecord> {
        if let Some(record) = self.get(task) {
            return record;
        }
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            records
                .entry(task.clone())
                .or_insert_with(|| Arc::new(TaskRecord::new(task.clone()))),
        )
    }

    pub fn get(&self, task: &TaskReference) -> Option<Arc<TaskRecord>> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task)
            .cloned()
    }

    /// Note that `requester` asked for `task`
    pub fn record_request(&self, task: &TaskReference, requester: &BuildIdentifier) -> Arc<TaskRecord> {
        let record = self.get_or_create(task);
        record.add_requester(requester);
        record
    }

    /// Compare-and-set. Returns false when the current state is not in
    /// `from`, meaning someone else already advanced the record.
    pub fn transition(&self, task: &TaskReference, from: &[TaskState], to: TaskState) -> bool {
        debug_assert!(to != TaskState::Failed, "use TaskRegistry::fail to record a failure");
        let record = self.get_or_create(task);
        let changed = record.compare_and_set(from, to, None);
        if changed {
            debug!(task = %task, state = ?to, "task state advanced");
        }
        changed
    }

    /// Move to FAILED carrying `failure` for every waiter
    pub fn fail(&self, task: &TaskReference, from: &[TaskState], failure: Arc<TaskFailure>) -> bool {
        let record = self.get_or_create(task);
        let changed = record.compare_and_set(from, TaskState::Failed, Some(failure));
        if changed {
            debug!(task = %task, "task state advanced to Failed");
        }
        changed
    }

    /// Block until `task` is terminal. `None` if the task was never created.
    pub async fn wait_for_terminal(&self, task: &TaskReference) -> Option<TaskStatus> {
        let record = self.get(task)?;
        Some(record.wait_for_terminal().await)
    }

    /// Every record and its current state, sorted by task
    pub fn summary(&self) -> Vec<(TaskReference, TaskState)> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = records
            .iter()
            .map(|(task, record)| (task.clone(), record.state()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
