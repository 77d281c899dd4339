//! Up-To-Date Evaluator - decides SKIP vs RUN
//!
//! The decision compares the previous recorded snapshot with the current
//! one, resource by resource, and then checks that no recorded output was
//! touched behind our back. Anything unexpected leans towards RUN.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use crate::identity::TaskReference;
use crate::snapshot::{ContentHash, NormalizedSnapshot, SnapshotHasher, TaskSnapshot};
use crate::store::SnapshotStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Skip,
    Run(RunReason),
}

impl Decision {
    pub fn is_skip(&self) -> bool {
        matches!(self, Decision::Skip)
    }
}

/// Why a task has to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReason {
    NoHistory,
    HistoryUnavailable(String),
    SnapshotUnavailable(String),
    InputAdded(String),
    InputRemoved(String),
    InputChanged(String),
    OutputAdded(String),
    OutputRemoved(String),
    OutputChanged(String),
    OutputModified(PathBuf),
}

impl fmt::Display for RunReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunReason::NoHistory => write!(f, "no previous execution recorded"),
            RunReason::HistoryUnavailable(e) => write!(f, "previous execution state unreadable: {e}"),
            RunReason::SnapshotUnavailable(e) => write!(f, "could not snapshot resources: {e}"),
            RunReason::InputAdded(p) => write!(f, "input '{p}' was added"),
            RunReason::InputRemoved(p) => write!(f, "input '{p}' was removed"),
            RunReason::InputChanged(p) => write!(f, "input '{p}' has changed"),
            RunReason::OutputAdded(p) => write!(f, "output '{p}' was added"),
            RunReason::OutputRemoved(p) => write!(f, "output '{p}' was removed"),
            RunReason::OutputChanged(p) => write!(f, "output '{p}' has changed"),
            RunReason::OutputModified(p) => write!(f, "output {p:?} was modified externally"),
        }
    }
}

#[derive(Clone, Copy)]
enum Side {
    Input,
    Output,
}

#[derive(Clone, Copy)]
enum Change {
    Added,
    Removed,
    Changed,
}

/// Normalized path -> every content hash recorded under it, sorted
fn index(snapshots: &[NormalizedSnapshot]) -> BTreeMap<&str, Vec<&ContentHash>> {
    let mut map: BTreeMap<&str, Vec<&ContentHash>> = BTreeMap::new();
    for snap in snapshots {
        map.entry(snap.normalized_path.as_str()).or_default().push(&snap.content_hash);
    }
    for hashes in map.values_mut() {
        hashes.sort();
    }
    map
}

/// First difference between two snapshot multisets, if any
fn diff(side: Side, previous: &[NormalizedSnapshot], current: &[NormalizedSnapshot]) -> Option<RunReason> {
    if previous == current {
        return None;
    }

    let before = index(previous);
    let after = index(current);
    let reason = |kind: Change, path: &str| {
        let path = path.to_string();
        match (side, kind) {
            (Side::Input, Change::Added) => RunReason::InputAdded(path),
            (Side::Input, Change::Removed) => RunReason::InputRemoved(path),
            (Side::Input, Change::Changed) => RunReason::InputChanged(path),
            (Side::Output, Change::Added) => RunReason::OutputAdded(path),
            (Side::Output, Change::Removed) => RunReason::OutputRemoved(path),
            (Side::Output, Change::Changed) => RunReason::OutputChanged(path),
        }
    };

    for (path, hashes) in &after {
        match before.get(path) {
            None => return Some(reason(Change::Added, *path)),
            Some(old) if old.len() < hashes.len() => return Some(reason(Change::Added, *path)),
            Some(old) if old.len() > hashes.len() => return Some(reason(Change::Removed, *path)),
            Some(old) if old != hashes => return Some(reason(Change::Changed, *path)),
            Some(_) => {}
        }
    }

    // Nothing was added or changed, so some path disappeared
    let removed = before
        .keys()
        .find(|path| !after.contains_key(*path))
        .copied()
        .unwrap_or_default();
    Some(reason(Change::Removed, removed))
}

/// Pure comparison of two snapshots, ignoring fingerprints
pub fn compare(previous: &TaskSnapshot, current: &TaskSnapshot) -> Decision {
    if let Some(reason) = diff(Side::Input, &previous.inputs, &current.inputs) {
        return Decision::Run(reason);
    }
    if let Some(reason) = diff(Side::Output, &previous.outputs, &current.outputs) {
        return Decision::Run(reason);
    }
    Decision::Skip
}

pub struct UpToDateEvaluator {
    store: Arc<dyn SnapshotStore>,
    files: Arc<dyn SnapshotHasher>,
}

impl UpToDateEvaluator {
    pub fn new(store: Arc<dyn SnapshotStore>, files: Arc<dyn SnapshotHasher>) -> Self {
        Self { store, files }
    }

    pub fn decide(&self, task: &TaskReference, current: &TaskSnapshot) -> Decision {
        let previous = match self.store.load(task) {
            Ok(Some(previous)) => previous,
            Ok(None) => return Decision::Run(RunReason::NoHistory),
            Err(e) => {
                warn!(task = %task, error = %e, "cannot load previous snapshot; task will run");
                return Decision::Run(RunReason::HistoryUnavailable(e.to_string()));
            }
        };

        let decision = compare(&previous, current);
        if !decision.is_skip() {
            return decision;
        }

        for (path, recorded) in &previous.output_fingerprints {
            match self.files.fingerprint(path) {
                Ok(Some(now)) if now == *recorded => {}
                Ok(_) => return Decision::Run(RunReason::OutputModified(path.clone())),
                Err(e) => {
                    warn!(task = %task, error = %e, "cannot fingerprint output; task will run");
                    return Decision::Run(RunReason::SnapshotUnavailable(e.to_string()));
                }
            }
        }

        Decision::Skip
    }

    /// Remember the post-execution snapshot for the next invocation
    pub fn record(&self, task: &TaskReference, snapshot: &TaskSnapshot) {
        if let Err(e) = self.store.store(task, snapshot) {
            warn!(task = %task, error = %e, "failed to store snapshot; task will run next time");
            self.forget(task);
        }
    }

    /// Drop history so the next invocation runs the task
    pub fn forget(&self, task: &TaskReference) {
        if let Err(e) = self.store.remove(task) {
            warn!(task = %task, error = %e, "failed to remove stale snapshot");
        }
    }
}
