//! Request chains and blocking-wait bookkeeping for cycle detection
//!
//! Two complementary checks keep cross-build requests from deadlocking:
//!
//! - `RequestChain`: the tasks a logical request passed through to get
//!   here. It travels with the executing task in a `task_local!` scope, so
//!   checking it needs no shared state.
//! - `WaitGraph`: waiter -> target edges for every wait that is actually
//!   parked. It catches cycles whose halves were requested by different
//!   chains, and is only touched when a wait is about to block.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::identity::TaskReference;
use crate::lease::WorkerLease;

#[derive(Debug)]
struct ChainLink {
    task: TaskReference,
    parent: Option<Arc<ChainLink>>,
}

/// Immutable, cheaply cloned list of the tasks in one request chain
#[derive(Debug, Clone, Default)]
pub struct RequestChain {
    head: Option<Arc<ChainLink>>,
}

impl RequestChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new chain ending in `task`; `self` is left untouched
    pub fn push(&self, task: TaskReference) -> Self {
        Self {
            head: Some(Arc::new(ChainLink {
                task,
                parent: self.head.clone(),
            })),
        }
    }

    fn iter(&self) -> impl Iterator<Item = &TaskReference> {
        std::iter::successors(self.head.as_deref(), |link| link.parent.as_deref()).map(|link| &link.task)
    }

    pub fn contains(&self, task: &TaskReference) -> bool {
        self.iter().any(|t| t == task)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Oldest request first
    pub fn to_vec(&self) -> Vec<TaskReference> {
        let mut tasks: Vec<_> = self.iter().cloned().collect();
        tasks.reverse();
        tasks
    }

    /// The cycle closed by requesting `task` again: from its first
    /// appearance through the end of the chain, then `task` itself.
    pub fn cycle_through(&self, task: &TaskReference) -> Option<Vec<TaskReference>> {
        let tasks = self.to_vec();
        let start = tasks.iter().position(|t| t == task)?;
        let mut cycle = tasks[start..].to_vec();
        cycle.push(task.clone());
        Some(cycle)
    }
}

/// What the currently executing task carries with it
#[derive(Debug, Clone)]
pub(crate) struct ExecutionScope {
    pub(crate) task: TaskReference,
    pub(crate) chain: RequestChain,
    pub(crate) lease: Arc<WorkerLease>,
}

tokio::task_local! {
    pub(crate) static EXECUTION_SCOPE: ExecutionScope;
}

impl ExecutionScope {
    /// Scope of the task running on this logical thread, if any
    pub(crate) fn current() -> Option<ExecutionScope> {
        EXECUTION_SCOPE.try_with(Clone::clone).ok()
    }
}

/// Graph of in-flight blocking waits between tasks
#[derive(Debug, Default)]
pub struct WaitGraph {
    edges: Mutex<HashMap<TaskReference, Vec<TaskReference>>>,
}

impl WaitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `waiter` is about to park on `target`. Fails with the
    /// full cycle when `target` already (transitively) waits on `waiter`.
    pub fn insert(&self, waiter: &TaskReference, target: &TaskReference) -> Result<WaitEdge<'_>, Vec<TaskReference>> {
        let mut edges = self.edges.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(path) = find_path(&edges, target, waiter) {
            let mut cycle = Vec::with_capacity(path.len() + 1);
            cycle.push(waiter.clone());
            cycle.extend(path);
            return Err(cycle);
        }

        edges.entry(waiter.clone()).or_default().push(target.clone());
        debug!(waiter = %waiter, target = %target, "wait edge added");
        Ok(WaitEdge {
            graph: self,
            waiter: waiter.clone(),
            target: target.clone(),
        })
    }

    /// Whether `waiter` is currently parked, directly or transitively, on `target`
    pub fn waits_on(&self, waiter: &TaskReference, target: &TaskReference) -> bool {
        let edges = self.edges.lock().unwrap_or_else(PoisonError::into_inner);
        waiter != target && find_path(&edges, waiter, target).is_some()
    }

    fn remove(&self, waiter: &TaskReference, target: &TaskReference) {
        let mut edges = self.edges.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(targets) = edges.get_mut(waiter) {
            if let Some(pos) = targets.iter().position(|t| t == target) {
                targets.swap_remove(pos);
            }
            if targets.is_empty() {
                edges.remove(waiter);
            }
        }
    }

    /// Number of parked waits
    pub fn len(&self) -> usize {
        self.edges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Depth-first search for a path `from` ->* `to`, both ends included
fn find_path(
    edges: &HashMap<TaskReference, Vec<TaskReference>>,
    from: &TaskReference,
    to: &TaskReference,
) -> Option<Vec<TaskReference>> {
    let mut visited = HashSet::new();
    let mut path = vec![from.clone()];
    if dfs(edges, from, to, &mut visited, &mut path) {
        Some(path)
    } else {
        None
    }
}

fn dfs(
    edges: &HashMap<TaskReference, Vec<TaskReference>>,
    node: &TaskReference,
    to: &TaskReference,
    visited: &mut HashSet<TaskReference>,
    path: &mut Vec<TaskReference>,
) -> bool {
    if node == to {
        return true;
    }
    if !visited.insert(node.clone()) {
        return false;
    }
    for next in edges.get(node).into_iter().flatten() {
        path.push(next.clone());
        if dfs(edges, next, to, visited, path) {
            return true;
        }
        path.pop();
    }
    false
}

/// Removes its edge from the graph when the wait ends
#[derive(Debug)]
pub struct WaitEdge<'a> {
    graph: &'a WaitGraph,
    waiter: TaskReference,
    target: TaskReference,
}

impl Drop for WaitEdge<'_> {
    fn drop(&mut self) {
        self.graph.remove(&self.waiter, &self.target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(s: &str) -> TaskReference {
        TaskReference::parse(s).unwrap()
    }

    #[test]
    fn test_chain_push_is_persistent() {
        let root = RequestChain::new().push(task("a:x"));
        let left = root.push(task("b:y"));
        let right = root.push(task("c:z"));

        assert_eq!(root.len(), 1);
        assert!(left.contains(&task("a:x")));
        assert!(!left.contains(&task("c:z")));
        assert_eq!(right.to_vec(), vec![task("a:x"), task("c:z")]);
    }

    #[test]
    fn test_cycle_through_starts_at_first_repeat() {
        let chain = RequestChain::new()
            .push(task("app:run"))
            .push(task("a:x"))
            .push(task("b:y"));
        assert_eq!(
            chain.cycle_through(&task("a:x")),
            Some(vec![task("a:x"), task("b:y"), task("a:x")])
        );
        assert!(chain.cycle_through(&task("c:z")).is_none());
    }

    #[test]
    fn test_wait_graph_rejects_closing_edge() {
        let graph = WaitGraph::new();
        let _ab = graph.insert(&task("a:x"), &task("b:y")).unwrap();
        let _bc = graph.insert(&task("b:y"), &task("c:z")).unwrap();

        let cycle = graph.insert(&task("c:z"), &task("a:x")).unwrap_err();
        assert_eq!(cycle, vec![task("c:z"), task("a:x"), task("b:y"), task("c:z")]);
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn test_waits_on_follows_parked_edges() {
        let graph = WaitGraph::new();
        let _ab = graph.insert(&task("a:x"), &task("b:y")).unwrap();
        let _bc = graph.insert(&task("b:y"), &task("c:z")).unwrap();
        assert!(graph.waits_on(&task("a:x"), &task("c:z")));
        assert!(!graph.waits_on(&task("c:z"), &task("a:x")));
        assert!(!graph.waits_on(&task("a:x"), &task("a:x")));
    }

    #[test]
    fn test_wait_edge_removed_on_drop() {
        let graph = WaitGraph::new();
        {
            let _edge = graph.insert(&task("a:x"), &task("b:y")).unwrap();
            assert!(graph.insert(&task("b:y"), &task("a:x")).is_err());
        }
        assert!(graph.is_empty());
        assert!(graph.insert(&task("b:y"), &task("a:x")).is_ok());
    }

    #[tokio::test]
    async fn test_scope_visible_only_inside() {
        assert!(ExecutionScope::current().is_none());

        let pool = crate::lease::WorkerPool::new(1);
        let scope = ExecutionScope {
            task: task("a:x"),
            chain: RequestChain::new().push(task("a:x")),
            lease: Arc::new(pool.acquire().await.unwrap()),
        };
        let seen = EXECUTION_SCOPE
            .scope(scope, async { ExecutionScope::current().map(|s| s.task) })
            .await;
        assert_eq!(seen, Some(task("a:x")));
    }
}
