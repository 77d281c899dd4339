//! Cross-Build Task Graph Coordinator
//!
//! Features:
//! - `add_task` enqueues a task of another build, at most once per invocation
//! - `await_completion` parks until the task is terminal, handing the
//!   caller's worker lease back to the pool meanwhile
//! - Cycles are rejected before they can deadlock: the request chain is
//!   checked on `add_task`, parked waits are checked on `await_completion`
//! - Up-to-date tasks are marked UP_TO_DATE without running their action
//! - Panicking actions are recorded as failures, never lost
//!
//! Callers should `add_task` every member of a task set before awaiting any
//! of them, so independent tasks can run in parallel.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, info, warn};

use crate::artifact::{ArtifactBuilder, ComponentArtifact};
use crate::build::{BuildDefinition, TaskContext, TaskDefinition};
use crate::config::{FailurePolicy, SchedulerConfig};
use crate::error::{BuildDefinitionError, CoordinatorError, FailureCause, SnapshotError, TaskFailure};
use crate::executor::{BuildExecutor, LocalExecutor, TaskWork};
use crate::hasher::Blake3Hasher;
use crate::identity::{BuildIdentifier, CrossBuildEdge, TaskReference};
use crate::lease::{WorkerLease, WorkerPool};
use crate::registry::{TaskRegistry, TaskState, TaskStatus};
use crate::scope::{ExecutionScope, RequestChain, WaitGraph, EXECUTION_SCOPE};
use crate::snapshot::{self, SnapshotHasher, TaskSnapshot};
use crate::store::{MemorySnapshotStore, SnapshotStore};
use crate::uptodate::{Decision, RunReason, UpToDateEvaluator};

struct Inner {
    builds: HashMap<BuildIdentifier, BuildDefinition>,
    executors: HashMap<BuildIdentifier, Arc<dyn BuildExecutor>>,
    registry: TaskRegistry,
    evaluator: UpToDateEvaluator,
    hasher: Arc<dyn SnapshotHasher>,
    pool: WorkerPool,
    waits: WaitGraph,
    policy: FailurePolicy,
    /// First failure of the invocation, latched under `AbortAll`
    aborted: OnceLock<Arc<TaskFailure>>,
}

/// Shared handle to one build invocation's scheduler
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

/// Assembles a `Coordinator` from its builds and collaborators
pub struct CoordinatorBuilder {
    config: SchedulerConfig,
    builds: Vec<BuildDefinition>,
    executors: HashMap<BuildIdentifier, Arc<dyn BuildExecutor>>,
    store: Option<Arc<dyn SnapshotStore>>,
    hasher: Option<Arc<dyn SnapshotHasher>>,
}

impl CoordinatorBuilder {
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.config.max_workers = max_workers;
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.failure_policy = policy;
        self
    }

    pub fn add_build(mut self, build: BuildDefinition) -> Self {
        self.builds.push(build);
        self
    }

    /// Replace the default `LocalExecutor` of one build
    pub fn executor(mut self, build: impl Into<BuildIdentifier>, executor: Arc<dyn BuildExecutor>) -> Self {
        self.executors.insert(build.into(), executor);
        self
    }

    /// Persisted previous-execution state; in-memory when not set
    pub fn store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn hasher(mut self, hasher: Arc<dyn SnapshotHasher>) -> Self {
        self.hasher = Some(hasher);
        self
    }

    pub fn build(self) -> Result<Coordinator, BuildDefinitionError> {
        let mut builds = HashMap::new();
        for build in self.builds {
            if build.id.is_root() {
                return Err(BuildDefinitionError::Reserved(build.id));
            }
            build.validate()?;
            if builds.contains_key(&build.id) {
                return Err(BuildDefinitionError::Duplicate(build.id));
            }
            builds.insert(build.id.clone(), build);
        }

        let mut executors = self.executors;
        for id in builds.keys() {
            executors
                .entry(id.clone())
                .or_insert_with(|| Arc::new(LocalExecutor::new(id.clone())));
        }

        let hasher = self.hasher.unwrap_or_else(|| Arc::new(Blake3Hasher::new()));
        let store = self.store.unwrap_or_else(|| Arc::new(MemorySnapshotStore::new()));

        debug!(
            builds = builds.len(),
            max_workers = self.config.max_workers,
            policy = ?self.config.failure_policy,
            "coordinator ready"
        );

        Ok(Coordinator {
            inner: Arc::new(Inner {
                builds,
                executors,
                registry: TaskRegistry::new(),
                evaluator: UpToDateEvaluator::new(store, Arc::clone(&hasher)),
                hasher,
                pool: WorkerPool::new(self.config.max_workers),
                waits: WaitGraph::new(),
                policy: self.config.failure_policy,
                aborted: OnceLock::new(),
            }),
        })
    }
}

impl Coordinator {
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder {
            config: SchedulerConfig::default(),
            builds: Vec::new(),
            executors: HashMap::new(),
            store: None,
            hasher: None,
        }
    }

    /// Request `target:name` on behalf of `requesting`. Never blocks.
    ///
    /// The first request moves the task to QUEUED and submits it to the
    /// target build's executor; later requests only record the requester.
    pub fn add_task(
        &self,
        requesting: &BuildIdentifier,
        target: &BuildIdentifier,
        name: &str,
    ) -> Result<(), CoordinatorError> {
        if requesting == target {
            return Err(CoordinatorError::SelfReference {
                build: target.clone(),
                task: name.to_string(),
            });
        }

        let task = TaskReference::new(target.clone(), name);
        self.definition(&task)?;

        let scope = ExecutionScope::current();
        let chain = scope.as_ref().map(|s| s.chain.clone()).unwrap_or_default();
        if let (Some(cycle), Some(scope)) = (chain.cycle_through(&task), &scope) {
            // Only a cycle if the earlier request is really parked on this one;
            // a finished task, or one that merely enqueued us, waits on nothing
            let pending = self
                .inner
                .registry
                .get(&task)
                .is_some_and(|record| !record.state().is_terminal());
            if pending && self.inner.waits.waits_on(&task, &scope.task) {
                warn!(task = %task, "cross-build request closes a cycle");
                return Err(CoordinatorError::CyclicBuildDependency { chain: cycle });
            }
        }

        let edge = CrossBuildEdge {
            requesting: requesting.clone(),
            target: task.clone(),
        };
        debug!(edge = %edge, "cross-build request");
        self.inner.registry.record_request(&task, requesting);

        self.schedule(&task, chain.push(task.clone()));
        Ok(())
    }

    /// Park until `target:name` is terminal.
    ///
    /// Returns UP_TO_DATE or SUCCEEDED; a FAILED task yields the failure
    /// recorded on it, the same `Arc` for every caller.
    pub async fn await_completion(&self, target: &BuildIdentifier, name: &str) -> Result<TaskState, CoordinatorError> {
        let task = TaskReference::new(target.clone(), name);
        let record = self
            .inner
            .registry
            .get(&task)
            .ok_or_else(|| CoordinatorError::NotRequested(task.clone()))?;

        let status = if record.state().is_terminal() {
            record.status()
        } else {
            match ExecutionScope::current() {
                Some(scope) => {
                    let _edge = self
                        .inner
                        .waits
                        .insert(&scope.task, &task)
                        .map_err(|chain| CoordinatorError::CyclicBuildDependency { chain })?;
                    self.park(&scope.lease, record.wait_for_terminal()).await?
                }
                None => record.wait_for_terminal().await,
            }
        };

        match status.state {
            TaskState::Failed => match status.failure {
                Some(failure) => {
                    debug!(task = %task, origin = %failure.origin(), "awaited task failed");
                    Err(CoordinatorError::TaskFailed(failure))
                }
                None => Err(CoordinatorError::TaskFailed(TaskFailure::new(
                    task,
                    FailureCause::Panicked("failed without a recorded cause".to_string()),
                ))),
            },
            state => Ok(state),
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    pub fn policy(&self) -> FailurePolicy {
        self.inner.policy
    }

    pub fn build_definition(&self, id: &BuildIdentifier) -> Option<&BuildDefinition> {
        self.inner.builds.get(id)
    }

    pub fn builds(&self) -> impl Iterator<Item = &BuildDefinition> {
        self.inner.builds.values()
    }

    /// The first failure, once the invocation has been aborted
    pub fn aborted(&self) -> Option<&Arc<TaskFailure>> {
        self.inner.aborted.get()
    }

    fn definition(&self, task: &TaskReference) -> Result<&TaskDefinition, CoordinatorError> {
        let build = self
            .inner
            .builds
            .get(&task.build)
            .ok_or_else(|| CoordinatorError::UnknownBuild(task.build.clone()))?;
        build
            .get(&task.task)
            .ok_or_else(|| CoordinatorError::UnknownTask(task.clone()))
    }

    /// NOT_SCHEDULED -> QUEUED and submit, exactly once per task
    fn schedule(&self, task: &TaskReference, chain: RequestChain) {
        if !self
            .inner
            .registry
            .transition(task, &[TaskState::NotScheduled], TaskState::Queued)
        {
            return;
        }

        let Some(executor) = self.inner.executors.get(&task.build) else {
            // Unreachable for validated builds; keep the record terminal anyway
            let failure = TaskFailure::new(
                task.clone(),
                FailureCause::Execution(anyhow::Error::new(CoordinatorError::UnknownBuild(task.build.clone()))),
            );
            self.inner.registry.fail(task, &[TaskState::Queued], failure);
            return;
        };

        let work: TaskWork = Box::pin(self.clone().run(task.clone(), chain));
        executor.submit(task.clone(), work);
    }

    /// Wait without holding a worker slot. Dropping this future mid-wait
    /// still gives the slot back to its owner.
    async fn park<F>(&self, lease: &Arc<WorkerLease>, wait: F) -> Result<TaskStatus, CoordinatorError>
    where
        F: std::future::Future<Output = TaskStatus>,
    {
        let parked = lease.park();
        let status = wait.await;
        parked.resume().await.map_err(|_| CoordinatorError::PoolClosed)?;
        Ok(status)
    }

    /// Produce the artifacts a task declares before its up-to-date check
    async fn resolve_requires(
        &self,
        task: &TaskReference,
        scope: ExecutionScope,
        requires: &[ComponentArtifact],
    ) -> Result<(), FailureCause> {
        if requires.is_empty() {
            return Ok(());
        }
        let builder = ArtifactBuilder::new(self.clone());
        let resolve = async {
            for artifact in requires {
                builder.build(&task.build, artifact).await?;
            }
            Ok::<_, CoordinatorError>(())
        };
        match EXECUTION_SCOPE.scope(scope, resolve).await {
            Ok(()) => Ok(()),
            Err(CoordinatorError::TaskFailed(failure)) => Err(FailureCause::DependencyFailed(failure)),
            Err(e) => Err(FailureCause::Execution(e.into())),
        }
    }

    fn fail(&self, task: &TaskReference, from: TaskState, cause: FailureCause) {
        let failure = TaskFailure::new(task.clone(), cause);
        if self.inner.policy == FailurePolicy::AbortAll && self.inner.aborted.set(Arc::clone(&failure)).is_ok() {
            warn!(task = %task, "aborting invocation after first failure");
        }
        if self.inner.registry.fail(task, &[from], Arc::clone(&failure)) {
            error!(task = %task, "{}", failure.cause);
        }
    }

    fn check_aborted(&self, task: &TaskReference) -> bool {
        match self.inner.aborted.get() {
            Some(first) => {
                self.fail(task, TaskState::Queued, FailureCause::Aborted(Arc::clone(first)));
                true
            }
            None => false,
        }
    }

    async fn capture(
        &self,
        definition: &TaskDefinition,
        root: PathBuf,
        outputs_only: bool,
    ) -> Result<TaskSnapshot, SnapshotError> {
        let hasher = Arc::clone(&self.inner.hasher);
        let inputs = if outputs_only { Vec::new() } else { definition.inputs.clone() };
        let outputs = definition.outputs.clone();
        tokio::task::spawn_blocking(move || snapshot::capture(hasher.as_ref(), &root, &inputs, &outputs))
            .await
            .map_err(|e| SnapshotError::Worker(e.to_string()))?
    }

    /// The whole life of one task after it was queued
    async fn run(self, task: TaskReference, chain: RequestChain) {
        let (definition, root) = match self.definition(&task) {
            Ok(definition) => match self.inner.builds.get(&task.build) {
                Some(build) => (definition.clone(), build.root.clone()),
                None => return,
            },
            Err(e) => {
                self.fail(&task, TaskState::Queued, FailureCause::Execution(e.into()));
                return;
            }
        };

        if self.check_aborted(&task) {
            return;
        }

        // Same-build dependencies first, without holding a worker
        let deps: Vec<_> = definition
            .depends_on
            .iter()
            .map(|dep| TaskReference::new(task.build.clone(), dep.clone()))
            .collect();
        for dep in &deps {
            self.inner.registry.record_request(dep, &task.build);
            self.schedule(dep, chain.push(dep.clone()));
        }
        for dep in &deps {
            let status = {
                let _edge = match self.inner.waits.insert(&task, dep) {
                    Ok(edge) => edge,
                    Err(cycle) => {
                        let err = CoordinatorError::CyclicBuildDependency { chain: cycle };
                        self.fail(&task, TaskState::Queued, FailureCause::Execution(err.into()));
                        return;
                    }
                };
                self.inner.registry.get_or_create(dep).wait_for_terminal().await
            };
            if status.state == TaskState::Failed {
                let cause = match status.failure {
                    Some(failure) => FailureCause::DependencyFailed(failure),
                    None => FailureCause::Panicked(format!("dependency {dep} failed without a recorded cause")),
                };
                self.fail(&task, TaskState::Queued, cause);
                return;
            }
        }

        let lease = match self.inner.pool.acquire().await {
            Ok(lease) => Arc::new(lease),
            Err(_) => {
                self.fail(&task, TaskState::Queued, FailureCause::Execution(CoordinatorError::PoolClosed.into()));
                return;
            }
        };
        if self.check_aborted(&task) {
            return;
        }

        // Cross-build inputs must be current before they are snapshotted
        let scope = ExecutionScope {
            task: task.clone(),
            chain: chain.clone(),
            lease: Arc::clone(&lease),
        };
        if let Err(cause) = self.resolve_requires(&task, scope, &definition.requires).await {
            drop(lease);
            self.fail(&task, TaskState::Queued, cause);
            return;
        }
        if self.check_aborted(&task) {
            return;
        }

        let (current, decision) = match self.capture(&definition, root.clone(), false).await {
            Ok(current) => {
                let decision = self.inner.evaluator.decide(&task, &current);
                (Some(current), decision)
            }
            Err(e) => {
                warn!(task = %task, error = %e, "cannot snapshot task resources");
                (None, Decision::Run(RunReason::SnapshotUnavailable(e.to_string())))
            }
        };
        let reason = match decision {
            Decision::Skip => {
                drop(lease);
                if self
                    .inner
                    .registry
                    .transition(&task, &[TaskState::Queued], TaskState::UpToDate)
                {
                    info!(task = %task, "UP-TO-DATE");
                }
                return;
            }
            Decision::Run(reason) => reason,
        };

        if !self
            .inner
            .registry
            .transition(&task, &[TaskState::Queued], TaskState::Executing)
        {
            return;
        }
        info!(task = %task, reason = %reason, "executing");

        let ctx = TaskContext::new(task.clone(), root.clone(), self.clone());
        let scope = ExecutionScope {
            task: task.clone(),
            chain,
            lease: Arc::clone(&lease),
        };
        let action = definition.action.execute(ctx);
        let outcome = match tokio::spawn(EXECUTION_SCOPE.scope(scope, action)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(FailureCause::Execution(e)),
            Err(e) if e.is_panic() => Err(FailureCause::Panicked(panic_message(e.into_panic()))),
            Err(e) => Err(FailureCause::Panicked(e.to_string())),
        };

        match outcome {
            Ok(()) => {
                // Inputs as they were consumed, outputs as they were produced
                match (current, self.capture(&definition, root, true).await) {
                    (Some(before), Ok(mut after)) => {
                        after.inputs = before.inputs;
                        self.inner.evaluator.record(&task, &after);
                    }
                    (None, _) => self.inner.evaluator.forget(&task),
                    (_, Err(e)) => {
                        warn!(task = %task, error = %e, "cannot snapshot outputs; task will run next time");
                        self.inner.evaluator.forget(&task);
                    }
                }
                drop(lease);
                if self
                    .inner
                    .registry
                    .transition(&task, &[TaskState::Executing], TaskState::Succeeded)
                {
                    info!(task = %task, "SUCCEEDED");
                }
            }
            Err(cause) => {
                // Partial outputs must not count as up to date next time
                self.inner.evaluator.forget(&task);
                drop(lease);
                self.fail(&task, TaskState::Executing, cause);
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("builds", &self.inner.builds.len())
            .field("tasks", &self.inner.registry.len())
            .field("policy", &self.inner.policy)
            .finish_non_exhaustive()
    }
}
