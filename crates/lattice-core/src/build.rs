//! Build Definitions - one build graph of a composite and its tasks
//!
//! Each build owns a set of tasks with same-build `depends_on` edges. The
//! local graph is validated with petgraph when the build is registered;
//! ordering is then enforced at run time through the task registry.

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use crate::artifact::{ArtifactBuilder, ComponentArtifact};
use crate::coordinator::Coordinator;
use crate::error::{BuildDefinitionError, CoordinatorError};
use crate::identity::{BuildIdentifier, TaskReference};
use crate::snapshot::ResourceSpec;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// The work a task performs when it is not up to date
pub trait TaskAction: Send + Sync {
    fn execute(&self, ctx: TaskContext) -> BoxFuture<anyhow::Result<()>>;
}

impl<F, Fut> TaskAction for F
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn execute(&self, ctx: TaskContext) -> BoxFuture<anyhow::Result<()>> {
        Box::pin(self(ctx))
    }
}

/// Synchronous action run on Tokio's blocking pool
pub struct BlockingAction<F>(Arc<F>);

impl<F> TaskAction for BlockingAction<F>
where
    F: Fn(&TaskContext) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn execute(&self, ctx: TaskContext) -> BoxFuture<anyhow::Result<()>> {
        let f = Arc::clone(&self.0);
        Box::pin(async move {
            match tokio::task::spawn_blocking(move || f(&ctx)).await {
                Ok(result) => result,
                // Keep panics as panics so they are reported as such
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => Err(anyhow::anyhow!("blocking action was cancelled: {e}")),
            }
        })
    }
}

/// Wrap a synchronous closure as a `TaskAction`
pub fn blocking<F>(f: F) -> BlockingAction<F>
where
    F: Fn(&TaskContext) -> anyhow::Result<()> + Send + Sync + 'static,
{
    BlockingAction(Arc::new(f))
}

/// Handed to an action for the duration of one execution
#[derive(Clone)]
pub struct TaskContext {
    task: TaskReference,
    root: PathBuf,
    coordinator: Coordinator,
}

impl TaskContext {
    pub(crate) fn new(task: TaskReference, root: PathBuf, coordinator: Coordinator) -> Self {
        Self { task, root, coordinator }
    }

    pub fn task(&self) -> &TaskReference {
        &self.task
    }

    pub fn build(&self) -> &BuildIdentifier {
        &self.task.build
    }

    /// Root directory of the owning build
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Make sure another build's artifact is produced before continuing
    pub async fn build_artifact(&self, artifact: &ComponentArtifact) -> Result<(), CoordinatorError> {
        ArtifactBuilder::new(self.coordinator.clone())
            .build(&self.task.build, artifact)
            .await
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("task", &self.task)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

/// A task of one build
#[derive(Clone)]
pub struct TaskDefinition {
    pub name: String,
    pub depends_on: Vec<String>,
    pub inputs: Vec<ResourceSpec>,
    pub outputs: Vec<ResourceSpec>,
    /// Artifacts of other builds, produced before this task's up-to-date check
    pub requires: Vec<ComponentArtifact>,
    pub action: Arc<dyn TaskAction>,
}

impl TaskDefinition {
    pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::with_action(name, Arc::new(action))
    }

    pub fn with_action(name: impl Into<String>, action: Arc<dyn TaskAction>) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            requires: Vec::new(),
            action,
        }
    }

    /// A task with nothing to do beyond ordering (a lifecycle task)
    pub fn noop(name: impl Into<String>) -> Self {
        Self::new(name, |_ctx| async { anyhow::Ok(()) })
    }

    pub fn depends_on(mut self, task: impl Into<String>) -> Self {
        self.depends_on.push(task.into());
        self
    }

    pub fn input(mut self, resource: ResourceSpec) -> Self {
        self.inputs.push(resource);
        self
    }

    pub fn output(mut self, resource: ResourceSpec) -> Self {
        self.outputs.push(resource);
        self
    }

    pub fn requires(mut self, artifact: ComponentArtifact) -> Self {
        self.requires.push(artifact);
        self
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("requires", &self.requires)
            .finish_non_exhaustive()
    }
}

/// One independently configured build graph
#[derive(Debug, Clone)]
pub struct BuildDefinition {
    pub id: BuildIdentifier,
    pub root: PathBuf,
    tasks: BTreeMap<String, TaskDefinition>,
}

impl BuildDefinition {
    pub fn new(id: impl Into<BuildIdentifier>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
            tasks: BTreeMap::new(),
        }
    }

    /// Add a task, replacing one with the same name
    pub fn task(mut self, task: TaskDefinition) -> Self {
        self.tasks.insert(task.name.clone(), task);
        self
    }

    pub fn get(&self, name: &str) -> Option<&TaskDefinition> {
        self.tasks.get(name)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskDefinition> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn local_graph(&self) -> Result<DiGraphMap<&str, ()>, BuildDefinitionError> {
        // Edge direction: dependency -> dependent
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for name in self.tasks.keys() {
            graph.add_node(name.as_str());
        }
        for task in self.tasks.values() {
            for dep in &task.depends_on {
                if !self.tasks.contains_key(dep) {
                    return Err(BuildDefinitionError::UnknownDependency {
                        build: self.id.clone(),
                        task: task.name.clone(),
                        dependency: dep.clone(),
                    });
                }
                graph.add_edge(dep.as_str(), task.name.as_str(), ());
            }
        }
        Ok(graph)
    }

    /// Check the local task graph: known dependencies, no cycles
    pub fn validate(&self) -> Result<(), BuildDefinitionError> {
        self.execution_order().map(|_| ())
    }

    /// Task names with every dependency before its dependents
    pub fn execution_order(&self) -> Result<Vec<String>, BuildDefinitionError> {
        let graph = self.local_graph()?;
        match toposort(&graph, None) {
            Ok(order) => Ok(order.into_iter().map(str::to_string).collect()),
            Err(cycle) => Err(BuildDefinitionError::LocalCycle {
                build: self.id.clone(),
                task: cycle.node_id().to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build() -> BuildDefinition {
        BuildDefinition::new("lib", "/work/lib")
            .task(TaskDefinition::noop("compile"))
            .task(TaskDefinition::noop("jar").depends_on("compile"))
            .task(TaskDefinition::noop("assemble").depends_on("jar").depends_on("compile"))
    }

    #[test]
    fn test_execution_order_respects_dependencies() {
        let order = build().execution_order().unwrap();
        let pos = |n: &str| order.iter().position(|t| t == n).unwrap();
        assert!(pos("compile") < pos("jar"));
        assert!(pos("jar") < pos("assemble"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let build = build().task(TaskDefinition::noop("test").depends_on("classes"));
        let err = build.validate().unwrap_err();
        assert!(matches!(
            err,
            BuildDefinitionError::UnknownDependency { ref dependency, .. } if dependency == "classes"
        ));
    }

    #[test]
    fn test_local_cycle_rejected() {
        let build = BuildDefinition::new("lib", "/work/lib")
            .task(TaskDefinition::noop("a").depends_on("b"))
            .task(TaskDefinition::noop("b").depends_on("a"));
        assert!(matches!(build.validate(), Err(BuildDefinitionError::LocalCycle { .. })));
    }

    #[tokio::test]
    async fn test_blocking_action_runs_closure() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let action = blocking(move |ctx: &TaskContext| {
            assert_eq!(ctx.task().task, "jar");
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let coordinator = Coordinator::builder().build().unwrap();
        let ctx = TaskContext::new(TaskReference::parse("lib:jar").unwrap(), "/work/lib".into(), coordinator);
        action.execute(ctx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
