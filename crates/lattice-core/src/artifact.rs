//! Composite Artifact Builder
//!
//! Turns "I need this artifact" into the coordinator's two-phase protocol:
//! request every producing task, then await every one of them.

use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

use crate::coordinator::Coordinator;
use crate::error::CoordinatorError;
use crate::identity::BuildIdentifier;

/// An artifact as seen by its consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentArtifact {
    /// Produced by the consumer's own build (or not built at all)
    Local { name: String },
    /// Produced by tasks of another build in the composite
    CrossBuild {
        build: BuildIdentifier,
        name: String,
        tasks: BTreeSet<String>,
    },
}

impl ComponentArtifact {
    pub fn local(name: impl Into<String>) -> Self {
        ComponentArtifact::Local { name: name.into() }
    }

    pub fn cross_build<I, S>(build: impl Into<BuildIdentifier>, name: impl Into<String>, tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ComponentArtifact::CrossBuild {
            build: build.into(),
            name: name.into(),
            tasks: tasks.into_iter().map(Into::into).collect(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ComponentArtifact::Local { name } | ComponentArtifact::CrossBuild { name, .. } => name,
        }
    }

    /// Owning build, for artifacts with cross-build provenance
    pub fn producing_build(&self) -> Option<&BuildIdentifier> {
        match self {
            ComponentArtifact::CrossBuild { build, .. } => Some(build),
            ComponentArtifact::Local { .. } => None,
        }
    }
}

impl fmt::Display for ComponentArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentArtifact::Local { name } => f.write_str(name),
            ComponentArtifact::CrossBuild { build, name, .. } => write!(f, "{build}:{name}"),
        }
    }
}

pub struct ArtifactBuilder {
    coordinator: Coordinator,
}

impl ArtifactBuilder {
    pub fn new(coordinator: Coordinator) -> Self {
        Self { coordinator }
    }

    /// Make sure every task producing `artifact` is terminal. Once this
    /// returns normally the artifact's outputs are on disk (or unchanged).
    pub async fn build(&self, requesting: &BuildIdentifier, artifact: &ComponentArtifact) -> Result<(), CoordinatorError> {
        let (build, tasks) = match artifact {
            ComponentArtifact::Local { .. } => return Ok(()),
            ComponentArtifact::CrossBuild { build, .. } if build == requesting => {
                debug!(artifact = %artifact, "artifact belongs to the requesting build; nothing to schedule");
                return Ok(());
            }
            ComponentArtifact::CrossBuild { build, tasks, .. } => (build, tasks),
        };

        debug!(artifact = %artifact, requesting = %requesting, tasks = tasks.len(), "building cross-build artifact");

        // Enqueue all, then await all
        for task in tasks {
            self.coordinator.add_task(requesting, build, task)?;
        }
        for task in tasks {
            self.coordinator.await_completion(build, task).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{BuildDefinition, TaskDefinition};

    fn coordinator() -> Coordinator {
        Coordinator::builder()
            .add_build(
                BuildDefinition::new("lib", "/work/lib")
                    .task(TaskDefinition::noop("compile"))
                    .task(TaskDefinition::noop("jar").depends_on("compile")),
            )
            .add_build(BuildDefinition::new("app", "/work/app").task(TaskDefinition::noop("run")))
            .build()
            .unwrap()
    }

    #[test]
    fn test_task_set_is_deduplicated() {
        let artifact = ComponentArtifact::cross_build("lib", "lib.jar", ["jar", "compile", "jar"]);
        match artifact {
            ComponentArtifact::CrossBuild { tasks, .. } => assert_eq!(tasks.len(), 2),
            ComponentArtifact::Local { .. } => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_local_artifact_is_a_no_op() {
        let coordinator = coordinator();
        let builder = ArtifactBuilder::new(coordinator.clone());
        builder
            .build(&"app".into(), &ComponentArtifact::local("classes"))
            .await
            .unwrap();
        assert!(coordinator.registry().is_empty());
    }

    #[tokio::test]
    async fn test_same_build_artifact_is_a_no_op() {
        let coordinator = coordinator();
        let builder = ArtifactBuilder::new(coordinator.clone());
        let artifact = ComponentArtifact::cross_build("lib", "lib.jar", ["jar"]);
        builder.build(&"lib".into(), &artifact).await.unwrap();
        assert!(coordinator.registry().is_empty());
    }

    #[tokio::test]
    async fn test_cross_build_artifact_runs_producers() {
        let coordinator = coordinator();
        let builder = ArtifactBuilder::new(coordinator.clone());
        let artifact = ComponentArtifact::cross_build("lib", "lib.jar", ["jar"]);
        builder.build(&"app".into(), &artifact).await.unwrap();

        let states: Vec<_> = coordinator
            .registry()
            .summary()
            .into_iter()
            .map(|(task, state)| (task.to_string(), state))
            .collect();
        assert_eq!(
            states,
            vec![
                ("lib:compile".to_string(), crate::registry::TaskState::Succeeded),
                ("lib:jar".to_string(), crate::registry::TaskState::Succeeded),
            ]
        );
    }
}
