//! Composite description - `lattice.json`
//!
//! ```json
//! {
//!   "settings": { "max_workers": 4, "failure_policy": "abort-all" },
//!   "builds": {
//!     "lib": {
//!       "tasks": {
//!         "jar": { "command": "make jar", "inputs": ["src"], "outputs": ["out/lib.jar"] }
//!       }
//!     },
//!     "app": {
//!       "root": "apps/main",
//!       "tasks": {
//!         "compile": { "command": "make", "requires": [{ "build": "lib", "tasks": ["jar"] }] },
//!         "test": { "command": "make test", "depends_on": ["compile"] }
//!       }
//!     }
//!   }
//! }
//! ```

use lattice_core::{
    BuildDefinition, ComponentArtifact, FailurePolicy, ResourceSpec, SchedulerConfig, TaskDefinition,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::runner::CommandAction;

#[derive(Debug, Error)]
pub enum CompositeError {
    #[error("no composite description at {0:?}")]
    NotFound(PathBuf),

    #[error("cannot read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid composite description {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Per-composite overrides of the machine-wide scheduler config
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub max_workers: Option<usize>,
    pub failure_policy: Option<FailurePolicy>,
    pub state_dir: Option<PathBuf>,
}

impl Settings {
    pub fn apply(&self, mut config: SchedulerConfig) -> SchedulerConfig {
        if let Some(max_workers) = self.max_workers {
            config.max_workers = max_workers;
        }
        if let Some(policy) = self.failure_policy {
            config.failure_policy = policy;
        }
        if let Some(dir) = &self.state_dir {
            config.state_dir = Some(dir.clone());
        }
        config
    }
}

#[derive(Debug, Deserialize)]
pub struct CompositeFile {
    #[serde(default)]
    pub settings: Settings,
    pub builds: BTreeMap<String, BuildFile>,
}

#[derive(Debug, Deserialize)]
pub struct BuildFile {
    /// Defaults to a directory named after the build
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TaskFile {
    pub command: Option<String>,
    pub depends_on: Vec<String>,
    pub inputs: Vec<ResourceEntry>,
    pub outputs: Vec<ResourceEntry>,
    pub requires: Vec<Requirement>,
}

/// A bare path or glob string, or a full resource with normalization
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ResourceEntry {
    Simple(String),
    Detailed(ResourceSpec),
}

impl ResourceEntry {
    pub fn to_spec(&self) -> ResourceSpec {
        match self {
            ResourceEntry::Simple(s) if s.contains(['*', '?', '[']) => ResourceSpec::glob(s.clone()),
            ResourceEntry::Simple(s) => ResourceSpec::path(s),
            ResourceEntry::Detailed(spec) => spec.clone(),
        }
    }
}

/// Another build's artifact a task consumes
#[derive(Debug, Clone, Deserialize)]
pub struct Requirement {
    pub build: String,
    pub tasks: Vec<String>,
    #[serde(default)]
    pub artifact: Option<String>,
}

impl Requirement {
    pub fn to_artifact(&self) -> ComponentArtifact {
        let name = self.artifact.clone().unwrap_or_else(|| self.tasks.join("+"));
        ComponentArtifact::cross_build(self.build.as_str(), name, self.tasks.iter().cloned())
    }
}

/// A loaded composite and the directory it lives in
#[derive(Debug)]
pub struct Composite {
    pub path: PathBuf,
    pub root: PathBuf,
    pub file: CompositeFile,
}

impl Composite {
    pub fn load(path: &Path) -> Result<Self, CompositeError> {
        if !path.exists() {
            return Err(CompositeError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| CompositeError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: CompositeFile = serde_json::from_str(&content).map_err(|source| CompositeError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let root = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self {
            path: path.to_path_buf(),
            root,
            file,
        })
    }

    /// Machine-wide config with this composite's settings applied
    pub fn config(&self, base: SchedulerConfig) -> SchedulerConfig {
        self.file.settings.apply(base)
    }

    pub fn build_root(&self, name: &str, build: &BuildFile) -> PathBuf {
        match &build.root {
            Some(root) if root.is_absolute() => root.clone(),
            Some(root) => self.root.join(root),
            None => self.root.join(name),
        }
    }

    /// Build definitions whose tasks run shell commands
    pub fn build_definitions(&self) -> Vec<BuildDefinition> {
        self.file
            .builds
            .iter()
            .map(|(name, build)| {
                let mut definition = BuildDefinition::new(name.as_str(), self.build_root(name, build));
                for (task_name, task) in &build.tasks {
                    let action = CommandAction::new(task.command.clone());
                    let mut def = TaskDefinition::with_action(task_name.as_str(), Arc::new(action));
                    def.depends_on = task.depends_on.clone();
                    def.inputs = task.inputs.iter().map(ResourceEntry::to_spec).collect();
                    def.outputs = task.outputs.iter().map(ResourceEntry::to_spec).collect();
                    def.requires = task.requires.iter().map(Requirement::to_artifact).collect();
                    definition = definition.task(def);
                }
                definition
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::snapshot::{ContentNormalization, ResourceLocation};
    use tempfile::TempDir;

    const SAMPLE: &str = r#"{
        "settings": { "failure_policy": "abort-all" },
        "builds": {
            "lib": {
                "tasks": {
                    "jar": {
                        "command": "make jar",
                        "inputs": ["src", "gen/**/*.java",
                                   { "location": { "path": "VERSION" },
                                     "normalization": { "content": "ignore-line-endings" } }],
                        "outputs": ["out/lib.jar"]
                    }
                }
            },
            "app": {
                "root": "apps/main",
                "tasks": {
                    "compile": { "command": "make", "requires": [{ "build": "lib", "tasks": ["jar"] }] },
                    "test": { "command": "make test", "depends_on": ["compile"] }
                }
            }
        }
    }"#;

    fn load() -> (TempDir, Composite) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lattice.json");
        std::fs::write(&path, SAMPLE).unwrap();
        let composite = Composite::load(&path).unwrap();
        (dir, composite)
    }

    #[test]
    fn test_load_resolves_roots_and_resources() {
        let (dir, composite) = load();
        let builds = composite.build_definitions();
        assert_eq!(builds.len(), 2);

        let app = builds.iter().find(|b| b.id.name() == "app").unwrap();
        assert_eq!(app.root, dir.path().join("apps/main"));
        assert_eq!(app.get("test").unwrap().depends_on, vec!["compile".to_string()]);
        assert_eq!(
            app.get("compile").unwrap().requires,
            vec![ComponentArtifact::cross_build("lib", "jar", ["jar"])]
        );

        let lib = builds.iter().find(|b| b.id.name() == "lib").unwrap();
        assert_eq!(lib.root, dir.path().join("lib"));
        let jar = lib.get("jar").unwrap();
        assert_eq!(jar.inputs[0].location, ResourceLocation::Path("src".into()));
        assert_eq!(jar.inputs[1].location, ResourceLocation::Glob("gen/**/*.java".into()));
        assert_eq!(jar.inputs[2].normalization.content, ContentNormalization::IgnoreLineEndings);
    }

    #[test]
    fn test_settings_override_base_config() {
        let (_dir, composite) = load();
        let base = SchedulerConfig {
            max_workers: 3,
            ..SchedulerConfig::default()
        };
        let config = composite.config(base);
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.failure_policy, FailurePolicy::AbortAll);
    }

    #[test]
    fn test_requirement_becomes_cross_build_artifact() {
        let req = Requirement {
            build: "lib".into(),
            tasks: vec!["jar".into(), "sources".into()],
            artifact: None,
        };
        let artifact = req.to_artifact();
        assert_eq!(artifact.producing_build().map(|b| b.name()), Some("lib"));
        assert_eq!(artifact.name(), "jar+sources");
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = Composite::load(&dir.path().join("lattice.json")).unwrap_err();
        assert!(matches!(err, CompositeError::NotFound(_)));
    }
}
