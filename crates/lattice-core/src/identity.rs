//! Identifiers - builds and the tasks they own

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identifies one build graph inside a composite
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct BuildIdentifier(Arc<str>);

impl BuildIdentifier {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// The top-level build driving a composite invocation
    pub fn root() -> Self {
        Self::new(":")
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        &*self.0 == ":"
    }
}

impl fmt::Display for BuildIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BuildIdentifier {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for BuildIdentifier {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl From<BuildIdentifier> for String {
    fn from(id: BuildIdentifier) -> Self {
        id.0.to_string()
    }
}

/// A schedulable unit anywhere in the composite: `(build, task name)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskReference {
    pub build: BuildIdentifier,
    pub task: String,
}

impl TaskReference {
    pub fn new(build: BuildIdentifier, task: impl Into<String>) -> Self {
        Self {
            build,
            task: task.into(),
        }
    }

    /// Parse `build:task`. The build part is everything before the last `:`.
    pub fn parse(s: &str) -> Option<Self> {
        let (build, task) = s.rsplit_once(':')?;
        if build.is_empty() || task.is_empty() {
            return None;
        }
        Some(Self::new(BuildIdentifier::new(build), task))
    }

    /// Key used by persisted stores
    pub fn storage_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.build.name().len() + self.task.len() + 1);
        key.extend_from_slice(self.build.name().as_bytes());
        key.push(0);
        key.extend_from_slice(self.task.as_bytes());
        key
    }
}

impl fmt::Display for TaskReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.build, self.task)
    }
}

/// A cross-build request, kept only while the request is being recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossBuildEdge {
    pub requesting: BuildIdentifier,
    pub target: TaskReference,
}

impl fmt::Display for CrossBuildEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.requesting, self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_task_reference() {
        let r = TaskReference::parse("lib:jar").unwrap();
        assert_eq!(r.build, BuildIdentifier::new("lib"));
        assert_eq!(r.task, "jar");

        let nested = TaskReference::parse("tools:codegen:generate").unwrap();
        assert_eq!(nested.build.name(), "tools:codegen");
        assert_eq!(nested.task, "generate");

        assert!(TaskReference::parse("jar").is_none());
        assert!(TaskReference::parse(":jar").is_none());
        assert!(TaskReference::parse("lib:").is_none());
    }

    #[test]
    fn test_task_reference_serializes_as_plain_strings() {
        let r = TaskReference::new("lib".into(), "jar");
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, r#"{"build":"lib","task":"jar"}"#);
        let back: TaskReference = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn test_storage_key_is_unambiguous() {
        let a = TaskReference::new("ab".into(), "c");
        let b = TaskReference::new("a".into(), "bc");
        assert_ne!(a.storage_key(), b.storage_key());
    }
}
