//! Normalized snapshots of task inputs and outputs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::error::SnapshotError;

/// Hex-encoded content hash
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub String);

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One hashed, path-normalized resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NormalizedSnapshot {
    pub normalized_path: String,
    pub content_hash: ContentHash,
}

impl NormalizedSnapshot {
    pub fn new(normalized_path: impl Into<String>, content_hash: ContentHash) -> Self {
        Self {
            normalized_path: normalized_path.into(),
            content_hash,
        }
    }
}

/// How much of a file's location takes part in the snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PathNormalization {
    Absolute,
    /// Relative to the owning build's root
    #[default]
    Relative,
    NameOnly,
    Ignore,
}

/// What variation in file contents is irrelevant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentNormalization {
    #[default]
    Exact,
    IgnoreLineEndings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NormalizationStrategy {
    #[serde(default)]
    pub path: PathNormalization,
    #[serde(default)]
    pub content: ContentNormalization,
}

impl NormalizationStrategy {
    pub fn new(path: PathNormalization, content: ContentNormalization) -> Self {
        Self { path, content }
    }

    /// Normalize `file` (absolute) found under build `root`
    pub fn normalize_path(&self, root: &Path, file: &Path) -> String {
        let display = |p: &Path| p.to_string_lossy().replace('\\', "/");
        match self.path {
            PathNormalization::Absolute => display(file),
            PathNormalization::Relative => match file.strip_prefix(root) {
                Ok(rel) => display(rel),
                Err(_) => display(file),
            },
            PathNormalization::NameOnly => file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            PathNormalization::Ignore => String::new(),
        }
    }

    /// Bytes that actually get hashed
    pub fn normalize_content<'a>(&self, content: &'a [u8]) -> std::borrow::Cow<'a, [u8]> {
        match self.content {
            ContentNormalization::Exact => std::borrow::Cow::Borrowed(content),
            ContentNormalization::IgnoreLineEndings => {
                if !content.contains(&b'\r') {
                    return std::borrow::Cow::Borrowed(content);
                }
                let mut out = Vec::with_capacity(content.len());
                let mut iter = content.iter().peekable();
                while let Some(&b) = iter.next() {
                    if b == b'\r' {
                        // CRLF and lone CR both become LF
                        if iter.peek() == Some(&&b'\n') {
                            iter.next();
                        }
                        out.push(b'\n');
                    } else {
                        out.push(b);
                    }
                }
                std::borrow::Cow::Owned(out)
            }
        }
    }
}

/// Where a resource lives, relative to its build root unless absolute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceLocation {
    /// A file or a directory (walked recursively)
    Path(PathBuf),
    /// A glob pattern
    Glob(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub location: ResourceLocation,
    #[serde(default)]
    pub normalization: NormalizationStrategy,
}

impl ResourceSpec {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self {
            location: ResourceLocation::Path(path.into()),
            normalization: NormalizationStrategy::default(),
        }
    }

    pub fn glob(pattern: impl Into<String>) -> Self {
        Self {
            location: ResourceLocation::Glob(pattern.into()),
            normalization: NormalizationStrategy::default(),
        }
    }

    pub fn with_normalization(mut self, normalization: NormalizationStrategy) -> Self {
        self.normalization = normalization;
        self
    }
}

/// Cheap modification marker for an output file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub len: u64,
    pub modified_secs: u64,
    pub modified_nanos: u32,
}

impl Fingerprint {
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .unwrap_or_default();
        Self {
            len: meta.len(),
            modified_secs: modified.as_secs(),
            modified_nanos: modified.subsec_nanos(),
        }
    }
}

/// Full snapshot of one task: inputs, outputs and output fingerprints
///
/// `inputs` and `outputs` are sorted multisets. Two files that normalize
/// to the same path and hash (e.g. under `PathNormalization::Ignore`) are
/// both kept, so adding or removing one of them is still a change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub inputs: Vec<NormalizedSnapshot>,
    pub outputs: Vec<NormalizedSnapshot>,
    #[serde(default)]
    pub output_fingerprints: BTreeMap<PathBuf, Fingerprint>,
}

impl TaskSnapshot {
    pub fn new(
        inputs: impl IntoIterator<Item = NormalizedSnapshot>,
        outputs: impl IntoIterator<Item = NormalizedSnapshot>,
    ) -> Self {
        let mut snapshot = Self {
            inputs: inputs.into_iter().collect(),
            outputs: outputs.into_iter().collect(),
            output_fingerprints: BTreeMap::new(),
        };
        snapshot.sort();
        snapshot
    }

    fn sort(&mut self) {
        self.inputs.sort();
        self.outputs.sort();
    }
}

/// Snapshot Hash Provider
pub trait SnapshotHasher: Send + Sync {
    /// Hash every file the resource resolves to under `root`. A resource
    /// that resolves to nothing yields an empty list.
    fn hash(&self, root: &Path, resource: &ResourceSpec) -> Result<Vec<NormalizedSnapshot>, SnapshotError>;

    /// Files the resource currently resolves to
    fn resolve(&self, root: &Path, resource: &ResourceSpec) -> Result<Vec<PathBuf>, SnapshotError>;

    /// Modification marker for `path`; `None` when it no longer exists
    fn fingerprint(&self, path: &Path) -> Result<Option<Fingerprint>, SnapshotError>;
}

/// Snapshot a task's declared resources
pub fn capture(
    hasher: &dyn SnapshotHasher,
    root: &Path,
    inputs: &[ResourceSpec],
    outputs: &[ResourceSpec],
) -> Result<TaskSnapshot, SnapshotError> {
    let mut snapshot = TaskSnapshot::default();
    for resource in inputs {
        snapshot.inputs.extend(hasher.hash(root, resource)?);
    }
    for resource in outputs {
        snapshot.outputs.extend(hasher.hash(root, resource)?);
        for file in hasher.resolve(root, resource)? {
            if let Some(fp) = hasher.fingerprint(&file)? {
                snapshot.output_fingerprints.insert(file, fp);
            }
        }
    }
    snapshot.sort();
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_normalization() {
        let root = Path::new("/work/lib");
        let file = Path::new("/work/lib/src/main.rs");

        let strat = |p| NormalizationStrategy::new(p, ContentNormalization::Exact);
        assert_eq!(strat(PathNormalization::Relative).normalize_path(root, file), "src/main.rs");
        assert_eq!(strat(PathNormalization::Absolute).normalize_path(root, file), "/work/lib/src/main.rs");
        assert_eq!(strat(PathNormalization::NameOnly).normalize_path(root, file), "main.rs");
        assert_eq!(strat(PathNormalization::Ignore).normalize_path(root, file), "");
    }

    #[test]
    fn test_ignore_line_endings() {
        let strat = NormalizationStrategy::new(PathNormalization::Relative, ContentNormalization::IgnoreLineEndings);
        assert_eq!(&*strat.normalize_content(b"a\r\nb\rc\n"), b"a\nb\nc\n");
        assert_eq!(&*strat.normalize_content(b"plain\n"), b"plain\n");

        let exact = NormalizationStrategy::default();
        assert_eq!(&*exact.normalize_content(b"a\r\n"), b"a\r\n");
    }

    #[test]
    fn test_snapshot_is_order_independent() {
        let a = NormalizedSnapshot::new("a", ContentHash("1".into()));
        let b = NormalizedSnapshot::new("b", ContentHash("2".into()));
        let one = TaskSnapshot::new(vec![a.clone(), b.clone()], vec![]);
        let two = TaskSnapshot::new(vec![b, a], vec![]);
        assert_eq!(one, two);
    }

    #[test]
    fn test_duplicate_entries_are_kept() {
        let same = NormalizedSnapshot::new("", ContentHash("h".into()));
        let one = TaskSnapshot::new(vec![same.clone()], vec![]);
        let two = TaskSnapshot::new(vec![same.clone(), same], vec![]);
        assert_eq!(two.inputs.len(), 2);
        assert_ne!(one, two);
    }

    #[test]
    fn test_resource_spec_serde() {
        let spec: ResourceSpec =
            serde_json::from_str(r#"{"location":{"glob":"src/**/*.rs"},"normalization":{"content":"ignore-line-endings"}}"#)
                .unwrap();
        assert_eq!(spec.location, ResourceLocation::Glob("src/**/*.rs".into()));
        assert_eq!(spec.normalization.path, PathNormalization::Relative);
        assert_eq!(spec.normalization.content, ContentNormalization::IgnoreLineEndings);
    }
}
