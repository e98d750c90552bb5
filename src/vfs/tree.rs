//! In-memory tree filesystem
//!
//! A directory tree held entirely in memory, usually built from a JSON
//! snapshot. Snapshot keys are entry names prefixed with `$`; a string value
//! is a file, an object value is a directory:
//!
//! ```text
//! { "$boot": { "$init": "#!init" }, "$motd": "hello" }
//! ```

use super::{FileSystem, FsError, FsResult, NodeKinds, Resolved};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// A stored file or directory
#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    File(String),
    Directory(BTreeMap<String, Node>),
}

/// Errors from loading a snapshot or building a tree
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("snapshot root must be a JSON object")]
    RootNotDirectory,
    #[error("entry {0:?} is missing the '$' prefix")]
    MissingPrefix(String),
    #[error("entry {0:?} is neither a string nor an object")]
    InvalidNode(String),
    #[error(transparent)]
    Fs(#[from] FsError),
}

/// In-memory tree filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeFs {
    root: BTreeMap<String, Node>,
}

impl TreeFs {
    /// An empty filesystem (just `/`)
    pub fn new() -> Self {
        Self {
            root: BTreeMap::new(),
        }
    }

    /// Load a filesystem from snapshot JSON text
    pub fn from_json(json: &str) -> Result<Self, SnapshotError> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(&value)
    }

    /// Load a filesystem from an already parsed snapshot
    pub fn from_value(value: &Value) -> Result<Self, SnapshotError> {
        match value {
            Value::Object(map) => Ok(Self {
                root: Self::load_dir("", map)?,
            }),
            _ => Err(SnapshotError::RootNotDirectory),
        }
    }

    fn load_dir(
        prefix: &str,
        map: &Map<String, Value>,
    ) -> Result<BTreeMap<String, Node>, SnapshotError> {
        let mut entries = BTreeMap::new();
        for (key, value) in map {
            let path = format!("{}/{}", prefix, key.trim_start_matches('$'));
            let name = key
                .strip_prefix('$')
                .ok_or_else(|| SnapshotError::MissingPrefix(path.clone()))?;
            let node = match value {
                Value::String(content) => Node::File(content.clone()),
                Value::Object(children) => Node::Directory(Self::load_dir(&path, children)?),
                _ => return Err(SnapshotError::InvalidNode(path)),
            };
            entries.insert(name.to_string(), node);
        }
        Ok(entries)
    }

    /// Serialize back into snapshot form
    pub fn to_value(&self) -> Value {
        fn dump(entries: &BTreeMap<String, Node>) -> Value {
            let map = entries
                .iter()
                .map(|(name, node)| {
                    let value = match node {
                        Node::File(content) => Value::String(content.clone()),
                        Node::Directory(children) => dump(children),
                    };
                    (format!("${}", name), value)
                })
                .collect();
            Value::Object(map)
        }
        dump(&self.root)
    }

    /// Create a file, creating missing parent directories. Replaces an
    /// existing file at the same path.
    pub fn insert_file(&mut self, path: &str, content: impl Into<String>) -> FsResult<()> {
        let (parent, name) = Self::split_last(path)?;
        let dir = self.make_dirs(path, &parent)?;
        match dir.get(name) {
            Some(Node::Directory(_)) => Err(FsError::IsDirectory(path.to_string())),
            _ => {
                dir.insert(name.to_string(), Node::File(content.into()));
                Ok(())
            }
        }
    }

    /// Create a directory and any missing parents
    pub fn insert_dir(&mut self, path: &str) -> FsResult<()> {
        let parts: Vec<&str> = super::components(path)?.collect();
        self.make_dirs(path, &parts).map(|_| ())
    }

    fn split_last(path: &str) -> FsResult<(Vec<&str>, &str)> {
        let mut parts: Vec<&str> = super::components(path)?.collect();
        let name = parts
            .pop()
            .ok_or_else(|| FsError::InvalidOperation(path.to_string()))?;
        Ok((parts, name))
    }

    fn make_dirs(&mut self, path: &str, parts: &[&str]) -> FsResult<&mut BTreeMap<String, Node>> {
        let mut dir = &mut self.root;
        for part in parts {
            let node = dir
                .entry(part.to_string())
                .or_insert_with(|| Node::Directory(BTreeMap::new()));
            dir = match node {
                Node::Directory(children) => children,
                Node::File(_) => return Err(FsError::IsFile(path.to_string())),
            };
        }
        Ok(dir)
    }
}

impl Default for TreeFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for TreeFs {
    fn resolve(&self, path: &str, allowed: NodeKinds) -> FsResult<Resolved> {
        let mut dir = &self.root;
        let mut found: Option<&Node> = None;

        for part in super::components(path)? {
            if let Some(node) = found {
                dir = match node {
                    Node::Directory(children) => children,
                    Node::File(_) => return Err(FsError::IsFile(path.to_string())),
                };
            }
            found = Some(
                dir.get(part)
                    .ok_or_else(|| FsError::NotFound(path.to_string()))?,
            );
        }

        let resolved = match found {
            None => Resolved::Directory(self.root.keys().cloned().collect()),
            Some(Node::File(content)) => Resolved::File(content.clone()),
            Some(Node::Directory(children)) => {
                Resolved::Directory(children.keys().cloned().collect())
            }
        };

        if allowed.allows(resolved.kind()) {
            Ok(resolved)
        } else {
            match resolved {
                Resolved::File(_) => Err(FsError::IsFile(path.to_string())),
                Resolved::Directory(_) => Err(FsError::IsDirectory(path.to_string())),
            }
        }
    }
}
