//! Virtual File System
//!
//! The kernel only ever needs one thing from a filesystem: turn an absolute
//! path into a file or a directory. Storage lives behind the `FileSystem`
//! trait so the tree backend can be swapped for anything that can resolve.
//!
//! Paths are `/`-delimited and walked component by component from the root.
//! Empty components (`//`, a trailing `/`) are skipped.

pub mod tree;

pub use tree::{SnapshotError, TreeFs};

use thiserror::Error;

/// The kind of node a path resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    File,
    Directory,
}

/// The set of node kinds a caller is willing to accept from `resolve`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeKinds {
    pub file: bool,
    pub directory: bool,
}

impl NodeKinds {
    pub const FILE: NodeKinds = NodeKinds {
        file: true,
        directory: false,
    };

    pub const DIRECTORY: NodeKinds = NodeKinds {
        file: false,
        directory: true,
    };

    pub const ANY: NodeKinds = NodeKinds {
        file: true,
        directory: true,
    };

    pub fn allows(&self, kind: NodeKind) -> bool {
        match kind {
            NodeKind::File => self.file,
            NodeKind::Directory => self.directory,
        }
    }
}

/// A successfully resolved node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// File contents
    File(String),
    /// Sorted names of the directory's entries
    Directory(Vec<String>),
}

impl Resolved {
    pub fn kind(&self) -> NodeKind {
        match self {
            Resolved::File(_) => NodeKind::File,
            Resolved::Directory(_) => NodeKind::Directory,
        }
    }
}

/// Filesystem errors. The wire codes are stable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("is a directory: {0}")]
    IsDirectory(String),
    #[error("is a file: {0}")]
    IsFile(String),
    /// The path was not absolute
    #[error("invalid path {0:?}: paths must start with '/'")]
    InvalidPath(String),
}

impl FsError {
    pub const NOT_FOUND: u8 = 1;
    pub const PERMISSION_DENIED: u8 = 2;
    pub const INVALID_OPERATION: u8 = 3;
    pub const IS_DIRECTORY: u8 = 4;
    pub const IS_FILE: u8 = 5;

    /// Numeric error code
    pub fn code(&self) -> u8 {
        match self {
            FsError::NotFound(_) => Self::NOT_FOUND,
            FsError::PermissionDenied(_) => Self::PERMISSION_DENIED,
            FsError::InvalidOperation(_) | FsError::InvalidPath(_) => Self::INVALID_OPERATION,
            FsError::IsDirectory(_) => Self::IS_DIRECTORY,
            FsError::IsFile(_) => Self::IS_FILE,
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;

/// The FileSystem trait - implement this for different backends
pub trait FileSystem {
    /// Resolve an absolute path to a node whose kind is in `allowed`.
    ///
    /// Fails with `NotFound` if a component is missing, `IsFile` if a
    /// non-terminal component is a file or a file was found where only a
    /// directory is allowed, and `IsDirectory` for the converse.
    fn resolve(&self, path: &str, allowed: NodeKinds) -> FsResult<Resolved>;
}

/// Convenience wrapper for reading a file's contents
pub fn read_to_string<F: FileSystem + ?Sized>(fs: &F, path: &str) -> FsResult<String> {
    match fs.resolve(path, NodeKinds::FILE)? {
        Resolved::File(content) => Ok(content),
        Resolved::Directory(_) => Err(FsError::IsDirectory(path.to_string())),
    }
}

/// Split an absolute path into its non-empty components
pub(crate) fn components(path: &str) -> FsResult<impl Iterator<Item = &str>> {
    if !path.starts_with('/') {
        return Err(FsError::InvalidPath(path.to_string()));
    }
    Ok(path.split('/').filter(|c| !c.is_empty()))
}
