//! Defines the storage backend interface --- [`BackendFS`].
//!
//! Every exportable storage flavor (host directory, ZIP archive, SFTP
//! session) implements this trait, and the caching shim decorates any of
//! them. All paths crossing this boundary are virtual: absolute,
//! `/`-separated and already canonicalized by [`vpath::canonical`].

pub mod os;
pub mod sftp;
pub mod vpath;
pub mod zip;


use std::time::SystemTime;

use async_trait::async_trait;

/// Result of [`BackendFS`] operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Attribute names with required semantics across all backends.
pub const ATTR_MODTIME: &str = "modtime";
pub const ATTR_MODE: &str = "mode";
pub const ATTR_SIZE: &str = "size";

/// Common error taxonomy all backends translate their native errors into.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Operation disallowed by the backend (for example any mutation of a
    /// ZIP archive).
    #[error("permission denied")]
    Permission,
    /// The path does not name anything.
    #[error("no such file or directory")]
    NotExist,
    /// Unknown attribute, closed backend, or malformed argument.
    #[error("invalid argument")]
    Invalid,
    /// Creation attempted on an already-present path.
    #[error("file exists")]
    Exist,
    /// A file-only operation was applied to a directory.
    #[error("is a directory")]
    IsDir,
    /// Removal of a directory that still has entries.
    #[error("directory not empty")]
    NotEmpty,
    /// Any other backend failure.
    #[error("i/o error: {0}")]
    Io(String),
}

impl Error {
    /// Wrap a foreign error message into the catch-all kind.
    pub fn io(err: impl std::fmt::Display) -> Self {
        Error::Io(err.to_string())
    }
}

/// Snapshot of one directory entry or file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileMeta {
    /// Last path component.
    pub name: String,
    /// Size in bytes. Always 0 for directories.
    pub size: u64,
    /// Permission bits only; the type flag is carried by `is_directory`.
    pub mode: u32,
    /// Last modification timestamp.
    pub modified: SystemTime,
    pub is_directory: bool,
}

impl FileMeta {
    /// Modification time as whole seconds since the epoch.
    pub fn modified_secs(&self) -> i64 {
        match self.modified.duration_since(SystemTime::UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64,
            Err(_) => 0,
        }
    }
}

/// Closed set of attribute values understood by [`BackendFS::set_attribute`]
/// and returned by [`BackendFS::get_attribute`].
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    ModTime(SystemTime),
    Mode(u32),
    Size(u64),
}

/// Uniform contract over a storage backend.
///
/// Operations either succeed with the stated result or fail with a typed
/// [`Error`]. Every operation may block on I/O; callers must not hold
/// cache-level locks across these calls.
#[async_trait]
pub trait BackendFS: Send + Sync {
    /// Creates an empty regular file. Fails [`Error::Exist`] if the path
    /// already names anything; on success a following [`BackendFS::stat`]
    /// reports a zero-sized regular file.
    async fn create_file(&self, path: &str) -> Result<()>;

    /// Creates a directory. The parent must exist; fails [`Error::Exist`]
    /// if the path already exists.
    async fn create_directory(&self, path: &str) -> Result<()>;

    /// Writes `data` starting at `offset`, extending the file when the
    /// range reaches past its current end. Returns the number of bytes
    /// actually written.
    async fn write_file(&self, path: &str, data: &[u8], offset: u64) -> Result<usize>;

    /// Fills `dest` starting at `offset` and returns the number of bytes
    /// read. Reads past end-of-file produce a short read; zero bytes at
    /// EOF is a success, not an error.
    async fn read_file(&self, path: &str, dest: &mut [u8], offset: u64) -> Result<usize>;

    /// Returns the directory's entries, excluding `.` and `..`. Order is
    /// unspecified but stable within one call.
    async fn read_directory(&self, path: &str) -> Result<Vec<FileMeta>>;

    /// Atomically renames `old_path` to `new_path`. The new parent must
    /// exist; behavior when `new_path` already exists is backend-defined.
    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()>;

    /// Removes a file or an empty directory. Never recursive.
    async fn remove(&self, path: &str) -> Result<()>;

    /// Fails [`Error::NotExist`] when the path names nothing.
    async fn stat(&self, path: &str) -> Result<FileMeta>;

    /// Reads one of the closed attribute set `modtime`, `mode`, `size`.
    /// Unknown names fail [`Error::Invalid`].
    async fn get_attribute(&self, path: &str, attr: &str) -> Result<AttrValue>;

    /// Writes one of the closed attribute set. A `size` change truncates
    /// or extends with zeros. Unknown names and mismatched value kinds
    /// fail [`Error::Invalid`].
    async fn set_attribute(&self, path: &str, attr: &str, value: AttrValue) -> Result<()>;

    /// Releases backend resources. Subsequent operations fail
    /// [`Error::Invalid`].
    async fn close(&self) -> Result<()>;

    /// Short diagnostic string; no semantics.
    fn display_name(&self) -> String;
}

/// Check an `(attribute name, value)` pair for kind agreement.
///
/// Returns [`Error::Invalid`] for names outside the closed set and for a
/// value whose variant does not match the name.
pub fn check_attr_kind(attr: &str, value: &AttrValue) -> Result<()> {
    match (attr, value) {
        (ATTR_MODTIME, AttrValue::ModTime(_)) => Ok(()),
        (ATTR_MODE, AttrValue::Mode(_)) => Ok(()),
        (ATTR_SIZE, AttrValue::Size(_)) => Ok(()),
        _ => Err(Error::Invalid),
    }
}
