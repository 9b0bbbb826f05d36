//! NFS-side translation adapter --- [`NfsAdapter`].
//!
//! The wire engine parses RPC requests and invokes these callbacks; they
//! canonicalize the incoming path, consult the handle table, call the
//! root backend and translate its errors into [`NfsStatus`] values. Read
//! and write return a signed count: non-negative bytes on success,
//! `-(status)` on failure, negated again by the engine.

pub mod status;

use std::net::IpAddr;
use std::time::SystemTime;

use tracing::{debug, info, warn};

use crate::backend::{vpath, AttrValue, BackendFS, Error, FileMeta};
use crate::handle::HandleTable;

pub use status::NfsStatus;

/// Fixed device identifier reported for every exported object.
pub const DEVICE_ID: u32 = 1;

const MODE_DIRECTORY: u32 = 0o040000;
const MODE_REGULAR: u32 = 0o100000;

/// Attribute buffer handed back to the engine for stat-shaped replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrBuffer {
    pub dev: u32,
    /// The path's handle doubles as the inode number.
    pub inode: u64,
    pub size: u64,
    /// Permission bits OR'd with the type bit.
    pub mode: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

/// One packed entry of a bulk directory enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub fileid: u64,
    pub name: String,
}

/// Filesystem-facing callbacks for the NFS engine.
pub struct NfsAdapter {
    root: Box<dyn BackendFS>,
    handles: HandleTable,
    allowed_clients: Vec<IpAddr>,
}

impl NfsAdapter {
    /// Build the adapter over the root backend. An empty allow-list
    /// falls back to loopback-only mounts.
    pub fn new(root: Box<dyn BackendFS>, allowed_clients: Vec<IpAddr>) -> Self {
        let allowed_clients = if allowed_clients.is_empty() {
            vec![IpAddr::from([127, 0, 0, 1]), IpAddr::from([0u16, 0, 0, 0, 0, 0, 0, 1])]
        } else {
            allowed_clients
        };
        Self { root, handles: HandleTable::new(), allowed_clients }
    }

    /// Name of the exported backend, for diagnostics.
    pub fn export_name(&self) -> String {
        self.root.display_name()
    }

    /// Release the backend at shutdown.
    pub async fn shutdown(&self) -> crate::backend::Result<()> {
        self.root.close().await
    }

    /// Mount-acceptance policy check.
    pub fn accept_mount(&self, client: IpAddr, path: &str) -> bool {
        let path = vpath::canonical(path);
        let allowed = self.allowed_clients.contains(&client);
        if allowed {
            info!(%client, path = %path, "mount allowed");
        } else {
            warn!(%client, path = %path, "mount denied");
        }
        allowed
    }

    /// Resolve a handle back to its path. Unknown handles are always
    /// [`NfsStatus::Inval`], never a silent success.
    pub fn handle_path(&self, fd: u64) -> Result<String, NfsStatus> {
        self.handles.path(fd).ok_or(NfsStatus::Inval)
    }

    fn attr_buffer(&self, path: &str, meta: &FileMeta) -> AttrBuffer {
        let type_bit = if meta.is_directory { MODE_DIRECTORY } else { MODE_REGULAR };
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        AttrBuffer {
            dev: DEVICE_ID,
            inode: self.handles.fd(path),
            size: meta.size,
            mode: meta.mode | type_bit,
            atime: now,
            mtime: meta.modified_secs(),
            ctime: meta.modified_secs(),
        }
    }

    /// Stat a path and fill the attribute buffer.
    pub async fn lstat(&self, path: &str) -> Result<AttrBuffer, NfsStatus> {
        let path = vpath::canonical(path);
        let meta = self.root.stat(&path).await.map_err(NfsStatus::from)?;
        Ok(self.attr_buffer(&path, &meta))
    }

    /// Handle-based stat.
    pub async fn lstat_fd(&self, fd: u64) -> Result<AttrBuffer, NfsStatus> {
        let path = self.handle_path(fd)?;
        self.lstat(&path).await
    }

    /// Existence probe.
    pub async fn exists(&self, path: &str) -> NfsStatus {
        match self.root.stat(&vpath::canonical(path)).await {
            Ok(_) => NfsStatus::Ok,
            Err(err) => NfsStatus::from(err),
        }
    }

    /// Check that a path exists and names a regular file before the
    /// engine hands out an open.
    pub async fn open_check(&self, path: &str) -> NfsStatus {
        match self.root.stat(&vpath::canonical(path)).await {
            Ok(meta) if meta.is_directory => NfsStatus::IsDir,
            Ok(_) => NfsStatus::Ok,
            Err(err) => NfsStatus::from(err),
        }
    }

    /// Number of entries in a directory, for iterator-style enumeration.
    pub async fn opendir_count(&self, path: &str) -> Result<usize, NfsStatus> {
        let listing = self
            .root
            .read_directory(&vpath::canonical(path))
            .await
            .map_err(NfsStatus::from)?;
        Ok(listing.len())
    }

    /// Iterator-style enumeration: the name of entry `index`.
    pub async fn dir_entry(&self, path: &str, index: usize) -> Result<String, NfsStatus> {
        let listing = self
            .root
            .read_directory(&vpath::canonical(path))
            .await
            .map_err(NfsStatus::from)?;
        match listing.get(index) {
            Some(meta) => Ok(meta.name.clone()),
            None => {
                debug!(path, index, total = listing.len(), "directory index out of range");
                Err(NfsStatus::Inval)
            }
        }
    }

    /// Bulk enumeration: pack entries starting at `start` until either
    /// `max_entries` entries are emitted or their names would overflow
    /// `byte_budget` bytes.
    pub async fn fill_dir(
        &self,
        path: &str,
        start: usize,
        max_entries: usize,
        byte_budget: usize,
    ) -> Result<Vec<DirEntry>, NfsStatus> {
        let path = vpath::canonical(path);
        let listing = self.root.read_directory(&path).await.map_err(NfsStatus::from)?;
        if start > listing.len() {
            return Err(NfsStatus::Inval);
        }

        let mut packed = Vec::new();
        let mut used = 0usize;
        for meta in listing.iter().skip(start).take(max_entries) {
            used += meta.name.len();
            if used > byte_budget && !packed.is_empty() {
                break;
            }
            let child = vpath::join(&path, &meta.name);
            packed.push(DirEntry { fileid: self.handles.fd(&child), name: meta.name.clone() });
        }
        Ok(packed)
    }

    pub async fn chmod(&self, path: &str, mode: u32) -> NfsStatus {
        self.set_attr(path, "mode", AttrValue::Mode(mode & 0o7777)).await
    }

    /// Ownership is outside the closed attribute set.
    pub fn chown(&self, _path: &str, _uid: u32, _gid: u32) -> NfsStatus {
        NfsStatus::Inval
    }

    pub async fn set_times(&self, path: &str, mtime_secs: i64) -> NfsStatus {
        let stamp = if mtime_secs <= 0 {
            SystemTime::UNIX_EPOCH
        } else {
            SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(mtime_secs as u64)
        };
        self.set_attr(path, "modtime", AttrValue::ModTime(stamp)).await
    }

    pub async fn truncate(&self, path: &str, size: u64) -> NfsStatus {
        self.set_attr(path, "size", AttrValue::Size(size)).await
    }

    async fn set_attr(&self, path: &str, attr: &str, value: AttrValue) -> NfsStatus {
        match self.root.set_attribute(&vpath::canonical(path), attr, value).await {
            Ok(()) => NfsStatus::Ok,
            Err(err) => NfsStatus::from(err),
        }
    }

    pub async fn create(&self, path: &str) -> NfsStatus {
        match self.root.create_file(&vpath::canonical(path)).await {
            Ok(()) => NfsStatus::Ok,
            Err(err) => NfsStatus::from(err),
        }
    }

    /// Create, removing any regular file already sitting at the path.
    pub async fn create_over(&self, path: &str) -> NfsStatus {
        let path = vpath::canonical(path);
        match self.root.stat(&path).await {
            Ok(meta) if meta.is_directory => return NfsStatus::IsDir,
            Ok(_) => {
                if let Err(err) = self.root.remove(&path).await {
                    return NfsStatus::from(err);
                }
            }
            Err(Error::NotExist) => {}
            Err(err) => return NfsStatus::from(err),
        }
        match self.root.create_file(&path).await {
            Ok(()) => NfsStatus::Ok,
            Err(err) => NfsStatus::from(err),
        }
    }

    pub async fn mkdir(&self, path: &str) -> NfsStatus {
        match self.root.create_directory(&vpath::canonical(path)).await {
            Ok(()) => NfsStatus::Ok,
            Err(err) => NfsStatus::from(err),
        }
    }

    /// Remove a regular file. Directories are refused here; the engine
    /// routes those to [`NfsAdapter::rmdir`].
    pub async fn remove(&self, path: &str) -> NfsStatus {
        let path = vpath::canonical(path);
        match self.root.stat(&path).await {
            Ok(meta) if meta.is_directory => return NfsStatus::IsDir,
            Ok(_) => {}
            Err(err) => return NfsStatus::from(err),
        }
        match self.root.remove(&path).await {
            Ok(()) => NfsStatus::Ok,
            Err(err) => NfsStatus::from(err),
        }
    }

    /// Remove an empty directory. A populated one surfaces the distinct
    /// [`NfsStatus::NotEmpty`] code.
    pub async fn rmdir(&self, path: &str) -> NfsStatus {
        let path = vpath::canonical(path);
        match self.root.stat(&path).await {
            Ok(meta) if !meta.is_directory => return NfsStatus::Inval,
            Ok(_) => {}
            Err(err) => return NfsStatus::from(err),
        }
        match self.root.remove(&path).await {
            Ok(()) => NfsStatus::Ok,
            Err(err) => NfsStatus::from(err),
        }
    }

    /// Rename; the moved path keeps its handle.
    pub async fn rename(&self, old_path: &str, new_path: &str) -> NfsStatus {
        let old_path = vpath::canonical(old_path);
        let new_path = vpath::canonical(new_path);

        let source = match self.root.stat(&old_path).await {
            Ok(meta) => meta,
            Err(err) => return NfsStatus::from(err),
        };
        match self.root.rename(&old_path, &new_path).await {
            Ok(()) => {
                self.handles.replace_path(&old_path, &new_path, source.is_directory);
                NfsStatus::Ok
            }
            Err(err) => NfsStatus::from(err),
        }
    }

    /// Read into `dest` at `offset`. Returns the byte count, or the
    /// negated status on failure.
    pub async fn read(&self, path: &str, dest: &mut [u8], offset: u64) -> i64 {
        match self.root.read_file(&vpath::canonical(path), dest, offset).await {
            Ok(count) => count as i64,
            Err(err) => -NfsStatus::from(err).code(),
        }
    }

    /// Handle-based read.
    pub async fn read_fd(&self, fd: u64, dest: &mut [u8], offset: u64) -> i64 {
        match self.handle_path(fd) {
            Ok(path) => self.read(&path, dest, offset).await,
            Err(status) => -status.code(),
        }
    }

    /// Write `data` at `offset`. Returns the byte count, or the negated
    /// status on failure.
    pub async fn write(&self, path: &str, data: &[u8], offset: u64) -> i64 {
        match self.root.write_file(&vpath::canonical(path), data, offset).await {
            Ok(count) => count as i64,
            Err(err) => -NfsStatus::from(err).code(),
        }
    }

    /// Handle-based write.
    pub async fn write_fd(&self, fd: u64, data: &[u8], offset: u64) -> i64 {
        match self.handle_path(fd) {
            Ok(path) => self.write(&path, data, offset).await,
            Err(status) => -status.code(),
        }
    }

    /// Fsync reduces to a stat confirming the file still exists; the
    /// backends write through, so there is nothing else to flush.
    pub async fn fsync(&self, path: &str) -> Result<AttrBuffer, NfsStatus> {
        let path = vpath::canonical(path);
        match self.root.stat(&path).await {
            Ok(meta) if meta.is_directory => Err(NfsStatus::IsDir),
            Ok(meta) => Ok(self.attr_buffer(&path, &meta)),
            Err(err) => Err(NfsStatus::from(err)),
        }
    }
}
