//! Backend exporting a subtree of the host filesystem.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::task;

use super::{vpath, AttrValue, BackendFS, Error, FileMeta, Result};
use super::{ATTR_MODE, ATTR_MODTIME, ATTR_SIZE};

/// Map a host `io::Error` to the backend taxonomy.
pub(crate) fn map_io_error(err: io::Error) -> Error {
    use io::ErrorKind::*;
    match err.kind() {
        NotFound => Error::NotExist,
        PermissionDenied => Error::Permission,
        AlreadyExists => Error::Exist,
        InvalidInput | InvalidData | NotADirectory => Error::Invalid,
        IsADirectory => Error::IsDir,
        DirectoryNotEmpty => Error::NotEmpty,
        _ => Error::io(err),
    }
}

/// Backend mapping virtual paths onto a directory tree of the host.
pub struct OsBackend {
    root: PathBuf,
    closed: AtomicBool,
}

impl OsBackend {
    /// Export `root`, which must already exist.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::metadata(&root).map_err(map_io_error)?;
        Ok(Self { root, closed: AtomicBool::new(false) })
    }

    /// Translate a virtual path to a real path under the export root.
    ///
    /// The input is canonicalized on its `/`-rooted form first, so `..`
    /// cannot climb out of the root.
    fn translate(&self, path: &str) -> PathBuf {
        let canonical = vpath::canonical(path);
        self.root.join(canonical.trim_start_matches('/'))
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Invalid);
        }
        Ok(())
    }

    fn meta_from(path: &str, meta: &std::fs::Metadata) -> FileMeta {
        let is_directory = meta.is_dir();
        FileMeta {
            name: vpath::leaf(path).to_owned(),
            size: if is_directory { 0 } else { meta.len() },
            mode: meta.permissions().mode() & 0o7777,
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            is_directory,
        }
    }
}

#[async_trait::async_trait]
impl BackendFS for OsBackend {
    async fn create_file(&self, path: &str) -> Result<()> {
        self.check_open()?;
        let real = self.translate(path);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&real)
            .await
            .map_err(map_io_error)?;
        drop(file);
        Ok(())
    }

    async fn create_directory(&self, path: &str) -> Result<()> {
        self.check_open()?;
        fs::create_dir(self.translate(path)).await.map_err(map_io_error)
    }

    async fn write_file(&self, path: &str, data: &[u8], offset: u64) -> Result<usize> {
        self.check_open()?;
        let mut file = OpenOptions::new()
            .write(true)
            .open(self.translate(path))
            .await
            .map_err(map_io_error)?;
        file.seek(SeekFrom::Start(offset)).await.map_err(map_io_error)?;
        file.write_all(data).await.map_err(map_io_error)?;
        file.flush().await.map_err(map_io_error)?;
        Ok(data.len())
    }

    async fn read_file(&self, path: &str, dest: &mut [u8], offset: u64) -> Result<usize> {
        self.check_open()?;
        let mut file = fs::File::open(self.translate(path)).await.map_err(map_io_error)?;
        file.seek(SeekFrom::Start(offset)).await.map_err(map_io_error)?;
        let mut filled = 0;
        while filled < dest.len() {
            let n = file.read(&mut dest[filled..]).await.map_err(map_io_error)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    async fn read_directory(&self, path: &str) -> Result<Vec<FileMeta>> {
        self.check_open()?;
        let canonical = vpath::canonical(path);
        let mut reader = fs::read_dir(self.translate(&canonical)).await.map_err(map_io_error)?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(map_io_error)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = entry.metadata().await.map_err(map_io_error)?;
            entries.push(Self::meta_from(&vpath::join(&canonical, &name), &meta));
        }
        Ok(entries)
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.check_open()?;
        fs::rename(self.translate(old_path), self.translate(new_path))
            .await
            .map_err(map_io_error)
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.check_open()?;
        let real = self.translate(path);
        let meta = fs::metadata(&real).await.map_err(map_io_error)?;
        if meta.is_dir() {
            fs::remove_dir(&real).await.map_err(map_io_error)
        } else {
            fs::remove_file(&real).await.map_err(map_io_error)
        }
    }

    async fn stat(&self, path: &str) -> Result<FileMeta> {
        self.check_open()?;
        let canonical = vpath::canonical(path);
        let meta = fs::metadata(self.translate(&canonical)).await.map_err(map_io_error)?;
        Ok(Self::meta_from(&canonical, &meta))
    }

    async fn get_attribute(&self, path: &str, attr: &str) -> Result<AttrValue> {
        let meta = self.stat(path).await?;
        match attr {
            ATTR_MODTIME => Ok(AttrValue::ModTime(meta.modified)),
            ATTR_MODE => Ok(AttrValue::Mode(meta.mode)),
            ATTR_SIZE => Ok(AttrValue::Size(meta.size)),
            _ => Err(Error::Invalid),
        }
    }

    async fn set_attribute(&self, path: &str, attr: &str, value: AttrValue) -> Result<()> {
        self.check_open()?;
        super::check_attr_kind(attr, &value)?;
        let real = self.translate(path);
        match value {
            AttrValue::ModTime(time) => set_mtime(real, time).await,
            AttrValue::Mode(mode) => set_mode(real, mode).await,
            AttrValue::Size(size) => {
                let file =
                    OpenOptions::new().write(true).open(&real).await.map_err(map_io_error)?;
                file.set_len(size).await.map_err(map_io_error)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Invalid);
        }
        Ok(())
    }

    fn display_name(&self) -> String {
        let mut name = format!("os({})", self.root.display());
        if self.closed.load(Ordering::Acquire) {
            name.push_str("(closed)");
        }
        name
    }
}

async fn set_mtime(path: PathBuf, time: SystemTime) -> Result<()> {
    run_blocking(move || {
        filetime::set_file_mtime(&path, filetime::FileTime::from_system_time(time))
    })
    .await
}

async fn set_mode(path: PathBuf, mode: u32) -> Result<()> {
    run_blocking(move || {
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
    })
    .await
}

async fn run_blocking(op: impl FnOnce() -> io::Result<()> + Send + 'static) -> Result<()> {
    task::spawn_blocking(op)
        .await
        .map_err(|err| Error::io(err))?
        .map_err(map_io_error)
}

impl std::fmt::Debug for OsBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OsBackend").field("root", &self.root).finish()
    }
}
