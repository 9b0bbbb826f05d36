//! Read-only backend over a ZIP archive.
//!
//! The archive is opened once and its entry table is kept as a
//! lexicographically sorted list. Directories are inferred from entries
//! that share a longer prefix followed by `/`, so archives without
//! explicit directory records still present a full tree. Every mutating
//! operation fails [`Error::Permission`].

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::task;
use zip::ZipArchive;

use super::{vpath, AttrValue, BackendFS, Error, FileMeta, Result};
use super::{ATTR_MODE, ATTR_MODTIME, ATTR_SIZE};

const DIR_MODE: u32 = 0o555;
const FILE_MODE: u32 = 0o444;

#[derive(Debug, Clone)]
struct EntryInfo {
    /// Archive-relative name without a leading or trailing slash.
    name: String,
    /// Index into the archive, meaningful for file entries only.
    index: usize,
    size: u64,
    modified: SystemTime,
    is_dir: bool,
}

enum Lookup<'a> {
    File(&'a EntryInfo),
    Directory,
}

/// Read-only backend over a `.zip` archive.
pub struct ZipBackend {
    archive_path: PathBuf,
    archive: Arc<Mutex<ZipArchive<File>>>,
    entries: Vec<EntryInfo>,
    closed: AtomicBool,
}

impl ZipBackend {
    /// Open `archive_path` and index its entries.
    pub fn open(archive_path: impl Into<PathBuf>) -> Result<Self> {
        let archive_path = archive_path.into();
        let file = File::open(&archive_path).map_err(Error::io)?;
        let mut archive = ZipArchive::new(file).map_err(Error::io)?;

        let mut entries = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            let entry = archive.by_index(index).map_err(Error::io)?;
            let raw = entry.name().trim_matches('/');
            if raw.is_empty() {
                continue;
            }
            entries.push(EntryInfo {
                name: raw.to_owned(),
                index,
                size: entry.size(),
                modified: dos_mtime(entry.last_modified()),
                is_dir: entry.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Self {
            archive_path,
            archive: Arc::new(Mutex::new(archive)),
            entries,
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Invalid);
        }
        Ok(())
    }

    /// Strip the leading `/` of a canonical virtual path; the archive
    /// stores names relative to its own root.
    fn key(path: &str) -> String {
        vpath::canonical(path).trim_start_matches('/').to_owned()
    }

    /// Exact match first, then a prefix match with a trailing `/` that
    /// signals an inferred directory.
    fn lookup(&self, key: &str) -> Option<Lookup<'_>> {
        if key.is_empty() {
            return Some(Lookup::Directory);
        }
        let start = self.entries.partition_point(|e| e.name.as_str() < key);
        if let Some(entry) = self.entries.get(start) {
            if entry.name == key {
                return if entry.is_dir {
                    Some(Lookup::Directory)
                } else {
                    Some(Lookup::File(entry))
                };
            }
        }
        let prefix = format!("{key}/");
        let from = self.entries.partition_point(|e| e.name.as_str() < prefix.as_str());
        match self.entries.get(from) {
            Some(entry) if entry.name.starts_with(&prefix) => Some(Lookup::Directory),
            _ => None,
        }
    }

    fn stat_key(&self, path: &str) -> Result<FileMeta> {
        let key = Self::key(path);
        match self.lookup(&key).ok_or(Error::NotExist)? {
            Lookup::Directory => Ok(FileMeta {
                name: vpath::leaf(&vpath::canonical(path)).to_owned(),
                size: 0,
                mode: DIR_MODE,
                modified: SystemTime::UNIX_EPOCH,
                is_directory: true,
            }),
            Lookup::File(entry) => Ok(FileMeta {
                name: vpath::leaf(&vpath::canonical(path)).to_owned(),
                size: entry.size,
                mode: FILE_MODE,
                modified: entry.modified,
                is_directory: false,
            }),
        }
    }
}

#[async_trait::async_trait]
impl BackendFS for ZipBackend {
    async fn create_file(&self, _path: &str) -> Result<()> {
        self.check_open()?;
        Err(Error::Permission)
    }

    async fn create_directory(&self, _path: &str) -> Result<()> {
        self.check_open()?;
        Err(Error::Permission)
    }

    async fn write_file(&self, _path: &str, _data: &[u8], _offset: u64) -> Result<usize> {
        self.check_open()?;
        Err(Error::Permission)
    }

    async fn read_file(&self, path: &str, dest: &mut [u8], offset: u64) -> Result<usize> {
        self.check_open()?;
        let key = Self::key(path);
        let entry = match self.lookup(&key).ok_or(Error::NotExist)? {
            Lookup::Directory => return Err(Error::IsDir),
            Lookup::File(entry) => entry.clone(),
        };
        if offset >= entry.size || dest.is_empty() {
            return Ok(0);
        }

        // The compressed stream has no random access; re-open the entry
        // and discard `offset` bytes before copying out the range.
        let archive = Arc::clone(&self.archive);
        let wanted = dest.len().min((entry.size - offset) as usize);
        let bytes = task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut archive = archive.lock().map_err(|_| Error::io("archive lock poisoned"))?;
            let mut reader = archive.by_index(entry.index).map_err(Error::io)?;
            io::copy(&mut reader.by_ref().take(offset), &mut io::sink()).map_err(Error::io)?;
            let mut out = Vec::with_capacity(wanted);
            reader.take(wanted as u64).read_to_end(&mut out).map_err(Error::io)?;
            Ok(out)
        })
        .await
        .map_err(|err| Error::io(err))??;

        dest[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    async fn read_directory(&self, path: &str) -> Result<Vec<FileMeta>> {
        self.check_open()?;
        let key = Self::key(path);
        match self.lookup(&key).ok_or(Error::NotExist)? {
            Lookup::Directory => {}
            Lookup::File(_) => return Err(Error::Invalid),
        }

        let prefix = if key.is_empty() { String::new() } else { format!("{key}/") };
        let start = self.entries.partition_point(|e| e.name.as_str() < prefix.as_str());
        let mut listing: Vec<FileMeta> = Vec::new();
        let mut previous = "";
        for entry in &self.entries[start..] {
            let Some(local) = entry.name.strip_prefix(prefix.as_str()) else { break };
            match local.find('/') {
                // A deeper entry implies a child directory.
                Some(idx) => {
                    let child = &local[..idx];
                    if child != previous {
                        listing.push(FileMeta {
                            name: child.to_owned(),
                            size: 0,
                            mode: DIR_MODE,
                            modified: SystemTime::UNIX_EPOCH,
                            is_directory: true,
                        });
                    }
                }
                None => {
                    if local != previous {
                        listing.push(FileMeta {
                            name: local.to_owned(),
                            size: if entry.is_dir { 0 } else { entry.size },
                            mode: if entry.is_dir { DIR_MODE } else { FILE_MODE },
                            modified: entry.modified,
                            is_directory: entry.is_dir,
                        });
                    }
                }
            }
            previous = match local.find('/') {
                Some(idx) => &local[..idx],
                None => local,
            };
        }
        Ok(listing)
    }

    async fn rename(&self, _old_path: &str, _new_path: &str) -> Result<()> {
        self.check_open()?;
        Err(Error::Permission)
    }

    async fn remove(&self, _path: &str) -> Result<()> {
        self.check_open()?;
        Err(Error::Permission)
    }

    async fn stat(&self, path: &str) -> Result<FileMeta> {
        self.check_open()?;
        self.stat_key(path)
    }

    async fn get_attribute(&self, path: &str, attr: &str) -> Result<AttrValue> {
        self.check_open()?;
        let meta = self.stat_key(path)?;
        match attr {
            ATTR_MODTIME => Ok(AttrValue::ModTime(meta.modified)),
            ATTR_MODE => Ok(AttrValue::Mode(meta.mode)),
            ATTR_SIZE => Ok(AttrValue::Size(meta.size)),
            _ => Err(Error::Invalid),
        }
    }

    async fn set_attribute(&self, _path: &str, _attr: &str, _value: AttrValue) -> Result<()> {
        self.check_open()?;
        Err(Error::Permission)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Invalid);
        }
        Ok(())
    }

    fn display_name(&self) -> String {
        let mut name = format!("zip({})", self.archive_path.display());
        if self.closed.load(Ordering::Acquire) {
            name.push_str("(closed)");
        }
        name
    }
}

/// DOS timestamps carry no zone; treat the fields as UTC civil time.
fn dos_mtime(stamp: Option<zip::DateTime>) -> SystemTime {
    let Some(stamp) = stamp else { return SystemTime::UNIX_EPOCH };
    let days = days_from_civil(
        i64::from(stamp.year()),
        i64::from(stamp.month()),
        i64::from(stamp.day()),
    );
    let secs = days * 86_400
        + i64::from(stamp.hour()) * 3_600
        + i64::from(stamp.minute()) * 60
        + i64::from(stamp.second());
    if secs <= 0 {
        SystemTime::UNIX_EPOCH
    } else {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64)
    }
}

/// Days since 1970-01-01 for a proleptic Gregorian civil date.
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let year = if month <= 2 { year - 1 } else { year };
    let era = year.div_euclid(400);
    let yoe = year - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}
