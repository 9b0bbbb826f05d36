//! Transparent caching decorator over any backend --- [`CacheShim`].
//!
//! The shim keeps one [`PathEntry`] per canonical path, holding metadata
//! with a freshness window and, for files, byte-range chunks fed by both
//! local writes and read-throughs. Writes go through to the wrapped
//! backend but are recorded locally first, so the process reads its own
//! writes even while the backend call is in flight.
//!
//! Lock discipline: the cache map lock is above the entry locks, which
//! are above the chunk locks, and no lock is ever held across a call
//! into the wrapped backend.

pub mod chunk;
pub mod entry;
pub mod scratch;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, warn};

use crate::backend::{
    vpath, AttrValue, BackendFS, Error, FileMeta, Result, ATTR_MODE, ATTR_MODTIME, ATTR_SIZE,
};

use chunk::Chunk;
use entry::PathEntry;

/// Freshness window applied when the operator does not pick one.
pub const DEFAULT_METADATA_TTL: Duration = Duration::from_secs(5);

/// Shim construction parameters.
#[derive(Debug, Clone)]
pub struct ShimConfig {
    /// Directory receiving spilled chunks.
    pub scratch_dir: PathBuf,
    /// Bound, in bytes, for cached payloads both resident and spilled.
    pub scratch_budget: u64,
    /// Age beyond which cached metadata and listings are refetched.
    pub metadata_ttl: Duration,
}

/// Caching decorator backend.
pub struct CacheShim {
    inner: Box<dyn BackendFS>,
    config: ShimConfig,
    cache: RwLock<HashMap<String, Arc<PathEntry>>>,
    next_uid: AtomicU64,
    spill_seq: AtomicU64,
    closed: AtomicBool,
}

impl CacheShim {
    /// Wrap `inner`. Fails when the scratch directory cannot be probed.
    pub fn new(inner: Box<dyn BackendFS>, config: ShimConfig) -> Result<Self> {
        scratch::prepare(&config.scratch_dir)?;
        Ok(Self {
            inner,
            config,
            cache: RwLock::new(HashMap::new()),
            next_uid: AtomicU64::new(1),
            spill_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Invalid);
        }
        Ok(())
    }

    fn lookup(&self, path: &str) -> Option<Arc<PathEntry>> {
        self.cache.read().expect("cache lock").get(path).cloned()
    }

    fn evict(&self, path: &str) -> Option<Arc<PathEntry>> {
        self.cache.write().expect("cache lock").remove(path)
    }

    fn insert_entry(&self, path: &str, meta: FileMeta) -> Arc<PathEntry> {
        let mut cache = self.cache.write().expect("cache lock");
        if let Some(existing) = cache.get(path) {
            existing.update_meta(&meta);
            return Arc::clone(existing);
        }
        let uid = self.next_uid.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(PathEntry::new(path.to_owned(), meta, uid));
        cache.insert(path.to_owned(), Arc::clone(&entry));
        entry
    }

    fn invalidate_parent_listing(&self, path: &str) {
        if let Some(parent) = self.lookup(&vpath::parent(path)) {
            parent.invalidate_dir();
        }
    }

    /// Resolve `path` to its cache entry, consulting the wrapped backend
    /// on a miss or when the cached metadata aged out. An entry whose
    /// refetch comes back [`Error::NotExist`] is evicted on the spot.
    async fn interstat(&self, path: &str) -> Result<Arc<PathEntry>> {
        let entry = match self.lookup(path) {
            Some(entry) => entry,
            None => {
                let meta = self.inner.stat(path).await?;
                self.insert_entry(path, meta)
            }
        };

        if entry.meta_stale(self.config.metadata_ttl) {
            match self.inner.stat(path).await {
                Ok(meta) => entry.update_meta(&meta),
                Err(Error::NotExist) => {
                    if let Some(stale) = self.evict(path) {
                        stale.tombstone();
                    }
                    return Err(Error::NotExist);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(entry)
    }

    /// Enforce the scratch budget: spill least-recently-used resident
    /// chunks once memory use crosses it, then tombstone the oldest
    /// synced spilled chunks while disk use stays above it. Unsynced
    /// write chunks are never discarded; until the backend confirms them
    /// they are the only copy.
    fn maintain(&self) {
        let entries: Vec<Arc<PathEntry>> =
            self.cache.read().expect("cache lock").values().cloned().collect();

        let mut resident: Vec<(u64, Arc<Chunk>, u64)> = Vec::new();
        let mut mem_total = 0u64;
        let mut disk_total = 0u64;
        for entry in &entries {
            entry.prune();
            for chunk in entry.chunks() {
                let fp = chunk.footprint();
                if !fp.live {
                    continue;
                }
                mem_total += fp.mem_bytes;
                disk_total += fp.disk_bytes;
                if fp.mem_bytes > 0 {
                    resident.push((fp.aged_millis, chunk, entry.uid()));
                }
            }
        }

        let budget = self.config.scratch_budget;
        if mem_total > budget {
            resident.sort_by_key(|(aged, _, _)| *aged);
            for (_, chunk, uid) in resident {
                if mem_total <= budget {
                    break;
                }
                let seq = self.spill_seq.fetch_add(1, Ordering::Relaxed);
                let target = scratch::spill_path(&self.config.scratch_dir, uid, seq);
                match chunk.spill(target) {
                    Ok(moved) => {
                        mem_total = mem_total.saturating_sub(moved);
                        disk_total += moved;
                    }
                    Err(err) => {
                        warn!(%err, "chunk spill failed");
                        break;
                    }
                }
            }
        }

        if disk_total > budget {
            let mut victims: Vec<(u64, Arc<Chunk>)> = Vec::new();
            for entry in &entries {
                for chunk in entry.chunks() {
                    let fp = chunk.footprint();
                    if fp.live && fp.synced && fp.disk_bytes > 0 {
                        victims.push((fp.aged_millis, chunk));
                    }
                }
            }
            victims.sort_by_key(|(aged, _)| *aged);
            for (_, chunk) in victims {
                if disk_total <= budget {
                    break;
                }
                let (_, disk_freed) = chunk.tombstone();
                disk_total = disk_total.saturating_sub(disk_freed);
            }
            for entry in &entries {
                entry.prune();
            }
        }
    }
}

#[async_trait::async_trait]
impl BackendFS for CacheShim {
    async fn create_file(&self, path: &str) -> Result<()> {
        self.check_open()?;
        let path = vpath::canonical(path);
        if let Some(stale) = self.evict(&path) {
            stale.tombstone();
        }
        self.invalidate_parent_listing(&path);
        self.inner.create_file(&path).await
    }

    async fn create_directory(&self, path: &str) -> Result<()> {
        self.check_open()?;
        let path = vpath::canonical(path);
        if let Some(stale) = self.evict(&path) {
            stale.tombstone();
        }
        self.invalidate_parent_listing(&path);
        self.inner.create_directory(&path).await
    }

    async fn write_file(&self, path: &str, data: &[u8], offset: u64) -> Result<usize> {
        self.check_open()?;
        if data.is_empty() {
            return Ok(0);
        }
        let path = vpath::canonical(path);
        let entry = self.interstat(&path).await?;
        if entry.is_directory() {
            return Err(Error::IsDir);
        }
        self.invalidate_parent_listing(&path);

        // Shadow locally first: readers in this process see the bytes
        // even while the backend write is still in flight.
        let Some(shadow) = entry.write(offset, data, false) else {
            return Err(Error::NotExist);
        };
        match self.inner.write_file(&path, data, offset).await {
            Ok(written) => {
                shadow.mark_synced();
                self.maintain();
                Ok(written)
            }
            Err(err) => {
                warn!(path = %path, %err, "write-through failed; keeping unsynced shadow");
                Err(err)
            }
        }
    }

    async fn read_file(&self, path: &str, dest: &mut [u8], offset: u64) -> Result<usize> {
        self.check_open()?;
        if dest.is_empty() {
            return Ok(0);
        }
        let path = vpath::canonical(path);
        let entry = self.interstat(&path).await?;
        if entry.is_directory() {
            return Err(Error::IsDir);
        }

        let Some((unfilled, from_cache)) = entry.read(offset, dest) else {
            return Err(Error::NotExist);
        };

        let mut from_backend = 0usize;
        let mut failure = None;
        for (start, end) in unfilled {
            let lo = (start - offset) as usize;
            let hi = (end - offset) as usize;
            let result = self.inner.read_file(&path, &mut dest[lo..hi], start).await;
            match result {
                Ok(0) => {}
                Ok(count) => {
                    entry.cache(start, &dest[lo..lo + count]);
                    from_backend += count;
                }
                Err(err) => failure = Some(err),
            }
        }
        self.maintain();

        match failure {
            Some(err) => Err(err),
            None => {
                debug!(path = %path, from_cache, from_backend, "read served");
                Ok(from_cache + from_backend)
            }
        }
    }

    async fn read_directory(&self, path: &str) -> Result<Vec<FileMeta>> {
        self.check_open()?;
        let path = vpath::canonical(path);
        let entry = self.interstat(&path).await?;
        if !entry.is_directory() {
            return Err(Error::Invalid);
        }

        if !entry.dir_stale(self.config.metadata_ttl) {
            // Reconstitute from cached children; any gap forces a refresh.
            let items = entry.dir_items();
            let mut listing = Vec::with_capacity(items.len());
            let mut complete = true;
            for name in &items {
                match self.lookup(&vpath::join(&path, name)) {
                    Some(child) if !child.is_tombstoned() => listing.push(child.meta()),
                    _ => {
                        complete = false;
                        break;
                    }
                }
            }
            if complete {
                return Ok(listing);
            }
        }

        let metas = self.inner.read_directory(&path).await?;
        let mut items = Vec::with_capacity(metas.len());
        for meta in &metas {
            let child_path = vpath::join(&path, &meta.name);
            items.push(meta.name.clone());
            match self.lookup(&child_path) {
                Some(child) => child.update_meta(meta),
                None => {
                    self.insert_entry(&child_path, meta.clone());
                }
            }
        }
        entry.update_dir(items);
        Ok(metas)
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.check_open()?;
        let old_path = vpath::canonical(old_path);
        let new_path = vpath::canonical(new_path);

        match self.inner.rename(&old_path, &new_path).await {
            Ok(()) => {
                // Re-key the moved entry and, for a directory, every
                // cached descendant, in one indivisible map update.
                {
                    let mut cache = self.cache.write().expect("cache lock");
                    if let Some(replaced) = cache.remove(&new_path) {
                        replaced.tombstone();
                    }
                    if let Some(moved) = cache.remove(&old_path) {
                        moved.rekey(new_path.clone());
                        cache.insert(new_path.clone(), moved);
                    }
                    // Cached descendants follow by prefix substitution;
                    // for a renamed file no key carries the prefix.
                    let old_prefix = format!("{old_path}/");
                    let descendants: Vec<String> = cache
                        .keys()
                        .filter(|key| key.starts_with(&old_prefix))
                        .cloned()
                        .collect();
                    for key in descendants {
                        if let Some(child) = cache.remove(&key) {
                            let rekeyed = vpath::join(&new_path, &key[old_prefix.len()..]);
                            child.rekey(rekeyed.clone());
                            cache.insert(rekeyed, child);
                        }
                    }
                }
                self.invalidate_parent_listing(&old_path);
                self.invalidate_parent_listing(&new_path);
                Ok(())
            }
            Err(err) => {
                // The backend may have half-moved; trust nothing cached
                // about either name.
                for side in [&old_path, &new_path] {
                    if let Some(entry) = self.evict(side) {
                        entry.tombstone();
                    }
                }
                Err(err)
            }
        }
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.check_open()?;
        let path = vpath::canonical(path);
        match self.inner.remove(&path).await {
            Ok(()) => {
                if let Some(entry) = self.evict(&path) {
                    entry.tombstone();
                }
                self.invalidate_parent_listing(&path);
                Ok(())
            }
            Err(err) => {
                if let Some(entry) = self.lookup(&path) {
                    entry.invalidate_meta();
                    entry.invalidate_dir();
                }
                Err(err)
            }
        }
    }

    async fn stat(&self, path: &str) -> Result<FileMeta> {
        self.check_open()?;
        let path = vpath::canonical(path);
        let entry = self.interstat(&path).await?;
        Ok(entry.meta())
    }

    async fn get_attribute(&self, path: &str, attr: &str) -> Result<AttrValue> {
        self.check_open()?;
        let path = vpath::canonical(path);
        match attr {
            ATTR_MODTIME | ATTR_MODE | ATTR_SIZE => {
                let meta = self.interstat(&path).await?.meta();
                Ok(match attr {
                    ATTR_MODTIME => AttrValue::ModTime(meta.modified),
                    ATTR_MODE => AttrValue::Mode(meta.mode),
                    _ => AttrValue::Size(meta.size),
                })
            }
            _ => Err(Error::Invalid),
        }
    }

    async fn set_attribute(&self, path: &str, attr: &str, value: AttrValue) -> Result<()> {
        self.check_open()?;
        crate::backend::check_attr_kind(attr, &value)?;
        let path = vpath::canonical(path);
        // The new attributes must be re-observed; a size change also
        // voids every cached byte range.
        if let Some(entry) = self.lookup(&path) {
            if matches!(value, AttrValue::Size(_)) {
                entry.drop_chunks();
            }
            entry.invalidate_meta();
        }
        self.inner.set_attribute(&path, attr, value).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Invalid);
        }
        let result = self.inner.close().await;
        let entries: Vec<Arc<PathEntry>> = {
            let mut cache = self.cache.write().expect("cache lock");
            cache.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.tombstone();
        }
        result
    }

    fn display_name(&self) -> String {
        let mut name = format!("shim({})", self.inner.display_name());
        if self.closed.load(Ordering::Acquire) {
            name.push_str("(closed)");
        }
        name
    }
}
