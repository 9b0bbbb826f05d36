//! Per-path cache record --- [`PathEntry`].
//!
//! An entry caches the last observed metadata for one canonical path and,
//! for files, the chunk lists backing byte-range reads and writes. Chunk
//! lists are kept newest-first; a byte covered by several live chunks is
//! served by the one closest to the head, which is how newer writes
//! shadow older bytes without ever comparing payloads.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime};

use crate::backend::{vpath, FileMeta};

use super::chunk::Chunk;

struct EntryState {
    path: String,
    meta: FileMeta,
    meta_age: Option<Instant>,
    /// Not-yet-durable writes, newest first.
    write_chunks: Vec<Arc<Chunk>>,
    /// Read-through copies of backend bytes, newest first.
    cache_chunks: Vec<Arc<Chunk>>,
    /// Child names seen by the last directory read.
    dir_items: Vec<String>,
    dir_age: Option<Instant>,
    tombstoned: bool,
}

/// Cached state for one canonical path.
pub struct PathEntry {
    uid: u64,
    state: RwLock<EntryState>,
}

impl PathEntry {
    pub fn new(path: String, meta: FileMeta, uid: u64) -> Self {
        Self {
            uid,
            state: RwLock::new(EntryState {
                path,
                meta,
                meta_age: Some(Instant::now()),
                write_chunks: Vec::new(),
                cache_chunks: Vec::new(),
                dir_items: Vec::new(),
                dir_age: None,
                tombstoned: false,
            }),
        }
    }

    /// Stable identity assigned at insertion.
    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn path(&self) -> String {
        self.state.read().expect("entry lock").path.clone()
    }

    pub fn is_directory(&self) -> bool {
        self.state.read().expect("entry lock").meta.is_directory
    }

    pub fn is_tombstoned(&self) -> bool {
        self.state.read().expect("entry lock").tombstoned
    }

    /// Metadata snapshot. The size reported is the logical size: the
    /// larger of the backend size and the highest chunk end, so local
    /// writes extending the file are visible before the backend confirms.
    pub fn meta(&self) -> FileMeta {
        let state = self.state.read().expect("entry lock");
        let mut meta = state.meta.clone();
        for chunk in state.write_chunks.iter().chain(state.cache_chunks.iter()) {
            if let Some(end) = chunk.live_end() {
                meta.size = meta.size.max(end);
            }
        }
        meta
    }

    pub fn meta_stale(&self, ttl: Duration) -> bool {
        match self.state.read().expect("entry lock").meta_age {
            Some(age) => age.elapsed() > ttl,
            None => true,
        }
    }

    /// Refresh the observed metadata. The modification time only moves
    /// forward; a locally stamped write time survives an older backend
    /// answer.
    pub fn update_meta(&self, fresh: &FileMeta) {
        let mut state = self.state.write().expect("entry lock");
        let kept_modified = state.meta.modified;
        state.meta = fresh.clone();
        if kept_modified > state.meta.modified {
            state.meta.modified = kept_modified;
        }
        state.meta_age = Some(Instant::now());
    }

    pub fn invalidate_meta(&self) {
        self.state.write().expect("entry lock").meta_age = None;
    }

    pub fn dir_stale(&self, ttl: Duration) -> bool {
        match self.state.read().expect("entry lock").dir_age {
            Some(age) => age.elapsed() > ttl,
            None => true,
        }
    }

    pub fn update_dir(&self, items: Vec<String>) {
        let mut state = self.state.write().expect("entry lock");
        state.dir_items = items;
        state.dir_age = Some(Instant::now());
    }

    pub fn dir_items(&self) -> Vec<String> {
        self.state.read().expect("entry lock").dir_items.clone()
    }

    pub fn invalidate_dir(&self) {
        self.state.write().expect("entry lock").dir_age = None;
    }

    /// Serve `dest` (whose first byte is file offset `offset`) from the
    /// cached chunks.
    ///
    /// Chunks are visited newest-first while a working set of unfilled
    /// ranges is narrowed. Against each chunk, an unfilled range either
    /// stays untouched (disjoint), disappears (contained), loses its head
    /// or tail (one-sided overlap), or splits in two (chunk strictly
    /// inside). Ranges are only ever subdivided, never widened, so a
    /// later (older) chunk can only fill bytes newer chunks left open.
    ///
    /// Returns the still-unfilled ranges plus the bytes copied, or `None`
    /// when the entry lost a race with a concurrent remove.
    pub fn read(&self, offset: u64, dest: &mut [u8]) -> Option<(Vec<(u64, u64)>, usize)> {
        let snapshot: Vec<Arc<Chunk>> = {
            let state = self.state.read().expect("entry lock");
            if state.tombstoned {
                return None;
            }
            state.write_chunks.iter().chain(state.cache_chunks.iter()).cloned().collect()
        };

        if dest.is_empty() {
            return Some((Vec::new(), 0));
        }

        let mut unfilled = vec![(offset, offset + dest.len() as u64)];
        let mut copied = 0usize;
        for chunk in snapshot {
            if unfilled.is_empty() {
                break;
            }
            let mut remaining = Vec::with_capacity(unfilled.len() + 1);
            for range in unfilled {
                match chunk.read_range(range, dest, offset) {
                    // Disjoint or tombstoned: the range survives whole.
                    None => remaining.push(range),
                    Some((served_from, served_to)) => {
                        copied += (served_to - served_from) as usize;
                        if range.0 < served_from {
                            remaining.push((range.0, served_from));
                        }
                        if served_to < range.1 {
                            remaining.push((served_to, range.1));
                        }
                    }
                }
            }
            unfilled = remaining;
        }
        Some((unfilled, copied))
    }

    /// Record backend bytes read through the cache.
    pub fn cache(&self, offset: u64, data: &[u8]) {
        let mut state = self.state.write().expect("entry lock");
        if state.tombstoned || data.is_empty() {
            return;
        }
        state.cache_chunks.insert(0, Arc::new(Chunk::new(offset, data, true)));
    }

    /// Record locally written bytes. Bumps the logical size past the end
    /// of the range and stamps the modification time.
    ///
    /// Returns `None` when the entry was tombstoned first --- the caller
    /// lost a race with a remove and must report the file as gone.
    pub fn write(&self, offset: u64, data: &[u8], synced: bool) -> Option<Arc<Chunk>> {
        let mut state = self.state.write().expect("entry lock");
        if state.tombstoned {
            return None;
        }
        let chunk = Arc::new(Chunk::new(offset, data, synced));
        state.write_chunks.insert(0, Arc::clone(&chunk));
        let end = offset + data.len() as u64;
        if end > state.meta.size {
            state.meta.size = end;
        }
        state.meta.modified = SystemTime::now();
        Some(chunk)
    }

    /// Drop every cached byte, keeping the entry itself alive. Used when
    /// a size change makes all cached ranges untrustworthy.
    pub fn drop_chunks(&self) {
        let mut state = self.state.write().expect("entry lock");
        let write_chunks = state.write_chunks.drain(..).collect::<Vec<_>>();
        let cache_chunks = state.cache_chunks.drain(..).collect::<Vec<_>>();
        for chunk in write_chunks.into_iter().chain(cache_chunks) {
            chunk.tombstone();
        }
    }

    /// Mark the entry deleted and tombstone every chunk.
    pub fn tombstone(&self) {
        let mut state = self.state.write().expect("entry lock");
        state.tombstoned = true;
        let write_chunks = state.write_chunks.drain(..).collect::<Vec<_>>();
        let cache_chunks = state.cache_chunks.drain(..).collect::<Vec<_>>();
        for chunk in write_chunks.into_iter().chain(cache_chunks) {
            chunk.tombstone();
        }
        state.dir_items.clear();
        state.dir_age = None;
    }

    /// Rewrite the entry's key after a rename.
    pub fn rekey(&self, new_path: String) {
        let mut state = self.state.write().expect("entry lock");
        state.meta.name = vpath::leaf(&new_path).to_owned();
        state.path = new_path;
    }

    /// Snapshot both chunk lists for the eviction pass.
    pub fn chunks(&self) -> Vec<Arc<Chunk>> {
        let state = self.state.read().expect("entry lock");
        state.write_chunks.iter().chain(state.cache_chunks.iter()).cloned().collect()
    }

    /// Remove tombstoned chunks left behind by eviction.
    pub fn prune(&self) {
        let mut state = self.state.write().expect("entry lock");
        state.write_chunks.retain(|c| c.live_end().is_some());
        state.cache_chunks.retain(|c| c.live_end().is_some());
    }
}

impl std::fmt::Debug for PathEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().expect("entry lock");
        f.debug_struct("PathEntry")
            .field("uid", &self.uid)
            .field("path", &state.path)
            .field("is_directory", &state.meta.is_directory)
            .field("write_chunks", &state.write_chunks.len())
            .field("cache_chunks", &state.cache_chunks.len())
            .field("tombstoned", &state.tombstoned)
            .finish()
    }
}
