//! Byte-range buffer with disk spill --- [`Chunk`].
//!
//! A chunk is one contiguous range of file bytes held by the cache. Its
//! payload lives in memory until spilled to a scratch file; a tombstoned
//! chunk has width `-1` and owns no payload at all. The chunk carries its
//! own reader-writer lock: readers copy bytes under the shared lock,
//! spill and tombstone take the exclusive lock.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Width value marking a tombstoned chunk.
const TOMBSTONE: i64 = -1;

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

struct ChunkState {
    width: i64,
    synced: bool,
    /// In-memory payload; released once spilled or tombstoned.
    mem: Option<Vec<u8>>,
    /// Scratch file holding the payload after a spill.
    spill: Option<PathBuf>,
}

/// Accounting snapshot used by the eviction pass.
#[derive(Debug, Clone, Copy)]
pub struct ChunkFootprint {
    pub live: bool,
    pub synced: bool,
    pub mem_bytes: u64,
    pub disk_bytes: u64,
    pub aged_millis: u64,
}

/// A cached contiguous byte range of one file.
pub struct Chunk {
    off: u64,
    aged: AtomicU64,
    state: RwLock<ChunkState>,
}

impl Chunk {
    /// Build an in-memory chunk holding a copy of `data`.
    pub fn new(off: u64, data: &[u8], synced: bool) -> Self {
        Self {
            off,
            aged: AtomicU64::new(now_millis()),
            state: RwLock::new(ChunkState {
                width: data.len() as i64,
                synced,
                mem: Some(data.to_vec()),
                spill: None,
            }),
        }
    }

    pub fn off(&self) -> u64 {
        self.off
    }

    /// End offset of the live range, `None` once tombstoned.
    pub fn live_end(&self) -> Option<u64> {
        let state = self.state.read().expect("chunk lock");
        if state.width == TOMBSTONE {
            None
        } else {
            Some(self.off + state.width as u64)
        }
    }

    pub fn is_synced(&self) -> bool {
        self.state.read().expect("chunk lock").synced
    }

    /// Flip the chunk to synced once the wrapped backend confirmed the
    /// bytes.
    pub fn mark_synced(&self) {
        self.state.write().expect("chunk lock").synced = true;
    }

    /// Copy the intersection of this chunk with the absolute range
    /// `[want.0, want.1)` into `dest`, whose first byte sits at file
    /// offset `dest_base`.
    ///
    /// Returns the intersection actually served, or `None` when the chunk
    /// is tombstoned, disjoint from the request, or its spill file has
    /// gone bad (the caller then treats the range as unfilled and falls
    /// through to the backend).
    pub fn read_range(
        &self,
        want: (u64, u64),
        dest: &mut [u8],
        dest_base: u64,
    ) -> Option<(u64, u64)> {
        let state = self.state.read().expect("chunk lock");
        if state.width == TOMBSTONE {
            return None;
        }
        let chunk_end = self.off + state.width as u64;
        let start = want.0.max(self.off);
        let end = want.1.min(chunk_end);
        if start >= end {
            return None;
        }

        let len = (end - start) as usize;
        let dest_from = (start - dest_base) as usize;
        let slice = &mut dest[dest_from..dest_from + len];
        match (&state.mem, &state.spill) {
            (Some(mem), _) => {
                let from = (start - self.off) as usize;
                slice.copy_from_slice(&mem[from..from + len]);
            }
            (None, Some(path)) => {
                if read_spilled(path, start - self.off, slice).is_err() {
                    return None;
                }
            }
            (None, None) => return None,
        }
        self.aged.store(now_millis(), Ordering::Relaxed);
        Some((start, end))
    }

    /// Move the payload into `path` under scratch and release the buffer.
    /// Idempotent when already spilled.
    pub fn spill(&self, path: PathBuf) -> std::io::Result<u64> {
        let mut state = self.state.write().expect("chunk lock");
        if state.width == TOMBSTONE || state.spill.is_some() {
            return Ok(0);
        }
        let Some(mem) = state.mem.take() else { return Ok(0) };
        if let Err(err) = fs::write(&path, &mem) {
            // Keep the bytes resident rather than lose them.
            state.mem = Some(mem);
            return Err(err);
        }
        let moved = mem.len() as u64;
        state.spill = Some(path);
        Ok(moved)
    }

    /// Mark the chunk dead, free its payload, delete its spill file.
    /// Returns `(memory freed, disk freed)`.
    pub fn tombstone(&self) -> (u64, u64) {
        let mut state = self.state.write().expect("chunk lock");
        if state.width == TOMBSTONE {
            return (0, 0);
        }
        let width = state.width as u64;
        state.width = TOMBSTONE;
        let mem_freed = state.mem.take().map(|m| m.len() as u64).unwrap_or(0);
        let disk_freed = match state.spill.take() {
            Some(path) => {
                let _ = fs::remove_file(path);
                width
            }
            None => 0,
        };
        (mem_freed, disk_freed)
    }

    pub fn footprint(&self) -> ChunkFootprint {
        let state = self.state.read().expect("chunk lock");
        let live = state.width != TOMBSTONE;
        ChunkFootprint {
            live,
            synced: state.synced,
            mem_bytes: state.mem.as_ref().map(|m| m.len() as u64).unwrap_or(0),
            disk_bytes: if live && state.mem.is_none() && state.spill.is_some() {
                state.width as u64
            } else {
                0
            },
            aged_millis: self.aged.load(Ordering::Relaxed),
        }
    }
}

fn read_spilled(path: &Path, from: u64, dest: &mut [u8]) -> std::io::Result<()> {
    let mut file = fs::File::open(path)?;
    file.seek(SeekFrom::Start(from))?;
    file.read_exact(dest)
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().expect("chunk lock");
        f.debug_struct("Chunk")
            .field("off", &self.off)
            .field("width", &state.width)
            .field("synced", &state.synced)
            .field("spilled", &state.spill.is_some())
            .finish()
    }
}
