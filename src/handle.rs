//! Stable path-to-handle mapping --- [`HandleTable`].
//!
//! The NFS engine identifies files by small integers; this table hands
//! out one per path and keeps the inverse mapping. Handles are never
//! recycled: removing a path merely strands its handle, and a stranded
//! handle resolving to a now-missing path produces an ordinary NFS error
//! downstream.

use std::collections::HashMap;
use std::sync::RwLock;

/// Handles below this value are reserved.
const FIRST_HANDLE: u64 = 100;

struct TableState {
    by_path: HashMap<String, u64>,
    by_handle: HashMap<u64, String>,
    counter: u64,
}

/// Bidirectional mapping between canonical paths and NFS handles.
pub struct HandleTable {
    state: RwLock<TableState>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(TableState {
                by_path: HashMap::new(),
                by_handle: HashMap::new(),
                counter: FIRST_HANDLE,
            }),
        }
    }

    /// Handle for `path`, allocating a fresh one on first sight.
    pub fn fd(&self, path: &str) -> u64 {
        {
            let state = self.state.read().expect("handle table lock");
            if let Some(&fd) = state.by_path.get(path) {
                return fd;
            }
        }
        let mut state = self.state.write().expect("handle table lock");
        if let Some(&fd) = state.by_path.get(path) {
            return fd;
        }
        state.counter += 1;
        let fd = state.counter;
        state.by_path.insert(path.to_owned(), fd);
        state.by_handle.insert(fd, path.to_owned());
        fd
    }

    /// Path currently registered under `fd`.
    pub fn path(&self, fd: u64) -> Option<String> {
        self.state.read().expect("handle table lock").by_handle.get(&fd).cloned()
    }

    /// Move the mapping for `old_path` to `new_path`; with
    /// `is_directory`, also rewrite every mapping below it. One
    /// indivisible step under the exclusive lock.
    pub fn replace_path(&self, old_path: &str, new_path: &str, is_directory: bool) {
        let mut state = self.state.write().expect("handle table lock");
        if let Some(fd) = state.by_path.remove(old_path) {
            state.by_path.insert(new_path.to_owned(), fd);
            state.by_handle.insert(fd, new_path.to_owned());
        }

        if is_directory {
            let old_prefix = format!("{old_path}/");
            let new_prefix = format!("{new_path}/");
            let moved: Vec<(String, u64)> = state
                .by_path
                .iter()
                .filter(|(path, _)| path.starts_with(&old_prefix))
                .map(|(path, &fd)| (path.clone(), fd))
                .collect();
            for (path, fd) in moved {
                state.by_path.remove(&path);
                let rewritten = format!("{new_prefix}{}", &path[old_prefix.len()..]);
                state.by_path.insert(rewritten.clone(), fd);
                state.by_handle.insert(fd, rewritten);
            }
        }
    }
}
