//! Scratch directory management for spilled chunks.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::backend::{Error, Result};

/// Suffix reserved for files owned by the shim; everything carrying it is
/// fair game for the startup purge.
pub const SPILL_SUFFIX: &str = ".shimchunk";

const PROBE_NAME: &str = "probe.shimchunk";

/// Purge leftovers from previous runs, then prove the directory is
/// usable by creating, writing and removing a test file.
pub fn prepare(dir: &Path) -> Result<()> {
    purge(dir)?;

    let probe = dir.join(PROBE_NAME);
    fs::write(&probe, [1, 2, 3, 4, 5, 6, 7, 8, 9])
        .map_err(|err| Error::Io(format!("scratch dir {} not writable: {err}", dir.display())))?;
    fs::remove_file(&probe)
        .map_err(|err| Error::Io(format!("scratch dir {} not cleanable: {err}", dir.display())))?;
    Ok(())
}

fn purge(dir: &Path) -> Result<()> {
    let reader = fs::read_dir(dir)
        .map_err(|err| Error::Io(format!("scratch dir {} not readable: {err}", dir.display())))?;
    for dir_entry in reader.flatten() {
        let name = dir_entry.file_name();
        if name.to_string_lossy().ends_with(SPILL_SUFFIX) {
            debug!(file = %name.to_string_lossy(), "purging stale spill file");
            let _ = fs::remove_file(dir_entry.path());
        }
    }
    Ok(())
}

/// Scratch file for the `seq`-th spill of the entry with identity `uid`.
pub fn spill_path(dir: &Path, uid: u64, seq: u64) -> PathBuf {
    dir.join(format!("chunk-{uid}-{seq}{SPILL_SUFFIX}"))
}
