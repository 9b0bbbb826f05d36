use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;

use nfs_gate::backend::os::OsBackend;
use nfs_gate::shim::{CacheShim, ShimConfig};

pub const TEST_BUDGET: u64 = 32 * 1024 * 1024;

/// A cache shim layered over a host-directory export, both rooted in
/// fresh temporary directories.
pub struct Fixture {
    pub export: TempDir,
    pub scratch: TempDir,
    pub shim: CacheShim,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(Duration::from_secs(5), TEST_BUDGET)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self::with_config(ttl, TEST_BUDGET)
    }

    pub fn with_config(ttl: Duration, budget: u64) -> Self {
        let export = TempDir::new().expect("create export dir");
        let scratch = TempDir::new().expect("create scratch dir");
        let backend = OsBackend::new(export.path()).expect("backend over export dir");
        let shim = CacheShim::new(
            Box::new(backend),
            ShimConfig {
                scratch_dir: scratch.path().to_path_buf(),
                scratch_budget: budget,
                metadata_ttl: ttl,
            },
        )
        .expect("shim over backend");
        Self { export, scratch, shim }
    }

    /// Host path backing the virtual `name`.
    pub fn export_path(&self, name: &str) -> PathBuf {
        self.export.path().join(name.trim_start_matches('/'))
    }

    /// Total bytes currently spilled into the scratch directory.
    pub fn spilled_bytes(&self) -> u64 {
        std::fs::read_dir(self.scratch.path())
            .expect("read scratch dir")
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".shimchunk"))
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    }
}

/// Build a small ZIP archive fixture under `dir`.
pub fn build_zip(dir: &Path) -> PathBuf {
    let path = dir.join("fixture.zip");
    let file = std::fs::File::create(&path).expect("create archive");
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    writer.start_file("readme.txt", options).unwrap();
    writer.write_all(b"archived bytes").unwrap();
    writer.finish().unwrap();
    path
}
