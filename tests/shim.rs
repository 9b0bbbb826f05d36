mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{build_zip, Fixture};
use nfs_gate::backend::zip::ZipBackend;
use nfs_gate::backend::{AttrValue, BackendFS, Error};
use nfs_gate::shim::{CacheShim, ShimConfig};

#[tokio::test]
async fn write_then_read_coherence() {
    let fixture = Fixture::new();
    let shim = &fixture.shim;

    shim.create_file("/a").await.expect("create succeeds");
    assert_eq!(shim.write_file("/a", &[0x41, 0x42, 0x43], 0).await.expect("write succeeds"), 3);

    let mut buf = [0u8; 3];
    assert_eq!(shim.read_file("/a", &mut buf, 0).await.expect("read succeeds"), 3);
    assert_eq!(buf, [0x41, 0x42, 0x43]);

    // Write-through: the backing file carries the bytes too.
    assert_eq!(std::fs::read(fixture.export_path("a")).unwrap(), [0x41, 0x42, 0x43]);
}

#[tokio::test]
async fn newer_write_shadows_older() {
    let fixture = Fixture::new();
    let shim = &fixture.shim;

    shim.create_file("/b").await.unwrap();
    assert_eq!(shim.write_file("/b", &[1; 8], 0).await.unwrap(), 8);
    assert_eq!(shim.write_file("/b", &[2; 3], 2).await.unwrap(), 3);

    let mut buf = [0u8; 8];
    assert_eq!(shim.read_file("/b", &mut buf, 0).await.unwrap(), 8);
    assert_eq!(buf, [1, 1, 2, 2, 2, 1, 1, 1]);
}

#[tokio::test]
async fn chunk_in_the_middle_splits_the_request() {
    let fixture = Fixture::new();
    let shim = &fixture.shim;

    shim.create_file("/c").await.unwrap();
    assert_eq!(shim.write_file("/c", &[9, 9], 3).await.unwrap(), 2);

    let mut buf = [0u8; 7];
    let count = shim.read_file("/c", &mut buf, 0).await.expect("read succeeds");
    // The cache serves [3, 5); the backend serves the sparse head with
    // zeros and has nothing past its five bytes.
    assert_eq!(count, 5);
    assert_eq!(buf, [0, 0, 0, 9, 9, 0, 0]);
}

#[tokio::test]
async fn stat_honors_the_metadata_ttl() {
    let fixture = Fixture::with_ttl(Duration::from_millis(400));
    let shim = &fixture.shim;

    std::fs::write(fixture.export_path("d"), b"1234").unwrap();
    assert_eq!(shim.stat("/d").await.expect("first stat").size, 4);

    // Grow the file behind the shim's back.
    std::fs::write(fixture.export_path("d"), b"123456789").unwrap();
    assert_eq!(shim.stat("/d").await.expect("cached stat").size, 4);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(shim.stat("/d").await.expect("refreshed stat").size, 9);
}

#[tokio::test]
async fn rename_rekeys_cached_descendants() {
    let fixture = Fixture::new();
    let shim = &fixture.shim;

    shim.create_directory("/dir").await.unwrap();
    shim.create_file("/dir/x").await.unwrap();
    shim.write_file("/dir/x", &[5; 6], 0).await.unwrap();
    let before = shim.stat("/dir/x").await.expect("populate cache");

    shim.rename("/dir", "/dir2").await.expect("rename succeeds");

    assert_eq!(shim.stat("/dir/x").await.expect_err("old path gone"), Error::NotExist);
    let after = shim.stat("/dir2/x").await.expect("new path resolves");
    assert_eq!(after.size, before.size);
    assert_eq!(after.mode, before.mode);
}

#[tokio::test]
async fn rename_round_trip_restores_content() {
    let fixture = Fixture::new();
    let shim = &fixture.shim;

    shim.create_file("/r").await.unwrap();
    shim.write_file("/r", b"payload", 0).await.unwrap();
    let original = shim.stat("/r").await.unwrap();

    shim.rename("/r", "/s").await.expect("first move");
    shim.rename("/s", "/r").await.expect("second move");

    let restored = shim.stat("/r").await.unwrap();
    assert_eq!(restored.size, original.size);
    assert_eq!(restored.mode, original.mode);
    let mut buf = [0u8; 7];
    assert_eq!(shim.read_file("/r", &mut buf, 0).await.unwrap(), 7);
    assert_eq!(&buf, b"payload");
}

#[tokio::test]
async fn remove_makes_the_path_unknown() {
    let fixture = Fixture::new();
    let shim = &fixture.shim;

    shim.create_file("/gone").await.unwrap();
    shim.write_file("/gone", &[1], 0).await.unwrap();
    shim.stat("/gone").await.expect("cached");

    shim.remove("/gone").await.expect("remove succeeds");
    assert_eq!(shim.stat("/gone").await.expect_err("stat after remove"), Error::NotExist);
}

#[tokio::test]
async fn new_directory_lists_empty() {
    let fixture = Fixture::new();
    let shim = &fixture.shim;

    shim.create_directory("/fresh").await.expect("mkdir succeeds");
    assert!(shim.read_directory("/fresh").await.expect("listing succeeds").is_empty());
}

#[tokio::test]
async fn directory_listing_is_cached_within_the_ttl() {
    let fixture = Fixture::with_ttl(Duration::from_millis(400));
    let shim = &fixture.shim;

    std::fs::write(fixture.export_path("seen"), b"x").unwrap();
    assert_eq!(shim.read_directory("/").await.unwrap().len(), 1);

    std::fs::write(fixture.export_path("late"), b"y").unwrap();
    assert_eq!(shim.read_directory("/").await.expect("cached listing").len(), 1);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(shim.read_directory("/").await.expect("refreshed listing").len(), 2);
}

#[tokio::test]
async fn mutations_refresh_the_parent_listing() {
    let fixture = Fixture::new();
    let shim = &fixture.shim;

    assert!(shim.read_directory("/").await.unwrap().is_empty());
    shim.create_file("/appears").await.unwrap();
    // Creation invalidated the cached listing even inside the TTL.
    assert_eq!(shim.read_directory("/").await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_write_keeps_a_readable_local_shadow() {
    let fixture = Fixture::new();
    let shim = &fixture.shim;

    shim.create_file("/ghost").await.unwrap();
    shim.write_file("/ghost", &[1, 2, 3], 0).await.unwrap();

    // Delete the backing file behind the shim's back; the cached entry
    // is still fresh, so the next write shadows locally and the
    // write-through fails.
    std::fs::remove_file(fixture.export_path("ghost")).unwrap();
    let err = shim.write_file("/ghost", &[7, 8, 9], 0).await.expect_err("backend write fails");
    assert_eq!(err, Error::NotExist);

    // Reads inside this process still see the shadowed bytes.
    let mut buf = [0u8; 3];
    assert_eq!(shim.read_file("/ghost", &mut buf, 0).await.expect("shadow read"), 3);
    assert_eq!(buf, [7, 8, 9]);
}

#[tokio::test]
async fn empty_write_is_a_no_op() {
    let fixture = Fixture::new();
    let shim = &fixture.shim;

    shim.create_file("/e").await.unwrap();
    assert_eq!(shim.write_file("/e", &[], 5).await.unwrap(), 0);
    assert_eq!(shim.stat("/e").await.unwrap().size, 0);
}

#[tokio::test]
async fn read_past_eof_returns_zero() {
    let fixture = Fixture::new();
    let shim = &fixture.shim;

    shim.create_file("/eof").await.unwrap();
    shim.write_file("/eof", &[1, 2], 0).await.unwrap();

    let mut buf = [0u8; 4];
    assert_eq!(shim.read_file("/eof", &mut buf, 10).await.expect("past-eof read"), 0);
    assert_eq!(shim.read_file("/eof", &mut [], 0).await.unwrap(), 0);
}

#[tokio::test]
async fn truncate_to_zero_empties_the_file() {
    let fixture = Fixture::new();
    let shim = &fixture.shim;

    shim.create_file("/t").await.unwrap();
    shim.write_file("/t", &[1; 10], 0).await.unwrap();

    shim.set_attribute("/t", "size", AttrValue::Size(0)).await.expect("truncate succeeds");
    assert_eq!(shim.stat("/t").await.unwrap().size, 0);
    let mut buf = [0u8; 10];
    assert_eq!(shim.read_file("/t", &mut buf, 0).await.unwrap(), 0);
}

#[tokio::test]
async fn write_at_a_far_offset_extends_the_size() {
    let fixture = Fixture::new();
    let shim = &fixture.shim;

    shim.create_file("/far").await.unwrap();
    shim.write_file("/far", &[9], 100).await.unwrap();
    assert_eq!(shim.stat("/far").await.unwrap().size, 101);
}

#[tokio::test]
async fn file_operations_on_directories_are_refused() {
    let fixture = Fixture::new();
    let shim = &fixture.shim;

    shim.create_directory("/d").await.unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(shim.read_file("/d", &mut buf, 0).await.expect_err("dir read"), Error::IsDir);
    assert_eq!(shim.write_file("/d", &[1], 0).await.expect_err("dir write"), Error::IsDir);
}

#[tokio::test]
async fn closing_the_shim_invalidates_every_call() {
    let fixture = Fixture::new();
    let shim = &fixture.shim;

    shim.create_file("/x").await.unwrap();
    shim.close().await.expect("close succeeds");

    assert_eq!(shim.stat("/x").await.expect_err("closed"), Error::Invalid);
    assert_eq!(shim.create_file("/y").await.expect_err("closed"), Error::Invalid);
    let mut buf = [0u8; 1];
    assert_eq!(shim.read_file("/x", &mut buf, 0).await.expect_err("closed"), Error::Invalid);
    assert!(shim.display_name().ends_with("(closed)"));
}

#[tokio::test]
async fn scratch_usage_respects_the_budget() {
    // A budget small enough that three writes must spill and then evict.
    let fixture = Fixture::with_config(Duration::from_secs(5), 16);
    let shim = &fixture.shim;

    for name in ["/s1", "/s2", "/s3"] {
        shim.create_file(name).await.unwrap();
        shim.write_file(name, &[name.as_bytes()[2]; 10], 0).await.unwrap();
    }

    assert!(fixture.spilled_bytes() <= 16, "spilled bytes stay within the budget");

    // Evicted ranges refill from the backend transparently.
    for name in ["/s1", "/s2", "/s3"] {
        let mut buf = [0u8; 10];
        assert_eq!(shim.read_file(name, &mut buf, 0).await.expect("read succeeds"), 10);
        assert_eq!(buf, [name.as_bytes()[2]; 10]);
    }
}

#[tokio::test]
async fn startup_purges_stale_spill_files() {
    let scratch = tempfile::TempDir::new().unwrap();
    let export = tempfile::TempDir::new().unwrap();
    std::fs::write(scratch.path().join("old-1.shimchunk"), b"stale").unwrap();

    let backend = nfs_gate::backend::os::OsBackend::new(export.path()).unwrap();
    let _shim = CacheShim::new(
        Box::new(backend),
        ShimConfig {
            scratch_dir: scratch.path().to_path_buf(),
            scratch_budget: 1024,
            metadata_ttl: Duration::from_secs(5),
        },
    )
    .expect("shim construction succeeds");

    assert!(!scratch.path().join("old-1.shimchunk").exists());
}

#[tokio::test]
async fn concurrent_readers_share_the_cache() {
    let fixture = Arc::new(Fixture::new());
    fixture.shim.create_file("/p").await.unwrap();
    fixture.shim.write_file("/p", &[7; 64], 0).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let fixture = Arc::clone(&fixture);
        tasks.push(tokio::spawn(async move {
            let mut buf = [0u8; 64];
            assert_eq!(fixture.shim.read_file("/p", &mut buf, 0).await.unwrap(), 64);
            assert_eq!(buf, [7u8; 64]);
        }));
    }
    for task in tasks {
        task.await.expect("reader task succeeds");
    }
}

#[tokio::test]
async fn shim_over_zip_refuses_writes() {
    let dir = tempfile::TempDir::new().unwrap();
    let scratch = tempfile::TempDir::new().unwrap();
    let archive = build_zip(dir.path());
    let shim = CacheShim::new(
        Box::new(ZipBackend::open(archive).unwrap()),
        ShimConfig {
            scratch_dir: scratch.path().to_path_buf(),
            scratch_budget: 1024,
            metadata_ttl: Duration::from_secs(5),
        },
    )
    .unwrap();

    let err = shim.write_file("/readme.txt", &[0], 0).await.expect_err("read-only");
    assert_eq!(err, Error::Permission);

    // Reads cache normally over the archive.
    let mut buf = [0u8; 8];
    assert_eq!(shim.read_file("/readme.txt", &mut buf, 0).await.unwrap(), 8);
    assert_eq!(&buf, b"archived");
    assert_eq!(shim.read_file("/readme.txt", &mut buf, 0).await.unwrap(), 8);
}
