#![cfg(test)]

use crate::shim::chunk::Chunk;

#[test]
fn read_range_copies_the_intersection() {
    let chunk = Chunk::new(10, &[1, 2, 3, 4, 5], false);
    let mut dest = [0u8; 8];

    // Request [8, 16) against chunk [10, 15).
    let served = chunk.read_range((8, 16), &mut dest, 8).expect("overlap served");
    assert_eq!(served, (10, 15));
    assert_eq!(dest, [0, 0, 1, 2, 3, 4, 5, 0]);
}

#[test]
fn read_range_rejects_disjoint_requests() {
    let chunk = Chunk::new(10, &[1, 2, 3], false);
    let mut dest = [0u8; 4];
    assert!(chunk.read_range((0, 4), &mut dest, 0).is_none());
    assert!(chunk.read_range((13, 17), &mut dest, 13).is_none());
}

#[test]
fn spill_moves_payload_to_disk_and_stays_readable() {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let chunk = Chunk::new(4, &[7, 8, 9], true);
    let target = dir.path().join("c.shimchunk");

    assert_eq!(chunk.spill(target.clone()).expect("spill succeeds"), 3);
    assert!(target.exists());
    // Idempotent on a second call.
    assert_eq!(chunk.spill(target.clone()).expect("second spill is a no-op"), 0);

    let mut dest = [0u8; 3];
    let served = chunk.read_range((4, 7), &mut dest, 4).expect("reads from spill");
    assert_eq!(served, (4, 7));
    assert_eq!(dest, [7, 8, 9]);

    let fp = chunk.footprint();
    assert_eq!(fp.mem_bytes, 0);
    assert_eq!(fp.disk_bytes, 3);
}

#[test]
fn tombstone_frees_everything_and_blocks_reads() {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let chunk = Chunk::new(0, &[1, 2, 3, 4], true);
    let target = dir.path().join("t.shimchunk");
    chunk.spill(target.clone()).unwrap();

    let (mem_freed, disk_freed) = chunk.tombstone();
    assert_eq!(mem_freed, 0);
    assert_eq!(disk_freed, 4);
    assert!(!target.exists());
    assert!(chunk.live_end().is_none());

    let mut dest = [0u8; 4];
    assert!(chunk.read_range((0, 4), &mut dest, 0).is_none());
}

#[test]
fn mark_synced_flips_the_flag() {
    let chunk = Chunk::new(0, &[1], false);
    assert!(!chunk.is_synced());
    chunk.mark_synced();
    assert!(chunk.is_synced());
}
