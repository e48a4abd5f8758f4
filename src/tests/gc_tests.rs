use super::*;
use crate::index::OpResult;
use crate::tuple::TupleFormat;

#[test]
fn dangling_pointer_fast_path_reclaims_the_slot() {
    let (engine, index) = setup(1, IndexConfig::default());
    let session = engine.session(0).unwrap();

    assert_eq!(index.insert(&session, b"k", b"v").unwrap(), OpResult::Ok);
    assert_eq!(index.remove(&session, b"k").unwrap(), OpResult::Ok);
    assert_eq!(engine.versions().pending_todo_count(), 1);

    // Nothing touched the page since the remove: the recorded latch
    // version still matches and the slot is reclaimed in place.
    engine.garbage_collect();
    assert_eq!(engine.versions().pending_todo_count(), 0);
    assert_eq!(engine.versions().entry_count(), 0);
    assert!(!index.graveyard_contains(b"k"));
    assert_eq!(get(&index, &session, b"k"), None);
    assert_eq!(index.head_format(b"k"), None);
}

#[test]
fn stale_dangling_pointer_falls_back_to_the_slow_path() {
    let (engine, index) = setup(1, IndexConfig::default());
    let session = engine.session(0).unwrap();

    assert_eq!(index.insert(&session, b"k", b"v").unwrap(), OpResult::Ok);
    assert_eq!(index.remove(&session, b"k").unwrap(), OpResult::Ok);
    // Another write on the same leaf bumps the latch; the pin is stale.
    assert_eq!(index.insert(&session, b"other", b"w").unwrap(), OpResult::Ok);

    engine.garbage_collect();
    assert_eq!(engine.versions().pending_todo_count(), 0);
    assert_eq!(index.head_format(b"k"), None);
    assert_eq!(get(&index, &session, b"other"), Some(b"w".to_vec()));
}

#[test]
fn todo_without_dangling_pointers_uses_the_descent() {
    let config = IndexConfig {
        enable_dangling_pointer: false,
        ..IndexConfig::default()
    };
    let (engine, index) = setup(1, config);
    let session = engine.session(0).unwrap();

    assert_eq!(index.insert(&session, b"k", b"v").unwrap(), OpResult::Ok);
    assert_eq!(index.remove(&session, b"k").unwrap(), OpResult::Ok);

    engine.garbage_collect();
    assert_eq!(engine.versions().pending_todo_count(), 0);
    assert_eq!(index.head_format(b"k"), None);
}

#[test]
fn todo_skips_a_slot_rewritten_by_rollback() {
    let (engine, index) = setup(1, IndexConfig::default());
    let session = engine.session(0).unwrap();

    assert_eq!(index.insert(&session, b"k", b"v").unwrap(), OpResult::Ok);
    session.begin(snapshot_tx()).unwrap();
    assert_eq!(index.remove(&session, b"k").unwrap(), OpResult::Ok);
    session.abort().unwrap();

    // The staged todo belongs to the aborted remove; the restored slot
    // must not be reclaimed.
    engine.garbage_collect();
    assert_eq!(get(&index, &session, b"k"), Some(b"v".to_vec()));
}

#[test]
fn fat_promotion_and_rollback_restore_exact_bytes() {
    // A single worker makes the promotion gate deterministic.
    let (engine, index) = setup(1, IndexConfig::default());
    let session = engine.session(0).unwrap();

    assert_eq!(index.insert(&session, b"k", b"00000000").unwrap(), OpResult::Ok);
    // Committed updates by earlier transactions qualify the tuple; with a
    // one-worker registry the random gate always fires, so one of these
    // promotes and the rest land as inline deltas.
    for i in 1..=10u8 {
        assert_eq!(patch(&index, &session, b"k", 0, &[b'0' + i]), OpResult::Ok);
    }
    assert_eq!(patch(&index, &session, b"k", 1, b"Z"), OpResult::Ok);
    assert_eq!(index.head_format(b"k"), Some(TupleFormat::Fat));
    assert_eq!(get(&index, &session, b"k"), Some(b":Z000000".to_vec()));

    // Rolling back a fat update pops its delta and restores the bytes.
    session.begin(snapshot_tx()).unwrap();
    assert_eq!(patch(&index, &session, b"k", 2, b"QQ"), OpResult::Ok);
    assert_eq!(get(&index, &session, b"k"), Some(b":ZQQ0000".to_vec()));
    session.abort().unwrap();
    assert_eq!(get(&index, &session, b"k"), Some(b":Z000000".to_vec()));
}

#[test]
fn leaf_gc_decomposes_fat_tuples_and_keeps_history_readable() {
    let (engine, index) = setup(2, IndexConfig::default());
    let writer = engine.session(0).unwrap();
    let reader = engine.session(1).unwrap();

    assert_eq!(index.insert(&writer, b"k", b"00000000").unwrap(), OpResult::Ok);
    for i in 1..=10u8 {
        assert_eq!(patch(&index, &writer, b"k", 0, &[b'0' + i]), OpResult::Ok);
    }
    // Force the promotion gate despite the two-worker registry.
    let mut promoted = false;
    for _ in 0..64 {
        assert_eq!(patch(&index, &writer, b"k", 1, b"A"), OpResult::Ok);
        if index.head_format(b"k") == Some(TupleFormat::Fat) {
            promoted = true;
            break;
        }
    }
    assert!(promoted, "promotion gate never fired");

    // Pin a snapshot, then push one more fat update past it.
    reader.begin(snapshot_tx()).unwrap();
    let before = get(&index, &reader, b"k").unwrap();
    assert_eq!(patch(&index, &writer, b"k", 2, b"WW"), OpResult::Ok);
    assert_eq!(get(&index, &reader, b"k"), Some(before.clone()));

    // Run the space check over the index pages until the decompose fires.
    let mut decomposed = false;
    for page_id in index.primary_page_ids() {
        if engine.check_space_utilization(page_id)
            == crate::buffer::SpaceCheckResult::RestartSame
        {
            decomposed = true;
        }
    }
    assert!(decomposed, "leaf garbage collection never ran");
    assert_eq!(index.head_format(b"k"), Some(TupleFormat::Chained));

    // The streamed-out deltas keep the old snapshot readable, and the
    // head still carries the newest bytes.
    assert_eq!(get(&index, &reader, b"k"), Some(before.clone()));
    reader.commit().unwrap();
    let latest = get(&index, &reader, b"k").unwrap();
    assert_eq!(&latest[2..4], b"WW");
    assert_eq!(latest[..2], before[..2]);
}
