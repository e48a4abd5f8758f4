use super::*;
use crate::index::OpResult;

#[test]
fn stale_writer_aborts_on_read_timestamp() {
    let (engine, index) = setup(2, IndexConfig::default());
    let writer = engine.session(0).unwrap();
    let reader = engine.session(1).unwrap();

    assert_eq!(index.insert(&writer, b"k", b"base").unwrap(), OpResult::Ok);

    // The writer's timestamp predates the reader's.
    writer.begin(serializable_tx()).unwrap();
    reader.begin(serializable_tx()).unwrap();

    assert_eq!(get(&index, &reader, b"k"), Some(b"base".to_vec()));
    // The read stamped the tuple; an older writer must not overwrite it.
    assert_eq!(patch(&index, &writer, b"k", 0, b"x"), OpResult::AbortTx);
    writer.abort().unwrap();

    // The reader itself may still write: its timestamp covers the stamp.
    assert_eq!(patch(&index, &reader, b"k", 0, b"y"), OpResult::Ok);
    reader.commit().unwrap();

    assert_eq!(get(&index, &writer, b"k"), Some(b"yase".to_vec()));
}

#[test]
fn two_phase_locking_blocks_writers_until_commit() {
    let config = IndexConfig {
        two_phase_locking: true,
        ..IndexConfig::default()
    };
    let (engine, index) = setup(2, config);
    let reader = engine.session(0).unwrap();
    let writer = engine.session(1).unwrap();

    assert_eq!(index.insert(&reader, b"k", b"base").unwrap(), OpResult::Ok);

    reader.begin(serializable_tx()).unwrap();
    assert_eq!(get(&index, &reader, b"k"), Some(b"base".to_vec()));

    // A foreign read lock is held: the writer aborts.
    writer.begin(serializable_tx()).unwrap();
    assert_eq!(patch(&index, &writer, b"k", 0, b"x"), OpResult::AbortTx);
    writer.abort().unwrap();

    // Commit releases the reader's lock bit; the writer gets through.
    reader.commit().unwrap();
    writer.begin(serializable_tx()).unwrap();
    assert_eq!(patch(&index, &writer, b"k", 0, b"x"), OpResult::Ok);
    writer.commit().unwrap();

    // The writer's own lock bit was released at commit as well.
    reader.begin(serializable_tx()).unwrap();
    assert_eq!(patch(&index, &reader, b"k", 1, b"z"), OpResult::Ok);
    reader.commit().unwrap();

    assert_eq!(get(&index, &writer, b"k"), Some(b"xzse".to_vec()));
}

#[test]
fn two_phase_locking_remove_respects_foreign_read_locks() {
    let config = IndexConfig {
        two_phase_locking: true,
        ..IndexConfig::default()
    };
    let (engine, index) = setup(2, config);
    let reader = engine.session(0).unwrap();
    let remover = engine.session(1).unwrap();

    assert_eq!(index.insert(&reader, b"k", b"v").unwrap(), OpResult::Ok);

    reader.begin(serializable_tx()).unwrap();
    assert_eq!(get(&index, &reader, b"k"), Some(b"v".to_vec()));

    remover.begin(serializable_tx()).unwrap();
    assert_eq!(index.remove(&remover, b"k").unwrap(), OpResult::AbortTx);
    remover.abort().unwrap();

    reader.commit().unwrap();
    assert_eq!(index.remove(&remover, b"k").unwrap(), OpResult::Ok);
}

#[test]
fn serializable_remove_aborts_on_newer_read_timestamp() {
    let (engine, index) = setup(2, IndexConfig::default());
    let remover = engine.session(0).unwrap();
    let reader = engine.session(1).unwrap();

    assert_eq!(index.insert(&remover, b"k", b"v").unwrap(), OpResult::Ok);

    remover.begin(serializable_tx()).unwrap();
    reader.begin(serializable_tx()).unwrap();
    assert_eq!(get(&index, &reader, b"k"), Some(b"v".to_vec()));

    assert_eq!(index.remove(&remover, b"k").unwrap(), OpResult::AbortTx);
    remover.abort().unwrap();
    reader.commit().unwrap();
}
