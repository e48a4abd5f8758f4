use super::*;
use crate::index::OpResult;

#[test]
fn insert_then_lookup_from_other_worker() {
    let (engine, index) = setup(2, IndexConfig::default());
    let writer = engine.session(0).unwrap();
    let reader = engine.session(1).unwrap();

    assert_eq!(index.insert(&writer, b"k", b"v1").unwrap(), OpResult::Ok);
    assert_eq!(get(&index, &reader, b"k"), Some(b"v1".to_vec()));
    assert_eq!(get(&index, &reader, b"missing"), None);
}

#[test]
fn duplicate_insert_is_reported() {
    let (engine, index) = setup(1, IndexConfig::default());
    let session = engine.session(0).unwrap();

    assert_eq!(index.insert(&session, b"k", b"v").unwrap(), OpResult::Ok);
    assert_eq!(
        index.insert(&session, b"k", b"other").unwrap(),
        OpResult::Duplicate
    );
}

#[test]
fn snapshot_reader_walks_the_version_chain() {
    let (engine, index) = setup(2, IndexConfig::default());
    let writer = engine.session(0).unwrap();
    let reader = engine.session(1).unwrap();

    assert_eq!(index.insert(&writer, b"k", b"aaaa").unwrap(), OpResult::Ok);

    reader.begin(snapshot_tx()).unwrap();
    // Pin the snapshot before the writer changes anything.
    assert_eq!(get(&index, &reader, b"k"), Some(b"aaaa".to_vec()));

    assert_eq!(patch(&index, &writer, b"k", 2, b"bb"), OpResult::Ok);

    // The old reader still materialises its version through the chain.
    assert_eq!(get(&index, &reader, b"k"), Some(b"aaaa".to_vec()));
    reader.commit().unwrap();

    // A fresh reader sees the head.
    assert_eq!(get(&index, &reader, b"k"), Some(b"aabb".to_vec()));
}

#[test]
fn update_of_uncommitted_row_aborts() {
    let (engine, index) = setup(2, IndexConfig::default());
    let first = engine.session(0).unwrap();
    let second = engine.session(1).unwrap();

    assert_eq!(index.insert(&first, b"k", b"val0").unwrap(), OpResult::Ok);

    first.begin(snapshot_tx()).unwrap();
    assert_eq!(patch(&index, &first, b"k", 0, b"x"), OpResult::Ok);

    second.begin(snapshot_tx()).unwrap();
    assert_eq!(patch(&index, &second, b"k", 0, b"y"), OpResult::AbortTx);
    second.abort().unwrap();

    first.commit().unwrap();
    assert_eq!(get(&index, &second, b"k"), Some(b"xal0".to_vec()));
}

#[test]
fn abort_rolls_back_through_the_wal() {
    let (engine, index) = setup(1, IndexConfig::default());
    let session = engine.session(0).unwrap();

    assert_eq!(index.insert(&session, b"keep", b"orig-val").unwrap(), OpResult::Ok);

    session.begin(snapshot_tx()).unwrap();
    assert_eq!(index.insert(&session, b"fresh", b"temp").unwrap(), OpResult::Ok);
    assert_eq!(patch(&index, &session, b"keep", 0, b"XXXX"), OpResult::Ok);
    assert_eq!(index.remove(&session, b"keep").unwrap(), OpResult::Ok);
    assert_eq!(session.wal_len(), 3);
    session.abort().unwrap();

    // Everything the transaction touched is back to its pre-image.
    assert_eq!(get(&index, &session, b"fresh"), None);
    assert_eq!(get(&index, &session, b"keep"), Some(b"orig-val".to_vec()));
}

#[test]
fn remove_hides_the_row_and_double_remove_misses() {
    let (engine, index) = setup(1, IndexConfig::default());
    let session = engine.session(0).unwrap();

    assert_eq!(index.insert(&session, b"k", b"v").unwrap(), OpResult::Ok);
    assert_eq!(index.remove(&session, b"k").unwrap(), OpResult::Ok);
    assert_eq!(get(&index, &session, b"k"), None);
    assert_eq!(index.remove(&session, b"k").unwrap(), OpResult::NotFound);
    assert_eq!(patch(&index, &session, b"k", 0, b"z"), OpResult::NotFound);
}

#[test]
fn olap_reader_survives_remove_and_graveyard_move() {
    let (engine, index) = setup(2, IndexConfig::default());
    let writer = engine.session(0).unwrap();
    let reader = engine.session(1).unwrap();

    assert_eq!(index.insert(&writer, b"k", b"v-old").unwrap(), OpResult::Ok);

    reader.begin(olap_tx()).unwrap();
    assert_eq!(get(&index, &reader, b"k"), Some(b"v-old".to_vec()));

    assert_eq!(index.remove(&writer, b"k").unwrap(), OpResult::Ok);
    // Still visible through the tombstone's chain.
    assert_eq!(get(&index, &reader, b"k"), Some(b"v-old".to_vec()));

    // GC moves the tombstone to the graveyard: the OLTP watermark passed
    // the remove, the OLAP reader has not.
    engine.garbage_collect();
    assert!(index.graveyard_contains(b"k"));
    assert_eq!(get(&index, &reader, b"k"), Some(b"v-old".to_vec()));

    // An OLAP range scan merges the graveyard back in.
    let mut rows = Vec::new();
    index
        .scan_asc(&reader, b"", |key, value| {
            rows.push((key.to_vec(), value.to_vec()));
            true
        })
        .unwrap();
    assert_eq!(rows, vec![(b"k".to_vec(), b"v-old".to_vec())]);

    reader.commit().unwrap();

    // With the OLAP reader gone, the second todo purges the graveyard.
    engine.garbage_collect();
    assert!(!index.graveyard_contains(b"k"));
    assert_eq!(get(&index, &reader, b"k"), None);
    assert_eq!(engine.versions().pending_todo_count(), 0);
}

#[test]
fn updating_a_row_the_olap_reader_sees_only_in_the_graveyard_aborts() {
    let (engine, index) = setup(2, IndexConfig::default());
    let writer = engine.session(0).unwrap();
    let reader = engine.session(1).unwrap();

    assert_eq!(index.insert(&writer, b"k", b"v").unwrap(), OpResult::Ok);
    reader.begin(olap_tx()).unwrap();
    assert_eq!(index.remove(&writer, b"k").unwrap(), OpResult::Ok);
    engine.garbage_collect();
    assert!(index.graveyard_contains(b"k"));

    assert_eq!(patch(&index, &reader, b"k", 0, b"x"), OpResult::AbortTx);
    reader.abort().unwrap();
}

#[test]
fn inserts_split_leaves_without_losing_rows() {
    let config = IndexConfig {
        node_capacity: 512,
        ..IndexConfig::default()
    };
    let (engine, index) = setup(1, config);
    let session = engine.session(0).unwrap();

    let keys: Vec<Vec<u8>> = (0..200u32).map(|i| format!("row-{i:05}").into_bytes()).collect();
    for key in &keys {
        assert_eq!(
            index.insert(&session, key, b"payload-of-some-size").unwrap(),
            OpResult::Ok
        );
    }
    assert!(engine.buffer().page_count() > 2);

    // Every key is present exactly once, in order.
    let mut seen = Vec::new();
    index
        .scan_asc(&session, b"", |key, _| {
            seen.push(key.to_vec());
            true
        })
        .unwrap();
    assert_eq!(seen, keys);

    for key in &keys {
        assert_eq!(
            get(&index, &session, key),
            Some(b"payload-of-some-size".to_vec())
        );
    }
}

#[test]
fn scan_desc_walks_backwards() {
    let (engine, index) = setup(1, IndexConfig::default());
    let session = engine.session(0).unwrap();
    for i in 0..50u32 {
        index
            .insert(&session, format!("{i:04}").as_bytes(), b"v")
            .unwrap();
    }

    let mut seen = Vec::new();
    index
        .scan_desc(&session, b"9999", |key, _| {
            seen.push(key.to_vec());
            true
        })
        .unwrap();
    assert_eq!(seen.len(), 50);
    assert!(seen.windows(2).all(|w| w[0] > w[1]));

    // Early termination stops the scan.
    let mut count = 0;
    index
        .scan_desc(&session, b"9999", |_, _| {
            count += 1;
            count < 10
        })
        .unwrap();
    assert_eq!(count, 10);
}

#[test]
fn scan_desc_is_refused_for_olap() {
    let (engine, index) = setup(1, IndexConfig::default());
    let session = engine.session(0).unwrap();
    session.begin(olap_tx()).unwrap();
    assert!(index.scan_desc(&session, b"z", |_, _| true).is_err());
    session.abort().unwrap();
}

#[test]
fn version_elision_skips_secondary_versions() {
    let config = IndexConfig {
        enable_version_elision: true,
        ..IndexConfig::default()
    };
    let (engine, index) = setup(1, config);
    let session = engine.session(0).unwrap();
    session.set_default_tx_options(TxOptions {
        isolation: IsolationLevel::ReadCommitted,
        single_statement: true,
        ..TxOptions::default()
    });

    assert_eq!(index.insert(&session, b"k", b"abcd").unwrap(), OpResult::Ok);
    assert_eq!(patch(&index, &session, b"k", 0, b"xy"), OpResult::Ok);
    assert_eq!(get(&index, &session, b"k"), Some(b"xycd".to_vec()));
    // All workers ran read-committed single-statement: no version filed.
    assert_eq!(engine.versions().entry_count(), 0);
}

#[test]
fn forced_remove_reclaims_structurally() {
    let config = IndexConfig {
        forced_remove: true,
        ..IndexConfig::default()
    };
    let (engine, index) = setup(1, config);
    let session = engine.session(0).unwrap();

    assert_eq!(index.insert(&session, b"k", b"v").unwrap(), OpResult::Ok);
    assert_eq!(index.remove(&session, b"k").unwrap(), OpResult::Ok);
    assert_eq!(get(&index, &session, b"k"), None);
    // No remove version is staged in benchmark mode.
    assert_eq!(engine.versions().pending_todo_count(), 0);
}

#[test]
fn tree_hooks_expose_structure() {
    use crate::engine::TreeHooks;

    let config = IndexConfig {
        node_capacity: 512,
        ..IndexConfig::default()
    };
    let (engine, index) = setup(1, config);
    let session = engine.session(0).unwrap();
    for i in 0..60u32 {
        index
            .insert(&session, format!("s{i:03}").as_bytes(), b"payload-bytes")
            .unwrap();
    }

    let state = index.serialize();
    assert!(state.iter().any(|(name, _)| name == "primary_root"));
    assert!(state.iter().any(|(name, _)| name == "graveyard_root"));

    let pages = index.primary_page_ids();
    assert!(pages.len() > 1, "the tree must have split");
    for child in &pages[1..] {
        let parent = index.find_parent(*child).expect("child must have a parent");
        let mut children = Vec::new();
        index.iterate_children(parent, &mut |id| children.push(id));
        assert!(children.contains(child));
    }
    index.checkpoint();
}

#[test]
fn oversized_entries_report_not_enough_space() {
    let config = IndexConfig {
        node_capacity: 256,
        ..IndexConfig::default()
    };
    let (engine, index) = setup(1, config);
    let session = engine.session(0).unwrap();

    let huge = vec![7u8; 1024];
    assert_eq!(
        index.insert(&session, b"big", &huge).unwrap(),
        OpResult::NotEnoughSpace
    );
}
