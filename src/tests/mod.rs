#![cfg(test)]

mod gc_tests;
mod mvcc_tests;
mod serializable_tests;

use std::sync::Arc;

use crate::config::{EngineConfig, IndexConfig};
use crate::engine::Engine;
use crate::index::{MvTree, OpResult};
use crate::tuple::UpdateDescriptor;
use crate::worker::{IsolationLevel, TxMode, TxOptions, WorkerSession};

pub(crate) fn setup(workers: usize, config: IndexConfig) -> (Arc<Engine>, Arc<MvTree>) {
    let engine = Engine::new(EngineConfig { workers });
    let index = engine.create_index(config);
    (engine, index)
}

pub(crate) fn snapshot_tx() -> TxOptions {
    TxOptions {
        mode: TxMode::Oltp,
        isolation: IsolationLevel::SnapshotIsolation,
        single_statement: false,
    }
}

pub(crate) fn olap_tx() -> TxOptions {
    TxOptions {
        mode: TxMode::Olap,
        isolation: IsolationLevel::SnapshotIsolation,
        single_statement: false,
    }
}

pub(crate) fn serializable_tx() -> TxOptions {
    TxOptions {
        mode: TxMode::Oltp,
        isolation: IsolationLevel::Serializable,
        single_statement: false,
    }
}

pub(crate) fn get(index: &MvTree, session: &WorkerSession, key: &[u8]) -> Option<Vec<u8>> {
    let mut out = None;
    let result = index
        .lookup(session, key, |value| out = Some(value.to_vec()))
        .unwrap();
    match result {
        OpResult::Ok => out,
        _ => None,
    }
}

/// Same-size in-place overwrite of the byte range starting at `offset`.
pub(crate) fn patch(
    index: &MvTree,
    session: &WorkerSession,
    key: &[u8],
    offset: u16,
    bytes: &[u8],
) -> OpResult {
    let descriptor = UpdateDescriptor::single(offset, bytes.len() as u16);
    index
        .update_same_size_in_place(
            session,
            key,
            |value| {
                value[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
            },
            &descriptor,
        )
        .unwrap()
}
