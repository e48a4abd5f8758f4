mod reconstruct;

pub use reconstruct::{reconstruct_tuple, Reconstructed};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, warn};
use rand::Rng;

use crate::buffer::{BufferManager, PageId, SpaceCheckResult, TreeId, INVALID_PAGE_ID};
use crate::config::IndexConfig;
use crate::engine::{GcContext, TreeHooks};
use crate::error::{MvTreeError, MvTreeResult};
use crate::latch::{LatchResult, Restart};
use crate::tree::iterator::{collect_desc, collect_from, collect_page, insert_kv};
use crate::tree::node::{LeafNode, Node};
use crate::tree::{ExclusiveIterator, OptimisticPageGuard, SharedIterator, TreeCore};
use crate::tuple::{
    ChainedTuple, FatDelta, FatTuple, FatUpdateOutcome, TupleFormat, TupleHeader, UpdateDescriptor,
    VersionTriple, TUPLE_HEADER_LEN,
};
use crate::version::{
    decode_version, DanglingPointer, RemoveVersion, TodoOutcome, UpdateVersion, VersionPayload,
    VersionStore,
};
use crate::wal::{
    decode_unlock_entry, encode_unlock_entry, UnlockEntry, WalInsert, WalRecord, WalRemove,
    WalUpdate,
};
use crate::worker::{TxId, WorkerId, WorkerRegistry, WorkerSession, INVALID_COMMAND_ID};

/// Outcome of one consumer-facing index operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpResult {
    Ok,
    NotFound,
    Duplicate,
    AbortTx,
    NotEnoughSpace,
    Other,
}

// Bounded restart spinning before backing off, as in the OLC descent
// loops elsewhere in the ecosystem.
const MAX_SPIN_RESTARTS: usize = 64;
const BACKOFF_BASE_US: u64 = 50;

fn run_restartable<T>(mut body: impl FnMut() -> LatchResult<T>) -> T {
    let mut attempts = 0usize;
    loop {
        match body() {
            Ok(value) => return value,
            Err(Restart) => {
                attempts += 1;
                if attempts > MAX_SPIN_RESTARTS {
                    let backoff = BACKOFF_BASE_US * ((attempts - MAX_SPIN_RESTARTS) as u64).min(20);
                    std::thread::sleep(Duration::from_micros(backoff));
                } else {
                    std::hint::spin_loop();
                }
            }
        }
    }
}

/// Multi-version transactional B-tree index. Maps opaque byte keys to
/// opaque byte values; every leaf slot is a primary tuple carrying its own
/// MVCC state. Removed rows that long-running readers may still need live
/// in a graveyard twin keyed identically.
pub struct MvTree {
    primary: TreeCore,
    graveyard: TreeCore,
    config: IndexConfig,
    versions: Arc<VersionStore>,
    registry: Arc<WorkerRegistry>,
}

impl MvTree {
    pub(crate) fn new(
        buffer: Arc<BufferManager>,
        versions: Arc<VersionStore>,
        registry: Arc<WorkerRegistry>,
        config: IndexConfig,
        primary_id: TreeId,
        graveyard_id: TreeId,
    ) -> Self {
        let primary = TreeCore::create(buffer.clone(), primary_id, config.node_capacity);
        let graveyard = TreeCore::create(buffer, graveyard_id, config.node_capacity);
        Self {
            primary,
            graveyard,
            config,
            versions,
            registry,
        }
    }

    pub fn tree_id(&self) -> TreeId {
        self.primary.tree_id()
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    fn reconstruct(&self, session: &WorkerSession, payload: &[u8]) -> Reconstructed {
        reconstruct_tuple(session, &self.versions, payload, self.config.max_chain_length)
    }

    // ------------------------------------------------------------------
    // lookup

    pub fn lookup(
        &self,
        session: &WorkerSession,
        key: &[u8],
        mut consumer: impl FnMut(&[u8]),
    ) -> MvTreeResult<OpResult> {
        session.ensure_active_tx()?;
        let result = if session.is_serializable() || session.is_olap() {
            self.lookup_pessimistic(session, key, &mut consumer)
        } else {
            match self.lookup_optimistic(session, key, &mut consumer) {
                Some(result) => result,
                None => self.lookup_pessimistic(session, key, &mut consumer),
            }
        };
        if result == OpResult::AbortTx {
            session.maybe_auto_abort()?;
        } else {
            session.maybe_auto_commit()?;
        }
        Ok(result)
    }

    /// Optimistic point read: deliver the head version when it is visible,
    /// `None` to fall back to the pessimistic path.
    fn lookup_optimistic(
        &self,
        session: &WorkerSession,
        key: &[u8],
        consumer: &mut impl FnMut(&[u8]),
    ) -> Option<OpResult> {
        for _ in 0..MAX_SPIN_RESTARTS {
            match self.try_lookup_optimistic(session, key, consumer) {
                Ok(outcome) => return outcome,
                Err(Restart) => continue,
            }
        }
        None
    }

    fn try_lookup_optimistic(
        &self,
        session: &WorkerSession,
        key: &[u8],
        consumer: &mut impl FnMut(&[u8]),
    ) -> LatchResult<Option<OpResult>> {
        let guard = self.primary.find_leaf_optimistic(key)?;
        let leaf = guard.node().as_leaf();
        let (slot, exact) = leaf.lower_bound(key);
        if !exact {
            guard.recheck()?;
            return Ok(Some(OpResult::NotFound));
        }
        let payload = leaf.payload(slot);
        let header = TupleHeader::decode(payload);
        if !session.is_visible(header.worker_id, header.tx_id) {
            // The visible version is not the head; chain walking needs the
            // pessimistic path.
            return Ok(None);
        }
        if header.is_removed() {
            guard.recheck()?;
            return Ok(Some(OpResult::NotFound));
        }
        let value = match header.format {
            TupleFormat::Chained => Bytes::copy_from_slice(ChainedTuple::value(payload)),
            TupleFormat::Fat => {
                let fat = FatTuple::decode(payload).expect("fat tuple payload must decode");
                Bytes::from(fat.value)
            }
        };
        guard.recheck()?;
        drop(guard);
        consumer(&value);
        Ok(Some(OpResult::Ok))
    }

    fn lookup_pessimistic(
        &self,
        session: &WorkerSession,
        key: &[u8],
        consumer: &mut impl FnMut(&[u8]),
    ) -> OpResult {
        if session.is_serializable() {
            run_restartable(|| self.try_lookup_serializable(session, key, consumer))
        } else {
            run_restartable(|| self.try_lookup_shared(session, key, consumer))
        }
    }

    fn try_lookup_shared(
        &self,
        session: &WorkerSession,
        key: &[u8],
        consumer: &mut impl FnMut(&[u8]),
    ) -> LatchResult<OpResult> {
        let Some(iterator) = SharedIterator::seek_exact(&self.primary, key)? else {
            return self.lookup_miss(session, key, consumer);
        };
        let outcome = self.reconstruct(session, iterator.payload());
        drop(iterator);
        match outcome {
            Reconstructed::Found(value) => {
                consumer(&value);
                Ok(OpResult::Ok)
            }
            Reconstructed::NotFound => {
                if session.is_olap() {
                    self.graveyard_probe(session, key, consumer)
                } else {
                    Ok(OpResult::NotFound)
                }
            }
        }
    }

    /// Serializable reads go through the exclusive latch so the read
    /// timestamp (or the 2PL read-lock bit) can be recorded on the tuple.
    fn try_lookup_serializable(
        &self,
        session: &WorkerSession,
        key: &[u8],
        consumer: &mut impl FnMut(&[u8]),
    ) -> LatchResult<OpResult> {
        let Some(mut iterator) = ExclusiveIterator::seek_exact(&self.primary, key)? else {
            return self.lookup_miss(session, key, consumer);
        };
        let outcome = self.reconstruct(session, iterator.payload());
        if let Reconstructed::Found(value) = outcome {
            let mut header = TupleHeader::decode(iterator.payload());
            if self.config.two_phase_locking {
                header.add_read_lock(session.worker_id());
                session.queue_unlock(
                    self.primary.tree_id(),
                    encode_unlock_entry(&UnlockEntry { key: key.to_vec() }),
                );
            } else {
                header.read_stamp = header.read_stamp.max(session.tts());
            }
            header.encode_into(iterator.payload_mut());
            iterator.mark_dirty();
            drop(iterator);
            consumer(&value);
            return Ok(OpResult::Ok);
        }
        drop(iterator);
        if session.is_olap() {
            self.graveyard_probe(session, key, consumer)
        } else {
            Ok(OpResult::NotFound)
        }
    }

    fn lookup_miss(
        &self,
        session: &WorkerSession,
        key: &[u8],
        consumer: &mut impl FnMut(&[u8]),
    ) -> LatchResult<OpResult> {
        if session.is_olap() {
            self.graveyard_probe(session, key, consumer)
        } else {
            Ok(OpResult::NotFound)
        }
    }

    fn graveyard_probe(
        &self,
        session: &WorkerSession,
        key: &[u8],
        consumer: &mut impl FnMut(&[u8]),
    ) -> LatchResult<OpResult> {
        let Some(iterator) = SharedIterator::seek_exact(&self.graveyard, key)? else {
            return Ok(OpResult::NotFound);
        };
        let outcome = self.reconstruct(session, iterator.payload());
        drop(iterator);
        match outcome {
            Reconstructed::Found(value) => {
                consumer(&value);
                Ok(OpResult::Ok)
            }
            Reconstructed::NotFound => Ok(OpResult::NotFound),
        }
    }

    // ------------------------------------------------------------------
    // insert

    pub fn insert(
        &self,
        session: &WorkerSession,
        key: &[u8],
        value: &[u8],
    ) -> MvTreeResult<OpResult> {
        session.ensure_active_tx()?;
        session.wal_ensure_enough_space(key.len() + value.len() + 64);
        let payload_len = TUPLE_HEADER_LEN + value.len();
        let result = if !self.primary.entry_fits_empty_leaf(key.len(), payload_len) {
            OpResult::NotEnoughSpace
        } else {
            run_restartable(|| self.try_insert(session, key, value))
        };
        self.finish_statement(session, result)?;
        Ok(result)
    }

    fn try_insert(
        &self,
        session: &WorkerSession,
        key: &[u8],
        value: &[u8],
    ) -> LatchResult<OpResult> {
        let payload_len = TUPLE_HEADER_LEN + value.len();
        let mut split_attempts = 0usize;
        loop {
            let (mut iterator, duplicate) = ExclusiveIterator::seek_to_insert(&self.primary, key)?;
            if duplicate {
                let header = TupleHeader::decode(iterator.payload());
                if header.is_write_locked() || !session.is_visible(header.worker_id, header.tx_id)
                {
                    return Ok(OpResult::AbortTx);
                }
                if header.is_removed() {
                    // Known gap: the previous row was removed but not yet
                    // garbage collected.
                    error!("insert hit a removed, not yet collected key");
                    debug_assert!(false, "insert over a removed key is unsupported");
                    return Ok(OpResult::Other);
                }
                return Ok(OpResult::Duplicate);
            }
            if !iterator.has_space_for(key.len(), payload_len) {
                drop(iterator);
                split_attempts += 1;
                if split_attempts > 32 {
                    return Ok(OpResult::NotEnoughSpace);
                }
                self.primary
                    .split_for_key(key, LeafNode::entry_size(key.len(), payload_len));
                continue;
            }
            session.wal_append(
                self.primary.tree_id(),
                &WalRecord::Insert(WalInsert {
                    key: key.to_vec(),
                    value: value.to_vec(),
                }),
            );
            let header = TupleHeader::new_chained(session.worker_id(), session.tts());
            iterator.insert_here(key.to_vec(), ChainedTuple::materialize(&header, value));
            iterator.mark_dirty();
            return Ok(OpResult::Ok);
        }
    }

    // ------------------------------------------------------------------
    // update

    pub fn update_same_size_in_place(
        &self,
        session: &WorkerSession,
        key: &[u8],
        mut mutator: impl FnMut(&mut [u8]),
        descriptor: &UpdateDescriptor,
    ) -> MvTreeResult<OpResult> {
        session.ensure_active_tx()?;
        session.wal_ensure_enough_space(key.len() + descriptor.diff_len() + 64);
        let result = run_restartable(|| self.try_update(session, key, &mut mutator, descriptor));
        self.finish_statement(session, result)?;
        Ok(result)
    }

    fn try_update(
        &self,
        session: &WorkerSession,
        key: &[u8],
        mutator: &mut impl FnMut(&mut [u8]),
        descriptor: &UpdateDescriptor,
    ) -> LatchResult<OpResult> {
        let mut tried_fat_promotion = false;
        let Some(mut iterator) = ExclusiveIterator::seek_exact(&self.primary, key)? else {
            if session.is_olap() && self.graveyard_holds(key)? {
                return Ok(OpResult::AbortTx);
            }
            return Ok(OpResult::NotFound);
        };
        loop {
            let mut header = TupleHeader::decode(iterator.payload());
            if header.is_write_locked() || !session.is_visible(header.worker_id, header.tx_id) {
                return Ok(OpResult::AbortTx);
            }
            if session.is_serializable() {
                if self.config.two_phase_locking {
                    if header.has_foreign_read_lock(session.worker_id()) {
                        return Ok(OpResult::AbortTx);
                    }
                } else if header.read_stamp > session.tts() {
                    return Ok(OpResult::AbortTx);
                }
            }
            if header.format == TupleFormat::Chained && header.is_removed() {
                return Ok(OpResult::NotFound);
            }
            header.write_lock();
            header.encode_into(iterator.payload_mut());

            if header.format == TupleFormat::Fat {
                return self.update_fat(session, iterator, key, mutator, descriptor);
            }

            let promote = self.config.enable_fat_tuple
                && !tried_fat_promotion
                && header.can_convert_to_fat()
                && header.command_id != INVALID_COMMAND_ID
                && !(header.worker_id == session.worker_id() && header.tx_id == session.tts())
                && header.tx_id < session.local_oltp_lwm()
                && rand::thread_rng().gen_range(0..self.registry.workers() as u64) == 0;
            if promote {
                tried_fat_promotion = true;
                if self.promote_chained_to_fat(&mut iterator) {
                    iterator.set_has_garbage();
                    debug!("promoted chained tuple to fat");
                }
                // The promotion attempt released the tuple lock either
                // way; redo the checks on the rewritten slot.
                continue;
            }
            return self.update_chained(session, iterator, key, mutator, descriptor, header);
        }
    }

    fn update_chained(
        &self,
        session: &WorkerSession,
        mut iterator: ExclusiveIterator<'_>,
        key: &[u8],
        mutator: &mut impl FnMut(&mut [u8]),
        descriptor: &UpdateDescriptor,
        mut header: TupleHeader,
    ) -> LatchResult<OpResult> {
        let value_len = iterator.payload().len() - TUPLE_HEADER_LEN;
        if !descriptor.fits(value_len) {
            error!("update descriptor exceeds the value bounds");
            header.write_unlock();
            header.encode_into(iterator.payload_mut());
            return Ok(OpResult::Other);
        }

        let mut skip_version = self.config.forced_chained_update || !self.config.enable_mvcc;
        if !skip_version && self.config.enable_version_elision {
            // Elision applies when this statement auto-commits and every
            // worker runs in-progress-and-idle (read-committed,
            // single-statement).
            skip_version = session.is_single_statement() && self.registry.all_workers_idle();
        }

        let command_id = session.next_command_id();
        let before = header.triple();

        let mut diff = vec![0u8; descriptor.diff_len()];
        {
            let value = ChainedTuple::value_mut(iterator.payload_mut());
            descriptor.xor_ranges(&mut diff, value);
            mutator(value);
            descriptor.xor_ranges(&mut diff, value);
        }

        // The secondary version is in place before the primary header
        // points at it; chain readers never observe a dangling command id.
        if !skip_version {
            let mut body = Vec::with_capacity(descriptor.encoded_size() + diff.len());
            descriptor.encode_into(&mut body);
            body.extend_from_slice(&diff);
            self.versions.put_update(
                VersionTriple::new(session.worker_id(), session.tts(), command_id),
                &UpdateVersion {
                    before,
                    is_delta: true,
                    body,
                },
            );
        }

        session.wal_append(
            self.primary.tree_id(),
            &WalRecord::Update(WalUpdate {
                key: key.to_vec(),
                before,
                descriptor: descriptor.clone(),
                diff,
            }),
        );

        header.set_triple(VersionTriple::new(
            session.worker_id(),
            session.tts(),
            command_id,
        ));
        self.stamp_serializable(session, &mut header, key);
        header.write_unlock();
        header.encode_into(iterator.payload_mut());
        iterator.mark_dirty();
        Ok(OpResult::Ok)
    }

    fn update_fat(
        &self,
        session: &WorkerSession,
        mut iterator: ExclusiveIterator<'_>,
        key: &[u8],
        mutator: &mut impl FnMut(&mut [u8]),
        descriptor: &UpdateDescriptor,
    ) -> LatchResult<OpResult> {
        let mut fat = FatTuple::decode(iterator.payload()).expect("fat tuple payload must decode");
        let command_id = session.next_command_id();
        let writer = VersionTriple::new(session.worker_id(), session.tts(), command_id);
        match fat.update(
            writer,
            descriptor,
            |value| mutator(value),
            self.config.fat_tuple_delta_capacity,
            self.config.fat_tuple_max_deltas,
        ) {
            FatUpdateOutcome::TooLarge => {
                warn!("fat tuple cannot absorb the update delta");
                let mut header = TupleHeader::decode(iterator.payload());
                header.write_unlock();
                header.encode_into(iterator.payload_mut());
                Ok(OpResult::Other)
            }
            FatUpdateOutcome::Applied {
                before,
                diff,
                evicted,
            } => {
                self.stamp_serializable(session, &mut fat.header, key);
                fat.header.write_unlock();
                let encoded = fat.encode();
                let growth = encoded.len().saturating_sub(iterator.payload().len());
                if growth > 0 && iterator.free_space() < growth {
                    // Not enough room to grow the slot: release the tuple
                    // lock untouched, make room and redo the operation.
                    let mut header = TupleHeader::decode(iterator.payload());
                    header.write_unlock();
                    header.encode_into(iterator.payload_mut());
                    let needed = LeafNode::entry_size(key.len(), encoded.len());
                    drop(iterator);
                    self.primary.split_for_key(key, needed);
                    return Err(Restart);
                }
                for (successor, delta) in evicted {
                    self.file_delta_as_version(successor, &delta);
                }
                session.wal_append(
                    self.primary.tree_id(),
                    &WalRecord::Update(WalUpdate {
                        key: key.to_vec(),
                        before,
                        descriptor: descriptor.clone(),
                        diff,
                    }),
                );
                iterator.replace_payload(encoded);
                iterator.mark_dirty();
                Ok(OpResult::Ok)
            }
        }
    }

    fn file_delta_as_version(&self, successor: VersionTriple, delta: &FatDelta) {
        let mut body = Vec::with_capacity(delta.descriptor.encoded_size() + delta.diff.len());
        delta.descriptor.encode_into(&mut body);
        body.extend_from_slice(&delta.diff);
        self.versions.put_update(
            successor,
            &UpdateVersion {
                before: delta.triple,
                is_delta: true,
                body,
            },
        );
    }

    /// Pack the external chain of a chained head into an inline fat tuple.
    /// On failure the hint bit is cleared so the next update skips the
    /// attempt. The tuple lock is released in both cases.
    fn promote_chained_to_fat(&self, iterator: &mut ExclusiveIterator<'_>) -> bool {
        let payload = iterator.payload().to_vec();
        let mut header = TupleHeader::decode(&payload);
        let mut fat = FatTuple::from_chained(header, ChainedTuple::value(&payload));
        fat.header.write_unlock();

        let mut cursor = header.triple();
        let mut intact = true;
        while fat.deltas.len() < self.config.fat_tuple_max_deltas {
            let step = self.versions.retrieve(cursor, |version| match version {
                VersionPayload::Update(update) if update.is_delta => {
                    let (descriptor, read) = UpdateDescriptor::decode(&update.body)
                        .expect("stored update descriptor must decode");
                    Some((update.before, descriptor, update.body[read..].to_vec()))
                }
                _ => None,
            });
            match step {
                None => break,
                Some(None) => {
                    intact = false;
                    break;
                }
                Some(Some((before, descriptor, diff))) => {
                    let delta = FatDelta {
                        triple: before,
                        descriptor,
                        diff,
                    };
                    if fat.delta_region_len() + delta.encoded_len()
                        > self.config.fat_tuple_delta_capacity
                    {
                        break;
                    }
                    cursor = delta.triple;
                    fat.deltas.push(delta);
                }
            }
        }

        if !intact || fat.deltas.is_empty() {
            header.clear_can_convert_to_fat();
            header.write_unlock();
            header.encode_into(iterator.payload_mut());
            return false;
        }

        let encoded = fat.encode();
        let growth = encoded.len().saturating_sub(payload.len());
        if growth > 0 && iterator.free_space() < growth {
            header.clear_can_convert_to_fat();
            header.write_unlock();
            header.encode_into(iterator.payload_mut());
            return false;
        }
        iterator.replace_payload(encoded);
        iterator.mark_dirty();
        true
    }

    /// Record the serializability metadata of a successful write: the
    /// writer's read timestamp, or under 2PL its exclusive read-lock bit
    /// plus the commit-time release note.
    fn stamp_serializable(&self, session: &WorkerSession, header: &mut TupleHeader, key: &[u8]) {
        if session.is_serializable() {
            if self.config.two_phase_locking {
                header.take_read_lock_exclusively(session.worker_id());
                session.queue_unlock(
                    self.primary.tree_id(),
                    encode_unlock_entry(&UnlockEntry { key: key.to_vec() }),
                );
            } else {
                header.read_stamp = session.tts();
            }
        }
    }

    // ------------------------------------------------------------------
    // remove

    pub fn remove(&self, session: &WorkerSession, key: &[u8]) -> MvTreeResult<OpResult> {
        session.ensure_active_tx()?;
        session.wal_ensure_enough_space(key.len() + 128);
        let result = run_restartable(|| self.try_remove(session, key));
        self.finish_statement(session, result)?;
        Ok(result)
    }

    fn try_remove(&self, session: &WorkerSession, key: &[u8]) -> LatchResult<OpResult> {
        let Some(mut iterator) = ExclusiveIterator::seek_exact(&self.primary, key)? else {
            if session.is_olap() && self.graveyard_holds(key)? {
                return Ok(OpResult::AbortTx);
            }
            return Ok(OpResult::NotFound);
        };

        if self.config.forced_remove {
            iterator.remove_current();
            iterator.mark_dirty();
            iterator.merge_if_needed();
            return Ok(OpResult::Ok);
        }

        let mut header = TupleHeader::decode(iterator.payload());
        if header.format == TupleFormat::Fat {
            warn!("removing a fat tuple is unsupported");
            return Ok(OpResult::Other);
        }
        if header.is_write_locked() || !session.is_visible(header.worker_id, header.tx_id) {
            return Ok(OpResult::AbortTx);
        }
        if session.is_serializable() {
            if self.config.two_phase_locking {
                if header.has_foreign_read_lock(session.worker_id()) {
                    return Ok(OpResult::AbortTx);
                }
            } else if header.read_stamp > session.tts() {
                return Ok(OpResult::AbortTx);
            }
        }
        if header.is_removed() {
            return Ok(OpResult::NotFound);
        }

        header.write_lock();
        header.encode_into(iterator.payload_mut());

        let value = ChainedTuple::value(iterator.payload()).to_vec();
        let dangling = if self.config.enable_dangling_pointer {
            DanglingPointer {
                page_id: iterator.page_id(),
                latch_version: iterator.version_after_release(),
                slot: iterator.slot() as u16,
            }
        } else {
            DanglingPointer::invalid()
        };
        let command_id = session.next_command_id();
        self.versions.put_remove(
            VersionTriple::new(session.worker_id(), session.tts(), command_id),
            self.primary.tree_id(),
            &RemoveVersion {
                before: header.triple(),
                key: key.to_vec(),
                value: value.clone(),
                dangling,
            },
        );

        session.wal_append(
            self.primary.tree_id(),
            &WalRecord::Remove(WalRemove {
                key: key.to_vec(),
                before: header.triple(),
                value,
            }),
        );

        iterator.resize_payload(TUPLE_HEADER_LEN);
        header.set_removed(true);
        header.set_triple(VersionTriple::new(
            session.worker_id(),
            session.tts(),
            command_id,
        ));
        self.stamp_serializable(session, &mut header, key);
        header.write_unlock();
        header.encode_into(iterator.payload_mut());
        iterator.mark_dirty();
        Ok(OpResult::Ok)
    }

    fn graveyard_holds(&self, key: &[u8]) -> LatchResult<bool> {
        Ok(SharedIterator::seek_exact(&self.graveyard, key)?.is_some())
    }

    // ------------------------------------------------------------------
    // scans

    pub fn scan_asc(
        &self,
        session: &WorkerSession,
        start_key: &[u8],
        mut per_row: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> MvTreeResult<OpResult> {
        session.ensure_active_tx()?;
        if session.is_olap() {
            self.scan_asc_olap(session, start_key, &mut per_row);
        } else {
            let mut stream = ScanStream::new(&self.primary, start_key);
            self.drain_stream(session, &mut stream, &mut per_row);
        }
        session.maybe_auto_commit()?;
        Ok(OpResult::Ok)
    }

    /// OLAP ascending scan: ordered merge of the primary tree and the
    /// graveyard, so rows moved out by garbage collection stay visible.
    fn scan_asc_olap(
        &self,
        session: &WorkerSession,
        start_key: &[u8],
        per_row: &mut impl FnMut(&[u8], &[u8]) -> bool,
    ) {
        let mut primary = ScanStream::new(&self.primary, start_key);
        let mut graveyard = ScanStream::new(&self.graveyard, start_key);
        loop {
            let next_primary = primary.peek_key().map(|key| key.to_vec());
            let next_graveyard = graveyard.peek_key().map(|key| key.to_vec());
            let take_primary = match (&next_primary, &next_graveyard) {
                (None, None) => return,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (Some(p), Some(g)) => {
                    if p == g {
                        // A row mid-move can transiently live in both
                        // trees; the primary copy wins.
                        graveyard.advance();
                    }
                    p <= g
                }
            };
            let Some((key, payload)) = (if take_primary {
                primary.advance()
            } else {
                graveyard.advance()
            }) else {
                return;
            };
            if let Reconstructed::Found(value) = self.reconstruct(session, &payload) {
                if !per_row(&key, &value) {
                    return;
                }
            }
        }
    }

    fn drain_stream(
        &self,
        session: &WorkerSession,
        stream: &mut ScanStream<'_>,
        per_row: &mut impl FnMut(&[u8], &[u8]) -> bool,
    ) {
        while let Some((key, payload)) = stream.advance() {
            if let Reconstructed::Found(value) = self.reconstruct(session, &payload) {
                if !per_row(&key, &value) {
                    return;
                }
            }
        }
    }

    pub fn scan_desc(
        &self,
        session: &WorkerSession,
        start_key: &[u8],
        mut per_row: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> MvTreeResult<OpResult> {
        session.ensure_active_tx()?;
        if session.is_olap() {
            return Err(MvTreeError::NotSupport(
                "descending scans are not available to long-running read transactions"
                    .to_string(),
            ));
        }
        let mut bound = start_key.to_vec();
        let mut inclusive = true;
        'outer: loop {
            let entries =
                run_restartable(|| collect_desc(&self.primary, &bound, inclusive));
            if entries.is_empty() {
                break;
            }
            for (key, payload) in &entries {
                if let Reconstructed::Found(value) = self.reconstruct(session, payload) {
                    if !per_row(key, &value) {
                        break 'outer;
                    }
                }
            }
            match entries.last() {
                Some((key, _)) => bound = key.clone(),
                None => break,
            }
            inclusive = false;
        }
        session.maybe_auto_commit()?;
        Ok(OpResult::Ok)
    }

    fn finish_statement(
        &self,
        session: &WorkerSession,
        result: OpResult,
    ) -> MvTreeResult<()> {
        if result == OpResult::AbortTx {
            session.maybe_auto_abort()
        } else {
            session.maybe_auto_commit()
        }
    }
}

// ----------------------------------------------------------------------
// engine callbacks

impl TreeHooks for MvTree {
    fn iterate_children(&self, page_id: PageId, f: &mut dyn FnMut(PageId)) {
        self.primary.iterate_children(page_id, f);
        self.graveyard.iterate_children(page_id, f);
    }

    fn find_parent(&self, child: PageId) -> Option<PageId> {
        self.primary
            .find_parent(child)
            .or_else(|| self.graveyard.find_parent(child))
    }

    /// Leaf garbage collection: decompose every fat tuple on the page back
    /// to a chained head, streaming the inline deltas to the version
    /// store.
    fn check_space_utilization(&self, page_id: PageId) -> SpaceCheckResult {
        if !self.config.enable_leaf_gc {
            return SpaceCheckResult::Nothing;
        }
        let Some(page) = self.primary.buffer().try_fetch(page_id) else {
            return SpaceCheckResult::Nothing;
        };
        if page.tree_id() != self.primary.tree_id() {
            return SpaceCheckResult::Nothing;
        }
        run_restartable(|| {
            let guard = OptimisticPageGuard::latch(page.clone())?;
            let qualifies = matches!(guard.node(), Node::Leaf(leaf) if leaf.has_garbage);
            if !qualifies {
                guard.recheck()?;
                return Ok(SpaceCheckResult::Nothing);
            }
            let mut guard = guard.upgrade()?;
            let leaf = guard.node_mut().as_leaf_mut();
            for slot in 0..leaf.slot_count() {
                let payload = leaf.payload(slot);
                if TupleHeader::decode(payload).format != TupleFormat::Fat {
                    continue;
                }
                let fat = FatTuple::decode(payload).expect("fat tuple payload must decode");
                for (successor, delta) in fat.chain_entries() {
                    self.file_delta_as_version(successor, delta);
                }
                let mut header = fat.header;
                header.format = TupleFormat::Chained;
                let rebuilt = ChainedTuple::materialize(&header, &fat.value);
                debug_assert!(rebuilt.len() < payload.len());
                leaf.replace_payload(slot, rebuilt);
            }
            leaf.has_garbage = false;
            guard.mark_dirty();
            Ok(SpaceCheckResult::RestartSame)
        })
    }

    /// In-flight rollback of one WAL record (crash-recovery undo is out of
    /// scope).
    fn undo(&self, record: &WalRecord) {
        match record {
            WalRecord::Insert(entry) => run_restartable(|| {
                let Some(mut iterator) = ExclusiveIterator::seek_exact(&self.primary, &entry.key)?
                else {
                    panic!("undo of an insert must find the slot");
                };
                iterator.remove_current();
                iterator.mark_dirty();
                iterator.merge_if_needed();
                Ok(())
            }),
            WalRecord::Update(entry) => run_restartable(|| {
                let Some(mut iterator) = ExclusiveIterator::seek_exact(&self.primary, &entry.key)?
                else {
                    panic!("undo of an update must find the slot");
                };
                let header = TupleHeader::decode(iterator.payload());
                debug_assert!(!header.is_write_locked());
                if header.format == TupleFormat::Fat {
                    let mut fat =
                        FatTuple::decode(iterator.payload()).expect("fat tuple payload must decode");
                    let undone = fat.undo_last();
                    debug_assert!(undone, "fat tuple must hold the delta being rolled back");
                    iterator.replace_payload(fat.encode());
                } else {
                    let mut header = header;
                    header.set_triple(entry.before);
                    header.encode_into(iterator.payload_mut());
                    entry.descriptor.apply_xor(
                        ChainedTuple::value_mut(iterator.payload_mut()),
                        &entry.diff,
                    );
                }
                iterator.mark_dirty();
                Ok(())
            }),
            WalRecord::Remove(entry) => run_restartable(|| {
                let Some(mut iterator) = ExclusiveIterator::seek_exact(&self.primary, &entry.key)?
                else {
                    panic!("undo of a remove must find the slot");
                };
                iterator.resize_payload(TUPLE_HEADER_LEN + entry.value.len());
                let mut header =
                    TupleHeader::new_chained(entry.before.worker_id, entry.before.tx_id);
                header.command_id = entry.before.command_id;
                header.encode_into(iterator.payload_mut());
                ChainedTuple::value_mut(iterator.payload_mut()).copy_from_slice(&entry.value);
                iterator.mark_dirty();
                Ok(())
            }),
        }
    }

    /// Deferred reclamation of a removed row. First invocation reclaims
    /// the slot outright (no live OLAP reader) or moves it to the
    /// graveyard; the second purges the graveyard copy.
    fn todo(
        &self,
        entry: &[u8],
        version_worker: WorkerId,
        version_tx: TxId,
        called_before: bool,
        ctx: &GcContext,
    ) -> TodoOutcome {
        let Ok(VersionPayload::Remove(remove)) = decode_version(entry) else {
            return TodoOutcome::Nothing;
        };

        // Dangling-pointer fast path: reopen the recorded page pinned to
        // the recorded latch version and reclaim the slot in place.
        if self.config.enable_dangling_pointer
            && remove.dangling.is_valid()
            && !called_before
            && version_tx < ctx.olap_lwm
        {
            let fast = ExclusiveIterator::open_pinned(
                &self.primary,
                remove.dangling.page_id,
                remove.dangling.latch_version,
                remove.dangling.slot as usize,
            );
            if let Ok(mut iterator) = fast {
                let header = TupleHeader::decode(iterator.payload());
                if header.format == TupleFormat::Chained
                    && !header.is_write_locked()
                    && header.is_removed()
                    && header.worker_id == version_worker
                    && header.tx_id == version_tx
                {
                    iterator.remove_current();
                    iterator.mark_dirty();
                    iterator.merge_if_needed();
                    debug!("dangling pointer reclaimed a removed slot");
                    return TodoOutcome::Removed;
                }
            }
        }

        if called_before {
            debug_assert!(version_tx < ctx.olap_lwm);
            run_restartable(|| {
                if let Some(mut iterator) =
                    ExclusiveIterator::seek_exact(&self.graveyard, &remove.key)?
                {
                    iterator.remove_current();
                    iterator.mark_dirty();
                    iterator.merge_if_needed();
                }
                Ok(())
            });
            return TodoOutcome::Removed;
        }

        run_restartable(|| {
            let Some(mut iterator) = ExclusiveIterator::seek_exact(&self.primary, &remove.key)?
            else {
                return Ok(TodoOutcome::Nothing);
            };
            let header = TupleHeader::decode(iterator.payload());
            if header.format != TupleFormat::Chained
                || header.is_write_locked()
                || !header.is_removed()
                || header.worker_id != version_worker
                || header.tx_id != version_tx
            {
                return Ok(TodoOutcome::Nothing);
            }
            if version_tx < ctx.olap_lwm {
                iterator.remove_current();
                iterator.mark_dirty();
                iterator.merge_if_needed();
                Ok(TodoOutcome::Removed)
            } else if version_tx < ctx.oltp_lwm {
                // A live OLAP reader may still need the row: park the
                // tombstone in the graveyard before reclaiming the slot.
                let tombstone = iterator.payload().to_vec();
                if !insert_kv(&self.graveyard, &remove.key, tombstone)? {
                    return Ok(TodoOutcome::Nothing);
                }
                iterator.remove_current();
                iterator.mark_dirty();
                iterator.merge_if_needed();
                Ok(TodoOutcome::MovedToGraveyard)
            } else {
                Ok(TodoOutcome::Nothing)
            }
        })
    }

    /// 2PL commit-time release: clear the caller's bit in the tuple's
    /// read-lock word.
    fn unlock(&self, worker_id: WorkerId, entry: &[u8]) {
        let Ok(unlock) = decode_unlock_entry(entry) else {
            return;
        };
        run_restartable(|| {
            if let Some(mut iterator) = ExclusiveIterator::seek_exact(&self.primary, &unlock.key)?
            {
                let mut header = TupleHeader::decode(iterator.payload());
                header.clear_read_lock(worker_id);
                header.encode_into(iterator.payload_mut());
                iterator.mark_dirty();
            }
            Ok(())
        });
    }

    fn serialize(&self) -> Vec<(String, String)> {
        vec![
            (
                "primary_root".to_string(),
                self.primary.root_page_id().to_string(),
            ),
            (
                "graveyard_root".to_string(),
                self.graveyard.root_page_id().to_string(),
            ),
        ]
    }
}

#[cfg(test)]
impl MvTree {
    pub(crate) fn head_format(&self, key: &[u8]) -> Option<TupleFormat> {
        run_restartable(|| {
            Ok(match SharedIterator::seek_exact(&self.primary, key)? {
                Some(iterator) => Some(TupleHeader::decode(iterator.payload()).format),
                None => None,
            })
        })
    }

    pub(crate) fn graveyard_contains(&self, key: &[u8]) -> bool {
        run_restartable(|| self.graveyard_holds(key))
    }

    pub(crate) fn primary_page_ids(&self) -> Vec<PageId> {
        let mut pages = vec![self.primary.root_page_id()];
        let mut at = 0;
        while at < pages.len() {
            let page = pages[at];
            self.primary
                .iterate_children(page, &mut |child| pages.push(child));
            at += 1;
        }
        pages
    }
}

// ----------------------------------------------------------------------
// scan plumbing

/// Pull-based stream over one tree's leaves: batches one leaf at a time
/// under a shared latch, emits strictly increasing keys, and survives
/// concurrent splits and merges by re-descending.
struct ScanStream<'a> {
    tree: &'a TreeCore,
    queue: VecDeque<(Vec<u8>, Vec<u8>)>,
    state: StreamState,
    last_emitted: Option<Vec<u8>>,
}

enum StreamState {
    ByKey(Vec<u8>),
    ByPage(PageId, Vec<u8>),
    Done,
}

impl<'a> ScanStream<'a> {
    fn new(tree: &'a TreeCore, start: &[u8]) -> Self {
        Self {
            tree,
            queue: VecDeque::new(),
            state: StreamState::ByKey(start.to_vec()),
            last_emitted: None,
        }
    }

    fn peek_key(&mut self) -> Option<&[u8]> {
        self.fill();
        self.queue.front().map(|(key, _)| key.as_slice())
    }

    fn advance(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        self.fill();
        let entry = self.queue.pop_front()?;
        self.last_emitted = Some(entry.0.clone());
        Some(entry)
    }

    fn fill(&mut self) {
        while self.queue.is_empty() {
            match std::mem::replace(&mut self.state, StreamState::Done) {
                StreamState::Done => return,
                StreamState::ByKey(cursor) => {
                    let batch = run_restartable(|| collect_from(self.tree, &cursor));
                    self.enqueue(batch.entries);
                    self.state = match (batch.leaf_max_key, batch.next_leaf) {
                        (Some(max_key), next) => {
                            if next == INVALID_PAGE_ID {
                                StreamState::Done
                            } else {
                                let mut successor = max_key;
                                successor.push(0);
                                StreamState::ByKey(successor)
                            }
                        }
                        (None, next) => {
                            if next == INVALID_PAGE_ID {
                                StreamState::Done
                            } else {
                                StreamState::ByPage(next, cursor)
                            }
                        }
                    };
                }
                StreamState::ByPage(page_id, fallback) => {
                    match run_restartable(|| collect_page(self.tree, page_id)) {
                        None => {
                            // The leaf vanished under us; re-descend.
                            self.state = StreamState::ByKey(fallback);
                        }
                        Some(batch) => {
                            self.enqueue(batch.entries);
                            self.state = match (batch.leaf_max_key, batch.next_leaf) {
                                (Some(max_key), next) => {
                                    if next == INVALID_PAGE_ID {
                                        StreamState::Done
                                    } else {
                                        let mut successor = max_key.max(fallback);
                                        successor.push(0);
                                        StreamState::ByKey(successor)
                                    }
                                }
                                (None, next) => {
                                    if next == INVALID_PAGE_ID {
                                        StreamState::Done
                                    } else {
                                        StreamState::ByPage(next, fallback)
                                    }
                                }
                            };
                        }
                    }
                }
            }
        }
    }

    fn enqueue(&mut self, entries: Vec<(Vec<u8>, Vec<u8>)>) {
        for (key, payload) in entries {
            if let Some(last) = &self.last_emitted {
                if key.as_slice() <= last.as_slice() {
                    continue;
                }
            }
            self.queue.push_back((key, payload));
        }
    }
}
