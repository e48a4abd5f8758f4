use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::buffer::{PageId, TreeId, INVALID_PAGE_ID};
use crate::error::{MvTreeError, MvTreeResult};
use crate::tuple::VersionTriple;
use crate::worker::TxId;

const TAG_UPDATE: u8 = 1;
const TAG_REMOVE: u8 = 2;

/// Latched fast-path handle to the slot a remove left behind:
/// `(page, latch version, slot)`. Valid only while the page latch still
/// carries the recorded version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DanglingPointer {
    pub page_id: PageId,
    pub latch_version: u64,
    pub slot: u16,
}

impl DanglingPointer {
    pub fn invalid() -> Self {
        Self {
            page_id: INVALID_PAGE_ID,
            latch_version: 0,
            slot: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.page_id != INVALID_PAGE_ID
    }
}

/// Secondary version recording one update. `body` is descriptor ‖ XOR diff
/// when `is_delta`, otherwise a full replacement value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateVersion {
    pub before: VersionTriple,
    pub is_delta: bool,
    pub body: Vec<u8>,
}

/// Secondary version recording one remove: full pre-image plus the key,
/// and the dangling pointer used by the GC fast path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveVersion {
    pub before: VersionTriple,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub dangling: DanglingPointer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionPayload {
    Update(UpdateVersion),
    Remove(RemoveVersion),
}

fn encode_update(version: &UpdateVersion) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + VersionTriple::ENCODED_LEN + 1 + version.body.len());
    buf.push(TAG_UPDATE);
    version.before.encode_into(&mut buf);
    buf.push(version.is_delta as u8);
    buf.extend_from_slice(&version.body);
    buf
}

fn encode_remove(version: &RemoveVersion) -> Vec<u8> {
    let mut buf = Vec::with_capacity(
        1 + VersionTriple::ENCODED_LEN + 4 + 18 + version.key.len() + version.value.len(),
    );
    buf.push(TAG_REMOVE);
    version.before.encode_into(&mut buf);
    buf.extend_from_slice(&(version.key.len() as u16).to_le_bytes());
    buf.extend_from_slice(&(version.value.len() as u16).to_le_bytes());
    buf.extend_from_slice(&version.dangling.page_id.to_le_bytes());
    buf.extend_from_slice(&version.dangling.latch_version.to_le_bytes());
    buf.extend_from_slice(&version.dangling.slot.to_le_bytes());
    buf.extend_from_slice(&version.key);
    buf.extend_from_slice(&version.value);
    buf
}

pub fn decode_version(bytes: &[u8]) -> MvTreeResult<VersionPayload> {
    if bytes.is_empty() {
        return Err(MvTreeError::Corrupted("empty version payload".to_string()));
    }
    let (before, mut at) = VersionTriple::decode(&bytes[1..])?;
    at += 1;
    match bytes[0] {
        TAG_UPDATE => {
            if bytes.len() < at + 1 {
                return Err(MvTreeError::Corrupted(
                    "update version too short for delta flag".to_string(),
                ));
            }
            let is_delta = bytes[at] != 0;
            Ok(VersionPayload::Update(UpdateVersion {
                before,
                is_delta,
                body: bytes[at + 1..].to_vec(),
            }))
        }
        TAG_REMOVE => {
            if bytes.len() < at + 4 + 18 {
                return Err(MvTreeError::Corrupted(
                    "remove version too short for lengths".to_string(),
                ));
            }
            let key_len = u16::from_le_bytes(bytes[at..at + 2].try_into().unwrap()) as usize;
            let value_len = u16::from_le_bytes(bytes[at + 2..at + 4].try_into().unwrap()) as usize;
            at += 4;
            let page_id = u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap());
            let latch_version = u64::from_le_bytes(bytes[at + 8..at + 16].try_into().unwrap());
            let slot = u16::from_le_bytes(bytes[at + 16..at + 18].try_into().unwrap());
            at += 18;
            if bytes.len() < at + key_len + value_len {
                return Err(MvTreeError::Corrupted(
                    "remove version payload truncated".to_string(),
                ));
            }
            Ok(VersionPayload::Remove(RemoveVersion {
                before,
                key: bytes[at..at + key_len].to_vec(),
                value: bytes[at + key_len..at + key_len + value_len].to_vec(),
                dangling: DanglingPointer {
                    page_id,
                    latch_version,
                    slot,
                },
            }))
        }
        other => Err(MvTreeError::Corrupted(format!(
            "unknown version payload tag: {}",
            other
        ))),
    }
}

/// What the index did for one todo invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TodoOutcome {
    /// The primary (or graveyard) slot was reclaimed.
    Removed,
    /// The row was copied to the graveyard and reclaimed from the primary;
    /// a second invocation is owed once the OLAP watermark passes.
    MovedToGraveyard,
    /// The slot no longer matched the staged version; nothing was done.
    Nothing,
}

#[derive(Debug, Clone)]
struct TodoEntry {
    tree_id: TreeId,
    triple: VersionTriple,
    moved: bool,
}

/// Append-only store of secondary versions keyed by
/// `(worker_id, tx_id, command_id)`, plus the per-worker remove log that
/// schedules the GC todo callbacks.
pub struct VersionStore {
    entries: DashMap<VersionTriple, Vec<u8>>,
    remove_logs: Vec<Mutex<VecDeque<TodoEntry>>>,
}

impl VersionStore {
    pub fn new(workers: usize) -> Self {
        Self {
            entries: DashMap::new(),
            remove_logs: (0..workers).map(|_| Mutex::new(VecDeque::new())).collect(),
        }
    }

    pub fn put_update(&self, triple: VersionTriple, version: &UpdateVersion) {
        self.entries.insert(triple, encode_update(version));
    }

    pub fn put_remove(&self, triple: VersionTriple, tree_id: TreeId, version: &RemoveVersion) {
        self.entries.insert(triple, encode_remove(version));
        self.remove_logs[triple.worker_id as usize]
            .lock()
            .push_back(TodoEntry {
                tree_id,
                triple,
                moved: false,
            });
    }

    /// Look up the version filed under `triple` and hand the decoded
    /// payload to `f`. Returns `None` when the chain is broken (the entry
    /// was garbage collected).
    pub fn retrieve<R>(
        &self,
        triple: VersionTriple,
        f: impl FnOnce(&VersionPayload) -> R,
    ) -> Option<R> {
        let bytes = self.entries.get(&triple)?;
        let payload = decode_version(bytes.value()).expect("stored version must decode");
        Some(f(&payload))
    }

    pub fn contains(&self, triple: VersionTriple) -> bool {
        self.entries.contains_key(&triple)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn pending_todo_count(&self) -> usize {
        self.remove_logs.iter().map(|log| log.lock().len()).sum()
    }

    /// Drive the todo protocol against the current watermarks. `exec` runs
    /// one todo invocation (`called_before` on re-invocations after a
    /// graveyard move) and reports what it did.
    ///
    /// The remove log mutex is released while `exec` runs: the callback
    /// takes page latches, and a remover holding such a latch may be
    /// appending to the same log.
    pub fn collect_garbage(
        &self,
        oltp_lwm: TxId,
        olap_lwm: TxId,
        mut exec: impl FnMut(TreeId, &[u8], VersionTriple, bool) -> TodoOutcome,
    ) {
        for log in &self.remove_logs {
            let due: Vec<TodoEntry> = {
                let mut log = log.lock();
                let mut kept = VecDeque::with_capacity(log.len());
                let mut due = Vec::new();
                while let Some(entry) = log.pop_front() {
                    if entry.triple.tx_id < oltp_lwm {
                        due.push(entry);
                    } else {
                        kept.push_back(entry);
                    }
                }
                *log = kept;
                due
            };

            let mut requeue = Vec::new();
            for mut entry in due {
                let Some(bytes) = self.entries.get(&entry.triple).map(|e| e.value().clone())
                else {
                    continue;
                };
                if entry.moved {
                    if entry.triple.tx_id < olap_lwm {
                        exec(entry.tree_id, &bytes, entry.triple, true);
                        self.entries.remove(&entry.triple);
                    } else {
                        requeue.push(entry);
                    }
                    continue;
                }
                match exec(entry.tree_id, &bytes, entry.triple, false) {
                    TodoOutcome::Removed => {
                        self.entries.remove(&entry.triple);
                    }
                    TodoOutcome::MovedToGraveyard => {
                        entry.moved = true;
                        requeue.push(entry);
                    }
                    TodoOutcome::Nothing => {
                        if entry.triple.tx_id < olap_lwm {
                            self.entries.remove(&entry.triple);
                        } else {
                            requeue.push(entry);
                        }
                    }
                }
            }
            if !requeue.is_empty() {
                let mut log = log.lock();
                log.extend(requeue);
            }
        }

        // Update versions below the OLAP watermark are unreachable by every
        // live reader; remove versions are dropped through the todo path.
        self.entries
            .retain(|triple, bytes| triple.tx_id >= olap_lwm || bytes.first() == Some(&TAG_REMOVE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triple(worker: u16, tx: u64, cmd: u32) -> VersionTriple {
        VersionTriple::new(worker, tx, cmd)
    }

    #[test]
    fn update_version_round_trip() {
        let store = VersionStore::new(2);
        let version = UpdateVersion {
            before: triple(1, 9, 4),
            is_delta: true,
            body: vec![1, 2, 3],
        };
        store.put_update(triple(0, 10, 5), &version);
        let decoded = store
            .retrieve(triple(0, 10, 5), |payload| payload.clone())
            .unwrap();
        assert_eq!(decoded, VersionPayload::Update(version));
        assert!(!store.contains(triple(0, 11, 5)));
    }

    #[test]
    fn remove_version_round_trip() {
        let store = VersionStore::new(1);
        let version = RemoveVersion {
            before: triple(0, 3, 1),
            key: b"k1".to_vec(),
            value: b"value".to_vec(),
            dangling: DanglingPointer {
                page_id: 7,
                latch_version: 12,
                slot: 2,
            },
        };
        store.put_remove(triple(0, 5, 0), 1, &version);
        assert_eq!(store.pending_todo_count(), 1);
        let decoded = store
            .retrieve(triple(0, 5, 0), |payload| payload.clone())
            .unwrap();
        assert_eq!(decoded, VersionPayload::Remove(version));
    }

    #[test]
    fn gc_prunes_dead_update_versions() {
        let store = VersionStore::new(1);
        let version = UpdateVersion {
            before: triple(0, 1, 0),
            is_delta: false,
            body: vec![7],
        };
        store.put_update(triple(0, 2, 0), &version);
        store.put_update(triple(0, 20, 0), &version);

        store.collect_garbage(10, 10, |_, _, _, _| TodoOutcome::Nothing);
        assert!(!store.contains(triple(0, 2, 0)));
        assert!(store.contains(triple(0, 20, 0)));
    }

    #[test]
    fn gc_runs_todo_in_two_phases() {
        let store = VersionStore::new(1);
        let version = RemoveVersion {
            before: triple(0, 1, 0),
            key: b"k".to_vec(),
            value: b"v".to_vec(),
            dangling: DanglingPointer::invalid(),
        };
        store.put_remove(triple(0, 5, 1), 3, &version);

        // OLTP watermark passed, OLAP readers still live: expect a move.
        let mut calls = Vec::new();
        store.collect_garbage(10, 2, |tree, _, t, before| {
            calls.push((tree, t, before));
            TodoOutcome::MovedToGraveyard
        });
        assert_eq!(calls, vec![(3, triple(0, 5, 1), false)]);
        assert!(store.contains(triple(0, 5, 1)));
        assert_eq!(store.pending_todo_count(), 1);

        // OLAP watermark passed: the second invocation purges and the
        // version entry goes away.
        calls.clear();
        store.collect_garbage(10, 10, |tree, _, t, before| {
            calls.push((tree, t, before));
            TodoOutcome::Removed
        });
        assert_eq!(calls, vec![(3, triple(0, 5, 1), true)]);
        assert!(!store.contains(triple(0, 5, 1)));
        assert_eq!(store.pending_todo_count(), 0);
    }

    #[test]
    fn gc_direct_removal_below_olap_watermark() {
        let store = VersionStore::new(1);
        let version = RemoveVersion {
            before: triple(0, 1, 0),
            key: b"k".to_vec(),
            value: b"v".to_vec(),
            dangling: DanglingPointer::invalid(),
        };
        store.put_remove(triple(0, 5, 1), 0, &version);

        store.collect_garbage(20, 20, |_, _, _, called_before| {
            assert!(!called_before);
            TodoOutcome::Removed
        });
        assert!(!store.contains(triple(0, 5, 1)));
        assert_eq!(store.pending_todo_count(), 0);
    }
}
