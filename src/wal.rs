use crc32fast::Hasher;

use crate::buffer::TreeId;
use crate::error::{MvTreeError, MvTreeResult};
use crate::tuple::{UpdateDescriptor, VersionTriple};

const WAL_KIND_INSERT: u8 = 1;
const WAL_KIND_UPDATE: u8 = 2;
const WAL_KIND_REMOVE: u8 = 3;
const WAL_CRC_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalInsert {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalUpdate {
    pub key: Vec<u8>,
    pub before: VersionTriple,
    pub descriptor: UpdateDescriptor,
    /// XOR of pre- and post-image over the descriptor ranges; applying it
    /// to either image yields the other.
    pub diff: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRemove {
    pub key: Vec<u8>,
    pub before: VersionTriple,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    Insert(WalInsert),
    Update(WalUpdate),
    Remove(WalRemove),
}

/// Commit-time read-lock release note under 2PL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockEntry {
    pub key: Vec<u8>,
}

pub fn encode_unlock_entry(entry: &UnlockEntry) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + entry.key.len());
    buf.extend_from_slice(&(entry.key.len() as u16).to_le_bytes());
    buf.extend_from_slice(&entry.key);
    buf
}

pub fn decode_unlock_entry(bytes: &[u8]) -> MvTreeResult<UnlockEntry> {
    if bytes.len() < 2 {
        return Err(MvTreeError::Corrupted(
            "unlock entry too short for key length".to_string(),
        ));
    }
    let key_len = u16::from_le_bytes(bytes[0..2].try_into().unwrap()) as usize;
    if bytes.len() < 2 + key_len {
        return Err(MvTreeError::Corrupted(
            "unlock entry key truncated".to_string(),
        ));
    }
    Ok(UnlockEntry {
        key: bytes[2..2 + key_len].to_vec(),
    })
}

pub fn encode_wal_record(tree_id: TreeId, record: &WalRecord) -> Vec<u8> {
    let mut frame = Vec::with_capacity(64);
    match record {
        WalRecord::Insert(body) => {
            frame.push(WAL_KIND_INSERT);
            frame.extend_from_slice(&tree_id.to_le_bytes());
            frame.extend_from_slice(&(body.key.len() as u16).to_le_bytes());
            frame.extend_from_slice(&(body.value.len() as u16).to_le_bytes());
            frame.extend_from_slice(&body.key);
            frame.extend_from_slice(&body.value);
        }
        WalRecord::Update(body) => {
            frame.push(WAL_KIND_UPDATE);
            frame.extend_from_slice(&tree_id.to_le_bytes());
            frame.extend_from_slice(&(body.key.len() as u16).to_le_bytes());
            let delta_len = body.descriptor.encoded_size() + body.diff.len();
            frame.extend_from_slice(&(delta_len as u16).to_le_bytes());
            body.before.encode_into(&mut frame);
            frame.extend_from_slice(&body.key);
            body.descriptor.encode_into(&mut frame);
            frame.extend_from_slice(&body.diff);
        }
        WalRecord::Remove(body) => {
            frame.push(WAL_KIND_REMOVE);
            frame.extend_from_slice(&tree_id.to_le_bytes());
            frame.extend_from_slice(&(body.key.len() as u16).to_le_bytes());
            frame.extend_from_slice(&(body.value.len() as u16).to_le_bytes());
            body.before.encode_into(&mut frame);
            frame.extend_from_slice(&body.key);
            frame.extend_from_slice(&body.value);
        }
    }
    let mut hasher = Hasher::new();
    hasher.update(&frame);
    frame.extend_from_slice(&hasher.finalize().to_le_bytes());
    frame
}

pub fn decode_wal_record(bytes: &[u8]) -> MvTreeResult<(TreeId, WalRecord)> {
    if bytes.len() < 1 + 4 + WAL_CRC_LEN {
        return Err(MvTreeError::Corrupted("WAL frame too short".to_string()));
    }
    let body_end = bytes.len() - WAL_CRC_LEN;
    let expected_crc = u32::from_le_bytes(bytes[body_end..].try_into().unwrap());
    let mut hasher = Hasher::new();
    hasher.update(&bytes[..body_end]);
    if hasher.finalize() != expected_crc {
        return Err(MvTreeError::Corrupted(
            "CRC mismatch for WAL frame".to_string(),
        ));
    }
    let kind = bytes[0];
    let tree_id = u32::from_le_bytes(bytes[1..5].try_into().unwrap());
    let body = &bytes[5..body_end];
    let record = match kind {
        WAL_KIND_INSERT => {
            let (key, rest) = split_len_prefixed_pair(body)?;
            WalRecord::Insert(WalInsert {
                key,
                value: rest.to_vec(),
            })
        }
        WAL_KIND_UPDATE => {
            if body.len() < 4 + VersionTriple::ENCODED_LEN {
                return Err(MvTreeError::Corrupted(
                    "WAL update frame truncated".to_string(),
                ));
            }
            let key_len = u16::from_le_bytes(body[0..2].try_into().unwrap()) as usize;
            let delta_len = u16::from_le_bytes(body[2..4].try_into().unwrap()) as usize;
            let (before, read) = VersionTriple::decode(&body[4..])?;
            let at = 4 + read;
            if body.len() < at + key_len + delta_len {
                return Err(MvTreeError::Corrupted(
                    "WAL update payload truncated".to_string(),
                ));
            }
            let key = body[at..at + key_len].to_vec();
            let delta = &body[at + key_len..at + key_len + delta_len];
            let (descriptor, read) = UpdateDescriptor::decode(delta)?;
            let diff = delta[read..].to_vec();
            if diff.len() != descriptor.diff_len() {
                return Err(MvTreeError::Corrupted(
                    "WAL update diff length mismatch".to_string(),
                ));
            }
            WalRecord::Update(WalUpdate {
                key,
                before,
                descriptor,
                diff,
            })
        }
        WAL_KIND_REMOVE => {
            if body.len() < 4 + VersionTriple::ENCODED_LEN {
                return Err(MvTreeError::Corrupted(
                    "WAL remove frame truncated".to_string(),
                ));
            }
            let key_len = u16::from_le_bytes(body[0..2].try_into().unwrap()) as usize;
            let value_len = u16::from_le_bytes(body[2..4].try_into().unwrap()) as usize;
            let (before, read) = VersionTriple::decode(&body[4..])?;
            let at = 4 + read;
            if body.len() < at + key_len + value_len {
                return Err(MvTreeError::Corrupted(
                    "WAL remove payload truncated".to_string(),
                ));
            }
            WalRecord::Remove(WalRemove {
                key: body[at..at + key_len].to_vec(),
                before,
                value: body[at + key_len..at + key_len + value_len].to_vec(),
            })
        }
        other => {
            return Err(MvTreeError::Corrupted(format!(
                "unknown WAL record kind: {}",
                other
            )))
        }
    };
    Ok((tree_id, record))
}

fn split_len_prefixed_pair(body: &[u8]) -> MvTreeResult<(Vec<u8>, &[u8])> {
    if body.len() < 4 {
        return Err(MvTreeError::Corrupted(
            "WAL frame too short for lengths".to_string(),
        ));
    }
    let key_len = u16::from_le_bytes(body[0..2].try_into().unwrap()) as usize;
    let value_len = u16::from_le_bytes(body[2..4].try_into().unwrap()) as usize;
    if body.len() < 4 + key_len + value_len {
        return Err(MvTreeError::Corrupted("WAL payload truncated".to_string()));
    }
    Ok((
        body[4..4 + key_len].to_vec(),
        &body[4 + key_len..4 + key_len + value_len],
    ))
}

/// Per-worker in-flight WAL tail. Rollback walks it in reverse; commit
/// discards it. Recovery replay is out of scope, so frames never leave the
/// worker.
#[derive(Debug, Default)]
pub struct WalBuffer {
    frames: Vec<Vec<u8>>,
}

impl WalBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-reserve room so the append on the mutation path does not
    /// reallocate mid-operation.
    pub fn ensure_enough_space(&mut self, upcoming: usize) {
        self.frames.reserve(1);
        let _ = upcoming;
    }

    pub fn append(&mut self, tree_id: TreeId, record: &WalRecord) {
        self.frames.push(encode_wal_record(tree_id, record));
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Take the buffered frames newest-first for rollback.
    pub fn take_reversed(&mut self) -> Vec<Vec<u8>> {
        let mut frames = std::mem::take(&mut self.frames);
        frames.reverse();
        frames
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
