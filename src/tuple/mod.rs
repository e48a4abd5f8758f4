mod descriptor;
mod fat;

pub use descriptor::{UpdateDescriptor, UpdateRange};
pub use fat::{FatDelta, FatTuple, FatUpdateOutcome};

use crate::error::{MvTreeError, MvTreeResult};
use crate::worker::{CommandId, TxId, WorkerId, INVALID_COMMAND_ID};

/// Byte length of the header that starts every primary slot payload.
pub const TUPLE_HEADER_LEN: usize = 24;

const FLAG_WRITE_LOCKED: u8 = 1;
const FLAG_REMOVED: u8 = 1 << 1;
const FLAG_CAN_CONVERT_TO_FAT: u8 = 1 << 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TupleFormat {
    Chained = 0,
    Fat = 1,
}

impl TryFrom<u8> for TupleFormat {
    type Error = MvTreeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TupleFormat::Chained),
            1 => Ok(TupleFormat::Fat),
            other => Err(MvTreeError::Corrupted(format!(
                "unknown tuple format tag: {}",
                other
            ))),
        }
    }
}

/// Identity of one tuple version: who wrote it and in which command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionTriple {
    pub worker_id: WorkerId,
    pub tx_id: TxId,
    pub command_id: CommandId,
}

impl VersionTriple {
    pub const ENCODED_LEN: usize = 2 + 8 + 4;

    pub fn new(worker_id: WorkerId, tx_id: TxId, command_id: CommandId) -> Self {
        Self {
            worker_id,
            tx_id,
            command_id,
        }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.worker_id.to_le_bytes());
        buf.extend_from_slice(&self.tx_id.to_le_bytes());
        buf.extend_from_slice(&self.command_id.to_le_bytes());
    }

    pub fn decode(bytes: &[u8]) -> MvTreeResult<(Self, usize)> {
        if bytes.len() < Self::ENCODED_LEN {
            return Err(MvTreeError::Corrupted(
                "payload too short for version triple".to_string(),
            ));
        }
        let worker_id = u16::from_le_bytes(bytes[0..2].try_into().unwrap());
        let tx_id = u64::from_le_bytes(bytes[2..10].try_into().unwrap());
        let command_id = u32::from_le_bytes(bytes[10..14].try_into().unwrap());
        Ok((Self::new(worker_id, tx_id, command_id), Self::ENCODED_LEN))
    }
}

/// Decoded view of the 24-byte header at the start of a primary slot
/// payload. Mutations go through [`TupleHeader::encode_into`]; the on-page
/// bytes are the source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupleHeader {
    pub format: TupleFormat,
    pub worker_id: WorkerId,
    pub tx_id: TxId,
    pub command_id: CommandId,
    /// Read timestamp under serializable validation, or the reader bitmap
    /// under 2PL. Only one interpretation is live per index configuration.
    pub read_stamp: u64,
    flags: u8,
}

impl TupleHeader {
    /// Header of a freshly inserted chained tuple.
    pub fn new_chained(worker_id: WorkerId, tx_id: TxId) -> Self {
        Self {
            format: TupleFormat::Chained,
            worker_id,
            tx_id,
            command_id: INVALID_COMMAND_ID,
            read_stamp: 0,
            flags: FLAG_CAN_CONVERT_TO_FAT,
        }
    }

    /// Decode the header in front of `payload`.
    ///
    /// Panics when the payload is shorter than a header or carries an
    /// unknown format tag: both indicate page corruption, which is fatal.
    pub fn decode(payload: &[u8]) -> Self {
        if payload.len() < TUPLE_HEADER_LEN {
            panic!(
                "slot payload of {} bytes cannot hold a tuple header",
                payload.len()
            );
        }
        let format = match TupleFormat::try_from(payload[0]) {
            Ok(format) => format,
            Err(err) => panic!("{}", err),
        };
        Self {
            format,
            flags: payload[1],
            worker_id: u16::from_le_bytes(payload[2..4].try_into().unwrap()),
            tx_id: u64::from_le_bytes(payload[4..12].try_into().unwrap()),
            command_id: u32::from_le_bytes(payload[12..16].try_into().unwrap()),
            read_stamp: u64::from_le_bytes(payload[16..24].try_into().unwrap()),
        }
    }

    pub fn encode_into(&self, payload: &mut [u8]) {
        debug_assert!(payload.len() >= TUPLE_HEADER_LEN);
        payload[0] = self.format as u8;
        payload[1] = self.flags;
        payload[2..4].copy_from_slice(&self.worker_id.to_le_bytes());
        payload[4..12].copy_from_slice(&self.tx_id.to_le_bytes());
        payload[12..16].copy_from_slice(&self.command_id.to_le_bytes());
        payload[16..24].copy_from_slice(&self.read_stamp.to_le_bytes());
    }

    pub fn triple(&self) -> VersionTriple {
        VersionTriple::new(self.worker_id, self.tx_id, self.command_id)
    }

    pub fn set_triple(&mut self, triple: VersionTriple) {
        self.worker_id = triple.worker_id;
        self.tx_id = triple.tx_id;
        self.command_id = triple.command_id;
    }

    pub fn is_write_locked(&self) -> bool {
        self.flags & FLAG_WRITE_LOCKED != 0
    }

    pub fn write_lock(&mut self) {
        self.flags |= FLAG_WRITE_LOCKED;
    }

    pub fn write_unlock(&mut self) {
        self.flags &= !FLAG_WRITE_LOCKED;
    }

    pub fn is_removed(&self) -> bool {
        self.flags & FLAG_REMOVED != 0
    }

    pub fn set_removed(&mut self, removed: bool) {
        if removed {
            self.flags |= FLAG_REMOVED;
        } else {
            self.flags &= !FLAG_REMOVED;
        }
    }

    pub fn can_convert_to_fat(&self) -> bool {
        self.flags & FLAG_CAN_CONVERT_TO_FAT != 0
    }

    pub fn clear_can_convert_to_fat(&mut self) {
        self.flags &= !FLAG_CAN_CONVERT_TO_FAT;
    }

    /// 2PL interpretation of `read_stamp`: one bit per worker.
    pub fn has_foreign_read_lock(&self, worker_id: WorkerId) -> bool {
        self.read_stamp != 0 && self.read_stamp != 1u64 << worker_id
    }

    pub fn add_read_lock(&mut self, worker_id: WorkerId) {
        self.read_stamp |= 1u64 << worker_id;
    }

    pub fn take_read_lock_exclusively(&mut self, worker_id: WorkerId) {
        self.read_stamp = 1u64 << worker_id;
    }

    pub fn clear_read_lock(&mut self, worker_id: WorkerId) {
        self.read_stamp &= !(1u64 << worker_id);
    }
}

/// Helpers over chained slot payloads: header followed by the value bytes.
pub struct ChainedTuple;

impl ChainedTuple {
    /// Build the slot payload of a fresh chained tuple.
    pub fn materialize(header: &TupleHeader, value: &[u8]) -> Vec<u8> {
        debug_assert_eq!(header.format, TupleFormat::Chained);
        let mut payload = vec![0u8; TUPLE_HEADER_LEN + value.len()];
        header.encode_into(&mut payload);
        payload[TUPLE_HEADER_LEN..].copy_from_slice(value);
        payload
    }

    pub fn value(payload: &[u8]) -> &[u8] {
        &payload[TUPLE_HEADER_LEN..]
    }

    pub fn value_mut(payload: &mut [u8]) -> &mut [u8] {
        &mut payload[TUPLE_HEADER_LEN..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut header = TupleHeader::new_chained(3, 42);
        header.command_id = 7;
        header.read_stamp = 99;
        header.write_lock();
        header.set_removed(true);

        let mut buf = vec![0u8; TUPLE_HEADER_LEN];
        header.encode_into(&mut buf);
        let decoded = TupleHeader::decode(&buf);
        assert_eq!(decoded, header);
        assert!(decoded.is_write_locked());
        assert!(decoded.is_removed());
        assert!(decoded.can_convert_to_fat());
    }

    #[test]
    fn chained_payload_layout() {
        let header = TupleHeader::new_chained(0, 1);
        let payload = ChainedTuple::materialize(&header, b"hello");
        assert_eq!(payload.len(), TUPLE_HEADER_LEN + 5);
        assert_eq!(ChainedTuple::value(&payload), b"hello");
        assert_eq!(TupleHeader::decode(&payload).command_id, INVALID_COMMAND_ID);
    }

    #[test]
    fn read_lock_bitmap() {
        let mut header = TupleHeader::new_chained(0, 1);
        header.add_read_lock(3);
        assert!(header.has_foreign_read_lock(1));
        assert!(!header.has_foreign_read_lock(3));
        header.add_read_lock(1);
        assert!(header.has_foreign_read_lock(3));
        header.clear_read_lock(3);
        header.clear_read_lock(1);
        assert!(!header.has_foreign_read_lock(5));
    }

    #[test]
    #[should_panic]
    fn corrupt_format_tag_is_fatal() {
        let mut buf = vec![0u8; TUPLE_HEADER_LEN];
        buf[0] = 9;
        let _ = TupleHeader::decode(&buf);
    }
}
