use crate::error::{MvTreeError, MvTreeResult};

/// One touched byte range of a same-size in-place update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateRange {
    pub offset: u16,
    pub len: u16,
}

/// Ordered list of `(offset, len)` ranges describing which bytes of a value
/// an update touches. Diffs over a descriptor are XOR diffs: the same bytes
/// roll an update forward and backward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateDescriptor {
    ranges: Vec<UpdateRange>,
}

impl UpdateDescriptor {
    pub fn new(ranges: Vec<UpdateRange>) -> Self {
        Self { ranges }
    }

    pub fn single(offset: u16, len: u16) -> Self {
        Self {
            ranges: vec![UpdateRange { offset, len }],
        }
    }

    pub fn ranges(&self) -> &[UpdateRange] {
        &self.ranges
    }

    /// Serialized size of the descriptor itself.
    pub fn encoded_size(&self) -> usize {
        2 + self.ranges.len() * 4
    }

    /// Total bytes of diff data the descriptor covers.
    pub fn diff_len(&self) -> usize {
        self.ranges.iter().map(|r| r.len as usize).sum()
    }

    /// Whether every range lies within a value of `value_len` bytes.
    pub fn fits(&self, value_len: usize) -> bool {
        self.ranges
            .iter()
            .all(|r| r.offset as usize + r.len as usize <= value_len)
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.ranges.len() as u16).to_le_bytes());
        for range in &self.ranges {
            buf.extend_from_slice(&range.offset.to_le_bytes());
            buf.extend_from_slice(&range.len.to_le_bytes());
        }
    }

    pub fn decode(bytes: &[u8]) -> MvTreeResult<(Self, usize)> {
        if bytes.len() < 2 {
            return Err(MvTreeError::Corrupted(
                "descriptor too short for range count".to_string(),
            ));
        }
        let count = u16::from_le_bytes(bytes[0..2].try_into().unwrap()) as usize;
        let end = 2 + count * 4;
        if bytes.len() < end {
            return Err(MvTreeError::Corrupted(format!(
                "descriptor of {} ranges needs {} bytes, got {}",
                count,
                end,
                bytes.len()
            )));
        }
        let mut ranges = Vec::with_capacity(count);
        for i in 0..count {
            let at = 2 + i * 4;
            ranges.push(UpdateRange {
                offset: u16::from_le_bytes(bytes[at..at + 2].try_into().unwrap()),
                len: u16::from_le_bytes(bytes[at + 2..at + 4].try_into().unwrap()),
            });
        }
        Ok((Self { ranges }, end))
    }

    /// XOR the covered value bytes into `diff`. Calling this once with the
    /// pre-image and once with the post-image leaves `diff` holding the
    /// self-inverse XOR of both.
    pub fn xor_ranges(&self, diff: &mut [u8], value: &[u8]) {
        debug_assert_eq!(diff.len(), self.diff_len());
        let mut at = 0;
        for range in &self.ranges {
            let start = range.offset as usize;
            for i in 0..range.len as usize {
                diff[at + i] ^= value[start + i];
            }
            at += range.len as usize;
        }
    }

    /// Apply an XOR diff to the covered ranges of `value`.
    pub fn apply_xor(&self, value: &mut [u8], diff: &[u8]) {
        debug_assert_eq!(diff.len(), self.diff_len());
        let mut at = 0;
        for range in &self.ranges {
            let start = range.offset as usize;
            for i in 0..range.len as usize {
                value[start + i] ^= diff[at + i];
            }
            at += range.len as usize;
        }
    }
}
