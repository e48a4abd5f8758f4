use crate::error::{MvTreeError, MvTreeResult};
use crate::tuple::{TupleFormat, TupleHeader, UpdateDescriptor, VersionTriple, TUPLE_HEADER_LEN};

/// One reverse-applicable update record held inline by a fat tuple:
/// the header triple the tuple carried before that update, plus the XOR
/// diff that rolls the value back across it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatDelta {
    pub triple: VersionTriple,
    pub descriptor: UpdateDescriptor,
    pub diff: Vec<u8>,
}

impl FatDelta {
    pub fn encoded_len(&self) -> usize {
        VersionTriple::ENCODED_LEN + self.descriptor.encoded_size() + self.diff.len()
    }
}

/// Outcome of [`FatTuple::update`].
#[derive(Debug)]
pub enum FatUpdateOutcome {
    Applied {
        /// Header triple before the update, for the WAL record.
        before: VersionTriple,
        /// XOR diff of the update, for the WAL record.
        diff: Vec<u8>,
        /// Deltas evicted to honor the capacity bound, paired with the
        /// version-store triple each must be filed under.
        evicted: Vec<(VersionTriple, FatDelta)>,
    },
    /// The delta cannot be accommodated even with every older delta
    /// evicted.
    TooLarge,
}

/// Decoded working form of a fat slot payload: current value plus a
/// bounded array of deltas ordered newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatTuple {
    pub header: TupleHeader,
    pub value: Vec<u8>,
    pub deltas: Vec<FatDelta>,
}

impl FatTuple {
    /// Start a fat tuple from a chained head; the caller packs deltas
    /// afterwards.
    pub fn from_chained(mut header: TupleHeader, value: &[u8]) -> Self {
        header.format = TupleFormat::Fat;
        Self {
            header,
            value: value.to_vec(),
            deltas: Vec::new(),
        }
    }

    pub fn decode(payload: &[u8]) -> MvTreeResult<Self> {
        if payload.len() < TUPLE_HEADER_LEN + 4 {
            return Err(MvTreeError::Corrupted(
                "payload too short for a fat tuple".to_string(),
            ));
        }
        let header = TupleHeader::decode(payload);
        let value_len =
            u16::from_le_bytes(payload[TUPLE_HEADER_LEN..TUPLE_HEADER_LEN + 2].try_into().unwrap())
                as usize;
        let delta_count =
            u16::from_le_bytes(payload[TUPLE_HEADER_LEN + 2..TUPLE_HEADER_LEN + 4].try_into().unwrap())
                as usize;
        let mut at = TUPLE_HEADER_LEN + 4;
        if payload.len() < at + value_len {
            return Err(MvTreeError::Corrupted(
                "fat tuple value extends past the payload".to_string(),
            ));
        }
        let value = payload[at..at + value_len].to_vec();
        at += value_len;

        let mut deltas = Vec::with_capacity(delta_count);
        for _ in 0..delta_count {
            let (triple, read) = VersionTriple::decode(&payload[at..])?;
            at += read;
            let (descriptor, read) = UpdateDescriptor::decode(&payload[at..])?;
            at += read;
            let diff_len = descriptor.diff_len();
            if payload.len() < at + diff_len {
                return Err(MvTreeError::Corrupted(
                    "fat tuple delta diff extends past the payload".to_string(),
                ));
            }
            let diff = payload[at..at + diff_len].to_vec();
            at += diff_len;
            deltas.push(FatDelta {
                triple,
                descriptor,
                diff,
            });
        }
        Ok(Self {
            header,
            value,
            deltas,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        debug_assert_eq!(self.header.format, TupleFormat::Fat);
        let mut payload = Vec::with_capacity(self.encoded_len());
        payload.resize(TUPLE_HEADER_LEN, 0);
        self.header.encode_into(&mut payload);
        payload.extend_from_slice(&(self.value.len() as u16).to_le_bytes());
        payload.extend_from_slice(&(self.deltas.len() as u16).to_le_bytes());
        payload.extend_from_slice(&self.value);
        for delta in &self.deltas {
            delta.triple.encode_into(&mut payload);
            delta.descriptor.encode_into(&mut payload);
            payload.extend_from_slice(&delta.diff);
        }
        payload
    }

    pub fn encoded_len(&self) -> usize {
        TUPLE_HEADER_LEN + 4 + self.value.len() + self.delta_region_len()
    }

    pub fn delta_region_len(&self) -> usize {
        self.deltas.iter().map(FatDelta::encoded_len).sum()
    }

    /// Apply a same-size in-place update, recording the reverse delta at
    /// the front and evicting the oldest deltas past the capacity bounds.
    pub fn update<F>(
        &mut self,
        writer: VersionTriple,
        descriptor: &UpdateDescriptor,
        mutate: F,
        delta_capacity: usize,
        max_deltas: usize,
    ) -> FatUpdateOutcome
    where
        F: FnOnce(&mut [u8]),
    {
        if !descriptor.fits(self.value.len()) {
            return FatUpdateOutcome::TooLarge;
        }
        let new_delta_len =
            VersionTriple::ENCODED_LEN + descriptor.encoded_size() + descriptor.diff_len();
        if new_delta_len > delta_capacity || max_deltas == 0 {
            return FatUpdateOutcome::TooLarge;
        }

        let before = self.header.triple();
        let mut diff = vec![0u8; descriptor.diff_len()];
        descriptor.xor_ranges(&mut diff, &self.value);
        mutate(&mut self.value);
        descriptor.xor_ranges(&mut diff, &self.value);

        self.deltas.insert(
            0,
            FatDelta {
                triple: before,
                descriptor: descriptor.clone(),
                diff: diff.clone(),
            },
        );
        self.header.set_triple(writer);

        let mut evicted = Vec::new();
        while self.deltas.len() > max_deltas || self.delta_region_len() > delta_capacity {
            let delta = self.deltas.pop().expect("delta array cannot be empty here");
            // The evicted delta continues the chain from the version that
            // is now the oldest inline one.
            let successor = self
                .deltas
                .last()
                .map(|d| d.triple)
                .unwrap_or_else(|| self.header.triple());
            evicted.push((successor, delta));
        }
        FatUpdateOutcome::Applied {
            before,
            diff,
            evicted,
        }
    }

    /// Undo the most recent update in place: pop delta 0, apply its diff,
    /// restore the header triple. Returns false when no delta is left.
    pub fn undo_last(&mut self) -> bool {
        let Some(delta) = self.deltas.first().cloned() else {
            return false;
        };
        self.deltas.remove(0);
        delta.descriptor.apply_xor(&mut self.value, &delta.diff);
        self.header.set_triple(delta.triple);
        true
    }

    /// The deltas in version-chain stream order, each paired with the
    /// triple the version store files it under: delta `i` is reached from
    /// the triple of delta `i - 1` (the head triple for delta 0).
    pub fn chain_entries(&self) -> Vec<(VersionTriple, &FatDelta)> {
        let mut entries = Vec::with_capacity(self.deltas.len());
        let mut successor = self.header.triple();
        for delta in &self.deltas {
            entries.push((successor, delta));
            successor = delta.triple;
        }
        entries
    }
}
