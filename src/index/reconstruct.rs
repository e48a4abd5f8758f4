use crate::tuple::{ChainedTuple, FatTuple, TupleFormat, TupleHeader, UpdateDescriptor, VersionTriple};
use crate::version::{VersionPayload, VersionStore};
use crate::worker::WorkerSession;

/// Result of materialising the version of a primary tuple visible to one
/// reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconstructed {
    Found(Vec<u8>),
    NotFound,
}

/// Walk a slot payload back to the version visible to `session` (spec'd
/// for chained heads; fat heads walk their inline deltas first and then
/// continue into the external chain).
pub fn reconstruct_tuple(
    session: &WorkerSession,
    versions: &VersionStore,
    payload: &[u8],
    max_chain_length: usize,
) -> Reconstructed {
    let header = TupleHeader::decode(payload);
    match header.format {
        TupleFormat::Chained => {
            if session.is_visible(header.worker_id, header.tx_id) {
                if header.is_removed() {
                    return Reconstructed::NotFound;
                }
                return Reconstructed::Found(ChainedTuple::value(payload).to_vec());
            }
            let value = ChainedTuple::value(payload).to_vec();
            walk_external_chain(session, versions, value, header.triple(), 1, max_chain_length)
        }
        TupleFormat::Fat => {
            let fat = FatTuple::decode(payload).expect("fat tuple payload must decode");
            if session.is_visible(fat.header.worker_id, fat.header.tx_id) {
                return Reconstructed::Found(fat.value);
            }
            let mut value = fat.value.clone();
            let mut cursor = fat.header.triple();
            let mut chain_length = 1;
            for delta in &fat.deltas {
                delta.descriptor.apply_xor(&mut value, &delta.diff);
                cursor = delta.triple;
                if session.is_visible(cursor.worker_id, cursor.tx_id) {
                    return Reconstructed::Found(value);
                }
                chain_length += 1;
                assert!(
                    chain_length <= max_chain_length,
                    "version chain exceeded the configured maximum"
                );
            }
            walk_external_chain(session, versions, value, cursor, chain_length, max_chain_length)
        }
    }
}

fn walk_external_chain(
    session: &WorkerSession,
    versions: &VersionStore,
    mut value: Vec<u8>,
    mut cursor: VersionTriple,
    mut chain_length: usize,
    max_chain_length: usize,
) -> Reconstructed {
    loop {
        let step = versions.retrieve(cursor, |payload| match payload {
            VersionPayload::Update(update) => {
                if update.is_delta {
                    let (descriptor, read) = UpdateDescriptor::decode(&update.body)
                        .expect("stored update descriptor must decode");
                    descriptor.apply_xor(&mut value, &update.body[read..]);
                } else {
                    value = update.body.clone();
                }
                update.before
            }
            VersionPayload::Remove(remove) => {
                value = remove.value.clone();
                remove.before
            }
        });
        let Some(before) = step else {
            // The chain was garbage collected past the reader's horizon.
            return Reconstructed::NotFound;
        };
        cursor = before;
        if session.is_visible(cursor.worker_id, cursor.tx_id) {
            return Reconstructed::Found(value);
        }
        chain_length += 1;
        assert!(
            chain_length <= max_chain_length,
            "version chain exceeded the configured maximum"
        );
    }
}
