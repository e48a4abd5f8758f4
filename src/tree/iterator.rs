use crate::buffer::{PageId, INVALID_PAGE_ID};
use crate::latch::{LatchResult, Restart};
use crate::tree::guard::{ExclusivePageGuard, OptimisticPageGuard, SharedPageGuard};
use crate::tree::node::{LeafNode, Node};
use crate::tree::TreeCore;

/// Exclusive cursor over one leaf slot, the mutation workhorse of the
/// index operations.
pub struct ExclusiveIterator<'a> {
    tree: &'a TreeCore,
    guard: ExclusivePageGuard,
    slot: usize,
    seek_key: Vec<u8>,
}

impl<'a> ExclusiveIterator<'a> {
    /// Position on `key`; `None` when the key is absent.
    pub fn seek_exact(tree: &'a TreeCore, key: &[u8]) -> LatchResult<Option<Self>> {
        let guard = tree.find_leaf_exclusive(key)?;
        let (slot, exact) = guard.node().as_leaf().lower_bound(key);
        if !exact {
            return Ok(None);
        }
        Ok(Some(Self {
            tree,
            guard,
            slot,
            seek_key: key.to_vec(),
        }))
    }

    /// Position at the insertion point of `key`; the flag reports an
    /// existing slot with that key.
    pub fn seek_to_insert(tree: &'a TreeCore, key: &[u8]) -> LatchResult<(Self, bool)> {
        let guard = tree.find_leaf_exclusive(key)?;
        let (slot, exact) = guard.node().as_leaf().lower_bound(key);
        Ok((
            Self {
                tree,
                guard,
                slot,
                seek_key: key.to_vec(),
            },
            exact,
        ))
    }

    /// Dangling-pointer fast path: latch the recorded page only if its
    /// latch still carries `expected_version`, then pin the recorded slot.
    pub fn open_pinned(
        tree: &'a TreeCore,
        page_id: PageId,
        expected_version: u64,
        slot: usize,
    ) -> LatchResult<Self> {
        let page = tree.buffer().try_fetch(page_id).ok_or(Restart)?;
        if page.tree_id() != tree.tree_id() {
            return Err(Restart);
        }
        let guard = OptimisticPageGuard::latch_pinned(page, expected_version)?.upgrade()?;
        if !guard.node().is_leaf() || slot >= guard.node().as_leaf().slot_count() {
            return Err(Restart);
        }
        let seek_key = guard.node().as_leaf().key(slot).to_vec();
        Ok(Self {
            tree,
            guard,
            slot,
            seek_key,
        })
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn key(&self) -> &[u8] {
        self.guard.node().as_leaf().key(self.slot)
    }

    pub fn payload(&self) -> &[u8] {
        self.guard.node().as_leaf().payload(self.slot)
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        self.guard.node_mut().as_leaf_mut().payload_mut(self.slot)
    }

    pub fn replace_payload(&mut self, payload: Vec<u8>) {
        self.guard
            .node_mut()
            .as_leaf_mut()
            .replace_payload(self.slot, payload);
    }

    pub fn resize_payload(&mut self, new_len: usize) {
        self.guard
            .node_mut()
            .as_leaf_mut()
            .resize_payload(self.slot, new_len);
    }

    pub fn has_space_for(&self, key_len: usize, payload_len: usize) -> bool {
        self.guard.node().as_leaf().has_space_for(key_len, payload_len)
    }

    pub fn free_space(&self) -> usize {
        self.guard.node().as_leaf().free_space()
    }

    /// Insert at the current position (from [`Self::seek_to_insert`]) and
    /// stay positioned on the new slot.
    pub fn insert_here(&mut self, key: Vec<u8>, payload: Vec<u8>) {
        debug_assert!(self.has_space_for(key.len(), payload.len()));
        self.guard
            .node_mut()
            .as_leaf_mut()
            .insert(self.slot, key, payload);
    }

    pub fn remove_current(&mut self) {
        self.guard.node_mut().as_leaf_mut().remove_slot(self.slot);
    }

    pub fn set_has_garbage(&mut self) {
        self.guard.node_mut().as_leaf_mut().has_garbage = true;
    }

    pub fn mark_dirty(&self) {
        self.guard.mark_dirty();
    }

    pub fn page_id(&self) -> PageId {
        self.guard.page_id()
    }

    pub fn version_after_release(&self) -> u64 {
        self.guard.version_after_release()
    }

    /// Release the cursor and shrink the tree around the sought key when
    /// the leaf became underfull.
    pub fn merge_if_needed(self) {
        if !self.guard.node().as_leaf().is_underfull() {
            return;
        }
        let tree = self.tree;
        let key = self.seek_key.clone();
        drop(self);
        tree.merge_for_key(&key);
    }
}

/// Shared cursor for pessimistic point reads.
pub struct SharedIterator {
    guard: SharedPageGuard,
    slot: usize,
}

impl SharedIterator {
    pub fn seek_exact(tree: &TreeCore, key: &[u8]) -> LatchResult<Option<Self>> {
        let guard = tree.find_leaf_shared(key)?;
        let (slot, exact) = guard.node().as_leaf().lower_bound(key);
        if !exact {
            return Ok(None);
        }
        Ok(Some(Self { guard, slot }))
    }

    pub fn key(&self) -> &[u8] {
        self.guard.node().as_leaf().key(self.slot)
    }

    pub fn payload(&self) -> &[u8] {
        self.guard.node().as_leaf().payload(self.slot)
    }
}

/// Copied-out content of one leaf for scan processing outside the latch.
#[derive(Debug)]
pub struct LeafBatch {
    /// Qualifying `(key, payload)` pairs in ascending key order.
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
    /// Greatest key resident in the leaf, qualifying or not.
    pub leaf_max_key: Option<Vec<u8>>,
    pub next_leaf: PageId,
}

/// Batch of the leaf covering `start`: every entry with `key >= start`.
pub fn collect_from(tree: &TreeCore, start: &[u8]) -> LatchResult<LeafBatch> {
    let guard = tree.find_leaf_shared(start)?;
    let leaf = guard.node().as_leaf();
    let (pos, _) = leaf.lower_bound(start);
    let entries = (pos..leaf.slot_count())
        .map(|i| (leaf.key(i).to_vec(), leaf.payload(i).to_vec()))
        .collect();
    Ok(LeafBatch {
        entries,
        leaf_max_key: (leaf.slot_count() > 0).then(|| leaf.key(leaf.slot_count() - 1).to_vec()),
        next_leaf: leaf.next_leaf,
    })
}

/// Batch of a specific leaf page, used to hop over empty leaves by the
/// sibling chain. `None` when the page is gone or no longer a leaf of this
/// tree.
pub fn collect_page(tree: &TreeCore, page_id: PageId) -> LatchResult<Option<LeafBatch>> {
    let Some(page) = tree.buffer().try_fetch(page_id) else {
        return Ok(None);
    };
    if page.tree_id() != tree.tree_id() {
        return Ok(None);
    }
    let guard = SharedPageGuard::latch(page);
    let Node::Leaf(leaf) = guard.node() else {
        return Ok(None);
    };
    let entries = (0..leaf.slot_count())
        .map(|i| (leaf.key(i).to_vec(), leaf.payload(i).to_vec()))
        .collect();
    Ok(Some(LeafBatch {
        entries,
        leaf_max_key: (leaf.slot_count() > 0).then(|| leaf.key(leaf.slot_count() - 1).to_vec()),
        next_leaf: leaf.next_leaf,
    }))
}

/// Entries at or below `bound` (strictly below unless `inclusive`), in
/// descending key order, from the leaf that holds the nearest key.
pub fn collect_desc(
    tree: &TreeCore,
    bound: &[u8],
    inclusive: bool,
) -> LatchResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let guard = tree.find_leaf_shared(bound)?;
    let leaf = guard.node().as_leaf();
    let (pos, exact) = leaf.lower_bound(bound);
    let upper = if exact && inclusive { pos + 1 } else { pos };
    if upper > 0 {
        return Ok((0..upper)
            .rev()
            .map(|i| (leaf.key(i).to_vec(), leaf.payload(i).to_vec()))
            .collect());
    }
    drop(guard);

    // Nothing qualifies in the covering leaf; the predecessor leaf holds
    // only smaller keys, so every entry qualifies.
    match tree.find_leaf_before(bound)? {
        None => Ok(Vec::new()),
        Some(guard) => {
            let leaf = guard.node().as_leaf();
            Ok((0..leaf.slot_count())
                .rev()
                .map(|i| (leaf.key(i).to_vec(), leaf.payload(i).to_vec()))
                .collect())
        }
    }
}

/// Structural insert used by the graveyard: plain key/payload slot with
/// split-and-retry. `false` when the entry cannot fit any leaf.
pub fn insert_kv(tree: &TreeCore, key: &[u8], payload: Vec<u8>) -> LatchResult<bool> {
    if !tree.entry_fits_empty_leaf(key.len(), payload.len()) {
        return Ok(false);
    }
    loop {
        let (mut iterator, duplicate) = ExclusiveIterator::seek_to_insert(tree, key)?;
        if duplicate {
            iterator.replace_payload(payload);
            iterator.mark_dirty();
            return Ok(true);
        }
        if !iterator.has_space_for(key.len(), payload.len()) {
            drop(iterator);
            tree.split_for_key(key, LeafNode::entry_size(key.len(), payload.len()));
            continue;
        }
        iterator.insert_here(key.to_vec(), payload);
        iterator.mark_dirty();
        return Ok(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferManager;
    use std::sync::Arc;

    fn small_tree() -> TreeCore {
        TreeCore::create(Arc::new(BufferManager::new()), 1, 256)
    }

    fn fill(tree: &TreeCore, count: u32) {
        for i in 0..count {
            let key = format!("{i:04}").into_bytes();
            loop {
                if insert_kv(tree, &key, b"payload".to_vec()).unwrap_or(false) {
                    break;
                }
            }
        }
    }

    #[test]
    fn seek_exact_and_mutate() {
        let tree = small_tree();
        fill(&tree, 40);

        assert!(ExclusiveIterator::seek_exact(&tree, b"none").unwrap().is_none());
        let mut iterator = ExclusiveIterator::seek_exact(&tree, b"0007").unwrap().unwrap();
        assert_eq!(iterator.key(), b"0007");
        assert_eq!(iterator.payload(), b"payload");

        iterator.payload_mut()[0] = b'P';
        assert_eq!(iterator.payload(), b"Payload");
        iterator.resize_payload(3);
        assert_eq!(iterator.payload(), b"Pay");
    }

    #[test]
    fn remove_and_merge() {
        let tree = small_tree();
        fill(&tree, 60);
        let pages_before = tree.buffer().page_count();

        for i in 0..60u32 {
            let key = format!("{i:04}").into_bytes();
            loop {
                match ExclusiveIterator::seek_exact(&tree, &key) {
                    Ok(Some(mut iterator)) => {
                        iterator.remove_current();
                        iterator.merge_if_needed();
                        break;
                    }
                    Ok(None) => panic!("key must exist"),
                    Err(Restart) => continue,
                }
            }
        }
        assert!(tree.buffer().page_count() < pages_before);
    }

    #[test]
    fn pinned_open_detects_version_change() {
        let tree = small_tree();
        fill(&tree, 10);

        let (page_id, version, slot) = {
            let iterator = ExclusiveIterator::seek_exact(&tree, b"0004").unwrap().unwrap();
            (
                iterator.page_id(),
                iterator.version_after_release(),
                iterator.slot(),
            )
        };
        // Untouched page: the pin matches.
        let iterator = ExclusiveIterator::open_pinned(&tree, page_id, version, slot).unwrap();
        assert_eq!(iterator.key(), b"0004");
        drop(iterator);

        // The exclusive cycle above bumped the latch; the pin is stale now.
        assert!(ExclusiveIterator::open_pinned(&tree, page_id, version, slot).is_err());
    }

    #[test]
    fn scan_batches_cover_everything_in_order() {
        let tree = small_tree();
        fill(&tree, 80);

        let mut seen = Vec::new();
        let mut cursor = Vec::new();
        loop {
            let batch = collect_from(&tree, &cursor).unwrap();
            for (key, _) in &batch.entries {
                seen.push(key.clone());
            }
            let Some(max_key) = batch.leaf_max_key else {
                break;
            };
            if batch.next_leaf == INVALID_PAGE_ID {
                break;
            }
            cursor = max_key;
            cursor.push(0);
        }
        assert_eq!(seen.len(), 80);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn desc_batches_walk_backwards() {
        let tree = small_tree();
        fill(&tree, 50);

        let mut seen = Vec::new();
        let mut bound = b"0049".to_vec();
        let mut inclusive = true;
        loop {
            let entries = collect_desc(&tree, &bound, inclusive).unwrap();
            if entries.is_empty() {
                break;
            }
            for (key, _) in &entries {
                seen.push(key.clone());
            }
            bound = seen.last().unwrap().clone();
            inclusive = false;
        }
        assert_eq!(seen.len(), 50);
        assert!(seen.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn shared_iterator_reads_payload() {
        let tree = small_tree();
        fill(&tree, 5);
        let iterator = SharedIterator::seek_exact(&tree, b"0003").unwrap().unwrap();
        assert_eq!(iterator.key(), b"0003");
        assert_eq!(iterator.payload(), b"payload");
        assert!(SharedIterator::seek_exact(&tree, b"9999").unwrap().is_none());
    }
}
