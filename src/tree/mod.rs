pub mod guard;
pub mod iterator;
pub mod node;

pub use guard::{ExclusivePageGuard, OptimisticPageGuard, SharedPageGuard};
pub use iterator::{ExclusiveIterator, LeafBatch, SharedIterator};

use std::sync::Arc;

use crate::buffer::{BufferManager, Page, PageId, TreeId};
use crate::latch::{LatchResult, Restart};
use crate::tree::node::{InnerNode, LeafNode, Node};

/// Structural B-tree layer: page-id-rooted descents, proactive splits and
/// best-effort merges. Slot payloads are opaque bytes owned by the tuple
/// layer above.
#[derive(Debug)]
pub struct TreeCore {
    tree_id: TreeId,
    buffer: Arc<BufferManager>,
    root: PageId,
    node_capacity: usize,
}

impl TreeCore {
    pub fn create(buffer: Arc<BufferManager>, tree_id: TreeId, node_capacity: usize) -> Self {
        let root_page = buffer.allocate_page(tree_id, Node::Leaf(LeafNode::new(node_capacity)));
        Self {
            tree_id,
            buffer,
            root: root_page.id(),
            node_capacity,
        }
    }

    pub fn tree_id(&self) -> TreeId {
        self.tree_id
    }

    pub fn root_page_id(&self) -> PageId {
        self.root
    }

    pub fn buffer(&self) -> &Arc<BufferManager> {
        &self.buffer
    }

    pub fn node_capacity(&self) -> usize {
        self.node_capacity
    }

    fn root_page(&self) -> LatchResult<Arc<Page>> {
        self.buffer.try_fetch(self.root).ok_or(Restart)
    }

    /// Optimistic root-to-leaf descent with lock coupling.
    pub fn find_leaf_optimistic(&self, key: &[u8]) -> LatchResult<OptimisticPageGuard> {
        let mut guard = OptimisticPageGuard::latch(self.root_page()?)?;
        loop {
            let child = match guard.node() {
                Node::Leaf(_) => return Ok(guard),
                Node::Inner(inner) => inner.child_for(key),
            };
            guard = guard.couple_child(&self.buffer, child)?;
        }
    }

    pub fn find_leaf_shared(&self, key: &[u8]) -> LatchResult<SharedPageGuard> {
        Ok(self.find_leaf_optimistic(key)?.into_shared())
    }

    pub fn find_leaf_exclusive(&self, key: &[u8]) -> LatchResult<ExclusivePageGuard> {
        self.find_leaf_optimistic(key)?.upgrade()
    }

    /// Leaf holding the greatest key strictly below `key`, if any. Used by
    /// descending scans; tracks the nearest left subtree during the
    /// descent and falls back to its rightmost leaf.
    pub fn find_leaf_before(&self, key: &[u8]) -> LatchResult<Option<SharedPageGuard>> {
        let mut guard = OptimisticPageGuard::latch(self.root_page()?)?;
        let mut left_subtree: Option<PageId> = None;
        loop {
            let child = match guard.node() {
                Node::Leaf(leaf) => {
                    let (pos, _) = leaf.lower_bound(key);
                    if pos > 0 {
                        return Ok(Some(guard.into_shared()));
                    }
                    return match left_subtree {
                        Some(subtree) => self.rightmost_leaf_of(subtree).map(Some),
                        None => {
                            guard.recheck()?;
                            Ok(None)
                        }
                    };
                }
                Node::Inner(inner) => {
                    let index = inner.child_index_for(key);
                    if index > 0 {
                        left_subtree = Some(inner.child_at(index - 1));
                    }
                    inner.child_at(index)
                }
            };
            guard = guard.couple_child(&self.buffer, child)?;
        }
    }

    fn rightmost_leaf_of(&self, subtree: PageId) -> LatchResult<SharedPageGuard> {
        let page = self.buffer.try_fetch(subtree).ok_or(Restart)?;
        let mut guard = OptimisticPageGuard::latch(page)?;
        loop {
            let child = match guard.node() {
                Node::Leaf(_) => return Ok(guard.into_shared()),
                Node::Inner(inner) => inner.child_at(inner.child_count() - 1),
            };
            guard = guard.couple_child(&self.buffer, child)?;
        }
    }

    fn needs_split(&self, node: &Node, key: &[u8], entry_size: usize) -> bool {
        match node {
            Node::Leaf(leaf) => leaf.free_space() < entry_size,
            // Conservative headroom for a separator produced further down.
            Node::Inner(inner) => !inner.has_space_for(key.len() + 16),
        }
    }

    /// Whether an entry of this size can ever be hosted, i.e. splitting is
    /// worthwhile at all.
    pub fn entry_fits_empty_leaf(&self, key_len: usize, payload_len: usize) -> bool {
        LeafNode::entry_size(key_len, payload_len) <= self.node_capacity
    }

    /// Make room along the path of `key` for an entry of `entry_size`
    /// bytes: a full-path exclusive descent that splits every node that
    /// could overflow, growing the tree at the root when needed.
    pub fn split_for_key(&self, key: &[u8], entry_size: usize) {
        let root_page = self
            .buffer
            .try_fetch(self.root)
            .expect("root page is never reclaimed");
        let mut parent = ExclusivePageGuard::latch(root_page);
        if self.needs_split(parent.node(), key, entry_size) {
            self.grow_root(&mut parent);
        }
        loop {
            let child_id = match parent.node() {
                Node::Leaf(_) => return,
                Node::Inner(inner) => inner.child_for(key),
            };
            let Some(child_page) = self.buffer.try_fetch(child_id) else {
                return;
            };
            let mut child = ExclusivePageGuard::latch(child_page);
            if self.needs_split(child.node(), key, entry_size) {
                self.split_child(&mut parent, &mut child, key);
                drop(child);
                continue;
            }
            parent = child;
        }
    }

    /// Split the root in place: its halves move to fresh pages and the
    /// root page itself becomes their parent, so the root page id never
    /// changes.
    fn grow_root(&self, root: &mut ExclusivePageGuard) {
        let capacity = self.node_capacity;
        let replacement = match root.node_mut() {
            Node::Leaf(leaf) => {
                if leaf.slot_count() < 2 {
                    return;
                }
                let (separator, right) = leaf.split();
                let right_page = self.buffer.allocate_page(self.tree_id, Node::Leaf(right));
                let mut left = leaf.clone();
                left.next_leaf = right_page.id();
                let left_page = self.buffer.allocate_page(self.tree_id, Node::Leaf(left));
                Node::Inner(InnerNode::new_root(
                    capacity,
                    separator,
                    left_page.id(),
                    right_page.id(),
                ))
            }
            Node::Inner(inner) => {
                if inner.pivot_count() < 3 {
                    return;
                }
                let (up, right) = inner.split();
                let right_page = self.buffer.allocate_page(self.tree_id, Node::Inner(right));
                let left_page = self
                    .buffer
                    .allocate_page(self.tree_id, Node::Inner(inner.clone()));
                Node::Inner(InnerNode::new_root(
                    capacity,
                    up,
                    left_page.id(),
                    right_page.id(),
                ))
            }
        };
        *root.node_mut() = replacement;
        root.mark_dirty();
    }

    fn split_child(
        &self,
        parent: &mut ExclusivePageGuard,
        child: &mut ExclusivePageGuard,
        key: &[u8],
    ) {
        let child_index = parent.node().as_inner().child_index_for(key);
        debug_assert_eq!(
            parent.node().as_inner().child_at(child_index),
            child.page_id()
        );
        let split = match child.node_mut() {
            Node::Leaf(leaf) => {
                if leaf.slot_count() < 2 {
                    return;
                }
                let (separator, right) = leaf.split();
                let right_page = self.buffer.allocate_page(self.tree_id, Node::Leaf(right));
                leaf.next_leaf = right_page.id();
                (separator, right_page.id())
            }
            Node::Inner(inner) => {
                if inner.pivot_count() < 3 {
                    return;
                }
                let (up, right) = inner.split();
                let right_page = self.buffer.allocate_page(self.tree_id, Node::Inner(right));
                (up, right_page.id())
            }
        };
        parent
            .node_mut()
            .as_inner_mut()
            .insert_pivot(child_index, split.0, split.1);
        parent.mark_dirty();
        child.mark_dirty();
    }

    /// Best-effort structure shrink around `key`: absorb single-child
    /// inner nodes and merge the target leaf with an adjacent sibling when
    /// the combined content fits one node.
    pub fn merge_for_key(&self, key: &[u8]) {
        let Some(root_page) = self.buffer.try_fetch(self.root) else {
            return;
        };
        let mut parent = ExclusivePageGuard::latch(root_page);
        loop {
            if !parent.node().is_leaf() && parent.node().as_inner().child_count() == 1 {
                self.absorb_single_child(&mut parent);
                continue;
            }
            let (child_index, child_id) = match parent.node() {
                Node::Leaf(_) => return,
                Node::Inner(inner) => {
                    let index = inner.child_index_for(key);
                    (index, inner.child_at(index))
                }
            };
            let Some(child_page) = self.buffer.try_fetch(child_id) else {
                return;
            };
            let child = ExclusivePageGuard::latch(child_page);
            if child.node().is_leaf() {
                self.merge_leaf_with_sibling(parent, child, child_index);
                return;
            }
            parent = child;
        }
    }

    fn absorb_single_child(&self, parent: &mut ExclusivePageGuard) {
        let child_id = parent.node().as_inner().child_at(0);
        let Some(child_page) = self.buffer.try_fetch(child_id) else {
            return;
        };
        let mut child = ExclusivePageGuard::latch(child_page);
        let node = std::mem::replace(child.node_mut(), Node::Leaf(LeafNode::new(0)));
        *parent.node_mut() = node;
        parent.mark_dirty();
        child.reclaim(&self.buffer);
    }

    fn merge_leaf_with_sibling(
        &self,
        mut parent: ExclusivePageGuard,
        mut child: ExclusivePageGuard,
        child_index: usize,
    ) {
        if !child.node().as_leaf().is_underfull() {
            return;
        }
        let child_count = parent.node().as_inner().child_count();
        // Try the right sibling first, falling back to the left one.
        if child_index + 1 < child_count {
            let right_id = parent.node().as_inner().child_at(child_index + 1);
            if let Some(right_page) = self.buffer.try_fetch(right_id) {
                let mut right = ExclusivePageGuard::latch(right_page);
                if right.node().is_leaf() && child.node().as_leaf().can_host(right.node().as_leaf())
                {
                    let taken = std::mem::replace(
                        right.node_mut().as_leaf_mut(),
                        LeafNode::new(self.node_capacity),
                    );
                    child.node_mut().as_leaf_mut().merge_from(taken);
                    parent.node_mut().as_inner_mut().remove_pivot(child_index);
                    parent.mark_dirty();
                    child.mark_dirty();
                    right.reclaim(&self.buffer);
                    return;
                }
            }
        }
        if child_index > 0 {
            let left_id = parent.node().as_inner().child_at(child_index - 1);
            if let Some(left_page) = self.buffer.try_fetch(left_id) {
                let mut left = ExclusivePageGuard::latch(left_page);
                if left.node().is_leaf() && left.node().as_leaf().can_host(child.node().as_leaf()) {
                    let taken = std::mem::replace(
                        child.node_mut().as_leaf_mut(),
                        LeafNode::new(self.node_capacity),
                    );
                    left.node_mut().as_leaf_mut().merge_from(taken);
                    parent
                        .node_mut()
                        .as_inner_mut()
                        .remove_pivot(child_index - 1);
                    parent.mark_dirty();
                    left.mark_dirty();
                    child.reclaim(&self.buffer);
                }
            }
        }
    }

    /// Engine callback support: hand every child page id of `page_id` to
    /// `f`. No-op on leaves.
    pub fn iterate_children(&self, page_id: PageId, f: &mut dyn FnMut(PageId)) {
        let Some(page) = self.buffer.try_fetch(page_id) else {
            return;
        };
        let guard = SharedPageGuard::latch(page);
        if let Node::Inner(inner) = guard.node() {
            for child in inner.children() {
                f(*child);
            }
        }
    }

    /// Engine callback support: parent of `child` by structural search
    /// from the root.
    pub fn find_parent(&self, child: PageId) -> Option<PageId> {
        self.find_parent_below(self.root, child)
    }

    fn find_parent_below(&self, node_id: PageId, child: PageId) -> Option<PageId> {
        let page = self.buffer.try_fetch(node_id)?;
        let guard = SharedPageGuard::latch(page);
        let children: Vec<PageId> = match guard.node() {
            Node::Leaf(_) => return None,
            Node::Inner(inner) => inner.children().to_vec(),
        };
        drop(guard);
        if children.contains(&child) {
            return Some(node_id);
        }
        children
            .into_iter()
            .find_map(|below| self.find_parent_below(below, child))
    }
}
