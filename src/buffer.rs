use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::latch::HybridLatch;
use crate::tree::node::Node;

pub type PageId = u64;
pub const INVALID_PAGE_ID: PageId = 0;

pub type TreeId = u32;

/// Answer of a tree to a space-utilization probe on one of its pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceCheckResult {
    Nothing,
    PickAnother,
    RestartSame,
}

/// One buffer frame: the node body behind a hybrid latch, plus the frame
/// bookkeeping the engine reads back.
pub struct Page {
    id: PageId,
    tree_id: TreeId,
    latch: HybridLatch<Node>,
    dirty: AtomicBool,
}

impl Page {
    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn tree_id(&self) -> TreeId {
        self.tree_id
    }

    pub fn latch(&self) -> &HybridLatch<Node> {
        &self.latch
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("tree_id", &self.tree_id)
            .field("latch", &self.latch)
            .finish()
    }
}

/// In-memory page provider: allocation, lookup and reclamation over a
/// concurrent page table. Eviction and disk residency are out of scope.
#[derive(Debug)]
pub struct BufferManager {
    pages: DashMap<PageId, Arc<Page>>,
    next_page_id: AtomicU64,
}

impl BufferManager {
    pub fn new() -> Self {
        Self {
            pages: DashMap::new(),
            next_page_id: AtomicU64::new(1),
        }
    }

    pub fn allocate_page(&self, tree_id: TreeId, node: Node) -> Arc<Page> {
        let id = self.next_page_id.fetch_add(1, Ordering::SeqCst);
        let page = Arc::new(Page {
            id,
            tree_id,
            latch: HybridLatch::new(node),
            dirty: AtomicBool::new(false),
        });
        self.pages.insert(id, page.clone());
        page
    }

    /// Resolve a page id. `None` when the page was reclaimed; descents
    /// treat that as a latch conflict and restart.
    pub fn try_fetch(&self, id: PageId) -> Option<Arc<Page>> {
        self.pages.get(&id).map(|entry| entry.value().clone())
    }

    pub fn reclaim_page(&self, id: PageId) {
        self.pages.remove(&id);
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

impl Default for BufferManager {
    fn default() -> Self {
        Self::new()
    }
}
