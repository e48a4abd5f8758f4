use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::buffer::{BufferManager, PageId, SpaceCheckResult, TreeId};
use crate::config::{EngineConfig, IndexConfig};
use crate::error::{MvTreeError, MvTreeResult};
use crate::index::MvTree;
use crate::version::{TodoOutcome, VersionStore};
use crate::wal::WalRecord;
use crate::worker::{TxId, WorkerId, WorkerRegistry, WorkerSession};

/// Watermarks one garbage-collection pass runs against.
#[derive(Debug, Clone, Copy)]
pub struct GcContext {
    pub oltp_lwm: TxId,
    pub olap_lwm: TxId,
}

/// Callbacks a registered tree exposes back to the engine, dispatched by
/// tree id during rollback, garbage collection and buffer housekeeping.
pub trait TreeHooks: Send + Sync {
    fn iterate_children(&self, page_id: PageId, f: &mut dyn FnMut(PageId));
    fn find_parent(&self, child: PageId) -> Option<PageId>;
    fn check_space_utilization(&self, page_id: PageId) -> SpaceCheckResult;
    fn undo(&self, record: &WalRecord);
    fn todo(
        &self,
        entry: &[u8],
        version_worker: WorkerId,
        version_tx: TxId,
        called_before: bool,
        ctx: &GcContext,
    ) -> TodoOutcome;
    fn unlock(&self, worker_id: WorkerId, entry: &[u8]);
    fn checkpoint(&self) {}
    fn serialize(&self) -> Vec<(String, String)>;
}

/// Process root: buffer manager, worker registry, version store and the
/// registered trees. Created once and shared through `Arc`.
pub struct Engine {
    config: EngineConfig,
    buffer: Arc<BufferManager>,
    registry: Arc<WorkerRegistry>,
    versions: Arc<VersionStore>,
    trees: DashMap<TreeId, Arc<dyn TreeHooks>>,
    next_tree_id: AtomicU32,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            buffer: Arc::new(BufferManager::new()),
            registry: Arc::new(WorkerRegistry::new(config.workers)),
            versions: Arc::new(VersionStore::new(config.workers)),
            trees: DashMap::new(),
            next_tree_id: AtomicU32::new(1),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn buffer(&self) -> &Arc<BufferManager> {
        &self.buffer
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn versions(&self) -> &Arc<VersionStore> {
        &self.versions
    }

    /// Build a versioned index plus its graveyard twin and register both
    /// page families for callback dispatch.
    pub fn create_index(self: &Arc<Self>, config: IndexConfig) -> Arc<MvTree> {
        let primary_id = self.next_tree_id.fetch_add(1, Ordering::SeqCst);
        let graveyard_id = self.next_tree_id.fetch_add(1, Ordering::SeqCst);
        let tree = Arc::new(MvTree::new(
            self.buffer.clone(),
            self.versions.clone(),
            self.registry.clone(),
            config,
            primary_id,
            graveyard_id,
        ));
        let hooks: Arc<dyn TreeHooks> = tree.clone();
        self.trees.insert(primary_id, hooks.clone());
        self.trees.insert(graveyard_id, hooks);
        tree
    }

    pub fn session(self: &Arc<Self>, worker_id: WorkerId) -> MvTreeResult<WorkerSession> {
        if worker_id as usize >= self.config.workers {
            return Err(MvTreeError::Internal(format!(
                "worker id {} out of range (workers: {})",
                worker_id, self.config.workers
            )));
        }
        Ok(WorkerSession::new(self.clone(), worker_id))
    }

    pub(crate) fn dispatch_undo(&self, tree_id: TreeId, record: &WalRecord) {
        if let Some(tree) = self.trees.get(&tree_id) {
            tree.undo(record);
        }
    }

    pub(crate) fn dispatch_unlock(&self, tree_id: TreeId, worker_id: WorkerId, entry: &[u8]) {
        if let Some(tree) = self.trees.get(&tree_id) {
            tree.unlock(worker_id, entry);
        }
    }

    /// One garbage-collection pass: refresh the watermarks and drive the
    /// version store's todo protocol through the registered trees.
    pub fn garbage_collect(&self) {
        let (oltp_lwm, olap_lwm) = self.registry.watermarks();
        let ctx = GcContext { oltp_lwm, olap_lwm };
        self.versions
            .collect_garbage(oltp_lwm, olap_lwm, |tree_id, entry, triple, called_before| {
                match self.trees.get(&tree_id) {
                    Some(tree) => tree.todo(
                        entry,
                        triple.worker_id,
                        triple.tx_id,
                        called_before,
                        &ctx,
                    ),
                    None => TodoOutcome::Removed,
                }
            });
    }

    /// Route a buffer space probe to the owning tree.
    pub fn check_space_utilization(&self, page_id: PageId) -> SpaceCheckResult {
        let Some(page) = self.buffer.try_fetch(page_id) else {
            return SpaceCheckResult::Nothing;
        };
        match self.trees.get(&page.tree_id()) {
            Some(tree) => tree.check_space_utilization(page_id),
            None => SpaceCheckResult::Nothing,
        }
    }
}
