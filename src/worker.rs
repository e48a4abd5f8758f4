use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::debug;

use crate::buffer::TreeId;
use crate::engine::Engine;
use crate::error::{MvTreeError, MvTreeResult};
use crate::wal::{WalBuffer, WalRecord};

pub type WorkerId = u16;
pub type TxId = u64;
pub type CommandId = u32;

pub const INVALID_COMMAND_ID: CommandId = u32::MAX;

/// High bit of a worker's registered transaction word: set while the
/// worker is idle or running read-committed single-statement transactions.
/// Version elision requires it on every worker.
pub const WORKER_IDLE_BIT: u64 = 1 << 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    SnapshotIsolation,
    Serializable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    /// Short transaction; the common path.
    Oltp,
    /// Long-running reader tracked by the OLAP watermark; sees graveyard
    /// rows.
    Olap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOptions {
    pub mode: TxMode,
    pub isolation: IsolationLevel,
    /// Auto-commit at the end of one index operation.
    pub single_statement: bool,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            mode: TxMode::Oltp,
            isolation: IsolationLevel::SnapshotIsolation,
            single_statement: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    InProgress,
    Committed,
    Aborted,
}

/// Begin-time view of the transaction population, in the classic
/// xmin/xmax/active form.
#[derive(Debug, Clone)]
pub struct Snapshot {
    xmin: TxId,
    xmax: TxId,
    active: Vec<TxId>,
}

impl Snapshot {
    pub fn new(xmin: TxId, xmax: TxId, mut active: Vec<TxId>) -> Self {
        active.sort_unstable();
        Self { xmin, xmax, active }
    }

    pub fn xmin(&self) -> TxId {
        self.xmin
    }

    pub fn xmax(&self) -> TxId {
        self.xmax
    }

    /// Whether a foreign transaction's writes are part of this snapshot.
    pub fn sees<F>(&self, tx_id: TxId, status_of: F) -> bool
    where
        F: Fn(TxId) -> TxStatus,
    {
        if tx_id >= self.xmax {
            return false;
        }
        if tx_id < self.xmin {
            return status_of(tx_id) == TxStatus::Committed;
        }
        if self.active.binary_search(&tx_id).is_ok() {
            return false;
        }
        status_of(tx_id) == TxStatus::Committed
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveTxInfo {
    mode: TxMode,
    /// Oldest transaction this one may still need versions of.
    snapshot_xmin: TxId,
}

/// Shared transaction bookkeeping: id assignment, status table, active
/// set, per-worker registered transaction words and the low-water-marks
/// the GC protocol runs against.
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: usize,
    next_tx_id: AtomicU64,
    statuses: DashMap<TxId, TxStatus>,
    active: DashMap<TxId, ActiveTxInfo>,
    in_progress: Vec<AtomicU64>,
}

impl WorkerRegistry {
    pub fn new(workers: usize) -> Self {
        assert!(
            workers >= 1 && workers <= 64,
            "worker count must fit the read-lock bitmap"
        );
        Self {
            workers,
            next_tx_id: AtomicU64::new(1),
            statuses: DashMap::new(),
            active: DashMap::new(),
            in_progress: (0..workers).map(|_| AtomicU64::new(WORKER_IDLE_BIT)).collect(),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn status(&self, tx_id: TxId) -> TxStatus {
        self.statuses
            .get(&tx_id)
            .map(|entry| *entry.value())
            // Unknown ids belong to pruned history; treat as committed.
            .unwrap_or(TxStatus::Committed)
    }

    fn begin_tx(&self, worker_id: WorkerId, options: TxOptions) -> (TxId, Option<Snapshot>) {
        let tx_id = self.next_tx_id.fetch_add(1, Ordering::SeqCst);
        self.statuses.insert(tx_id, TxStatus::InProgress);

        let snapshot = if options.isolation == IsolationLevel::ReadCommitted {
            None
        } else {
            let active: Vec<TxId> = self
                .active
                .iter()
                .map(|entry| *entry.key())
                .filter(|id| *id != tx_id)
                .collect();
            let xmin = active.iter().copied().min().unwrap_or(tx_id);
            Some(Snapshot::new(xmin, tx_id, active))
        };

        let snapshot_xmin = snapshot.as_ref().map(|s| s.xmin()).unwrap_or(tx_id);
        self.active.insert(
            tx_id,
            ActiveTxInfo {
                mode: options.mode,
                snapshot_xmin,
            },
        );

        let idle_style =
            options.isolation == IsolationLevel::ReadCommitted && options.single_statement;
        let word = if idle_style { tx_id | WORKER_IDLE_BIT } else { tx_id };
        self.in_progress[worker_id as usize].store(word, Ordering::Release);
        (tx_id, snapshot)
    }

    fn finish_tx(&self, worker_id: WorkerId, tx_id: TxId, committed: bool) {
        let status = if committed {
            TxStatus::Committed
        } else {
            TxStatus::Aborted
        };
        self.statuses.insert(tx_id, status);
        self.active.remove(&tx_id);
        self.in_progress[worker_id as usize].store(tx_id | WORKER_IDLE_BIT, Ordering::Release);
    }

    /// Every registered worker is in-progress-and-idle: the version
    /// elision precondition.
    pub fn all_workers_idle(&self) -> bool {
        self.in_progress
            .iter()
            .all(|word| word.load(Ordering::Acquire) & WORKER_IDLE_BIT != 0)
    }

    pub fn registered_tx_word(&self, worker_id: WorkerId) -> u64 {
        self.in_progress[worker_id as usize].load(Ordering::Acquire)
    }

    /// `(oltp_lwm, olap_lwm)`: the oldest transaction any live short /
    /// any live transaction at all might still read.
    pub fn watermarks(&self) -> (TxId, TxId) {
        let fallback = self.next_tx_id.load(Ordering::SeqCst);
        let mut oltp = fallback;
        let mut olap = fallback;
        for entry in self.active.iter() {
            let info = entry.value();
            olap = olap.min(info.snapshot_xmin);
            if info.mode == TxMode::Oltp {
                oltp = oltp.min(info.snapshot_xmin);
            }
        }
        (oltp, olap)
    }
}

#[derive(Debug)]
struct ActiveTx {
    tx_id: TxId,
    options: TxOptions,
    snapshot: Option<Snapshot>,
    oltp_lwm: TxId,
    olap_lwm: TxId,
}

/// Per-thread worker handle: the current transaction, the command-id
/// counter, the in-flight WAL tail and the 2PL unlock log. Index
/// operations borrow one of these; it is deliberately not `Sync`.
pub struct WorkerSession {
    engine: Arc<Engine>,
    worker_id: WorkerId,
    default_options: Cell<TxOptions>,
    active: RefCell<Option<ActiveTx>>,
    command_counter: Cell<CommandId>,
    wal: RefCell<WalBuffer>,
    unlock_log: RefCell<Vec<(TreeId, Vec<u8>)>>,
}

impl WorkerSession {
    pub(crate) fn new(engine: Arc<Engine>, worker_id: WorkerId) -> Self {
        Self {
            engine,
            worker_id,
            default_options: Cell::new(TxOptions::default()),
            active: RefCell::new(None),
            command_counter: Cell::new(0),
            wal: RefCell::new(WalBuffer::new()),
            unlock_log: RefCell::new(Vec::new()),
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn set_default_tx_options(&self, options: TxOptions) {
        self.default_options.set(options);
    }

    pub fn has_active_tx(&self) -> bool {
        self.active.borrow().is_some()
    }

    pub fn begin(&self, options: TxOptions) -> MvTreeResult<()> {
        if self.has_active_tx() {
            return Err(MvTreeError::Transaction(format!(
                "worker {} already has an active transaction",
                self.worker_id
            )));
        }
        let registry = self.engine.registry();
        let (tx_id, snapshot) = registry.begin_tx(self.worker_id, options);
        let (oltp_lwm, olap_lwm) = registry.watermarks();
        debug!(
            "worker {} begins tx {} ({:?}/{:?})",
            self.worker_id, tx_id, options.mode, options.isolation
        );
        *self.active.borrow_mut() = Some(ActiveTx {
            tx_id,
            options,
            snapshot,
            oltp_lwm,
            olap_lwm,
        });
        self.command_counter.set(0);
        Ok(())
    }

    /// Start the default transaction when an operation arrives outside an
    /// explicit one.
    pub(crate) fn ensure_active_tx(&self) -> MvTreeResult<()> {
        if !self.has_active_tx() {
            self.begin(self.default_options.get())?;
        }
        Ok(())
    }

    pub fn commit(&self) -> MvTreeResult<()> {
        let Some(tx) = self.active.borrow_mut().take() else {
            return Err(MvTreeError::Transaction(
                "commit without an active transaction".to_string(),
            ));
        };
        debug!("worker {} commits tx {}", self.worker_id, tx.tx_id);
        self.flush_unlock_log();
        self.wal.borrow_mut().clear();
        self.engine
            .registry()
            .finish_tx(self.worker_id, tx.tx_id, true);
        Ok(())
    }

    /// Roll back: replay the worker's WAL tail newest-first through the
    /// owning trees, then release read locks and retire the transaction.
    pub fn abort(&self) -> MvTreeResult<()> {
        let Some(tx) = self.active.borrow_mut().take() else {
            return Err(MvTreeError::Transaction(
                "abort without an active transaction".to_string(),
            ));
        };
        debug!("worker {} aborts tx {}", self.worker_id, tx.tx_id);
        let frames = self.wal.borrow_mut().take_reversed();
        for frame in frames {
            let (tree_id, record) = crate::wal::decode_wal_record(&frame)?;
            self.engine.dispatch_undo(tree_id, &record);
        }
        self.flush_unlock_log();
        self.engine
            .registry()
            .finish_tx(self.worker_id, tx.tx_id, false);
        Ok(())
    }

    fn flush_unlock_log(&self) {
        let entries = std::mem::take(&mut *self.unlock_log.borrow_mut());
        for (tree_id, entry) in entries {
            self.engine.dispatch_unlock(tree_id, self.worker_id, &entry);
        }
    }

    pub(crate) fn maybe_auto_commit(&self) -> MvTreeResult<()> {
        if self.is_single_statement() && self.has_active_tx() {
            self.commit()?;
        }
        Ok(())
    }

    pub(crate) fn maybe_auto_abort(&self) -> MvTreeResult<()> {
        if self.is_single_statement() && self.has_active_tx() {
            self.abort()?;
        }
        Ok(())
    }

    /// Transaction timestamp of the active transaction.
    pub fn tts(&self) -> TxId {
        self.active
            .borrow()
            .as_ref()
            .map(|tx| tx.tx_id)
            .expect("operation requires an active transaction")
    }

    pub fn is_olap(&self) -> bool {
        self.active
            .borrow()
            .as_ref()
            .map(|tx| tx.options.mode == TxMode::Olap)
            .unwrap_or(false)
    }

    pub fn is_serializable(&self) -> bool {
        self.active
            .borrow()
            .as_ref()
            .map(|tx| tx.options.isolation == IsolationLevel::Serializable)
            .unwrap_or(false)
    }

    pub fn is_single_statement(&self) -> bool {
        self.active
            .borrow()
            .as_ref()
            .map(|tx| tx.options.single_statement)
            .unwrap_or(false)
    }

    pub fn local_oltp_lwm(&self) -> TxId {
        match self.active.borrow().as_ref() {
            Some(tx) => tx.oltp_lwm,
            None => self.engine.registry().watermarks().0,
        }
    }

    pub fn local_olap_lwm(&self) -> TxId {
        match self.active.borrow().as_ref() {
            Some(tx) => tx.olap_lwm,
            None => self.engine.registry().watermarks().1,
        }
    }

    /// Whether the version written by `(worker_id, tx_id)` is part of this
    /// session's read view.
    pub fn is_visible(&self, _writer: WorkerId, tx_id: TxId) -> bool {
        let active = self.active.borrow();
        let registry = self.engine.registry();
        match active.as_ref() {
            None => registry.status(tx_id) == TxStatus::Committed,
            Some(tx) => {
                if tx_id == tx.tx_id {
                    return true;
                }
                match &tx.snapshot {
                    // Read committed: statement-level freshness.
                    None => registry.status(tx_id) == TxStatus::Committed,
                    Some(snapshot) => snapshot.sees(tx_id, |id| registry.status(id)),
                }
            }
        }
    }

    /// Monotonic per-transaction write sequence.
    pub(crate) fn next_command_id(&self) -> CommandId {
        let id = self.command_counter.get();
        self.command_counter.set(id + 1);
        id
    }

    pub(crate) fn wal_ensure_enough_space(&self, upcoming: usize) {
        self.wal.borrow_mut().ensure_enough_space(upcoming);
    }

    pub(crate) fn wal_append(&self, tree_id: TreeId, record: &WalRecord) {
        self.wal.borrow_mut().append(tree_id, record);
    }

    #[cfg(test)]
    pub(crate) fn wal_len(&self) -> usize {
        self.wal.borrow().len()
    }

    pub(crate) fn queue_unlock(&self, tree_id: TreeId, entry: Vec<u8>) {
        self.unlock_log.borrow_mut().push((tree_id, entry));
    }
}
