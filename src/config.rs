/// Engine-wide settings, captured once at [`crate::engine::Engine`] creation.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Number of worker slots. Each OS thread claims one slot for its
    /// sessions. Bounded by 64 because the 2PL read-lock word is a bitmap.
    pub workers: usize,
}

impl EngineConfig {
    pub fn default_workers() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get().min(64))
            .unwrap_or(1)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            workers: Self::default_workers(),
        }
    }
}

/// Per-index settings, captured at index creation.
#[derive(Debug, Clone, Copy)]
pub struct IndexConfig {
    /// Multi-version behavior. When off, updates never record secondary
    /// versions.
    pub enable_mvcc: bool,
    /// Allow chained-to-fat tuple promotion on update.
    pub enable_fat_tuple: bool,
    /// Permit skipping version creation when every worker runs
    /// read-committed single-statement transactions.
    pub enable_version_elision: bool,
    /// Forced chained update without versioning (benchmark mode).
    pub forced_chained_update: bool,
    /// Structural-only remove (benchmark mode, unsafe under MVCC).
    pub forced_remove: bool,
    /// Record `(page, latch version, slot)` in remove versions so garbage
    /// collection can reclaim slots without a descent.
    pub enable_dangling_pointer: bool,
    /// Hard cap when walking a version chain.
    pub max_chain_length: usize,
    /// Serializable variant: read locks instead of read timestamps.
    pub two_phase_locking: bool,
    /// Leaf garbage collection (fat-tuple decompose) during space checks.
    pub enable_leaf_gc: bool,
    /// Byte budget of one tree node.
    pub node_capacity: usize,
    /// Byte budget of the inline delta region of a fat tuple.
    pub fat_tuple_delta_capacity: usize,
    /// Upper bound on inline deltas per fat tuple.
    pub fat_tuple_max_deltas: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            enable_mvcc: true,
            enable_fat_tuple: true,
            enable_version_elision: false,
            forced_chained_update: false,
            forced_remove: false,
            enable_dangling_pointer: true,
            max_chain_length: 64,
            two_phase_locking: false,
            enable_leaf_gc: true,
            node_capacity: 4096,
            fat_tuple_delta_capacity: 768,
            fat_tuple_max_deltas: 16,
        }
    }
}
