//! Multi-version transactional B-tree index over an in-memory buffer
//! pool. Keys and values are opaque byte strings; every leaf slot carries
//! its own MVCC state (chained version chain or inline fat-tuple deltas),
//! reached through hybrid-latched page descents with restart-on-conflict.

pub mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod latch;
pub mod tree;
pub mod tuple;
pub mod version;
pub mod wal;
pub mod worker;

#[cfg(test)]
mod tests;

pub use config::{EngineConfig, IndexConfig};
pub use engine::Engine;
pub use error::{MvTreeError, MvTreeResult};
pub use index::{MvTree, OpResult};
pub use worker::{IsolationLevel, TxMode, TxOptions, WorkerSession};
