//! chainflow-sync — per-chain sync adapters and the cross-chain ordering
//! merger.
//!
//! ```text
//! SyncSource (per chain)
//!     │ SourceUpdate: Block / Reorg / Finalize
//!     ▼
//! ChainSyncAdapter  — unfinalized ring, reconcile, reorg walk
//!     │ ChainUpdate over a bounded channel
//!     ▼
//! OrderingMerger    — multichain or omnichain checkpoint order
//!     │ MergedEvent
//!     ▼
//! (indexing executor)
//! ```

pub mod adapter;
pub mod merger;

pub use adapter::{ChainSyncAdapter, ChainUpdate, SourceUpdate, SyncSource};
pub use merger::{MergedEvent, OrderingMerger};
