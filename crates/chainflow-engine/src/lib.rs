//! chainflow-engine — the indexing executor and engine facade.
//!
//! # Architecture
//!
//! ```text
//! Engine
//!   ├── ChainSyncAdapter ×N  (chainflow-sync, one task per chain)
//!   ├── OrderingMerger       (multichain / omnichain)
//!   └── IndexingExecutor
//!         ├── HandlerRegistry  (user indexing functions)
//!         ├── Context          (per-event: chain, db, client, contracts)
//!         ├── WriteBuffer      (historical batches)
//!         ├── ReorgStore       (chainflow-storage)
//!         └── CachedClient     (memory → KV → transport)
//! ```

pub mod client;
pub mod context;
pub mod engine;
pub mod executor;
pub mod handler;
pub mod metrics;

pub use client::{CachedClient, RetryPolicy, RpcTransport};
pub use context::{ChainInfo, Context, ContractHandle};
pub use engine::{install_signal_handlers, Engine, RunOutcome, ShutdownHandle};
pub use executor::{IndexingExecutor, MergedStream, Mode};
pub use handler::{HandlerRegistry, IndexingFunction};
pub use metrics::{EngineMetrics, MetricsSnapshot};
