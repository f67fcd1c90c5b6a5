//! Engine facade — wires chain adapters, the merger, and the executor into
//! one run, and owns the shutdown token.
//!
//! The engine is instantiated per run and owns its stores and channels;
//! there is no global state. `run` resolves to a [`RunOutcome`] that maps
//! to the process exit codes: 0 clean, 1 fatal, 75 deep reorg.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use chainflow_core::checkpoint::Checkpoint;
use chainflow_core::config::EngineConfig;
use chainflow_core::error::{report_fatal, EngineError, Severity};
use chainflow_core::Source;
use chainflow_storage::store::ReorgStore;
use chainflow_sync::adapter::{ChainSyncAdapter, SyncSource};
use chainflow_sync::merger::OrderingMerger;

use crate::client::CachedClient;
use crate::executor::IndexingExecutor;
use crate::handler::HandlerRegistry;
use crate::metrics::EngineMetrics;

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// Clean shutdown (signal, stream end); state was torn down.
    Clean,
    /// Fatal error; shadow state is left in place for crash recovery.
    Fatal(EngineError),
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Clean => 0,
            Self::Fatal(error) => error.exit_code(),
        }
    }
}

/// Cloneable handle that requests shutdown.
#[derive(Clone)]
pub struct ShutdownHandle(watch::Sender<bool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.0.send(true);
    }
}

/// One indexing run over N chains.
pub struct Engine {
    config: EngineConfig,
    sources: Vec<Source>,
    registry: HandlerRegistry,
    store: Arc<ReorgStore>,
    client: CachedClient,
    sync: Arc<dyn SyncSource>,
    metrics: Arc<EngineMetrics>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        sources: Vec<Source>,
        registry: HandlerRegistry,
        store: Arc<ReorgStore>,
        client: CachedClient,
        sync: Arc<dyn SyncSource>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            sources,
            registry,
            store,
            client,
            sync,
            metrics: Arc::new(EngineMetrics::new()),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        self.metrics.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_tx.clone())
    }

    /// Drive the run to completion.
    pub async fn run(self) -> RunOutcome {
        self.metrics.set_settings(
            &self.config.ordering.to_string(),
            "sqlite",
            "start",
        );

        match self.run_inner().await {
            Ok(store) => {
                if let Err(error) = store.teardown().await {
                    error!(%error, "teardown failed");
                    return RunOutcome::Fatal(error);
                }
                info!("engine shut down cleanly");
                RunOutcome::Clean
            }
            Err(error) => {
                // User errors were already reported with event context.
                if error.severity() != Severity::NonRetryableUser {
                    report_fatal(&error, None);
                }
                RunOutcome::Fatal(error)
            }
        }
    }

    async fn run_inner(self) -> Result<Arc<ReorgStore>, EngineError> {
        let mut channels = Vec::new();
        let mut finalized_heads = Vec::new();

        for chain in &self.config.chains {
            let chain_id = chain.chain_id;
            let depth = chain
                .finality_depth
                .unwrap_or_else(|| self.sync.finality_depth(chain_id));
            let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
            channels.push((chain_id, rx));

            let chain_sources: Vec<Source> = self
                .sources
                .iter()
                .filter(|s| s.chain_id() == chain_id)
                .cloned()
                .collect();

            if let Some(head) = self.sync.finalized_head(chain_id).await? {
                finalized_heads.push(Checkpoint::block_end(head.timestamp, chain_id, head.number));
            }

            let stream = self.sync.subscribe(chain_id).await?;
            let adapter = ChainSyncAdapter::new(chain_id, depth, chain_sources, tx);
            info!(chain_id, depth, "starting chain adapter");
            tokio::spawn(adapter.run(stream));
        }

        // Historical mode runs up to the lowest finalized head known at
        // start; with no finality information everything is realtime.
        let finalized_target = if finalized_heads.len() == self.config.chains.len() {
            finalized_heads.into_iter().min().unwrap_or(Checkpoint::ZERO)
        } else {
            Checkpoint::ZERO
        };

        let mut merger = OrderingMerger::new(self.config.ordering, channels);
        let mut executor = IndexingExecutor::new(
            self.config,
            self.store,
            self.registry,
            self.client,
            self.metrics.clone(),
            &self.sources,
            finalized_target,
            self.shutdown_rx,
        );
        let result = executor.run(&mut merger).await;
        // Stop upstream adapters regardless of how the run ended.
        merger.close();
        result.map(|()| executor.store().clone())
    }
}

/// Install SIGINT/SIGTERM handlers that trip the shutdown token.
pub fn install_signal_handlers(handle: ShutdownHandle) {
    tokio::spawn(async move {
        let interrupt = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut terminate =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(error) => {
                        error!(%error, "failed to install SIGTERM handler");
                        let _ = interrupt.await;
                        handle.shutdown();
                        return;
                    }
                };
            tokio::select! {
                _ = interrupt => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = interrupt.await;
        }
        info!("shutdown signal received");
        handle.shutdown();
    });
}
