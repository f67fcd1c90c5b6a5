//! The indexing executor — drives user handlers over the merged event
//! stream.
//!
//! Two modes share the same store abstraction:
//!
//! - **Historical**: events accumulate into batches; one transaction per
//!   batch, writes staged in the write buffer and bulk-flushed, then the
//!   shadow rows are stamped with the batch's last checkpoint.
//! - **Realtime**: one transaction per event, direct writes (triggers
//!   capture images naturally), stamped with the event's checkpoint.
//!
//! Control events are handled only at batch boundaries: any in-flight
//! batch commits first, then the reorg/finalize applies.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use chainflow_core::checkpoint::Checkpoint;
use chainflow_core::config::EngineConfig;
use chainflow_core::error::{report_fatal, EngineError, EventErrorContext, Severity};
use chainflow_core::event::{ControlEvent, Event, EventData, ReorgedBlock};
use chainflow_core::Source;
use chainflow_storage::buffer::WriteBuffer;
use chainflow_storage::store::ReorgStore;
use chainflow_sync::merger::{MergedEvent, OrderingMerger};

use crate::client::CachedClient;
use crate::context::{ChainInfo, ContractHandle, Context};
use crate::handler::HandlerRegistry;
use crate::metrics::EngineMetrics;

/// Executor mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Historical,
    Realtime,
}

/// The executor's input: anything yielding merged events in order.
#[async_trait]
pub trait MergedStream: Send {
    async fn next(&mut self) -> Result<Option<MergedEvent>, EngineError>;
}

#[async_trait]
impl MergedStream for OrderingMerger {
    async fn next(&mut self) -> Result<Option<MergedEvent>, EngineError> {
        OrderingMerger::next(self).await
    }
}

enum Tick {
    Shutdown,
    Item(Option<MergedEvent>),
}

/// Drives user indexing functions against the reorg-tracking store.
pub struct IndexingExecutor {
    config: EngineConfig,
    store: Arc<ReorgStore>,
    registry: HandlerRegistry,
    client: CachedClient,
    metrics: Arc<EngineMetrics>,
    contracts: HashMap<String, ContractHandle>,
    shutdown: watch::Receiver<bool>,
    /// The historical/realtime boundary fixed at start.
    finalized_target: Checkpoint,
    mode: Mode,
    latest: Checkpoint,
}

impl IndexingExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        store: Arc<ReorgStore>,
        registry: HandlerRegistry,
        client: CachedClient,
        metrics: Arc<EngineMetrics>,
        sources: &[Source],
        finalized_target: Checkpoint,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let mut contracts = HashMap::new();
        for source in sources {
            if let Source::Contract(contract) = source {
                contracts.insert(
                    contract.name.clone(),
                    ContractHandle {
                        address: contract.addresses.first().cloned(),
                        child_addresses: Default::default(),
                    },
                );
            }
        }
        Self {
            config,
            store,
            registry,
            client,
            metrics,
            contracts,
            shutdown,
            finalized_target,
            mode: Mode::Historical,
            latest: Checkpoint::ZERO,
        }
    }

    pub fn store(&self) -> &Arc<ReorgStore> {
        &self.store
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn latest(&self) -> Checkpoint {
        self.latest
    }

    /// Consume the merged stream until it ends, shutdown is requested, or
    /// a fatal error occurs. On a clean end the triggers and shadow tables
    /// are left in place; the engine facade decides whether to tear down.
    pub async fn run(&mut self, stream: &mut dyn MergedStream) -> Result<(), EngineError> {
        self.recover().await?;

        {
            let store = self.store.clone();
            let mut conn = store
                .pool()
                .acquire()
                .await
                .map_err(|e| EngineError::Storage(e.to_string()))?;
            store.create_triggers(&mut conn).await?;
        }

        let mut batch: Vec<Event> = Vec::new();
        loop {
            if *self.shutdown.borrow() {
                info!("shutdown requested, stopping executor");
                return Ok(());
            }
            let tick = tokio::select! {
                biased;
                _ = self.shutdown.changed() => Tick::Shutdown,
                item = stream.next() => Tick::Item(item?),
            };
            match tick {
                Tick::Shutdown => {
                    info!("shutdown requested, stopping executor");
                    return Ok(());
                }
                Tick::Item(None) => {
                    self.flush_batch(&mut batch).await?;
                    info!("merged stream ended");
                    return Ok(());
                }
                Tick::Item(Some(MergedEvent::Event(event))) => {
                    self.on_event(event, &mut batch).await?;
                }
                Tick::Item(Some(MergedEvent::Control(control))) => {
                    // Mid-batch control events are forbidden: commit first.
                    self.flush_batch(&mut batch).await?;
                    match control {
                        ControlEvent::Reorg { chain_id, checkpoint, reorged_blocks } => {
                            self.handle_reorg(chain_id, checkpoint, reorged_blocks).await?;
                        }
                        ControlEvent::Finalize { checkpoint, .. } => {
                            self.handle_finalize(checkpoint).await?;
                        }
                    }
                }
            }
        }
    }

    /// Crash recovery: a latest checkpoint ahead of the safe one means the
    /// previous run died before finalizing — revert to safe before
    /// accepting events.
    async fn recover(&mut self) -> Result<(), EngineError> {
        if let Some(build_id) = self.config.build_id.clone() {
            self.store.verify_build(&build_id).await?;
        }
        if let Some((safe, latest)) = self.store.checkpoints().await? {
            self.latest = latest;
            if latest > safe {
                warn!(
                    safe = %safe,
                    latest = %latest,
                    "unclean shutdown detected, reverting to safe checkpoint"
                );
                let store = self.store.clone();
                let mut tx = store.begin().await?;
                store.revert_all(&mut tx, &safe).await?;
                store.set_latest(&mut tx, &safe).await?;
                tx.commit().await.map_err(|e| EngineError::Storage(e.to_string()))?;
                self.latest = safe;
            }
        }
        if self.latest >= self.finalized_target && self.finalized_target > Checkpoint::ZERO {
            self.mode = Mode::Realtime;
        }
        Ok(())
    }

    async fn on_event(&mut self, event: Event, batch: &mut Vec<Event>) -> Result<(), EngineError> {
        match self.mode {
            Mode::Historical => {
                if event.checkpoint > self.finalized_target {
                    // Caught up with finality: drain the batch and switch.
                    self.flush_batch(batch).await?;
                    self.mode = Mode::Realtime;
                    info!(checkpoint = %event.checkpoint, "switching to realtime mode");
                    self.process_realtime(&event).await
                } else {
                    batch.push(event);
                    if batch.len() >= self.config.batch_size {
                        self.flush_batch(batch).await?;
                    }
                    Ok(())
                }
            }
            Mode::Realtime => self.process_realtime(&event).await,
        }
    }

    /// Commit a historical batch in one transaction, bounded by the
    /// historical ceiling. A timeout here is fatal: batches are never
    /// partially retried.
    async fn flush_batch(&mut self, batch: &mut Vec<Event>) -> Result<(), EngineError> {
        if batch.is_empty() {
            return Ok(());
        }
        let events = std::mem::take(batch);
        let ceiling = Duration::from_millis(self.config.historical_tx_timeout_ms);
        match tokio::time::timeout(ceiling, self.run_batch(&events)).await {
            Err(_) => Err(EngineError::TransactionTimeout {
                ms: self.config.historical_tx_timeout_ms,
            }),
            Ok(result) => result,
        }
    }

    async fn run_batch(&mut self, events: &[Event]) -> Result<(), EngineError> {
        let last = events.last().expect("non-empty batch").checkpoint;
        let store = self.store.clone();
        let mut tx = store.begin().await?;
        let mut buffer = WriteBuffer::new();

        for event in events {
            self.dispatch(event, &mut tx, Some(&mut buffer)).await?;
        }

        buffer.flush(&store, &mut tx).await?;
        store.stamp(&mut tx, &last).await?;
        store.set_latest(&mut tx, &last).await?;
        tx.commit().await.map_err(|e| EngineError::Storage(e.to_string()))?;

        self.latest = last;
        debug!(events = events.len(), checkpoint = %last, "batch committed");
        Ok(())
    }

    /// One transaction per event; retryable failures are retried with the
    /// client's backoff profile, bounded by the realtime ceiling per try.
    async fn process_realtime(&mut self, event: &Event) -> Result<(), EngineError> {
        let retry = crate::client::RetryPolicy::default();
        let mut attempt = 0u32;
        loop {
            match self.realtime_once(event).await {
                Ok(()) => return Ok(()),
                Err(error) if error.is_retryable() => {
                    attempt += 1;
                    match retry.next_delay(attempt) {
                        Some(delay) => {
                            warn!(%error, attempt, "retrying realtime event");
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(error),
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn realtime_once(&mut self, event: &Event) -> Result<(), EngineError> {
        let ceiling = Duration::from_millis(self.config.realtime_tx_timeout_ms);
        let store = self.store.clone();
        let checkpoint = event.checkpoint;
        let work = async {
            let mut tx = store.begin().await?;
            self.dispatch(event, &mut tx, None).await?;
            store.stamp(&mut tx, &checkpoint).await?;
            store.set_latest(&mut tx, &checkpoint).await?;
            tx.commit().await.map_err(|e| EngineError::Storage(e.to_string()))?;
            Ok(())
        };
        match tokio::time::timeout(ceiling, work).await {
            Err(_) => Err(EngineError::TransactionTimeout {
                ms: self.config.realtime_tx_timeout_ms,
            }),
            Ok(result) => {
                if result.is_ok() {
                    self.latest = checkpoint;
                }
                result
            }
        }
    }

    /// Run the handler for one event inside the given transaction.
    async fn dispatch(
        &mut self,
        event: &Event,
        conn: &mut sqlx::SqliteConnection,
        buffer: Option<&mut WriteBuffer>,
    ) -> Result<(), EngineError> {
        if let EventData::Log { log, .. } = &event.data {
            self.learn_child(&event.name, &log.address);
        }

        let handler = match event.data {
            EventData::Setup => self.registry.get_setup(&event.name),
            _ => self.registry.get(&event.name),
        };
        let Some(handler) = handler.cloned() else {
            debug!(name = %event.name, "no handler registered, skipping event");
            return Ok(());
        };

        let chain = self.chain_info(event.chain_id);
        let started = Instant::now();
        let mut context = Context::new(
            chain,
            &self.client,
            &self.contracts,
            &self.store,
            conn,
            buffer,
        );
        let result = handler.call(event, &mut context).await;
        drop(context);
        self.metrics.record_event(&event.name, started.elapsed());

        if let Err(error) = &result {
            if error.severity() == Severity::NonRetryableUser {
                report_fatal(
                    error,
                    Some(&EventErrorContext {
                        name: event.name.clone(),
                        chain_id: event.chain_id,
                        block_number: event.checkpoint.block_number,
                        checkpoint: event.checkpoint,
                    }),
                );
            }
        }
        result
    }

    /// A log whose address differs from the source's static address came
    /// from a factory child; remember it for the contract handle.
    fn learn_child(&mut self, name: &str, address: &str) {
        if let Some(handle) = self.contracts.get_mut(name) {
            let is_static = handle
                .address
                .as_deref()
                .is_some_and(|a| a.eq_ignore_ascii_case(address));
            if !is_static {
                handle.child_addresses.insert(address.to_ascii_lowercase());
            }
        }
    }

    fn chain_info(&self, chain_id: u64) -> ChainInfo {
        match self.config.chain(chain_id) {
            Some(chain) => ChainInfo { id: chain_id, name: chain.name.clone() },
            None => ChainInfo { id: chain_id, name: chain_id.to_string() },
        }
    }

    /// Revert all user tables to the reorg's ancestor checkpoint, then
    /// forget the dropped factory children.
    async fn handle_reorg(
        &mut self,
        chain_id: u64,
        checkpoint: Checkpoint,
        reorged_blocks: Vec<ReorgedBlock>,
    ) -> Result<(), EngineError> {
        info!(chain_id, checkpoint = %checkpoint, depth = reorged_blocks.len(), "handling reorg");
        let store = self.store.clone();
        let mut tx = store.begin().await?;
        store.drop_triggers(&mut tx).await?;
        for table in &store.schema().tables {
            let rows = store.revert_table(&mut tx, table, &checkpoint).await?;
            self.metrics.record_revert_rows(&table.name, rows);
        }
        store.create_triggers(&mut tx).await?;
        store.set_latest(&mut tx, &checkpoint).await?;
        tx.commit().await.map_err(|e| EngineError::Storage(e.to_string()))?;
        self.latest = checkpoint;

        for reorged in &reorged_blocks {
            for address in &reorged.removed_child_addresses {
                let lower = address.to_ascii_lowercase();
                for handle in self.contracts.values_mut() {
                    handle.child_addresses.remove(&lower);
                }
            }
        }
        self.metrics.record_reorg(chain_id, reorged_blocks.len());
        Ok(())
    }

    /// Prune shadow rows below finality and persist the safe checkpoint;
    /// switch to realtime once finality has caught up with the target.
    async fn handle_finalize(&mut self, checkpoint: Checkpoint) -> Result<(), EngineError> {
        let store = self.store.clone();
        let mut tx = store.begin().await?;
        let pruned = store.finalize(&mut tx, &checkpoint).await?;
        tx.commit().await.map_err(|e| EngineError::Storage(e.to_string()))?;
        debug!(checkpoint = %checkpoint, pruned, "finalized");

        if self.mode == Mode::Historical && checkpoint >= self.finalized_target {
            self.mode = Mode::Realtime;
            info!(checkpoint = %checkpoint, "finality caught up, switching to realtime mode");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RpcTransport;
    use chainflow_core::config::{ChainConfig, OrderingPolicy};
    use chainflow_core::source::ContractSource;
    use chainflow_storage::schema::{Column, ColumnType, Schema, Table};
    use chainflow_storage::store::Row;
    use serde_json::{json, Value};
    use std::collections::VecDeque;

    struct NoTransport;

    #[async_trait]
    impl RpcTransport for NoTransport {
        async fn request(&self, _: u64, _: &str, _: &Value) -> Result<Value, EngineError> {
            Err(EngineError::Rpc("unused".into()))
        }
    }

    /// Scripted stream for driving the executor in tests.
    pub(crate) struct ScriptedStream(pub VecDeque<MergedEvent>);

    #[async_trait]
    impl MergedStream for ScriptedStream {
        async fn next(&mut self) -> Result<Option<MergedEvent>, EngineError> {
            Ok(self.0.pop_front())
        }
    }

    struct InsertRow;

    #[async_trait]
    impl crate::handler::IndexingFunction for InsertRow {
        async fn call(&self, event: &Event, ctx: &mut Context<'_>) -> Result<(), EngineError> {
            if let EventData::Log { log, .. } = &event.data {
                let mut row = Row::new();
                row.insert("id".into(), json!(log.data.clone()));
                row.insert("v".into(), json!(1));
                ctx.insert("transfers", row).await?;
            }
            Ok(())
        }
    }

    fn schema() -> Schema {
        Schema::new(vec![Table::new(
            "transfers",
            vec![Column::new("id", ColumnType::Text), Column::new("v", ColumnType::Integer)],
            "id",
        )])
    }

    fn sources() -> Vec<Source> {
        vec![Source::Contract(ContractSource {
            name: "T".into(),
            chain_id: 1,
            addresses: vec!["0xtoken".into()],
            topics0: vec![],
            factory: None,
            include_call_traces: false,
        })]
    }

    fn log_event(id: &str, block: u64) -> Event {
        Event {
            chain_id: 1,
            name: "T".into(),
            checkpoint: Checkpoint {
                block_timestamp: block * 12,
                chain_id: 1,
                block_number: block,
                transaction_index: 0,
                event_type: 4,
                event_index: 0,
            },
            data: EventData::Log {
                log: chainflow_core::event::RawLog {
                    address: "0xtoken".into(),
                    topics: vec!["0xddf2".into()],
                    data: id.into(),
                    log_index: 0,
                    transaction_index: 0,
                    transaction_hash: "0xtx".into(),
                },
                block: chainflow_core::event::RawBlock {
                    number: block,
                    hash: format!("0x{block:x}"),
                    parent_hash: format!("0x{:x}", block.saturating_sub(1)),
                    timestamp: block * 12,
                },
                fields: json!({}),
            },
        }
    }

    async fn executor(finalized_target: Checkpoint) -> IndexingExecutor {
        let store = Arc::new(ReorgStore::in_memory(schema()).await.unwrap());
        let client = CachedClient::in_memory(Arc::new(NoTransport), 1_000).await.unwrap();
        let mut registry = HandlerRegistry::new();
        registry.register("T", Arc::new(InsertRow));
        let mut config = EngineConfig::default();
        config.ordering = OrderingPolicy::Omnichain;
        config.chains = vec![ChainConfig::new(1, "mainnet")];
        config.batch_size = 2;
        let (_tx, rx) = watch::channel(false);
        IndexingExecutor::new(
            config,
            store,
            registry,
            client,
            Arc::new(EngineMetrics::new()),
            &sources(),
            finalized_target,
            rx,
        )
    }

    #[tokio::test]
    async fn historical_batches_then_switches_to_realtime() {
        let mut exec = executor(Checkpoint::block_end(36, 1, 3)).await;
        let mut stream = ScriptedStream(
            vec![
                MergedEvent::Event(log_event("a", 1)),
                MergedEvent::Event(log_event("b", 2)),
                MergedEvent::Event(log_event("c", 3)),
                // Past the finalized target: realtime from here.
                MergedEvent::Event(log_event("d", 4)),
            ]
            .into_iter()
            .collect(),
        );
        exec.run(&mut stream).await.unwrap();
        assert_eq!(exec.mode(), Mode::Realtime);

        let store = exec.store().clone();
        let table = store.schema().table("transfers").unwrap().clone();
        let mut conn = store.pool().acquire().await.unwrap();
        for id in ["a", "b", "c", "d"] {
            assert!(
                store.find(&mut conn, &table, &json!(id)).await.unwrap().is_some(),
                "missing row {id}"
            );
        }
        // Everything was stamped: no sentinel rows remain.
        assert_eq!(store.shadow_rows_at_max(&mut conn, &table).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_handler_is_skipped() {
        let mut exec = executor(Checkpoint::MAX).await;
        let mut unknown = log_event("a", 1);
        unknown.name = "Nobody".into();
        let mut stream = ScriptedStream(vec![MergedEvent::Event(unknown)].into_iter().collect());
        exec.run(&mut stream).await.unwrap();
        let snapshot = exec.metrics.snapshot();
        assert!(snapshot.events_processed.is_empty());
    }

    #[tokio::test]
    async fn reorg_control_reverts_and_counts() {
        let mut exec = executor(Checkpoint::MAX).await;
        let reorg_at = Checkpoint::block_end(24, 1, 2);
        let mut stream = ScriptedStream(
            vec![
                MergedEvent::Event(log_event("a", 1)),
                MergedEvent::Event(log_event("b", 2)),
                MergedEvent::Event(log_event("c", 3)),
                MergedEvent::Control(ControlEvent::Reorg {
                    chain_id: 1,
                    checkpoint: reorg_at,
                    reorged_blocks: vec![],
                }),
            ]
            .into_iter()
            .collect(),
        );
        exec.run(&mut stream).await.unwrap();

        let store = exec.store().clone();
        let table = store.schema().table("transfers").unwrap().clone();
        let mut conn = store.pool().acquire().await.unwrap();
        assert!(store.find(&mut conn, &table, &json!("a")).await.unwrap().is_some());
        assert!(store.find(&mut conn, &table, &json!("b")).await.unwrap().is_some());
        assert!(store.find(&mut conn, &table, &json!("c")).await.unwrap().is_none());
        assert_eq!(exec.latest(), reorg_at);
        assert_eq!(exec.metrics.snapshot().reorgs[&1], 1);
    }

    #[tokio::test]
    async fn shutdown_token_stops_the_loop() {
        let store = Arc::new(ReorgStore::in_memory(schema()).await.unwrap());
        let client = CachedClient::in_memory(Arc::new(NoTransport), 1_000).await.unwrap();
        let (tx, rx) = watch::channel(false);
        let mut exec = IndexingExecutor::new(
            EngineConfig::default(),
            store,
            HandlerRegistry::new(),
            client,
            Arc::new(EngineMetrics::new()),
            &[],
            Checkpoint::MAX,
            rx,
        );

        /// A stream that never yields.
        struct PendingStream;
        #[async_trait]
        impl MergedStream for PendingStream {
            async fn next(&mut self) -> Result<Option<MergedEvent>, EngineError> {
                futures::future::pending().await
            }
        }

        let handle = tokio::spawn(async move {
            let mut stream = PendingStream;
            exec.run(&mut stream).await
        });
        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(result.unwrap().unwrap().is_ok());
    }
}
