//! Per-chain sync adapter — reconciles the incoming block stream against a
//! ring of unfinalized blocks, detecting reorgs and emitting finality.
//!
//! The ring holds at most `finality_depth` blocks. Each incoming block is
//! checked against the ring head: a number that does not advance, or a
//! parent hash that does not match, triggers the reorg walk. Blocks that
//! fall off the front of the ring are finalized.

use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use chainflow_core::checkpoint::Checkpoint;
use chainflow_core::config::default_finality_depth;
use chainflow_core::error::EngineError;
use chainflow_core::event::{Event, RawBlock, RawBlockBundle, ReorgedBlock};
use chainflow_core::{EventBuilder, Source};

/// What the pluggable sync source yields per chain.
#[derive(Debug, Clone)]
pub enum SourceUpdate {
    Block(RawBlockBundle),
    /// Explicit reorg signal: the canonical branch now ends at this block.
    Reorg(RawBlock),
    /// Explicit finality signal: this block and everything below is final.
    Finalize(RawBlock),
}

/// The pluggable per-chain block feed (consumed interface).
#[async_trait]
pub trait SyncSource: Send + Sync {
    /// Subscribe to a chain's update stream.
    async fn subscribe(
        &self,
        chain_id: u64,
    ) -> Result<BoxStream<'static, SourceUpdate>, EngineError>;

    /// Finality depth for a chain; defaults to the standard table.
    fn finality_depth(&self, chain_id: u64) -> u64 {
        default_finality_depth(chain_id)
    }

    /// The finalized head known at startup, if any. The executor runs
    /// historical mode up to the lowest finalized head across chains.
    async fn finalized_head(&self, _chain_id: u64) -> Result<Option<RawBlock>, EngineError> {
        Ok(None)
    }
}

/// What the adapter emits into its bounded channel toward the merger.
#[derive(Debug)]
pub enum ChainUpdate {
    /// One reconciled block: its events plus the block-end checkpoint the
    /// chain has now progressed past (even if no events matched).
    Advance { checkpoint: Checkpoint, events: Vec<Event> },
    /// The chain switched branches; everything after `checkpoint` (the
    /// common ancestor's block end) is invalid.
    Reorg { checkpoint: Checkpoint, reorged_blocks: Vec<ReorgedBlock> },
    /// Everything at or below `checkpoint` is immutable.
    Finalize { checkpoint: Checkpoint },
    /// The adapter hit an unrecoverable condition and is shutting down.
    Fatal(EngineError),
}

/// A ring entry: the block plus the factory children first seen in it.
#[derive(Debug, Clone)]
struct TrackedBlock {
    block: RawBlock,
    discovered_children: HashSet<String>,
}

/// Reconciles one chain's block stream.
pub struct ChainSyncAdapter {
    chain_id: u64,
    finality_depth: u64,
    ring: VecDeque<TrackedBlock>,
    builder: EventBuilder,
    tx: mpsc::Sender<ChainUpdate>,
}

impl ChainSyncAdapter {
    pub fn new(
        chain_id: u64,
        finality_depth: u64,
        sources: Vec<Source>,
        tx: mpsc::Sender<ChainUpdate>,
    ) -> Self {
        Self {
            chain_id,
            finality_depth,
            ring: VecDeque::with_capacity(finality_depth as usize + 1),
            builder: EventBuilder::new(sources),
            tx,
        }
    }

    /// Drive the adapter until the stream ends or the merger closes.
    ///
    /// Unrecoverable errors are pushed through the channel as
    /// [`ChainUpdate::Fatal`] so the executor can map them to an exit code.
    pub async fn run(mut self, mut stream: BoxStream<'static, SourceUpdate>) {
        while let Some(update) = stream.next().await {
            let result = match update {
                SourceUpdate::Block(bundle) => self.on_block(bundle).await,
                SourceUpdate::Reorg(block) => self.on_explicit_reorg(&block).await,
                SourceUpdate::Finalize(block) => self.on_explicit_finalize(&block).await,
            };
            match result {
                Ok(true) => {}
                // Merger closed its receiver — clean cancellation.
                Ok(false) => {
                    debug!(chain_id = self.chain_id, "adapter channel closed, stopping");
                    return;
                }
                Err(error) => {
                    warn!(chain_id = self.chain_id, %error, "adapter failed");
                    let _ = self.tx.send(ChainUpdate::Fatal(error)).await;
                    return;
                }
            }
        }
        info!(chain_id = self.chain_id, "source stream ended");
    }

    /// Reconcile one incoming block. Returns `Ok(false)` once the
    /// downstream channel is closed.
    pub async fn on_block(&mut self, bundle: RawBlockBundle) -> Result<bool, EngineError> {
        let needs_reorg = self.ring.back().is_some_and(|latest| {
            bundle.block.number <= latest.block.number
                || bundle.block.parent_hash != latest.block.hash
        });
        if needs_reorg {
            let parent_hash = bundle.block.parent_hash.clone();
            if !self.reorg_until(|b| b.hash == parent_hash, &bundle.block).await? {
                return Ok(false);
            }
        }

        let built = self.builder.build(&bundle);
        let discovered = built
            .discovered_children
            .into_values()
            .flatten()
            .collect::<HashSet<_>>();
        self.ring.push_back(TrackedBlock { block: bundle.block.clone(), discovered_children: discovered });

        let checkpoint = block_end(self.chain_id, &bundle.block);
        if self
            .tx
            .send(ChainUpdate::Advance { checkpoint, events: built.events })
            .await
            .is_err()
        {
            return Ok(false);
        }

        while self.ring.len() > self.finality_depth as usize {
            let front = self.ring.pop_front().expect("ring not empty");
            let checkpoint = block_end(self.chain_id, &front.block);
            if self.tx.send(ChainUpdate::Finalize { checkpoint }).await.is_err() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Handle an explicit reorg signal: truncate the ring to the block the
    /// source named as the new branch tip.
    pub async fn on_explicit_reorg(&mut self, tip: &RawBlock) -> Result<bool, EngineError> {
        self.reorg_until(|b| b.hash == tip.hash, tip).await
    }

    /// Handle an explicit finality signal: drain ring entries at or below
    /// the named block and emit a single finalize at the newest drained one.
    pub async fn on_explicit_finalize(&mut self, block: &RawBlock) -> Result<bool, EngineError> {
        let mut newest: Option<RawBlock> = None;
        while self.ring.front().is_some_and(|f| f.block.number <= block.number) {
            newest = self.ring.pop_front().map(|t| t.block);
        }
        if let Some(finalized) = newest {
            let checkpoint = block_end(self.chain_id, &finalized);
            if self.tx.send(ChainUpdate::Finalize { checkpoint }).await.is_err() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Walk the ring backwards collecting reorged blocks until `is_ancestor`
    /// matches, then emit the control event and truncate. Ring exhaustion is
    /// a deep reorg.
    async fn reorg_until(
        &mut self,
        is_ancestor: impl Fn(&RawBlock) -> bool,
        incoming: &RawBlock,
    ) -> Result<bool, EngineError> {
        let mut reorged_blocks: Vec<ReorgedBlock> = Vec::new();
        let ancestor = loop {
            match self.ring.back() {
                Some(back) if is_ancestor(&back.block) => break back.block.clone(),
                Some(_) => {
                    let dropped = self.ring.pop_back().expect("ring not empty");
                    reorged_blocks.push(ReorgedBlock {
                        block: dropped.block,
                        removed_child_addresses: dropped.discovered_children,
                    });
                }
                None => {
                    return Err(EngineError::DeepReorg {
                        chain_id: self.chain_id,
                        block_number: incoming.number,
                    })
                }
            }
        };

        warn!(
            chain_id = self.chain_id,
            depth = reorged_blocks.len(),
            ancestor = ancestor.number,
            "reorg detected"
        );

        for reorged in &reorged_blocks {
            self.builder.forget_children(&reorged.removed_child_addresses);
        }

        let checkpoint = block_end(self.chain_id, &ancestor);
        Ok(self
            .tx
            .send(ChainUpdate::Reorg { checkpoint, reorged_blocks })
            .await
            .is_ok())
    }

    /// Number of blocks currently tracked as unfinalized.
    pub fn ring_len(&self) -> usize {
        self.ring.len()
    }
}

/// The block-end checkpoint used for control events and frontiers.
fn block_end(chain_id: u64, block: &RawBlock) -> Checkpoint {
    Checkpoint::block_end(block.timestamp, chain_id, block.number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainflow_core::source::ContractSource;

    fn block(number: u64, hash: &str, parent: &str) -> RawBlock {
        RawBlock {
            number,
            hash: hash.into(),
            parent_hash: parent.into(),
            timestamp: number * 12,
        }
    }

    fn bundle(chain_id: u64, b: RawBlock) -> RawBlockBundle {
        RawBlockBundle {
            chain_id,
            block: b,
            logs: vec![],
            transactions: vec![],
            transaction_receipts: vec![],
            traces: vec![],
        }
    }

    fn adapter(depth: u64) -> (ChainSyncAdapter, mpsc::Receiver<ChainUpdate>) {
        let (tx, rx) = mpsc::channel(64);
        let sources = vec![Source::Contract(ContractSource {
            name: "T".into(),
            chain_id: 1,
            addresses: vec!["0xtoken".into()],
            topics0: vec![],
            factory: None,
            include_call_traces: false,
        })];
        (ChainSyncAdapter::new(1, depth, sources, tx), rx)
    }

    #[tokio::test]
    async fn normal_chain_advances() {
        let (mut a, mut rx) = adapter(10);
        a.on_block(bundle(1, block(100, "0xa", "0x0"))).await.unwrap();
        a.on_block(bundle(1, block(101, "0xb", "0xa"))).await.unwrap();
        assert_eq!(a.ring_len(), 2);
        assert!(matches!(rx.try_recv().unwrap(), ChainUpdate::Advance { .. }));
        assert!(matches!(rx.try_recv().unwrap(), ChainUpdate::Advance { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ring_overflow_finalizes_front() {
        let (mut a, mut rx) = adapter(2);
        a.on_block(bundle(1, block(100, "0xa", "0x0"))).await.unwrap();
        a.on_block(bundle(1, block(101, "0xb", "0xa"))).await.unwrap();
        a.on_block(bundle(1, block(102, "0xc", "0xb"))).await.unwrap();
        assert_eq!(a.ring_len(), 2);

        let mut finalized = vec![];
        while let Ok(update) = rx.try_recv() {
            if let ChainUpdate::Finalize { checkpoint } = update {
                finalized.push(checkpoint.block_number);
            }
        }
        assert_eq!(finalized, vec![100]);
    }

    #[tokio::test]
    async fn shallow_reorg_walks_to_ancestor() {
        let (mut a, mut rx) = adapter(10);
        a.on_block(bundle(1, block(100, "0xaa", "0x00"))).await.unwrap();
        a.on_block(bundle(1, block(101, "0xbb", "0xaa"))).await.unwrap();
        a.on_block(bundle(1, block(102, "0xcc", "0xbb"))).await.unwrap();
        a.on_block(bundle(1, block(103, "0xdd", "0xcc"))).await.unwrap();

        // New branch X at 102 with parent B(101).
        a.on_block(bundle(1, block(102, "0xee", "0xbb"))).await.unwrap();

        let mut saw_reorg = None;
        while let Ok(update) = rx.try_recv() {
            if let ChainUpdate::Reorg { checkpoint, reorged_blocks } = update {
                saw_reorg = Some((checkpoint, reorged_blocks));
            }
        }
        let (checkpoint, reorged) = saw_reorg.expect("reorg emitted");
        assert_eq!(checkpoint.block_number, 101);
        // Most recent first: D(103), C(102).
        let numbers: Vec<_> = reorged.iter().map(|r| r.block.number).collect();
        assert_eq!(numbers, vec![103, 102]);
        // The new branch block was appended after the truncate.
        assert_eq!(a.ring_len(), 3);
    }

    #[tokio::test]
    async fn deep_reorg_is_unrecoverable() {
        let (mut a, _rx) = adapter(3);
        a.on_block(bundle(1, block(100, "0xaa", "0x00"))).await.unwrap();
        a.on_block(bundle(1, block(101, "0xbb", "0xaa"))).await.unwrap();

        // Parent hash matches nothing in the ring.
        let err = a
            .on_block(bundle(1, block(101, "0xff", "0xbelow-ring")))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DeepReorg { chain_id: 1, .. }));
        assert_eq!(err.exit_code(), 75);
    }

    #[tokio::test]
    async fn explicit_finalize_drains_ring() {
        let (mut a, mut rx) = adapter(10);
        for i in 100..=104u64 {
            let parent = format!("0x{:x}", i - 1);
            a.on_block(bundle(1, block(i, &format!("0x{i:x}"), &parent))).await.unwrap();
        }
        a.on_explicit_finalize(&block(102, "0x66", "0x65")).await.unwrap();
        assert_eq!(a.ring_len(), 2);

        let mut finalized = vec![];
        while let Ok(update) = rx.try_recv() {
            if let ChainUpdate::Finalize { checkpoint } = update {
                finalized.push(checkpoint.block_number);
            }
        }
        assert_eq!(finalized, vec![102]);
    }

    #[tokio::test]
    async fn explicit_reorg_truncates_to_named_tip() {
        let (mut a, mut rx) = adapter(10);
        a.on_block(bundle(1, block(100, "0xaa", "0x00"))).await.unwrap();
        a.on_block(bundle(1, block(101, "0xbb", "0xaa"))).await.unwrap();
        a.on_block(bundle(1, block(102, "0xcc", "0xbb"))).await.unwrap();

        a.on_explicit_reorg(&block(101, "0xbb", "0xaa")).await.unwrap();
        assert_eq!(a.ring_len(), 2);

        let mut reorg_at = None;
        while let Ok(update) = rx.try_recv() {
            if let ChainUpdate::Reorg { checkpoint, .. } = update {
                reorg_at = Some(checkpoint.block_number);
            }
        }
        assert_eq!(reorg_at, Some(101));
    }
}
