//! Ordering merger — merges per-chain event streams into one sequence.
//!
//! Two policies, fixed at construction:
//!
//! - **Multichain**: each chain keeps an independent queue; events from one
//!   chain never reorder relative to that chain but are free across chains.
//! - **Omnichain**: a k-way merge by checkpoint with the minimum-frontier
//!   rule — an event is only emitted once every chain has progressed past
//!   its checkpoint, so the global order is total.
//!
//! The merger also carries `Reorg`/`Finalize` control events downstream.
//! Under omnichain a reorg at checkpoint `c` invalidates the originating
//! chain's pending events above `c` and schedules the *other* chains'
//! already-emitted events above `c` for replay (the executor reverts them
//! from the store; they must run again once the new branch arrives).

use std::collections::VecDeque;

use futures::future::select_all;
use tokio::sync::mpsc;
use tracing::debug;

use chainflow_core::checkpoint::Checkpoint;
use chainflow_core::config::OrderingPolicy;
use chainflow_core::error::EngineError;
use chainflow_core::event::{ControlEvent, Event};

use crate::adapter::ChainUpdate;

/// An item of the merged, globally ordered sequence.
#[derive(Debug)]
pub enum MergedEvent {
    Event(Event),
    Control(ControlEvent),
}

#[derive(Debug)]
enum LaneItem {
    Event(Event),
    Control(ControlEvent),
}

impl LaneItem {
    fn checkpoint(&self) -> Checkpoint {
        match self {
            Self::Event(e) => e.checkpoint,
            Self::Control(c) => c.checkpoint(),
        }
    }
}

struct Lane {
    chain_id: u64,
    rx: Option<mpsc::Receiver<ChainUpdate>>,
    /// Items awaiting emission, ascending by checkpoint.
    pending: VecDeque<LaneItem>,
    /// Events already emitted but not yet finalized (omnichain replay
    /// bookkeeping).
    executed: VecDeque<Event>,
    /// Highest checkpoint this chain has declared itself past.
    frontier: Checkpoint,
    /// Latest finalize checkpoint seen from this chain.
    finalized: Option<Checkpoint>,
}

impl Lane {
    /// A lane that can never produce anything again.
    fn exhausted(&self) -> bool {
        self.rx.is_none() && self.pending.is_empty()
    }
}

/// Merges N per-chain update channels into one ordered sequence.
pub struct OrderingMerger {
    policy: OrderingPolicy,
    lanes: Vec<Lane>,
    /// Highest finalize emitted downstream (the minimum across chains).
    emitted_finalize: Option<Checkpoint>,
}

impl OrderingMerger {
    pub fn new(policy: OrderingPolicy, channels: Vec<(u64, mpsc::Receiver<ChainUpdate>)>) -> Self {
        let lanes = channels
            .into_iter()
            .map(|(chain_id, rx)| Lane {
                chain_id,
                rx: Some(rx),
                pending: VecDeque::new(),
                executed: VecDeque::new(),
                frontier: Checkpoint::ZERO,
                finalized: None,
            })
            .collect();
        Self { policy, lanes, emitted_finalize: None }
    }

    /// Close all upstream channels and drop pending items without emitting
    /// them.
    pub fn close(&mut self) {
        for lane in &mut self.lanes {
            lane.rx = None;
            lane.pending.clear();
            lane.executed.clear();
        }
    }

    /// Next item of the merged sequence; `None` once every lane is done.
    pub async fn next(&mut self) -> Result<Option<MergedEvent>, EngineError> {
        loop {
            if let Some(index) = self.emittable_lane() {
                return Ok(Some(self.pop_emit(index)));
            }
            if !self.receive_more().await? {
                // Nothing emittable and nothing left to receive.
                return Ok(None);
            }
        }
    }

    /// Pick the lane whose front item may be emitted now, if any.
    fn emittable_lane(&self) -> Option<usize> {
        let (index, front) = self
            .lanes
            .iter()
            .enumerate()
            .filter_map(|(i, lane)| lane.pending.front().map(|item| (i, item)))
            .min_by_key(|(_, item)| item.checkpoint())?;

        match self.policy {
            OrderingPolicy::Multichain => Some(index),
            OrderingPolicy::Omnichain => {
                // Controls pass once they are the global minimum; events
                // additionally wait for every live lane's frontier.
                if matches!(front, LaneItem::Control(_)) {
                    return Some(index);
                }
                let checkpoint = front.checkpoint();
                let all_past = self.lanes.iter().enumerate().all(|(j, lane)| {
                    j == index || lane.rx.is_none() || lane.frontier >= checkpoint
                });
                all_past.then_some(index)
            }
        }
    }

    fn pop_emit(&mut self, index: usize) -> MergedEvent {
        let item = self.lanes[index].pending.pop_front().expect("lane emittable");
        match item {
            LaneItem::Event(event) => {
                if self.policy == OrderingPolicy::Omnichain {
                    self.lanes[index].executed.push_back(event.clone());
                }
                MergedEvent::Event(event)
            }
            LaneItem::Control(control) => {
                if let ControlEvent::Finalize { checkpoint, .. } = &control {
                    let checkpoint = *checkpoint;
                    for lane in &mut self.lanes {
                        while lane.executed.front().is_some_and(|e| e.checkpoint <= checkpoint) {
                            lane.executed.pop_front();
                        }
                    }
                }
                MergedEvent::Control(control)
            }
        }
    }

    /// Await one update from the lane most likely to unblock emission.
    /// Returns `false` when every lane is exhausted.
    async fn receive_more(&mut self) -> Result<bool, EngineError> {
        let target = match self.policy {
            // The lane gating the global minimum is the one with the
            // smallest frontier.
            OrderingPolicy::Omnichain => self
                .lanes
                .iter()
                .enumerate()
                .filter(|(_, l)| l.rx.is_some())
                .min_by_key(|(_, l)| l.frontier)
                .map(|(i, _)| i),
            OrderingPolicy::Multichain => None,
        };

        match target {
            Some(index) => {
                let update = self.lanes[index]
                    .rx
                    .as_mut()
                    .expect("target lane open")
                    .recv()
                    .await;
                match update {
                    Some(update) => self.apply_update(index, update)?,
                    None => self.lanes[index].rx = None,
                }
                Ok(!self.lanes.iter().all(Lane::exhausted))
            }
            None => {
                // Multichain: race all open lanes.
                let mut futures = Vec::new();
                for (i, lane) in self.lanes.iter_mut().enumerate() {
                    if let Some(rx) = lane.rx.as_mut() {
                        futures.push(Box::pin(async move { (i, rx.recv().await) }));
                    }
                }
                if futures.is_empty() {
                    return Ok(false);
                }
                let ((index, update), _, _) = select_all(futures).await;
                match update {
                    Some(update) => self.apply_update(index, update)?,
                    None => self.lanes[index].rx = None,
                }
                Ok(!self.lanes.iter().all(Lane::exhausted))
            }
        }
    }

    fn apply_update(&mut self, index: usize, update: ChainUpdate) -> Result<(), EngineError> {
        match update {
            ChainUpdate::Advance { checkpoint, events } => {
                let lane = &mut self.lanes[index];
                for event in events {
                    lane.pending.push_back(LaneItem::Event(event));
                }
                if checkpoint > lane.frontier {
                    lane.frontier = checkpoint;
                }
            }
            ChainUpdate::Reorg { checkpoint, reorged_blocks } => {
                self.apply_reorg(index, checkpoint, reorged_blocks);
            }
            ChainUpdate::Finalize { checkpoint } => {
                self.apply_finalize(index, checkpoint);
            }
            ChainUpdate::Fatal(error) => return Err(error),
        }
        Ok(())
    }

    fn apply_reorg(
        &mut self,
        index: usize,
        checkpoint: Checkpoint,
        reorged_blocks: Vec<chainflow_core::event::ReorgedBlock>,
    ) {
        debug!(
            chain_id = self.lanes[index].chain_id,
            depth = reorged_blocks.len(),
            "merger splicing reorg"
        );
        for (j, lane) in self.lanes.iter_mut().enumerate() {
            if j == index {
                // Invalidated: pending and executed items above the
                // ancestor. New canonical blocks will regenerate them.
                lane.pending.retain(|item| item.checkpoint() <= checkpoint);
                while lane.executed.back().is_some_and(|e| e.checkpoint > checkpoint) {
                    lane.executed.pop_back();
                }
                lane.frontier = checkpoint;
            } else if self.policy == OrderingPolicy::Omnichain {
                // Still canonical on their chains, but the revert wipes
                // them from the store: replay them after the reorg point.
                while lane.executed.back().is_some_and(|e| e.checkpoint > checkpoint) {
                    let event = lane.executed.pop_back().expect("checked non-empty");
                    lane.pending.push_front(LaneItem::Event(event));
                }
            }
        }
        let chain_id = self.lanes[index].chain_id;
        self.lanes[index].pending.push_back(LaneItem::Control(ControlEvent::Reorg {
            chain_id,
            checkpoint,
            reorged_blocks,
        }));
    }

    fn apply_finalize(&mut self, index: usize, checkpoint: Checkpoint) {
        {
            let lane = &mut self.lanes[index];
            if lane.finalized.is_none_or(|f| checkpoint > f) {
                lane.finalized = Some(checkpoint);
            }
            if checkpoint > lane.frontier {
                lane.frontier = checkpoint;
            }
        }

        // A finalize is only safe downstream once *every* chain has
        // finalized at least that far: a prune at `c` must never race a
        // later reorg below `c` on a lagging chain.
        let Some(minimum) = self
            .lanes
            .iter()
            .map(|l| l.finalized)
            .collect::<Option<Vec<_>>>()
            .map(|f| f.into_iter().min().expect("at least one lane"))
        else {
            return;
        };

        if self.emitted_finalize.is_none_or(|e| minimum > e) {
            self.emitted_finalize = Some(minimum);
            let chain_id = self.lanes[index].chain_id;
            self.lanes[index]
                .pending
                .push_back(LaneItem::Control(ControlEvent::Finalize { chain_id, checkpoint: minimum }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainflow_core::event::EventData;

    fn event(chain_id: u64, ts: u64, block: u64) -> Event {
        Event {
            chain_id,
            name: "T".into(),
            checkpoint: Checkpoint {
                block_timestamp: ts,
                chain_id,
                block_number: block,
                transaction_index: 0,
                event_type: 4,
                event_index: 0,
            },
            data: EventData::Block {
                block: chainflow_core::event::RawBlock {
                    number: block,
                    hash: format!("0x{block:x}"),
                    parent_hash: format!("0x{:x}", block.saturating_sub(1)),
                    timestamp: ts,
                },
            },
        }
    }

    fn advance(chain_id: u64, ts: u64, block: u64) -> ChainUpdate {
        ChainUpdate::Advance {
            checkpoint: Checkpoint::block_end(ts, chain_id, block),
            events: vec![event(chain_id, ts, block)],
        }
    }

    fn idle(chain_id: u64, ts: u64, block: u64) -> ChainUpdate {
        ChainUpdate::Advance {
            checkpoint: Checkpoint::block_end(ts, chain_id, block),
            events: vec![],
        }
    }

    async fn collect_events(merger: &mut OrderingMerger, n: usize) -> Vec<(u64, u64)> {
        let mut seen = Vec::new();
        while seen.len() < n {
            match merger.next().await.unwrap() {
                Some(MergedEvent::Event(e)) => {
                    seen.push((e.chain_id, e.checkpoint.block_timestamp))
                }
                Some(MergedEvent::Control(_)) => {}
                None => break,
            }
        }
        seen
    }

    #[tokio::test]
    async fn omnichain_orders_across_chains() {
        // chain1@ts=10,bn=1; chain2@ts=9,bn=1; chain1@ts=11,bn=2
        // must deliver chain2(9), chain1(10), chain1(11).
        let (tx1, rx1) = mpsc::channel(8);
        let (tx2, rx2) = mpsc::channel(8);
        let mut merger =
            OrderingMerger::new(OrderingPolicy::Omnichain, vec![(1, rx1), (2, rx2)]);

        tx1.send(advance(1, 10, 1)).await.unwrap();
        tx1.send(advance(1, 11, 2)).await.unwrap();
        tx2.send(advance(2, 9, 1)).await.unwrap();
        // Let chain2 declare itself past everything so chain1's later
        // events can flow.
        tx2.send(idle(2, 30, 2)).await.unwrap();
        drop(tx1);
        drop(tx2);

        let seen = collect_events(&mut merger, 3).await;
        assert_eq!(seen, vec![(2, 9), (1, 10), (1, 11)]);
    }

    #[tokio::test]
    async fn omnichain_waits_for_lagging_chain() {
        let (tx1, rx1) = mpsc::channel(8);
        let (tx2, rx2) = mpsc::channel(8);
        let mut merger =
            OrderingMerger::new(OrderingPolicy::Omnichain, vec![(1, rx1), (2, rx2)]);

        tx1.send(advance(1, 10, 1)).await.unwrap();

        // chain2 has produced nothing: emitting chain1(10) would be
        // premature. Deliver chain2's earlier event and check it comes out
        // first.
        tx2.send(advance(2, 5, 1)).await.unwrap();
        tx2.send(idle(2, 50, 2)).await.unwrap();
        drop(tx1);
        drop(tx2);

        let seen = collect_events(&mut merger, 2).await;
        assert_eq!(seen, vec![(2, 5), (1, 10)]);
    }

    #[tokio::test]
    async fn multichain_preserves_per_chain_order_only() {
        let (tx1, rx1) = mpsc::channel(8);
        let (tx2, rx2) = mpsc::channel(8);
        let mut merger =
            OrderingMerger::new(OrderingPolicy::Multichain, vec![(1, rx1), (2, rx2)]);

        tx1.send(advance(1, 10, 1)).await.unwrap();
        tx1.send(advance(1, 11, 2)).await.unwrap();
        tx2.send(advance(2, 9, 1)).await.unwrap();
        drop(tx1);
        drop(tx2);

        let seen = collect_events(&mut merger, 3).await;
        // Per-chain order must hold; cross-chain interleaving is free.
        let chain1: Vec<_> = seen.iter().filter(|(c, _)| *c == 1).map(|(_, t)| *t).collect();
        assert_eq!(chain1, vec![10, 11]);
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn reorg_splices_pending_above_ancestor() {
        // Drive apply_update directly: queue three blocks' events, then a
        // reorg back to block 1. The events of blocks 2 and 3 must be
        // spliced out of pending; block 1's event survives, followed by
        // the control.
        let (_tx1, rx1) = mpsc::channel(8);
        let mut merger = OrderingMerger::new(OrderingPolicy::Omnichain, vec![(1, rx1)]);

        merger.apply_update(0, advance(1, 10, 1)).unwrap();
        merger.apply_update(0, advance(1, 20, 2)).unwrap();
        merger.apply_update(0, advance(1, 30, 3)).unwrap();
        merger
            .apply_update(
                0,
                ChainUpdate::Reorg {
                    checkpoint: Checkpoint::block_end(10, 1, 1),
                    reorged_blocks: vec![],
                },
            )
            .unwrap();

        let lane = &merger.lanes[0];
        assert_eq!(lane.pending.len(), 2);
        assert!(
            matches!(&lane.pending[0], LaneItem::Event(e) if e.checkpoint.block_number == 1)
        );
        assert!(matches!(&lane.pending[1], LaneItem::Control(ControlEvent::Reorg { .. })));
        assert_eq!(lane.frontier, Checkpoint::block_end(10, 1, 1));
    }

    #[tokio::test]
    async fn omnichain_reorg_schedules_other_chain_replay() {
        let (tx1, rx1) = mpsc::channel(8);
        let (tx2, rx2) = mpsc::channel(8);
        let mut merger =
            OrderingMerger::new(OrderingPolicy::Omnichain, vec![(1, rx1), (2, rx2)]);

        // chain2 event at ts=15 executes once chain1 passes it.
        tx2.send(advance(2, 15, 1)).await.unwrap();
        tx1.send(advance(1, 10, 1)).await.unwrap();
        tx1.send(idle(1, 20, 2)).await.unwrap();

        let first = collect_events(&mut merger, 2).await;
        assert_eq!(first, vec![(1, 10), (2, 15)]);

        // chain1 reorgs back to its block 1 (ts=10 block end). chain2's
        // executed event at ts=15 was reverted from the store: it must be
        // replayed after the reorg control.
        tx1.send(ChainUpdate::Reorg {
            checkpoint: Checkpoint::block_end(10, 1, 1),
            reorged_blocks: vec![],
        })
        .await
        .unwrap();
        tx1.send(idle(1, 25, 2)).await.unwrap();
        drop(tx1);
        drop(tx2);

        let mut order = vec![];
        while let Some(item) = merger.next().await.unwrap() {
            match item {
                MergedEvent::Event(e) => order.push(format!("event:{}", e.checkpoint.block_timestamp)),
                MergedEvent::Control(ControlEvent::Reorg { .. }) => order.push("reorg".into()),
                MergedEvent::Control(_) => {}
            }
        }
        assert_eq!(order, vec!["reorg".to_string(), "event:15".to_string()]);
    }

    #[tokio::test]
    async fn finalize_waits_for_minimum_across_chains() {
        let (tx1, rx1) = mpsc::channel(8);
        let (tx2, rx2) = mpsc::channel(8);
        let mut merger =
            OrderingMerger::new(OrderingPolicy::Omnichain, vec![(1, rx1), (2, rx2)]);

        tx1.send(ChainUpdate::Finalize { checkpoint: Checkpoint::block_end(100, 1, 10) })
            .await
            .unwrap();
        // Not emitted yet: chain 2 has no finalize.
        tx2.send(ChainUpdate::Finalize { checkpoint: Checkpoint::block_end(50, 2, 5) })
            .await
            .unwrap();
        drop(tx1);
        drop(tx2);

        let mut finalizes = vec![];
        while let Some(item) = merger.next().await.unwrap() {
            if let MergedEvent::Control(ControlEvent::Finalize { checkpoint, .. }) = item {
                finalizes.push(checkpoint.block_timestamp);
            }
        }
        // The minimum of (100, 50) is chain2's 50.
        assert_eq!(finalizes, vec![50]);
    }

    #[tokio::test]
    async fn fatal_update_propagates() {
        let (tx1, rx1) = mpsc::channel(8);
        let mut merger = OrderingMerger::new(OrderingPolicy::Omnichain, vec![(1, rx1)]);
        tx1.send(ChainUpdate::Fatal(EngineError::DeepReorg { chain_id: 1, block_number: 7 }))
            .await
            .unwrap();
        drop(tx1);
        let err = merger.next().await.unwrap_err();
        assert!(matches!(err, EngineError::DeepReorg { .. }));
    }

    #[tokio::test]
    async fn close_drains_without_emitting() {
        let (tx1, rx1) = mpsc::channel(8);
        let mut merger = OrderingMerger::new(OrderingPolicy::Omnichain, vec![(1, rx1)]);
        tx1.send(advance(1, 10, 1)).await.unwrap();
        merger.close();
        assert!(merger.next().await.unwrap().is_none());
        // Upstream sender sees the closed channel.
        assert!(tx1.send(idle(1, 11, 2)).await.is_err());
    }
}
