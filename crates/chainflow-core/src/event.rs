//! Raw block payloads and the typed event sum they decode into.
//!
//! Events are ephemeral: produced by the builder, ordered by the merger,
//! consumed by the executor, never persisted themselves.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::checkpoint::Checkpoint;

// ─── Raw payloads (as produced by the sync source) ───────────────────────────

/// A block header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBlock {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    /// Unix timestamp (seconds).
    pub timestamp: u64,
}

impl RawBlock {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &RawBlock) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }
}

/// A raw log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub log_index: u64,
    pub transaction_index: u64,
    pub transaction_hash: String,
}

impl RawLog {
    /// The event signature hash, if the log has any topics.
    pub fn topic0(&self) -> Option<&str> {
        self.topics.first().map(String::as_str)
    }
}

/// A raw transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTransaction {
    pub hash: String,
    pub transaction_index: u64,
    pub from: String,
    pub to: Option<String>,
    /// Decimal or 0x-prefixed hex value string.
    pub value: String,
    pub input: String,
}

/// A raw transaction receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTransactionReceipt {
    pub transaction_hash: String,
    pub transaction_index: u64,
    pub status: bool,
    pub gas_used: u64,
}

/// A raw call trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTrace {
    pub trace_index: u64,
    pub transaction_index: u64,
    pub transaction_hash: String,
    pub from: String,
    pub to: Option<String>,
    /// Decimal or 0x-prefixed hex value string.
    pub value: String,
    pub input: String,
}

/// Everything the sync source yields for one block on one chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawBlockBundle {
    pub chain_id: u64,
    pub block: RawBlock,
    #[serde(default)]
    pub logs: Vec<RawLog>,
    #[serde(default)]
    pub transactions: Vec<RawTransaction>,
    #[serde(default)]
    pub transaction_receipts: Vec<RawTransactionReceipt>,
    #[serde(default)]
    pub traces: Vec<RawTrace>,
}

// ─── Typed events ────────────────────────────────────────────────────────────

/// Stable per-variant tag. Encoded into the checkpoint's `event_type`
/// field, so it breaks ordering ties between variants inside the same
/// transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventKind {
    Setup = 0,
    Block = 1,
    Transaction = 2,
    Transfer = 3,
    Log = 4,
    Trace = 5,
}

impl EventKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Variant payloads. Decoded fields ride along as JSON, the same shape the
/// user handler sees.
#[derive(Debug, Clone)]
pub enum EventData {
    /// Synthetic per-chain×handler event at the zero checkpoint.
    Setup,
    Log {
        log: RawLog,
        block: RawBlock,
        /// Decoded log fields (topics + data for ABI-less sources).
        fields: Value,
    },
    Block {
        block: RawBlock,
    },
    Transaction {
        transaction: RawTransaction,
        block: RawBlock,
    },
    Transfer {
        from: String,
        to: String,
        /// Transfer amount as a decimal string.
        value: String,
        trace_index: u64,
        block: RawBlock,
    },
    Trace {
        trace: RawTrace,
        block: RawBlock,
    },
}

impl EventData {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Setup => EventKind::Setup,
            Self::Block { .. } => EventKind::Block,
            Self::Transaction { .. } => EventKind::Transaction,
            Self::Transfer { .. } => EventKind::Transfer,
            Self::Log { .. } => EventKind::Log,
            Self::Trace { .. } => EventKind::Trace,
        }
    }
}

/// A fully materialized event, ready for ordering and dispatch.
#[derive(Debug, Clone)]
pub struct Event {
    pub chain_id: u64,
    /// User-facing handler key, e.g. `"ERC20:Transfer"`.
    pub name: String,
    pub checkpoint: Checkpoint,
    pub data: EventData,
}

// ─── Control events ──────────────────────────────────────────────────────────

/// A block dropped by a reorg, with the factory-discovered child addresses
/// first seen in it (to be forgotten).
#[derive(Debug, Clone)]
pub struct ReorgedBlock {
    pub block: RawBlock,
    pub removed_child_addresses: HashSet<String>,
}

/// Interleaved control signals carried through the ordered stream.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    /// The chain switched branches at `checkpoint` (the common ancestor's
    /// block-end checkpoint). Everything after it must be reverted.
    Reorg {
        chain_id: u64,
        checkpoint: Checkpoint,
        reorged_blocks: Vec<ReorgedBlock>,
    },
    /// Everything at or below `checkpoint` is immutable.
    Finalize { chain_id: u64, checkpoint: Checkpoint },
}

impl ControlEvent {
    pub fn checkpoint(&self) -> Checkpoint {
        match self {
            Self::Reorg { checkpoint, .. } | Self::Finalize { checkpoint, .. } => *checkpoint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(number: u64, hash: &str, parent: &str) -> RawBlock {
        RawBlock {
            number,
            hash: hash.into(),
            parent_hash: parent.into(),
            timestamp: number * 12,
        }
    }

    #[test]
    fn block_extends_parent() {
        let a = block(100, "0xaa", "0x00");
        let b = block(101, "0xbb", "0xaa");
        assert!(b.extends(&a));
        assert!(!a.extends(&b));
    }

    #[test]
    fn block_extends_false_on_gap() {
        let a = block(100, "0xaa", "0x00");
        let c = block(102, "0xcc", "0xaa");
        assert!(!c.extends(&a));
    }

    #[test]
    fn event_kind_tags_are_stable() {
        assert_eq!(EventKind::Setup.as_u8(), 0);
        assert_eq!(EventKind::Block.as_u8(), 1);
        assert_eq!(EventKind::Transaction.as_u8(), 2);
        assert_eq!(EventKind::Transfer.as_u8(), 3);
        assert_eq!(EventKind::Log.as_u8(), 4);
        assert_eq!(EventKind::Trace.as_u8(), 5);
    }
}
