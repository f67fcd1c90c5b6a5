//! Checkpoint codec — the globally ordered position token.
//!
//! A checkpoint is a fixed-width decimal string of [`CHECKPOINT_LENGTH`]
//! characters: six zero-padded fields concatenated so that lexicographic
//! comparison of the encoded strings equals tuple comparison of the
//! underlying integers. Every layer (merger, shadow tables, SQL predicates)
//! can therefore sort and compare checkpoints as plain strings.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Total encoded length: 14 + 16 + 16 + 16 + 1 + 16.
pub const CHECKPOINT_LENGTH: usize = 79;

const TIMESTAMP_DIGITS: usize = 14;
const CHAIN_ID_DIGITS: usize = 16;
const BLOCK_NUMBER_DIGITS: usize = 16;
const TRANSACTION_INDEX_DIGITS: usize = 16;
const EVENT_TYPE_DIGITS: usize = 1;
const EVENT_INDEX_DIGITS: usize = 16;

/// Largest value representable in a 16-digit decimal field.
const MAX_16: u64 = 9_999_999_999_999_999;
/// Largest value representable in the 14-digit timestamp field.
const MAX_14: u64 = 99_999_999_999_999;

/// A decoded checkpoint.
///
/// Field order matters: the derived `Ord` compares fields in declaration
/// order, which is exactly the order they are concatenated in the encoded
/// string, so `a < b` iff `a.encode() < b.encode()`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Checkpoint {
    /// Block timestamp (seconds since epoch).
    pub block_timestamp: u64,
    /// Numeric chain id.
    pub chain_id: u64,
    /// Block number.
    pub block_number: u64,
    /// Index of the containing transaction (0 for block events).
    pub transaction_index: u64,
    /// Stable per-variant tag; breaks ties between variants in the same
    /// transaction.
    pub event_type: u8,
    /// Log/trace index of the raw item (0 for block/transaction events).
    pub event_index: u64,
}

impl Checkpoint {
    /// The all-zeros sentinel used for setup events.
    pub const ZERO: Checkpoint = Checkpoint {
        block_timestamp: 0,
        chain_id: 0,
        block_number: 0,
        transaction_index: 0,
        event_type: 0,
        event_index: 0,
    };

    /// The all-nines sentinel; compares greater than any real checkpoint.
    /// Shadow-table triggers capture rows at this value until the batch-end
    /// stamp rewrites them.
    pub const MAX: Checkpoint = Checkpoint {
        block_timestamp: MAX_14,
        chain_id: MAX_16,
        block_number: MAX_16,
        transaction_index: MAX_16,
        event_type: 9,
        event_index: MAX_16,
    };

    /// Checkpoint of a block boundary: compares greater than every event
    /// inside the block and smaller than every event of any later block on
    /// the same chain. Used for `Reorg`/`Finalize` control events.
    pub fn block_end(block_timestamp: u64, chain_id: u64, block_number: u64) -> Self {
        Self {
            block_timestamp,
            chain_id,
            block_number,
            transaction_index: MAX_16,
            event_type: 9,
            event_index: MAX_16,
        }
    }

    /// Encode to the fixed-width decimal string.
    pub fn encode(&self) -> String {
        format!(
            "{:0t$}{:0c$}{:0b$}{:0x$}{:0e$}{:0i$}",
            self.block_timestamp.min(MAX_14),
            self.chain_id.min(MAX_16),
            self.block_number.min(MAX_16),
            self.transaction_index.min(MAX_16),
            self.event_type.min(9),
            self.event_index.min(MAX_16),
            t = TIMESTAMP_DIGITS,
            c = CHAIN_ID_DIGITS,
            b = BLOCK_NUMBER_DIGITS,
            x = TRANSACTION_INDEX_DIGITS,
            e = EVENT_TYPE_DIGITS,
            i = EVENT_INDEX_DIGITS,
        )
    }

    /// Decode an encoded checkpoint string.
    ///
    /// Fails with [`EngineError::InvalidCheckpoint`] if the input is not
    /// exactly [`CHECKPOINT_LENGTH`] ASCII digits.
    pub fn decode(s: &str) -> Result<Self, EngineError> {
        if s.len() != CHECKPOINT_LENGTH {
            return Err(EngineError::InvalidCheckpoint(format!(
                "expected {CHECKPOINT_LENGTH} characters, got {}",
                s.len()
            )));
        }
        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(EngineError::InvalidCheckpoint(
                "non-digit character in checkpoint".into(),
            ));
        }

        let mut at = 0usize;
        let mut field = |width: usize| -> u64 {
            let slice = &s[at..at + width];
            at += width;
            // Guaranteed all-digit; a 16-digit decimal always fits u64.
            slice.parse::<u64>().unwrap_or(0)
        };

        Ok(Self {
            block_timestamp: field(TIMESTAMP_DIGITS),
            chain_id: field(CHAIN_ID_DIGITS),
            block_number: field(BLOCK_NUMBER_DIGITS),
            transaction_index: field(TRANSACTION_INDEX_DIGITS),
            event_type: field(EVENT_TYPE_DIGITS) as u8,
            event_index: field(EVENT_INDEX_DIGITS),
        })
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Compare two encoded checkpoints. Plain string comparison suffices:
/// the fixed-width encoding makes it equal to tuple comparison.
pub fn compare(a: &str, b: &str) -> std::cmp::Ordering {
    a.cmp(b)
}

/// The encoded all-zeros sentinel.
pub fn zero_checkpoint() -> String {
    Checkpoint::ZERO.encode()
}

/// The encoded all-nines sentinel.
pub fn max_checkpoint() -> String {
    Checkpoint::MAX.encode()
}
