//! Error types for the indexing engine.
//!
//! Every error belongs to one of four severities:
//! - **Retryable** — transient RPC/DB failures; retried with bounded backoff
//! - **NonRetryableUser** — constraint violations and handler failures,
//!   enriched with the event that triggered them
//! - **NonRetryableEngine** — schema/build mismatches, corrupted state
//! - **Unrecoverable** — deep reorgs and crash-recovery mismatches; the
//!   engine refuses automatic restart

use thiserror::Error;

use crate::checkpoint::Checkpoint;

/// Errors that can occur anywhere in the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Transient RPC transport failure.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Database deadlock reported by the driver.
    #[error("Database deadlock: {0}")]
    Deadlock(String),

    /// A transaction exceeded its ceiling.
    #[error("Transaction timed out after {ms}ms")]
    TransactionTimeout { ms: u64 },

    /// Unique/not-null/foreign-key violation raised by a user-table write.
    #[error("Constraint violation on '{table}': {reason}")]
    Constraint { table: String, reason: String },

    /// A required read found no row.
    #[error("Record not found in '{table}' for key {key}")]
    NotFound { table: String, key: String },

    /// A user indexing function failed.
    #[error("Handler '{handler}' failed: {reason}")]
    Handler { handler: String, reason: String },

    /// Generic storage failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Checkpoint string failed to decode.
    #[error("Invalid checkpoint: {0}")]
    InvalidCheckpoint(String),

    /// The persisted build id does not match the running build.
    #[error("Build mismatch: store has '{stored}', running build is '{running}'")]
    BuildMismatch { stored: String, running: String },

    /// A shadow-table row is malformed (unknown operation tag, bad
    /// checkpoint) — the reorg log can no longer be trusted.
    #[error("Corrupted shadow data in '{table}': {reason}")]
    CorruptedShadow { table: String, reason: String },

    /// A reorg reached below the unfinalized ring. State cannot be reverted.
    #[error("Deep reorg on chain {chain_id}: no common ancestor for block {block_number}")]
    DeepReorg { chain_id: u64, block_number: u64 },

    /// Crash-recovery state does not line up with the persisted checkpoints.
    #[error("Crash recovery mismatch: {0}")]
    RecoveryMismatch(String),

    /// The engine was cancelled mid-operation.
    #[error("Engine aborted: {0}")]
    Aborted(String),
}

/// Severity classes driving propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Retryable,
    NonRetryableUser,
    NonRetryableEngine,
    Unrecoverable,
}

impl EngineError {
    /// Classify this error.
    ///
    /// `TransactionTimeout` is classified retryable here; the historical
    /// executor treats it as fatal regardless (batch transactions are never
    /// partially retried).
    pub fn severity(&self) -> Severity {
        match self {
            Self::Rpc(_) | Self::Deadlock(_) | Self::TransactionTimeout { .. } => {
                Severity::Retryable
            }
            Self::Constraint { .. } | Self::NotFound { .. } | Self::Handler { .. } => {
                Severity::NonRetryableUser
            }
            Self::Storage(_)
            | Self::InvalidCheckpoint(_)
            | Self::BuildMismatch { .. }
            | Self::CorruptedShadow { .. }
            | Self::Aborted(_) => Severity::NonRetryableEngine,
            Self::DeepReorg { .. } | Self::RecoveryMismatch(_) => Severity::Unrecoverable,
        }
    }

    /// Returns `true` if this error may be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        self.severity() == Severity::Retryable
    }

    /// Process exit code for this error: 75 (`EX_TEMPFAIL`) for a deep
    /// reorg, 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::DeepReorg { .. } => 75,
            _ => 1,
        }
    }
}

/// Event context attached to fatal reports so the failure names the exact
/// event that triggered it.
#[derive(Debug, Clone)]
pub struct EventErrorContext {
    pub name: String,
    pub chain_id: u64,
    pub block_number: u64,
    pub checkpoint: Checkpoint,
}

/// Emit the single structured log line required for a fatal error.
pub fn report_fatal(error: &EngineError, context: Option<&EventErrorContext>) {
    let severity = format!("{:?}", error.severity());
    match context {
        Some(ctx) => tracing::error!(
            kind = %severity,
            event = %ctx.name,
            chain_id = ctx.chain_id,
            block = ctx.block_number,
            checkpoint = %ctx.checkpoint,
            "fatal: {error}"
        ),
        None => tracing::error!(kind = %severity, "fatal: {error}"),
    }
}
