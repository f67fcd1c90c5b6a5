//! chainflow-core — foundation types for the chainflow indexing engine.
//!
//! # Architecture
//!
//! ```text
//! sync adapter (per chain) ──► ordering merger ──► indexing executor
//!        │                          │                     │
//!   EventBuilder             Checkpoint order        ReorgStore
//!   (bundle → events)        (multichain/omnichain)  (shadow tables)
//! ```
//!
//! This crate holds the pieces everything else agrees on: the checkpoint
//! codec, the event model, declarative sources, the event builder, the
//! error taxonomy, and engine configuration.

pub mod builder;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod source;

pub use builder::{BuiltBlock, EventBuilder};
pub use checkpoint::{Checkpoint, CHECKPOINT_LENGTH};
pub use config::{ChainConfig, EngineConfig, OrderingPolicy};
pub use error::{EngineError, Severity};
pub use event::{ControlEvent, Event, EventData, EventKind, RawBlock, RawBlockBundle, ReorgedBlock};
pub use source::Source;
