//! Engine metrics — a process-local snapshot handle.
//!
//! Counters and duration stats live behind one lock; `snapshot()` clones
//! the current state for scraping or assertions. Instrument names follow
//! the engine's metric contract (`indexing_*`, `sync_reorg_*`,
//! `database_revert_rows_total`, `settings_info`).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Count/total/max aggregate for histogram-shaped series.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Aggregate {
    pub count: u64,
    pub total: f64,
    pub max: f64,
}

impl Aggregate {
    fn observe(&mut self, value: f64) {
        self.count += 1;
        self.total += value;
        if value > self.max {
            self.max = value;
        }
    }
}

/// Static run settings (the `settings_info` gauge).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsInfo {
    pub ordering: String,
    pub database: String,
    pub command: String,
}

/// Cloneable snapshot of all series.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    /// `indexing_events_processed_total{event}`
    pub events_processed: HashMap<String, u64>,
    /// `indexing_function_duration{event}` (milliseconds)
    pub function_duration: HashMap<String, Aggregate>,
    /// `sync_reorg_total{chain}`
    pub reorgs: HashMap<u64, u64>,
    /// `sync_reorg_depth{chain}`
    pub reorg_depth: HashMap<u64, Aggregate>,
    /// `database_revert_rows_total{table}`
    pub revert_rows: HashMap<String, u64>,
    /// `settings_info{ordering, database, command}`
    pub settings: Option<SettingsInfo>,
}

/// Shared metrics handle.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    inner: Mutex<MetricsSnapshot>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&self, name: &str, duration: Duration) {
        let mut inner = self.inner.lock().expect("metrics lock");
        *inner.events_processed.entry(name.to_string()).or_default() += 1;
        inner
            .function_duration
            .entry(name.to_string())
            .or_default()
            .observe(duration.as_secs_f64() * 1_000.0);
    }

    pub fn record_reorg(&self, chain_id: u64, depth: usize) {
        let mut inner = self.inner.lock().expect("metrics lock");
        *inner.reorgs.entry(chain_id).or_default() += 1;
        inner.reorg_depth.entry(chain_id).or_default().observe(depth as f64);
    }

    pub fn record_revert_rows(&self, table: &str, rows: u64) {
        let mut inner = self.inner.lock().expect("metrics lock");
        *inner.revert_rows.entry(table.to_string()).or_default() += rows;
    }

    pub fn set_settings(&self, ordering: &str, database: &str, command: &str) {
        self.inner.lock().expect("metrics lock").settings = Some(SettingsInfo {
            ordering: ordering.to_string(),
            database: database.to_string(),
            command: command.to_string(),
        });
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().expect("metrics lock").clone()
    }
}
