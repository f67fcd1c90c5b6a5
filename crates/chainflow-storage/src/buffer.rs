//! Historical-mode write buffer.
//!
//! Writes are staged in memory keyed by `(table, primary key)` and flushed
//! at batch end: bulk inserts first, then upserts for updates, then
//! deletes. Reads go through the buffer before the database, so a batch
//! always sees its own writes. Per key only the net operation survives
//! (last-write-wins), which is exactly what the shadow capture needs: the
//! flush-time trigger image is the pre-batch state.

use std::collections::BTreeMap;

use serde_json::Value;
use sqlx::SqliteConnection;

use chainflow_core::error::EngineError;

use crate::store::{ReorgStore, Row};

/// Net operation staged for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferedOp {
    Insert,
    Update,
    Delete,
}

#[derive(Debug)]
struct Entry {
    op: BufferedOp,
    key: Value,
    /// The full row for `Insert`/`Update`; `None` for `Delete`.
    row: Option<Row>,
}

/// In-memory staging layer over the user tables.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    // BTreeMap keeps flush order deterministic.
    entries: BTreeMap<(String, String), Entry>,
}

fn key_of(value: &Value) -> String {
    value.to_string()
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Buffered view of a key: `None` = not buffered (fall through to the
    /// database), `Some(None)` = deleted in this batch, `Some(Some(row))` =
    /// written in this batch.
    pub fn get(&self, table: &str, key: &Value) -> Option<Option<&Row>> {
        self.entries
            .get(&(table.to_string(), key_of(key)))
            .map(|entry| entry.row.as_ref())
    }

    /// Stage an insert. A key already staged as inserted or updated in this
    /// batch is a duplicate-key violation; a staged delete turns into an
    /// overwrite (the row existed before the batch).
    pub fn insert(&mut self, table: &str, key: Value, row: Row) -> Result<(), EngineError> {
        let map_key = (table.to_string(), key_of(&key));
        match self.entries.get_mut(&map_key) {
            None => {
                self.entries.insert(map_key, Entry { op: BufferedOp::Insert, key, row: Some(row) });
                Ok(())
            }
            Some(entry) => match entry.op {
                BufferedOp::Insert | BufferedOp::Update => Err(EngineError::Constraint {
                    table: table.to_string(),
                    reason: format!("duplicate insert for key {key}"),
                }),
                BufferedOp::Delete => {
                    entry.op = BufferedOp::Update;
                    entry.row = Some(row);
                    Ok(())
                }
            },
        }
    }

    /// Stage a full-row update. The caller has already merged the patch
    /// over the current state (buffered or database).
    pub fn update(&mut self, table: &str, key: Value, row: Row) -> Result<(), EngineError> {
        let map_key = (table.to_string(), key_of(&key));
        match self.entries.get_mut(&map_key) {
            None => {
                self.entries.insert(map_key, Entry { op: BufferedOp::Update, key, row: Some(row) });
                Ok(())
            }
            Some(entry) => match entry.op {
                // Still a net insert: the key did not exist before the batch.
                BufferedOp::Insert => {
                    entry.row = Some(row);
                    Ok(())
                }
                BufferedOp::Update => {
                    entry.row = Some(row);
                    Ok(())
                }
                BufferedOp::Delete => Err(EngineError::NotFound {
                    table: table.to_string(),
                    key: key_of(&key),
                }),
            },
        }
    }

    /// Stage a delete.
    pub fn delete(&mut self, table: &str, key: Value) {
        let map_key = (table.to_string(), key_of(&key));
        match self.entries.get_mut(&map_key) {
            None => {
                self.entries.insert(map_key, Entry { op: BufferedOp::Delete, key, row: None });
            }
            Some(entry) => match entry.op {
                // Inserted and deleted within the batch: net no-op.
                BufferedOp::Insert => {
                    self.entries.remove(&map_key);
                }
                BufferedOp::Update => {
                    entry.op = BufferedOp::Delete;
                    entry.row = None;
                }
                BufferedOp::Delete => {}
            },
        }
    }

    /// Flush staged writes: per table bulk inserts, then upserts, then
    /// deletes. The buffer is empty afterwards.
    pub async fn flush(
        &mut self,
        store: &ReorgStore,
        conn: &mut SqliteConnection,
    ) -> Result<(), EngineError> {
        let mut inserts: BTreeMap<String, Vec<Row>> = BTreeMap::new();
        let mut updates: Vec<(String, Row)> = Vec::new();
        let mut deletes: Vec<(String, Value)> = Vec::new();

        for ((table, _), entry) in std::mem::take(&mut self.entries) {
            match entry.op {
                BufferedOp::Insert => inserts
                    .entry(table)
                    .or_default()
                    .push(entry.row.expect("insert entry has a row")),
                BufferedOp::Update => {
                    updates.push((table, entry.row.expect("update entry has a row")))
                }
                BufferedOp::Delete => deletes.push((table, entry.key)),
            }
        }

        for (table_name, rows) in &inserts {
            let table = lookup(store, table_name)?;
            store.bulk_insert(conn, table, rows).await?;
        }
        for (table_name, row) in &updates {
            let table = lookup(store, table_name)?;
            store.upsert(conn, table, row).await?;
        }
        for (table_name, key) in &deletes {
            let table = lookup(store, table_name)?;
            store.delete(conn, table, key).await?;
        }
        Ok(())
    }
}

fn lookup<'a>(store: &'a ReorgStore, table: &str) -> Result<&'a crate::schema::Table, EngineError> {
    store
        .schema()
        .table(table)
        .ok_or_else(|| EngineError::Storage(format!("unknown table '{table}'")))
}
