//! Per-event handler context.
//!
//! A `Context` is a value built from borrows for exactly one handler
//! invocation: chain info, a database access path, the cached client, and
//! the contract handles. In historical mode the database path goes through
//! the write buffer (with read-through to the store); in realtime mode it
//! writes directly, letting the triggers capture images naturally. The two
//! paths are observationally equivalent.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use sqlx::SqliteConnection;

use chainflow_core::error::EngineError;

use chainflow_storage::buffer::WriteBuffer;
use chainflow_storage::schema::Table;
use chainflow_storage::store::{ReorgStore, Row};

use crate::client::CachedClient;

/// The chain a handler is running against.
#[derive(Debug, Clone)]
pub struct ChainInfo {
    pub id: u64,
    pub name: String,
}

/// A named contract exposed to handlers: its static address plus any
/// factory children discovered so far.
#[derive(Debug, Clone, Default)]
pub struct ContractHandle {
    pub address: Option<String>,
    pub child_addresses: HashSet<String>,
}

/// Everything a handler may touch while processing one event.
pub struct Context<'a> {
    pub chain: ChainInfo,
    pub client: &'a CachedClient,
    pub contracts: &'a HashMap<String, ContractHandle>,
    store: &'a ReorgStore,
    conn: &'a mut SqliteConnection,
    buffer: Option<&'a mut WriteBuffer>,
}

impl<'a> Context<'a> {
    pub fn new(
        chain: ChainInfo,
        client: &'a CachedClient,
        contracts: &'a HashMap<String, ContractHandle>,
        store: &'a ReorgStore,
        conn: &'a mut SqliteConnection,
        buffer: Option<&'a mut WriteBuffer>,
    ) -> Self {
        Self { chain, client, contracts, store, conn, buffer }
    }

    fn table(&self, name: &str) -> Result<Table, EngineError> {
        self.store
            .schema()
            .table(name)
            .cloned()
            .ok_or_else(|| EngineError::Storage(format!("unknown table '{name}'")))
    }

    /// Look up a row by primary key, seeing this batch's own writes.
    pub async fn find(&mut self, table: &str, key: &Value) -> Result<Option<Row>, EngineError> {
        if let Some(buffer) = self.buffer.as_deref() {
            if let Some(staged) = buffer.get(table, key) {
                return Ok(staged.cloned());
            }
        }
        let descriptor = self.table(table)?;
        self.store.find(&mut *self.conn, &descriptor, key).await
    }

    /// Insert a new row. The row must carry the table's primary key; a
    /// duplicate key is a constraint violation.
    pub async fn insert(&mut self, table: &str, row: Row) -> Result<(), EngineError> {
        let descriptor = self.table(table)?;
        let key = row
            .get(&descriptor.primary_key)
            .cloned()
            .filter(|v| !v.is_null())
            .ok_or_else(|| EngineError::Constraint {
                table: table.to_string(),
                reason: format!("insert is missing primary key '{}'", descriptor.primary_key),
            })?;
        match self.buffer.as_deref_mut() {
            Some(buffer) => buffer.insert(table, key, row),
            None => self.store.insert(&mut *self.conn, &descriptor, &row).await,
        }
    }

    /// Apply a partial update to an existing row. A missing row is a
    /// required-read failure.
    pub async fn update(&mut self, table: &str, key: &Value, patch: Row) -> Result<Row, EngineError> {
        let current = self.find(table, key).await?.ok_or_else(|| EngineError::NotFound {
            table: table.to_string(),
            key: key.to_string(),
        })?;

        let mut merged = current;
        for (column, value) in &patch {
            merged.insert(column.clone(), value.clone());
        }

        let descriptor = self.table(table)?;
        match self.buffer.as_deref_mut() {
            Some(buffer) => {
                buffer.update(table, key.clone(), merged.clone())?;
            }
            None => {
                self.store.update(&mut *self.conn, &descriptor, key, &patch).await?;
            }
        }
        Ok(merged)
    }

    /// Insert the row if its key is absent, otherwise apply `patch`.
    pub async fn upsert(
        &mut self,
        table: &str,
        key: &Value,
        insert_row: Row,
        patch: Row,
    ) -> Result<Row, EngineError> {
        match self.find(table, key).await? {
            Some(_) => self.update(table, key, patch).await,
            None => {
                self.insert(table, insert_row.clone()).await?;
                Ok(insert_row)
            }
        }
    }

    /// Delete a row. Returns `false` if it did not exist.
    pub async fn delete(&mut self, table: &str, key: &Value) -> Result<bool, EngineError> {
        if self.buffer.is_some() {
            let existed = self.find(table, key).await?.is_some();
            if existed {
                if let Some(buffer) = self.buffer.as_deref_mut() {
                    buffer.delete(table, key.clone());
                }
            }
            Ok(existed)
        } else {
            let descriptor = self.table(table)?;
            self.store.delete(&mut *self.conn, &descriptor, key).await
        }
    }
}
