//! The reorg-tracking store.
//!
//! Owns the user tables between engine start and shutdown. For every user
//! table `T` there is a shadow table `_reorg_T` populated by row triggers;
//! shadow rows carry the pre-change image plus an operation tag and a
//! checkpoint, which is `MAX_CHECKPOINT` at capture time and rewritten to
//! the real event checkpoint by [`ReorgStore::stamp`].
//!
//! Revert restores the user tables to their state at a checkpoint; finalize
//! prunes shadow rows that can no longer be reverted. Both run inside the
//! caller's transaction.

use std::collections::HashSet;

use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row as _, Sqlite, SqliteConnection};
use tracing::{debug, info};

use chainflow_core::checkpoint::{max_checkpoint, zero_checkpoint, Checkpoint};
use chainflow_core::error::EngineError;

use crate::schema::{Column, ColumnType, Schema, Table};

/// A dynamic user-table row.
pub type Row = Map<String, Value>;

/// Persisted checkpoint row: `{namespace, safe, latest}`.
pub const CHECKPOINT_TABLE: &str = "ponder_checkpoint";
/// Persisted build id for restart compatibility checks.
pub const META_TABLE: &str = "ponder_meta";

/// SQLite-backed reorg-tracking store.
pub struct ReorgStore {
    pool: SqlitePool,
    schema: Schema,
    namespace: String,
}

impl ReorgStore {
    /// Open (or create) a database file and run migration.
    pub async fn open(
        path: &str,
        schema: Schema,
        namespace: impl Into<String>,
    ) -> Result<Self, EngineError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;
        let store = Self { pool, schema, namespace: namespace.into() };
        store.migrate().await?;
        Ok(store)
    }

    /// Open an in-memory database (tests, ephemeral runs).
    ///
    /// A single pooled connection keeps every caller on the same database.
    pub async fn in_memory(schema: Schema) -> Result<Self, EngineError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;
        let store = Self { pool, schema, namespace: "public".into() };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Open a transaction.
    pub async fn begin(&self) -> Result<sqlx::Transaction<'_, Sqlite>, EngineError> {
        self.pool.begin().await.map_err(storage_err)
    }

    /// Create user tables, shadow tables, indexes, and the meta tables.
    /// Triggers are created separately at engine start.
    async fn migrate(&self) -> Result<(), EngineError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        for table in &self.schema.tables {
            for sql in [table.create_sql(), table.shadow_create_sql(), table.shadow_index_sql()] {
                sqlx::query(&sql).execute(&self.pool).await.map_err(storage_err)?;
            }
        }

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS \"{CHECKPOINT_TABLE}\" (\
             \"namespace\" TEXT PRIMARY KEY, \
             \"safe_checkpoint\" TEXT NOT NULL, \
             \"latest_checkpoint\" TEXT NOT NULL, \
             \"updated_at\" INTEGER NOT NULL)"
        ))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS \"{META_TABLE}\" (\
             \"namespace\" TEXT PRIMARY KEY, \
             \"build_id\" TEXT NOT NULL)"
        ))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        info!(tables = self.schema.tables.len(), "store migrated");
        Ok(())
    }

    /// Reject a restart against a store built from different user code.
    pub async fn verify_build(&self, build_id: &str) -> Result<(), EngineError> {
        let row = sqlx::query(&format!(
            "SELECT \"build_id\" FROM \"{META_TABLE}\" WHERE \"namespace\" = ?1"
        ))
        .bind(&self.namespace)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        match row {
            Some(row) => {
                let stored: String = row.try_get("build_id").map_err(storage_err)?;
                if stored != build_id {
                    return Err(EngineError::BuildMismatch {
                        stored,
                        running: build_id.to_string(),
                    });
                }
                Ok(())
            }
            None => {
                sqlx::query(&format!(
                    "INSERT INTO \"{META_TABLE}\" (\"namespace\", \"build_id\") VALUES (?1, ?2)"
                ))
                .bind(&self.namespace)
                .bind(build_id)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
                Ok(())
            }
        }
    }

    // ─── Triggers ────────────────────────────────────────────────────────────

    pub async fn create_triggers(&self, conn: &mut SqliteConnection) -> Result<(), EngineError> {
        for table in &self.schema.tables {
            for sql in table.trigger_sqls() {
                sqlx::query(&sql).execute(&mut *conn).await.map_err(storage_err)?;
            }
        }
        Ok(())
    }

    pub async fn drop_triggers(&self, conn: &mut SqliteConnection) -> Result<(), EngineError> {
        for table in &self.schema.tables {
            for sql in table.drop_trigger_sqls() {
                sqlx::query(&sql).execute(&mut *conn).await.map_err(storage_err)?;
            }
        }
        Ok(())
    }

    /// Clean-shutdown teardown: drop triggers and shadow tables. A crashed
    /// run leaves both in place so restart can recover via the shadow data.
    pub async fn teardown(&self) -> Result<(), EngineError> {
        let mut conn = self.pool.acquire().await.map_err(storage_err)?;
        self.drop_triggers(&mut conn).await?;
        for table in &self.schema.tables {
            sqlx::query(&table.drop_shadow_sql())
                .execute(&mut *conn)
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }

    // ─── Checkpoint plumbing ─────────────────────────────────────────────────

    /// Rewrite shadow rows captured at `MAX_CHECKPOINT` to the real event
    /// checkpoint. Called after each event (realtime) or batch (historical).
    pub async fn stamp(
        &self,
        conn: &mut SqliteConnection,
        checkpoint: &Checkpoint,
    ) -> Result<u64, EngineError> {
        let max = max_checkpoint();
        let encoded = checkpoint.encode();
        let mut stamped = 0u64;
        for table in &self.schema.tables {
            let sql = format!(
                "UPDATE \"{}\" SET \"checkpoint\" = ?1 WHERE \"checkpoint\" = ?2",
                table.shadow_name()
            );
            let result = sqlx::query(&sql)
                .bind(&encoded)
                .bind(&max)
                .execute(&mut *conn)
                .await
                .map_err(storage_err)?;
            stamped += result.rows_affected();
        }
        Ok(stamped)
    }

    /// Record the latest processed checkpoint.
    pub async fn set_latest(
        &self,
        conn: &mut SqliteConnection,
        checkpoint: &Checkpoint,
    ) -> Result<(), EngineError> {
        let sql = format!(
            "INSERT INTO \"{CHECKPOINT_TABLE}\" \
             (\"namespace\", \"safe_checkpoint\", \"latest_checkpoint\", \"updated_at\") \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(\"namespace\") DO UPDATE SET \
             \"latest_checkpoint\" = excluded.\"latest_checkpoint\", \
             \"updated_at\" = excluded.\"updated_at\""
        );
        sqlx::query(&sql)
            .bind(&self.namespace)
            .bind(zero_checkpoint())
            .bind(checkpoint.encode())
            .bind(Utc::now().timestamp())
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Read `(safe, latest)` checkpoints, if a run has recorded them.
    pub async fn checkpoints(&self) -> Result<Option<(Checkpoint, Checkpoint)>, EngineError> {
        let row = sqlx::query(&format!(
            "SELECT \"safe_checkpoint\", \"latest_checkpoint\" FROM \"{CHECKPOINT_TABLE}\" \
             WHERE \"namespace\" = ?1"
        ))
        .bind(&self.namespace)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        match row {
            Some(row) => {
                let safe: String = row.try_get("safe_checkpoint").map_err(storage_err)?;
                let latest: String = row.try_get("latest_checkpoint").map_err(storage_err)?;
                Ok(Some((Checkpoint::decode(&safe)?, Checkpoint::decode(&latest)?)))
            }
            None => Ok(None),
        }
    }

    // ─── Revert ──────────────────────────────────────────────────────────────

    /// Restore every user table to its state at `checkpoint`, inside the
    /// caller's transaction, with triggers dropped for the duration so the
    /// restorative writes are not themselves captured. Returns the number
    /// of shadow rows consumed.
    pub async fn revert_all(
        &self,
        conn: &mut SqliteConnection,
        checkpoint: &Checkpoint,
    ) -> Result<u64, EngineError> {
        self.drop_triggers(conn).await?;
        let mut total = 0u64;
        for table in &self.schema.tables {
            total += self.revert_table(conn, table, checkpoint).await?;
        }
        self.create_triggers(conn).await?;
        debug!(checkpoint = %checkpoint, rows = total, "reverted user tables");
        Ok(total)
    }

    /// Revert a single table. Caller must have dropped the triggers.
    ///
    /// Of the shadow rows above `checkpoint`, only the *earliest* operation
    /// per key matters: its stored image is the authoritative pre-checkpoint
    /// state. Later operations overwrote intermediate state and are
    /// discarded.
    pub async fn revert_table(
        &self,
        conn: &mut SqliteConnection,
        table: &Table,
        checkpoint: &Checkpoint,
    ) -> Result<u64, EngineError> {
        let encoded = checkpoint.encode();
        let shadow = table.shadow_name();

        let select = format!(
            "SELECT * FROM \"{shadow}\" WHERE \"checkpoint\" > ?1 ORDER BY \"operation_id\" ASC"
        );
        let rows = sqlx::query(&select)
            .bind(&encoded)
            .fetch_all(&mut *conn)
            .await
            .map_err(storage_err)?;

        let mut earliest: Vec<(i64, Row)> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for row in &rows {
            let operation: i64 = row.try_get("operation").map_err(storage_err)?;
            if !(0..=2).contains(&operation) {
                return Err(EngineError::CorruptedShadow {
                    table: table.name.clone(),
                    reason: format!("unknown operation tag {operation}"),
                });
            }
            let image = row_to_json(table, row)?;
            let key = match image.get(&table.primary_key) {
                Some(v) if !v.is_null() => v.to_string(),
                _ => {
                    return Err(EngineError::CorruptedShadow {
                        table: table.name.clone(),
                        reason: "shadow row has no primary key".into(),
                    })
                }
            };
            if seen.insert(key) {
                earliest.push((operation, image));
            }
        }

        for (operation, image) in &earliest {
            match *operation {
                // The first post-checkpoint op was an INSERT: the key did
                // not exist at the checkpoint.
                0 => {
                    let key = image.get(&table.primary_key).cloned().unwrap_or(Value::Null);
                    self.delete(conn, table, &key).await?;
                }
                // UPDATE/DELETE: the stored image is the pre-checkpoint
                // row; put it back.
                _ => {
                    self.upsert(conn, table, image).await?;
                }
            }
        }

        let deleted = sqlx::query(&format!(
            "DELETE FROM \"{shadow}\" WHERE \"checkpoint\" > ?1"
        ))
        .bind(&encoded)
        .execute(&mut *conn)
        .await
        .map_err(storage_err)?
        .rows_affected();

        Ok(deleted)
    }

    // ─── Finalize ────────────────────────────────────────────────────────────

    /// Prune shadow rows at or below `checkpoint` and persist it as the
    /// safe checkpoint. Returns the number of pruned rows.
    pub async fn finalize(
        &self,
        conn: &mut SqliteConnection,
        checkpoint: &Checkpoint,
    ) -> Result<u64, EngineError> {
        let encoded = checkpoint.encode();
        let mut pruned = 0u64;
        for table in &self.schema.tables {
            let result = sqlx::query(&format!(
                "DELETE FROM \"{}\" WHERE \"checkpoint\" <= ?1",
                table.shadow_name()
            ))
            .bind(&encoded)
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;
            pruned += result.rows_affected();
        }

        let sql = format!(
            "INSERT INTO \"{CHECKPOINT_TABLE}\" \
             (\"namespace\", \"safe_checkpoint\", \"latest_checkpoint\", \"updated_at\") \
             VALUES (?1, ?2, ?2, ?3) \
             ON CONFLICT(\"namespace\") DO UPDATE SET \
             \"safe_checkpoint\" = excluded.\"safe_checkpoint\", \
             \"latest_checkpoint\" = max(\"latest_checkpoint\", excluded.\"latest_checkpoint\"), \
             \"updated_at\" = excluded.\"updated_at\""
        );
        sqlx::query(&sql)
            .bind(&self.namespace)
            .bind(&encoded)
            .bind(Utc::now().timestamp())
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;

        Ok(pruned)
    }

    // ─── User-table CRUD ─────────────────────────────────────────────────────

    /// Look up a row by primary key.
    pub async fn find(
        &self,
        conn: &mut SqliteConnection,
        table: &Table,
        key: &Value,
    ) -> Result<Option<Row>, EngineError> {
        let pk = table.column(&table.primary_key).ok_or_else(|| EngineError::Storage(
            format!("table '{}' has no primary key column", table.name),
        ))?;
        let sql = format!(
            "SELECT * FROM \"{}\" WHERE \"{}\" = ?1",
            table.name, table.primary_key
        );
        let query = bind_value(sqlx::query(&sql), pk, Some(key));
        let row = query.fetch_optional(&mut *conn).await.map_err(storage_err)?;
        row.map(|r| row_to_json(table, &r)).transpose()
    }

    /// Plain INSERT — a duplicate key surfaces as a constraint violation.
    pub async fn insert(
        &self,
        conn: &mut SqliteConnection,
        table: &Table,
        row: &Row,
    ) -> Result<(), EngineError> {
        let sql = insert_sql(table, 1, false);
        let mut query = sqlx::query(&sql);
        for column in &table.columns {
            query = bind_value(query, column, row.get(&column.name));
        }
        query
            .execute(&mut *conn)
            .await
            .map_err(|e| table_err(&table.name, e))?;
        Ok(())
    }

    /// Chunked multi-row INSERT for the historical write buffer's flush.
    pub async fn bulk_insert(
        &self,
        conn: &mut SqliteConnection,
        table: &Table,
        rows: &[Row],
    ) -> Result<(), EngineError> {
        if rows.is_empty() {
            return Ok(());
        }
        // Stay under SQLite's bound-parameter limit.
        let per_chunk = (900 / table.columns.len().max(1)).max(1);
        for chunk in rows.chunks(per_chunk) {
            let sql = insert_sql(table, chunk.len(), false);
            let mut query = sqlx::query(&sql);
            for row in chunk {
                for column in &table.columns {
                    query = bind_value(query, column, row.get(&column.name));
                }
            }
            query
                .execute(&mut *conn)
                .await
                .map_err(|e| table_err(&table.name, e))?;
        }
        Ok(())
    }

    /// Insert-or-update by primary key.
    pub async fn upsert(
        &self,
        conn: &mut SqliteConnection,
        table: &Table,
        row: &Row,
    ) -> Result<(), EngineError> {
        let sql = insert_sql(table, 1, true);
        let mut query = sqlx::query(&sql);
        for column in &table.columns {
            query = bind_value(query, column, row.get(&column.name));
        }
        query
            .execute(&mut *conn)
            .await
            .map_err(|e| table_err(&table.name, e))?;
        Ok(())
    }

    /// Partial UPDATE by primary key. Returns `false` if no row matched.
    pub async fn update(
        &self,
        conn: &mut SqliteConnection,
        table: &Table,
        key: &Value,
        patch: &Row,
    ) -> Result<bool, EngineError> {
        let mut sets = Vec::new();
        for name in patch.keys() {
            if name == &table.primary_key {
                continue;
            }
            if table.column(name).is_none() {
                return Err(EngineError::Constraint {
                    table: table.name.clone(),
                    reason: format!("unknown column '{name}'"),
                });
            }
            sets.push(format!("\"{}\" = ?", name));
        }
        if sets.is_empty() {
            return Ok(true);
        }
        let sql = format!(
            "UPDATE \"{}\" SET {} WHERE \"{}\" = ?",
            table.name,
            sets.join(", "),
            table.primary_key
        );
        let mut query = sqlx::query(&sql);
        for (name, value) in patch {
            if name == &table.primary_key {
                continue;
            }
            let column = table.column(name).expect("validated above");
            query = bind_value(query, column, Some(value));
        }
        let pk = table.column(&table.primary_key).expect("primary key column");
        query = bind_value(query, pk, Some(key));
        let result = query
            .execute(&mut *conn)
            .await
            .map_err(|e| table_err(&table.name, e))?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete by primary key. Returns `false` if no row matched.
    pub async fn delete(
        &self,
        conn: &mut SqliteConnection,
        table: &Table,
        key: &Value,
    ) -> Result<bool, EngineError> {
        let pk = table.column(&table.primary_key).ok_or_else(|| EngineError::Storage(
            format!("table '{}' has no primary key column", table.name),
        ))?;
        let sql = format!(
            "DELETE FROM \"{}\" WHERE \"{}\" = ?1",
            table.name, table.primary_key
        );
        let result = bind_value(sqlx::query(&sql), pk, Some(key))
            .execute(&mut *conn)
            .await
            .map_err(|e| table_err(&table.name, e))?;
        Ok(result.rows_affected() > 0)
    }

    // ─── Introspection (tests, invariant checks) ─────────────────────────────

    /// Count shadow rows at or below a checkpoint.
    pub async fn shadow_rows_at_or_below(
        &self,
        conn: &mut SqliteConnection,
        table: &Table,
        checkpoint: &Checkpoint,
    ) -> Result<i64, EngineError> {
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS n FROM \"{}\" WHERE \"checkpoint\" <= ?1",
            table.shadow_name()
        ))
        .bind(checkpoint.encode())
        .fetch_one(&mut *conn)
        .await
        .map_err(storage_err)?;
        row.try_get("n").map_err(storage_err)
    }

    /// Count shadow rows still carrying the capture sentinel.
    pub async fn shadow_rows_at_max(
        &self,
        conn: &mut SqliteConnection,
        table: &Table,
    ) -> Result<i64, EngineError> {
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS n FROM \"{}\" WHERE \"checkpoint\" = ?1",
            table.shadow_name()
        ))
        .bind(max_checkpoint())
        .fetch_one(&mut *conn)
        .await
        .map_err(storage_err)?;
        row.try_get("n").map_err(storage_err)
    }
}

/// Build `INSERT INTO t (cols) VALUES (…),(…)` with optional upsert tail.
fn insert_sql(table: &Table, rows: usize, upsert: bool) -> String {
    let cols = table
        .columns
        .iter()
        .map(|c| format!("\"{}\"", c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = format!(
        "({})",
        vec!["?"; table.columns.len()].join(", ")
    );
    let values = vec![placeholders; rows].join(", ");
    let mut sql = format!("INSERT INTO \"{}\" ({cols}) VALUES {values}", table.name);
    if upsert {
        let updates = table
            .columns
            .iter()
            .filter(|c| c.name != table.primary_key)
            .map(|c| format!("\"{0}\" = excluded.\"{0}\"", c.name))
            .collect::<Vec<_>>()
            .join(", ");
        if updates.is_empty() {
            sql.push_str(&format!(" ON CONFLICT(\"{}\") DO NOTHING", table.primary_key));
        } else {
            sql.push_str(&format!(
                " ON CONFLICT(\"{}\") DO UPDATE SET {updates}",
                table.primary_key
            ));
        }
    }
    sql
}

/// Bind a JSON value under a column's declared type; `None`/`Null` binds
/// SQL NULL.
fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    column: &Column,
    value: Option<&Value>,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    let value = value.unwrap_or(&Value::Null);
    match column.ty {
        ColumnType::Integer => query.bind(value.as_i64()),
        ColumnType::Real => query.bind(value.as_f64()),
        ColumnType::Text => query.bind(value.as_str().map(str::to_owned)),
        ColumnType::Boolean => query.bind(value.as_bool().map(i64::from)),
    }
}

/// Read a user-table (or shadow) row into JSON under the table's schema.
pub fn row_to_json(table: &Table, row: &SqliteRow) -> Result<Row, EngineError> {
    let mut out = Row::new();
    for column in &table.columns {
        let name = column.name.as_str();
        let value = match column.ty {
            ColumnType::Integer => row
                .try_get::<Option<i64>, _>(name)
                .map_err(storage_err)?
                .map_or(Value::Null, Value::from),
            ColumnType::Real => row
                .try_get::<Option<f64>, _>(name)
                .map_err(storage_err)?
                .map_or(Value::Null, Value::from),
            ColumnType::Text => row
                .try_get::<Option<String>, _>(name)
                .map_err(storage_err)?
                .map_or(Value::Null, Value::from),
            ColumnType::Boolean => row
                .try_get::<Option<i64>, _>(name)
                .map_err(storage_err)?
                .map_or(Value::Null, |v| Value::Bool(v != 0)),
        };
        out.insert(column.name.clone(), value);
    }
    Ok(out)
}

fn storage_err(error: sqlx::Error) -> EngineError {
    classify(String::new(), error)
}

fn table_err(table: &str, error: sqlx::Error) -> EngineError {
    classify(table.to_string(), error)
}

fn classify(table: String, error: sqlx::Error) -> EngineError {
    let message = error.to_string();
    let lower = message.to_ascii_lowercase();
    if lower.contains("unique") || lower.contains("not null") || lower.contains("foreign key") {
        EngineError::Constraint { table, reason: message }
    } else if lower.contains("locked") || lower.contains("busy") || lower.contains("deadlock") {
        EngineError::Deadlock(message)
    } else {
        EngineError::Storage(message)
    }
}
