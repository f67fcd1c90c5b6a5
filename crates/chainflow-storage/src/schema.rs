//! Compiled schema descriptor and DDL derivation.
//!
//! The engine consumes an already-compiled schema: tables, columns, types,
//! primary keys. From it we derive the user-table DDL, the `_reorg_*`
//! shadow DDL, and the row triggers that capture pre-change images.

use serde::{Deserialize, Serialize};

use chainflow_core::checkpoint::max_checkpoint;

/// SQLite column affinity for a user column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Boolean,
}

impl ColumnType {
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Integer | Self::Boolean => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
        }
    }
}

/// One user-table column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    #[serde(default)]
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self { name: name.into(), ty, nullable: false }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// One user table with a declared primary key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    pub primary_key: String,
}

impl Table {
    pub fn new(
        name: impl Into<String>,
        columns: Vec<Column>,
        primary_key: impl Into<String>,
    ) -> Self {
        Self { name: name.into(), columns, primary_key: primary_key.into() }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Name of this table's shadow table.
    pub fn shadow_name(&self) -> String {
        format!("_reorg_{}", self.name)
    }

    /// `CREATE TABLE` for the user table.
    pub fn create_sql(&self) -> String {
        let cols = self
            .columns
            .iter()
            .map(|c| {
                let null = if c.nullable || c.name == self.primary_key { "" } else { " NOT NULL" };
                format!("\"{}\" {}{}", c.name, c.ty.sql_type(), null)
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" ({cols}, PRIMARY KEY (\"{}\"))",
            self.name, self.primary_key
        )
    }

    /// `CREATE TABLE` for the shadow table: every user column (nullable)
    /// plus the operation log columns.
    pub fn shadow_create_sql(&self) -> String {
        let cols = self
            .columns
            .iter()
            .map(|c| format!("\"{}\" {}", c.name, c.ty.sql_type()))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" ({cols}, \
             \"operation_id\" INTEGER PRIMARY KEY AUTOINCREMENT, \
             \"operation\" INTEGER NOT NULL, \
             \"checkpoint\" TEXT NOT NULL)",
            self.shadow_name()
        )
    }

    /// Index supporting the `checkpoint > ?` / `checkpoint <= ?` scans of
    /// revert and finalize.
    pub fn shadow_index_sql(&self) -> String {
        format!(
            "CREATE INDEX IF NOT EXISTS \"idx_{0}_checkpoint\" ON \"{0}\" (\"checkpoint\")",
            self.shadow_name()
        )
    }

    fn trigger_name(&self, op: &str) -> String {
        format!("{}__{}", self.shadow_name(), op)
    }

    /// The three row triggers. Captured rows carry `MAX_CHECKPOINT` until
    /// the batch-end stamp rewrites them, so revert's `checkpoint > ?`
    /// never races the capture.
    pub fn trigger_sqls(&self) -> Vec<String> {
        let col_list = self
            .columns
            .iter()
            .map(|c| format!("\"{}\"", c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let new_list = self
            .columns
            .iter()
            .map(|c| format!("NEW.\"{}\"", c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let old_list = self
            .columns
            .iter()
            .map(|c| format!("OLD.\"{}\"", c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let max = max_checkpoint();
        let shadow = self.shadow_name();
        vec![
            format!(
                "CREATE TRIGGER IF NOT EXISTS \"{}\" AFTER INSERT ON \"{}\" FOR EACH ROW BEGIN \
                 INSERT INTO \"{shadow}\" ({col_list}, \"operation\", \"checkpoint\") \
                 VALUES ({new_list}, 0, '{max}'); END",
                self.trigger_name("insert"),
                self.name
            ),
            format!(
                "CREATE TRIGGER IF NOT EXISTS \"{}\" AFTER UPDATE ON \"{}\" FOR EACH ROW BEGIN \
                 INSERT INTO \"{shadow}\" ({col_list}, \"operation\", \"checkpoint\") \
                 VALUES ({old_list}, 1, '{max}'); END",
                self.trigger_name("update"),
                self.name
            ),
            format!(
                "CREATE TRIGGER IF NOT EXISTS \"{}\" AFTER DELETE ON \"{}\" FOR EACH ROW BEGIN \
                 INSERT INTO \"{shadow}\" ({col_list}, \"operation\", \"checkpoint\") \
                 VALUES ({old_list}, 2, '{max}'); END",
                self.trigger_name("delete"),
                self.name
            ),
        ]
    }

    pub fn drop_trigger_sqls(&self) -> Vec<String> {
        ["insert", "update", "delete"]
            .iter()
            .map(|op| format!("DROP TRIGGER IF EXISTS \"{}\"", self.trigger_name(op)))
            .collect()
    }

    pub fn drop_shadow_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS \"{}\"", self.shadow_name())
    }
}

/// The compiled schema for one engine run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub tables: Vec<Table>,
}

impl Schema {
    pub fn new(tables: Vec<Table>) -> Self {
        Self { tables }
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }
}
