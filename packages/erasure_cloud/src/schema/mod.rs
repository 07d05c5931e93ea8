//! Schema provisioning for the shared store and tenant-owned stores.

use std::collections::HashSet;

use serde::Serialize;
use sqlx::Row;
use tracing::{debug, info};

pub mod catalog;

pub use catalog::{EntityClass, EntityKind, Ownership, PRIMARY_KINDS, TableDef, required_tables};

use crate::error::CloudError;
use crate::store::{ColumnType, Store, StoreKind};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaReport {
    pub created: Vec<String>,
    pub existing: Vec<String>,
}

impl SchemaReport {
    pub fn is_noop(&self) -> bool {
        self.created.is_empty()
    }
}

/// Creates missing tables; never alters or drops existing ones.
pub struct SchemaProvisioner;

impl SchemaProvisioner {
    /// Tables every private store must hold, in creation order.
    pub fn list_required_tables() -> Vec<&'static str> {
        required_tables()
    }

    /// Create the migratable table set on `store`. Safe to repeat.
    pub async fn ensure_schema(store: &Store) -> Result<SchemaReport, CloudError> {
        let tables: Vec<&TableDef> = EntityKind::ALL.iter().map(EntityKind::table).collect();
        Self::ensure_tables(store, &tables).await
    }

    pub async fn ensure_tables(
        store: &Store,
        tables: &[&TableDef],
    ) -> Result<SchemaReport, CloudError> {
        let present = existing_tables(store).await?;
        let mut report = SchemaReport::default();

        for table in tables {
            if present.contains(table.name) {
                ensure_indexes(store, table).await?;
                report.existing.push(table.name.to_string());
                continue;
            }
            for statement in create_statements(table, store.kind()) {
                debug!("DDL on {}: {}", store.kind(), statement);
                sqlx::query(&statement)
                    .execute(store.pool())
                    .await
                    .map_err(|e| CloudError::Schema(format!("creating {}: {e}", table.name)))?;
            }
            report.created.push(table.name.to_string());
        }

        if report.is_noop() {
            debug!("Schema already present ({} tables)", report.existing.len());
        } else {
            info!(
                "Created {} table(s) on {} store: {}",
                report.created.len(),
                store.kind(),
                report.created.join(", ")
            );
        }
        Ok(report)
    }

    /// Names of required tables missing from `store`.
    pub async fn missing_tables(store: &Store) -> Result<Vec<&'static str>, CloudError> {
        let present = existing_tables(store).await?;
        Ok(required_tables()
            .into_iter()
            .filter(|t| !present.contains(*t))
            .collect())
    }
}

async fn existing_tables(store: &Store) -> Result<HashSet<String>, CloudError> {
    let sql = match store.kind() {
        StoreKind::Sqlite => "SELECT name AS table_name FROM sqlite_master WHERE type = 'table'",
        StoreKind::Postgres => {
            "SELECT CAST(table_name AS TEXT) AS table_name FROM information_schema.tables \
             WHERE table_schema = current_schema()"
        }
        StoreKind::MySql => {
            "SELECT CAST(table_name AS CHAR) AS table_name FROM information_schema.tables \
             WHERE table_schema = DATABASE()"
        }
    };
    let rows = sqlx::query(sql)
        .fetch_all(store.pool())
        .await
        .map_err(|e| CloudError::Schema(format!("listing tables: {e}")))?;
    rows.iter()
        .map(|r| r.try_get::<String, _>("table_name"))
        .collect::<Result<_, _>>()
        .map_err(|e| CloudError::Schema(format!("listing tables: {e}")))
}

/// Create whatever declared indexes `table` lacks. Covers a table whose
/// earlier provisioning stopped between the table and its indexes.
async fn ensure_indexes(store: &Store, table: &TableDef) -> Result<(), CloudError> {
    if table.indexes.is_empty() {
        return Ok(());
    }
    let fail = |e: sqlx::Error| CloudError::Schema(format!("indexing {}: {e}", table.name));

    let existing: HashSet<String> = if store.kind() == StoreKind::MySql {
        let rows = sqlx::query(
            "SELECT CAST(index_name AS CHAR) AS index_name FROM information_schema.statistics \
             WHERE table_schema = DATABASE() AND table_name = ?",
        )
        .bind(table.name)
        .fetch_all(store.pool())
        .await
        .map_err(fail)?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("index_name"))
            .collect::<Result<_, _>>()
            .map_err(fail)?
    } else {
        HashSet::new()
    };

    for column in table.indexes {
        let name = index_name(table, column);
        if existing.contains(&name) {
            continue;
        }
        let statement = match store.kind() {
            StoreKind::MySql => format!("CREATE INDEX {name} ON {}({column})", table.name),
            _ => format!("CREATE INDEX IF NOT EXISTS {name} ON {}({column})", table.name),
        };
        debug!("DDL on {}: {}", store.kind(), statement);
        sqlx::query(&statement)
            .execute(store.pool())
            .await
            .map_err(fail)?;
    }
    Ok(())
}

fn index_name(table: &TableDef, column: &str) -> String {
    format!("idx_{}_{}", table.name, column)
}

fn column_type_sql(ty: ColumnType, kind: StoreKind) -> &'static str {
    match (ty, kind) {
        (ColumnType::Int, StoreKind::Sqlite) => "INTEGER",
        (ColumnType::Int, _) => "BIGINT",
        (ColumnType::Text, StoreKind::MySql) => "VARCHAR(255)",
        (ColumnType::Body, StoreKind::MySql) => "LONGTEXT",
        (ColumnType::Text | ColumnType::Body, _) => "TEXT",
    }
}

fn primary_key_sql(kind: StoreKind) -> &'static str {
    match kind {
        StoreKind::Sqlite => "id INTEGER PRIMARY KEY",
        StoreKind::Postgres => "id BIGINT GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY",
        StoreKind::MySql => "id BIGINT AUTO_INCREMENT PRIMARY KEY",
    }
}

/// `CREATE TABLE` plus index statements for one table in one dialect.
pub fn create_statements(table: &TableDef, kind: StoreKind) -> Vec<String> {
    let mut lines = vec![primary_key_sql(kind).to_string()];
    for column in table.columns.iter().filter(|c| c.name != "id") {
        let mut line = format!("{} {}", column.name, column_type_sql(column.ty, kind));
        if !column.nullable {
            line.push_str(" NOT NULL");
        }
        if let Some(default) = column.default {
            line.push_str(" DEFAULT ");
            line.push_str(default);
        }
        lines.push(line);
    }
    for column in table.unique {
        lines.push(format!("UNIQUE ({column})"));
    }
    for fk in table.foreign_keys {
        lines.push(format!(
            "FOREIGN KEY ({}) REFERENCES {}(id)",
            fk.column, fk.references
        ));
    }
    // MySQL has no CREATE INDEX IF NOT EXISTS
    if kind == StoreKind::MySql {
        for column in table.indexes {
            lines.push(format!("INDEX {} ({column})", index_name(table, column)));
        }
    }

    let mut statements = vec![format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        table.name,
        lines.join(",\n    ")
    )];
    if kind != StoreKind::MySql {
        for column in table.indexes {
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS {} ON {}({column})",
                index_name(table, column),
                table.name
            ));
        }
    }
    statements
}
