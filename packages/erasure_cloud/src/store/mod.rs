//! Dialect-aware access to the shared store and tenant-owned stores.
//!
//! Every statement in this crate is written with `?` placeholders; [`Store::sql`]
//! rewrites them for engines that number their parameters.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;

pub mod descriptor;
pub mod value;

pub use descriptor::ConnectionDescriptor;
pub use value::{ColumnType, SqlValue, try_get_nullable};

/// Relational engine behind a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Sqlite,
    Postgres,
    #[serde(rename = "mysql")]
    MySql,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
        }
    }

    /// Infer the engine from a connection URL scheme.
    pub fn from_url(url: &str) -> Option<Self> {
        let scheme = url.split(':').next()?.to_ascii_lowercase();
        scheme.parse().ok()
    }

    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::Sqlite => None,
            Self::Postgres => Some(5432),
            Self::MySql => Some(3306),
        }
    }

    /// Placeholder for a bound text value.
    ///
    /// The `Any` driver binds NULL as an int4 on Postgres, which the server
    /// refuses to assign to a text column without a cast.
    pub fn text_placeholder(&self) -> &'static str {
        match self {
            Self::Postgres => "CAST(? AS TEXT)",
            Self::Sqlite | Self::MySql => "?",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::MySql),
            other => Err(format!("unsupported database type: {other}")),
        }
    }
}

/// A pooled connection to one physical database.
#[derive(Clone)]
pub struct Store {
    kind: StoreKind,
    pool: AnyPool,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").field("kind", &self.kind).finish()
    }
}

impl Store {
    /// Open a pool and establish the first connection.
    pub async fn connect(
        kind: StoreKind,
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, sqlx::Error> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await?;
        Ok(Self { kind, pool })
    }

    /// Build a pool whose connections are opened on first use.
    pub fn connect_lazy(
        kind: StoreKind,
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, sqlx::Error> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(url)?;
        Ok(Self { kind, pool })
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Adapt a `?`-placeholder statement to this store's dialect.
    pub fn sql<'a>(&self, sql: &'a str) -> Cow<'a, str> {
        match self.kind {
            StoreKind::Postgres => Cow::Owned(number_placeholders(sql)),
            StoreKind::Sqlite | StoreKind::MySql => Cow::Borrowed(sql),
        }
    }

    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Rewrite `?` placeholders outside string literals to `$1`, `$2`, ...
pub fn number_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut index = 0;
    let mut in_literal = false;
    for ch in sql.chars() {
        match ch {
            '\'' => {
                in_literal = !in_literal;
                out.push(ch);
            }
            '?' if !in_literal => {
                index += 1;
                out.push('$');
                out.push_str(&index.to_string());
            }
            _ => out.push(ch),
        }
    }
    out
}

/// `?, ?, ?` for an `IN (...)` list of `n` values.
pub fn placeholder_list(n: usize) -> String {
    vec!["?"; n].join(", ")
}
