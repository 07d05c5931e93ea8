//! Connection Registry: one `private_cloud_databases` row per tenant.

use std::fmt;
use std::str::FromStr;

use erasure_auth::TenantId;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::any::AnyRow;
use tracing::info;

use super::{TenantRepository, now_ts};
use crate::error::CloudError;
use crate::schema::EntityKind;
use crate::secrets::SecretBox;
use crate::store::descriptor::MASK;
use crate::store::{ConnectionDescriptor, StoreKind, try_get_nullable};

/// Setup lifecycle. Variants are ordered; a step may only run once the
/// previous one has been reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivateCloudStatus {
    NotConfigured,
    Configured,
    ConnectionVerified,
    SchemaReady,
    RoutingActive,
}

impl PrivateCloudStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotConfigured => "not_configured",
            Self::Configured => "configured",
            Self::ConnectionVerified => "connection_verified",
            Self::SchemaReady => "schema_ready",
            Self::RoutingActive => "routing_active",
        }
    }
}

impl fmt::Display for PrivateCloudStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrivateCloudStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_configured" => Ok(Self::NotConfigured),
            "configured" => Ok(Self::Configured),
            "connection_verified" => Ok(Self::ConnectionVerified),
            "schema_ready" => Ok(Self::SchemaReady),
            "routing_active" => Ok(Self::RoutingActive),
            other => Err(format!("unknown private cloud status: {other}")),
        }
    }
}

/// A tenant's registry row. The descriptor stays sealed until
/// [`PrivateStoreConfig::decrypt_descriptor`] is called.
#[derive(Debug, Clone)]
pub struct PrivateStoreConfig {
    pub tenant: TenantId,
    pub kind: StoreKind,
    sealed_descriptor: String,
    pub notes: Option<String>,
    pub selected_tables: Vec<EntityKind>,
    pub status: PrivateCloudStatus,
    pub is_active: bool,
    pub last_tested_at: Option<i64>,
    pub last_test_message: Option<String>,
    pub schema_initialized_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl PrivateStoreConfig {
    pub fn decrypt_descriptor(&self, secrets: &SecretBox) -> Result<ConnectionDescriptor, CloudError> {
        let json = secrets.open(&self.sealed_descriptor)?;
        serde_json::from_str(&json).map_err(|_| CloudError::Crypto)
    }

    /// Fail unless setup has reached at least `required`.
    pub fn require_status(&self, required: PrivateCloudStatus) -> Result<(), CloudError> {
        if self.status < required {
            return Err(CloudError::InvalidState {
                required,
                actual: self.status,
            });
        }
        Ok(())
    }

    /// The form handed to callers: the descriptor is masked.
    pub fn view(&self, secrets: &SecretBox) -> PrivateStoreConfigView {
        let masked_connection = self
            .decrypt_descriptor(secrets)
            .map(|d| d.masked())
            .unwrap_or_else(|_| MASK.to_string());
        PrivateStoreConfigView {
            user_email: self.tenant.clone(),
            database_type: self.kind,
            masked_connection,
            notes: self.notes.clone(),
            selected_tables: self.selected_tables.clone(),
            status: self.status,
            is_active: self.is_active,
            last_tested_at: self.last_tested_at,
            last_test_message: self.last_test_message.clone(),
            schema_initialized_at: self.schema_initialized_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PrivateStoreConfigView {
    pub user_email: TenantId,
    pub database_type: StoreKind,
    pub masked_connection: String,
    pub notes: Option<String>,
    pub selected_tables: Vec<EntityKind>,
    pub status: PrivateCloudStatus,
    pub is_active: bool,
    pub last_tested_at: Option<i64>,
    pub last_test_message: Option<String>,
    pub schema_initialized_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

const CONFIG_COLUMNS: &str = "user_email, database_type, connection_string, notes, \
     selected_tables, status, is_active, last_tested_at, last_test_message, \
     schema_initialized_at, created_at, updated_at";

// Optional text columns hold '' rather than NULL; see `non_empty`.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn decode_config(row: &AnyRow) -> Result<PrivateStoreConfig, CloudError> {
    let corrupt = |what: &str| CloudError::Schema(format!("corrupt registry row: {what}"));

    let tenant: String = row.try_get("user_email")?;
    let kind: String = row.try_get("database_type")?;
    let status: String = row.try_get("status")?;
    let selected: Option<String> = try_get_nullable(row, "selected_tables")?;
    let selected_tables = match non_empty(selected) {
        Some(json) => {
            serde_json::from_str(&json).map_err(|_| corrupt("selected_tables"))?
        }
        None => Vec::new(),
    };

    Ok(PrivateStoreConfig {
        tenant: TenantId::parse(&tenant).map_err(|_| corrupt("user_email"))?,
        kind: kind.parse().map_err(|_| corrupt("database_type"))?,
        sealed_descriptor: row.try_get("connection_string")?,
        notes: non_empty(try_get_nullable(row, "notes")?),
        selected_tables,
        status: status.parse().map_err(|_| corrupt("status"))?,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        last_tested_at: try_get_nullable(row, "last_tested_at")?,
        last_test_message: non_empty(try_get_nullable(row, "last_test_message")?),
        schema_initialized_at: try_get_nullable(row, "schema_initialized_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl TenantRepository {
    /// The tenant's active config; soft-deleted rows read as absent.
    pub async fn get_private_config(
        &self,
        tenant: &TenantId,
    ) -> Result<Option<PrivateStoreConfig>, CloudError> {
        let sql = format!(
            "SELECT {CONFIG_COLUMNS} FROM private_cloud_databases \
             WHERE user_email = ? AND is_active = 1"
        );
        let row = sqlx::query(&self.store.sql(&sql))
            .bind(tenant.as_str())
            .fetch_optional(self.store.pool())
            .await?;
        row.as_ref().map(decode_config).transpose()
    }

    /// Like [`Self::get_private_config`] but absence is an error.
    pub async fn require_private_config(
        &self,
        tenant: &TenantId,
    ) -> Result<PrivateStoreConfig, CloudError> {
        self.get_private_config(tenant)
            .await?
            .ok_or_else(|| CloudError::NotConfigured(tenant.to_string()))
    }

    /// Create or replace the tenant's config. The descriptor is sealed
    /// before it touches the store; the lifecycle restarts at `Configured`.
    pub async fn upsert_private_config(
        &self,
        tenant: &TenantId,
        descriptor: &ConnectionDescriptor,
        notes: Option<&str>,
        selected_tables: &[EntityKind],
        secrets: &SecretBox,
    ) -> Result<PrivateStoreConfig, CloudError> {
        descriptor.validate()?;
        let json = serde_json::to_string(descriptor)
            .map_err(|e| CloudError::InvalidDescriptor(e.to_string()))?;
        let sealed = secrets.seal(&json)?;
        let mut tables = selected_tables.to_vec();
        tables.sort();
        tables.dedup();
        let tables_json = serde_json::to_string(&tables)
            .map_err(|e| CloudError::InvalidRequest(e.to_string()))?;
        let notes = notes.map(str::trim).unwrap_or_default();
        let now = now_ts();

        let mut tx = self.store.pool().begin().await?;
        let existing: Option<i64> = sqlx::query_scalar(
            &self
                .store
                .sql("SELECT id FROM private_cloud_databases WHERE user_email = ?"),
        )
        .bind(tenant.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        match existing {
            Some(id) => {
                let sql = "UPDATE private_cloud_databases SET database_type = ?, \
                     connection_string = ?, notes = ?, selected_tables = ?, status = ?, \
                     is_active = 1, last_tested_at = NULL, last_test_message = '', \
                     schema_initialized_at = NULL, updated_at = ? WHERE id = ?";
                sqlx::query(&self.store.sql(sql))
                    .bind(descriptor.kind.as_str())
                    .bind(sealed)
                    .bind(notes)
                    .bind(tables_json)
                    .bind(PrivateCloudStatus::Configured.as_str())
                    .bind(now)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            None => {
                let sql = "INSERT INTO private_cloud_databases \
                     (user_email, database_type, connection_string, notes, selected_tables, \
                      status, is_active, last_test_message, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, 1, '', ?, ?)";
                sqlx::query(&self.store.sql(sql))
                    .bind(tenant.as_str())
                    .bind(descriptor.kind.as_str())
                    .bind(sealed)
                    .bind(notes)
                    .bind(tables_json)
                    .bind(PrivateCloudStatus::Configured.as_str())
                    .bind(now)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;

        info!(
            "Private cloud configured for {}: {}",
            tenant,
            descriptor.masked()
        );
        self.require_private_config(tenant).await
    }

    /// Move the lifecycle. Reaching `ConnectionVerified` stamps
    /// `last_tested_at`; reaching `SchemaReady` stamps `schema_initialized_at`.
    pub async fn set_private_status(
        &self,
        tenant: &TenantId,
        status: PrivateCloudStatus,
        message: Option<&str>,
    ) -> Result<(), CloudError> {
        let now = now_ts();
        let mut assignments = vec!["status = ?", "updated_at = ?"];
        match status {
            PrivateCloudStatus::ConnectionVerified => assignments.push("last_tested_at = ?"),
            PrivateCloudStatus::SchemaReady => assignments.push("schema_initialized_at = ?"),
            _ => {}
        }
        if message.is_some() {
            assignments.push("last_test_message = ?");
        }
        let sql = format!(
            "UPDATE private_cloud_databases SET {} WHERE user_email = ? AND is_active = 1",
            assignments.join(", ")
        );

        let sql = self.store.sql(&sql);
        let mut query = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(now);
        if matches!(
            status,
            PrivateCloudStatus::ConnectionVerified | PrivateCloudStatus::SchemaReady
        ) {
            query = query.bind(now);
        }
        if let Some(message) = message {
            query = query.bind(message.to_string());
        }
        let result = query.bind(tenant.as_str()).execute(self.store.pool()).await?;
        if result.rows_affected() == 0 {
            return Err(CloudError::NotConfigured(tenant.to_string()));
        }
        info!("Private cloud status for {} -> {}", tenant, status);
        Ok(())
    }

    /// Record a connection-test outcome without moving the lifecycle.
    pub async fn record_test_outcome(
        &self,
        tenant: &TenantId,
        message: &str,
    ) -> Result<(), CloudError> {
        let now = now_ts();
        sqlx::query(&self.store.sql(
            "UPDATE private_cloud_databases SET last_tested_at = ?, last_test_message = ?, \
             updated_at = ? WHERE user_email = ? AND is_active = 1",
        ))
        .bind(now)
        .bind(message.to_string())
        .bind(now)
        .bind(tenant.as_str())
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    /// Deactivate the tenant's config. Rows already in the private store
    /// are not touched. Returns whether an active config existed.
    pub async fn soft_delete_private_config(&self, tenant: &TenantId) -> Result<bool, CloudError> {
        let result = sqlx::query(&self.store.sql(
            "UPDATE private_cloud_databases SET is_active = 0, status = ?, updated_at = ? \
             WHERE user_email = ? AND is_active = 1",
        ))
        .bind(PrivateCloudStatus::NotConfigured.as_str())
        .bind(now_ts())
        .bind(tenant.as_str())
        .execute(self.store.pool())
        .await?;
        let deleted = result.rows_affected() > 0;
        if deleted {
            info!("Private cloud config deactivated for {}", tenant);
        }
        Ok(deleted)
    }
}
