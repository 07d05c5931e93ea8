use erasure_auth::{FeatureSet, TenantId};
use serde::Serialize;
use sqlx::Row;

use super::TenantRepository;
use crate::error::CloudError;
use crate::store::try_get_nullable;

/// A sub-identity owned by a tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubuserRef {
    pub id: i64,
    pub email: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReportSummary {
    pub id: i64,
    pub report_name: Option<String>,
    pub erasure_method: Option<String>,
    pub synced: bool,
    pub created_at: Option<i64>,
}

/// Row counts for the tenant in whichever store the repository is bound to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TenantStatistics {
    pub audit_reports: i64,
    pub subusers: i64,
    pub machines: i64,
}

impl TenantRepository {
    /// Capability flags from the tenant's user row.
    pub async fn tenant_features(&self, tenant: &TenantId) -> Result<FeatureSet, CloudError> {
        let row = sqlx::query(&self.store.sql(
            "SELECT is_private_cloud, private_api FROM users WHERE user_email = ?",
        ))
        .bind(tenant.as_str())
        .fetch_optional(self.store.pool())
        .await?
        .ok_or_else(|| CloudError::TenantNotFound(tenant.to_string()))?;

        Ok(FeatureSet::from_flags(
            row.try_get::<i64, _>("is_private_cloud")? != 0,
            row.try_get::<i64, _>("private_api")? != 0,
        ))
    }

    pub async fn tenant_user_id(&self, tenant: &TenantId) -> Result<Option<i64>, CloudError> {
        let id = sqlx::query_scalar(&self.store.sql("SELECT id FROM users WHERE user_email = ?"))
            .bind(tenant.as_str())
            .fetch_optional(self.store.pool())
            .await?;
        Ok(id)
    }

    /// Sub-identities whose parent is `tenant`, by id.
    pub async fn owned_subusers(&self, tenant: &TenantId) -> Result<Vec<SubuserRef>, CloudError> {
        let rows = sqlx::query(&self.store.sql(
            "SELECT id, subuser_email FROM subusers WHERE user_email = ? ORDER BY id",
        ))
        .bind(tenant.as_str())
        .fetch_all(self.store.pool())
        .await?;

        rows.iter()
            .map(|r| {
                Ok(SubuserRef {
                    id: r.try_get("id")?,
                    email: r.try_get("subuser_email")?,
                })
            })
            .collect()
    }

    /// Audit reports the tenant owns, newest first.
    pub async fn list_audit_reports(
        &self,
        tenant: &TenantId,
        limit: i64,
    ) -> Result<Vec<AuditReportSummary>, CloudError> {
        let rows = sqlx::query(&self.store.sql(
            "SELECT id, report_name, erasure_method, synced, created_at FROM audit_reports \
             WHERE client_email = ? ORDER BY created_at DESC, id DESC LIMIT ?",
        ))
        .bind(tenant.as_str())
        .bind(limit)
        .fetch_all(self.store.pool())
        .await?;

        rows.iter()
            .map(|r| {
                Ok(AuditReportSummary {
                    id: r.try_get("id")?,
                    report_name: try_get_nullable(r, "report_name")?,
                    erasure_method: try_get_nullable(r, "erasure_method")?,
                    synced: try_get_nullable::<i64>(r, "synced")?.unwrap_or(0) != 0,
                    created_at: try_get_nullable(r, "created_at")?,
                })
            })
            .collect()
    }

    pub async fn tenant_statistics(&self, tenant: &TenantId) -> Result<TenantStatistics, CloudError> {
        let row = sqlx::query(&self.store.sql(
            "SELECT \
                (SELECT COUNT(*) FROM audit_reports WHERE client_email = ?) AS audit_reports, \
                (SELECT COUNT(*) FROM subusers WHERE user_email = ?) AS subusers, \
                (SELECT COUNT(*) FROM machines WHERE user_email = ? OR subuser_email IN \
                    (SELECT subuser_email FROM subusers WHERE user_email = ?)) AS machines",
        ))
        .bind(tenant.as_str())
        .bind(tenant.as_str())
        .bind(tenant.as_str())
        .bind(tenant.as_str())
        .fetch_one(self.store.pool())
        .await?;

        Ok(TenantStatistics {
            audit_reports: row.try_get("audit_reports")?,
            subusers: row.try_get("subusers")?,
            machines: row.try_get("machines")?,
        })
    }
}
