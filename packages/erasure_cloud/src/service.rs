//! Private-cloud operations exposed to callers.
//!
//! Every operation takes the tenant explicitly and returns a serializable
//! response; failures are [`CloudError`]s, which render as
//! `{ success: false, message, error }`.

use std::collections::BTreeMap;
use std::sync::Arc;

use erasure_auth::{Feature, TenantId};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::CloudError;
use crate::migration::{KindReport, MigrationEngine, MigrationReport, MigrationSettings};
use crate::repository::{
    AuditReportSummary, PrivateCloudStatus, PrivateStoreConfigView, TenantRepository,
    TenantStatistics,
};
use crate::routing::{StoreFactory, StoreTarget, UnitOfWork};
use crate::schema::{EntityKind, SchemaProvisioner};
use crate::secrets::SecretBox;
use crate::store::{ConnectionDescriptor, StoreKind};
use crate::tester::{ConnectionTestResult, ConnectionTester};

#[derive(Debug, Serialize)]
pub struct SetupResponse {
    pub success: bool,
    pub message: String,
    pub next_step: &'static str,
    pub config: PrivateStoreConfigView,
}

#[derive(Debug, Serialize)]
pub struct SchemaResponse {
    pub success: bool,
    pub message: String,
    pub created: Vec<String>,
    pub existing: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ActivationResponse {
    pub success: bool,
    pub message: String,
    pub status: PrivateCloudStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Serialize)]
pub struct SetupStep {
    pub step: &'static str,
    pub status: StepStatus,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct CompleteSetupResponse {
    pub success: bool,
    pub steps: Vec<SetupStep>,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<PrivateStoreConfigView>,
}

#[derive(Debug, Serialize)]
pub struct RoutingTestResponse {
    pub is_private: bool,
    pub can_connect: bool,
    pub database: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<TenantStatistics>,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct PrimaryMigrationResponse {
    pub success: bool,
    pub message: String,
    pub migrated: BTreeMap<EntityKind, u64>,
    pub found: BTreeMap<EntityKind, u64>,
    pub failed: u64,
}

#[derive(Debug, Serialize)]
pub struct MigrationSummary {
    pub total_found: u64,
    pub total_migrated: u64,
    pub total_skipped: u64,
    pub total_failed: u64,
    pub default_role_assigned: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct FullMigrationResponse {
    pub success: bool,
    pub message: String,
    pub migration_results: BTreeMap<EntityKind, KindReport>,
    pub summary: MigrationSummary,
}

impl From<MigrationReport> for FullMigrationResponse {
    fn from(report: MigrationReport) -> Self {
        Self {
            success: !report.is_partial(),
            message: report.summary(),
            summary: MigrationSummary {
                total_found: report.total_found,
                total_migrated: report.total_migrated,
                total_skipped: report.total_skipped,
                total_failed: report.total_failed,
                default_role_assigned: report.default_role_assigned,
                duration_ms: report.duration_ms,
                warnings: report.warnings,
            },
            migration_results: report.kinds,
        }
    }
}

impl From<MigrationReport> for PrimaryMigrationResponse {
    fn from(report: MigrationReport) -> Self {
        Self {
            success: !report.is_partial(),
            message: report.summary(),
            migrated: report.migrated_counts(),
            found: report.found_counts(),
            failed: report.total_failed,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct AuditReportsResponse {
    pub database: &'static str,
    pub reports: Vec<AuditReportSummary>,
}

pub struct PrivateCloudService {
    registry: TenantRepository,
    secrets: SecretBox,
    tester: ConnectionTester,
    factory: Arc<StoreFactory>,
    engine: MigrationEngine,
}

fn parse_tables(names: &[String]) -> Result<Vec<EntityKind>, CloudError> {
    names
        .iter()
        .map(|n| {
            n.parse::<EntityKind>()
                .map_err(CloudError::InvalidRequest)
        })
        .collect()
}

impl PrivateCloudService {
    pub fn new(
        factory: Arc<StoreFactory>,
        tester: ConnectionTester,
        secrets: SecretBox,
        settings: MigrationSettings,
    ) -> Self {
        let engine = MigrationEngine::new(
            factory.clone(),
            tester.clone(),
            secrets.clone(),
            settings,
        );
        Self {
            registry: TenantRepository::new(factory.shared().clone()),
            secrets,
            tester,
            factory,
            engine,
        }
    }

    async fn require_private_cloud(&self, tenant: &TenantId) -> Result<(), CloudError> {
        self.registry
            .tenant_features(tenant)
            .await?
            .require(Feature::PrivateCloud)?;
        Ok(())
    }

    async fn private_descriptor(
        &self,
        tenant: &TenantId,
        required: PrivateCloudStatus,
    ) -> Result<(PrivateCloudStatus, ConnectionDescriptor), CloudError> {
        let config = self.registry.require_private_config(tenant).await?;
        config.require_status(required)?;
        Ok((config.status, config.decrypt_descriptor(&self.secrets)?))
    }

    pub async fn setup(
        &self,
        tenant: &TenantId,
        descriptor: ConnectionDescriptor,
        notes: Option<&str>,
        selected_tables: &[String],
    ) -> Result<SetupResponse, CloudError> {
        self.require_private_cloud(tenant).await?;
        let tables = parse_tables(selected_tables)?;
        let config = self
            .registry
            .upsert_private_config(tenant, &descriptor, notes, &tables, &self.secrets)
            .await?;
        self.factory.forget(tenant).await;

        Ok(SetupResponse {
            success: true,
            message: "Private cloud configuration saved".to_string(),
            next_step: "test_connection",
            config: config.view(&self.secrets),
        })
    }

    pub async fn setup_from_connection_string(
        &self,
        tenant: &TenantId,
        connection_string: &str,
        kind: Option<StoreKind>,
        notes: Option<&str>,
        selected_tables: &[String],
    ) -> Result<SetupResponse, CloudError> {
        let descriptor = ConnectionDescriptor::parse(connection_string, kind)?;
        self.setup(tenant, descriptor, notes, selected_tables).await
    }

    /// Probe the configured store. A reachable store advances a `Configured`
    /// setup to `ConnectionVerified`; an unreachable one leaves it where it was.
    pub async fn test_connection(
        &self,
        tenant: &TenantId,
    ) -> Result<ConnectionTestResult, CloudError> {
        self.require_private_cloud(tenant).await?;
        let (status, descriptor) = self
            .private_descriptor(tenant, PrivateCloudStatus::Configured)
            .await?;

        let result = self.tester.test(&descriptor).await;
        if result.success && status < PrivateCloudStatus::ConnectionVerified {
            self.registry
                .set_private_status(
                    tenant,
                    PrivateCloudStatus::ConnectionVerified,
                    Some(&result.message),
                )
                .await?;
        } else {
            let outcome = result.error.as_deref().unwrap_or(&result.message);
            self.registry.record_test_outcome(tenant, outcome).await?;
        }
        Ok(result)
    }

    pub async fn initialize_schema(&self, tenant: &TenantId) -> Result<SchemaResponse, CloudError> {
        self.require_private_cloud(tenant).await?;
        let (status, descriptor) = self
            .private_descriptor(tenant, PrivateCloudStatus::ConnectionVerified)
            .await?;

        let store = self.factory.private_store(tenant, &descriptor).await?;
        self.tester.ping(&store, &descriptor).await?;
        let report = SchemaProvisioner::ensure_schema(&store)
            .await
            .map_err(|e| redact_schema_error(&descriptor, e))?;

        let message = if report.is_noop() {
            format!("All {} tables already present", report.existing.len())
        } else {
            format!("Created {} tables", report.created.len())
        };
        if status < PrivateCloudStatus::SchemaReady {
            self.registry
                .set_private_status(tenant, PrivateCloudStatus::SchemaReady, Some(&message))
                .await?;
        }

        Ok(SchemaResponse {
            success: true,
            message,
            created: report.created,
            existing: report.existing,
        })
    }

    /// Switch the tenant's units of work to its private store, after
    /// confirming the store is reachable and fully provisioned.
    pub async fn activate_routing(
        &self,
        tenant: &TenantId,
    ) -> Result<ActivationResponse, CloudError> {
        self.require_private_cloud(tenant).await?;
        let (status, descriptor) = self
            .private_descriptor(tenant, PrivateCloudStatus::SchemaReady)
            .await?;

        let store = self.factory.private_store(tenant, &descriptor).await?;
        self.tester.ping(&store, &descriptor).await?;
        let missing = SchemaProvisioner::missing_tables(&store)
            .await
            .map_err(|e| redact_schema_error(&descriptor, e))?;
        if !missing.is_empty() {
            return Err(CloudError::Schema(format!(
                "private store is missing tables: {}",
                missing.join(", ")
            )));
        }

        if status < PrivateCloudStatus::RoutingActive {
            self.registry
                .set_private_status(tenant, PrivateCloudStatus::RoutingActive, None)
                .await?;
        }
        Ok(ActivationResponse {
            success: true,
            message: "Requests now route to the private database".to_string(),
            status: PrivateCloudStatus::RoutingActive,
        })
    }

    /// setup → test → schema → activate, stopping at the first failing step.
    pub async fn complete_setup(
        &self,
        tenant: &TenantId,
        descriptor: ConnectionDescriptor,
        notes: Option<&str>,
        selected_tables: &[String],
    ) -> CompleteSetupResponse {
        const STEPS: [&str; 4] = [
            "save_configuration",
            "test_connection",
            "initialize_schema",
            "activate_routing",
        ];
        let mut steps = Vec::with_capacity(STEPS.len());
        let mut failure: Option<(&'static str, String)> = None;

        for step in STEPS {
            if failure.is_some() {
                steps.push(SetupStep {
                    step,
                    status: StepStatus::Skipped,
                    message: "not attempted".to_string(),
                });
                continue;
            }
            let outcome = match step {
                "save_configuration" => self
                    .setup(tenant, descriptor.clone(), notes, selected_tables)
                    .await
                    .map(|r| r.message),
                "test_connection" => match self.test_connection(tenant).await {
                    Ok(r) if r.success => Ok(r.message),
                    Ok(r) => Err(r.error.unwrap_or(r.message)),
                    Err(e) => Err(e.public_message()),
                }
                .map_err(CloudError::Connectivity),
                "initialize_schema" => self.initialize_schema(tenant).await.map(|r| r.message),
                _ => self.activate_routing(tenant).await.map(|r| r.message),
            };
            match outcome {
                Ok(message) => steps.push(SetupStep {
                    step,
                    status: StepStatus::Succeeded,
                    message,
                }),
                Err(e) => {
                    let message = match e {
                        CloudError::Connectivity(m) => m,
                        other => other.public_message(),
                    };
                    warn!("Private cloud setup for {} failed at {}: {}", tenant, step, message);
                    steps.push(SetupStep {
                        step,
                        status: StepStatus::Failed,
                        message: message.clone(),
                    });
                    failure = Some((step, message));
                }
            }
        }

        let summary = match &failure {
            None => {
                info!("Private cloud setup complete for {}", tenant);
                "Private cloud setup complete; requests now route to the private database"
                    .to_string()
            }
            Some((step, message)) => format!("Setup stopped at {step}: {message}"),
        };
        CompleteSetupResponse {
            success: failure.is_none(),
            steps,
            summary,
            config: self.get_config(tenant).await.ok(),
        }
    }

    /// Where this tenant's units of work currently land, and whether that
    /// store answers.
    pub async fn test_routing(&self, tenant: &TenantId) -> Result<RoutingTestResponse, CloudError> {
        let uow = UnitOfWork::for_tenant(tenant.clone());
        let routed = self.factory.open_for(&uow).await?;
        let is_private = routed.target == StoreTarget::Private;

        let can_connect = matches!(
            tokio::time::timeout(self.tester.timeout(), routed.store.ping()).await,
            Ok(Ok(()))
        );
        let statistics = if can_connect {
            TenantRepository::new(routed.store.clone())
                .tenant_statistics(tenant)
                .await
                .ok()
        } else {
            None
        };

        let message = match (is_private, can_connect) {
            (true, true) => "Routing to private cloud database",
            (true, false) => "Private cloud database is not reachable",
            (false, true) => "Routing to main database",
            (false, false) => "Main database is not reachable",
        };
        Ok(RoutingTestResponse {
            is_private,
            can_connect,
            database: routed.target.label(),
            statistics,
            message: message.to_string(),
        })
    }

    pub async fn migrate_primary_tables(
        &self,
        tenant: &TenantId,
    ) -> Result<PrimaryMigrationResponse, CloudError> {
        self.require_private_cloud(tenant).await?;
        Ok(self.engine.migrate_primary(tenant).await?.into())
    }

    pub async fn migrate_all_tables(
        &self,
        tenant: &TenantId,
    ) -> Result<FullMigrationResponse, CloudError> {
        self.require_private_cloud(tenant).await?;
        Ok(self.engine.migrate_all(tenant).await?.into())
    }

    pub async fn get_config(&self, tenant: &TenantId) -> Result<PrivateStoreConfigView, CloudError> {
        let config = self.registry.require_private_config(tenant).await?;
        Ok(config.view(&self.secrets))
    }

    /// Soft delete; rows already in the private store stay there.
    pub async fn delete_config(&self, tenant: &TenantId) -> Result<DeleteResponse, CloudError> {
        if !self.registry.soft_delete_private_config(tenant).await? {
            return Err(CloudError::NotConfigured(tenant.to_string()));
        }
        self.factory.forget(tenant).await;
        Ok(DeleteResponse {
            success: true,
            message: "Private cloud configuration removed; requests route to the main database"
                .to_string(),
        })
    }

    pub fn list_required_tables(&self) -> Vec<&'static str> {
        SchemaProvisioner::list_required_tables()
    }

    /// Tenant audit reports from whichever store the unit of work routes to.
    pub async fn list_audit_reports(
        &self,
        uow: &UnitOfWork,
        limit: i64,
    ) -> Result<AuditReportsResponse, CloudError> {
        let tenant = uow.caller().require_tenant()?;
        let routed = self.factory.open_for(uow).await?;
        let reports = TenantRepository::new(routed.store)
            .list_audit_reports(tenant, limit)
            .await?;
        Ok(AuditReportsResponse {
            database: routed.target.label(),
            reports,
        })
    }
}

/// Strip the tenant's credentials from a schema error raised against its store.
fn redact_schema_error(descriptor: &ConnectionDescriptor, err: CloudError) -> CloudError {
    match err {
        CloudError::Schema(m) => CloudError::Schema(descriptor.redact(&m)),
        other => other,
    }
}
