use std::collections::BTreeMap;

use axum::{
    Json,
    extract::State,
    response::IntoResponse,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::CloudError;
use crate::handlers::{JsonBody, QueryParams};
use crate::routing::UnitOfWork;
use crate::service::{
    ActivationResponse, AuditReportsResponse, CompleteSetupResponse, DeleteResponse,
    FullMigrationResponse, PrimaryMigrationResponse, RoutingTestResponse, SchemaResponse,
    SetupResponse,
};
use crate::repository::PrivateStoreConfigView;
use crate::store::{ConnectionDescriptor, StoreKind};
use crate::tester::ConnectionTestResult;

/// Structured connection fields. Not `Debug`: it carries the password.
#[derive(Deserialize)]
pub struct SetupRequest {
    pub database_type: StoreKind,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub database: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub selected_tables: Vec<String>,
}

impl SetupRequest {
    fn descriptor(&self) -> ConnectionDescriptor {
        ConnectionDescriptor {
            kind: self.database_type,
            host: self.host.trim().to_string(),
            port: self.port,
            database: self.database.trim().to_string(),
            username: self.username.clone(),
            password: self.password.clone(),
            options: self.options.clone(),
        }
    }
}

#[derive(Deserialize)]
pub struct ConnectionStringRequest {
    pub connection_string: String,
    #[serde(default)]
    pub database_type: Option<StoreKind>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub selected_tables: Vec<String>,
}

#[derive(Deserialize)]
pub struct AuditReportsQuery {
    pub limit: Option<i64>,
}

pub async fn setup(
    State(state): State<AppState>,
    uow: UnitOfWork,
    JsonBody(req): JsonBody<SetupRequest>,
) -> Result<Json<SetupResponse>, CloudError> {
    let tenant = uow.caller().require_tenant()?;
    let response = state
        .service
        .setup(
            tenant,
            req.descriptor(),
            req.notes.as_deref(),
            &req.selected_tables,
        )
        .await?;
    Ok(Json(response))
}

pub async fn setup_from_connection_string(
    State(state): State<AppState>,
    uow: UnitOfWork,
    JsonBody(req): JsonBody<ConnectionStringRequest>,
) -> Result<Json<SetupResponse>, CloudError> {
    let tenant = uow.caller().require_tenant()?;
    let response = state
        .service
        .setup_from_connection_string(
            tenant,
            &req.connection_string,
            req.database_type,
            req.notes.as_deref(),
            &req.selected_tables,
        )
        .await?;
    Ok(Json(response))
}

pub async fn test_connection(
    State(state): State<AppState>,
    uow: UnitOfWork,
) -> Result<Json<ConnectionTestResult>, CloudError> {
    let tenant = uow.caller().require_tenant()?;
    Ok(Json(state.service.test_connection(tenant).await?))
}

pub async fn initialize_schema(
    State(state): State<AppState>,
    uow: UnitOfWork,
) -> Result<Json<SchemaResponse>, CloudError> {
    let tenant = uow.caller().require_tenant()?;
    Ok(Json(state.service.initialize_schema(tenant).await?))
}

pub async fn activate_routing(
    State(state): State<AppState>,
    uow: UnitOfWork,
) -> Result<Json<ActivationResponse>, CloudError> {
    let tenant = uow.caller().require_tenant()?;
    Ok(Json(state.service.activate_routing(tenant).await?))
}

pub async fn complete_setup(
    State(state): State<AppState>,
    uow: UnitOfWork,
    JsonBody(req): JsonBody<SetupRequest>,
) -> Result<Json<CompleteSetupResponse>, CloudError> {
    let tenant = uow.caller().require_tenant()?;
    let response = state
        .service
        .complete_setup(
            tenant,
            req.descriptor(),
            req.notes.as_deref(),
            &req.selected_tables,
        )
        .await;
    Ok(Json(response))
}

pub async fn test_routing(
    State(state): State<AppState>,
    uow: UnitOfWork,
) -> Result<Json<RoutingTestResponse>, CloudError> {
    let tenant = uow.caller().require_tenant()?;
    Ok(Json(state.service.test_routing(tenant).await?))
}

pub async fn migrate_primary_tables(
    State(state): State<AppState>,
    uow: UnitOfWork,
) -> Result<Json<PrimaryMigrationResponse>, CloudError> {
    let tenant = uow.caller().require_tenant()?;
    Ok(Json(state.service.migrate_primary_tables(tenant).await?))
}

pub async fn migrate_all_tables(
    State(state): State<AppState>,
    uow: UnitOfWork,
) -> Result<Json<FullMigrationResponse>, CloudError> {
    let tenant = uow.caller().require_tenant()?;
    Ok(Json(state.service.migrate_all_tables(tenant).await?))
}

pub async fn get_config(
    State(state): State<AppState>,
    uow: UnitOfWork,
) -> Result<Json<PrivateStoreConfigView>, CloudError> {
    let tenant = uow.caller().require_tenant()?;
    Ok(Json(state.service.get_config(tenant).await?))
}

pub async fn delete_config(
    State(state): State<AppState>,
    uow: UnitOfWork,
) -> Result<Json<DeleteResponse>, CloudError> {
    let tenant = uow.caller().require_tenant()?;
    Ok(Json(state.service.delete_config(tenant).await?))
}

pub async fn list_required_tables(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "tables": state.service.list_required_tables(),
    }))
}

pub async fn list_audit_reports(
    State(state): State<AppState>,
    uow: UnitOfWork,
    QueryParams(query): QueryParams<AuditReportsQuery>,
) -> Result<Json<AuditReportsResponse>, CloudError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    Ok(Json(state.service.list_audit_reports(&uow, limit).await?))
}
