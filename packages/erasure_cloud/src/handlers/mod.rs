pub mod health;
pub mod private_cloud;

use axum::{
    Router,
    extract::{FromRequest, FromRequestParts},
    routing::{get, post},
};

use crate::AppState;
use crate::error::CloudError;

pub use health::{health_live_handler, health_ready_handler};
pub use private_cloud::{
    activate_routing, complete_setup, delete_config, get_config, initialize_schema,
    list_audit_reports, list_required_tables, migrate_all_tables, migrate_primary_tables, setup,
    setup_from_connection_string, test_connection, test_routing,
};

/// JSON body whose rejections render as `invalid_request`.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(CloudError))]
pub struct JsonBody<T>(pub T);

/// Query string whose rejections render as `invalid_request`.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(CloudError))]
pub struct QueryParams<T>(pub T);

/// Every HTTP route, without middleware.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health/live", get(health_live_handler))
        .route("/health/ready", get(health_ready_handler))
        .route("/api/private-cloud/setup", post(setup))
        .route(
            "/api/private-cloud/setup/connection-string",
            post(setup_from_connection_string),
        )
        .route("/api/private-cloud/test", post(test_connection))
        .route("/api/private-cloud/schema", post(initialize_schema))
        .route("/api/private-cloud/activate", post(activate_routing))
        .route("/api/private-cloud/complete-setup", post(complete_setup))
        .route("/api/private-cloud/routing", get(test_routing))
        .route("/api/private-cloud/migrate/primary", post(migrate_primary_tables))
        .route("/api/private-cloud/migrate/all", post(migrate_all_tables))
        .route(
            "/api/private-cloud/config",
            get(get_config).delete(delete_config),
        )
        .route("/api/private-cloud/tables", get(list_required_tables))
        .route("/api/audit-reports", get(list_audit_reports))
}
