//! Error taxonomy for private-cloud operations.
//!
//! Row-level migration failures are not errors: they are counted in the
//! migration report. Everything here aborts the operation it came from.

use std::time::Duration;

use axum::{
    Json,
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use erasure_auth::AuthError;
use tracing::error;

use crate::repository::PrivateCloudStatus;

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    // Configuration
    #[error("tenant not found: {0}")]
    TenantNotFound(String),

    #[error("no private cloud database is configured for {0}")]
    NotConfigured(String),

    #[error("invalid connection descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("private cloud setup is {actual}, requires {required}")]
    InvalidState {
        required: PrivateCloudStatus,
        actual: PrivateCloudStatus,
    },

    // Connectivity / schema
    #[error("cannot reach private database: {0}")]
    Connectivity(String),

    #[error("schema provisioning failed: {0}")]
    Schema(String),

    // Migration
    #[error("migration aborted before any write: {0}")]
    FatalMigration(String),

    #[error("migration did not finish within {}s", .0.as_secs())]
    MigrationTimeout(Duration),

    #[error("stored connection secret could not be decrypted")]
    Crypto,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("database error: {0}")]
    Store(#[from] sqlx::Error),
}

impl CloudError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::TenantNotFound(_) => "tenant_not_found",
            Self::NotConfigured(_) => "not_configured",
            Self::InvalidDescriptor(_) => "invalid_descriptor",
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidState { .. } => "invalid_state",
            Self::Connectivity(_) => "connectivity_error",
            Self::Schema(_) => "schema_error",
            Self::FatalMigration(_) => "fatal_migration_error",
            Self::MigrationTimeout(_) => "migration_timeout",
            Self::Crypto => "crypto_error",
            Self::Auth(e) => e.error_code(),
            Self::Store(_) => "database_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::TenantNotFound(_) | Self::NotConfigured(_) => StatusCode::NOT_FOUND,
            Self::InvalidDescriptor(_) | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::InvalidState { .. } => StatusCode::CONFLICT,
            Self::Connectivity(_) | Self::FatalMigration(_) => StatusCode::BAD_GATEWAY,
            Self::MigrationTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Schema(_) | Self::Crypto | Self::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Auth(AuthError::Unauthenticated) => StatusCode::UNAUTHORIZED,
            Self::Auth(AuthError::FeatureNotEnabled { .. }) => StatusCode::FORBIDDEN,
            Self::Auth(AuthError::InvalidTenantId(_)) => StatusCode::BAD_REQUEST,
        }
    }

    /// Text safe to hand to a caller. Driver errors stay in the log.
    pub fn public_message(&self) -> String {
        match self {
            Self::Store(_) => "internal database error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<JsonRejection> for CloudError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for CloudError {
    fn from(rejection: QueryRejection) -> Self {
        Self::InvalidRequest(rejection.body_text())
    }
}

impl IntoResponse for CloudError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("{}", self);
        }
        let body = serde_json::json!({
            "success": false,
            "message": self.public_message(),
            "error": self.error_code(),
        });
        (status, Json(body)).into_response()
    }
}
