//! Error types and stable error codes.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("invalid tenant id: {0}")]
    InvalidTenantId(String),

    #[error("feature not enabled: {feature}")]
    FeatureNotEnabled { feature: String },

    #[error("authentication required")]
    Unauthenticated,
}

impl AuthError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::InvalidTenantId(_) => "invalid_tenant_id",
            Self::FeatureNotEnabled { .. } => "feature_not_enabled",
            Self::Unauthenticated => "unauthenticated",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(
            AuthError::InvalidTenantId("x".into()).error_code(),
            "invalid_tenant_id"
        );
        assert_eq!(
            AuthError::FeatureNotEnabled {
                feature: "private_cloud".into()
            }
            .error_code(),
            "feature_not_enabled"
        );
        assert_eq!(AuthError::Unauthenticated.error_code(), "unauthenticated");
    }

    #[test]
    fn display_includes_feature() {
        let err = AuthError::FeatureNotEnabled {
            feature: "private_cloud".into(),
        };
        assert_eq!(err.to_string(), "feature not enabled: private_cloud");
    }
}
