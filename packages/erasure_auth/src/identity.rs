//! Tenant identity as supplied by the upstream identity collaborator.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::AuthError;

/// A primary account, keyed by its normalized email address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub fn parse(raw: &str) -> Result<Self, AuthError> {
        let email = raw.trim().to_ascii_lowercase();
        if email.is_empty() {
            return Err(AuthError::InvalidTenantId("empty".into()));
        }
        if email.chars().any(char::is_whitespace) {
            return Err(AuthError::InvalidTenantId(format!(
                "contains whitespace: {email}"
            )));
        }
        let Some((local, domain)) = email.split_once('@') else {
            return Err(AuthError::InvalidTenantId(format!("missing '@': {email}")));
        };
        if local.is_empty() || domain.is_empty() || domain.contains('@') {
            return Err(AuthError::InvalidTenantId(format!("malformed: {email}")));
        }
        Ok(Self(email))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TenantId {
    type Error = AuthError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

/// Who originated a unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    Tenant(TenantId),
    /// No identity was presented.
    Anonymous,
    /// Internal jobs and CLI maintenance commands.
    System,
}

impl Caller {
    pub fn tenant(&self) -> Option<&TenantId> {
        match self {
            Self::Tenant(id) => Some(id),
            Self::Anonymous | Self::System => None,
        }
    }

    pub fn require_tenant(&self) -> Result<&TenantId, AuthError> {
        self.tenant().ok_or(AuthError::Unauthenticated)
    }
}
