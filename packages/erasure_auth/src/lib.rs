//! Tenant identity and feature capability primitives for the erasure cloud backend.

pub mod error;
pub mod feature;
pub mod identity;

pub use error::AuthError;
pub use feature::{Feature, FeatureSet};
pub use identity::{Caller, TenantId};
