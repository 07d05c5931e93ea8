// Repository layer: each domain lives in its own file with `impl TenantRepository`.
//
// A repository is bound to one store. The registry and feature flags are only
// ever read through the shared store; tenant data reads go through whichever
// store the routing layer handed out for the unit of work.

use crate::store::Store;

mod private_cloud;
mod tenants;

pub use private_cloud::{PrivateCloudStatus, PrivateStoreConfigView};
pub use tenants::{AuditReportSummary, TenantStatistics};

#[derive(Clone, Debug)]
pub struct TenantRepository {
    pub(crate) store: Store,
}

impl TenantRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

/// Seconds since the epoch, the unit every timestamp column uses.
pub(crate) fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
