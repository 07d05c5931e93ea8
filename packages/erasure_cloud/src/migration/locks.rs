use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use erasure_auth::TenantId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per tenant; migrations for the same tenant queue up.
#[derive(Clone, Default)]
pub struct TenantLocks {
    inner: Arc<Mutex<HashMap<TenantId, Arc<AsyncMutex<()>>>>>,
}

impl TenantLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, tenant: &TenantId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(tenant.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    pub fn is_locked(&self, tenant: &TenantId) -> bool {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(tenant).is_some_and(|lock| lock.try_lock().is_err())
    }
}
