//! Per-unit-of-work routing between the shared store and tenant stores.
//!
//! A [`UnitOfWork`] is created for each inbound request and dropped with it.
//! The routing decision is made at most once per unit of work and lives in
//! it, so two requests never share a decision or a handle.

use std::collections::HashMap;
use std::fmt;

use axum::http::request::Parts;
use erasure_auth::{Caller, Feature, TenantId};
use serde::Serialize;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::CloudError;
use crate::repository::{PrivateCloudStatus, TenantRepository};
use crate::secrets::SecretBox;
use crate::store::{ConnectionDescriptor, Store};

/// Header carrying the caller identity resolved by the upstream gateway.
pub const TENANT_HEADER: &str = "x-tenant-id";

#[derive(Clone)]
pub enum RoutingMode {
    Shared,
    Private { descriptor: ConnectionDescriptor },
}

impl RoutingMode {
    pub fn is_private(&self) -> bool {
        matches!(self, Self::Private { .. })
    }
}

impl fmt::Debug for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => f.write_str("Shared"),
            Self::Private { descriptor } => f
                .debug_struct("Private")
                .field("target", &descriptor.masked())
                .finish(),
        }
    }
}

/// The database activity belonging to one inbound operation.
pub struct UnitOfWork {
    id: Uuid,
    caller: Caller,
    mode: OnceCell<RoutingMode>,
}

impl UnitOfWork {
    pub fn new(caller: Caller) -> Self {
        Self {
            id: Uuid::new_v4(),
            caller,
            mode: OnceCell::new(),
        }
    }

    pub fn for_tenant(tenant: TenantId) -> Self {
        Self::new(Caller::Tenant(tenant))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn caller(&self) -> &Caller {
        &self.caller
    }

    /// The cached decision, if one has been made.
    #[cfg(test)]
    pub fn routing_mode(&self) -> Option<&RoutingMode> {
        self.mode.get()
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("caller", &self.caller)
            .field("mode", &self.mode.get())
            .finish()
    }
}

/// Caller from `x-tenant-id`; absent means anonymous.
impl<S> axum::extract::FromRequestParts<S> for UnitOfWork
where
    S: Send + Sync,
{
    type Rejection = CloudError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let caller = match parts.headers.get(TENANT_HEADER) {
            None => Caller::Anonymous,
            Some(value) => {
                let raw = value.to_str().map_err(|_| {
                    erasure_auth::AuthError::InvalidTenantId("not valid UTF-8".into())
                })?;
                Caller::Tenant(TenantId::parse(raw)?)
            }
        };
        Ok(Self::new(caller))
    }
}

/// Answers "does this caller route privately" from the registry.
#[derive(Clone, Debug)]
pub struct TenantContextResolver {
    registry: TenantRepository,
    secrets: SecretBox,
}

impl TenantContextResolver {
    pub fn new(registry: TenantRepository, secrets: SecretBox) -> Self {
        Self { registry, secrets }
    }

    /// Resolve once per unit of work; later calls return the cached mode.
    pub async fn resolve<'u>(&self, uow: &'u UnitOfWork) -> Result<&'u RoutingMode, CloudError> {
        uow.mode.get_or_try_init(|| self.lookup(&uow.caller)).await
    }

    async fn lookup(&self, caller: &Caller) -> Result<RoutingMode, CloudError> {
        let Some(tenant) = caller.tenant() else {
            return Ok(RoutingMode::Shared);
        };

        let features = match self.registry.tenant_features(tenant).await {
            Ok(features) => features,
            Err(CloudError::TenantNotFound(_)) => return Ok(RoutingMode::Shared),
            Err(e) => return Err(e),
        };
        if !features.contains(Feature::PrivateCloud) {
            return Ok(RoutingMode::Shared);
        }

        let Some(config) = self.registry.get_private_config(tenant).await? else {
            return Ok(RoutingMode::Shared);
        };
        if config.status < PrivateCloudStatus::RoutingActive {
            debug!("{} has private config at {}, routing shared", tenant, config.status);
            return Ok(RoutingMode::Shared);
        }

        let descriptor = config.decrypt_descriptor(&self.secrets)?;
        debug!("{} routes to {}", tenant, descriptor.masked());
        Ok(RoutingMode::Private { descriptor })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreTarget {
    Shared,
    Private,
}

impl StoreTarget {
    /// Label shown to callers.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Shared => "Main Database",
            Self::Private => "Private Cloud",
        }
    }
}

/// A store handle bound to one unit of work.
#[derive(Debug)]
pub struct RoutedStore {
    pub tenant: Option<TenantId>,
    pub target: StoreTarget,
    pub store: Store,
}

struct CachedPool {
    fingerprint: String,
    store: Store,
}

/// Hands out the right store for a unit of work.
///
/// Private pools are built lazily and kept per tenant, keyed by descriptor
/// fingerprint: a replaced descriptor gets a fresh pool.
pub struct StoreFactory {
    shared: Store,
    resolver: TenantContextResolver,
    pools: RwLock<HashMap<TenantId, CachedPool>>,
    pool_max_connections: u32,
    acquire_timeout: std::time::Duration,
}

impl StoreFactory {
    pub fn new(
        shared: Store,
        resolver: TenantContextResolver,
        pool_max_connections: u32,
        acquire_timeout: std::time::Duration,
    ) -> Self {
        Self {
            shared,
            resolver,
            pools: RwLock::new(HashMap::new()),
            pool_max_connections,
            acquire_timeout,
        }
    }

    pub fn shared(&self) -> &Store {
        &self.shared
    }

    pub async fn open_for(&self, uow: &UnitOfWork) -> Result<RoutedStore, CloudError> {
        let tenant = uow.caller().tenant().cloned();
        let mode = self.resolver.resolve(uow).await?;
        debug!("Unit of work {} routes {:?}", uow.id(), mode);
        match mode {
            RoutingMode::Shared => Ok(RoutedStore {
                tenant,
                target: StoreTarget::Shared,
                store: self.shared.clone(),
            }),
            RoutingMode::Private { descriptor } => {
                // Private routing is only ever resolved for a tenant caller
                let tenant = uow.caller().require_tenant()?.clone();
                let store = self.private_store(&tenant, descriptor).await?;
                Ok(RoutedStore {
                    tenant: Some(tenant),
                    target: StoreTarget::Private,
                    store,
                })
            }
        }
    }

    /// The tenant's private pool for `descriptor`, creating it on first use.
    pub async fn private_store(
        &self,
        tenant: &TenantId,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Store, CloudError> {
        let fingerprint = descriptor.fingerprint();
        {
            let pools = self.pools.read().await;
            if let Some(cached) = pools.get(tenant) {
                if cached.fingerprint == fingerprint {
                    return Ok(cached.store.clone());
                }
            }
        }

        let url = descriptor.to_url()?;
        let store = Store::connect_lazy(
            descriptor.kind,
            &url,
            self.pool_max_connections,
            self.acquire_timeout,
        )
        .map_err(|e| CloudError::Connectivity(descriptor.redact(&e.to_string())))?;

        let mut pools = self.pools.write().await;
        if let Some(cached) = pools.get(tenant) {
            if cached.fingerprint == fingerprint {
                return Ok(cached.store.clone());
            }
        }
        info!(
            "Opening private pool for {} ({})",
            tenant,
            &fingerprint[..12]
        );
        let replaced = pools.insert(
            tenant.clone(),
            CachedPool {
                fingerprint,
                store: store.clone(),
            },
        );
        drop(pools);
        if let Some(old) = replaced {
            old.store.close().await;
        }
        Ok(store)
    }

    /// Drop the tenant's cached pool after its config changed or was removed.
    pub async fn forget(&self, tenant: &TenantId) {
        let removed = self.pools.write().await.remove(tenant);
        if let Some(cached) = removed {
            debug!("Closing private pool for {}", tenant);
            cached.store.close().await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn cached_pools(&self) -> usize {
        self.pools.read().await.len()
    }
}
