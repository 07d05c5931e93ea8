use std::sync::Arc;
use std::time::Duration;

use erasure_auth::TenantId;
use tempfile::TempDir;

use crate::AppState;
use crate::config::{ErasureCloudConfig, PrivateCloudConfig};
use crate::db::Database;
use crate::migration::{MigrationEngine, MigrationSettings};
use crate::repository::{PrivateCloudStatus, TenantRepository};
use crate::routing::{StoreFactory, TenantContextResolver};
use crate::schema::SchemaProvisioner;
use crate::secrets::SecretBox;
use crate::service::PrivateCloudService;
use crate::store::{ConnectionDescriptor, Store, StoreKind};
use crate::tester::ConnectionTester;

/// A fresh in-memory shared store with all migrations applied (~1ms).
pub async fn test_shared_store() -> Store {
    let store = Store::connect(
        StoreKind::Sqlite,
        "sqlite::memory:",
        1,
        Duration::from_secs(5),
    )
    .await
    .expect("in-memory sqlite");
    crate::db::run_migrations(&store).await.expect("migrations");
    store
}

pub async fn test_repository() -> TenantRepository {
    TenantRepository::new(test_shared_store().await)
}

pub fn test_secrets() -> SecretBox {
    SecretBox::from_config_key("test-only encryption key").expect("secret box")
}

/// An empty file-backed SQLite store standing in for a tenant database.
/// Hold the `TempDir` for the lifetime of the test.
pub async fn private_store() -> (Store, TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let url = private_descriptor(&tmp).to_url().expect("url");
    let store = Store::connect(StoreKind::Sqlite, &url, 2, Duration::from_secs(5))
        .await
        .expect("private sqlite");
    (store, tmp)
}

pub fn private_descriptor(tmp: &TempDir) -> ConnectionDescriptor {
    ConnectionDescriptor::sqlite(tmp.path().join("private.db").display().to_string())
}

pub async fn exec(store: &Store, sql: &str) {
    sqlx::query(sql)
        .execute(store.pool())
        .await
        .unwrap_or_else(|e| panic!("{sql}: {e}"));
}

pub async fn count(store: &Store, sql: &str) -> i64 {
    sqlx::query_scalar(sql)
        .fetch_one(store.pool())
        .await
        .unwrap_or_else(|e| panic!("{sql}: {e}"))
}

pub async fn seed_user(store: &Store, email: &str, private_cloud: bool) -> i64 {
    sqlx::query("INSERT INTO users (user_email, user_name, is_private_cloud, created_at) VALUES (?, ?, ?, 0)")
        .bind(email)
        .bind(email.split('@').next().unwrap_or_default())
        .bind(i64::from(private_cloud))
        .execute(store.pool())
        .await
        .expect("seed user");
    sqlx::query_scalar("SELECT id FROM users WHERE user_email = ?")
        .bind(email)
        .fetch_one(store.pool())
        .await
        .expect("seeded user id")
}

/// Ids of the scenario rows owned by `a@x.com`.
#[derive(Debug)]
pub struct Seeded {
    pub tenant_user_id: i64,
    pub subuser_ids: Vec<i64>,
}

/// Tenant `a@x.com` (private cloud enabled) owns 3 audit reports and 2
/// sub-identities with one machine each; `b@y.com` owns a smaller set.
/// Reference data: 5 roles, 3 permissions, 4 role links, 2 routes.
/// `a@x.com` has no role assignment of its own.
pub async fn seed_scenario(store: &Store) -> Seeded {
    for sql in [
        "INSERT INTO roles (id, role_name, description, hierarchy_level) VALUES \
            (1, 'Admin', 'Full access', 100), (2, 'Manager', NULL, 50), \
            (3, 'User', 'Default role', 10), (4, 'Auditor', NULL, 20), (5, 'Viewer', NULL, 1)",
        "INSERT INTO permissions (id, permission_name) VALUES \
            (1, 'reports.read'), (2, 'reports.write'), (3, 'machines.manage')",
        "INSERT INTO role_permissions (id, role_id, permission_id) VALUES \
            (1, 1, 1), (2, 1, 2), (3, 1, 3), (4, 3, 1)",
        "INSERT INTO routes (id, route_path, http_method, required_permission) VALUES \
            (1, '/api/audit-reports', 'GET', 'reports.read'), \
            (2, '/api/machines', 'POST', 'machines.manage')",
        "INSERT INTO users (id, user_email, user_name, is_private_cloud, created_at) VALUES \
            (1, 'a@x.com', 'Tenant A', 1, 1700000000), \
            (2, 'b@y.com', 'Tenant B', 0, 1700000000)",
        "INSERT INTO subusers (id, subuser_email, user_email, subuser_name) VALUES \
            (1, 's1@x.com', 'a@x.com', 'Sub One'), \
            (2, 's2@x.com', 'a@x.com', 'Sub Two'), \
            (3, 's3@y.com', 'b@y.com', 'Sub Three')",
        "INSERT INTO audit_reports (id, client_email, report_name, erasure_method, report_details_json, created_at) VALUES \
            (1, 'a@x.com', 'Laptop wipe', 'NIST 800-88', '{\"passes\":1}', 1700000001), \
            (2, 'a@x.com', 'Server wipe', 'DoD 5220.22-M', NULL, 1700000002), \
            (3, 'a@x.com', 'USB wipe', 'Zero fill', NULL, 1700000003), \
            (4, 'b@y.com', 'Desktop wipe', 'Zero fill', NULL, 1700000004)",
        "INSERT INTO machines (id, fingerprint_hash, user_email, subuser_email, os_version) VALUES \
            (1, 'fp-s1', NULL, 's1@x.com', 'Windows 11'), \
            (2, 'fp-s2', NULL, 's2@x.com', 'Ubuntu 24.04'), \
            (3, 'fp-b', 'b@y.com', NULL, 'macOS 15')",
        "INSERT INTO sessions (id, user_email, ip_address, session_status) VALUES \
            (1, 'a@x.com', '10.0.0.1', 'active'), (2, 'b@y.com', '10.0.0.2', 'active')",
        "INSERT INTO commands (id, user_email, command_text, command_status) VALUES \
            (1, 'a@x.com', 'wipe --all', 'done'), (2, 'b@y.com', 'wipe /dev/sdb', 'pending')",
        "INSERT INTO logs (id, user_email, log_level, log_message) VALUES \
            (1, 'a@x.com', 'info', 'login'), (2, 's1@x.com', 'info', 'wipe started'), \
            (3, 'b@y.com', 'warn', 'license expiring')",
        "INSERT INTO user_roles (id, user_id, role_id, assigned_by) VALUES (1, 2, 3, 'admin')",
        "INSERT INTO subuser_roles (id, subuser_id, role_id, assigned_by) VALUES \
            (1, 1, 5, 'a@x.com'), (2, 3, 5, 'b@y.com')",
    ] {
        exec(store, sql).await;
    }
    Seeded {
        tenant_user_id: 1,
        subuser_ids: vec![1, 2],
    }
}

/// Shared store, registry, routing and a provisioned-on-demand private
/// SQLite store wired together.
pub struct TestEnv {
    pub shared: Store,
    pub registry: TenantRepository,
    pub secrets: SecretBox,
    pub resolver: TenantContextResolver,
    pub factory: Arc<StoreFactory>,
    /// Direct handle on the private database for assertions.
    pub private: Store,
    pub private_descriptor: ConnectionDescriptor,
    _private_dir: TempDir,
}

impl TestEnv {
    pub async fn new() -> Self {
        let shared = test_shared_store().await;
        let secrets = test_secrets();
        let registry = TenantRepository::new(shared.clone());
        let resolver = TenantContextResolver::new(registry.clone(), secrets.clone());
        let factory = Arc::new(StoreFactory::new(
            shared.clone(),
            resolver.clone(),
            2,
            Duration::from_secs(5),
        ));
        let (private, dir) = private_store().await;
        let private_descriptor = private_descriptor(&dir);
        Self {
            shared,
            registry,
            secrets,
            resolver,
            factory,
            private,
            private_descriptor,
            _private_dir: dir,
        }
    }

    pub fn tester(&self) -> ConnectionTester {
        ConnectionTester::new(Duration::from_secs(5))
    }

    /// Register the private store for `tenant` and walk the lifecycle up to
    /// `status`, provisioning the schema from `SchemaReady` on.
    pub async fn configure_private(&self, tenant: &TenantId, status: PrivateCloudStatus) {
        self.registry
            .upsert_private_config(tenant, &self.private_descriptor, None, &[], &self.secrets)
            .await
            .expect("upsert config");
        if status >= PrivateCloudStatus::SchemaReady {
            SchemaProvisioner::ensure_schema(&self.private)
                .await
                .expect("private schema");
        }
        for step in [
            PrivateCloudStatus::ConnectionVerified,
            PrivateCloudStatus::SchemaReady,
            PrivateCloudStatus::RoutingActive,
        ] {
            if step > status {
                break;
            }
            self.registry
                .set_private_status(tenant, step, None)
                .await
                .expect("set status");
        }
    }

    pub fn engine(&self, settings: MigrationSettings) -> MigrationEngine {
        MigrationEngine::new(
            self.factory.clone(),
            self.tester(),
            self.secrets.clone(),
            settings,
        )
    }

    pub fn service(&self) -> PrivateCloudService {
        PrivateCloudService::new(
            self.factory.clone(),
            self.tester(),
            self.secrets.clone(),
            MigrationSettings::default(),
        )
    }
}

/// A fully-wired `AppState` over an in-memory shared store.
///
/// Returns `(AppState, TempDir)`; hold the `TempDir` for the lifetime of the
/// test. The private descriptor for setup calls is `private_descriptor(&tmp)`.
pub async fn test_app_state() -> (AppState, TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = ErasureCloudConfig::new(Some(tmp.path().to_path_buf())).expect("config");
    let store = test_shared_store().await;
    let secrets = test_secrets();
    let pc = PrivateCloudConfig::default();

    let registry = TenantRepository::new(store.clone());
    let resolver = TenantContextResolver::new(registry, secrets.clone());
    let factory = Arc::new(StoreFactory::new(
        store.clone(),
        resolver,
        pc.pool_max_connections,
        pc.connect_timeout,
    ));
    let service = Arc::new(PrivateCloudService::new(
        factory.clone(),
        ConnectionTester::new(pc.connect_timeout),
        secrets,
        MigrationSettings::from_config(&pc),
    ));

    let state = AppState {
        config: Arc::new(config),
        db: Arc::new(Database { store }),
        service,
    };
    (state, tmp)
}
