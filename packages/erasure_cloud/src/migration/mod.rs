//! Migration Engine: copy a tenant's rows from the shared store into its
//! private store.
//!
//! Kinds are copied one at a time in [`EntityKind::ALL`] order. Within a kind
//! every new row is inserted under its own savepoint, and the enclosing
//! transaction commits every `batch_size` inserted rows. A failing row is
//! rolled back alone and counted; only the preflight can abort a run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use erasure_auth::TenantId;
use sqlx::any::AnyRow;
use sqlx::{Acquire, Row};
use tracing::{debug, info, warn};

mod locks;
mod report;

pub use locks::TenantLocks;
pub use report::{KindReport, MigrationReport, MigrationScope};

use crate::config::PrivateCloudConfig;
use crate::error::CloudError;
use crate::repository::{PrivateCloudStatus, TenantRepository, now_ts};
use crate::routing::StoreFactory;
use crate::schema::catalog::TableDef;
use crate::schema::{EntityClass, EntityKind, Ownership, PRIMARY_KINDS, SchemaProvisioner};
use crate::secrets::SecretBox;
use crate::store::{ColumnType, ConnectionDescriptor, SqlValue, Store, StoreKind, placeholder_list};
use crate::tester::ConnectionTester;

#[derive(Debug, Clone)]
pub struct MigrationSettings {
    /// Newly inserted rows per commit.
    pub batch_size: usize,
    /// Role granted to a tenant that arrives without one.
    pub default_role: String,
    /// Bound on a whole invocation, including waiting for the tenant lock.
    pub timeout: Duration,
}

impl MigrationSettings {
    pub fn from_config(config: &PrivateCloudConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            default_role: config.default_role.clone(),
            timeout: config.migration_timeout,
        }
    }
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self::from_config(&PrivateCloudConfig::default())
    }
}

/// Who the migrating tenant is in the shared store.
#[derive(Debug, Clone)]
struct OwnerSet {
    tenant: TenantId,
    user_id: Option<i64>,
    subuser_ids: Vec<i64>,
    /// The tenant's email followed by its sub-identities' emails.
    emails: Vec<String>,
}

enum SourceFilter {
    All,
    /// The owner set cannot match any row.
    Empty,
    Where(String, Vec<(SqlValue, ColumnType)>),
}

fn source_filter(ownership: Ownership, owners: &OwnerSet) -> SourceFilter {
    let emails = || -> Vec<(SqlValue, ColumnType)> {
        owners
            .emails
            .iter()
            .map(|e| (SqlValue::Text(e.clone()), ColumnType::Text))
            .collect()
    };
    match ownership {
        Ownership::Unfiltered => SourceFilter::All,
        Ownership::TenantEmail(column) => SourceFilter::Where(
            format!("{column} = ?"),
            vec![(SqlValue::Text(owners.tenant.to_string()), ColumnType::Text)],
        ),
        Ownership::OwnerEmails(columns) => {
            let list = placeholder_list(owners.emails.len());
            let clause = columns
                .iter()
                .map(|c| format!("{c} IN ({list})"))
                .collect::<Vec<_>>()
                .join(" OR ");
            let binds = columns.iter().flat_map(|_| emails()).collect();
            SourceFilter::Where(clause, binds)
        }
        Ownership::TenantUserId(column) => match owners.user_id {
            Some(id) => SourceFilter::Where(
                format!("{column} = ?"),
                vec![(SqlValue::Int(id), ColumnType::Int)],
            ),
            None => SourceFilter::Empty,
        },
        Ownership::SubuserIds(column) => {
            if owners.subuser_ids.is_empty() {
                return SourceFilter::Empty;
            }
            let binds = owners
                .subuser_ids
                .iter()
                .map(|id| (SqlValue::Int(*id), ColumnType::Int))
                .collect();
            SourceFilter::Where(
                format!("{column} IN ({})", placeholder_list(owners.subuser_ids.len())),
                binds,
            )
        }
    }
}

/// Reference tables a link row may point at, with their natural-key column.
fn reference_name_column(table: &str) -> Option<&'static str> {
    match table {
        "roles" => Some("role_name"),
        "permissions" => Some("permission_name"),
        _ => None,
    }
}

fn insert_sql(table: &TableDef, kind: StoreKind) -> String {
    let placeholders = table
        .columns
        .iter()
        .map(|c| match c.ty {
            ColumnType::Int => "?",
            ColumnType::Text | ColumnType::Body => kind.text_placeholder(),
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table.name,
        table.column_names().join(", "),
        placeholders
    )
}

pub struct MigrationEngine {
    shared: Store,
    registry: TenantRepository,
    factory: Arc<StoreFactory>,
    tester: ConnectionTester,
    secrets: SecretBox,
    settings: MigrationSettings,
    pub(crate) locks: TenantLocks,
}

impl MigrationEngine {
    pub fn new(
        factory: Arc<StoreFactory>,
        tester: ConnectionTester,
        secrets: SecretBox,
        settings: MigrationSettings,
    ) -> Self {
        let shared = factory.shared().clone();
        Self {
            registry: TenantRepository::new(shared.clone()),
            shared,
            factory,
            tester,
            secrets,
            settings,
            locks: TenantLocks::new(),
        }
    }

    /// All thirteen kinds (narrowed by the tenant's table selection), then
    /// default-role reconciliation.
    pub async fn migrate_all(&self, tenant: &TenantId) -> Result<MigrationReport, CloudError> {
        self.run(tenant, MigrationScope::All).await
    }

    /// Only the tenant record's most used dependents; no reference tables.
    pub async fn migrate_primary(&self, tenant: &TenantId) -> Result<MigrationReport, CloudError> {
        self.run(tenant, MigrationScope::Primary).await
    }

    async fn run(
        &self,
        tenant: &TenantId,
        scope: MigrationScope,
    ) -> Result<MigrationReport, CloudError> {
        let work = async {
            let _guard = self.locks.acquire(tenant).await;
            self.execute(tenant, scope).await
        };
        match tokio::time::timeout(self.settings.timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Migration for {} exceeded {}s; committed batches are kept",
                    tenant,
                    self.settings.timeout.as_secs()
                );
                Err(CloudError::MigrationTimeout(self.settings.timeout))
            }
        }
    }

    async fn execute(
        &self,
        tenant: &TenantId,
        scope: MigrationScope,
    ) -> Result<MigrationReport, CloudError> {
        let started = Instant::now();
        let (target, descriptor, selected) = self.preflight(tenant).await?;
        let owners = self.resolve_owners(tenant).await?;
        info!(
            "Migrating {:?} tables for {} ({} sub-identities) into {}",
            scope,
            tenant,
            owners.subuser_ids.len(),
            descriptor.masked()
        );

        let mut report = MigrationReport::new(tenant.clone(), scope);
        for kind in plan(scope, &selected) {
            let kind_report = self.copy_kind(kind, &owners, &target, &descriptor).await;
            info!(
                "{}: found {}, migrated {}, skipped {}, failed {}",
                kind,
                kind_report.found,
                kind_report.migrated,
                kind_report.skipped,
                kind_report.failed
            );
            report.push(kind, kind_report);
        }

        if scope == MigrationScope::All {
            match self.reconcile_default_role(tenant, &target).await {
                Ok(assigned) => report.default_role_assigned = assigned,
                Err(e) => {
                    let message = descriptor.redact(&e.to_string());
                    warn!("Default role reconciliation for {} failed: {}", tenant, message);
                    report.warnings.push(format!("default role not assigned: {message}"));
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!("Migration for {} finished: {}", tenant, report.summary());
        Ok(report)
    }

    /// Everything that must hold before the first write. Any failure here
    /// aborts the run with nothing written.
    async fn preflight(
        &self,
        tenant: &TenantId,
    ) -> Result<(Store, ConnectionDescriptor, Vec<EntityKind>), CloudError> {
        let config = self.registry.require_private_config(tenant).await?;
        config.require_status(PrivateCloudStatus::SchemaReady)?;
        let descriptor = config.decrypt_descriptor(&self.secrets)?;

        let target = self.factory.private_store(tenant, &descriptor).await?;
        self.tester
            .ping(&target, &descriptor)
            .await
            .map_err(|e| CloudError::FatalMigration(e.to_string()))?;

        let missing = SchemaProvisioner::missing_tables(&target)
            .await
            .map_err(|e| CloudError::FatalMigration(descriptor.redact(&e.to_string())))?;
        if !missing.is_empty() {
            return Err(CloudError::FatalMigration(format!(
                "private store is missing tables: {}",
                missing.join(", ")
            )));
        }
        Ok((target, descriptor, config.selected_tables))
    }

    async fn resolve_owners(&self, tenant: &TenantId) -> Result<OwnerSet, CloudError> {
        let user_id = self.registry.tenant_user_id(tenant).await?;
        let subusers = self.registry.owned_subusers(tenant).await?;
        let mut emails = vec![tenant.to_string()];
        emails.extend(subusers.iter().map(|s| s.email.clone()));
        Ok(OwnerSet {
            tenant: tenant.clone(),
            user_id,
            subuser_ids: subusers.iter().map(|s| s.id).collect(),
            emails,
        })
    }

    /// Copy one kind. Never fails: kind-level errors land in the report.
    async fn copy_kind(
        &self,
        kind: EntityKind,
        owners: &OwnerSet,
        target: &Store,
        descriptor: &ConnectionDescriptor,
    ) -> KindReport {
        let mut report = KindReport::default();
        if let Err(e) = self.copy_rows(kind, owners, target, &mut report).await {
            report.fail_unprocessed();
            let message = descriptor.redact(&e.to_string());
            warn!("{}: aborted after {} rows: {}", kind, report.migrated, message);
            report.note(format!("{kind}: {message}"));
        }
        if report.migrated > 0 {
            sync_identity(target, kind.table()).await;
        }
        report
    }

    async fn copy_rows(
        &self,
        kind: EntityKind,
        owners: &OwnerSet,
        target: &Store,
        report: &mut KindReport,
    ) -> Result<(), sqlx::Error> {
        let table = kind.table();
        let rows = match source_filter(kind.ownership(), owners) {
            SourceFilter::Empty => Vec::new(),
            filter => read_rows(&self.shared, table, filter).await?,
        };
        report.found = rows.len() as u64;
        if rows.is_empty() {
            return Ok(());
        }
        if kind == EntityKind::UserRoles {
            let released = release_placeholders(target, &rows).await?;
            if released > 0 {
                info!("{}: replaced {} default-role placeholder(s)", kind, released);
            }
        }

        let mut pending: u64 = 0;
        let result = self
            .insert_rows(kind, rows, target, report, &mut pending)
            .await;
        if result.is_err() {
            // The open transaction was dropped with its uncommitted batch.
            report.roll_back(pending);
        }
        result
    }

    /// Insert rows in batches of `batch_size`. `pending` holds the rows of
    /// the open transaction, so a caller seeing `Err` knows how many of the
    /// counted rows were rolled back.
    async fn insert_rows(
        &self,
        kind: EntityKind,
        rows: Vec<Vec<SqlValue>>,
        target: &Store,
        report: &mut KindReport,
        pending: &mut u64,
    ) -> Result<(), sqlx::Error> {
        let table = kind.table();
        let mut present = primary_keys(target, table).await?;
        let divergent = self.divergent_references(kind, target).await?;
        let sql = target.sql(&insert_sql(table, target.kind())).into_owned();

        let mut tx = target.pool().begin().await?;
        for row in rows {
            let Some(id) = row.first().and_then(SqlValue::as_i64) else {
                report.record_failure(format!("{kind}: row without id"));
                continue;
            };
            if present.contains(&id) {
                report.skipped += 1;
                continue;
            }
            if let Some(reason) = divergence(&divergent, table, &row) {
                warn!("{} id {}: {}", kind, id, reason);
                report.record_failure(format!("{kind} id {id}: {reason}"));
                continue;
            }

            let mut savepoint = tx.begin().await?;
            let mut query = sqlx::query(&sql);
            for (value, column) in row.into_iter().zip(table.columns) {
                query = value.bind(query, column.ty);
            }
            match query.execute(&mut *savepoint).await {
                Ok(_) => {
                    savepoint.commit().await?;
                    present.insert(id);
                    report.migrated += 1;
                    *pending += 1;
                }
                Err(e) => {
                    savepoint.rollback().await?;
                    warn!("{} id {} not copied: {}", kind, id, e);
                    report.record_failure(format!("{kind} id {id}: {e}"));
                }
            }

            if *pending >= self.settings.batch_size as u64 {
                tx.commit().await?;
                debug!("{}: committed batch of {}", kind, pending);
                *pending = 0;
                tx = target.pool().begin().await?;
            }
        }

        tx.commit().await?;
        if *pending > 0 {
            debug!("{}: committed final batch of {}", kind, pending);
        }
        Ok(())
    }

    /// Ids, per referencing column, whose reference row in the private store
    /// is missing or carries a different name than in the shared store.
    async fn divergent_references(
        &self,
        kind: EntityKind,
        target: &Store,
    ) -> Result<HashMap<&'static str, HashSet<i64>>, sqlx::Error> {
        let mut divergent = HashMap::new();
        if kind.class() == EntityClass::TenantScoped {
            return Ok(divergent);
        }
        for fk in kind.table().foreign_keys {
            let Some(name_column) = reference_name_column(fk.references) else {
                continue;
            };
            let source = reference_names(&self.shared, fk.references, name_column).await?;
            let private = reference_names(target, fk.references, name_column).await?;
            let mismatched: HashSet<i64> = source
                .iter()
                .filter(|(id, name)| private.get(*id) != Some(*name))
                .map(|(id, _)| *id)
                .collect();
            if !mismatched.is_empty() {
                warn!(
                    "{}: {} {} id(s) differ between shared and private store",
                    kind,
                    mismatched.len(),
                    fk.references
                );
            }
            divergent.insert(fk.column, mismatched);
        }
        Ok(divergent)
    }

    /// Give the tenant the default role in the private store if it has none.
    async fn reconcile_default_role(
        &self,
        tenant: &TenantId,
        target: &Store,
    ) -> Result<bool, sqlx::Error> {
        let user_id: Option<i64> =
            sqlx::query_scalar(&target.sql("SELECT id FROM users WHERE user_email = ?"))
                .bind(tenant.as_str())
                .fetch_optional(target.pool())
                .await?;
        let Some(user_id) = user_id else {
            return Ok(false);
        };

        let assigned: i64 =
            sqlx::query_scalar(&target.sql("SELECT COUNT(*) FROM user_roles WHERE user_id = ?"))
                .bind(user_id)
                .fetch_one(target.pool())
                .await?;
        if assigned > 0 {
            return Ok(false);
        }

        let role_id: Option<i64> =
            sqlx::query_scalar(&target.sql("SELECT id FROM roles WHERE role_name = ?"))
                .bind(self.settings.default_role.as_str())
                .fetch_optional(target.pool())
                .await?;
        let Some(role_id) = role_id else {
            warn!(
                "Default role '{}' missing from private store; {} left without a role",
                self.settings.default_role, tenant
            );
            return Ok(false);
        };

        // Above both stores' ranges. A shared-store assignment that later
        // takes the same id replaces this row on the next run.
        let max_sql = "SELECT COALESCE(MAX(id), 0) FROM user_roles";
        let source_max: i64 = sqlx::query_scalar(max_sql).fetch_one(self.shared.pool()).await?;
        let target_max: i64 = sqlx::query_scalar(max_sql).fetch_one(target.pool()).await?;
        let id = source_max.max(target_max) + 1;

        sqlx::query(&target.sql(
            "INSERT INTO user_roles (id, user_id, role_id, assigned_by, assigned_at) \
             VALUES (?, ?, ?, ?, ?)",
        ))
        .bind(id)
        .bind(user_id)
        .bind(role_id)
        .bind(PLACEHOLDER_ASSIGNER)
        .bind(now_ts())
        .execute(target.pool())
        .await?;
        sync_identity(target, EntityKind::UserRoles.table()).await;

        info!(
            "Assigned default role '{}' to {} in private store",
            self.settings.default_role, tenant
        );
        Ok(true)
    }
}

/// `assigned_by` of the default-role row written by reconciliation.
const PLACEHOLDER_ASSIGNER: &str = "system";

/// Delete default-role placeholders whose id an incoming shared-store
/// assignment now uses, so the real row is copied instead of skipped.
async fn release_placeholders(target: &Store, rows: &[Vec<SqlValue>]) -> Result<u64, sqlx::Error> {
    let filter = SourceFilter::Where(
        "assigned_by = ?".to_string(),
        vec![(SqlValue::Text(PLACEHOLDER_ASSIGNER.to_string()), ColumnType::Text)],
    );
    let placeholders = read_rows(target, EntityKind::UserRoles.table(), filter).await?;
    let by_id: HashMap<i64, &Vec<SqlValue>> = placeholders
        .iter()
        .filter_map(|row| Some((row.first()?.as_i64()?, row)))
        .collect();

    let delete = target.sql("DELETE FROM user_roles WHERE id = ?");
    let mut released = 0;
    for row in rows {
        let Some(id) = row.first().and_then(SqlValue::as_i64) else {
            continue;
        };
        if by_id.get(&id).is_some_and(|existing| *existing != row) {
            sqlx::query(&delete).bind(id).execute(target.pool()).await?;
            released += 1;
        }
    }
    Ok(released)
}

/// Kinds to copy, in dependency order.
fn plan(scope: MigrationScope, selected: &[EntityKind]) -> Vec<EntityKind> {
    match scope {
        MigrationScope::Primary => PRIMARY_KINDS.to_vec(),
        MigrationScope::All if selected.is_empty() => EntityKind::ALL.to_vec(),
        // Reference data always travels: authorization in the private
        // store evaluates against the full set.
        MigrationScope::All => EntityKind::ALL
            .into_iter()
            .filter(|k| k.class() == EntityClass::Reference || selected.contains(k))
            .collect(),
    }
}

async fn read_rows(
    store: &Store,
    table: &TableDef,
    filter: SourceFilter,
) -> Result<Vec<Vec<SqlValue>>, sqlx::Error> {
    let columns = table.column_names().join(", ");
    let (clause, binds) = match filter {
        SourceFilter::Where(clause, binds) => (format!(" WHERE {clause}"), binds),
        SourceFilter::All | SourceFilter::Empty => (String::new(), Vec::new()),
    };
    let sql = format!("SELECT {columns} FROM {}{clause} ORDER BY id", table.name);
    let sql = store.sql(&sql);

    let mut query = sqlx::query(&sql);
    for (value, ty) in binds {
        query = value.bind(query, ty);
    }
    let rows = query.fetch_all(store.pool()).await?;
    rows.iter().map(|row| decode_row(row, table)).collect()
}

fn decode_row(row: &AnyRow, table: &TableDef) -> Result<Vec<SqlValue>, sqlx::Error> {
    table
        .columns
        .iter()
        .map(|c| SqlValue::decode(row, c.name, c.ty))
        .collect()
}

async fn primary_keys(store: &Store, table: &TableDef) -> Result<HashSet<i64>, sqlx::Error> {
    let ids: Vec<i64> = sqlx::query_scalar(&format!("SELECT id FROM {}", table.name))
        .fetch_all(store.pool())
        .await?;
    Ok(ids.into_iter().collect())
}

async fn reference_names(
    store: &Store,
    table: &str,
    name_column: &str,
) -> Result<HashMap<i64, String>, sqlx::Error> {
    let rows = sqlx::query(&format!("SELECT id, {name_column} FROM {table}"))
        .fetch_all(store.pool())
        .await?;
    rows.iter()
        .map(|r| {
            let id: i64 = r.try_get("id")?;
            let name: String = r.try_get(name_column)?;
            Ok::<_, sqlx::Error>((id, name))
        })
        .collect()
}

fn divergence(
    divergent: &HashMap<&'static str, HashSet<i64>>,
    table: &TableDef,
    row: &[SqlValue],
) -> Option<String> {
    table.columns.iter().zip(row).find_map(|(column, value)| {
        let id = value.as_i64()?;
        divergent
            .get(column.name)
            .filter(|ids| ids.contains(&id))
            .map(|_| format!("{} {} differs between shared and private store", column.name, id))
    })
}

/// Postgres identity sequences do not advance on explicit ids.
async fn sync_identity(store: &Store, table: &TableDef) {
    if store.kind() != StoreKind::Postgres {
        return;
    }
    let sql = format!(
        "SELECT setval(pg_get_serial_sequence('{0}', 'id'), (SELECT MAX(id) FROM {0}))",
        table.name
    );
    if let Err(e) = sqlx::query(&sql).execute(store.pool()).await {
        warn!("Could not advance id sequence for {}: {}", table.name, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{self, TestEnv, count, exec};

    fn tenant() -> TenantId {
        TenantId::parse("a@x.com").unwrap()
    }

    async fn ready_env() -> TestEnv {
        let env = TestEnv::new().await;
        test_helpers::seed_scenario(&env.shared).await;
        env.configure_private(&tenant(), PrivateCloudStatus::SchemaReady)
            .await;
        env
    }

    fn migrated(report: &MigrationReport, kind: EntityKind) -> u64 {
        report.kind(kind).unwrap().migrated
    }

    #[tokio::test]
    async fn scenario_full_migration_then_rerun() {
        let env = ready_env().await;
        let engine = env.engine(MigrationSettings::default());

        let first = engine.migrate_all(&tenant()).await.unwrap();
        assert_eq!(first.kinds.len(), 13);
        assert_eq!(migrated(&first, EntityKind::AuditReports), 3);
        assert_eq!(migrated(&first, EntityKind::Subusers), 2);
        assert_eq!(migrated(&first, EntityKind::Machines), 2);
        assert_eq!(migrated(&first, EntityKind::Roles), 5);
        assert_eq!(migrated(&first, EntityKind::Users), 1);
        assert_eq!(migrated(&first, EntityKind::Logs), 2);
        assert_eq!(migrated(&first, EntityKind::SubuserRoles), 1);
        assert_eq!(migrated(&first, EntityKind::UserRoles), 0);
        assert_eq!(first.total_failed, 0);
        assert!(first.default_role_assigned);

        let second = engine.migrate_all(&tenant()).await.unwrap();
        for (kind, report) in &second.kinds {
            assert_eq!(report.migrated, 0, "{kind} re-inserted rows");
            assert_eq!(report.found, first.kind(*kind).unwrap().found, "{kind}");
        }
        assert_eq!(second.total_skipped, second.total_found);
        assert!(!second.default_role_assigned);
    }

    #[tokio::test]
    async fn keys_are_preserved() {
        let env = ready_env().await;
        let engine = env.engine(MigrationSettings::default());
        engine.migrate_all(&tenant()).await.unwrap();

        let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM audit_reports ORDER BY id")
            .fetch_all(env.private.pool())
            .await
            .unwrap();
        assert_eq!(ids, vec![1, 2, 3]);

        let machines: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, fingerprint_hash FROM machines ORDER BY id")
                .fetch_all(env.private.pool())
                .await
                .unwrap();
        assert_eq!(machines, vec![(1, "fp-s1".into()), (2, "fp-s2".into())]);

        let link: (i64, i64) = sqlx::query_as("SELECT subuser_id, role_id FROM subuser_roles")
            .fetch_one(env.private.pool())
            .await
            .unwrap();
        assert_eq!(link, (1, 5));
    }

    #[tokio::test]
    async fn reference_tables_copy_whole_and_others_stay_out() {
        let env = ready_env().await;
        let engine = env.engine(MigrationSettings::default());
        let report = engine.migrate_all(&tenant()).await.unwrap();

        for (kind, table) in [
            (EntityKind::Roles, "roles"),
            (EntityKind::Permissions, "permissions"),
            (EntityKind::RolePermissions, "role_permissions"),
            (EntityKind::Routes, "routes"),
        ] {
            let total = count(&env.shared, &format!("SELECT COUNT(*) FROM {table}")).await;
            assert_eq!(migrated(&report, kind) as i64, total, "{table}");
        }

        let foreign = [
            "SELECT COUNT(*) FROM users WHERE user_email = 'b@y.com'",
            "SELECT COUNT(*) FROM subusers WHERE user_email = 'b@y.com'",
            "SELECT COUNT(*) FROM audit_reports WHERE client_email = 'b@y.com'",
            "SELECT COUNT(*) FROM machines WHERE user_email = 'b@y.com'",
            "SELECT COUNT(*) FROM sessions WHERE user_email = 'b@y.com'",
            "SELECT COUNT(*) FROM commands WHERE user_email = 'b@y.com'",
            "SELECT COUNT(*) FROM logs WHERE user_email = 'b@y.com'",
            "SELECT COUNT(*) FROM subuser_roles WHERE subuser_id = 3",
            "SELECT COUNT(*) FROM user_roles WHERE user_id = 2",
        ];
        for sql in foreign {
            assert_eq!(count(&env.private, sql).await, 0, "{sql}");
        }
    }

    #[tokio::test]
    async fn default_role_gets_an_id_above_both_stores() {
        let env = ready_env().await;
        let engine = env.engine(MigrationSettings::default());
        engine.migrate_all(&tenant()).await.unwrap();

        let (id, user_id, role_id): (i64, i64, i64) =
            sqlx::query_as("SELECT id, user_id, role_id FROM user_roles")
                .fetch_one(env.private.pool())
                .await
                .unwrap();
        // shared store already uses user_roles id 1 for another tenant
        assert_eq!(id, 2);
        assert_eq!(user_id, 1);
        assert_eq!(role_id, 3);
    }

    #[tokio::test]
    async fn later_assignment_reusing_the_placeholder_id_is_copied() {
        let env = ready_env().await;
        let engine = env.engine(MigrationSettings::default());
        let first = engine.migrate_all(&tenant()).await.unwrap();
        assert!(first.default_role_assigned);

        // The shared store hands out the same id the placeholder took
        exec(
            &env.shared,
            "INSERT INTO user_roles (id, user_id, role_id, assigned_by) VALUES (2, 1, 2, 'admin')",
        )
        .await;
        let second = engine.migrate_all(&tenant()).await.unwrap();

        let links = second.kind(EntityKind::UserRoles).unwrap();
        assert_eq!((links.found, links.migrated, links.skipped), (1, 1, 0));
        assert!(!second.default_role_assigned);
        let rows: Vec<(i64, i64, i64, String)> =
            sqlx::query_as("SELECT id, user_id, role_id, assigned_by FROM user_roles")
                .fetch_all(env.private.pool())
                .await
                .unwrap();
        assert_eq!(rows, vec![(2, 1, 2, "admin".to_string())]);

        // A third run sees the real row and leaves it alone
        let third = engine.migrate_all(&tenant()).await.unwrap();
        assert_eq!(third.kind(EntityKind::UserRoles).unwrap().skipped, 1);
    }

    #[tokio::test]
    async fn existing_assignment_is_migrated_not_reconciled() {
        let env = ready_env().await;
        exec(
            &env.shared,
            "INSERT INTO user_roles (id, user_id, role_id, assigned_by) VALUES (7, 1, 2, 'admin')",
        )
        .await;
        let engine = env.engine(MigrationSettings::default());
        let report = engine.migrate_all(&tenant()).await.unwrap();

        assert_eq!(migrated(&report, EntityKind::UserRoles), 1);
        assert!(!report.default_role_assigned);
        assert_eq!(count(&env.private, "SELECT COUNT(*) FROM user_roles").await, 1);
    }

    #[tokio::test]
    async fn missing_default_role_is_not_fatal() {
        let env = ready_env().await;
        let engine = env.engine(MigrationSettings {
            default_role: "Nonexistent".into(),
            ..Default::default()
        });
        let report = engine.migrate_all(&tenant()).await.unwrap();
        assert!(!report.default_role_assigned);
        assert_eq!(count(&env.private, "SELECT COUNT(*) FROM user_roles").await, 0);
    }

    #[tokio::test]
    async fn primary_variant_skips_reference_tables() {
        let env = ready_env().await;
        let engine = env.engine(MigrationSettings::default());

        let report = engine.migrate_primary(&tenant()).await.unwrap();
        let kinds: Vec<EntityKind> = report.kinds.keys().copied().collect();
        assert_eq!(
            kinds,
            vec![
                EntityKind::Users,
                EntityKind::Subusers,
                EntityKind::AuditReports,
                EntityKind::Machines
            ]
        );
        assert_eq!(report.total_migrated, 1 + 2 + 3 + 2);
        assert!(!report.default_role_assigned);
        assert_eq!(count(&env.private, "SELECT COUNT(*) FROM roles").await, 0);

        // A later full run only fills what is missing
        let full = engine.migrate_all(&tenant()).await.unwrap();
        assert_eq!(migrated(&full, EntityKind::AuditReports), 0);
        assert_eq!(full.kind(EntityKind::AuditReports).unwrap().skipped, 3);
        assert_eq!(migrated(&full, EntityKind::Roles), 5);
    }

    #[tokio::test]
    async fn selected_tables_narrow_the_full_run() {
        let env = TestEnv::new().await;
        test_helpers::seed_scenario(&env.shared).await;
        env.registry
            .upsert_private_config(
                &tenant(),
                &env.private_descriptor,
                None,
                &[EntityKind::Users, EntityKind::AuditReports],
                &env.secrets,
            )
            .await
            .unwrap();
        SchemaProvisioner::ensure_schema(&env.private).await.unwrap();
        env.registry
            .set_private_status(&tenant(), PrivateCloudStatus::SchemaReady, None)
            .await
            .unwrap();

        let report = env
            .engine(MigrationSettings::default())
            .migrate_all(&tenant())
            .await
            .unwrap();
        assert!(report.kind(EntityKind::Roles).is_some());
        assert!(report.kind(EntityKind::AuditReports).is_some());
        assert!(report.kind(EntityKind::Machines).is_none());
        assert_eq!(report.kinds.len(), 6);
    }

    #[tokio::test]
    async fn small_batches_commit_everything() {
        let env = ready_env().await;
        for i in 10..35 {
            exec(
                &env.shared,
                &format!(
                    "INSERT INTO audit_reports (id, client_email, report_name) \
                     VALUES ({i}, 'a@x.com', 'bulk {i}')"
                ),
            )
            .await;
        }
        let engine = env.engine(MigrationSettings {
            batch_size: 4,
            ..Default::default()
        });
        let report = engine.migrate_primary(&tenant()).await.unwrap();
        assert_eq!(migrated(&report, EntityKind::AuditReports), 28);
        assert_eq!(count(&env.private, "SELECT COUNT(*) FROM audit_reports").await, 28);
    }

    #[tokio::test]
    async fn failing_rows_are_counted_and_the_rest_continue() {
        let env = ready_env().await;
        // Same email under another key: the tenant row collides on UNIQUE
        exec(
            &env.private,
            "INSERT INTO users (id, user_email) VALUES (42, 'a@x.com')",
        )
        .await;
        // One sub-identity email already taken in the private store
        exec(
            &env.private,
            "INSERT INTO subusers (id, subuser_email, user_email) VALUES (50, 's2@x.com', 'other@z.com')",
        )
        .await;

        let engine = env.engine(MigrationSettings::default());
        let report = engine.migrate_all(&tenant()).await.unwrap();

        let users = report.kind(EntityKind::Users).unwrap();
        assert_eq!((users.found, users.migrated, users.failed), (1, 0, 1));
        assert_eq!(users.errors.len(), 1);

        let subusers = report.kind(EntityKind::Subusers).unwrap();
        assert_eq!((subusers.migrated, subusers.failed), (1, 1));

        assert_eq!(migrated(&report, EntityKind::AuditReports), 3);
        assert_eq!(migrated(&report, EntityKind::Machines), 2);
        assert!(report.is_partial());
        // The pre-existing private row for the tenant still gets a role
        assert!(report.default_role_assigned);
        let user_id: i64 = sqlx::query_scalar("SELECT user_id FROM user_roles")
            .fetch_one(env.private.pool())
            .await
            .unwrap();
        assert_eq!(user_id, 42);
    }

    #[tokio::test]
    async fn failed_batch_commit_moves_its_rows_to_failed() {
        let env = ready_env().await;
        // Audit report 3 leaves a deferred FK violation that only COMMIT sees
        exec(&env.private, "CREATE TABLE guard_parent (id INTEGER PRIMARY KEY)").await;
        exec(
            &env.private,
            "CREATE TABLE guard_child (parent_id INTEGER \
             REFERENCES guard_parent(id) DEFERRABLE INITIALLY DEFERRED)",
        )
        .await;
        exec(
            &env.private,
            "CREATE TRIGGER audit_guard AFTER INSERT ON audit_reports WHEN NEW.id = 3 \
             BEGIN INSERT INTO guard_child (parent_id) VALUES (999); END",
        )
        .await;

        let engine = env.engine(MigrationSettings {
            batch_size: 2,
            ..Default::default()
        });
        let report = engine.migrate_primary(&tenant()).await.unwrap();

        let audits = report.kind(EntityKind::AuditReports).unwrap();
        assert_eq!((audits.found, audits.migrated, audits.failed), (3, 2, 1));
        assert_eq!(audits.errors.len(), 1);
        assert_eq!(count(&env.private, "SELECT COUNT(*) FROM audit_reports").await, 2);
        assert!(report.is_partial());
        assert_eq!(
            report.total_migrated + report.total_skipped + report.total_failed,
            report.total_found
        );
        // Kinds after the aborted one still run
        assert_eq!(migrated(&report, EntityKind::Machines), 2);
    }

    #[tokio::test]
    async fn divergent_roles_are_not_linked() {
        let env = ready_env().await;
        // Role id 5 already means something else in the private store
        exec(
            &env.private,
            "INSERT INTO roles (id, role_name) VALUES (5, 'Contractor')",
        )
        .await;

        let engine = env.engine(MigrationSettings::default());
        let report = engine.migrate_all(&tenant()).await.unwrap();

        let roles = report.kind(EntityKind::Roles).unwrap();
        assert_eq!((roles.migrated, roles.skipped), (4, 1));

        let links = report.kind(EntityKind::SubuserRoles).unwrap();
        assert_eq!((links.found, links.migrated, links.failed), (1, 0, 1));
        assert!(links.errors[0].contains("role_id 5"));
        assert_eq!(count(&env.private, "SELECT COUNT(*) FROM subuser_roles").await, 0);

        // Links to roles that match are unaffected
        assert_eq!(migrated(&report, EntityKind::RolePermissions), 4);
    }

    #[tokio::test]
    async fn unreachable_target_aborts_with_nothing_written() {
        let env = TestEnv::new().await;
        test_helpers::seed_scenario(&env.shared).await;
        let bad = ConnectionDescriptor::sqlite("/nonexistent/erasure/private.db");
        env.registry
            .upsert_private_config(&tenant(), &bad, None, &[], &env.secrets)
            .await
            .unwrap();
        env.registry
            .set_private_status(&tenant(), PrivateCloudStatus::SchemaReady, None)
            .await
            .unwrap();

        let err = env
            .engine(MigrationSettings::default())
            .migrate_all(&tenant())
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::FatalMigration(_)), "{err:?}");
    }

    #[tokio::test]
    async fn missing_schema_aborts_with_nothing_written() {
        let env = TestEnv::new().await;
        test_helpers::seed_scenario(&env.shared).await;
        env.configure_private(&tenant(), PrivateCloudStatus::ConnectionVerified)
            .await;
        env.registry
            .set_private_status(&tenant(), PrivateCloudStatus::SchemaReady, None)
            .await
            .unwrap();

        let err = env
            .engine(MigrationSettings::default())
            .migrate_all(&tenant())
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::FatalMigration(_)));
        assert_eq!(
            SchemaProvisioner::missing_tables(&env.private).await.unwrap().len(),
            13
        );
    }

    #[tokio::test]
    async fn preflight_requires_schema_ready() {
        let env = TestEnv::new().await;
        test_helpers::seed_scenario(&env.shared).await;
        let engine = env.engine(MigrationSettings::default());

        let err = engine.migrate_all(&tenant()).await.unwrap_err();
        assert!(matches!(err, CloudError::NotConfigured(_)));

        env.configure_private(&tenant(), PrivateCloudStatus::ConnectionVerified)
            .await;
        let err = engine.migrate_all(&tenant()).await.unwrap_err();
        assert!(matches!(
            err,
            CloudError::InvalidState {
                required: PrivateCloudStatus::SchemaReady,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn concurrent_runs_for_one_tenant_do_not_double_insert() {
        let env = ready_env().await;
        let engine = env.engine(MigrationSettings::default());

        let t = tenant();
        let (a, b) = tokio::join!(engine.migrate_all(&t), engine.migrate_all(&t));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a.total_migrated == 0 || b.total_migrated == 0);
        assert_eq!(a.total_migrated + b.total_migrated, a.total_found);
        assert_eq!(count(&env.private, "SELECT COUNT(*) FROM audit_reports").await, 3);
    }

    #[tokio::test]
    async fn run_is_bounded_by_the_timeout() {
        let env = ready_env().await;
        let engine = env.engine(MigrationSettings {
            timeout: Duration::from_millis(100),
            ..Default::default()
        });

        let _held = engine.locks.acquire(&tenant()).await;
        let err = engine.migrate_all(&tenant()).await.unwrap_err();
        assert!(matches!(err, CloudError::MigrationTimeout(_)));
        assert_eq!(count(&env.private, "SELECT COUNT(*) FROM users").await, 0);
    }

    #[test]
    fn owner_filters() {
        let owners = OwnerSet {
            tenant: tenant(),
            user_id: None,
            subuser_ids: vec![],
            emails: vec!["a@x.com".into(), "s1@x.com".into()],
        };
        match source_filter(EntityKind::Machines.ownership(), &owners) {
            SourceFilter::Where(clause, binds) => {
                assert_eq!(clause, "user_email IN (?, ?) OR subuser_email IN (?, ?)");
                assert_eq!(binds.len(), 4);
            }
            _ => panic!("machines must be filtered"),
        }
        assert!(matches!(
            source_filter(EntityKind::UserRoles.ownership(), &owners),
            SourceFilter::Empty
        ));
        assert!(matches!(
            source_filter(EntityKind::SubuserRoles.ownership(), &owners),
            SourceFilter::Empty
        ));
        assert!(matches!(
            source_filter(EntityKind::Roles.ownership(), &owners),
            SourceFilter::All
        ));
    }

    #[test]
    fn postgres_insert_casts_text() {
        let sql = insert_sql(EntityKind::UserRoles.table(), StoreKind::Postgres);
        assert_eq!(
            sql,
            "INSERT INTO user_roles (id, user_id, role_id, assigned_by, assigned_at) \
             VALUES (?, ?, ?, CAST(? AS TEXT), ?)"
        );
        let sql = insert_sql(EntityKind::UserRoles.table(), StoreKind::Sqlite);
        assert!(sql.ends_with("VALUES (?, ?, ?, ?, ?)"));
    }
}
