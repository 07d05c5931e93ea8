use std::collections::BTreeMap;

use erasure_auth::TenantId;
use serde::Serialize;

use crate::schema::EntityKind;

/// Row-failure messages kept per kind; the counters are always exact.
const MAX_ERRORS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationScope {
    All,
    Primary,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KindReport {
    /// Matching rows in the shared store.
    pub found: u64,
    /// Rows newly inserted into the private store.
    pub migrated: u64,
    /// Rows already present in the private store.
    pub skipped: u64,
    pub failed: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl KindReport {
    pub(crate) fn record_failure(&mut self, message: String) {
        self.failed += 1;
        self.note(message);
    }

    pub(crate) fn note(&mut self, message: String) {
        if self.errors.len() < MAX_ERRORS {
            self.errors.push(message);
        }
    }

    /// Move rows of a rolled-back batch from migrated to failed.
    pub(crate) fn roll_back(&mut self, rows: u64) {
        self.migrated -= rows;
        self.failed += rows;
    }

    /// Count rows never reached before an abort as failed, so that
    /// `found == migrated + skipped + failed` holds afterwards.
    pub(crate) fn fail_unprocessed(&mut self) {
        let settled = self.migrated + self.skipped + self.failed;
        self.failed += self.found.saturating_sub(settled);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub tenant: TenantId,
    pub scope: MigrationScope,
    pub kinds: BTreeMap<EntityKind, KindReport>,
    pub total_found: u64,
    pub total_migrated: u64,
    pub total_skipped: u64,
    pub total_failed: u64,
    pub default_role_assigned: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

impl MigrationReport {
    pub fn new(tenant: TenantId, scope: MigrationScope) -> Self {
        Self {
            tenant,
            scope,
            kinds: BTreeMap::new(),
            total_found: 0,
            total_migrated: 0,
            total_skipped: 0,
            total_failed: 0,
            default_role_assigned: false,
            warnings: Vec::new(),
            duration_ms: 0,
        }
    }

    pub(crate) fn push(&mut self, kind: EntityKind, report: KindReport) {
        self.total_found += report.found;
        self.total_migrated += report.migrated;
        self.total_skipped += report.skipped;
        self.total_failed += report.failed;
        self.kinds.insert(kind, report);
    }

    pub fn kind(&self, kind: EntityKind) -> Option<&KindReport> {
        self.kinds.get(&kind)
    }

    /// Completed, but some rows were not copied.
    pub fn is_partial(&self) -> bool {
        self.total_failed > 0
    }

    pub fn migrated_counts(&self) -> BTreeMap<EntityKind, u64> {
        self.kinds.iter().map(|(k, r)| (*k, r.migrated)).collect()
    }

    pub fn found_counts(&self) -> BTreeMap<EntityKind, u64> {
        self.kinds.iter().map(|(k, r)| (*k, r.found)).collect()
    }

    pub fn summary(&self) -> String {
        let mut line = format!(
            "Migrated {} of {} rows across {} tables ({} already present",
            self.total_migrated,
            self.total_found,
            self.kinds.len(),
            self.total_skipped
        );
        if self.total_failed > 0 {
            line.push_str(&format!(", {} failed", self.total_failed));
        }
        line.push(')');
        if self.default_role_assigned {
            line.push_str("; default role assigned");
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantId {
        TenantId::parse("a@x.com").unwrap()
    }

    #[test]
    fn error_messages_are_capped_but_counted() {
        let mut report = KindReport::default();
        for i in 0..8 {
            report.record_failure(format!("row {i}"));
        }
        assert_eq!(report.failed, 8);
        assert_eq!(report.errors.len(), MAX_ERRORS);
        assert_eq!(report.errors[0], "row 0");
    }

    #[test]
    fn aborted_kind_accounts_for_every_row() {
        let mut report = KindReport {
            found: 10,
            skipped: 1,
            ..Default::default()
        };
        report.migrated = 4;
        report.record_failure("row 6".into());
        report.roll_back(3);
        assert_eq!(report.migrated, 1);
        assert_eq!(report.failed, 4);

        report.fail_unprocessed();
        assert_eq!(report.failed, 8);
        assert_eq!(report.migrated + report.skipped + report.failed, report.found);

        report.fail_unprocessed();
        assert_eq!(report.failed, 8);
    }

    #[test]
    fn totals_accumulate() {
        let mut report = MigrationReport::new(tenant(), MigrationScope::All);
        report.push(
            EntityKind::Roles,
            KindReport {
                found: 5,
                migrated: 5,
                ..Default::default()
            },
        );
        report.push(
            EntityKind::Users,
            KindReport {
                found: 1,
                skipped: 1,
                ..Default::default()
            },
        );
        report.push(
            EntityKind::Machines,
            KindReport {
                found: 2,
                migrated: 1,
                failed: 1,
                errors: vec!["boom".into()],
                ..Default::default()
            },
        );
        assert_eq!(report.total_found, 8);
        assert_eq!(report.total_migrated, 6);
        assert_eq!(report.total_skipped, 1);
        assert_eq!(report.total_failed, 1);
        assert!(report.is_partial());
        assert_eq!(report.migrated_counts()[&EntityKind::Roles], 5);
        assert_eq!(
            report.summary(),
            "Migrated 6 of 8 rows across 3 tables (1 already present, 1 failed)"
        );
    }

    #[test]
    fn serializes_kinds_by_table_name_in_dependency_order() {
        let mut report = MigrationReport::new(tenant(), MigrationScope::Primary);
        report.push(EntityKind::Machines, KindReport::default());
        report.push(EntityKind::Users, KindReport::default());
        let json = serde_json::to_value(&report).unwrap();
        let keys: Vec<&String> = json["kinds"].as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["machines", "users"]);
        assert_eq!(json["scope"], "primary");
        assert!(json.get("warnings").is_none());
    }
}
