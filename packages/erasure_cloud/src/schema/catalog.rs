//! The thirteen migratable entity kinds and their table layouts.
//!
//! [`EntityKind::ALL`] is the dependency order: reference tables first, then
//! the tenant record, then rows owned by the tenant, then the role links.
//! Table creation and migration both walk it front to back.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::store::ColumnType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
    pub default: Option<&'static str>,
}

const fn id() -> ColumnDef {
    req("id", ColumnType::Int)
}

const fn req(name: &'static str, ty: ColumnType) -> ColumnDef {
    ColumnDef {
        name,
        ty,
        nullable: false,
        default: None,
    }
}

const fn opt(name: &'static str, ty: ColumnType) -> ColumnDef {
    ColumnDef {
        name,
        ty,
        nullable: true,
        default: None,
    }
}

const fn flag(name: &'static str, default: &'static str) -> ColumnDef {
    ColumnDef {
        name,
        ty: ColumnType::Int,
        nullable: false,
        default: Some(default),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: &'static str,
    pub references: &'static str,
}

/// Physical layout of one table. The first column is always the `id` key.
#[derive(Debug, PartialEq, Eq)]
pub struct TableDef {
    pub name: &'static str,
    pub columns: &'static [ColumnDef],
    pub unique: &'static [&'static str],
    pub foreign_keys: &'static [ForeignKey],
    pub indexes: &'static [&'static str],
}

impl TableDef {
    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }
}

pub static ROLES: TableDef = TableDef {
    name: "roles",
    columns: &[
        id(),
        req("role_name", ColumnType::Text),
        opt("description", ColumnType::Body),
        opt("hierarchy_level", ColumnType::Int),
        opt("created_at", ColumnType::Int),
    ],
    unique: &["role_name"],
    foreign_keys: &[],
    indexes: &[],
};

pub static PERMISSIONS: TableDef = TableDef {
    name: "permissions",
    columns: &[
        id(),
        req("permission_name", ColumnType::Text),
        opt("description", ColumnType::Body),
        opt("created_at", ColumnType::Int),
    ],
    unique: &["permission_name"],
    foreign_keys: &[],
    indexes: &[],
};

pub static ROLE_PERMISSIONS: TableDef = TableDef {
    name: "role_permissions",
    columns: &[
        id(),
        req("role_id", ColumnType::Int),
        req("permission_id", ColumnType::Int),
        opt("created_at", ColumnType::Int),
    ],
    unique: &[],
    foreign_keys: &[
        ForeignKey {
            column: "role_id",
            references: "roles",
        },
        ForeignKey {
            column: "permission_id",
            references: "permissions",
        },
    ],
    indexes: &["role_id"],
};

pub static ROUTES: TableDef = TableDef {
    name: "routes",
    columns: &[
        id(),
        req("route_path", ColumnType::Text),
        req("http_method", ColumnType::Text),
        opt("required_permission", ColumnType::Text),
        opt("description", ColumnType::Body),
        opt("created_at", ColumnType::Int),
    ],
    unique: &[],
    foreign_keys: &[],
    indexes: &["route_path"],
};

pub static USERS: TableDef = TableDef {
    name: "users",
    columns: &[
        id(),
        req("user_email", ColumnType::Text),
        opt("user_name", ColumnType::Text),
        opt("phone_number", ColumnType::Text),
        flag("is_private_cloud", "0"),
        flag("private_api", "0"),
        opt("created_at", ColumnType::Int),
        opt("updated_at", ColumnType::Int),
    ],
    unique: &["user_email"],
    foreign_keys: &[],
    indexes: &[],
};

pub static SUBUSERS: TableDef = TableDef {
    name: "subusers",
    columns: &[
        id(),
        req("subuser_email", ColumnType::Text),
        req("user_email", ColumnType::Text),
        opt("subuser_name", ColumnType::Text),
        opt("department", ColumnType::Text),
        flag("is_active", "1"),
        opt("created_at", ColumnType::Int),
    ],
    unique: &["subuser_email"],
    foreign_keys: &[],
    indexes: &["user_email"],
};

pub static AUDIT_REPORTS: TableDef = TableDef {
    name: "audit_reports",
    columns: &[
        id(),
        req("client_email", ColumnType::Text),
        opt("report_name", ColumnType::Text),
        opt("erasure_method", ColumnType::Text),
        opt("report_details_json", ColumnType::Body),
        flag("synced", "0"),
        opt("created_at", ColumnType::Int),
    ],
    unique: &[],
    foreign_keys: &[],
    indexes: &["client_email"],
};

pub static MACHINES: TableDef = TableDef {
    name: "machines",
    columns: &[
        id(),
        req("fingerprint_hash", ColumnType::Text),
        opt("mac_address", ColumnType::Text),
        opt("user_email", ColumnType::Text),
        opt("subuser_email", ColumnType::Text),
        opt("os_version", ColumnType::Text),
        flag("license_activated", "0"),
        opt("created_at", ColumnType::Int),
    ],
    unique: &[],
    foreign_keys: &[],
    indexes: &["user_email", "subuser_email"],
};

pub static SESSIONS: TableDef = TableDef {
    name: "sessions",
    columns: &[
        id(),
        req("user_email", ColumnType::Text),
        opt("ip_address", ColumnType::Text),
        opt("device_info", ColumnType::Text),
        opt("login_time", ColumnType::Int),
        opt("logout_time", ColumnType::Int),
        opt("session_status", ColumnType::Text),
    ],
    unique: &[],
    foreign_keys: &[],
    indexes: &["user_email"],
};

pub static COMMANDS: TableDef = TableDef {
    name: "commands",
    columns: &[
        id(),
        opt("user_email", ColumnType::Text),
        req("command_text", ColumnType::Body),
        opt("command_json", ColumnType::Body),
        opt("command_status", ColumnType::Text),
        opt("issued_at", ColumnType::Int),
    ],
    unique: &[],
    foreign_keys: &[],
    indexes: &["user_email"],
};

pub static LOGS: TableDef = TableDef {
    name: "logs",
    columns: &[
        id(),
        opt("user_email", ColumnType::Text),
        opt("log_level", ColumnType::Text),
        opt("log_message", ColumnType::Body),
        opt("log_details_json", ColumnType::Body),
        opt("created_at", ColumnType::Int),
    ],
    unique: &[],
    foreign_keys: &[],
    indexes: &["user_email"],
};

pub static USER_ROLES: TableDef = TableDef {
    name: "user_roles",
    columns: &[
        id(),
        req("user_id", ColumnType::Int),
        req("role_id", ColumnType::Int),
        opt("assigned_by", ColumnType::Text),
        opt("assigned_at", ColumnType::Int),
    ],
    unique: &[],
    foreign_keys: &[
        ForeignKey {
            column: "user_id",
            references: "users",
        },
        ForeignKey {
            column: "role_id",
            references: "roles",
        },
    ],
    indexes: &["user_id"],
};

pub static SUBUSER_ROLES: TableDef = TableDef {
    name: "subuser_roles",
    columns: &[
        id(),
        req("subuser_id", ColumnType::Int),
        req("role_id", ColumnType::Int),
        opt("assigned_by", ColumnType::Text),
        opt("assigned_at", ColumnType::Int),
    ],
    unique: &[],
    foreign_keys: &[
        ForeignKey {
            column: "subuser_id",
            references: "subusers",
        },
        ForeignKey {
            column: "role_id",
            references: "roles",
        },
    ],
    indexes: &["subuser_id"],
};

/// Private-cloud registry. Lives only in the shared store; never migrated.
pub static PRIVATE_CLOUD_DATABASES: TableDef = TableDef {
    name: "private_cloud_databases",
    columns: &[
        id(),
        req("user_email", ColumnType::Text),
        req("database_type", ColumnType::Text),
        req("connection_string", ColumnType::Body),
        opt("notes", ColumnType::Body),
        opt("selected_tables", ColumnType::Body),
        req("status", ColumnType::Text),
        flag("is_active", "1"),
        opt("last_tested_at", ColumnType::Int),
        opt("last_test_message", ColumnType::Body),
        opt("schema_initialized_at", ColumnType::Int),
        req("created_at", ColumnType::Int),
        req("updated_at", ColumnType::Int),
    ],
    unique: &["user_email"],
    foreign_keys: &[],
    indexes: &[],
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityClass {
    /// Shared by every tenant; copied whole.
    Reference,
    /// Owned by the tenant or its sub-identities.
    TenantScoped,
    /// Role assignments keyed by ids resolved in the tenant-scoped pass.
    Linking,
}

/// Which source rows belong to the migrating tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Unfiltered,
    /// `column = tenant email`
    TenantEmail(&'static str),
    /// Any of the columns holds the tenant's or a sub-identity's email.
    OwnerEmails(&'static [&'static str]),
    /// `column = tenant's user id`
    TenantUserId(&'static str),
    /// `column ∈ ids of the tenant's sub-identities`
    SubuserIds(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Roles,
    Permissions,
    RolePermissions,
    Routes,
    Users,
    Subusers,
    AuditReports,
    Machines,
    Sessions,
    Commands,
    Logs,
    UserRoles,
    SubuserRoles,
}

impl EntityKind {
    pub const ALL: [EntityKind; 13] = [
        EntityKind::Roles,
        EntityKind::Permissions,
        EntityKind::RolePermissions,
        EntityKind::Routes,
        EntityKind::Users,
        EntityKind::Subusers,
        EntityKind::AuditReports,
        EntityKind::Machines,
        EntityKind::Sessions,
        EntityKind::Commands,
        EntityKind::Logs,
        EntityKind::UserRoles,
        EntityKind::SubuserRoles,
    ];

    pub fn table(&self) -> &'static TableDef {
        match self {
            Self::Roles => &ROLES,
            Self::Permissions => &PERMISSIONS,
            Self::RolePermissions => &ROLE_PERMISSIONS,
            Self::Routes => &ROUTES,
            Self::Users => &USERS,
            Self::Subusers => &SUBUSERS,
            Self::AuditReports => &AUDIT_REPORTS,
            Self::Machines => &MACHINES,
            Self::Sessions => &SESSIONS,
            Self::Commands => &COMMANDS,
            Self::Logs => &LOGS,
            Self::UserRoles => &USER_ROLES,
            Self::SubuserRoles => &SUBUSER_ROLES,
        }
    }

    pub fn table_name(&self) -> &'static str {
        self.table().name
    }

    pub fn class(&self) -> EntityClass {
        match self {
            Self::Roles | Self::Permissions | Self::RolePermissions | Self::Routes => {
                EntityClass::Reference
            }
            Self::UserRoles | Self::SubuserRoles => EntityClass::Linking,
            Self::Users
            | Self::Subusers
            | Self::AuditReports
            | Self::Machines
            | Self::Sessions
            | Self::Commands
            | Self::Logs => EntityClass::TenantScoped,
        }
    }

    pub fn ownership(&self) -> Ownership {
        match self {
            Self::Roles | Self::Permissions | Self::RolePermissions | Self::Routes => {
                Ownership::Unfiltered
            }
            Self::Users | Self::Subusers => Ownership::TenantEmail("user_email"),
            Self::AuditReports => Ownership::OwnerEmails(&["client_email"]),
            Self::Machines => Ownership::OwnerEmails(&["user_email", "subuser_email"]),
            Self::Sessions | Self::Commands | Self::Logs => {
                Ownership::OwnerEmails(&["user_email"])
            }
            Self::UserRoles => Ownership::TenantUserId("user_id"),
            Self::SubuserRoles => Ownership::SubuserIds("subuser_id"),
        }
    }

    /// Position in the dependency order.
    #[cfg(test)]
    pub fn rank(&self) -> usize {
        Self::ALL.iter().position(|k| k == self).unwrap_or(usize::MAX)
    }

    pub fn from_table_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.table_name() == name)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_table_name(s.trim()).ok_or_else(|| format!("unknown table: {s}"))
    }
}

/// Kinds copied by the primary-tables-only migration.
pub const PRIMARY_KINDS: [EntityKind; 4] = [
    EntityKind::Users,
    EntityKind::Subusers,
    EntityKind::AuditReports,
    EntityKind::Machines,
];

/// Table names in creation order.
pub fn required_tables() -> Vec<&'static str> {
    EntityKind::ALL.iter().map(EntityKind::table_name).collect()
}
