use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [private_cloud]
//                    batch_size = 25
//
//   env var:         ERASURE_PRIVATE_CLOUD__BATCH_SIZE=25   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub database: DatabaseFileConfig,
    #[serde(default)]
    pub security: SecurityFileConfig,
    #[serde(default)]
    pub private_cloud: PrivateCloudFileConfig,
}

/// HTTP listener (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Shared store (lives under `[database]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseFileConfig {
    /// Connection URL; defaults to a SQLite file in the data directory.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseFileConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

/// Secret material (lives under `[security]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SecurityFileConfig {
    /// Base64 32-byte key, or a passphrase stretched with SHA-256.
    #[serde(default)]
    pub encryption_key: String,
}

/// Routing and migration tunables (lives under `[private_cloud]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrivateCloudFileConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_migration_timeout_secs")]
    pub migration_timeout_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_role")]
    pub default_role: String,
    #[serde(default = "default_pool_max_connections")]
    pub pool_max_connections: u32,
}

impl Default for PrivateCloudFileConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            migration_timeout_secs: default_migration_timeout_secs(),
            batch_size: default_batch_size(),
            default_role: default_role(),
            pool_max_connections: default_pool_max_connections(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_max_connections() -> u32 {
    10
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_migration_timeout_secs() -> u64 {
    600
}
fn default_batch_size() -> usize {
    10
}
fn default_role() -> String {
    "User".to_string()
}
fn default_pool_max_connections() -> u32 {
    5
}

/// Build a figment that layers: defaults → config.toml → ERASURE_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `ERASURE_DATABASE__URL=postgres://...`  →  `database.url = "postgres://..."`
///   `ERASURE_PRIVATE_CLOUD__DEFAULT_ROLE=Manager`  →  `private_cloud.default_role = "Manager"`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("ERASURE_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

/// Shared store connection (runtime view).
#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn from_file(fc: &DatabaseFileConfig, layout: &ErasureCloudConfig) -> Self {
        Self {
            url: fc.url.clone().unwrap_or_else(|| layout.db_url()),
            max_connections: fc.max_connections.max(1),
        }
    }
}

/// Routing and migration bounds (runtime view).
#[derive(Clone, Debug)]
pub struct PrivateCloudConfig {
    /// Bound on opening and pinging a tenant store.
    pub connect_timeout: Duration,
    /// Bound on one whole migration invocation.
    pub migration_timeout: Duration,
    /// Newly inserted rows per commit.
    pub batch_size: usize,
    /// Role granted to a migrated tenant that has none.
    pub default_role: String,
    pub pool_max_connections: u32,
}

impl PrivateCloudConfig {
    pub fn from_file(fc: &PrivateCloudFileConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(fc.connect_timeout_secs.max(1)),
            migration_timeout: Duration::from_secs(fc.migration_timeout_secs.max(1)),
            batch_size: fc.batch_size.max(1),
            default_role: fc.default_role.clone(),
            pool_max_connections: fc.pool_max_connections.max(1),
        }
    }
}

impl Default for PrivateCloudConfig {
    fn default() -> Self {
        Self::from_file(&PrivateCloudFileConfig::default())
    }
}

// =============================================================================
// Directory layout config (not tunable via figment; derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ErasureCloudConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
}

impl ErasureCloudConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".erasure-cloud"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let db_path = data_dir.join("erasure.db");

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir, db_path })
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
