use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod cli;
mod config;
mod db;
mod error;
mod handlers;
mod migration;
mod repository;
mod routing;
mod schema;
mod secrets;
mod service;
mod store;
#[cfg(test)]
mod test_helpers;
mod tester;

use crate::config::{
    DatabaseConfig, ErasureCloudConfig, FileConfig, PrivateCloudConfig, load_config,
};
use crate::db::Database;
use crate::migration::MigrationSettings;
use crate::repository::TenantRepository;
use crate::routing::{StoreFactory, TenantContextResolver};
use crate::secrets::SecretBox;
use crate::service::PrivateCloudService;
use crate::tester::ConnectionTester;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "erasure-cloud")]
#[command(about = "Multi-tenant erasure reporting backend with private-cloud routing")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.erasure-cloud)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server in the foreground
    Serve(ServeArgs),

    /// Print the tables a private store must provide
    Tables,

    /// Copy a tenant's rows into its private store
    Migrate(MigrateArgs),

    /// Probe a tenant's configured private store
    TestConnection(TenantArgs),
}

#[derive(Parser)]
struct ServeArgs {
    /// Port for the web server (overrides config.toml)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides config.toml)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Parser)]
struct MigrateArgs {
    /// Tenant email
    #[arg(long)]
    tenant: String,

    /// Only users, subusers, audit reports and machines
    #[arg(long)]
    primary_only: bool,
}

#[derive(Parser)]
struct TenantArgs {
    /// Tenant email
    #[arg(long)]
    tenant: String,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub config: Arc<ErasureCloudConfig>,
    pub db: Arc<Database>,
    pub service: Arc<PrivateCloudService>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let debug = matches!(&cli.command, Commands::Serve(args) if args.debug);
    init_tracing(debug);

    let config = ErasureCloudConfig::new(cli.data_dir.clone())?;

    match cli.command {
        Commands::Tables => {
            cli::tables_command();
            Ok(())
        }
        Commands::Serve(args) => run_server(args, config).await,
        Commands::Migrate(args) => {
            let (state, _) = build_state(config).await?;
            cli::migrate_command(&state, &args.tenant, args.primary_only).await
        }
        Commands::TestConnection(args) => {
            let (state, _) = build_state(config).await?;
            cli::test_connection_command(&state, &args.tenant).await
        }
    }
}

fn init_tracing(debug: bool) {
    let default_directive = if debug {
        "erasure_cloud=debug,tower_http=debug,info"
    } else {
        "erasure_cloud=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

/// Load layered config, open the shared store and wire the private-cloud service.
async fn build_state(config: ErasureCloudConfig) -> Result<(AppState, FileConfig)> {
    let file_config: FileConfig = load_config(&config.data_dir)
        .extract()
        .with_context(|| {
            format!(
                "Failed to load configuration from {}",
                config.config_toml_path().display()
            )
        })?;

    let secrets = SecretBox::from_config_key(&file_config.security.encryption_key)?;
    let db_config = DatabaseConfig::from_file(&file_config.database, &config);
    let db = Arc::new(Database::new(&db_config).await?);

    let pc = PrivateCloudConfig::from_file(&file_config.private_cloud);
    info!(
        "Private cloud: connect_timeout={}s, migration_timeout={}s, batch_size={}, default_role={}",
        pc.connect_timeout.as_secs(),
        pc.migration_timeout.as_secs(),
        pc.batch_size,
        pc.default_role
    );

    let resolver =
        TenantContextResolver::new(TenantRepository::new(db.store.clone()), secrets.clone());
    let factory = Arc::new(StoreFactory::new(
        db.store.clone(),
        resolver,
        pc.pool_max_connections,
        pc.connect_timeout,
    ));
    let service = Arc::new(PrivateCloudService::new(
        factory,
        ConnectionTester::new(pc.connect_timeout),
        secrets,
        MigrationSettings::from_config(&pc),
    ));

    let state = AppState {
        config: Arc::new(config),
        db,
        service,
    };
    Ok((state, file_config))
}

async fn run_server(args: ServeArgs, config: ErasureCloudConfig) -> Result<()> {
    info!("Starting erasure cloud backend");

    let (app_state, file_config) = build_state(config).await?;
    let host = args.host.unwrap_or(file_config.server.host);
    let port = args.port.unwrap_or(file_config.server.port);

    let app = handlers::routes()
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(app_state.clone());

    let addr = format!("{}:{}", host, port).parse::<SocketAddr>()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Listening on http://{}", actual_addr);
    info!("API endpoints:");
    info!("  POST   /api/private-cloud/complete-setup  - Save, test, provision and activate");
    info!("  POST   /api/private-cloud/migrate/all     - Copy tenant rows to the private store");
    info!("  GET    /api/private-cloud/routing         - Where this tenant's requests land");

    let shutdown_signal = async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, cleaning up...");
        }
    };

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    app_state.db.store.close().await;
    info!("Shutdown complete");
    server_result
}
