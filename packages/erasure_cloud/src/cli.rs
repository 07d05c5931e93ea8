//! One-shot maintenance commands run against the configured shared store.

use anyhow::{Context, Result};
use erasure_auth::TenantId;
use serde::Serialize;
use tracing::info;

use crate::AppState;
use crate::schema::SchemaProvisioner;

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed to render output")?;
    println!("{out}");
    Ok(())
}

pub fn tables_command() {
    for table in SchemaProvisioner::list_required_tables() {
        println!("{table}");
    }
}

pub async fn migrate_command(state: &AppState, tenant: &str, primary_only: bool) -> Result<()> {
    let tenant = TenantId::parse(tenant)?;
    info!(
        "Migrating {} ({}) using data dir {}",
        tenant,
        if primary_only { "primary tables" } else { "all tables" },
        state.config.data_dir.display()
    );

    let success = if primary_only {
        let response = state.service.migrate_primary_tables(&tenant).await?;
        print_json(&response)?;
        response.success
    } else {
        let response = state.service.migrate_all_tables(&tenant).await?;
        print_json(&response)?;
        response.success
    };

    if !success {
        anyhow::bail!("migration for {} finished with failed rows", tenant);
    }
    Ok(())
}

pub async fn test_connection_command(state: &AppState, tenant: &str) -> Result<()> {
    let tenant = TenantId::parse(tenant)?;
    let result = state.service.test_connection(&tenant).await?;
    print_json(&result)?;
    if !result.success {
        anyhow::bail!("private store for {} is not reachable", tenant);
    }
    Ok(())
}
