//! Prefix configuration and schema commands.

use super::print_json;
use anyhow::{bail, Context, Result};
use std::path::Path;
use tracing::{info, warn};
use vload_core::config::StoreBackend;
use vload_core::model::LoadConfiguration;
use vload_core::store::{PostgresStateStore, SCHEMA_DDL};
use vload_core::{Config, Services, StoreError};

/// Parse a prefix configuration document. `.json` files are read as JSON,
/// everything else as TOML.
pub fn parse_configuration(path: &Path, content: &str) -> Result<LoadConfiguration> {
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let config: LoadConfiguration = if is_json {
        serde_json::from_str(content).context("Failed to parse prefix configuration JSON")?
    } else {
        toml::from_str(content).context("Failed to parse prefix configuration TOML")?
    };
    config.validate()?;
    Ok(config)
}

/// Create or update a prefix configuration.
///
/// The store keeps the current-batch pointer and last rotation of an
/// existing prefix, so the printed configuration is re-read after writing.
pub async fn apply(config: Config, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let load_config = parse_configuration(file, &content)?;
    let prefix = load_config.prefix.clone();

    let services = Services::from_config(&config).await?;
    match services.store.get_config(&prefix).await? {
        Some(existing) if existing.current_batch != load_config.current_batch => {
            warn!(
                prefix = %prefix,
                current_batch = %existing.current_batch,
                "Keeping the stored current batch"
            );
        }
        Some(_) => info!(prefix = %prefix, "Updating prefix configuration"),
        None => info!(
            prefix = %prefix,
            current_batch = %load_config.current_batch,
            "Creating prefix configuration"
        ),
    }

    services.store.put_config(&load_config).await?;
    match services.store.get_config(&prefix).await? {
        Some(stored) => print_json(&stored),
        None => Err(vload_core::Error::from(StoreError::NotFound(format!(
            "configuration for {prefix}"
        )))
        .into()),
    }
}

/// Print a prefix configuration.
pub async fn show(config: Config, prefix: &str) -> Result<()> {
    let services = Services::from_config(&config).await?;
    match services.store.get_config(prefix).await? {
        Some(load_config) => print_json(&load_config),
        None => Err(vload_core::Error::from(StoreError::NotFound(format!(
            "configuration for {prefix}"
        )))
        .into()),
    }
}

/// Create the state store tables.
pub async fn init_schema(config: Config) -> Result<()> {
    if config.store.backend != StoreBackend::Postgres {
        bail!("Schema bootstrap needs the postgres store backend");
    }
    let connection_string = config
        .store
        .connection_string
        .as_deref()
        .context("store.connection_string is required for the postgres backend")?;

    let store = PostgresStateStore::connect(connection_string, config.store.max_pool_size)
        .map_err(vload_core::Error::from)?;
    store.ensure_schema().await.map_err(vload_core::Error::from)?;

    println!("State store schema is in place");
    Ok(())
}

pub fn print_schema() {
    println!("{}", SCHEMA_DDL.trim());
}
