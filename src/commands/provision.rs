//! Provision command: prepare the database schema

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

use crate::config::Config;
use crate::infrastructure::postgres::PgStore;

pub async fn execute(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;

    let store = PgStore::connect(&config.database)
        .await
        .context("Failed to connect to the entity store")?;
    store
        .provision()
        .await
        .context("Failed to create the schema")?;

    info!("✅ Schema provisioned");
    Ok(())
}
