//! Serve command: host the engine, the scanner and its batch workers

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::drivers::helm::HelmDriver;
use crate::drivers::DriverRegistry;
use crate::infrastructure::notify::{NoopSink, NotificationSink, WebhookSink};
use crate::infrastructure::postgres::PgStore;
use crate::services::engine::Engine;
use crate::services::scanner::Scanner;

pub async fn execute(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;

    let store = Arc::new(
        PgStore::connect(&config.database)
            .await
            .context("Failed to connect to the entity store")?,
    );
    store
        .provision()
        .await
        .context("Failed to ensure the database schema")?;

    let mut registry = DriverRegistry::new();
    registry.register(Arc::new(
        HelmDriver::new().context("Failed to set up the helm driver")?,
    ));

    let sink: Arc<dyn NotificationSink> = match &config.notifications.webhook_url {
        Some(url) => {
            info!("Sending lifecycle events to {url}");
            Arc::new(WebhookSink::new(url))
        }
        None => Arc::new(NoopSink),
    };

    let engine = Arc::new(Engine::new(store, registry, sink, &config));
    let scanner = Scanner::new(engine, &config.scanner);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received ctrl-c, shutting down");
            signal_token.cancel();
        }
    });

    scanner.run(shutdown).await;
    info!("Bye");
    Ok(())
}
