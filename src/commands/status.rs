//! Status command for inspecting a release batch
//!
//! Shows the batch, its apps and its deployments by querying the store
//! directly; read-only, safe to run next to a live orchestrator.

use anyhow::Result;
use colored::Colorize;
use serde_json::json;
use std::path::Path;

use crate::config::Config;
use crate::domain::{BatchStatus, DeployState, ReleaseStatus};
use crate::infrastructure::postgres::PgStore;
use crate::infrastructure::store::Store;

/// Output format for status command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Text,
        }
    }
}

pub async fn execute(config_path: &Path, batch_id: i64, format: &str) -> Result<()> {
    let config = Config::load(config_path)?;
    let store = PgStore::connect(&config.database).await?;

    let batch = store.batch(batch_id).await?;
    let releases = store.release_apps_of_batch(batch_id).await?;
    let deployments = store.deployments_of_batch(batch_id).await?;
    let app_ids: Vec<i64> = releases.iter().map(|r| r.app_id).collect();
    let apps = store.applications(&app_ids).await?;
    let app_name =
        |id: i64| -> String { apps.get(&id).map_or_else(|| format!("app {id}"), |a| a.name.clone()) };

    if OutputFormat::from_str(format) == OutputFormat::Json {
        let out = json!({
            "batch_id": batch.id,
            "batch_number": batch.batch_number,
            "status": batch.status.code(),
            "status_name": batch.status.name(),
            "approval_status": batch.approval_status.as_str(),
            "initiator": batch.initiator,
            "apps": releases.iter().map(|r| json!({
                "release_id": r.id,
                "app": app_name(r.app_id),
                "status": r.status.name(),
                "target_tag": r.target_tag,
                "previous_tag": r.previous_deployed_tag,
                "skip_pre_env": r.skip_pre_env,
                "reason": r.reason,
            })).collect::<Vec<_>>(),
            "deployments": deployments.iter().map(|d| json!({
                "deployment_id": d.id,
                "app": app_name(d.app_id),
                "env": d.env.as_str(),
                "cluster": d.cluster_name,
                "namespace": d.namespace,
                "status": d.status.as_str(),
                "image_tag": d.image_tag,
                "error": d.error_message,
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!(
        "Batch #{} (id {}) — {}",
        batch.batch_number,
        batch.id,
        paint_batch(batch.status)
    );
    println!(
        "  initiator: {}  approval: {}",
        batch.initiator, batch.approval_status
    );
    if let Some(reason) = &batch.cancel_reason {
        println!("  cancelled: {}", reason.red());
    }

    if !releases.is_empty() {
        println!("\n  Apps:");
        for release in &releases {
            let tag = release.target_tag.as_deref().unwrap_or("-");
            let mut line = format!(
                "    {:<20} {:<18} {}",
                app_name(release.app_id),
                paint_release(release.status),
                tag
            );
            if let Some(previous) = &release.previous_deployed_tag {
                line.push_str(&format!("  (was {previous})"));
            }
            if !release.reason.is_empty() {
                line.push_str(&format!("  [{}]", release.reason.dimmed()));
            }
            println!("{line}");
        }
    }

    if !deployments.is_empty() {
        println!("\n  Deployments:");
        for d in &deployments {
            let mut line = format!(
                "    {}/{:<12} {:<20} {}",
                d.env,
                d.cluster_name,
                app_name(d.app_id),
                paint_deploy(d.status)
            );
            if let Some(error) = &d.error_message {
                line.push_str(&format!("  {}", error.red()));
            }
            println!("{line}");
        }
    }

    Ok(())
}

fn paint_batch(status: BatchStatus) -> String {
    let name = status.name();
    match status {
        BatchStatus::Completed => name.green().to_string(),
        BatchStatus::Cancelled => name.red().to_string(),
        BatchStatus::Draft | BatchStatus::Sealed => name.normal().to_string(),
        _ => name.yellow().to_string(),
    }
}

fn paint_release(status: ReleaseStatus) -> String {
    let name = status.name();
    if status.is_failed() {
        name.red().to_string()
    } else if status == ReleaseStatus::ProdAccepted {
        name.green().to_string()
    } else {
        name.yellow().to_string()
    }
}

fn paint_deploy(status: DeployState) -> String {
    let name = status.as_str();
    match status {
        DeployState::Success => name.green().to_string(),
        DeployState::Failed => name.red().to_string(),
        _ => name.yellow().to_string(),
    }
}
