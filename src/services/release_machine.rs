//! ReleaseApp state machine
//!
//! Two symmetric halves (pre decade 20-24, prod decade 30-34). Each half
//! waits for dependencies, fans out one deployment per configured
//! (env, cluster) target, then rolls the deployment results back up.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::{
    Batch, Build, BuildStatus, DeployState, Env, NewDeployment, ReleaseApp, ReleaseStatus,
};
use crate::error::{CoreError, CoreResult};
use crate::infrastructure::notify::{NotificationSink, NotifyKind};
use crate::infrastructure::store::Store;
use crate::services::dependency;

/// Per-stage status vocabulary
struct StageStatuses {
    waiting: ReleaseStatus,
    can_trigger: ReleaseStatus,
    triggered: ReleaseStatus,
    deployed: ReleaseStatus,
    failed: ReleaseStatus,
}

fn stage_statuses(stage: Env) -> StageStatuses {
    match stage {
        Env::Pre => StageStatuses {
            waiting: ReleaseStatus::PreWaiting,
            can_trigger: ReleaseStatus::PreCanTrigger,
            triggered: ReleaseStatus::PreTriggered,
            deployed: ReleaseStatus::PreDeployed,
            failed: ReleaseStatus::PreFailed,
        },
        Env::Prod => StageStatuses {
            waiting: ReleaseStatus::ProdWaiting,
            can_trigger: ReleaseStatus::ProdCanTrigger,
            triggered: ReleaseStatus::ProdTriggered,
            deployed: ReleaseStatus::ProdDeployed,
            failed: ReleaseStatus::ProdFailed,
        },
    }
}

/// Drives release apps through their per-stage lifecycle
pub struct ReleaseMachine<S: Store> {
    store: Arc<S>,
    sink: Arc<dyn NotificationSink>,
    type_rules: HashMap<String, Vec<String>>,
}

impl<S: Store> ReleaseMachine<S> {
    pub fn new(
        store: Arc<S>,
        sink: Arc<dyn NotificationSink>,
        type_rules: HashMap<String, Vec<String>>,
    ) -> Self {
        Self {
            store,
            sink,
            type_rules,
        }
    }

    /// Advance one release app by at most one state
    pub async fn process(&self, batch: &Batch, release: &ReleaseApp) -> CoreResult<()> {
        match release.status {
            ReleaseStatus::PreWaiting => self.handle_waiting(batch, release, Env::Pre).await,
            ReleaseStatus::PreCanTrigger => self.handle_trigger(batch, release, Env::Pre).await,
            ReleaseStatus::PreTriggered => self.handle_rollup(batch, release, Env::Pre).await,
            ReleaseStatus::ProdWaiting => self.handle_waiting(batch, release, Env::Prod).await,
            ReleaseStatus::ProdCanTrigger => self.handle_trigger(batch, release, Env::Prod).await,
            ReleaseStatus::ProdTriggered => self.handle_rollup(batch, release, Env::Prod).await,
            // Pending/Tagged are batch-driven; the rest are inert.
            _ => Ok(()),
        }
    }

    /// Gate the stage on the other apps in the batch
    async fn handle_waiting(
        &self,
        batch: &Batch,
        release: &ReleaseApp,
        stage: Env,
    ) -> CoreResult<()> {
        let statuses = stage_statuses(stage);
        let peers = self.store.release_apps_of_batch(batch.id).await?;
        let app_ids: Vec<i64> = peers.iter().map(|p| p.app_id).collect();
        let apps = self.store.applications(&app_ids).await?;

        let report = dependency::resolve(release, stage, &peers, &apps, &self.type_rules);

        if !report.failed.is_empty() {
            let reason = report.failure_reason();
            warn!(
                "Release {} cannot start its {stage} wave: {reason}",
                release.id
            );
            let updated = self
                .transition(release.id, statuses.waiting, statuses.failed, Some(reason))
                .await?;
            self.notify_failed(batch, &updated).await;
            return Ok(());
        }
        if !report.pending.is_empty() {
            let reason = report.pending_reason();
            if release.reason != reason {
                self.store
                    .update_release_app(release.id, move |r| {
                        if r.status != statuses.waiting {
                            return Err(CoreError::StatusConflict {
                                entity: "release_app",
                                id: r.id,
                            });
                        }
                        r.reason = reason;
                        Ok(())
                    })
                    .await?;
            }
            return Ok(());
        }

        debug!("Release {} is clear to start its {stage} wave", release.id);
        self.transition(
            release.id,
            statuses.waiting,
            statuses.can_trigger,
            Some(String::new()),
        )
        .await?;
        Ok(())
    }

    /// Fan out one deployment per configured (env, cluster) target
    async fn handle_trigger(
        &self,
        batch: &Batch,
        release: &ReleaseApp,
        stage: Env,
    ) -> CoreResult<()> {
        let statuses = stage_statuses(stage);
        let build_id = release.build_id.ok_or_else(|| {
            CoreError::Precondition(format!("release {} has no build committed", release.id))
        })?;
        let build = self.store.build(build_id).await?;

        if build.build_status != BuildStatus::Success {
            // The pinned build may still be in CI; keep waiting.
            let reason = format!(
                "build {} is {} (waiting for success)",
                build.id, build.build_status
            );
            if release.reason != reason {
                self.store
                    .update_release_app(release.id, move |r| {
                        if r.status != statuses.can_trigger {
                            return Err(CoreError::StatusConflict {
                                entity: "release_app",
                                id: r.id,
                            });
                        }
                        r.reason = reason;
                        Ok(())
                    })
                    .await?;
            }
            return Ok(());
        }

        let targets: Vec<String> = self
            .store
            .app_env_configs(release.app_id)
            .await?
            .into_iter()
            .filter(|c| c.env == stage && c.enabled)
            .map(|c| c.cluster)
            .collect();

        if targets.is_empty() {
            // Nothing to install at this stage; count 0 of 0 as deployed.
            info!(
                "Release {} has no {stage} targets, marking wave done",
                release.id
            );
            self.transition(
                release.id,
                statuses.can_trigger,
                statuses.deployed,
                Some(String::new()),
            )
            .await?;
            return Ok(());
        }

        let values = image_values(&build);
        for cluster in targets {
            let existing = self
                .store
                .ensure_deployment(NewDeployment {
                    batch_id: batch.id,
                    app_id: release.app_id,
                    release_id: release.id,
                    env: stage,
                    cluster_name: cluster,
                    values: values.clone(),
                    image_url: build.image_url.clone(),
                    image_tag: Some(build.image_tag.clone()),
                })
                .await?;

            // Re-arm rows left over from a previous attempt: a failed row, or
            // any row carrying a different tag than the committed build.
            let stale_tag = existing.image_tag.as_deref() != Some(build.image_tag.as_str());
            if existing.status == DeployState::Failed || stale_tag {
                let observed = existing.status;
                let values = values.clone();
                let image_tag = build.image_tag.clone();
                let image_url = build.image_url.clone();
                self.store
                    .update_deployment(existing.id, move |d| {
                        if d.status != observed {
                            return Err(CoreError::StatusConflict {
                                entity: "deployment",
                                id: d.id,
                            });
                        }
                        d.status = DeployState::Pending;
                        d.values = values;
                        d.image_tag = Some(image_tag);
                        d.image_url = image_url;
                        d.error_message = None;
                        d.started_at = None;
                        d.finished_at = None;
                        Ok(())
                    })
                    .await?;
            }
        }

        info!("Release {} triggered its {stage} wave", release.id);
        self.transition(
            release.id,
            statuses.can_trigger,
            statuses.triggered,
            Some(String::new()),
        )
        .await?;
        Ok(())
    }

    /// Aggregate deployment results for the stage
    async fn handle_rollup(
        &self,
        batch: &Batch,
        release: &ReleaseApp,
        stage: Env,
    ) -> CoreResult<()> {
        let statuses = stage_statuses(stage);
        let deployments = self.store.deployments_of_release(release.id, stage).await?;
        let expected = self
            .store
            .app_env_configs(release.app_id)
            .await?
            .into_iter()
            .filter(|c| c.env == stage && c.enabled)
            .count();

        if let Some(failed) = deployments
            .iter()
            .find(|d| d.status == DeployState::Failed)
        {
            let reason = failed
                .error_message
                .clone()
                .unwrap_or_else(|| format!("deployment {} failed", failed.id));
            let updated = self
                .transition(release.id, statuses.triggered, statuses.failed, Some(reason))
                .await?;
            self.notify_failed(batch, &updated).await;
            return Ok(());
        }

        let succeeded = deployments
            .iter()
            .filter(|d| d.status == DeployState::Success)
            .count();
        if expected > 0 && succeeded == expected && deployments.len() == expected {
            info!("Release {} finished its {stage} wave", release.id);
            self.transition(
                release.id,
                statuses.triggered,
                statuses.deployed,
                Some(String::new()),
            )
            .await?;
        }
        Ok(())
    }

    async fn transition(
        &self,
        release_id: i64,
        expect: ReleaseStatus,
        to: ReleaseStatus,
        reason: Option<String>,
    ) -> CoreResult<ReleaseApp> {
        self.store
            .update_release_app(release_id, move |r| {
                if r.status != expect {
                    return Err(CoreError::StatusConflict {
                        entity: "release_app",
                        id: r.id,
                    });
                }
                r.status = to;
                if let Some(reason) = reason {
                    r.reason = reason;
                }
                Ok(())
            })
            .await
    }

    async fn notify_failed(&self, batch: &Batch, release: &ReleaseApp) {
        self.sink
            .send(
                NotifyKind::BatchFailed,
                json!({
                    "batch_id": batch.id,
                    "batch_number": batch.batch_number,
                    "release_id": release.id,
                    "app_id": release.app_id,
                    "status": release.status.name(),
                    "reason": release.reason,
                }),
            )
            .await;
    }
}

/// Standard image override layer handed to drivers
fn image_values(build: &Build) -> serde_json::Value {
    match &build.image_url {
        Some(url) => json!({"image": {"tag": build.image_tag, "repository": url}}),
        None => json!({"image": {"tag": build.image_tag}}),
    }
}
