//! Deployment state machine
//!
//! pending -> running -> success | failed. Both terminal states stick: a
//! failed deployment is only ever revived by a version switch re-arming the
//! owning release app. Driver invocations happen outside any transaction;
//! only the resulting status change is optimistically locked.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::{DeployState, Deployment, DriverStage, RenderContext};
use crate::drivers::{DriverRegistry, DriverStatus, ExecContext};
use crate::error::{CoreError, CoreResult};
use crate::infrastructure::notify::{NotificationSink, NotifyKind};
use crate::infrastructure::store::Store;

/// Drives single deployments through their lifecycle
pub struct DeployMachine<S: Store> {
    store: Arc<S>,
    registry: DriverRegistry,
    sink: Arc<dyn NotificationSink>,
}

/// Joined context assembled once per handler invocation
struct Prepared {
    ctx: ExecContext,
    driver_key: String,
}

impl<S: Store> DeployMachine<S> {
    pub fn new(store: Arc<S>, registry: DriverRegistry, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            store,
            registry,
            sink,
        }
    }

    /// Advance one deployment by at most one state
    pub async fn process(&self, deployment: &Deployment) -> CoreResult<()> {
        match deployment.status {
            DeployState::Pending => self.handle_pending(deployment).await,
            DeployState::Running => self.handle_running(deployment).await,
            DeployState::Success | DeployState::Failed => Ok(()),
        }
    }

    /// Join the entity graph and render namespace + release name
    async fn prepare(&self, deployment: &Deployment) -> CoreResult<Prepared> {
        let app = self.store.application(deployment.app_id).await?;
        let repo = self.store.repository(app.repo_id).await?;
        let project = self.store.project(app.project_id).await?;
        let env_config = self
            .store
            .project_env_config(app.project_id, deployment.env)
            .await?;
        let cluster = self.store.cluster(&deployment.cluster_name).await?;

        let render = RenderContext {
            app_name: app.name.clone(),
            app_type: app.app_type.clone(),
            project: project.name.clone(),
            env: deployment.env.as_str().to_string(),
            cluster: cluster.name.clone(),
            repo_namespace: repo.namespace.clone(),
            repo_name: repo.name.clone(),
            repo_full_name: repo.full_name(),
            repo_app_count: repo.app_count,
            image_tag: deployment.image_tag.clone().unwrap_or_default(),
        };
        let namespace = render.expand(&env_config.artifacts.namespace_template)?;
        let release_name = render.expand(
            env_config
                .artifacts
                .release_name_template
                .as_deref()
                .unwrap_or("{app_name}"),
        )?;

        let kubeconfig = match &cluster.kubeconfig {
            Some(encoded) => {
                let bytes = BASE64.decode(encoded).map_err(|e| {
                    CoreError::Internal(anyhow::anyhow!(
                        "kubeconfig for cluster {} is not valid base64: {e}",
                        cluster.name
                    ))
                })?;
                Some(String::from_utf8(bytes).map_err(|e| {
                    CoreError::Internal(anyhow::anyhow!(
                        "kubeconfig for cluster {} is not valid utf-8: {e}",
                        cluster.name
                    ))
                })?)
            }
            None => None,
        };

        Ok(Prepared {
            driver_key: env_config.artifacts.main.driver.clone(),
            ctx: ExecContext {
                app_name: app.name,
                env: deployment.env,
                cluster: cluster.name,
                namespace,
                release_name,
                artifacts: env_config.artifacts,
                values: deployment.values.clone(),
                image_tag: deployment.image_tag.clone(),
                kubeconfig,
            },
        })
    }

    async fn handle_pending(&self, deployment: &Deployment) -> CoreResult<()> {
        let prepared = match self.prepare(deployment).await {
            Ok(prepared) => prepared,
            // A broken template is a configuration problem, not a transient
            // one: fail the row so the operator sees it.
            Err(CoreError::Template(message)) => {
                return self.fail(deployment, DeployState::Pending, &message).await;
            }
            Err(e) => return Err(e),
        };
        let Some(driver) = self.registry.get(&prepared.driver_key) else {
            return self
                .fail(
                    deployment,
                    DeployState::Pending,
                    &format!("driver {} is not registered", prepared.driver_key),
                )
                .await;
        };

        // Config chart first, synchronously, when the spec carries one.
        if prepared.ctx.artifacts.stage(DriverStage::Pre).is_some() {
            match driver.execute(DriverStage::Pre, &prepared.ctx).await {
                Ok(DriverStatus::Failed(message)) => {
                    return self.fail(deployment, DeployState::Pending, &message).await;
                }
                Err(e) => {
                    return self
                        .fail(deployment, DeployState::Pending, &e.to_string())
                        .await;
                }
                Ok(_) => {}
            }
        }

        match driver.execute(DriverStage::Main, &prepared.ctx).await {
            Ok(DriverStatus::Failed(message)) => {
                return self.fail(deployment, DeployState::Pending, &message).await;
            }
            Err(e) => {
                return self
                    .fail(deployment, DeployState::Pending, &e.to_string())
                    .await;
            }
            Ok(_) => {}
        }

        info!(
            "Deployment {} started: {} -> {}/{}",
            deployment.id, prepared.ctx.release_name, deployment.cluster_name, prepared.ctx.namespace
        );

        let namespace = prepared.ctx.namespace.clone();
        let deployment_name = prepared.ctx.release_name.clone();
        let driver_key = prepared.driver_key.clone();
        let updated = self
            .store
            .update_deployment(deployment.id, move |d| {
                if d.status != DeployState::Pending {
                    return Err(CoreError::StatusConflict {
                        entity: "deployment",
                        id: d.id,
                    });
                }
                d.status = DeployState::Running;
                d.started_at = Some(Utc::now());
                d.namespace = namespace;
                d.deployment_name = deployment_name;
                d.driver_type = Some(driver_key);
                Ok(())
            })
            .await?;

        self.sink
            .send(NotifyKind::DeployStart, self.payload(&updated, None))
            .await;
        Ok(())
    }

    async fn handle_running(&self, deployment: &Deployment) -> CoreResult<()> {
        let prepared = self.prepare(deployment).await?;
        let driver_key = deployment
            .driver_type
            .clone()
            .unwrap_or(prepared.driver_key);
        let Some(driver) = self.registry.get(&driver_key) else {
            return self
                .fail(
                    deployment,
                    DeployState::Running,
                    &format!("driver {driver_key} is not registered"),
                )
                .await;
        };

        match driver.check_status(DriverStage::Main, &prepared.ctx).await {
            Ok(DriverStatus::Success) => {
                let updated = self
                    .store
                    .update_deployment(deployment.id, |d| {
                        if d.status != DeployState::Running {
                            return Err(CoreError::StatusConflict {
                                entity: "deployment",
                                id: d.id,
                            });
                        }
                        d.status = DeployState::Success;
                        d.finished_at = Some(Utc::now());
                        d.error_message = None;
                        Ok(())
                    })
                    .await?;
                info!("Deployment {} succeeded", deployment.id);
                self.sink
                    .send(NotifyKind::DeploySuccess, self.payload(&updated, None))
                    .await;
                Ok(())
            }
            Ok(DriverStatus::Failed(message)) => {
                self.fail(deployment, DeployState::Running, &message).await
            }
            Err(e) => self.fail(deployment, DeployState::Running, &e.to_string()).await,
            Ok(DriverStatus::Running(message)) => {
                debug!("Deployment {} still rolling out: {message}", deployment.id);
                Ok(())
            }
        }
    }

    /// Terminal failure of this row; the release machine rolls it up
    async fn fail(
        &self,
        deployment: &Deployment,
        expected: DeployState,
        message: &str,
    ) -> CoreResult<()> {
        warn!("Deployment {} failed: {message}", deployment.id);
        let message = message.to_string();
        let updated = self
            .store
            .update_deployment(deployment.id, move |d| {
                if d.status != expected {
                    return Err(CoreError::StatusConflict {
                        entity: "deployment",
                        id: d.id,
                    });
                }
                d.status = DeployState::Failed;
                d.error_message = Some(message);
                d.finished_at = Some(Utc::now());
                d.retry_count += 1;
                Ok(())
            })
            .await?;
        self.sink
            .send(
                NotifyKind::DeployFailed,
                self.payload(&updated, updated.error_message.as_deref()),
            )
            .await;
        Ok(())
    }

    fn payload(&self, deployment: &Deployment, error: Option<&str>) -> serde_json::Value {
        json!({
            "deployment_id": deployment.id,
            "batch_id": deployment.batch_id,
            "app_id": deployment.app_id,
            "release_id": deployment.release_id,
            "env": deployment.env.as_str(),
            "cluster": deployment.cluster_name,
            "namespace": deployment.namespace,
            "image_tag": deployment.image_tag,
            "error": error,
        })
    }
}
