//! Helm chart driver
//!
//! Installs one chart per stage via `helm upgrade --install` (idempotent by
//! construction) and evaluates readiness through the Kubernetes API. The
//! pre stage is used for config charts and runs with `--wait`; the main
//! stage returns immediately and is polled through `check_status`.

use k8s_openapi::api::apps::v1::{Deployment as K8sDeployment, StatefulSet};
use kube::api::Api;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::io::Write;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, info};

use async_trait::async_trait;

use crate::domain::DriverStage;
use crate::tools::get_tool_path;

use super::{merge_values, Driver, DriverError, DriverStatus, ExecContext};

pub const DRIVER_TYPE: &str = "helm";

/// Driver that shells out to the helm binary
pub struct HelmDriver {
    helm_bin: String,
}

impl HelmDriver {
    /// Resolve and verify the helm binary up front
    pub fn new() -> Result<Self, DriverError> {
        let helm_bin = get_tool_path("helm");
        which::which(&helm_bin).map_err(|e| DriverError::Tool {
            tool: helm_bin.clone(),
            message: e.to_string(),
        })?;
        Ok(Self { helm_bin })
    }

    /// Release name for a stage; config charts get their own release
    fn release_name(stage: DriverStage, ctx: &ExecContext) -> String {
        match stage {
            DriverStage::Pre => format!("{}-config", ctx.release_name),
            DriverStage::Main => ctx.release_name.clone(),
        }
    }

    async fn kube_client(&self, ctx: &ExecContext) -> Result<Client, DriverError> {
        let config = match &ctx.kubeconfig {
            Some(yaml) => {
                let kubeconfig = Kubeconfig::from_yaml(yaml).map_err(|e| DriverError::Tool {
                    tool: "kubeconfig".into(),
                    message: e.to_string(),
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| DriverError::Tool {
                        tool: "kubeconfig".into(),
                        message: e.to_string(),
                    })?
            }
            None => Config::infer().await.map_err(|e| DriverError::Tool {
                tool: "kubeconfig".into(),
                message: e.to_string(),
            })?,
        };
        Client::try_from(config).map_err(DriverError::Kube)
    }

    /// Readiness of the workload behind a deployed release
    ///
    /// Auto-detects Deployment vs StatefulSet; a workload that is not
    /// visible yet counts as still rolling out.
    async fn workload_ready(
        &self,
        ctx: &ExecContext,
        name: &str,
    ) -> Result<DriverStatus, DriverError> {
        let client = self.kube_client(ctx).await?;

        let deployments: Api<K8sDeployment> = Api::namespaced(client.clone(), &ctx.namespace);
        if let Ok(deployment) = deployments.get(name).await {
            let wanted = deployment.spec.and_then(|s| s.replicas).unwrap_or(1);
            let ready = deployment
                .status
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0);
            debug!("Deployment {name}: {ready}/{wanted} replicas ready");
            return Ok(if ready >= wanted {
                DriverStatus::Success
            } else {
                DriverStatus::Running(format!("{ready}/{wanted} replicas ready"))
            });
        }

        let statefulsets: Api<StatefulSet> = Api::namespaced(client, &ctx.namespace);
        if let Ok(sts) = statefulsets.get(name).await {
            let wanted = sts.spec.and_then(|s| s.replicas).unwrap_or(1);
            let ready = sts.status.and_then(|s| s.ready_replicas).unwrap_or(0);
            debug!("StatefulSet {name}: {ready}/{wanted} replicas ready");
            return Ok(if ready >= wanted {
                DriverStatus::Success
            } else {
                DriverStatus::Running(format!("{ready}/{wanted} replicas ready"))
            });
        }

        Ok(DriverStatus::Running(format!(
            "workload {name} not visible yet in {}",
            ctx.namespace
        )))
    }
}

#[async_trait]
impl Driver for HelmDriver {
    fn driver_type(&self) -> &'static str {
        DRIVER_TYPE
    }

    async fn execute(
        &self,
        stage: DriverStage,
        ctx: &ExecContext,
    ) -> Result<DriverStatus, DriverError> {
        let spec = ctx
            .artifacts
            .stage(stage)
            .ok_or(DriverError::MissingStage(stage))?;
        let release = Self::release_name(stage, ctx);

        let merged = merge_values(&spec.values, &ctx.values);
        let values_file = write_temp(&serde_yaml::to_string(&merged)?)?;
        let kubeconfig_file = match &ctx.kubeconfig {
            Some(yaml) => Some(write_temp(yaml)?),
            None => None,
        };

        info!(
            "Installing {} (chart {}) into {}/{}",
            release, spec.chart, ctx.cluster, ctx.namespace
        );

        let mut cmd = Command::new(&self.helm_bin);
        cmd.arg("upgrade")
            .arg("--install")
            .arg(&release)
            .arg(&spec.chart)
            .arg("--namespace")
            .arg(&ctx.namespace)
            .arg("--create-namespace")
            .arg("-f")
            .arg(values_file.path());
        if let Some(version) = &spec.chart_version {
            cmd.arg("--version").arg(version);
        }
        if let Some(file) = &kubeconfig_file {
            cmd.arg("--kubeconfig").arg(file.path());
        }
        if stage == DriverStage::Pre {
            // Config charts are synchronous: hold until resources are ready.
            cmd.arg("--wait");
        }

        let output = cmd.output().await?;
        if output.status.success() {
            Ok(match stage {
                DriverStage::Pre => DriverStatus::Success,
                DriverStage::Main => DriverStatus::Running("helm release applied".into()),
            })
        } else {
            Ok(DriverStatus::Failed(stderr_tail(&output.stderr)))
        }
    }

    async fn check_status(
        &self,
        stage: DriverStage,
        ctx: &ExecContext,
    ) -> Result<DriverStatus, DriverError> {
        let release = Self::release_name(stage, ctx);
        let kubeconfig_file = match &ctx.kubeconfig {
            Some(yaml) => Some(write_temp(yaml)?),
            None => None,
        };

        let mut cmd = Command::new(&self.helm_bin);
        cmd.arg("status")
            .arg(&release)
            .arg("--namespace")
            .arg(&ctx.namespace)
            .arg("-o")
            .arg("json");
        if let Some(file) = &kubeconfig_file {
            cmd.arg("--kubeconfig").arg(file.path());
        }

        let output = cmd.output().await?;
        if !output.status.success() {
            let stderr = stderr_tail(&output.stderr);
            if stderr.contains("not found") {
                return Ok(DriverStatus::Running("release not yet visible".into()));
            }
            return Err(DriverError::Tool {
                tool: self.helm_bin.clone(),
                message: stderr,
            });
        }

        let report: serde_json::Value =
            serde_json::from_slice(&output.stdout).map_err(|e| DriverError::Tool {
                tool: self.helm_bin.clone(),
                message: format!("unparseable helm status output: {e}"),
            })?;
        let release_status = report
            .pointer("/info/status")
            .and_then(|s| s.as_str())
            .unwrap_or("unknown");

        match release_status {
            "deployed" => self.workload_ready(ctx, &release).await,
            "failed" => Ok(DriverStatus::Failed(format!(
                "helm release {release} is in status failed"
            ))),
            other => Ok(DriverStatus::Running(format!(
                "helm release {release} is in status {other}"
            ))),
        }
    }
}

fn write_temp(content: &str) -> Result<NamedTempFile, DriverError> {
    let mut file = NamedTempFile::new()?;
    file.write_all(content.as_bytes())?;
    file.flush()?;
    Ok(file)
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    // Keep the end of the output; helm puts the actionable line last.
    match trimmed.char_indices().nth_back(499) {
        Some((idx, _)) => trimmed[idx..].to_string(),
        None => trimmed.to_string(),
    }
}
