//! Pluggable deployment drivers
//!
//! A driver is the only component that talks to a target system. The
//! orchestrator hands it identifiers, the rendered template context and the
//! project's artifacts spec; the driver owns chart fetching, values merging,
//! cluster authentication and readiness evaluation.
//!
//! `execute` must be idempotent (install-or-upgrade semantics): re-invoking
//! with the same payload converges to the same end state. `check_status` is
//! a pure read and must tolerate a release that is not visible yet by
//! reporting `Running`.

pub mod helm;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::domain::{ArtifactsSpec, DriverStage, Env};

/// Outcome of a driver invocation, as seen by the Deployment state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverStatus {
    Success,
    Running(String),
    Failed(String),
}

/// Transport-level driver errors
///
/// These mean the operation could not be attempted or observed, not that the
/// deployment itself failed; the state machine maps them to a failure with
/// the message preserved.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("no {0} stage configured in artifacts spec")]
    MissingStage(DriverStage),

    #[error("failed to run {tool}: {message}")]
    Tool { tool: String, message: String },

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("failed to serialize values: {0}")]
    Values(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a driver needs to act on one (release, env, cluster) target
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub app_name: String,
    pub env: Env,
    pub cluster: String,
    /// Rendered by the core from the artifacts spec's namespace template
    pub namespace: String,
    /// Rendered workload/release name
    pub release_name: String,
    pub artifacts: ArtifactsSpec,
    /// Per-deployment values overlay (image overrides etc.)
    pub values: serde_json::Value,
    pub image_tag: Option<String>,
    /// Decoded kubeconfig YAML; None means in-cluster / ambient config
    pub kubeconfig: Option<String>,
}

/// A pluggable executor for one deployment technology
#[async_trait]
pub trait Driver: Send + Sync {
    /// Registry key, recorded on the Deployment at first execution
    fn driver_type(&self) -> &'static str;

    /// Kick off (or converge) the installation for the given stage
    async fn execute(
        &self,
        stage: DriverStage,
        ctx: &ExecContext,
    ) -> Result<DriverStatus, DriverError>;

    /// Observe the current state of the given stage without mutating it
    async fn check_status(
        &self,
        stage: DriverStage,
        ctx: &ExecContext,
    ) -> Result<DriverStatus, DriverError>;
}

/// Name -> driver map consulted at execution and poll time
#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.insert(driver.driver_type().to_string(), driver);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.get(name).cloned()
    }
}

/// Deep-merge two JSON values, with `overlay` winning on conflicts
///
/// Objects merge recursively; any other kind of value is replaced. This is
/// the layering rule for chart values: stage spec values first, deployment
/// overrides on top.
pub fn merge_values(base: &serde_json::Value, overlay: &serde_json::Value) -> serde_json::Value {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in overlay_map {
                let combined = match merged.get(key) {
                    Some(existing) => merge_values(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), combined);
            }
            serde_json::Value::Object(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_overlays_nested_objects() {
        let base = json!({"image": {"repository": "r", "tag": "old"}, "replicas": 2});
        let overlay = json!({"image": {"tag": "new"}});
        let merged = merge_values(&base, &overlay);
        assert_eq!(
            merged,
            json!({"image": {"repository": "r", "tag": "new"}, "replicas": 2})
        );
    }

    #[test]
    fn merge_replaces_non_objects() {
        let merged = merge_values(&json!({"ports": [80]}), &json!({"ports": [443]}));
        assert_eq!(merged, json!({"ports": [443]}));
    }

    #[test]
    fn registry_routes_by_type() {
        let mut registry = DriverRegistry::new();
        registry.register(std::sync::Arc::new(mock::MockDriver::succeeding()));
        assert!(registry.get("mock").is_some());
        assert!(registry.get("helm").is_none());
    }
}
