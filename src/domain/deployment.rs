//! Deployment domain types
//!
//! A deployment is one (release, env, cluster) execution attempt. Rows are
//! created lazily by the release fan-out and are unique per target triple.

use chrono::{DateTime, Utc};

use super::status::{DeployState, Env};

/// A single chart installation target
#[derive(Debug, Clone)]
pub struct Deployment {
    pub id: i64,
    pub batch_id: i64,
    pub app_id: i64,
    pub release_id: i64,
    pub env: Env,
    pub cluster_name: String,
    /// Rendered by the pending handler from the project's namespace template
    pub namespace: String,
    /// Canonical workload name, derived by the main-stage driver spec
    pub deployment_name: String,
    /// Recorded on first execution so later polls route to the same driver
    pub driver_type: Option<String>,
    /// Opaque values overlay handed to the driver (image overrides etc.)
    pub values: serde_json::Value,
    pub image_url: Option<String>,
    pub image_tag: Option<String>,
    pub status: DeployState,
    /// Recorded on every failure; not consumed for automatic retry
    pub retry_count: i32,
    pub max_retry_count: i32,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for the idempotent fan-out insert
#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub batch_id: i64,
    pub app_id: i64,
    pub release_id: i64,
    pub env: Env,
    pub cluster_name: String,
    pub values: serde_json::Value,
    pub image_url: Option<String>,
    pub image_tag: Option<String>,
}
