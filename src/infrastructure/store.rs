//! Persistence gateway trait
//!
//! All state lives in the entity store; nothing in memory is authoritative.
//! Every mutation of a Batch, ReleaseApp or Deployment goes through one of
//! the `update_*` methods, which:
//!
//! 1. open a transaction,
//! 2. re-read the target row by id (no trust in the caller's copy),
//! 3. apply the caller's pure mutation to the fresh snapshot,
//! 4. persist with the optimistic predicate
//!    `WHERE id = ? AND status = <observed-old-status>`,
//! 5. commit.
//!
//! Zero affected rows aborts the whole operation with
//! [`CoreError::StatusConflict`]; the layer never retries. Commands surface
//! the conflict to their caller, the scanner just waits for its next tick.
//!
//! Mutation closures must be pure and synchronous: anything a transition
//! needs beyond the target row (builds, applications, env configs) is
//! prefetched by the caller and moved into the closure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::domain::{
    AppEnvConfig, Application, Batch, Build, BuildStatus, Cluster, Deployment, Env, NewBatch,
    NewDeployment, NewReleaseApp, Project, ProjectEnvConfig, ReleaseApp, Repository,
};
use crate::error::CoreResult;

/// Transactional reads and writes over the entity store
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // ------------------------------------------------------------------
    // Catalog reads
    // ------------------------------------------------------------------

    async fn project(&self, id: i64) -> CoreResult<Project>;

    async fn application(&self, id: i64) -> CoreResult<Application>;

    /// Batched application lookup used by the dependency resolver
    async fn applications(&self, ids: &[i64]) -> CoreResult<HashMap<i64, Application>>;

    async fn repository(&self, id: i64) -> CoreResult<Repository>;

    async fn build(&self, id: i64) -> CoreResult<Build>;

    async fn cluster(&self, name: &str) -> CoreResult<Cluster>;

    /// All (env, cluster) rows configured for an application
    async fn app_env_configs(&self, app_id: i64) -> CoreResult<Vec<AppEnvConfig>>;

    async fn project_env_config(&self, project_id: i64, env: Env) -> CoreResult<ProjectEnvConfig>;

    // ------------------------------------------------------------------
    // Catalog writes (external CRUD / build intake surface)
    // ------------------------------------------------------------------

    async fn insert_project(&self, name: &str) -> CoreResult<Project>;

    async fn insert_application(
        &self,
        name: &str,
        app_type: &str,
        project_id: i64,
        repo_id: i64,
        default_depends_on: Vec<i64>,
    ) -> CoreResult<Application>;

    async fn insert_repository(
        &self,
        namespace: &str,
        name: &str,
        app_count: i32,
    ) -> CoreResult<Repository>;

    async fn insert_build(
        &self,
        app_id: i64,
        image_tag: &str,
        image_url: Option<&str>,
        build_status: BuildStatus,
    ) -> CoreResult<Build>;

    async fn insert_cluster(&self, cluster: Cluster) -> CoreResult<()>;

    async fn insert_app_env_config(&self, config: AppEnvConfig) -> CoreResult<()>;

    async fn insert_project_env_config(&self, config: ProjectEnvConfig) -> CoreResult<()>;

    /// Roll the live production tag forward after a batch is accepted
    async fn set_deployed_tag(&self, app_id: i64, tag: &str) -> CoreResult<()>;

    // ------------------------------------------------------------------
    // Batch / release / deployment reads
    // ------------------------------------------------------------------

    async fn batch(&self, id: i64) -> CoreResult<Batch>;

    /// Scanner working set: `Draft < status < Completed`, recent enough
    async fn active_batches(&self, created_after: DateTime<Utc>) -> CoreResult<Vec<Batch>>;

    async fn release_app(&self, id: i64) -> CoreResult<ReleaseApp>;

    /// ReleaseApps of a batch in id order
    async fn release_apps_of_batch(&self, batch_id: i64) -> CoreResult<Vec<ReleaseApp>>;

    /// (batch, release app) pairs for an application across open batches
    async fn open_release_apps_for_app(&self, app_id: i64)
        -> CoreResult<Vec<(Batch, ReleaseApp)>>;

    /// Deployments of a batch in id order
    async fn deployments_of_batch(&self, batch_id: i64) -> CoreResult<Vec<Deployment>>;

    async fn deployments_of_release(&self, release_id: i64, env: Env)
        -> CoreResult<Vec<Deployment>>;

    // ------------------------------------------------------------------
    // Draft-phase creation (external API surface)
    // ------------------------------------------------------------------

    async fn create_batch(&self, new: NewBatch) -> CoreResult<Batch>;

    async fn create_release_app(&self, new: NewReleaseApp) -> CoreResult<ReleaseApp>;

    // ------------------------------------------------------------------
    // Guarded mutations
    // ------------------------------------------------------------------

    /// Mutate a batch row under the optimistic status lock
    async fn update_batch<F>(&self, id: i64, mutate: F) -> CoreResult<Batch>
    where
        F: FnOnce(&mut Batch) -> CoreResult<()> + Send;

    /// Mutate a batch and its release apps in one transaction; the lock
    /// predicate is the batch's status, the apps ride along (bulk effects
    /// of seal / wave starts / accept_prod)
    async fn update_batch_with_apps<F>(
        &self,
        id: i64,
        mutate: F,
    ) -> CoreResult<(Batch, Vec<ReleaseApp>)>
    where
        F: FnOnce(&mut Batch, &mut [ReleaseApp]) -> CoreResult<()> + Send;

    /// Mutate a release app row under the optimistic status lock
    async fn update_release_app<F>(&self, id: i64, mutate: F) -> CoreResult<ReleaseApp>
    where
        F: FnOnce(&mut ReleaseApp) -> CoreResult<()> + Send;

    /// Mutate a deployment row under the optimistic status lock
    async fn update_deployment<F>(&self, id: i64, mutate: F) -> CoreResult<Deployment>
    where
        F: FnOnce(&mut Deployment) -> CoreResult<()> + Send;

    /// Idempotent fan-out insert: at most one row ever exists per
    /// (release_id, env, cluster_name); an existing row is returned as-is
    async fn ensure_deployment(&self, new: NewDeployment) -> CoreResult<Deployment>;
}
