//! In-memory store used by state-machine tests
//!
//! Mirrors the PostgreSQL gateway semantics on a single mutex: every guarded
//! mutation works on a fresh snapshot and either commits whole or leaves the
//! map untouched. Because the mutex serialises writers, the optimistic lock
//! can never lose here; racing commands surface as `InvalidTransition` from
//! the fresh-status check instead, which is the documented alternative
//! outcome for command races.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::domain::{
    AppEnvConfig, Application, Batch, BatchStatus, Build, BuildStatus, Cluster, DeployState,
    Deployment, Env, NewBatch, NewDeployment, NewReleaseApp, Project, ProjectEnvConfig,
    ReleaseApp, ReleaseStatus, Repository,
};
use crate::error::{CoreError, CoreResult};

use super::store::Store;

#[derive(Default)]
struct Inner {
    projects: HashMap<i64, Project>,
    applications: HashMap<i64, Application>,
    repositories: HashMap<i64, Repository>,
    builds: HashMap<i64, Build>,
    clusters: HashMap<String, Cluster>,
    app_env_configs: Vec<AppEnvConfig>,
    project_env_configs: Vec<ProjectEnvConfig>,
    batches: HashMap<i64, Batch>,
    release_apps: HashMap<i64, ReleaseApp>,
    deployments: HashMap<i64, Deployment>,
    next_id: i64,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Test double for the PostgreSQL store
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn project(&self, id: i64) -> CoreResult<Project> {
        let inner = self.inner.lock().unwrap();
        inner
            .projects
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("project", id))
    }

    async fn application(&self, id: i64) -> CoreResult<Application> {
        let inner = self.inner.lock().unwrap();
        inner
            .applications
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("application", id))
    }

    async fn applications(&self, ids: &[i64]) -> CoreResult<HashMap<i64, Application>> {
        let inner = self.inner.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| inner.applications.get(id).map(|a| (*id, a.clone())))
            .collect())
    }

    async fn repository(&self, id: i64) -> CoreResult<Repository> {
        let inner = self.inner.lock().unwrap();
        inner
            .repositories
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("repository", id))
    }

    async fn build(&self, id: i64) -> CoreResult<Build> {
        let inner = self.inner.lock().unwrap();
        inner
            .builds
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("build", id))
    }

    async fn cluster(&self, name: &str) -> CoreResult<Cluster> {
        let inner = self.inner.lock().unwrap();
        inner
            .clusters
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::NotFound {
                entity: "cluster",
                id: name.to_string(),
            })
    }

    async fn app_env_configs(&self, app_id: i64) -> CoreResult<Vec<AppEnvConfig>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .app_env_configs
            .iter()
            .filter(|c| c.app_id == app_id)
            .cloned()
            .collect())
    }

    async fn project_env_config(&self, project_id: i64, env: Env) -> CoreResult<ProjectEnvConfig> {
        let inner = self.inner.lock().unwrap();
        inner
            .project_env_configs
            .iter()
            .find(|c| c.project_id == project_id && c.env == env)
            .cloned()
            .ok_or_else(|| CoreError::NotFound {
                entity: "project_env_config",
                id: format!("{project_id}/{env}"),
            })
    }

    async fn insert_project(&self, name: &str) -> CoreResult<Project> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id();
        let project = Project {
            id,
            name: name.to_string(),
        };
        inner.projects.insert(id, project.clone());
        Ok(project)
    }

    async fn insert_application(
        &self,
        name: &str,
        app_type: &str,
        project_id: i64,
        repo_id: i64,
        default_depends_on: Vec<i64>,
    ) -> CoreResult<Application> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id();
        let app = Application {
            id,
            name: name.to_string(),
            app_type: app_type.to_string(),
            project_id,
            repo_id,
            default_depends_on,
            deployed_tag: None,
        };
        inner.applications.insert(id, app.clone());
        Ok(app)
    }

    async fn insert_repository(
        &self,
        namespace: &str,
        name: &str,
        app_count: i32,
    ) -> CoreResult<Repository> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id();
        let repo = Repository {
            id,
            namespace: namespace.to_string(),
            name: name.to_string(),
            app_count,
        };
        inner.repositories.insert(id, repo.clone());
        Ok(repo)
    }

    async fn insert_build(
        &self,
        app_id: i64,
        image_tag: &str,
        image_url: Option<&str>,
        build_status: BuildStatus,
    ) -> CoreResult<Build> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id();
        let build = Build {
            id,
            app_id,
            image_tag: image_tag.to_string(),
            image_url: image_url.map(str::to_string),
            build_status,
            created_at: Utc::now(),
        };
        inner.builds.insert(id, build.clone());
        Ok(build)
    }

    async fn insert_cluster(&self, cluster: Cluster) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.clusters.insert(cluster.name.clone(), cluster);
        Ok(())
    }

    async fn insert_app_env_config(&self, config: AppEnvConfig) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.app_env_configs.push(config);
        Ok(())
    }

    async fn insert_project_env_config(&self, config: ProjectEnvConfig) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.project_env_configs.push(config);
        Ok(())
    }

    async fn set_deployed_tag(&self, app_id: i64, tag: &str) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let app = inner
            .applications
            .get_mut(&app_id)
            .ok_or_else(|| CoreError::not_found("application", app_id))?;
        app.deployed_tag = Some(tag.to_string());
        Ok(())
    }

    async fn batch(&self, id: i64) -> CoreResult<Batch> {
        let inner = self.inner.lock().unwrap();
        inner
            .batches
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("batch", id))
    }

    async fn active_batches(&self, created_after: DateTime<Utc>) -> CoreResult<Vec<Batch>> {
        let inner = self.inner.lock().unwrap();
        let mut batches: Vec<Batch> = inner
            .batches
            .values()
            .filter(|b| {
                b.status.code() > BatchStatus::Draft.code()
                    && b.status.code() < BatchStatus::Completed.code()
                    && b.created_at > created_after
            })
            .cloned()
            .collect();
        batches.sort_by_key(|b| b.id);
        Ok(batches)
    }

    async fn release_app(&self, id: i64) -> CoreResult<ReleaseApp> {
        let inner = self.inner.lock().unwrap();
        inner
            .release_apps
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("release_app", id))
    }

    async fn release_apps_of_batch(&self, batch_id: i64) -> CoreResult<Vec<ReleaseApp>> {
        let inner = self.inner.lock().unwrap();
        let mut apps: Vec<ReleaseApp> = inner
            .release_apps
            .values()
            .filter(|r| r.batch_id == batch_id)
            .cloned()
            .collect();
        apps.sort_by_key(|r| r.id);
        Ok(apps)
    }

    async fn open_release_apps_for_app(
        &self,
        app_id: i64,
    ) -> CoreResult<Vec<(Batch, ReleaseApp)>> {
        let inner = self.inner.lock().unwrap();
        let mut pairs: Vec<(Batch, ReleaseApp)> = inner
            .release_apps
            .values()
            .filter(|r| r.app_id == app_id)
            .filter_map(|r| {
                let batch = inner.batches.get(&r.batch_id)?;
                if batch.status.is_terminal() {
                    None
                } else {
                    Some((batch.clone(), r.clone()))
                }
            })
            .collect();
        pairs.sort_by_key(|(_, r)| r.id);
        Ok(pairs)
    }

    async fn deployments_of_batch(&self, batch_id: i64) -> CoreResult<Vec<Deployment>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<Deployment> = inner
            .deployments
            .values()
            .filter(|d| d.batch_id == batch_id)
            .cloned()
            .collect();
        rows.sort_by_key(|d| d.id);
        Ok(rows)
    }

    async fn deployments_of_release(
        &self,
        release_id: i64,
        env: Env,
    ) -> CoreResult<Vec<Deployment>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<Deployment> = inner
            .deployments
            .values()
            .filter(|d| d.release_id == release_id && d.env == env)
            .cloned()
            .collect();
        rows.sort_by_key(|d| d.id);
        Ok(rows)
    }

    async fn create_batch(&self, new: NewBatch) -> CoreResult<Batch> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id();
        let batch_number = inner
            .batches
            .values()
            .filter(|b| b.project_id == new.project_id)
            .count() as i64
            + 1;
        let now = Utc::now();
        let batch = Batch {
            id,
            batch_number,
            project_id: new.project_id,
            initiator: new.initiator,
            approval_status: crate::domain::ApprovalStatus::Pending,
            status: BatchStatus::Draft,
            sealed_by: None,
            sealed_at: None,
            pre_triggered_by: None,
            pre_started_at: None,
            pre_finished_at: None,
            prod_triggered_by: None,
            prod_started_at: None,
            prod_finished_at: None,
            final_accepted_by: None,
            final_accepted_at: None,
            cancelled_by: None,
            cancelled_at: None,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
        };
        inner.batches.insert(id, batch.clone());
        Ok(batch)
    }

    async fn create_release_app(&self, new: NewReleaseApp) -> CoreResult<ReleaseApp> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.batches.contains_key(&new.batch_id) {
            return Err(CoreError::not_found("batch", new.batch_id));
        }
        let id = inner.next_id();
        let now = Utc::now();
        let app = ReleaseApp {
            id,
            batch_id: new.batch_id,
            app_id: new.app_id,
            build_id: new.build_id,
            latest_build_id: new.build_id,
            previous_deployed_tag: None,
            target_tag: None,
            is_locked: false,
            skip_pre_env: false,
            status: ReleaseStatus::Pending,
            reason: String::new(),
            temp_depends_on: new.temp_depends_on,
            created_at: now,
            updated_at: now,
        };
        inner.release_apps.insert(id, app.clone());
        Ok(app)
    }

    async fn update_batch<F>(&self, id: i64, mutate: F) -> CoreResult<Batch>
    where
        F: FnOnce(&mut Batch) -> CoreResult<()> + Send,
    {
        let mut inner = self.inner.lock().unwrap();
        let mut batch = inner
            .batches
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("batch", id))?;
        mutate(&mut batch)?;
        batch.updated_at = Utc::now();
        inner.batches.insert(id, batch.clone());
        Ok(batch)
    }

    async fn update_batch_with_apps<F>(
        &self,
        id: i64,
        mutate: F,
    ) -> CoreResult<(Batch, Vec<ReleaseApp>)>
    where
        F: FnOnce(&mut Batch, &mut [ReleaseApp]) -> CoreResult<()> + Send,
    {
        let mut inner = self.inner.lock().unwrap();
        let mut batch = inner
            .batches
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("batch", id))?;
        let mut apps: Vec<ReleaseApp> = inner
            .release_apps
            .values()
            .filter(|r| r.batch_id == id)
            .cloned()
            .collect();
        apps.sort_by_key(|r| r.id);

        mutate(&mut batch, &mut apps)?;

        let now = Utc::now();
        batch.updated_at = now;
        inner.batches.insert(id, batch.clone());
        for app in &mut apps {
            app.updated_at = now;
            inner.release_apps.insert(app.id, app.clone());
        }
        Ok((batch, apps))
    }

    async fn update_release_app<F>(&self, id: i64, mutate: F) -> CoreResult<ReleaseApp>
    where
        F: FnOnce(&mut ReleaseApp) -> CoreResult<()> + Send,
    {
        let mut inner = self.inner.lock().unwrap();
        let mut app = inner
            .release_apps
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("release_app", id))?;
        mutate(&mut app)?;
        app.updated_at = Utc::now();
        inner.release_apps.insert(id, app.clone());
        Ok(app)
    }

    async fn update_deployment<F>(&self, id: i64, mutate: F) -> CoreResult<Deployment>
    where
        F: FnOnce(&mut Deployment) -> CoreResult<()> + Send,
    {
        let mut inner = self.inner.lock().unwrap();
        let mut deployment = inner
            .deployments
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("deployment", id))?;
        mutate(&mut deployment)?;
        deployment.updated_at = Utc::now();
        inner.deployments.insert(id, deployment.clone());
        Ok(deployment)
    }

    async fn ensure_deployment(&self, new: NewDeployment) -> CoreResult<Deployment> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner
            .deployments
            .values()
            .find(|d| {
                d.release_id == new.release_id
                    && d.env == new.env
                    && d.cluster_name == new.cluster_name
            })
            .cloned()
        {
            return Ok(existing);
        }
        let id = inner.next_id();
        let now = Utc::now();
        let deployment = Deployment {
            id,
            batch_id: new.batch_id,
            app_id: new.app_id,
            release_id: new.release_id,
            env: new.env,
            cluster_name: new.cluster_name,
            namespace: String::new(),
            deployment_name: String::new(),
            driver_type: None,
            values: new.values,
            image_url: new.image_url,
            image_tag: new.image_tag,
            status: DeployState::Pending,
            retry_count: 0,
            max_retry_count: 3,
            error_message: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.deployments.insert(id, deployment.clone());
        Ok(deployment)
    }
}
