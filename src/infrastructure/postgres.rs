//! PostgreSQL entity store
//!
//! The status column of batches, release_apps and deployments doubles as the
//! optimistic-lock key: guarded updates re-read the row inside the
//! transaction and persist with `WHERE id = $1 AND status = $2`. Zero
//! affected rows means another writer got there first and the operation
//! aborts with `StatusConflict`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::domain::{
    AppEnvConfig, Application, ApprovalStatus, Batch, BatchStatus, Build, BuildStatus, Cluster,
    DeployState, Deployment, Env, NewBatch, NewDeployment, NewReleaseApp, Project,
    ProjectEnvConfig, ReleaseApp, ReleaseStatus, Repository,
};
use crate::error::{CoreError, CoreResult};

use super::store::Store;

/// Store implementation over a PostgreSQL pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a pool using the configured URL and limits
    pub async fn connect(config: &DatabaseConfig) -> CoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create all tables and indexes if they do not exist yet
    pub async fn provision(&self) -> CoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Schema is up to date");
        Ok(())
    }
}

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS projects (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS repositories (
        id BIGSERIAL PRIMARY KEY,
        namespace TEXT NOT NULL,
        name TEXT NOT NULL,
        app_count INT NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS applications (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        app_type TEXT NOT NULL,
        project_id BIGINT NOT NULL,
        repo_id BIGINT NOT NULL,
        default_depends_on BIGINT[] NOT NULL DEFAULT '{}',
        deployed_tag TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS builds (
        id BIGSERIAL PRIMARY KEY,
        app_id BIGINT NOT NULL,
        image_tag TEXT NOT NULL,
        image_url TEXT,
        build_status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_builds_app ON builds (app_id, id)"#,
    r#"CREATE TABLE IF NOT EXISTS clusters (
        name TEXT PRIMARY KEY,
        kubeconfig TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS app_env_configs (
        id BIGSERIAL PRIMARY KEY,
        app_id BIGINT NOT NULL,
        env TEXT NOT NULL,
        cluster TEXT NOT NULL,
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        UNIQUE (app_id, env, cluster)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS project_env_configs (
        id BIGSERIAL PRIMARY KEY,
        project_id BIGINT NOT NULL,
        env TEXT NOT NULL,
        allowed_clusters TEXT[] NOT NULL DEFAULT '{}',
        artifacts JSONB NOT NULL,
        UNIQUE (project_id, env)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS batches (
        id BIGSERIAL PRIMARY KEY,
        batch_number BIGINT NOT NULL,
        project_id BIGINT NOT NULL,
        initiator TEXT NOT NULL,
        approval_status TEXT NOT NULL DEFAULT 'pending',
        status INT NOT NULL DEFAULT 0,
        sealed_by TEXT,
        sealed_at TIMESTAMPTZ,
        pre_triggered_by TEXT,
        pre_started_at TIMESTAMPTZ,
        pre_finished_at TIMESTAMPTZ,
        prod_triggered_by TEXT,
        prod_started_at TIMESTAMPTZ,
        prod_finished_at TIMESTAMPTZ,
        final_accepted_by TEXT,
        final_accepted_at TIMESTAMPTZ,
        cancelled_by TEXT,
        cancelled_at TIMESTAMPTZ,
        cancel_reason TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_batches_active ON batches (status, created_at)"#,
    r#"CREATE TABLE IF NOT EXISTS release_apps (
        id BIGSERIAL PRIMARY KEY,
        batch_id BIGINT NOT NULL,
        app_id BIGINT NOT NULL,
        build_id BIGINT,
        latest_build_id BIGINT,
        previous_deployed_tag TEXT,
        target_tag TEXT,
        is_locked BOOLEAN NOT NULL DEFAULT FALSE,
        skip_pre_env BOOLEAN NOT NULL DEFAULT FALSE,
        status INT NOT NULL DEFAULT 0,
        reason TEXT NOT NULL DEFAULT '',
        temp_depends_on BIGINT[] NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (batch_id, app_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS deployments (
        id BIGSERIAL PRIMARY KEY,
        batch_id BIGINT NOT NULL,
        app_id BIGINT NOT NULL,
        release_id BIGINT NOT NULL,
        env TEXT NOT NULL,
        cluster_name TEXT NOT NULL,
        namespace TEXT NOT NULL DEFAULT '',
        deployment_name TEXT NOT NULL DEFAULT '',
        driver_type TEXT,
        chart_values JSONB NOT NULL DEFAULT '{}',
        image_url TEXT,
        image_tag TEXT,
        status TEXT NOT NULL DEFAULT 'pending',
        retry_count INT NOT NULL DEFAULT 0,
        max_retry_count INT NOT NULL DEFAULT 3,
        error_message TEXT,
        started_at TIMESTAMPTZ,
        finished_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (release_id, env, cluster_name)
    )"#,
];

fn map_project(row: &PgRow) -> CoreResult<Project> {
    Ok(Project {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
    })
}

fn map_application(row: &PgRow) -> CoreResult<Application> {
    Ok(Application {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        app_type: row.try_get("app_type")?,
        project_id: row.try_get("project_id")?,
        repo_id: row.try_get("repo_id")?,
        default_depends_on: row.try_get("default_depends_on")?,
        deployed_tag: row.try_get("deployed_tag")?,
    })
}

fn map_repository(row: &PgRow) -> CoreResult<Repository> {
    Ok(Repository {
        id: row.try_get("id")?,
        namespace: row.try_get("namespace")?,
        name: row.try_get("name")?,
        app_count: row.try_get("app_count")?,
    })
}

fn map_build(row: &PgRow) -> CoreResult<Build> {
    let status: String = row.try_get("build_status")?;
    Ok(Build {
        id: row.try_get("id")?,
        app_id: row.try_get("app_id")?,
        image_tag: row.try_get("image_tag")?,
        image_url: row.try_get("image_url")?,
        build_status: BuildStatus::parse(&status)
            .ok_or_else(|| CoreError::Internal(anyhow::anyhow!("unknown build status {status}")))?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_env(raw: &str) -> CoreResult<Env> {
    Env::parse(raw).ok_or_else(|| CoreError::Internal(anyhow::anyhow!("unknown env {raw}")))
}

fn map_batch(row: &PgRow) -> CoreResult<Batch> {
    let code: i32 = row.try_get("status")?;
    let approval: String = row.try_get("approval_status")?;
    Ok(Batch {
        id: row.try_get("id")?,
        batch_number: row.try_get("batch_number")?,
        project_id: row.try_get("project_id")?,
        initiator: row.try_get("initiator")?,
        approval_status: ApprovalStatus::parse(&approval).ok_or_else(|| {
            CoreError::Internal(anyhow::anyhow!("unknown approval status {approval}"))
        })?,
        status: BatchStatus::from_code(code).ok_or_else(|| {
            CoreError::Internal(anyhow::anyhow!("unknown batch status code {code}"))
        })?,
        sealed_by: row.try_get("sealed_by")?,
        sealed_at: row.try_get("sealed_at")?,
        pre_triggered_by: row.try_get("pre_triggered_by")?,
        pre_started_at: row.try_get("pre_started_at")?,
        pre_finished_at: row.try_get("pre_finished_at")?,
        prod_triggered_by: row.try_get("prod_triggered_by")?,
        prod_started_at: row.try_get("prod_started_at")?,
        prod_finished_at: row.try_get("prod_finished_at")?,
        final_accepted_by: row.try_get("final_accepted_by")?,
        final_accepted_at: row.try_get("final_accepted_at")?,
        cancelled_by: row.try_get("cancelled_by")?,
        cancelled_at: row.try_get("cancelled_at")?,
        cancel_reason: row.try_get("cancel_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_release_app(row: &PgRow) -> CoreResult<ReleaseApp> {
    let code: i32 = row.try_get("status")?;
    Ok(ReleaseApp {
        id: row.try_get("id")?,
        batch_id: row.try_get("batch_id")?,
        app_id: row.try_get("app_id")?,
        build_id: row.try_get("build_id")?,
        latest_build_id: row.try_get("latest_build_id")?,
        previous_deployed_tag: row.try_get("previous_deployed_tag")?,
        target_tag: row.try_get("target_tag")?,
        is_locked: row.try_get("is_locked")?,
        skip_pre_env: row.try_get("skip_pre_env")?,
        status: ReleaseStatus::from_code(code).ok_or_else(|| {
            CoreError::Internal(anyhow::anyhow!("unknown release status code {code}"))
        })?,
        reason: row.try_get("reason")?,
        temp_depends_on: row.try_get("temp_depends_on")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_deployment(row: &PgRow) -> CoreResult<Deployment> {
    let env: String = row.try_get("env")?;
    let state: String = row.try_get("status")?;
    Ok(Deployment {
        id: row.try_get("id")?,
        batch_id: row.try_get("batch_id")?,
        app_id: row.try_get("app_id")?,
        release_id: row.try_get("release_id")?,
        env: map_env(&env)?,
        cluster_name: row.try_get("cluster_name")?,
        namespace: row.try_get("namespace")?,
        deployment_name: row.try_get("deployment_name")?,
        driver_type: row.try_get("driver_type")?,
        values: row.try_get("chart_values")?,
        image_url: row.try_get("image_url")?,
        image_tag: row.try_get("image_tag")?,
        status: DeployState::parse(&state).ok_or_else(|| {
            CoreError::Internal(anyhow::anyhow!("unknown deployment status {state}"))
        })?,
        retry_count: row.try_get("retry_count")?,
        max_retry_count: row.try_get("max_retry_count")?,
        error_message: row.try_get("error_message")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn project(&self, id: i64) -> CoreResult<Project> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found("project", id))?;
        map_project(&row)
    }

    async fn application(&self, id: i64) -> CoreResult<Application> {
        let row = sqlx::query("SELECT * FROM applications WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found("application", id))?;
        map_application(&row)
    }

    async fn applications(&self, ids: &[i64]) -> CoreResult<HashMap<i64, Application>> {
        let rows = sqlx::query("SELECT * FROM applications WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let app = map_application(row)?;
            out.insert(app.id, app);
        }
        Ok(out)
    }

    async fn repository(&self, id: i64) -> CoreResult<Repository> {
        let row = sqlx::query("SELECT * FROM repositories WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found("repository", id))?;
        map_repository(&row)
    }

    async fn build(&self, id: i64) -> CoreResult<Build> {
        let row = sqlx::query("SELECT * FROM builds WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found("build", id))?;
        map_build(&row)
    }

    async fn cluster(&self, name: &str) -> CoreResult<Cluster> {
        let row = sqlx::query("SELECT * FROM clusters WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::NotFound {
                entity: "cluster",
                id: name.to_string(),
            })?;
        Ok(Cluster {
            name: row.try_get("name")?,
            kubeconfig: row.try_get("kubeconfig")?,
        })
    }

    async fn app_env_configs(&self, app_id: i64) -> CoreResult<Vec<AppEnvConfig>> {
        let rows = sqlx::query("SELECT * FROM app_env_configs WHERE app_id = $1 ORDER BY id")
            .bind(app_id)
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let env: String = row.try_get("env")?;
            out.push(AppEnvConfig {
                app_id: row.try_get("app_id")?,
                env: map_env(&env)?,
                cluster: row.try_get("cluster")?,
                enabled: row.try_get("enabled")?,
            });
        }
        Ok(out)
    }

    async fn project_env_config(&self, project_id: i64, env: Env) -> CoreResult<ProjectEnvConfig> {
        let row =
            sqlx::query("SELECT * FROM project_env_configs WHERE project_id = $1 AND env = $2")
                .bind(project_id)
                .bind(env.as_str())
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| CoreError::NotFound {
                    entity: "project_env_config",
                    id: format!("{project_id}/{env}"),
                })?;
        let artifacts: serde_json::Value = row.try_get("artifacts")?;
        Ok(ProjectEnvConfig {
            project_id: row.try_get("project_id")?,
            env,
            allowed_clusters: row.try_get("allowed_clusters")?,
            artifacts: serde_json::from_value(artifacts)
                .map_err(|e| CoreError::Internal(anyhow::anyhow!("bad artifacts spec: {e}")))?,
        })
    }

    async fn insert_project(&self, name: &str) -> CoreResult<Project> {
        let row = sqlx::query("INSERT INTO projects (name) VALUES ($1) RETURNING *")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        map_project(&row)
    }

    async fn insert_application(
        &self,
        name: &str,
        app_type: &str,
        project_id: i64,
        repo_id: i64,
        default_depends_on: Vec<i64>,
    ) -> CoreResult<Application> {
        let row = sqlx::query(
            "INSERT INTO applications (name, app_type, project_id, repo_id, default_depends_on) \
             VALUES ($1, $2, $3, $4, $5) RETURNING *",
        )
        .bind(name)
        .bind(app_type)
        .bind(project_id)
        .bind(repo_id)
        .bind(&default_depends_on)
        .fetch_one(&self.pool)
        .await?;
        map_application(&row)
    }

    async fn insert_repository(
        &self,
        namespace: &str,
        name: &str,
        app_count: i32,
    ) -> CoreResult<Repository> {
        let row = sqlx::query(
            "INSERT INTO repositories (namespace, name, app_count) \
             VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(namespace)
        .bind(name)
        .bind(app_count)
        .fetch_one(&self.pool)
        .await?;
        map_repository(&row)
    }

    async fn insert_build(
        &self,
        app_id: i64,
        image_tag: &str,
        image_url: Option<&str>,
        build_status: BuildStatus,
    ) -> CoreResult<Build> {
        let row = sqlx::query(
            "INSERT INTO builds (app_id, image_tag, image_url, build_status) \
             VALUES ($1, $2, $3, $4) RETURNING *",
        )
        .bind(app_id)
        .bind(image_tag)
        .bind(image_url)
        .bind(build_status.as_str())
        .fetch_one(&self.pool)
        .await?;
        map_build(&row)
    }

    async fn insert_cluster(&self, cluster: Cluster) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO clusters (name, kubeconfig) VALUES ($1, $2) \
             ON CONFLICT (name) DO UPDATE SET kubeconfig = EXCLUDED.kubeconfig",
        )
        .bind(&cluster.name)
        .bind(&cluster.kubeconfig)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_app_env_config(&self, config: AppEnvConfig) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO app_env_configs (app_id, env, cluster, enabled) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (app_id, env, cluster) DO UPDATE SET enabled = EXCLUDED.enabled",
        )
        .bind(config.app_id)
        .bind(config.env.as_str())
        .bind(&config.cluster)
        .bind(config.enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_project_env_config(&self, config: ProjectEnvConfig) -> CoreResult<()> {
        let artifacts = serde_json::to_value(&config.artifacts)
            .map_err(|e| CoreError::Internal(anyhow::anyhow!("bad artifacts spec: {e}")))?;
        sqlx::query(
            "INSERT INTO project_env_configs (project_id, env, allowed_clusters, artifacts) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (project_id, env) DO UPDATE \
             SET allowed_clusters = EXCLUDED.allowed_clusters, artifacts = EXCLUDED.artifacts",
        )
        .bind(config.project_id)
        .bind(config.env.as_str())
        .bind(&config.allowed_clusters)
        .bind(artifacts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_deployed_tag(&self, app_id: i64, tag: &str) -> CoreResult<()> {
        let result = sqlx::query("UPDATE applications SET deployed_tag = $2 WHERE id = $1")
            .bind(app_id)
            .bind(tag)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("application", app_id));
        }
        Ok(())
    }

    async fn batch(&self, id: i64) -> CoreResult<Batch> {
        let row = sqlx::query("SELECT * FROM batches WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found("batch", id))?;
        map_batch(&row)
    }

    async fn active_batches(&self, created_after: DateTime<Utc>) -> CoreResult<Vec<Batch>> {
        let rows = sqlx::query(
            "SELECT * FROM batches \
             WHERE status > $1 AND status < $2 AND created_at > $3 ORDER BY id",
        )
        .bind(BatchStatus::Draft.code())
        .bind(BatchStatus::Completed.code())
        .bind(created_after)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_batch).collect()
    }

    async fn release_app(&self, id: i64) -> CoreResult<ReleaseApp> {
        let row = sqlx::query("SELECT * FROM release_apps WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found("release_app", id))?;
        map_release_app(&row)
    }

    async fn release_apps_of_batch(&self, batch_id: i64) -> CoreResult<Vec<ReleaseApp>> {
        let rows = sqlx::query("SELECT * FROM release_apps WHERE batch_id = $1 ORDER BY id")
            .bind(batch_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_release_app).collect()
    }

    async fn open_release_apps_for_app(
        &self,
        app_id: i64,
    ) -> CoreResult<Vec<(Batch, ReleaseApp)>> {
        let rows = sqlx::query(
            "SELECT r.id AS release_id FROM release_apps r \
             JOIN batches b ON b.id = r.batch_id \
             WHERE r.app_id = $1 AND b.status < $2 ORDER BY r.id",
        )
        .bind(app_id)
        .bind(BatchStatus::Completed.code())
        .fetch_all(&self.pool)
        .await?;

        let mut pairs = Vec::with_capacity(rows.len());
        for row in &rows {
            let release_id: i64 = row.try_get("release_id")?;
            let release = self.release_app(release_id).await?;
            let batch = self.batch(release.batch_id).await?;
            pairs.push((batch, release));
        }
        Ok(pairs)
    }

    async fn deployments_of_batch(&self, batch_id: i64) -> CoreResult<Vec<Deployment>> {
        let rows = sqlx::query("SELECT * FROM deployments WHERE batch_id = $1 ORDER BY id")
            .bind(batch_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_deployment).collect()
    }

    async fn deployments_of_release(
        &self,
        release_id: i64,
        env: Env,
    ) -> CoreResult<Vec<Deployment>> {
        let rows =
            sqlx::query("SELECT * FROM deployments WHERE release_id = $1 AND env = $2 ORDER BY id")
                .bind(release_id)
                .bind(env.as_str())
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(map_deployment).collect()
    }

    async fn create_batch(&self, new: NewBatch) -> CoreResult<Batch> {
        let mut tx = self.pool.begin().await?;
        let number: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(batch_number), 0) + 1 FROM batches WHERE project_id = $1",
        )
        .bind(new.project_id)
        .fetch_one(&mut *tx)
        .await?;
        let row = sqlx::query(
            "INSERT INTO batches (batch_number, project_id, initiator) \
             VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(number)
        .bind(new.project_id)
        .bind(&new.initiator)
        .fetch_one(&mut *tx)
        .await?;
        let batch = map_batch(&row)?;
        tx.commit().await?;
        Ok(batch)
    }

    async fn create_release_app(&self, new: NewReleaseApp) -> CoreResult<ReleaseApp> {
        let row = sqlx::query(
            "INSERT INTO release_apps (batch_id, app_id, build_id, latest_build_id, temp_depends_on) \
             VALUES ($1, $2, $3, $3, $4) RETURNING *",
        )
        .bind(new.batch_id)
        .bind(new.app_id)
        .bind(new.build_id)
        .bind(&new.temp_depends_on)
        .fetch_one(&self.pool)
        .await?;
        map_release_app(&row)
    }

    async fn update_batch<F>(&self, id: i64, mutate: F) -> CoreResult<Batch>
    where
        F: FnOnce(&mut Batch) -> CoreResult<()> + Send,
    {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM batches WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::not_found("batch", id))?;
        let mut batch = map_batch(&row)?;
        let observed = batch.status;

        mutate(&mut batch)?;

        let result = persist_batch(&mut tx, &batch, observed).await?;
        if result == 0 {
            return Err(CoreError::StatusConflict {
                entity: "batch",
                id,
            });
        }
        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM batches WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::not_found("batch", id))?;
        let mut batch = map_batch(&row)?;
        let observed = batch.status;

        let rows = sqlx::query("SELECT * FROM release_apps WHERE batch_id = $1 ORDER BY id")
            .bind(id)
            .fetch_all(&mut *tx)
            .await?;
        let mut apps: Vec<ReleaseApp> = rows
            .iter()
            .map(map_release_app)
            .collect::<CoreResult<_>>()?;

        mutate(&mut batch, &mut apps)?;

        let result = persist_batch(&mut tx, &batch, observed).await?;
        if result == 0 {
            return Err(CoreError::StatusConflict {
                entity: "batch",
                id,
            });
        }
        for app in &apps {
            persist_release_app_unguarded(&mut tx, app).await?;
        }
        tx.commit().await?;
        Ok((batch, apps))
    }

    async fn update_release_app<F>(&self, id: i64, mutate: F) -> CoreResult<ReleaseApp>
    where
        F: FnOnce(&mut ReleaseApp) -> CoreResult<()> + Send,
    {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM release_apps WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::not_found("release_app", id))?;
        let mut app = map_release_app(&row)?;
        let observed = app.status;

        mutate(&mut app)?;

        let result = sqlx::query(
            "UPDATE release_apps SET build_id = $3, latest_build_id = $4, \
             previous_deployed_tag = $5, target_tag = $6, is_locked = $7, skip_pre_env = $8, \
             status = $9, reason = $10, temp_depends_on = $11, updated_at = NOW() \
             WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(observed.code())
        .bind(app.build_id)
        .bind(app.latest_build_id)
        .bind(&app.previous_deployed_tag)
        .bind(&app.target_tag)
        .bind(app.is_locked)
        .bind(app.skip_pre_env)
        .bind(app.status.code())
        .bind(&app.reason)
        .bind(&app.temp_depends_on)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if result == 0 {
            return Err(CoreError::StatusConflict {
                entity: "release_app",
                id,
            });
        }
        tx.commit().await?;
        Ok(app)
    }

    async fn update_deployment<F>(&self, id: i64, mutate: F) -> CoreResult<Deployment>
    where
        F: FnOnce(&mut Deployment) -> CoreResult<()> + Send,
    {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM deployments WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::not_found("deployment", id))?;
        let mut deployment = map_deployment(&row)?;
        let observed = deployment.status;

        mutate(&mut deployment)?;

        let result = sqlx::query(
            "UPDATE deployments SET namespace = $3, deployment_name = $4, driver_type = $5, \
             chart_values = $6, image_url = $7, image_tag = $8, status = $9, retry_count = $10, \
             error_message = $11, started_at = $12, finished_at = $13, updated_at = NOW() \
             WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(observed.as_str())
        .bind(&deployment.namespace)
        .bind(&deployment.deployment_name)
        .bind(&deployment.driver_type)
        .bind(&deployment.values)
        .bind(&deployment.image_url)
        .bind(&deployment.image_tag)
        .bind(deployment.status.as_str())
        .bind(deployment.retry_count)
        .bind(&deployment.error_message)
        .bind(deployment.started_at)
        .bind(deployment.finished_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if result == 0 {
            return Err(CoreError::StatusConflict {
                entity: "deployment",
                id,
            });
        }
        tx.commit().await?;
        Ok(deployment)
    }

    async fn ensure_deployment(&self, new: NewDeployment) -> CoreResult<Deployment> {
        let row = sqlx::query(
            "INSERT INTO deployments \
             (batch_id, app_id, release_id, env, cluster_name, chart_values, image_url, image_tag) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (release_id, env, cluster_name) DO NOTHING RETURNING *",
        )
        .bind(new.batch_id)
        .bind(new.app_id)
        .bind(new.release_id)
        .bind(new.env.as_str())
        .bind(&new.cluster_name)
        .bind(&new.values)
        .bind(&new.image_url)
        .bind(&new.image_tag)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => map_deployment(&row),
            None => {
                // Lost the insert race or the row already existed; read it back.
                let row = sqlx::query(
                    "SELECT * FROM deployments \
                     WHERE release_id = $1 AND env = $2 AND cluster_name = $3",
                )
                .bind(new.release_id)
                .bind(new.env.as_str())
                .bind(&new.cluster_name)
                .fetch_one(&self.pool)
                .await?;
                map_deployment(&row)
            }
        }
    }
}

async fn persist_batch(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    batch: &Batch,
    observed: BatchStatus,
) -> CoreResult<u64> {
    let result = sqlx::query(
        "UPDATE batches SET approval_status = $3, status = $4, sealed_by = $5, sealed_at = $6, \
         pre_triggered_by = $7, pre_started_at = $8, pre_finished_at = $9, \
         prod_triggered_by = $10, prod_started_at = $11, prod_finished_at = $12, \
         final_accepted_by = $13, final_accepted_at = $14, \
         cancelled_by = $15, cancelled_at = $16, cancel_reason = $17, updated_at = NOW() \
         WHERE id = $1 AND status = $2",
    )
    .bind(batch.id)
    .bind(observed.code())
    .bind(batch.approval_status.as_str())
    .bind(batch.status.code())
    .bind(&batch.sealed_by)
    .bind(batch.sealed_at)
    .bind(&batch.pre_triggered_by)
    .bind(batch.pre_started_at)
    .bind(batch.pre_finished_at)
    .bind(&batch.prod_triggered_by)
    .bind(batch.prod_started_at)
    .bind(batch.prod_finished_at)
    .bind(&batch.final_accepted_by)
    .bind(batch.final_accepted_at)
    .bind(&batch.cancelled_by)
    .bind(batch.cancelled_at)
    .bind(&batch.cancel_reason)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected())
}

async fn persist_release_app_unguarded(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    app: &ReleaseApp,
) -> CoreResult<()> {
    sqlx::query(
        "UPDATE release_apps SET build_id = $2, latest_build_id = $3, \
         previous_deployed_tag = $4, target_tag = $5, is_locked = $6, skip_pre_env = $7, \
         status = $8, reason = $9, temp_depends_on = $10, updated_at = NOW() \
         WHERE id = $1",
    )
    .bind(app.id)
    .bind(app.build_id)
    .bind(app.latest_build_id)
    .bind(&app.previous_deployed_tag)
    .bind(&app.target_tag)
    .bind(app.is_locked)
    .bind(app.skip_pre_env)
    .bind(app.status.code())
    .bind(&app.reason)
    .bind(&app.temp_depends_on)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
