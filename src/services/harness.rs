//! Shared fixture for engine and machine tests
//!
//! Builds a fully wired engine on the in-memory store with a scriptable
//! driver, plus helpers to seed the catalog and drive ticks until the batch
//! stops moving.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::domain::{
    AppEnvConfig, Application, ArtifactsSpec, Batch, BatchAction, Build, BuildStatus, Cluster,
    Deployment, Env, NewBatch, NewReleaseApp, Project, ProjectEnvConfig, ReleaseApp, Repository,
    StageSpec,
};
use crate::drivers::mock::MockDriver;
use crate::drivers::DriverRegistry;
use crate::error::CoreResult;
use crate::infrastructure::memory::MemStore;
use crate::infrastructure::notify::{NotificationSink, NotifyKind};
use crate::infrastructure::store::Store;
use crate::services::engine::{Engine, TickOutcome};

/// Sink that records events for assertions
#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<(NotifyKind, serde_json::Value)>>,
}

impl RecordingSink {
    pub fn kinds(&self) -> Vec<NotifyKind> {
        self.events.lock().unwrap().iter().map(|(k, _)| *k).collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, kind: NotifyKind, payload: serde_json::Value) {
        self.events.lock().unwrap().push((kind, payload));
    }
}

pub struct TestWorld {
    pub store: Arc<MemStore>,
    pub engine: Engine<MemStore>,
    pub sink: Arc<RecordingSink>,
    pub project: Project,
    pub repo: Repository,
}

impl TestWorld {
    pub async fn new() -> Self {
        Self::build(Arc::new(MockDriver::succeeding()), false).await
    }

    pub async fn with_driver(driver: Arc<MockDriver>) -> Self {
        Self::build(driver, false).await
    }

    /// Same world, but the artifacts spec carries an enabled config chart
    pub async fn with_pre_stage(driver: Arc<MockDriver>) -> Self {
        Self::build(driver, true).await
    }

    async fn build(driver: Arc<MockDriver>, with_pre_stage: bool) -> Self {
        let store = Arc::new(MemStore::new());
        let sink = Arc::new(RecordingSink::default());
        let mut registry = DriverRegistry::new();
        registry.register(driver);

        let project = store.insert_project("shop").await.unwrap();
        let repo = store.insert_repository("pleme", "shop", 2).await.unwrap();
        store
            .insert_cluster(Cluster {
                name: "eu-1".into(),
                kubeconfig: None,
            })
            .await
            .unwrap();

        let artifacts = ArtifactsSpec {
            namespace_template: "{project}-{env}".into(),
            release_name_template: None,
            pre: with_pre_stage.then(|| StageSpec {
                enabled: true,
                driver: "mock".into(),
                chart: "oci://charts.example.com/config".into(),
                chart_version: None,
                values: serde_json::json!({}),
            }),
            main: StageSpec {
                enabled: true,
                driver: "mock".into(),
                chart: "oci://charts.example.com/app".into(),
                chart_version: None,
                values: serde_json::json!({"replicas": 1}),
            },
        };
        for env in [Env::Pre, Env::Prod] {
            store
                .insert_project_env_config(ProjectEnvConfig {
                    project_id: project.id,
                    env,
                    allowed_clusters: vec!["eu-1".into()],
                    artifacts: artifacts.clone(),
                })
                .await
                .unwrap();
        }

        let engine = Engine::new(
            store.clone(),
            registry,
            sink.clone(),
            &Config::default(),
        );
        Self {
            store,
            engine,
            sink,
            project,
            repo,
        }
    }

    pub async fn add_app(
        &self,
        name: &str,
        app_type: &str,
        depends_on: Vec<i64>,
        envs: &[Env],
    ) -> Application {
        let app = self
            .store
            .insert_application(name, app_type, self.project.id, self.repo.id, depends_on)
            .await
            .unwrap();
        for env in envs {
            self.store
                .insert_app_env_config(AppEnvConfig {
                    app_id: app.id,
                    env: *env,
                    cluster: "eu-1".into(),
                    enabled: true,
                })
                .await
                .unwrap();
        }
        app
    }

    pub async fn add_build(&self, app_id: i64, tag: &str) -> Build {
        self.store
            .insert_build(app_id, tag, None, BuildStatus::Success)
            .await
            .unwrap()
    }

    pub async fn draft_batch(
        &self,
        apps: &[(i64, Option<i64>)],
    ) -> (Batch, Vec<ReleaseApp>) {
        let batch = self
            .store
            .create_batch(NewBatch {
                project_id: self.project.id,
                initiator: "gao".into(),
            })
            .await
            .unwrap();
        let mut releases = Vec::new();
        for (app_id, build_id) in apps {
            releases.push(
                self.store
                    .create_release_app(NewReleaseApp {
                        batch_id: batch.id,
                        app_id: *app_id,
                        build_id: *build_id,
                        temp_depends_on: Vec::new(),
                    })
                    .await
                    .unwrap(),
            );
        }
        (batch, releases)
    }

    pub async fn action(&self, batch_id: i64, action: BatchAction) -> CoreResult<Batch> {
        self.engine
            .process_batch_action(batch_id, action, "gao", None)
            .await
    }

    pub async fn tick(&self, batch_id: i64) -> TickOutcome {
        self.engine.process_batch_tick(batch_id).await.unwrap()
    }

    /// Tick until a pass changes nothing, then return
    pub async fn settle(&self, batch_id: i64) {
        for _ in 0..25 {
            let before = self.fingerprint(batch_id).await;
            self.tick(batch_id).await;
            if before == self.fingerprint(batch_id).await {
                return;
            }
        }
        panic!("batch {batch_id} did not settle within 25 ticks");
    }

    pub async fn batch(&self, batch_id: i64) -> Batch {
        self.store.batch(batch_id).await.unwrap()
    }

    pub async fn releases(&self, batch_id: i64) -> Vec<ReleaseApp> {
        self.store.release_apps_of_batch(batch_id).await.unwrap()
    }

    pub async fn deployments(&self, batch_id: i64) -> Vec<Deployment> {
        self.store.deployments_of_batch(batch_id).await.unwrap()
    }

    async fn fingerprint(&self, batch_id: i64) -> String {
        let batch = self.batch(batch_id).await;
        let releases = self.releases(batch_id).await;
        let deployments = self.deployments(batch_id).await;
        let mut out = format!("{}@{};", batch.status, batch.updated_at);
        for r in releases {
            out.push_str(&format!("r{}:{}@{}:{};", r.id, r.status, r.updated_at, r.reason));
        }
        for d in deployments {
            out.push_str(&format!("d{}:{}@{};", d.id, d.status, d.updated_at));
        }
        out
    }
}
