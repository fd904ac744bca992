//! Orchestration engine
//!
//! One engine per process. External commands (batch actions, version
//! switches, manual triggers, build events) run on the caller's task and go
//! straight to the persistence gateway; the scanner's batch workers call
//! [`Engine::process_batch_tick`] to advance the three state machines. Both
//! paths are serialised by the optimistic status lock: whoever loses a race
//! sees `StatusConflict`, and only the scanner silently retries.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::domain::{
    Batch, BatchAction, BatchSnapshot, BatchStatus, Build, BuildStatus, DeployState,
    IncomingBuild, ManualAction, ReleaseApp, ReleaseStatus,
};
use crate::drivers::DriverRegistry;
use crate::error::{CoreError, CoreResult};
use crate::infrastructure::notify::NotificationSink;
use crate::infrastructure::store::Store;
use crate::services::batch_machine::BatchMachine;
use crate::services::deploy_machine::DeployMachine;
use crate::services::release_machine::ReleaseMachine;

/// What a worker tick learned about its batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Active,
    /// Completed or cancelled; the worker retires
    Terminal,
}

/// Statuses a version switch may depart from
const SWITCHABLE: &[ReleaseStatus] = &[
    ReleaseStatus::PreTriggered,
    ReleaseStatus::PreDeployed,
    ReleaseStatus::PreFailed,
    ReleaseStatus::ProdTriggered,
    ReleaseStatus::ProdDeployed,
    ReleaseStatus::ProdFailed,
];

/// Ties the state machines, the store and the driver registry together
pub struct Engine<S: Store> {
    store: Arc<S>,
    batch_machine: BatchMachine<S>,
    release_machine: ReleaseMachine<S>,
    deploy_machine: DeployMachine<S>,
}

impl<S: Store> Engine<S> {
    pub fn new(
        store: Arc<S>,
        registry: DriverRegistry,
        sink: Arc<dyn NotificationSink>,
        config: &Config,
    ) -> Self {
        Self {
            batch_machine: BatchMachine::new(store.clone(), sink.clone()),
            release_machine: ReleaseMachine::new(
                store.clone(),
                sink.clone(),
                config.dependencies.app_type_depends.clone(),
            ),
            deploy_machine: DeployMachine::new(store.clone(), registry, sink),
            store,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    // ------------------------------------------------------------------
    // Inbound command surface
    // ------------------------------------------------------------------

    /// Fire an outside batch transition (seal, cancel, wave starts, accepts)
    pub async fn process_batch_action(
        &self,
        batch_id: i64,
        action: BatchAction,
        operator: &str,
        reason: Option<&str>,
    ) -> CoreResult<Batch> {
        self.batch_machine
            .apply(batch_id, action, operator, reason)
            .await
    }

    /// Re-arm a release app with a different build
    ///
    /// Routes to the prod half when the app skips pre, to the pre half
    /// otherwise. Requires a sealed batch; the build must belong to the app.
    pub async fn switch_version(
        &self,
        release_id: i64,
        build_id: i64,
        operator: &str,
        reason: Option<&str>,
    ) -> CoreResult<ReleaseApp> {
        let release = self.store.release_app(release_id).await?;
        let batch = self.store.batch(release.batch_id).await?;
        if batch.status == BatchStatus::Draft {
            return Err(CoreError::Precondition(
                "batch must be sealed before switching versions".into(),
            ));
        }
        if batch.status.is_terminal() {
            return Err(CoreError::Precondition(format!(
                "batch {} is {}",
                batch.id, batch.status
            )));
        }
        let build = self.store.build(build_id).await?;
        if build.app_id != release.app_id {
            return Err(CoreError::Precondition(format!(
                "build {} belongs to application {}, not {}",
                build.id, build.app_id, release.app_id
            )));
        }

        let target = if release.skip_pre_env {
            ReleaseStatus::ProdCanTrigger
        } else {
            ReleaseStatus::PreCanTrigger
        };
        let image_tag = build.image_tag.clone();
        let note = match reason {
            Some(reason) => format!("switched to build {} by {operator}: {reason}", build.id),
            None => format!("switched to build {} by {operator}", build.id),
        };
        self.store
            .update_release_app(release_id, move |r| {
                if !SWITCHABLE.contains(&r.status) {
                    return Err(CoreError::InvalidTransition {
                        entity: "release_app",
                        id: r.id,
                        action: "switch_version".into(),
                        status: r.status.name().to_string(),
                    });
                }
                r.build_id = Some(build_id);
                r.target_tag = Some(image_tag);
                r.status = target;
                r.reason = note;
                Ok(())
            })
            .await
    }

    /// Push a release app into a wave by hand
    pub async fn manual_deploy(
        &self,
        release_id: i64,
        action: ManualAction,
        operator: &str,
    ) -> CoreResult<ReleaseApp> {
        let release = self.store.release_app(release_id).await?;
        let batch = self.store.batch(release.batch_id).await?;
        if batch.status == BatchStatus::Draft || batch.status.is_terminal() {
            return Err(CoreError::Precondition(format!(
                "batch {} is {}",
                batch.id, batch.status
            )));
        }

        let operator = operator.to_string();
        self.store
            .update_release_app(release_id, move |r| {
                let target = match action {
                    ManualAction::TriggerPre => {
                        if r.status != ReleaseStatus::Tagged {
                            return Err(invalid_manual(r, action));
                        }
                        if r.build_id.is_none() || r.target_tag.is_none() {
                            return Err(CoreError::Precondition(format!(
                                "release {} has no committed build",
                                r.id
                            )));
                        }
                        ReleaseStatus::PreCanTrigger
                    }
                    ManualAction::TriggerProd => {
                        let from_tagged = r.status == ReleaseStatus::Tagged && r.skip_pre_env;
                        let from_pre_deployed = r.status == ReleaseStatus::PreDeployed;
                        if !from_tagged && !from_pre_deployed {
                            return Err(invalid_manual(r, action));
                        }
                        ReleaseStatus::ProdCanTrigger
                    }
                };
                r.status = target;
                r.reason = format!("manually triggered by {operator}");
                Ok(())
            })
            .await
    }

    /// Handle "a new build arrived for app X"
    ///
    /// The build is persisted either way; pins only move for successful
    /// builds. In an unsealed batch an unpinned app follows the new build;
    /// in a sealed batch only `latest_build_id` is updated for display.
    pub async fn on_new_build(&self, app_id: i64, incoming: IncomingBuild) -> CoreResult<Build> {
        let status = BuildStatus::parse(&incoming.build_status).ok_or_else(|| {
            CoreError::Precondition(format!("unknown build status {}", incoming.build_status))
        })?;
        // Make sure the application exists before recording anything.
        self.store.application(app_id).await?;
        let build = self
            .store
            .insert_build(
                app_id,
                &incoming.image_tag,
                incoming.image_url.as_deref(),
                status,
            )
            .await?;
        if status != BuildStatus::Success {
            return Ok(build);
        }

        let pairs = self.store.open_release_apps_for_app(app_id).await?;
        if pairs.len() > 1 {
            warn!(
                "Application {app_id} participates in {} open batches; applying build {} to all",
                pairs.len(),
                build.id
            );
        }
        for (batch, release) in pairs {
            let unsealed = batch.status == BatchStatus::Draft;
            let build_id = build.id;
            let image_tag = build.image_tag.clone();
            let result = self
                .store
                .update_release_app(release.id, move |r| {
                    if unsealed && r.build_id == r.latest_build_id {
                        r.build_id = Some(build_id);
                        r.latest_build_id = Some(build_id);
                        r.target_tag = Some(image_tag);
                    } else {
                        r.latest_build_id = Some(build_id);
                    }
                    Ok(())
                })
                .await;
            if let Err(e) = result {
                warn!(
                    "Failed to apply build {} to release {}: {e}",
                    build.id, release.id
                );
            }
        }
        Ok(build)
    }

    /// Read-only status snapshot
    pub async fn batch_status(&self, batch_id: i64) -> CoreResult<BatchSnapshot> {
        let batch = self.store.batch(batch_id).await?;
        Ok(BatchSnapshot::from(&batch))
    }

    // ------------------------------------------------------------------
    // Worker tick
    // ------------------------------------------------------------------

    /// One pass of batch -> release apps -> deployments, in id order
    ///
    /// Item-level conflicts and errors are logged and left for the next
    /// tick; only the batch itself vanishing propagates.
    pub async fn process_batch_tick(&self, batch_id: i64) -> CoreResult<TickOutcome> {
        let mut batch = self.store.batch(batch_id).await?;
        if batch.status.is_terminal() {
            return Ok(TickOutcome::Terminal);
        }

        let apps = self.store.release_apps_of_batch(batch_id).await?;
        match self.batch_machine.process(&batch, &apps).await {
            Ok(Some(updated)) => batch = updated,
            Ok(None) => {}
            Err(e) if e.is_conflict() => debug!("Batch {batch_id} tick lost a race: {e}"),
            Err(e) => warn!("Batch {batch_id} machine error: {e}"),
        }
        if batch.status.is_terminal() {
            return Ok(TickOutcome::Terminal);
        }

        for release in self.store.release_apps_of_batch(batch_id).await? {
            if release.status <= ReleaseStatus::Pending {
                continue;
            }
            if let Err(e) = self.release_machine.process(&batch, &release).await {
                if e.is_conflict() {
                    debug!("Release {} tick lost a race: {e}", release.id);
                } else {
                    warn!("Release {} processing failed: {e}", release.id);
                }
            }
        }

        for deployment in self.store.deployments_of_batch(batch_id).await? {
            if deployment.status == DeployState::Success {
                continue;
            }
            if let Err(e) = self.deploy_machine.process(&deployment).await {
                if e.is_conflict() {
                    debug!("Deployment {} tick lost a race: {e}", deployment.id);
                } else {
                    warn!("Deployment {} processing failed: {e}", deployment.id);
                }
            }
        }

        let batch = self.store.batch(batch_id).await?;
        Ok(if batch.status.is_terminal() {
            TickOutcome::Terminal
        } else {
            TickOutcome::Active
        })
    }
}

fn invalid_manual(release: &ReleaseApp, action: ManualAction) -> CoreError {
    CoreError::InvalidTransition {
        entity: "release_app",
        id: release.id,
        action: action.as_str().to_string(),
        status: release.status.name().to_string(),
    }
}

/// Parse-and-dispatch wrapper for transports that deliver actions as text
pub fn parse_batch_action(raw: &str) -> CoreResult<BatchAction> {
    BatchAction::parse(raw)
        .ok_or_else(|| CoreError::Precondition(format!("unknown batch action {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DriverStage, Env};
    use crate::drivers::{mock::MockDriver, DriverStatus};
    use crate::infrastructure::notify::NotifyKind;
    use crate::services::harness::TestWorld;

    #[tokio::test]
    async fn happy_path_pre_to_prod() {
        let world = TestWorld::new().await;
        let a1 = world.add_app("cart", "backend", vec![], &[Env::Pre, Env::Prod]).await;
        let a2 = world.add_app("search", "backend", vec![], &[Env::Pre, Env::Prod]).await;
        let b1 = world.add_build(a1.id, "v1.1.0").await;
        let b2 = world.add_build(a2.id, "v2.4.0").await;
        let (batch, _) = world
            .draft_batch(&[(a1.id, Some(b1.id)), (a2.id, Some(b2.id))])
            .await;

        world.action(batch.id, BatchAction::Seal).await.unwrap();
        world.action(batch.id, BatchAction::Approve).await.unwrap();
        world
            .action(batch.id, BatchAction::StartPreDeploy)
            .await
            .unwrap();
        world.settle(batch.id).await;
        assert_eq!(world.batch(batch.id).await.status, BatchStatus::PreDeployed);
        for release in world.releases(batch.id).await {
            assert_eq!(release.status, ReleaseStatus::PreDeployed);
            assert!(!release.skip_pre_env);
        }

        world.action(batch.id, BatchAction::AcceptPre).await.unwrap();
        world
            .action(batch.id, BatchAction::StartProdDeploy)
            .await
            .unwrap();
        world.settle(batch.id).await;
        assert_eq!(world.batch(batch.id).await.status, BatchStatus::ProdDeployed);

        world.action(batch.id, BatchAction::AcceptProd).await.unwrap();
        world.action(batch.id, BatchAction::Complete).await.unwrap();

        let done = world.batch(batch.id).await;
        assert_eq!(done.status, BatchStatus::Completed);
        assert!(done.pre_finished_at.is_some());
        assert!(done.prod_finished_at.is_some());
        assert!(done.final_accepted_at.is_some());

        for release in world.releases(batch.id).await {
            assert_eq!(release.status, ReleaseStatus::ProdAccepted);
            assert!(release.is_locked);
        }
        let deployments = world.deployments(batch.id).await;
        assert_eq!(deployments.len(), 4); // 2 apps x (pre + prod)
        for d in &deployments {
            assert_eq!(d.status, DeployState::Success);
            assert_eq!(d.driver_type.as_deref(), Some("mock"));
            assert_eq!(d.namespace, format!("shop-{}", d.env));
            // success implies a coherent execution window
            let started = d.started_at.unwrap();
            let finished = d.finished_at.unwrap();
            assert!(started <= finished);
        }

        // The accepted versions became the live tags.
        let app = world.store.application(a1.id).await.unwrap();
        assert_eq!(app.deployed_tag.as_deref(), Some("v1.1.0"));
        let app = world.store.application(a2.id).await.unwrap();
        assert_eq!(app.deployed_tag.as_deref(), Some("v2.4.0"));

        // Lifecycle events fired along the way.
        let kinds = world.sink.kinds();
        assert!(kinds.contains(&NotifyKind::BatchStart));
        assert!(kinds.contains(&NotifyKind::DeployStart));
        assert!(kinds.contains(&NotifyKind::DeploySuccess));
        assert!(kinds.contains(&NotifyKind::BatchComplete));
        assert!(!kinds.contains(&NotifyKind::BatchFailed));
    }

    #[tokio::test]
    async fn dependency_gates_the_pre_wave() {
        let world = TestWorld::new().await;
        let backend = world
            .add_app("backend", "api", vec![], &[Env::Pre, Env::Prod])
            .await;
        let frontend = world
            .add_app("frontend", "web", vec![backend.id], &[Env::Pre, Env::Prod])
            .await;
        let bb = world.add_build(backend.id, "b1").await;
        let fb = world.add_build(frontend.id, "f1").await;
        let (batch, _) = world
            .draft_batch(&[(frontend.id, Some(fb.id)), (backend.id, Some(bb.id))])
            .await;

        world.action(batch.id, BatchAction::Seal).await.unwrap();
        world.action(batch.id, BatchAction::Approve).await.unwrap();
        world
            .action(batch.id, BatchAction::StartPreDeploy)
            .await
            .unwrap();

        // After two ticks the backend is underway but not yet deployed:
        // the frontend must still be waiting and say why.
        world.tick(batch.id).await;
        world.tick(batch.id).await;
        let releases = world.releases(batch.id).await;
        let front = releases.iter().find(|r| r.app_id == frontend.id).unwrap();
        let back = releases.iter().find(|r| r.app_id == backend.id).unwrap();
        assert_eq!(front.status, ReleaseStatus::PreWaiting);
        assert!(front.reason.contains("backend"), "reason: {}", front.reason);
        assert!(back.status > ReleaseStatus::PreWaiting);

        // Once the backend finishes, the frontend follows.
        world.settle(batch.id).await;
        let releases = world.releases(batch.id).await;
        assert!(releases
            .iter()
            .all(|r| r.status == ReleaseStatus::PreDeployed));
    }

    #[tokio::test]
    async fn driver_failure_stays_local_until_switched() {
        let driver = std::sync::Arc::new(MockDriver::with_polls(vec![
            DriverStatus::Failed("image pull".into()),
            DriverStatus::Success,
        ]));
        let world = TestWorld::with_driver(driver).await;
        let app = world.add_app("cart", "backend", vec![], &[Env::Pre]).await;
        let build = world.add_build(app.id, "v1").await;
        let (batch, releases) = world.draft_batch(&[(app.id, Some(build.id))]).await;
        let release_id = releases[0].id;

        world.action(batch.id, BatchAction::Seal).await.unwrap();
        world.action(batch.id, BatchAction::Approve).await.unwrap();
        world
            .action(batch.id, BatchAction::StartPreDeploy)
            .await
            .unwrap();
        world.settle(batch.id).await;

        let release = world.store.release_app(release_id).await.unwrap();
        assert_eq!(release.status, ReleaseStatus::PreFailed);
        assert!(release.reason.contains("image pull"), "reason: {}", release.reason);
        let deployments = world.deployments(batch.id).await;
        assert_eq!(deployments[0].status, DeployState::Failed);
        assert_eq!(deployments[0].retry_count, 1);
        // The batch hangs in PreDeploying; siblings and the batch level are
        // untouched by the local failure.
        assert_eq!(world.batch(batch.id).await.status, BatchStatus::PreDeploying);

        // Operator ships a fixed build.
        let fixed = world.add_build(app.id, "v2").await;
        let release = world
            .engine
            .switch_version(release_id, fixed.id, "gao", Some("fixed image"))
            .await
            .unwrap();
        assert_eq!(release.status, ReleaseStatus::PreCanTrigger);
        assert_eq!(release.target_tag.as_deref(), Some("v2"));

        world.settle(batch.id).await;
        assert_eq!(world.batch(batch.id).await.status, BatchStatus::PreDeployed);
        let deployments = world.deployments(batch.id).await;
        assert_eq!(deployments.len(), 1);
        assert_eq!(deployments[0].status, DeployState::Success);
        assert_eq!(deployments[0].image_tag.as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn second_seal_fails_without_side_effects() {
        let world = TestWorld::new().await;
        let app = world.add_app("cart", "backend", vec![], &[Env::Pre]).await;
        let build = world.add_build(app.id, "v1").await;
        let (batch, _) = world.draft_batch(&[(app.id, Some(build.id))]).await;

        world.action(batch.id, BatchAction::Seal).await.unwrap();
        let sealed = world.batch(batch.id).await;
        let apps_before = world.releases(batch.id).await;

        let err = world.action(batch.id, BatchAction::Seal).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));

        let after = world.batch(batch.id).await;
        assert_eq!(after.status, sealed.status);
        assert_eq!(after.sealed_at, sealed.sealed_at);
        assert_eq!(after.updated_at, sealed.updated_at);
        let apps_after = world.releases(batch.id).await;
        for (before, after) in apps_before.iter().zip(apps_after.iter()) {
            assert_eq!(before.status, after.status);
            assert_eq!(before.updated_at, after.updated_at);
        }
    }

    #[tokio::test]
    async fn seal_preconditions_name_the_problem() {
        let world = TestWorld::new().await;
        let (empty, _) = world.draft_batch(&[]).await;
        let err = world.action(empty.id, BatchAction::Seal).await.unwrap_err();
        match err {
            CoreError::Precondition(message) => assert!(message.contains("no apps")),
            other => panic!("expected Precondition, got {other}"),
        }

        let app = world.add_app("cart", "backend", vec![], &[Env::Pre]).await;
        let (batch, _) = world.draft_batch(&[(app.id, None)]).await;
        let err = world.action(batch.id, BatchAction::Seal).await.unwrap_err();
        match err {
            CoreError::Precondition(message) => {
                assert!(message.contains(&app.id.to_string()), "message: {message}")
            }
            other => panic!("expected Precondition, got {other}"),
        }
        // Nothing moved.
        assert_eq!(world.batch(batch.id).await.status, BatchStatus::Draft);
    }

    #[tokio::test]
    async fn seal_freezes_the_batch_contents() {
        let world = TestWorld::new().await;
        let with_pre = world.add_app("cart", "backend", vec![], &[Env::Pre, Env::Prod]).await;
        let prod_only = world.add_app("worker", "job", vec![], &[Env::Prod]).await;
        world
            .store
            .set_deployed_tag(with_pre.id, "v0.9.0")
            .await
            .unwrap();
        let b1 = world.add_build(with_pre.id, "v1.0.0").await;
        let b2 = world.add_build(prod_only.id, "w1").await;
        let (batch, _) = world
            .draft_batch(&[(with_pre.id, Some(b1.id)), (prod_only.id, Some(b2.id))])
            .await;

        let sealed = world.action(batch.id, BatchAction::Seal).await.unwrap();
        assert_eq!(sealed.status, BatchStatus::Sealed);
        assert_eq!(sealed.sealed_by.as_deref(), Some("gao"));
        assert!(sealed.sealed_at.is_some());

        let releases = world.releases(batch.id).await;
        for release in &releases {
            assert!(release.is_locked);
            assert!(release.build_id.is_some());
            assert!(release.target_tag.is_some());
            assert_eq!(release.status, ReleaseStatus::Tagged);
        }
        let cart = releases.iter().find(|r| r.app_id == with_pre.id).unwrap();
        assert_eq!(cart.previous_deployed_tag.as_deref(), Some("v0.9.0"));
        assert_eq!(cart.target_tag.as_deref(), Some("v1.0.0"));
        assert!(!cart.skip_pre_env);
        let worker = releases.iter().find(|r| r.app_id == prod_only.id).unwrap();
        assert!(worker.previous_deployed_tag.is_none());
        assert!(worker.skip_pre_env);
    }

    #[tokio::test]
    async fn all_skip_pre_batch_jumps_to_prod() {
        let world = TestWorld::new().await;
        // Prod-only apps: no pre env configs at all.
        let a1 = world.add_app("worker", "job", vec![], &[Env::Prod]).await;
        let a2 = world.add_app("cron", "job", vec![], &[Env::Prod]).await;
        let b1 = world.add_build(a1.id, "w1").await;
        let b2 = world.add_build(a2.id, "c1").await;
        let (batch, _) = world
            .draft_batch(&[(a1.id, Some(b1.id)), (a2.id, Some(b2.id))])
            .await;

        world.action(batch.id, BatchAction::Seal).await.unwrap();
        let releases = world.releases(batch.id).await;
        assert!(releases.iter().all(|r| r.skip_pre_env));

        world.action(batch.id, BatchAction::Approve).await.unwrap();
        let batch_after = world
            .action(batch.id, BatchAction::StartPreDeploy)
            .await
            .unwrap();
        assert_eq!(batch_after.status, BatchStatus::ProdWaiting);

        world.settle(batch.id).await;
        assert_eq!(world.batch(batch.id).await.status, BatchStatus::ProdDeployed);
        for release in world.releases(batch.id).await {
            // Never entered the pre decade.
            assert_eq!(release.status, ReleaseStatus::ProdDeployed);
        }
        for deployment in world.deployments(batch.id).await {
            assert_eq!(deployment.env, Env::Prod);
        }
    }

    #[tokio::test]
    async fn start_prod_from_sealed_requires_all_skip() {
        let world = TestWorld::new().await;
        let a1 = world.add_app("cart", "backend", vec![], &[Env::Pre, Env::Prod]).await;
        let b1 = world.add_build(a1.id, "v1").await;
        let (batch, _) = world.draft_batch(&[(a1.id, Some(b1.id))]).await;

        world.action(batch.id, BatchAction::Seal).await.unwrap();
        world.action(batch.id, BatchAction::Approve).await.unwrap();
        let err = world
            .action(batch.id, BatchAction::StartProdDeploy)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Precondition(_)));
        assert_eq!(world.batch(batch.id).await.status, BatchStatus::Sealed);
    }

    #[tokio::test]
    async fn unapproved_batch_cannot_start() {
        let world = TestWorld::new().await;
        let app = world.add_app("cart", "backend", vec![], &[Env::Pre]).await;
        let build = world.add_build(app.id, "v1").await;
        let (batch, _) = world.draft_batch(&[(app.id, Some(build.id))]).await;

        world.action(batch.id, BatchAction::Seal).await.unwrap();
        let err = world
            .action(batch.id, BatchAction::StartPreDeploy)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Precondition(_)));

        world.action(batch.id, BatchAction::Reject).await.unwrap();
        let err = world
            .action(batch.id, BatchAction::StartPreDeploy)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Precondition(_)));
    }

    #[tokio::test]
    async fn new_builds_follow_pin_rules() {
        let world = TestWorld::new().await;
        let app = world.add_app("cart", "backend", vec![], &[Env::Pre]).await;
        let b7 = world.add_build(app.id, "v7").await;
        let (batch, releases) = world.draft_batch(&[(app.id, Some(b7.id))]).await;
        let release_id = releases[0].id;

        // Unpinned draft: the release follows the new build.
        let b9 = world
            .engine
            .on_new_build(
                app.id,
                IncomingBuild {
                    image_tag: "v9".into(),
                    image_url: None,
                    build_status: "success".into(),
                },
            )
            .await
            .unwrap();
        let release = world.store.release_app(release_id).await.unwrap();
        assert_eq!(release.build_id, Some(b9.id));
        assert_eq!(release.latest_build_id, Some(b9.id));
        assert_eq!(release.target_tag.as_deref(), Some("v9"));

        // Operator pins back to v7 (external CRUD edit while drafting).
        world
            .store
            .update_release_app(release_id, |r| {
                r.build_id = Some(b7.id);
                r.target_tag = Some("v7".into());
                Ok(())
            })
            .await
            .unwrap();

        // Further builds only move the latest pointer.
        let b11 = world
            .engine
            .on_new_build(
                app.id,
                IncomingBuild {
                    image_tag: "v11".into(),
                    image_url: None,
                    build_status: "success".into(),
                },
            )
            .await
            .unwrap();
        let release = world.store.release_app(release_id).await.unwrap();
        assert_eq!(release.build_id, Some(b7.id));
        assert_eq!(release.target_tag.as_deref(), Some("v7"));
        assert_eq!(release.latest_build_id, Some(b11.id));

        // Sealed batches never move the pin either.
        world.action(batch.id, BatchAction::Seal).await.unwrap();
        let b12 = world
            .engine
            .on_new_build(
                app.id,
                IncomingBuild {
                    image_tag: "v12".into(),
                    image_url: None,
                    build_status: "success".into(),
                },
            )
            .await
            .unwrap();
        let release = world.store.release_app(release_id).await.unwrap();
        assert_eq!(release.build_id, Some(b7.id));
        assert_eq!(release.latest_build_id, Some(b12.id));

        // Failed builds are recorded but never advance anything.
        let failed = world
            .engine
            .on_new_build(
                app.id,
                IncomingBuild {
                    image_tag: "v13".into(),
                    image_url: None,
                    build_status: "failure".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(failed.build_status, BuildStatus::Failure);
        let release = world.store.release_app(release_id).await.unwrap();
        assert_eq!(release.latest_build_id, Some(b12.id));
    }

    #[tokio::test]
    async fn new_build_applies_to_every_open_batch() {
        let world = TestWorld::new().await;
        let app = world.add_app("cart", "backend", vec![], &[Env::Pre]).await;
        let b1 = world.add_build(app.id, "v1").await;
        let (_first, first_releases) = world.draft_batch(&[(app.id, Some(b1.id))]).await;
        let (_second, second_releases) = world.draft_batch(&[(app.id, Some(b1.id))]).await;

        let b2 = world
            .engine
            .on_new_build(
                app.id,
                IncomingBuild {
                    image_tag: "v2".into(),
                    image_url: None,
                    build_status: "success".into(),
                },
            )
            .await
            .unwrap();

        for release_id in [first_releases[0].id, second_releases[0].id] {
            let release = world.store.release_app(release_id).await.unwrap();
            assert_eq!(release.build_id, Some(b2.id));
        }
    }

    #[tokio::test]
    async fn quiescent_batch_is_stable_under_ticks() {
        let world = TestWorld::new().await;
        let app = world.add_app("cart", "backend", vec![], &[Env::Pre, Env::Prod]).await;
        let build = world.add_build(app.id, "v1").await;
        let (batch, _) = world.draft_batch(&[(app.id, Some(build.id))]).await;

        world.action(batch.id, BatchAction::Seal).await.unwrap();
        world.action(batch.id, BatchAction::Approve).await.unwrap();
        world
            .action(batch.id, BatchAction::StartPreDeploy)
            .await
            .unwrap();
        world.settle(batch.id).await;

        let snapshot = |batch: &Batch, releases: &[ReleaseApp]| {
            (
                batch.status,
                batch.updated_at,
                releases
                    .iter()
                    .map(|r| (r.id, r.status, r.updated_at))
                    .collect::<Vec<_>>(),
            )
        };
        let before = snapshot(
            &world.batch(batch.id).await,
            &world.releases(batch.id).await,
        );
        for _ in 0..5 {
            world.tick(batch.id).await;
        }
        let after = snapshot(
            &world.batch(batch.id).await,
            &world.releases(batch.id).await,
        );
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn manual_triggers_respect_their_sources() {
        let world = TestWorld::new().await;
        let app = world.add_app("cart", "backend", vec![], &[Env::Pre, Env::Prod]).await;
        let build = world.add_build(app.id, "v1").await;
        let (batch, releases) = world.draft_batch(&[(app.id, Some(build.id))]).await;
        let release_id = releases[0].id;

        // Draft batches reject manual work.
        let err = world
            .engine
            .manual_deploy(release_id, ManualAction::TriggerPre, "gao")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Precondition(_)));

        world.action(batch.id, BatchAction::Seal).await.unwrap();

        // Tagged -> PreCanTrigger without waiting for the batch wave.
        let release = world
            .engine
            .manual_deploy(release_id, ManualAction::TriggerPre, "gao")
            .await
            .unwrap();
        assert_eq!(release.status, ReleaseStatus::PreCanTrigger);

        // Prod trigger needs a finished pre (or a skip-pre app).
        let err = world
            .engine
            .manual_deploy(release_id, ManualAction::TriggerProd, "gao")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn cancelled_batch_retires_the_worker() {
        let world = TestWorld::new().await;
        let app = world.add_app("cart", "backend", vec![], &[Env::Pre]).await;
        let build = world.add_build(app.id, "v1").await;
        let (batch, _) = world.draft_batch(&[(app.id, Some(build.id))]).await;

        world.action(batch.id, BatchAction::Seal).await.unwrap();
        world
            .engine
            .process_batch_action(batch.id, BatchAction::Cancel, "gao", Some("wrong week"))
            .await
            .unwrap();

        let cancelled = world.batch(batch.id).await;
        assert_eq!(cancelled.status, BatchStatus::Cancelled);
        assert_eq!(cancelled.cancel_reason.as_deref(), Some("wrong week"));
        assert_eq!(
            world.engine.process_batch_tick(batch.id).await.unwrap(),
            TickOutcome::Terminal
        );
    }

    #[tokio::test]
    async fn rejected_actions_leave_no_trace() {
        let world = TestWorld::new().await;
        let app = world.add_app("cart", "backend", vec![], &[Env::Pre]).await;
        let build = world.add_build(app.id, "v1").await;
        let (batch, _) = world.draft_batch(&[(app.id, Some(build.id))]).await;

        let before = world.batch(batch.id).await;
        let err = world
            .action(batch.id, BatchAction::AcceptPre)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        let after = world.batch(batch.id).await;
        assert_eq!(before.status, after.status);
        assert_eq!(before.updated_at, after.updated_at);
    }

    #[tokio::test]
    async fn status_snapshot_reports_codes_and_names() {
        let world = TestWorld::new().await;
        let app = world.add_app("cart", "backend", vec![], &[Env::Pre]).await;
        let build = world.add_build(app.id, "v1").await;
        let (batch, _) = world.draft_batch(&[(app.id, Some(build.id))]).await;

        world.action(batch.id, BatchAction::Seal).await.unwrap();
        let snapshot = world.engine.batch_status(batch.id).await.unwrap();
        assert_eq!(snapshot.batch_id, batch.id);
        assert_eq!(snapshot.status, 10);
        assert_eq!(snapshot.status_name, "sealed");

        let err = world.engine.batch_status(9999).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn pre_stage_config_chart_runs_before_main() {
        let driver = std::sync::Arc::new(MockDriver::succeeding());
        let world = TestWorld::with_pre_stage(driver.clone()).await;
        let app = world.add_app("cart", "backend", vec![], &[Env::Pre]).await;
        let build = world.add_build(app.id, "v1").await;
        let (batch, _) = world.draft_batch(&[(app.id, Some(build.id))]).await;

        world.action(batch.id, BatchAction::Seal).await.unwrap();
        world.action(batch.id, BatchAction::Approve).await.unwrap();
        world
            .action(batch.id, BatchAction::StartPreDeploy)
            .await
            .unwrap();
        world.settle(batch.id).await;

        let calls = driver.exec_calls.lock().unwrap().clone();
        assert_eq!(
            calls
                .iter()
                .map(|(stage, _)| *stage)
                .collect::<Vec<_>>(),
            vec![DriverStage::Pre, DriverStage::Main]
        );
    }
}
