//! Batch state machine
//!
//! Transitions are encoded as data ({trigger, from, to, allowed sources})
//! and interpreted by a small engine; preconditions and effects run inside
//! the gateway transaction, after-commit hooks fire notifications outside
//! it. Commands drive most transitions; the scanner only contributes the
//! "roll forward once the children are done" sensor triggers.

use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::domain::{
    Application, ApprovalStatus, Batch, BatchAction, BatchStatus, Build, Env, ReleaseApp,
    ReleaseStatus,
};
use crate::error::{CoreError, CoreResult};
use crate::infrastructure::notify::{NotificationSink, NotifyKind};
use crate::infrastructure::store::Store;

/// Where a transition request originated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// External command (API caller, operator)
    Outside,
    /// Scanner tick observing child state
    Inside,
}

/// Bitmask of sources a transition accepts
#[derive(Debug, Clone, Copy)]
pub struct Sources(u8);

impl Sources {
    pub const OUTSIDE: Sources = Sources(0b01);
    pub const INSIDE: Sources = Sources(0b10);

    pub fn allows(self, source: Source) -> bool {
        match source {
            Source::Outside => self.0 & 0b01 != 0,
            Source::Inside => self.0 & 0b10 != 0,
        }
    }
}

/// External actions plus the scanner's sensor triggers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Action(BatchAction),
    BeginPreWave,
    FinishPreWave,
    BeginProdWave,
    FinishProdWave,
}

impl Trigger {
    fn describe(self) -> &'static str {
        match self {
            Self::Action(action) => action.as_str(),
            Self::BeginPreWave => "begin_pre_wave",
            Self::FinishPreWave => "finish_pre_wave",
            Self::BeginProdWave => "begin_prod_wave",
            Self::FinishProdWave => "finish_prod_wave",
        }
    }
}

struct Transition {
    trigger: Trigger,
    from: &'static [BatchStatus],
    to: BatchStatus,
    sources: Sources,
}

static TRANSITIONS: &[Transition] = &[
    Transition {
        trigger: Trigger::Action(BatchAction::Seal),
        from: &[BatchStatus::Draft],
        to: BatchStatus::Sealed,
        sources: Sources::OUTSIDE,
    },
    Transition {
        trigger: Trigger::Action(BatchAction::Cancel),
        from: &[
            BatchStatus::Draft,
            BatchStatus::Sealed,
            BatchStatus::PreDeployed,
            BatchStatus::PreAccepted,
        ],
        to: BatchStatus::Cancelled,
        sources: Sources::OUTSIDE,
    },
    Transition {
        trigger: Trigger::Action(BatchAction::Approve),
        from: &[BatchStatus::Sealed],
        to: BatchStatus::Sealed,
        sources: Sources::OUTSIDE,
    },
    Transition {
        trigger: Trigger::Action(BatchAction::Reject),
        from: &[BatchStatus::Sealed],
        to: BatchStatus::Sealed,
        sources: Sources::OUTSIDE,
    },
    Transition {
        trigger: Trigger::Action(BatchAction::StartPreDeploy),
        from: &[BatchStatus::Sealed],
        to: BatchStatus::PreWaiting,
        sources: Sources::OUTSIDE,
    },
    Transition {
        trigger: Trigger::Action(BatchAction::AcceptPre),
        from: &[BatchStatus::PreDeployed],
        to: BatchStatus::PreAccepted,
        sources: Sources::OUTSIDE,
    },
    Transition {
        trigger: Trigger::Action(BatchAction::StartProdDeploy),
        from: &[BatchStatus::PreAccepted, BatchStatus::Sealed],
        to: BatchStatus::ProdWaiting,
        sources: Sources::OUTSIDE,
    },
    Transition {
        trigger: Trigger::Action(BatchAction::AcceptProd),
        from: &[BatchStatus::ProdDeployed],
        to: BatchStatus::ProdAccepted,
        sources: Sources::OUTSIDE,
    },
    Transition {
        trigger: Trigger::Action(BatchAction::Complete),
        from: &[BatchStatus::ProdAccepted],
        to: BatchStatus::Completed,
        sources: Sources::OUTSIDE,
    },
    Transition {
        trigger: Trigger::BeginPreWave,
        from: &[BatchStatus::PreWaiting],
        to: BatchStatus::PreDeploying,
        sources: Sources::INSIDE,
    },
    Transition {
        trigger: Trigger::FinishPreWave,
        from: &[BatchStatus::PreDeploying],
        to: BatchStatus::PreDeployed,
        sources: Sources::INSIDE,
    },
    Transition {
        trigger: Trigger::BeginProdWave,
        from: &[BatchStatus::ProdWaiting],
        to: BatchStatus::ProdDeploying,
        sources: Sources::INSIDE,
    },
    Transition {
        trigger: Trigger::FinishProdWave,
        from: &[BatchStatus::ProdDeploying],
        to: BatchStatus::ProdDeployed,
        sources: Sources::INSIDE,
    },
];

fn find_transition(trigger: Trigger, status: BatchStatus) -> Option<&'static Transition> {
    TRANSITIONS
        .iter()
        .find(|t| t.trigger == trigger && t.from.contains(&status))
}

/// Pre wave is done when every app that has a pre environment reached
/// PreDeployed (or already moved past the pre decade); a PreFailed app
/// blocks the batch until the operator intervenes.
pub fn pre_wave_done(apps: &[ReleaseApp]) -> bool {
    !apps.is_empty()
        && apps
            .iter()
            .filter(|a| !a.skip_pre_env)
            .all(|a| a.status != ReleaseStatus::PreFailed && a.status >= ReleaseStatus::PreDeployed)
}

/// Prod wave is done when every app reached ProdDeployed
pub fn prod_wave_done(apps: &[ReleaseApp]) -> bool {
    !apps.is_empty()
        && apps
            .iter()
            .all(|a| a.status != ReleaseStatus::ProdFailed && a.status >= ReleaseStatus::ProdDeployed)
}

/// Prefetched rows the seal effects need inside the transaction
struct SealContext {
    builds: HashMap<i64, Build>,
    apps: HashMap<i64, Application>,
    has_pre_env: HashMap<i64, bool>,
}

/// Interprets the transition table against the store
pub struct BatchMachine<S: Store> {
    store: Arc<S>,
    sink: Arc<dyn NotificationSink>,
}

impl<S: Store> BatchMachine<S> {
    pub fn new(store: Arc<S>, sink: Arc<dyn NotificationSink>) -> Self {
        Self { store, sink }
    }

    /// Sensor-driven processing on a worker tick
    pub async fn process(&self, batch: &Batch, apps: &[ReleaseApp]) -> CoreResult<Option<Batch>> {
        let trigger = match batch.status {
            BatchStatus::PreWaiting => Some(Trigger::BeginPreWave),
            BatchStatus::PreDeploying if pre_wave_done(apps) => Some(Trigger::FinishPreWave),
            BatchStatus::ProdWaiting => Some(Trigger::BeginProdWave),
            BatchStatus::ProdDeploying if prod_wave_done(apps) => Some(Trigger::FinishProdWave),
            _ => None,
        };
        let Some(trigger) = trigger else {
            return Ok(None);
        };
        match self
            .fire(batch.id, trigger, Source::Inside, "scanner", None)
            .await
        {
            Ok(updated) => Ok(Some(updated)),
            // Someone else won the transition, or the wave regressed between
            // our read and the transaction; the next tick settles it.
            Err(e) if e.is_conflict() => Ok(None),
            Err(CoreError::Precondition(_)) | Err(CoreError::InvalidTransition { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// External command entry point
    pub async fn apply(
        &self,
        batch_id: i64,
        action: BatchAction,
        operator: &str,
        reason: Option<&str>,
    ) -> CoreResult<Batch> {
        self.fire(
            batch_id,
            Trigger::Action(action),
            Source::Outside,
            operator,
            reason,
        )
        .await
    }

    async fn fire(
        &self,
        batch_id: i64,
        trigger: Trigger,
        source: Source,
        operator: &str,
        reason: Option<&str>,
    ) -> CoreResult<Batch> {
        let seal_context = match trigger {
            Trigger::Action(BatchAction::Seal) => Some(self.prefetch_seal(batch_id).await?),
            _ => None,
        };

        let old_status = self.store.batch(batch_id).await?.status;
        let operator_owned = operator.to_string();
        let reason_owned = reason.map(str::to_string);

        let (batch, apps) = self
            .store
            .update_batch_with_apps(batch_id, move |batch, apps| {
                let transition =
                    find_transition(trigger, batch.status).ok_or_else(|| {
                        CoreError::InvalidTransition {
                            entity: "batch",
                            id: batch.id,
                            action: trigger.describe().to_string(),
                            status: batch.status.name().to_string(),
                        }
                    })?;
                if !transition.sources.allows(source) {
                    return Err(CoreError::InvalidTransition {
                        entity: "batch",
                        id: batch.id,
                        action: trigger.describe().to_string(),
                        status: batch.status.name().to_string(),
                    });
                }

                let mut target = transition.to;
                match trigger {
                    Trigger::Action(BatchAction::Seal) => {
                        let context = seal_context
                            .as_ref()
                            .expect("seal context prefetched for seal");
                        effects_seal(batch, apps, context, &operator_owned)?;
                    }
                    Trigger::Action(BatchAction::Cancel) => {
                        batch.cancelled_by = Some(operator_owned.clone());
                        batch.cancelled_at = Some(Utc::now());
                        batch.cancel_reason = reason_owned.clone();
                    }
                    Trigger::Action(BatchAction::Approve) => {
                        batch.approval_status = ApprovalStatus::Approved;
                    }
                    Trigger::Action(BatchAction::Reject) => {
                        batch.approval_status = ApprovalStatus::Rejected;
                    }
                    Trigger::Action(BatchAction::StartPreDeploy) => {
                        target = effects_start_pre(batch, apps, &operator_owned)?;
                    }
                    Trigger::Action(BatchAction::AcceptPre) => {}
                    Trigger::Action(BatchAction::StartProdDeploy) => {
                        effects_start_prod(batch, apps, &operator_owned)?;
                    }
                    Trigger::Action(BatchAction::AcceptProd) => {
                        effects_accept_prod(apps)?;
                    }
                    Trigger::Action(BatchAction::Complete) => {
                        effects_complete(batch, apps, &operator_owned)?;
                    }
                    Trigger::BeginPreWave | Trigger::BeginProdWave => {}
                    Trigger::FinishPreWave => {
                        if !pre_wave_done(apps) {
                            return Err(CoreError::Precondition(
                                "pre wave is not finished".into(),
                            ));
                        }
                        batch.pre_finished_at = Some(Utc::now());
                    }
                    Trigger::FinishProdWave => {
                        if !prod_wave_done(apps) {
                            return Err(CoreError::Precondition(
                                "prod wave is not finished".into(),
                            ));
                        }
                        batch.prod_finished_at = Some(Utc::now());
                    }
                }
                batch.status = target;
                Ok(())
            })
            .await?;

        info!(
            "Batch {} transitioned {} -> {} ({})",
            batch.id,
            old_status,
            batch.status,
            trigger.describe()
        );
        self.after_commit(trigger, old_status, &batch, &apps, operator)
            .await;
        Ok(batch)
    }

    async fn prefetch_seal(&self, batch_id: i64) -> CoreResult<SealContext> {
        let releases = self.store.release_apps_of_batch(batch_id).await?;

        let mut builds = HashMap::new();
        for release in &releases {
            if let Some(build_id) = release.build_id {
                if !builds.contains_key(&build_id) {
                    builds.insert(build_id, self.store.build(build_id).await?);
                }
            }
        }

        let app_ids: Vec<i64> = releases.iter().map(|r| r.app_id).collect();
        let apps = self.store.applications(&app_ids).await?;

        let mut has_pre_env = HashMap::new();
        for app_id in app_ids {
            let configs = self.store.app_env_configs(app_id).await?;
            has_pre_env.insert(
                app_id,
                configs.iter().any(|c| c.env == Env::Pre && c.enabled),
            );
        }

        Ok(SealContext {
            builds,
            apps,
            has_pre_env,
        })
    }

    /// Post-commit hooks: notifications and the deployed-tag roll-forward.
    /// Nothing here may influence the committed transition.
    async fn after_commit(
        &self,
        trigger: Trigger,
        from: BatchStatus,
        batch: &Batch,
        apps: &[ReleaseApp],
        operator: &str,
    ) {
        self.sink
            .send(
                NotifyKind::StateTransition,
                json!({
                    "batch_id": batch.id,
                    "batch_number": batch.batch_number,
                    "from": from.name(),
                    "to": batch.status.name(),
                    "trigger": trigger.describe(),
                    "operator": operator,
                }),
            )
            .await;

        match trigger {
            Trigger::Action(BatchAction::StartPreDeploy) => {
                self.sink
                    .send(
                        NotifyKind::BatchStart,
                        json!({
                            "batch_id": batch.id,
                            "batch_number": batch.batch_number,
                            "operator": operator,
                        }),
                    )
                    .await;
            }
            Trigger::Action(BatchAction::Complete) => {
                self.sink
                    .send(
                        NotifyKind::BatchComplete,
                        json!({
                            "batch_id": batch.id,
                            "batch_number": batch.batch_number,
                            "operator": operator,
                        }),
                    )
                    .await;
            }
            Trigger::Action(BatchAction::AcceptProd) => {
                // The accepted versions are live now; move the catalog's
                // deployed tags forward. Not transactional with the batch
                // row: a failure here is logged and repaired manually.
                for app in apps {
                    if app.status != ReleaseStatus::ProdAccepted {
                        continue;
                    }
                    let Some(tag) = &app.target_tag else { continue };
                    if let Err(e) = self.store.set_deployed_tag(app.app_id, tag).await {
                        warn!(
                            "Failed to roll deployed tag of application {} forward: {e}",
                            app.app_id
                        );
                    }
                }
            }
            _ => {}
        }
    }
}

fn effects_seal(
    batch: &mut Batch,
    apps: &mut [ReleaseApp],
    context: &SealContext,
    operator: &str,
) -> CoreResult<()> {
    if apps.is_empty() {
        return Err(CoreError::Precondition("batch has no apps".into()));
    }
    for app in apps.iter_mut() {
        let Some(build_id) = app.build_id else {
            return Err(CoreError::Precondition(format!(
                "application {} has no build selected",
                app.app_id
            )));
        };
        let build = context.builds.get(&build_id).ok_or_else(|| {
            CoreError::Precondition(format!("build {build_id} does not exist"))
        })?;
        app.previous_deployed_tag = context
            .apps
            .get(&app.app_id)
            .and_then(|a| a.deployed_tag.clone());
        app.target_tag = Some(build.image_tag.clone());
        app.is_locked = true;
        app.skip_pre_env = !context.has_pre_env.get(&app.app_id).copied().unwrap_or(false);
        app.status = ReleaseStatus::Tagged;
    }
    batch.sealed_by = Some(operator.to_string());
    batch.sealed_at = Some(Utc::now());
    Ok(())
}

fn effects_start_pre(
    batch: &mut Batch,
    apps: &mut [ReleaseApp],
    operator: &str,
) -> CoreResult<BatchStatus> {
    if !batch.approval_status.allows_rollout() {
        return Err(CoreError::Precondition(format!(
            "batch approval is {}",
            batch.approval_status
        )));
    }
    if batch.sealed_at.is_none() {
        return Err(CoreError::Precondition("batch was never sealed".into()));
    }

    let now = Utc::now();
    if apps.iter().any(|a| !a.skip_pre_env) {
        for app in apps.iter_mut() {
            if !app.skip_pre_env && app.status < ReleaseStatus::PreWaiting {
                app.status = ReleaseStatus::PreWaiting;
            }
        }
        batch.pre_triggered_by = Some(operator.to_string());
        batch.pre_started_at = Some(now);
        Ok(BatchStatus::PreWaiting)
    } else {
        // No app has a pre environment: skip the pre decade entirely.
        for app in apps.iter_mut() {
            if app.skip_pre_env && app.status == ReleaseStatus::Tagged {
                app.status = ReleaseStatus::ProdWaiting;
            }
        }
        batch.prod_triggered_by = Some(operator.to_string());
        batch.prod_started_at = Some(now);
        Ok(BatchStatus::ProdWaiting)
    }
}

fn effects_start_prod(
    batch: &mut Batch,
    apps: &mut [ReleaseApp],
    operator: &str,
) -> CoreResult<()> {
    match batch.status {
        BatchStatus::Sealed => {
            if !batch.approval_status.allows_rollout() {
                return Err(CoreError::Precondition(format!(
                    "batch approval is {}",
                    batch.approval_status
                )));
            }
            if apps.iter().any(|a| !a.skip_pre_env) {
                return Err(CoreError::Precondition(
                    "apps with a pre environment must go through the pre wave".into(),
                ));
            }
        }
        BatchStatus::PreAccepted => {
            let blocking = apps
                .iter()
                .filter(|a| !a.skip_pre_env && a.status != ReleaseStatus::PreDeployed)
                .count();
            if blocking > 0 {
                return Err(CoreError::Precondition(format!(
                    "{blocking} apps have not finished the pre wave"
                )));
            }
        }
        // The transition table only admits the two statuses above.
        _ => {}
    }

    for app in apps.iter_mut() {
        if app.skip_pre_env && app.status == ReleaseStatus::Tagged {
            app.status = ReleaseStatus::ProdWaiting;
        } else if !app.skip_pre_env && app.status == ReleaseStatus::PreDeployed {
            app.status = ReleaseStatus::ProdWaiting;
        }
    }
    batch.prod_triggered_by = Some(operator.to_string());
    batch.prod_started_at = Some(Utc::now());
    Ok(())
}

fn effects_accept_prod(apps: &mut [ReleaseApp]) -> CoreResult<()> {
    if let Some(bad) = apps.iter().find(|a| a.status != ReleaseStatus::ProdDeployed) {
        return Err(CoreError::Precondition(format!(
            "application {} is {} (all apps must be prod_deployed)",
            bad.app_id, bad.status
        )));
    }
    for app in apps.iter_mut() {
        app.status = ReleaseStatus::ProdAccepted;
    }
    Ok(())
}

fn effects_complete(
    batch: &mut Batch,
    apps: &mut [ReleaseApp],
    operator: &str,
) -> CoreResult<()> {
    if let Some(bad) = apps.iter().find(|a| a.status != ReleaseStatus::ProdAccepted) {
        return Err(CoreError::Precondition(format!(
            "application {} is {} (all apps must be prod_accepted)",
            bad.app_id, bad.status
        )));
    }
    batch.final_accepted_by = Some(operator.to_string());
    batch.final_accepted_at = Some(Utc::now());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn release(status: ReleaseStatus, skip_pre_env: bool) -> ReleaseApp {
        let now = Utc::now();
        ReleaseApp {
            id: 1,
            batch_id: 1,
            app_id: 1,
            build_id: Some(1),
            latest_build_id: Some(1),
            previous_deployed_tag: None,
            target_tag: Some("v1".into()),
            is_locked: true,
            skip_pre_env,
            status,
            reason: String::new(),
            temp_depends_on: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn table_gates_by_status() {
        assert!(find_transition(Trigger::Action(BatchAction::Seal), BatchStatus::Draft).is_some());
        assert!(find_transition(Trigger::Action(BatchAction::Seal), BatchStatus::Sealed).is_none());
        assert!(
            find_transition(Trigger::Action(BatchAction::Cancel), BatchStatus::PreAccepted)
                .is_some()
        );
        assert!(
            find_transition(Trigger::Action(BatchAction::Cancel), BatchStatus::ProdDeployed)
                .is_none()
        );
        assert!(find_transition(Trigger::BeginPreWave, BatchStatus::PreWaiting).is_some());
    }

    #[test]
    fn sensor_transitions_reject_outside_callers() {
        let transition = find_transition(Trigger::FinishPreWave, BatchStatus::PreDeploying).unwrap();
        assert!(transition.sources.allows(Source::Inside));
        assert!(!transition.sources.allows(Source::Outside));

        let seal = find_transition(Trigger::Action(BatchAction::Seal), BatchStatus::Draft).unwrap();
        assert!(seal.sources.allows(Source::Outside));
        assert!(!seal.sources.allows(Source::Inside));
    }

    #[test]
    fn pre_wave_blocks_on_failure() {
        let apps = vec![
            release(ReleaseStatus::PreDeployed, false),
            release(ReleaseStatus::PreFailed, false),
        ];
        assert!(!pre_wave_done(&apps));

        let apps = vec![
            release(ReleaseStatus::PreDeployed, false),
            release(ReleaseStatus::PreDeployed, false),
        ];
        assert!(pre_wave_done(&apps));
    }

    #[test]
    fn pre_wave_ignores_skip_pre_apps() {
        let apps = vec![
            release(ReleaseStatus::PreDeployed, false),
            release(ReleaseStatus::Tagged, true),
        ];
        assert!(pre_wave_done(&apps));
        // ...but an empty batch is never done.
        assert!(!pre_wave_done(&[]));
    }

    #[test]
    fn prod_wave_counts_every_app() {
        let apps = vec![
            release(ReleaseStatus::ProdDeployed, false),
            release(ReleaseStatus::ProdTriggered, true),
        ];
        assert!(!prod_wave_done(&apps));

        let apps = vec![
            release(ReleaseStatus::ProdDeployed, false),
            release(ReleaseStatus::ProdAccepted, true),
        ];
        assert!(prod_wave_done(&apps));
    }
}
