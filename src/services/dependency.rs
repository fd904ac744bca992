//! Release dependency resolver
//!
//! Decides whether an app may start its pre or prod wave given the other
//! apps in the same batch. Pure reads over in-memory snapshots; the caller
//! fetches the peers and applications once per tick.

use std::collections::{BTreeSet, HashMap};

use crate::domain::{Application, Env, ReleaseApp, ReleaseStatus};

/// Outcome of a dependency check at one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyReport {
    pub ready: bool,
    /// Names of in-batch dependencies that have not reached the stage yet
    pub pending: Vec<String>,
    /// Names of in-batch dependencies that failed the stage
    pub failed: Vec<String>,
}

impl DependencyReport {
    /// Operator-facing reason while the app is waiting
    pub fn pending_reason(&self) -> String {
        format!("waiting on: {}", self.pending.join(", "))
    }

    /// Operator-facing reason when a dependency failed
    pub fn failure_reason(&self) -> String {
        format!("dependency failed: {}", self.failed.join(", "))
    }
}

/// Resolve the dependency state of `subject` at `stage`
///
/// The dependency set is the union of the application's configured
/// dependencies, the batch-scoped override on the release app, and the
/// implicit app-type rules (`subject type -> types it waits for`).
/// Self-references and zero ids are dropped; dependencies without a release
/// app in the batch are silently satisfied, since this batch will not deploy
/// them.
pub fn resolve(
    subject: &ReleaseApp,
    stage: Env,
    peers: &[ReleaseApp],
    apps: &HashMap<i64, Application>,
    type_rules: &HashMap<String, Vec<String>>,
) -> DependencyReport {
    let mut dep_ids: BTreeSet<i64> = BTreeSet::new();

    if let Some(app) = apps.get(&subject.app_id) {
        dep_ids.extend(app.default_depends_on.iter().copied());

        if let Some(dep_types) = type_rules.get(&app.app_type) {
            for peer in peers {
                if peer.id == subject.id {
                    continue;
                }
                if let Some(peer_app) = apps.get(&peer.app_id) {
                    if dep_types.contains(&peer_app.app_type) {
                        dep_ids.insert(peer_app.id);
                    }
                }
            }
        }
    }
    dep_ids.extend(subject.temp_depends_on.iter().copied());
    dep_ids.remove(&0);
    dep_ids.remove(&subject.app_id);

    let mut pending = Vec::new();
    let mut failed = Vec::new();

    for dep_id in dep_ids {
        let Some(peer) = peers.iter().find(|p| p.app_id == dep_id) else {
            // Not part of this batch: nothing to wait for.
            continue;
        };
        let label = apps
            .get(&dep_id)
            .map(|a| a.name.clone())
            .unwrap_or_else(|| format!("app {dep_id}"));

        match stage {
            Env::Pre => {
                if peer.status == ReleaseStatus::PreFailed {
                    failed.push(label);
                } else if peer.status >= ReleaseStatus::PreDeployed {
                    // done with pre (or past it)
                } else {
                    pending.push(label);
                }
            }
            Env::Prod => {
                if peer.status == ReleaseStatus::ProdFailed {
                    failed.push(label);
                } else if peer.status >= ReleaseStatus::ProdDeployed {
                    // done with prod
                } else {
                    pending.push(label);
                }
            }
        }
    }

    DependencyReport {
        ready: pending.is_empty() && failed.is_empty(),
        pending,
        failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn app(id: i64, name: &str, app_type: &str, depends_on: Vec<i64>) -> Application {
        Application {
            id,
            name: name.into(),
            app_type: app_type.into(),
            project_id: 1,
            repo_id: 1,
            default_depends_on: depends_on,
            deployed_tag: None,
        }
    }

    fn release(id: i64, app_id: i64, status: ReleaseStatus) -> ReleaseApp {
        let now = Utc::now();
        ReleaseApp {
            id,
            batch_id: 1,
            app_id,
            build_id: Some(1),
            latest_build_id: Some(1),
            previous_deployed_tag: None,
            target_tag: Some("v1".into()),
            is_locked: true,
            skip_pre_env: false,
            status,
            reason: String::new(),
            temp_depends_on: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn app_map(apps: Vec<Application>) -> HashMap<i64, Application> {
        apps.into_iter().map(|a| (a.id, a)).collect()
    }

    #[test]
    fn waits_for_configured_dependency() {
        let apps = app_map(vec![app(10, "frontend", "web", vec![20]), app(20, "backend", "api", vec![])]);
        let subject = release(1, 10, ReleaseStatus::PreWaiting);
        let peers = vec![subject.clone(), release(2, 20, ReleaseStatus::PreTriggered)];

        let report = resolve(&subject, Env::Pre, &peers, &apps, &HashMap::new());
        assert!(!report.ready);
        assert_eq!(report.pending, vec!["backend".to_string()]);
        assert!(report.failed.is_empty());
    }

    #[test]
    fn ready_once_dependency_deployed() {
        let apps = app_map(vec![app(10, "frontend", "web", vec![20]), app(20, "backend", "api", vec![])]);
        let subject = release(1, 10, ReleaseStatus::PreWaiting);
        let peers = vec![subject.clone(), release(2, 20, ReleaseStatus::PreDeployed)];

        let report = resolve(&subject, Env::Pre, &peers, &apps, &HashMap::new());
        assert!(report.ready);
    }

    #[test]
    fn failed_dependency_is_reported() {
        let apps = app_map(vec![app(10, "frontend", "web", vec![20]), app(20, "backend", "api", vec![])]);
        let subject = release(1, 10, ReleaseStatus::PreWaiting);
        let peers = vec![subject.clone(), release(2, 20, ReleaseStatus::PreFailed)];

        let report = resolve(&subject, Env::Pre, &peers, &apps, &HashMap::new());
        assert!(!report.ready);
        assert_eq!(report.failed, vec!["backend".to_string()]);
        assert_eq!(report.failure_reason(), "dependency failed: backend");
    }

    #[test]
    fn dependency_outside_batch_is_satisfied() {
        // app 20 is configured as a dependency but has no release in the batch
        let apps = app_map(vec![app(10, "frontend", "web", vec![20])]);
        let subject = release(1, 10, ReleaseStatus::PreWaiting);
        let peers = vec![subject.clone()];

        let report = resolve(&subject, Env::Pre, &peers, &apps, &HashMap::new());
        assert!(report.ready);
    }

    #[test]
    fn self_reference_and_zero_ids_are_dropped() {
        let apps = app_map(vec![app(10, "frontend", "web", vec![10, 0])]);
        let mut subject = release(1, 10, ReleaseStatus::PreWaiting);
        subject.temp_depends_on = vec![0, 10];
        let peers = vec![subject.clone()];

        let report = resolve(&subject, Env::Pre, &peers, &apps, &HashMap::new());
        assert!(report.ready);
    }

    #[test]
    fn app_type_rules_add_implicit_dependencies() {
        let apps = app_map(vec![
            app(10, "frontend", "web", vec![]),
            app(20, "backend", "api", vec![]),
        ]);
        let rules = HashMap::from([("web".to_string(), vec!["api".to_string()])]);
        let subject = release(1, 10, ReleaseStatus::PreWaiting);
        let peers = vec![subject.clone(), release(2, 20, ReleaseStatus::PreWaiting)];

        let report = resolve(&subject, Env::Pre, &peers, &apps, &rules);
        assert!(!report.ready);
        assert_eq!(report.pending, vec!["backend".to_string()]);
    }

    #[test]
    fn prod_stage_uses_prod_thresholds() {
        let apps = app_map(vec![app(10, "frontend", "web", vec![20]), app(20, "backend", "api", vec![])]);
        let subject = release(1, 10, ReleaseStatus::ProdWaiting);

        // PreDeployed is not enough at the prod stage.
        let peers = vec![subject.clone(), release(2, 20, ReleaseStatus::PreDeployed)];
        let report = resolve(&subject, Env::Prod, &peers, &apps, &HashMap::new());
        assert!(!report.ready);

        let peers = vec![subject.clone(), release(2, 20, ReleaseStatus::ProdDeployed)];
        let report = resolve(&subject, Env::Prod, &peers, &apps, &HashMap::new());
        assert!(report.ready);
    }

    #[test]
    fn peer_past_pre_counts_as_pre_ready() {
        // A skip-pre peer already in the prod decade has trivially passed pre.
        let apps = app_map(vec![app(10, "frontend", "web", vec![20]), app(20, "backend", "api", vec![])]);
        let subject = release(1, 10, ReleaseStatus::PreWaiting);
        let peers = vec![subject.clone(), release(2, 20, ReleaseStatus::ProdWaiting)];

        let report = resolve(&subject, Env::Pre, &peers, &apps, &HashMap::new());
        assert!(report.ready);
    }
}
