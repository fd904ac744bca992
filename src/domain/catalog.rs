//! Catalog entities owned by the external CRUD layer
//!
//! The orchestrator only reads these: which apps exist, which builds they
//! have, which (env, cluster) targets they deploy to, and the per-project
//! artifacts spec that drivers consume.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::Env;

/// Project row; the name feeds the template context
#[derive(Debug, Clone)]
pub struct Project {
    pub id: i64,
    pub name: String,
}

/// Deployable application
#[derive(Debug, Clone)]
pub struct Application {
    pub id: i64,
    pub name: String,
    pub app_type: String,
    pub project_id: i64,
    pub repo_id: i64,
    /// Configuration-level release dependencies (application ids)
    pub default_depends_on: Vec<i64>,
    /// Tag currently live in production, rolled forward on accept_prod
    pub deployed_tag: Option<String>,
}

/// Source repository behind an application
#[derive(Debug, Clone)]
pub struct Repository {
    pub id: i64,
    pub namespace: String,
    pub name: String,
    pub app_count: i32,
}

impl Repository {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// CI build outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Pending,
    Success,
    Failure,
}

impl BuildStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            _ => None,
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One image produced by CI for an application
#[derive(Debug, Clone)]
pub struct Build {
    pub id: i64,
    pub app_id: i64,
    pub image_tag: String,
    pub image_url: Option<String>,
    pub build_status: BuildStatus,
    pub created_at: DateTime<Utc>,
}

/// Build notification payload pushed by the CI intake
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingBuild {
    pub image_tag: String,
    pub image_url: Option<String>,
    pub build_status: String,
}

/// Target cluster; kubeconfig is stored base64-encoded
#[derive(Debug, Clone)]
pub struct Cluster {
    pub name: String,
    pub kubeconfig: Option<String>,
}

/// Existence of an enabled row means "deploy this app to this (env, cluster)"
#[derive(Debug, Clone)]
pub struct AppEnvConfig {
    pub app_id: i64,
    pub env: Env,
    pub cluster: String,
    pub enabled: bool,
}

/// Per-(project, env) rollout configuration
#[derive(Debug, Clone)]
pub struct ProjectEnvConfig {
    pub project_id: i64,
    pub env: Env,
    pub allowed_clusters: Vec<String>,
    pub artifacts: ArtifactsSpec,
}

/// Per-stage chart specification consumed by drivers
///
/// Opaque to the state machines except for `namespace_template`,
/// `release_name_template` and each stage's `driver` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactsSpec {
    /// Rendered by the core over the whitelisted template context
    pub namespace_template: String,
    /// Workload name template; defaults to "{app_name}" when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name_template: Option<String>,
    /// Optional pre-stage spec (e.g. a config chart installed before the app)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre: Option<StageSpec>,
    pub main: StageSpec,
}

impl ArtifactsSpec {
    /// Stage spec for the given driver stage, if configured and enabled
    pub fn stage(&self, stage: DriverStage) -> Option<&StageSpec> {
        match stage {
            DriverStage::Pre => self.pre.as_ref().filter(|s| s.enabled),
            DriverStage::Main => Some(&self.main),
        }
    }
}

/// One chart to install at a given stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Driver registry key, e.g. "helm"
    pub driver: String,
    pub chart: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_version: Option<String>,
    /// Base values layer; drivers overlay the deployment's values on top
    #[serde(default)]
    pub values: serde_json::Value,
}

fn default_enabled() -> bool {
    true
}

/// Which of the two per-deployment driver invocations is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStage {
    Pre,
    Main,
}

impl DriverStage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pre => "pre",
            Self::Main => "main",
        }
    }
}

impl std::fmt::Display for DriverStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn artifacts_spec_deserializes_minimal_yaml() {
        let spec: ArtifactsSpec = serde_yaml::from_str(
            r#"
namespace_template: "{project}-{env}"
main:
  driver: helm
  chart: oci://charts.example.com/app
"#,
        )
        .unwrap();
        assert!(spec.pre.is_none());
        assert!(spec.main.enabled);
        assert_eq!(spec.main.driver, "helm");
        assert!(spec.stage(DriverStage::Pre).is_none());
        assert_eq!(spec.stage(DriverStage::Main).unwrap().chart, spec.main.chart);
    }

    #[test]
    fn disabled_pre_stage_is_skipped() {
        let spec = ArtifactsSpec {
            namespace_template: "{project}-{env}".into(),
            release_name_template: None,
            pre: Some(StageSpec {
                enabled: false,
                driver: "helm".into(),
                chart: "config".into(),
                chart_version: None,
                values: json!({}),
            }),
            main: StageSpec {
                enabled: true,
                driver: "helm".into(),
                chart: "app".into(),
                chart_version: None,
                values: json!({}),
            },
        };
        assert!(spec.stage(DriverStage::Pre).is_none());
    }
}
