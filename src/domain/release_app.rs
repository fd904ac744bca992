//! Per-application release state inside a batch

use chrono::{DateTime, Utc};

use super::status::ReleaseStatus;

/// One row per application participating in a batch
///
/// `target_tag` is the version this app is committed to shipping once the
/// batch is sealed; `previous_deployed_tag` keeps the pre-sealing baseline
/// for rollback display. `latest_build_id` tracks new builds arriving after
/// the operator pinned `build_id`.
#[derive(Debug, Clone)]
pub struct ReleaseApp {
    pub id: i64,
    pub batch_id: i64,
    pub app_id: i64,
    pub build_id: Option<i64>,
    pub latest_build_id: Option<i64>,
    pub previous_deployed_tag: Option<String>,
    pub target_tag: Option<String>,
    pub is_locked: bool,
    /// Frozen at seal: true iff the app has no enabled pre environment
    pub skip_pre_env: bool,
    pub status: ReleaseStatus,
    /// Operator-facing explanation of why the app is waiting or failed
    pub reason: String,
    /// Batch-scoped dependency override, unioned with the app's defaults
    pub temp_depends_on: Vec<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for enrolling an application into a Draft batch
#[derive(Debug, Clone)]
pub struct NewReleaseApp {
    pub batch_id: i64,
    pub app_id: i64,
    pub build_id: Option<i64>,
    pub temp_depends_on: Vec<i64>,
}

/// Manual transitions a caller can fire at a release app
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualAction {
    TriggerPre,
    TriggerProd,
}

impl ManualAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TriggerPre => "manual_trigger_pre",
            Self::TriggerProd => "manual_trigger_prod",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual_trigger_pre" => Some(Self::TriggerPre),
            "manual_trigger_prod" => Some(Self::TriggerProd),
            _ => None,
        }
    }
}

impl std::fmt::Display for ManualAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
