//! Release batch domain types
//!
//! A batch is the reviewable unit of rollout: a numbered bundle of
//! application versions that moves through the pre and prod waves together.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::status::{ApprovalStatus, BatchStatus};

/// The top-level release unit
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: i64,
    /// Per-project monotonic release number
    pub batch_number: i64,
    pub project_id: i64,
    /// Operator who created the batch
    pub initiator: String,
    pub approval_status: ApprovalStatus,
    pub status: BatchStatus,
    pub sealed_by: Option<String>,
    pub sealed_at: Option<DateTime<Utc>>,
    pub pre_triggered_by: Option<String>,
    pub pre_started_at: Option<DateTime<Utc>>,
    pub pre_finished_at: Option<DateTime<Utc>>,
    pub prod_triggered_by: Option<String>,
    pub prod_started_at: Option<DateTime<Utc>>,
    pub prod_finished_at: Option<DateTime<Utc>>,
    pub final_accepted_by: Option<String>,
    pub final_accepted_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating a batch in Draft (done by the external API layer)
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub project_id: i64,
    pub initiator: String,
}

/// External actions a caller can fire at a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchAction {
    Seal,
    Cancel,
    Approve,
    Reject,
    StartPreDeploy,
    AcceptPre,
    StartProdDeploy,
    AcceptProd,
    Complete,
}

impl BatchAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Seal => "seal",
            Self::Cancel => "cancel",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::StartPreDeploy => "start_pre_deploy",
            Self::AcceptPre => "accept_pre",
            Self::StartProdDeploy => "start_prod_deploy",
            Self::AcceptProd => "accept_prod",
            Self::Complete => "complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "seal" => Some(Self::Seal),
            "cancel" => Some(Self::Cancel),
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            "start_pre_deploy" => Some(Self::StartPreDeploy),
            "accept_pre" => Some(Self::AcceptPre),
            "start_prod_deploy" => Some(Self::StartProdDeploy),
            "accept_prod" => Some(Self::AcceptProd),
            "complete" => Some(Self::Complete),
            _ => None,
        }
    }
}

impl std::fmt::Display for BatchAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only snapshot returned to status queries
#[derive(Debug, Clone, Serialize)]
pub struct BatchSnapshot {
    pub batch_id: i64,
    pub batch_number: i64,
    pub status: i32,
    pub status_name: &'static str,
    pub approval_status: &'static str,
}

impl From<&Batch> for BatchSnapshot {
    fn from(batch: &Batch) -> Self {
        Self {
            batch_id: batch.id,
            batch_number: batch.batch_number,
            status: batch.status.code(),
            status_name: batch.status.name(),
            approval_status: batch.approval_status.as_str(),
        }
    }
}
