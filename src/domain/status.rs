//! Status codepoints for batches, release apps and deployments
//!
//! Batch and ReleaseApp statuses are persisted as integers whose tens digit
//! encodes the pipeline phase (0 draft, 1 sealed/tagged, 2 pre, 3 prod,
//! 4 done, 9 cancelled). Range queries lean on that grouping, so comparisons
//! go through `decade()` instead of hard-coded numbers.

use std::fmt;

/// Lifecycle stage of a release batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BatchStatus {
    Draft,
    Sealed,
    PreWaiting,
    PreDeploying,
    PreDeployed,
    PreAccepted,
    ProdWaiting,
    ProdDeploying,
    ProdDeployed,
    ProdAccepted,
    Completed,
    Cancelled,
}

impl BatchStatus {
    /// Stable integer codepoint persisted in the status column
    pub const fn code(self) -> i32 {
        match self {
            Self::Draft => 0,
            Self::Sealed => 10,
            Self::PreWaiting => 20,
            Self::PreDeploying => 21,
            Self::PreDeployed => 22,
            Self::PreAccepted => 23,
            Self::ProdWaiting => 30,
            Self::ProdDeploying => 31,
            Self::ProdDeployed => 32,
            Self::ProdAccepted => 33,
            Self::Completed => 40,
            Self::Cancelled => 90,
        }
    }

    /// Decode a persisted codepoint
    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Self::Draft,
            10 => Self::Sealed,
            20 => Self::PreWaiting,
            21 => Self::PreDeploying,
            22 => Self::PreDeployed,
            23 => Self::PreAccepted,
            30 => Self::ProdWaiting,
            31 => Self::ProdDeploying,
            32 => Self::ProdDeployed,
            33 => Self::ProdAccepted,
            40 => Self::Completed,
            90 => Self::Cancelled,
            _ => return None,
        })
    }

    /// Tens digit of the codepoint, identifying the phase
    pub const fn decade(self) -> i32 {
        self.code() / 10
    }

    /// Human-readable name for status snapshots and logs
    pub const fn name(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Sealed => "sealed",
            Self::PreWaiting => "pre_waiting",
            Self::PreDeploying => "pre_deploying",
            Self::PreDeployed => "pre_deployed",
            Self::PreAccepted => "pre_accepted",
            Self::ProdWaiting => "prod_waiting",
            Self::ProdDeploying => "prod_deploying",
            Self::ProdDeployed => "prod_deployed",
            Self::ProdAccepted => "prod_accepted",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses retire the batch worker
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle stage of a single application inside a batch
///
/// `ProdAccepted` (decade 4, mirroring `BatchStatus::Completed`) is the
/// terminal state a release app reaches when its batch's production wave is
/// accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReleaseStatus {
    Pending,
    Tagged,
    PreWaiting,
    PreCanTrigger,
    PreTriggered,
    PreDeployed,
    PreFailed,
    ProdWaiting,
    ProdCanTrigger,
    ProdTriggered,
    ProdDeployed,
    ProdFailed,
    ProdAccepted,
}

impl ReleaseStatus {
    /// Stable integer codepoint persisted in the status column
    pub const fn code(self) -> i32 {
        match self {
            Self::Pending => 0,
            Self::Tagged => 10,
            Self::PreWaiting => 20,
            Self::PreCanTrigger => 21,
            Self::PreTriggered => 22,
            Self::PreDeployed => 23,
            Self::PreFailed => 24,
            Self::ProdWaiting => 30,
            Self::ProdCanTrigger => 31,
            Self::ProdTriggered => 32,
            Self::ProdDeployed => 33,
            Self::ProdFailed => 34,
            Self::ProdAccepted => 40,
        }
    }

    /// Decode a persisted codepoint
    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Self::Pending,
            10 => Self::Tagged,
            20 => Self::PreWaiting,
            21 => Self::PreCanTrigger,
            22 => Self::PreTriggered,
            23 => Self::PreDeployed,
            24 => Self::PreFailed,
            30 => Self::ProdWaiting,
            31 => Self::ProdCanTrigger,
            32 => Self::ProdTriggered,
            33 => Self::ProdDeployed,
            34 => Self::ProdFailed,
            40 => Self::ProdAccepted,
            _ => return None,
        })
    }

    /// Tens digit of the codepoint, identifying the phase
    pub const fn decade(self) -> i32 {
        self.code() / 10
    }

    /// Human-readable name for snapshots and logs
    pub const fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Tagged => "tagged",
            Self::PreWaiting => "pre_waiting",
            Self::PreCanTrigger => "pre_can_trigger",
            Self::PreTriggered => "pre_triggered",
            Self::PreDeployed => "pre_deployed",
            Self::PreFailed => "pre_failed",
            Self::ProdWaiting => "prod_waiting",
            Self::ProdCanTrigger => "prod_can_trigger",
            Self::ProdTriggered => "prod_triggered",
            Self::ProdDeployed => "prod_deployed",
            Self::ProdFailed => "prod_failed",
            Self::ProdAccepted => "prod_accepted",
        }
    }

    /// Whether this app has failed its current stage
    pub const fn is_failed(self) -> bool {
        matches!(self, Self::PreFailed | Self::ProdFailed)
    }
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Target environment of a deployment wave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Env {
    Pre,
    Prod,
}

impl Env {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pre => "pre",
            Self::Prod => "prod",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pre" => Some(Self::Pre),
            "prod" => Some(Self::Prod),
            _ => None,
        }
    }
}

impl fmt::Display for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution state of a single (release, env, cluster) deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeployState {
    Pending,
    Running,
    Success,
    Failed,
}

impl DeployState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for DeployState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Review verdict on a sealed batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Skipped,
}

impl ApprovalStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Approval gate for leaving Sealed towards the pre wave
    pub const fn allows_rollout(self) -> bool {
        matches!(self, Self::Approved | Self::Skipped)
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_codes_round_trip() {
        for status in [
            BatchStatus::Draft,
            BatchStatus::Sealed,
            BatchStatus::PreWaiting,
            BatchStatus::PreDeploying,
            BatchStatus::PreDeployed,
            BatchStatus::PreAccepted,
            BatchStatus::ProdWaiting,
            BatchStatus::ProdDeploying,
            BatchStatus::ProdDeployed,
            BatchStatus::ProdAccepted,
            BatchStatus::Completed,
            BatchStatus::Cancelled,
        ] {
            assert_eq!(BatchStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(BatchStatus::from_code(11), None);
    }

    #[test]
    fn release_codes_round_trip() {
        for code in [0, 10, 20, 21, 22, 23, 24, 30, 31, 32, 33, 34, 40] {
            let status = ReleaseStatus::from_code(code).unwrap();
            assert_eq!(status.code(), code);
        }
        assert_eq!(ReleaseStatus::from_code(25), None);
    }

    #[test]
    fn decades_group_phases() {
        assert_eq!(BatchStatus::PreDeploying.decade(), 2);
        assert_eq!(BatchStatus::ProdWaiting.decade(), 3);
        assert_eq!(ReleaseStatus::PreFailed.decade(), 2);
        assert_eq!(ReleaseStatus::ProdDeployed.decade(), 3);
        assert_eq!(ReleaseStatus::ProdAccepted.decade(), 4);
        // Ord follows the codepoints, so decade comparisons work directly.
        assert!(ReleaseStatus::PreDeployed < ReleaseStatus::ProdWaiting);
        assert!(BatchStatus::Completed < BatchStatus::Cancelled);
    }

    #[test]
    fn approval_gate() {
        assert!(ApprovalStatus::Approved.allows_rollout());
        assert!(ApprovalStatus::Skipped.allows_rollout());
        assert!(!ApprovalStatus::Pending.allows_rollout());
        assert!(!ApprovalStatus::Rejected.allows_rollout());
    }
}
