//! Stage status, run status and criticality enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How much a stage's output matters, used for backend tier selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    /// Cheap bookkeeping work (summaries, extraction).
    Low,
    /// Regular generation work.
    Normal,
    /// Work that must never be downshifted.
    Critical,
}

impl Default for Criticality {
    fn default() -> Self {
        Self::Normal
    }
}

impl fmt::Display for Criticality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// A backend tier, ordered from cheapest to most capable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendTier {
    /// Cheap, fast models.
    Economy,
    /// Default quality.
    Standard,
    /// Highest quality, highest cost.
    Premium,
}

impl BackendTier {
    /// All tiers, cheapest first.
    pub const ALL: [Self; 3] = [Self::Economy, Self::Standard, Self::Premium];

    /// The tier a criticality maps to before any downshift.
    #[must_use]
    pub fn for_criticality(criticality: Criticality) -> Self {
        match criticality {
            Criticality::Low => Self::Economy,
            Criticality::Normal => Self::Standard,
            Criticality::Critical => Self::Premium,
        }
    }
}

impl fmt::Display for BackendTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Economy => write!(f, "economy"),
            Self::Standard => write!(f, "standard"),
            Self::Premium => write!(f, "premium"),
        }
    }
}

/// The execution status of a stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Waiting for dependencies or a worker.
    Pending,
    /// Currently executing.
    Running,
    /// Output accepted and checkpointed.
    Completed,
    /// A blocking gate failed; a repair is being planned.
    GatedFailed,
    /// Scheduled for re-execution by a repair plan.
    Repairing,
    /// Failed with no way forward without a config change.
    FatalFailed,
    /// An upstream stage failed fatally.
    Blocked,
}

impl Default for StageStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::GatedFailed => write!(f, "gated_failed"),
            Self::Repairing => write!(f, "repairing"),
            Self::FatalFailed => write!(f, "fatal_failed"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

impl StageStatus {
    /// Returns true if the stage will not run again without intervention.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::FatalFailed | Self::Blocked)
    }

    /// Returns true if the stage is waiting to be scheduled.
    #[must_use]
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Self::Pending | Self::Repairing)
    }

    /// Returns true if the status indicates failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::FatalFailed | Self::Blocked)
    }
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet scheduled.
    Pending,
    /// Stages are being scheduled.
    Running,
    /// Halted on request or by a canary; always resumable.
    Paused,
    /// All stages completed.
    Completed,
    /// Halted by a fatal error.
    Failed,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl RunStatus {
    /// Returns true if the run is finished.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_status_display() {
        assert_eq!(StageStatus::Pending.to_string(), "pending");
        assert_eq!(StageStatus::GatedFailed.to_string(), "gated_failed");
        assert_eq!(StageStatus::FatalFailed.to_string(), "fatal_failed");
    }

    #[test]
    fn test_stage_status_is_terminal() {
        assert!(StageStatus::Completed.is_terminal());
        assert!(StageStatus::Blocked.is_terminal());
        assert!(!StageStatus::Repairing.is_terminal());
        assert!(!StageStatus::Running.is_terminal());
    }

    #[test]
    fn test_stage_status_serialize() {
        let json = serde_json::to_string(&StageStatus::GatedFailed).unwrap();
        assert_eq!(json, r#""gated_failed""#);

        let deserialized: StageStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, StageStatus::GatedFailed);
    }

    #[test]
    fn test_criticality_ordering() {
        assert!(Criticality::Low < Criticality::Normal);
        assert!(Criticality::Normal < Criticality::Critical);
        assert_eq!(Criticality::default(), Criticality::Normal);
    }

    #[test]
    fn test_tier_for_criticality() {
        assert_eq!(BackendTier::for_criticality(Criticality::Low), BackendTier::Economy);
        assert_eq!(BackendTier::for_criticality(Criticality::Critical), BackendTier::Premium);
        assert_eq!(BackendTier::ALL[0], BackendTier::Economy);
    }

    #[test]
    fn test_run_status_serialize() {
        let json = serde_json::to_string(&RunStatus::Paused).unwrap();
        assert_eq!(json, r#""paused""#);
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
    }
}
