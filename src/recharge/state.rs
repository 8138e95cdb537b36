//! Recharge job status

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle of a recharge job.
///
/// ```text
///            claim              resolve(success)
/// pending ──────────▶ processing ────────────────▶ completed
///    ▲                    │
///    └── resolve(failure, │ budget left)
///                         └── resolve(failure, budget spent) ──▶ failed
/// ```
///
/// Terminal: `completed`, `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RechargeStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RechargeStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, RechargeStatus::Completed | RechargeStatus::Failed)
    }

    /// Eligible for a claim (subject to the retry budget)
    #[inline]
    pub fn is_claimable(&self) -> bool {
        !self.is_terminal()
    }

    /// Any non-terminal status may move anywhere; terminal statuses are final
    pub fn can_transition_to(&self, _next: RechargeStatus) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RechargeStatus::Pending => "pending",
            RechargeStatus::Processing => "processing",
            RechargeStatus::Completed => "completed",
            RechargeStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RechargeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RechargeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RechargeStatus::Pending),
            "processing" => Ok(RechargeStatus::Processing),
            "completed" => Ok(RechargeStatus::Completed),
            "failed" => Ok(RechargeStatus::Failed),
            other => Err(format!("unknown recharge status: {}", other)),
        }
    }
}
