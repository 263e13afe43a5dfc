//! Status condition types shared by the lifecycle agent CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition types reported on an ImageBasedUpgrade
pub mod condition_types {
    /// The upgrade is idle (True) or transitioning back to idle (False)
    pub const IDLE: &str = "Idle";
    /// Prep stage is running
    pub const PREP_IN_PROGRESS: &str = "PrepInProgress";
    /// Prep stage finished (True) or failed (False)
    pub const PREP_COMPLETED: &str = "PrepCompleted";
    /// Upgrade stage is running
    pub const UPGRADE_IN_PROGRESS: &str = "UpgradeInProgress";
    /// Upgrade stage finished (True) or failed (False)
    pub const UPGRADE_COMPLETED: &str = "UpgradeCompleted";
    /// Rollback stage is running
    pub const ROLLBACK_IN_PROGRESS: &str = "RollbackInProgress";
    /// Rollback stage finished (True) or failed (False)
    pub const ROLLBACK_COMPLETED: &str = "RollbackCompleted";
}

/// Machine-readable condition reasons
pub mod condition_reasons {
    /// Nothing in flight
    pub const IDLE: &str = "Idle";
    /// Abort cleanup is running
    pub const ABORTING: &str = "Aborting";
    /// Abort cleanup failed and awaits manual cleanup
    pub const ABORT_FAILED: &str = "AbortFailed";
    /// Finalize is waiting on cluster health or running cleanup
    pub const FINALIZING: &str = "Finalizing";
    /// Finalize cleanup failed and awaits manual cleanup
    pub const FINALIZE_FAILED: &str = "FinalizeFailed";
    /// Stage work is in progress
    pub const IN_PROGRESS: &str = "InProgress";
    /// Stage work completed
    pub const COMPLETED: &str = "Completed";
    /// Stage work failed
    pub const FAILED: &str = "Failed";
    /// Requested stage cannot be reached from the current phase
    pub const INVALID_TRANSITION: &str = "InvalidTransition";
    /// Requested stage is blocked by in-flight work
    pub const BLOCKED: &str = "Blocked";
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., Idle, PrepCompleted)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Generation of the resource this condition was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Last time the condition transitioned
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation: None,
            last_transition_time: Utc::now(),
        }
    }

    /// Attach the observed generation and return self for chaining
    pub fn generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// Returns true if this condition has status True
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Insert or replace the condition with the same type.
///
/// When the status is unchanged the previous transition time is kept.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        if existing.status == condition.status {
            condition.last_transition_time = existing.last_transition_time;
        }
        *existing = condition;
    } else {
        conditions.push(condition);
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Returns true if the condition of the given type is present and True
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(Condition::is_true)
}
