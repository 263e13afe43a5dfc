//! ImageBasedUpgrade Custom Resource Definition
//!
//! A single cluster-scoped ImageBasedUpgrade drives the node through the
//! upgrade stages. `spec.stage` is the desired stage, `status.phase` is
//! where the state machine currently is.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    condition_reasons, condition_types, is_condition_true, set_condition, Condition,
    ConditionStatus,
};

/// Annotation an operator adds after finishing a manual cleanup
pub const MANUAL_CLEANUP_ANNOTATION: &str = "lca.openshift.io/manual-cleanup-done";

/// Desired stage requested by the user
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum Stage {
    /// Nothing in flight; returning here aborts or finalizes
    #[default]
    Idle,
    /// Prepare the new stateroot and precache images
    Prep,
    /// Switch to the new stateroot
    Upgrade,
    /// Switch back to the previous stateroot
    Rollback,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Prep => write!(f, "Prep"),
            Self::Upgrade => write!(f, "Upgrade"),
            Self::Rollback => write!(f, "Rollback"),
        }
    }
}

/// Current phase of the state machine
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UpgradePhase {
    /// Nothing in flight
    #[default]
    Idle,
    /// Prep stage running or completed
    Prep,
    /// Upgrade stage running or completed
    Upgrade,
    /// Waiting for health, then cleaning up after a successful stage
    Finalize,
    /// Cleaning up after an abandoned stage
    Aborting,
    /// Abort cleanup failed, waiting for manual cleanup
    AbortFailed,
    /// Rollback stage running or completed
    Rollback,
    /// Finalize cleanup failed, waiting for manual cleanup
    FinalizeFailed,
}

impl UpgradePhase {
    /// Returns true if the machine is parked waiting for a manual cleanup
    pub fn awaits_manual_cleanup(&self) -> bool {
        matches!(self, Self::AbortFailed | Self::FinalizeFailed)
    }
}

impl std::fmt::Display for UpgradePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Prep => write!(f, "Prep"),
            Self::Upgrade => write!(f, "Upgrade"),
            Self::Finalize => write!(f, "Finalize"),
            Self::Aborting => write!(f, "Aborting"),
            Self::AbortFailed => write!(f, "AbortFailed"),
            Self::Rollback => write!(f, "Rollback"),
            Self::FinalizeFailed => write!(f, "FinalizeFailed"),
        }
    }
}

/// Reference to a secret holding registry credentials for the seed image
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PullSecretRef {
    /// Secret name in the lifecycle agent namespace
    pub name: String,
}

/// Seed image the new stateroot is built from
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeedImageRef {
    /// Image reference (registry/repo:tag)
    pub image: String,

    /// Release version the seed was built from
    pub version: String,

    /// Credentials for pulling the seed image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_secret_ref: Option<PullSecretRef>,
}

/// Automatic rollback settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoRollbackOnFailure {
    /// Seconds the post-reboot init monitor waits before rolling back
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_monitor_timeout_seconds: Option<u64>,
}

/// Specification for an ImageBasedUpgrade
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "lca.openshift.io",
    version = "v1alpha1",
    kind = "ImageBasedUpgrade",
    plural = "imagebasedupgrades",
    shortname = "ibu",
    status = "ImageBasedUpgradeStatus",
    printcolumn = r#"{"name":"Stage","type":"string","jsonPath":".spec.stage"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ImageBasedUpgradeSpec {
    /// Desired stage
    #[serde(default)]
    pub stage: Stage,

    /// Seed image to upgrade to
    #[serde(default)]
    pub seed_image_ref: SeedImageRef,

    /// Roll back automatically when the upgraded node fails to come up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_rollback_on_failure: Option<AutoRollbackOnFailure>,
}

/// Status of an ImageBasedUpgrade
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageBasedUpgradeStatus {
    /// Current phase
    #[serde(default)]
    pub phase: UpgradePhase,

    /// Status conditions, one per type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Observed generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Stateroot the node was booted from when Upgrade started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_stateroot: Option<String>,

    /// Stateroot created by Prep
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_stateroot: Option<String>,
}

impl ImageBasedUpgradeStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: UpgradePhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Status of a freshly reset machine: phase Idle and a single Idle=True condition
    pub fn idle(generation: Option<i64>) -> Self {
        Self::with_phase(UpgradePhase::Idle)
            .observed_generation(generation)
            .condition(
                Condition::new(
                    condition_types::IDLE,
                    ConditionStatus::True,
                    condition_reasons::IDLE,
                    "Idle",
                )
                .generation(generation),
            )
    }

    /// Set the phase and return self for chaining
    pub fn phase(mut self, phase: UpgradePhase) -> Self {
        self.phase = phase;
        self
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Set the observed generation and return self for chaining
    pub fn observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// Add or update a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        set_condition(&mut self.conditions, condition);
        self
    }

    /// Returns true if the condition of the given type is True
    pub fn is_condition_true(&self, type_: &str) -> bool {
        is_condition_true(&self.conditions, type_)
    }
}

impl ImageBasedUpgrade {
    /// Current phase, defaulting to Idle when no status was written yet
    pub fn phase(&self) -> UpgradePhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Current status or an empty one
    pub fn status_or_default(&self) -> ImageBasedUpgradeStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Returns true if the condition of the given type is True
    pub fn is_condition_true(&self, type_: &str) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.is_condition_true(type_))
    }

    /// Returns true if the manual cleanup annotation is present
    pub fn has_manual_cleanup_marker(&self) -> bool {
        self.annotations().contains_key(MANUAL_CLEANUP_ANNOTATION)
    }
}
