//! Custom Resource Definitions for the lifecycle agent

mod image_based_upgrade;
mod types;

pub use image_based_upgrade::{
    AutoRollbackOnFailure, ImageBasedUpgrade, ImageBasedUpgradeSpec, ImageBasedUpgradeStatus,
    PullSecretRef, SeedImageRef, Stage, UpgradePhase, MANUAL_CLEANUP_ANNOTATION,
};
pub use types::{
    condition_reasons, condition_types, find_condition, is_condition_true, set_condition,
    Condition, ConditionStatus,
};
