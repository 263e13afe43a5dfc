//! Stage state machine
//!
//! `spec.stage` is where the user wants to go and `status.phase` is where the
//! machine is. [`dispatch`] picks the handler for the pair; handlers update
//! the status in place and return when to look again.

mod idle;
mod prep;
mod rollback;
mod upgrade;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use tracing::{info, warn};

use lca_common::crd::{
    condition_reasons, condition_types, set_condition, Condition, ConditionStatus,
    ImageBasedUpgrade, ImageBasedUpgradeStatus, Stage, UpgradePhase,
};
use lca_common::events::{actions, reasons};
use lca_common::Result;

use crate::controller::Context;

/// Run the handler for the current (stage, phase) pair
pub async fn dispatch(
    ibu: &ImageBasedUpgrade,
    status: &mut ImageBasedUpgradeStatus,
    ctx: &Context,
) -> Result<Action> {
    use UpgradePhase as P;

    let stage = ibu.spec.stage;
    let phase = status.phase;

    // Parked after a failed cleanup: only the manual marker moves us on,
    // whatever stage is requested.
    match phase {
        P::AbortFailed => return idle::handle_abort_failure(ibu, status, ctx).await,
        P::FinalizeFailed => return idle::handle_finalize_failure(ibu, status, ctx).await,
        _ => {}
    }

    match (stage, phase) {
        (Stage::Idle, P::Idle) => idle::ensure_idle(ibu, status, ctx).await,
        (Stage::Idle, P::Prep | P::Aborting) => idle::handle_abort(ibu, status, ctx).await,
        (Stage::Idle, P::Upgrade) => {
            if status.is_condition_true(condition_types::UPGRADE_COMPLETED) {
                idle::handle_finalize(ibu, status, ctx).await
            } else {
                idle::handle_abort(ibu, status, ctx).await
            }
        }
        (Stage::Idle, P::Rollback) => {
            if status.is_condition_true(condition_types::ROLLBACK_COMPLETED) {
                idle::handle_finalize(ibu, status, ctx).await
            } else {
                idle::handle_abort(ibu, status, ctx).await
            }
        }
        (Stage::Idle, P::Finalize) => idle::handle_finalize(ibu, status, ctx).await,

        (_, P::Finalize | P::Aborting) => Ok(wait_for_idle(stage, status, ctx)),

        (Stage::Prep, P::Idle) => prep::start_prep(ibu, status, ctx).await,
        (Stage::Prep, P::Prep) => prep::handle_prep(ibu, status, ctx).await,

        (Stage::Upgrade, P::Prep) if status.is_condition_true(condition_types::PREP_COMPLETED) => {
            upgrade::start_upgrade(ibu, status, ctx).await
        }
        (Stage::Upgrade, P::Upgrade) => upgrade::handle_upgrade(ibu, status, ctx).await,

        (Stage::Rollback, P::Upgrade) => rollback::start_rollback(ibu, status, ctx).await,
        (Stage::Rollback, P::Rollback) => rollback::handle_rollback(ibu, status, ctx).await,

        _ => Ok(invalid_transition(ibu, status, ctx).await),
    }
}

/// The in-progress condition type of a stage
pub(crate) fn in_progress_condition(stage: Stage) -> &'static str {
    match stage {
        Stage::Idle => condition_types::IDLE,
        Stage::Prep => condition_types::PREP_IN_PROGRESS,
        Stage::Upgrade => condition_types::UPGRADE_IN_PROGRESS,
        Stage::Rollback => condition_types::ROLLBACK_IN_PROGRESS,
    }
}

/// Set a condition stamped with the resource generation
pub(crate) fn set_status_condition(
    ibu: &ImageBasedUpgrade,
    status: &mut ImageBasedUpgradeStatus,
    type_: &str,
    condition_status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
) {
    set_condition(
        &mut status.conditions,
        Condition::new(type_, condition_status, reason, message).generation(ibu.metadata.generation),
    );
}

async fn invalid_transition(
    ibu: &ImageBasedUpgrade,
    status: &mut ImageBasedUpgradeStatus,
    ctx: &Context,
) -> Action {
    let stage = ibu.spec.stage;
    let message = format!("Transition from {} to {stage} is not allowed", status.phase);
    warn!(stage = %stage, phase = %status.phase, "Invalid stage transition");

    set_status_condition(
        ibu,
        status,
        in_progress_condition(stage),
        ConditionStatus::False,
        condition_reasons::INVALID_TRANSITION,
        message.clone(),
    );
    ctx.publish(
        ibu,
        EventType::Warning,
        reasons::INVALID_TRANSITION,
        actions::RECONCILE,
        Some(message),
    )
    .await;
    Action::await_change()
}

fn wait_for_idle(stage: Stage, status: &mut ImageBasedUpgradeStatus, ctx: &Context) -> Action {
    info!(stage = %stage, phase = %status.phase, "Waiting for the return to Idle to finish");
    status.message = Some(format!(
        "{stage} requested while {} is still running",
        status.phase
    ));
    Action::requeue(ctx.requeue.short)
}
