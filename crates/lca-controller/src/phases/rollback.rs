//! Rollback: reboot back into the stateroot the upgrade started from

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use tracing::{info, instrument};

use lca_common::crd::{
    condition_reasons, condition_types, ConditionStatus, ImageBasedUpgrade,
    ImageBasedUpgradeStatus, UpgradePhase,
};
use lca_common::events::{actions, reasons};
use lca_common::{Error, Result};

use super::set_status_condition;
use super::upgrade::{finish, stage_failed, switch_stateroot, StageKind, Switch};
use crate::controller::Context;

/// Previous stateroot made the default boot entry
pub(crate) const STEP_SET_DEFAULT: &str = "rollback_set_default_deployment";
/// Reboot requested
pub(crate) const STEP_REBOOT: &str = "rollback_reboot";

pub(super) async fn start_rollback(
    ibu: &ImageBasedUpgrade,
    status: &mut ImageBasedUpgradeStatus,
    ctx: &Context,
) -> Result<Action> {
    info!(to = ?status.previous_stateroot, "Starting Rollback");
    status.phase = UpgradePhase::Rollback;
    if status.is_condition_true(condition_types::UPGRADE_IN_PROGRESS) {
        set_status_condition(
            ibu,
            status,
            condition_types::UPGRADE_IN_PROGRESS,
            ConditionStatus::False,
            condition_reasons::FAILED,
            "Rollback requested",
        );
    }
    set_status_condition(
        ibu,
        status,
        condition_types::ROLLBACK_IN_PROGRESS,
        ConditionStatus::True,
        condition_reasons::IN_PROGRESS,
        "In progress",
    );
    ctx.publish(ibu, EventType::Normal, reasons::STAGE_STARTED, actions::ROLLBACK, None)
        .await;
    handle_rollback(ibu, status, ctx).await
}

#[instrument(skip_all)]
pub(super) async fn handle_rollback(
    ibu: &ImageBasedUpgrade,
    status: &mut ImageBasedUpgradeStatus,
    ctx: &Context,
) -> Result<Action> {
    if status.is_condition_true(condition_types::ROLLBACK_COMPLETED)
        || stage_failed(status, condition_types::ROLLBACK_COMPLETED)
    {
        return Ok(Action::await_change());
    }

    let Some(previous) = status.previous_stateroot.clone() else {
        let e = Error::validation_for("rollback", "no previous stateroot recorded");
        return Ok(finish(ibu, status, ctx, StageKind::Rollback, Err(e)).await);
    };

    match switch_stateroot(ctx, &previous, STEP_SET_DEFAULT, STEP_REBOOT).await {
        Ok(Switch::Booted) => Ok(finish(ibu, status, ctx, StageKind::Rollback, Ok(())).await),
        Ok(Switch::Rebooting) => {
            ctx.publish(
                ibu,
                EventType::Normal,
                reasons::REBOOTING,
                actions::ROLLBACK,
                Some(format!("Rebooting into stateroot {previous}")),
            )
            .await;
            Ok(Action::requeue(ctx.requeue.long))
        }
        Ok(Switch::Pending) => Ok(Action::requeue(ctx.requeue.long)),
        Err(e) if e.is_retryable() => Err(e),
        Err(e) => Ok(finish(ibu, status, ctx, StageKind::Rollback, Err(e)).await),
    }
}
