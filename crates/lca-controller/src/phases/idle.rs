//! Returning to Idle: reset, abort, finalize and the manual-cleanup escape hatch

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{info, instrument, warn};

use lca_common::crd::{
    condition_reasons, condition_types, ConditionStatus, ImageBasedUpgrade,
    ImageBasedUpgradeStatus, UpgradePhase, MANUAL_CLEANUP_ANNOTATION,
};
use lca_common::events::{actions, reasons};
use lca_common::Result;

use super::set_status_condition;
use crate::cleanup::CleanupReport;
use crate::controller::Context;

/// Remediation appended to a failed cleanup's message
fn manual_cleanup_hint() -> String {
    format!(
        "Perform cleanup manually then add '{MANUAL_CLEANUP_ANNOTATION}' annotation to ibu CR to transition back to Idle"
    )
}

/// Settle in Idle with a single `Idle=True` condition and no precache task
pub(super) async fn ensure_idle(
    ibu: &ImageBasedUpgrade,
    status: &mut ImageBasedUpgradeStatus,
    ctx: &Context,
) -> Result<Action> {
    if !status.is_condition_true(condition_types::IDLE) {
        info!("Resetting to Idle");
        reset_to_idle(ibu, status);
    }
    ctx.precache_task.lock().await.reset();
    Ok(Action::await_change())
}

/// Undo an in-flight Prep or Upgrade
#[instrument(skip_all)]
pub(super) async fn handle_abort(
    ibu: &ImageBasedUpgrade,
    status: &mut ImageBasedUpgradeStatus,
    ctx: &Context,
) -> Result<Action> {
    info!(from = %status.phase, "Aborting");
    status.phase = UpgradePhase::Aborting;
    set_status_condition(
        ibu,
        status,
        condition_types::IDLE,
        ConditionStatus::False,
        condition_reasons::ABORTING,
        "Aborting",
    );

    let report = run_cleanup(ctx).await;
    if report.is_successful() {
        info!("Abort finished");
        reset_to_idle(ibu, status);
        ctx.publish(ibu, EventType::Normal, reasons::CLEANUP_SUCCEEDED, actions::ABORT, None)
            .await;
        return Ok(Action::await_change());
    }

    park(
        ibu,
        status,
        ctx,
        UpgradePhase::AbortFailed,
        condition_reasons::ABORT_FAILED,
        actions::ABORT,
        &report,
    )
    .await;
    Ok(Action::requeue(ctx.requeue.long))
}

/// Clean up after a completed Upgrade or Rollback once the cluster is healthy
#[instrument(skip_all)]
pub(super) async fn handle_finalize(
    ibu: &ImageBasedUpgrade,
    status: &mut ImageBasedUpgradeStatus,
    ctx: &Context,
) -> Result<Action> {
    status.phase = UpgradePhase::Finalize;

    if let Err(e) = ctx.health.check().await {
        info!(error = %e, "Cluster not ready for finalize");
        set_status_condition(
            ibu,
            status,
            condition_types::IDLE,
            ConditionStatus::False,
            condition_reasons::FINALIZING,
            format!("Waiting for system to stabilize before finalize (idle) stage can continue: {e}"),
        );
        return Ok(Action::requeue(ctx.requeue.health_check));
    }

    set_status_condition(
        ibu,
        status,
        condition_types::IDLE,
        ConditionStatus::False,
        condition_reasons::FINALIZING,
        "Finalizing",
    );
    let report = run_cleanup(ctx).await;
    if report.is_successful() {
        info!("Finalize finished");
        reset_to_idle(ibu, status);
        ctx.publish(
            ibu,
            EventType::Normal,
            reasons::CLEANUP_SUCCEEDED,
            actions::FINALIZE,
            None,
        )
        .await;
        return Ok(Action::await_change());
    }

    park(
        ibu,
        status,
        ctx,
        UpgradePhase::FinalizeFailed,
        condition_reasons::FINALIZE_FAILED,
        actions::FINALIZE,
        &report,
    )
    .await;
    Ok(Action::requeue(ctx.requeue.long))
}

/// Parked after a failed abort: retry once the user signals manual cleanup
pub(super) async fn handle_abort_failure(
    ibu: &ImageBasedUpgrade,
    status: &mut ImageBasedUpgradeStatus,
    ctx: &Context,
) -> Result<Action> {
    if consume_manual_cleanup_marker(ibu, ctx).await? {
        return handle_abort(ibu, status, ctx).await;
    }
    Ok(Action::requeue(ctx.requeue.long))
}

/// Parked after a failed finalize: retry once the user signals manual cleanup
pub(super) async fn handle_finalize_failure(
    ibu: &ImageBasedUpgrade,
    status: &mut ImageBasedUpgradeStatus,
    ctx: &Context,
) -> Result<Action> {
    if consume_manual_cleanup_marker(ibu, ctx).await? {
        return handle_finalize(ibu, status, ctx).await;
    }
    Ok(Action::requeue(ctx.requeue.long))
}

/// Remove the manual-cleanup annotation if present.
///
/// Returns true when the marker was there and is now gone.
async fn consume_manual_cleanup_marker(ibu: &ImageBasedUpgrade, ctx: &Context) -> Result<bool> {
    if !ibu.has_manual_cleanup_marker() {
        return Ok(false);
    }
    info!("Manual cleanup annotation found, removing it and retrying");
    ctx.kube
        .remove_annotation(&ibu.name_any(), MANUAL_CLEANUP_ANNOTATION)
        .await?;
    ctx.publish(
        ibu,
        EventType::Normal,
        reasons::MANUAL_CLEANUP_ACKNOWLEDGED,
        actions::RECONCILE,
        None,
    )
    .await;
    Ok(true)
}

async fn run_cleanup(ctx: &Context) -> CleanupReport {
    let mut task = ctx.precache_task.lock().await;
    ctx.cleanup_coordinator().cleanup(&mut task).await
}

async fn park(
    ibu: &ImageBasedUpgrade,
    status: &mut ImageBasedUpgradeStatus,
    ctx: &Context,
    phase: UpgradePhase,
    reason: &str,
    action: &str,
    report: &CleanupReport,
) {
    let message = format!("{}{}", report.message(), manual_cleanup_hint());
    warn!(phase = %phase, failures = report.failures.len(), "Cleanup failed, waiting for manual cleanup");
    status.phase = phase;
    set_status_condition(
        ibu,
        status,
        condition_types::IDLE,
        ConditionStatus::False,
        reason,
        message.clone(),
    );
    ctx.publish(ibu, EventType::Warning, reasons::CLEANUP_FAILED, action, Some(message))
        .await;
}

fn reset_to_idle(ibu: &ImageBasedUpgrade, status: &mut ImageBasedUpgradeStatus) {
    *status = ImageBasedUpgradeStatus::idle(ibu.metadata.generation);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hint_names_the_annotation_the_controller_watches() {
        let hint = manual_cleanup_hint();
        assert!(hint.contains(&format!("'{MANUAL_CLEANUP_ANNOTATION}' annotation")));
        assert!(hint.ends_with("transition back to Idle"));
    }
}
