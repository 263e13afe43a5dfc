//! Upgrade: back up applications, carry cluster identity over, and reboot
//! into the new stateroot

use std::sync::atomic::Ordering;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{info, instrument, warn};

use lca_common::crd::{
    condition_reasons, condition_types, find_condition, ConditionStatus, ImageBasedUpgrade,
    ImageBasedUpgradeStatus, UpgradePhase,
};
use lca_common::events::{actions, reasons};
use lca_common::{stateroot_name, Error, Result};
use lca_ostree::booted_stateroot;

use super::set_status_condition;
use crate::controller::Context;

/// Application data backed up
pub(crate) const STEP_BACKUP: &str = "upgrade_backup";
/// Cluster configuration written into the new stateroot
pub(crate) const STEP_EXPORT_CLUSTER_CONFIG: &str = "upgrade_export_cluster_config";
/// New stateroot made the default boot entry
pub(crate) const STEP_SET_DEFAULT: &str = "upgrade_set_default_deployment";
/// Reboot requested
pub(crate) const STEP_REBOOT: &str = "upgrade_reboot";

pub(super) async fn start_upgrade(
    ibu: &ImageBasedUpgrade,
    status: &mut ImageBasedUpgradeStatus,
    ctx: &Context,
) -> Result<Action> {
    let deployments = ctx.stateroots.query_deployments().await?;
    let booted = booted_stateroot(&deployments)?.to_string();
    info!(from = %booted, "Starting Upgrade");

    status.phase = UpgradePhase::Upgrade;
    status.previous_stateroot = Some(booted);
    status.target_stateroot = Some(stateroot_name(&ibu.spec.seed_image_ref.version));
    set_status_condition(
        ibu,
        status,
        condition_types::PREP_IN_PROGRESS,
        ConditionStatus::False,
        condition_reasons::COMPLETED,
        "Prep completed",
    );
    set_status_condition(
        ibu,
        status,
        condition_types::UPGRADE_IN_PROGRESS,
        ConditionStatus::True,
        condition_reasons::IN_PROGRESS,
        "In progress",
    );
    ctx.publish(ibu, EventType::Normal, reasons::STAGE_STARTED, actions::UPGRADE, None)
        .await;
    handle_upgrade(ibu, status, ctx).await
}

#[instrument(skip_all)]
pub(super) async fn handle_upgrade(
    ibu: &ImageBasedUpgrade,
    status: &mut ImageBasedUpgradeStatus,
    ctx: &Context,
) -> Result<Action> {
    if status.is_condition_true(condition_types::UPGRADE_COMPLETED)
        || stage_failed(status, condition_types::UPGRADE_COMPLETED)
    {
        return Ok(Action::await_change());
    }

    let target = status
        .target_stateroot
        .clone()
        .unwrap_or_else(|| stateroot_name(&ibu.spec.seed_image_ref.version));

    // Back in the controller after the reboot: the steps ran in the old stateroot
    let deployments = ctx.stateroots.query_deployments().await?;
    if booted_stateroot(&deployments)? == target {
        return Ok(finish(ibu, status, ctx, StageKind::Upgrade, Ok(())).await);
    }

    let name = ibu.name_any();
    let result: Result<Switch> = async {
        ctx.checkpoints
            .run_once(STEP_BACKUP, || ctx.backup.backup_application_data(&name))
            .await?;
        ctx.checkpoints
            .run_once(STEP_EXPORT_CLUSTER_CONFIG, || ctx.cluster_config.export(&target))
            .await?;
        switch_stateroot(ctx, &target, STEP_SET_DEFAULT, STEP_REBOOT).await
    }
    .await;

    match result {
        Ok(Switch::Booted) => Ok(finish(ibu, status, ctx, StageKind::Upgrade, Ok(())).await),
        Ok(Switch::Rebooting) => {
            ctx.publish(
                ibu,
                EventType::Normal,
                reasons::REBOOTING,
                actions::UPGRADE,
                Some(format!("Rebooting into stateroot {target}")),
            )
            .await;
            Ok(Action::requeue(ctx.requeue.long))
        }
        Ok(Switch::Pending) => Ok(Action::requeue(ctx.requeue.long)),
        Err(e) if e.is_retryable() => Err(e),
        Err(e) => Ok(finish(ibu, status, ctx, StageKind::Upgrade, Err(e)).await),
    }
}

/// Where a stateroot switch stands after one pass
pub(super) enum Switch {
    /// Running in the target stateroot
    Booted,
    /// Reboot just requested
    Rebooting,
    /// Reboot requested earlier by this process, still going down
    Pending,
}

/// Make `target` the default boot entry and reboot into it, once.
///
/// A reboot step recorded while the node still runs another stateroot
/// after restarting means the boot into `target` did not stick.
pub(super) async fn switch_stateroot(
    ctx: &Context,
    target: &str,
    set_default_step: &str,
    reboot_step: &str,
) -> Result<Switch> {
    let deployments = ctx.stateroots.query_deployments().await?;
    let booted = booted_stateroot(&deployments)?;
    if booted == target {
        return Ok(Switch::Booted);
    }
    if ctx.reboot_requested.load(Ordering::SeqCst) {
        return Ok(Switch::Pending);
    }
    if ctx.checkpoints.is_done(reboot_step).await? {
        return Err(Error::validation_for(
            "stateroot",
            format!("rebooted into {booted} instead of {target}"),
        ));
    }

    let index = deployments
        .iter()
        .position(|d| d.osname == target)
        .ok_or_else(|| {
            Error::validation_for("stateroot", format!("no deployment found for {target}"))
        })?;
    ctx.checkpoints
        .run_once(set_default_step, || ctx.stateroots.ostree().set_default(index))
        .await?;

    info!(stateroot = %target, "Rebooting");
    ctx.checkpoints
        .run_once(reboot_step, || async {
            ctx.stateroots
                .ops()
                .run_in_host_namespace("systemctl", &["reboot".to_string()])
                .await
                .map(drop)
        })
        .await?;
    ctx.reboot_requested.store(true, Ordering::SeqCst);
    Ok(Switch::Rebooting)
}

/// Stage that owns a pair of in-progress/completed conditions
#[derive(Clone, Copy)]
pub(super) enum StageKind {
    Upgrade,
    Rollback,
}

impl StageKind {
    fn conditions(self) -> (&'static str, &'static str, &'static str) {
        match self {
            Self::Upgrade => (
                condition_types::UPGRADE_IN_PROGRESS,
                condition_types::UPGRADE_COMPLETED,
                actions::UPGRADE,
            ),
            Self::Rollback => (
                condition_types::ROLLBACK_IN_PROGRESS,
                condition_types::ROLLBACK_COMPLETED,
                actions::ROLLBACK,
            ),
        }
    }
}

/// True once the completed condition was set to False/Failed
pub(super) fn stage_failed(status: &ImageBasedUpgradeStatus, completed: &str) -> bool {
    find_condition(&status.conditions, completed)
        .is_some_and(|c| c.reason == condition_reasons::FAILED)
}

/// Record the stage outcome on both of its conditions
pub(super) async fn finish(
    ibu: &ImageBasedUpgrade,
    status: &mut ImageBasedUpgradeStatus,
    ctx: &Context,
    stage: StageKind,
    outcome: Result<()>,
) -> Action {
    let (in_progress, completed, action) = stage.conditions();
    match outcome {
        Ok(()) => {
            info!(action, "Stage completed");
            set_status_condition(
                ibu,
                status,
                in_progress,
                ConditionStatus::False,
                condition_reasons::COMPLETED,
                format!("{action} completed"),
            );
            set_status_condition(
                ibu,
                status,
                completed,
                ConditionStatus::True,
                condition_reasons::COMPLETED,
                format!("{action} completed"),
            );
            ctx.publish(ibu, EventType::Normal, reasons::STAGE_COMPLETED, action, None)
                .await;
        }
        Err(e) => {
            let message = e.to_string();
            warn!(action, error = %message, "Stage failed");
            set_status_condition(
                ibu,
                status,
                in_progress,
                ConditionStatus::False,
                condition_reasons::FAILED,
                message.clone(),
            );
            set_status_condition(
                ibu,
                status,
                completed,
                ConditionStatus::False,
                condition_reasons::FAILED,
                message.clone(),
            );
            ctx.publish(ibu, EventType::Warning, reasons::STAGE_FAILED, action, Some(message))
                .await;
        }
    }
    Action::await_change()
}
