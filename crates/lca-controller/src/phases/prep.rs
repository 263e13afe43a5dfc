//! Prep: build the new stateroot from the seed image and precache its images

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use tracing::{info, instrument, warn};

use lca_common::crd::{
    condition_reasons, condition_types, find_condition, ConditionStatus, ImageBasedUpgrade,
    ImageBasedUpgradeStatus, UpgradePhase,
};
use lca_common::events::{actions, reasons};
use lca_common::seedinfo::SeedClusterInfo;
use lca_common::{stateroot_name, Error, Result};
use lca_ostree::{read_precaching_list, registry_override, SeedStaterootRequest};
use lca_precache::TaskPoll;

use super::set_status_condition;
use crate::controller::Context;

/// Seed image pulled onto the host
pub(crate) const STEP_PULL_SEED: &str = "prep_pull_seed_image";
/// New stateroot deployed and populated
pub(crate) const STEP_SETUP_STATEROOT: &str = "prep_setup_stateroot";
/// Precache worker finished
pub(crate) const STEP_PRECACHE: &str = "prep_precache";

pub(super) async fn start_prep(
    ibu: &ImageBasedUpgrade,
    status: &mut ImageBasedUpgradeStatus,
    ctx: &Context,
) -> Result<Action> {
    info!(seed = %ibu.spec.seed_image_ref.image, "Starting Prep");
    status.phase = UpgradePhase::Prep;
    status.message = None;
    set_status_condition(
        ibu,
        status,
        condition_types::IDLE,
        ConditionStatus::False,
        condition_reasons::IN_PROGRESS,
        "In progress",
    );
    set_status_condition(
        ibu,
        status,
        condition_types::PREP_IN_PROGRESS,
        ConditionStatus::True,
        condition_reasons::IN_PROGRESS,
        "In progress",
    );
    ctx.publish(ibu, EventType::Normal, reasons::STAGE_STARTED, actions::PREP, None)
        .await;
    handle_prep(ibu, status, ctx).await
}

#[instrument(skip_all)]
pub(super) async fn handle_prep(
    ibu: &ImageBasedUpgrade,
    status: &mut ImageBasedUpgradeStatus,
    ctx: &Context,
) -> Result<Action> {
    if status.is_condition_true(condition_types::PREP_COMPLETED) || prep_failed(status) {
        return Ok(Action::await_change());
    }

    let seed = &ibu.spec.seed_image_ref;
    if let Err(e) = setup_stateroot(ctx, &seed.image, &seed.version).await {
        return Ok(fail_prep(ibu, status, ctx, e.to_string()).await);
    }
    status.target_stateroot = Some(stateroot_name(&seed.version));

    if ctx.checkpoints.is_done(STEP_PRECACHE).await? {
        return Ok(complete_prep(ibu, status, ctx).await);
    }

    let mut task = ctx.precache_task.lock().await;
    match task.poll().await {
        TaskPoll::Idle => {
            let images = precaching_list(ctx).await?;
            info!(images = images.len(), mode = %ctx.precache_config.mode, "Starting precache");
            task.start(images, ctx.puller.clone(), ctx.precache_config.clone())?;
            set_progress(ibu, status, "Precaching images".to_string());
            Ok(Action::requeue(ctx.requeue.short))
        }
        TaskPoll::Running(snapshot) => {
            ctx.precache_resources.write_status(&snapshot).await?;
            set_progress(ibu, status, format!("Precaching images: {snapshot}"));
            Ok(Action::requeue(ctx.requeue.short))
        }
        TaskPoll::Finished(Ok(summary)) => {
            drop(task);
            for (image, error) in &summary.failures {
                warn!(image = %image, error = %error, "Image was not precached");
            }
            ctx.checkpoints.record(STEP_PRECACHE).await?;
            Ok(complete_prep(ibu, status, ctx).await)
        }
        TaskPoll::Finished(Err(e)) => {
            drop(task);
            Ok(fail_prep(ibu, status, ctx, e.to_string()).await)
        }
    }
}

async fn setup_stateroot(ctx: &Context, image: &str, version: &str) -> Result<()> {
    ctx.checkpoints
        .run_once(STEP_PULL_SEED, || async {
            ctx.puller.pull(image).await.map_err(Error::from)
        })
        .await?;

    let request = SeedStaterootRequest {
        seed_image: image.to_string(),
        expected_version: version.to_string(),
        image_list_file: ctx.image_list_host_path(),
        seed_info_file: Some(ctx.seed_info_host_path()),
        ibi: false,
    };
    ctx.checkpoints
        .run_once(STEP_SETUP_STATEROOT, || async {
            ctx.stateroots.setup_stateroot(&request).await.map(drop)
        })
        .await
}

/// The seed's image list, pointed at the cluster's registry when the seed
/// was built against a different one
async fn precaching_list(ctx: &Context) -> Result<Vec<String>> {
    let list = &ctx.precache_resources.image_list_file;
    let seed_info = ctx
        .stateroots
        .paths()
        .outside_chroot(ctx.seed_info_host_path());
    let seed_registry = match tokio::fs::read(&seed_info).await {
        Ok(data) => SeedClusterInfo::from_json(&data)?.release_registry,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(Error::io(&seed_info, e)),
    };
    if seed_registry.is_empty() {
        return read_precaching_list(list, None).await;
    }

    let cluster_registry = ctx.cluster_config.release_registry().await?;
    let rewrite = registry_override(&seed_registry, &cluster_registry);
    if rewrite.is_some() {
        info!(seed = %seed_registry, cluster = %cluster_registry, "Rewriting seed registry in image list");
    }
    read_precaching_list(list, rewrite).await
}

fn prep_failed(status: &ImageBasedUpgradeStatus) -> bool {
    find_condition(&status.conditions, condition_types::PREP_COMPLETED)
        .is_some_and(|c| c.reason == condition_reasons::FAILED)
}

fn set_progress(ibu: &ImageBasedUpgrade, status: &mut ImageBasedUpgradeStatus, message: String) {
    set_status_condition(
        ibu,
        status,
        condition_types::PREP_IN_PROGRESS,
        ConditionStatus::True,
        condition_reasons::IN_PROGRESS,
        message,
    );
}

async fn complete_prep(
    ibu: &ImageBasedUpgrade,
    status: &mut ImageBasedUpgradeStatus,
    ctx: &Context,
) -> Action {
    info!("Prep completed");
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
        condition_types::PREP_COMPLETED,
        ConditionStatus::True,
        condition_reasons::COMPLETED,
        "Prep completed",
    );
    ctx.publish(ibu, EventType::Normal, reasons::STAGE_COMPLETED, actions::PREP, None)
        .await;
    Action::await_change()
}

async fn fail_prep(
    ibu: &ImageBasedUpgrade,
    status: &mut ImageBasedUpgradeStatus,
    ctx: &Context,
    message: String,
) -> Action {
    warn!(error = %message, "Prep failed");
    set_status_condition(
        ibu,
        status,
        condition_types::PREP_IN_PROGRESS,
        ConditionStatus::False,
        condition_reasons::FAILED,
        message.clone(),
    );
    set_status_condition(
        ibu,
        status,
        condition_types::PREP_COMPLETED,
        ConditionStatus::False,
        condition_reasons::FAILED,
        message.clone(),
    );
    ctx.publish(
        ibu,
        EventType::Warning,
        reasons::STAGE_FAILED,
        actions::PREP,
        Some(message),
    )
    .await;
    Action::await_change()
}
