//! ImageBasedUpgrade controller implementation
//!
//! This module wires the stage state machine into the kube-rs controller
//! loop: observe the resource, run the handler for its (stage, phase) pair,
//! write back the status if it changed, and decide when to look again.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument};

use lca_common::crd::ImageBasedUpgrade;
use lca_common::events::{EventPublisher, KubeEventPublisher};
use lca_common::{Checkpoints, Error};
use lca_ostree::{CommandHostOps, OstreeCli, RpmOstreeCli, StaterootManager, StaterootPaths};
use lca_precache::{
    resources::IMAGE_LIST_FILE_NAME, ImagePuller, PodmanPuller, PrecacheConfig,
    PrecacheResources, PrecacheTask,
};

use crate::backup::{BackupRestore, VeleroBackupRestore};
use crate::cleanup::CleanupCoordinator;
use crate::client::{KubeClient, KubeClientImpl};
use crate::cluster_config::{ClusterConfigExporter, KubeClusterConfigExporter};
use crate::config::{ControllerConfig, RequeueConfig};
use crate::health::{HealthCheck, KubeHealthCheck};
use crate::phases;

/// Name reported on events
pub const CONTROLLER_NAME: &str = "lca-controller";

/// Copy of the seed's `manifest.json` kept in the workspace after Prep
pub const SEED_INFO_FILE_NAME: &str = "seed-manifest.json";

/// Controller context containing shared state and clients
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client, config).build();
/// ```
pub struct Context {
    /// Kubernetes client for ImageBasedUpgrade writes
    pub kube: Arc<dyn KubeClient>,
    /// Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Stateroot and deployment management on the host
    pub stateroots: Arc<StaterootManager>,
    /// Application backup/restore
    pub backup: Arc<dyn BackupRestore>,
    /// Health gate for finalize
    pub health: Arc<dyn HealthCheck>,
    /// Export of cluster identity into the new stateroot
    pub cluster_config: Arc<dyn ClusterConfigExporter>,
    /// Puller used by the precache worker
    pub puller: Arc<dyn ImagePuller>,
    /// The single precache worker handle
    pub precache_task: Mutex<PrecacheTask>,
    /// Precache worker settings
    pub precache_config: PrecacheConfig,
    /// Files the precache flow writes, as readable from this process
    pub precache_resources: PrecacheResources,
    /// Step markers, as readable from this process
    pub checkpoints: Checkpoints,
    /// Workspace as seen on the host
    pub workspace: PathBuf,
    /// Requeue intervals
    pub requeue: RequeueConfig,
    /// How long cleanup waits for the precache worker
    pub cancel_grace: Duration,
    /// Set once this process asked the host to reboot
    pub reboot_requested: AtomicBool,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, config: ControllerConfig) -> ContextBuilder {
        ContextBuilder::new(client, config)
    }

    /// Host path of the precache image list
    pub fn image_list_host_path(&self) -> PathBuf {
        self.workspace.join(IMAGE_LIST_FILE_NAME)
    }

    /// Host path of the kept seed manifest
    pub fn seed_info_host_path(&self) -> PathBuf {
        self.workspace.join(SEED_INFO_FILE_NAME)
    }

    /// Workspace as readable from this process
    pub fn workspace_local(&self) -> PathBuf {
        self.stateroots.paths().outside_chroot(&self.workspace)
    }

    /// Coordinator over this context's collaborators
    pub fn cleanup_coordinator(&self) -> CleanupCoordinator<'_> {
        CleanupCoordinator {
            stateroots: &self.stateroots,
            precache: &self.precache_resources,
            backup: self.backup.as_ref(),
            workspace: self.workspace_local(),
            grace: self.cancel_grace,
        }
    }

    /// Publish an event about `ibu`; failures are logged by the publisher
    pub async fn publish(
        &self,
        ibu: &ImageBasedUpgrade,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.events
            .publish(&ibu.object_ref(&()), type_, reason, action, note)
            .await;
    }

    /// Create a context for testing with custom mock collaborators
    ///
    /// Host paths resolve below `stateroots.paths().host_root`.
    #[cfg(test)]
    pub(crate) fn for_testing(
        kube: Arc<dyn KubeClient>,
        stateroots: StaterootManager,
        backup: Arc<dyn BackupRestore>,
        health: Arc<dyn HealthCheck>,
        cluster_config: Arc<dyn ClusterConfigExporter>,
        puller: Arc<dyn ImagePuller>,
    ) -> Self {
        let config = ControllerConfig::default();
        let local_workspace = stateroots.paths().outside_chroot(&config.workspace);
        Self {
            kube,
            events: Arc::new(lca_common::events::NoopEventPublisher),
            backup,
            health,
            cluster_config,
            puller,
            precache_task: Mutex::new(PrecacheTask::new()),
            precache_config: config.precache(),
            precache_resources: PrecacheResources::in_workspace(&local_workspace),
            checkpoints: Checkpoints::new(stateroots.paths().outside_chroot(config.checkpoint_dir())),
            workspace: config.workspace.clone(),
            requeue: config.requeue(),
            cancel_grace: config.precache_grace(),
            reboot_requested: AtomicBool::new(false),
            stateroots: Arc::new(stateroots),
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// Every collaborator defaults to its real implementation; tests override
/// them with mocks.
pub struct ContextBuilder {
    client: Client,
    config: ControllerConfig,
    kube: Option<Arc<dyn KubeClient>>,
    events: Option<Arc<dyn EventPublisher>>,
    stateroots: Option<Arc<StaterootManager>>,
    backup: Option<Arc<dyn BackupRestore>>,
    health: Option<Arc<dyn HealthCheck>>,
    cluster_config: Option<Arc<dyn ClusterConfigExporter>>,
    puller: Option<Arc<dyn ImagePuller>>,
}

impl ContextBuilder {
    fn new(client: Client, config: ControllerConfig) -> Self {
        Self {
            client,
            config,
            kube: None,
            events: None,
            stateroots: None,
            backup: None,
            health: None,
            cluster_config: None,
            puller: None,
        }
    }

    /// Override the Kubernetes client
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the stateroot manager
    pub fn stateroots(mut self, stateroots: Arc<StaterootManager>) -> Self {
        self.stateroots = Some(stateroots);
        self
    }

    /// Override backup/restore
    pub fn backup_restore(mut self, backup: Arc<dyn BackupRestore>) -> Self {
        self.backup = Some(backup);
        self
    }

    /// Override the health check
    pub fn health_check(mut self, health: Arc<dyn HealthCheck>) -> Self {
        self.health = Some(health);
        self
    }

    /// Override the cluster config exporter
    pub fn cluster_config(mut self, exporter: Arc<dyn ClusterConfigExporter>) -> Self {
        self.cluster_config = Some(exporter);
        self
    }

    /// Override the image puller
    pub fn puller(mut self, puller: Arc<dyn ImagePuller>) -> Self {
        self.puller = Some(puller);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let config = self.config;
        let paths = StaterootPaths {
            host_root: config.host_root.clone(),
            deploy_root: config.deploy_root.clone(),
        };
        let ops = Arc::new(CommandHostOps::nsenter());

        let stateroots = self.stateroots.unwrap_or_else(|| {
            Arc::new(StaterootManager::new(
                Arc::new(RpmOstreeCli::new(ops.clone())),
                Arc::new(OstreeCli::new(ops.clone())),
                ops.clone(),
                paths.clone(),
            ))
        });
        let local_workspace = paths.outside_chroot(&config.workspace);

        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME))
            }),
            backup: self
                .backup
                .unwrap_or_else(|| Arc::new(VeleroBackupRestore::new(self.client.clone()))),
            health: self
                .health
                .unwrap_or_else(|| Arc::new(KubeHealthCheck::new(self.client.clone()))),
            cluster_config: self.cluster_config.unwrap_or_else(|| {
                Arc::new(KubeClusterConfigExporter::new(self.client.clone(), paths.clone()))
            }),
            puller: self.puller.unwrap_or_else(|| {
                Arc::new(PodmanPuller::new(ops.clone(), Some(config.auth_file.clone())))
            }),
            precache_task: Mutex::new(PrecacheTask::new()),
            precache_config: config.precache(),
            precache_resources: PrecacheResources::in_workspace(&local_workspace),
            checkpoints: Checkpoints::new(paths.outside_chroot(config.checkpoint_dir())),
            workspace: config.workspace.clone(),
            requeue: config.requeue(),
            cancel_grace: config.precache_grace(),
            reboot_requested: AtomicBool::new(false),
            stateroots,
        }
    }
}

/// Reconcile an ImageBasedUpgrade resource
///
/// Runs the handler for the resource's (stage, phase) pair. The status is
/// written back whenever the handler changed it, including when the handler
/// returned an error, so failure conditions are never lost.
#[instrument(skip(ibu, ctx), fields(ibu = %ibu.name_any()))]
pub async fn reconcile(ibu: Arc<ImageBasedUpgrade>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = ibu.name_any();
    debug!(stage = %ibu.spec.stage, phase = %ibu.phase(), "reconciling");

    let mut status = ibu.status_or_default();
    let result = phases::dispatch(&ibu, &mut status, &ctx).await;
    status.observed_generation = ibu.metadata.generation;

    if ibu.status.as_ref() != Some(&status) {
        info!(phase = %status.phase, "updating status");
        ctx.kube.patch_status(&name, &status).await?;
    }
    result
}

/// Error policy for the controller
///
/// Errors are logged and the resource is retried after the short interval.
pub fn error_policy(ibu: Arc<ImageBasedUpgrade>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        ibu = %ibu.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    Action::requeue(ctx.requeue.short)
}
