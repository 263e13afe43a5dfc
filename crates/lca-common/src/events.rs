//! Kubernetes Events for the upgrade controller
//!
//! Events show up in `kubectl describe ibu` and make stage transitions
//! visible without reading agent logs. Publishing never fails the caller:
//! errors are logged and dropped.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes Kubernetes Events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event about `resource_ref`
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("NODE_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons
pub mod reasons {
    /// A stage was requested and started
    pub const STAGE_STARTED: &str = "StageStarted";
    /// A stage finished successfully
    pub const STAGE_COMPLETED: &str = "StageCompleted";
    /// A stage failed
    pub const STAGE_FAILED: &str = "StageFailed";
    /// The requested stage is not reachable from the current phase
    pub const INVALID_TRANSITION: &str = "InvalidTransition";
    /// Cleanup after a stage completed
    pub const CLEANUP_SUCCEEDED: &str = "CleanupSucceeded";
    /// Cleanup left something behind; manual cleanup is required
    pub const CLEANUP_FAILED: &str = "CleanupFailed";
    /// The manual cleanup annotation was consumed
    pub const MANUAL_CLEANUP_ACKNOWLEDGED: &str = "ManualCleanupAcknowledged";
    /// The node is about to reboot into another stateroot
    pub const REBOOTING: &str = "Rebooting";
}

/// Event actions
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Abort cleanup
    pub const ABORT: &str = "Abort";
    /// Finalize cleanup
    pub const FINALIZE: &str = "Finalize";
    /// Stateroot preparation
    pub const PREP: &str = "Prep";
    /// Stateroot switch
    pub const UPGRADE: &str = "Upgrade";
    /// Switch back to the previous stateroot
    pub const ROLLBACK: &str = "Rollback";
}
