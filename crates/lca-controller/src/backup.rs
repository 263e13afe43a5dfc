//! Application backup and restore through OADP/Velero
//!
//! Velero resources are handled as `DynamicObject`s so the controller does
//! not depend on the Velero CRD schemas.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::api::{
    Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams, PostParams,
};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use lca_common::retry::{retry_retryable, RetryConfig};
use lca_common::{Error, Result};

use crate::client::FIELD_MANAGER;

/// Namespace OADP runs in
pub const OADP_NAMESPACE: &str = "openshift-adp";
/// Label put on every Velero object this agent creates
pub const BACKUP_LABEL: &str = "lca.openshift.io/backup";
/// Annotation holding a PV's reclaim policy before the upgrade changed it
pub const ORIGINAL_RECLAIM_POLICY_ANNOTATION: &str = "lca.openshift.io/original-reclaim-policy";

const VELERO_GROUP: &str = "velero.io";
const VELERO_VERSION: &str = "v1";

/// Backup and restore operations used by the stage machine
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackupRestore: Send + Sync {
    /// Back up application data and wait for the backup to finish
    async fn backup_application_data(&self, name: &str) -> Result<()>;

    /// Delete every DeleteBackupRequest this agent created
    async fn cleanup_delete_backup_requests(&self) -> Result<()>;

    /// Delete every Backup this agent created
    async fn cleanup_backups(&self) -> Result<()>;

    /// Put back the reclaim policy of PVs that were switched to Retain
    async fn restore_pv_reclaim_policy(&self) -> Result<()>;
}

/// How a Velero Backup ended, from `status.phase`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackupOutcome {
    /// Not finished yet, or no status written
    Pending,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully with the given phase
    Failed(String),
}

/// Classify a Backup object by its phase
pub fn backup_outcome(backup: &DynamicObject) -> BackupOutcome {
    match backup.data.pointer("/status/phase").and_then(|p| p.as_str()) {
        Some("Completed") => BackupOutcome::Completed,
        Some(phase @ ("Failed" | "PartiallyFailed" | "FailedValidation")) => {
            BackupOutcome::Failed(phase.to_string())
        }
        _ => BackupOutcome::Pending,
    }
}

/// The policy to restore on `pv`, if it carries one that differs from its current policy
pub fn reclaim_policy_to_restore(pv: &PersistentVolume) -> Option<String> {
    let original = pv.annotations().get(ORIGINAL_RECLAIM_POLICY_ANNOTATION)?;
    let current = pv
        .spec
        .as_ref()
        .and_then(|s| s.persistent_volume_reclaim_policy.as_deref());
    (current != Some(original.as_str())).then(|| original.clone())
}

fn velero_resource(kind: &str) -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(VELERO_GROUP, VELERO_VERSION, kind))
}

/// [`BackupRestore`] backed by the OADP operator
pub struct VeleroBackupRestore {
    client: Client,
    poll: RetryConfig,
}

impl VeleroBackupRestore {
    /// Create with the default completion poll (every 10s for up to 30 minutes)
    pub fn new(client: Client) -> Self {
        Self {
            client,
            poll: RetryConfig::fixed(180, Duration::from_secs(10)),
        }
    }

    fn api(&self, kind: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), OADP_NAMESPACE, &velero_resource(kind))
    }

    async fn delete_labeled(&self, kind: &str) -> Result<()> {
        let api = self.api(kind);
        let objects = api.list(&ListParams::default().labels(BACKUP_LABEL)).await?;
        for obj in objects.items {
            let name = obj.name_any();
            debug!(kind, name = %name, "Deleting Velero object");
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn ensure_backup(&self, name: &str) -> Result<()> {
        let mut backup = DynamicObject::new(name, &velero_resource("Backup")).within(OADP_NAMESPACE);
        backup
            .labels_mut()
            .insert(BACKUP_LABEL.to_string(), "true".to_string());
        backup.data = serde_json::json!({
            "spec": {
                "includedNamespaces": ["*"],
                "includeClusterResources": true,
                "labelSelector": { "matchLabels": { BACKUP_LABEL: "true" } }
            }
        });

        match self.api("Backup").create(&PostParams::default(), &backup).await {
            Ok(_) => {
                info!(backup = %name, "Created application backup");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(backup = %name, "Backup already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn check_backup(&self, name: &str) -> Result<()> {
        let backup = self.api("Backup").get(name).await?;
        match backup_outcome(&backup) {
            BackupOutcome::Completed => Ok(()),
            BackupOutcome::Failed(phase) => Err(Error::validation_for(
                "Backup",
                format!("backup {name} finished with phase {phase}"),
            )),
            BackupOutcome::Pending => Err(Error::internal_with_context(
                "backup",
                format!("backup {name} has not completed yet"),
            )),
        }
    }
}

#[async_trait]
impl BackupRestore for VeleroBackupRestore {
    async fn backup_application_data(&self, name: &str) -> Result<()> {
        self.ensure_backup(name).await?;
        retry_retryable(&self.poll, "wait for backup", || self.check_backup(name)).await
    }

    async fn cleanup_delete_backup_requests(&self) -> Result<()> {
        self.delete_labeled("DeleteBackupRequest").await
    }

    async fn cleanup_backups(&self) -> Result<()> {
        self.delete_labeled("Backup").await
    }

    async fn restore_pv_reclaim_policy(&self) -> Result<()> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let mut failures = 0usize;
        for pv in api.list(&ListParams::default()).await?.items {
            let Some(policy) = reclaim_policy_to_restore(&pv) else {
                continue;
            };
            let name = pv.name_any();
            let patch = serde_json::json!({
                "metadata": { "annotations": { ORIGINAL_RECLAIM_POLICY_ANNOTATION: null } },
                "spec": { "persistentVolumeReclaimPolicy": &policy }
            });
            match api
                .patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => info!(pv = %name, policy = %policy, "Restored reclaim policy"),
                Err(e) => {
                    warn!(pv = %name, error = %e, "Failed to restore reclaim policy");
                    failures += 1;
                }
            }
        }
        if failures > 0 {
            return Err(Error::internal_with_context(
                "backup",
                format!("failed to restore reclaim policy on {failures} persistent volumes"),
            ));
        }
        Ok(())
    }
}
