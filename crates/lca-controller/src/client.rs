//! Kubernetes access for the ImageBasedUpgrade resource

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;

#[cfg(test)]
use mockall::automock;

use lca_common::crd::{ImageBasedUpgrade, ImageBasedUpgradeStatus};
use lca_common::Error;

/// Field manager used for every write
pub const FIELD_MANAGER: &str = "lca-controller";

/// Status fields a reset clears; a merge patch only removes keys sent as null
const CLEARABLE_STATUS_FIELDS: &[&str] = &[
    "observedGeneration",
    "message",
    "previousStateroot",
    "targetStateroot",
];

/// Merge patch body replacing the whole status
///
/// Unset optional fields are sent as explicit nulls so values left over from
/// an earlier phase are removed on the server.
pub fn status_patch(status: &ImageBasedUpgradeStatus) -> Result<serde_json::Value, Error> {
    let mut body = serde_json::to_value(status)?;
    if let Some(fields) = body.as_object_mut() {
        for key in CLEARABLE_STATUS_FIELDS {
            fields
                .entry(key.to_string())
                .or_insert(serde_json::Value::Null);
        }
        fields
            .entry("conditions".to_string())
            .or_insert_with(|| serde_json::Value::Array(Vec::new()));
    }
    Ok(serde_json::json!({ "status": body }))
}

/// Trait abstracting Kubernetes client operations for ImageBasedUpgrade
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Replace the status of the named ImageBasedUpgrade
    async fn patch_status(&self, name: &str, status: &ImageBasedUpgradeStatus)
        -> Result<(), Error>;

    /// Remove an annotation from the named ImageBasedUpgrade
    async fn remove_annotation(&self, name: &str, key: &str) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn patch_status(
        &self,
        name: &str,
        status: &ImageBasedUpgradeStatus,
    ) -> Result<(), Error> {
        let api: Api<ImageBasedUpgrade> = Api::all(self.client.clone());
        let patch = status_patch(status)?;
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn remove_annotation(&self, name: &str, key: &str) -> Result<(), Error> {
        let api: Api<ImageBasedUpgrade> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "metadata": { "annotations": { key: serde_json::Value::Null } }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lca_common::crd::UpgradePhase;
    use serde_json::{json, Value};

    /// JSON merge patch as the API server applies it
    fn merge(target: &mut Value, patch: &Value) {
        match (target.as_object_mut(), patch.as_object()) {
            (Some(target), Some(patch)) => {
                for (key, value) in patch {
                    if value.is_null() {
                        target.remove(key);
                    } else {
                        merge(target.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
            _ => *target = patch.clone(),
        }
    }

    /// Story: resetting to Idle clears the message and stateroots an aborted
    /// upgrade left on the server.
    #[test]
    fn story_idle_reset_clears_leftover_status_fields() {
        let dirty = ImageBasedUpgradeStatus {
            previous_stateroot: Some("rhcos".to_string()),
            target_stateroot: Some("rhcos_4.16.1".to_string()),
            ..ImageBasedUpgradeStatus::with_phase(UpgradePhase::Aborting)
                .message("Prep requested while Aborting is still running")
        };
        let mut object = json!({ "status": dirty });

        merge(
            &mut object,
            &status_patch(&ImageBasedUpgradeStatus::idle(Some(2))).expect("patch"),
        );

        let after: ImageBasedUpgradeStatus =
            serde_json::from_value(object["status"].clone()).expect("status");
        assert_eq!(after.phase, UpgradePhase::Idle);
        assert_eq!(after.message, None);
        assert_eq!(after.previous_stateroot, None);
        assert_eq!(after.target_stateroot, None);
        assert_eq!(after.observed_generation, Some(2));
        assert_eq!(after.conditions.len(), 1);
    }

    #[test]
    fn set_fields_are_sent_as_is() {
        let status = ImageBasedUpgradeStatus::with_phase(UpgradePhase::Prep).message("pulling");
        let patch = status_patch(&status).expect("patch");
        assert_eq!(patch["status"]["message"], "pulling");
        assert_eq!(patch["status"]["phase"], "Prep");
        assert!(patch["status"]["targetStateroot"].is_null());
    }
}
