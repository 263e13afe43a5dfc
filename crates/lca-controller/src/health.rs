//! Cluster health gate used before finalizing

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, DynamicObject, GroupVersionKind, ListParams};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use lca_common::{Error, Result};

/// Checks whether the cluster has settled
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Ok if healthy, otherwise an error describing what is not ready yet
    async fn check(&self) -> Result<()>;
}

/// Returns true if the node's Ready condition is True
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

fn condition_status<'a>(obj: &'a DynamicObject, type_: &str) -> Option<&'a str> {
    obj.data
        .pointer("/status/conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(|t| t.as_str()) == Some(type_))?
        .get("status")?
        .as_str()
}

/// Why an operator-style object (ClusterOperator, ClusterVersion) is not
/// healthy, or `None` if it is Available and not Degraded
pub fn operator_unhealthy_reason(obj: &DynamicObject) -> Option<String> {
    let name = obj.name_any();
    if condition_status(obj, "Available") != Some("True") {
        return Some(format!("{name} is not available"));
    }
    if condition_status(obj, "Degraded") == Some("True") {
        return Some(format!("{name} is degraded"));
    }
    None
}

fn openshift_config_resource(kind: &str) -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("config.openshift.io", "v1", kind))
}

/// Health check reading nodes, ClusterVersion and ClusterOperators
pub struct KubeHealthCheck {
    client: Client,
}

impl KubeHealthCheck {
    /// Create a health check using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HealthCheck for KubeHealthCheck {
    async fn check(&self) -> Result<()> {
        let mut problems = Vec::new();

        let nodes: Api<Node> = Api::all(self.client.clone());
        for node in nodes.list(&ListParams::default()).await?.items {
            if !is_node_ready(&node) {
                problems.push(format!("node {} is not ready", node.name_any()));
            }
        }

        for kind in ["ClusterVersion", "ClusterOperator"] {
            let api: Api<DynamicObject> =
                Api::all_with(self.client.clone(), &openshift_config_resource(kind));
            for obj in api.list(&ListParams::default()).await?.items {
                if let Some(reason) = operator_unhealthy_reason(&obj) {
                    problems.push(format!("{kind} {reason}"));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::validation_for("cluster", problems.join(", ")))
        }
    }
}
