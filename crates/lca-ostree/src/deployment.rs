//! Deployment records and removal planning
//!
//! Deployments are listed in on-disk order. Undeploying index `k` shifts
//! every later index down by one, so removals always run from the highest
//! index to the lowest.

use serde::Deserialize;

use lca_common::{Error, Result};

/// One bootable OS tree revision inside a stateroot
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct Deployment {
    /// Stateroot the deployment belongs to
    pub osname: String,
    /// Deployment ID, `<stateroot>-<checksum>.<serial>`
    pub id: String,
    /// True for the deployment the host is running
    #[serde(default)]
    pub booted: bool,
}

impl Deployment {
    /// Build a deployment record
    pub fn new(osname: impl Into<String>, id: impl Into<String>, booted: bool) -> Self {
        Self {
            osname: osname.into(),
            id: id.into(),
            booted,
        }
    }
}

/// Subset of `rpm-ostree status --json` output
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RpmOstreeStatus {
    /// Deployments in on-disk order
    #[serde(default)]
    pub deployments: Vec<Deployment>,
}

/// Parse `rpm-ostree status --json` output
pub fn parse_status(json: &[u8]) -> Result<Vec<Deployment>> {
    let status: RpmOstreeStatus = serde_json::from_slice(json)
        .map_err(|e| Error::serialization_for_kind("rpm-ostree status", e.to_string()))?;
    Ok(status.deployments)
}

/// ID of the booted deployment in an `rpm-ostree status --json` document
pub fn booted_deployment_id(json: &[u8]) -> Result<String> {
    parse_status(json)?
        .into_iter()
        .find(|d| d.booted)
        .map(|d| d.id)
        .ok_or(Error::NoBootedDeployment)
}

/// The stateroot of the booted deployment
pub fn booted_stateroot(deployments: &[Deployment]) -> Result<&str> {
    deployments
        .iter()
        .find(|d| d.booted)
        .map(|d| d.osname.as_str())
        .ok_or(Error::NoBootedDeployment)
}

/// ID of the first deployment in `osname`
pub fn deployment_id_for(deployments: &[Deployment], osname: &str) -> Result<String> {
    deployments
        .iter()
        .find(|d| d.osname == osname)
        .map(|d| d.id.clone())
        .ok_or_else(|| Error::query(format!("no deployment found for stateroot {osname}")))
}

/// Strip the stateroot prefix from a deployment ID.
///
/// `"rhcos-abc123.1"` becomes `"abc123.1"`. IDs without a `-` are rejected.
pub fn deployment_from_deployment_id(id: &str) -> Result<String> {
    match id.rsplit_once('-') {
        Some((_, deployment)) => Ok(deployment.to_string()),
        None => Err(Error::validation(format!(
            "failed to get deployment from deploymentID, there should be a '-' in deploymentID {id}"
        ))),
    }
}

/// Indices to undeploy so that only the booted stateroot remains.
///
/// Every deployment in the booted deployment's stateroot is kept. The
/// result is strictly descending.
pub fn compute_removal_order(deployments: &[Deployment]) -> Result<Vec<usize>> {
    let booted = booted_stateroot(deployments)?;

    let mut order = Vec::new();
    for (index, deployment) in deployments.iter().enumerate().rev() {
        if deployment.osname == booted {
            continue;
        }
        if deployment.booted {
            return Err(Error::BootedConflict {
                stateroot: deployment.osname.clone(),
                index,
            });
        }
        order.push(index);
    }
    Ok(order)
}

/// Indices of the deployments in `stateroot`, highest first.
///
/// Fails with `BootedConflict` if any of them is booted.
pub fn stateroot_removal_order(deployments: &[Deployment], stateroot: &str) -> Result<Vec<usize>> {
    let mut order = Vec::new();
    for (index, deployment) in deployments.iter().enumerate().rev() {
        if deployment.osname != stateroot {
            continue;
        }
        if deployment.booted {
            return Err(Error::BootedConflict {
                stateroot: stateroot.to_string(),
                index,
            });
        }
        order.push(index);
    }
    Ok(order)
}

/// Distinct unbooted stateroot names, last on disk first
pub fn stateroots_for_removal(deployments: &[Deployment]) -> Result<Vec<String>> {
    let booted = booted_stateroot(deployments)?;

    let mut names: Vec<String> = Vec::new();
    for deployment in deployments.iter().rev() {
        if deployment.osname != booted && !names.contains(&deployment.osname) {
            names.push(deployment.osname.clone());
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(osname: &str, booted: bool) -> Deployment {
        Deployment::new(osname, format!("{osname}-abc.0"), booted)
    }

    #[test]
    fn test_deployment_from_deployment_id() {
        assert_eq!(
            deployment_from_deployment_id("rhcos-abc123.1").expect("valid id"),
            "abc123.1"
        );
        assert_eq!(
            deployment_from_deployment_id("rhcos_4.16-x-def.0").expect("valid id"),
            "def.0"
        );
        assert!(deployment_from_deployment_id("abc123.1").is_err());
        assert!(deployment_from_deployment_id("").is_err());
    }

    /// Story: three deployments with the middle one booted. Only the
    /// outer two are removed, tail first.
    #[test]
    fn story_removal_skips_booted_and_runs_tail_first() {
        let deployments = vec![d("A", false), d("B", true), d("C", false)];
        assert_eq!(
            compute_removal_order(&deployments).expect("order"),
            vec![2, 0]
        );
        assert_eq!(
            stateroots_for_removal(&deployments).expect("stateroots"),
            vec!["C".to_string(), "A".to_string()]
        );
    }

    #[test]
    fn removal_order_keeps_every_deployment_of_booted_stateroot() {
        let deployments = vec![d("new", false), d("old", true), d("old", false)];
        assert_eq!(compute_removal_order(&deployments).expect("order"), vec![0]);
    }

    #[test]
    fn removal_order_is_strictly_descending_and_never_booted() {
        let layouts = [
            vec![d("a", true)],
            vec![d("a", false), d("a", false), d("b", true)],
            vec![d("b", true), d("a", false), d("c", false), d("a", false)],
            vec![d("x", false), d("y", false), d("z", false), d("y", true)],
        ];
        for deployments in layouts {
            let order = compute_removal_order(&deployments).expect("order");
            assert!(order.windows(2).all(|w| w[0] > w[1]), "{order:?}");
            assert!(order.iter().all(|&i| !deployments[i].booted));
        }
    }

    #[test]
    fn removal_order_refuses_without_booted_deployment() {
        let deployments = vec![d("A", false), d("B", false)];
        assert!(matches!(
            compute_removal_order(&deployments),
            Err(Error::NoBootedDeployment)
        ));
    }

    #[test]
    fn stateroot_order_rejects_booted_stateroot() {
        let deployments = vec![d("A", false), d("B", true), d("A", false)];
        assert_eq!(
            stateroot_removal_order(&deployments, "A").expect("order"),
            vec![2, 0]
        );
        match stateroot_removal_order(&deployments, "B") {
            Err(Error::BootedConflict { stateroot, index }) => {
                assert_eq!(stateroot, "B");
                assert_eq!(index, 1);
            }
            other => panic!("expected BootedConflict, got {other:?}"),
        }
    }

    #[test]
    fn parses_rpm_ostree_status() {
        let json = br#"{
            "deployments": [
                {"osname": "rhcos_4.16.0", "id": "rhcos_4.16.0-aaa.0", "booted": false, "version": "x"},
                {"osname": "rhcos", "id": "rhcos-bbb.1", "booted": true}
            ],
            "transaction": null
        }"#;
        let deployments = parse_status(json).expect("parse");
        assert_eq!(deployments.len(), 2);
        assert_eq!(booted_stateroot(&deployments).expect("booted"), "rhcos");
        assert_eq!(booted_deployment_id(json).expect("id"), "rhcos-bbb.1");
        assert_eq!(
            deployment_id_for(&deployments, "rhcos_4.16.0").expect("id"),
            "rhcos_4.16.0-aaa.0"
        );
    }

    #[test]
    fn booted_id_missing_is_an_error() {
        let json = br#"{"deployments": [{"osname": "a", "id": "a-1.0", "booted": false}]}"#;
        assert!(matches!(
            booted_deployment_id(json),
            Err(Error::NoBootedDeployment)
        ));
    }
}
