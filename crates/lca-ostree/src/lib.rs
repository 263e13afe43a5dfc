//! Stateroot and deployment management for ostree based hosts
//!
//! - [`deployment`]: deployment records and removal planning
//! - [`client`]: seams for rpm-ostree, ostree and privileged host commands
//! - [`ops`]: the command-backed host implementation
//! - [`stateroot`]: removal of unbooted stateroots
//! - [`setup`]: building a stateroot from a seed image

#![deny(missing_docs)]

pub mod client;
pub mod deployment;
pub mod ops;
pub mod setup;
pub mod stateroot;

pub use client::{DeploymentQuery, HostOps, OstreeCli, OstreeClient, RpmOstreeCli};
pub use deployment::{
    booted_stateroot, compute_removal_order, deployment_from_deployment_id,
    stateroots_for_removal, Deployment,
};
pub use ops::{CommandHostOps, HostMode};
pub use setup::{read_precaching_list, registry_override, SeedStaterootRequest};
pub use stateroot::{StaterootManager, StaterootPaths};
