//! ImageBasedUpgrade controller for the lifecycle agent
//!
//! This crate provides the Kubernetes controller for ImageBasedUpgrade CRs:
//! the stage state machine, the cleanup coordinator and the cluster-facing
//! collaborators they drive.
//!
//! Related crates:
//! - `lca-ostree`: stateroot and deployment management on the host
//! - `lca-precache`: the cancellable image precache worker

#![deny(missing_docs)]

pub mod backup;
pub mod cleanup;
pub mod client;
pub mod cluster_config;
pub mod config;
pub mod controller;
pub mod health;
pub mod phases;

#[cfg(test)]
mod testing;

pub use backup::{BackupRestore, VeleroBackupRestore};
pub use cleanup::{CleanupCoordinator, CleanupFailure, CleanupReport, CleanupStep};
pub use client::{KubeClient, KubeClientImpl};
pub use cluster_config::{ClusterConfigExporter, KubeClusterConfigExporter};
pub use config::{ControllerConfig, RequeueConfig};
pub use controller::{error_policy, reconcile, Context, ContextBuilder};
pub use health::{HealthCheck, KubeHealthCheck};

// Re-export common error types
pub use lca_common::{Error, Result};
