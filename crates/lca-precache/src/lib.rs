//! Background image precaching
//!
//! - [`workload`]: the pull loop with bounded concurrency
//! - [`task`]: the cancellable handle owning one worker
//! - [`puller`]: how a single image is pulled
//! - [`resources`]: files the flow leaves behind

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod puller;
pub mod resources;
pub mod task;
pub mod workload;

pub use config::{PrecacheConfig, PrecacheMode, DEFAULT_CONCURRENCY};
pub use error::PrecacheError;
pub use puller::{ImagePuller, PodmanPuller};
pub use resources::PrecacheResources;
pub use task::{CancelOutcome, PrecacheTask, TaskPoll, DEFAULT_CANCEL_GRACE};
pub use workload::{precache, PrecacheProgress, PrecacheSummary, ProgressSnapshot};
