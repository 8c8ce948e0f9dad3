//! Cluster lifecycle pipelines
//!
//! The create pipeline drives a descriptor to a self-managed workload
//! cluster through the bootstrap node; the delete pipeline walks the
//! ownership back and removes the cluster. Phase status is reported
//! through a pair-balanced start/end guard.

pub mod create;
pub mod delete;
pub mod error;
pub mod state;
pub mod status;

pub use create::{CreateOptions, CreatePipeline};
pub use delete::{DeleteOptions, DeletePipeline};
pub use error::{PipelineError, Result};
pub use state::PipelineState;
pub use status::{CollectingSink, LogSink, StatusReporter, StatusSink};
