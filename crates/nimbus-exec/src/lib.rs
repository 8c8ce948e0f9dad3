//! Bootstrap node command execution
//!
//! A thin, retrying wrapper over `docker exec` against the bootstrap
//! container, plus a scripted fake used by pipeline tests.

pub mod error;
pub mod runner;

pub use error::{ExecError, Result};
pub use runner::{CancelFlag, DockerNode, ExecOpts, LocalRunner, NodeRunner, ScriptedRunner};
