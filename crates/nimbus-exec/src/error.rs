use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    /// The command kept failing after every retry.
    #[error("command failed after {attempts} attempts: {cmd}: {stderr}")]
    ExecFailed {
        cmd: String,
        attempts: u32,
        stderr: String,
    },

    /// The run was cancelled between attempts.
    #[error("execution cancelled")]
    Cancelled,

    /// The container runtime itself could not be spawned.
    #[error("failed to spawn {cmd}: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExecError>;
