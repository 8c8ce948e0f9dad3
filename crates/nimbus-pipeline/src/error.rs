use thiserror::Error;

/// Pipeline failures carry the phase they happened in; the CLI maps
/// them onto its exit codes.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("descriptor: {0}")]
    Descriptor(#[from] nimbus_common::CommonError),

    #[error("secrets: {0}")]
    Vault(#[from] nimbus_vault::VaultError),

    #[error("phase {phase}: {source}")]
    Exec {
        phase: &'static str,
        #[source]
        source: nimbus_exec::ExecError,
    },

    #[error("phase {phase}: timed out waiting for {resource}")]
    Timeout {
        phase: &'static str,
        resource: String,
    },

    #[error("phase {phase}: {source}")]
    Provider {
        phase: &'static str,
        #[source]
        source: nimbus_provider::ProviderError,
    },

    #[error("phase {phase}: {source}")]
    Chart {
        phase: &'static str,
        #[source]
        source: nimbus_charts::ChartError,
    },

    #[error("phase {phase}: {source}")]
    Crossplane {
        phase: &'static str,
        #[source]
        source: nimbus_crossplane::CrossplaneError,
    },

    #[error("phase {phase}: {source}")]
    Render {
        phase: &'static str,
        #[source]
        source: nimbus_render::RenderError,
    },

    /// `clusterctl move` did not complete; both clusters may hold
    /// partial object sets and need manual reconciliation.
    #[error("pivot failed: {0}")]
    PivotFailed(String),

    /// Delete path: the Cluster object exists in neither cluster.
    #[error("cluster {0} not found in bootstrap or workload cluster")]
    ClusterNotFound(String),

    /// Delete path: a kubeconfig could not be read or parsed.
    #[error("kubeconfig error: {0}")]
    Config(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    /// CLI exit code: 1 validation, 2 provider, 3 timeout, 4 pivot.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Descriptor(_) | PipelineError::Vault(_) => 1,
            PipelineError::Timeout { .. } => 3,
            PipelineError::PivotFailed(_) => 4,
            _ => 2,
        }
    }

    pub(crate) fn exec(phase: &'static str, source: nimbus_exec::ExecError) -> Self {
        PipelineError::Exec { phase, source }
    }

    pub(crate) fn provider(phase: &'static str, source: nimbus_provider::ProviderError) -> Self {
        PipelineError::Provider { phase, source }
    }

    pub(crate) fn render(phase: &'static str, source: nimbus_render::RenderError) -> Self {
        PipelineError::Render { phase, source }
    }

    pub(crate) fn chart(phase: &'static str, source: nimbus_charts::ChartError) -> Self {
        PipelineError::Chart { phase, source }
    }

    pub(crate) fn io(path: &str, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let validation = PipelineError::Descriptor(nimbus_common::CommonError::ValidationFailed(
            vec!["field".into()],
        ));
        assert_eq!(validation.exit_code(), 1);

        let timeout = PipelineError::Timeout {
            phase: "Waiting for the worker nodes",
            resource: "md".into(),
        };
        assert_eq!(timeout.exit_code(), 3);

        let pivot = PipelineError::PivotFailed("move interrupted".into());
        assert_eq!(pivot.exit_code(), 4);

        let provider = PipelineError::Provider {
            phase: "Installing StorageClass",
            source: nimbus_provider::ProviderError::Api("boom".into()),
        };
        assert_eq!(provider.exit_code(), 2);
    }

    #[test]
    fn test_error_carries_phase_name() {
        let err = PipelineError::Timeout {
            phase: "Creating the workload cluster",
            resource: "cluster/demo ControlPlaneInitialized".into(),
        };
        assert!(err.to_string().contains("Creating the workload cluster"));
        assert!(err.to_string().contains("ControlPlaneInitialized"));
    }
}
