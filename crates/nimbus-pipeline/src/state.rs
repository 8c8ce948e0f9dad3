//! Pipeline state
//!
//! A monotone phase counter plus the values phases hand forward.
//! Phases never run out of order and never re-run inside one
//! invocation; failure aborts the pipeline with the phase name.

#[derive(Debug, Default)]
pub struct PipelineState {
    completed: Vec<&'static str>,
    /// Workload kubeconfig path on the bootstrap node, once fetched.
    pub kubeconfig: Option<String>,
    /// Rendered cluster manifest path on the bootstrap node.
    pub manifest_path: Option<String>,
    /// Cluster-operator values file path on the bootstrap node.
    pub operator_values_path: Option<String>,
    /// EKS OIDC provider id, once discovered from the Cluster object.
    pub oidc_provider_id: Option<String>,
    /// Selected cluster-operator chart version.
    pub operator_version: Option<String>,
}

impl PipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a phase as completed. Phases are strictly ordered, so
    /// completing the same phase twice is a programming error.
    pub fn complete(&mut self, phase: &'static str) {
        debug_assert!(
            !self.completed.contains(&phase),
            "phase {phase} completed twice"
        );
        self.completed.push(phase);
    }

    pub fn completed(&self) -> &[&'static str] {
        &self.completed
    }

    pub fn phase_index(&self) -> usize {
        self.completed.len()
    }
}
