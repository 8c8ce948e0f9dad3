//! `nimbus delete cluster`

use clap::Args;
use nimbus_exec::LocalRunner;
use nimbus_pipeline::{DeleteOptions, DeletePipeline, PipelineError, StatusReporter};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Cluster name (defaults to the descriptor's metadata.name)
    #[arg(long)]
    pub name: Option<String>,

    /// Path to the cluster descriptor
    #[arg(long, default_value = "cluster.yaml")]
    pub descriptor: PathBuf,

    /// Bootstrap cluster kubeconfig
    #[arg(long)]
    pub kubeconfig: PathBuf,

    /// Workload cluster kubeconfig
    #[arg(long)]
    pub workload_kubeconfig: PathBuf,
}

pub async fn run(args: DeleteArgs) -> Result<(), PipelineError> {
    let pipeline = DeletePipeline::new(
        Arc::new(LocalRunner),
        StatusReporter::default(),
        DeleteOptions {
            name: args.name,
            descriptor_path: args.descriptor,
            kubeconfig_path: args.kubeconfig,
            workload_kubeconfig_path: args.workload_kubeconfig,
        },
    );
    pipeline.run().await
}
