//! `nimbus create cluster`

use clap::Args;
use nimbus_common::descriptor::KeosCluster;
use nimbus_exec::DockerNode;
use nimbus_pipeline::{CreateOptions, CreatePipeline, PipelineError, StatusReporter};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Path to the cluster descriptor
    #[arg(long, default_value = "cluster.yaml")]
    pub descriptor: PathBuf,

    /// Vault passphrase for the secrets file
    #[arg(long)]
    pub vault_password: String,

    /// Path to the encrypted secrets file
    #[arg(long, default_value = "secrets.yml")]
    pub secrets: PathBuf,

    /// Generate manifests but do not create the cluster
    #[arg(long, default_value_t = false)]
    pub avoid_creation: bool,

    /// Keep the management objects on the bootstrap cluster
    #[arg(long, default_value_t = false)]
    pub keep_mgmt: bool,

    /// Bootstrap node container name (defaults to <name>-control-plane)
    #[arg(long)]
    pub node: Option<String>,
}

pub async fn run(args: CreateArgs) -> Result<(), PipelineError> {
    // The pipeline re-reads and validates; this early read only names
    // the bootstrap container.
    let cluster = KeosCluster::load(&args.descriptor)?;
    let node_name = args
        .node
        .unwrap_or_else(|| format!("{}-control-plane", cluster.metadata.name));
    info!(node = %node_name, cluster = %cluster.metadata.name, "starting create pipeline");

    let mut options = CreateOptions::new(args.descriptor, args.vault_password);
    options.secrets_path = args.secrets;
    options.avoid_creation = args.avoid_creation;
    options.keep_mgmt = args.keep_mgmt;

    let pipeline = CreatePipeline::new(
        Arc::new(DockerNode::new(node_name)),
        StatusReporter::default(),
        options,
    );
    let state = pipeline.run().await?;
    info!(phases = state.phase_index(), "create pipeline finished");
    Ok(())
}
