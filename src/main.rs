// Main binary: the nimbus cluster provisioner CLI.
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

use std::io::stderr;

mod cmd;
use cmd::create::CreateArgs;
use cmd::delete::DeleteArgs;

#[derive(Parser, Debug)]
#[command(author, version, about = "Provision KEOS workload clusters on AWS, GCP and Azure", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output - shows more detailed logs
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a workload cluster
    Create {
        #[command(subcommand)]
        resource: CreateResource,
    },
    /// Delete a workload cluster
    Delete {
        #[command(subcommand)]
        resource: DeleteResource,
    },
}

#[derive(Subcommand, Debug)]
enum CreateResource {
    /// Create the cluster described by the descriptor
    Cluster(CreateArgs),
}

#[derive(Subcommand, Debug)]
enum DeleteResource {
    /// Delete the cluster, pivoting management back first if needed
    Cluster(DeleteArgs),
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let directives = format!(
        "nimbus={level},nimbus_pipeline={level},nimbus_provider={level},nimbus_charts={level},nimbus_crossplane={level},hyper=warn,reqwest=warn,rustls=warn"
    );
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));
    registry()
        .with(filter)
        .with(fmt::layer().with_writer(stderr))
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            std::process::exit(2);
        }
    };

    let result = runtime.block_on(async {
        match cli.command {
            Commands::Create { resource: CreateResource::Cluster(args) } => {
                cmd::create::run(args).await
            }
            Commands::Delete { resource: DeleteResource::Cluster(args) } => {
                cmd::delete::run(args).await
            }
        }
    });

    if let Err(e) = result {
        error!("{e:#}");
        eprintln!("Error: {e}");
        std::process::exit(e.exit_code());
    }
}
