//! Delete pipeline
//!
//! Finds the Cluster object wherever it lives. If management already
//! pivoted to the workload cluster, the objects are moved back to the
//! bootstrap cluster first, then deleted there, and finally the
//! bootstrap node and kubeconfig entry are removed.

use crate::error::{PipelineError, Result};
use crate::status::StatusReporter;
use nimbus_common::descriptor::KeosCluster;
use nimbus_exec::{ExecOpts, NodeRunner};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone)]
pub struct DeleteOptions {
    /// Cluster name; overrides the descriptor's when set.
    pub name: Option<String>,
    pub descriptor_path: PathBuf,
    /// Bootstrap cluster kubeconfig.
    pub kubeconfig_path: PathBuf,
    /// Workload cluster kubeconfig.
    pub workload_kubeconfig_path: PathBuf,
}

pub struct DeletePipeline {
    runner: Arc<dyn NodeRunner>,
    status: StatusReporter,
    options: DeleteOptions,
}

const P_FIND_LOCAL: &str = "Finding cluster object in local cluster";
const P_FIND_WORKLOAD: &str = "Finding cluster object in workload cluster";
const P_MOVE_BACK: &str = "Moving cluster object back to local cluster";
const P_DELETE: &str = "Deleting cluster";

impl DeletePipeline {
    pub fn new(
        runner: Arc<dyn NodeRunner>,
        status: StatusReporter,
        options: DeleteOptions,
    ) -> Self {
        Self {
            runner,
            status,
            options,
        }
    }

    fn check_kubeconfig(path: &Path) -> Result<String> {
        if !path.exists() {
            return Err(PipelineError::Config(format!(
                "kubeconfig {} does not exist",
                path.display()
            )));
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("{}: {e}", path.display())))?;
        let parsed: std::result::Result<serde_yaml::Value, _> = serde_yaml::from_str(&raw);
        match parsed {
            Ok(value) if value.get("clusters").is_some() => Ok(path.display().to_string()),
            Ok(_) => Err(PipelineError::Config(format!(
                "{} is not a kubeconfig",
                path.display()
            ))),
            Err(e) => Err(PipelineError::Config(format!("{}: {e}", path.display()))),
        }
    }

    async fn cluster_exists(&self, kubeconfig: &str, ns: &str, name: &str) -> bool {
        self.runner
            .exec(
                &format!("kubectl --kubeconfig {kubeconfig} -n {ns} get cluster {name}"),
                ExecOpts::retries(1, 0),
            )
            .await
            .is_ok()
    }

    pub async fn run(&self) -> Result<()> {
        let cluster = KeosCluster::load(&self.options.descriptor_path)?;
        let name = self
            .options
            .name
            .clone()
            .unwrap_or_else(|| cluster.metadata.name.clone());
        let ns = format!("cluster-{name}");

        let bootstrap = Self::check_kubeconfig(&self.options.kubeconfig_path)?;

        let guard = self.status.start(P_FIND_LOCAL);
        let in_bootstrap = self.cluster_exists(&bootstrap, &ns, &name).await;
        guard.succeed();

        if !in_bootstrap {
            let guard = self.status.start(P_FIND_WORKLOAD);
            let workload = Self::check_kubeconfig(&self.options.workload_kubeconfig_path)?;
            if !self.cluster_exists(&workload, &ns, &name).await {
                return Err(PipelineError::ClusterNotFound(name));
            }
            guard.succeed();

            let guard = self.status.start(P_MOVE_BACK);
            self.runner
                .exec(
                    &format!(
                        "clusterctl move --kubeconfig {workload} --to-kubeconfig {bootstrap} --namespace {ns}"
                    ),
                    ExecOpts::default(),
                )
                .await
                .map_err(|e| PipelineError::PivotFailed(e.to_string()))?;
            guard.succeed();
        }

        let guard = self.status.start(P_DELETE);
        self.runner
            .exec(
                &format!("kubectl delete cluster --namespace {ns} {name} --kubeconfig {bootstrap}"),
                ExecOpts::default(),
            )
            .await
            .map_err(|e| PipelineError::exec(P_DELETE, e))?;

        // Drop the bootstrap node and its kubeconfig entry.
        self.runner
            .exec(
                &format!("docker rm -f {name}-control-plane"),
                ExecOpts::default(),
            )
            .await
            .map_err(|e| PipelineError::exec(P_DELETE, e))?;
        let _ = self
            .runner
            .exec(
                &format!("kubectl config delete-context kind-{name} --kubeconfig {bootstrap}"),
                ExecOpts::retries(1, 0),
            )
            .await;
        guard.succeed();
        info!(cluster = %name, "cluster deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{CollectingSink, StatusReporter};
    use nimbus_exec::ScriptedRunner;
    use std::io::Write;

    const DESCRIPTOR: &str = r#"
apiVersion: installer.keos.stratio.com/v1beta1
kind: KeosCluster
metadata:
  name: demo
spec:
  infra_provider: aws
  k8s_version: v1.26.8
  region: eu-west-1
  docker_registries:
    - url: registry.example.com/keos
      keos_registry: true
  control_plane:
    managed: true
  worker_nodes:
    - name: workers
      quantity: 3
      size: t3.large
"#;

    const KUBECONFIG: &str = "apiVersion: v1\nkind: Config\nclusters: []\n";

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    fn options(dir: &tempfile::TempDir) -> DeleteOptions {
        DeleteOptions {
            name: None,
            descriptor_path: write_file(dir, "cluster.yaml", DESCRIPTOR),
            kubeconfig_path: write_file(dir, "bootstrap.kubeconfig", KUBECONFIG),
            workload_kubeconfig_path: write_file(dir, "workload.kubeconfig", KUBECONFIG),
        }
    }

    #[tokio::test]
    async fn test_delete_when_object_is_local() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let pipeline = DeletePipeline::new(
            runner.clone(),
            StatusReporter::new(std::sync::Arc::new(CollectingSink::new())),
            options(&dir),
        );
        pipeline.run().await.unwrap();
        assert!(runner.saw("kubectl delete cluster --namespace cluster-demo demo"));
        assert!(!runner.saw("clusterctl move"));
        assert!(runner.saw("docker rm -f demo-control-plane"));
    }

    #[tokio::test]
    async fn test_delete_moves_back_from_workload() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(&dir);
        let bootstrap = opts.kubeconfig_path.display().to_string();
        let runner = Arc::new(
            ScriptedRunner::new()
                .fail_on(
                    format!("--kubeconfig {bootstrap} -n cluster-demo get cluster"),
                    "NotFound",
                )
                .respond("clusterctl move", ""),
        );
        let pipeline = DeletePipeline::new(
            runner.clone(),
            StatusReporter::new(std::sync::Arc::new(CollectingSink::new())),
            opts,
        );
        pipeline.run().await.unwrap();
        assert!(runner.saw("clusterctl move"));
        assert!(runner.saw("kubectl delete cluster --namespace cluster-demo demo"));
    }

    #[tokio::test]
    async fn test_cluster_not_found_anywhere() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new().fail_on("get cluster demo", "NotFound"));
        let pipeline = DeletePipeline::new(
            runner,
            StatusReporter::new(std::sync::Arc::new(CollectingSink::new())),
            options(&dir),
        );
        let err = pipeline.run().await.unwrap_err();
        assert!(matches!(err, PipelineError::ClusterNotFound(_)));
    }

    #[tokio::test]
    async fn test_bad_kubeconfig_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(&dir);
        opts.kubeconfig_path = write_file(&dir, "garbage.kubeconfig", "][ not yaml");
        let pipeline = DeletePipeline::new(
            Arc::new(ScriptedRunner::new()),
            StatusReporter::new(std::sync::Arc::new(CollectingSink::new())),
            opts,
        );
        let err = pipeline.run().await.unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }
}
