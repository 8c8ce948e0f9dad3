//! Helm driver
//!
//! Eager chart installs run `helm` on the bootstrap node; charts are
//! pulled once into `/stratio/helm/<chart>` and installed from there.

use crate::error::Result;
use crate::inventory::Chart;
use crate::repo::HelmRegistry;
use nimbus_exec::{ExecOpts, NodeRunner};
use tracing::info;

pub const CHART_DIR: &str = "/stratio/helm";

/// Authenticate helm against the keos repository.
pub async fn login(node: &dyn NodeRunner, registry: &HelmRegistry) -> Result<()> {
    let cmd = if registry.is_oci() {
        let host = registry.stripped().split('/').next().unwrap_or_default();
        format!(
            "helm registry login {host} --username '{}' --password '{}'",
            registry.user, registry.pass
        )
    } else {
        let mut cmd = format!("helm repo add keos {}", registry.url);
        if !registry.user.is_empty() {
            cmd.push_str(&format!(
                " --username '{}' --password '{}'",
                registry.user, registry.pass
            ));
        }
        cmd
    };
    node.exec(&cmd, ExecOpts::default()).await?;
    Ok(())
}

/// Pull every chart into the node-local chart directory.
pub async fn pull_charts(
    node: &dyn NodeRunner,
    registry: &HelmRegistry,
    charts: &[&Chart],
) -> Result<()> {
    node.exec(&format!("mkdir -p {CHART_DIR}"), ExecOpts::default())
        .await?;
    for chart in charts {
        let source = if registry.is_oci() {
            format!("oci://{}/{}", registry.stripped(), chart.name)
        } else {
            format!("keos/{}", chart.name)
        };
        let cmd = format!(
            "helm pull {source} --version {} --untar --untardir {CHART_DIR}",
            chart.version
        );
        node.exec(&cmd, ExecOpts::default()).await?;
        info!(chart = %chart.name, version = %chart.version, "chart pulled");
    }
    Ok(())
}

/// One eager helm install.
#[derive(Debug, Default)]
pub struct InstallSpec {
    pub release: String,
    pub chart: String,
    pub namespace: String,
    pub kubeconfig: Option<String>,
    pub values_file: Option<String>,
    pub create_namespace: bool,
    pub sets: Vec<(String, String)>,
}

impl InstallSpec {
    pub fn new(release: &str, chart: &str, namespace: &str) -> Self {
        Self {
            release: release.to_string(),
            chart: chart.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        }
    }

    pub fn kubeconfig(mut self, path: &str) -> Self {
        self.kubeconfig = Some(path.to_string());
        self
    }

    pub fn values(mut self, path: &str) -> Self {
        self.values_file = Some(path.to_string());
        self
    }

    pub fn create_namespace(mut self) -> Self {
        self.create_namespace = true;
        self
    }

    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.sets.push((key.to_string(), value.to_string()));
        self
    }

    pub fn command(&self) -> String {
        let mut cmd = format!(
            "helm install {} {CHART_DIR}/{} --namespace {}",
            self.release, self.chart, self.namespace
        );
        if self.create_namespace {
            cmd.push_str(" --create-namespace");
        }
        if let Some(values) = &self.values_file {
            cmd.push_str(&format!(" --values {values}"));
        }
        for (key, value) in &self.sets {
            cmd.push_str(&format!(" --set {key}={value}"));
        }
        if let Some(kubeconfig) = &self.kubeconfig {
            cmd.push_str(&format!(" --kubeconfig {kubeconfig}"));
        }
        cmd
    }
}

pub async fn install(node: &dyn NodeRunner, spec: &InstallSpec) -> Result<()> {
    node.exec(&spec.command(), ExecOpts::default()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_exec::ScriptedRunner;

    #[test]
    fn test_install_command_shape() {
        let cmd = InstallSpec::new("cert-manager", "cert-manager", "cert-manager")
            .create_namespace()
            .set("installCRDs", "true")
            .kubeconfig("/kind/worker-cluster.kubeconfig")
            .command();
        assert_eq!(
            cmd,
            "helm install cert-manager /stratio/helm/cert-manager --namespace cert-manager \
             --create-namespace --set installCRDs=true --kubeconfig /kind/worker-cluster.kubeconfig"
        );
    }

    #[tokio::test]
    async fn test_oci_login_targets_host() {
        let runner = ScriptedRunner::new();
        let registry = HelmRegistry {
            url: "oci://registry.example.com/keos/charts".to_string(),
            user: "keos".to_string(),
            pass: "pw".to_string(),
        };
        login(&runner, &registry).await.unwrap();
        assert!(runner.saw("helm registry login registry.example.com"));
    }

    #[tokio::test]
    async fn test_classic_login_adds_repo() {
        let runner = ScriptedRunner::new();
        let registry = HelmRegistry {
            url: "https://charts.example.com/keos".to_string(),
            user: String::new(),
            pass: String::new(),
        };
        login(&runner, &registry).await.unwrap();
        assert!(runner.saw("helm repo add keos https://charts.example.com/keos"));
    }

    #[tokio::test]
    async fn test_pull_charts_untars_into_chart_dir() {
        let runner = ScriptedRunner::new();
        let registry = HelmRegistry {
            url: "oci://registry.example.com/keos/charts".to_string(),
            user: String::new(),
            pass: String::new(),
        };
        let chart = crate::inventory::ChartInventory::for_cluster(
            &crate::inventory::InventoryParams {
                capx_provider: "aws",
                managed: false,
                deploy_autoscaler: true,
                eks_lb_controller: false,
                cluster_operator_version: "0.2.0",
            },
        );
        let charts: Vec<_> = chart.charts().iter().collect();
        pull_charts(&runner, &registry, &charts).await.unwrap();
        assert!(runner.saw("helm pull oci://registry.example.com/keos/charts/cert-manager"));
        assert!(runner.saw("--untar --untardir /stratio/helm"));
    }
}
