//! Chart inventory
//!
//! Every chart the pipeline installs is declared here, in install
//! order. Charts flagged for GitOps reconciliation are still installed
//! eagerly on the workload cluster; Flux adopts them afterwards through
//! a HelmRelease pointing at the keos repository.

use crate::error::{ChartError, Result};
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct Chart {
    pub name: String,
    pub version: String,
    pub namespace: String,
    pub values_template: Option<String>,
    pub reconcile_by_gitops: bool,
}

impl Chart {
    fn new(name: &str, version: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            namespace: namespace.to_string(),
            values_template: None,
            reconcile_by_gitops: false,
        }
    }

    fn gitops(mut self) -> Self {
        self.reconcile_by_gitops = true;
        self
    }

    fn values(mut self, template: &str) -> Self {
        self.values_template = Some(template.to_string());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChartInventory {
    charts: Vec<Chart>,
}

/// Everything the inventory builder needs to know about the run.
#[derive(Debug, Clone)]
pub struct InventoryParams<'a> {
    pub capx_provider: &'a str,
    pub managed: bool,
    pub deploy_autoscaler: bool,
    pub eks_lb_controller: bool,
    pub cluster_operator_version: &'a str,
}

impl ChartInventory {
    /// Build the inventory for one cluster run.
    pub fn for_cluster(params: &InventoryParams<'_>) -> Self {
        let mut charts = vec![
            Chart::new("cert-manager", "v1.12.3", "cert-manager"),
            Chart::new(
                "cluster-operator",
                params.cluster_operator_version,
                "kube-system",
            )
            .values("cluster-operator-values.tmpl")
            .gitops(),
            Chart::new("tigera-operator", "v3.26.1", "tigera-operator").gitops(),
        ];

        match (params.capx_provider, params.managed) {
            // Managed control planes ship their own cloud controller.
            ("aws", false) => {
                charts.push(Chart::new("aws-cloud-controller-manager", "0.0.8", "kube-system"));
                charts.push(
                    Chart::new("aws-ebs-csi-driver", "2.20.0", "kube-system").gitops(),
                );
            }
            // EKS keeps the provider-native EBS CSI addon.
            ("aws", true) => {}
            ("azure", false) => {
                charts.push(Chart::new("cloud-provider-azure", "1.26.7", "kube-system"));
                charts.push(
                    Chart::new("azuredisk-csi-driver", "1.28.3", "kube-system").gitops(),
                );
            }
            ("azure", true) => {
                charts.push(
                    Chart::new("azuredisk-csi-driver", "1.28.3", "kube-system").gitops(),
                );
            }
            // GCP runs its controller in the control plane; the CSI
            // driver is applied from a manifest, not a chart.
            ("gcp", _) => {}
            _ => {}
        }

        // Machine-pool managed variants autoscale natively.
        if params.deploy_autoscaler && !params.managed {
            charts.push(Chart::new("cluster-autoscaler", "9.29.1", "kube-system").gitops());
        }

        if params.capx_provider == "aws" && params.managed && params.eks_lb_controller {
            charts.push(
                Chart::new("aws-load-balancer-controller", "1.6.0", "kube-system").gitops(),
            );
        }

        charts.push(Chart::new("flux2", "2.9.2", "kube-system"));

        Self { charts }
    }

    pub fn charts(&self) -> &[Chart] {
        &self.charts
    }

    pub fn get(&self, name: &str) -> Option<&Chart> {
        self.charts.iter().find(|c| c.name == name)
    }

    pub fn gitops_charts(&self) -> impl Iterator<Item = &Chart> {
        self.charts.iter().filter(|c| c.reconcile_by_gitops)
    }

    /// Pin a chart to a resolved version (catalog lookups happen after
    /// the inventory is built).
    pub fn set_version(&mut self, name: &str, version: &str) {
        if let Some(chart) = self.charts.iter_mut().find(|c| c.name == name) {
            chart.version = version.to_string();
        }
    }

    /// A chart may appear at most once per namespace.
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for chart in &self.charts {
            if !seen.insert((chart.name.clone(), chart.namespace.clone())) {
                return Err(ChartError::DuplicateChart {
                    name: chart.name.clone(),
                    namespace: chart.namespace.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(provider: &'static str, managed: bool) -> InventoryParams<'static> {
        InventoryParams {
            capx_provider: provider,
            managed,
            deploy_autoscaler: true,
            eks_lb_controller: false,
            cluster_operator_version: "0.2.0",
        }
    }

    #[test]
    fn test_inventory_is_unique_per_namespace() {
        for provider in ["aws", "gcp", "azure"] {
            for managed in [true, false] {
                let inventory = ChartInventory::for_cluster(&params(provider, managed));
                inventory.validate().unwrap();
            }
        }
    }

    #[test]
    fn test_unmanaged_aws_has_cloud_controller_and_csi() {
        let inventory = ChartInventory::for_cluster(&params("aws", false));
        assert!(inventory.get("aws-cloud-controller-manager").is_some());
        assert!(inventory.get("aws-ebs-csi-driver").is_some());
        assert!(inventory.get("cluster-autoscaler").is_some());
    }

    #[test]
    fn test_eks_skips_cloud_controller_and_ebs_chart() {
        let inventory = ChartInventory::for_cluster(&params("aws", true));
        assert!(inventory.get("aws-cloud-controller-manager").is_none());
        assert!(inventory.get("aws-ebs-csi-driver").is_none());
    }

    #[test]
    fn test_aks_skips_autoscaler() {
        let inventory = ChartInventory::for_cluster(&params("azure", true));
        assert!(inventory.get("cluster-autoscaler").is_none());
    }

    #[test]
    fn test_lb_controller_requires_flag() {
        let mut p = params("aws", true);
        assert!(ChartInventory::for_cluster(&p)
            .get("aws-load-balancer-controller")
            .is_none());
        p.eks_lb_controller = true;
        assert!(ChartInventory::for_cluster(&p)
            .get("aws-load-balancer-controller")
            .is_some());
    }

    #[test]
    fn test_gitops_charts_flagged() {
        let inventory = ChartInventory::for_cluster(&params("aws", false));
        let gitops: Vec<_> = inventory.gitops_charts().map(|c| c.name.as_str()).collect();
        assert!(gitops.contains(&"cluster-operator"));
        assert!(gitops.contains(&"tigera-operator"));
        assert!(!gitops.contains(&"cert-manager"));
    }
}
