//! Provider capability layer
//!
//! One capability set, three realizations. The pipeline talks to a
//! `Provider` trait object and never branches on the provider name
//! itself; managed versus unmanaged is a flag on the view, not a
//! separate type. Views are built per run and discarded.

pub mod aws;
pub mod azure;
pub mod cloud;
pub mod error;
pub mod gcp;
pub mod kube;
pub mod storage;

pub use error::{ProviderError, Result};

use async_trait::async_trait;
use nimbus_common::descriptor::{ClusterConfig, KeosCluster, Networks};
use nimbus_exec::NodeRunner;
use nimbus_render::Renderer;
use nimbus_vault::{CloudCreds, CredentialsBundle};
use std::collections::BTreeMap;
use std::sync::Arc;

/// The runtime projection of a provider choice.
#[derive(Debug, Clone)]
pub struct ProviderView {
    /// Cluster-API infrastructure provider: aws, gcp or azure.
    pub capx_provider: &'static str,
    /// Controller shorthand: capa, capg or capz.
    pub capx_name: &'static str,
    pub capx_version: &'static str,
    /// Image tag, which may trail the chart version on patched builds.
    pub capx_image_version: &'static str,
    pub managed: bool,
    /// Ordered KEY=VALUE pairs exported to clusterctl and clusterawsadm.
    pub capx_env_vars: Vec<String>,
    pub sc_provisioner: &'static str,
    pub sc_parameters: BTreeMap<String, String>,
    pub csi_namespace: &'static str,
}

impl ProviderView {
    pub fn capx_namespace(&self) -> String {
        format!("{}-system", self.capx_name)
    }
}

/// Whether installs pull from the keos registry instead of upstream.
#[derive(Debug, Clone, Default)]
pub struct PrivateParams {
    pub private: bool,
    pub keos_reg_url: String,
}

/// The uniform capability set every cloud realizes.
#[async_trait]
pub trait Provider: Send + Sync {
    fn view(&self) -> &ProviderView;

    /// Install the external cloud-controller-manager. No-op on GCP.
    async fn install_cloud_provider(
        &self,
        node: &dyn NodeRunner,
        kubeconfig: &str,
        private: &PrivateParams,
        cluster: &KeosCluster,
    ) -> Result<()>;

    /// Install the provider CSI driver into the workload cluster.
    async fn install_csi(
        &self,
        node: &dyn NodeRunner,
        kubeconfig: &str,
        private: &PrivateParams,
    ) -> Result<()>;

    /// Apply the default StorageClass, stripping any pre-existing
    /// default on managed control planes first.
    async fn configure_storage_class(&self, node: &dyn NodeRunner, kubeconfig: &str)
        -> Result<()>;

    /// True iff every listed subnet is private. Zero subnets is public.
    async fn internal_nginx(&self, networks: &Networks) -> Result<bool>;

    /// Exchange cloud credentials for registry credentials; non-cloud
    /// registries answer with the keos registry user and password.
    async fn registry_credentials(&self, url: &str) -> Result<(String, String)>;

    /// Files pinning the ingress flavour and PVC sizing for the KEOS
    /// installer, keyed by file name.
    async fn override_vars(
        &self,
        networks: &Networks,
        cluster_config: Option<&ClusterConfig>,
    ) -> Result<BTreeMap<String, Vec<u8>>>;

    /// Provider polish after the pivot: CoreDNS PDB, eviction
    /// annotations on managed variants.
    async fn post_install(&self, node: &dyn NodeRunner, kubeconfig: &str) -> Result<()>;

    /// Crossplane packages for the enabled add-ons. Always includes the
    /// provider family package.
    fn crossplane_providers(&self, addons: &[String]) -> BTreeMap<String, String>;

    /// The add-ons this provider drives through Crossplane.
    fn addons(&self, hosted_zones: bool) -> Vec<String>;

    /// Credentials-file content for a Crossplane ProviderConfig plus
    /// whether a dedicated add-on credential was found.
    fn provider_config_content(&self, addon: &str) -> Result<(String, bool)>;

    /// Ordered CR manifests for the add-on and the composites the
    /// pipeline must wait on, keyed by kind.
    async fn crossplane_cr_manifests(
        &self,
        cluster: &KeosCluster,
        addon: &str,
        custom: &BTreeMap<String, String>,
    ) -> Result<(Vec<String>, BTreeMap<String, String>)>;

    /// IAM prerequisites before cluster creation (AWS CloudFormation
    /// stack). Default: nothing to do.
    async fn ensure_iam(&self, _node: &dyn NodeRunner, _cluster: &KeosCluster) -> Result<()> {
        Ok(())
    }

    /// Identity fixups after node readiness (AKS kubelet identity).
    /// Default: nothing to do.
    async fn apply_nodes_identity(&self, _cluster: &KeosCluster) -> Result<()> {
        Ok(())
    }

    /// Provider load-balancer controller, where one exists (AWS).
    /// Default: nothing to do.
    async fn install_lb_controller(
        &self,
        _node: &dyn NodeRunner,
        _kubeconfig: &str,
        _private: &PrivateParams,
    ) -> Result<()> {
        Ok(())
    }
}

/// Build the provider realization the descriptor asks for.
pub fn build_provider(
    cluster: &KeosCluster,
    bundle: Arc<CredentialsBundle>,
    renderer: Arc<Renderer>,
) -> Result<Box<dyn Provider>> {
    let managed = cluster.spec.control_plane.managed;
    match &bundle.provider {
        CloudCreds::Aws(_) => Ok(Box::new(aws::AwsProvider::new(
            cluster, bundle, renderer, managed,
        )?)),
        CloudCreds::Gcp(_) => Ok(Box::new(gcp::GcpProvider::new(
            cluster, bundle, renderer, managed,
        )?)),
        CloudCreds::Azure(_) => Ok(Box::new(azure::AzureProvider::new(
            cluster, bundle, renderer, managed,
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_common::KeosCluster;

    pub(crate) const AWS_EKS: &str = r#"
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

    pub(crate) fn aws_bundle() -> Arc<CredentialsBundle> {
        Arc::new(CredentialsBundle {
            provider: CloudCreds::Aws(nimbus_common::AwsCredentials {
                access_key: "AKIA".to_string(),
                secret_key: "SECRET".to_string(),
                account: "123456789012".to_string(),
                region: None,
            }),
            github_token: None,
            keos_registry: nimbus_common::RegistryCredentials {
                url: "registry.example.com/keos".to_string(),
                user: "keos".to_string(),
                pass: "pass".to_string(),
            },
            docker_registries: vec![],
            crossplane: None,
            external_dns: None,
        })
    }

    #[test]
    fn test_build_provider_follows_credentials() {
        let cluster = KeosCluster::from_yaml(AWS_EKS).unwrap();
        let provider =
            build_provider(&cluster, aws_bundle(), Arc::new(Renderer::new())).unwrap();
        assert_eq!(provider.view().capx_name, "capa");
        assert!(provider.view().managed);
        assert_eq!(provider.view().capx_namespace(), "capa-system");
    }
}
