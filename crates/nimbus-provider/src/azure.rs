//! Azure realization of the provider capability set
//!
//! Covers AzureCluster (kubeadm on VMs) and the AKS variant. AKS still
//! needs the kubelet-identity workaround after node readiness: the
//! provider cannot set it, so the management API is patched directly.

use crate::cloud::azure_api::{acr_service, AzureApi};
use crate::error::{ProviderError, Result};
use crate::kube::{ensure_coredns_pdb, evict_annotation_patch, patch_deploy};
use crate::storage::{self, StorageClassManifest};
use crate::{Provider, PrivateParams, ProviderView};
use async_trait::async_trait;
use minijinja::context;
use nimbus_common::descriptor::{AzureCredentials, ClusterConfig, KeosCluster, Networks};
use nimbus_exec::{ExecOpts, NodeRunner};
use nimbus_render::Renderer;
use nimbus_vault::{CloudCreds, CredentialsBundle};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

const CAPZ_VERSION: &str = "v1.11.4";
const CROSSPLANE_AZURE_VERSION: &str = "v1.5.0";
const ADDONS: &[&str] = &["external-dns"];
const ACR_TOKEN_USER: &str = "00000000-0000-0000-0000-000000000000";

pub struct AzureProvider {
    view: ProviderView,
    creds: AzureCredentials,
    region: String,
    cluster_name: String,
    bundle: Arc<CredentialsBundle>,
    renderer: Arc<Renderer>,
}

impl AzureProvider {
    pub fn new(
        cluster: &KeosCluster,
        bundle: Arc<CredentialsBundle>,
        renderer: Arc<Renderer>,
        managed: bool,
    ) -> Result<Self> {
        let CloudCreds::Azure(creds) = &bundle.provider else {
            return Err(ProviderError::MissingCredential("azure credentials".into()));
        };
        let creds = creds.clone();

        let mut env = vec![
            format!("AZURE_TENANT_ID={}", creds.tenant_id),
            format!("AZURE_CLIENT_ID={}", creds.client_id),
            format!("AZURE_CLIENT_SECRET={}", creds.client_secret),
            format!("AZURE_SUBSCRIPTION_ID={}", creds.subscription_id),
        ];
        if managed {
            env.push("EXP_MACHINE_POOL=true".to_string());
        }
        if let Some(token) = &bundle.github_token {
            env.push(format!("GITHUB_TOKEN={token}"));
        }

        let view = ProviderView {
            capx_provider: "azure",
            capx_name: "capz",
            capx_version: CAPZ_VERSION,
            capx_image_version: CAPZ_VERSION,
            managed,
            capx_env_vars: env,
            sc_provisioner: "disk.csi.azure.com",
            sc_parameters: storage_parameters(cluster),
            csi_namespace: "kube-system",
        };

        Ok(Self {
            view,
            creds,
            region: cluster.spec.region.clone(),
            cluster_name: cluster.metadata.name.clone(),
            bundle,
            renderer,
        })
    }

    fn api(&self) -> AzureApi {
        AzureApi::new(&self.creds)
    }

    /// AKS kubelet-identity workaround, run once the node pools are up.
    pub async fn assign_user_identity(&self, identity_resource_id: &str) -> Result<()> {
        self.api()
            .assign_kubelet_identity(&self.cluster_name, &self.cluster_name, identity_resource_id)
            .await
    }
}

fn storage_parameters(cluster: &KeosCluster) -> BTreeMap<String, String> {
    let sc = &cluster.spec.storage_class;
    let mut params = BTreeMap::new();
    if let Some(t) = &sc.parameters.r#type {
        params.insert("skuName".to_string(), t.clone());
    }
    if let Some(fs) = &sc.parameters.fs_type {
        params.insert("fsType".to_string(), fs.clone());
    }
    if !params.contains_key("skuName") {
        let tier = if sc.class.as_deref() == Some("premium") {
            "Premium_LRS"
        } else {
            "StandardSSD_LRS"
        };
        params.insert("skuName".to_string(), tier.to_string());
    }
    if let Some(key) = &sc.encryption_key {
        params.insert("diskEncryptionSetID".to_string(), key.clone());
    }
    params
}

#[async_trait]
impl Provider for AzureProvider {
    fn view(&self) -> &ProviderView {
        &self.view
    }

    async fn install_cloud_provider(
        &self,
        node: &dyn NodeRunner,
        kubeconfig: &str,
        private: &PrivateParams,
        cluster: &KeosCluster,
    ) -> Result<()> {
        let pods_cidr = cluster
            .spec
            .networks
            .pods_cidr_block
            .as_deref()
            .unwrap_or("192.168.0.0/16");
        let mut cmd = format!(
            "helm install cloud-provider-azure /stratio/helm/cloud-provider-azure \
             --kubeconfig {kubeconfig} --namespace kube-system \
             --set infra.clusterName={} \
             --set cloudControllerManager.clusterCIDR={pods_cidr} \
             --set cloudControllerManager.configureCloudRoutes=false",
            self.cluster_name
        );
        if private.private {
            cmd.push_str(&format!(
                " --set cloudControllerManager.imageRepository={}/oss/kubernetes \
                 --set cloudNodeManager.imageRepository={}/oss/kubernetes",
                private.keos_reg_url, private.keos_reg_url
            ));
        }
        node.exec(&cmd, ExecOpts::default()).await?;
        Ok(())
    }

    async fn install_csi(
        &self,
        node: &dyn NodeRunner,
        kubeconfig: &str,
        private: &PrivateParams,
    ) -> Result<()> {
        let mut cmd = format!(
            "helm install azuredisk-csi-driver /stratio/helm/azuredisk-csi-driver \
             --kubeconfig {kubeconfig} --namespace {}",
            self.view.csi_namespace
        );
        if private.private {
            cmd.push_str(&format!(
                " --set image.baseRepo={} \
                 --set image.azuredisk.repository=/oss/kubernetes-csi/azuredisk-csi \
                 --set image.csiProvisioner.repository=/oss/kubernetes-csi/csi-provisioner \
                 --set image.csiAttacher.repository=/oss/kubernetes-csi/csi-attacher \
                 --set image.csiResizer.repository=/oss/kubernetes-csi/csi-resizer \
                 --set image.livenessProbe.repository=/oss/kubernetes-csi/livenessprobe \
                 --set image.nodeDriverRegistrar.repository=/oss/kubernetes-csi/csi-node-driver-registrar",
                private.keos_reg_url
            ));
        }
        node.exec(&cmd, ExecOpts::default()).await?;
        Ok(())
    }

    async fn configure_storage_class(
        &self,
        node: &dyn NodeRunner,
        kubeconfig: &str,
    ) -> Result<()> {
        if self.view.managed {
            storage::strip_default_class(node, kubeconfig).await?;
        }
        let manifest =
            StorageClassManifest::new(self.view.sc_provisioner, self.view.sc_parameters.clone())
                .to_manifest_yaml()?;
        storage::apply(node, kubeconfig, &manifest).await
    }

    async fn internal_nginx(&self, networks: &Networks) -> Result<bool> {
        if networks.subnets.is_empty() {
            return Ok(false);
        }
        let Some(vnet) = &networks.vpc_id else {
            return Ok(false);
        };
        let api = self.api();
        for subnet in &networks.subnets {
            if !api
                .is_private_subnet(&self.cluster_name, vnet, subnet.id())
                .await?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn registry_credentials(&self, url: &str) -> Result<(String, String)> {
        if url.contains(".azurecr.io") {
            let token = self.api().acr_token(&acr_service(url)).await?;
            return Ok((ACR_TOKEN_USER.to_string(), token));
        }
        Ok((
            self.bundle.keos_registry.user.clone(),
            self.bundle.keos_registry.pass.clone(),
        ))
    }

    async fn override_vars(
        &self,
        networks: &Networks,
        _cluster_config: Option<&ClusterConfig>,
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut vars = BTreeMap::new();
        if self.internal_nginx(networks).await? {
            vars.insert(
                "ingress-nginx.yaml".to_string(),
                self.renderer
                    .raw("azure", "ingress-nginx-internal.yaml")?
                    .into_bytes(),
            );
        }
        Ok(vars)
    }

    async fn post_install(&self, node: &dyn NodeRunner, kubeconfig: &str) -> Result<()> {
        ensure_coredns_pdb(node, &self.renderer, kubeconfig).await?;
        if self.view.managed {
            patch_deploy(
                node,
                kubeconfig,
                "kube-system",
                "coredns",
                &evict_annotation_patch("tmp"),
            )
            .await?;
        }
        Ok(())
    }

    fn crossplane_providers(&self, addons: &[String]) -> BTreeMap<String, String> {
        let mut providers = BTreeMap::new();
        providers.insert(
            "provider-family-azure".to_string(),
            CROSSPLANE_AZURE_VERSION.to_string(),
        );
        for addon in addons {
            if addon == "external-dns" {
                providers.insert(
                    "provider-azure-network".to_string(),
                    CROSSPLANE_AZURE_VERSION.to_string(),
                );
                providers.insert(
                    "provider-azure-authorization".to_string(),
                    CROSSPLANE_AZURE_VERSION.to_string(),
                );
            }
        }
        providers
    }

    fn addons(&self, hosted_zones: bool) -> Vec<String> {
        if !hosted_zones {
            return Vec::new();
        }
        ADDONS.iter().map(|a| a.to_string()).collect()
    }

    fn provider_config_content(&self, addon: &str) -> Result<(String, bool)> {
        let (creds, dedicated) = self.bundle.addon_creds(addon);
        let azure = match creds {
            Some(CloudCreds::Azure(azure)) => azure.clone(),
            Some(_) => {
                return Err(ProviderError::MissingCredential(format!(
                    "{addon} azure credentials"
                )))
            }
            None => self.creds.clone(),
        };
        let value = json!({
            "clientId": azure.client_id,
            "clientSecret": azure.client_secret,
            "tenantId": azure.tenant_id,
            "subscriptionId": azure.subscription_id,
        });
        Ok((serde_json::to_string(&value)?, dedicated))
    }

    async fn crossplane_cr_manifests(
        &self,
        cluster: &KeosCluster,
        addon: &str,
        _custom: &BTreeMap<String, String>,
    ) -> Result<(Vec<String>, BTreeMap<String, String>)> {
        let mut manifests = Vec::new();
        let mut waits = BTreeMap::new();
        if addon != "external-dns" {
            return Ok((manifests, waits));
        }
        let ctx = context! {
            cluster_name => &self.cluster_name,
            external_domain => cluster.spec.external_domain.clone().unwrap_or_default(),
            resource_group => &self.cluster_name,
            addon => addon,
        };
        manifests.push(self.renderer.raw("azure", "xrd-hostedzones.yaml")?);
        manifests.push(self.renderer.render("azure", "composition-hostedzones.tmpl", &ctx)?);
        manifests.push(self.renderer.render("azure", "hostedzone.tmpl", &ctx)?);
        waits.insert(
            "xZonesConfig".to_string(),
            format!("{}-zones-config", self.cluster_name),
        );
        Ok((manifests, waits))
    }

    async fn apply_nodes_identity(&self, cluster: &KeosCluster) -> Result<()> {
        let Some(identity) = &cluster.spec.security.nodes_identity else {
            return Ok(());
        };
        if !self.view.managed {
            return Ok(());
        }
        self.assign_user_identity(identity).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_common::KeosCluster;

    const AKS: &str = r#"
apiVersion: installer.keos.stratio.com/v1beta1
kind: KeosCluster
metadata:
  name: demo
spec:
  infra_provider: azure
  k8s_version: v1.26.8
  region: westeurope
  docker_registries:
    - url: registry.example.com/keos
      keos_registry: true
  control_plane:
    managed: true
  worker_nodes:
    - name: workers
      quantity: 3
      size: Standard_D4s_v3
"#;

    fn bundle() -> Arc<CredentialsBundle> {
        Arc::new(CredentialsBundle {
            provider: CloudCreds::Azure(AzureCredentials {
                tenant_id: "tenant".to_string(),
                client_id: "client".to_string(),
                client_secret: "secret".to_string(),
                subscription_id: "sub".to_string(),
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

    fn provider(managed: bool) -> AzureProvider {
        let raw = if managed {
            AKS.to_string()
        } else {
            AKS.replace(
                "  control_plane:\n    managed: true",
                "  control_plane:\n    managed: false\n    size: Standard_D4s_v3",
            )
        };
        let cluster = KeosCluster::from_yaml(&raw).unwrap();
        AzureProvider::new(&cluster, bundle(), Arc::new(Renderer::new()), managed).unwrap()
    }

    #[test]
    fn test_env_vars() {
        let p = provider(true);
        let env = &p.view().capx_env_vars;
        assert!(env.contains(&"AZURE_TENANT_ID=tenant".to_string()));
        assert!(env.contains(&"AZURE_SUBSCRIPTION_ID=sub".to_string()));
        assert!(env.contains(&"EXP_MACHINE_POOL=true".to_string()));
    }

    #[test]
    fn test_storage_defaults() {
        let view = provider(true).view().clone();
        assert_eq!(view.sc_provisioner, "disk.csi.azure.com");
        assert_eq!(view.sc_parameters.get("skuName").unwrap(), "StandardSSD_LRS");
    }

    #[tokio::test]
    async fn test_cloud_provider_install_private() {
        let runner = nimbus_exec::ScriptedRunner::new();
        let cluster = KeosCluster::from_yaml(AKS).unwrap();
        let private = PrivateParams {
            private: true,
            keos_reg_url: "registry.example.com/keos".to_string(),
        };
        provider(false)
            .install_cloud_provider(&runner, "/kc", &private, &cluster)
            .await
            .unwrap();
        assert!(runner.saw("helm install cloud-provider-azure"));
        assert!(runner.saw("imageRepository=registry.example.com/keos/oss/kubernetes"));
    }

    #[test]
    fn test_provider_config_content_is_json() {
        let (content, dedicated) = provider(true).provider_config_content("external-dns").unwrap();
        assert!(!dedicated);
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["tenantId"], "tenant");
    }

    #[tokio::test]
    async fn test_internal_nginx_needs_vnet() {
        let networks: Networks = serde_yaml::from_str("subnets:\n  - name: subnet-1\n").unwrap();
        assert!(!provider(true).internal_nginx(&networks).await.unwrap());
    }
}
