//! AWS realization of the provider capability set
//!
//! Covers both the unmanaged (kubeadm on EC2) and the EKS variant. The
//! EKS variant swaps machine deployments for managed machine pools,
//! skips the cloud-controller chart and leans on IRSA for the
//! load-balancer controller and external-dns.

use crate::cloud::aws_api::{ecr_region, AwsApi};
use crate::error::{ProviderError, Result};
use crate::kube::{ensure_coredns_pdb, evict_annotation_patch, patch_deploy};
use crate::storage::{self, StorageClassManifest};
use crate::{Provider, PrivateParams, ProviderView};
use async_trait::async_trait;
use base64::engine::general_purpose;
use base64::Engine as _;
use minijinja::context;
use nimbus_common::descriptor::{AwsCredentials, ClusterConfig, KeosCluster, Networks};
use nimbus_exec::{ExecOpts, NodeRunner};
use nimbus_render::Renderer;
use nimbus_vault::{CloudCreds, CredentialsBundle};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

const CAPA_VERSION: &str = "v2.2.1";
const CROSSPLANE_AWS_VERSION: &str = "v1.8.0";
const ADDONS: &[&str] = &["external-dns"];

pub struct AwsProvider {
    view: ProviderView,
    creds: AwsCredentials,
    region: String,
    cluster_name: String,
    bundle: Arc<CredentialsBundle>,
    renderer: Arc<Renderer>,
}

impl AwsProvider {
    pub fn new(
        cluster: &KeosCluster,
        bundle: Arc<CredentialsBundle>,
        renderer: Arc<Renderer>,
        managed: bool,
    ) -> Result<Self> {
        let CloudCreds::Aws(creds) = &bundle.provider else {
            return Err(ProviderError::MissingCredential("aws credentials".into()));
        };
        let creds = creds.clone();
        let region = cluster.spec.region.clone();

        let ini = format!(
            "[default]\naws_access_key_id = {}\naws_secret_access_key = {}\nregion = {}\n",
            creds.access_key, creds.secret_key, region
        );
        let mut env = vec![
            format!("AWS_REGION={region}"),
            format!("AWS_ACCESS_KEY_ID={}", creds.access_key),
            format!("AWS_SECRET_ACCESS_KEY={}", creds.secret_key),
            format!(
                "AWS_B64ENCODED_CREDENTIALS={}",
                general_purpose::STANDARD.encode(ini.as_bytes())
            ),
            "CAPA_EKS_IAM=true".to_string(),
        ];
        if managed {
            env.push("EXP_MACHINE_POOL=true".to_string());
        }
        if let Some(token) = &bundle.github_token {
            env.push(format!("GITHUB_TOKEN={token}"));
        }

        let view = ProviderView {
            capx_provider: "aws",
            capx_name: "capa",
            capx_version: CAPA_VERSION,
            capx_image_version: CAPA_VERSION,
            managed,
            capx_env_vars: env,
            sc_provisioner: "ebs.csi.aws.com",
            sc_parameters: storage_parameters(cluster),
            csi_namespace: "kube-system",
        };

        Ok(Self {
            view,
            creds,
            region,
            cluster_name: cluster.metadata.name.clone(),
            bundle,
            renderer,
        })
    }

    fn api(&self) -> AwsApi {
        AwsApi::new(&self.creds, &self.region)
    }

    /// Create or update the CloudFormation IAM stack CAPA expects.
    pub async fn create_cloudformation_stack(&self, node: &dyn NodeRunner) -> Result<()> {
        let config = self.renderer.raw("aws", "eks.config")?;
        let path = "/kind/eks.config";
        node.pipe(&["tee", path], &config).await?;
        node.exec_env(
            &format!("clusterawsadm bootstrap iam create-cloudformation-stack --config {path}"),
            ExecOpts::default(),
            &self.view.capx_env_vars,
        )
        .await?;
        info!("CloudFormation IAM stack reconciled");
        Ok(())
    }

    async fn vpc_id(&self, cluster: &KeosCluster) -> Result<String> {
        if let Some(vpc_id) = &cluster.spec.networks.vpc_id {
            return Ok(vpc_id.clone());
        }
        let vpcs = self
            .api()
            .vpc_ids_by_name(&format!("{}-vpc", self.cluster_name))
            .await?;
        match vpcs.as_slice() {
            [one] => Ok(one.clone()),
            [] => Err(ProviderError::Api("no VPC found for the cluster".into())),
            _ => Err(ProviderError::Api("more than one VPC found for the cluster".into())),
        }
    }
}

fn storage_parameters(cluster: &KeosCluster) -> BTreeMap<String, String> {
    let sc = &cluster.spec.storage_class;
    let mut params = BTreeMap::new();
    if let Some(t) = &sc.parameters.r#type {
        params.insert("type".to_string(), t.clone());
    }
    if let Some(fs) = &sc.parameters.fs_type {
        params.insert("fsType".to_string(), fs.clone());
    }
    if let Some(iops) = &sc.parameters.iops_per_gb {
        params.insert("iopsPerGB".to_string(), iops.clone());
    }
    if let Some(labels) = &sc.parameters.labels {
        params.insert("labels".to_string(), labels.clone());
    }
    if !params.contains_key("type") {
        if sc.class.as_deref() == Some("premium") {
            params.insert("type".to_string(), "io2".to_string());
            params.insert("iopsPerGB".to_string(), "64000".to_string());
        } else {
            params.insert("type".to_string(), "gp3".to_string());
        }
    }
    if let Some(key) = &sc.encryption_key {
        params.insert("encrypted".to_string(), "true".to_string());
        params.insert("kmsKeyId".to_string(), key.clone());
    }
    params
}

/// The EKS OIDC provider id is the first host label of the control
/// plane endpoint. CAPI objects sometimes carry a scheme prefix and
/// sometimes do not, so both shapes are accepted.
pub fn oidc_provider_id(control_plane_host: &str) -> Result<String> {
    let host = control_plane_host
        .split_once("//")
        .map(|(_, rest)| rest)
        .unwrap_or(control_plane_host);
    let id = host.split('.').next().unwrap_or_default();
    if id.is_empty() {
        return Err(ProviderError::Unexpected {
            what: "control plane endpoint host",
            value: control_plane_host.to_string(),
        });
    }
    Ok(id.to_string())
}

#[async_trait]
impl Provider for AwsProvider {
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
            "helm install aws-cloud-controller-manager /stratio/helm/aws-cloud-controller-manager \
             --kubeconfig {kubeconfig} --namespace kube-system \
             --set args[0]=\"--v=2\" \
             --set args[1]=\"--cloud-provider=aws\" \
             --set args[2]=\"--cluster-cidr={pods_cidr}\" \
             --set args[3]=\"--cluster-name={}\"",
            self.cluster_name
        );
        if private.private {
            cmd.push_str(&format!(
                " --set image.repository={}/provider-aws/cloud-controller-manager",
                private.keos_reg_url
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
            "helm install aws-ebs-csi-driver /stratio/helm/aws-ebs-csi-driver \
             --kubeconfig {kubeconfig} --namespace {} \
             --set controller.podAnnotations.\"cluster-autoscaler\\.kubernetes\\.io/safe-to-evict-local-volumes=socket-dir\"",
            self.view.csi_namespace
        );
        if private.private {
            let reg = &private.keos_reg_url;
            cmd.push_str(&format!(
                " --set image.repository={reg}/ebs-csi-driver/aws-ebs-csi-driver \
                 --set sidecars.provisioner.image.repository={reg}/eks-distro/kubernetes-csi/external-provisioner \
                 --set sidecars.attacher.image.repository={reg}/eks-distro/kubernetes-csi/external-attacher \
                 --set sidecars.snapshotter.image.repository={reg}/eks-distro/kubernetes-csi/external-snapshotter/csi-snapshotter \
                 --set sidecars.livenessProbe.image.repository={reg}/eks-distro/kubernetes-csi/livenessprobe \
                 --set sidecars.resizer.image.repository={reg}/eks-distro/kubernetes-csi/external-resizer \
                 --set sidecars.nodeDriverRegistrar.image.repository={reg}/eks-distro/kubernetes-csi/node-driver-registrar"
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
        let manifest = storage::expand_label_tags(&manifest);
        storage::apply(node, kubeconfig, &manifest).await
    }

    async fn internal_nginx(&self, networks: &Networks) -> Result<bool> {
        if networks.subnets.is_empty() {
            return Ok(false);
        }
        let api = self.api();
        for subnet in &networks.subnets {
            if !api.is_private_subnet(subnet.id()).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn registry_credentials(&self, url: &str) -> Result<(String, String)> {
        if url.contains(".dkr.ecr.") {
            return self.api().ecr_token(&ecr_region(url)?).await;
        }
        Ok((
            self.bundle.keos_registry.user.clone(),
            self.bundle.keos_registry.pass.clone(),
        ))
    }

    async fn override_vars(
        &self,
        networks: &Networks,
        cluster_config: Option<&ClusterConfig>,
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut vars = BTreeMap::new();
        let internal = self.internal_nginx(networks).await?;
        if internal {
            vars.insert(
                "ingress-nginx.yaml".to_string(),
                self.renderer.raw("aws", "ingress-nginx-internal.yaml")?.into_bytes(),
            );
        } else if self.view.managed
            && cluster_config.map(|c| c.eks_lb_controller).unwrap_or(false)
        {
            vars.insert(
                "ingress-nginx.yaml".to_string(),
                self.renderer.raw("aws", "ingress-nginx-public.yaml")?.into_bytes(),
            );
        }
        match self.view.sc_parameters.get("type").map(String::as_str) {
            Some("io1") | Some("io2") => {
                vars.insert(
                    "storage-class.yaml".to_string(),
                    b"storage_class_pvc_size: 4Gi".to_vec(),
                );
            }
            Some("st1") | Some("sc1") => {
                vars.insert(
                    "storage-class.yaml".to_string(),
                    b"storage_class_pvc_size: 125Gi".to_vec(),
                );
            }
            _ => {}
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
            patch_deploy(
                node,
                kubeconfig,
                "kube-system",
                "ebs-csi-controller",
                &evict_annotation_patch("socket-dir"),
            )
            .await?;
        }
        Ok(())
    }

    fn crossplane_providers(&self, addons: &[String]) -> BTreeMap<String, String> {
        let mut providers = BTreeMap::new();
        providers.insert(
            "provider-family-aws".to_string(),
            CROSSPLANE_AWS_VERSION.to_string(),
        );
        for addon in addons {
            if addon == "external-dns" {
                providers.insert(
                    "provider-aws-route53".to_string(),
                    CROSSPLANE_AWS_VERSION.to_string(),
                );
                providers.insert(
                    "provider-aws-iam".to_string(),
                    CROSSPLANE_AWS_VERSION.to_string(),
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
        let aws = match creds {
            Some(CloudCreds::Aws(aws)) => aws.clone(),
            Some(_) => return Err(ProviderError::MissingCredential(format!("{addon} aws credentials"))),
            None => self.creds.clone(),
        };
        let ini = format!(
            "[default]\naws_access_key_id = {}\naws_secret_access_key = {}\n",
            aws.access_key, aws.secret_key
        );
        Ok((ini, dedicated))
    }

    async fn crossplane_cr_manifests(
        &self,
        cluster: &KeosCluster,
        addon: &str,
        custom: &BTreeMap<String, String>,
    ) -> Result<(Vec<String>, BTreeMap<String, String>)> {
        let mut manifests = Vec::new();
        let mut waits = BTreeMap::new();
        if addon != "external-dns" {
            return Ok((manifests, waits));
        }

        let external_domain = cluster.spec.external_domain.clone().unwrap_or_default();
        let vpc_id = self.vpc_id(cluster).await?;
        let (_, dedicated) = self.bundle.addon_creds(addon);
        debug!(addon, vpc = %vpc_id, "building crossplane composite resources");

        let ctx = context! {
            cluster_name => &self.cluster_name,
            region => &self.region,
            external_domain => external_domain,
            vpc_id => vpc_id,
            account_id => &self.creds.account,
            addon => addon,
            create_credentials => !dedicated,
            oidc_provider_id => custom.get("oidcProviderId").cloned().unwrap_or_default(),
        };

        if self.view.managed {
            manifests.push(self.renderer.raw("aws", "xrd-hostedzones-eks.yaml")?);
            manifests.push(self.renderer.render("aws", "composition-hostedzones-eks.tmpl", &ctx)?);
            manifests.push(self.renderer.render("aws", "hostedzone-eks.tmpl", &ctx)?);
        } else {
            manifests.push(self.renderer.raw("aws", "xrd-hostedzones.yaml")?);
            manifests.push(self.renderer.render("aws", "composition-hostedzones.tmpl", &ctx)?);
            manifests.push(self.renderer.render("aws", "hostedzone.tmpl", &ctx)?);
        }
        waits.insert(
            "xZonesConfig".to_string(),
            format!("{}-zones-config", self.cluster_name),
        );
        Ok((manifests, waits))
    }

    async fn ensure_iam(&self, node: &dyn NodeRunner, cluster: &KeosCluster) -> Result<()> {
        if !cluster.spec.security.aws.create_iam {
            return Ok(());
        }
        self.create_cloudformation_stack(node).await
    }

    /// Install the aws-load-balancer-controller with its IRSA role.
    async fn install_lb_controller(
        &self,
        node: &dyn NodeRunner,
        kubeconfig: &str,
        private: &PrivateParams,
    ) -> Result<()> {
        let role = format!("{}-lb-controller-manager", self.cluster_name);
        let mut cmd = format!(
            "helm install aws-load-balancer-controller /stratio/helm/aws-load-balancer-controller \
             --kubeconfig {kubeconfig} --namespace kube-system \
             --set clusterName={} \
             --set podDisruptionBudget.minAvailable=1 \
             --set serviceAccount.annotations.\"eks\\.amazonaws\\.com/role-arn\"=arn:aws:iam::{}:role/{}",
            self.cluster_name, self.creds.account, role
        );
        if private.private {
            cmd.push_str(&format!(
                " --set image.repository={}/eks/aws-load-balancer-controller",
                private.keos_reg_url
            ));
        }
        node.exec(&cmd, ExecOpts::default()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{aws_bundle, AWS_EKS};
    use nimbus_common::KeosCluster;

    fn provider(managed: bool) -> AwsProvider {
        let raw = if managed {
            AWS_EKS.to_string()
        } else {
            AWS_EKS.replace(
                "  control_plane:\n    managed: true",
                "  control_plane:\n    managed: false\n    size: m5.xlarge",
            )
        };
        let cluster = KeosCluster::from_yaml(&raw).unwrap();
        AwsProvider::new(&cluster, aws_bundle(), Arc::new(Renderer::new()), managed).unwrap()
    }

    #[test]
    fn test_env_vars() {
        let p = provider(true);
        let env = &p.view().capx_env_vars;
        assert!(env.contains(&"AWS_REGION=eu-west-1".to_string()));
        assert!(env.contains(&"CAPA_EKS_IAM=true".to_string()));
        assert!(env.iter().any(|v| v.starts_with("AWS_B64ENCODED_CREDENTIALS=")));
        assert!(env.contains(&"EXP_MACHINE_POOL=true".to_string()));
    }

    #[test]
    fn test_storage_defaults_standard() {
        let p = provider(true);
        assert_eq!(p.view().sc_parameters.get("type").unwrap(), "gp3");
        assert_eq!(p.view().sc_provisioner, "ebs.csi.aws.com");
    }

    #[test]
    fn test_storage_defaults_premium() {
        let raw = AWS_EKS.replace(
            "spec:\n  infra_provider: aws",
            "spec:\n  infra_provider: aws\n  storage_class:\n    class: premium",
        );
        let cluster = KeosCluster::from_yaml(&raw).unwrap();
        let p = AwsProvider::new(&cluster, aws_bundle(), Arc::new(Renderer::new()), true).unwrap();
        assert_eq!(p.view().sc_parameters.get("type").unwrap(), "io2");
        assert_eq!(p.view().sc_parameters.get("iopsPerGB").unwrap(), "64000");
    }

    #[test]
    fn test_oidc_provider_id_with_and_without_scheme() {
        assert_eq!(
            oidc_provider_id("https://ABCD1234.gr7.eu-west-1.eks.amazonaws.com").unwrap(),
            "ABCD1234"
        );
        assert_eq!(
            oidc_provider_id("ABCD1234.gr7.eu-west-1.eks.amazonaws.com").unwrap(),
            "ABCD1234"
        );
        assert!(oidc_provider_id("https://").is_err());
    }

    #[tokio::test]
    async fn test_internal_nginx_false_without_subnets() {
        let p = provider(true);
        let networks = Networks::default();
        assert!(!p.internal_nginx(&networks).await.unwrap());
    }

    #[tokio::test]
    async fn test_registry_credentials_generic_passthrough() {
        let p = provider(true);
        let (user, pass) = p
            .registry_credentials("registry.example.com/keos")
            .await
            .unwrap();
        assert_eq!(user, "keos");
        assert_eq!(pass, "pass");
    }

    #[test]
    fn test_crossplane_providers_for_external_dns() {
        let p = provider(true);
        let providers = p.crossplane_providers(&["external-dns".to_string()]);
        assert!(providers.contains_key("provider-family-aws"));
        assert!(providers.contains_key("provider-aws-route53"));
        assert!(providers.contains_key("provider-aws-iam"));
    }

    #[test]
    fn test_addons_follow_hosted_zones_flag() {
        let p = provider(true);
        assert_eq!(p.addons(true), vec!["external-dns".to_string()]);
        assert!(p.addons(false).is_empty());
    }

    #[tokio::test]
    async fn test_lb_controller_private_repository() {
        let p = provider(true);
        let runner = nimbus_exec::ScriptedRunner::new();
        let private = PrivateParams {
            private: true,
            keos_reg_url: "registry.example.com/keos".to_string(),
        };
        p.install_lb_controller(&runner, "/kc", &private).await.unwrap();
        assert!(runner.saw("image.repository=registry.example.com/keos/eks/aws-load-balancer-controller"));
        assert!(runner.saw("role-arn\"=arn:aws:iam::123456789012:role/demo-lb-controller-manager"));
    }
}
