//! Cluster descriptor model
//!
//! The descriptor is the single user-supplied input: a KeosCluster
//! document describing the provider, the control plane, the worker node
//! groups and the add-on settings. Parsing applies defaults before
//! validation so that downstream code never sees unset toggles.

use crate::error::{CommonError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Top-level descriptor document (also the KeosCluster custom resource).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeosCluster {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ClusterMetadata,
    pub spec: ClusterSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterMetadata {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterSpec {
    pub infra_provider: InfraProvider,

    pub k8s_version: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,
    #[serde(default)]
    pub fully_private: bool,
    #[serde(default = "default_true")]
    pub deploy_autoscaler: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bastion: Option<Bastion>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<InlineCredentials>,

    #[serde(default)]
    pub networks: Networks,

    #[serde(default)]
    pub dns: Dns,

    #[serde(default)]
    pub docker_registries: Vec<DockerRegistry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_domain: Option<String>,

    #[serde(default)]
    pub keos: KeosSettings,

    #[serde(default)]
    pub storage_class: StorageClass,

    #[serde(default)]
    pub security: Security,

    pub control_plane: ControlPlane,

    pub worker_nodes: Vec<WorkerNode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_config: Option<ClusterConfig>,
}

fn default_true() -> bool {
    true
}

/// Supported infrastructure providers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InfraProvider {
    Aws,
    Gcp,
    Azure,
}

impl InfraProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            InfraProvider::Aws => "aws",
            InfraProvider::Gcp => "gcp",
            InfraProvider::Azure => "azure",
        }
    }
}

impl fmt::Display for InfraProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional bastion VM in front of the cluster network.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Bastion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ami_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_size: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_cidr_blocks: Vec<String>,
}

/// Credentials embedded in the descriptor. They are absorbed into the
/// secrets vault on first use and stripped from the file afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InlineCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsCredentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp: Option<GcpCredentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureCredentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_token: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub docker_registries: Vec<RegistryCredentials>,
}

impl InlineCredentials {
    pub fn is_empty(&self) -> bool {
        self.aws.is_none()
            && self.gcp.is_none()
            && self.azure.is_none()
            && self.github_token.is_none()
            && self.docker_registries.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AwsCredentials {
    pub access_key: String,
    pub secret_key: String,
    #[serde(default)]
    pub account: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GcpCredentials {
    pub project_id: String,
    pub private_key_id: String,
    pub private_key: String,
    pub client_email: String,
    pub client_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AzureCredentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub subscription_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RegistryCredentials {
    pub url: String,
    pub user: String,
    pub pass: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Networks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pods_cidr_block: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<Subnet>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Subnet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_cidr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_cidr: Option<String>,
}

impl Subnet {
    /// The identifier used against the cloud API: explicit id, or name.
    pub fn id(&self) -> &str {
        self.subnet_id
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dns {
    #[serde(default = "default_true")]
    pub hosted_zones: bool,
}

impl Default for Dns {
    fn default() -> Self {
        Self { hosted_zones: true }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DockerRegistry {
    pub url: String,
    #[serde(default)]
    pub auth_required: bool,
    /// Registry flavour: ecr, acr, gar or generic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    #[serde(default)]
    pub keos_registry: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KeosSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flavour: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Storage class request. `class` picks a tier, `parameters` pins the
/// provisioner parameters verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StorageClass {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
    #[serde(default)]
    pub parameters: ScParameters,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iops_per_gb: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kms_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_encryption_kms_key: Option<String>,
}

impl ScParameters {
    pub fn is_empty(&self) -> bool {
        self == &ScParameters::default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Security {
    #[serde(default)]
    pub aws: AwsSecurity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes_identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_identity: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AwsSecurity {
    #[serde(default)]
    pub create_iam: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlPlane {
    #[serde(default)]
    pub managed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ami_id: Option<String>,
    #[serde(default = "default_true")]
    pub highly_available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub root_volume: RootVolume,
    #[serde(default)]
    pub aws: AwsControlPlane,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RootVolume {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
}

/// EKS-only control plane knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AwsControlPlane {
    /// Defaults to true on managed control planes; only meaningful there.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub associate_oidc_provider: Option<bool>,
    #[serde(default)]
    pub logging: AwsLogging,
}

impl AwsControlPlane {
    pub fn associate_oidc_provider(&self) -> bool {
        self.associate_oidc_provider.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AwsLogging {
    #[serde(default)]
    pub api_server: bool,
    #[serde(default)]
    pub audit: bool,
    #[serde(default)]
    pub authenticator: bool,
    #[serde(default)]
    pub controller_manager: bool,
    #[serde(default)]
    pub scheduler: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerNode {
    pub name: String,
    pub quantity: u32,
    pub size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ami_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_distribution: Option<ZoneDistribution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub az: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,
    #[serde(default)]
    pub spot: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u32>,
    #[serde(default)]
    pub root_volume: RootVolume,
}

impl WorkerNode {
    /// Whether this group participates in cluster autoscaling.
    pub fn autoscaled(&self) -> bool {
        self.min_size.is_some() || self.max_size.is_some()
    }
}

/// How a worker group spreads across the three target zones.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ZoneDistribution {
    #[default]
    Balanced,
    Unbalanced,
}

/// Operator-level tuning applied next to the KeosCluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClusterConfig {
    #[serde(default)]
    pub eks_lb_controller: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_registry: Option<bool>,
}

impl KeosCluster {
    /// Parse a descriptor from YAML, applying defaults before returning.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let cluster: KeosCluster = serde_yaml::from_str(raw)
            .map_err(|e| CommonError::InvalidDescriptor(e.to_string()))?;
        Ok(cluster)
    }

    /// Read and parse the descriptor file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| CommonError::DescriptorRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    /// Namespace holding the Cluster-API objects for this cluster.
    pub fn capi_namespace(&self) -> String {
        format!("cluster-{}", self.metadata.name)
    }

    /// The registry flagged as the canonical keos registry, if any.
    pub fn keos_registry(&self) -> Option<&DockerRegistry> {
        self.spec.docker_registries.iter().find(|r| r.keos_registry)
    }

    /// Serialize back to YAML (used for the KeosCluster manifest and the
    /// descriptor rewrite after credentials are absorbed).
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}
