//! Shared model types for nimbus
//!
//! The descriptor model, its cross-field validation rules, and the
//! availability-zone spreading that both the renderer and the provider
//! layer consume.

pub mod descriptor;
pub mod error;
pub mod validation;
pub mod zones;

pub use descriptor::{
    AwsCredentials, AzureCredentials, ClusterConfig, ClusterSpec, ControlPlane, Dns,
    DockerRegistry, GcpCredentials, InfraProvider, InlineCredentials, KeosCluster, Networks,
    RegistryCredentials, ScParameters, StorageClass, Subnet, WorkerNode, ZoneDistribution,
};
pub use error::{CommonError, Result};
pub use zones::{zone_share, ZoneShare, ZoneSpread};
