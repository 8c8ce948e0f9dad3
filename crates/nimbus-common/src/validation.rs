//! Cross-field descriptor validation
//!
//! Schema-shape errors are caught at parse time; this module checks the
//! rules that span fields. Every violation is collected so the user can
//! fix the descriptor in one pass.

use crate::descriptor::{InfraProvider, KeosCluster};
use crate::error::{CommonError, Result};
use regex::Regex;

/// Validate the descriptor beyond its schema shape.
pub fn validate(cluster: &KeosCluster) -> Result<()> {
    let mut problems = Vec::new();
    let spec = &cluster.spec;

    let name_len = cluster.metadata.name.len();
    if !(3..=100).contains(&name_len) {
        problems.push("metadata.name: must be between 3 and 100 characters".to_string());
    }

    let version_re = Regex::new(r"^v\d+\.\d+\.\d+$").unwrap();
    if !(7..=8).contains(&spec.k8s_version.len()) || !version_re.is_match(&spec.k8s_version) {
        problems.push(format!(
            "spec.k8s_version: {:?} must look like v1.26.8",
            spec.k8s_version
        ));
    }

    if spec.region.is_empty() {
        problems.push("spec.region: required".to_string());
    }

    let keos_registries = spec
        .docker_registries
        .iter()
        .filter(|r| r.keos_registry)
        .count();
    if keos_registries != 1 {
        problems.push(format!(
            "spec.docker_registries: exactly one registry must set keos_registry, found {keos_registries}"
        ));
    }

    if !spec.networks.subnets.is_empty() && spec.networks.vpc_id.is_none() {
        problems.push("spec.networks.vpc_id: required when subnets are listed".to_string());
    }

    let cp = &spec.control_plane;
    if !cp.managed && cp.size.is_none() {
        problems.push("spec.control_plane.size: required for unmanaged control planes".to_string());
    }
    if cp.managed && !cp.highly_available {
        problems.push(
            "spec.control_plane.highly_available: managed control planes cannot opt out of HA"
                .to_string(),
        );
    }

    match spec.infra_provider {
        InfraProvider::Gcp => {
            if cp.image.is_none() {
                problems.push("spec.control_plane.image: required on gcp".to_string());
            }
            for wn in &spec.worker_nodes {
                if wn.image.is_none() {
                    problems.push(format!("spec.worker_nodes[{}].image: required on gcp", wn.name));
                }
            }
        }
        InfraProvider::Aws => {
            if !cp.managed && cp.aws.associate_oidc_provider == Some(true) {
                problems.push(
                    "spec.control_plane.aws.associate_oidc_provider: requires a managed control plane"
                        .to_string(),
                );
            }
            let logging = &cp.aws.logging;
            if !cp.managed
                && (logging.api_server
                    || logging.audit
                    || logging.authenticator
                    || logging.controller_manager
                    || logging.scheduler)
            {
                problems.push(
                    "spec.control_plane.aws.logging: control plane logging is EKS only".to_string(),
                );
            }
        }
        InfraProvider::Azure => {}
    }

    for wn in &spec.worker_nodes {
        if wn.quantity == 0 {
            problems.push(format!("spec.worker_nodes[{}].quantity: must be > 0", wn.name));
        }
        match (wn.min_size, wn.max_size) {
            (Some(min), Some(max)) => {
                if !(min <= wn.quantity && wn.quantity <= max) {
                    problems.push(format!(
                        "spec.worker_nodes[{}]: min_size <= quantity <= max_size violated ({} <= {} <= {})",
                        wn.name, min, wn.quantity, max
                    ));
                }
            }
            (Some(_), None) | (None, Some(_)) => {
                problems.push(format!(
                    "spec.worker_nodes[{}]: min_size and max_size must be set together",
                    wn.name
                ));
            }
            (None, None) => {}
        }
        if wn.az.is_some() && wn.zone_distribution.is_some() {
            problems.push(format!(
                "spec.worker_nodes[{}]: az and zone_distribution are mutually exclusive",
                wn.name
            ));
        }
    }

    if let Some(creds) = &spec.credentials {
        let clouds = [creds.aws.is_some(), creds.gcp.is_some(), creds.azure.is_some()];
        if clouds.iter().filter(|p| **p).count() > 1 {
            problems.push(
                "spec.credentials: aws, gcp and azure credentials are mutually exclusive"
                    .to_string(),
            );
        }
        let matches_provider = match spec.infra_provider {
            InfraProvider::Aws => creds.gcp.is_none() && creds.azure.is_none(),
            InfraProvider::Gcp => creds.aws.is_none() && creds.azure.is_none(),
            InfraProvider::Azure => creds.aws.is_none() && creds.gcp.is_none(),
        };
        if !matches_provider {
            problems.push(format!(
                "spec.credentials: cloud credentials do not match infra_provider {}",
                spec.infra_provider
            ));
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(CommonError::ValidationFailed(problems))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::KeosCluster;

    const BASE: &str = r#"
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

    fn parse(raw: &str) -> KeosCluster {
        KeosCluster::from_yaml(raw).unwrap()
    }

    fn problems(raw: &str) -> Vec<String> {
        match validate(&parse(raw)) {
            Err(CommonError::ValidationFailed(p)) => p,
            other => panic!("expected ValidationFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_descriptor_passes() {
        validate(&parse(BASE)).unwrap();
    }

    #[test]
    fn test_managed_with_ha_disabled_fails() {
        let raw = BASE.replace("managed: true", "managed: true\n    highly_available: false");
        assert!(problems(&raw).iter().any(|p| p.contains("highly_available")));
    }

    #[test]
    fn test_exactly_one_keos_registry() {
        let raw = BASE.replace("keos_registry: true", "keos_registry: false");
        assert!(problems(&raw).iter().any(|p| p.contains("keos_registry")));
    }

    #[test]
    fn test_unmanaged_requires_size() {
        let raw = BASE.replace("managed: true", "managed: false");
        assert!(problems(&raw).iter().any(|p| p.contains("control_plane.size")));
    }

    #[test]
    fn test_gcp_requires_images() {
        let raw = BASE
            .replace("infra_provider: aws", "infra_provider: gcp")
            .replace("managed: true", "managed: true\n    image: ubuntu-2204");
        let ps = problems(&raw);
        assert!(ps.iter().any(|p| p.contains("worker_nodes[workers].image")));
        assert!(!ps.iter().any(|p| p.contains("control_plane.image")));
    }

    #[test]
    fn test_autoscaler_bounds() {
        let raw = BASE.replace(
            "quantity: 3",
            "quantity: 3\n      min_size: 4\n      max_size: 6",
        );
        assert!(problems(&raw).iter().any(|p| p.contains("min_size <= quantity")));
    }

    #[test]
    fn test_oidc_requires_managed() {
        let raw = BASE.replace(
            "control_plane:\n    managed: true",
            "control_plane:\n    managed: false\n    size: m5.xlarge\n    aws:\n      associate_oidc_provider: true",
        );
        assert!(problems(&raw).iter().any(|p| p.contains("associate_oidc_provider")));
    }

    #[test]
    fn test_mismatched_credentials_fail() {
        let raw = BASE.replace(
            "spec:\n  infra_provider: aws",
            "spec:\n  infra_provider: aws\n  credentials:\n    gcp:\n      project_id: p\n      private_key_id: k\n      private_key: pk\n      client_email: e\n      client_id: c",
        );
        assert!(problems(&raw)
            .iter()
            .any(|p| p.contains("do not match infra_provider")));
    }

    #[test]
    fn test_all_problems_reported_together() {
        let raw = BASE
            .replace("keos_registry: true", "keos_registry: false")
            .replace("k8s_version: v1.26.8", "k8s_version: 1.26.8");
        assert!(problems(&raw).len() >= 2);
    }
}
