//! Manifest rendering
//!
//! Templates are embedded in the binary and resolved by
//! `(provider, template name)`. The renderer does no I/O of its own:
//! callers pipe the rendered bytes to the node over stdin. Rendering is
//! deterministic, so the same descriptor always produces the same
//! manifest bytes.

pub mod error;
pub mod helpers;
mod templates;

pub use error::{RenderError, Result};

use minijinja::Environment;
use serde::Serialize;

/// The embedded template set plus the helper functions templates use.
pub struct Renderer {
    env: Environment<'static>,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        helpers::register(&mut env);
        for (name, source) in templates::ALL {
            // Embedded templates are compile-time constants; a parse
            // failure here is a build defect, not a runtime condition.
            env.add_template(name, source)
                .unwrap_or_else(|e| panic!("embedded template {name} is invalid: {e}"));
        }
        Self { env }
    }

    /// Render the template `name` for `provider` with `ctx`.
    pub fn render(&self, provider: &str, name: &str, ctx: impl Serialize) -> Result<String> {
        let key = format!("{provider}/{name}");
        let template = self
            .env
            .get_template(&key)
            .map_err(|source| RenderError::Template {
                name: key.clone(),
                source,
            })?;
        template
            .render(ctx)
            .map_err(|source| RenderError::Template { name: key, source })
    }

    /// Fetch a static document from the set (no substitution context).
    pub fn raw(&self, provider: &str, name: &str) -> Result<String> {
        self.render(provider, name, minijinja::context! {})
    }

    /// Every registered template key, for inventory checks.
    pub fn template_names(&self) -> Vec<&'static str> {
        templates::ALL.iter().map(|(name, _)| *name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::context;

    #[test]
    fn test_all_templates_parse() {
        let renderer = Renderer::new();
        assert!(renderer.template_names().len() > 20);
    }

    #[test]
    fn test_unknown_template_is_error() {
        let renderer = Renderer::new();
        let err = renderer.render("aws", "no-such.tmpl", context! {}).unwrap_err();
        assert!(matches!(err, RenderError::Template { .. }));
    }

    #[test]
    fn test_static_documents_render_without_context() {
        let renderer = Renderer::new();
        let netpol = renderer.raw("common", "allow-all-egress_netpol.yaml").unwrap();
        assert!(netpol.contains("kind: NetworkPolicy"));
        let pdb = renderer.raw("common", "coredns_pdb.yaml").unwrap();
        assert!(pdb.contains("PodDisruptionBudget"));
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let renderer = Renderer::new();
        let ctx = context! { cluster_name => "demo", namespace => "cluster-demo" };
        let a = renderer
            .render("common", "machinehealthcheck.tmpl", &ctx)
            .unwrap();
        let b = renderer
            .render("common", "machinehealthcheck.tmpl", &ctx)
            .unwrap();
        assert_eq!(a, b);
    }

    const EKS_DESCRIPTOR: &str = r#"
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
      quantity: 7
      size: t3.large
      zone_distribution: unbalanced
"#;

    fn cluster_ctx(raw: &str) -> minijinja::value::Value {
        let cluster = nimbus_common::KeosCluster::from_yaml(raw).unwrap();
        context! {
            cluster => cluster,
            azs => vec!["eu-west-1a", "eu-west-1b", "eu-west-1c"],
            project_id => "demo-project",
            subscription_id => "0000-1111",
        }
    }

    #[test]
    fn test_aws_managed_cluster_uses_machine_pools() {
        let renderer = Renderer::new();
        let out = renderer
            .render("aws", "cluster.tmpl", cluster_ctx(EKS_DESCRIPTOR))
            .unwrap();
        assert!(out.contains("kind: AWSManagedControlPlane"));
        assert!(out.contains("kind: AWSManagedMachinePool"));
        assert!(!out.contains("kind: MachineDeployment"));
        // 7 nodes unbalanced over 3 zones -> 3/2/2
        assert!(out.contains("replicas: 3"));
        assert!(out.matches("replicas: 2").count() >= 2);
    }

    #[test]
    fn test_aws_unmanaged_cluster_has_kubeadm_control_plane() {
        let raw = EKS_DESCRIPTOR.replace(
            "  control_plane:\n    managed: true",
            "  control_plane:\n    managed: false\n    size: m5.xlarge",
        );
        let renderer = Renderer::new();
        let out = renderer.render("aws", "cluster.tmpl", cluster_ctx(&raw)).unwrap();
        assert!(out.contains("kind: KubeadmControlPlane"));
        assert!(out.contains("kind: MachineDeployment"));
        // HA default -> 3 control plane replicas
        assert!(out.contains("replicas: 3"));
    }

    #[test]
    fn test_cluster_manifest_bytes_are_stable() {
        let renderer = Renderer::new();
        let a = renderer
            .render("aws", "cluster.tmpl", cluster_ctx(EKS_DESCRIPTOR))
            .unwrap();
        let b = renderer
            .render("aws", "cluster.tmpl", cluster_ctx(EKS_DESCRIPTOR))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_gcp_cluster_renders_machine_pools_when_managed() {
        let raw = EKS_DESCRIPTOR
            .replace("infra_provider: aws", "infra_provider: gcp")
            .replace(
                "  control_plane:\n    managed: true",
                "  control_plane:\n    managed: true\n    image: ubuntu-2204",
            );
        let renderer = Renderer::new();
        let out = renderer.render("gcp", "cluster.tmpl", cluster_ctx(&raw)).unwrap();
        assert!(out.contains("kind: GCPManagedControlPlane"));
        assert!(out.contains("kind: GCPManagedMachinePool"));
        assert!(out.contains("project: demo-project"));
    }

    #[test]
    fn test_azure_cluster_renders() {
        let raw = EKS_DESCRIPTOR.replace("infra_provider: aws", "infra_provider: azure");
        let renderer = Renderer::new();
        let out = renderer
            .render("azure", "cluster.tmpl", cluster_ctx(&raw))
            .unwrap();
        assert!(out.contains("kind: AzureManagedControlPlane"));
        assert!(out.contains("subscriptionID: 0000-1111"));
    }

    #[test]
    fn test_helmrelease_with_values() {
        let renderer = Renderer::new();
        let out = renderer
            .render(
                "common",
                "helmrelease.tmpl",
                context! {
                    name => "cluster-operator",
                    namespace => "kube-system",
                    chart => "cluster-operator",
                    version => "0.2.0",
                    values => "app:\n  replicas: 2",
                },
            )
            .unwrap();
        assert!(out.contains("kind: HelmRelease"));
        assert!(out.contains("version: \"0.2.0\""));
        assert!(out.contains("    app:\n      replicas: 2"));
    }
}
