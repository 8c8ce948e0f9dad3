//! GitOps reconciliation
//!
//! Flux runs on the workload cluster and adopts the charts flagged
//! `reconcile_by_gitops`: each one becomes a HelmRelease against the
//! keos HelmRepository, so drift after the pivot is reconciled without
//! the provisioner.

use crate::error::Result;
use crate::helm::{install, InstallSpec};
use crate::inventory::ChartInventory;
use crate::repo::HelmRegistry;
use minijinja::context;
use nimbus_exec::NodeRunner;
use nimbus_render::Renderer;
use tracing::info;

/// Install the Flux controllers on the workload cluster.
pub async fn install_flux(
    node: &dyn NodeRunner,
    kubeconfig: &str,
    private: Option<&str>,
) -> Result<()> {
    let mut spec = InstallSpec::new("flux", "flux2", "flux-system")
        .create_namespace()
        .kubeconfig(kubeconfig);
    if let Some(registry) = private {
        spec = spec
            .set("cli.image", &format!("{registry}/fluxcd/flux-cli"))
            .set("helmController.image", &format!("{registry}/fluxcd/helm-controller"))
            .set("sourceController.image", &format!("{registry}/fluxcd/source-controller"));
    }
    install(node, &spec).await
}

/// Point Flux at the keos repository and re-express every GitOps chart
/// as a HelmRelease.
pub async fn reconcile_charts(
    node: &dyn NodeRunner,
    renderer: &Renderer,
    kubeconfig: &str,
    registry: &HelmRegistry,
    inventory: &ChartInventory,
) -> Result<()> {
    let repo = renderer.render(
        "common",
        "helmrepository.tmpl",
        context! {
            url => &registry.url,
            oci => registry.is_oci(),
            auth_required => !registry.user.is_empty(),
        },
    )?;
    node.pipe(
        &["kubectl", "--kubeconfig", kubeconfig, "apply", "-f", "-"],
        &repo,
    )
    .await?;

    for chart in inventory.gitops_charts() {
        let release = renderer.render(
            "common",
            "helmrelease.tmpl",
            context! {
                name => &chart.name,
                namespace => &chart.namespace,
                chart => &chart.name,
                version => &chart.version,
            },
        )?;
        node.pipe(
            &["kubectl", "--kubeconfig", kubeconfig, "apply", "-f", "-"],
            &release,
        )
        .await?;
        info!(chart = %chart.name, "HelmRelease created");
    }
    Ok(())
}
