//! Small kubectl helpers shared by the provider realizations

use crate::error::Result;
use nimbus_exec::{ExecOpts, NodeRunner};
use nimbus_render::Renderer;

/// The annotation managed variants stamp on system deployments so the
/// cluster-autoscaler will still evict their pods.
pub const EVICT_ANNOTATION: &str = "cluster-autoscaler.kubernetes.io/safe-to-evict-local-volumes";

/// Make sure the CoreDNS PodDisruptionBudget exists.
pub async fn ensure_coredns_pdb(
    node: &dyn NodeRunner,
    renderer: &Renderer,
    kubeconfig: &str,
) -> Result<()> {
    let check = format!("kubectl --kubeconfig {kubeconfig} get pdb coredns -n kube-system");
    if node.exec(&check, ExecOpts::default()).await.is_ok() {
        return Ok(());
    }
    let pdb = renderer.raw("common", "coredns_pdb.yaml")?;
    node.pipe(
        &["kubectl", "--kubeconfig", kubeconfig, "apply", "-f", "-"],
        &pdb,
    )
    .await?;
    Ok(())
}

/// Strategic-merge patch on a deployment.
pub async fn patch_deploy(
    node: &dyn NodeRunner,
    kubeconfig: &str,
    namespace: &str,
    name: &str,
    patch: &str,
) -> Result<()> {
    let cmd = format!(
        "kubectl --kubeconfig {kubeconfig} -n {namespace} patch deployment {name} -p '{patch}'"
    );
    node.exec(&cmd, ExecOpts::default()).await?;
    Ok(())
}

/// Pod-annotation patch stamping the eviction annotation with `value`.
pub fn evict_annotation_patch(value: &str) -> String {
    format!(
        r#"{{"spec": {{"template": {{"metadata": {{"annotations": {{"{EVICT_ANNOTATION}": "{value}"}}}}}}}}}}"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_exec::ScriptedRunner;

    #[tokio::test]
    async fn test_pdb_not_recreated_when_present() {
        let runner = ScriptedRunner::new().respond("get pdb coredns", "coredns");
        ensure_coredns_pdb(&runner, &Renderer::new(), "/kc").await.unwrap();
        let commands = runner.commands();
        assert_eq!(commands.len(), 1);
    }

    #[tokio::test]
    async fn test_pdb_applied_when_absent() {
        let runner = ScriptedRunner::new().fail_on("get pdb coredns", "NotFound");
        ensure_coredns_pdb(&runner, &Renderer::new(), "/kc").await.unwrap();
        assert!(runner.saw("apply -f -"));
    }

    #[test]
    fn test_evict_annotation_patch_is_valid_json() {
        let patch = evict_annotation_patch("socket-dir");
        let value: serde_json::Value = serde_json::from_str(&patch).unwrap();
        assert_eq!(
            value["spec"]["template"]["metadata"]["annotations"][EVICT_ANNOTATION],
            "socket-dir"
        );
    }
}
