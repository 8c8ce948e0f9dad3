//! StorageClass construction
//!
//! Each provider picks a provisioner and defaults the parameter set by
//! storage tier; the manifest is built here and applied over stdin. The
//! `fsType` key is what users write in the descriptor; CSI drivers want
//! `csi.storage.k8s.io/fstype`, so the rendered manifest is rewritten
//! on the way out.

use crate::error::Result;
use nimbus_exec::{ExecOpts, NodeRunner};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

pub const DEFAULT_SC_ANNOTATION: &str = "storageclass.kubernetes.io/is-default-class";

/// The StorageClass manifest the workload cluster gets as its default.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageClassManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: ScMetadata,
    pub provisioner: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
    pub volume_binding_mode: String,
    pub allow_volume_expansion: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScMetadata {
    pub name: String,
    pub annotations: BTreeMap<String, String>,
}

impl StorageClassManifest {
    pub fn new(provisioner: &str, parameters: BTreeMap<String, String>) -> Self {
        let mut annotations = BTreeMap::new();
        annotations.insert(DEFAULT_SC_ANNOTATION.to_string(), "true".to_string());
        Self {
            api_version: "storage.k8s.io/v1".to_string(),
            kind: "StorageClass".to_string(),
            metadata: ScMetadata {
                name: "keos".to_string(),
                annotations,
            },
            provisioner: provisioner.to_string(),
            parameters,
            volume_binding_mode: "WaitForFirstConsumer".to_string(),
            allow_volume_expansion: true,
        }
    }

    /// Serialize with the descriptor-level `fsType` key rewritten to the
    /// CSI parameter name.
    pub fn to_manifest_yaml(&self) -> Result<String> {
        let raw = serde_yaml::to_string(self)?;
        Ok(raw.replace("fsType", "csi.storage.k8s.io/fstype"))
    }
}

/// Expand a comma-separated `labels` parameter into numbered
/// `tagSpecification_i` keys (EBS CSI convention).
pub fn expand_label_tags(manifest: &str) -> String {
    let re = Regex::new(r"(?m)^(\s*)labels: (.*)$").unwrap();
    let Some(caps) = re.captures(manifest) else {
        return manifest.to_string();
    };
    let indent = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
    let labels = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
    let mut tags = String::new();
    for (i, label) in labels.split(',').enumerate() {
        tags.push_str(&format!(
            "{}tagSpecification_{}: \"{}\"{}",
            indent,
            i + 1,
            label.trim(),
            if labels.split(',').count() == i + 1 { "" } else { "\n" }
        ));
    }
    re.replace(manifest, tags.as_str()).into_owned()
}

/// Drop the is-default-class annotation from whatever storage class the
/// managed control plane shipped with. Absence is not an error.
pub async fn strip_default_class(
    node: &dyn NodeRunner,
    kubeconfig: &str,
) -> Result<()> {
    let get = format!(
        "kubectl --kubeconfig {kubeconfig} get sc -o jsonpath='{{.items[?(@.metadata.annotations.storageclass\\.kubernetes\\.io/is-default-class==\"true\")].metadata.name}}'"
    );
    let current = node.exec(&get, ExecOpts::default()).await?;
    let current = current.trim();
    if current.is_empty() || current == "No resources found" {
        debug!("no pre-existing default storage class");
        return Ok(());
    }
    let strip = format!(
        "kubectl --kubeconfig {kubeconfig} annotate sc {current} {DEFAULT_SC_ANNOTATION}-"
    );
    node.exec(&strip, ExecOpts::default()).await?;
    Ok(())
}

/// Apply the rendered StorageClass over stdin.
pub async fn apply(node: &dyn NodeRunner, kubeconfig: &str, manifest: &str) -> Result<()> {
    node.pipe(
        &["kubectl", "--kubeconfig", kubeconfig, "apply", "-f", "-"],
        manifest,
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fstype_rewrite() {
        let mut params = BTreeMap::new();
        params.insert("fsType".to_string(), "ext4".to_string());
        params.insert("type".to_string(), "gp3".to_string());
        let sc = StorageClassManifest::new("ebs.csi.aws.com", params);
        let yaml = sc.to_manifest_yaml().unwrap();
        assert!(yaml.contains("csi.storage.k8s.io/fstype: ext4"));
        assert!(!yaml.contains("fsType"));
        assert!(yaml.contains("provisioner: ebs.csi.aws.com"));
        assert!(yaml.contains("storageclass.kubernetes.io/is-default-class"));
    }

    #[test]
    fn test_expand_label_tags() {
        let manifest = "parameters:\n  labels: env=prod, team=data\n  type: io2\n";
        let out = expand_label_tags(manifest);
        assert!(out.contains("tagSpecification_1: \"env=prod\""));
        assert!(out.contains("tagSpecification_2: \"team=data\""));
        assert!(!out.contains("labels:"));
    }

    #[test]
    fn test_expand_label_tags_noop_without_labels() {
        let manifest = "parameters:\n  type: gp3\n";
        assert_eq!(expand_label_tags(manifest), manifest);
    }

    #[tokio::test]
    async fn test_strip_default_class_handles_no_resources() {
        let runner = nimbus_exec::ScriptedRunner::new().respond("get sc", "No resources found");
        strip_default_class(&runner, "/kind/worker-cluster.kubeconfig")
            .await
            .unwrap();
        // No annotate command should follow.
        assert!(!runner.saw("annotate sc"));
    }

    #[tokio::test]
    async fn test_strip_default_class_removes_annotation() {
        let runner = nimbus_exec::ScriptedRunner::new().respond("get sc", "gp2");
        strip_default_class(&runner, "/kind/worker-cluster.kubeconfig")
            .await
            .unwrap();
        assert!(runner.saw("annotate sc gp2"));
    }
}
