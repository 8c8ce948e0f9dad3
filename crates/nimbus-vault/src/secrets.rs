//! Secrets file model and credentials bundle
//!
//! The vault-encrypted secrets file holds the cloud service account,
//! registry credentials and add-on credentials. Inline descriptor
//! credentials take precedence over the vault, which takes precedence
//! over the process environment. The resulting bundle is built once and
//! passed around by reference.

use crate::error::{Result, VaultError};
use crate::vault;
use nimbus_common::descriptor::{
    AwsCredentials, AzureCredentials, GcpCredentials, InfraProvider, KeosCluster,
    RegistryCredentials,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// A cloud service-account record for one of the supported providers.
#[derive(Debug, Clone, PartialEq)]
pub enum CloudCreds {
    Aws(AwsCredentials),
    Gcp(GcpCredentials),
    Azure(AzureCredentials),
}

impl CloudCreds {
    pub fn provider(&self) -> InfraProvider {
        match self {
            CloudCreds::Aws(_) => InfraProvider::Aws,
            CloudCreds::Gcp(_) => InfraProvider::Gcp,
            CloudCreds::Azure(_) => InfraProvider::Azure,
        }
    }
}

/// On-disk shape of the decrypted secrets file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SecretsFile {
    pub secrets: Secrets,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Secrets {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<Keyed<AwsCredentials>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp: Option<Keyed<GcpCredentials>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<Keyed<AzureCredentials>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_registry: Option<RegistryCredentials>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub docker_registries: Vec<RegistryCredentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crossplane: Option<AddonCreds>,
    #[serde(rename = "external-dns", default, skip_serializing_if = "Option::is_none")]
    pub external_dns: Option<AddonCreds>,
}

/// `{ credentials: ... }` wrapper used by the provider entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Keyed<T> {
    pub credentials: T,
}

/// Add-on credentials carry the same provider shapes as the main entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AddonCreds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsCredentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp: Option<GcpCredentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureCredentials>,
}

impl AddonCreds {
    fn for_provider(&self, provider: InfraProvider) -> Option<CloudCreds> {
        match provider {
            InfraProvider::Aws => self.aws.clone().map(CloudCreds::Aws),
            InfraProvider::Gcp => self.gcp.clone().map(CloudCreds::Gcp),
            InfraProvider::Azure => self.azure.clone().map(CloudCreds::Azure),
        }
    }
}

/// The merged, immutable credential set the pipeline works with.
#[derive(Debug, Clone)]
pub struct CredentialsBundle {
    pub provider: CloudCreds,
    pub github_token: Option<String>,
    pub keos_registry: RegistryCredentials,
    pub docker_registries: Vec<RegistryCredentials>,
    pub crossplane: Option<CloudCreds>,
    pub external_dns: Option<CloudCreds>,
}

impl CredentialsBundle {
    /// Decrypt the vault at `path` (when present) and merge it with the
    /// descriptor's inline credentials and the environment.
    pub fn load(cluster: &KeosCluster, path: &Path, passphrase: &str) -> Result<Self> {
        let file = read_vault(path, passphrase)?;
        build_bundle(cluster, file.unwrap_or_default(), &|k| std::env::var(k).ok())
    }

    /// Credentials for an add-on, falling back to the shared crossplane
    /// account. The bool reports whether a dedicated credential was found.
    pub fn addon_creds(&self, addon: &str) -> (Option<&CloudCreds>, bool) {
        let dedicated = match addon {
            "external-dns" => self.external_dns.as_ref(),
            _ => None,
        };
        match dedicated {
            Some(creds) => (Some(creds), true),
            None => (self.crossplane.as_ref(), false),
        }
    }
}

fn read_vault(path: &Path, passphrase: &str) -> Result<Option<SecretsFile>> {
    if !path.exists() {
        debug!(path = %path.display(), "no secrets file, relying on inline credentials");
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path).map_err(|source| VaultError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let plaintext = vault::decrypt(&raw, passphrase)?;
    Ok(Some(serde_yaml::from_str(&plaintext)?))
}

fn build_bundle(
    cluster: &KeosCluster,
    file: SecretsFile,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<CredentialsBundle> {
    let inline = cluster.spec.credentials.clone().unwrap_or_default();
    let provider = cluster.spec.infra_provider;

    let cloud = match provider {
        InfraProvider::Aws => inline
            .aws
            .clone()
            .or(file.secrets.aws.as_ref().map(|k| k.credentials.clone()))
            .or_else(|| aws_from_env(env))
            .map(CloudCreds::Aws),
        InfraProvider::Gcp => inline
            .gcp
            .clone()
            .or(file.secrets.gcp.as_ref().map(|k| k.credentials.clone()))
            .or_else(|| gcp_from_env(env))
            .map(CloudCreds::Gcp),
        InfraProvider::Azure => inline
            .azure
            .clone()
            .or(file.secrets.azure.as_ref().map(|k| k.credentials.clone()))
            .or_else(|| azure_from_env(env))
            .map(CloudCreds::Azure),
    };
    let cloud = cloud.ok_or_else(|| {
        VaultError::MissingSecret(format!("{provider} credentials (descriptor, vault or env)"))
    })?;

    let github_token = inline
        .github_token
        .clone()
        .or(file.secrets.github_token.clone())
        .or_else(|| env("GITHUB_TOKEN"));

    let mut docker_registries = file.secrets.docker_registries.clone();
    for reg in &inline.docker_registries {
        match docker_registries.iter_mut().find(|r| r.url == reg.url) {
            Some(existing) => *existing = reg.clone(),
            None => docker_registries.push(reg.clone()),
        }
    }

    let keos_url = cluster
        .keos_registry()
        .map(|r| r.url.clone())
        .ok_or_else(|| VaultError::MissingSecret("keos registry entry".to_string()))?;
    let keos_registry = docker_registries
        .iter()
        .find(|r| r.url == keos_url)
        .cloned()
        .or(file.secrets.external_registry.clone())
        .unwrap_or(RegistryCredentials {
            url: keos_url,
            user: String::new(),
            pass: String::new(),
        });

    Ok(CredentialsBundle {
        provider: cloud,
        github_token,
        keos_registry,
        docker_registries,
        crossplane: file
            .secrets
            .crossplane
            .as_ref()
            .and_then(|a| a.for_provider(provider)),
        external_dns: file
            .secrets
            .external_dns
            .as_ref()
            .and_then(|a| a.for_provider(provider)),
    })
}

fn aws_from_env(env: &dyn Fn(&str) -> Option<String>) -> Option<AwsCredentials> {
    Some(AwsCredentials {
        access_key: env("AWS_ACCESS_KEY_ID")?,
        secret_key: env("AWS_SECRET_ACCESS_KEY")?,
        account: env("AWS_ACCOUNT_ID").unwrap_or_default(),
        region: env("AWS_REGION"),
    })
}

fn gcp_from_env(env: &dyn Fn(&str) -> Option<String>) -> Option<GcpCredentials> {
    Some(GcpCredentials {
        project_id: env("GCP_PROJECT_ID")?,
        private_key_id: env("GCP_PRIVATE_KEY_ID")?,
        private_key: env("GCP_PRIVATE_KEY")?,
        client_email: env("GCP_CLIENT_EMAIL")?,
        client_id: env("GCP_CLIENT_ID").unwrap_or_default(),
    })
}

fn azure_from_env(env: &dyn Fn(&str) -> Option<String>) -> Option<AzureCredentials> {
    Some(AzureCredentials {
        tenant_id: env("AZURE_TENANT_ID")?,
        client_id: env("AZURE_CLIENT_ID")?,
        client_secret: env("AZURE_CLIENT_SECRET")?,
        subscription_id: env("AZURE_SUBSCRIPTION_ID")?,
    })
}

/// Merge the descriptor's inline credentials into the vault and rewrite
/// it re-encrypted. Returns the updated secrets model.
pub fn ensure_secrets_file(
    cluster: &KeosCluster,
    path: &Path,
    passphrase: &str,
) -> Result<SecretsFile> {
    let mut file = read_vault(path, passphrase)?.unwrap_or_default();
    if let Some(inline) = &cluster.spec.credentials {
        if let Some(aws) = &inline.aws {
            file.secrets.aws = Some(Keyed { credentials: aws.clone() });
        }
        if let Some(gcp) = &inline.gcp {
            file.secrets.gcp = Some(Keyed { credentials: gcp.clone() });
        }
        if let Some(azure) = &inline.azure {
            file.secrets.azure = Some(Keyed { credentials: azure.clone() });
        }
        if let Some(token) = &inline.github_token {
            file.secrets.github_token = Some(token.clone());
        }
        for reg in &inline.docker_registries {
            match file.secrets.docker_registries.iter_mut().find(|r| r.url == reg.url) {
                Some(existing) => *existing = reg.clone(),
                None => file.secrets.docker_registries.push(reg.clone()),
            }
        }
    }

    let plaintext = serde_yaml::to_string(&file)?;
    let encrypted = vault::encrypt(&plaintext, passphrase)?;
    std::fs::write(path, encrypted).map_err(|source| VaultError::Io {
        path: path.display().to_string(),
        source,
    })?;
    info!(path = %path.display(), "secrets file re-encrypted");
    Ok(file)
}

/// Rewrite the descriptor file with its plaintext credential block
/// removed, once those credentials live in the vault.
pub fn strip_descriptor_credentials(cluster: &KeosCluster, path: &Path) -> Result<()> {
    let inline = match &cluster.spec.credentials {
        Some(c) if !c.is_empty() => c,
        _ => return Ok(()),
    };
    debug!(
        registries = inline.docker_registries.len(),
        "absorbing inline credentials from descriptor"
    );
    let mut stripped = cluster.clone();
    stripped.spec.credentials = None;
    let yaml = stripped
        .to_yaml()
        .map_err(|e| VaultError::Malformed(e.to_string()))?;
    std::fs::write(path, yaml).map_err(|source| VaultError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_common::descriptor::KeosCluster;
    use std::collections::HashMap;

    const DESCRIPTOR: &str = r#"
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

    const SECRETS: &str = r#"
secrets:
  aws:
    credentials:
      access_key: AKIAVAULT
      secret_key: vault-secret
      account: "123456789012"
  github_token: ghp_vault
  docker_registries:
    - url: registry.example.com/keos
      user: keos
      pass: keos-pass
  crossplane:
    aws:
      access_key: AKIACROSS
      secret_key: cross-secret
      account: "123456789012"
"#;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn descriptor() -> KeosCluster {
        KeosCluster::from_yaml(DESCRIPTOR).unwrap()
    }

    fn secrets() -> SecretsFile {
        serde_yaml::from_str(SECRETS).unwrap()
    }

    #[test]
    fn test_vault_credentials_used() {
        let bundle = build_bundle(&descriptor(), secrets(), &no_env).unwrap();
        match &bundle.provider {
            CloudCreds::Aws(aws) => assert_eq!(aws.access_key, "AKIAVAULT"),
            other => panic!("expected aws creds, got {other:?}"),
        }
        assert_eq!(bundle.keos_registry.user, "keos");
        assert_eq!(bundle.github_token.as_deref(), Some("ghp_vault"));
    }

    #[test]
    fn test_inline_overrides_vault() {
        let raw = DESCRIPTOR.replace(
            "spec:\n  infra_provider: aws",
            "spec:\n  infra_provider: aws\n  credentials:\n    aws:\n      access_key: AKIAINLINE\n      secret_key: inline\n      account: \"1\"",
        );
        let cluster = KeosCluster::from_yaml(&raw).unwrap();
        let bundle = build_bundle(&cluster, secrets(), &no_env).unwrap();
        match &bundle.provider {
            CloudCreds::Aws(aws) => assert_eq!(aws.access_key, "AKIAINLINE"),
            other => panic!("expected aws creds, got {other:?}"),
        }
    }

    #[test]
    fn test_env_is_last_resort() {
        let mut env = HashMap::new();
        env.insert("AWS_ACCESS_KEY_ID".to_string(), "AKIAENV".to_string());
        env.insert("AWS_SECRET_ACCESS_KEY".to_string(), "env-secret".to_string());
        let lookup = move |k: &str| env.get(k).cloned();
        let bundle = build_bundle(&descriptor(), SecretsFile::default(), &lookup).unwrap();
        match &bundle.provider {
            CloudCreds::Aws(aws) => assert_eq!(aws.access_key, "AKIAENV"),
            other => panic!("expected aws creds, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_provider_credentials() {
        let err = build_bundle(&descriptor(), SecretsFile::default(), &no_env).unwrap_err();
        assert!(matches!(err, VaultError::MissingSecret(_)));
    }

    #[test]
    fn test_addon_falls_back_to_crossplane() {
        let bundle = build_bundle(&descriptor(), secrets(), &no_env).unwrap();
        let (creds, dedicated) = bundle.addon_creds("external-dns");
        assert!(!dedicated);
        match creds {
            Some(CloudCreds::Aws(aws)) => assert_eq!(aws.access_key, "AKIACROSS"),
            other => panic!("expected crossplane fallback, got {other:?}"),
        }
    }

    #[test]
    fn test_ensure_secrets_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.yml");
        let raw = DESCRIPTOR.replace(
            "spec:\n  infra_provider: aws",
            "spec:\n  infra_provider: aws\n  credentials:\n    aws:\n      access_key: AKIAINLINE\n      secret_key: inline\n      account: \"1\"",
        );
        let cluster = KeosCluster::from_yaml(&raw).unwrap();

        ensure_secrets_file(&cluster, &path, "pw").unwrap();
        let reloaded = read_vault(&path, "pw").unwrap().unwrap();
        assert_eq!(
            reloaded.secrets.aws.unwrap().credentials.access_key,
            "AKIAINLINE"
        );
    }
}
