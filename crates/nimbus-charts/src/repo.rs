//! Keos Helm repository access
//!
//! The catalog lives either in an OCI registry (tag list of the
//! cluster-operator repository) or a classic chart repo (`index.yaml`).
//! Both are read-only for the pipeline.

use crate::error::{ChartError, Result};
use crate::versions::select_version;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct HelmRegistry {
    pub url: String,
    pub user: String,
    pub pass: String,
}

impl HelmRegistry {
    pub fn is_oci(&self) -> bool {
        self.url.starts_with("oci://") || self.url.starts_with("docker://")
    }

    /// Registry host + repository path without the scheme.
    pub fn stripped(&self) -> &str {
        self.url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.url)
    }
}

#[derive(Debug, Deserialize)]
struct Index {
    entries: std::collections::BTreeMap<String, Vec<ChartEntry>>,
}

#[derive(Debug, Deserialize)]
struct ChartEntry {
    version: String,
}

#[derive(Debug, Deserialize)]
struct TagList {
    tags: Vec<String>,
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .expect("static reqwest client configuration")
}

/// The newest cluster-operator chart version the repository offers,
/// per the version-class preference.
pub async fn latest_chart_version(registry: &HelmRegistry) -> Result<String> {
    let tags = if registry.is_oci() {
        oci_tags(registry, "cluster-operator").await?
    } else {
        index_versions(registry, "cluster-operator").await?
    };
    debug!(count = tags.len(), "chart catalog tags fetched");
    select_version(&tags, &registry.url)
}

/// Tag list of `<repo>/<chart>` through the registry HTTP API.
async fn oci_tags(registry: &HelmRegistry, chart: &str) -> Result<Vec<String>> {
    let stripped = registry.stripped();
    let (host, path) = stripped.split_once('/').unwrap_or((stripped, ""));
    let repo = if path.is_empty() {
        chart.to_string()
    } else {
        format!("{path}/{chart}")
    };
    let url = format!("https://{host}/v2/{repo}/tags/list");
    let mut request = client().get(&url);
    if !registry.user.is_empty() {
        request = request.basic_auth(&registry.user, Some(&registry.pass));
    }
    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(ChartError::Repo(format!(
            "tag listing {url}: {}",
            response.status()
        )));
    }
    let list: TagList = response.json().await?;
    Ok(list.tags)
}

/// Versions of `chart` from a classic repository index.
async fn index_versions(registry: &HelmRegistry, chart: &str) -> Result<Vec<String>> {
    let url = format!("{}/index.yaml", registry.url.trim_end_matches('/'));
    let response = client().get(&url).send().await?;
    if !response.status().is_success() {
        return Err(ChartError::Repo(format!(
            "index fetch {url}: {}",
            response.status()
        )));
    }
    let body = response.text().await?;
    let index: Index = serde_yaml::from_str(&body)?;
    Ok(index
        .entries
        .get(chart)
        .map(|entries| entries.iter().map(|e| e.version.clone()).collect())
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_oci() {
        let oci = HelmRegistry {
            url: "oci://registry.example.com/keos/charts".to_string(),
            user: String::new(),
            pass: String::new(),
        };
        assert!(oci.is_oci());
        assert_eq!(oci.stripped(), "registry.example.com/keos/charts");

        let classic = HelmRegistry {
            url: "https://charts.example.com/keos".to_string(),
            user: String::new(),
            pass: String::new(),
        };
        assert!(!classic.is_oci());
    }

    #[test]
    fn test_index_parsing() {
        let raw = r#"
entries:
  cluster-operator:
    - version: 0.1.0
    - version: 0.2.0-SNAPSHOT
  other-chart:
    - version: 9.9.9
"#;
        let index: Index = serde_yaml::from_str(raw).unwrap();
        let versions: Vec<_> = index.entries["cluster-operator"]
            .iter()
            .map(|e| e.version.as_str())
            .collect();
        assert_eq!(versions, vec!["0.1.0", "0.2.0-SNAPSHOT"]);
    }
}
