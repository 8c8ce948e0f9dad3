//! Azure API calls: ARM token, route-table classification, ACR token
//! exchange and the AKS kubelet-identity workaround

use crate::cloud::http_client;
use crate::error::{ProviderError, Result};
use nimbus_common::descriptor::AzureCredentials;
use serde_json::json;
use tracing::info;

const ARM_SCOPE: &str = "https://management.azure.com/.default";
const ARM_BASE: &str = "https://management.azure.com";

pub struct AzureApi {
    creds: AzureCredentials,
}

impl AzureApi {
    pub fn new(creds: &AzureCredentials) -> Self {
        Self {
            creds: creds.clone(),
        }
    }

    /// Client-credentials token for the ARM management plane.
    pub async fn management_token(&self) -> Result<String> {
        let url = format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            self.creds.tenant_id
        );
        let response = http_client()
            .post(url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", &self.creds.client_id),
                ("client_secret", &self.creds.client_secret),
                ("scope", ARM_SCOPE),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(ProviderError::Auth(format!("AAD token exchange: {status}")));
        }
        let body: serde_json::Value = response.json().await?;
        body["access_token"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Api("no access_token in AAD response".into()))
    }

    async fn arm_get(&self, path: &str) -> Result<serde_json::Value> {
        let token = self.management_token().await?;
        let response = http_client()
            .get(format!("{ARM_BASE}{path}"))
            .bearer_auth(token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Api(format!("ARM GET {path}: {status}")));
        }
        Ok(response.json().await?)
    }

    /// A subnet counts as private when its route table does not send the
    /// default route straight to the Internet.
    pub async fn is_private_subnet(
        &self,
        resource_group: &str,
        vnet: &str,
        subnet: &str,
    ) -> Result<bool> {
        let path = format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/virtualNetworks/{}/subnets/{}?api-version=2023-05-01",
            self.creds.subscription_id, resource_group, vnet, subnet
        );
        let body = self.arm_get(&path).await?;
        let Some(route_table_id) = body["properties"]["routeTable"]["id"].as_str() else {
            // No route table means the platform default route to Internet.
            return Ok(false);
        };
        let routes = self
            .arm_get(&format!("{route_table_id}?api-version=2023-05-01&$expand=routes"))
            .await?;
        let empty = Vec::new();
        let routes = routes["properties"]["routes"].as_array().unwrap_or(&empty);
        for route in routes {
            let prefix = route["properties"]["addressPrefix"].as_str().unwrap_or("");
            let next_hop = route["properties"]["nextHopType"].as_str().unwrap_or("");
            if prefix == "0.0.0.0/0" {
                return Ok(next_hop != "Internet");
            }
        }
        Ok(false)
    }

    /// ACR service token for docker login against `service`.
    pub async fn acr_token(&self, service: &str) -> Result<String> {
        let aad_token = self.management_token().await?;
        let response = http_client()
            .post(format!("https://{service}/oauth2/exchange"))
            .form(&[
                ("grant_type", "access_token"),
                ("service", service),
                ("tenant", &self.creds.tenant_id),
                ("access_token", &aad_token),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(ProviderError::Auth(format!("ACR token exchange: {status}")));
        }
        let body: serde_json::Value = response.json().await?;
        body["refresh_token"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Api("no refresh_token in ACR response".into()))
    }

    /// Assign the user kubelet identity on an AKS cluster. The provider
    /// does not support this field yet, so it is patched post-creation.
    pub async fn assign_kubelet_identity(
        &self,
        resource_group: &str,
        cluster_name: &str,
        identity_resource_id: &str,
    ) -> Result<()> {
        let token = self.management_token().await?;
        let path = format!(
            "{ARM_BASE}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.ContainerService/managedClusters/{}?api-version=2023-08-01",
            self.creds.subscription_id, resource_group, cluster_name
        );
        let patch = json!({
            "properties": {
                "identityProfile": {
                    "kubeletidentity": {
                        "resourceId": identity_resource_id,
                    }
                }
            }
        });
        let response = http_client()
            .patch(path)
            .bearer_auth(token)
            .json(&patch)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Api(format!(
                "kubelet identity assignment on {cluster_name}: {status}"
            )));
        }
        info!(cluster = cluster_name, "assigned user kubelet identity");
        Ok(())
    }
}

/// The ACR service host of a registry url (`myregistry.azurecr.io/keos`).
pub fn acr_service(url: &str) -> String {
    url.split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url)
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acr_service() {
        assert_eq!(acr_service("myregistry.azurecr.io/keos"), "myregistry.azurecr.io");
        assert_eq!(
            acr_service("oci://myregistry.azurecr.io/keos/charts"),
            "myregistry.azurecr.io"
        );
    }
}
