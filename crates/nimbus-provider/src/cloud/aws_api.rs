//! AWS API calls: EC2 subnet/VPC queries and the ECR token exchange
//!
//! EC2 speaks the Query protocol and answers XML; we only ever read
//! single well-known leaf fields out of those responses, so a targeted
//! tag scan is used instead of a full XML parser. ECR is JSON.

use crate::cloud::sigv4::{sign, SignParams};
use crate::cloud::http_client;
use crate::error::{ProviderError, Result};
use base64::engine::general_purpose;
use base64::Engine as _;
use chrono::Utc;
use nimbus_common::descriptor::AwsCredentials;
use regex::Regex;
use serde_json::json;
use tracing::debug;

pub struct AwsApi {
    creds: AwsCredentials,
    region: String,
}

/// Extract the text of every `<tag>...</tag>` leaf in an EC2 response.
pub fn scan_xml_values(body: &str, tag: &str) -> Vec<String> {
    let re = Regex::new(&format!(r"<{tag}>([^<]*)</{tag}>")).expect("static tag pattern");
    re.captures_iter(body)
        .map(|c| c[1].to_string())
        .collect()
}

impl AwsApi {
    pub fn new(creds: &AwsCredentials, region: &str) -> Self {
        Self {
            creds: creds.clone(),
            region: region.to_string(),
        }
    }

    async fn ec2_query(&self, action_query: &str) -> Result<String> {
        let host = format!("ec2.{}.amazonaws.com", self.region);
        let payload = format!("{action_query}&Version=2016-11-15");
        let headers = sign(
            &SignParams {
                access_key: &self.creds.access_key,
                secret_key: &self.creds.secret_key,
                region: &self.region,
                service: "ec2",
                method: "POST",
                host: &host,
                path: "/",
                query: "",
                extra_headers: &[],
                payload: payload.as_bytes(),
            },
            Utc::now(),
        );

        let mut request = http_client()
            .post(format!("https://{host}/"))
            .header("content-type", "application/x-www-form-urlencoded")
            .body(payload);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if status == reqwest::StatusCode::FORBIDDEN || status == reqwest::StatusCode::UNAUTHORIZED
        {
            return Err(ProviderError::Auth(format!("EC2 {status}: {body}")));
        }
        if !status.is_success() {
            return Err(ProviderError::Api(format!("EC2 {status}: {body}")));
        }
        Ok(body)
    }

    /// A subnet is private when it does not map public IPs on launch.
    pub async fn is_private_subnet(&self, subnet_id: &str) -> Result<bool> {
        let body = self
            .ec2_query(&format!(
                "Action=DescribeSubnets&SubnetId.1={}",
                urlencoding::encode(subnet_id)
            ))
            .await?;
        let flags = scan_xml_values(&body, "mapPublicIpOnLaunch");
        match flags.first().map(String::as_str) {
            Some("false") => Ok(true),
            Some("true") => Ok(false),
            _ => Err(ProviderError::Api(format!(
                "subnet {subnet_id} not found in DescribeSubnets response"
            ))),
        }
    }

    /// VPC ids carrying the given Name tag.
    pub async fn vpc_ids_by_name(&self, name: &str) -> Result<Vec<String>> {
        let body = self
            .ec2_query(&format!(
                "Action=DescribeVpcs&Filter.1.Name=tag%3AName&Filter.1.Value.1={}",
                urlencoding::encode(name)
            ))
            .await?;
        Ok(scan_xml_values(&body, "vpcId"))
    }

    /// ECR docker credentials: user is always `AWS`, the password comes
    /// out of the authorization token.
    pub async fn ecr_token(&self, registry_region: &str) -> Result<(String, String)> {
        let host = format!("api.ecr.{registry_region}.amazonaws.com");
        let payload = serde_json::to_vec(&json!({}))?;
        let target = "AmazonEC2ContainerRegistry_V20150921.GetAuthorizationToken";
        let headers = sign(
            &SignParams {
                access_key: &self.creds.access_key,
                secret_key: &self.creds.secret_key,
                region: registry_region,
                service: "ecr",
                method: "POST",
                host: &host,
                path: "/",
                query: "",
                extra_headers: &[("x-amz-target", target)],
                payload: &payload,
            },
            Utc::now(),
        );

        let mut request = http_client()
            .post(format!("https://{host}/"))
            .header("content-type", "application/x-amz-json-1.1")
            .body(payload);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(ProviderError::Auth(format!("ECR token exchange: {status}")));
        }
        let body: serde_json::Value = response.json().await?;
        let token = body["authorizationData"][0]["authorizationToken"]
            .as_str()
            .ok_or_else(|| ProviderError::Api("no authorizationData in ECR response".into()))?;
        let decoded = general_purpose::STANDARD
            .decode(token)
            .map_err(|e| ProviderError::Api(format!("ECR token decode: {e}")))?;
        let decoded = String::from_utf8_lossy(&decoded).into_owned();
        let password = decoded
            .split_once(':')
            .map(|(_, pass)| pass.to_string())
            .ok_or_else(|| ProviderError::Api("ECR token is not user:pass".into()))?;
        debug!("exchanged ECR authorization token");
        Ok(("AWS".to_string(), password))
    }
}

/// The region embedded in an ECR registry hostname
/// (`<account>.dkr.ecr.<region>.amazonaws.com`).
pub fn ecr_region(url: &str) -> Result<String> {
    let host = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url)
        .split('/')
        .next()
        .unwrap_or_default();
    host.split('.')
        .nth(3)
        .map(str::to_string)
        .ok_or(ProviderError::Unexpected {
            what: "ECR registry hostname",
            value: url.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_xml_values() {
        let body = r#"<DescribeSubnetsResponse>
            <subnetSet><item>
                <subnetId>subnet-1</subnetId>
                <mapPublicIpOnLaunch>false</mapPublicIpOnLaunch>
            </item></subnetSet>
        </DescribeSubnetsResponse>"#;
        assert_eq!(scan_xml_values(body, "mapPublicIpOnLaunch"), vec!["false"]);
        assert_eq!(scan_xml_values(body, "subnetId"), vec!["subnet-1"]);
        assert!(scan_xml_values(body, "vpcId").is_empty());
    }

    #[test]
    fn test_ecr_region() {
        assert_eq!(
            ecr_region("123456789012.dkr.ecr.eu-west-1.amazonaws.com/keos").unwrap(),
            "eu-west-1"
        );
        assert!(ecr_region("registry.example.com/keos").is_err());
    }
}
