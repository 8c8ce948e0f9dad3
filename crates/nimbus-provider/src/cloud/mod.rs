//! Minimal REST clients for the three cloud APIs
//!
//! Only the handful of calls the capability layer needs: subnet
//! privacy checks, registry token exchanges, VPC lookup and the AKS
//! kubelet-identity workaround. Clients are constructed per call and
//! hold no shared state.

pub mod aws_api;
pub mod azure_api;
pub mod gcp_api;
pub mod sigv4;

use std::time::Duration;

pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .expect("static reqwest client configuration")
}
