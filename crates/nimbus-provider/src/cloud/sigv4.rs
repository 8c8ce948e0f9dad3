//! AWS Signature Version 4
//!
//! The EC2 and ECR calls we make are few enough that carrying the full
//! SDK is not worth it; this module signs requests by hand. Reference:
//! the SigV4 canonical request / string-to-sign construction.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub struct SignParams<'a> {
    pub access_key: &'a str,
    pub secret_key: &'a str,
    pub region: &'a str,
    pub service: &'a str,
    pub method: &'a str,
    pub host: &'a str,
    pub path: &'a str,
    pub query: &'a str,
    /// Extra headers to sign, lowercase names, sorted by the caller.
    pub extra_headers: &'a [(&'a str, &'a str)],
    pub payload: &'a [u8],
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn sha256_hex(data: &[u8]) -> String {
    hex(&Sha256::digest(data))
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Sign a request, returning the headers to attach: `x-amz-date`,
/// `authorization` and the extra headers passed in.
pub fn sign(params: &SignParams<'_>, now: DateTime<Utc>) -> Vec<(String, String)> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();

    let mut canonical_headers = format!("host:{}\nx-amz-date:{}\n", params.host, amz_date);
    let mut signed_headers = "host;x-amz-date".to_string();
    for (name, value) in params.extra_headers {
        canonical_headers.push_str(&format!("{name}:{value}\n"));
        signed_headers.push_str(&format!(";{name}"));
    }

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        params.method,
        params.path,
        params.query,
        canonical_headers,
        signed_headers,
        sha256_hex(params.payload),
    );

    let scope = format!("{}/{}/{}/aws4_request", date, params.region, params.service);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        sha256_hex(canonical_request.as_bytes()),
    );

    let k_date = hmac(format!("AWS4{}", params.secret_key).as_bytes(), date.as_bytes());
    let k_region = hmac(&k_date, params.region.as_bytes());
    let k_service = hmac(&k_region, params.service.as_bytes());
    let k_signing = hmac(&k_service, b"aws4_request");
    let signature = hex(&hmac(&k_signing, string_to_sign.as_bytes()));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        params.access_key, scope, signed_headers, signature,
    );

    let mut headers = vec![
        ("x-amz-date".to_string(), amz_date),
        ("authorization".to_string(), authorization),
    ];
    for (name, value) in params.extra_headers {
        headers.push((name.to_string(), value.to_string()));
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn params<'a>() -> SignParams<'a> {
        SignParams {
            access_key: "AKIDEXAMPLE",
            secret_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            region: "eu-west-1",
            service: "ec2",
            method: "POST",
            host: "ec2.eu-west-1.amazonaws.com",
            path: "/",
            query: "",
            extra_headers: &[],
            payload: b"Action=DescribeSubnets&Version=2016-11-15",
        }
    }

    #[test]
    fn test_signature_is_deterministic() {
        let a = sign(&params(), fixed_now());
        let b = sign(&params(), fixed_now());
        assert_eq!(a, b);
    }

    #[test]
    fn test_signature_shape() {
        let headers = sign(&params(), fixed_now());
        assert_eq!(headers[0].0, "x-amz-date");
        assert_eq!(headers[0].1, "20240501T120000Z");
        let auth = &headers[1].1;
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240501/eu-west-1/ec2/aws4_request"));
        assert!(auth.contains("SignedHeaders=host;x-amz-date"));
        assert!(auth.contains("Signature="));
    }

    #[test]
    fn test_payload_changes_signature() {
        let mut p = params();
        let sig_a = sign(&p, fixed_now())[1].1.clone();
        p.payload = b"Action=DescribeVpcs&Version=2016-11-15";
        let sig_b = sign(&p, fixed_now())[1].1.clone();
        assert_ne!(sig_a, sig_b);
    }

    #[test]
    fn test_extra_headers_are_signed() {
        let mut p = params();
        p.extra_headers = &[("x-amz-target", "AmazonEC2ContainerRegistry_V20150921.GetAuthorizationToken")];
        let headers = sign(&p, fixed_now());
        assert!(headers[1].1.contains("SignedHeaders=host;x-amz-date;x-amz-target"));
        assert_eq!(headers[2].0, "x-amz-target");
    }
}
