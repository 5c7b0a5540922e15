//! Blob storage: container creation and server-side blob copies, signed
//! with the account's SharedKey.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use sha2::Sha256;

use crate::{Error, Result};

pub const DEFAULT_ENDPOINT_SUFFIX: &str = "blob.core.windows.net";
const STORAGE_VERSION: &str = "2015-02-21";

/// Client for one storage account's blob service.
#[derive(Clone)]
pub struct BlobClient {
    account: String,
    key: Vec<u8>,
    endpoint_suffix: String,
    http: reqwest::Client,
}

impl BlobClient {
    /// `access_key` is the base64 account key as shown by the portal.
    pub fn new(
        account: impl Into<String>,
        access_key: &str,
        endpoint_suffix: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            account: account.into(),
            key: BASE64.decode(access_key.trim())?,
            endpoint_suffix: endpoint_suffix.into(),
            http: reqwest::Client::new(),
        })
    }

    /// Public URL of a blob; also the media link for disks.
    pub fn blob_url(&self, container: &str, blob: &str) -> String {
        format!(
            "https://{}.{}/{container}/{blob}",
            self.account, self.endpoint_suffix
        )
    }

    fn container_url(&self, container: &str) -> String {
        format!("https://{}.{}/{container}", self.account, self.endpoint_suffix)
    }

    /// Create a container. Returns `false` when it already existed.
    pub async fn create_container(&self, container: &str) -> Result<bool> {
        let query = [("restype", "container")];
        let headers = self.ms_headers(&[]);
        let auth = self.authorization(
            &Method::PUT,
            &format!("/{container}"),
            &query,
            &headers,
        );

        let mut req = self
            .http
            .put(self.container_url(container))
            .query(&query)
            .header("Authorization", auth)
            .header("Content-Length", "0");
        for (name, value) in &headers {
            req = req.header(name.as_str(), value.as_str());
        }
        let resp = req.send().await?;

        match resp.status() {
            StatusCode::CREATED => Ok(true),
            StatusCode::CONFLICT => Ok(false),
            status => {
                let body = resp.text().await.unwrap_or_default();
                Err(Error::Api {
                    endpoint: "create container",
                    status,
                    body,
                })
            }
        }
    }

    /// Start a server-side copy of `source_url` into `container/blob`.
    pub async fn copy_blob(&self, container: &str, blob: &str, source_url: &str) -> Result<()> {
        let headers = self.ms_headers(&[("x-ms-copy-source", source_url)]);
        let auth = self.authorization(&Method::PUT, &format!("/{container}/{blob}"), &[], &headers);

        let mut req = self
            .http
            .put(self.blob_url(container, blob))
            .header("Authorization", auth)
            .header("Content-Length", "0");
        for (name, value) in &headers {
            req = req.header(name.as_str(), value.as_str());
        }
        let resp = req.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api {
                endpoint: "copy blob",
                status,
                body,
            });
        }
        Ok(())
    }

    fn ms_headers(&self, extra: &[(&str, &str)]) -> Vec<(String, String)> {
        let mut headers = vec![
            (
                "x-ms-date".to_string(),
                Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
            ),
            ("x-ms-version".to_string(), STORAGE_VERSION.to_string()),
        ];
        headers.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        headers
    }

    fn authorization(
        &self,
        method: &Method,
        path: &str,
        query: &[(&str, &str)],
        ms_headers: &[(String, String)],
    ) -> String {
        let to_sign = string_to_sign(method, &self.account, path, query, ms_headers);
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
            .expect("HMAC can take key of any size");
        mac.update(to_sign.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());
        format!("SharedKey {}:{signature}", self.account)
    }
}

/// Canonical SharedKey string for a body-less request.
///
/// The standard headers are all empty: no body, no conditionals, and the
/// date travels in `x-ms-date`.
fn string_to_sign(
    method: &Method,
    account: &str,
    path: &str,
    query: &[(&str, &str)],
    ms_headers: &[(String, String)],
) -> String {
    let mut headers: Vec<(String, &str)> = ms_headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.trim()))
        .collect();
    headers.sort_by(|a, b| a.0.cmp(&b.0));
    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{k}:{v}\n"))
        .collect();

    let mut params: Vec<(String, &str)> = query
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), *v))
        .collect();
    params.sort_by(|a, b| a.0.cmp(&b.0));
    let mut canonical_resource = format!("/{account}{path}");
    for (k, v) in &params {
        canonical_resource.push_str(&format!("\n{k}:{v}"));
    }

    // VERB + 11 standard headers (Content-Encoding .. Range), all empty.
    format!(
        "{}\n\n\n\n\n\n\n\n\n\n\n\n{canonical_headers}{canonical_resource}",
        method.as_str()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn blob_urls_use_account_and_suffix() {
        let client = BlobClient::new("acct", "c2VjcmV0", DEFAULT_ENDPOINT_SUFFIX).unwrap();
        assert_eq!(
            client.blob_url("vhds", "disk.vhd"),
            "https://acct.blob.core.windows.net/vhds/disk.vhd"
        );
    }

    #[test]
    fn rejects_non_base64_keys() {
        assert!(matches!(
            BlobClient::new("acct", "not base64!", DEFAULT_ENDPOINT_SUFFIX),
            Err(Error::InvalidAccessKey(_))
        ));
    }

    #[test]
    fn string_to_sign_canonicalizes_headers_and_query() {
        let headers = vec![
            ("x-ms-version".to_string(), "2015-02-21".to_string()),
            ("X-Ms-Date".to_string(), "Mon, 01 Jan 2024 00:00:00 GMT".to_string()),
        ];
        let s = string_to_sign(
            &Method::PUT,
            "acct",
            "/vhds",
            &[("restype", "container")],
            &headers,
        );
        assert_eq!(
            s,
            "PUT\n\n\n\n\n\n\n\n\n\n\n\n\
             x-ms-date:Mon, 01 Jan 2024 00:00:00 GMT\n\
             x-ms-version:2015-02-21\n\
             /acct/vhds\nrestype:container"
        );
    }

    #[test]
    fn authorization_header_names_the_account() {
        let client = BlobClient::new("acct", "c2VjcmV0", DEFAULT_ENDPOINT_SUFFIX).unwrap();
        let headers = client.ms_headers(&[]);
        let auth = client.authorization(&Method::PUT, "/vhds", &[], &headers);
        assert!(auth.starts_with("SharedKey acct:"));
    }
}
