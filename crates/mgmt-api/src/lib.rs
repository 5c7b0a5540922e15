//! Typed Rust client for the classic service-management API.
//!
//! Covers the subset needed to run a fleet of VMs inside one hosted
//! service: hosted services, deployments, per-role resources (public IPs,
//! network configuration, endpoints), disks, OS images, role power
//! operations and asynchronous operation status. Blob storage lives in
//! [`blob`].
//!
//! Every mutating call is accepted asynchronously; the client returns the
//! `x-ms-request-id` of the accepted request and callers poll
//! [`ServiceManagementClient::get_operation_status`] themselves.

pub mod blob;
mod types;

pub use types::*;

use reqwest::{Method, RequestBuilder, StatusCode};

pub const DEFAULT_BASE_URL: &str = "https://management.core.windows.net";
const API_VERSION: &str = "2014-06-01";
const REQUEST_ID_HEADER: &str = "x-ms-request-id";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("management api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("management api {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: StatusCode,
        body: String,
    },

    #[error("management api {endpoint} accepted the request without a request id")]
    MissingRequestId { endpoint: &'static str },

    #[error("invalid storage access key: {0}")]
    InvalidAccessKey(#[from] base64::DecodeError),
}

impl Error {
    /// `true` when the service answered 404 for the addressed resource.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Api { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Identifier of an accepted asynchronous request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(pub String);

/// Client for the service-management REST API of one subscription.
#[derive(Clone)]
pub struct ServiceManagementClient {
    subscription_id: String,
    base_url: String,
    http: reqwest::Client,
}

impl ServiceManagementClient {
    pub fn new(
        subscription_id: impl Into<String>,
        base_url: impl Into<String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    /// Build a client that authenticates with a management certificate.
    ///
    /// `pem` must hold both the certificate and its PKCS#8 private key.
    pub fn with_certificate(
        subscription_id: impl Into<String>,
        base_url: impl Into<String>,
        pem: &[u8],
    ) -> Result<Self> {
        let identity = reqwest::Identity::from_pkcs8_pem(pem, pem)?;
        let http = reqwest::Client::builder().identity(identity).build()?;
        Ok(Self::new(subscription_id, base_url, http))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}{path}", self.base_url, self.subscription_id)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, self.url(path))
            .header("x-ms-version", API_VERSION)
    }

    fn deployment_path(service: &str, deployment: &str) -> String {
        format!("/services/hostedservices/{service}/deployments/{deployment}")
    }

    fn role_path(service: &str, deployment: &str, role: &str) -> String {
        format!("{}/roles/{role}", Self::deployment_path(service, deployment))
    }

    async fn check(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api {
                endpoint,
                status,
                body,
            });
        }
        Ok(resp)
    }

    /// Check an accepted mutation and pull its request id.
    async fn accepted(resp: reqwest::Response, endpoint: &'static str) -> Result<RequestId> {
        let resp = Self::check(resp, endpoint).await?;
        resp.headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| RequestId(v.to_string()))
            .ok_or(Error::MissingRequestId { endpoint })
    }

    /// Like `check` but maps 404 to `None` (for lookups).
    async fn check_optional<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
        endpoint: &'static str,
    ) -> Result<Option<T>> {
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::check(resp, endpoint).await?.json().await?))
    }

    // ── Hosted services ──────────────────────────────────────────────

    pub async fn get_hosted_service(&self, service: &str) -> Result<Option<HostedService>> {
        let resp = self
            .request(Method::GET, &format!("/services/hostedservices/{service}"))
            .send()
            .await?;

        Self::check_optional(resp, "get hosted service").await
    }

    pub async fn create_hosted_service(&self, req: &CreateHostedServiceRequest) -> Result<RequestId> {
        let resp = self
            .request(Method::POST, "/services/hostedservices")
            .json(req)
            .send()
            .await?;

        Self::accepted(resp, "create hosted service").await
    }

    pub async fn delete_hosted_service(&self, service: &str) -> Result<RequestId> {
        let resp = self
            .request(Method::DELETE, &format!("/services/hostedservices/{service}"))
            .send()
            .await?;

        Self::accepted(resp, "delete hosted service").await
    }

    // ── Deployments ──────────────────────────────────────────────────

    pub async fn get_deployment(&self, service: &str, deployment: &str) -> Result<Option<Deployment>> {
        let resp = self
            .request(Method::GET, &Self::deployment_path(service, deployment))
            .send()
            .await?;

        Self::check_optional(resp, "get deployment").await
    }

    pub async fn create_deployment(
        &self,
        service: &str,
        req: &CreateDeploymentRequest,
    ) -> Result<RequestId> {
        let resp = self
            .request(
                Method::POST,
                &format!("/services/hostedservices/{service}/deployments"),
            )
            .json(req)
            .send()
            .await?;

        Self::accepted(resp, "create deployment").await
    }

    pub async fn delete_deployment(&self, service: &str, deployment: &str) -> Result<RequestId> {
        let resp = self
            .request(Method::DELETE, &Self::deployment_path(service, deployment))
            .send()
            .await?;

        Self::accepted(resp, "delete deployment").await
    }

    // ── Per-role resources ───────────────────────────────────────────

    pub async fn reserve_public_ip(
        &self,
        service: &str,
        deployment: &str,
        role: &str,
        req: &ReservePublicIpRequest,
    ) -> Result<RequestId> {
        let path = format!("{}/publicips", Self::role_path(service, deployment, role));
        let resp = self.request(Method::POST, &path).json(req).send().await?;

        Self::accepted(resp, "reserve public ip").await
    }

    pub async fn release_public_ip(
        &self,
        service: &str,
        deployment: &str,
        role: &str,
        name: &str,
    ) -> Result<RequestId> {
        let path = format!("{}/publicips/{name}", Self::role_path(service, deployment, role));
        let resp = self.request(Method::DELETE, &path).send().await?;

        Self::accepted(resp, "release public ip").await
    }

    pub async fn set_network_config(
        &self,
        service: &str,
        deployment: &str,
        role: &str,
        req: &NetworkConfigRequest,
    ) -> Result<RequestId> {
        let path = format!("{}/network", Self::role_path(service, deployment, role));
        let resp = self.request(Method::PUT, &path).json(req).send().await?;

        Self::accepted(resp, "set network config").await
    }

    pub async fn clear_network_config(
        &self,
        service: &str,
        deployment: &str,
        role: &str,
    ) -> Result<RequestId> {
        let path = format!("{}/network", Self::role_path(service, deployment, role));
        let resp = self.request(Method::DELETE, &path).send().await?;

        Self::accepted(resp, "clear network config").await
    }

    pub async fn create_role(
        &self,
        service: &str,
        deployment: &str,
        req: &CreateRoleRequest,
    ) -> Result<RequestId> {
        let path = format!("{}/roles", Self::deployment_path(service, deployment));
        let resp = self.request(Method::POST, &path).json(req).send().await?;

        Self::accepted(resp, "create role").await
    }

    pub async fn delete_role(&self, service: &str, deployment: &str, role: &str) -> Result<RequestId> {
        let resp = self
            .request(Method::DELETE, &Self::role_path(service, deployment, role))
            .send()
            .await?;

        Self::accepted(resp, "delete role").await
    }

    pub async fn add_endpoint(
        &self,
        service: &str,
        deployment: &str,
        role: &str,
        req: &InputEndpoint,
    ) -> Result<RequestId> {
        let path = format!("{}/endpoints", Self::role_path(service, deployment, role));
        let resp = self.request(Method::POST, &path).json(req).send().await?;

        Self::accepted(resp, "add endpoint").await
    }

    pub async fn delete_endpoint(
        &self,
        service: &str,
        deployment: &str,
        role: &str,
        name: &str,
    ) -> Result<RequestId> {
        let path = format!("{}/endpoints/{name}", Self::role_path(service, deployment, role));
        let resp = self.request(Method::DELETE, &path).send().await?;

        Self::accepted(resp, "delete endpoint").await
    }

    pub async fn roles_operation(
        &self,
        service: &str,
        deployment: &str,
        req: &RolesOperationRequest,
    ) -> Result<RequestId> {
        let path = format!(
            "{}/roleinstances/Operations",
            Self::deployment_path(service, deployment)
        );
        let resp = self.request(Method::POST, &path).json(req).send().await?;

        Self::accepted(resp, "roles operation").await
    }

    // ── Disks and images ─────────────────────────────────────────────

    pub async fn add_disk(&self, req: &AddDiskRequest) -> Result<RequestId> {
        let resp = self
            .request(Method::POST, "/services/disks")
            .json(req)
            .send()
            .await?;

        Self::accepted(resp, "add disk").await
    }

    pub async fn get_disk(&self, name: &str) -> Result<Option<Disk>> {
        let resp = self
            .request(Method::GET, &format!("/services/disks/{name}"))
            .send()
            .await?;

        Self::check_optional(resp, "get disk").await
    }

    /// Delete a disk together with its backing VHD blob.
    pub async fn delete_disk(&self, name: &str) -> Result<RequestId> {
        let resp = self
            .request(Method::DELETE, &format!("/services/disks/{name}"))
            .query(&[("comp", "media")])
            .send()
            .await?;

        Self::accepted(resp, "delete disk").await
    }

    pub async fn add_os_image(&self, req: &AddOsImageRequest) -> Result<RequestId> {
        let resp = self
            .request(Method::POST, "/services/images")
            .json(req)
            .send()
            .await?;

        Self::accepted(resp, "add os image").await
    }

    // ── Operations ───────────────────────────────────────────────────

    pub async fn get_operation_status(&self, request_id: &RequestId) -> Result<OperationStatus> {
        let resp = self
            .request(Method::GET, &format!("/operations/{}", request_id.0))
            .send()
            .await?;

        Self::check(resp, "get operation status")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }
}
