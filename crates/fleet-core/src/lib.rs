pub mod config;
pub mod fleet;
pub mod names;
pub mod operation;
pub mod plan;
pub mod power;
pub mod probe;
pub mod provision;
pub mod snapshot;
pub mod svcmgmt;
pub mod teardown;
pub mod template;
pub mod types;

#[cfg(test)]
mod testing;

use std::fmt;

use async_trait::async_trait;

use plan::StepKind;
use types::{
    DeploymentInfo, HostedServiceInfo, OperationHandle, OperationStatus, OsImage, ResourceRef,
    RoleOperation, Scope, VmName,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("unresolved token {{{token}}} in template {template:?}")]
    UnresolvedToken { token: String, template: String },

    #[error("malformed template {template:?}: {reason}")]
    MalformedTemplate { template: String, reason: String },

    /// Terminal `Failed` state, with the cloud's code and message verbatim.
    #[error("{code} ({message})")]
    ProvisionOperation { code: String, message: String },

    #[error("operation {request_id} timed out, last status: {last_status}")]
    ProvisionTimeout {
        request_id: String,
        last_status: String,
    },

    #[error("{} of {total} VMs failed to provision: {}", .failures.len(), join(.failures))]
    ProvisionFailed {
        total: usize,
        failures: Vec<VmFailure>,
    },

    #[error("teardown left {} resources behind: {}", .0.len(), join(.0))]
    Teardown(Vec<TeardownFailure>),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unreachable over ssh: {}", .0.join(", "))]
    Unreachable(Vec<String>),

    #[error("cancelled")]
    Cancelled,

    #[error("task aborted: {0}")]
    Task(String),

    #[error(transparent)]
    Api(#[from] mgmt_api::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Operation failure codes meaning the addressed resource does not exist.
/// Codes naming some other missing resource (`StorageAccountNotFound`) are
/// real failures.
const NOT_FOUND_CODES: &[&str] = &["ResourceNotFound", "NotFound"];

impl Error {
    /// `true` when the error says the addressed resource does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Api(e) => e.is_not_found(),
            Error::ProvisionOperation { code, .. } => NOT_FOUND_CODES.contains(&code.as_str()),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// One VM that did not reach `complete`.
#[derive(Debug, Clone)]
pub struct VmFailure {
    pub vm: VmName,
    pub error: String,
}

impl fmt::Display for VmFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.vm, self.error)
    }
}

/// One resource teardown could not delete.
#[derive(Debug, Clone)]
pub struct TeardownFailure {
    /// VM name, or `shared` for hosted service and deployment.
    pub owner: String,
    pub resource: ResourceRef,
    pub error: String,
}

impl fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.owner, self.resource, self.error)
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Cloud control plane as seen by the orchestration core.
///
/// Every mutation is asynchronous on the cloud side: it returns an
/// [`OperationHandle`] that must be polled through
/// [`operation::OperationTracker`]. Lookups and storage calls complete
/// immediately.
#[async_trait]
pub trait CloudControl: Send + Sync + 'static {
    /// URL of `blob` inside `container` of the fleet's storage account.
    fn blob_url(&self, container: &str, blob: &str) -> String;

    /// Create a storage container unless it already exists.
    async fn ensure_container(&self, container: &str) -> Result<()>;

    /// Server-side copy of `source_url` into `container/blob`.
    async fn copy_blob(&self, container: &str, blob: &str, source_url: &str) -> Result<()>;

    async fn get_hosted_service(&self, service: &str) -> Result<Option<HostedServiceInfo>>;

    async fn get_deployment(&self, scope: &Scope) -> Result<Option<DeploymentInfo>>;

    /// Start creating the resource a plan step describes.
    async fn create(&self, scope: &Scope, step: &StepKind) -> Result<OperationHandle>;

    /// Start deleting a resource. A missing resource yields a not-found error,
    /// either here or as the operation's terminal failure.
    async fn delete(&self, scope: &Scope, resource: &ResourceRef) -> Result<OperationHandle>;

    /// Role a disk is still attached to, if any.
    async fn disk_attached_to(&self, disk: &str) -> Result<Option<String>>;

    async fn roles_operation(
        &self,
        scope: &Scope,
        op: RoleOperation,
        roles: &[String],
    ) -> Result<OperationHandle>;

    async fn add_os_image(&self, image: &OsImage) -> Result<OperationHandle>;

    async fn operation_status(&self, handle: &OperationHandle) -> Result<OperationStatus>;
}
