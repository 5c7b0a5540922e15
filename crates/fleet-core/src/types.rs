use std::fmt;

use serde::{Deserialize, Serialize};

/// Generated VM name: lowercase alphanumerics, also used as the role name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VmName(pub String);

impl VmName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VmName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hosted service + deployment that every VM of the fleet lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub service: String,
    pub deployment: String,
}

/// Something teardown knows how to delete.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceRef {
    HostedService,
    Deployment,
    PublicIp { role: String, name: String },
    NetworkConfig { role: String },
    Disk { name: String },
    Role { role: String },
    Endpoint { role: String, name: String },
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HostedService => f.write_str("hosted service"),
            Self::Deployment => f.write_str("deployment"),
            Self::PublicIp { name, .. } => write!(f, "public ip '{name}'"),
            Self::NetworkConfig { .. } => f.write_str("network configuration"),
            Self::Disk { name } => write!(f, "disk '{name}'"),
            Self::Role { role } => write!(f, "vm '{role}'"),
            Self::Endpoint { name, .. } => write!(f, "endpoint '{name}'"),
        }
    }
}

/// A resource the fleet owns.
///
/// `request_id` is the create request that produced it, or `None` when the
/// resource was adopted (already existed, or found by discovery).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHandle {
    pub resource: ResourceRef,
    pub request_id: Option<String>,
}

/// Template fields resolved for one VM.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedVm {
    pub host_name: String,
    pub user_data: String,
    pub public_ip_names: Vec<String>,
    pub root_disk_name: String,
    pub root_disk_url: String,
    pub data_disk_urls: Vec<String>,
}

/// Per-VM runtime record: generated name, resolved fields and everything
/// created for it so far, in creation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmIdentity {
    pub name: VmName,
    pub index: usize,
    pub resolved: ResolvedVm,
    pub resources: Vec<ResourceHandle>,
}

impl VmIdentity {
    pub fn new(name: VmName, index: usize, resolved: ResolvedVm) -> Self {
        Self {
            name,
            index,
            resolved,
            resources: Vec::new(),
        }
    }
}

/// In-progress reference to an asynchronous cloud mutation.
///
/// Not `Clone`: the tracker takes it by value, so a handle that reached a
/// terminal state cannot be polled again.
#[derive(Debug, PartialEq, Eq)]
pub struct OperationHandle {
    pub request_id: String,
}

impl OperationHandle {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    InProgress,
    Succeeded,
    Failed,
}

/// Error code and message exactly as the cloud reported them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudFault {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationStatus {
    pub state: OperationState,
    /// Status string as reported, kept for timeout diagnostics.
    pub raw: String,
    pub fault: Option<CloudFault>,
}

impl OperationStatus {
    /// Anything other than `InProgress` is terminal; a terminal status that
    /// carries an error is a failure whatever its name says.
    pub fn classify(raw: impl Into<String>, fault: Option<CloudFault>) -> Self {
        let raw = raw.into();
        let state = if raw == "InProgress" {
            OperationState::InProgress
        } else if fault.is_some() || raw == "Failed" {
            OperationState::Failed
        } else {
            OperationState::Succeeded
        };
        Self { state, raw, fault }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedServiceInfo {
    pub name: String,
    pub location: String,
}

/// Live view of a deployment and its roles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentInfo {
    pub name: String,
    pub roles: Vec<RoleInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleInfo {
    pub role_name: String,
    pub instance_name: String,
    pub instance_status: String,
    pub host_name: String,
    pub os_disk: Option<DiskInfo>,
    pub data_disks: Vec<DiskInfo>,
    pub subnet_names: Vec<String>,
    pub endpoints: Vec<EndpointInfo>,
    pub public_ips: Vec<PublicIpInfo>,
}

impl RoleInfo {
    pub fn is_stopped(&self) -> bool {
        matches!(self.instance_status.as_str(), "Stopped" | "StoppedDeallocated")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskInfo {
    pub name: String,
    pub media_link: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub name: String,
    pub protocol: String,
    pub vip: String,
    pub local_port: u16,
    pub public_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicIpInfo {
    pub name: String,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleOperation {
    Start,
    /// Shut down and release the compute allocation.
    StopDeallocate,
}

/// OS image registration produced by a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsImage {
    pub label: String,
    pub name: String,
    pub media_link: String,
    pub os: String,
}
