use serde::{Deserialize, Serialize};

// ── Hosted services ──────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct HostedService {
    pub service_name: String,
    pub location: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateHostedServiceRequest {
    pub service_name: String,
    pub label: String,
    pub location: String,
}

// ── Deployments ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CreateDeploymentRequest {
    pub name: String,
    pub deployment_slot: String,
    pub label: String,
    pub virtual_network_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Deployment {
    pub name: String,
    #[serde(default)]
    pub role_list: Vec<Role>,
    #[serde(default)]
    pub role_instance_list: Vec<RoleInstance>,
}

/// What was requested for a role: disks and configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Role {
    pub role_name: String,
    #[serde(default)]
    pub os_virtual_hard_disk: Option<OsVirtualHardDisk>,
    #[serde(default)]
    pub data_virtual_hard_disks: Vec<DataVirtualHardDisk>,
    #[serde(default)]
    pub subnet_names: Vec<String>,
}

/// What actually runs for a role: state, endpoints, addresses.
#[derive(Debug, Clone, Deserialize)]
pub struct RoleInstance {
    pub role_name: String,
    pub instance_name: String,
    pub instance_status: String,
    #[serde(default)]
    pub host_name: Option<String>,
    #[serde(default)]
    pub instance_endpoints: Vec<InstanceEndpoint>,
    #[serde(default)]
    pub public_ips: Vec<PublicIp>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OsVirtualHardDisk {
    pub disk_name: String,
    pub media_link: String,
    #[serde(default)]
    pub source_image_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataVirtualHardDisk {
    pub disk_name: String,
    pub lun: u32,
    pub media_link: String,
    pub logical_disk_size_in_gb: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceEndpoint {
    pub name: String,
    pub protocol: String,
    pub vip: String,
    // The service reports ports as strings.
    pub local_port: String,
    pub public_port: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublicIp {
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
}

// ── Per-role resources ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ReservePublicIpRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkConfigRequest {
    pub virtual_network_name: String,
    pub subnet_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateRoleRequest {
    pub role_name: String,
    pub role_size: String,
    pub os_disk_name: String,
    pub data_disk_names: Vec<String>,
    pub public_ip_names: Vec<String>,
    pub subnet_names: Vec<String>,
    pub system_config: LinuxConfigurationSet,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinuxConfigurationSet {
    pub host_name: String,
    /// Base64 encoded, handed to cloud-init as user data.
    pub custom_data: String,
    pub disable_ssh_password_authentication: bool,
    pub provision_guest_agent: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InputEndpoint {
    pub name: String,
    pub protocol: String,
    pub local_port: u16,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_balanced_endpoint_set_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum RoleOperationType {
    StartRolesOperation,
    ShutdownRolesOperation,
}

#[derive(Debug, Clone, Serialize)]
pub struct RolesOperationRequest {
    pub operation_type: RoleOperationType,
    pub roles: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_shutdown_action: Option<String>,
}

// ── Disks and images ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct AddDiskRequest {
    pub name: String,
    pub label: String,
    pub media_link: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_image_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logical_disk_size_in_gb: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Disk {
    pub name: String,
    pub media_link: String,
    #[serde(default)]
    pub attached_to: Option<DiskAttachment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiskAttachment {
    pub hosted_service_name: String,
    pub deployment_name: String,
    pub role_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddOsImageRequest {
    pub label: String,
    pub media_link: String,
    pub name: String,
    pub os: String,
}

// ── Operations ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct OperationStatus {
    pub id: String,
    /// `InProgress`, `Succeeded` or `Failed`.
    pub status: String,
    #[serde(default)]
    pub http_status_code: Option<u16>,
    #[serde(default)]
    pub error: Option<OperationError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationError {
    pub code: String,
    pub message: String,
}
