//! [`CloudControl`] backed by the service-management API and blob storage.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use mgmt_api::blob::BlobClient;
use mgmt_api::{RequestId, ServiceManagementClient};
use tracing::{info, warn};

use crate::config::{DeploymentSpec, RunSettings};
use crate::plan::{DEPLOYMENT_SLOT, RoleSpec, StepKind};
use crate::types::{
    CloudFault, DeploymentInfo, DiskInfo, EndpointInfo, HostedServiceInfo, OperationHandle,
    OperationStatus, OsImage, PublicIpInfo, ResourceRef, RoleInfo, RoleOperation, Scope,
};
use crate::{CloudControl, Result};

pub struct ServiceManagementCloud {
    client: ServiceManagementClient,
    blobs: BlobClient,
}

impl ServiceManagementCloud {
    pub fn new(client: ServiceManagementClient, blobs: BlobClient) -> Self {
        Self { client, blobs }
    }

    /// Load the management certificate named by the deployment spec and
    /// build both clients.
    pub fn from_spec(spec: &DeploymentSpec, settings: &RunSettings) -> Result<Self> {
        let pem = std::fs::read(&spec.certificate_path)?;
        let client = ServiceManagementClient::with_certificate(
            &spec.subscription_id,
            &settings.management_url,
            &pem,
        )?;
        let blobs = BlobClient::new(
            &spec.storage.account,
            &spec.storage.access_key,
            &settings.blob_endpoint_suffix,
        )?;

        info!(
            subscription = %spec.subscription_id,
            storage = %spec.storage.account,
            "service management client ready"
        );
        Ok(Self::new(client, blobs))
    }
}

fn handle(id: RequestId) -> OperationHandle {
    OperationHandle::new(id.0)
}

fn role_request(spec: &RoleSpec) -> mgmt_api::CreateRoleRequest {
    mgmt_api::CreateRoleRequest {
        role_name: spec.role_name.clone(),
        role_size: spec.size.clone(),
        os_disk_name: spec.os_disk.clone(),
        data_disk_names: spec.data_disks.clone(),
        public_ip_names: spec.public_ips.clone(),
        subnet_names: spec.subnets.clone(),
        system_config: mgmt_api::LinuxConfigurationSet {
            host_name: spec.host_name.clone(),
            custom_data: BASE64.encode(&spec.user_data),
            disable_ssh_password_authentication: true,
            provision_guest_agent: true,
        },
    }
}

/// Merge the configured roles with their running instances.
fn deployment_info(deployment: mgmt_api::Deployment) -> DeploymentInfo {
    let mgmt_api::Deployment {
        name,
        role_list,
        role_instance_list,
    } = deployment;

    let roles = role_list
        .into_iter()
        .map(|role| {
            let instance = role_instance_list
                .iter()
                .find(|i| i.role_name == role.role_name);

            let endpoints = instance
                .map(|i| {
                    i.instance_endpoints
                        .iter()
                        .filter_map(|ep| {
                            let (Ok(local_port), Ok(public_port)) =
                                (ep.local_port.parse::<u16>(), ep.public_port.parse::<u16>())
                            else {
                                warn!(endpoint = %ep.name, "endpoint with unparsable ports ignored");
                                return None;
                            };
                            Some(EndpointInfo {
                                name: ep.name.clone(),
                                protocol: ep.protocol.clone(),
                                vip: ep.vip.clone(),
                                local_port,
                                public_port,
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();

            let public_ips = instance
                .map(|i| {
                    i.public_ips
                        .iter()
                        .map(|ip| PublicIpInfo {
                            name: ip.name.clone(),
                            address: ip.address.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default();

            RoleInfo {
                instance_name: instance
                    .map(|i| i.instance_name.clone())
                    .unwrap_or_else(|| role.role_name.clone()),
                instance_status: instance
                    .map(|i| i.instance_status.clone())
                    .unwrap_or_else(|| "Unknown".into()),
                host_name: instance
                    .and_then(|i| i.host_name.clone())
                    .unwrap_or_default(),
                os_disk: role.os_virtual_hard_disk.map(|d| DiskInfo {
                    name: d.disk_name,
                    media_link: d.media_link,
                }),
                data_disks: role
                    .data_virtual_hard_disks
                    .into_iter()
                    .map(|d| DiskInfo {
                        name: d.disk_name,
                        media_link: d.media_link,
                    })
                    .collect(),
                subnet_names: role.subnet_names,
                endpoints,
                public_ips,
                role_name: role.role_name,
            }
        })
        .collect();

    DeploymentInfo { name, roles }
}

#[async_trait]
impl CloudControl for ServiceManagementCloud {
    fn blob_url(&self, container: &str, blob: &str) -> String {
        self.blobs.blob_url(container, blob)
    }

    async fn ensure_container(&self, container: &str) -> Result<()> {
        if self.blobs.create_container(container).await? {
            info!(container, "storage container created");
        }
        Ok(())
    }

    async fn copy_blob(&self, container: &str, blob: &str, source_url: &str) -> Result<()> {
        Ok(self.blobs.copy_blob(container, blob, source_url).await?)
    }

    async fn get_hosted_service(&self, service: &str) -> Result<Option<HostedServiceInfo>> {
        Ok(self
            .client
            .get_hosted_service(service)
            .await?
            .map(|s| HostedServiceInfo {
                name: s.service_name,
                location: s.location,
            }))
    }

    async fn get_deployment(&self, scope: &Scope) -> Result<Option<DeploymentInfo>> {
        Ok(self
            .client
            .get_deployment(&scope.service, &scope.deployment)
            .await?
            .map(deployment_info))
    }

    async fn create(&self, scope: &Scope, step: &StepKind) -> Result<OperationHandle> {
        let (svc, dep) = (scope.service.as_str(), scope.deployment.as_str());
        let c = &self.client;

        let id = match step {
            StepKind::HostedService { name, location } => {
                c.create_hosted_service(&mgmt_api::CreateHostedServiceRequest {
                    service_name: name.clone(),
                    label: name.clone(),
                    location: location.clone(),
                })
                .await?
            }
            StepKind::Deployment {
                name,
                label,
                network,
            } => {
                c.create_deployment(
                    svc,
                    &mgmt_api::CreateDeploymentRequest {
                        name: name.clone(),
                        deployment_slot: DEPLOYMENT_SLOT.into(),
                        label: label.clone(),
                        virtual_network_name: network.clone(),
                    },
                )
                .await?
            }
            StepKind::PublicIp { role, name } => {
                c.reserve_public_ip(
                    svc,
                    dep,
                    role,
                    &mgmt_api::ReservePublicIpRequest { name: name.clone() },
                )
                .await?
            }
            StepKind::NetworkConfig {
                role,
                network,
                subnets,
            } => {
                c.set_network_config(
                    svc,
                    dep,
                    role,
                    &mgmt_api::NetworkConfigRequest {
                        virtual_network_name: network.clone(),
                        subnet_names: subnets.clone(),
                    },
                )
                .await?
            }
            StepKind::RootDisk {
                name,
                source_image,
                media_link,
            } => {
                c.add_disk(&mgmt_api::AddDiskRequest {
                    name: name.clone(),
                    label: name.clone(),
                    media_link: media_link.clone(),
                    source_image_name: Some(source_image.clone()),
                    logical_disk_size_in_gb: None,
                })
                .await?
            }
            StepKind::DataDisk {
                name,
                media_link,
                size_gb,
                ..
            } => {
                c.add_disk(&mgmt_api::AddDiskRequest {
                    name: name.clone(),
                    label: name.clone(),
                    media_link: media_link.clone(),
                    source_image_name: None,
                    logical_disk_size_in_gb: Some(*size_gb),
                })
                .await?
            }
            StepKind::Role(spec) => c.create_role(svc, dep, &role_request(spec)).await?,
            StepKind::Endpoint {
                role,
                name,
                protocol,
                local_port,
                public_port,
                lb_set,
            } => {
                c.add_endpoint(
                    svc,
                    dep,
                    role,
                    &mgmt_api::InputEndpoint {
                        name: name.clone(),
                        protocol: protocol.clone(),
                        local_port: *local_port,
                        port: *public_port,
                        load_balanced_endpoint_set_name: lb_set.clone(),
                    },
                )
                .await?
            }
        };
        Ok(handle(id))
    }

    async fn delete(&self, scope: &Scope, resource: &ResourceRef) -> Result<OperationHandle> {
        let (svc, dep) = (scope.service.as_str(), scope.deployment.as_str());
        let c = &self.client;

        let id = match resource {
            ResourceRef::HostedService => c.delete_hosted_service(svc).await?,
            ResourceRef::Deployment => c.delete_deployment(svc, dep).await?,
            ResourceRef::PublicIp { role, name } => c.release_public_ip(svc, dep, role, name).await?,
            ResourceRef::NetworkConfig { role } => c.clear_network_config(svc, dep, role).await?,
            ResourceRef::Disk { name } => c.delete_disk(name).await?,
            ResourceRef::Role { role } => c.delete_role(svc, dep, role).await?,
            ResourceRef::Endpoint { role, name } => c.delete_endpoint(svc, dep, role, name).await?,
        };
        Ok(handle(id))
    }

    async fn disk_attached_to(&self, disk: &str) -> Result<Option<String>> {
        Ok(self
            .client
            .get_disk(disk)
            .await?
            .and_then(|d| d.attached_to)
            .map(|a| a.role_name))
    }

    async fn roles_operation(
        &self,
        scope: &Scope,
        op: RoleOperation,
        roles: &[String],
    ) -> Result<OperationHandle> {
        let (operation_type, post_shutdown_action) = match op {
            RoleOperation::Start => (mgmt_api::RoleOperationType::StartRolesOperation, None),
            RoleOperation::StopDeallocate => (
                mgmt_api::RoleOperationType::ShutdownRolesOperation,
                Some("StoppedDeallocated".to_string()),
            ),
        };
        let id = self
            .client
            .roles_operation(
                &scope.service,
                &scope.deployment,
                &mgmt_api::RolesOperationRequest {
                    operation_type,
                    roles: roles.to_vec(),
                    post_shutdown_action,
                },
            )
            .await?;
        Ok(handle(id))
    }

    async fn add_os_image(&self, image: &OsImage) -> Result<OperationHandle> {
        let id = self
            .client
            .add_os_image(&mgmt_api::AddOsImageRequest {
                label: image.label.clone(),
                media_link: image.media_link.clone(),
                name: image.name.clone(),
                os: image.os.clone(),
            })
            .await?;
        Ok(handle(id))
    }

    async fn operation_status(&self, handle: &OperationHandle) -> Result<OperationStatus> {
        let status = self
            .client
            .get_operation_status(&RequestId(handle.request_id.clone()))
            .await?;
        let fault = status.error.map(|e| CloudFault {
            code: e.code,
            message: e.message,
        });
        Ok(OperationStatus::classify(status.status, fault))
    }
}
