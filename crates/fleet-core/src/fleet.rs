//! The set of resources a fleet owns, either recorded while provisioning
//! or rebuilt from what the cloud reports.

use tracing::info;

use crate::types::{
    ResolvedVm, ResourceHandle, ResourceRef, RoleInfo, Scope, VmIdentity, VmName,
};
use crate::{CloudControl, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fleet {
    pub scope: Scope,
    /// Hosted service and deployment, in creation order.
    pub shared: Vec<ResourceHandle>,
    pub vms: Vec<VmIdentity>,
}

impl Fleet {
    pub fn empty(scope: Scope) -> Self {
        Self {
            scope,
            shared: Vec::new(),
            vms: Vec::new(),
        }
    }

    pub fn role_names(&self) -> Vec<String> {
        self.vms.iter().map(|vm| vm.name.to_string()).collect()
    }

    /// Rebuild the fleet from the live deployment, so a process that did
    /// not provision it can still stop, snapshot or tear it down.
    ///
    /// Resources are listed in the order provisioning creates them.
    pub async fn discover(cloud: &dyn CloudControl, scope: Scope) -> Result<Self> {
        let mut fleet = Self::empty(scope);

        if cloud.get_hosted_service(&fleet.scope.service).await?.is_none() {
            info!(service = %fleet.scope.service, "hosted service not found, nothing to discover");
            return Ok(fleet);
        }
        fleet.shared.push(adopted(ResourceRef::HostedService));

        let Some(deployment) = cloud.get_deployment(&fleet.scope).await? else {
            info!(deployment = %fleet.scope.deployment, "deployment not found");
            return Ok(fleet);
        };
        fleet.shared.push(adopted(ResourceRef::Deployment));

        fleet.vms = deployment
            .roles
            .iter()
            .enumerate()
            .map(|(index, role)| identity_from_role(index, role))
            .collect();

        info!(
            service = %fleet.scope.service,
            deployment = %fleet.scope.deployment,
            vms = fleet.vms.len(),
            "discovered fleet"
        );
        Ok(fleet)
    }
}

fn adopted(resource: ResourceRef) -> ResourceHandle {
    ResourceHandle {
        resource,
        request_id: None,
    }
}

fn identity_from_role(index: usize, role: &RoleInfo) -> VmIdentity {
    let name = VmName(role.role_name.clone());
    let role_name = &role.role_name;
    let mut resources = Vec::new();

    for ip in &role.public_ips {
        resources.push(adopted(ResourceRef::PublicIp {
            role: role_name.clone(),
            name: ip.name.clone(),
        }));
    }
    if !role.subnet_names.is_empty() {
        resources.push(adopted(ResourceRef::NetworkConfig {
            role: role_name.clone(),
        }));
    }
    for disk in role.os_disk.iter().chain(&role.data_disks) {
        resources.push(adopted(ResourceRef::Disk {
            name: disk.name.clone(),
        }));
    }
    resources.push(adopted(ResourceRef::Role {
        role: role_name.clone(),
    }));
    for ep in &role.endpoints {
        resources.push(adopted(ResourceRef::Endpoint {
            role: role_name.clone(),
            name: ep.name.clone(),
        }));
    }

    let resolved = ResolvedVm {
        host_name: role.host_name.clone(),
        user_data: String::new(),
        public_ip_names: role.public_ips.iter().map(|ip| ip.name.clone()).collect(),
        root_disk_name: role.os_disk.as_ref().map(|d| d.name.clone()).unwrap_or_default(),
        root_disk_url: role
            .os_disk
            .as_ref()
            .map(|d| d.media_link.clone())
            .unwrap_or_default(),
        data_disk_urls: role.data_disks.iter().map(|d| d.media_link.clone()).collect(),
    };

    VmIdentity {
        name,
        index,
        resolved,
        resources,
    }
}
