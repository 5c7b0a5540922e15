//! Turning a VM template and generated names into ordered resource steps.
//!
//! Per-VM step order is a fixed table:
//!
//! | phase     | steps                                         |
//! |-----------|-----------------------------------------------|
//! | network   | public IPs, then subnet configuration         |
//! | disks     | root disk, then data disks                    |
//! | instance  | the VM itself, referencing all of the above   |
//! | endpoints | one NAT endpoint per `nat_ports` entry        |
//!
//! Hosted service and deployment are shared steps that precede every VM.
//! Building a plan performs no I/O.

use crate::config::{DeploymentSpec, VmTemplate};
use crate::names::PortAllocator;
use crate::template::{Context, resolve};
use crate::types::{ResolvedVm, ResourceRef, Scope, VmIdentity, VmName};
use crate::Result;

/// Deployment slot every deployment is created in.
pub const DEPLOYMENT_SLOT: &str = "Production";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Network,
    Disks,
    Instance,
    Endpoints,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Network, Phase::Disks, Phase::Instance, Phase::Endpoints];
}

/// Everything the VM instance step needs to reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSpec {
    pub role_name: String,
    pub host_name: String,
    pub user_data: String,
    pub size: String,
    pub os_disk: String,
    pub data_disks: Vec<String>,
    pub public_ips: Vec<String>,
    pub subnets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    HostedService {
        name: String,
        location: String,
    },
    Deployment {
        name: String,
        label: String,
        network: String,
    },
    PublicIp {
        role: String,
        name: String,
    },
    NetworkConfig {
        role: String,
        network: String,
        subnets: Vec<String>,
    },
    RootDisk {
        name: String,
        source_image: String,
        media_link: String,
    },
    DataDisk {
        name: String,
        lun: u32,
        media_link: String,
        size_gb: u32,
    },
    Role(RoleSpec),
    Endpoint {
        role: String,
        name: String,
        protocol: String,
        local_port: u16,
        public_port: u16,
        /// Deployment-wide load-balanced set, for `lb: true` mappings.
        lb_set: Option<String>,
    },
}

impl StepKind {
    /// Per-VM phase; `None` for shared steps.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::HostedService { .. } | Self::Deployment { .. } => None,
            Self::PublicIp { .. } | Self::NetworkConfig { .. } => Some(Phase::Network),
            Self::RootDisk { .. } | Self::DataDisk { .. } => Some(Phase::Disks),
            Self::Role(_) => Some(Phase::Instance),
            Self::Endpoint { .. } => Some(Phase::Endpoints),
        }
    }

    /// The resource this step creates, as teardown addresses it.
    pub fn resource(&self) -> ResourceRef {
        match self {
            Self::HostedService { .. } => ResourceRef::HostedService,
            Self::Deployment { .. } => ResourceRef::Deployment,
            Self::PublicIp { role, name } => ResourceRef::PublicIp {
                role: role.clone(),
                name: name.clone(),
            },
            Self::NetworkConfig { role, .. } => ResourceRef::NetworkConfig { role: role.clone() },
            Self::RootDisk { name, .. } | Self::DataDisk { name, .. } => {
                ResourceRef::Disk { name: name.clone() }
            }
            Self::Role(role) => ResourceRef::Role {
                role: role.role_name.clone(),
            },
            Self::Endpoint { role, name, .. } => ResourceRef::Endpoint {
                role: role.clone(),
                name: name.clone(),
            },
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::HostedService { name, .. } => format!("create hosted service '{name}'"),
            Self::Deployment { name, .. } => format!("create deployment '{name}'"),
            other => format!("create {}", other.resource()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOwner {
    Shared,
    Vm(VmName),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceStep {
    pub owner: StepOwner,
    pub kind: StepKind,
}

/// One VM's identity and its ordered steps.
#[derive(Debug, Clone)]
pub struct VmPlan {
    pub identity: VmIdentity,
    pub steps: Vec<ResourceStep>,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub scope: Scope,
    pub shared: Vec<ResourceStep>,
    pub vms: Vec<VmPlan>,
}

/// Name of the load-balanced set a `lb: true` mapping joins.
pub fn lb_set_name(port_name: &str) -> String {
    format!("lb-{port_name}")
}

/// Name of the disk entity for data disk `lun` of a VM.
pub fn data_disk_name(vm: &VmName, lun: u32) -> String {
    format!("{vm}-data-{lun}")
}

pub struct PlanBuilder<'a> {
    spec: &'a DeploymentSpec,
    template: &'a VmTemplate,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(spec: &'a DeploymentSpec, template: &'a VmTemplate) -> Self {
        Self { spec, template }
    }

    pub fn scope(&self) -> Scope {
        self.spec.scope()
    }

    /// Attributes visible to the templates of VM `index`.
    pub fn vm_context(&self, name: &VmName, index: usize) -> Context {
        Context::new()
            .with("vm_name", name)
            .with("vm_index", index)
            .with("service_name", &self.spec.service_name)
            .with("deployment_name", &self.spec.deployment_name)
            .with("network_name", &self.spec.network_name)
    }

    /// Build the full plan. `blob_url(container, blob)` locates root disk
    /// VHDs in the storage account.
    pub fn build(
        &self,
        names: &[VmName],
        ports: &mut PortAllocator,
        blob_url: &dyn Fn(&str, &str) -> String,
    ) -> Result<Plan> {
        for nat in self.template.net.nat_ports.iter().filter(|n| n.lb) {
            ports.reserve(nat.port);
        }

        let vms = names
            .iter()
            .enumerate()
            .map(|(index, name)| self.vm_plan(name, index, ports, blob_url))
            .collect::<Result<Vec<_>>>()?;

        Ok(Plan {
            scope: self.scope(),
            shared: self.shared_steps(),
            vms,
        })
    }

    fn shared_steps(&self) -> Vec<ResourceStep> {
        let spec = self.spec;
        [
            StepKind::HostedService {
                name: spec.service_name.clone(),
                location: spec.service_location.clone(),
            },
            StepKind::Deployment {
                name: spec.deployment_name.clone(),
                label: spec.deployment_name.clone(),
                network: spec.network_name.clone(),
            },
        ]
        .into_iter()
        .map(|kind| ResourceStep {
            owner: StepOwner::Shared,
            kind,
        })
        .collect()
    }

    /// Resolve every template field for one VM.
    pub fn resolve_vm(
        &self,
        name: &VmName,
        index: usize,
        blob_url: &dyn Fn(&str, &str) -> String,
    ) -> Result<ResolvedVm> {
        let ctx = self.vm_context(name, index);
        let tpl = self.template;

        let root_disk_name = resolve(&tpl.root_disk.name_tpl, &ctx)?;
        let root_disk_url = blob_url(&self.spec.containers.vhds, &format!("{root_disk_name}.vhd"));

        Ok(ResolvedVm {
            host_name: resolve(&tpl.system.host_name_tpl, &ctx)?,
            user_data: resolve(&tpl.system.user_data_tpl, &ctx)?,
            public_ip_names: tpl
                .net
                .public_ip_name_tpls
                .iter()
                .map(|t| resolve(t, &ctx))
                .collect::<Result<_>>()?,
            root_disk_name,
            root_disk_url,
            data_disk_urls: tpl
                .data_disks
                .iter()
                .map(|d| resolve(&d.url_tpl, &ctx))
                .collect::<Result<_>>()?,
        })
    }

    fn vm_plan(
        &self,
        name: &VmName,
        index: usize,
        ports: &mut PortAllocator,
        blob_url: &dyn Fn(&str, &str) -> String,
    ) -> Result<VmPlan> {
        let resolved = self.resolve_vm(name, index, blob_url)?;
        let tpl = self.template;
        let role = name.to_string();
        let mut kinds = Vec::new();

        for ip in &resolved.public_ip_names {
            kinds.push(StepKind::PublicIp {
                role: role.clone(),
                name: ip.clone(),
            });
        }
        if !tpl.net.subnet_names.is_empty() {
            kinds.push(StepKind::NetworkConfig {
                role: role.clone(),
                network: self.spec.network_name.clone(),
                subnets: tpl.net.subnet_names.clone(),
            });
        }

        kinds.push(StepKind::RootDisk {
            name: resolved.root_disk_name.clone(),
            source_image: tpl.root_disk.source_image.clone(),
            media_link: resolved.root_disk_url.clone(),
        });
        let mut data_disks = Vec::new();
        for (lun, (spec, url)) in (0u32..).zip(tpl.data_disks.iter().zip(&resolved.data_disk_urls)) {
            let disk_name = data_disk_name(name, lun);
            data_disks.push(disk_name.clone());
            kinds.push(StepKind::DataDisk {
                name: disk_name,
                lun,
                media_link: url.clone(),
                size_gb: spec.size_gb,
            });
        }

        kinds.push(StepKind::Role(RoleSpec {
            role_name: role.clone(),
            host_name: resolved.host_name.clone(),
            user_data: resolved.user_data.clone(),
            size: tpl.size.clone(),
            os_disk: resolved.root_disk_name.clone(),
            data_disks,
            public_ips: resolved.public_ip_names.clone(),
            subnets: tpl.net.subnet_names.clone(),
        }));

        for nat in &tpl.net.nat_ports {
            let (public_port, lb_set) = if nat.lb {
                (nat.port, Some(lb_set_name(&nat.name)))
            } else {
                (ports.allocate()?, None)
            };
            kinds.push(StepKind::Endpoint {
                role: role.clone(),
                name: nat.name.clone(),
                protocol: nat.protocol.as_str().to_string(),
                local_port: nat.port,
                public_port,
                lb_set,
            });
        }

        let steps = kinds
            .into_iter()
            .map(|kind| ResourceStep {
                owner: StepOwner::Vm(name.clone()),
                kind,
            })
            .collect();

        Ok(VmPlan {
            identity: VmIdentity::new(name.clone(), index, resolved),
            steps,
        })
    }
}
