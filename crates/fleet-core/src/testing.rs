//! In-memory cloud and fixtures shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::config::{
    Containers, DataDiskSpec, DeploymentSpec, NatPort, NetSpec, Protocol, RootDiskSpec,
    StorageAccount, SystemSpec, VmTemplate,
};
use crate::plan::StepKind;
use crate::types::{
    CloudFault, DeploymentInfo, DiskInfo, EndpointInfo, HostedServiceInfo, OperationHandle,
    OperationStatus, OsImage, PublicIpInfo, ResourceRef, RoleInfo, RoleOperation, Scope,
};
use crate::{CloudControl, Error, Result};

pub fn scope() -> Scope {
    Scope {
        service: "fleet-svc".into(),
        deployment: "fleet-dep".into(),
    }
}

pub fn fault(code: &str, message: &str) -> CloudFault {
    CloudFault {
        code: code.into(),
        message: message.into(),
    }
}

pub fn blob_url(container: &str, blob: &str) -> String {
    format!("https://fleetstore.blob.core.windows.net/{container}/{blob}")
}

pub fn deployment_spec(n_vms: usize) -> DeploymentSpec {
    DeploymentSpec {
        subscription_id: "00000000-0000-0000-0000-000000000000".into(),
        certificate_path: PathBuf::from("/etc/fleet/management.pem"),
        storage: StorageAccount {
            account: "fleetstore".into(),
            access_key: "c2VjcmV0".into(),
        },
        containers: Containers {
            vhds: "vhds".into(),
            images: "images".into(),
        },
        service_name: "fleet-svc".into(),
        service_location: "West Europe".into(),
        deployment_name: "fleet-dep".into(),
        network_name: "fleet-net".into(),
        n_vms,
    }
}

pub fn vm_template() -> VmTemplate {
    VmTemplate {
        net: NetSpec {
            nat_ports: vec![
                NatPort {
                    name: "ssh".into(),
                    protocol: Protocol::Tcp,
                    port: 22,
                    lb: false,
                },
                NatPort {
                    name: "http".into(),
                    protocol: Protocol::Tcp,
                    port: 80,
                    lb: true,
                },
            ],
            subnet_names: vec!["frontend".into()],
            public_ip_name_tpls: vec!["ip-{vm_name}".into()],
        },
        root_disk: RootDiskSpec {
            source_image: "ubuntu-14_04-lts".into(),
            name_tpl: "root-{vm_name}".into(),
        },
        data_disks: vec![DataDiskSpec {
            url_tpl: "https://fleetstore.blob.core.windows.net/vhds/{vm_name}-data0.vhd".into(),
            size_gb: 100,
        }],
        system: SystemSpec {
            host_name_tpl: "{vm_name}".into(),
            user_data_tpl: "host={vm_name}".into(),
        },
        size: "Small".into(),
    }
}

type StepPredicate = Box<dyn Fn(&StepKind) -> bool + Send + Sync>;
type ResourcePredicate = Box<dyn Fn(&ResourceRef) -> bool + Send + Sync>;

struct FakeOp {
    remaining: usize,
    fault: Option<CloudFault>,
    reads: usize,
}

#[derive(Default)]
struct State {
    next_op: usize,
    ops: HashMap<String, FakeOp>,
    resources: HashSet<ResourceRef>,
    service: Option<HostedServiceInfo>,
    roles: Vec<RoleInfo>,
    detach_lag: HashMap<String, usize>,
    containers: HashSet<String>,
    creates: Vec<StepKind>,
    deletes: Vec<ResourceRef>,
    copies: Vec<(String, String, String)>,
    images: Vec<OsImage>,
    role_ops: Vec<(RoleOperation, Vec<String>)>,
    create_faults: Vec<(StepPredicate, CloudFault)>,
    delete_faults: Vec<(ResourcePredicate, CloudFault)>,
}

/// Cloud that keeps resources in memory and completes operations after a
/// configurable number of `InProgress` polls.
pub struct FakeCloud {
    in_progress_polls: usize,
    detach_lag: usize,
    state: Mutex<State>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self {
            in_progress_polls: 1,
            detach_lag: 0,
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_in_progress_polls(mut self, polls: usize) -> Self {
        self.in_progress_polls = polls;
        self
    }

    pub fn never_finishing(self) -> Self {
        self.with_in_progress_polls(usize::MAX)
    }

    /// Disks keep reporting an attachment this many times after their VM
    /// was deleted.
    pub fn with_detach_lag(mut self, checks: usize) -> Self {
        self.detach_lag = checks;
        self
    }

    pub fn with_service(self, location: &str) -> Self {
        {
            let mut st = self.state.lock().unwrap();
            st.service = Some(HostedServiceInfo {
                name: scope().service,
                location: location.into(),
            });
            st.resources.insert(ResourceRef::HostedService);
        }
        self
    }

    pub fn fail_when(
        &self,
        predicate: impl Fn(&StepKind) -> bool + Send + Sync + 'static,
        fault: CloudFault,
    ) {
        self.lock().create_faults.push((Box::new(predicate), fault));
    }

    pub fn fail_delete_when(
        &self,
        predicate: impl Fn(&ResourceRef) -> bool + Send + Sync + 'static,
        fault: CloudFault,
    ) {
        self.lock().delete_faults.push((Box::new(predicate), fault));
    }

    pub fn status_reads(&self, request_id: &str) -> usize {
        self.lock().ops.get(request_id).map_or(0, |op| op.reads)
    }

    pub fn total_status_reads(&self) -> usize {
        self.lock().ops.values().map(|op| op.reads).sum()
    }

    pub fn creates(&self) -> Vec<StepKind> {
        self.lock().creates.clone()
    }

    pub fn deletes(&self) -> Vec<ResourceRef> {
        self.lock().deletes.clone()
    }

    pub fn exists(&self, resource: &ResourceRef) -> bool {
        self.lock().resources.contains(resource)
    }

    pub fn resource_count(&self) -> usize {
        self.lock().resources.len()
    }

    pub fn containers(&self) -> HashSet<String> {
        self.lock().containers.clone()
    }

    pub fn copies(&self) -> Vec<(String, String, String)> {
        self.lock().copies.clone()
    }

    pub fn images(&self) -> Vec<OsImage> {
        self.lock().images.clone()
    }

    pub fn role_ops(&self) -> Vec<(RoleOperation, Vec<String>)> {
        self.lock().role_ops.clone()
    }

    pub fn set_role_status(&self, role: &str, status: &str) {
        let mut st = self.lock();
        if let Some(r) = st.roles.iter_mut().find(|r| r.role_name == role) {
            r.instance_status = status.into();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn start_op(&self, st: &mut State, fault: Option<CloudFault>) -> OperationHandle {
        st.next_op += 1;
        let id = format!("op-{}", st.next_op);
        st.ops.insert(
            id.clone(),
            FakeOp {
                remaining: self.in_progress_polls,
                fault,
                reads: 0,
            },
        );
        OperationHandle::new(id)
    }

    fn apply(st: &mut State, scope: &Scope, step: &StepKind) {
        st.resources.insert(step.resource());
        match step {
            StepKind::HostedService { name, location } => {
                st.service = Some(HostedServiceInfo {
                    name: name.clone(),
                    location: location.clone(),
                });
            }
            StepKind::Role(spec) => st.roles.push(RoleInfo {
                role_name: spec.role_name.clone(),
                instance_name: spec.role_name.clone(),
                instance_status: "ReadyRole".into(),
                host_name: spec.host_name.clone(),
                os_disk: Some(DiskInfo {
                    name: spec.os_disk.clone(),
                    media_link: blob_url("vhds", &format!("{}.vhd", spec.os_disk)),
                }),
                data_disks: spec
                    .data_disks
                    .iter()
                    .map(|d| DiskInfo {
                        name: d.clone(),
                        media_link: blob_url("vhds", &format!("{d}.vhd")),
                    })
                    .collect(),
                subnet_names: spec.subnets.clone(),
                endpoints: Vec::new(),
                public_ips: spec
                    .public_ips
                    .iter()
                    .map(|name| PublicIpInfo {
                        name: name.clone(),
                        address: Some("203.0.113.10".into()),
                    })
                    .collect(),
            }),
            StepKind::Endpoint {
                role,
                name,
                protocol,
                local_port,
                public_port,
                ..
            } => {
                if let Some(r) = st.roles.iter_mut().find(|r| &r.role_name == role) {
                    r.endpoints.push(EndpointInfo {
                        name: name.clone(),
                        protocol: protocol.clone(),
                        vip: format!("{}.cloudapp.net", scope.service),
                        local_port: *local_port,
                        public_port: *public_port,
                    });
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl CloudControl for FakeCloud {
    fn blob_url(&self, container: &str, blob: &str) -> String {
        blob_url(container, blob)
    }

    async fn ensure_container(&self, container: &str) -> Result<()> {
        self.lock().containers.insert(container.to_string());
        Ok(())
    }

    async fn copy_blob(&self, container: &str, blob: &str, source_url: &str) -> Result<()> {
        self.lock()
            .copies
            .push((container.into(), blob.into(), source_url.into()));
        Ok(())
    }

    async fn get_hosted_service(&self, _service: &str) -> Result<Option<HostedServiceInfo>> {
        let st = self.lock();
        Ok(st
            .service
            .clone()
            .filter(|_| st.resources.contains(&ResourceRef::HostedService)))
    }

    async fn get_deployment(&self, scope: &Scope) -> Result<Option<DeploymentInfo>> {
        let st = self.lock();
        if !st.resources.contains(&ResourceRef::Deployment) {
            return Ok(None);
        }
        Ok(Some(DeploymentInfo {
            name: scope.deployment.clone(),
            roles: st.roles.clone(),
        }))
    }

    async fn create(&self, scope: &Scope, step: &StepKind) -> Result<OperationHandle> {
        let mut st = self.lock();
        st.creates.push(step.clone());

        let fault = st
            .create_faults
            .iter()
            .find(|(p, _)| p(step))
            .map(|(_, f)| f.clone());
        if fault.is_none() {
            Self::apply(&mut st, scope, step);
        }
        Ok(self.start_op(&mut st, fault))
    }

    async fn delete(&self, _scope: &Scope, resource: &ResourceRef) -> Result<OperationHandle> {
        let mut st = self.lock();
        st.deletes.push(resource.clone());

        if let Some(fault) = st
            .delete_faults
            .iter()
            .find(|(p, _)| p(resource))
            .map(|(_, f)| f.clone())
        {
            return Ok(self.start_op(&mut st, Some(fault)));
        }
        if !st.resources.remove(resource) {
            return Err(Error::NotFound(resource.to_string()));
        }

        match resource {
            ResourceRef::Role { role } => {
                if let Some(pos) = st.roles.iter().position(|r| &r.role_name == role) {
                    let removed = st.roles.remove(pos);
                    for disk in removed.os_disk.iter().chain(&removed.data_disks) {
                        st.detach_lag.insert(disk.name.clone(), self.detach_lag);
                    }
                }
            }
            ResourceRef::Endpoint { role, name } => {
                if let Some(r) = st.roles.iter_mut().find(|r| &r.role_name == role) {
                    r.endpoints.retain(|e| &e.name != name);
                }
            }
            ResourceRef::HostedService => st.service = None,
            _ => {}
        }
        Ok(self.start_op(&mut st, None))
    }

    async fn disk_attached_to(&self, disk: &str) -> Result<Option<String>> {
        let mut st = self.lock();
        if let Some(role) = st.roles.iter().find(|r| {
            r.os_disk.iter().chain(&r.data_disks).any(|d| d.name == disk)
        }) {
            return Ok(Some(role.role_name.clone()));
        }
        match st.detach_lag.get_mut(disk) {
            Some(lag) if *lag > 0 => {
                *lag -= 1;
                Ok(Some("detaching".into()))
            }
            _ => Ok(None),
        }
    }

    async fn roles_operation(
        &self,
        _scope: &Scope,
        op: RoleOperation,
        roles: &[String],
    ) -> Result<OperationHandle> {
        let mut st = self.lock();
        let status = match op {
            RoleOperation::Start => "ReadyRole",
            RoleOperation::StopDeallocate => "StoppedDeallocated",
        };
        for r in st.roles.iter_mut().filter(|r| roles.contains(&r.role_name)) {
            r.instance_status = status.into();
        }
        st.role_ops.push((op, roles.to_vec()));
        Ok(self.start_op(&mut st, None))
    }

    async fn add_os_image(&self, image: &OsImage) -> Result<OperationHandle> {
        let mut st = self.lock();
        st.images.push(image.clone());
        Ok(self.start_op(&mut st, None))
    }

    async fn operation_status(&self, handle: &OperationHandle) -> Result<OperationStatus> {
        let mut st = self.lock();
        let op = st
            .ops
            .get_mut(&handle.request_id)
            .ok_or_else(|| Error::NotFound(handle.request_id.clone()))?;
        op.reads += 1;
        if op.remaining > 0 {
            op.remaining -= 1;
            return Ok(OperationStatus::classify("InProgress", None));
        }
        Ok(match &op.fault {
            Some(fault) => OperationStatus::classify("Failed", Some(fault.clone())),
            None => OperationStatus::classify("Succeeded", None),
        })
    }
}
