//! Deleting a fleet in reverse creation order.

use std::collections::HashMap;

use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::fleet::Fleet;
use crate::operation::OperationTracker;
use crate::types::{ResourceHandle, ResourceRef, Scope, VmIdentity};
use crate::{Error, Result, TeardownFailure};

const SHARED_OWNER: &str = "shared";

#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Resources whose delete operation succeeded.
    pub deleted: Vec<ResourceRef>,
    /// Resources that were already gone.
    pub absent: Vec<ResourceRef>,
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    pub fn deletes_issued(&self) -> usize {
        self.deleted.len() + self.absent.len() + self.failures.len()
    }

    pub fn ensure_clean(self) -> Result<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown(self.failures))
        }
    }

    fn merge(&mut self, other: TeardownReport) {
        self.deleted.extend(other.deleted);
        self.absent.extend(other.absent);
        self.failures.extend(other.failures);
    }

    fn record(&mut self, owner: &str, resource: &ResourceRef, outcome: Result<Deleted>) {
        match outcome {
            Ok(Deleted::Now) => self.deleted.push(resource.clone()),
            Ok(Deleted::Already) => self.absent.push(resource.clone()),
            Err(e) => {
                error!(owner, %resource, error = %e, "delete failed");
                self.failures.push(TeardownFailure {
                    owner: owner.to_string(),
                    resource: resource.clone(),
                    error: e.to_string(),
                });
            }
        }
    }
}

enum Deleted {
    Now,
    Already,
}

pub struct TeardownOrchestrator {
    tracker: OperationTracker,
}

impl TeardownOrchestrator {
    pub fn new(tracker: OperationTracker) -> Self {
        Self { tracker }
    }

    /// Delete every resource of `fleet`. VMs are torn down concurrently,
    /// the deployment and hosted service after all of them.
    ///
    /// Never fails as a whole: per-resource failures are collected in the
    /// report and the remaining resources are still attempted.
    pub async fn teardown(&self, fleet: &Fleet) -> TeardownReport {
        info!(
            service = %fleet.scope.service,
            deployment = %fleet.scope.deployment,
            vms = fleet.vms.len(),
            "tearing down fleet"
        );

        let mut report = TeardownReport::default();
        let mut tasks = JoinSet::new();
        let mut owners = HashMap::new();
        for vm in fleet.vms.iter().filter(|vm| !vm.resources.is_empty()) {
            let handle = tasks.spawn(teardown_vm(
                self.tracker.clone(),
                fleet.scope.clone(),
                vm.clone(),
            ));
            owners.insert(handle.id(), vm.name.to_string());
        }
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, vm_report)) => report.merge(vm_report),
                Err(e) => {
                    let owner = owners.remove(&e.id()).unwrap_or_default();
                    error!(vm = %owner, error = %e, "teardown task aborted");
                    report.failures.push(TeardownFailure {
                        resource: ResourceRef::Role { role: owner.clone() },
                        owner,
                        error: Error::Task(e.to_string()).to_string(),
                    });
                }
            }
        }

        for handle in fleet.shared.iter().rev() {
            let outcome = delete(&self.tracker, &fleet.scope, handle).await;
            report.record(SHARED_OWNER, &handle.resource, outcome);
        }

        info!(
            deleted = report.deleted.len(),
            absent = report.absent.len(),
            failed = report.failures.len(),
            "teardown finished"
        );
        report
    }
}

async fn teardown_vm(tracker: OperationTracker, scope: Scope, vm: VmIdentity) -> TeardownReport {
    let owner = vm.name.to_string();
    let mut report = TeardownReport::default();

    for handle in vm.resources.iter().rev() {
        if let ResourceRef::Disk { name } = &handle.resource {
            if let Err(e) = wait_detached(&tracker, name).await {
                report.record(&owner, &handle.resource, Err(e));
                continue;
            }
        }
        let outcome = delete(&tracker, &scope, handle).await;
        report.record(&owner, &handle.resource, outcome);
    }

    info!(vm = %owner, failed = report.failures.len(), "vm torn down");
    report
}

async fn delete(tracker: &OperationTracker, scope: &Scope, handle: &ResourceHandle) -> Result<Deleted> {
    let resource = &handle.resource;
    let what = format!("delete {resource}");

    match tracker.track(&what, tracker.cloud().delete(scope, resource)).await {
        Ok(_) => Ok(Deleted::Now),
        Err(e) if e.is_not_found() => {
            info!(%resource, "already gone");
            Ok(Deleted::Already)
        }
        Err(e) => Err(e),
    }
}

/// Wait until no role holds `disk`, polling at the tracker's interval.
async fn wait_detached(tracker: &OperationTracker, disk: &str) -> Result<()> {
    let settings = tracker.settings();
    let poll = async {
        loop {
            match tracker.cloud().disk_attached_to(disk).await {
                Ok(None) => return Ok(()),
                Ok(Some(role)) => {
                    info!(disk, role = %role, "waiting for disk to detach");
                }
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            }
            tokio::time::sleep(settings.interval).await;
        }
    };

    match tokio::time::timeout(settings.timeout, poll).await {
        Ok(result) => result,
        Err(_) => {
            warn!(disk, timeout = ?settings.timeout, "disk still attached");
            Err(Error::ProvisionTimeout {
                request_id: format!("detach {disk}"),
                last_status: "attached".into(),
            })
        }
    }
}
