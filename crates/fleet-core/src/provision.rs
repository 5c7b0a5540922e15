//! Driving a plan to completion: shared steps behind a barrier, then one
//! task per VM.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::{DeploymentSpec, VmTemplate};
use crate::fleet::Fleet;
use crate::names::{PortAllocator, generate_names};
use crate::operation::OperationTracker;
use crate::plan::{Phase, Plan, PlanBuilder, ResourceStep, StepKind, VmPlan};
use crate::types::{ResourceHandle, Scope, VmIdentity};
use crate::{CloudControl, Error, Result, VmFailure};

/// Where a VM's provisioning got to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Pending,
    NetworkReady,
    DisksReady,
    VmCreated,
    EndpointsBound,
    Complete,
    Failed,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::NetworkReady => "network-ready",
            Self::DisksReady => "disks-ready",
            Self::VmCreated => "vm-created",
            Self::EndpointsBound => "endpoints-bound",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    fn after(phase: Phase) -> Self {
        match phase {
            Phase::Network => Self::NetworkReady,
            Phase::Disks => Self::DisksReady,
            Phase::Instance => Self::VmCreated,
            Phase::Endpoints => Self::EndpointsBound,
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Cancellation ─────────────────────────────────────────────────────

/// Owner side of a cancellation signal.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Stop every VM task from issuing further steps. Nothing is rolled back.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observer side of a cancellation signal, cloned into every VM task.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        cancellation().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled; pending forever if the handle is dropped
    /// without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub fn cancellation() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

// ── Report ───────────────────────────────────────────────────────────

/// Final outcome of one VM.
#[derive(Debug)]
pub struct VmReport {
    pub identity: VmIdentity,
    pub state: VmState,
    /// Last state reached before failing (equal to `state` on success).
    pub reached: VmState,
    pub error: Option<Error>,
}

#[derive(Debug)]
pub struct ProvisionReport {
    pub scope: Scope,
    pub shared: Vec<ResourceHandle>,
    pub vms: Vec<VmReport>,
}

impl ProvisionReport {
    pub fn completed(&self) -> impl Iterator<Item = &VmReport> {
        self.vms.iter().filter(|vm| vm.state == VmState::Complete)
    }

    pub fn failed(&self) -> impl Iterator<Item = &VmReport> {
        self.vms.iter().filter(|vm| vm.state == VmState::Failed)
    }

    /// Aggregate error listing every failed VM, if any failed.
    pub fn ensure_complete(&self) -> Result<()> {
        let failures: Vec<VmFailure> = self
            .failed()
            .map(|vm| VmFailure {
                vm: vm.identity.name.clone(),
                error: vm
                    .error
                    .as_ref()
                    .map_or_else(|| "unknown error".to_string(), |e| e.to_string()),
            })
            .collect();
        if failures.is_empty() {
            return Ok(());
        }
        Err(Error::ProvisionFailed {
            total: self.vms.len(),
            failures,
        })
    }

    /// Everything created (or adopted), for teardown.
    pub fn fleet(&self) -> Fleet {
        Fleet {
            scope: self.scope.clone(),
            shared: self.shared.clone(),
            vms: self.vms.iter().map(|vm| vm.identity.clone()).collect(),
        }
    }
}

// ── Provisioner ──────────────────────────────────────────────────────

pub struct Provisioner {
    tracker: OperationTracker,
    spec: Arc<DeploymentSpec>,
}

impl Provisioner {
    pub fn new(tracker: OperationTracker, spec: Arc<DeploymentSpec>) -> Self {
        Self { tracker, spec }
    }

    fn cloud(&self) -> &Arc<dyn CloudControl> {
        self.tracker.cloud()
    }

    /// Generate `n_vms` names and build the plan for them.
    pub fn plan(&self, template: &VmTemplate) -> Result<Plan> {
        let names = generate_names(self.spec.n_vms);
        let cloud = self.cloud().clone();
        PlanBuilder::new(&self.spec, template).build(
            &names,
            &mut PortAllocator::new(),
            &move |container: &str, blob: &str| cloud.blob_url(container, blob),
        )
    }

    /// Execute a plan.
    ///
    /// Errors only when the shared steps fail; per-VM failures are reported
    /// in the returned [`ProvisionReport`].
    pub async fn provision(&self, plan: Plan, cancel: CancelToken) -> Result<ProvisionReport> {
        let Plan { scope, shared, vms } = plan;

        info!(
            service = %scope.service,
            deployment = %scope.deployment,
            vms = vms.len(),
            "provisioning fleet"
        );

        self.cloud().ensure_container(&self.spec.containers.vhds).await?;
        let shared = self.run_shared(&scope, &shared).await?;

        let mut tasks = JoinSet::new();
        let mut pending = HashMap::new();
        for vm in vms {
            let identity = vm.identity.clone();
            let handle = tasks.spawn(run_vm(
                self.tracker.clone(),
                scope.clone(),
                vm,
                cancel.clone(),
            ));
            pending.insert(handle.id(), identity);
        }

        let mut reports = Vec::with_capacity(pending.len());
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, report)) => {
                    pending.remove(&id);
                    reports.push(report);
                }
                Err(e) => {
                    let Some(identity) = pending.remove(&e.id()) else {
                        continue;
                    };
                    error!(vm = %identity.name, error = %e, "vm task aborted");
                    reports.push(VmReport {
                        identity,
                        state: VmState::Failed,
                        reached: VmState::Pending,
                        error: Some(Error::Task(e.to_string())),
                    });
                }
            }
        }
        reports.sort_by_key(|r| r.identity.index);

        let report = ProvisionReport {
            scope,
            shared,
            vms: reports,
        };
        info!(
            complete = report.completed().count(),
            failed = report.failed().count(),
            "provisioning finished"
        );
        Ok(report)
    }

    /// Hosted service and deployment; existing ones are adopted.
    async fn run_shared(&self, scope: &Scope, steps: &[ResourceStep]) -> Result<Vec<ResourceHandle>> {
        let mut handles = Vec::with_capacity(steps.len());
        for step in steps {
            let adopted = match &step.kind {
                StepKind::HostedService { name, location } => {
                    match self.cloud().get_hosted_service(name).await? {
                        Some(existing) => {
                            if &existing.location != location {
                                warn!(
                                    service = %name,
                                    actual = %existing.location,
                                    expected = %location,
                                    "hosted service exists in a different location"
                                );
                            } else {
                                info!(service = %name, "hosted service exists, reusing");
                            }
                            true
                        }
                        None => false,
                    }
                }
                StepKind::Deployment { name, .. } => {
                    let found = self.cloud().get_deployment(scope).await?.is_some();
                    if found {
                        info!(deployment = %name, "deployment exists, reusing");
                    }
                    found
                }
                _ => false,
            };

            let request_id = if adopted {
                None
            } else {
                let what = step.kind.describe();
                Some(
                    self.tracker
                        .track(&what, self.cloud().create(scope, &step.kind))
                        .await?,
                )
            };
            handles.push(ResourceHandle {
                resource: step.kind.resource(),
                request_id,
            });
        }
        Ok(handles)
    }
}

/// One VM's task. Never returns an error: failures end up in the report.
async fn run_vm(
    tracker: OperationTracker,
    scope: Scope,
    plan: VmPlan,
    cancel: CancelToken,
) -> VmReport {
    let VmPlan {
        mut identity,
        steps,
    } = plan;
    let mut state = VmState::Pending;

    let outcome = async {
        for phase in Phase::ALL {
            for step in steps.iter().filter(|s| s.kind.phase() == Some(phase)) {
                run_step(&tracker, &scope, &mut identity, step, &cancel).await?;
            }
            state = VmState::after(phase);
            info!(vm = %identity.name, %state, "vm advanced");
        }
        Ok::<(), Error>(())
    }
    .await;

    match outcome {
        Ok(()) => {
            info!(vm = %identity.name, "vm complete");
            VmReport {
                identity,
                state: VmState::Complete,
                reached: VmState::Complete,
                error: None,
            }
        }
        Err(e) => {
            error!(vm = %identity.name, reached = %state, error = %e, "vm failed");
            VmReport {
                identity,
                state: VmState::Failed,
                reached: state,
                error: Some(e),
            }
        }
    }
}

/// Issue one step and wait for it, unless cancelled.
///
/// The resource is recorded once the cloud accepted the request and did not
/// report a failure, so teardown also covers steps that timed out or were
/// cancelled mid-wait.
async fn run_step(
    tracker: &OperationTracker,
    scope: &Scope,
    identity: &mut VmIdentity,
    step: &ResourceStep,
    cancel: &CancelToken,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let what = step.kind.describe();
    let handle = tracker.cloud().create(scope, &step.kind).await?;
    let request_id = handle.request_id.clone();

    let waited = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        waited = tracker.wait(handle) => waited,
    };

    if !matches!(waited, Err(Error::ProvisionOperation { .. })) {
        identity.resources.push(ResourceHandle {
            resource: step.kind.resource(),
            request_id: Some(request_id.clone()),
        });
    }
    waited?;
    info!(vm = %identity.name, %request_id, "{what} done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::operation::PollSettings;
    use crate::testing::{FakeCloud, deployment_spec, fault, vm_template};
    use crate::types::ResourceRef;

    fn provisioner(cloud: Arc<FakeCloud>, n: usize) -> Provisioner {
        let tracker = OperationTracker::new(
            cloud,
            PollSettings {
                interval: Duration::from_millis(100),
                timeout: Duration::from_secs(60),
            },
        );
        Provisioner::new(tracker, Arc::new(deployment_spec(n)))
    }

    #[tokio::test(start_paused = true)]
    async fn provisions_every_vm_to_complete() {
        let cloud = Arc::new(FakeCloud::new());
        let p = provisioner(cloud.clone(), 2);
        let plan = p.plan(&vm_template()).unwrap();

        let report = p.provision(plan, CancelToken::never()).await.unwrap();

        report.ensure_complete().unwrap();
        assert_eq!(report.completed().count(), 2);
        assert!(cloud.containers().contains("vhds"));
        for vm in &report.vms {
            // ip, network, root disk, data disk, role, 2 endpoints
            assert_eq!(vm.identity.resources.len(), 7);
            assert!(vm.identity.resources.iter().all(|h| h.request_id.is_some()));
        }
        assert_eq!(report.shared.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shared_steps_precede_every_vm_step() {
        let cloud = Arc::new(FakeCloud::new());
        let p = provisioner(cloud.clone(), 3);
        let plan = p.plan(&vm_template()).unwrap();
        p.provision(plan, CancelToken::never()).await.unwrap();

        let creates = cloud.creates();
        assert!(matches!(creates[0], StepKind::HostedService { .. }));
        assert!(matches!(creates[1], StepKind::Deployment { .. }));
        assert!(creates[2..].iter().all(|s| s.phase().is_some()));
    }

    async fn provision_time(n: usize) -> Duration {
        let cloud = Arc::new(FakeCloud::new().with_in_progress_polls(5));
        let p = provisioner(cloud, n);
        let plan = p.plan(&vm_template()).unwrap();

        let started = tokio::time::Instant::now();
        p.provision(plan, CancelToken::never())
            .await
            .unwrap()
            .ensure_complete()
            .unwrap();
        started.elapsed()
    }

    #[tokio::test(start_paused = true)]
    async fn vms_are_provisioned_concurrently() {
        let one = provision_time(1).await;
        let four = provision_time(4).await;

        // Serial VMs would take more than three times as long.
        assert!(four < one * 2, "1 vm: {one:?}, 4 vms: {four:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn one_disk_failure_fails_only_that_vm() {
        let cloud = Arc::new(FakeCloud::new());
        let p = provisioner(cloud.clone(), 3);
        let plan = p.plan(&vm_template()).unwrap();
        let doomed = plan.vms[1].identity.resolved.root_disk_name.clone();

        cloud.fail_when(
            move |step| matches!(step, StepKind::RootDisk { name, .. } if *name == doomed),
            fault("StorageAccountNotFound", "The storage account was not found."),
        );

        let report = p.provision(plan, CancelToken::never()).await.unwrap();

        assert_eq!(report.completed().count(), 2);
        let failed: Vec<_> = report.failed().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].identity.index, 1);
        assert_eq!(failed[0].reached, VmState::NetworkReady);
        assert!(matches!(
            failed[0].error,
            Some(Error::ProvisionOperation { ref code, .. }) if code == "StorageAccountNotFound"
        ));
        // Nothing after the disk step was attempted for the failed VM.
        assert!(
            !failed[0]
                .identity
                .resources
                .iter()
                .any(|h| matches!(h.resource, ResourceRef::Role { .. }))
        );

        let err = report.ensure_complete().unwrap_err();
        match &err {
            Error::ProvisionFailed { total, failures } => {
                assert_eq!(*total, 3);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].vm, failed[0].identity.name);
                assert!(failures[0].error.contains("The storage account was not found."));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shared_failure_aborts_before_any_vm_step() {
        let cloud = Arc::new(FakeCloud::new());
        cloud.fail_when(
            |step| matches!(step, StepKind::Deployment { .. }),
            fault("BadRequest", "Virtual network fleet-net not found."),
        );
        let p = provisioner(cloud.clone(), 2);
        let plan = p.plan(&vm_template()).unwrap();

        let err = p.provision(plan, CancelToken::never()).await.unwrap_err();

        assert!(matches!(err, Error::ProvisionOperation { .. }));
        assert_eq!(cloud.creates().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn existing_service_is_adopted() {
        let cloud = Arc::new(FakeCloud::new().with_service("North Europe"));
        let p = provisioner(cloud.clone(), 1);
        let plan = p.plan(&vm_template()).unwrap();

        let report = p.provision(plan, CancelToken::never()).await.unwrap();

        assert!(
            !cloud
                .creates()
                .iter()
                .any(|s| matches!(s, StepKind::HostedService { .. }))
        );
        assert_eq!(report.shared[0].resource, ResourceRef::HostedService);
        assert_eq!(report.shared[0].request_id, None);
        report.ensure_complete().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_fleet_issues_no_vm_steps() {
        let cloud = Arc::new(FakeCloud::new());
        let p = provisioner(cloud.clone(), 2);
        let plan = p.plan(&vm_template()).unwrap();

        let (handle, token) = cancellation();
        handle.cancel();
        let report = p.provision(plan, token).await.unwrap();

        assert_eq!(report.failed().count(), 2);
        assert!(report.vms.iter().all(|vm| matches!(vm.error, Some(Error::Cancelled))));
        assert!(report.vms.iter().all(|vm| vm.identity.resources.is_empty()));
        assert_eq!(cloud.creates().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_wait_records_the_accepted_step() {
        // Every operation takes 2 s: shared steps finish at 4 s and the
        // public IP is still in progress at 5 s.
        let cloud = Arc::new(FakeCloud::new().with_in_progress_polls(20));
        let p = provisioner(cloud.clone(), 1);
        let plan = p.plan(&vm_template()).unwrap();
        let (handle, token) = cancellation();

        let run = tokio::spawn(async move { p.provision(plan, token).await });
        tokio::time::sleep(Duration::from_secs(5)).await;
        handle.cancel();
        let report = run.await.unwrap().unwrap();

        let vm = &report.vms[0];
        assert_eq!(vm.state, VmState::Failed);
        assert_eq!(vm.reached, VmState::Pending);
        assert!(matches!(vm.error, Some(Error::Cancelled)));
        assert_eq!(vm.identity.resources.len(), 1);
        assert!(matches!(
            vm.identity.resources[0].resource,
            ResourceRef::PublicIp { .. }
        ));
        assert_eq!(cloud.creates().len(), 3);
    }
}
