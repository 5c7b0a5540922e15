use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use fleet_core::config::{DeploymentSpec, RunSettings, SnapshotSpec, VmTemplate};
use fleet_core::fleet::Fleet;
use fleet_core::operation::OperationTracker;
use fleet_core::power;
use fleet_core::probe::{SshBannerProbe, ssh_targets, wait_for_ssh};
use fleet_core::provision::{ProvisionReport, Provisioner, cancellation};
use fleet_core::snapshot::SnapshotOrchestrator;
use fleet_core::svcmgmt::ServiceManagementCloud;
use fleet_core::teardown::TeardownOrchestrator;
use fleet_core::types::Scope;
use fleet_core::{Error, Result};
use tracing::{info, warn};

use crate::Cli;

const SSH_RETRY: Duration = Duration::from_secs(1);

/// Everything loaded and validated before the first cloud call.
pub struct Runner {
    settings: RunSettings,
    spec: Arc<DeploymentSpec>,
    template: Option<VmTemplate>,
    snapshot: Option<SnapshotSpec>,
    tracker: OperationTracker,
}

impl Runner {
    pub fn prepare(cli: &Cli) -> Result<Self> {
        let settings = RunSettings::from_env()?;
        let spec = DeploymentSpec::load(&cli.config)?;
        let template = cli.provision.as_deref().map(VmTemplate::load).transpose()?;
        let snapshot = cli.snapshot.as_deref().map(SnapshotSpec::load).transpose()?;

        let cloud = ServiceManagementCloud::from_spec(&spec, &settings)?;
        let tracker = OperationTracker::new(Arc::new(cloud), settings.poll);

        Ok(Self {
            settings,
            spec: Arc::new(spec),
            template,
            snapshot,
            tracker,
        })
    }

    fn scope(&self) -> Scope {
        self.spec.scope()
    }

    /// Run the requested steps in their fixed order. A failed provisioning
    /// skips the steps that need a running fleet; teardown still runs.
    pub async fn run(&self, cli: &Cli) -> Summary {
        let mut summary = Summary::default();
        let mut fleet = None;
        let mut usable = true;

        if let Some(template) = &self.template {
            match self.provision(template).await {
                Ok(report) => {
                    summary.provisioned(&report);
                    fleet = Some(report.fleet());
                }
                Err(e) => {
                    summary.record("provision", Some(Err(e)));
                    usable = false;
                }
            }
        }

        if cli.start {
            let outcome = when(usable, self.start(&mut fleet)).await;
            summary.record("start", outcome);
        }
        if cli.test_ssh {
            let outcome = when(usable, self.test_ssh()).await;
            summary.record("test-ssh", outcome);
        }
        if cli.stop {
            let outcome = when(usable, self.stop(&mut fleet)).await;
            summary.record("stop", outcome);
        }
        if let Some(spec) = &self.snapshot {
            let outcome = when(usable, self.snapshot(spec, cli.role.as_deref())).await;
            summary.record("snapshot", outcome);
        }
        if cli.teardown {
            let outcome = self.teardown(&mut fleet).await;
            summary.record("teardown", outcome);
        }

        summary
    }

    async fn provision(&self, template: &VmTemplate) -> Result<ProvisionReport> {
        let provisioner = Provisioner::new(self.tracker.clone(), self.spec.clone());
        let plan = provisioner.plan(template)?;

        let (cancel, token) = cancellation();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, no further steps will be issued");
                cancel.cancel();
            }
        });
        let report = provisioner.provision(plan, token).await;
        interrupt.abort();
        report
    }

    /// The fleet provisioned in this run, or the one found in the cloud.
    async fn fleet<'a>(&self, cached: &'a mut Option<Fleet>) -> Result<&'a Fleet> {
        if cached.is_none() {
            let found = Fleet::discover(self.tracker.cloud().as_ref(), self.scope()).await?;
            *cached = Some(found);
        }
        cached
            .as_ref()
            .ok_or_else(|| Error::NotFound(format!("deployment '{}'", self.spec.deployment_name)))
    }

    async fn start(&self, fleet: &mut Option<Fleet>) -> Result<String> {
        let fleet = self.fleet(fleet).await?;
        power::start_all(&self.tracker, fleet).await?;
        Ok(format!("{} roles started", fleet.vms.len()))
    }

    async fn stop(&self, fleet: &mut Option<Fleet>) -> Result<String> {
        let fleet = self.fleet(fleet).await?;
        power::stop_all(&self.tracker, fleet).await?;
        Ok(format!("{} roles stopped and deallocated", fleet.vms.len()))
    }

    async fn test_ssh(&self) -> Result<String> {
        let scope = self.scope();
        let deployment = self
            .tracker
            .cloud()
            .get_deployment(&scope)
            .await?
            .ok_or_else(|| Error::NotFound(format!("deployment '{}'", scope.deployment)))?;

        let targets = ssh_targets(&deployment);
        let count = targets.len();
        info!(targets = count, timeout = ?self.settings.probe_timeout, "probing ssh");
        wait_for_ssh(
            &SshBannerProbe::default(),
            targets,
            SSH_RETRY,
            self.settings.probe_timeout,
        )
        .await?;
        Ok(format!("{count} ssh targets up"))
    }

    async fn snapshot(&self, spec: &SnapshotSpec, role: Option<&str>) -> Result<String> {
        let images = SnapshotOrchestrator::new(self.tracker.clone(), &self.spec.containers.images)
            .snapshot(&self.scope(), spec, role)
            .await?;
        let names: Vec<&str> = images.iter().map(|i| i.name.as_str()).collect();
        Ok(format!("registered {}", names.join(", ")))
    }

    async fn teardown(&self, fleet: &mut Option<Fleet>) -> Option<Result<String>> {
        let fleet = match self.fleet(fleet).await {
            Ok(fleet) => fleet,
            Err(e) => return Some(Err(e)),
        };
        let report = TeardownOrchestrator::new(self.tracker.clone())
            .teardown(fleet)
            .await;
        let detail = format!(
            "{} deleted, {} already gone",
            report.deleted.len(),
            report.absent.len()
        );
        Some(report.ensure_clean().map(|()| detail))
    }
}

/// `None` when the step is skipped.
async fn when(usable: bool, step: impl Future<Output = Result<String>>) -> Option<Result<String>> {
    if usable { Some(step.await) } else { None }
}

/// What the run did, printed to stderr at exit.
#[derive(Default)]
pub struct Summary {
    lines: Vec<(&'static str, String)>,
    failures: Vec<String>,
}

impl Summary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// `None` means the step was skipped.
    fn record(&mut self, step: &'static str, outcome: Option<Result<String>>) {
        match outcome {
            None => self.lines.push((step, "skipped".into())),
            Some(Ok(detail)) => self.lines.push((step, format!("ok: {detail}"))),
            Some(Err(e)) => {
                self.lines.push((step, "FAILED".into()));
                self.failures.push(format!("{step}: {e}"));
            }
        }
    }

    fn provisioned(&mut self, report: &ProvisionReport) {
        let complete = report.completed().count();
        self.lines.push((
            "provision",
            format!("{complete} of {} VMs complete", report.vms.len()),
        ));
        for vm in &report.vms {
            let detail = match &vm.error {
                None => vm.state.to_string(),
                Some(e) => format!("{} after {}: {e}", vm.state, vm.reached),
            };
            self.lines.push(("  vm", format!("{} {detail}", vm.identity.name)));
        }
        if let Err(e) = report.ensure_complete() {
            self.failures.push(format!("provision: {e}"));
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "run summary:")?;
        for (step, detail) in &self.lines {
            writeln!(f, "  {step:<10} {detail}")?;
        }
        if !self.failures.is_empty() {
            writeln!(f, "failures:")?;
            for failure in &self.failures {
                writeln!(f, "  {failure}")?;
            }
        }
        Ok(())
    }
}
