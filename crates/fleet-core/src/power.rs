//! Starting and stopping every role of a fleet in one operation.

use tracing::info;

use crate::fleet::Fleet;
use crate::operation::OperationTracker;
use crate::types::RoleOperation;
use crate::Result;

pub async fn start_all(tracker: &OperationTracker, fleet: &Fleet) -> Result<()> {
    run(tracker, fleet, RoleOperation::Start).await
}

/// Shut down and deallocate, so stopped VMs stop accruing compute charges.
pub async fn stop_all(tracker: &OperationTracker, fleet: &Fleet) -> Result<()> {
    run(tracker, fleet, RoleOperation::StopDeallocate).await
}

async fn run(tracker: &OperationTracker, fleet: &Fleet, op: RoleOperation) -> Result<()> {
    let roles = fleet.role_names();
    if roles.is_empty() {
        info!(?op, "no roles, skipping");
        return Ok(());
    }

    let what = match op {
        RoleOperation::Start => format!("start {} roles", roles.len()),
        RoleOperation::StopDeallocate => format!("stop {} roles", roles.len()),
    };
    tracker
        .track(&what, tracker.cloud().roles_operation(&fleet.scope, op, &roles))
        .await?;
    Ok(())
}
