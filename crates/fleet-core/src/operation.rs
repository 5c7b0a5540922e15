//! Polling asynchronous cloud operations to a terminal state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::types::{OperationHandle, OperationState};
use crate::{CloudControl, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Delay between two status reads.
    pub interval: Duration,
    /// Upper bound on the whole wait, from the first status read.
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// The single place that waits on operation handles.
#[derive(Clone)]
pub struct OperationTracker {
    cloud: Arc<dyn CloudControl>,
    settings: PollSettings,
}

impl OperationTracker {
    pub fn new(cloud: Arc<dyn CloudControl>, settings: PollSettings) -> Self {
        Self { cloud, settings }
    }

    pub fn cloud(&self) -> &Arc<dyn CloudControl> {
        &self.cloud
    }

    pub fn settings(&self) -> PollSettings {
        self.settings
    }

    /// Issue a mutating call and wait for the operation it starts.
    /// Returns the request id of the completed operation.
    pub async fn track<F>(&self, what: &str, call: F) -> Result<String>
    where
        F: Future<Output = Result<OperationHandle>> + Send,
    {
        let handle = call.await?;
        debug!(request_id = %handle.request_id, what, "operation accepted");
        let request_id = self.wait(handle).await?;
        info!(%request_id, what, "operation succeeded");
        Ok(request_id)
    }

    /// Poll `handle` until it succeeds, fails or the timeout elapses.
    ///
    /// Failures carry the cloud's error code and message untouched.
    pub async fn wait(&self, handle: OperationHandle) -> Result<String> {
        let mut last_status = None;
        let polled = tokio::time::timeout(
            self.settings.timeout,
            self.poll_until_terminal(&handle, &mut last_status),
        )
        .await;

        match polled {
            Ok(Ok(())) => Ok(handle.request_id),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                let last_status = last_status.unwrap_or_else(|| "unknown".to_string());
                warn!(
                    request_id = %handle.request_id,
                    %last_status,
                    timeout = ?self.settings.timeout,
                    "operation timed out"
                );
                Err(Error::ProvisionTimeout {
                    request_id: handle.request_id,
                    last_status,
                })
            }
        }
    }

    async fn poll_until_terminal(
        &self,
        handle: &OperationHandle,
        last_status: &mut Option<String>,
    ) -> Result<()> {
        loop {
            let status = self.cloud.operation_status(handle).await?;
            debug!(request_id = %handle.request_id, status = %status.raw, "operation status");

            match status.state {
                OperationState::InProgress => {
                    *last_status = Some(status.raw);
                    tokio::time::sleep(self.settings.interval).await;
                }
                OperationState::Succeeded => return Ok(()),
                OperationState::Failed => {
                    let (code, message) = match status.fault {
                        Some(fault) => (fault.code, fault.message),
                        None => (status.raw, "no error details reported".to_string()),
                    };
                    warn!(request_id = %handle.request_id, %code, %message, "operation failed");
                    return Err(Error::ProvisionOperation { code, message });
                }
            }
        }
    }
}
