//! Polling until a guest reaches its post-operation state.
//!
//! A finished remote task does not mean the cluster reports the new state
//! yet. Callers poll the guest until it matches an [`Expectation`] and only
//! then clear its pending marker.

use std::fmt;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{ClientError, ClusterClient};
use crate::config::StabilizeSettings;
use crate::models::{Vm, VmStatus};

/// State a guest should report once an operation has taken effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    /// Guest is running.
    Running,
    /// Guest is stopped.
    Stopped,
    /// Guest is running with an uptime lower than before the operation.
    Restarted { previous_uptime: u64 },
    /// Guest is listed on `node`, running if `online`.
    OnNode { node: String, online: bool },
    /// Guest no longer exists.
    Gone,
}

impl Expectation {
    /// Node to query for the guest's status.
    fn node<'a>(&'a self, vm: &'a Vm) -> &'a str {
        match self {
            Self::OnNode { node, .. } => node,
            _ => &vm.node,
        }
    }

    fn is_met(&self, observed: &Result<Vm, ClientError>) -> bool {
        match (self, observed) {
            (Self::Gone, Err(ClientError::NotFound(_))) => true,
            (Self::Running, Ok(vm)) => vm.status == VmStatus::Running,
            (Self::Stopped, Ok(vm)) => vm.status == VmStatus::Stopped,
            (Self::Restarted { previous_uptime }, Ok(vm)) => {
                vm.status == VmStatus::Running && vm.uptime < *previous_uptime
            }
            (Self::OnNode { node, online }, Ok(vm)) => {
                vm.node == *node && (!online || vm.status == VmStatus::Running)
            }
            _ => false,
        }
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Restarted { .. } => write!(f, "restarted"),
            Self::OnNode { node, .. } => write!(f, "on node {node}"),
            Self::Gone => write!(f, "gone"),
        }
    }
}

/// How a stabilization wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StabilizeOutcome {
    /// The expectation held after this many polls.
    Settled { polls: u32 },
    /// The deadline passed first.
    TimedOut { polls: u32 },
}

impl StabilizeOutcome {
    #[must_use]
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Settled { .. })
    }
}

/// Poll a guest's status until `expectation` holds or the deadline passes.
///
/// Status errors other than the ones an expectation waits for are treated
/// as "not yet" and polling continues. A poll still outstanding at the
/// deadline is abandoned.
pub async fn wait_until_settled(
    client: &dyn ClusterClient,
    vm: &Vm,
    expectation: &Expectation,
    settings: &StabilizeSettings,
) -> StabilizeOutcome {
    let start = Instant::now();
    let max_wait = settings.max_wait();
    let node = expectation.node(vm);
    let mut polls = 0;

    loop {
        let remaining = max_wait.saturating_sub(start.elapsed());
        let polled = tokio::time::timeout(remaining, client.vm_status(node, vm.id)).await;
        polls += 1;
        let Ok(observed) = polled else {
            warn!(
                vmid = vm.id,
                expected = %expectation,
                polls,
                "Status poll still pending at deadline"
            );
            return StabilizeOutcome::TimedOut { polls };
        };

        if expectation.is_met(&observed) {
            info!(
                vmid = vm.id,
                expected = %expectation,
                polls,
                elapsed_secs = start.elapsed().as_secs(),
                "Guest settled"
            );
            return StabilizeOutcome::Settled { polls };
        }

        match &observed {
            Ok(current) => debug!(
                vmid = vm.id,
                node = %current.node,
                status = %current.status,
                expected = %expectation,
                "Guest not settled yet"
            ),
            Err(err) => debug!(vmid = vm.id, error = %err, "Status poll failed"),
        }

        if start.elapsed() >= max_wait {
            warn!(
                vmid = vm.id,
                expected = %expectation,
                polls,
                "Gave up waiting for guest to settle"
            );
            return StabilizeOutcome::TimedOut { polls };
        }

        tokio::time::sleep(settings.poll_interval()).await;
    }
}

/// Poll a remote task until it stops.
///
/// Status errors are retried until the task timeout passes.
///
/// # Errors
/// Returns [`ClientError::TaskFailed`] when the task stops with a non-OK exit
/// status, or [`ClientError::Timeout`] when it is still running at the deadline.
pub async fn wait_for_remote_task(
    client: &dyn ClusterClient,
    node: &str,
    upid: &str,
    settings: &StabilizeSettings,
) -> Result<(), ClientError> {
    let start = Instant::now();
    let limit = settings.task_timeout();

    loop {
        let remaining = limit.saturating_sub(start.elapsed());
        match tokio::time::timeout(remaining, client.task_status(node, upid)).await {
            Ok(Ok(status)) if !status.running => {
                if status.succeeded() {
                    debug!(node, upid, "Remote task finished");
                    return Ok(());
                }
                let exit_status = status.exit_status.unwrap_or_else(|| "unknown".to_string());
                warn!(node, upid, exit_status = %exit_status, "Remote task failed");
                return Err(ClientError::TaskFailed {
                    upid: upid.to_string(),
                    exit_status,
                });
            }
            Ok(Ok(_)) => debug!(node, upid, "Remote task still running"),
            Ok(Err(err)) => debug!(node, upid, error = %err, "Task status poll failed"),
            Err(_) => {}
        }

        let elapsed = start.elapsed();
        if elapsed >= limit {
            warn!(node, upid, timeout_secs = limit.as_secs(), "Remote task did not finish in time");
            return Err(ClientError::Timeout(limit.as_secs()));
        }

        tokio::time::sleep(settings.task_poll_interval().min(limit - elapsed)).await;
    }
}
