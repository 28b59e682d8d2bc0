//! Guest lifecycle actions and the submit-then-settle flow.

use std::fmt;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::{ClientError, ClusterClient, MigrateOptions};
use crate::config::StabilizeSettings;
use crate::identity::TargetIdentity;
use crate::models::{GuestType, Vm, VmStatus};
use crate::pending::PendingOperationTracker;
use crate::supervise::supervised;
use crate::queue::{BatchSummary, QueueError, Task, TaskError, TaskOutcome, TaskQueue, TaskTicket};
use crate::stabilize::{wait_for_remote_task, wait_until_settled, Expectation, StabilizeOutcome};

/// A state-changing operation on one guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmAction {
    Start,
    Shutdown,
    Stop,
    Restart,
    Reset,
    Migrate(MigrateOptions),
    Delete { force: bool },
}

impl VmAction {
    /// Task type label, e.g. "Start".
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Start => "Start",
            Self::Shutdown => "Shutdown",
            Self::Stop => "Stop",
            Self::Restart => "Restart",
            Self::Reset => "Reset",
            Self::Migrate(_) => "Migrate",
            Self::Delete { .. } => "Delete",
        }
    }

    /// Label shown on the pending marker, e.g. "Starting".
    #[must_use]
    pub fn progress_label(&self) -> &'static str {
        match self {
            Self::Start => "Starting",
            Self::Shutdown => "Shutting down",
            Self::Stop => "Stopping",
            Self::Restart => "Restarting",
            Self::Reset => "Resetting",
            Self::Migrate(_) => "Migrating",
            Self::Delete { .. } => "Deleting",
        }
    }

    /// Whether the guest's current state allows this action.
    #[must_use]
    pub fn is_eligible(&self, vm: &Vm) -> bool {
        match self {
            Self::Start => vm.status == VmStatus::Stopped,
            Self::Shutdown | Self::Stop | Self::Restart => vm.status == VmStatus::Running,
            Self::Reset => vm.status == VmStatus::Running && vm.guest == GuestType::Qemu,
            Self::Migrate(_) | Self::Delete { .. } => true,
        }
    }

    /// State the guest should reach once the action has taken effect.
    #[must_use]
    pub fn expectation(&self, vm: &Vm) -> Expectation {
        match self {
            Self::Start => Expectation::Running,
            Self::Shutdown | Self::Stop => Expectation::Stopped,
            Self::Restart | Self::Reset => Expectation::Restarted {
                previous_uptime: vm.uptime,
            },
            Self::Migrate(options) => Expectation::OnNode {
                node: options.target_node.clone(),
                online: vm.is_running(),
            },
            Self::Delete { .. } => Expectation::Gone,
        }
    }

    /// Build a task that performs this action with a single client call.
    ///
    /// The task stays running until the remote task the call started has
    /// stopped, and fails if that remote task fails.
    #[must_use]
    pub fn into_task(self, client: Arc<dyn ClusterClient>, vm: Vm, settings: &StabilizeSettings) -> Task {
        let target = vm.target();
        let description = format!("{} {} ({}) on {}", self.label(), vm.name, vm.id, vm.node);
        let label = self.label();
        let progress = self.progress_label();
        let settings = settings.clone();

        Task::new(label, target, move || async move {
            let upid = match self {
                Self::Start => client.start_vm(&vm).await,
                Self::Shutdown => client.shutdown_vm(&vm).await,
                Self::Stop => client.stop_vm(&vm).await,
                Self::Restart => client.restart_vm(&vm).await,
                Self::Reset => client.reset_vm(&vm).await,
                Self::Migrate(options) => client.migrate_vm(&vm, &options).await,
                Self::Delete { force } => client.delete_vm(&vm, force).await,
            }?;
            if !upid.is_empty() {
                wait_for_remote_task(client.as_ref(), &vm.node, &upid, &settings).await?;
            }
            Ok::<_, ClientError>(upid)
        })
        .description(description)
        .pending_label(progress)
    }
}

impl fmt::Display for VmAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Migrate(options) => write!(f, "Migrate to {}", options.target_node),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// Handle to a submitted guest operation and its settle wait.
#[derive(Debug)]
pub struct Submission {
    id: Uuid,
    target: TargetIdentity,
    settle: JoinHandle<Result<StabilizeOutcome, TaskError>>,
}

impl Submission {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn target(&self) -> &TargetIdentity {
        &self.target
    }

    /// Wait until the operation finished and the guest settled or the
    /// settle deadline passed. The pending marker is gone when this returns.
    pub async fn settled(self) -> Result<StabilizeOutcome, TaskError> {
        match self.settle.await {
            Ok(result) => result,
            Err(_) => Err(TaskError::Abandoned {
                target: self.target,
            }),
        }
    }
}

/// Submits guest actions and clears their pending markers once settled.
pub struct VmOperations {
    queue: Arc<TaskQueue>,
    tracker: Arc<PendingOperationTracker>,
    settings: StabilizeSettings,
    runtime: Handle,
}

impl VmOperations {
    /// Create the helper on the current tokio runtime.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn new(
        queue: Arc<TaskQueue>,
        tracker: Arc<PendingOperationTracker>,
        settings: StabilizeSettings,
    ) -> Self {
        Self {
            queue,
            tracker,
            settings,
            runtime: Handle::current(),
        }
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Submit one action.
    ///
    /// Once the remote task succeeds the guest is polled until it reaches the
    /// action's expected state, then its pending marker is cleared. A failed
    /// task clears the marker right away, and so does a panic while polling.
    ///
    /// # Errors
    /// Returns the queue's rejection, leaving any existing operation alone.
    pub fn submit(
        &self,
        client: Arc<dyn ClusterClient>,
        vm: Vm,
        action: VmAction,
    ) -> Result<Submission, QueueError> {
        let (ticket, settle) = self.enqueue_tracked(client, vm, action)?;
        Ok(Submission {
            id: ticket.id,
            target: ticket.target,
            settle,
        })
    }

    /// Submit the same action for many guests.
    ///
    /// Ineligible guests and guests whose profile has no client are counted
    /// without being submitted. Settle waits run in the background.
    pub fn submit_batch<F>(
        &self,
        vms: impl IntoIterator<Item = Vm>,
        action: &VmAction,
        resolve_client: F,
    ) -> BatchSummary
    where
        F: Fn(&Vm) -> Option<Arc<dyn ClusterClient>>,
    {
        let mut summary = BatchSummary::default();
        for vm in vms {
            let target = vm.target();
            if !action.is_eligible(&vm) {
                summary.record_ineligible(target, format!("{} is {}", vm.name, vm.status));
                continue;
            }
            let Some(client) = resolve_client(&vm) else {
                summary.record_unresolved(target, format!("no connection for profile '{}'", vm.source_profile));
                continue;
            };
            let result = self
                .enqueue_tracked(client, vm, action.clone())
                .map(|(ticket, _settle)| ticket);
            summary.record(target, result);
        }
        info!(
            action = action.label(),
            submitted = summary.submitted,
            skipped = summary.skipped,
            failed = summary.failed,
            "Batch action submitted"
        );
        summary
    }

    fn enqueue_tracked(
        &self,
        client: Arc<dyn ClusterClient>,
        vm: Vm,
        action: VmAction,
    ) -> Result<(TaskTicket, JoinHandle<Result<StabilizeOutcome, TaskError>>), QueueError> {
        let expectation = action.expectation(&vm);
        let (done_tx, done_rx) = oneshot::channel::<TaskOutcome>();
        let task = action
            .into_task(Arc::clone(&client), vm.clone(), &self.settings)
            .on_complete(move |outcome| {
                let _ = done_tx.send(outcome.clone());
            });

        let ticket = self.queue.enqueue(task)?;
        let target = ticket.target.clone();
        let tracker = Arc::clone(&self.tracker);
        let settings = self.settings.clone();

        let settle = self.runtime.spawn(async move {
            let outcome = done_rx.await.unwrap_or_else(|_| {
                Err(TaskError::Abandoned {
                    target: target.clone(),
                })
            });

            let result = match outcome {
                Ok(label) => {
                    debug!(resource = %target, result = %label, "Waiting for guest to settle");
                    supervised(wait_until_settled(client.as_ref(), &vm, &expectation, &settings))
                        .await
                        .map_err(|message| {
                            error!(resource = %target, panic = %message, "Settle wait panicked");
                            TaskError::Panicked {
                                target: target.clone(),
                                message,
                            }
                        })
                }
                Err(err) => Err(err),
            };

            tracker.clear_pending(&target);
            if let Ok(StabilizeOutcome::TimedOut { .. }) = result {
                warn!(resource = %target, expected = %expectation, "Cleared pending marker without settling");
            }
            result
        });

        Ok((ticket, settle))
    }
}
