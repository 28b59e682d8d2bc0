//! Asynchronous operation queue with per-target exclusion.
//!
//! Each accepted task runs on its own tokio worker, so operations against
//! different targets proceed fully in parallel. A second submission for a
//! target that already has a queued or running task, or that still carries a
//! pending marker, is rejected with [`QueueError::Conflict`] and the existing
//! task is left untouched.
//!
//! The queue marks the target pending on acceptance but never clears the
//! marker itself: the submitter decides when the resource has settled (see
//! [`crate::lifecycle::VmOperations`]).

mod batch;
mod task;

use std::collections::{HashMap, VecDeque};
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot, Notify};
use tracing::{debug, error, info, warn};

use crate::config::QueueSettings;
use crate::identity::TargetIdentity;
use crate::pending::PendingOperationTracker;
use crate::supervise::{supervised, supervised_call};

pub use batch::BatchSummary;
pub use task::{Task, TaskError, TaskEvent, TaskOutcome, TaskSnapshot, TaskStatus, TaskTicket};

/// Capacity of the event channel; slow subscribers observe `Lagged`.
const EVENT_CAPACITY: usize = 256;

/// Why a submission was not accepted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The target already has an outstanding operation.
    #[error("conflict: {target} already has an active '{active_label}' operation")]
    Conflict {
        target: TargetIdentity,
        active_label: String,
    },

    /// The queue was closed.
    #[error("closed: task queue no longer accepts submissions")]
    Closed,
}

impl QueueError {
    /// Short machine-readable reason.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => "conflict",
            Self::Closed => "closed",
        }
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[derive(Default)]
struct QueueState {
    /// Queued and running tasks, at most one per target.
    active: HashMap<TargetIdentity, TaskSnapshot>,
    /// Finished tasks, newest last.
    history: VecDeque<TaskSnapshot>,
    closed: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    events: broadcast::Sender<TaskEvent>,
    idle: Notify,
    history_limit: usize,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TaskEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn mark_running(&self, target: &TargetIdentity) -> Option<TaskSnapshot> {
        let mut state = self.state();
        let snapshot = state.active.get_mut(target)?;
        snapshot.status = TaskStatus::Running;
        snapshot.started_at = Some(Utc::now());
        Some(snapshot.clone())
    }

    fn finish(&self, target: &TargetIdentity, outcome: &TaskOutcome) -> Option<TaskSnapshot> {
        let mut state = self.state();
        let mut snapshot = state.active.remove(target)?;
        snapshot.status = if outcome.is_ok() {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        snapshot.finished_at = Some(Utc::now());
        snapshot.outcome = Some(outcome.clone());

        if self.history_limit > 0 {
            while state.history.len() >= self.history_limit {
                state.history.pop_front();
            }
            state.history.push_back(snapshot.clone());
        }

        if state.active.is_empty() {
            self.idle.notify_waiters();
        }
        Some(snapshot)
    }
}

/// Queue of state-changing operations.
pub struct TaskQueue {
    shared: Arc<Shared>,
    tracker: Arc<PendingOperationTracker>,
    runtime: Handle,
}

impl TaskQueue {
    /// Create a queue that spawns workers on the current tokio runtime.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn new(tracker: Arc<PendingOperationTracker>, settings: QueueSettings) -> Self {
        Self::with_runtime(tracker, settings, Handle::current())
    }

    /// Create a queue that spawns workers on the given runtime.
    #[must_use]
    pub fn with_runtime(
        tracker: Arc<PendingOperationTracker>,
        settings: QueueSettings,
        runtime: Handle,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                events,
                idle: Notify::new(),
                history_limit: settings.history_limit,
            }),
            tracker,
            runtime,
        }
    }

    /// Pending tracker shared with this queue.
    #[must_use]
    pub fn tracker(&self) -> &Arc<PendingOperationTracker> {
        &self.tracker
    }

    /// Submit a task.
    ///
    /// On acceptance the target is marked pending and a worker is spawned;
    /// the call never waits for the operation.
    ///
    /// # Errors
    /// Returns [`QueueError::Conflict`] if the target already has a queued or
    /// running task or a pending marker, and [`QueueError::Closed`] after
    /// [`TaskQueue::close`].
    pub fn enqueue(&self, task: Task) -> Result<TaskTicket, QueueError> {
        let snapshot = {
            let mut state = self.shared.state();
            if state.closed {
                return Err(QueueError::Closed);
            }

            if let Some(existing) = state.active.get(&task.target) {
                debug!(
                    resource = %task.target,
                    existing = %existing.type_label,
                    rejected = %task.type_label,
                    "Rejecting conflicting task"
                );
                return Err(QueueError::Conflict {
                    target: task.target.clone(),
                    active_label: existing.type_label.clone(),
                });
            }

            // Lock order: queue state, then tracker.
            if let Err(label) = self.tracker.try_claim(&task.target, task.marker_label()) {
                debug!(
                    resource = %task.target,
                    pending = %label,
                    rejected = %task.type_label,
                    "Rejecting task for pending target"
                );
                return Err(QueueError::Conflict {
                    target: task.target.clone(),
                    active_label: label,
                });
            }

            let snapshot = TaskSnapshot::queued(&task);
            state.active.insert(task.target.clone(), snapshot.clone());
            snapshot
        };

        info!(
            task_id = %task.id,
            resource = %task.target,
            kind = %task.type_label,
            "Task queued"
        );
        self.shared.emit(TaskEvent::Queued(snapshot));

        let (sender, receiver) = oneshot::channel();
        let ticket = TaskTicket {
            id: task.id,
            target: task.target.clone(),
            receiver,
        };
        self.runtime
            .spawn(run_task(Arc::clone(&self.shared), task, sender));

        Ok(ticket)
    }

    /// Submit independent tasks, accepting or rejecting each on its own.
    pub fn enqueue_batch(&self, tasks: impl IntoIterator<Item = Task>) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for task in tasks {
            let target = task.target.clone();
            summary.record(target, self.enqueue(task));
        }
        info!(
            submitted = summary.submitted,
            skipped = summary.skipped,
            failed = summary.failed,
            "Batch submitted"
        );
        summary
    }

    /// Queued or running task for a target.
    #[must_use]
    pub fn active_task(&self, target: &TargetIdentity) -> Option<TaskSnapshot> {
        self.shared.state().active.get(target).cloned()
    }

    /// Queued or running task for a guest.
    #[must_use]
    pub fn active_task_for_vm(&self, profile: &str, node: &str, vmid: u32) -> Option<TaskSnapshot> {
        self.active_task(&TargetIdentity::vm(profile, node, vmid))
    }

    /// All queued and running tasks, oldest first.
    #[must_use]
    pub fn active_tasks(&self) -> Vec<TaskSnapshot> {
        let mut tasks: Vec<_> = self.shared.state().active.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Recently finished tasks, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<TaskSnapshot> {
        self.shared.state().history.iter().cloned().collect()
    }

    /// Subscribe to task progress events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.shared.events.subscribe()
    }

    /// Stop accepting submissions. Accepted tasks still run to completion.
    pub fn close(&self) {
        let mut state = self.shared.state();
        if !state.closed {
            state.closed = true;
            info!(active = state.active.len(), "Task queue closed");
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state().closed
    }

    /// Wait until no task is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let mut notified = pin!(self.shared.idle.notified());
            notified.as_mut().enable();
            if self.shared.state().active.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// Worker body for one task. Always reaches a terminal status.
async fn run_task(shared: Arc<Shared>, task: Task, sender: oneshot::Sender<TaskOutcome>) {
    let Task {
        id,
        target,
        operation,
        on_complete,
        ..
    } = task;

    if let Some(snapshot) = shared.mark_running(&target) {
        shared.emit(TaskEvent::Started(snapshot));
    }
    debug!(task_id = %id, resource = %target, "Task started");

    let outcome = match supervised(async move { operation().await }).await {
        Ok(Ok(label)) => Ok(label),
        Ok(Err(source)) => Err(TaskError::Operation {
            target: target.clone(),
            source,
        }),
        Err(message) => {
            error!(task_id = %id, resource = %target, panic = %message, "Task operation panicked");
            Err(TaskError::Panicked {
                target: target.clone(),
                message,
            })
        }
    };

    if let Some(callback) = on_complete {
        if let Err(message) = supervised_call(|| callback(&outcome)) {
            error!(task_id = %id, resource = %target, panic = %message, "Completion callback panicked");
        }
    }

    match &outcome {
        Ok(label) => info!(task_id = %id, resource = %target, result = %label, "Task completed"),
        Err(err) => warn!(task_id = %id, resource = %target, error = %err, "Task failed"),
    }

    if let Some(snapshot) = shared.finish(&target, &outcome) {
        shared.emit(TaskEvent::Finished(snapshot));
    }

    // The ticket may have been dropped.
    let _ = sender.send(outcome);
}
