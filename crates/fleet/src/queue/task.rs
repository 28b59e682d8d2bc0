//! Task definition, status and completion handles.

use std::fmt;
use std::future::Future;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::client::ClientError;
use crate::identity::TargetIdentity;

/// Result of a finished task: the remote result label, or why it failed.
pub type TaskOutcome = Result<String, TaskError>;

type Operation = Box<dyn FnOnce() -> BoxFuture<'static, Result<String, ClientError>> + Send>;
type CompletionCallback = Box<dyn FnOnce(&TaskOutcome) + Send>;

/// Why a task failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The operation returned an error.
    #[error("{target}: {source}")]
    Operation {
        target: TargetIdentity,
        source: ClientError,
    },

    /// The operation panicked; the worker caught it.
    #[error("{target}: operation panicked: {message}")]
    Panicked {
        target: TargetIdentity,
        message: String,
    },

    /// The worker went away before reporting, e.g. the runtime shut down.
    #[error("{target}: task abandoned before completion")]
    Abandoned { target: TargetIdentity },
}

impl TaskError {
    #[must_use]
    pub fn target(&self) -> &TargetIdentity {
        match self {
            Self::Operation { target, .. }
            | Self::Panicked { target, .. }
            | Self::Abandoned { target } => target,
        }
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Accepted, worker not started yet.
    Queued,
    /// Operation in flight.
    Running,
    /// Operation succeeded.
    Completed,
    /// Operation failed or panicked.
    Failed,
}

impl TaskStatus {
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A unit of asynchronous work against one target.
///
/// The operation closure runs exactly once on its own worker. Its error,
/// or a panic inside it, is reported through [`Task::on_complete`] and the
/// [`TaskTicket`] returned by the queue.
pub struct Task {
    pub(crate) id: Uuid,
    pub(crate) type_label: String,
    pub(crate) description: String,
    pub(crate) pending_label: Option<String>,
    pub(crate) target: TargetIdentity,
    pub(crate) operation: Operation,
    pub(crate) on_complete: Option<CompletionCallback>,
}

impl Task {
    /// Create a task.
    ///
    /// # Arguments
    /// * `type_label` - Short operation name ("Start", "Migrate", ...)
    /// * `target` - Resource the operation changes
    /// * `operation` - Closure invoking exactly one client call
    pub fn new<F, Fut>(type_label: impl Into<String>, target: TargetIdentity, operation: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<String, ClientError>> + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            type_label: type_label.into(),
            description: String::new(),
            pending_label: None,
            target,
            operation: Box::new(move || operation().boxed()),
            on_complete: None,
        }
    }

    /// Set a human-readable description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the label shown on the pending marker. Defaults to the type label.
    #[must_use]
    pub fn pending_label(mut self, label: impl Into<String>) -> Self {
        self.pending_label = Some(label.into());
        self
    }

    /// Register a callback invoked exactly once when the task finishes.
    ///
    /// The task is still the target's active task while the callback runs,
    /// so enqueueing for the same target from inside it is rejected.
    #[must_use]
    pub fn on_complete(mut self, callback: impl FnOnce(&TaskOutcome) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn target(&self) -> &TargetIdentity {
        &self.target
    }

    #[must_use]
    pub fn type_label(&self) -> &str {
        &self.type_label
    }

    pub(crate) fn marker_label(&self) -> &str {
        self.pending_label.as_deref().unwrap_or(&self.type_label)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("type_label", &self.type_label)
            .field("description", &self.description)
            .field("target", &self.target)
            .field("has_on_complete", &self.on_complete.is_some())
            .finish_non_exhaustive()
    }
}

/// Read-only view of a task for rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    pub id: Uuid,
    pub type_label: String,
    pub description: String,
    pub target: TargetIdentity,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set once the task reaches a terminal status.
    pub outcome: Option<TaskOutcome>,
}

impl TaskSnapshot {
    pub(crate) fn queued(task: &Task) -> Self {
        Self {
            id: task.id,
            type_label: task.type_label.clone(),
            description: task.description.clone(),
            target: task.target.clone(),
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            outcome: None,
        }
    }

    /// Label for menus, e.g. "Start (Queued)".
    #[must_use]
    pub fn display_label(&self) -> String {
        match self.status {
            TaskStatus::Queued => format!("{} (Queued)", self.type_label),
            _ => self.type_label.clone(),
        }
    }
}

/// Progress notifications for presentation layers.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Queued(TaskSnapshot),
    Started(TaskSnapshot),
    Finished(TaskSnapshot),
}

impl TaskEvent {
    #[must_use]
    pub fn snapshot(&self) -> &TaskSnapshot {
        match self {
            Self::Queued(s) | Self::Started(s) | Self::Finished(s) => s,
        }
    }
}

/// Handle to an accepted task.
#[derive(Debug)]
pub struct TaskTicket {
    pub id: Uuid,
    pub target: TargetIdentity,
    pub(crate) receiver: oneshot::Receiver<TaskOutcome>,
}

impl TaskTicket {
    /// Wait for the task to finish.
    pub async fn wait(self) -> TaskOutcome {
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(TaskError::Abandoned {
                target: self.target,
            }),
        }
    }
}
