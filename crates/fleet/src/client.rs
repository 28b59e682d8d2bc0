//! Seam to the externally supplied cluster API client.
//!
//! The wire protocol, authentication and retry policy live behind these
//! traits. Everything in this crate talks to a cluster only through them.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::Profile;
use crate::models::{ClusterSnapshot, Vm};

/// Errors reported by a cluster client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Host could not be reached.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// Authentication was rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Request timed out inside the client.
    #[error("request timed out after {0} seconds")]
    Timeout(u64),

    /// The remote task started by a call finished with a failure.
    #[error("task {upid} failed: {exit_status}")]
    TaskFailed { upid: String, exit_status: String },

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

/// Options for a guest migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrateOptions {
    /// Node to move the guest to.
    pub target_node: String,
    /// Live-migrate a running QEMU guest.
    pub online: bool,
}

/// Status of a task running on a cluster node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTaskStatus {
    /// Still executing.
    pub running: bool,
    /// Set once stopped; "OK" on success.
    pub exit_status: Option<String>,
}

impl RemoteTaskStatus {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        !self.running && self.exit_status.as_deref() == Some("OK")
    }
}

/// One authenticated connection to a cluster.
///
/// Lifecycle methods return the identifier (UPID) of the remote task they
/// started, or an empty string when the call completed synchronously.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// List every node and guest in the cluster.
    async fn cluster_resources(&self) -> Result<ClusterSnapshot, ClientError>;

    /// Fetch the current state of one guest.
    async fn vm_status(&self, node: &str, vmid: u32) -> Result<Vm, ClientError>;

    /// Fetch the status of a remote task started on `node`.
    async fn task_status(&self, node: &str, upid: &str) -> Result<RemoteTaskStatus, ClientError>;

    /// Start a guest.
    async fn start_vm(&self, vm: &Vm) -> Result<String, ClientError>;

    /// Gracefully shut down a guest.
    async fn shutdown_vm(&self, vm: &Vm) -> Result<String, ClientError>;

    /// Stop a guest immediately.
    async fn stop_vm(&self, vm: &Vm) -> Result<String, ClientError>;

    /// Reboot a guest.
    async fn restart_vm(&self, vm: &Vm) -> Result<String, ClientError>;

    /// Hard-reset a QEMU guest.
    async fn reset_vm(&self, vm: &Vm) -> Result<String, ClientError>;

    /// Move a guest to another node.
    async fn migrate_vm(&self, vm: &Vm, options: &MigrateOptions) -> Result<String, ClientError>;

    /// Destroy a guest. `force` also purges a running guest.
    async fn delete_vm(&self, vm: &Vm, force: bool) -> Result<String, ClientError>;
}

/// Creates authenticated clients from profiles.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and authenticate against the profile's cluster.
    async fn connect(&self, profile: &Profile) -> Result<Arc<dyn ClusterClient>, ClientError>;
}
