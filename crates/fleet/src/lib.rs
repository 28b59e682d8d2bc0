//! Fleet management core for virtualization clusters.
//!
//! This crate provides the two pieces a multi-cluster terminal client needs
//! underneath its presentation layer:
//!
//! - a [`TaskQueue`] that runs state-changing operations (start, stop,
//!   migrate, delete, ...) concurrently while never letting two operations
//!   race on the same resource, and
//! - a [`ClusterAggregator`] that connects several independently
//!   authenticated clusters at once and merges their resources into one
//!   addressable view, tolerating profiles that are unreachable.
//!
//! The wire protocol of the cluster API is not implemented here; callers
//! plug in their client through the [`ClusterClient`] and [`Connector`]
//! traits.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fleet::{ClusterAggregator, PendingOperationTracker, TaskQueue, VmAction, VmOperations};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = fleet::FleetConfig::load("fleet.yaml")?;
//!     let aggregator = ClusterAggregator::new("homelab", Arc::new(MyConnector), config.aggregator.clone());
//!     aggregator.initialize(&CancellationToken::new(), config.group_profiles("homelab")).await?;
//!
//!     let view = aggregator.group_cluster_resources(&CancellationToken::new()).await?;
//!
//!     let tracker = Arc::new(PendingOperationTracker::new());
//!     let queue = Arc::new(TaskQueue::new(tracker.clone(), config.queue.clone()));
//!     let ops = VmOperations::new(queue, tracker, config.stabilize.clone());
//!
//!     let vm = &view.vms[0];
//!     let client = aggregator.client(&vm.source_profile)?;
//!     let submission = ops.submit(client, vm.clone(), VmAction::Start)?;
//!     submission.settled().await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod aggregator;
pub mod client;
pub mod config;
pub mod identity;
pub mod lifecycle;
pub mod models;
pub mod pending;
pub mod queue;
pub mod stabilize;
mod supervise;

pub use aggregator::{
    AggregatedView, AggregatorError, ClusterAggregator, ConnectOutcomes, ConnectionState,
    ConnectionSummary, ProfileError, ProfileFailure,
};
pub use client::{ClientError, ClusterClient, Connector, MigrateOptions, RemoteTaskStatus};
pub use config::{AggregatorSettings, FleetConfig, Profile, QueueSettings, StabilizeSettings};
pub use identity::{ResourceKind, TargetIdentity};
pub use lifecycle::{Submission, VmAction, VmOperations};
pub use models::{ClusterSnapshot, GuestType, Node, Vm, VmStatus};
pub use pending::PendingOperationTracker;
pub use queue::{
    BatchSummary, QueueError, Task, TaskError, TaskEvent, TaskOutcome, TaskQueue, TaskSnapshot,
    TaskStatus, TaskTicket,
};
pub use stabilize::{wait_for_remote_task, wait_until_settled, Expectation, StabilizeOutcome};
