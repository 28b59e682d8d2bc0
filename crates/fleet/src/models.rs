//! Cluster resource types shared by the client seam, the aggregator and the queue.

use serde::{Deserialize, Serialize};

use crate::identity::TargetIdentity;

/// Guest status as reported by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    /// Guest is running.
    Running,
    /// Guest is stopped.
    Stopped,
    /// Guest is paused or suspended.
    Paused,
    /// Unknown status.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Paused => write!(f, "paused"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Guest type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestType {
    /// Full virtual machine.
    Qemu,
    /// Container.
    Lxc,
}

/// A hypervisor node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node name, unique within its cluster.
    pub name: String,
    /// Whether the node is online.
    pub online: bool,
    /// CPU usage (0.0-1.0).
    pub cpu_usage: f64,
    /// Memory in use, in bytes.
    pub memory_used: u64,
    /// Total memory, in bytes.
    pub memory_total: u64,
    /// Uptime in seconds.
    pub uptime: u64,
    /// Hypervisor version string.
    pub version: String,
    /// Profile this node was listed from. Set by the aggregator.
    #[serde(default)]
    pub source_profile: String,
}

impl Node {
    /// Identity used for node-level tasks.
    #[must_use]
    pub fn target(&self) -> TargetIdentity {
        TargetIdentity::node(&self.source_profile, &self.name)
    }
}

/// A guest running on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vm {
    /// Guest ID, unique within its cluster.
    pub id: u32,
    /// Guest name.
    pub name: String,
    /// Node currently hosting the guest.
    pub node: String,
    /// Guest type.
    pub guest: GuestType,
    /// Current status.
    pub status: VmStatus,
    /// Uptime in seconds.
    pub uptime: u64,
    /// Profile this guest was listed from. Set by the aggregator.
    #[serde(default)]
    pub source_profile: String,
}

impl Vm {
    #[must_use]
    pub fn target(&self) -> TargetIdentity {
        TargetIdentity::vm(&self.source_profile, &self.node, self.id)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == VmStatus::Running
    }
}

/// Point-in-time listing of one cluster's resources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    /// Cluster name as reported by the API, if any.
    pub cluster_name: Option<String>,
    /// All nodes.
    pub nodes: Vec<Node>,
    /// All guests across all nodes.
    pub vms: Vec<Vm>,
}

impl ClusterSnapshot {
    /// Stamp every item with the profile it came from.
    #[must_use]
    pub fn tagged(mut self, profile: &str) -> Self {
        for node in &mut self.nodes {
            node.source_profile = profile.to_string();
        }
        for vm in &mut self.vms {
            vm.source_profile = profile.to_string();
        }
        self
    }
}
