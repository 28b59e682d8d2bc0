//! Structural identity of a manageable resource across aggregated clusters.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of resource a target addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// A hypervisor node.
    Node,
    /// A guest (QEMU VM or LXC container).
    Vm,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node => write!(f, "node"),
            Self::Vm => write!(f, "vm"),
        }
    }
}

/// Unique key for any resource across all aggregated clusters.
///
/// Equality and hashing are field-wise, so names containing separator
/// characters can never collide the way joined string keys do.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetIdentity {
    /// Profile (cluster connection) the resource belongs to.
    pub profile: String,
    /// Node hosting the resource, or the node itself.
    pub node: String,
    /// Guest ID; always 0 for node targets.
    pub resource_id: u32,
    /// Resource kind.
    pub kind: ResourceKind,
}

impl TargetIdentity {
    /// Identity of a guest.
    pub fn vm(profile: impl Into<String>, node: impl Into<String>, vmid: u32) -> Self {
        Self {
            profile: profile.into(),
            node: node.into(),
            resource_id: vmid,
            kind: ResourceKind::Vm,
        }
    }

    /// Identity of a node.
    pub fn node(profile: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            node: node.into(),
            resource_id: 0,
            kind: ResourceKind::Node,
        }
    }

    #[must_use]
    pub fn is_vm(&self) -> bool {
        self.kind == ResourceKind::Vm
    }
}

impl fmt::Display for TargetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ResourceKind::Node => write!(f, "{}/{}", self.profile, self.node),
            ResourceKind::Vm => write!(f, "{}/{}/{}", self.profile, self.node, self.resource_id),
        }
    }
}
