//! Immutable merged view over every profile's last snapshot.

use chrono::{DateTime, Utc};

use crate::identity::TargetIdentity;
use crate::models::{ClusterSnapshot, Node, Vm};

/// Nodes and guests from all profiles, each tagged with its source profile.
///
/// A view is rebuilt from scratch on every refresh and swapped in whole, so a
/// reader holding one never sees a partial merge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedView {
    /// Sorted by (profile, name).
    pub nodes: Vec<Node>,
    /// Sorted by (profile, node, id).
    pub vms: Vec<Vm>,
    /// Profiles whose data comes from an earlier refresh.
    pub stale_profiles: Vec<String>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl AggregatedView {
    /// Merge tagged snapshots. A profile name marks its snapshot as stale.
    pub(crate) fn merge<'a>(
        snapshots: impl IntoIterator<Item = (&'a ClusterSnapshot, Option<&'a str>)>,
    ) -> Self {
        let mut view = Self {
            refreshed_at: Some(Utc::now()),
            ..Self::default()
        };

        for (snapshot, stale_profile) in snapshots {
            view.nodes.extend(snapshot.nodes.iter().cloned());
            view.vms.extend(snapshot.vms.iter().cloned());
            if let Some(profile) = stale_profile {
                view.stale_profiles.push(profile.to_string());
            }
        }

        view.nodes.sort_by(|a, b| {
            (&a.source_profile, &a.name).cmp(&(&b.source_profile, &b.name))
        });
        view.vms.sort_by(|a, b| {
            (&a.source_profile, &a.node, a.id).cmp(&(&b.source_profile, &b.node, b.id))
        });
        view.stale_profiles.sort();
        view
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.vms.is_empty()
    }

    /// Guest addressed by a target.
    #[must_use]
    pub fn vm(&self, target: &TargetIdentity) -> Option<&Vm> {
        if !target.is_vm() {
            return None;
        }
        self.vms.iter().find(|vm| {
            vm.id == target.resource_id && vm.node == target.node && vm.source_profile == target.profile
        })
    }

    #[must_use]
    pub fn node(&self, profile: &str, name: &str) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| n.source_profile == profile && n.name == name)
    }

    /// Guests with this ID in any profile. IDs are only unique per cluster.
    #[must_use]
    pub fn find_vms_by_id(&self, id: u32) -> Vec<&Vm> {
        self.vms.iter().filter(|vm| vm.id == id).collect()
    }

    /// Whether a profile's data is from an earlier refresh.
    #[must_use]
    pub fn is_stale(&self, profile: &str) -> bool {
        self.stale_profiles.iter().any(|p| p == profile)
    }
}
