//! Per-profile connection state and the derived summary.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::ProfileError;
use crate::client::ClusterClient;
use crate::config::Profile;
use crate::models::ClusterSnapshot;

/// Connection state of one profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Connect attempt not settled yet.
    Pending,
    /// Connected, last refresh succeeded or none attempted.
    Connected,
    /// Connected, but the last refresh failed. The previous snapshot is kept.
    Degraded,
    /// Connect attempt failed.
    Failed,
    /// Released by `close`.
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Connected => write!(f, "connected"),
            Self::Degraded => write!(f, "degraded"),
            Self::Failed => write!(f, "failed"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// One profile, its client and its last snapshot.
pub(crate) struct ProfileConnection {
    pub(crate) profile: Profile,
    pub(crate) state: ConnectionState,
    pub(crate) client: Option<Arc<dyn ClusterClient>>,
    pub(crate) connect_error: Option<ProfileError>,
    pub(crate) refresh_error: Option<ProfileError>,
    pub(crate) snapshot: Option<ClusterSnapshot>,
    pub(crate) refreshed_at: Option<DateTime<Utc>>,
}

impl ProfileConnection {
    pub(crate) fn pending(profile: Profile) -> Self {
        Self {
            profile,
            state: ConnectionState::Pending,
            client: None,
            connect_error: None,
            refresh_error: None,
            snapshot: None,
            refreshed_at: None,
        }
    }

    pub(crate) fn connected(&mut self, client: Arc<dyn ClusterClient>) {
        self.state = ConnectionState::Connected;
        self.client = Some(client);
        self.connect_error = None;
    }

    pub(crate) fn connect_failed(&mut self, error: ProfileError) {
        self.state = ConnectionState::Failed;
        self.client = None;
        self.connect_error = Some(error);
    }

    pub(crate) fn refreshed(&mut self, snapshot: ClusterSnapshot) {
        self.state = ConnectionState::Connected;
        self.refresh_error = None;
        self.snapshot = Some(snapshot.tagged(&self.profile.name));
        self.refreshed_at = Some(Utc::now());
    }

    /// Keep the client and the last snapshot; the next refresh retries.
    pub(crate) fn refresh_failed(&mut self, error: ProfileError) {
        self.state = ConnectionState::Degraded;
        self.refresh_error = Some(error);
    }

    pub(crate) fn disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.client = None;
        self.snapshot = None;
    }

    pub(crate) fn is_usable(&self) -> bool {
        self.client.is_some()
    }
}

impl fmt::Debug for ProfileConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileConnection")
            .field("profile", &self.profile.name)
            .field("state", &self.state)
            .field("connect_error", &self.connect_error)
            .field("refresh_error", &self.refresh_error)
            .field("refreshed_at", &self.refreshed_at)
            .finish_non_exhaustive()
    }
}

/// Read-only connection overview.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub group: String,
    pub total_profiles: usize,
    /// Profiles with a live client, degraded ones included.
    pub connected_count: usize,
    pub degraded_count: usize,
    /// Profiles whose connect attempt failed.
    pub error_count: usize,
    pub states: BTreeMap<String, ConnectionState>,
    /// Failures from the initial connect.
    pub connect_errors: BTreeMap<String, ProfileError>,
    /// Failures from the most recent refresh.
    pub refresh_errors: BTreeMap<String, ProfileError>,
}

impl ConnectionSummary {
    pub(crate) fn collect<'a>(
        group: &str,
        connections: impl IntoIterator<Item = &'a ProfileConnection>,
    ) -> Self {
        let mut summary = Self {
            group: group.to_string(),
            ..Self::default()
        };

        for conn in connections {
            let name = conn.profile.name.clone();
            summary.total_profiles += 1;
            match conn.state {
                ConnectionState::Connected => summary.connected_count += 1,
                ConnectionState::Degraded => {
                    summary.connected_count += 1;
                    summary.degraded_count += 1;
                }
                ConnectionState::Failed => summary.error_count += 1,
                ConnectionState::Pending | ConnectionState::Disconnected => {}
            }
            if let Some(err) = &conn.connect_error {
                summary.connect_errors.insert(name.clone(), err.clone());
            }
            if let Some(err) = &conn.refresh_error {
                summary.refresh_errors.insert(name.clone(), err.clone());
            }
            summary.states.insert(name, conn.state);
        }

        summary
    }

    /// Some but not all profiles are connected.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.connected_count > 0 && self.connected_count < self.total_profiles
    }

    /// Status line, e.g. "homelab: 1/2 profiles connected (1 failed)".
    #[must_use]
    pub fn message(&self) -> String {
        let mut line = format!(
            "{}: {}/{} profiles connected",
            self.group, self.connected_count, self.total_profiles
        );
        let mut notes = Vec::new();
        if self.error_count > 0 {
            notes.push(format!("{} failed", self.error_count));
        }
        if self.degraded_count > 0 {
            notes.push(format!("{} stale", self.degraded_count));
        }
        if !notes.is_empty() {
            line.push_str(&format!(" ({})", notes.join(", ")));
        }
        line
    }
}
