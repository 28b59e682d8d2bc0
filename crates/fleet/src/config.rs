//! Fleet configuration: connection profiles and runtime settings.
//!
//! Loaded from a YAML document such as:
//!
//! ```yaml
//! default_profile: lab
//! profiles:
//!   lab:
//!     addr: https://pve-lab.example.com:8006
//!     user: root
//!     realm: pam
//!     token_id: fleet
//!     token_secret: 00000000-0000-0000-0000-000000000000
//!     groups: [homelab]
//!   backup:
//!     addr: https://pve-backup.example.com:8006
//!     user: admin
//!     password: hunter2
//!     groups: [homelab]
//! aggregator:
//!   connect_timeout_secs: 10
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default number of finished tasks kept for display.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Default per-profile connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default per-profile refresh timeout.
pub const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 15;

/// Default stabilization poll interval.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;

/// Default stabilization deadline.
pub const DEFAULT_MAX_WAIT_SECS: u64 = 120;

/// Default interval between remote task status polls.
pub const DEFAULT_TASK_POLL_INTERVAL_SECS: u64 = 2;

/// Default limit on how long a remote task may run.
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 1800;

/// A named, independently authenticated cluster connection.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    /// Profile name. Taken from the key in the `profiles` map.
    #[serde(skip)]
    pub name: String,
    /// API address (e.g., `https://pve.example.com:8006`).
    pub addr: String,
    /// Login user.
    #[serde(default)]
    pub user: String,
    /// Authentication realm.
    #[serde(default = "default_realm")]
    pub realm: String,
    /// Password login.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// API token ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    /// API token secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_secret: Option<String>,
    /// Skip TLS verification.
    #[serde(default)]
    pub insecure: bool,
    /// Aggregate groups this profile belongs to.
    #[serde(default)]
    pub groups: Vec<String>,
}

fn default_realm() -> String {
    "pam".to_string()
}

impl Profile {
    /// Create a profile with just a name and address.
    #[must_use]
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            realm: default_realm(),
            ..Self::default()
        }
    }

    /// Add a group membership.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    #[must_use]
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }

    /// Whether the profile carries usable credentials.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.password.is_some() || (self.token_id.is_some() && self.token_secret.is_some())
    }
}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "***");
        f.debug_struct("Profile")
            .field("name", &self.name)
            .field("addr", &self.addr)
            .field("user", &self.user)
            .field("realm", &self.realm)
            .field("password", &redact(&self.password))
            .field("token_id", &self.token_id)
            .field("token_secret", &redact(&self.token_secret))
            .field("insecure", &self.insecure)
            .field("groups", &self.groups)
            .finish()
    }
}

/// Task queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Finished tasks retained for display.
    pub history_limit: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Aggregator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorSettings {
    /// Per-profile timeout for connecting.
    pub connect_timeout_secs: u64,
    /// Per-profile timeout for listing resources.
    pub refresh_timeout_secs: u64,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            refresh_timeout_secs: DEFAULT_REFRESH_TIMEOUT_SECS,
        }
    }
}

impl AggregatorSettings {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }
}

/// How long to wait for a resource to reach its post-operation state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizeSettings {
    /// Delay between status polls.
    pub poll_interval_secs: u64,
    /// Give up after this long.
    pub max_wait_secs: u64,
    /// Delay between remote task status polls.
    pub task_poll_interval_secs: u64,
    /// Fail a remote task still running after this long.
    pub task_timeout_secs: u64,
}

impl Default for StabilizeSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            max_wait_secs: DEFAULT_MAX_WAIT_SECS,
            task_poll_interval_secs: DEFAULT_TASK_POLL_INTERVAL_SECS,
            task_timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
        }
    }
}

impl StabilizeSettings {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[must_use]
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    #[must_use]
    pub fn task_poll_interval(&self) -> Duration {
        Duration::from_secs(self.task_poll_interval_secs)
    }

    #[must_use]
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Profile used when none is selected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_profile: Option<String>,
    /// Profiles keyed by name.
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
    /// Queue settings.
    #[serde(default)]
    pub queue: QueueSettings,
    /// Aggregator settings.
    #[serde(default)]
    pub aggregator: AggregatorSettings,
    /// Stabilization settings.
    #[serde(default)]
    pub stabilize: StabilizeSettings,
}

impl FleetConfig {
    /// Parse a configuration document.
    ///
    /// # Errors
    /// Returns an error if the YAML is malformed.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let mut config: Self =
            serde_yaml::from_str(content).context("Failed to parse fleet configuration")?;
        for (name, profile) in &mut config.profiles {
            profile.name.clone_from(name);
        }
        Ok(config)
    }

    /// Load a configuration file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_yaml_str(&content)?;
        debug!(
            path = %path.display(),
            profiles = config.profiles.len(),
            "Loaded fleet configuration"
        );
        Ok(config)
    }

    /// Check the document for settings that cannot work.
    ///
    /// # Errors
    /// Returns an error describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.profiles.is_empty() {
            bail!("no profiles configured");
        }

        for (name, profile) in &self.profiles {
            if profile.addr.trim().is_empty() {
                bail!("profile '{name}' has no address");
            }
            if !profile.has_credentials() {
                bail!("profile '{name}' needs a password or a token_id/token_secret pair");
            }
        }

        if let Some(default) = &self.default_profile {
            if !self.profiles.contains_key(default) {
                bail!("default profile '{default}' is not defined");
            }
        }

        if self.aggregator.connect_timeout_secs == 0 || self.aggregator.refresh_timeout_secs == 0 {
            bail!("aggregator timeouts must be greater than zero");
        }
        if self.stabilize.poll_interval_secs == 0 || self.stabilize.task_poll_interval_secs == 0 {
            bail!("stabilize poll intervals must be greater than zero");
        }

        Ok(())
    }

    #[must_use]
    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    /// Profiles forming an aggregate group, ordered by name.
    #[must_use]
    pub fn group_profiles(&self, group: &str) -> Vec<Profile> {
        self.profiles
            .values()
            .filter(|p| p.in_group(group))
            .cloned()
            .collect()
    }

    /// All groups with their member profile names.
    #[must_use]
    pub fn groups(&self) -> BTreeMap<String, Vec<String>> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for profile in self.profiles.values() {
            for group in &profile.groups {
                groups
                    .entry(group.clone())
                    .or_default()
                    .push(profile.name.clone());
            }
        }
        groups
    }
}
