//! Aggregator error types.

use std::time::Duration;

use thiserror::Error;

use crate::client::ClientError;

/// Why one profile's connect or refresh attempt failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProfileFailure {
    /// The client reported an error.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The attempt did not finish in time.
    #[error("timed out after {}s", .0.as_secs())]
    TimedOut(Duration),

    /// The caller cancelled before the attempt settled.
    #[error("cancelled before completion")]
    Cancelled,

    /// The attempt panicked.
    #[error("panicked: {0}")]
    Panicked(String),
}

/// A failure attributed to one profile.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("profile '{profile}': {failure}")]
pub struct ProfileError {
    pub profile: String,
    pub failure: ProfileFailure,
}

impl ProfileError {
    pub(crate) fn new(profile: impl Into<String>, failure: ProfileFailure) -> Self {
        Self {
            profile: profile.into(),
            failure,
        }
    }
}

/// Errors returned by [`super::ClusterAggregator`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregatorError {
    /// `initialize` was called with an empty profile list.
    #[error("no profiles to connect")]
    NoProfiles,

    /// Every profile failed to connect.
    #[error("all {} profiles failed to connect", .errors.len())]
    TotalFailure { errors: Vec<ProfileError> },

    /// No profile produced fresh resources.
    #[error("no profiles returned successful results")]
    NoResults { errors: Vec<ProfileError> },

    #[error("aggregator is not initialized")]
    NotInitialized,

    #[error("aggregator is closed")]
    Closed,

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    #[error("unknown profile: {0}")]
    UnknownProfile(String),

    /// The profile exists but has no live client.
    #[error("profile '{0}' is not connected")]
    NotConnected(String),
}

impl AggregatorError {
    /// Per-profile errors carried by a total failure.
    #[must_use]
    pub fn profile_errors(&self) -> &[ProfileError] {
        match self {
            Self::TotalFailure { errors } | Self::NoResults { errors } => errors,
            _ => &[],
        }
    }
}
