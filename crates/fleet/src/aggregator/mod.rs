//! Multi-profile cluster aggregator.
//!
//! A [`ClusterAggregator`] owns one client per profile of an aggregate group.
//! It connects them concurrently and merges their resource listings into one
//! [`AggregatedView`]. An unreachable profile is recorded and reported but never
//! blocks the others: `initialize` fails only when every profile failed, and
//! `group_cluster_resources` fails only when no profile returned fresh data.
//!
//! Connect failures and refresh failures are tracked separately. A profile
//! whose refresh fails is marked [`ConnectionState::Degraded`], keeps its last
//! snapshot (shown stale) and is retried on the next refresh.

mod connection;
mod error;
mod view;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{ClientError, ClusterClient, Connector};
use crate::config::{AggregatorSettings, Profile};
use crate::supervise::supervised;

pub use connection::{ConnectionState, ConnectionSummary};
pub use error::{AggregatorError, ProfileError, ProfileFailure};
pub use view::AggregatedView;

use connection::ProfileConnection;

type Connections = BTreeMap<String, ProfileConnection>;

/// Settled result of one per-profile attempt.
type Attempt<T> = (String, Result<T, ProfileFailure>);

/// Per-profile outcome of a connect round.
pub type ConnectOutcomes = BTreeMap<String, Result<(), ProfileError>>;

/// Presents the clusters of an aggregate group as one resource universe.
pub struct ClusterAggregator {
    group: String,
    connector: Arc<dyn Connector>,
    settings: AggregatorSettings,
    connections: RwLock<Connections>,
    view: RwLock<Arc<AggregatedView>>,
    /// Bumped by `initialize` and `close`; results from an older epoch are dropped.
    epoch: AtomicU64,
    closed: AtomicBool,
}

impl ClusterAggregator {
    /// Create an aggregator for a group. Nothing connects until `initialize`.
    #[must_use]
    pub fn new(
        group: impl Into<String>,
        connector: Arc<dyn Connector>,
        settings: AggregatorSettings,
    ) -> Self {
        Self {
            group: group.into(),
            connector,
            settings,
            connections: RwLock::new(BTreeMap::new()),
            view: RwLock::new(Arc::new(AggregatedView::default())),
            epoch: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn connections(&self) -> RwLockReadGuard<'_, Connections> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn connections_mut(&self) -> RwLockWriteGuard<'_, Connections> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, view: AggregatedView) -> Arc<AggregatedView> {
        let view = Arc::new(view);
        *self.view.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&view);
        view
    }

    fn is_current(&self, epoch: u64) -> bool {
        !self.is_closed() && self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Apply a state change unless `close` or a newer `initialize` intervened.
    fn update(&self, epoch: u64, apply: impl FnOnce(&mut Connections)) -> bool {
        let mut connections = self.connections_mut();
        if !self.is_current(epoch) {
            return false;
        }
        apply(&mut connections);
        true
    }

    fn update_profile(&self, epoch: u64, name: &str, apply: impl FnOnce(&mut ProfileConnection)) {
        self.update(epoch, |connections| {
            if let Some(conn) = connections.get_mut(name) {
                apply(conn);
            }
        });
    }

    /// Connect every profile concurrently.
    ///
    /// Each attempt has its own timeout. Cancelling `ctx` returns promptly and
    /// marks attempts that had not settled as failed. Calling this again
    /// replaces all previous connections.
    ///
    /// # Errors
    /// Returns [`AggregatorError::TotalFailure`] only if every profile failed,
    /// [`AggregatorError::NoProfiles`] for an empty list and
    /// [`AggregatorError::Closed`] after `close`.
    pub async fn initialize(
        &self,
        ctx: &CancellationToken,
        profiles: Vec<Profile>,
    ) -> Result<ConnectionSummary, AggregatorError> {
        if self.is_closed() {
            return Err(AggregatorError::Closed);
        }
        if profiles.is_empty() {
            return Err(AggregatorError::NoProfiles);
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let fresh: Connections = profiles
            .into_iter()
            .map(|p| (p.name.clone(), ProfileConnection::pending(p)))
            .collect();
        let profiles: Vec<Profile> = fresh.values().map(|c| c.profile.clone()).collect();

        if !self.update(epoch, |connections| *connections = fresh) {
            return Err(AggregatorError::Closed);
        }
        self.publish(AggregatedView::default());

        info!(group = %self.group, profiles = profiles.len(), "Connecting profiles");
        let outcomes = self.connect_profiles(ctx, epoch, profiles).await;

        if self.is_closed() {
            return Err(AggregatorError::Closed);
        }
        if !self.is_current(epoch) {
            debug!(group = %self.group, "Initialization superseded by a newer one");
            return Err(AggregatorError::Cancelled);
        }

        let summary = self.connection_summary();
        if outcomes.values().all(Result::is_err) {
            let errors: Vec<ProfileError> = outcomes.into_values().filter_map(Result::err).collect();
            error!(group = %self.group, failed = errors.len(), "Every profile failed to connect");
            return Err(AggregatorError::TotalFailure { errors });
        }

        info!(
            group = %self.group,
            connected = summary.connected_count,
            failed = summary.error_count,
            "Aggregator initialized"
        );
        Ok(summary)
    }

    async fn connect_profiles(
        &self,
        ctx: &CancellationToken,
        epoch: u64,
        profiles: Vec<Profile>,
    ) -> ConnectOutcomes {
        let limit = self.settings.connect_timeout();
        let names: Vec<String> = profiles.iter().map(|p| p.name.clone()).collect();
        let mut attempts = JoinSet::new();

        for profile in profiles {
            let connector = Arc::clone(&self.connector);
            attempts.spawn(async move {
                debug!(profile = %profile.name, addr = %profile.addr, "Connecting profile");
                let result = attempt(limit, connector.connect(&profile)).await;
                (profile.name, result)
            });
        }

        let mut outcomes = ConnectOutcomes::new();
        let cancelled = drain(ctx, &mut attempts, |name, result| {
            let outcome = self.record_connect(epoch, &name, result);
            outcomes.insert(name, outcome);
        })
        .await;

        for name in names {
            if outcomes.contains_key(&name) {
                continue;
            }
            let failure = if cancelled {
                ProfileFailure::Cancelled
            } else {
                ProfileFailure::Panicked("connect attempt aborted".to_string())
            };
            let outcome = self.record_connect(epoch, &name, Err(failure));
            outcomes.insert(name, outcome);
        }

        outcomes
    }

    fn record_connect(
        &self,
        epoch: u64,
        name: &str,
        result: Result<Arc<dyn ClusterClient>, ProfileFailure>,
    ) -> Result<(), ProfileError> {
        match result {
            Ok(client) => {
                info!(group = %self.group, profile = %name, "Profile connected");
                self.update_profile(epoch, name, |conn| conn.connected(client));
                Ok(())
            }
            Err(failure) => {
                let err = ProfileError::new(name, failure);
                warn!(group = %self.group, profile = %name, error = %err.failure, "Profile failed to connect");
                self.update_profile(epoch, name, |conn| conn.connect_failed(err.clone()));
                Err(err)
            }
        }
    }

    /// Snapshot of per-profile connection state.
    #[must_use]
    pub fn connection_summary(&self) -> ConnectionSummary {
        ConnectionSummary::collect(&self.group, self.connections().values())
    }

    /// Refresh every connected profile concurrently and publish a new view.
    ///
    /// A profile whose refresh fails is degraded; its previous snapshot stays
    /// in the view and is listed in `stale_profiles`.
    ///
    /// # Errors
    /// Returns [`AggregatorError::NoResults`] when no profile returned fresh
    /// data, [`AggregatorError::Cancelled`] if `ctx` fires first (the current
    /// view is kept), and [`AggregatorError::NotInitialized`] or
    /// [`AggregatorError::Closed`] when there is nothing to refresh.
    pub async fn group_cluster_resources(
        &self,
        ctx: &CancellationToken,
    ) -> Result<Arc<AggregatedView>, AggregatorError> {
        if self.is_closed() {
            return Err(AggregatorError::Closed);
        }

        let epoch = self.epoch.load(Ordering::SeqCst);
        let (clients, connect_errors) = {
            let connections = self.connections();
            if connections.is_empty() {
                return Err(AggregatorError::NotInitialized);
            }
            let clients: Vec<(String, Arc<dyn ClusterClient>)> = connections
                .iter()
                .filter_map(|(name, conn)| conn.client.clone().map(|c| (name.clone(), c)))
                .collect();
            let errors: Vec<ProfileError> = connections
                .values()
                .filter_map(|conn| conn.connect_error.clone())
                .collect();
            (clients, errors)
        };

        if clients.is_empty() {
            warn!(group = %self.group, "No connected profiles to refresh");
            return Err(AggregatorError::NoResults {
                errors: connect_errors,
            });
        }

        let limit = self.settings.refresh_timeout();
        let mut attempts = JoinSet::new();
        for (name, client) in clients {
            attempts.spawn(async move {
                let result = attempt(limit, client.cluster_resources()).await;
                (name, result)
            });
        }

        let mut fresh = 0usize;
        let mut refresh_errors = Vec::new();
        let cancelled = drain(ctx, &mut attempts, |name, result| match result {
            Ok(snapshot) => {
                debug!(
                    group = %self.group,
                    profile = %name,
                    nodes = snapshot.nodes.len(),
                    vms = snapshot.vms.len(),
                    "Profile refreshed"
                );
                fresh += 1;
                self.update_profile(epoch, &name, |conn| conn.refreshed(snapshot));
            }
            Err(failure) => {
                let err = ProfileError::new(&name, failure);
                warn!(group = %self.group, profile = %name, error = %err.failure, "Profile refresh failed");
                self.update_profile(epoch, &name, |conn| conn.refresh_failed(err.clone()));
                refresh_errors.push(err);
            }
        })
        .await;

        if cancelled {
            info!(group = %self.group, "Refresh cancelled, keeping previous view");
            return Err(AggregatorError::Cancelled);
        }
        if self.is_closed() {
            return Err(AggregatorError::Closed);
        }
        if !self.is_current(epoch) {
            return Err(AggregatorError::Cancelled);
        }
        if fresh == 0 {
            error!(group = %self.group, failed = refresh_errors.len(), "No profile returned resources");
            return Err(AggregatorError::NoResults {
                errors: refresh_errors,
            });
        }

        let connections = self.connections();
        let view = AggregatedView::merge(connections.values().filter(|c| c.is_usable()).filter_map(
            |conn| {
                let stale = (conn.state == ConnectionState::Degraded).then_some(conn.profile.name.as_str());
                conn.snapshot.as_ref().map(|s| (s, stale))
            },
        ));
        info!(
            group = %self.group,
            nodes = view.nodes.len(),
            vms = view.vms.len(),
            fresh,
            stale = view.stale_profiles.len(),
            "Published aggregated view"
        );
        let view = self.publish(view);
        drop(connections);
        Ok(view)
    }

    /// The most recently published view.
    #[must_use]
    pub fn view(&self) -> Arc<AggregatedView> {
        Arc::clone(&self.view.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Client of a connected profile, for building tasks.
    ///
    /// # Errors
    /// Returns [`AggregatorError::UnknownProfile`] or
    /// [`AggregatorError::NotConnected`].
    pub fn client(&self, profile: &str) -> Result<Arc<dyn ClusterClient>, AggregatorError> {
        let connections = self.connections();
        let conn = connections
            .get(profile)
            .ok_or_else(|| AggregatorError::UnknownProfile(profile.to_string()))?;
        conn.client
            .clone()
            .ok_or_else(|| AggregatorError::NotConnected(profile.to_string()))
    }

    /// Retry the connect attempt of every failed profile.
    ///
    /// # Errors
    /// Returns [`AggregatorError::Closed`] or
    /// [`AggregatorError::NotInitialized`].
    pub async fn reconnect_failed(
        &self,
        ctx: &CancellationToken,
    ) -> Result<ConnectOutcomes, AggregatorError> {
        if self.is_closed() {
            return Err(AggregatorError::Closed);
        }

        let epoch = self.epoch.load(Ordering::SeqCst);
        let mut failed = Vec::new();
        let mut initialized = false;
        self.update(epoch, |connections| {
            initialized = !connections.is_empty();
            for conn in connections.values_mut() {
                if conn.state == ConnectionState::Failed {
                    conn.state = ConnectionState::Pending;
                    failed.push(conn.profile.clone());
                }
            }
        });

        if !initialized {
            return Err(AggregatorError::NotInitialized);
        }
        if failed.is_empty() {
            debug!(group = %self.group, "No failed profiles to reconnect");
            return Ok(ConnectOutcomes::new());
        }

        info!(group = %self.group, profiles = failed.len(), "Reconnecting failed profiles");
        Ok(self.connect_profiles(ctx, epoch, failed).await)
    }

    /// Release every client and the published view. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!(group = %self.group, "Aggregator already closed");
            return;
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);

        let mut connections = self.connections_mut();
        for conn in connections.values_mut() {
            conn.disconnect();
        }
        let released = connections.len();
        drop(connections);

        self.publish(AggregatedView::default());
        info!(group = %self.group, profiles = released, "Aggregator closed");
    }
}

/// Run one client call with a timeout, converting panics and timeouts.
async fn attempt<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, ClientError>>,
) -> Result<T, ProfileFailure> {
    match supervised(tokio::time::timeout(limit, call)).await {
        Ok(Ok(result)) => result.map_err(ProfileFailure::Client),
        Ok(Err(_elapsed)) => Err(ProfileFailure::TimedOut(limit)),
        Err(message) => Err(ProfileFailure::Panicked(message)),
    }
}

/// Feed settled attempts to `on_result` until all finish or `ctx` fires.
///
/// Returns whether `ctx` fired. Unsettled attempts are aborted.
async fn drain<T>(
    ctx: &CancellationToken,
    attempts: &mut JoinSet<Attempt<T>>,
    mut on_result: impl FnMut(String, Result<T, ProfileFailure>),
) -> bool
where
    T: Send + 'static,
{
    loop {
        tokio::select! {
            biased;
            () = ctx.cancelled() => {
                attempts.abort_all();
                return true;
            }
            next = attempts.join_next() => match next {
                None => return false,
                Some(Ok((name, result))) => on_result(name, result),
                Some(Err(err)) => error!(error = %err, "Profile attempt aborted"),
            },
        }
    }
}
