//! Route orchestration across connection groups.
//!
//! The [`Router`] owns one [`RouteGroup`] per connection group and is the
//! only entry point for route changes. Every public operation runs under a
//! single lock, so controller updates, probe processing and commits never
//! interleave.
//!
//! Address claims are exclusive across groups: a destination (or peer
//! address) already claimed by another group is admitted as disabled and
//! re-admitted by [`Router::apply`] once the other claim goes away.

mod apply;

pub use apply::{ApplyReport, MAX_APPLY_PASSES};

use std::collections::BTreeMap;
use std::sync::Arc;

use ipnet::IpNet;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::RouterConfig;
use crate::error::Error;
use crate::events::{PeerActiveData, StatusEvent, StatusSink};
use crate::metrics::PathMetricStore;
use crate::netcfg::RouteAdapter;
use crate::peermon::{NodeState, PeerPathMonitor, Thresholds};
use crate::servicemon::ServiceRouteMonitor;
use crate::types::{ConnectionId, GroupId, NetworkPath, RouteResult};

/// Peer and service monitors of one connection group.
#[derive(Debug)]
pub struct RouteGroup {
    pub peers: PeerPathMonitor,
    pub services: ServiceRouteMonitor,
}

impl RouteGroup {
    fn new(group_id: GroupId, config: &RouterConfig) -> Self {
        Self {
            peers: PeerPathMonitor::new(group_id, config.window_size, config.thresholds()),
            services: ServiceRouteMonitor::new(group_id),
        }
    }

    /// Check whether this group claims `addr` as a peer or a destination.
    pub fn claims(&self, addr: &IpNet) -> bool {
        self.peers.has_node(addr) || self.services.has_address(addr)
    }
}

#[derive(Debug, Default)]
pub(crate) struct RouterState {
    pub(crate) groups: BTreeMap<GroupId, RouteGroup>,
}

impl RouterState {
    /// Check whether any group other than `group_id` claims `addr`.
    pub(crate) fn has_ip_conflict(&self, addr: &IpNet, group_id: GroupId) -> bool {
        self.groups
            .iter()
            .any(|(gid, group)| *gid != group_id && group.claims(addr))
    }
}

/// Route manager for all connection groups.
pub struct Router {
    state: Mutex<RouterState>,
    adapter: Arc<dyn RouteAdapter>,
    sink: Arc<dyn StatusSink>,
    config: Mutex<RouterConfig>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("groups", &self.state.lock().groups.len())
            .field("config", &*self.config.lock())
            .finish_non_exhaustive()
    }
}

impl Router {
    pub fn new(
        config: RouterConfig,
        adapter: Arc<dyn RouteAdapter>,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            state: Mutex::new(RouterState::default()),
            adapter,
            sink,
            config: Mutex::new(config),
        }
    }

    /// Current configuration.
    pub fn config(&self) -> RouterConfig {
        self.config.lock().clone()
    }

    /// Update reroute thresholds of all current and future groups.
    pub fn set_reroute_thresholds(&self, diff: f32, ratio: f32) {
        let thresholds = Thresholds::new(diff, ratio);
        let mut state = self.state.lock();
        {
            let mut config = self.config.lock();
            config.reroute_diff = diff;
            config.reroute_ratio = ratio;
        }
        for group in state.groups.values_mut() {
            group.peers.set_thresholds(thresholds);
        }
        info!(diff, ratio, "Reroute thresholds updated");
    }

    /// Admit the destinations reachable through `path`.
    ///
    /// The first destination is the peer's own tunnel address; the rest are
    /// service prefixes behind it. Nothing is committed until [`Router::apply`].
    pub fn route_add(&self, path: &NetworkPath, destinations: &[IpNet]) -> Vec<RouteResult> {
        let config = self.config();
        let mut state = self.state.lock();
        let mut results = Vec::with_capacity(destinations.len());

        for (idx, dest) in destinations.iter().enumerate() {
            if self.adapter.is_default_route(dest) && !config.vpn_client {
                let err = Error::DefaultRouteRejected(*dest);
                warn!(destination = %dest, group = %path.group_id, "Rejecting default route");
                results.push(RouteResult::failed(*dest, &err));
                continue;
            }

            let conflict = state.has_ip_conflict(dest, path.group_id);
            let group = state
                .groups
                .entry(path.group_id)
                .or_insert_with(|| RouteGroup::new(path.group_id, &config));

            if idx == 0 {
                if *dest != path.host_prefix() {
                    debug!(destination = %dest, gateway = %path.gateway, "Peer address differs from gateway");
                }
                group.peers.add_node(path, conflict);
            } else {
                group.services.add(path, *dest, conflict);
            }

            if conflict {
                let err = Error::AddressConflict(*dest);
                warn!(destination = %dest, group = %path.group_id, "Address claimed by another group, admitted disabled");
                results.push(RouteResult::failed(*dest, &err));
            } else {
                results.push(RouteResult::ok(*dest));
            }
        }

        results
    }

    /// Schedule the destinations reachable through `path` for removal.
    pub fn route_del(&self, path: &NetworkPath, destinations: &[IpNet]) -> Vec<RouteResult> {
        let mut state = self.state.lock();

        let Some(group) = state.groups.get_mut(&path.group_id) else {
            // Nothing to delete is as good as deleted
            warn!(gateway = %path.gateway, group = %path.group_id, "Route group does not exist");
            return destinations.iter().map(|d| RouteResult::ok(*d)).collect();
        };

        destinations
            .iter()
            .enumerate()
            .map(|(idx, dest)| {
                if idx == 0 {
                    group.peers.del_node(&path.gateway);
                    return RouteResult::ok(*dest);
                }
                match group.services.del(path, dest) {
                    Ok(()) => RouteResult::ok(*dest),
                    Err(e) => {
                        warn!(destination = %dest, error = %e, "Service route delete");
                        RouteResult::failed(*dest, &e)
                    }
                }
            })
            .collect()
    }

    /// Check whether a group other than `group_id` claims `addr`.
    pub fn has_ip_conflict(&self, addr: &IpNet, group_id: GroupId) -> bool {
        self.state.lock().has_ip_conflict(addr, group_id)
    }

    /// Check whether any group claims `prefix`.
    pub fn has_route(&self, prefix: &IpNet) -> bool {
        self.state.lock().groups.values().any(|g| g.claims(prefix))
    }

    /// Connection carrying `destination` for a group, if installed.
    pub fn active_connection(&self, group_id: GroupId, destination: &IpNet) -> Option<ConnectionId> {
        let state = self.state.lock();
        let group = state.groups.get(&group_id)?;

        if let Some(list) = group.services.route_list(destination) {
            return list.active_candidate().map(|c| c.connection_id());
        }
        let conn = group
            .peers
            .nodes()
            .find(|n| n.host_prefix() == *destination && n.state() == NodeState::Active)
            .map(|n| n.connection_id());
        conn
    }

    /// Number of known connection groups.
    pub fn group_count(&self) -> usize {
        self.state.lock().groups.len()
    }

    /// Feed one probe round to every group and follow path changes.
    pub fn ping_process(&self, store: &PathMetricStore) -> Vec<PeerActiveData> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            for group in state.groups.values_mut() {
                group.peers.ping_process(store);
                let best = group.peers.best_path();
                events.extend(group.services.reroute(best.as_ref(), self.adapter.as_ref()));
            }
        }

        if !events.is_empty() {
            self.sink.emit(StatusEvent::PeerActiveData(events.clone()));
        }
        events
    }

    /// Forget all groups without touching the routing table.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        for group in state.groups.values_mut() {
            group.services.flush();
            group.peers.flush();
        }
        state.groups.clear();
        debug!("Router state flushed");
    }

    /// Withdraw installed routes when cleanup on exit is enabled, then
    /// forget all groups.
    pub fn close(&self) {
        if !self.config.lock().cleanup_on_exit {
            self.flush();
            return;
        }

        let mut state = self.state.lock();
        for (gid, group) in &mut state.groups {
            info!(group = %gid, "Removing routes");
            group.services.close(self.adapter.as_ref());
            group.peers.close(self.adapter.as_ref());
        }
        state.groups.clear();
    }
}
