//! Commit loop of the router.

use tracing::{debug, error, info, warn};

use super::{Router, RouterState};
use crate::events::{PeerActiveData, RouteStatus, StatusEvent};
use crate::netcfg::RouteAdapter;
use crate::types::GroupId;

/// Upper bound of commit passes per apply. Two groups fighting over one
/// address could otherwise keep re-admitting each other forever.
pub const MAX_APPLY_PASSES: usize = 3;

/// Everything one [`Router::apply`] produced.
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub route_status: Vec<RouteStatus>,
    pub peer_active: Vec<PeerActiveData>,
    /// Commit passes run.
    pub passes: usize,
}

impl ApplyReport {
    /// True when nothing was committed.
    pub fn is_empty(&self) -> bool {
        self.route_status.is_empty() && self.peer_active.is_empty()
    }
}

impl Router {
    /// Commit pending changes of all groups.
    ///
    /// Conflicts freed by a pass are re-admitted and committed by the next
    /// one, up to [`MAX_APPLY_PASSES`]. Addresses still contested after that
    /// stay disabled until the next controller update.
    pub fn apply(&self) -> ApplyReport {
        let mut report = ApplyReport::default();
        {
            let mut state = self.state.lock();

            for pass in 1..=MAX_APPLY_PASSES {
                report.passes = pass;
                state.apply_changes(self.adapter.as_ref(), &mut report);

                let resolved = state.resolve_conflicts();
                if resolved == 0 {
                    break;
                }
                info!(resolved, pass, "IP conflicts resolved");
            }
        }

        if !report.route_status.is_empty() {
            self.sink
                .emit(StatusEvent::RouteStatus(report.route_status.clone()));
        }
        if !report.peer_active.is_empty() {
            self.sink
                .emit(StatusEvent::PeerActiveData(report.peer_active.clone()));
        }

        report
    }
}

impl RouterState {
    /// One commit pass over every group. Groups left without peers are
    /// torn down and dropped once all their routes are withdrawn.
    fn apply_changes(&mut self, adapter: &dyn RouteAdapter, report: &mut ApplyReport) {
        let mut empty: Vec<GroupId> = Vec::new();

        for (gid, group) in &mut self.groups {
            // A failing group must not hold back the others
            if let Err(e) = group.peers.apply(adapter) {
                error!(group = %gid, error = %e, "Apply peers failed");
            }

            let best = group.peers.best_path();
            let (statuses, events) = group.services.apply(best.as_ref(), adapter);
            report.route_status.extend(statuses);
            report.peer_active.extend(events);

            if group.peers.is_empty() {
                let services = group.services.count();
                if services > 0 {
                    warn!(group = %gid, services, "Group has no peers left, forcing deletion of services");
                }
                if group.services.withdraw_all(adapter) {
                    empty.push(*gid);
                } else {
                    warn!(group = %gid, "Service routes left behind, retrying on next apply");
                }
            }
        }

        for gid in empty {
            debug!(group = %gid, "Removing empty group");
            self.groups.remove(&gid);
        }
    }

    /// Re-admit disabled addresses no other group claims anymore.
    ///
    /// Each re-admission is visible to the following checks, so two groups
    /// waiting on the same address cannot both get it.
    fn resolve_conflicts(&mut self) -> usize {
        let mut resolved = 0;
        let gids: Vec<GroupId> = self.groups.keys().copied().collect();

        for gid in gids {
            let (peers, services) = match self.groups.get(&gid) {
                Some(group) => (
                    group.peers.disabled_addresses(),
                    group.services.disabled_addresses(),
                ),
                None => continue,
            };

            for addr in peers {
                if self.has_ip_conflict(&addr, gid) {
                    continue;
                }
                if let Some(group) = self.groups.get_mut(&gid) {
                    if group.peers.enable(&addr) {
                        debug!(address = %addr, group = %gid, "Peer address conflict resolved");
                        resolved += 1;
                    }
                }
            }

            for addr in services {
                if self.has_ip_conflict(&addr, gid) {
                    continue;
                }
                if let Some(group) = self.groups.get_mut(&gid) {
                    if group.services.enable(&addr) {
                        debug!(address = %addr, group = %gid, "Service address conflict resolved");
                        resolved += 1;
                    }
                }
            }
        }

        resolved
    }
}
