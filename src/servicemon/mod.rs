//! Service route monitoring.
//!
//! A [`ServiceRouteMonitor`] keeps, for every destination prefix behind the
//! peers of one group, the list of tunnel links able to reach it. Changes
//! requested by the controller are only recorded on the candidate lists;
//! [`ServiceRouteMonitor::apply`] commits them to the routing table. A
//! candidate leaves memory only once the routing table agrees.

mod route_list;

pub use route_list::{CandidateState, RouteCandidate, RouteList};

use std::collections::BTreeMap;

use ipnet::IpNet;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::events::{PeerActiveData, RouteStatus};
use crate::netcfg::RouteAdapter;
use crate::peermon::SelectedPath;
use crate::types::{GroupId, NetworkPath};

/// Destination routes of one connection group.
#[derive(Debug)]
pub struct ServiceRouteMonitor {
    group_id: GroupId,
    routes: BTreeMap<IpNet, RouteList>,
}

impl ServiceRouteMonitor {
    pub fn new(group_id: GroupId) -> Self {
        Self {
            group_id,
            routes: BTreeMap::new(),
        }
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    /// Number of tracked destinations.
    pub fn count(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn route_list(&self, destination: &IpNet) -> Option<&RouteList> {
        self.routes.get(destination)
    }

    pub fn destinations(&self) -> impl Iterator<Item = &IpNet> {
        self.routes.keys()
    }

    /// Admit `path` as a candidate for `destination`.
    ///
    /// `disabled` only applies when the destination is new; candidates
    /// joining a known destination inherit its flag.
    pub fn add(&mut self, path: &NetworkPath, destination: IpNet, disabled: bool) -> bool {
        let list = self
            .routes
            .entry(destination)
            .or_insert_with(|| RouteList::new(disabled));

        let added = list.add(path);
        if !added {
            debug!(destination = %destination, gateway = %path.gateway, "Skip existing service route");
        }
        added
    }

    /// Schedule the candidate of `path` for removal from `destination`.
    pub fn del(&mut self, path: &NetworkPath, destination: &IpNet) -> Result<()> {
        let list = self
            .routes
            .get_mut(destination)
            .ok_or(Error::UnknownDestination(*destination))?;

        list.mark_del(&path.gateway);
        if list.is_empty() {
            self.routes.remove(destination);
        }
        Ok(())
    }

    /// Check whether this group claims `destination`.
    pub fn has_address(&self, destination: &IpNet) -> bool {
        match self.routes.get(destination) {
            Some(list) if !list.is_disabled() => {
                let (add, del) = list.pending();
                !(add == 0 && del == list.count())
            }
            _ => false,
        }
    }

    /// Destinations rejected at admission.
    pub fn disabled_addresses(&self) -> Vec<IpNet> {
        self.routes
            .iter()
            .filter(|(_, list)| list.is_disabled())
            .map(|(dest, _)| *dest)
            .collect()
    }

    /// Re-admit a disabled destination. Returns whether one was re-admitted.
    pub fn enable(&mut self, destination: &IpNet) -> bool {
        match self.routes.get_mut(destination) {
            Some(list) if list.is_disabled() => {
                list.enable();
                true
            }
            _ => false,
        }
    }

    /// Commit pending changes of every destination.
    ///
    /// `best` is the group's current path selection. Failed destinations
    /// keep their pending state and are retried on the next apply.
    pub fn apply(
        &mut self,
        best: Option<&SelectedPath>,
        adapter: &dyn RouteAdapter,
    ) -> (Vec<RouteStatus>, Vec<PeerActiveData>) {
        let mut statuses = Vec::new();
        let mut events = Vec::new();
        let mut removed = Vec::new();
        let group_id = self.group_id;

        for (dest, list) in &mut self.routes {
            if list.is_disabled() || !list.has_pending() {
                continue;
            }

            let (add, del) = list.pending();
            let count = list.count();
            info!(destination = %dest, add, del, count, group = %group_id, "Applying service route");

            if add == count && del == 0 {
                Self::set_route(group_id, dest, list, adapter, &mut statuses, &mut events);
            } else if del == count && add == 0 {
                if Self::clear_route(group_id, dest, list, adapter, &mut events) {
                    removed.push(*dest);
                }
            } else {
                Self::merge_routes(group_id, dest, list, best, adapter, &mut statuses, &mut events);
            }
        }

        for dest in removed {
            self.routes.remove(&dest);
        }

        (statuses, events)
    }

    /// Install the first route of a destination.
    fn set_route(
        group_id: GroupId,
        dest: &IpNet,
        list: &mut RouteList,
        adapter: &dyn RouteAdapter,
        statuses: &mut Vec<RouteStatus>,
        events: &mut Vec<PeerActiveData>,
    ) {
        let Some(idx) = list.default_candidate() else {
            error!(destination = %dest, "No route candidate found");
            return;
        };
        let route = list.get(idx).clone();

        match adapter.route_conflict(dest) {
            None => {
                let res = adapter.route_add(route.ifname(), None, dest);
                statuses.push(RouteStatus::new(route.connection_id(), group_id, *dest, &res));
                match res {
                    Ok(()) => {
                        info!(destination = %dest, gateway = %route.gateway(), interface = %route.ifname(), "Service route added");
                        list.commit(Some(route.gateway()));
                        events.push(PeerActiveData::new(None, Some(route.connection_id()), group_id));
                    }
                    Err(e) => {
                        error!(destination = %dest, interface = %route.ifname(), error = %e, "Service route add failed");
                    }
                }
            }
            Some(ifname) => {
                // Installed earlier through one of our own links
                if let Some(own) = list.candidates().iter().find(|c| c.ifname() == ifname) {
                    let own = own.clone();
                    debug!(destination = %dest, interface = %ifname, "Adopting existing service route");
                    statuses.push(RouteStatus::new(own.connection_id(), group_id, *dest, &Ok(())));
                    list.commit(Some(own.gateway()));
                    events.push(PeerActiveData::new(None, Some(own.connection_id()), group_id));
                    return;
                }

                let err = Error::ForeignRoute {
                    destination: *dest,
                    ifname,
                };
                warn!(destination = %dest, error = %err, "Service route conflict");
                statuses.push(RouteStatus::new(route.connection_id(), group_id, *dest, &Err(err)));
            }
        }
    }

    /// Withdraw a destination. Returns whether the entry can be dropped.
    fn clear_route(
        group_id: GroupId,
        dest: &IpNet,
        list: &RouteList,
        adapter: &dyn RouteAdapter,
        events: &mut Vec<PeerActiveData>,
    ) -> bool {
        let Some(route) = list.active_candidate() else {
            return true;
        };

        match adapter.route_del(route.ifname(), dest) {
            Ok(()) => {
                info!(destination = %dest, interface = %route.ifname(), "Service route removed");
                events.push(PeerActiveData::new(Some(route.connection_id()), None, group_id));
                true
            }
            Err(e) => {
                error!(destination = %dest, interface = %route.ifname(), error = %e, "Service route delete failed");
                false
            }
        }
    }

    /// Reconfigure a destination with both additions and removals pending.
    fn merge_routes(
        group_id: GroupId,
        dest: &IpNet,
        list: &mut RouteList,
        best: Option<&SelectedPath>,
        adapter: &dyn RouteAdapter,
        statuses: &mut Vec<RouteStatus>,
        events: &mut Vec<PeerActiveData>,
    ) {
        let old = list.active();
        let surviving = |idx: &usize| !list.get(*idx).is_pending_del();

        let new = best
            .and_then(|b| list.find(&b.gateway))
            .filter(surviving)
            .or_else(|| old.filter(surviving))
            .or_else(|| list.default_candidate());

        match Self::switch(group_id, dest, list, old, new, adapter) {
            Ok(event) => {
                if let Some(idx) = new.or(old) {
                    let route = list.get(idx);
                    if event.is_some() {
                        statuses.push(RouteStatus::new(route.connection_id(), group_id, *dest, &Ok(())));
                    }
                }
                let gateway = new.map(|idx| list.get(idx).gateway());
                list.commit(gateway);
                events.extend(event);
            }
            Err(e) => {
                if let Some(idx) = new.or(old) {
                    let route = list.get(idx);
                    statuses.push(RouteStatus::new(route.connection_id(), group_id, *dest, &Err(e)));
                }
            }
        }
    }

    /// Move `dest` from candidate `old` to candidate `new` in the routing table.
    ///
    /// Flags are left to the caller and only change once this succeeds.
    fn switch(
        group_id: GroupId,
        dest: &IpNet,
        list: &RouteList,
        old: Option<usize>,
        new: Option<usize>,
        adapter: &dyn RouteAdapter,
    ) -> Result<Option<PeerActiveData>> {
        let (result, event) = match (old.map(|i| list.get(i)), new.map(|i| list.get(i))) {
            _ if old == new => return Ok(None),
            (Some(old), None) => {
                info!(destination = %dest, interface = %old.ifname(), "Remove route");
                (
                    adapter.route_del(old.ifname(), dest),
                    PeerActiveData::new(Some(old.connection_id()), None, group_id),
                )
            }
            (None, Some(new)) => {
                info!(destination = %dest, interface = %new.ifname(), "Add route");
                (
                    adapter.route_add(new.ifname(), None, dest),
                    PeerActiveData::new(None, Some(new.connection_id()), group_id),
                )
            }
            (Some(old), Some(new)) => {
                info!(destination = %dest, from = %old.ifname(), to = %new.ifname(), "Replace route");
                (
                    adapter.route_replace(new.ifname(), None, dest),
                    PeerActiveData::new(Some(old.connection_id()), Some(new.connection_id()), group_id),
                )
            }
            (None, None) => return Ok(None),
        };

        if let Err(e) = result {
            error!(destination = %dest, error = %e, "Could not change route");
            return Err(e);
        }
        Ok(Some(event))
    }

    /// Move committed destinations onto the newly selected path.
    ///
    /// Destinations with pending work are left to the next apply, and
    /// those not reachable through `best` keep their route.
    pub fn reroute(
        &mut self,
        best: Option<&SelectedPath>,
        adapter: &dyn RouteAdapter,
    ) -> Vec<PeerActiveData> {
        let Some(best) = best else {
            return Vec::new();
        };

        let mut events = Vec::new();
        for (dest, list) in &mut self.routes {
            if list.is_disabled() || list.has_pending() {
                continue;
            }
            let Some(new) = list.find(&best.gateway) else {
                debug!(destination = %dest, gateway = %best.gateway, "Selected gateway does not serve destination");
                continue;
            };

            let old = list.active();
            if let Ok(Some(event)) = Self::switch(self.group_id, dest, list, old, Some(new), adapter) {
                list.commit(Some(best.gateway));
                events.push(event);
            }
        }
        events
    }

    /// Withdraw every installed route.
    ///
    /// Destinations whose route could not be removed stay tracked. Returns
    /// whether nothing is left.
    pub fn withdraw_all(&mut self, adapter: &dyn RouteAdapter) -> bool {
        self.routes.retain(|dest, list| {
            // Disabled destinations were never installed
            if list.is_disabled() {
                return false;
            }
            let Some(route) = list.active_candidate() else {
                return false;
            };
            match adapter.route_del(route.ifname(), dest) {
                Ok(()) => {
                    info!(destination = %dest, interface = %route.ifname(), "Service route removed");
                    false
                }
                Err(e) => {
                    error!(destination = %dest, interface = %route.ifname(), error = %e, "Service route cleanup failed");
                    true
                }
            }
        });
        self.routes.is_empty()
    }

    /// Withdraw every installed route and forget all destinations.
    pub fn close(&mut self, adapter: &dyn RouteAdapter) {
        if !self.withdraw_all(adapter) {
            warn!(group = %self.group_id, remaining = self.routes.len(), "Leaving service routes behind");
        }
        self.routes.clear();
    }

    /// Forget all destinations without touching the routing table.
    pub fn flush(&mut self) {
        for (dest, list) in &self.routes {
            if list.is_disabled() {
                debug!(destination = %dest, "Flushing previously conflicting address");
            } else {
                debug!(destination = %dest, "Flushing");
            }
        }
        self.routes.clear();
    }
}
