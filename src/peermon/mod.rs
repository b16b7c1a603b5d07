//! Peer path monitoring and best gateway selection.
//!
//! One [`PeerPathMonitor`] exists per connection group. It owns the
//! candidate gateways of the group, commits their host routes, feeds probe
//! results into each node's rolling window and picks the gateway that
//! should carry the group's service traffic.
//!
//! Selection ranks nodes by mean loss, then mean latency. The incumbent is
//! only replaced when:
//! - the challenger has strictly lower loss, or
//! - both windows are complete and the challenger's latency beats the
//!   incumbent's by the configured [`Thresholds`] (both the absolute and the
//!   ratio margin).

mod node;

pub use node::{NodeState, PeerNode};

use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::Result;
use crate::metrics::PathMetricStore;
use crate::netcfg::RouteAdapter;
use crate::types::{ConnectionId, GroupId, NetworkPath};

/// Default rolling window length (probe rounds).
pub const DEFAULT_WINDOW_SIZE: usize = 24;

/// Reroute hysteresis margins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Absolute latency margin (ms).
    pub diff: f32,
    /// Relative latency margin.
    pub ratio: f32,
}

impl Thresholds {
    pub const NONE: Self = Self { diff: 0.0, ratio: 0.0 };

    pub fn new(diff: f32, ratio: f32) -> Self {
        Self { diff, ratio }
    }

    /// A ratio of 1 or below with no absolute margin imposes nothing.
    pub fn is_enabled(&self) -> bool {
        self.diff > 0.0 || self.ratio > 1.0
    }

    /// Check whether `challenger` beats `incumbent` by both margins.
    fn beaten_by(&self, incumbent: f32, challenger: f32) -> bool {
        challenger + self.diff <= incumbent && challenger * self.ratio <= incumbent
    }
}

/// Result of a best path computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedPath {
    pub ifname: String,
    pub gateway: IpAddr,
    pub connection_id: ConnectionId,
    pub group_id: GroupId,
}

/// Candidate gateways of one connection group.
#[derive(Debug)]
pub struct PeerPathMonitor {
    group_id: GroupId,
    window_size: usize,
    thresholds: Thresholds,
    nodes: Vec<PeerNode>,
    last_best: Option<IpAddr>,
}

impl PeerPathMonitor {
    pub fn new(group_id: GroupId, window_size: usize, thresholds: Thresholds) -> Self {
        Self {
            group_id,
            window_size,
            thresholds,
            nodes: Vec::new(),
            last_best: None,
        }
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Replace the reroute thresholds.
    pub fn set_thresholds(&mut self, thresholds: Thresholds) {
        self.thresholds = thresholds;
    }

    /// Number of tracked nodes, in any state.
    pub fn count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &PeerNode> {
        self.nodes.iter()
    }

    pub fn node(&self, gateway: &IpAddr) -> Option<&PeerNode> {
        self.nodes.iter().find(|n| n.gateway() == *gateway)
    }

    /// Admit a node. Adding a gateway that is already tracked does nothing.
    ///
    /// Returns whether a node was added.
    pub fn add_node(&mut self, path: &NetworkPath, disabled: bool) -> bool {
        if self.node(&path.gateway).is_some() {
            debug!(gateway = %path.gateway, group = %self.group_id, "Skip existing peer node");
            return false;
        }

        let state = if disabled {
            NodeState::Disabled
        } else {
            NodeState::PendingAdd
        };
        self.nodes.push(PeerNode::new(path, self.window_size, state));
        true
    }

    /// Schedule a node for removal.
    ///
    /// Nodes without an installed host route are dropped right away.
    /// Returns whether the gateway was known.
    pub fn del_node(&mut self, gateway: &IpAddr) -> bool {
        let Some(pos) = self.nodes.iter().position(|n| n.gateway() == *gateway) else {
            return false;
        };

        match self.nodes[pos].state {
            NodeState::Active => self.nodes[pos].state = NodeState::PendingDel,
            NodeState::PendingAdd | NodeState::Disabled => {
                self.nodes.remove(pos);
            }
            NodeState::PendingDel => {}
        }
        true
    }

    /// Check whether this group claims `addr` as a peer address.
    pub fn has_node(&self, addr: &IpNet) -> bool {
        self.nodes
            .iter()
            .any(|n| n.claims_address() && n.host_prefix() == *addr)
    }

    /// Host prefixes of nodes rejected at admission.
    pub fn disabled_addresses(&self) -> Vec<IpNet> {
        self.nodes
            .iter()
            .filter(|n| n.state == NodeState::Disabled)
            .map(PeerNode::host_prefix)
            .collect()
    }

    /// Re-admit a disabled node. Returns whether one was re-admitted.
    pub fn enable(&mut self, addr: &IpNet) -> bool {
        match self
            .nodes
            .iter_mut()
            .find(|n| n.state == NodeState::Disabled && n.host_prefix() == *addr)
        {
            Some(node) => {
                node.state = NodeState::PendingAdd;
                true
            }
            None => false,
        }
    }

    /// Feed one round of probe results into the active nodes.
    pub fn ping_process(&mut self, store: &PathMetricStore) {
        for node in self.nodes.iter_mut().filter(|n| n.state == NodeState::Active) {
            // Not every round covers every node
            let Some(sample) = store.get(&node.gateway()) else {
                continue;
            };
            if !sample.is_valid() {
                continue;
            }
            node.push(sample.latency(), sample.loss());
        }
    }

    /// Pick the gateway that should carry traffic now.
    pub fn best_path(&mut self) -> Option<SelectedPath> {
        let Some(candidate) = self.top_ranked() else {
            self.last_best = None;
            return None;
        };

        let current = self.last_best.and_then(|gw| {
            self.nodes
                .iter()
                .position(|n| n.gateway() == gw && Self::is_eligible(n))
        });

        let chosen = match current {
            Some(cur) if cur != candidate && !self.should_switch(cur, candidate) => cur,
            _ => candidate,
        };

        let node = &self.nodes[chosen];
        if self.last_best != Some(node.gateway()) {
            debug!(group = %self.group_id, best = %node, "Best path changed");
        }
        self.last_best = Some(node.gateway());

        Some(SelectedPath {
            ifname: node.ifname().to_string(),
            gateway: node.gateway(),
            connection_id: node.connection_id(),
            group_id: self.group_id,
        })
    }

    fn is_eligible(node: &PeerNode) -> bool {
        node.state == NodeState::Active && node.has_samples()
    }

    fn top_ranked(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (idx, node) in self.nodes.iter().enumerate() {
            if !Self::is_eligible(node) {
                continue;
            }
            match best {
                None => best = Some(idx),
                Some(b) => {
                    let other = &self.nodes[b];
                    let (loss, other_loss) = (node.loss(), other.loss());
                    if loss < other_loss || (loss == other_loss && node.latency() < other.latency())
                    {
                        best = Some(idx);
                    }
                }
            }
        }
        best
    }

    fn should_switch(&self, current: usize, candidate: usize) -> bool {
        let cur = &self.nodes[current];
        let cand = &self.nodes[candidate];

        // Lower loss wins even over an incomplete incumbent: a link that
        // stopped answering only ever fills its window with lost rounds.
        if cand.loss() < cur.loss() {
            return true;
        }
        if cur.stats_incomplete() || cand.stats_incomplete() {
            return false;
        }
        if !self.thresholds.is_enabled() {
            return true;
        }
        self.thresholds.beaten_by(cur.latency(), cand.latency())
    }

    /// Commit pending host routes.
    ///
    /// Every node is processed; the last failure is returned. Failed nodes
    /// keep their pending state for the next apply.
    pub fn apply(&mut self, adapter: &dyn RouteAdapter) -> Result<()> {
        let mut last_err = None;
        let mut removed = Vec::new();

        for node in &mut self.nodes {
            let dest = node.host_prefix();
            match node.state {
                NodeState::PendingAdd => match adapter.route_add(node.ifname(), None, &dest) {
                    Ok(()) => {
                        info!(destination = %dest, interface = %node.ifname(), group = %self.group_id, "Peer route added");
                        node.state = NodeState::Active;
                    }
                    Err(e) => {
                        error!(destination = %dest, interface = %node.ifname(), error = %e, "Peer route add failed");
                        last_err = Some(e);
                    }
                },
                NodeState::PendingDel => match adapter.route_del(node.ifname(), &dest) {
                    Ok(()) => {
                        info!(destination = %dest, interface = %node.ifname(), group = %self.group_id, "Peer route removed");
                        removed.push(node.gateway());
                    }
                    Err(e) => {
                        error!(destination = %dest, interface = %node.ifname(), error = %e, "Peer route delete failed");
                        last_err = Some(e);
                    }
                },
                NodeState::Active | NodeState::Disabled => {}
            }
        }

        if !removed.is_empty() {
            self.nodes.retain(|n| !removed.contains(&n.gateway()));
        }

        last_err.map_or(Ok(()), Err)
    }

    /// Withdraw every installed host route and forget all nodes.
    pub fn close(&mut self, adapter: &dyn RouteAdapter) {
        for node in &self.nodes {
            if matches!(node.state, NodeState::Active | NodeState::PendingDel) {
                if let Err(e) = adapter.route_del(node.ifname(), &node.host_prefix()) {
                    error!(gateway = %node.gateway(), error = %e, "Peer route cleanup failed");
                }
            }
        }
        self.flush();
    }

    /// Forget all nodes without touching the routing table.
    pub fn flush(&mut self) {
        self.nodes.clear();
        self.last_best = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::PathSample;
    use crate::netcfg::MemoryRouteTable;

    const WINDOW: usize = 24;

    fn path(gw: &str, conn: u32) -> NetworkPath {
        NetworkPath::new(
            "ifname",
            "PublicKey",
            gw.parse().unwrap(),
            ConnectionId(conn),
            GroupId(1),
        )
    }

    fn monitor() -> PeerPathMonitor {
        let mut pm = PeerPathMonitor::new(GroupId(1), WINDOW, Thresholds::NONE);
        for (i, gw) in ["1.1.1.1", "2.2.2.1", "3.3.3.1", "4.4.4.1"].iter().enumerate() {
            assert!(pm.add_node(&path(gw, i as u32 + 1), false));
        }
        pm.apply(&MemoryRouteTable::new()).unwrap();
        pm
    }

    fn fill_stats(pm: &mut PeerPathMonitor, gw: &str, latency: f32, loss: f32) {
        let gw: IpAddr = gw.parse().unwrap();
        let node = pm.nodes.iter_mut().find(|n| n.gateway() == gw).unwrap();
        for _ in 0..WINDOW {
            node.push(latency, loss);
        }
    }

    fn best(pm: &mut PeerPathMonitor) -> String {
        pm.best_path().map(|p| p.gateway.to_string()).unwrap_or_default()
    }

    fn from(pm: &mut PeerPathMonitor, gw: &str) -> String {
        pm.last_best = Some(gw.parse().unwrap());
        best(pm)
    }

    #[test]
    fn test_lowest_loss_wins() {
        let mut pm = monitor();
        fill_stats(&mut pm, "1.1.1.1", 100.0, 0.02);
        fill_stats(&mut pm, "2.2.2.1", 145.0, 0.11);
        fill_stats(&mut pm, "3.3.3.1", 500.0, 0.0);
        fill_stats(&mut pm, "4.4.4.1", 105.0, 0.3);

        assert_eq!(from(&mut pm, "1.1.1.1"), "3.3.3.1");
    }

    #[test]
    fn test_lowest_latency_without_thresholds() {
        let mut pm = monitor();
        pm.set_thresholds(Thresholds::new(0.0, 1.0));
        fill_stats(&mut pm, "1.1.1.1", 100.0, 0.0);
        fill_stats(&mut pm, "2.2.2.1", 145.0, 0.0);
        fill_stats(&mut pm, "3.3.3.1", 250.0, 0.0);
        fill_stats(&mut pm, "4.4.4.1", 95.0, 0.0);

        assert_eq!(from(&mut pm, "1.1.1.1"), "4.4.4.1");
    }

    #[test]
    fn test_thresholds() {
        let mut pm = monitor();
        fill_stats(&mut pm, "1.1.1.1", 100.0, 0.0);
        fill_stats(&mut pm, "2.2.2.1", 145.0, 0.0);
        fill_stats(&mut pm, "3.3.3.1", 250.0, 0.0);
        fill_stats(&mut pm, "4.4.4.1", 95.0, 0.0);

        pm.set_thresholds(Thresholds::new(10.0, 1.05));
        assert_eq!(from(&mut pm, "1.1.1.1"), "1.1.1.1");

        pm.set_thresholds(Thresholds::new(5.0, 1.05));
        assert_eq!(from(&mut pm, "1.1.1.1"), "4.4.4.1");

        // incomplete challenger statistics keep the incumbent
        let gw: IpAddr = "4.4.4.1".parse().unwrap();
        pm.nodes.iter_mut().find(|n| n.gateway() == gw).unwrap().push(0.0, 0.0);
        assert_eq!(from(&mut pm, "1.1.1.1"), "1.1.1.1");
    }

    #[test]
    fn test_incomplete_incumbent_is_kept() {
        let mut pm = monitor();
        fill_stats(&mut pm, "2.2.2.1", 20.0, 0.0);
        let gw: IpAddr = "1.1.1.1".parse().unwrap();
        pm.nodes.iter_mut().find(|n| n.gateway() == gw).unwrap().push(300.0, 0.0);

        assert_eq!(from(&mut pm, "1.1.1.1"), "1.1.1.1");
    }

    #[test]
    fn test_lossy_incumbent_is_left() {
        let mut pm = monitor();
        fill_stats(&mut pm, "1.1.1.1", 20.0, 0.0);
        fill_stats(&mut pm, "2.2.2.1", 80.0, 0.0);
        pm.set_thresholds(Thresholds::new(100.0, 10.0));

        // a lost round leaves the incumbent window incomplete and lossy
        let gw: IpAddr = "1.1.1.1".parse().unwrap();
        pm.nodes.iter_mut().find(|n| n.gateway() == gw).unwrap().push(0.0, 1.0);

        assert_eq!(from(&mut pm, "1.1.1.1"), "2.2.2.1");
    }

    #[test]
    fn test_first_selection_is_unconditional() {
        let mut pm = monitor();
        pm.set_thresholds(Thresholds::new(50.0, 2.0));
        fill_stats(&mut pm, "3.3.3.1", 80.0, 0.0);
        fill_stats(&mut pm, "2.2.2.1", 90.0, 0.0);

        let sel = pm.best_path().unwrap();
        assert_eq!(sel.gateway.to_string(), "3.3.3.1");
        assert_eq!(sel.connection_id, ConnectionId(3));
        assert_eq!(sel.group_id, GroupId(1));

        // stays selected on later calls
        assert_eq!(best(&mut pm), "3.3.3.1");
    }

    #[test]
    fn test_no_samples_no_selection() {
        let mut pm = monitor();
        assert!(pm.best_path().is_none());
    }

    #[test]
    fn test_duplicate_add_is_noop() {
        let mut pm = monitor();
        assert!(!pm.add_node(&path("1.1.1.1", 9), false));
        assert_eq!(pm.count(), 4);
    }

    #[test]
    fn test_ping_process_skips_ineligible() {
        let mut pm = PeerPathMonitor::new(GroupId(1), 4, Thresholds::NONE);
        pm.add_node(&path("10.0.0.1", 1), false);
        pm.apply(&MemoryRouteTable::new()).unwrap();
        pm.add_node(&path("10.0.0.2", 2), false);
        pm.add_node(&path("10.0.0.3", 3), true);

        let mut store = PathMetricStore::new();
        for gw in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            store.insert(gw.parse().unwrap(), PathSample::from_parts(2, 2, 10.0, 10.0));
        }
        store.add("10.0.0.9".parse().unwrap());
        pm.ping_process(&store);

        let sampled: Vec<_> = pm.nodes().filter(|n| n.has_samples()).map(PeerNode::gateway).collect();
        assert_eq!(sampled, vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_apply_lifecycle() {
        let table = MemoryRouteTable::new();
        let mut pm = PeerPathMonitor::new(GroupId(1), 4, Thresholds::NONE);
        pm.add_node(&path("10.0.0.1", 1), false);
        pm.add_node(&path("10.0.0.2", 2), true);

        pm.apply(&table).unwrap();
        let host: IpNet = "10.0.0.1/32".parse().unwrap();
        assert_eq!(table.route_via(&host).as_deref(), Some("ifname"));
        assert!(!table.route_exists(&"10.0.0.2/32".parse().unwrap()));
        assert!(pm.has_node(&host));
        assert!(!pm.has_node(&"10.0.0.2/32".parse().unwrap()));

        // failed delete keeps the node until the OS agrees
        table.fail_on(host);
        assert!(pm.del_node(&"10.0.0.1".parse().unwrap()));
        assert!(pm.apply(&table).is_err());
        assert_eq!(pm.node(&"10.0.0.1".parse().unwrap()).unwrap().state(), NodeState::PendingDel);
        assert!(!pm.has_node(&host));

        table.clear_failures();
        pm.apply(&table).unwrap();
        assert!(pm.node(&"10.0.0.1".parse().unwrap()).is_none());
        assert!(!table.route_exists(&host));

        // disabled nodes go away without touching the table
        table.clear_ops();
        assert!(pm.del_node(&"10.0.0.2".parse().unwrap()));
        assert!(pm.is_empty());
        assert!(table.ops().is_empty());
    }

    #[test]
    fn test_enable_disabled() {
        let mut pm = PeerPathMonitor::new(GroupId(1), 4, Thresholds::NONE);
        pm.add_node(&path("10.0.0.2", 2), true);
        let host: IpNet = "10.0.0.2/32".parse().unwrap();

        assert_eq!(pm.disabled_addresses(), vec![host]);
        assert!(pm.enable(&host));
        assert!(!pm.enable(&host));
        assert!(pm.has_node(&host));
        assert!(pm.disabled_addresses().is_empty());
    }
}
