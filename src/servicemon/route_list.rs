//! Candidate routes of one destination.

use std::fmt;
use std::net::IpAddr;

use crate::types::{ConnectionId, GroupId, NetworkPath};

/// Lifecycle of a route candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateState {
    /// Admitted, not committed yet.
    PendingAdd,
    /// Committed, not carrying traffic.
    Standby,
    /// Installed in the routing table.
    Active,
    /// Scheduled for removal; `active` tells whether it is still installed.
    PendingDel { active: bool },
    /// Destination claimed by another group; never installed.
    Disabled,
}

/// One possible route to a destination.
#[derive(Debug, Clone)]
pub struct RouteCandidate {
    ifname: String,
    public_key: String,
    gateway: IpAddr,
    connection_id: ConnectionId,
    group_id: GroupId,
    pub(crate) state: CandidateState,
}

impl RouteCandidate {
    pub(crate) fn new(path: &NetworkPath, state: CandidateState) -> Self {
        Self {
            ifname: path.ifname.clone(),
            public_key: path.public_key.clone(),
            gateway: path.gateway,
            connection_id: path.connection_id,
            group_id: path.group_id,
            state,
        }
    }

    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn gateway(&self) -> IpAddr {
        self.gateway
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn state(&self) -> CandidateState {
        self.state
    }

    /// Installed in the routing table, possibly pending removal.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            CandidateState::Active | CandidateState::PendingDel { active: true }
        )
    }

    pub fn is_pending_del(&self) -> bool {
        matches!(self.state, CandidateState::PendingDel { .. })
    }
}

impl fmt::Display for RouteCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} via {} [conn:{}] {:?}",
            self.gateway, self.ifname, self.connection_id, self.state
        )
    }
}

/// Candidates competing for one destination. Gateways are unique.
#[derive(Debug, Clone, Default)]
pub struct RouteList {
    candidates: Vec<RouteCandidate>,
    disabled: bool,
}

impl RouteList {
    pub(crate) fn new(disabled: bool) -> Self {
        Self {
            candidates: Vec::new(),
            disabled,
        }
    }

    pub fn count(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn candidates(&self) -> &[RouteCandidate] {
        &self.candidates
    }

    /// Number of candidates pending add and pending delete.
    pub fn pending(&self) -> (usize, usize) {
        self.candidates
            .iter()
            .fold((0, 0), |(add, del), c| match c.state {
                CandidateState::PendingAdd => (add + 1, del),
                CandidateState::PendingDel { .. } => (add, del + 1),
                _ => (add, del),
            })
    }

    pub fn has_pending(&self) -> bool {
        self.pending() != (0, 0)
    }

    /// Append a candidate. A gateway that is already listed is skipped:
    /// controllers resend their whole configuration after a reconnect.
    pub(crate) fn add(&mut self, path: &NetworkPath) -> bool {
        if self.find(&path.gateway).is_some() {
            return false;
        }

        let state = if self.disabled {
            CandidateState::Disabled
        } else {
            CandidateState::PendingAdd
        };
        self.candidates.push(RouteCandidate::new(path, state));
        true
    }

    /// Schedule the candidate with `gateway` for removal.
    ///
    /// Disabled candidates were never installed and are dropped at once.
    pub(crate) fn mark_del(&mut self, gateway: &IpAddr) -> bool {
        let Some(idx) = self.find(gateway) else {
            return false;
        };

        match self.candidates[idx].state {
            CandidateState::Disabled => {
                self.candidates.remove(idx);
            }
            CandidateState::PendingDel { .. } => {}
            CandidateState::Active => {
                self.candidates[idx].state = CandidateState::PendingDel { active: true };
            }
            CandidateState::PendingAdd | CandidateState::Standby => {
                self.candidates[idx].state = CandidateState::PendingDel { active: false };
            }
        }
        true
    }

    pub fn find(&self, gateway: &IpAddr) -> Option<usize> {
        self.candidates.iter().position(|c| c.gateway == *gateway)
    }

    /// The installed candidate.
    pub fn active(&self) -> Option<usize> {
        self.candidates.iter().position(RouteCandidate::is_active)
    }

    pub fn active_candidate(&self) -> Option<&RouteCandidate> {
        self.active().map(|idx| &self.candidates[idx])
    }

    /// Candidate to install when nothing is selected yet: the active one
    /// unless it is being removed, else the first one staying in the list.
    pub fn default_candidate(&self) -> Option<usize> {
        self.active()
            .filter(|idx| !self.candidates[*idx].is_pending_del())
            .or_else(|| self.candidates.iter().position(|c| !c.is_pending_del()))
    }

    pub(crate) fn get(&self, idx: usize) -> &RouteCandidate {
        &self.candidates[idx]
    }

    /// Lift the conflict flag so candidates go through a normal add.
    pub(crate) fn enable(&mut self) {
        self.disabled = false;
        for c in &mut self.candidates {
            if c.state == CandidateState::Disabled {
                c.state = CandidateState::PendingAdd;
            }
        }
    }

    /// Settle the list after a successful commit: drop candidates pending
    /// removal and make `active` the only installed one.
    pub(crate) fn commit(&mut self, active: Option<IpAddr>) {
        self.candidates.retain(|c| !c.is_pending_del());
        for c in &mut self.candidates {
            c.state = if Some(c.gateway) == active {
                CandidateState::Active
            } else {
                CandidateState::Standby
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(gw: &str, conn: u32) -> NetworkPath {
        NetworkPath::new(
            format!("wg{conn}"),
            "key",
            gw.parse().unwrap(),
            ConnectionId(conn),
            GroupId(1),
        )
    }

    #[test]
    fn test_duplicate_add() {
        let mut rl = RouteList::new(false);
        assert!(rl.add(&path("10.0.0.1", 1)));
        assert!(rl.add(&path("10.0.0.2", 2)));
        assert!(!rl.add(&path("10.0.0.1", 7)));
        assert_eq!(rl.count(), 2);
        assert_eq!(rl.pending(), (2, 0));
    }

    #[test]
    fn test_default_candidate() {
        let mut rl = RouteList::new(false);
        rl.add(&path("10.0.0.1", 1));
        rl.add(&path("10.0.0.2", 2));
        assert_eq!(rl.default_candidate(), Some(0));

        rl.mark_del(&"10.0.0.1".parse().unwrap());
        assert_eq!(rl.default_candidate(), Some(1));

        rl.commit(Some("10.0.0.2".parse().unwrap()));
        assert_eq!(rl.count(), 1);
        assert_eq!(rl.active(), Some(0));
        assert_eq!(rl.default_candidate(), Some(0));

        // an active candidate on its way out is not a default
        rl.add(&path("10.0.0.3", 3));
        rl.mark_del(&"10.0.0.2".parse().unwrap());
        assert_eq!(rl.active(), Some(0));
        assert_eq!(rl.default_candidate(), Some(1));
    }

    #[test]
    fn test_mark_del_keeps_active_flag() {
        let mut rl = RouteList::new(false);
        rl.add(&path("10.0.0.1", 1));
        rl.commit(Some("10.0.0.1".parse().unwrap()));

        assert!(rl.mark_del(&"10.0.0.1".parse().unwrap()));
        assert_eq!(rl.get(0).state(), CandidateState::PendingDel { active: true });
        assert_eq!(rl.active(), Some(0));
        assert_eq!(rl.pending(), (0, 1));
        assert!(!rl.mark_del(&"10.0.0.9".parse().unwrap()));
    }

    #[test]
    fn test_disabled_list() {
        let mut rl = RouteList::new(true);
        rl.add(&path("10.0.0.1", 1));
        rl.add(&path("10.0.0.2", 2));
        assert_eq!(rl.pending(), (0, 0));
        assert_eq!(rl.get(0).state(), CandidateState::Disabled);

        rl.mark_del(&"10.0.0.2".parse().unwrap());
        assert_eq!(rl.count(), 1);

        rl.enable();
        assert!(!rl.is_disabled());
        assert_eq!(rl.pending(), (1, 0));
    }
}
