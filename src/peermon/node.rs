//! Rolling link statistics of one candidate gateway.

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;

use crate::types::{ConnectionId, NetworkPath};

/// Lifecycle of a peer node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Admitted, host route not installed yet.
    PendingAdd,
    /// Host route installed; probed and eligible for selection.
    Active,
    /// Host route installed and scheduled for removal.
    PendingDel,
    /// Address claimed by another group; tracked but never installed.
    Disabled,
}

/// A candidate gateway with a fixed-size window of latency and loss samples.
#[derive(Debug, Clone)]
pub struct PeerNode {
    ifname: String,
    public_key: String,
    gateway: IpAddr,
    connection_id: ConnectionId,
    pub(crate) state: NodeState,
    latency: Vec<f32>,
    loss: Vec<f32>,
    index: usize,
    recorded: usize,
}

impl PeerNode {
    pub(crate) fn new(path: &NetworkPath, window_size: usize, state: NodeState) -> Self {
        let window_size = window_size.max(1);
        Self {
            ifname: path.ifname.clone(),
            public_key: path.public_key.clone(),
            gateway: path.gateway,
            connection_id: path.connection_id,
            state,
            latency: vec![0.0; window_size],
            loss: vec![0.0; window_size],
            index: 0,
            recorded: 0,
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

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Host prefix routed to this peer.
    pub fn host_prefix(&self) -> IpNet {
        IpNet::from(self.gateway)
    }

    /// Window length.
    pub fn window_size(&self) -> usize {
        self.latency.len()
    }

    /// Record one measurement, overwriting the oldest slot.
    pub fn push(&mut self, latency: f32, loss: f32) {
        self.latency[self.index] = latency;
        self.loss[self.index] = loss;
        self.index = (self.index + 1) % self.latency.len();
        self.recorded = self.recorded.saturating_add(1);
    }

    /// Mean latency over the slots holding a measured value.
    pub fn latency(&self) -> f32 {
        let (sum, count) = self
            .latency
            .iter()
            .filter(|v| **v > 0.0)
            .fold((0.0f32, 0usize), |(sum, count), v| (sum + v, count + 1));

        if count > 0 {
            sum / count as f32
        } else {
            0.0
        }
    }

    /// Mean loss over the whole window; empty slots count as lossless.
    pub fn loss(&self) -> f32 {
        self.loss.iter().sum::<f32>() / self.loss.len() as f32
    }

    /// True until every slot holds a non-zero latency.
    pub fn stats_incomplete(&self) -> bool {
        self.latency.iter().filter(|v| **v > 0.0).count() != self.latency.len()
    }

    /// True once at least one measurement was recorded.
    pub fn has_samples(&self) -> bool {
        self.recorded > 0
    }

    /// Counts as a claim on its address for conflict detection.
    pub(crate) fn claims_address(&self) -> bool {
        matches!(self.state, NodeState::PendingAdd | NodeState::Active)
    }
}

impl fmt::Display for PeerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} via {} loss: {:.3} latency: {:.1}",
            self.gateway,
            self.ifname,
            self.loss(),
            self.latency()
        )
    }
}
