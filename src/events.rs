//! Status notifications produced for the controller.

use std::time::SystemTime;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::metrics::PathQuality;
use crate::types::{ConnectionId, GroupId};

/// Outcome of committing one destination route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteStatus {
    pub connection_id: ConnectionId,
    pub group_id: GroupId,
    pub destination: IpNet,
    pub error: Option<String>,
}

impl RouteStatus {
    pub fn new(
        connection_id: ConnectionId,
        group_id: GroupId,
        destination: IpNet,
        result: &crate::Result<()>,
    ) -> Self {
        Self {
            connection_id,
            group_id,
            destination,
            error: result.as_ref().err().map(ToString::to_string),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Change of the connection carrying traffic for a group.
///
/// `previous: None` means a route was attached where none existed,
/// `current: None` means the route was detached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerActiveData {
    pub previous: Option<ConnectionId>,
    pub current: Option<ConnectionId>,
    pub group_id: GroupId,
    pub timestamp: SystemTime,
}

impl PeerActiveData {
    pub fn new(
        previous: Option<ConnectionId>,
        current: Option<ConnectionId>,
        group_id: GroupId,
    ) -> Self {
        Self {
            previous,
            current,
            group_id,
            timestamp: SystemTime::now(),
        }
    }

    pub fn is_attach(&self) -> bool {
        self.previous.is_none() && self.current.is_some()
    }

    pub fn is_detach(&self) -> bool {
        self.previous.is_some() && self.current.is_none()
    }
}

/// Event delivered to a [`StatusSink`].
#[derive(Debug, Clone)]
pub enum StatusEvent {
    /// Route commit results of one apply.
    RouteStatus(Vec<RouteStatus>),
    /// Active connection changes.
    PeerActiveData(Vec<PeerActiveData>),
    /// Path quality of one probe round.
    PeerQuality(Vec<PathQuality>),
}

/// Receiver of status events. Wire format is up to the implementation.
pub trait StatusSink: Send + Sync {
    fn emit(&self, event: StatusEvent);
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl StatusSink for NullSink {
    fn emit(&self, _event: StatusEvent) {}
}

/// Fans events out to any number of subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    event_tx: broadcast::Sender<StatusEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity);
        Self { event_tx }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.event_tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl StatusSink for BroadcastSink {
    fn emit(&self, event: StatusEvent) {
        // No subscribers is not an error
        let _ = self.event_tx.send(event);
    }
}
