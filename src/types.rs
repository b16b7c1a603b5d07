//! Core types used throughout sdnroute.

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Identifier of a connection group (one consistency domain for address claims).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for GroupId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Controller-assigned identifier of one tunnel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ConnectionId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// One tunnel link to a remote peer, as described by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPath {
    /// Tunnel interface name (e.g. "wg0").
    pub ifname: String,
    /// Remote peer public key.
    pub public_key: String,
    /// Peer tunnel address, used as gateway for everything behind the peer.
    pub gateway: IpAddr,
    /// Connection this path belongs to.
    pub connection_id: ConnectionId,
    /// Connection group this path belongs to.
    pub group_id: GroupId,
}

impl NetworkPath {
    pub fn new(
        ifname: impl Into<String>,
        public_key: impl Into<String>,
        gateway: IpAddr,
        connection_id: ConnectionId,
        group_id: GroupId,
    ) -> Self {
        Self {
            ifname: ifname.into(),
            public_key: public_key.into(),
            gateway,
            connection_id,
            group_id,
        }
    }

    /// Host prefix of the gateway (`/32` or `/128`).
    pub fn host_prefix(&self) -> IpNet {
        IpNet::from(self.gateway)
    }
}

impl fmt::Display for NetworkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} via {} [conn:{} group:{}]",
            self.gateway, self.ifname, self.connection_id, self.group_id
        )
    }
}

/// Admission outcome for one destination of a route add/delete request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteResult {
    pub destination: IpNet,
    pub error: Option<String>,
}

impl RouteResult {
    pub fn ok(destination: IpNet) -> Self {
        Self { destination, error: None }
    }

    pub fn failed(destination: IpNet, error: &crate::Error) -> Self {
        Self {
            destination,
            error: Some(error.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_prefix() {
        let path = NetworkPath::new(
            "wg0",
            "key",
            "10.0.0.2".parse().unwrap(),
            ConnectionId(1),
            GroupId(1),
        );
        assert_eq!(path.host_prefix(), "10.0.0.2/32".parse::<IpNet>().unwrap());

        let v6 = NetworkPath { gateway: "fd00::2".parse().unwrap(), ..path };
        assert_eq!(v6.host_prefix().prefix_len(), 128);
    }

    #[test]
    fn test_route_result() {
        let dest: IpNet = "0.0.0.0/0".parse().unwrap();
        assert!(RouteResult::ok(dest).is_ok());

        let res = RouteResult::failed(dest, &crate::Error::DefaultRouteRejected(dest));
        assert!(!res.is_ok());
        assert!(res.error.unwrap().contains("0.0.0.0/0"));
    }
}
