//! Operating system routing table access.
//!
//! Route commits go through [`RouteAdapter`]. Implementations must be
//! idempotent for repeated identical calls and report plain success or
//! failure, never a partially applied route.

mod ip;
mod memory;

pub use ip::IpRouteCommand;
pub use memory::{MemoryRouteTable, RouteOp};

use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::Result;

/// Routing table operations consumed by the route monitors.
pub trait RouteAdapter: Send + Sync {
    /// Install a route to `destination` through `ifname`.
    fn route_add(&self, ifname: &str, gateway: Option<IpAddr>, destination: &IpNet) -> Result<()>;

    /// Remove the route to `destination` through `ifname`.
    fn route_del(&self, ifname: &str, destination: &IpNet) -> Result<()>;

    /// Atomically point an existing route to `destination` at `ifname`.
    fn route_replace(&self, ifname: &str, gateway: Option<IpAddr>, destination: &IpNet)
        -> Result<()>;

    /// Check whether any route to exactly `destination` is installed.
    fn route_exists(&self, destination: &IpNet) -> bool;

    /// Interface already carrying a route to exactly `destination`, if any.
    fn route_conflict(&self, destination: &IpNet) -> Option<String>;

    /// Check whether `destination` is a catch-all route.
    fn is_default_route(&self, destination: &IpNet) -> bool {
        destination.prefix_len() == 0
    }
}
