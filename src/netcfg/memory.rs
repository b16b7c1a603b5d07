//! In-memory routing table.
//!
//! Used for dry runs and tests. Every mutating call is recorded, and
//! destinations can be set to fail.

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;

use ipnet::IpNet;
use parking_lot::Mutex;

use super::RouteAdapter;
use crate::error::{Error, Result};

/// A mutating call seen by [`MemoryRouteTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOp {
    Add { ifname: String, destination: IpNet },
    Del { ifname: String, destination: IpNet },
    Replace { ifname: String, destination: IpNet },
}

impl RouteOp {
    pub fn destination(&self) -> &IpNet {
        match self {
            Self::Add { destination, .. }
            | Self::Del { destination, .. }
            | Self::Replace { destination, .. } => destination,
        }
    }
}

#[derive(Debug, Clone)]
struct InstalledRoute {
    ifname: String,
    gateway: Option<IpAddr>,
}

#[derive(Debug, Default)]
struct TableState {
    routes: BTreeMap<IpNet, InstalledRoute>,
    ops: Vec<RouteOp>,
    failing: HashSet<IpNet>,
}

/// Routing table kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryRouteTable {
    state: Mutex<TableState>,
}

impl MemoryRouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a route without recording it, as if another program added it.
    pub fn insert_existing(&self, destination: IpNet, ifname: impl Into<String>) {
        self.state.lock().routes.insert(
            destination,
            InstalledRoute {
                ifname: ifname.into(),
                gateway: None,
            },
        );
    }

    /// Make every mutating call for `destination` fail.
    pub fn fail_on(&self, destination: IpNet) {
        self.state.lock().failing.insert(destination);
    }

    /// Stop injecting failures.
    pub fn clear_failures(&self) {
        self.state.lock().failing.clear();
    }

    /// Interface currently routing `destination`.
    pub fn route_via(&self, destination: &IpNet) -> Option<String> {
        self.state
            .lock()
            .routes
            .get(destination)
            .map(|r| r.ifname.clone())
    }

    /// Gateway of the route to `destination`, if it has one.
    pub fn gateway_of(&self, destination: &IpNet) -> Option<IpAddr> {
        self.state
            .lock()
            .routes
            .get(destination)
            .and_then(|r| r.gateway)
    }

    /// Number of installed routes.
    pub fn len(&self) -> usize {
        self.state.lock().routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().routes.is_empty()
    }

    /// All recorded mutating calls, oldest first.
    pub fn ops(&self) -> Vec<RouteOp> {
        self.state.lock().ops.clone()
    }

    /// Forget recorded calls.
    pub fn clear_ops(&self) {
        self.state.lock().ops.clear();
    }
}

impl RouteAdapter for MemoryRouteTable {
    fn route_add(&self, ifname: &str, gateway: Option<IpAddr>, destination: &IpNet) -> Result<()> {
        let mut state = self.state.lock();
        state.ops.push(RouteOp::Add {
            ifname: ifname.to_string(),
            destination: *destination,
        });

        if state.failing.contains(destination) {
            return Err(Error::RouteCommand(format!("add {destination}: injected failure")));
        }

        match state.routes.get(destination) {
            Some(existing) if existing.ifname == ifname => Ok(()),
            Some(existing) => Err(Error::RouteCommand(format!(
                "add {destination}: File exists (dev {})",
                existing.ifname
            ))),
            None => {
                state.routes.insert(
                    *destination,
                    InstalledRoute {
                        ifname: ifname.to_string(),
                        gateway,
                    },
                );
                Ok(())
            }
        }
    }

    fn route_del(&self, ifname: &str, destination: &IpNet) -> Result<()> {
        let mut state = self.state.lock();
        state.ops.push(RouteOp::Del {
            ifname: ifname.to_string(),
            destination: *destination,
        });

        if state.failing.contains(destination) {
            return Err(Error::RouteCommand(format!("del {destination}: injected failure")));
        }

        // Deleting a route that is not ours or not present is a no-op
        if state
            .routes
            .get(destination)
            .is_some_and(|r| r.ifname == ifname)
        {
            state.routes.remove(destination);
        }
        Ok(())
    }

    fn route_replace(
        &self,
        ifname: &str,
        gateway: Option<IpAddr>,
        destination: &IpNet,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.ops.push(RouteOp::Replace {
            ifname: ifname.to_string(),
            destination: *destination,
        });

        if state.failing.contains(destination) {
            return Err(Error::RouteCommand(format!("replace {destination}: injected failure")));
        }

        state.routes.insert(
            *destination,
            InstalledRoute {
                ifname: ifname.to_string(),
                gateway,
            },
        );
        Ok(())
    }

    fn route_exists(&self, destination: &IpNet) -> bool {
        self.state.lock().routes.contains_key(destination)
    }

    fn route_conflict(&self, destination: &IpNet) -> Option<String> {
        self.route_via(destination)
    }
}
