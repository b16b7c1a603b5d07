//! Error types for sdnroute.

use std::fmt;
use std::io;

use ipnet::IpNet;
use thiserror::Error;

use crate::types::GroupId;

/// Result type alias for sdnroute operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for sdnroute.
#[derive(Error, Debug)]
pub enum Error {
    // Route commit errors
    #[error("route to {destination} exists on {ifname}")]
    ForeignRoute { destination: IpNet, ifname: String },

    #[error("route command failed: {0}")]
    RouteCommand(String),

    #[error("route adapter not supported on this platform")]
    Unsupported,

    // Admission errors
    #[error("address {0} is already claimed by another connection group")]
    AddressConflict(IpNet),

    #[error("default route {0} rejected: agent is not configured as a VPN client")]
    DefaultRouteRejected(IpNet),

    #[error("no such address {0}")]
    UnknownDestination(IpNet),

    #[error("connection group {0} does not exist")]
    GroupNotFound(GroupId),

    // Probe errors
    #[error("probe failed on {ifname}: {reason}")]
    Probe { ifname: String, reason: String },

    #[error("probe on {0} timed out")]
    ProbeTimeout(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if the next apply or probe cycle may clear this error on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::RouteCommand(_)
                | Error::ForeignRoute { .. }
                | Error::Probe { .. }
                | Error::ProbeTimeout(_)
                | Error::Io(_)
        )
    }

    /// Check if the error was raised while admitting controller configuration.
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            Error::AddressConflict(_)
                | Error::DefaultRouteRejected(_)
                | Error::UnknownDestination(_)
                | Error::GroupNotFound(_)
        )
    }
}

/// Where a route operation failed, for log context.
#[derive(Debug)]
pub struct RouteContext {
    pub group_id: Option<GroupId>,
    pub ifname: Option<String>,
    pub destination: IpNet,
    pub operation: &'static str,
}

impl fmt::Display for RouteContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation={}, destination={}", self.operation, self.destination)?;
        if let Some(gid) = self.group_id {
            write!(f, ", group={gid}")?;
        }
        if let Some(ref ifname) = self.ifname {
            write!(f, ", ifname={ifname}")?;
        }
        Ok(())
    }
}
