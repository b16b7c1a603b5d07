//! # sdnroute
//!
//! Route management and path selection for software-defined overlay agents.
//!
//! Given tunnel links to remote peers, sdnroute measures path quality,
//! picks the best link per connection group with anti-flap hysteresis,
//! and installs, replaces or withdraws routes for every destination
//! reachable through those peers. Address claims are kept exclusive
//! across groups.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Controller (route add / delete)                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │          Router: group map, conflict resolution, apply          │
//! │  ┌──────────────────────────┐  ┌──────────────────────────┐     │
//! │  │ Group 1                  │  │ Group N                  │     │
//! │  │  PeerPathMonitor         │  │  PeerPathMonitor         │     │
//! │  │  ServiceRouteMonitor     │  │  ServiceRouteMonitor     │ ... │
//! │  └──────────────────────────┘  └──────────────────────────┘     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │        Probe Scheduler  ──►  PathMetricStore (per round)        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │      RouteAdapter (ip route / in-memory)   │   StatusSink       │
//! └─────────────────────────────────────────────────────────────────┘

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow stylistic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]      // Many functions can't be const due to trait bounds
#![allow(clippy::doc_markdown)]              // ASCII diagrams in docs
#![allow(clippy::cast_possible_truncation)]  // f64 averages stored as f32
#![allow(clippy::cast_precision_loss)]       // Acceptable for stats
#![allow(clippy::float_cmp)]                 // Equal window means are compared exactly
#![allow(clippy::significant_drop_tightening)] // Router lock spans each operation
#![allow(clippy::option_if_let_else)]        // More readable in context
#![allow(clippy::use_self)]                  // Explicit type names in matches
#![allow(clippy::redundant_pub_crate)]       // Explicit visibility
#![allow(clippy::struct_excessive_bools)]    // Boolean config fields are appropriate
#![allow(clippy::match_same_arms)]           // Explicit arm per state is clearer
#![allow(clippy::return_self_not_must_use)]  // Builder methods don't need must_use
#![allow(clippy::too_many_arguments)]        // Commit helpers take split borrows

pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod netcfg;
pub mod peermon;
pub mod probe;
pub mod router;
pub mod servicemon;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use router::Router;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{Config, ProbeConfig, RouterConfig};
    pub use crate::error::{Error, Result};
    pub use crate::events::{BroadcastSink, NullSink, StatusEvent, StatusSink};
    pub use crate::metrics::{PathMetricStore, PathSample, PeerStatus};
    pub use crate::netcfg::{IpRouteCommand, MemoryRouteTable, RouteAdapter};
    pub use crate::peermon::{SelectedPath, Thresholds};
    pub use crate::probe::{DeviceInventory, Pinger, ProbeScheduler, TunnelDevice, TunnelPeer};
    pub use crate::router::{ApplyReport, Router};
    pub use crate::types::*;
}
