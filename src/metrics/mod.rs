//! Path measurement statistics.
//!
//! This module provides:
//! - Per-address probe tallies, mergeable across probe rounds
//! - Loss and latency derivation with range guarantees
//! - Peer status classification for reporting

mod quality;
mod store;

pub use quality::{PathQuality, PeerStatus, WARNING_LATENCY_MS, WARNING_LOSS};
pub use store::{Iter, PathMetricStore, PathSample};
