//! Path quality classification.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::store::PathSample;

/// Latency above which a path is reported as degraded (ms).
pub const WARNING_LATENCY_MS: f32 = 500.0;

/// Loss ratio above which a path is reported as degraded.
pub const WARNING_LOSS: f32 = 0.01;

/// Reported health of a path to one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerStatus {
    Connected,
    Warning(String),
    Offline(String),
}

impl PeerStatus {
    /// Classify a path from its average latency and loss.
    pub fn classify(latency_ms: f32, loss: f32) -> Self {
        if loss >= 1.0 {
            Self::Offline("Packet loss 100%".into())
        } else if loss >= WARNING_LOSS {
            Self::Warning("Packet loss higher than 1%".into())
        } else if latency_ms > WARNING_LATENCY_MS {
            Self::Warning("Latency higher than 500ms".into())
        } else {
            Self::Connected
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Warning(reason) => write!(f, "warning ({reason})"),
            Self::Offline(reason) => write!(f, "offline ({reason})"),
        }
    }
}

/// Quality of the path to one probed address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathQuality {
    pub address: IpAddr,
    pub latency_ms: f32,
    pub loss: f32,
    #[serde(flatten)]
    pub status: PeerStatus,
}

impl PathQuality {
    pub fn from_sample(address: IpAddr, sample: &PathSample) -> Self {
        let latency_ms = sample.latency();
        let loss = sample.loss();
        Self {
            address,
            latency_ms,
            loss,
            status: PeerStatus::classify(latency_ms, loss),
        }
    }

    /// Get a brief summary.
    pub fn summary(&self) -> String {
        format!(
            "{} latency={:.1}ms loss={:.1}% {}",
            self.address,
            self.latency_ms,
            self.loss * 100.0,
            self.status
        )
    }
}
