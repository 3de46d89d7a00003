//! Engine statistics

use serde::{Deserialize, Serialize};

/// Sample name for the time a queued packet waited for its route
pub const STAT_DISCOVERY_DELAY: &str = "discovery delay";
/// Sample name for end-to-end latency of received data
pub const STAT_DATA_DELAY: &str = "data delay";
pub const STAT_DATA_HOPS: &str = "data hops";
pub const STAT_DATA_DELAY_PER_HOP: &str = "data delay per hop";
pub const STAT_DATA_SOURCE: &str = "data source";

/// Counters kept by one engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Application packets injected by this node and sent
    pub traffic_sent: u64,
    /// Application packets received for this node
    pub traffic_received: u64,
    /// Application packets relayed on behalf of others
    pub traffic_forwarded: u64,

    pub rreq_sent: u64,
    pub rrep_sent: u64,
    pub rerr_sent: u64,

    pub rreq_received: u64,
    pub rrep_received: u64,
    pub rerr_received: u64,

    pub rreq_forwarded: u64,
    pub rrep_forwarded: u64,
    pub rerr_forwarded: u64,

    /// Every control message observed, consumed or not
    pub control_received: u64,

    /// Sum of discovery delays in seconds
    pub discovery_latency: f64,
    pub discovery_samples: u64,
    /// Sum of data delays in seconds
    pub data_latency: f64,
    pub data_samples: u64,
}

impl EngineStats {
    /// Whether this node has originated any control traffic
    pub fn has_participated(&self) -> bool {
        self.rreq_sent > 0 || self.rrep_sent > 0 || self.rerr_sent > 0
    }

    /// Mean discovery delay in seconds, if any samples were taken
    pub fn mean_discovery_latency(&self) -> Option<f64> {
        (self.discovery_latency > 0.0 && self.discovery_samples > 0)
            .then(|| self.discovery_latency / self.discovery_samples as f64)
    }

    /// Mean data delay in seconds, if any samples were taken
    pub fn mean_data_latency(&self) -> Option<f64> {
        (self.data_latency > 0.0 && self.data_samples > 0).then(|| self.data_latency / self.data_samples as f64)
    }

    /// Scalar totals under their recording names
    pub fn scalars(&self) -> Vec<(&'static str, f64)> {
        let mut out = vec![
            ("DYMO_TrafficSent", self.traffic_sent as f64),
            ("DYMO_TrafficRcvd", self.traffic_received as f64),
            ("DYMO_TrafficFwd", self.traffic_forwarded as f64),
            ("DYMO_RREQSent", self.rreq_sent as f64),
            ("DYMO_RREPSent", self.rrep_sent as f64),
            ("DYMO_RERRSent", self.rerr_sent as f64),
            ("DYMO_RREQRcvd", self.rreq_received as f64),
            ("DYMO_RREPRcvd", self.rrep_received as f64),
            ("DYMO_RERRRcvd", self.rerr_received as f64),
            ("DYMO_RREQFwd", self.rreq_forwarded as f64),
            ("DYMO_RREPFwd", self.rrep_forwarded as f64),
            ("DYMO_RERRFwd", self.rerr_forwarded as f64),
            ("DYMO_DYMORcvd", self.control_received as f64),
        ];
        if let Some(latency) = self.mean_discovery_latency() {
            out.push(("discovery latency", latency));
        }
        if let Some(latency) = self.mean_data_latency() {
            out.push(("data latency", latency));
        }
        out
    }

    /// Add another engine's counters to these
    pub fn merge(&mut self, other: &EngineStats) {
        self.traffic_sent += other.traffic_sent;
        self.traffic_received += other.traffic_received;
        self.traffic_forwarded += other.traffic_forwarded;
        self.rreq_sent += other.rreq_sent;
        self.rrep_sent += other.rrep_sent;
        self.rerr_sent += other.rerr_sent;
        self.rreq_received += other.rreq_received;
        self.rrep_received += other.rrep_received;
        self.rerr_received += other.rerr_received;
        self.rreq_forwarded += other.rreq_forwarded;
        self.rrep_forwarded += other.rrep_forwarded;
        self.rerr_forwarded += other.rerr_forwarded;
        self.control_received += other.control_received;
        self.discovery_latency += other.discovery_latency;
        self.discovery_samples += other.discovery_samples;
        self.data_latency += other.data_latency;
        self.data_samples += other.data_samples;
    }
}
