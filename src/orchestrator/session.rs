use std::time::Instant;

use serde::Serialize;

use crate::node::NodeDescriptor;
use crate::throughput::{bytes_to_kbits, ThroughputSampler};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
        }
    }
}

/// State of the single active connection. Exists only while `Connected`.
#[derive(Debug)]
pub struct ConnectionSession {
    pub node: NodeDescriptor,
    pub delay_ms: u64,
    pub speed_kbps: f64,
    sampler: ThroughputSampler,
}

impl ConnectionSession {
    pub fn new(node: NodeDescriptor, delay_ms: u64) -> Self {
        Self {
            node,
            delay_ms,
            speed_kbps: 0.0,
            sampler: ThroughputSampler::new(),
        }
    }

    pub fn record_traffic(&mut self, cumulative_bytes: u64, at: Instant) -> f64 {
        self.speed_kbps = self.sampler.sample(bytes_to_kbits(cumulative_bytes), at);
        self.speed_kbps
    }

    /// A failed counter read shows as idle but keeps the baseline.
    pub fn record_idle(&mut self) {
        self.speed_kbps = 0.0;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state: ConnectionState,
    pub message: String,
    pub node: Option<String>,
    pub delay_ms: Option<u64>,
    pub speed_kbps: f64,
    pub tun_enabled: bool,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            message: "Disconnected".to_string(),
            node: None,
            delay_ms: None,
            speed_kbps: 0.0,
            tun_enabled: false,
        }
    }
}

/// Failover requires a different node that beats the current delay by at
/// least `margin_ms`.
pub fn should_fail_over(current: &ConnectionSession, best_uri: &str, best_delay_ms: u64, margin_ms: u64) -> bool {
    best_uri != current.node.original_uri
        && best_delay_ms < current.delay_ms
        && current.delay_ms - best_delay_ms >= margin_ms
}
