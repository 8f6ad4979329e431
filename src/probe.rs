use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::net::TcpStream;
use tracing::debug;

use crate::node::NodeDescriptor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub node: NodeDescriptor,
    pub delay_ms: u64,
}

#[async_trait]
pub trait LatencyProbe: Send + Sync {
    /// Measures a single node. `None` means it did not answer within `timeout`.
    async fn probe(&self, node: &NodeDescriptor, timeout: Duration) -> Option<ProbeResult>;

    /// Concurrent; results keep input order.
    async fn probe_all(&self, nodes: &[NodeDescriptor], timeout: Duration) -> Vec<ProbeResult> {
        let probes = nodes.iter().map(|node| self.probe(node, timeout));
        join_all(probes).await.into_iter().flatten().collect()
    }

    async fn pick_least_delay(
        &self,
        nodes: &[NodeDescriptor],
        timeout: Duration,
    ) -> Option<ProbeResult> {
        select_least_delay(self.probe_all(nodes, timeout).await)
    }
}

/// Smallest delay wins; on a tie the earlier result is kept.
pub fn select_least_delay(results: Vec<ProbeResult>) -> Option<ProbeResult> {
    let mut best: Option<ProbeResult> = None;
    for result in results {
        let better = best
            .as_ref()
            .map_or(true, |current| result.delay_ms < current.delay_ms);
        if better {
            best = Some(result);
        }
    }
    best
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProber;

#[async_trait]
impl LatencyProbe for TcpProber {
    async fn probe(&self, node: &NodeDescriptor, timeout: Duration) -> Option<ProbeResult> {
        let started = Instant::now();
        let connect = TcpStream::connect((node.host.as_str(), node.port));
        match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(_stream)) => {
                let delay_ms = (started.elapsed().as_millis() as u64).max(1);
                Some(ProbeResult {
                    node: node.clone(),
                    delay_ms,
                })
            }
            Ok(Err(e)) => {
                debug!(node = %node.name, address = %node.address(), error = %e, "probe failed");
                None
            }
            Err(_) => {
                debug!(node = %node.name, address = %node.address(), "probe timed out");
                None
            }
        }
    }
}
