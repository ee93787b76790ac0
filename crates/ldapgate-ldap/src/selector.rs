//! Node selection for multi-master clusters.
//!
//! WRITE operations always target node 0; losing the master means losing
//! writes rather than risking write/read inversion on an eventually
//! consistent replica. READ operations walk the declared order in reverse
//! to keep load off the master. HEALTH uses node 0 for single-target checks
//! and the full node list for fan-out.

use ldapgate_core::config::{ClusterConfig, Node};
use ldapgate_core::error::{Error, Result};
use ldapgate_core::types::OperationClass;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Default TCP reachability probe timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Selects a node for a given operation class, probing reachability with a
/// short TCP connect. Selection itself is stateless; the only state is a
/// bounded negative cache of recently failed probes.
pub struct NodeSelector {
    probe_timeout: Duration,
    negative_ttl: Duration,
    // host:port -> instant the node last failed a probe
    failed_probes: Mutex<HashMap<String, Instant>>,
}

impl NodeSelector {
    /// Creates a selector with the default 2 s probe timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_probe_timeout(DEFAULT_PROBE_TIMEOUT)
    }

    /// Creates a selector with an explicit probe timeout. The negative
    /// cache lives for one probe interval, never longer.
    #[must_use]
    pub fn with_probe_timeout(probe_timeout: Duration) -> Self {
        Self {
            probe_timeout,
            negative_ttl: probe_timeout,
            failed_probes: Mutex::new(HashMap::new()),
        }
    }

    /// Selects a node for `class`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceUnavailable`] when the write master (WRITE)
    /// or every read candidate (READ) is unreachable, and
    /// [`Error::ConfigError`] for a cluster without nodes.
    pub async fn select(&self, cluster: &ClusterConfig, class: OperationClass) -> Result<Node> {
        let nodes = cluster.resolved_nodes();
        if nodes.is_empty() {
            return Err(Error::ConfigError(format!(
                "cluster `{}` has no nodes",
                cluster.name
            )));
        }

        match class {
            // Writes never fail over: single-writer ordering beats
            // availability here.
            OperationClass::Write => {
                let master = nodes[0].clone();
                if self.reachable(&master).await {
                    debug!(cluster = %cluster.name, node = %master.address(), "selected write master");
                    Ok(master)
                } else {
                    Err(Error::ServiceUnavailable(format!(
                        "write node {} unreachable",
                        master.address()
                    )))
                }
            }
            OperationClass::Read => {
                for node in nodes.iter().rev() {
                    if self.reachable(node).await {
                        debug!(cluster = %cluster.name, node = %node.address(), "selected read node");
                        return Ok(node.clone());
                    }
                    warn!(cluster = %cluster.name, node = %node.address(), "node unreachable, trying next");
                }
                Err(Error::ServiceUnavailable(format!(
                    "no reachable read node in cluster `{}`",
                    cluster.name
                )))
            }
            OperationClass::Health => Ok(nodes[0].clone()),
        }
    }

    /// Returns every node of the cluster, in declared order, for health
    /// fan-out.
    #[must_use]
    pub fn all_nodes(&self, cluster: &ClusterConfig) -> Vec<Node> {
        cluster.resolved_nodes()
    }

    /// Best-effort L4 reachability check with a bounded negative cache.
    pub async fn reachable(&self, node: &Node) -> bool {
        let address = node.address();

        if let Ok(mut cache) = self.failed_probes.lock() {
            match cache.get(&address) {
                Some(failed_at) if failed_at.elapsed() < self.negative_ttl => return false,
                Some(_) => {
                    cache.remove(&address);
                }
                None => {}
            }
        }

        let connected = matches!(
            timeout(self.probe_timeout, TcpStream::connect((node.host.as_str(), node.port))).await,
            Ok(Ok(_))
        );

        if !connected {
            if let Ok(mut cache) = self.failed_probes.lock() {
                cache.insert(address, Instant::now());
            }
        }
        connected
    }
}

impl Default for NodeSelector {
    fn default() -> Self {
        Self::new()
    }
}
