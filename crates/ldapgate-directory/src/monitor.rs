//! Replication health across the nodes of a cluster.
//!
//! The monitor talks to every node directly over short-lived sessions,
//! bypassing the pool so fan-out noise never displaces warm sessions. Sync
//! state is derived from OpenLDAP's `contextCSN`; a synthetic
//! write-propagation probe verifies replication end to end.

use chrono::{NaiveDateTime, Utc};
use futures::future::join_all;
use ldapgate_core::config::{ClusterConfig, ClusterRegistry, Node};
use ldapgate_core::error::{Error, Result};
use ldapgate_ldap::{Dn, LdapConnector, LdapEndpoint, PasswordProvider, SearchScope};
use ldapgate_core::types::View;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Default wait between probe write and replica reads.
pub const DEFAULT_PROBE_WAIT: Duration = Duration::from_secs(5);

/// Tolerance when comparing `contextCSN` timestamps across nodes.
const CSN_TOLERANCE_SECS: i64 = 1;

/// Health snapshot of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSnapshot {
    /// Node label (configured name or `host:port`).
    pub node_label: String,
    /// Entries beneath the base.
    pub total: usize,
    /// Users-view entries.
    pub users: usize,
    /// Groups-view entries.
    pub groups: usize,
    /// Organizational units.
    pub ous: usize,
    /// Everything else.
    pub others: usize,
    /// `healthy` or `error`.
    pub status: String,
    /// Latest `contextCSN` value; empty when unavailable.
    pub context_csn: String,
    /// Wall-clock bind-and-query latency.
    pub response_ms: Option<u64>,
    /// Seconds since the `contextCSN` timestamp.
    pub sync_age_s: Option<i64>,
    /// Error detail for unreachable nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeSnapshot {
    fn unreachable(label: String, err: &Error) -> Self {
        Self {
            node_label: label,
            total: 0,
            users: 0,
            groups: 0,
            ous: 0,
            others: 0,
            status: "error".to_string(),
            context_csn: String::new(),
            response_ms: None,
            sync_age_s: None,
            error: Some(err.to_string()),
        }
    }
}

/// Cluster-wide replication snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterSnapshot {
    /// Per-node snapshots in declared order.
    pub nodes: Vec<NodeSnapshot>,
    /// True iff the `contextCSN` timestamps of reachable nodes agree within
    /// one second. A single reachable node is in sync by definition.
    pub in_sync: bool,
}

/// Per-replica result of the write-propagation probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeNodeResult {
    /// Node address.
    pub node: String,
    /// Whether the probe entry was observed.
    pub replicated: bool,
    /// Error detail, if the read failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of the write-propagation probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    /// True iff every non-master node observed the entry.
    pub success: bool,
    /// Wall-clock duration of the whole probe.
    pub latency_ms: u64,
    /// Human-readable summary.
    pub message: String,
    /// Per-replica results.
    pub results: Vec<ProbeNodeResult>,
}

/// One peer a node replicates from, per its syncrepl configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncPeer {
    /// Provider host.
    pub host: String,
    /// Replica ID of the consumer.
    pub rid: String,
}

/// Declared replication topology of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeTopology {
    /// Node address.
    pub node: String,
    /// `olcServerID`, when readable.
    pub server_id: Option<String>,
    /// Peers this node consumes from.
    pub reads_from: Vec<SyncPeer>,
}

/// Fan-out replication monitor.
pub struct ReplicationMonitor {
    registry: Arc<ClusterRegistry>,
    connector: Arc<dyn LdapConnector>,
    provider: Arc<dyn PasswordProvider>,
    probe_wait: Duration,
}

impl ReplicationMonitor {
    /// Wires the monitor from its collaborators.
    #[must_use]
    pub fn new(
        registry: Arc<ClusterRegistry>,
        connector: Arc<dyn LdapConnector>,
        provider: Arc<dyn PasswordProvider>,
    ) -> Self {
        Self {
            registry,
            connector,
            provider,
            probe_wait: DEFAULT_PROBE_WAIT,
        }
    }

    /// Overrides the probe wait interval.
    #[must_use]
    pub const fn with_probe_wait(mut self, wait: Duration) -> Self {
        self.probe_wait = wait;
        self
    }

    /// Queries every node concurrently and composes the cluster snapshot.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for unknown clusters, [`Error::AuthFailed`] when
    /// no credential is cached. Per-node failures land in the snapshot.
    pub async fn snapshot(&self, cluster_name: &str) -> Result<ClusterSnapshot> {
        let cluster = self.registry.get(cluster_name)?;
        let password = self.provider.bind_password(cluster_name).await?;
        let nodes = cluster.resolved_nodes();

        let snapshots = join_all(
            nodes
                .iter()
                .map(|node| self.node_snapshot(cluster, node, &password)),
        )
        .await;

        let in_sync = csn_set_in_sync(
            &snapshots
                .iter()
                .filter(|snap| snap.status == "healthy")
                .map(|snap| snap.context_csn.as_str())
                .collect::<Vec<_>>(),
        );

        Ok(ClusterSnapshot {
            nodes: snapshots,
            in_sync,
        })
    }

    /// Writes a temporary entry on the master and verifies every replica
    /// observes it within the probe wait.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for unknown clusters, [`Error::AuthFailed`] when
    /// no credential is cached, [`Error::BadRequest`] for a malformed base
    /// DN. Node failures are reported in the result, not raised.
    pub async fn probe(&self, cluster_name: &str) -> Result<ProbeReport> {
        let cluster = self.registry.get(cluster_name)?;
        let password = self.provider.bind_password(cluster_name).await?;
        let nodes = cluster.resolved_nodes();

        if nodes.len() < 2 {
            return Ok(ProbeReport {
                success: false,
                latency_ms: 0,
                message: "replication probe needs at least 2 nodes".to_string(),
                results: Vec::new(),
            });
        }

        let rdn = probe_rdn();
        let probe_dn = Dn::parse(&cluster.base_dn)?.child("cn", &rdn);
        let started = Instant::now();

        if let Err(err) = self
            .create_probe_entry(cluster, &nodes[0], &password, &probe_dn, &rdn)
            .await
        {
            return Ok(ProbeReport {
                success: false,
                latency_ms: elapsed_ms(started),
                message: format!("failed to create probe entry: {err}"),
                results: Vec::new(),
            });
        }

        tokio::time::sleep(self.probe_wait).await;

        let results = join_all(nodes[1..].iter().map(|node| {
            self.check_probe_entry(cluster, node, &password, probe_dn.as_str())
        }))
        .await;

        self.cleanup_probe_entry(cluster, &nodes[0], &password, probe_dn.as_str())
            .await;

        let success = results.iter().all(|r| r.replicated);
        Ok(ProbeReport {
            success,
            latency_ms: elapsed_ms(started),
            message: if success {
                "replication working".to_string()
            } else {
                "replication failed on some nodes".to_string()
            },
            results,
        })
    }

    /// Reads the declared syncrepl topology from each node's `cn=config`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for unknown clusters, [`Error::AuthFailed`] when
    /// no credential is cached.
    pub async fn topology(&self, cluster_name: &str) -> Result<Vec<NodeTopology>> {
        let cluster = self.registry.get(cluster_name)?;
        let password = self.provider.bind_password(cluster_name).await?;
        let nodes = cluster.resolved_nodes();
        if nodes.len() <= 1 {
            return Ok(Vec::new());
        }

        Ok(join_all(
            nodes
                .iter()
                .map(|node| self.node_topology(cluster, node, &password)),
        )
        .await)
    }

    async fn node_snapshot(
        &self,
        cluster: &ClusterConfig,
        node: &Node,
        password: &str,
    ) -> NodeSnapshot {
        match self.query_node(cluster, node, password).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                debug!(node = %node.address(), error = %err, "node snapshot failed");
                NodeSnapshot::unreachable(node.label.clone(), &err)
            }
        }
    }

    async fn query_node(
        &self,
        cluster: &ClusterConfig,
        node: &Node,
        password: &str,
    ) -> Result<NodeSnapshot> {
        let endpoint = LdapEndpoint::from_node(node, cluster.tls.as_ref());
        let started = Instant::now();
        let mut session = self.connector.connect(&endpoint).await?;
        let outcome = async {
            session.simple_bind(&cluster.bind_dn, password).await?;
            let response_ms = elapsed_ms(started);

            let total = self
                .count(&mut *session, &cluster.base_dn, View::All.base_filter())
                .await?;
            let users = self
                .count(&mut *session, &cluster.base_dn, View::Users.base_filter())
                .await?;
            let groups = self
                .count(&mut *session, &cluster.base_dn, View::Groups.base_filter())
                .await?;
            let ous = self
                .count(&mut *session, &cluster.base_dn, View::Ous.base_filter())
                .await?;

            let context_csn = self.latest_csn(&mut *session, &cluster.base_dn).await;
            let sync_age_s = context_csn
                .as_deref()
                .and_then(csn_timestamp)
                .map(|ts| (Utc::now().naive_utc() - ts).num_seconds());

            Ok(NodeSnapshot {
                node_label: node.label.clone(),
                total,
                users,
                groups,
                ous,
                others: total.saturating_sub(users + groups + ous),
                status: "healthy".to_string(),
                context_csn: context_csn.unwrap_or_default(),
                response_ms: Some(response_ms),
                sync_age_s,
                error: None,
            })
        }
        .await;
        let _ = session.unbind().await;
        outcome
    }

    async fn count(
        &self,
        session: &mut dyn ldapgate_ldap::LdapSession,
        base_dn: &str,
        filter: &str,
    ) -> Result<usize> {
        let entries = session
            .search(
                base_dn,
                SearchScope::Subtree,
                filter,
                vec!["1.1".to_string()],
            )
            .await?;
        Ok(entries.len())
    }

    async fn latest_csn(
        &self,
        session: &mut dyn ldapgate_ldap::LdapSession,
        base_dn: &str,
    ) -> Option<String> {
        let entries = session
            .search(
                base_dn,
                SearchScope::Base,
                "(objectClass=*)",
                vec!["contextCSN".to_string()],
            )
            .await
            .ok()?;
        entries
            .first()
            .and_then(|entry| entry.values("contextCSN"))
            // Multi-master servers report one CSN per server ID; the newest
            // one reflects the node's replication progress.
            .and_then(|values| values.iter().max().cloned())
    }

    async fn create_probe_entry(
        &self,
        cluster: &ClusterConfig,
        master: &Node,
        password: &str,
        probe_dn: &Dn,
        rdn: &str,
    ) -> Result<()> {
        let endpoint = LdapEndpoint::from_node(master, cluster.tls.as_ref());
        let mut session = self.connector.connect(&endpoint).await?;
        let outcome = async {
            session.simple_bind(&cluster.bind_dn, password).await?;
            session
                .add(
                    probe_dn.as_str(),
                    vec![
                        (
                            "objectClass".to_string(),
                            vec!["organizationalRole".to_string()],
                        ),
                        ("cn".to_string(), vec![rdn.to_string()]),
                        (
                            "description".to_string(),
                            vec!["replication health check".to_string()],
                        ),
                    ],
                )
                .await
        }
        .await;
        let _ = session.unbind().await;
        outcome
    }

    async fn check_probe_entry(
        &self,
        cluster: &ClusterConfig,
        node: &Node,
        password: &str,
        probe_dn: &str,
    ) -> ProbeNodeResult {
        let endpoint = LdapEndpoint::from_node(node, cluster.tls.as_ref());
        let outcome = async {
            let mut session = self.connector.connect(&endpoint).await?;
            let found = async {
                session.simple_bind(&cluster.bind_dn, password).await?;
                let entries = session
                    .search(
                        probe_dn,
                        SearchScope::Base,
                        "(objectClass=*)",
                        vec!["cn".to_string()],
                    )
                    .await?;
                Ok::<bool, Error>(!entries.is_empty())
            }
            .await;
            let _ = session.unbind().await;
            found
        }
        .await;

        match outcome {
            Ok(found) => ProbeNodeResult {
                node: node.address(),
                replicated: found,
                error: None,
            },
            // The entry not having arrived yet reads as not replicated, not
            // as a node failure.
            Err(Error::NotFound(_)) => ProbeNodeResult {
                node: node.address(),
                replicated: false,
                error: None,
            },
            Err(err) => ProbeNodeResult {
                node: node.address(),
                replicated: false,
                error: Some(err.to_string()),
            },
        }
    }

    async fn cleanup_probe_entry(
        &self,
        cluster: &ClusterConfig,
        master: &Node,
        password: &str,
        probe_dn: &str,
    ) {
        for attempt in 0..2 {
            let endpoint = LdapEndpoint::from_node(master, cluster.tls.as_ref());
            let outcome = async {
                let mut session = self.connector.connect(&endpoint).await?;
                let deleted = async {
                    session.simple_bind(&cluster.bind_dn, password).await?;
                    session.delete(probe_dn).await
                }
                .await;
                let _ = session.unbind().await;
                deleted
            }
            .await;

            match outcome {
                Ok(()) | Err(Error::NotFound(_)) => return,
                Err(err) if attempt == 0 => {
                    debug!(dn = probe_dn, error = %err, "probe cleanup failed, retrying");
                }
                Err(err) => {
                    warn!(
                        dn = probe_dn,
                        error = %err,
                        "probe entry could not be deleted; record for external cleanup"
                    );
                }
            }
        }
    }

    async fn node_topology(
        &self,
        cluster: &ClusterConfig,
        node: &Node,
        password: &str,
    ) -> NodeTopology {
        let endpoint = LdapEndpoint::from_node(node, cluster.tls.as_ref());
        let mut topology = NodeTopology {
            node: node.address(),
            server_id: None,
            reads_from: Vec::new(),
        };

        let outcome = async {
            let mut session = self.connector.connect(&endpoint).await?;
            let queried = async {
                session.simple_bind(&cluster.bind_dn, password).await?;

                let globals = session
                    .search(
                        "cn=config",
                        SearchScope::Base,
                        "(objectClass=olcGlobal)",
                        vec!["olcServerID".to_string()],
                    )
                    .await?;
                let server_id = globals
                    .first()
                    .and_then(|entry| entry.first("olcServerID"))
                    .and_then(|raw| raw.split_whitespace().next())
                    .map(ToString::to_string);

                let databases = session
                    .search(
                        "cn=config",
                        SearchScope::OneLevel,
                        "(&(objectClass=olcDatabaseConfig)(olcSyncrepl=*))",
                        vec!["olcSyncrepl".to_string()],
                    )
                    .await?;
                let peers = databases
                    .first()
                    .and_then(|entry| entry.values("olcSyncrepl"))
                    .map(|configs| configs.iter().filter_map(|c| parse_syncrepl(c)).collect())
                    .unwrap_or_default();

                Ok::<(Option<String>, Vec<SyncPeer>), Error>((server_id, peers))
            }
            .await;
            let _ = session.unbind().await;
            queried
        }
        .await;

        match outcome {
            Ok((server_id, peers)) => {
                topology.server_id = server_id;
                topology.reads_from = peers;
            }
            Err(err) => {
                debug!(node = %node.address(), error = %err, "topology query failed");
            }
        }
        topology
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn probe_rdn() -> String {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let salt: u16 = rand::thread_rng().gen_range(1000..10000);
    format!("repl-probe-{unix}-{salt}")
}

/// Parses the timestamp prefix of a `contextCSN` value
/// (`YYYYMMDDhhmmss.ffffffZ#...`).
pub(crate) fn csn_timestamp(csn: &str) -> Option<NaiveDateTime> {
    let prefix = csn.get(..14)?;
    NaiveDateTime::parse_from_str(prefix, "%Y%m%d%H%M%S").ok()
}

/// True iff the CSN timestamps of reachable nodes form a singleton within
/// tolerance. Empty CSNs (single-master servers) only compare as in sync
/// when there is at most one reachable node.
pub(crate) fn csn_set_in_sync(csns: &[&str]) -> bool {
    match csns.len() {
        0 => false,
        1 => true,
        _ => {
            let timestamps: Vec<NaiveDateTime> =
                csns.iter().filter_map(|csn| csn_timestamp(csn)).collect();
            if timestamps.len() != csns.len() {
                return false;
            }
            let min = timestamps.iter().min().copied();
            let max = timestamps.iter().max().copied();
            match (min, max) {
                (Some(min), Some(max)) => (max - min).num_seconds() <= CSN_TOLERANCE_SECS,
                _ => false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::VaultPasswordProvider;
    use async_trait::async_trait;
    use ldapgate_core::config::NodeConfig;
    use ldapgate_core::types::DirectoryEntry;
    use ldapgate_ldap::{MockLdapConnector, MockLdapSession};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct StaticProvider;

    #[async_trait]
    impl PasswordProvider for StaticProvider {
        async fn bind_password(&self, _cluster: &str) -> Result<String> {
            Ok("pw".to_string())
        }
    }

    fn cluster(ports: &[u16]) -> ClusterConfig {
        ClusterConfig {
            name: "prod".to_string(),
            description: None,
            host: None,
            port: None,
            nodes: ports
                .iter()
                .map(|&port| NodeConfig {
                    host: "127.0.0.1".to_string(),
                    port,
                    name: None,
                })
                .collect(),
            bind_dn: "cn=admin,dc=x".to_string(),
            base_dn: "dc=x".to_string(),
            readonly: false,
            user_creation_form: None,
            table_columns: None,
            password_policy: None,
            search_attributes: Vec::new(),
            tls: None,
        }
    }

    fn monitor_with(
        connector: MockLdapConnector,
        config: ClusterConfig,
    ) -> ReplicationMonitor {
        let registry = Arc::new(ClusterRegistry::new(vec![config]).unwrap());
        ReplicationMonitor::new(registry, Arc::new(connector), Arc::new(StaticProvider))
            .with_probe_wait(Duration::from_millis(10))
    }

    /// Connector that hands out queued sessions per node port.
    fn connector_by_port(
        sessions: Vec<(u16, MockLdapSession)>,
    ) -> MockLdapConnector {
        let mut by_port: HashMap<u16, Vec<MockLdapSession>> = HashMap::new();
        for (port, session) in sessions.into_iter().rev() {
            by_port.entry(port).or_default().push(session);
        }
        let queues = StdMutex::new(by_port);
        let mut connector = MockLdapConnector::new();
        connector.expect_connect().returning(move |endpoint| {
            let mut queues = queues.lock().unwrap();
            let session = queues
                .get_mut(&endpoint.port)
                .and_then(Vec::pop)
                .unwrap_or_else(|| panic!("unexpected connect to port {}", endpoint.port));
            Ok(Box::new(session) as Box<dyn ldapgate_ldap::LdapSession>)
        });
        connector
    }

    fn csn_entry(csn: &str) -> DirectoryEntry {
        let mut entry = DirectoryEntry::new("dc=x");
        entry
            .attributes
            .insert("contextCSN".to_string(), vec![csn.to_string()]);
        entry
    }

    fn snapshot_session(total: usize, csn: &'static str) -> MockLdapSession {
        let mut session = MockLdapSession::new();
        session.expect_simple_bind().returning(|_, _| Ok(()));
        session.expect_unbind().returning(|| Ok(()));
        session
            .expect_search()
            .times(5)
            .returning(move |_, scope, filter, _| {
                if matches!(scope, SearchScope::Base) {
                    return Ok(vec![csn_entry(csn)]);
                }
                let count = match filter {
                    "(objectClass=*)" => total,
                    f if f.contains("inetOrgPerson") => total.saturating_sub(4),
                    f if f.contains("groupOfNames") => 2,
                    _ => 1,
                };
                Ok((0..count)
                    .map(|i| DirectoryEntry::new(format!("cn=e{i},dc=x")))
                    .collect())
            });
        session
    }

    #[test]
    fn csn_timestamp_parses_prefix() {
        let ts = csn_timestamp("20260119194719.531790Z#000000#001#000000").unwrap();
        assert_eq!(ts.format("%Y-%m-%d %H:%M:%S").to_string(), "2026-01-19 19:47:19");
        assert!(csn_timestamp("garbage").is_none());
        assert!(csn_timestamp("").is_none());
    }

    #[test]
    fn csn_agreement_within_tolerance() {
        let a = "20260119194719.531790Z#000000#001#000000";
        let b = "20260119194720.100000Z#000000#002#000000";
        let c = "20260119194730.000000Z#000000#003#000000";

        assert!(csn_set_in_sync(&[a, b]));
        assert!(!csn_set_in_sync(&[a, c]));
        assert!(csn_set_in_sync(&[a]));
        // A single-master node without contextCSN is in sync on its own.
        assert!(csn_set_in_sync(&[""]));
        // But an unparsable CSN next to a real one is divergence.
        assert!(!csn_set_in_sync(&[a, ""]));
        assert!(!csn_set_in_sync(&[]));
    }

    #[test]
    fn syncrepl_parsing() {
        let config = "rid=001 provider=ldap://ldap1.example.com:389 \
                      searchbase=\"dc=example,dc=com\" type=refreshAndPersist";
        let peer = parse_syncrepl(config).unwrap();
        assert_eq!(peer.host, "ldap1.example.com");
        assert_eq!(peer.rid, "001");

        assert!(parse_syncrepl("type=refreshOnly").is_none());
    }

    #[tokio::test]
    async fn snapshot_composes_in_sync_cluster() {
        let csn = "20260119194719.531790Z#000000#001#000000";
        let connector = connector_by_port(vec![
            (3891, snapshot_session(10, csn)),
            (3892, snapshot_session(10, csn)),
        ]);
        let monitor = monitor_with(connector, cluster(&[3891, 3892]));

        let snapshot = monitor.snapshot("prod").await.unwrap();
        assert_eq!(snapshot.nodes.len(), 2);
        assert!(snapshot.in_sync);
        let first = &snapshot.nodes[0];
        assert_eq!(first.status, "healthy");
        assert_eq!(first.total, 10);
        assert_eq!(first.users, 6);
        assert_eq!(first.groups, 2);
        assert_eq!(first.ous, 1);
        assert_eq!(first.others, 1);
        assert_eq!(first.context_csn, csn);
        assert!(first.response_ms.is_some());
        assert!(first.sync_age_s.is_some());
    }

    #[tokio::test]
    async fn snapshot_marks_unreachable_nodes() {
        let csn = "20260119194719.531790Z#000000#001#000000";
        let mut connector = MockLdapConnector::new();
        let session = StdMutex::new(Some(snapshot_session(5, csn)));
        connector.expect_connect().returning(move |endpoint| {
            if endpoint.port == 3891 {
                Ok(Box::new(session.lock().unwrap().take().unwrap())
                    as Box<dyn ldapgate_ldap::LdapSession>)
            } else {
                Err(Error::ServiceUnavailable("connection refused".to_string()))
            }
        });
        let monitor = monitor_with(connector, cluster(&[3891, 3892]));

        let snapshot = monitor.snapshot("prod").await.unwrap();
        assert_eq!(snapshot.nodes[0].status, "healthy");
        assert_eq!(snapshot.nodes[1].status, "error");
        assert!(snapshot.nodes[1].error.is_some());
        // One healthy node left: in sync by definition.
        assert!(snapshot.in_sync);
    }

    #[tokio::test]
    async fn snapshot_requires_cached_credential() {
        let dir = tempfile::TempDir::new().unwrap();
        let vault = Arc::new(ldapgate_vault::CredentialVault::open(dir.path()).unwrap());
        let registry = Arc::new(ClusterRegistry::new(vec![cluster(&[3891])]).unwrap());
        let monitor = ReplicationMonitor::new(
            registry,
            Arc::new(MockLdapConnector::new()),
            Arc::new(VaultPasswordProvider::new(vault)),
        );

        let err = monitor.snapshot("prod").await.unwrap_err();
        assert!(matches!(err, Error::AuthFailed(_)));
    }

    fn probe_master_create_session() -> MockLdapSession {
        let mut session = MockLdapSession::new();
        session.expect_simple_bind().returning(|_, _| Ok(()));
        session.expect_unbind().returning(|| Ok(()));
        session.expect_add().times(1).returning(|dn, attrs| {
            assert!(dn.starts_with("cn=repl-probe-"));
            assert!(attrs
                .iter()
                .any(|(name, values)| name == "objectClass"
                    && values.contains(&"organizationalRole".to_string())));
            Ok(())
        });
        session
    }

    fn probe_replica_session(found: bool) -> MockLdapSession {
        let mut session = MockLdapSession::new();
        session.expect_simple_bind().returning(|_, _| Ok(()));
        session.expect_unbind().returning(|| Ok(()));
        session
            .expect_search()
            .times(1)
            .returning(move |dn, _, _, _| {
                if found {
                    Ok(vec![DirectoryEntry::new(dn)])
                } else {
                    Err(Error::NotFound("no such object".to_string()))
                }
            });
        session
    }

    fn probe_master_delete_session() -> MockLdapSession {
        let mut session = MockLdapSession::new();
        session.expect_simple_bind().returning(|_, _| Ok(()));
        session.expect_unbind().returning(|| Ok(()));
        session.expect_delete().times(1).returning(|_| Ok(()));
        session
    }

    #[tokio::test]
    async fn probe_succeeds_when_all_replicas_observe_the_entry() {
        let connector = connector_by_port(vec![
            (3891, probe_master_create_session()),
            (3892, probe_replica_session(true)),
            (3893, probe_replica_session(true)),
            (3891, probe_master_delete_session()),
        ]);
        let monitor = monitor_with(connector, cluster(&[3891, 3892, 3893]));

        let report = monitor.probe("prod").await.unwrap();
        assert!(report.success, "{report:?}");
        assert_eq!(report.results.len(), 2);
        assert!(report.results.iter().all(|r| r.replicated));
        assert_eq!(report.message, "replication working");
    }

    #[tokio::test]
    async fn probe_reports_lagging_replica() {
        let connector = connector_by_port(vec![
            (3891, probe_master_create_session()),
            (3892, probe_replica_session(true)),
            (3893, probe_replica_session(false)),
            (3891, probe_master_delete_session()),
        ]);
        let monitor = monitor_with(connector, cluster(&[3891, 3892, 3893]));

        let report = monitor.probe("prod").await.unwrap();
        assert!(!report.success);
        let lagging = report
            .results
            .iter()
            .find(|r| r.node.ends_with(":3893"))
            .unwrap();
        assert!(!lagging.replicated);
        assert!(lagging.error.is_none());
    }

    #[tokio::test]
    async fn probe_retries_cleanup_once() {
        let mut failing_delete = MockLdapSession::new();
        failing_delete.expect_simple_bind().returning(|_, _| Ok(()));
        failing_delete.expect_unbind().returning(|| Ok(()));
        failing_delete
            .expect_delete()
            .times(1)
            .returning(|_| Err(Error::Timeout("delete timed out".to_string())));

        let connector = connector_by_port(vec![
            (3891, probe_master_create_session()),
            (3892, probe_replica_session(true)),
            (3891, failing_delete),
            (3891, probe_master_delete_session()),
        ]);
        let monitor = monitor_with(connector, cluster(&[3891, 3892]));

        let report = monitor.probe("prod").await.unwrap();
        assert!(report.success);
    }

    #[tokio::test]
    async fn probe_needs_two_nodes() {
        let monitor = monitor_with(MockLdapConnector::new(), cluster(&[3891]));
        let report = monitor.probe("prod").await.unwrap();
        assert!(!report.success);
        assert!(report.message.contains("at least 2 nodes"));
    }

    #[tokio::test]
    async fn topology_parses_server_ids_and_peers() {
        fn config_session() -> MockLdapSession {
            let mut session = MockLdapSession::new();
            session.expect_simple_bind().returning(|_, _| Ok(()));
            session.expect_unbind().returning(|| Ok(()));
            session
                .expect_search()
                .times(2)
                .returning(|_, scope, filter, _| {
                    if matches!(scope, SearchScope::Base) && filter.contains("olcGlobal") {
                        let mut entry = DirectoryEntry::new("cn=config");
                        entry.attributes.insert(
                            "olcServerID".to_string(),
                            vec!["1 ldap://ldap1:389".to_string()],
                        );
                        Ok(vec![entry])
                    } else {
                        let mut entry = DirectoryEntry::new("olcDatabase={1}mdb,cn=config");
                        entry.attributes.insert(
                            "olcSyncrepl".to_string(),
                            vec![
                                "rid=001 provider=ldap://ldap2:389 searchbase=\"dc=x\"".to_string(),
                                "rid=002 provider=ldap://ldap3:389 searchbase=\"dc=x\"".to_string(),
                            ],
                        );
                        Ok(vec![entry])
                    }
                });
            session
        }

        let connector =
            connector_by_port(vec![(3891, config_session()), (3892, config_session())]);
        let monitor = monitor_with(connector, cluster(&[3891, 3892]));

        let topology = monitor.topology("prod").await.unwrap();
        assert_eq!(topology.len(), 2);
        assert_eq!(topology[0].server_id.as_deref(), Some("1"));
        assert_eq!(topology[0].reads_from.len(), 2);
        assert_eq!(topology[0].reads_from[0].host, "ldap2");
        assert_eq!(topology[0].reads_from[1].rid, "002");
    }

    #[tokio::test]
    async fn topology_is_empty_for_single_node_clusters() {
        let monitor = monitor_with(MockLdapConnector::new(), cluster(&[3891]));
        assert!(monitor.topology("prod").await.unwrap().is_empty());
    }
}

/// Extracts the consumer rid and provider host from one `olcSyncrepl` value.
fn parse_syncrepl(config: &str) -> Option<SyncPeer> {
    let rid = config
        .split("rid=")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();
    let provider = config.split("provider=").nth(1)?.split_whitespace().next()?;
    let host = provider
        .split("://")
        .nth(1)
        .unwrap_or(provider)
        .split(':')
        .next()?
        .to_string();
    Some(SyncPeer { host, rid })
}
