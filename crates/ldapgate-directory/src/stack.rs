//! Composition root: wires the vault, pool, gateway, service and monitor
//! from a validated cluster list and the environment settings.

use crate::monitor::ReplicationMonitor;
use crate::provider::VaultPasswordProvider;
use crate::service::DirectoryService;
use ldapgate_core::config::{ClusterConfig, ClusterRegistry};
use ldapgate_core::error::Result;
use ldapgate_core::settings::GatewaySettings;
use ldapgate_ldap::{
    LdapGateway, NodeSelector, PoolStats, RealLdapConnector, SessionPool,
};
use ldapgate_vault::CredentialVault;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Liveness report for the `/health` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct Liveness {
    /// Number of validated clusters.
    pub clusters: usize,
    /// Whether the vault's secrets directory is readable.
    pub vault_ok: bool,
    /// Idle sessions currently pooled.
    pub pool_idle: usize,
}

/// The fully wired gateway core.
///
/// Owns the background reaper; [`GatewayStack::shutdown`] cancels it and
/// drains the pool. There is no persistent state beyond the config and the
/// vault files.
pub struct GatewayStack {
    service: Arc<DirectoryService>,
    monitor: Arc<ReplicationMonitor>,
    vault: Arc<CredentialVault>,
    pool: Arc<SessionPool>,
    registry: Arc<ClusterRegistry>,
    reaper: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for GatewayStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayStack").finish_non_exhaustive()
    }
}

impl GatewayStack {
    /// Validates the cluster list and builds the whole stack.
    ///
    /// # Errors
    ///
    /// Returns [`ldapgate_core::Error::ConfigError`] for invalid topology
    /// and [`ldapgate_core::Error::Storage`] when the vault cannot be
    /// initialized; both must fail the process at startup.
    pub fn new(
        clusters: Vec<ClusterConfig>,
        settings: &GatewaySettings,
        secrets_dir: impl AsRef<Path>,
    ) -> Result<Self> {
        let registry = Arc::new(ClusterRegistry::new(clusters)?);
        let vault = Arc::new(
            CredentialVault::open(secrets_dir.as_ref())?.with_default_ttl(settings.credential_ttl),
        );
        let connector = Arc::new(RealLdapConnector::new(
            settings.net_timeout,
            settings.op_timeout,
        ));
        let selector = Arc::new(NodeSelector::new());
        let pool = Arc::new(SessionPool::new(connector.clone(), settings.pool_idle_ttl));
        let reaper = pool.spawn_reaper();
        let provider = Arc::new(VaultPasswordProvider::new(Arc::clone(&vault)));

        let gateway = Arc::new(LdapGateway::new(
            Arc::clone(&registry),
            selector,
            Arc::clone(&pool),
            connector.clone(),
            provider.clone(),
        ));
        let service = Arc::new(DirectoryService::new(
            Arc::clone(&registry),
            gateway,
            Arc::clone(&vault),
        ));
        let monitor = Arc::new(ReplicationMonitor::new(
            Arc::clone(&registry),
            connector,
            provider,
        ));

        info!(clusters = registry.len(), "gateway stack initialized");
        Ok(Self {
            service,
            monitor,
            vault,
            pool,
            registry,
            reaper,
        })
    }

    /// The directory service facade.
    #[must_use]
    pub fn service(&self) -> &Arc<DirectoryService> {
        &self.service
    }

    /// The replication monitor.
    #[must_use]
    pub fn monitor(&self) -> &Arc<ReplicationMonitor> {
        &self.monitor
    }

    /// The credential vault.
    #[must_use]
    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.vault
    }

    /// Pool statistics, for diagnostics.
    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    /// Composes the liveness report.
    pub async fn liveness(&self) -> Liveness {
        Liveness {
            clusters: self.registry.len(),
            vault_ok: self.vault.secrets_dir().exists(),
            pool_idle: self.pool.stats().await.total_idle,
        }
    }

    /// Stops the reaper and closes every pooled session.
    pub async fn shutdown(self) {
        self.reaper.abort();
        self.pool.drain().await;
        info!("gateway stack shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldapgate_core::config::NodeConfig;
    use ldapgate_core::error::Error;
    use tempfile::TempDir;

    fn cluster(name: &str) -> ClusterConfig {
        ClusterConfig {
            name: name.to_string(),
            description: None,
            host: None,
            port: None,
            nodes: vec![NodeConfig {
                host: "127.0.0.1".to_string(),
                port: 3899,
                name: None,
            }],
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

    #[tokio::test]
    async fn stack_wires_and_shuts_down() {
        let dir = TempDir::new().unwrap();
        let settings = GatewaySettings::default();
        let stack =
            GatewayStack::new(vec![cluster("a"), cluster("b")], &settings, dir.path()).unwrap();

        let liveness = stack.liveness().await;
        assert_eq!(liveness.clusters, 2);
        assert!(liveness.vault_ok);
        assert_eq!(liveness.pool_idle, 0);

        assert_eq!(stack.service().cluster_summaries().len(), 2);
        stack.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_topology_fails_startup() {
        let dir = TempDir::new().unwrap();
        let settings = GatewaySettings::default();
        let err = GatewayStack::new(
            vec![cluster("a"), cluster("a")],
            &settings,
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }
}
