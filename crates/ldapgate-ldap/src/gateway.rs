//! Typed LDAP operations over selected nodes and pooled sessions.
//!
//! The gateway is the single place where cluster name + operation class
//! turn into a bound session against a concrete node. Mutations always
//! traverse the write master; reads may opt into master-consistent
//! selection for read-after-write flows.

use crate::pool::{PasswordProvider, PoolKey, PooledSession, SessionPool};
use crate::selector::NodeSelector;
use crate::session::{
    AttributeChange, LdapConnector, LdapEndpoint, PageRequest, SearchPage, SearchScope,
};
use ldapgate_core::config::{ClusterConfig, ClusterRegistry, Node};
use ldapgate_core::error::{Error, Result};
use ldapgate_core::types::{DirectoryEntry, OperationClass};
use std::sync::Arc;
use tracing::{debug, warn};

/// Hard ceiling for a single page of a paged search.
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Default bound on pages walked by one enumeration.
pub const DEFAULT_MAX_PAGES: u32 = 10_000;

/// Read consistency hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadConsistency {
    /// Read from a replica; no ordering guarantee against recent writes.
    Eventual,
    /// Route the read to the write master for read-after-write flows.
    Consistent,
}

impl ReadConsistency {
    const fn operation_class(self) -> OperationClass {
        match self {
            Self::Eventual => OperationClass::Read,
            Self::Consistent => OperationClass::Write,
        }
    }
}

/// Parameters of a paged search.
#[derive(Debug, Clone)]
pub struct PagedSearchParams {
    /// Search base.
    pub base_dn: String,
    /// Search scope.
    pub scope: SearchScope,
    /// Composed, escaped filter.
    pub filter: String,
    /// Attributes to return.
    pub attributes: Vec<String>,
    /// Requested page size; clamped to [`MAX_PAGE_SIZE`].
    pub page_size: u32,
    /// Bound on pages walked; defaults to [`DEFAULT_MAX_PAGES`].
    pub max_pages: u32,
}

/// Gateway over one registry of clusters.
pub struct LdapGateway {
    registry: Arc<ClusterRegistry>,
    selector: Arc<NodeSelector>,
    pool: Arc<SessionPool>,
    connector: Arc<dyn LdapConnector>,
    provider: Arc<dyn PasswordProvider>,
}

impl LdapGateway {
    /// Wires the gateway from its collaborators.
    #[must_use]
    pub fn new(
        registry: Arc<ClusterRegistry>,
        selector: Arc<NodeSelector>,
        pool: Arc<SessionPool>,
        connector: Arc<dyn LdapConnector>,
        provider: Arc<dyn PasswordProvider>,
    ) -> Self {
        Self {
            registry,
            selector,
            pool,
            connector,
            provider,
        }
    }

    /// The cluster registry this gateway serves.
    #[must_use]
    pub fn registry(&self) -> &Arc<ClusterRegistry> {
        &self.registry
    }

    /// The session pool backing this gateway.
    #[must_use]
    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// Verifies credentials with a short-lived connection outside the pool.
    ///
    /// # Errors
    ///
    /// [`Error::ServiceUnavailable`] when the node cannot be reached,
    /// [`Error::AuthFailed`] when the bind is rejected, [`Error::Timeout`]
    /// when the deadline expires.
    pub async fn bind_test(
        &self,
        cluster_name: &str,
        bind_dn: &str,
        password: &str,
    ) -> Result<()> {
        let cluster = self.registry.get(cluster_name)?;
        let node = self.selector.select(cluster, OperationClass::Health).await?;
        let endpoint = LdapEndpoint::from_node(&node, cluster.tls.as_ref());

        let mut session = self.connector.connect(&endpoint).await?;
        let outcome = session.simple_bind(bind_dn, password).await;
        let _ = session.unbind().await;
        outcome
    }

    /// Runs an unpaged search on a READ-selected node (or the master with
    /// [`ReadConsistency::Consistent`]).
    ///
    /// # Errors
    ///
    /// Propagates selection, pool and LDAP failures.
    pub async fn search(
        &self,
        cluster_name: &str,
        base_dn: &str,
        scope: SearchScope,
        filter: &str,
        attributes: Vec<String>,
        consistency: ReadConsistency,
    ) -> Result<Vec<DirectoryEntry>> {
        let cluster = self.registry.get(cluster_name)?;
        let (mut session, _node) = self
            .checkout(cluster, consistency.operation_class())
            .await?;
        let result = session
            .session_mut()
            .search(base_dn, scope, filter, attributes)
            .await;
        self.finish(session, result).await
    }

    /// Counts entries matching `filter` beneath `base_dn`.
    ///
    /// # Errors
    ///
    /// Propagates selection, pool and LDAP failures.
    pub async fn count(
        &self,
        cluster_name: &str,
        base_dn: &str,
        filter: &str,
        consistency: ReadConsistency,
    ) -> Result<usize> {
        // "1.1" asks for no attributes at all; only DNs travel back.
        let entries = self
            .search(
                cluster_name,
                base_dn,
                SearchScope::Subtree,
                filter,
                vec!["1.1".to_string()],
                consistency,
            )
            .await?;
        Ok(entries.len())
    }

    /// Reads a single entry at base scope.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when the DN does not exist.
    pub async fn read_entry(
        &self,
        cluster_name: &str,
        dn: &str,
        attributes: Vec<String>,
        consistency: ReadConsistency,
    ) -> Result<DirectoryEntry> {
        let entries = self
            .search(
                cluster_name,
                dn,
                SearchScope::Base,
                "(objectClass=*)",
                attributes,
                consistency,
            )
            .await?;
        entries
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("entry `{dn}` not found")))
    }

    /// Reads the root DSE (operational attributes included) from the
    /// HEALTH-selected node.
    ///
    /// # Errors
    ///
    /// Propagates selection, pool and LDAP failures.
    pub async fn root_dse(&self, cluster_name: &str) -> Result<DirectoryEntry> {
        let cluster = self.registry.get(cluster_name)?;
        let (mut session, _node) = self.checkout(cluster, OperationClass::Health).await?;
        let result = session
            .session_mut()
            .search(
                "",
                SearchScope::Base,
                "(objectClass=*)",
                vec!["*".to_string(), "+".to_string()],
            )
            .await;
        let entries = self.finish(session, result).await?;
        entries
            .into_iter()
            .next()
            .ok_or_else(|| Error::Internal("server returned no root DSE".to_string()))
    }

    /// Starts a paged search on a READ-selected node.
    ///
    /// The returned iterator is single-use; call [`PagedSearch::close`] when
    /// leaving it early so the server-side cookie is abandoned and the
    /// session returns to the pool.
    ///
    /// # Errors
    ///
    /// Propagates selection and pool failures; page size 0 is rejected.
    pub async fn search_paged(
        &self,
        cluster_name: &str,
        params: PagedSearchParams,
    ) -> Result<PagedSearch> {
        if params.page_size == 0 {
            return Err(Error::BadRequest("page_size must be positive".to_string()));
        }
        let cluster = self.registry.get(cluster_name)?;
        let (session, node) = self.checkout(cluster, OperationClass::Read).await?;
        let page_size = params.page_size.min(MAX_PAGE_SIZE);
        debug!(
            cluster = cluster_name,
            node = %node.address(),
            page_size,
            "starting paged search"
        );
        Ok(PagedSearch {
            pool: Arc::clone(&self.pool),
            session: Some(session),
            base_dn: params.base_dn,
            scope: params.scope,
            filter: params.filter,
            attributes: params.attributes,
            page_size,
            max_pages: params.max_pages.max(1),
            cookie: Vec::new(),
            pages_fetched: 0,
            finished: false,
            size_estimate: None,
        })
    }

    /// Adds an entry on the write master.
    ///
    /// # Errors
    ///
    /// [`Error::ServiceUnavailable`] when the master is unreachable (writes
    /// never fail over); otherwise the mapped LDAP failure.
    pub async fn add(
        &self,
        cluster_name: &str,
        dn: &str,
        attributes: Vec<(String, Vec<String>)>,
    ) -> Result<()> {
        let cluster = self.registry.get(cluster_name)?;
        let (mut session, _node) = self.checkout(cluster, OperationClass::Write).await?;
        let result = session.session_mut().add(dn, attributes).await;
        self.finish(session, result).await
    }

    /// Modifies an entry on the write master.
    ///
    /// # Errors
    ///
    /// As for [`Self::add`]. A timed-out modify is reported but never
    /// retried here; modify is not idempotent in general.
    pub async fn modify(
        &self,
        cluster_name: &str,
        dn: &str,
        changes: Vec<AttributeChange>,
    ) -> Result<()> {
        let cluster = self.registry.get(cluster_name)?;
        let (mut session, _node) = self.checkout(cluster, OperationClass::Write).await?;
        let result = session.session_mut().modify(dn, changes).await;
        self.finish(session, result).await
    }

    /// Deletes an entry on the write master.
    ///
    /// # Errors
    ///
    /// As for [`Self::add`].
    pub async fn delete(&self, cluster_name: &str, dn: &str) -> Result<()> {
        let cluster = self.registry.get(cluster_name)?;
        let (mut session, _node) = self.checkout(cluster, OperationClass::Write).await?;
        let result = session.session_mut().delete(dn).await;
        self.finish(session, result).await
    }

    async fn checkout(
        &self,
        cluster: &ClusterConfig,
        class: OperationClass,
    ) -> Result<(PooledSession, Node)> {
        let node = self.selector.select(cluster, class).await?;
        let endpoint = LdapEndpoint::from_node(&node, cluster.tls.as_ref());
        let key = PoolKey {
            cluster: cluster.name.clone(),
            host: node.host.clone(),
            port: node.port,
            bind_dn: cluster.bind_dn.clone(),
        };
        let session = self
            .pool
            .acquire(key, &endpoint, self.provider.as_ref())
            .await?;
        Ok((session, node))
    }

    async fn finish<T>(&self, session: PooledSession, result: Result<T>) -> Result<T> {
        let healthy = match &result {
            Ok(_) => true,
            Err(err) => session_survives(err),
        };
        self.pool.release(session, healthy).await;
        result
    }
}

/// A rejected operation leaves the protocol session usable; a timeout or
/// transport failure does not.
pub(crate) const fn session_survives(err: &Error) -> bool {
    !matches!(
        err,
        Error::Timeout(_) | Error::ServiceUnavailable(_) | Error::Internal(_)
    )
}

/// Single-use lazy page iterator over one pooled session.
///
/// Owns the RFC 2696 cookie and the session that produced it; the cookie is
/// never replayed on another connection. Drain it with
/// [`PagedSearch::next_page`] or call [`PagedSearch::close`] on early exit.
pub struct PagedSearch {
    pool: Arc<SessionPool>,
    session: Option<PooledSession>,
    base_dn: String,
    scope: SearchScope,
    filter: String,
    attributes: Vec<String>,
    page_size: u32,
    max_pages: u32,
    cookie: Vec<u8>,
    pages_fetched: u32,
    finished: bool,
    size_estimate: Option<u32>,
}

impl std::fmt::Debug for PagedSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedSearch").finish_non_exhaustive()
    }
}

impl PagedSearch {
    /// Fetches the next page, or `None` once the enumeration is complete.
    ///
    /// # Errors
    ///
    /// A failed page releases the session (unhealthy on timeout/transport
    /// failure) and poisons the iterator.
    pub async fn next_page(&mut self) -> Result<Option<Vec<DirectoryEntry>>> {
        if self.finished {
            return Ok(None);
        }
        if self.pages_fetched >= self.max_pages {
            warn!(
                base_dn = %self.base_dn,
                max_pages = self.max_pages,
                "paged search reached its page bound"
            );
            self.abandon_cookie().await;
            self.finished = true;
            return Ok(None);
        }
        let Some(session) = self.session.as_mut() else {
            return Err(Error::Internal("paged search already closed".to_string()));
        };

        let request = PageRequest {
            base_dn: self.base_dn.clone(),
            scope: self.scope,
            filter: self.filter.clone(),
            attributes: self.attributes.clone(),
            page_size: self.page_size as i32,
            cookie: self.cookie.clone(),
        };
        match session.session_mut().search_page(request).await {
            Ok(page) => {
                self.pages_fetched += 1;
                self.absorb(&page);
                Ok(Some(page.entries))
            }
            Err(err) => {
                self.finished = true;
                let healthy = session_survives(&err);
                if let Some(session) = self.session.take() {
                    self.pool.release(session, healthy).await;
                }
                Err(err)
            }
        }
    }

    fn absorb(&mut self, page: &SearchPage) {
        if self.size_estimate.is_none() {
            self.size_estimate = page.size_estimate;
        }
        if !page.control_present {
            warn!(
                base_dn = %self.base_dn,
                "server did not honor the paged results control"
            );
            self.cookie.clear();
            self.finished = true;
            return;
        }
        self.cookie = page.cookie.clone();
        if self.cookie.is_empty() {
            self.finished = true;
        }
    }

    /// True while the server holds a continuation cookie.
    #[must_use]
    pub fn has_more(&self) -> bool {
        !self.finished
    }

    /// Server-reported total, when the first page carried an estimate.
    #[must_use]
    pub const fn size_estimate(&self) -> Option<u32> {
        self.size_estimate
    }

    /// Pages fetched so far.
    #[must_use]
    pub const fn pages_fetched(&self) -> u32 {
        self.pages_fetched
    }

    /// Abandons any outstanding cookie and returns the session to the pool.
    ///
    /// Mandatory on early exit; a fully drained iterator may also be closed
    /// for symmetry.
    pub async fn close(mut self) {
        let healthy = self.abandon_cookie().await;
        if let Some(session) = self.session.take() {
            self.pool.release(session, healthy).await;
        }
    }

    // Sends the zero-size page that tells the server to drop its cookie.
    async fn abandon_cookie(&mut self) -> bool {
        if self.finished || self.cookie.is_empty() {
            return true;
        }
        let Some(session) = self.session.as_mut() else {
            return true;
        };
        let request = PageRequest {
            base_dn: self.base_dn.clone(),
            scope: self.scope,
            filter: self.filter.clone(),
            attributes: self.attributes.clone(),
            page_size: 0,
            cookie: std::mem::take(&mut self.cookie),
        };
        match session.session_mut().search_page(request).await {
            Ok(_) => true,
            Err(err) => {
                debug!(error = %err, "failed to abandon pagination cookie");
                session_survives(&err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PasswordProvider;
    use crate::session::{LdapSession, MockLdapConnector, MockLdapSession};
    use async_trait::async_trait;
    use ldapgate_core::config::NodeConfig;
    use std::net::TcpListener;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct StaticProvider;

    #[async_trait]
    impl PasswordProvider for StaticProvider {
        async fn bind_password(&self, _cluster: &str) -> Result<String> {
            Ok("pw".to_string())
        }
    }

    fn listening_port() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn dead_port() -> u16 {
        let (listener, port) = listening_port();
        drop(listener);
        port
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

    fn gateway_with(connector: MockLdapConnector, config: ClusterConfig) -> LdapGateway {
        let connector: Arc<dyn LdapConnector> = Arc::new(connector);
        let registry = Arc::new(ClusterRegistry::new(vec![config]).unwrap());
        let selector = Arc::new(NodeSelector::with_probe_timeout(Duration::from_millis(
            250,
        )));
        let pool = Arc::new(SessionPool::new(
            Arc::clone(&connector),
            Duration::from_secs(60),
        ));
        LdapGateway::new(registry, selector, pool, connector, Arc::new(StaticProvider))
    }

    fn connector_yielding(sessions: Vec<MockLdapSession>) -> MockLdapConnector {
        let queue: StdMutex<Vec<MockLdapSession>> =
            StdMutex::new(sessions.into_iter().rev().collect());
        let mut connector = MockLdapConnector::new();
        connector.expect_connect().returning(move |_| {
            let session = queue
                .lock()
                .unwrap()
                .pop()
                .expect("unexpected extra connect");
            Ok(Box::new(session) as Box<dyn LdapSession>)
        });
        connector
    }

    fn bound_session() -> MockLdapSession {
        let mut session = MockLdapSession::new();
        session.expect_simple_bind().returning(|_, _| Ok(()));
        session.expect_unbind().returning(|| Ok(()));
        session
    }

    fn entry(dn: &str) -> DirectoryEntry {
        DirectoryEntry::new(dn)
    }

    #[tokio::test]
    async fn write_with_unreachable_master_opens_no_session() {
        let (_replica, replica_port) = listening_port();
        let mut connector = MockLdapConnector::new();
        connector.expect_connect().times(0);
        let gateway = gateway_with(connector, cluster(&[dead_port(), replica_port]));

        let err = gateway
            .add("prod", "cn=x,dc=x", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn mutations_route_to_master() {
        let (_master, master_port) = listening_port();
        let (_replica, replica_port) = listening_port();

        let mut session = bound_session();
        session
            .expect_add()
            .times(1)
            .returning(|_, _| Ok(()));

        let queue: StdMutex<Vec<MockLdapSession>> = StdMutex::new(vec![session]);
        let mut connector = MockLdapConnector::new();
        connector
            .expect_connect()
            .withf(move |endpoint| endpoint.port == master_port)
            .returning(move |_| {
                let session = queue.lock().unwrap().pop().expect("single connect");
                Ok(Box::new(session) as Box<dyn LdapSession>)
            });

        let gateway = gateway_with(connector, cluster(&[master_port, replica_port]));
        gateway
            .add(
                "prod",
                "cn=x,dc=x",
                vec![("cn".to_string(), vec!["x".to_string()])],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_cluster_is_not_found() {
        let connector = MockLdapConnector::new();
        let gateway = gateway_with(connector, cluster(&[389]));
        let err = gateway.delete("missing", "cn=x,dc=x").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn read_entry_maps_empty_result_to_not_found() {
        let (_node, port) = listening_port();
        let mut session = bound_session();
        session
            .expect_search()
            .times(1)
            .returning(|_, _, _, _| Ok(Vec::new()));
        let gateway = gateway_with(connector_yielding(vec![session]), cluster(&[port]));

        let err = gateway
            .read_entry(
                "prod",
                "cn=ghost,dc=x",
                vec!["cn".to_string()],
                ReadConsistency::Consistent,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn bind_test_surfaces_auth_failure_outside_pool() {
        let (_node, port) = listening_port();
        let mut session = MockLdapSession::new();
        session
            .expect_simple_bind()
            .times(1)
            .returning(|_, _| Err(Error::AuthFailed("invalid bind credentials".to_string())));
        session.expect_unbind().times(1).returning(|| Ok(()));
        let gateway = gateway_with(connector_yielding(vec![session]), cluster(&[port]));

        let err = gateway
            .bind_test("prod", "cn=admin,dc=x", "wrong")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthFailed(_)));
        // The pool saw nothing.
        assert_eq!(gateway.pool().stats().await.total_idle, 0);
    }

    #[tokio::test]
    async fn paged_search_yields_each_entry_exactly_once() {
        let (_node, port) = listening_port();
        let mut session = bound_session();

        // Five entries, page size two: three pages, the last without cookie.
        let pages = StdMutex::new(vec![
            SearchPage {
                entries: vec![entry("uid=e,dc=x")],
                cookie: Vec::new(),
                size_estimate: None,
                control_present: true,
            },
            SearchPage {
                entries: vec![entry("uid=c,dc=x"), entry("uid=d,dc=x")],
                cookie: b"c2".to_vec(),
                size_estimate: None,
                control_present: true,
            },
            SearchPage {
                entries: vec![entry("uid=a,dc=x"), entry("uid=b,dc=x")],
                cookie: b"c1".to_vec(),
                size_estimate: Some(5),
                control_present: true,
            },
        ]);
        session.expect_search_page().times(3).returning(move |req| {
            let mut pages = pages.lock().unwrap();
            // The cookie handed back must be the one we produced.
            if pages.len() == 2 {
                assert_eq!(req.cookie, b"c1".to_vec());
            } else if pages.len() == 1 {
                assert_eq!(req.cookie, b"c2".to_vec());
            } else {
                assert!(req.cookie.is_empty());
            }
            Ok(pages.pop().unwrap())
        });

        let gateway = gateway_with(connector_yielding(vec![session]), cluster(&[port]));
        let mut search = gateway
            .search_paged(
                "prod",
                PagedSearchParams {
                    base_dn: "dc=x".to_string(),
                    scope: SearchScope::Subtree,
                    filter: "(objectClass=*)".to_string(),
                    attributes: vec!["cn".to_string()],
                    page_size: 2,
                    max_pages: DEFAULT_MAX_PAGES,
                },
            )
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Some(page) = search.next_page().await.unwrap() {
            seen.extend(page.into_iter().map(|e| e.dn));
        }
        assert_eq!(search.pages_fetched(), 3);
        assert_eq!(search.size_estimate(), Some(5));
        assert_eq!(seen.len(), 5);
        let mut deduped = seen.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), 5, "duplicate entries in {seen:?}");
        assert!(!search.has_more());
        search.close().await;

        assert_eq!(gateway.pool().stats().await.total_idle, 1);
    }

    #[tokio::test]
    async fn early_close_abandons_cookie() {
        let (_node, port) = listening_port();
        let mut session = bound_session();

        let calls = StdMutex::new(0u32);
        session.expect_search_page().times(2).returning(move |req| {
            let mut calls = calls.lock().unwrap();
            *calls += 1;
            if *calls == 1 {
                Ok(SearchPage {
                    entries: vec![entry("uid=a,dc=x")],
                    cookie: b"c1".to_vec(),
                    size_estimate: None,
                    control_present: true,
                })
            } else {
                // The abandon round: zero size, previous cookie.
                assert_eq!(req.page_size, 0);
                assert_eq!(req.cookie, b"c1".to_vec());
                Ok(SearchPage {
                    entries: Vec::new(),
                    cookie: Vec::new(),
                    size_estimate: None,
                    control_present: true,
                })
            }
        });

        let gateway = gateway_with(connector_yielding(vec![session]), cluster(&[port]));
        let mut search = gateway
            .search_paged(
                "prod",
                PagedSearchParams {
                    base_dn: "dc=x".to_string(),
                    scope: SearchScope::Subtree,
                    filter: "(objectClass=*)".to_string(),
                    attributes: Vec::new(),
                    page_size: 1,
                    max_pages: DEFAULT_MAX_PAGES,
                },
            )
            .await
            .unwrap();

        let first = search.next_page().await.unwrap().unwrap();
        assert_eq!(first.len(), 1);
        assert!(search.has_more());
        search.close().await;

        assert_eq!(gateway.pool().stats().await.total_idle, 1);
    }

    #[tokio::test]
    async fn missing_control_terminates_with_warning() {
        let (_node, port) = listening_port();
        let mut session = bound_session();
        session.expect_search_page().times(1).returning(|_| {
            Ok(SearchPage {
                entries: vec![entry("uid=a,dc=x")],
                cookie: Vec::new(),
                size_estimate: None,
                control_present: false,
            })
        });

        let gateway = gateway_with(connector_yielding(vec![session]), cluster(&[port]));
        let mut search = gateway
            .search_paged(
                "prod",
                PagedSearchParams {
                    base_dn: "dc=x".to_string(),
                    scope: SearchScope::Subtree,
                    filter: "(objectClass=*)".to_string(),
                    attributes: Vec::new(),
                    page_size: 10,
                    max_pages: DEFAULT_MAX_PAGES,
                },
            )
            .await
            .unwrap();

        assert!(search.next_page().await.unwrap().is_some());
        assert!(!search.has_more());
        assert!(search.next_page().await.unwrap().is_none());
        search.close().await;
    }

    #[tokio::test]
    async fn timed_out_mutation_drops_the_session() {
        let (_node, port) = listening_port();
        let mut first = bound_session();
        first
            .expect_modify()
            .times(1)
            .returning(|_, _| Err(Error::Timeout("LDAP modify timed out".to_string())));
        let mut second = bound_session();
        second.expect_delete().times(1).returning(|_| Ok(()));

        let gateway = gateway_with(connector_yielding(vec![first, second]), cluster(&[port]));

        let err = gateway
            .modify(
                "prod",
                "cn=x,dc=x",
                vec![AttributeChange::Replace {
                    attribute: "cn".to_string(),
                    values: vec!["y".to_string()],
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(gateway.pool().stats().await.total_idle, 0);

        // The next acquire opens the second connection, proving the first
        // was discarded rather than parked.
        gateway.delete("prod", "cn=y,dc=x").await.unwrap();
        assert_eq!(gateway.pool().stats().await.total_idle, 1);
    }

    #[tokio::test]
    async fn rejected_mutation_keeps_the_session() {
        let (_node, port) = listening_port();
        let mut session = bound_session();
        session
            .expect_add()
            .times(1)
            .returning(|_, _| Err(Error::Conflict("entry already exists".to_string())));

        let gateway = gateway_with(connector_yielding(vec![session]), cluster(&[port]));
        let err = gateway.add("prod", "cn=x,dc=x", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(gateway.pool().stats().await.total_idle, 1);
    }

    #[tokio::test]
    async fn page_size_zero_is_rejected() {
        let connector = MockLdapConnector::new();
        let gateway = gateway_with(connector, cluster(&[389]));
        let err = gateway
            .search_paged(
                "prod",
                PagedSearchParams {
                    base_dn: "dc=x".to_string(),
                    scope: SearchScope::Subtree,
                    filter: "(objectClass=*)".to_string(),
                    attributes: Vec::new(),
                    page_size: 0,
                    max_pages: 1,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }
}
