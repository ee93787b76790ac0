//! LDAP session and connector abstractions.
//!
//! The traits keep the pool, gateway and monitor testable; the real
//! implementation drives `ldap3` with per-operation timeouts and maps LDAP
//! result codes onto the gateway error taxonomy.

use async_trait::async_trait;
use ldap3::controls::{Control, ControlType, PagedResults, RawControl};
use ldap3::{LdapConnAsync, LdapConnSettings, Mod, Scope, SearchEntry};
use ldapgate_core::config::{Node, TlsConfig};
use ldapgate_core::error::{Error, Result};
use ldapgate_core::types::DirectoryEntry;
use native_tls::{Certificate, TlsConnector};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::timeout;
use url::Url;

/// Search scope for LDAP queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    /// Base object only.
    Base,
    /// One level below the base.
    OneLevel,
    /// Entire subtree.
    Subtree,
}

impl From<SearchScope> for Scope {
    fn from(scope: SearchScope) -> Self {
        match scope {
            SearchScope::Base => Scope::Base,
            SearchScope::OneLevel => Scope::OneLevel,
            SearchScope::Subtree => Scope::Subtree,
        }
    }
}

/// A single attribute modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeChange {
    /// Add attribute values.
    Add {
        /// Attribute to modify.
        attribute: String,
        /// Values to add.
        values: Vec<String>,
    },
    /// Delete attribute values (empty removes the attribute).
    Delete {
        /// Attribute to modify.
        attribute: String,
        /// Values to delete.
        values: Vec<String>,
    },
    /// Replace attribute values.
    Replace {
        /// Attribute to modify.
        attribute: String,
        /// Replacement values.
        values: Vec<String>,
    },
}

/// One RFC 2696 page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Search base.
    pub base_dn: String,
    /// Search scope.
    pub scope: SearchScope,
    /// Composed filter (already escaped).
    pub filter: String,
    /// Attributes to return.
    pub attributes: Vec<String>,
    /// Requested page size; 0 abandons server-side pagination.
    pub page_size: i32,
    /// Opaque cookie from the previous page; empty on the first page.
    pub cookie: Vec<u8>,
}

/// One RFC 2696 page response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPage {
    /// Entries in server order.
    pub entries: Vec<DirectoryEntry>,
    /// Cookie for the next page; empty on the final page.
    pub cookie: Vec<u8>,
    /// Server size estimate, when reported on the first page.
    pub size_estimate: Option<u32>,
    /// Whether the response carried a paged-results control at all.
    pub control_present: bool,
}

/// One authenticated LDAP protocol session. Exclusive use only: the pool
/// checks sessions out, they are never shared concurrently.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait LdapSession: Send {
    /// Performs a simple bind.
    async fn simple_bind(&mut self, bind_dn: &str, password: &str) -> Result<()>;
    /// Runs an unpaged search.
    async fn search(
        &mut self,
        base_dn: &str,
        scope: SearchScope,
        filter: &str,
        attributes: Vec<String>,
    ) -> Result<Vec<DirectoryEntry>>;
    /// Fetches one page of a paged search. The cookie must have been
    /// produced by this session.
    async fn search_page(&mut self, request: PageRequest) -> Result<SearchPage>;
    /// Adds an entry.
    async fn add(&mut self, dn: &str, attributes: Vec<(String, Vec<String>)>) -> Result<()>;
    /// Applies attribute modifications to an entry.
    async fn modify(&mut self, dn: &str, changes: Vec<AttributeChange>) -> Result<()>;
    /// Deletes an entry.
    async fn delete(&mut self, dn: &str) -> Result<()>;
    /// Terminates the session.
    async fn unbind(&mut self) -> Result<()>;
}

/// TLS options applied when connecting to an `ldaps://` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointTls {
    /// Whether to verify the server certificate.
    pub verify: bool,
    /// Custom CA certificate path.
    pub ca_cert: Option<PathBuf>,
}

/// Network coordinates of one directory node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapEndpoint {
    /// Hostname or IP address.
    pub host: String,
    /// Port.
    pub port: u16,
    /// TLS options; `None` means plain `ldap://`.
    pub tls: Option<EndpointTls>,
}

impl LdapEndpoint {
    /// Builds an endpoint from a resolved node and the cluster TLS settings.
    #[must_use]
    pub fn from_node(node: &Node, tls: Option<&TlsConfig>) -> Self {
        Self {
            host: node.host.clone(),
            port: node.port,
            tls: tls.map(|t| EndpointTls {
                verify: t.verify,
                ca_cert: t.ca_cert.clone(),
            }),
        }
    }

    /// Renders the connection URL.
    #[must_use]
    pub fn url(&self) -> String {
        let scheme = if self.tls.is_some() { "ldaps" } else { "ldap" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

/// Opens authenticated protocol sessions against arbitrary endpoints.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait LdapConnector: Send + Sync {
    /// Opens a new, unauthenticated session to `endpoint`.
    async fn connect(&self, endpoint: &LdapEndpoint) -> Result<Box<dyn LdapSession>>;
}

/// Real connector backed by `ldap3`.
pub struct RealLdapConnector {
    net_timeout: Duration,
    op_timeout: Duration,
}

impl RealLdapConnector {
    /// Creates a connector with the given network and operation timeouts.
    #[must_use]
    pub const fn new(net_timeout: Duration, op_timeout: Duration) -> Self {
        Self {
            net_timeout,
            op_timeout,
        }
    }
}

#[async_trait]
impl LdapConnector for RealLdapConnector {
    async fn connect(&self, endpoint: &LdapEndpoint) -> Result<Box<dyn LdapSession>> {
        let url = endpoint.url();
        Url::parse(&url)
            .map_err(|err| Error::Internal(format!("invalid LDAP endpoint {url}: {err}")))?;

        let settings = build_settings(endpoint, self.net_timeout)?;
        let (conn, ldap) = LdapConnAsync::with_settings(settings, &url)
            .await
            .map_err(map_ldap_error)?;
        ldap3::drive!(conn);

        Ok(Box::new(RealLdapSession {
            inner: ldap,
            op_timeout: self.op_timeout,
        }))
    }
}

struct RealLdapSession {
    inner: ldap3::Ldap,
    op_timeout: Duration,
}

impl RealLdapSession {
    async fn bounded<T>(
        &self,
        what: &str,
        fut: impl std::future::Future<Output = ldap3::result::Result<T>> + Send,
    ) -> Result<T> {
        timeout(self.op_timeout, fut)
            .await
            .map_err(|_| Error::Timeout(format!("LDAP {what} timed out")))?
            .map_err(map_ldap_error)
    }
}

#[async_trait]
impl LdapSession for RealLdapSession {
    async fn simple_bind(&mut self, bind_dn: &str, password: &str) -> Result<()> {
        let mut ldap = self.inner.clone();
        let result = self
            .bounded("bind", ldap.simple_bind(bind_dn, password))
            .await?;
        ensure_success(result)
    }

    async fn search(
        &mut self,
        base_dn: &str,
        scope: SearchScope,
        filter: &str,
        attributes: Vec<String>,
    ) -> Result<Vec<DirectoryEntry>> {
        let mut ldap = self.inner.clone();
        let result = self
            .bounded("search", ldap.search(base_dn, scope.into(), filter, attributes))
            .await?;
        let (entries, _res) = result.success().map_err(map_ldap_error)?;
        Ok(entries.into_iter().map(construct_entry).collect())
    }

    async fn search_page(&mut self, request: PageRequest) -> Result<SearchPage> {
        let control: RawControl = PagedResults {
            size: request.page_size,
            cookie: request.cookie.clone(),
        }
        .into();

        let mut ldap = self.inner.clone();
        let result = self
            .bounded(
                "paged search",
                ldap.with_controls(control).search(
                    &request.base_dn,
                    request.scope.into(),
                    &request.filter,
                    request.attributes.clone(),
                ),
            )
            .await?;
        let (entries, res) = result.success().map_err(map_ldap_error)?;

        let mut page = SearchPage {
            entries: entries.into_iter().map(construct_entry).collect(),
            cookie: Vec::new(),
            size_estimate: None,
            control_present: false,
        };
        for ctrl in res.ctrls {
            if let Control(Some(ControlType::PagedResults), raw) = ctrl {
                let paged = raw.parse::<PagedResults>();
                page.control_present = true;
                page.cookie = paged.cookie;
                if paged.size > 0 {
                    page.size_estimate = Some(paged.size.unsigned_abs());
                }
            }
        }
        Ok(page)
    }

    async fn add(&mut self, dn: &str, attributes: Vec<(String, Vec<String>)>) -> Result<()> {
        let attrs: Vec<(String, HashSet<String>)> = attributes
            .into_iter()
            .map(|(attribute, values)| (attribute, values.into_iter().collect()))
            .collect();
        let mut ldap = self.inner.clone();
        let result = self.bounded("add", ldap.add(dn, attrs)).await?;
        ensure_success(result)
    }

    async fn modify(&mut self, dn: &str, changes: Vec<AttributeChange>) -> Result<()> {
        let mods: Vec<Mod<String>> = changes
            .into_iter()
            .map(|change| match change {
                AttributeChange::Add { attribute, values } => {
                    Mod::Add(attribute, values.into_iter().collect())
                }
                AttributeChange::Delete { attribute, values } => {
                    Mod::Delete(attribute, values.into_iter().collect())
                }
                AttributeChange::Replace { attribute, values } => {
                    Mod::Replace(attribute, values.into_iter().collect())
                }
            })
            .collect();
        let mut ldap = self.inner.clone();
        let result = self.bounded("modify", ldap.modify(dn, mods)).await?;
        ensure_success(result)
    }

    async fn delete(&mut self, dn: &str) -> Result<()> {
        let mut ldap = self.inner.clone();
        let result = self.bounded("delete", ldap.delete(dn)).await?;
        ensure_success(result)
    }

    async fn unbind(&mut self) -> Result<()> {
        let mut ldap = self.inner.clone();
        self.bounded("unbind", ldap.unbind()).await
    }
}

fn construct_entry(entry: ldap3::ResultEntry) -> DirectoryEntry {
    let constructed = SearchEntry::construct(entry);
    DirectoryEntry {
        dn: constructed.dn,
        attributes: constructed.attrs,
    }
}

fn build_settings(endpoint: &LdapEndpoint, net_timeout: Duration) -> Result<LdapConnSettings> {
    let mut settings = LdapConnSettings::new().set_conn_timeout(net_timeout);

    if let Some(tls) = &endpoint.tls {
        if !tls.verify {
            let connector = TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .build()
                .map_err(|err| {
                    Error::ConfigError(format!("failed to construct TLS connector: {err}"))
                })?;
            settings = settings.set_connector(connector).set_no_tls_verify(true);
        } else if let Some(ca_path) = &tls.ca_cert {
            let pem = fs::read(ca_path).map_err(|err| {
                Error::ConfigError(format!(
                    "failed to read CA certificate {}: {err}",
                    ca_path.display()
                ))
            })?;
            let certificate = Certificate::from_pem(&pem)
                .map_err(|err| Error::ConfigError(format!("invalid CA certificate: {err}")))?;
            let connector = TlsConnector::builder()
                .add_root_certificate(certificate)
                .build()
                .map_err(|err| {
                    Error::ConfigError(format!("failed to load CA certificate: {err}"))
                })?;
            settings = settings.set_connector(connector);
        }
    }

    Ok(settings)
}

fn ensure_success(result: ldap3::LdapResult) -> Result<()> {
    result.success().map_err(map_ldap_error).map(|_| ())
}

pub(crate) fn map_ldap_error(err: ldap3::LdapError) -> Error {
    match err {
        ldap3::LdapError::LdapResult { result } => map_result_code(result.rc, &result.text),
        ldap3::LdapError::Io { source } => {
            Error::ServiceUnavailable(format!("LDAP connection failed: {source}"))
        }
        other => Error::Internal(format!("LDAP protocol error: {other}")),
    }
}

/// Maps an LDAP result code onto the gateway error taxonomy. The server's
/// diagnostic text is folded into the message, never surfaced verbatim to
/// clients.
pub(crate) fn map_result_code(rc: u32, text: &str) -> Error {
    match rc {
        3 => Error::Timeout("server time limit exceeded".to_string()),
        16 => Error::NotFound(format!("no such attribute: {text}")),
        32 => Error::NotFound(format!("no such object: {text}")),
        49 => Error::AuthFailed("invalid bind credentials".to_string()),
        50 => Error::Forbidden(format!("insufficient access rights: {text}")),
        51 | 52 => Error::ServiceUnavailable(format!("server busy or unavailable: {text}")),
        19 | 21 | 53 | 64 | 65 | 67 => {
            Error::Unprocessable(format!("schema violation (rc={rc}): {text}"))
        }
        20 => Error::Conflict(format!("attribute value already exists: {text}")),
        68 => Error::Conflict(format!("entry already exists: {text}")),
        _ => Error::Internal(format!("LDAP error rc={rc}: {text}")),
    }
}
