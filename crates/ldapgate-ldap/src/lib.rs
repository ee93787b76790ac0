//! # ldapgate-ldap
//!
//! LDAP plumbing for the directory gateway: distinguished names, RFC 4515
//! filter safety, session/connector abstractions over `ldap3`, node
//! selection for multi-master clusters, the authenticated session pool and
//! the typed gateway with RFC 2696 paged search.

#![deny(missing_docs)]

pub mod dn;
pub mod filter;
pub mod gateway;
pub mod pool;
pub mod selector;
pub mod session;

pub use dn::{Dn, DnError};
pub use gateway::{
    LdapGateway, PagedSearch, PagedSearchParams, ReadConsistency, DEFAULT_MAX_PAGES,
    MAX_PAGE_SIZE,
};
pub use pool::{PasswordProvider, PoolKey, PoolStats, PooledSession, SessionPool, DEFAULT_IDLE_TTL};
pub use selector::{NodeSelector, DEFAULT_PROBE_TIMEOUT};
pub use session::{
    AttributeChange, LdapConnector, LdapEndpoint, LdapSession, PageRequest, RealLdapConnector,
    SearchPage, SearchScope,
};

#[cfg(any(test, feature = "testing"))]
pub use session::{MockLdapConnector, MockLdapSession};

/// Convenient result alias reusing the core error type.
pub type Result<T> = ldapgate_core::Result<T>;
