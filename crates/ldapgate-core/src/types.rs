//! Core domain types shared across the gateway crates.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Classification of a directory operation, used for node selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationClass {
    /// Searches, counts and stats; load is spread away from the master.
    Read,
    /// Create, update and delete; always routed to the master.
    Write,
    /// Health checks and monitoring.
    Health,
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
            Self::Health => f.write_str("health"),
        }
    }
}

/// Canonical entry views exposed by the directory service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum View {
    /// Person-like entries.
    Users,
    /// Group entries.
    Groups,
    /// Organizational units.
    Ous,
    /// Every entry under the base.
    All,
}

impl View {
    /// Returns the canonical base LDAP filter for this view.
    #[must_use]
    pub const fn base_filter(&self) -> &'static str {
        match self {
            Self::Users => {
                "(|(objectClass=inetOrgPerson)(objectClass=posixAccount)(objectClass=account))"
            }
            Self::Groups => {
                "(|(objectClass=groupOfNames)(objectClass=groupOfUniqueNames)(objectClass=posixGroup))"
            }
            Self::Ous => "(objectClass=organizationalUnit)",
            Self::All => "(objectClass=*)",
        }
    }

    /// Canonical lowercase name of the view.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Groups => "groups",
            Self::Ous => "ous",
            Self::All => "all",
        }
    }
}

impl FromStr for View {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "users" => Ok(Self::Users),
            "groups" => Ok(Self::Groups),
            "ous" => Ok(Self::Ous),
            "all" => Ok(Self::All),
            other => Err(Error::BadRequest(format!("unknown view `{other}`"))),
        }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An LDAP entry: distinguished name plus attribute map.
///
/// Values are UTF-8 strings; multi-valued attributes preserve the order
/// returned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    /// Distinguished name of the entry.
    pub dn: String,
    /// Attribute map (value order as returned by the server).
    pub attributes: HashMap<String, Vec<String>>,
}

impl DirectoryEntry {
    /// Creates an entry with an empty attribute map.
    #[must_use]
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: HashMap::new(),
        }
    }

    /// Returns the first value of the attribute if present.
    #[must_use]
    pub fn first(&self, attribute: &str) -> Option<&str> {
        self.attributes
            .get(attribute)
            .and_then(|values| values.first().map(String::as_str))
    }

    /// Returns all values for the attribute.
    #[must_use]
    pub fn values(&self, attribute: &str) -> Option<&[String]> {
        self.attributes.get(attribute).map(Vec::as_slice)
    }

    /// Returns true if any value of `attribute` equals `value`
    /// case-insensitively.
    #[must_use]
    pub fn has_value(&self, attribute: &str, value: &str) -> bool {
        self.values(attribute)
            .is_some_and(|values| values.iter().any(|v| v.eq_ignore_ascii_case(value)))
    }
}

/// One page of a paginated listing.
#[derive(Debug, Clone, Serialize)]
pub struct EntryPage {
    /// Entries on the requested page.
    pub entries: Vec<DirectoryEntry>,
    /// The 1-based page number that was requested.
    pub page: u32,
    /// Requested page size.
    pub page_size: u32,
    /// Server-reported total when available, otherwise the highest observed
    /// lower bound.
    pub total: u32,
    /// True iff the pagination cookie was non-empty after this page.
    pub has_more: bool,
}
