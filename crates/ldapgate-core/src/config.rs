//! Cluster topology and per-cluster policy configuration.
//!
//! The YAML loader lives outside the core; this module defines the typed,
//! validated model it must produce. Validation failures are fatal at
//! startup: the gateway never starts against a degraded configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use validator::Validate;

/// Default LDAP port used when a single-node cluster omits one.
pub const DEFAULT_LDAP_PORT: u16 = 389;

/// Default attributes searched when a listing query is supplied.
pub const DEFAULT_SEARCH_ATTRIBUTES: &[&str] = &["uid", "cn", "mail", "sn"];

fn default_search_attributes() -> Vec<String> {
    DEFAULT_SEARCH_ATTRIBUTES
        .iter()
        .map(ToString::to_string)
        .collect()
}

const fn default_true() -> bool {
    true
}

/// A single directory node within a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct NodeConfig {
    /// Hostname or IP address.
    #[validate(length(min = 1))]
    pub host: String,
    /// LDAP port (1-65535).
    #[validate(range(min = 1))]
    pub port: u16,
    /// Optional display name for monitoring output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl NodeConfig {
    /// Label used in monitoring output: the configured name, or `host:port`.
    #[must_use]
    pub fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.host, self.port))
    }
}

/// A resolved node with its positional index (0 = master).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Node {
    /// Hostname or IP address.
    pub host: String,
    /// LDAP port.
    pub port: u16,
    /// Display label.
    pub label: String,
    /// Declared position; index 0 is the designated write target.
    pub index: usize,
}

impl Node {
    /// Returns `host:port`.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Field types accepted in declarative user-creation forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// Free text.
    Text,
    /// Email address.
    Email,
    /// Password input.
    Password,
    /// Numeric input.
    Number,
    /// Choice from a fixed option list.
    Select,
    /// Boolean flag.
    Checkbox,
}

/// One field of the declarative user-creation form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct FormField {
    /// Attribute name the field maps to.
    #[validate(length(min = 1))]
    pub name: String,
    /// Human-readable label.
    #[validate(length(min = 1))]
    pub label: String,
    /// Input type.
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Whether the field must be supplied.
    #[serde(default)]
    pub required: bool,
    /// Static default value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Auto-generation directive (`next_uid`, `days_since_epoch`, or a
    /// `${field}` template).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_generate: Option<String>,
    /// Options for `select` fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    /// Placeholder text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    /// Help text shown next to the field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_text: Option<String>,
}

/// Declarative user-creation form for a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct UserCreationForm {
    /// Subtree new users are created under; defaults to the cluster base.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_ou: Option<String>,
    /// Ordered field list.
    #[validate(nested)]
    pub fields: Vec<FormField>,
}

/// One column of a per-view entry table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct TableColumn {
    /// Attribute rendered in the column.
    #[validate(length(min = 1))]
    pub attribute: String,
    /// Column header.
    #[validate(length(min = 1))]
    pub label: String,
    /// Whether the column is shown by default.
    #[serde(default = "default_true")]
    pub visible: bool,
    /// Whether the column is sortable.
    #[serde(default = "default_true")]
    pub sortable: bool,
}

/// Password policy advertised to the form layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordPolicy {
    /// Minimum password length; 0 disables the check.
    #[serde(default)]
    pub min_length: u32,
    /// Whether the form must ask for the password twice.
    #[serde(default = "default_true")]
    pub require_confirmation: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: 0,
            require_confirmation: true,
        }
    }
}

/// TLS options for `ldaps://` clusters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Whether to verify the server certificate.
    #[serde(default = "default_true")]
    pub verify: bool,
    /// Custom CA certificate path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,
}

/// Configuration for one directory cluster.
///
/// Exactly one of `host` or `nodes` must be set. Node order carries
/// semantic weight: index 0 is the write master, reads prefer the tail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ClusterConfig {
    /// Unique cluster identifier.
    #[validate(length(min = 1))]
    pub name: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Single-node host (mutually exclusive with `nodes`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Single-node port; defaults to 389 when `host` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Ordered multi-master node list (mutually exclusive with `host`).
    #[serde(default)]
    #[validate(nested)]
    pub nodes: Vec<NodeConfig>,

    /// Administrative bind identity.
    #[validate(length(min = 1))]
    pub bind_dn: String,
    /// Directory base DN.
    #[validate(length(min = 1))]
    pub base_dn: String,

    /// When true, all WRITE-class operations are rejected.
    #[serde(default)]
    pub readonly: bool,

    /// Declarative user-creation form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub user_creation_form: Option<UserCreationForm>,
    /// Per-view column descriptors; keys must be `users`, `groups` or `ous`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_columns: Option<HashMap<String, Vec<TableColumn>>>,
    /// Password policy; defaults apply when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_policy: Option<PasswordPolicy>,
    /// Attributes searched when a listing query is supplied.
    #[serde(default = "default_search_attributes")]
    pub search_attributes: Vec<String>,
    /// Optional TLS settings; presence switches the cluster to `ldaps://`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

impl ClusterConfig {
    /// Returns the resolved, ordered node list. Index 0 is the master.
    #[must_use]
    pub fn resolved_nodes(&self) -> Vec<Node> {
        if let Some(host) = &self.host {
            let port = self.port.unwrap_or(DEFAULT_LDAP_PORT);
            return vec![Node {
                host: host.clone(),
                port,
                label: format!("{host}:{port}"),
                index: 0,
            }];
        }

        self.nodes
            .iter()
            .enumerate()
            .map(|(index, node)| Node {
                host: node.host.clone(),
                port: node.port,
                label: node.label(),
                index,
            })
            .collect()
    }

    /// Returns the designated write node (index 0).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if the cluster has no nodes, which the
    /// validator rules out for loaded configurations.
    pub fn write_node(&self) -> Result<Node> {
        self.resolved_nodes()
            .into_iter()
            .next()
            .ok_or_else(|| Error::ConfigError(format!("cluster `{}` has no nodes", self.name)))
    }

    /// Returns the effective password policy.
    #[must_use]
    pub fn effective_password_policy(&self) -> PasswordPolicy {
        self.password_policy.clone().unwrap_or_default()
    }

    /// Subtree user entries are created under.
    #[must_use]
    pub fn user_base(&self) -> &str {
        self.user_creation_form
            .as_ref()
            .and_then(|form| form.base_ou.as_deref())
            .unwrap_or(&self.base_dn)
    }

    /// Validates invariants the derive-based checks cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] describing the first violated invariant.
    pub fn validate_topology(&self) -> Result<()> {
        self.validate()
            .map_err(|err| Error::ConfigError(format!("cluster `{}`: {err}", self.name)))?;

        let has_host = self.host.as_ref().is_some_and(|h| !h.trim().is_empty());
        let has_nodes = !self.nodes.is_empty();
        if has_host && has_nodes {
            return Err(Error::ConfigError(format!(
                "cluster `{}`: specify either `host` or `nodes`, not both",
                self.name
            )));
        }
        if !has_host && !has_nodes {
            return Err(Error::ConfigError(format!(
                "cluster `{}`: one of `host` or `nodes` is required",
                self.name
            )));
        }
        if self.port == Some(0) {
            return Err(Error::ConfigError(format!(
                "cluster `{}`: port must be in 1..=65535",
                self.name
            )));
        }

        if let Some(columns) = &self.table_columns {
            for key in columns.keys() {
                if !matches!(key.as_str(), "users" | "groups" | "ous") {
                    return Err(Error::ConfigError(format!(
                        "cluster `{}`: invalid table_columns key `{key}`",
                        self.name
                    )));
                }
            }
        }

        if let Some(form) = &self.user_creation_form {
            for field in &form.fields {
                let has_options = field.options.as_ref().is_some_and(|o| !o.is_empty());
                if field.field_type == FieldType::Select && !has_options {
                    return Err(Error::ConfigError(format!(
                        "cluster `{}`: select field `{}` requires options",
                        self.name, field.name
                    )));
                }
                if field.field_type != FieldType::Select && field.options.is_some() {
                    return Err(Error::ConfigError(format!(
                        "cluster `{}`: field `{}` carries options but is not a select",
                        self.name, field.name
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Serializable cluster summary for the listing endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSummary {
    /// Cluster identifier.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Node addresses in declared order.
    pub nodes: Vec<String>,
    /// Directory base DN.
    pub base_dn: String,
    /// Administrative bind identity.
    pub bind_dn: String,
    /// Whether the cluster rejects writes.
    pub readonly: bool,
}

impl From<&ClusterConfig> for ClusterSummary {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            name: config.name.clone(),
            description: config.description.clone().unwrap_or_default(),
            nodes: config
                .resolved_nodes()
                .iter()
                .map(Node::address)
                .collect(),
            base_dn: config.base_dn.clone(),
            bind_dn: config.bind_dn.clone(),
            readonly: config.readonly,
        }
    }
}

/// Validated, immutable registry of cluster configurations.
///
/// Constructed once at startup (or on explicit reload); in-flight operations
/// hold it behind an `Arc` so a reload never mutates what they observe.
#[derive(Debug, Clone)]
pub struct ClusterRegistry {
    clusters: Vec<ClusterConfig>,
}

impl ClusterRegistry {
    /// Validates and indexes the supplied cluster list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] on any violated invariant, including
    /// duplicate cluster names. The process must not start on failure.
    pub fn new(clusters: Vec<ClusterConfig>) -> Result<Self> {
        let mut seen = HashSet::new();
        for cluster in &clusters {
            cluster.validate_topology()?;
            if !seen.insert(cluster.name.trim().to_string()) {
                return Err(Error::ConfigError(format!(
                    "duplicate cluster name `{}`",
                    cluster.name
                )));
            }
        }
        Ok(Self { clusters })
    }

    /// Looks up a cluster by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown names.
    pub fn get(&self, name: &str) -> Result<&ClusterConfig> {
        self.clusters
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| Error::NotFound(format!("cluster `{name}` not found")))
    }

    /// Returns all configured clusters in declaration order.
    #[must_use]
    pub fn clusters(&self) -> &[ClusterConfig] {
        &self.clusters
    }

    /// Returns serializable summaries for every cluster.
    #[must_use]
    pub fn summaries(&self) -> Vec<ClusterSummary> {
        self.clusters.iter().map(ClusterSummary::from).collect()
    }

    /// Number of configured clusters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    /// Returns true if no clusters are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}
