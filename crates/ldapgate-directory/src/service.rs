//! Use-case layer over the LDAP gateway: stats, paginated listing, CRUD
//! with declarative auto-generation, and group-membership transactions.

use crate::autogen;
use ldapgate_core::config::{
    ClusterConfig, ClusterRegistry, ClusterSummary, PasswordPolicy, TableColumn, UserCreationForm,
};
use ldapgate_core::error::{Error, Result};
use ldapgate_core::types::{DirectoryEntry, EntryPage, View};
use ldapgate_ldap::{
    filter, AttributeChange, Dn, LdapGateway, PagedSearchParams, ReadConsistency, SearchScope,
};
use ldapgate_vault::{CredentialStatus, CredentialVault};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How many times a `next_uid` allocation is retried after a server-side
/// collision.
const UID_ALLOCATION_RETRIES: usize = 3;

/// Entry counts per view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryStats {
    /// All entries beneath the base.
    pub total: usize,
    /// Entries matching the users view.
    pub users: usize,
    /// Entries matching the groups view.
    pub groups: usize,
    /// Organizational units.
    pub ous: usize,
    /// Everything else.
    pub other: usize,
}

/// A group as seen by the membership operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupInfo {
    /// Group distinguished name.
    pub dn: String,
    /// Group name (`cn`).
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Object classes of the group entry.
    pub object_classes: Vec<String>,
}

impl GroupInfo {
    fn from_entry(entry: &DirectoryEntry) -> Self {
        Self {
            dn: entry.dn.clone(),
            name: entry.first("cn").unwrap_or_default().to_string(),
            description: entry.first("description").map(ToString::to_string),
            object_classes: entry
                .values("objectClass")
                .map(<[String]>::to_vec)
                .unwrap_or_default(),
        }
    }

    /// The membership attribute implied by the group's object class.
    #[must_use]
    pub fn member_attribute(&self) -> &'static str {
        if self.has_class("groupOfUniqueNames") {
            "uniqueMember"
        } else if self.has_class("posixGroup") {
            "memberUid"
        } else {
            "member"
        }
    }

    /// The membership value for `user_dn`: the DN itself, or the bare uid
    /// for posix groups.
    #[must_use]
    pub fn member_value(&self, user_dn: &str) -> String {
        if self.has_class("posixGroup") {
            if let Ok(dn) = Dn::parse(user_dn) {
                if let Some(uid) = dn.get("uid") {
                    return uid.to_string();
                }
            }
        }
        user_dn.to_string()
    }

    fn has_class(&self, class: &str) -> bool {
        self.object_classes
            .iter()
            .any(|c| c.eq_ignore_ascii_case(class))
    }
}

/// Outcome of a group-membership transaction.
///
/// The transaction is explicitly non-atomic: successful modifications are
/// never rolled back, callers retry the failing subset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum MembershipOutcome {
    /// Every modification applied.
    Success {
        /// Groups the user was added to.
        added: usize,
        /// Groups the user was removed from.
        removed: usize,
    },
    /// Some modifications failed.
    Partial {
        /// Groups the user was added to.
        added: usize,
        /// Groups the user was removed from.
        removed: usize,
        /// One message per failed modification.
        errors: Vec<String>,
    },
}

/// Cluster health probe result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterHealth {
    /// `healthy`, `warning` or `error`.
    pub status: String,
    /// Human-readable detail.
    pub message: String,
}

/// The directory service facade the HTTP surface talks to.
pub struct DirectoryService {
    registry: Arc<ClusterRegistry>,
    gateway: Arc<LdapGateway>,
    vault: Arc<CredentialVault>,
    // Serializes next_uid allocation per cluster for the read + add window.
    uid_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl DirectoryService {
    /// Wires the service from its collaborators.
    #[must_use]
    pub fn new(
        registry: Arc<ClusterRegistry>,
        gateway: Arc<LdapGateway>,
        vault: Arc<CredentialVault>,
    ) -> Self {
        Self {
            registry,
            gateway,
            vault,
            uid_locks: StdMutex::new(HashMap::new()),
        }
    }

    // ---- declarative descriptors -------------------------------------

    /// Summaries of every configured cluster.
    #[must_use]
    pub fn cluster_summaries(&self) -> Vec<ClusterSummary> {
        self.registry.summaries()
    }

    /// The declarative user-creation form of a cluster.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for unknown clusters or clusters without a form.
    pub fn form_descriptor(&self, cluster_name: &str) -> Result<UserCreationForm> {
        let cluster = self.registry.get(cluster_name)?;
        cluster.user_creation_form.clone().ok_or_else(|| {
            Error::NotFound(format!(
                "no user creation form configured for `{cluster_name}`"
            ))
        })
    }

    /// Per-view table columns of a cluster; empty when not configured.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for unknown clusters.
    pub fn table_columns(&self, cluster_name: &str) -> Result<HashMap<String, Vec<TableColumn>>> {
        let cluster = self.registry.get(cluster_name)?;
        Ok(cluster.table_columns.clone().unwrap_or_default())
    }

    /// Effective password policy of a cluster.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for unknown clusters.
    pub fn password_policy(&self, cluster_name: &str) -> Result<PasswordPolicy> {
        Ok(self.registry.get(cluster_name)?.effective_password_policy())
    }

    // ---- credentials -------------------------------------------------

    /// Validates the supplied password against the cluster and caches it in
    /// the vault on success.
    ///
    /// # Errors
    ///
    /// [`Error::AuthFailed`] on a rejected bind,
    /// [`Error::ServiceUnavailable`] when the node cannot be reached.
    pub async fn connect(&self, cluster_name: &str, password: &str) -> Result<()> {
        let cluster = self.registry.get(cluster_name)?;
        self.gateway
            .bind_test(cluster_name, &cluster.bind_dn, password)
            .await?;
        self.vault.store(cluster_name, password)?;
        info!(cluster = cluster_name, "credential validated and cached");
        Ok(())
    }

    /// Reports whether a credential is cached, without decrypting it.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for unknown clusters.
    pub fn credential_status(&self, cluster_name: &str) -> Result<CredentialStatus> {
        self.registry.get(cluster_name)?;
        Ok(self.vault.status(cluster_name))
    }

    /// Clears the cached credential.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for unknown clusters, [`Error::Storage`] when the
    /// record cannot be removed.
    pub fn clear_credential(&self, cluster_name: &str) -> Result<()> {
        self.registry.get(cluster_name)?;
        self.vault.clear(cluster_name)
    }

    /// Bind-and-read-rootDSE health probe.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for unknown clusters; connectivity problems are
    /// folded into the returned status rather than propagated.
    pub async fn health(&self, cluster_name: &str) -> Result<ClusterHealth> {
        let cluster = self.registry.get(cluster_name)?;
        if !self.vault.present(cluster_name) {
            return Ok(ClusterHealth {
                status: "warning".to_string(),
                message: "password not configured; connect to cache a credential".to_string(),
            });
        }

        let master = cluster.write_node()?;
        match self.gateway.root_dse(cluster_name).await {
            Ok(_) => Ok(ClusterHealth {
                status: "healthy".to_string(),
                message: format!("successfully connected to {}", master.address()),
            }),
            Err(err) => Ok(ClusterHealth {
                status: "error".to_string(),
                message: err.to_string(),
            }),
        }
    }

    // ---- reads -------------------------------------------------------

    /// Entry counts per view.
    ///
    /// # Errors
    ///
    /// Propagates selection, pool and LDAP failures.
    pub async fn stats(&self, cluster_name: &str) -> Result<EntryStats> {
        let cluster = self.registry.get(cluster_name)?;
        let base = cluster.base_dn.clone();

        let total = self
            .gateway
            .count(cluster_name, &base, View::All.base_filter(), ReadConsistency::Eventual)
            .await?;
        let users = self
            .gateway
            .count(cluster_name, &base, View::Users.base_filter(), ReadConsistency::Eventual)
            .await?;
        let groups = self
            .gateway
            .count(cluster_name, &base, View::Groups.base_filter(), ReadConsistency::Eventual)
            .await?;
        let ous = self
            .gateway
            .count(cluster_name, &base, View::Ous.base_filter(), ReadConsistency::Eventual)
            .await?;

        Ok(EntryStats {
            total,
            users,
            groups,
            ous,
            other: total.saturating_sub(users + groups + ous),
        })
    }

    /// One page of a view listing, optionally narrowed by a search query.
    ///
    /// LDAP pagination has no random access; pages before the requested one
    /// are walked (and counted) on the same session.
    ///
    /// # Errors
    ///
    /// [`Error::BadRequest`] for page or page size 0; otherwise selection,
    /// pool and LDAP failures.
    pub async fn list(
        &self,
        cluster_name: &str,
        view: View,
        page: u32,
        page_size: u32,
        query: Option<&str>,
    ) -> Result<EntryPage> {
        if page == 0 || page_size == 0 {
            return Err(Error::BadRequest(
                "page and page_size must be positive".to_string(),
            ));
        }
        let cluster = self.registry.get(cluster_name)?;
        let ldap_filter = compose_view_filter(cluster, view, query);

        let mut search = self
            .gateway
            .search_paged(
                cluster_name,
                PagedSearchParams {
                    base_dn: cluster.base_dn.clone(),
                    scope: SearchScope::Subtree,
                    filter: ldap_filter,
                    // All user attributes plus operational ones.
                    attributes: vec!["*".to_string(), "+".to_string()],
                    page_size,
                    max_pages: page,
                },
            )
            .await?;

        let mut entries = Vec::new();
        let mut walked: u32 = 0;
        let mut current = 1;
        loop {
            match search.next_page().await {
                Ok(Some(batch)) => {
                    walked += u32::try_from(batch.len()).unwrap_or(u32::MAX);
                    if current == page {
                        entries = batch;
                        break;
                    }
                    current += 1;
                }
                Ok(None) => break,
                Err(err) => return Err(err),
            }
        }

        let has_more = search.has_more();
        let total = search
            .size_estimate()
            .unwrap_or(walked + u32::from(has_more));
        search.close().await;

        Ok(EntryPage {
            entries,
            page,
            page_size,
            total,
            has_more,
        })
    }

    /// All groups of the cluster.
    ///
    /// # Errors
    ///
    /// Propagates selection, pool and LDAP failures.
    pub async fn list_groups(&self, cluster_name: &str) -> Result<Vec<GroupInfo>> {
        let cluster = self.registry.get(cluster_name)?;
        let entries = self
            .gateway
            .search(
                cluster_name,
                &cluster.base_dn,
                SearchScope::Subtree,
                View::Groups.base_filter(),
                group_attributes(),
                ReadConsistency::Eventual,
            )
            .await?;
        Ok(entries.iter().map(GroupInfo::from_entry).collect())
    }

    /// Groups the user currently belongs to.
    ///
    /// # Errors
    ///
    /// Propagates selection, pool and LDAP failures.
    pub async fn user_groups(&self, cluster_name: &str, user_dn: &str) -> Result<Vec<GroupInfo>> {
        self.user_groups_with(cluster_name, user_dn, ReadConsistency::Eventual)
            .await
    }

    async fn user_groups_with(
        &self,
        cluster_name: &str,
        user_dn: &str,
        consistency: ReadConsistency,
    ) -> Result<Vec<GroupInfo>> {
        let cluster = self.registry.get(cluster_name)?;
        let mut clauses = vec![
            filter::equals("member", user_dn),
            filter::equals("uniqueMember", user_dn),
            filter::equals("memberUid", user_dn),
        ];
        if let Ok(dn) = Dn::parse(user_dn) {
            if let Some(uid) = dn.get("uid") {
                clauses.push(filter::equals("memberUid", uid));
            }
        }
        let membership = filter::or(&clauses);

        let entries = self
            .gateway
            .search(
                cluster_name,
                &cluster.base_dn,
                SearchScope::Subtree,
                &membership,
                group_attributes(),
                consistency,
            )
            .await?;
        Ok(entries.iter().map(GroupInfo::from_entry).collect())
    }

    // ---- writes ------------------------------------------------------

    /// Creates an entry, resolving declarative placeholders first.
    ///
    /// # Errors
    ///
    /// [`Error::Forbidden`] on read-only clusters, [`Error::BadRequest`] on
    /// unresolvable placeholders, [`Error::Conflict`] when uid allocation
    /// keeps colliding; otherwise the mapped LDAP failure.
    pub async fn create(
        &self,
        cluster_name: &str,
        dn: &str,
        mut attributes: HashMap<String, Vec<String>>,
    ) -> Result<()> {
        let cluster = self.registry.get(cluster_name)?.clone();
        self.ensure_writable(&cluster)?;
        let request_id = Uuid::new_v4();

        let wants_next_uid = self.resolve_static_placeholders(&cluster, &mut attributes)?;

        let outcome = if wants_next_uid.is_empty() {
            self.add_entry(cluster_name, dn, &attributes).await
        } else {
            self.create_with_uid_allocation(&cluster, dn, attributes, &wants_next_uid)
                .await
        };

        match &outcome {
            Ok(()) => info!(
                cluster = cluster_name,
                dn,
                operation = "CREATE",
                outcome = "success",
                request_id = %request_id,
                "directory entry created"
            ),
            Err(err) => info!(
                cluster = cluster_name,
                dn,
                operation = "CREATE",
                outcome = %err.error_code(),
                request_id = %request_id,
                "directory entry creation failed"
            ),
        }
        outcome
    }

    /// Replaces attributes on an entry.
    ///
    /// A password change on a `shadowAccount` entry also refreshes
    /// `shadowLastChange`.
    ///
    /// # Errors
    ///
    /// [`Error::Forbidden`] on read-only clusters; otherwise the mapped
    /// LDAP failure.
    pub async fn update(
        &self,
        cluster_name: &str,
        dn: &str,
        mut modifications: HashMap<String, Vec<String>>,
    ) -> Result<()> {
        let cluster = self.registry.get(cluster_name)?.clone();
        self.ensure_writable(&cluster)?;
        let request_id = Uuid::new_v4();

        if modifications.contains_key("userPassword") {
            match self
                .gateway
                .read_entry(
                    cluster_name,
                    dn,
                    vec!["objectClass".to_string()],
                    ReadConsistency::Consistent,
                )
                .await
            {
                Ok(entry) if entry.has_value("objectClass", "shadowAccount") => {
                    modifications.insert(
                        "shadowLastChange".to_string(),
                        vec![autogen::days_since_epoch().to_string()],
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(cluster = cluster_name, dn, error = %err, "skipping shadowLastChange refresh");
                }
            }
        }

        let changes: Vec<AttributeChange> = modifications
            .into_iter()
            .map(|(attribute, values)| AttributeChange::Replace { attribute, values })
            .collect();

        let outcome = self.gateway.modify(cluster_name, dn, changes).await;
        match &outcome {
            Ok(()) => info!(
                cluster = cluster_name,
                dn,
                operation = "UPDATE",
                outcome = "success",
                request_id = %request_id,
                "directory entry updated"
            ),
            Err(err) => info!(
                cluster = cluster_name,
                dn,
                operation = "UPDATE",
                outcome = %err.error_code(),
                request_id = %request_id,
                "directory entry update failed"
            ),
        }
        outcome
    }

    /// Deletes an entry.
    ///
    /// # Errors
    ///
    /// [`Error::Forbidden`] on read-only clusters; otherwise the mapped
    /// LDAP failure.
    pub async fn delete(&self, cluster_name: &str, dn: &str) -> Result<()> {
        let cluster = self.registry.get(cluster_name)?.clone();
        self.ensure_writable(&cluster)?;
        let request_id = Uuid::new_v4();

        let outcome = self.gateway.delete(cluster_name, dn).await;
        match &outcome {
            Ok(()) => warn!(
                cluster = cluster_name,
                dn,
                operation = "DELETE",
                outcome = "success",
                request_id = %request_id,
                "directory entry deleted"
            ),
            Err(err) => warn!(
                cluster = cluster_name,
                dn,
                operation = "DELETE",
                outcome = %err.error_code(),
                request_id = %request_id,
                "directory entry deletion failed"
            ),
        }
        outcome
    }

    /// Reconciles the user's group memberships toward `desired`.
    ///
    /// Computes `add = desired \ current` and `remove = current \ desired`,
    /// then issues one modify per affected group. Best effort: partial
    /// failures are reported, successful modifications stay.
    ///
    /// # Errors
    ///
    /// [`Error::Forbidden`] on read-only clusters; read failures while
    /// computing the diff propagate.
    pub async fn set_user_groups(
        &self,
        cluster_name: &str,
        user_dn: &str,
        desired: &[String],
    ) -> Result<MembershipOutcome> {
        let cluster = self.registry.get(cluster_name)?.clone();
        self.ensure_writable(&cluster)?;
        let request_id = Uuid::new_v4();

        // Diff against the master's view so a replica lag cannot produce
        // spurious adds or removes.
        let current = self
            .user_groups_with(cluster_name, user_dn, ReadConsistency::Consistent)
            .await?;
        let current_dns: HashSet<&str> = current.iter().map(|g| g.dn.as_str()).collect();
        let desired_dns: HashSet<&str> = desired.iter().map(String::as_str).collect();

        let to_add: Vec<&str> = desired_dns.difference(&current_dns).copied().collect();
        let to_remove: Vec<&str> = current_dns.difference(&desired_dns).copied().collect();

        if to_add.is_empty() && to_remove.is_empty() {
            return Ok(MembershipOutcome::Success {
                added: 0,
                removed: 0,
            });
        }

        let known: HashMap<String, GroupInfo> = self
            .list_groups(cluster_name)
            .await?
            .into_iter()
            .map(|group| (group.dn.clone(), group))
            .collect();
        let current_by_dn: HashMap<&str, &GroupInfo> =
            current.iter().map(|g| (g.dn.as_str(), g)).collect();

        let mut errors = Vec::new();
        let mut added = 0usize;
        let mut removed = 0usize;

        for group_dn in to_add {
            let Some(group) = known.get(group_dn) else {
                errors.push(format!("failed to add to {group_dn}: unknown group"));
                continue;
            };
            let change = AttributeChange::Add {
                attribute: group.member_attribute().to_string(),
                values: vec![group.member_value(user_dn)],
            };
            match self.gateway.modify(cluster_name, group_dn, vec![change]).await {
                Ok(()) => added += 1,
                // The value being there already is the desired state.
                Err(Error::Conflict(_)) => added += 1,
                Err(err) => errors.push(format!("failed to add to {group_dn}: {err}")),
            }
        }

        for group_dn in to_remove {
            let group = current_by_dn
                .get(group_dn)
                .copied()
                .or_else(|| known.get(group_dn));
            let Some(group) = group else {
                errors.push(format!("failed to remove from {group_dn}: unknown group"));
                continue;
            };
            let change = AttributeChange::Delete {
                attribute: group.member_attribute().to_string(),
                values: vec![group.member_value(user_dn)],
            };
            match self.gateway.modify(cluster_name, group_dn, vec![change]).await {
                Ok(()) => removed += 1,
                // Already absent is the desired state.
                Err(Error::NotFound(_)) => removed += 1,
                Err(err) => errors.push(format!("failed to remove from {group_dn}: {err}")),
            }
        }

        info!(
            cluster = cluster_name,
            dn = user_dn,
            operation = "MEMBERSHIP",
            outcome = if errors.is_empty() { "success" } else { "partial" },
            added,
            removed,
            request_id = %request_id,
            "group membership reconciled"
        );

        if errors.is_empty() {
            Ok(MembershipOutcome::Success { added, removed })
        } else {
            Ok(MembershipOutcome::Partial {
                added,
                removed,
                errors,
            })
        }
    }

    // ---- internals ---------------------------------------------------

    fn ensure_writable(&self, cluster: &ClusterConfig) -> Result<()> {
        if cluster.readonly {
            return Err(Error::Forbidden(format!(
                "cluster `{}` is read-only",
                cluster.name
            )));
        }
        Ok(())
    }

    /// Resolves `days_since_epoch` and `${field}` directives in place and
    /// returns the names of fields that still need a `next_uid` value.
    fn resolve_static_placeholders(
        &self,
        cluster: &ClusterConfig,
        attributes: &mut HashMap<String, Vec<String>>,
    ) -> Result<Vec<String>> {
        let Some(form) = &cluster.user_creation_form else {
            return Ok(Vec::new());
        };

        let mut next_uid_fields = Vec::new();
        for field in &form.fields {
            let Some(directive) = &field.auto_generate else {
                continue;
            };
            if !autogen::needs_generation(attributes.get(&field.name)) {
                continue;
            }
            match directive.as_str() {
                autogen::NEXT_UID => next_uid_fields.push(field.name.clone()),
                autogen::DAYS_SINCE_EPOCH => {
                    attributes.insert(
                        field.name.clone(),
                        vec![autogen::days_since_epoch().to_string()],
                    );
                }
                template => {
                    let value = autogen::substitute_template(template, attributes)?;
                    attributes.insert(field.name.clone(), vec![value]);
                }
            }
        }
        Ok(next_uid_fields)
    }

    async fn create_with_uid_allocation(
        &self,
        cluster: &ClusterConfig,
        dn: &str,
        mut attributes: HashMap<String, Vec<String>>,
        uid_fields: &[String],
    ) -> Result<()> {
        let lock = self.uid_lock(&cluster.name);
        let _guard = lock.lock().await;

        let mut last_err = Error::Conflict("uid allocation failed".to_string());
        for attempt in 0..=UID_ALLOCATION_RETRIES {
            let users = self
                .gateway
                .search(
                    &cluster.name,
                    cluster.user_base(),
                    SearchScope::Subtree,
                    "(objectClass=posixAccount)",
                    vec!["uidNumber".to_string()],
                    ReadConsistency::Consistent,
                )
                .await?;
            let uid = autogen::next_uid_from(&users);
            for field in uid_fields {
                attributes.insert(field.clone(), vec![uid.to_string()]);
            }

            match self.add_entry(&cluster.name, dn, &attributes).await {
                Ok(()) => return Ok(()),
                Err(Error::Conflict(msg)) => {
                    debug!(
                        cluster = %cluster.name,
                        dn,
                        uid,
                        attempt,
                        "uid allocation collision, retrying"
                    );
                    last_err = Error::Conflict(msg);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    async fn add_entry(
        &self,
        cluster_name: &str,
        dn: &str,
        attributes: &HashMap<String, Vec<String>>,
    ) -> Result<()> {
        let attrs: Vec<(String, Vec<String>)> = attributes
            .iter()
            .map(|(name, values)| (name.clone(), values.clone()))
            .collect();
        self.gateway.add(cluster_name, dn, attrs).await
    }

    fn uid_lock(&self, cluster_name: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = match self.uid_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(cluster_name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

fn group_attributes() -> Vec<String> {
    vec![
        "cn".to_string(),
        "description".to_string(),
        "objectClass".to_string(),
    ]
}

fn compose_view_filter(cluster: &ClusterConfig, view: View, query: Option<&str>) -> String {
    let base = view.base_filter().to_string();
    match query.map(str::trim).filter(|q| !q.is_empty()) {
        Some(query) => {
            let disjunction = filter::query_disjunction(&cluster.search_attributes, query);
            filter::and(&[base, disjunction])
        }
        None => base,
    }
}
