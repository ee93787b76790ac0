//! Vault-backed bind-password provider for the session pool.

use async_trait::async_trait;
use ldapgate_core::error::{Error, Result};
use ldapgate_ldap::PasswordProvider;
use ldapgate_vault::CredentialVault;
use std::sync::Arc;

/// Serves pool bind passwords from the credential vault.
pub struct VaultPasswordProvider {
    vault: Arc<CredentialVault>,
}

impl VaultPasswordProvider {
    /// Wraps a vault.
    #[must_use]
    pub fn new(vault: Arc<CredentialVault>) -> Self {
        Self { vault }
    }
}

#[async_trait]
impl PasswordProvider for VaultPasswordProvider {
    async fn bind_password(&self, cluster: &str) -> Result<String> {
        match self.vault.load(cluster)? {
            Some(password) => Ok(password),
            None => Err(Error::AuthFailed(format!(
                "no cached credential for cluster `{cluster}`"
            ))),
        }
    }
}
