//! # ldapgate-vault
//!
//! At-rest encrypted cache for per-cluster administrative bind passwords.
//!
//! Each cluster gets one record, encrypted with AES-256-GCM under a key
//! generated on first use and stored next to the records. Records expire
//! after a TTL; a record that fails authentication (tampered file, rotated
//! key) is discarded and treated as absent. All files are created with
//! owner-only permissions on POSIX hosts.

#![deny(missing_docs)]

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ldapgate_core::error::{Error, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// File name of the raw AEAD key material inside the secrets directory.
pub const KEY_FILE_NAME: &str = "vault.key";

/// Default credential TTL (one hour).
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Record format version.
const RECORD_VERSION: u32 = 1;

/// Cache status information, reported without decrypting the password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialStatus {
    /// Whether a record exists on disk.
    pub cached: bool,
    /// Whether the record's TTL has elapsed; `None` when unreadable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expired: Option<bool>,
    /// Record age in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_seconds: Option<u64>,
    /// Configured TTL in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

impl CredentialStatus {
    fn absent() -> Self {
        Self {
            cached: false,
            expired: None,
            age_seconds: None,
            ttl: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CredentialRecord {
    v: u32,
    nonce: String,
    ct: String,
    created_at: u64,
    ttl: u64,
}

/// Encrypted per-cluster credential store.
pub struct CredentialVault {
    secrets_dir: PathBuf,
    cipher: Aes256Gcm,
    default_ttl: Duration,
}

impl CredentialVault {
    /// Opens (or initializes) the vault under `secrets_dir`.
    ///
    /// The directory and key file are created on first use. Two processes
    /// racing on key creation resolve by create-exclusive: the loser reads
    /// the winner's key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] when the directory or key file cannot be
    /// created or read.
    pub fn open(secrets_dir: impl Into<PathBuf>) -> Result<Self> {
        let secrets_dir = secrets_dir.into();
        retry_io(|| fs::create_dir_all(&secrets_dir))
            .map_err(|err| storage_error("create secrets directory", &err))?;
        restrict_dir_permissions(&secrets_dir);

        let key = load_or_create_key(&secrets_dir.join(KEY_FILE_NAME))?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|err| Error::Storage(format!("invalid vault key material: {err}")))?;

        Ok(Self {
            secrets_dir,
            cipher,
            default_ttl: DEFAULT_TTL,
        })
    }

    /// Overrides the default record TTL.
    #[must_use]
    pub const fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Encrypts and stores the bind password for `cluster` with the default
    /// TTL, overwriting any previous record atomically.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] when the record cannot be written after
    /// one local retry.
    pub fn store(&self, cluster: &str, plaintext: &str) -> Result<()> {
        self.store_with_ttl(cluster, plaintext, self.default_ttl)
    }

    /// Encrypts and stores the bind password with an explicit TTL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] when the record cannot be written.
    pub fn store_with_ttl(&self, cluster: &str, plaintext: &str, ttl: Duration) -> Result<()> {
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|err| Error::Storage(format!("credential encryption failed: {err}")))?;

        let record = CredentialRecord {
            v: RECORD_VERSION,
            nonce: BASE64.encode(nonce_bytes),
            ct: BASE64.encode(&ciphertext),
            created_at: now_unix(),
            ttl: ttl.as_secs(),
        };
        let body = serde_json::to_vec(&record)
            .map_err(|err| Error::Storage(format!("credential record encoding failed: {err}")))?;

        let path = self.record_path(cluster);
        retry_io(|| write_atomically(&path, &body))
            .map_err(|err| storage_error("write credential record", &err))?;

        info!(cluster, ttl_seconds = ttl.as_secs(), "credential cached");
        Ok(())
    }

    /// Loads and decrypts the bind password for `cluster`.
    ///
    /// Returns `None` when no record exists, the TTL has elapsed (the record
    /// is removed), or decryption fails (the record is removed with a WARN).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] only when the record exists but cannot be
    /// read after one local retry.
    pub fn load(&self, cluster: &str) -> Result<Option<String>> {
        let path = self.record_path(cluster);
        let body = match retry_io(|| fs::read(&path)) {
            Ok(body) => body,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(storage_error("read credential record", &err)),
        };

        let Some(record) = self.parse_record(cluster, &path, &body) else {
            return Ok(None);
        };

        let age = now_unix().saturating_sub(record.created_at);
        if age >= record.ttl {
            info!(
                cluster,
                age_seconds = age,
                ttl_seconds = record.ttl,
                "credential expired"
            );
            self.remove_record(&path);
            return Ok(None);
        }

        match self.decrypt_record(&record) {
            Some(plaintext) => Ok(Some(plaintext)),
            None => {
                warn!(cluster, "credential record failed authentication, discarding");
                self.remove_record(&path);
                Ok(None)
            }
        }
    }

    /// Removes the cached credential for `cluster`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] when an existing record cannot be removed.
    pub fn clear(&self, cluster: &str) -> Result<()> {
        let path = self.record_path(cluster);
        match retry_io(|| fs::remove_file(&path)) {
            Ok(()) => {
                info!(cluster, "credential cleared");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(storage_error("remove credential record", &err)),
        }
    }

    /// Returns true if a decryptable, unexpired record exists.
    #[must_use]
    pub fn present(&self, cluster: &str) -> bool {
        matches!(self.load(cluster), Ok(Some(_)))
    }

    /// Reports record status without decrypting the password.
    #[must_use]
    pub fn status(&self, cluster: &str) -> CredentialStatus {
        let path = self.record_path(cluster);
        let Ok(body) = fs::read(&path) else {
            return CredentialStatus::absent();
        };
        match serde_json::from_slice::<CredentialRecord>(&body) {
            Ok(record) => {
                let age = now_unix().saturating_sub(record.created_at);
                CredentialStatus {
                    cached: true,
                    expired: Some(age >= record.ttl),
                    age_seconds: Some(age),
                    ttl: Some(record.ttl),
                }
            }
            Err(_) => CredentialStatus {
                cached: true,
                expired: None,
                age_seconds: None,
                ttl: None,
            },
        }
    }

    /// Directory the vault stores its files in.
    #[must_use]
    pub fn secrets_dir(&self) -> &Path {
        &self.secrets_dir
    }

    fn record_path(&self, cluster: &str) -> PathBuf {
        self.secrets_dir.join(format!("{cluster}.cred"))
    }

    fn parse_record(&self, cluster: &str, path: &Path, body: &[u8]) -> Option<CredentialRecord> {
        match serde_json::from_slice::<CredentialRecord>(body) {
            Ok(record) if record.v == RECORD_VERSION => Some(record),
            Ok(record) => {
                warn!(cluster, version = record.v, "unsupported credential record version");
                self.remove_record(path);
                None
            }
            Err(err) => {
                warn!(cluster, error = %err, "corrupted credential record, discarding");
                self.remove_record(path);
                None
            }
        }
    }

    fn decrypt_record(&self, record: &CredentialRecord) -> Option<String> {
        let nonce_bytes = BASE64.decode(&record.nonce).ok()?;
        let ciphertext = BASE64.decode(&record.ct).ok()?;
        if nonce_bytes.len() != 12 {
            return None;
        }
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
            .ok()?;
        String::from_utf8(plaintext).ok()
    }

    fn remove_record(&self, path: &Path) {
        if let Err(err) = fs::remove_file(path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %err, "failed to remove credential record");
            }
        }
    }
}

fn load_or_create_key(path: &Path) -> Result<[u8; 32]> {
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(mut file) => {
            let mut key = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut key);
            file.write_all(&key)
                .and_then(|()| file.sync_all())
                .map_err(|err| storage_error("write vault key", &err))?;
            drop(file);
            restrict_file_permissions(path);
            info!(path = %path.display(), "generated new vault key");
            Ok(key)
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => read_key(path),
        Err(err) => Err(storage_error("create vault key", &err)),
    }
}

fn read_key(path: &Path) -> Result<[u8; 32]> {
    let bytes =
        retry_io(|| fs::read(path)).map_err(|err| storage_error("read vault key", &err))?;
    let key: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::Storage(format!("vault key {} has invalid length", path.display())))?;
    Ok(key)
}

fn write_atomically(path: &Path, body: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("cred.tmp");
    {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(body)?;
        file.sync_all()?;
    }
    restrict_file_permissions(&tmp);
    fs::rename(&tmp, path)
}

#[cfg(unix)]
fn restrict_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        warn!(path = %path.display(), error = %err, "failed to restrict file mode");
    }
}

#[cfg(not(unix))]
fn restrict_file_permissions(path: &Path) {
    warn!(
        path = %path.display(),
        "owner-only file mode not supported on this platform"
    );
}

#[cfg(unix)]
fn restrict_dir_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(0o700)) {
        warn!(path = %path.display(), error = %err, "failed to restrict directory mode");
    }
}

#[cfg(not(unix))]
fn restrict_dir_permissions(path: &Path) {
    warn!(
        path = %path.display(),
        "owner-only directory mode not supported on this platform"
    );
}

// Vault files are single-writer by construction; one immediate retry covers
// transient I/O failures without masking persistent ones.
fn retry_io<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    match op() {
        Ok(value) => Ok(value),
        Err(first) if first.kind() == io::ErrorKind::NotFound => Err(first),
        Err(_) => op(),
    }
}

fn storage_error(action: &str, err: &io::Error) -> Error {
    Error::Storage(format!("{action}: {err}"))
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
