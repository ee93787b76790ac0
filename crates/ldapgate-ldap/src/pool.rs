//! Pooled authenticated LDAP sessions.
//!
//! Sessions are keyed by `(cluster, host, port, bind_dn)` and checked out
//! exclusively; the LDAP protocol is request/response per connection, so a
//! session never serves two callers at once. Idle sessions expire after a
//! TTL and a background reaper sweeps them out.

use crate::session::{LdapConnector, LdapEndpoint, LdapSession};
use async_trait::async_trait;
use ldapgate_core::error::{Error, Result};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Default idle TTL for pooled sessions.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(300);

/// Identity of a pooled session: cluster, node coordinates and bind DN.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    /// Cluster name.
    pub cluster: String,
    /// Node host.
    pub host: String,
    /// Node port.
    pub port: u16,
    /// Bind identity the session was authenticated as.
    pub bind_dn: String,
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.cluster, self.host, self.port, self.bind_dn
        )
    }
}

/// Supplies the bind password for a cluster, typically backed by the
/// credential vault.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PasswordProvider: Send + Sync {
    /// Returns the bind password for `cluster`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthFailed`] when no credential is available.
    async fn bind_password(&self, cluster: &str) -> Result<String>;
}

struct IdleSession {
    session: Box<dyn LdapSession>,
    created_at: Instant,
    last_used_at: Instant,
}

/// A session checked out of the pool. Return it with
/// [`SessionPool::release`]; dropping it without releasing closes nothing
/// but loses the warm connection.
pub struct PooledSession {
    session: Box<dyn LdapSession>,
    key: PoolKey,
    created_at: Instant,
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession").finish_non_exhaustive()
    }
}

impl PooledSession {
    /// Mutable access to the underlying protocol session.
    pub fn session_mut(&mut self) -> &mut dyn LdapSession {
        self.session.as_mut()
    }

    /// The pool key this session belongs to.
    #[must_use]
    pub fn key(&self) -> &PoolKey {
        &self.key
    }
}

/// Per-key idle-session statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolKeyStats {
    /// Rendered pool key.
    pub key: String,
    /// Idle sessions currently parked under the key.
    pub idle: usize,
    /// Age in seconds of the least recently used idle session.
    pub oldest_idle_secs: u64,
}

/// Aggregate pool statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Total idle sessions across all keys.
    pub total_idle: usize,
    /// Configured idle TTL in seconds.
    pub idle_ttl_secs: u64,
    /// Per-key breakdown.
    pub keys: Vec<PoolKeyStats>,
}

type Shard = Arc<Mutex<VecDeque<IdleSession>>>;

/// Thread-safe pool of authenticated LDAP sessions.
pub struct SessionPool {
    connector: Arc<dyn LdapConnector>,
    idle_ttl: Duration,
    shards: RwLock<HashMap<PoolKey, Shard>>,
}

impl SessionPool {
    /// Creates a pool that opens sessions through `connector`.
    #[must_use]
    pub fn new(connector: Arc<dyn LdapConnector>, idle_ttl: Duration) -> Self {
        info!(idle_ttl_secs = idle_ttl.as_secs(), "session pool initialized");
        Self {
            connector,
            idle_ttl,
            shards: RwLock::new(HashMap::new()),
        }
    }

    /// Checks out a session for `key`, reusing the most recently used idle
    /// one when fresh, otherwise binding a new connection with the password
    /// from `provider`.
    ///
    /// Connection creation happens under the per-key lock so a burst of
    /// callers on one key opens connections one at a time.
    ///
    /// # Errors
    ///
    /// Propagates connector and bind failures; a rejected bind surfaces as
    /// [`Error::AuthFailed`] and nothing is cached.
    pub async fn acquire(
        &self,
        key: PoolKey,
        endpoint: &LdapEndpoint,
        provider: &dyn PasswordProvider,
    ) -> Result<PooledSession> {
        let shard = self.shard_for(&key).await;
        let mut queue = shard.lock().await;

        while let Some(mut idle) = queue.pop_back() {
            if idle.last_used_at.elapsed() < self.idle_ttl {
                debug!(key = %key, "reusing pooled session");
                return Ok(PooledSession {
                    session: idle.session,
                    key,
                    created_at: idle.created_at,
                });
            }
            debug!(key = %key, "discarding stale pooled session");
            let _ = idle.session.unbind().await;
        }

        let password = provider.bind_password(&key.cluster).await?;
        info!(key = %key, "opening new pooled session");
        let mut session = self.connector.connect(endpoint).await?;
        if let Err(err) = session.simple_bind(&key.bind_dn, &password).await {
            let _ = session.unbind().await;
            return Err(err);
        }

        Ok(PooledSession {
            session,
            key,
            created_at: Instant::now(),
        })
    }

    /// Returns a session to the pool. Healthy sessions are parked for
    /// reuse; unhealthy ones are closed and dropped.
    pub async fn release(&self, session: PooledSession, healthy: bool) {
        let PooledSession {
            mut session,
            key,
            created_at,
        } = session;

        if !healthy {
            debug!(key = %key, "dropping unhealthy session");
            let _ = session.unbind().await;
            return;
        }

        let shard = self.shard_for(&key).await;
        let mut queue = shard.lock().await;
        queue.push_back(IdleSession {
            session,
            created_at,
            last_used_at: Instant::now(),
        });
    }

    /// Removes idle sessions whose TTL has elapsed.
    pub async fn sweep(&self) {
        let shards: Vec<(PoolKey, Shard)> = {
            let map = self.shards.read().await;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut removed = 0usize;
        for (key, shard) in shards {
            let mut queue = shard.lock().await;
            let mut kept = VecDeque::with_capacity(queue.len());
            while let Some(mut idle) = queue.pop_front() {
                if idle.last_used_at.elapsed() < self.idle_ttl {
                    kept.push_back(idle);
                } else {
                    removed += 1;
                    debug!(key = %key, "reaping idle session");
                    let _ = idle.session.unbind().await;
                }
            }
            *queue = kept;
        }

        if removed > 0 {
            info!(removed, "pool reaper removed idle sessions");
        }
    }

    /// Spawns the background reaper. Cadence is half the idle TTL.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        let cadence = (self.idle_ttl / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cadence);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                pool.sweep().await;
            }
        })
    }

    /// Reports idle-session statistics.
    pub async fn stats(&self) -> PoolStats {
        let map = self.shards.read().await;
        let mut keys = Vec::with_capacity(map.len());
        let mut total_idle = 0usize;
        for (key, shard) in map.iter() {
            let queue = shard.lock().await;
            if queue.is_empty() {
                continue;
            }
            total_idle += queue.len();
            let oldest = queue
                .iter()
                .map(|idle| idle.last_used_at.elapsed().as_secs())
                .max()
                .unwrap_or(0);
            keys.push(PoolKeyStats {
                key: key.to_string(),
                idle: queue.len(),
                oldest_idle_secs: oldest,
            });
        }
        PoolStats {
            total_idle,
            idle_ttl_secs: self.idle_ttl.as_secs(),
            keys,
        }
    }

    /// Closes every idle session and empties the pool.
    pub async fn drain(&self) {
        let shards: Vec<Shard> = {
            let mut map = self.shards.write().await;
            map.drain().map(|(_, shard)| shard).collect()
        };
        for shard in shards {
            let mut queue = shard.lock().await;
            while let Some(mut idle) = queue.pop_front() {
                let _ = idle.session.unbind().await;
            }
        }
        info!("session pool drained");
    }

    async fn shard_for(&self, key: &PoolKey) -> Shard {
        {
            let map = self.shards.read().await;
            if let Some(shard) = map.get(key) {
                return shard.clone();
            }
        }
        let mut map = self.shards.write().await;
        map.entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .clone()
    }
}

impl fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("idle_ttl", &self.idle_ttl)
            .finish_non_exhaustive()
    }
}

/// A provider that fails every lookup; useful where a password can never be
/// needed (e.g. reusing an endpoint that must already be pooled).
pub struct NoPasswordProvider;

#[async_trait]
impl PasswordProvider for NoPasswordProvider {
    async fn bind_password(&self, cluster: &str) -> Result<String> {
        Err(Error::AuthFailed(format!(
            "no credential available for cluster `{cluster}`"
        )))
    }
}
