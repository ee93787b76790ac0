//! Runtime settings resolved from the process environment.

use std::time::Duration;

/// Default network connect timeout for LDAP connections.
pub const DEFAULT_NET_TIMEOUT_SECS: u64 = 30;
/// Default per-operation LDAP timeout.
pub const DEFAULT_OP_TIMEOUT_SECS: u64 = 30;
/// Default credential cache TTL.
pub const DEFAULT_CREDENTIAL_TTL_SECS: u64 = 3600;
/// Default pooled-session idle TTL.
pub const DEFAULT_POOL_IDLE_TTL_SECS: u64 = 300;
/// Default listen port advertised to the HTTP layer.
pub const DEFAULT_PORT: u16 = 8000;
/// Default worker count advertised to the HTTP layer.
pub const DEFAULT_WORKERS: usize = 4;

/// Settings recognized from the environment.
///
/// `allowed_origins`, `port` and `workers` are surfaced for the fronting
/// HTTP layer; the rest feed the core directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySettings {
    /// CORS origin whitelist; empty denies cross-origin.
    pub allowed_origins: Vec<String>,
    /// Log level directive (`DEBUG` / `INFO` / `WARN` / `ERROR`).
    pub log_level: String,
    /// Emit structured JSON log lines when true.
    pub json_logs: bool,
    /// Listen port.
    pub port: u16,
    /// Worker task count.
    pub workers: usize,
    /// LDAP network connect timeout.
    pub net_timeout: Duration,
    /// LDAP per-operation timeout.
    pub op_timeout: Duration,
    /// Credential vault TTL.
    pub credential_ttl: Duration,
    /// Pooled-session idle TTL.
    pub pool_idle_ttl: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            log_level: "INFO".to_string(),
            json_logs: false,
            port: DEFAULT_PORT,
            workers: DEFAULT_WORKERS,
            net_timeout: Duration::from_secs(DEFAULT_NET_TIMEOUT_SECS),
            op_timeout: Duration::from_secs(DEFAULT_OP_TIMEOUT_SECS),
            credential_ttl: Duration::from_secs(DEFAULT_CREDENTIAL_TTL_SECS),
            pool_idle_ttl: Duration::from_secs(DEFAULT_POOL_IDLE_TTL_SECS),
        }
    }
}

impl GatewaySettings {
    /// Reads settings from the process environment, falling back to defaults
    /// for unset or unparsable values.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            allowed_origins: lookup("ALLOWED_ORIGINS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            log_level: lookup("LOG_LEVEL")
                .map(|level| level.to_uppercase())
                .unwrap_or(defaults.log_level),
            json_logs: lookup("JSON_LOGS").as_deref().map_or(false, is_truthy),
            port: lookup("PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            workers: lookup("WORKERS")
                .and_then(|v| v.parse().ok())
                .filter(|&w| w > 0)
                .unwrap_or(defaults.workers),
            net_timeout: duration_from(lookup("LDAP_NET_TIMEOUT_S"), defaults.net_timeout),
            op_timeout: duration_from(lookup("LDAP_OP_TIMEOUT_S"), defaults.op_timeout),
            credential_ttl: duration_from(
                lookup("PASSWORD_CACHE_TTL_S"),
                defaults.credential_ttl,
            ),
            pool_idle_ttl: duration_from(lookup("POOL_IDLE_TTL_S"), defaults.pool_idle_ttl),
        }
    }
}

fn duration_from(raw: Option<String>, fallback: Duration) -> Duration {
    raw.and_then(|v| v.parse::<u64>().ok())
        .filter(|&secs| secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(fallback)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings_from(pairs: &[(&str, &str)]) -> GatewaySettings {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        GatewaySettings::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let settings = settings_from(&[]);
        assert_eq!(settings, GatewaySettings::default());
        assert_eq!(settings.net_timeout, Duration::from_secs(30));
        assert_eq!(settings.pool_idle_ttl, Duration::from_secs(300));
        assert!(settings.allowed_origins.is_empty());
    }

    #[test]
    fn overrides_are_honored() {
        let settings = settings_from(&[
            ("LDAP_NET_TIMEOUT_S", "5"),
            ("LDAP_OP_TIMEOUT_S", "10"),
            ("PASSWORD_CACHE_TTL_S", "120"),
            ("POOL_IDLE_TTL_S", "60"),
            ("PORT", "9090"),
            ("WORKERS", "8"),
            ("LOG_LEVEL", "debug"),
            ("JSON_LOGS", "true"),
        ]);
        assert_eq!(settings.net_timeout, Duration::from_secs(5));
        assert_eq!(settings.op_timeout, Duration::from_secs(10));
        assert_eq!(settings.credential_ttl, Duration::from_secs(120));
        assert_eq!(settings.pool_idle_ttl, Duration::from_secs(60));
        assert_eq!(settings.port, 9090);
        assert_eq!(settings.workers, 8);
        assert_eq!(settings.log_level, "DEBUG");
        assert!(settings.json_logs);
    }

    #[test]
    fn allowed_origins_are_split_and_trimmed() {
        let settings = settings_from(&[(
            "ALLOWED_ORIGINS",
            "https://a.example.com, https://b.example.com ,",
        )]);
        assert_eq!(
            settings.allowed_origins,
            vec!["https://a.example.com", "https://b.example.com"]
        );
    }

    #[test]
    fn garbage_values_fall_back_to_defaults() {
        let settings = settings_from(&[
            ("LDAP_NET_TIMEOUT_S", "soon"),
            ("PORT", "-1"),
            ("WORKERS", "0"),
            ("JSON_LOGS", "maybe"),
        ]);
        assert_eq!(settings.net_timeout, Duration::from_secs(30));
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.workers, DEFAULT_WORKERS);
        assert!(!settings.json_logs);
    }

    #[test]
    fn truthy_parsing() {
        for value in ["1", "true", "YES", "on", " True "] {
            assert!(is_truthy(value), "{value} should be truthy");
        }
        for value in ["0", "false", "no", "off", ""] {
            assert!(!is_truthy(value), "{value} should be falsy");
        }
    }
}
