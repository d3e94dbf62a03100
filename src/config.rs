//! Configuration module for uptrail.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::probe::{PingMode, ProbeSettings};

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "uptrail.db")
    pub db_path: String,
    /// Per-probe deadline (default: 10s)
    pub probe_timeout: Duration,
    /// User-Agent sent with HTTP probes
    pub user_agent: String,
    /// Whether HTTP probes follow redirects (default: true)
    pub follow_redirects: bool,
    /// How ping probes reach the network (default: auto)
    pub ping_mode: PingMode,
    /// Interval between scheduled bulk runs; zero disables them (default: 60s)
    pub run_interval: Duration,
    /// Upper bound of the random delay before each probe in a bulk run (default: 100ms)
    pub probe_jitter: Duration,
    /// History window returned by the history endpoint when none is given (default: 72h)
    pub history_hours: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "uptrail.db".to_string(),
            probe_timeout: Duration::from_secs(10),
            user_agent: concat!("uptrail/", env!("CARGO_PKG_VERSION")).to_string(),
            follow_redirects: true,
            ping_mode: PingMode::Auto,
            run_interval: Duration::from_secs(60),
            probe_jitter: Duration::from_millis(100),
            history_hours: 72,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `UPTRAIL_HTTP_PORT`: HTTP port (default: 8080)
    /// - `UPTRAIL_DB_PATH`: Database file path (default: "uptrail.db")
    /// - `UPTRAIL_PROBE_TIMEOUT_MS`: Probe timeout in milliseconds (default: 10000)
    /// - `UPTRAIL_USER_AGENT`: User-Agent for HTTP probes
    /// - `UPTRAIL_FOLLOW_REDIRECTS`: `true` or `false` (default: true)
    /// - `UPTRAIL_PING_MODE`: `auto`, `native` or `command` (default: auto)
    /// - `UPTRAIL_RUN_INTERVAL_SECS`: Bulk run interval, 0 disables (default: 60)
    /// - `UPTRAIL_PROBE_JITTER_MS`: Max start jitter per probe (default: 100)
    /// - `UPTRAIL_HISTORY_HOURS`: Default history window (default: 72)
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(port) = parse_var(&lookup, "UPTRAIL_HTTP_PORT") {
            cfg.http_port = port;
        }

        if let Some(db_path) = lookup("UPTRAIL_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(ms) = parse_var::<u64, _>(&lookup, "UPTRAIL_PROBE_TIMEOUT_MS") {
            if ms > 0 {
                cfg.probe_timeout = Duration::from_millis(ms);
            }
        }

        if let Some(user_agent) = lookup("UPTRAIL_USER_AGENT") {
            if !user_agent.trim().is_empty() {
                cfg.user_agent = user_agent;
            }
        }

        if let Some(follow) = parse_var(&lookup, "UPTRAIL_FOLLOW_REDIRECTS") {
            cfg.follow_redirects = follow;
        }

        if let Some(mode) = parse_var(&lookup, "UPTRAIL_PING_MODE") {
            cfg.ping_mode = mode;
        }

        if let Some(secs) = parse_var(&lookup, "UPTRAIL_RUN_INTERVAL_SECS") {
            cfg.run_interval = Duration::from_secs(secs);
        }

        if let Some(ms) = parse_var(&lookup, "UPTRAIL_PROBE_JITTER_MS") {
            cfg.probe_jitter = Duration::from_millis(ms);
        }

        if let Some(hours) = parse_var::<i64, _>(&lookup, "UPTRAIL_HISTORY_HOURS") {
            if hours > 0 {
                cfg.history_hours = hours;
            }
        }

        cfg
    }

    /// Settings handed to the probe executor.
    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            timeout: self.probe_timeout,
            user_agent: self.user_agent.clone(),
            follow_redirects: self.follow_redirects,
            ping_mode: self.ping_mode,
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "uptrail.db");
        assert_eq!(cfg.probe_timeout, Duration::from_secs(10));
        assert_eq!(cfg.ping_mode, PingMode::Auto);
        assert_eq!(cfg.history_hours, 72);
        assert!(cfg.user_agent.starts_with("uptrail/"));
    }

    #[test]
    fn test_env_overrides() {
        let cfg = config_from(&[
            ("UPTRAIL_HTTP_PORT", "9090"),
            ("UPTRAIL_DB_PATH", "/tmp/checks.db"),
            ("UPTRAIL_PROBE_TIMEOUT_MS", "2500"),
            ("UPTRAIL_FOLLOW_REDIRECTS", "false"),
            ("UPTRAIL_PING_MODE", "command"),
            ("UPTRAIL_RUN_INTERVAL_SECS", "0"),
            ("UPTRAIL_PROBE_JITTER_MS", "0"),
        ]);
        assert_eq!(cfg.http_port, 9090);
        assert_eq!(cfg.db_path, "/tmp/checks.db");
        assert_eq!(cfg.probe_timeout, Duration::from_millis(2500));
        assert!(!cfg.follow_redirects);
        assert_eq!(cfg.ping_mode, PingMode::Command);
        assert_eq!(cfg.run_interval, Duration::ZERO);
        assert_eq!(cfg.probe_jitter, Duration::ZERO);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let cfg = config_from(&[
            ("UPTRAIL_HTTP_PORT", "not-a-port"),
            ("UPTRAIL_PROBE_TIMEOUT_MS", "0"),
            ("UPTRAIL_PING_MODE", "carrier-pigeon"),
            ("UPTRAIL_HISTORY_HOURS", "-4"),
        ]);
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.probe_timeout, Duration::from_secs(10));
        assert_eq!(cfg.ping_mode, PingMode::Auto);
        assert_eq!(cfg.history_hours, 72);
    }
}
