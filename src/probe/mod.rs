//! Probe module for uptime monitoring.
//!
//! Supports HTTP, HTTPS and Ping probes. Every probe resolves to a
//! [`ProbeResult`]; transport failures never escape as errors.

mod http;
mod ping;

pub use http::*;
pub use ping::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Extra time allowed on top of a probe's timeout before the outer deadline fires.
pub const TIMEOUT_GRACE: Duration = Duration::from_millis(250);

/// Probe error types.
///
/// These never leave the probe module; [`Prober::probe`] folds them into a
/// `down` result.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("DNS resolution failed: {0}")]
    Resolution(String),
    #[error("TLS handshake failed: {0}")]
    Tls(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// How a target is probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProtocolKind {
    Http,
    Https,
    Ping,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Http => "HTTP",
            ProtocolKind::Https => "HTTPS",
            ProtocolKind::Ping => "PING",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolKind {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HTTP" => Ok(ProtocolKind::Http),
            "HTTPS" => Ok(ProtocolKind::Https),
            "PING" => Ok(ProtocolKind::Ping),
            other => Err(ProbeError::Config(format!("unknown protocol kind: {}", other))),
        }
    }
}

/// Up/down classification of a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Up,
    Down,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Up => "up",
            Outcome::Down => "down",
        }
    }
}

impl FromStr for Outcome {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Outcome::Up),
            "down" => Ok(Outcome::Down),
            other => Err(ProbeError::Config(format!("unknown outcome: {}", other))),
        }
    }
}

/// The immediate outcome of one probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub outcome: Outcome,
    pub response_time_ms: Option<u64>,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
}

impl ProbeResult {
    pub fn up(elapsed: Duration, status_code: Option<u16>) -> Self {
        Self {
            outcome: Outcome::Up,
            response_time_ms: Some(duration_ms(elapsed)),
            status_code,
            error_message: None,
        }
    }

    pub fn down(elapsed: Duration, status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Down,
            response_time_ms: Some(duration_ms(elapsed)),
            status_code,
            error_message: Some(message.into()),
        }
    }

    pub fn is_up(&self) -> bool {
        self.outcome == Outcome::Up
    }
}

/// Whole milliseconds of a duration, saturating.
pub fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// How ping probes reach the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PingMode {
    /// Native ICMP when a socket can be opened, system `ping` otherwise.
    #[default]
    Auto,
    Native,
    Command,
}

impl FromStr for PingMode {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(PingMode::Auto),
            "native" => Ok(PingMode::Native),
            "command" => Ok(PingMode::Command),
            other => Err(ProbeError::Config(format!("unknown ping mode: {}", other))),
        }
    }
}

/// Probe configuration.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub timeout: Duration,
    pub user_agent: String,
    pub follow_redirects: bool,
    pub ping_mode: PingMode,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: concat!("uptrail/", env!("CARGO_PKG_VERSION")).to_string(),
            follow_redirects: true,
            ping_mode: PingMode::Auto,
        }
    }
}

/// Runs single reachability checks.
///
/// Holds one HTTP client so connection setup state (TLS config, resolver) is
/// shared across probes.
#[derive(Debug, Clone)]
pub struct Prober {
    settings: ProbeSettings,
    client: reqwest::Client,
}

impl Prober {
    pub fn new(settings: ProbeSettings) -> Result<Self, ProbeError> {
        let client = build_http_client(&settings)?;
        Ok(Self { settings, client })
    }

    /// Probe with the configured timeout.
    pub async fn check(&self, address: &str, kind: ProtocolKind) -> ProbeResult {
        self.probe(address, kind, self.settings.timeout).await
    }

    /// Run one probe against `address`.
    ///
    /// Returns within `timeout + TIMEOUT_GRACE`.
    pub async fn probe(&self, address: &str, kind: ProtocolKind, timeout: Duration) -> ProbeResult {
        let start = Instant::now();

        let run = async {
            match kind {
                ProtocolKind::Http | ProtocolKind::Https => {
                    run_http_probe(&self.client, address, kind, timeout).await
                }
                ProtocolKind::Ping => run_ping_probe(address, timeout, self.settings.ping_mode).await,
            }
        };

        match tokio::time::timeout(timeout + TIMEOUT_GRACE, run).await {
            Ok(result) => result,
            Err(_) => ProbeResult::down(start.elapsed(), None, ProbeError::Timeout(timeout).to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_kind_parse() {
        assert_eq!("HTTP".parse::<ProtocolKind>().unwrap(), ProtocolKind::Http);
        assert_eq!("https".parse::<ProtocolKind>().unwrap(), ProtocolKind::Https);
        assert_eq!(" Ping ".parse::<ProtocolKind>().unwrap(), ProtocolKind::Ping);
        assert!("dns".parse::<ProtocolKind>().is_err());
    }

    #[test]
    fn test_probe_result_payload_shape() {
        let result = ProbeResult::up(Duration::from_millis(5), Some(200));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["outcome"], "up");
        assert_eq!(json["responseTimeMs"], 5);
        assert_eq!(json["statusCode"], 200);
        assert!(json["errorMessage"].is_null());
    }

    #[test]
    fn test_timeout_message_mentions_timeout() {
        let msg = ProbeError::Timeout(Duration::from_millis(1500)).to_string();
        assert_eq!(msg, "request timed out after 1500ms");
    }
}
