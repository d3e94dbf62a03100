//! HTTP and HTTPS probe implementation.

use std::error::Error as StdError;
use std::ops::RangeInclusive;
use std::time::{Duration, Instant};

use super::{ProbeError, ProbeResult, ProbeSettings, ProtocolKind};

/// Status codes treated as `up`.
pub const SUCCESS_STATUS: RangeInclusive<u16> = 200..=399;

pub fn is_success_status(status: u16) -> bool {
    SUCCESS_STATUS.contains(&status)
}

/// Build the shared client used by HTTP probes.
pub fn build_http_client(settings: &ProbeSettings) -> Result<reqwest::Client, ProbeError> {
    let redirect = if settings.follow_redirects {
        reqwest::redirect::Policy::limited(10)
    } else {
        reqwest::redirect::Policy::none()
    };

    reqwest::Client::builder()
        .user_agent(settings.user_agent.as_str())
        .redirect(redirect)
        .no_proxy()
        .build()
        .map_err(|e| ProbeError::Config(format!("failed to build HTTP client: {}", e)))
}

/// Prefix a scheme matching `kind` when the address has none.
///
/// Addresses that carry any scheme other than http or https are rejected.
pub fn normalize_url(address: &str, kind: ProtocolKind) -> Result<String, ProbeError> {
    let trimmed = address.trim();
    if let Some((scheme, _)) = trimmed.split_once("://") {
        return if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https") {
            Ok(trimmed.to_string())
        } else {
            Err(ProbeError::Config(format!("unsupported scheme: {}", scheme)))
        };
    }

    let scheme = match kind {
        ProtocolKind::Http => "http",
        ProtocolKind::Https | ProtocolKind::Ping => "https",
    };
    Ok(format!("{}://{}", scheme, trimmed))
}

/// Run an HTTP probe against the given address.
///
/// Sends a `HEAD` request; the response time covers dispatch until the
/// response headers arrive.
pub async fn run_http_probe(
    client: &reqwest::Client,
    address: &str,
    kind: ProtocolKind,
    timeout: Duration,
) -> ProbeResult {
    let start = Instant::now();
    let url = match normalize_url(address, kind) {
        Ok(url) => url,
        Err(e) => return ProbeResult::down(start.elapsed(), None, e.to_string()),
    };

    match client.head(&url).timeout(timeout).send().await {
        Ok(response) => {
            let elapsed = start.elapsed();
            let status = response.status().as_u16();
            if is_success_status(status) {
                ProbeResult::up(elapsed, Some(status))
            } else {
                ProbeResult::down(elapsed, Some(status), format!("HTTP {}", status))
            }
        }
        Err(e) => {
            let elapsed = start.elapsed();
            let err = classify_request_error(&e, timeout);
            tracing::debug!("HTTP probe of {} failed: {}", url, err);
            ProbeResult::down(elapsed, None, err.to_string())
        }
    }
}

/// Map a reqwest failure onto the probe error taxonomy.
fn classify_request_error(err: &reqwest::Error, timeout: Duration) -> ProbeError {
    if err.is_timeout() {
        return ProbeError::Timeout(timeout);
    }
    if err.is_builder() {
        return ProbeError::Config(format!("invalid URL: {}", err));
    }

    // The top-level message embeds the URL, so only the causes are inspected.
    let causes = source_chain(err);
    let lower = causes.to_ascii_lowercase();
    let detail = if causes.is_empty() { err.to_string() } else { causes };

    if lower.contains("dns error")
        || lower.contains("failed to lookup address")
        || lower.contains("name or service not known")
        || lower.contains("no such host")
    {
        ProbeError::Resolution(detail)
    } else if lower.contains("certificate")
        || lower.contains("tls")
        || lower.contains("ssl")
        || lower.contains("handshake")
    {
        ProbeError::Tls(detail)
    } else if err.is_connect() {
        ProbeError::Connect(detail)
    } else {
        ProbeError::Network(detail)
    }
}

/// Join the messages of every source below `err`, skipping repeats.
fn source_chain(err: &(dyn StdError + 'static)) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        let msg = cause.to_string();
        if !parts.iter().any(|p| p.contains(&msg)) {
            parts.push(msg);
        }
        source = cause.source();
    }
    parts.join(": ")
}
