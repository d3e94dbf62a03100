//! Ping probe implementation with native ICMP (high-precision) and command fallback.
//!
//! Uses blocking sockets in spawn_blocking for sub-millisecond timing precision.

use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{duration_ms, Outcome, PingMode, ProbeError, ProbeResult};

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available
    Native,
    /// Only command fallback is available
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

/// Ping sequence counter for unique identification
static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Generate a unique identifier for each ping request.
/// This ensures concurrent pings can be distinguished even to the same destination.
fn generate_ping_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

fn detect_icmp_capability() -> IcmpCapability {
    // RAW needs CAP_NET_RAW or root
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    // DGRAM works unprivileged on Linux with ping_group_range set, or macOS
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// Reduce an address to the bare host or IP that ping expects.
///
/// Drops any scheme, credentials, path, query and port. IPv6 literals keep
/// their colons and lose their brackets.
pub fn strip_host(address: &str) -> String {
    let mut rest = address.trim();
    if let Some(idx) = rest.find("://") {
        rest = &rest[idx + 3..];
    }
    let rest = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let rest = rest.rsplit('@').next().unwrap_or_default();

    if let Some(inner) = rest.strip_prefix('[') {
        return inner.split(']').next().unwrap_or_default().to_string();
    }

    // A single colon is a port separator; more than one is a bare IPv6 literal.
    if rest.matches(':').count() == 1 {
        return rest.split(':').next().unwrap_or_default().to_string();
    }
    rest.to_string()
}

/// Response time for a ping: the measured RTT when one is usable, else the
/// wall-clock time of the whole operation.
pub fn resolve_rtt_ms(measured_ms: Option<f64>, elapsed: Duration) -> u64 {
    match measured_ms {
        Some(ms) if ms.is_finite() && ms >= 0.0 => ms.round() as u64,
        _ => duration_ms(elapsed),
    }
}

/// Run a ping probe against the given address.
///
/// Never fails: unreachable hosts, timeouts and resolution errors come back
/// as `down`. No status code is ever set.
pub async fn run_ping_probe(address: &str, timeout: Duration, mode: PingMode) -> ProbeResult {
    let start = Instant::now();
    let host = strip_host(address);
    // A leading dash would reach the ping command as an option
    if host.is_empty() || host.starts_with('-') {
        return ProbeResult::down(start.elapsed(), None, format!("invalid ping address: {:?}", address));
    }

    match ping_host(&host, timeout, mode).await {
        Ok(measured_ms) => ProbeResult {
            outcome: Outcome::Up,
            response_time_ms: Some(resolve_rtt_ms(measured_ms, start.elapsed())),
            status_code: None,
            error_message: None,
        },
        Err(e) => {
            tracing::debug!("Ping probe of {} failed: {}", host, e);
            ProbeResult::down(start.elapsed(), None, e.to_string())
        }
    }
}

/// Returns the measured RTT in milliseconds, if the method produced one.
async fn ping_host(host: &str, timeout: Duration, mode: PingMode) -> Result<Option<f64>, ProbeError> {
    let use_native = match mode {
        PingMode::Native => true,
        PingMode::Command => false,
        PingMode::Auto => *ICMP_CAPABILITY.get_or_init(detect_icmp_capability) == IcmpCapability::Native,
    };

    if !use_native {
        return run_ping_command(host, timeout).await;
    }

    match run_native_ping(host, timeout).await {
        Err(ProbeError::Network(msg)) if mode == PingMode::Auto && is_permission_error(&msg) => {
            tracing::warn!(
                "Native ping failed with permission error for {}, falling back to command: {}",
                host,
                msg
            );
            run_ping_command(host, timeout).await
        }
        other => other.map(Some),
    }
}

fn is_permission_error(msg: &str) -> bool {
    msg.contains("Permission") || msg.contains("Operation not permitted") || msg.contains("denied")
}

async fn run_native_ping(host: &str, timeout: Duration) -> Result<f64, ProbeError> {
    let start = Instant::now();
    // Resolve before spawn_blocking (DNS is async)
    let ip = tokio::time::timeout(timeout, resolve_address(host))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))??;
    let remaining = timeout.saturating_sub(start.elapsed());
    if remaining.is_zero() {
        return Err(ProbeError::Timeout(timeout));
    }

    let rtt = tokio::task::spawn_blocking(move || run_blocking_ping(ip, remaining))
        .await
        .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?
        .map_err(|e| match e {
            // Report the caller's deadline, not the remainder
            ProbeError::Timeout(_) => ProbeError::Timeout(timeout),
            other => other,
        })?;

    Ok(rtt.as_secs_f64() * 1000.0)
}

async fn resolve_address(host: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    let mut addrs = tokio::net::lookup_host(format!("{}:0", host))
        .await
        .map_err(|e| ProbeError::Resolution(format!("{}: {}", host, e)))?;

    addrs
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Resolution(format!("no addresses found for {}", host)))
}

/// Open an ICMP socket for `ip`, RAW first (privileged) and DGRAM otherwise.
///
/// The flag is true for RAW sockets.
fn open_icmp_socket(ip: IpAddr) -> Result<(Socket, bool), ProbeError> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };

    if let Ok(socket) = Socket::new(domain, Type::RAW, Some(protocol)) {
        return Ok((socket, true));
    }
    Socket::new(domain, Type::DGRAM, Some(protocol))
        .map(|socket| (socket, false))
        .map_err(|e| ProbeError::Network(format!("Failed to create ICMP socket: {}", e)))
}

/// Send one echo request and wait for its reply.
/// This runs in a dedicated thread via spawn_blocking.
fn run_blocking_ping(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    let (socket, raw) = open_icmp_socket(ip)?;

    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

    let dest = SocketAddr::new(ip, 0);
    socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Network(format!("Failed to connect: {}", e)))?;

    let (identifier, sequence) = generate_ping_id();
    let packet = match ip {
        IpAddr::V4(_) => build_icmp_echo_request(identifier, sequence),
        IpAddr::V6(_) => build_icmpv6_echo_request(identifier, sequence),
    };

    // Start timing just before send
    let start = Instant::now();
    let deadline = start + timeout;

    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Network(format!("Permission denied: {}", e))
        } else {
            ProbeError::Network(format!("Failed to send: {}", e))
        }
    })?;

    let mut buf = [0u8; 1500];
    // Loop until we get OUR reply or the deadline passes
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProbeError::Timeout(timeout));
        }
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

        let len = (&socket).read(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(format!("Failed to receive: {}", e))
            }
        })?;

        // Stop timing immediately after receive
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        if is_matching_reply(ip.is_ipv4(), raw, &buf[..len], identifier, sequence) {
            return Ok(elapsed);
        }
        // Received something else, keep waiting
    }
}

/// Check whether `buf` is the echo reply for our request.
///
/// DGRAM sockets on Linux rewrite the identifier, so it is only compared on
/// RAW sockets. IPv4 replies may carry the IP header in front.
fn is_matching_reply(v4: bool, raw: bool, buf: &[u8], identifier: u16, sequence: u16) -> bool {
    let (offset, reply_type) = if v4 {
        let offset = if buf.first().map(|b| b >> 4) == Some(4) {
            usize::from(buf[0] & 0x0F) * 4
        } else {
            0
        };
        (offset, 0u8) // Echo Reply
    } else {
        (0, 129u8) // ICMPv6 Echo Reply
    };

    let Some(icmp) = buf.get(offset..) else {
        return false;
    };
    if icmp.len() < 8 || icmp[0] != reply_type {
        return false;
    }

    let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);
    reply_seq == sequence && (!raw || reply_id == identifier)
}

fn timestamp_payload() -> [u8; 8] {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    nanos.to_be_bytes()
}

/// Build an ICMP Echo Request packet (type 8, code 0).
fn build_icmp_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64]; // 8 byte header + 56 byte payload

    packet[0] = 8; // Type: Echo Request
    packet[1] = 0; // Code: 0
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    packet[8..16].copy_from_slice(&timestamp_payload());

    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());

    packet
}

/// Build an ICMPv6 Echo Request packet (type 128, code 0).
///
/// The kernel fills in the ICMPv6 checksum.
fn build_icmpv6_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];

    packet[0] = 128; // Type: Echo Request
    packet[1] = 0; // Code: 0
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    packet[8..16].copy_from_slice(&timestamp_payload());

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// Run ping via command execution (fallback).
///
/// Returns the RTT parsed from the output, or `None` when the output has no
/// recognizable timing.
async fn run_ping_command(host: &str, timeout: Duration) -> Result<Option<f64>, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);

    let child = Command::new("ping")
        .args(["-c", "1", "-W", &timeout_secs.to_string(), host])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(timeout, child)
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(classify_command_failure(&stdout, &stderr, timeout));
    }

    Ok(parse_ping_output(&stdout))
}

fn classify_command_failure(stdout: &str, stderr: &str, timeout: Duration) -> ProbeError {
    let lower_err = stderr.to_ascii_lowercase();
    if lower_err.contains("name or service not known")
        || lower_err.contains("unknown host")
        || lower_err.contains("cannot resolve")
        || lower_err.contains("temporary failure in name resolution")
    {
        return ProbeError::Resolution(stderr.trim().to_string());
    }

    if lower_err.contains("timeout")
        || stdout.contains("100% packet loss")
        || stdout.contains("100.0% packet loss")
    {
        return ProbeError::Timeout(timeout);
    }

    let detail = if stderr.trim().is_empty() { stdout.trim() } else { stderr.trim() };
    ProbeError::Command(format!("ping failed: {}", detail))
}

/// Parse ping command output for latency in milliseconds.
fn parse_ping_output(output: &str) -> Option<f64> {
    static PACKET: OnceLock<Option<Regex>> = OnceLock::new();
    static SUMMARY: OnceLock<Option<Regex>> = OnceLock::new();

    // Per-packet response "time=X.XXX ms" (Linux, macOS) or "time<1ms" (Windows)
    let packet = PACKET.get_or_init(|| Regex::new(r"time[=<](?P<val>[0-9.]+)\s*ms").ok());
    // Summary line "round-trip min/avg/max/stddev = ..." (macOS) or "rtt min/avg/max/mdev = ..." (Linux)
    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"(?:round-trip|rtt)\s+min/avg/max/(?:stddev|mdev)\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)").ok()
    });

    let per_packet = packet
        .as_ref()
        .and_then(|re| re.captures(output))
        .and_then(|caps| caps.name("val"))
        .and_then(|m| m.as_str().parse::<f64>().ok());

    // Use average (second capture group)
    per_packet.or_else(|| {
        summary
            .as_ref()
            .and_then(|re| re.captures(output))
            .and_then(|caps| caps.get(2))
            .and_then(|m| m.as_str().parse::<f64>().ok())
    })
}
