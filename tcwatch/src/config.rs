use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::Duration;

use clap::{ArgAction, Parser};
use tracing::warn;

/// Resolver list used when `--dns-servers` is empty or unparseable.
pub const DEFAULT_DNS_SERVERS: [&str; 2] = ["8.8.8.8:53", "1.1.1.1:53"];

const DEFAULT_INTERFACE: &str = "lo";

/// Capture configuration, frozen after construction.
///
/// Precedence for every knob is flag > environment > built-in default.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub interface: String,
    pub all_interfaces: bool,
    pub loopback_filter: bool,
    pub worker_count: usize,
    pub event_buffer_size: usize,
    pub worker_batch_size: usize,
    pub dns_enabled: bool,
    pub dns_timeout: Duration,
    pub dns_cache_size: usize,
    pub dns_cache_ttl: Duration,
    pub dns_servers: Vec<SocketAddr>,
}

/// tcwatch: per-interface network traffic observer built on TC classifier hooks
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Network interface to monitor (falls back to the IFACE env variable, then "lo").
    #[arg(short, long)]
    pub iface: Option<String>,

    /// Monitor every interface that is up instead of a single one.
    #[arg(long)]
    pub all_interfaces: bool,

    /// Drop records whose source is 127.0.0.1 (LOOPBACK env variable as fallback).
    #[arg(long, action = ArgAction::Set)]
    pub loopback: Option<bool>,

    /// Number of packet-processing workers (defaults to the host CPU count).
    #[arg(long)]
    pub workers: Option<usize>,

    /// Event channel capacity.
    #[arg(long, default_value_t = 100_000)]
    pub buffer: usize,

    /// Per-worker batch size.
    #[arg(long, default_value_t = 100)]
    pub batch: usize,

    /// Enable reverse DNS resolution for IP addresses.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub dns: bool,

    /// Per-resolve DNS deadline.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "500ms")]
    pub dns_timeout: Duration,

    /// Maximum number of DNS cache entries.
    #[arg(long, default_value_t = 10_000)]
    pub dns_cache_size: usize,

    /// DNS cache entry TTL.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5m")]
    pub dns_cache_ttl: Duration,

    /// Comma-separated list of DNS servers for reverse lookups.
    #[arg(long, default_value = "8.8.8.8:53,1.1.1.1:53")]
    pub dns_servers: String,
}

impl CaptureConfig {
    pub fn from_cli(cli: &CliArgs) -> Self {
        let interface = cli
            .iface
            .clone()
            .or_else(|| std::env::var("IFACE").ok().filter(|v| !v.is_empty()))
            .unwrap_or_else(|| DEFAULT_INTERFACE.to_string());

        let loopback_filter =
            resolve_loopback(cli.loopback, std::env::var("LOOPBACK").ok().as_deref());

        Self {
            interface,
            all_interfaces: cli.all_interfaces,
            loopback_filter,
            worker_count: cli.workers.unwrap_or_else(default_worker_count).max(1),
            event_buffer_size: cli.buffer.max(1),
            worker_batch_size: cli.batch.max(1),
            dns_enabled: cli.dns,
            dns_timeout: cli.dns_timeout,
            dns_cache_size: cli.dns_cache_size,
            dns_cache_ttl: cli.dns_cache_ttl,
            dns_servers: parse_dns_servers(&cli.dns_servers),
        }
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(4)
}

/// Resolve the loopback filter: explicit flag wins, then the LOOPBACK env
/// variable (true/false/0/1/TRUE/FALSE, other values ignored), then on.
pub fn resolve_loopback(flag: Option<bool>, env: Option<&str>) -> bool {
    if let Some(value) = flag {
        return value;
    }
    match env {
        Some("false" | "0" | "False" | "FALSE") => false,
        Some("true" | "1" | "True" | "TRUE") => true,
        _ => true,
    }
}

/// Split the server list on commas, trim empties, preserve order. Entries
/// that do not parse as `host:port` are skipped with a warning; an empty
/// result falls back to [`DEFAULT_DNS_SERVERS`].
pub fn parse_dns_servers(raw: &str) -> Vec<SocketAddr> {
    let mut servers = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.parse::<SocketAddr>() {
            Ok(addr) => servers.push(addr),
            Err(_) => warn!("ignoring invalid DNS server address {part:?}"),
        }
    }
    if servers.is_empty() {
        servers = DEFAULT_DNS_SERVERS
            .iter()
            .filter_map(|server| server.parse().ok())
            .collect();
    }
    servers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_servers_preserve_order_and_skip_empties() {
        let servers = parse_dns_servers("8.8.8.8:53,, 1.1.1.1:53 ,");
        assert_eq!(
            servers,
            vec![
                "8.8.8.8:53".parse::<SocketAddr>().unwrap(),
                "1.1.1.1:53".parse::<SocketAddr>().unwrap(),
            ]
        );
    }

    #[test]
    fn empty_dns_servers_fall_back_to_defaults() {
        let servers = parse_dns_servers("");
        assert_eq!(servers.len(), DEFAULT_DNS_SERVERS.len());
        assert_eq!(servers[0], "8.8.8.8:53".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn invalid_dns_servers_are_skipped() {
        let servers = parse_dns_servers("not-an-addr,9.9.9.9:53");
        assert_eq!(servers, vec!["9.9.9.9:53".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn loopback_flag_beats_environment() {
        assert!(!resolve_loopback(Some(false), Some("true")));
        assert!(resolve_loopback(Some(true), Some("false")));
    }

    #[test]
    fn loopback_environment_beats_default() {
        assert!(!resolve_loopback(None, Some("false")));
        assert!(!resolve_loopback(None, Some("0")));
        assert!(!resolve_loopback(None, Some("FALSE")));
        assert!(resolve_loopback(None, Some("true")));
        assert!(resolve_loopback(None, Some("1")));
    }

    #[test]
    fn loopback_defaults_on() {
        assert!(resolve_loopback(None, None));
        assert!(resolve_loopback(None, Some("maybe")));
    }

    #[test]
    fn cli_defaults_match_documented_values() {
        let cli = CliArgs::parse_from(["tcwatch"]);
        assert_eq!(cli.buffer, 100_000);
        assert_eq!(cli.batch, 100);
        assert!(cli.dns);
        assert_eq!(cli.dns_timeout, Duration::from_millis(500));
        assert_eq!(cli.dns_cache_size, 10_000);
        assert_eq!(cli.dns_cache_ttl, Duration::from_secs(300));
    }
}
