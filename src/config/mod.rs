#[cfg(test)]
mod config_test;

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::logging;

pub const DEFAULT_UDP_SEND_PACKET_SIZE: usize = 1024;
/// Ethernet MTU 1500 minus the TCP/IP headers.
pub const DEFAULT_TCP_SEND_PACKET_SIZE: usize = 1460;
/// IP datagram ceiling (65535) minus the IP/UDP headers (28).
pub const DEFAULT_RECEIVE_PACKET_SIZE: usize = 65507;
pub const DEFAULT_RECV_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_THREAD_POOL_SIZE: usize = 3;
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;
pub const DEFAULT_LISTEN_BACKLOG: u32 = 10;
pub const DEFAULT_KEEPALIVE_SECS: u64 = 60;

/// Transport variant selected by the `protocol` configuration key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Udp,
    Tcp,
}

/// One entry of `listen_list`, `connect_list` or `send_list`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PeerEntry {
    #[serde(rename = "ID", default)]
    pub id: Option<String>,
    #[serde(rename = "IP", default)]
    pub ip: String,
    #[serde(rename = "Port")]
    pub port: u16,
}

/// The engine configuration document. Every key is optional; missing keys
/// fall back to the defaults above.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub protocol: Protocol,
    /// 0 = trace .. 5 = critical.
    pub runtime_log_level: i32,
    /// Directory for the rotating log files; empty logs to stderr.
    pub log_save_path: String,
    /// Per-fragment ceiling; protocol-dependent when absent.
    pub max_send_packet_size: Option<usize>,
    pub max_receive_packet_size: usize,
    pub recv_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Default source address bound to send sockets and dials; empty ip and
    /// zero port leave the choice to the OS.
    pub source_ip: String,
    pub source_port: u16,
    pub thread_pool_size: usize,
    pub max_connections: usize,
    pub listen_backlog: u32,
    /// TCP keepalive probe interval in seconds; 0 disables keepalive.
    pub keepalive: u64,
    pub listen_list: Vec<PeerEntry>,
    pub connect_list: Vec<PeerEntry>,
    pub send_list: Vec<PeerEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            protocol: Protocol::default(),
            runtime_log_level: logging::GLOBAL_LOG_LEVEL,
            log_save_path: String::new(),
            max_send_packet_size: None,
            max_receive_packet_size: DEFAULT_RECEIVE_PACKET_SIZE,
            recv_timeout_ms: DEFAULT_RECV_TIMEOUT_MS,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            source_ip: String::new(),
            source_port: 0,
            thread_pool_size: DEFAULT_THREAD_POOL_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            keepalive: DEFAULT_KEEPALIVE_SECS,
            listen_list: Vec::new(),
            connect_list: Vec::new(),
            send_list: Vec::new(),
        }
    }
}

impl Config {
    /// Loads a configuration document. A missing path yields the built-in
    /// defaults; an unreadable or unidentifiable file is an error.
    pub fn load(path: Option<&str>) -> Result<Config> {
        let path = match path {
            Some(p) if !p.is_empty() => p,
            _ => return Ok(Config::default()),
        };

        let content = fs::read_to_string(path)?;
        let config: Config = match identify_format(path, &content) {
            Some(DocumentFormat::Json) => serde_json::from_str(&content)?,
            Some(DocumentFormat::Yaml) => serde_yaml::from_str(&content)?,
            None => return Err(Error::ErrUnsupportedConfig(path.to_owned())),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_send_packet_size == Some(0) {
            return Err(Error::ErrInvalidConfig(
                "max_send_packet_size must be positive".to_owned(),
            ));
        }
        if self.max_receive_packet_size == 0 {
            return Err(Error::ErrInvalidConfig(
                "max_receive_packet_size must be positive".to_owned(),
            ));
        }
        Ok(())
    }

    /// The per-fragment send ceiling, falling back to the protocol default.
    /// Never zero, so fragmentation always makes progress.
    pub fn send_packet_size(&self) -> usize {
        self.max_send_packet_size
            .filter(|&size| size > 0)
            .unwrap_or(match self.protocol {
                Protocol::Udp => DEFAULT_UDP_SEND_PACKET_SIZE,
                Protocol::Tcp => DEFAULT_TCP_SEND_PACKET_SIZE,
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentFormat {
    Json,
    Yaml,
}

/// Identifies the document format, first by file extension, then by
/// probing the content.
fn identify_format(path: &str, content: &str) -> Option<DocumentFormat> {
    match Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("json") => return Some(DocumentFormat::Json),
        Some("yaml") | Some("yml") => return Some(DocumentFormat::Yaml),
        _ => {}
    }

    // A bare scalar parses as both formats; only a mapping is a plausible
    // configuration document.
    if matches!(
        serde_json::from_str::<serde_json::Value>(content),
        Ok(serde_json::Value::Object(_))
    ) {
        return Some(DocumentFormat::Json);
    }
    if matches!(
        serde_yaml::from_str::<serde_yaml::Value>(content),
        Ok(serde_yaml::Value::Mapping(_))
    ) {
        return Some(DocumentFormat::Yaml);
    }
    None
}
