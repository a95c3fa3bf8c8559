//! Configuration data model.
//!
//! All structs derive `Serialize`/`Deserialize` for TOML persistence.
//! Every field has a sensible default so the subsystem works out of the box.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::admission::AdmissionPolicy;

/// DCC transfer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DccConfig {
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// No reply on a data socket for this long fails the transfer. Absent
    /// means wait forever.
    #[serde(default)]
    pub read_timeout_secs: Option<u64>,
    /// Patience for a peer that was invited but never connects.
    #[serde(default)]
    pub accept_timeout_secs: Option<u64>,
    #[serde(default)]
    pub ip_whitelist: Vec<IpAddr>,
    #[serde(default)]
    pub ip_blacklist: Vec<IpAddr>,
    #[serde(default)]
    pub nick_whitelist: Vec<String>,
    #[serde(default)]
    pub nick_blacklist: Vec<String>,
    /// Cap on simultaneous inbound transfers.
    #[serde(default)]
    pub max_connections: Option<usize>,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default)]
    pub reject_private_ips: bool,
    /// Address advertised in outbound offers. Sending is disabled until it
    /// is set; there is no reliable way to guess the address peers can
    /// reach us on.
    #[serde(default)]
    pub local_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for DccConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            read_timeout_secs: None,
            accept_timeout_secs: None,
            ip_whitelist: Vec::new(),
            ip_blacklist: Vec::new(),
            nick_whitelist: Vec::new(),
            nick_blacklist: Vec::new(),
            max_connections: None,
            max_file_size: default_max_file_size(),
            reject_private_ips: false,
            local_ip: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl DccConfig {
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            read: self.read_timeout_secs.map(Duration::from_secs),
            accept: self.accept_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn admission_policy(&self) -> AdmissionPolicy {
        AdmissionPolicy {
            ip_whitelist: self.ip_whitelist.iter().copied().collect(),
            ip_blacklist: self.ip_blacklist.iter().copied().collect(),
            nick_whitelist: self.nick_whitelist.iter().cloned().collect(),
            nick_blacklist: self.nick_blacklist.iter().cloned().collect(),
            max_connections: self.max_connections,
        }
    }
}

/// Resolved timeout durations handed to sessions.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub read: Option<Duration>,
    pub accept: Option<Duration>,
}

/// Transfer logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_true")]
    pub log_transfers: bool,
    #[serde(default)]
    pub log_requests: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_dir: default_log_dir(),
            log_transfers: true,
            log_requests: false,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}
fn default_max_file_size() -> u64 {
    500 * 1024 * 1024 // 500 MB
}
fn default_log_dir() -> String {
    "~/.local/share/crabdcc/logs".to_string()
}
