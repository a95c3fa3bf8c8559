//! Transfer logging to disk.
//!
//! When enabled, writes one line per transfer outcome (and optionally per
//! inbound offer) to daily log files named `transfers_<date>.log` in the
//! configured log directory (default: `~/.local/share/crabdcc/logs/`).

use crate::config::LoggingConfig;
use crate::event::DccEvent;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

/// Install a process-global subscriber that formats diagnostics to stdout.
/// Embedders usually install their own; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_target(false).try_init();
}

/// Writes transfer outcomes to daily log files.
///
/// File handles are cached for the lifetime of the logger to avoid repeated
/// opens. Falls back to `/dev/null` if a log file cannot be created.
pub struct TransferLogger {
    enabled: bool,
    log_dir: String,
    log_transfers: bool,
    log_requests: bool,
    file_handles: HashMap<String, fs::File>,
}

impl TransferLogger {
    pub fn new(config: &LoggingConfig) -> Self {
        Self {
            enabled: config.enabled,
            log_dir: config.log_dir.clone(),
            log_transfers: config.log_transfers,
            log_requests: config.log_requests,
            file_handles: HashMap::new(),
        }
    }

    /// Write one line for an event worth keeping. No-op if logging is
    /// disabled or the event class is not configured for logging.
    pub fn log_event(&mut self, event: &DccEvent) {
        if !self.enabled {
            return;
        }

        let stamp = chrono::Local::now().format("%H:%M:%S");
        let line = match event {
            DccEvent::FileRequest {
                nick,
                address,
                file,
                size,
                ..
            } if self.log_requests => {
                format!(
                    "[{}] ? offer \"{}\" ({}) from {} ({})",
                    stamp,
                    file,
                    describe_size(*size),
                    nick,
                    address
                )
            }
            DccEvent::FileRecvCompleted {
                address,
                port,
                file,
                size,
            } if self.log_transfers => {
                format!(
                    "[{}] <<< received {} ({}) from {}:{}",
                    stamp,
                    file.display(),
                    describe_size(*size),
                    address,
                    port
                )
            }
            DccEvent::FileRecvCancelled {
                address,
                port,
                file,
                error,
            } if self.log_transfers => {
                format!(
                    "[{}] !!! receive of {} from {}:{} failed: {}",
                    stamp,
                    file.display(),
                    address,
                    port,
                    error
                )
            }
            DccEvent::FileSendCompleted {
                file,
                address,
                port,
            } if self.log_transfers => {
                format!("[{}] >>> sent {} via {}:{}", stamp, file.display(), address, port)
            }
            DccEvent::FileSendCancelled {
                address,
                port,
                file,
                error,
            } if self.log_transfers => {
                format!(
                    "[{}] !!! send of {} via {}:{} failed: {}",
                    stamp,
                    file.display(),
                    address,
                    port,
                    error
                )
            }
            _ => return,
        };

        let date = chrono::Local::now().format("%Y-%m-%d").to_string();
        let filename = format!("transfers_{}.log", date);

        // Expand ~ in log_dir
        let log_dir = if self.log_dir.starts_with('~') {
            if let Some(home) = dirs::home_dir() {
                home.join(&self.log_dir[2..])
            } else {
                PathBuf::from(&self.log_dir)
            }
        } else {
            PathBuf::from(&self.log_dir)
        };

        let filepath = log_dir.join(&filename);

        // Get or create file handle
        let handle = self.file_handles.entry(filename.clone()).or_insert_with(|| {
            let _ = fs::create_dir_all(&log_dir);
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&filepath)
                .unwrap_or_else(|_| {
                    // Fallback: create a temp file that goes nowhere
                    OpenOptions::new()
                        .write(true)
                        .open(if cfg!(unix) { "/dev/null" } else { "NUL" })
                        .unwrap()
                })
        });

        let _ = writeln!(handle, "{}", line);
    }
}

fn describe_size(size: Option<u64>) -> String {
    match size {
        Some(n) => format!("{} bytes", n),
        None => "unknown size".to_string(),
    }
}
