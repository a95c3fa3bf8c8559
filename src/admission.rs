//! Admission rules for inbound DCC offers.

use std::collections::HashSet;
use std::net::IpAddr;

/// Screening rules applied to every inbound file offer before any network
/// or filesystem activity.
///
/// Rules evaluate in a fixed order: IP whitelist, IP blacklist, nick
/// whitelist, nick blacklist, then the connection cap. An empty list is
/// unconfigured and its rule is skipped, so the default policy admits
/// everything. Whitelists, when non-empty, are exhaustive: membership is
/// required, not merely sufficient, and a whitelisted peer is still subject
/// to the connection cap.
#[derive(Debug, Clone, Default)]
pub struct AdmissionPolicy {
    pub ip_whitelist: HashSet<IpAddr>,
    pub ip_blacklist: HashSet<IpAddr>,
    pub nick_whitelist: HashSet<String>,
    pub nick_blacklist: HashSet<String>,
    /// Cap on simultaneous inbound transfers. Outbound sends are not
    /// counted against it.
    pub max_connections: Option<usize>,
}

impl AdmissionPolicy {
    /// Evaluate the rules for one offer. `current_receives` is the number
    /// of inbound transfers already running.
    pub fn allowed(&self, address: IpAddr, nick: &str, current_receives: usize) -> bool {
        if !self.ip_whitelist.is_empty() && !self.ip_whitelist.contains(&address) {
            return false;
        }
        if self.ip_blacklist.contains(&address) {
            return false;
        }
        if !self.nick_whitelist.is_empty() && !self.nick_whitelist.contains(nick) {
            return false;
        }
        if self.nick_blacklist.contains(nick) {
            return false;
        }
        if let Some(cap) = self.max_connections {
            if current_receives >= cap {
                return false;
            }
        }
        true
    }
}
