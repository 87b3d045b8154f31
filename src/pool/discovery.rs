//! Topology discovery from the `rethinkdb.server_status` changefeed.
//!
//! The feed starts with the current servers (`include_initial`) bracketed by
//! `{"state": "initializing"}` and `{"state": "ready"}` rows, then streams
//! `{new_val, old_val}` changes. [`DiscoveryTracker`] turns those rows into
//! add/remove decisions against the currently known server list.

use std::net::IpAddr;

use serde::Deserialize;
use serde_json::Value;

use crate::config::ServerAddress;
use crate::error::{Error, ErrorKind, Result};
use crate::reql::Term;

/// Delay before restarting discovery after the feed fails.
pub const DISCOVERY_RETRY_DELAY_SECS: u64 = 20;

/// One address a server reports for itself.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CanonicalAddress {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerNetwork {
    #[serde(default)]
    pub canonical_addresses: Vec<CanonicalAddress>,
    #[serde(default)]
    pub hostname: String,
    pub reql_port: u16,
}

/// The fields of a `server_status` document used here.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerStatus {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub network: ServerNetwork,
}

/// `r.db("rethinkdb").table("server_status").changes(...)`
pub fn discovery_query() -> Term {
    Term::changes(Term::table_in("rethinkdb", "server_status"))
        .with_optarg("include_initial", Term::datum(true))
        .with_optarg("include_states", Term::datum(true))
}

/// Lower is more local: loopback, link-local, private, site-local, public.
fn address_rank(host: &str) -> u8 {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            let [a, b, ..] = ip.octets();
            if ip.is_loopback() {
                0
            } else if a == 169 && b == 254 {
                2
            } else if a == 192 && b == 168 {
                3
            } else if a == 172 && (16..=31).contains(&b) {
                4
            } else if a == 10 {
                5
            } else {
                7
            }
        }
        Ok(IpAddr::V6(ip)) => {
            let first = ip.segments()[0];
            if ip.is_loopback() {
                0
            } else if first & 0xffc0 == 0xfe80 {
                1
            } else if first & 0xfe00 == 0xfc00 || first & 0xffc0 == 0xfec0 {
                6
            } else {
                7
            }
        }
        Err(_) => 7,
    }
}

/// Pick the most local address; the first wins among equals.
pub fn canonical_address(addresses: &[CanonicalAddress]) -> Option<&CanonicalAddress> {
    addresses.iter().min_by_key(|address| address_rank(&address.host))
}

/// Map a status document to a server address, preferring a known server
/// that matches its hostname or one of its addresses.
pub fn server_from_status(status: &ServerStatus, known: &[ServerAddress]) -> ServerAddress {
    let network = &status.network;
    let existing = known.iter().find(|server| {
        server.port == network.reql_port
            && (server.host == network.hostname
                || network.canonical_addresses.iter().any(|a| a.host == server.host))
    });
    if let Some(server) = existing {
        return server.clone();
    }
    let host = canonical_address(&network.canonical_addresses)
        .map(|address| address.host.clone())
        .unwrap_or_else(|| network.hostname.clone());
    ServerAddress::new(host, network.reql_port)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryChange {
    Add(ServerAddress),
    Remove(ServerAddress),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedState {
    Initializing,
    Ready,
}

/// Per-feed bookkeeping of which servers the initial snapshot contained.
#[derive(Debug)]
pub struct DiscoveryTracker {
    state: FeedState,
    initial: Vec<ServerAddress>,
}

impl Default for DiscoveryTracker {
    fn default() -> Self {
        Self {
            state: FeedState::Initializing,
            initial: Vec::new(),
        }
    }
}

impl DiscoveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.state == FeedState::Ready
    }

    /// Changes implied by one feed row, given the servers known right now.
    ///
    /// Once the feed is ready, known servers missing from the initial
    /// snapshot are removed.
    pub fn observe(&mut self, row: &Value, known: &[ServerAddress]) -> Result<Vec<DiscoveryChange>> {
        let mut changes = Vec::new();

        if let Some(state) = row.get("state").and_then(Value::as_str) {
            if state == "ready" {
                self.state = FeedState::Ready;
                changes.extend(
                    known
                        .iter()
                        .filter(|server| !self.initial.contains(server))
                        .cloned()
                        .map(DiscoveryChange::Remove),
                );
            } else {
                self.state = FeedState::Initializing;
            }
        }

        match (row.get("new_val"), row.get("old_val")) {
            (Some(new_val), _) if !new_val.is_null() => {
                let server = server_from_status(&parse_status(new_val)?, known);
                if self.state == FeedState::Initializing {
                    self.initial.push(server.clone());
                }
                if !known.contains(&server) {
                    changes.push(DiscoveryChange::Add(server));
                }
            }
            (_, Some(old_val)) if !old_val.is_null() => {
                let server = server_from_status(&parse_status(old_val)?, known);
                changes.push(DiscoveryChange::Remove(server));
            }
            _ => {}
        }
        Ok(changes)
    }
}

fn parse_status(value: &Value) -> Result<ServerStatus> {
    serde_json::from_value(value.clone()).map_err(|e| {
        Error::new(ErrorKind::Parse, format!("Malformed server status: {}", e)).with_cause(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn addr(host: &str) -> CanonicalAddress {
        CanonicalAddress {
            host: host.to_string(),
            port: 29015,
        }
    }

    fn status(hostname: &str, hosts: &[&str]) -> Value {
        json!({
            "id": hostname,
            "name": hostname,
            "network": {
                "hostname": hostname,
                "reql_port": 28015,
                "canonical_addresses": hosts.iter().map(|h| json!({"host": h, "port": 29015})).collect::<Vec<_>>(),
            }
        })
    }

    #[test]
    fn test_loopback_ranks_first() {
        let addresses = [addr("203.0.113.5"), addr("127.0.0.1")];
        assert_eq!(canonical_address(&addresses).unwrap().host, "127.0.0.1");
    }

    #[test]
    fn test_rank_order() {
        let ordered = [
            "::1",
            "fe80::1",
            "169.254.3.4",
            "192.168.1.2",
            "172.20.0.1",
            "10.0.0.7",
            "fd00::5",
            "8.8.8.8",
        ];
        for pair in ordered.windows(2) {
            assert!(address_rank(pair[0]) < address_rank(pair[1]), "{:?}", pair);
        }
        assert_eq!(address_rank("172.32.0.1"), 7);
        assert_eq!(address_rank("db.internal"), 7);
    }

    #[test]
    fn test_prefers_known_server() {
        let known = vec![ServerAddress::new("10.0.0.7", 28015)];
        let status: ServerStatus =
            serde_json::from_value(status("db1", &["127.0.0.1", "10.0.0.7"])).unwrap();
        assert_eq!(server_from_status(&status, &known), known[0]);
        assert_eq!(
            server_from_status(&status, &[]),
            ServerAddress::new("127.0.0.1", 28015)
        );
    }

    #[test]
    fn test_tracker_adds_and_prunes() {
        let stale = ServerAddress::new("10.9.9.9", 28015);
        let mut known = vec![ServerAddress::new("127.0.0.1", 28015), stale.clone()];
        let mut tracker = DiscoveryTracker::new();

        assert!(tracker.observe(&json!({"state": "initializing"}), &known).unwrap().is_empty());
        let changes = tracker
            .observe(&json!({"new_val": status("db1", &["127.0.0.1"])}), &known)
            .unwrap();
        assert!(changes.is_empty());

        let changes = tracker
            .observe(&json!({"new_val": status("db2", &["192.168.0.2"])}), &known)
            .unwrap();
        let added = ServerAddress::new("192.168.0.2", 28015);
        assert_eq!(changes, vec![DiscoveryChange::Add(added.clone())]);
        known.push(added.clone());

        let changes = tracker.observe(&json!({"state": "ready"}), &known).unwrap();
        assert_eq!(changes, vec![DiscoveryChange::Remove(stale)]);
        assert!(tracker.is_ready());

        let changes = tracker
            .observe(&json!({"new_val": null, "old_val": status("db2", &["192.168.0.2"])}), &known)
            .unwrap();
        assert_eq!(changes, vec![DiscoveryChange::Remove(added)]);
    }

    #[test]
    fn test_query_shape() {
        let json = discovery_query().to_json();
        assert_eq!(json[0], 152);
        assert_eq!(json[1][0], json!([15, [[14, ["rethinkdb"]], "server_status"]]));
        assert_eq!(json[2]["include_initial"], true);
    }
}
