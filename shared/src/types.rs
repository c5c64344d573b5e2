use std::collections::{BTreeMap, BTreeSet, VecDeque};
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use crate::protocol::{DEFAULT_CONTROL_PORT, PING_HISTORY_LEN};

/// Service name -> status, as reported by a host's `/status` endpoint.
pub type ServiceMap = BTreeMap<String, ServiceStatus>;

/// One tracked machine, keyed by `address` in the registry.
/// This is the canonical data model shared by the registry daemon, its snapshot, and the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// IP literal; unique key of the registry
    pub address: String,

    /// Human label from the advertisement or manual registration
    #[serde(rename = "name", default)]
    pub display_name: String,

    /// Identity reported by the host itself, once contacted
    #[serde(default)]
    pub hostname: Option<String>,

    /// Remote control port
    #[serde(default = "default_port")]
    pub port: u16,

    /// True only if the most recent status fetch succeeded
    #[serde(default)]
    pub connected: bool,

    /// Last time the host was positively seen (advertised, announced, or answered metadata).
    /// Records without one load as the Unix epoch and are reaped unless they answer.
    #[serde(default)]
    pub last_seen: DateTime<Utc>,

    /// Last reachability probe the host answered
    #[serde(default)]
    pub last_ping: Option<DateTime<Utc>>,

    /// Last fully successful metadata fetch
    #[serde(default)]
    pub last_success: Option<DateTime<Utc>>,

    /// Most recent round-trip sample in milliseconds
    #[serde(default)]
    pub last_rtt: Option<f64>,

    /// Up to `PING_HISTORY_LEN` answered probe timestamps, oldest first
    #[serde(default)]
    pub ping_history: VecDeque<DateTime<Utc>>,

    /// Remote uptime in seconds
    #[serde(default)]
    pub uptime: Option<f64>,

    #[serde(default)]
    pub version: Option<String>,

    /// `None` whenever the last status fetch failed
    #[serde(default)]
    pub services: Option<ServiceMap>,

    /// Every address this host has been known under
    #[serde(default)]
    pub alias_addresses: BTreeSet<String>,
}

fn default_port() -> u16 {
    DEFAULT_CONTROL_PORT
}

impl Entry {
    /// Fresh record as created by discovery, registration, or a startup announcement.
    pub fn new(address: impl Into<String>, display_name: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            display_name: display_name.into(),
            hostname: None,
            port,
            connected: true,
            last_seen: Utc::now(),
            last_ping: None,
            last_success: None,
            last_rtt: None,
            ping_history: VecDeque::with_capacity(PING_HISTORY_LEN),
            uptime: None,
            version: None,
            services: None,
            alias_addresses: BTreeSet::new(),
        }
    }

    /// Name used to match duplicates: the confirmed hostname, else the advertised name.
    pub fn identity(&self) -> &str {
        self.hostname.as_deref().unwrap_or(&self.display_name)
    }

    /// Append a ping timestamp, evicting the oldest beyond `PING_HISTORY_LEN`.
    pub fn push_ping(&mut self, at: DateTime<Utc>) {
        while self.ping_history.len() >= PING_HISTORY_LEN {
            self.ping_history.pop_front();
        }
        self.ping_history.push_back(at);
    }
}

/// Status of one service running on a monitored host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub running: bool,
    #[serde(default)]
    pub pids: Vec<u32>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub mode: String,
}

/// Body of a host's `/metadata` endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostMetadata {
    #[serde(default)]
    pub uptime: Option<f64>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Manual registration and startup announcement payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announcement {
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Shutdown announcement payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownNotice {
    pub address: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_ping_history_is_bounded_fifo() {
        let mut entry = Entry::new("10.0.0.5", "render-1", 9000);
        let start = Utc::now();
        for i in 0..25 {
            entry.push_ping(start + Duration::seconds(i));
        }

        assert_eq!(entry.ping_history.len(), PING_HISTORY_LEN);
        assert_eq!(entry.ping_history.front(), Some(&(start + Duration::seconds(15))));
        assert_eq!(entry.ping_history.back(), Some(&(start + Duration::seconds(24))));
        assert!(entry.ping_history.iter().zip(entry.ping_history.iter().skip(1)).all(|(a, b)| a < b));
    }

    #[test]
    fn test_identity_prefers_hostname() {
        let mut entry = Entry::new("10.0.0.5", "render-1", 9000);
        assert_eq!(entry.identity(), "render-1");

        entry.hostname = Some("render-1.local".to_string());
        assert_eq!(entry.identity(), "render-1.local");
    }

    #[test]
    fn test_legacy_cache_record_loads_with_defaults() {
        // Shape written by the old helper: no probe fields at all
        let raw = r#"{
            "name": "Manual",
            "address": "192.168.1.20",
            "port": 9000,
            "lastSeen": "2024-05-01T10:00:00Z"
        }"#;

        let entry: Entry = serde_json::from_str(raw).unwrap();
        assert_eq!(entry.display_name, "Manual");
        assert!(!entry.connected);
        assert!(entry.services.is_none());
        assert!(entry.ping_history.is_empty());
    }

    #[test]
    fn test_record_without_last_seen_loads_as_epoch() {
        let raw = r#"{
            "10.0.0.5": { "name": "render-1", "address": "10.0.0.5", "lastSeen": "2024-05-01T10:00:00Z" },
            "10.0.0.6": { "name": "Manual", "address": "10.0.0.6" }
        }"#;

        let entries: BTreeMap<String, Entry> = serde_json::from_str(raw).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries["10.0.0.6"].last_seen, DateTime::<Utc>::default());
        assert_eq!(entries["10.0.0.6"].last_seen.timestamp(), 0);
    }

    #[test]
    fn test_status_tolerates_minimal_body() {
        let services: ServiceMap = serde_json::from_str(r#"{"encoder": {"running": true}}"#).unwrap();
        let encoder = &services["encoder"];
        assert!(encoder.running);
        assert!(encoder.pids.is_empty());
    }
}
