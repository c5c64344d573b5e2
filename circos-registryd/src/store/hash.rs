use std::collections::BTreeSet;
use serde::Serialize;
use sha2::{Sha256, Digest};
use shared::types::ServiceMap;
use crate::store::registry::EntryMap;

/// Hash only what a dashboard renders as state: timestamps, RTT samples and
/// ping history move on every pass without anything meaningful changing.
#[derive(Serialize)]
struct HashView<'a> {
    address: &'a str,
    name: &'a str,
    hostname: Option<&'a str>,
    port: u16,
    connected: bool,
    version: Option<&'a str>,
    services: Option<&'a ServiceMap>,
    aliases: &'a BTreeSet<String>,
}

/// Computes a SHA-256 fingerprint of the registry.
/// The map is ordered by address, so equal registries always hash equally.
pub fn compute_hash(entries: &EntryMap) -> String {
    let views: Vec<HashView<'_>> = entries
        .iter()
        .map(|(address, e)| HashView {
            address,
            name: &e.display_name,
            hostname: e.hostname.as_deref(),
            port: e.port,
            connected: e.connected,
            version: e.version.as_deref(),
            services: e.services.as_ref(),
            aliases: &e.alias_addresses,
        })
        .collect();

    // Plain strings, integers and string-keyed maps always serialize
    let json = serde_json::to_vec(&views).unwrap_or_default();
    hex::encode(Sha256::digest(&json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use shared::types::Entry;

    fn registry(entries: Vec<Entry>) -> EntryMap {
        entries.into_iter().map(|e| (e.address.clone(), e)).collect()
    }

    #[test]
    fn test_hash_deterministic() {
        let a = Entry::new("10.0.0.5", "a", 9000);
        let b = Entry::new("10.0.0.6", "b", 9000);

        let hash1 = compute_hash(&registry(vec![a.clone(), b.clone()]));
        let hash2 = compute_hash(&registry(vec![b, a]));

        assert_eq!(hash1, hash2, "Hash should be same regardless of insertion order");
    }

    #[test]
    fn test_hash_changes_on_modification() {
        let a = Entry::new("10.0.0.5", "a", 9000);
        let mut b = a.clone();
        b.connected = false;

        assert_ne!(
            compute_hash(&registry(vec![a])),
            compute_hash(&registry(vec![b])),
            "Hash should change when connectivity changes"
        );
    }

    #[test]
    fn test_hash_stable_across_probe_timestamps() {
        let a = Entry::new("10.0.0.5", "a", 9000);
        let mut b = a.clone();
        b.last_seen = Utc::now() + Duration::seconds(60);
        b.last_ping = Some(Utc::now());
        b.last_rtt = Some(3.2);
        b.push_ping(Utc::now());
        b.uptime = Some(99.0);

        assert_eq!(
            compute_hash(&registry(vec![a])),
            compute_hash(&registry(vec![b])),
            "Hash should not change when only probe timing changes"
        );
    }
}
