use shared::address::is_loopback;
use shared::types::Entry;
use crate::store::registry::EntryMap;

/// Fold every entry whose identity is `hostname` into a single record.
///
/// All candidates, `canonical` included, compete at once: the freshest
/// `last_success` wins (missing counts as oldest), ties go to the canonical
/// key and then to the smallest address. The merged record takes the winner's
/// fields, fills metadata the winner lacks from the next freshest candidate,
/// and remembers every address involved. The confirmed hostname is only ever
/// carried over from a candidate that reported one; a merge by advertised
/// name alone leaves it unset.
///
/// The record lands under `canonical` unless that key is loopback and a
/// routable duplicate exists, in which case the freshest routable duplicate
/// becomes canonical. Returns the key holding the merged record, or `None`
/// when there were no duplicates. A second call with the same arguments is a
/// no-op.
pub fn merge_duplicates(entries: &mut EntryMap, canonical: &str, hostname: &str) -> Option<String> {
    if !entries.contains_key(canonical) {
        return None;
    }

    let duplicates: Vec<String> = entries
        .iter()
        .filter(|(key, entry)| key.as_str() != canonical && entry.identity() == hostname)
        .map(|(key, _)| key.clone())
        .collect();

    if duplicates.is_empty() {
        return None;
    }

    let mut candidates: Vec<(String, Entry)> = std::iter::once(canonical.to_string())
        .chain(duplicates)
        .filter_map(|key| entries.remove(&key).map(|entry| (key, entry)))
        .collect();

    let target = if is_loopback(canonical) {
        candidates
            .iter()
            .filter(|(key, _)| !is_loopback(key))
            .max_by(|(ka, a), (kb, b)| a.last_success.cmp(&b.last_success).then_with(|| kb.cmp(ka)))
            .map(|(key, _)| key.clone())
            .unwrap_or_else(|| canonical.to_string())
    } else {
        canonical.to_string()
    };

    candidates.sort_by(|(ka, a), (kb, b)| {
        b.last_success
            .cmp(&a.last_success)
            .then_with(|| (*kb == target).cmp(&(*ka == target)))
            .then_with(|| ka.cmp(kb))
    });

    let mut rest = candidates.into_iter();
    let Some((winner_key, mut merged)) = rest.next() else {
        return None;
    };
    merged.alias_addresses.insert(winner_key);

    for (key, other) in rest {
        if merged.display_name.is_empty() {
            merged.display_name = other.display_name.clone();
        }
        merged.hostname = merged.hostname.or(other.hostname);
        merged.uptime = merged.uptime.or(other.uptime);
        merged.version = merged.version.or(other.version);
        merged.last_rtt = merged.last_rtt.or(other.last_rtt);
        merged.last_ping = merged.last_ping.or(other.last_ping);
        merged.alias_addresses.extend(other.alias_addresses);
        merged.alias_addresses.insert(key);
    }

    merged.address = target.clone();

    tracing::info!(
        "Merged {} address(es) of {} into {}",
        merged.alias_addresses.len(),
        hostname,
        target
    );

    entries.insert(target.clone(), merged);
    Some(target)
}
