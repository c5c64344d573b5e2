use std::time::Duration;
use anyhow::Result;
use chrono::{DateTime, Utc};
use shared::types::Entry;
use crate::probe::{bounded, HostProber};
use crate::store_manager::StoreHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Fresh,
    /// Stale but answered the probe; keeps being reconciled
    StaleReachable,
    /// Refreshed by another writer while the probe was out; left alone
    Refreshed,
    Reaped,
}

pub fn is_stale(entry: &Entry, now: DateTime<Utc>, timeout: Duration) -> bool {
    match chrono::Duration::from_std(timeout) {
        Ok(timeout) => now.signed_duration_since(entry.last_seen) > timeout,
        Err(_) => false,
    }
}

/// Give a stale entry one reachability probe and delete it if that fails.
///
/// `entry` is a snapshot taken before the probe. The delete only goes through
/// if nothing has refreshed the stored record since then.
pub async fn check(
    store: &StoreHandle,
    prober: &dyn HostProber,
    entry: &Entry,
    stale_timeout: Duration,
    probe_timeout: Duration,
) -> Result<Verdict> {
    if !is_stale(entry, Utc::now(), stale_timeout) {
        return Ok(Verdict::Fresh);
    }

    match bounded(probe_timeout, prober.ping(&entry.address, entry.port)).await {
        Ok(_) => Ok(Verdict::StaleReachable),
        Err(e) => {
            if !store.remove_if_unseen_since(entry.address.as_str(), entry.last_seen).await? {
                tracing::debug!("{} was refreshed while being probed, keeping it", entry.address);
                return Ok(Verdict::Refreshed);
            }
            tracing::info!(
                "Removed {} ({}): unseen since {} and {}",
                entry.address,
                entry.identity(),
                entry.last_seen,
                e
            );
            Ok(Verdict::Reaped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_staleness_threshold() {
        let now = Utc::now();
        let timeout = Duration::from_secs(600);
        let mut entry = Entry::new("10.0.0.5", "render-1", 9000);

        entry.last_seen = now - ChronoDuration::minutes(20);
        assert!(is_stale(&entry, now, timeout));

        entry.last_seen = now - ChronoDuration::minutes(5);
        assert!(!is_stale(&entry, now, timeout));
    }
}
