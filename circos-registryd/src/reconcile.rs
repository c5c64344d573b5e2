//! Reconciliation passes over the whole registry.
//!
//! For every address, in order: stale check, re-resolution when disconnected,
//! then the probe sequence. Per-entry failures are logged and skipped; a pass
//! always visits every address it started with and writes the snapshot at
//! most once, only if something changed.

use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use tokio::sync::Mutex;
use shared::address::is_loopback;
use crate::config::{ProbeConfig, RegistryConfig};
use crate::probe::{self, HostProber};
use crate::reaper::{self, Verdict};
use crate::resolve::{self, AddressResolver};
use crate::store_manager::StoreHandle;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    pub visited: usize,
    pub reaped: usize,
    pub relocated: usize,
    pub failed: usize,
    pub changed: bool,
    pub persisted: bool,
}

pub struct Reconciler {
    store: StoreHandle,
    prober: Arc<dyn HostProber>,
    resolver: Arc<dyn AddressResolver>,
    stale_timeout: Duration,
    probe_timeout: Duration,
    /// Held for the duration of a pass; later triggers queue behind it
    in_flight: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        store: StoreHandle,
        prober: Arc<dyn HostProber>,
        resolver: Arc<dyn AddressResolver>,
        registry: &RegistryConfig,
        probe: &ProbeConfig,
    ) -> Self {
        Self {
            store,
            prober,
            resolver,
            stale_timeout: registry.stale_timeout(),
            probe_timeout: probe.timeout(),
            in_flight: Mutex::new(()),
        }
    }

    /// Run one full pass. Waits for any pass already running to finish first.
    pub async fn run_pass(&self) -> PassSummary {
        let _guard = self.in_flight.lock().await;
        let mut summary = PassSummary::default();

        let addresses = match self.store.addresses().await {
            Ok(addresses) => addresses,
            Err(e) => {
                tracing::error!("Pass aborted, store unavailable: {:#}", e);
                return summary;
            }
        };

        for address in addresses {
            summary.visited += 1;
            match self.reconcile_entry(&address, &mut summary).await {
                Ok(changed) => summary.changed |= changed,
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!("Reconciling {} failed: {:#}", address, e);
                }
            }
        }

        if summary.changed {
            match self.store.persist().await {
                Ok(()) => summary.persisted = true,
                Err(e) => tracing::error!("Pass result not persisted: {:#}", e),
            }
        }

        tracing::debug!(?summary, "Pass complete");
        summary
    }

    async fn reconcile_entry(&self, address: &str, summary: &mut PassSummary) -> Result<bool> {
        // Merged away earlier in this pass
        let Some(entry) = self.store.get(address).await? else {
            return Ok(false);
        };

        let verdict = reaper::check(
            &self.store,
            self.prober.as_ref(),
            &entry,
            self.stale_timeout,
            self.probe_timeout,
        )
        .await?;
        match verdict {
            Verdict::Reaped => {
                summary.reaped += 1;
                return Ok(true);
            }
            // The newer write wins; the next pass probes it
            Verdict::Refreshed => return Ok(false),
            Verdict::Fresh | Verdict::StaleReachable => {}
        }

        let mut changed = false;
        let mut key = address.to_string();

        if !entry.connected {
            let name = entry.identity();
            if !name.is_empty() {
                if let Some(resolved) = resolve::resolve(self.resolver.as_ref(), name, self.probe_timeout).await {
                    if resolved != key && !is_loopback(&resolved) {
                        tracing::info!("{} moved from {} to {}", name, key, resolved);
                        if self.store.relocate(key.as_str(), resolved.as_str()).await? {
                            changed = true;
                            summary.relocated += 1;
                        }
                        key = resolved;
                    }
                }
            }
        }

        let report = probe::probe_entry(
            &self.store,
            self.prober.as_ref(),
            &key,
            entry.port,
            self.probe_timeout,
        )
        .await?;
        if !report.reachable {
            tracing::debug!("{} unreachable this pass", report.address);
        }

        Ok(changed || report.changed)
    }
}
