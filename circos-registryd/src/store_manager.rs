use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use shared::address::is_loopback;
use shared::types::Entry;
use crate::reconcile::{PassSummary, Reconciler};
use crate::store::{hash, EntryMap, Registry};
pub use crate::mdns::browser::DiscoveryEvent;

/// In-place edit applied on the store thread.
pub type EntryEdit = Box<dyn FnOnce(&mut Entry) + Send>;

/// Commands sent to the store thread
pub enum StoreCommand {
    /// Overwrite an entry, optionally merge duplicates of a name, then persist.
    Put {
        entry: Entry,
        merge_as: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Register or refresh a named host, then persist.
    Upsert {
        address: String,
        name: Option<String>,
        port: u16,
        connect: bool,
        reply: oneshot::Sender<Result<bool>>,
    },
    MarkShutdown(String, oneshot::Sender<Result<bool>>),
    Get(String, oneshot::Sender<Option<Entry>>),
    GetAll(oneshot::Sender<EntryMap>),
    Addresses(oneshot::Sender<Vec<String>>),
    Update(String, EntryEdit, oneshot::Sender<Option<bool>>),
    /// Remove unless the entry was seen after `seen`
    RemoveIfUnseenSince {
        address: String,
        seen: DateTime<Utc>,
        reply: oneshot::Sender<bool>,
    },
    Merge {
        canonical: String,
        hostname: String,
        reply: oneshot::Sender<Option<String>>,
    },
    Relocate {
        from: String,
        to: String,
        reply: oneshot::Sender<bool>,
    },
    Persist(oneshot::Sender<Result<()>>),
    Shutdown,
}

/// Handle to the registry. All mutation happens on one thread, in command order.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

fn persist_loudly(registry: &Registry) -> Result<()> {
    registry.persist().map_err(|e| {
        tracing::error!(
            "Snapshot write to {} failed, in-memory registry now diverges from disk: {:#}",
            registry.path().display(),
            e
        );
        e
    })
}

impl StoreHandle {
    /// Spawn the store thread owning `registry`
    pub fn spawn(mut registry: Registry, hash_tx: watch::Sender<String>) -> Self {
        let (tx, mut rx) = mpsc::channel::<StoreCommand>(256);

        // Only recompute the fingerprint after commands that changed something
        let publish = |registry: &Registry, hash_tx: &watch::Sender<String>| {
            let _ = hash_tx.send(hash::compute_hash(registry.all_entries()));
        };

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    StoreCommand::Put { entry, merge_as, reply } => {
                        let address = entry.address.clone();
                        let mut changed = registry.put(&address, entry);
                        if let Some(name) = merge_as {
                            changed |= registry.merge(&address, &name).is_some();
                        }
                        let result = if changed {
                            publish(&registry, &hash_tx);
                            persist_loudly(&registry)
                        } else {
                            Ok(())
                        };
                        let _ = reply.send(result);
                    }
                    StoreCommand::Upsert { address, name, port, connect, reply } => {
                        let changed = registry.upsert(&address, name.as_deref(), port, connect);
                        if changed {
                            publish(&registry, &hash_tx);
                        }
                        // last_seen always moves, so always persist
                        let _ = reply.send(persist_loudly(&registry).map(|_| changed));
                    }
                    StoreCommand::MarkShutdown(address, reply) => {
                        let result = if registry.mark_shutdown(&address) {
                            publish(&registry, &hash_tx);
                            persist_loudly(&registry).map(|_| true)
                        } else {
                            Ok(false)
                        };
                        let _ = reply.send(result);
                    }
                    StoreCommand::Get(address, reply) => {
                        let _ = reply.send(registry.get(&address).cloned());
                    }
                    StoreCommand::GetAll(reply) => {
                        let _ = reply.send(registry.all_entries().clone());
                    }
                    StoreCommand::Addresses(reply) => {
                        let _ = reply.send(registry.addresses());
                    }
                    StoreCommand::Update(address, edit, reply) => {
                        let result = registry.update(&address, edit);
                        if result == Some(true) {
                            publish(&registry, &hash_tx);
                        }
                        let _ = reply.send(result);
                    }
                    StoreCommand::RemoveIfUnseenSince { address, seen, reply } => {
                        let removed = registry.delete_if_unseen_since(&address, seen);
                        if removed {
                            publish(&registry, &hash_tx);
                        }
                        let _ = reply.send(removed);
                    }
                    StoreCommand::Merge { canonical, hostname, reply } => {
                        let result = registry.merge(&canonical, &hostname);
                        if result.is_some() {
                            publish(&registry, &hash_tx);
                        }
                        let _ = reply.send(result);
                    }
                    StoreCommand::Relocate { from, to, reply } => {
                        let moved = registry.relocate(&from, &to);
                        if moved {
                            publish(&registry, &hash_tx);
                        }
                        let _ = reply.send(moved);
                    }
                    StoreCommand::Persist(reply) => {
                        let _ = reply.send(persist_loudly(&registry));
                    }
                    StoreCommand::Shutdown => {
                        tracing::info!("Store thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> StoreCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| anyhow!("store thread is gone"))?;
        Ok(rx.await?)
    }

    /// Overwrite `entry` at its address, merge duplicates of `merge_as`, and persist.
    pub async fn put(&self, entry: Entry, merge_as: Option<String>) -> Result<()> {
        self.request(|reply| StoreCommand::Put { entry, merge_as, reply }).await?
    }

    /// Register or refresh a host and persist. Returns true if data changed.
    pub async fn upsert(&self, address: String, name: Option<String>, port: u16, connect: bool) -> Result<bool> {
        self.request(|reply| StoreCommand::Upsert { address, name, port, connect, reply }).await?
    }

    /// Mark a host as shut down and persist. Returns false for unknown addresses.
    pub async fn mark_shutdown(&self, address: String) -> Result<bool> {
        self.request(|reply| StoreCommand::MarkShutdown(address, reply)).await?
    }

    pub async fn get(&self, address: impl Into<String>) -> Result<Option<Entry>> {
        let address = address.into();
        self.request(|reply| StoreCommand::Get(address, reply)).await
    }

    pub async fn get_all(&self) -> Result<EntryMap> {
        self.request(StoreCommand::GetAll).await
    }

    pub async fn addresses(&self) -> Result<Vec<String>> {
        self.request(StoreCommand::Addresses).await
    }

    /// Edit one entry in place. `None` if the address is not tracked, otherwise whether it changed.
    pub async fn update<F>(&self, address: impl Into<String>, edit: F) -> Result<Option<bool>>
    where
        F: FnOnce(&mut Entry) + Send + 'static,
    {
        let address = address.into();
        self.request(|reply| StoreCommand::Update(address, Box::new(edit), reply)).await
    }

    /// Remove `address` unless it was refreshed after `seen`. Returns true if removed.
    pub async fn remove_if_unseen_since(&self, address: impl Into<String>, seen: DateTime<Utc>) -> Result<bool> {
        let address = address.into();
        self.request(|reply| StoreCommand::RemoveIfUnseenSince { address, seen, reply }).await
    }

    /// Collapse duplicates of `hostname`; returns the key now holding the host, if anything merged.
    pub async fn merge(&self, canonical: impl Into<String>, hostname: impl Into<String>) -> Result<Option<String>> {
        let (canonical, hostname) = (canonical.into(), hostname.into());
        self.request(|reply| StoreCommand::Merge { canonical, hostname, reply }).await
    }

    pub async fn relocate(&self, from: impl Into<String>, to: impl Into<String>) -> Result<bool> {
        let (from, to) = (from.into(), to.into());
        self.request(|reply| StoreCommand::Relocate { from, to, reply }).await
    }

    /// Write the full snapshot
    pub async fn persist(&self) -> Result<()> {
        self.request(StoreCommand::Persist).await?
    }

    /// Shutdown the store thread
    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send(StoreCommand::Shutdown)
            .await
            .map_err(|_| anyhow!("store thread is gone"))?;
        Ok(())
    }
}

/// Fold one advertisement into the registry.
pub async fn ingest(store: &StoreHandle, event: DiscoveryEvent) -> Result<()> {
    if is_loopback(&event.address) {
        tracing::debug!("Ignoring loopback advertisement from {}", event.name);
        return Ok(());
    }

    let entry = Entry::new(event.address, event.name.clone(), event.port);
    store.put(entry, Some(event.name)).await
}

/// Store manager event loop - bridges discovery events to the store and
/// drives the periodic reconciliation pass
pub async fn run(
    store: StoreHandle,
    reconciler: Arc<Reconciler>,
    mut rx: mpsc::Receiver<DiscoveryEvent>,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut poll = tokio::time::interval(poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Timer pass runs on its own task so adverts keep flowing while it probes
    let mut pass: Option<JoinHandle<PassSummary>> = None;

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                if let Err(e) = ingest(&store, event).await {
                    tracing::error!("Failed to ingest advertisement: {:#}", e);
                }
            }
            _ = poll.tick() => {
                if pass.as_ref().is_some_and(|p| !p.is_finished()) {
                    tracing::debug!("Previous timer pass still running, skipping tick");
                    continue;
                }
                let reconciler = reconciler.clone();
                pass = Some(tokio::spawn(async move { reconciler.run_pass().await }));
            }
            _ = cancel.cancelled() => {
                tracing::info!("Store manager shutting down");
                if let Some(pass) = pass.take() {
                    pass.abort();
                }
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::ServiceStatus;
    use crate::reconcile::tests::Harness;
    use std::collections::BTreeMap;

    fn spawn_store(dir: &tempfile::TempDir) -> (StoreHandle, watch::Receiver<String>) {
        let registry = Registry::open(dir.path().join("machine_cache.json")).unwrap();
        let (hash_tx, hash_rx) = watch::channel(String::new());
        (StoreHandle::spawn(registry, hash_tx), hash_rx)
    }

    fn event(name: &str, address: &str) -> DiscoveryEvent {
        DiscoveryEvent { name: name.to_string(), address: address.to_string(), port: 9000 }
    }

    #[tokio::test]
    async fn test_ingest_ignores_loopback() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _hash) = spawn_store(&dir);

        ingest(&store, event("self", "127.0.0.1")).await.unwrap();

        assert!(store.get_all().await.unwrap().is_empty());
        assert!(!dir.path().join("machine_cache.json").exists());
    }

    #[tokio::test]
    async fn test_ingest_creates_fresh_entry_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let (store, hash) = spawn_store(&dir);

        ingest(&store, event("render-1", "10.0.0.5")).await.unwrap();

        let entry = store.get("10.0.0.5").await.unwrap().unwrap();
        assert!(entry.connected);
        assert!(entry.hostname.is_none());
        assert!(entry.ping_history.is_empty());
        assert!(dir.path().join("machine_cache.json").exists());
        assert!(!hash.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_ingest_merges_same_name_from_new_address() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _hash) = spawn_store(&dir);

        ingest(&store, event("render-1", "10.0.0.5")).await.unwrap();
        ingest(&store, event("render-1", "10.0.0.9")).await.unwrap();

        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        let entry = &all["10.0.0.9"];
        assert!(entry.alias_addresses.contains("10.0.0.5"));
        assert!(entry.hostname.is_none());
        assert!(entry.last_success.is_none());
    }

    #[tokio::test]
    async fn test_update_through_handle() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _hash) = spawn_store(&dir);
        ingest(&store, event("render-1", "10.0.0.5")).await.unwrap();

        let services = BTreeMap::from([(
            "encoder".to_string(),
            ServiceStatus { running: true, pids: vec![], url: String::new(), mode: String::new() },
        )]);
        let changed = store
            .update("10.0.0.5", move |e| e.services = Some(services))
            .await
            .unwrap();
        assert_eq!(changed, Some(true));
        assert_eq!(store.update("10.0.0.77", |e| e.port = 1).await.unwrap(), None);

        let seen = store.get("10.0.0.5").await.unwrap().unwrap().last_seen;
        assert!(store.remove_if_unseen_since("10.0.0.5", seen).await.unwrap());
        assert!(store.get("10.0.0.5").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_adverts_and_cancel_are_served_during_a_long_pass() {
        // Three silent hosts at 150ms per ping keep the first timer pass busy for ~450ms
        let h = Harness::new(vec![
            Entry::new("10.0.0.61", "a", 9000),
            Entry::new("10.0.0.62", "b", 9000),
            Entry::new("10.0.0.63", "c", 9000),
        ]);
        h.net.slow_pings(Duration::from_millis(150));
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let manager = tokio::spawn(run(
            h.store.clone(),
            h.reconciler.clone(),
            rx,
            Duration::from_secs(3600),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(event("render-9", "10.0.0.99")).await.unwrap();

        let ingested = tokio::time::timeout(Duration::from_millis(150), async {
            while h.store.get("10.0.0.99").await.unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(ingested.is_ok(), "advert waited for the pass");

        cancel.cancel();
        let stopped = tokio::time::timeout(Duration::from_millis(100), manager).await;
        assert!(stopped.is_ok(), "cancel waited for the pass");
    }

    #[tokio::test]
    async fn test_persist_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine_cache.json");
        let registry = Registry::open(&path).unwrap();
        let (hash_tx, _hash_rx) = watch::channel(String::new());
        let store = StoreHandle::spawn(registry, hash_tx);

        // A directory squatting on the snapshot path makes the rename fail
        std::fs::create_dir(&path).unwrap();

        let result = store.put(Entry::new("10.0.0.5", "render-1", 9000), None).await;
        assert!(result.is_err());
        assert!(store.get("10.0.0.5").await.unwrap().is_some(), "memory keeps serving");
    }
}
