use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use shared::address::is_loopback;
use shared::types::Entry;
use crate::store::merge;

/// Registry contents keyed by address.
pub type EntryMap = BTreeMap<String, Entry>;

/// In-memory registry backed by a JSON snapshot that is rewritten wholesale.
pub struct Registry {
    path: PathBuf,
    entries: EntryMap,
}

impl Registry {
    /// Open the registry, loading the snapshot at `path` if there is one.
    ///
    /// A missing or unreadable snapshot starts an empty registry; only failing
    /// to create the snapshot directory is fatal.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let entries = match load_snapshot(path) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!("Discarding unreadable snapshot, starting empty: {:#}", e);
                EntryMap::new()
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, address: &str) -> Option<&Entry> {
        self.entries.get(address)
    }

    /// Insert or overwrite. Returns true if data changed.
    pub fn put(&mut self, address: &str, mut entry: Entry) -> bool {
        entry.address = address.to_string();
        if self.entries.get(address) == Some(&entry) {
            return false;
        }
        self.entries.insert(address.to_string(), entry);
        true
    }

    pub fn delete(&mut self, address: &str) -> bool {
        self.entries.remove(address).is_some()
    }

    /// Delete only if the entry has not been seen since `seen`. A record
    /// refreshed after that instant stays. Returns true if it was removed.
    pub fn delete_if_unseen_since(&mut self, address: &str, seen: DateTime<Utc>) -> bool {
        match self.entries.get(address) {
            Some(entry) if entry.last_seen <= seen => self.delete(address),
            _ => false,
        }
    }

    pub fn all_entries(&self) -> &EntryMap {
        &self.entries
    }

    pub fn addresses(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Apply `edit` to one entry. `None` if the address is unknown, otherwise whether it changed.
    pub fn update(&mut self, address: &str, edit: impl FnOnce(&mut Entry)) -> Option<bool> {
        let entry = self.entries.get_mut(address)?;
        let before = entry.clone();
        edit(entry);
        Some(*entry != before)
    }

    /// Register or refresh a host announced by name, keeping whatever was learned about it.
    /// `connect` forces `connected = true` on an existing entry.
    pub fn upsert(&mut self, address: &str, name: Option<&str>, port: u16, connect: bool) -> bool {
        match self.entries.get_mut(address) {
            Some(entry) => {
                let before = entry.clone();
                if let Some(name) = name {
                    entry.display_name = name.to_string();
                }
                entry.port = port;
                entry.last_seen = Utc::now();
                if connect {
                    entry.connected = true;
                }
                *entry != before
            }
            None => {
                let entry = Entry::new(address, name.unwrap_or("Manual"), port);
                self.entries.insert(address.to_string(), entry);
                true
            }
        }
    }

    /// Record an announced shutdown. Returns false for unknown addresses.
    pub fn mark_shutdown(&mut self, address: &str) -> bool {
        self.update(address, |entry| {
            entry.connected = false;
            entry.services = None;
        })
        .is_some()
    }

    /// Collapse duplicates of `hostname` into one entry. See [`merge::merge_duplicates`].
    pub fn merge(&mut self, canonical: &str, hostname: &str) -> Option<String> {
        merge::merge_duplicates(&mut self.entries, canonical, hostname)
    }

    /// Move an entry whose host now answers at `to`.
    ///
    /// The old key is kept unless it is loopback; if `to` is already tracked,
    /// that entry wins and the two are left for the merge engine.
    pub fn relocate(&mut self, from: &str, to: &str) -> bool {
        if from == to || is_loopback(to) {
            return false;
        }
        let Some(existing) = self.entries.get(from) else {
            return false;
        };

        let mut changed = false;
        if !self.entries.contains_key(to) {
            let mut moved = existing.clone();
            moved.address = to.to_string();
            moved.alias_addresses.insert(from.to_string());
            self.entries.insert(to.to_string(), moved);
            changed = true;
        }
        if is_loopback(from) {
            self.entries.remove(from);
            changed = true;
        }
        changed
    }

    /// Rewrite the snapshot with the full registry.
    pub fn persist(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.entries)
            .context("Failed to serialize registry")?;

        let mut temp = self.path.clone();
        temp.set_extension("tmp");

        std::fs::write(&temp, json.as_bytes())
            .with_context(|| format!("Failed to write {}", temp.display()))?;
        std::fs::rename(&temp, &self.path)
            .with_context(|| format!("Failed to replace snapshot {}", self.path.display()))?;

        tracing::trace!("Snapshot written: {} entries", self.entries.len());
        Ok(())
    }
}

fn load_snapshot(path: &Path) -> Result<EntryMap> {
    if !path.exists() {
        tracing::info!("No snapshot at {}, starting empty", path.display());
        return Ok(EntryMap::new());
    }

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(EntryMap::new());
    }

    let loaded: EntryMap = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse snapshot {}", path.display()))?;

    let mut entries = EntryMap::new();
    for (address, mut entry) in loaded {
        if is_loopback(&address) {
            tracing::warn!("Dropping loopback key {} from snapshot", address);
            continue;
        }
        entry.address = address.clone();
        entries.insert(address, entry);
    }

    tracing::info!("Loaded {} entries from {}", entries.len(), path.display());
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use shared::types::ServiceStatus;

    fn snapshot_in(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("machine_cache.json")
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot_in(&dir);

        let mut registry = Registry::open(&path).unwrap();
        let mut entry = Entry::new("10.0.0.5", "render-1", 9000);
        entry.services = Some(BTreeMap::from([(
            "encoder".to_string(),
            ServiceStatus { running: true, pids: vec![42], url: "http://x".into(), mode: "auto".into() },
        )]));
        assert!(registry.put("10.0.0.5", entry.clone()));
        registry.persist().unwrap();

        let reopened = Registry::open(&path).unwrap();
        assert_eq!(reopened.get("10.0.0.5"), Some(&entry));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_corrupt_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot_in(&dir);
        std::fs::write(&path, "{ not json").unwrap();

        let registry = Registry::open(&path).unwrap();
        assert!(registry.all_entries().is_empty());
    }

    #[test]
    fn test_missing_snapshot_starts_empty_and_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.json");

        let registry = Registry::open(&path).unwrap();
        assert!(registry.all_entries().is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn test_loopback_keys_dropped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot_in(&dir);
        let map = BTreeMap::from([
            ("127.0.0.1".to_string(), Entry::new("127.0.0.1", "self", 9000)),
            ("10.0.0.7".to_string(), Entry::new("10.0.0.7", "other", 9000)),
        ]);
        std::fs::write(&path, serde_json::to_string(&map).unwrap()).unwrap();

        let registry = Registry::open(&path).unwrap();
        assert_eq!(registry.addresses(), vec!["10.0.0.7".to_string()]);
    }

    #[test]
    fn test_put_reports_changes() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = Registry::open(snapshot_in(&dir)).unwrap();
        let entry = Entry::new("10.0.0.5", "render-1", 9000);

        assert!(registry.put("10.0.0.5", entry.clone()));
        assert!(!registry.put("10.0.0.5", entry.clone()), "Identical put should not report change");

        assert_eq!(registry.update("10.0.0.5", |e| e.port = 9100), Some(true));
        assert_eq!(registry.update("10.0.0.5", |e| e.port = 9100), Some(false));
        assert_eq!(registry.update("10.0.0.99", |e| e.port = 1), None);
    }

    #[test]
    fn test_conditional_delete_spares_refreshed_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = Registry::open(snapshot_in(&dir)).unwrap();
        let mut entry = Entry::new("10.0.0.5", "render-1", 9000);
        entry.last_seen = Utc::now() - chrono::Duration::minutes(20);
        let seen = entry.last_seen;
        registry.put("10.0.0.5", entry);

        registry.upsert("10.0.0.5", None, 9000, false);
        assert!(!registry.delete_if_unseen_since("10.0.0.5", seen));
        assert!(registry.get("10.0.0.5").is_some());

        let refreshed = registry.get("10.0.0.5").unwrap().last_seen;
        assert!(registry.delete_if_unseen_since("10.0.0.5", refreshed));
        assert!(registry.get("10.0.0.5").is_none());
        assert!(!registry.delete_if_unseen_since("10.0.0.5", refreshed));
    }

    #[test]
    fn test_upsert_keeps_learned_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = Registry::open(snapshot_in(&dir)).unwrap();
        let mut entry = Entry::new("10.0.0.5", "render-1", 9000);
        entry.connected = false;
        entry.version = Some("2.1".into());
        registry.put("10.0.0.5", entry);

        assert!(registry.upsert("10.0.0.5", Some("render-one"), 9001, true));
        let entry = registry.get("10.0.0.5").unwrap();
        assert_eq!(entry.display_name, "render-one");
        assert_eq!(entry.port, 9001);
        assert!(entry.connected);
        assert_eq!(entry.version.as_deref(), Some("2.1"));

        assert!(registry.upsert("10.0.0.6", None, 9000, false));
        assert_eq!(registry.get("10.0.0.6").unwrap().display_name, "Manual");
    }

    #[test]
    fn test_mark_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = Registry::open(snapshot_in(&dir)).unwrap();
        let mut entry = Entry::new("10.0.0.5", "render-1", 9000);
        entry.services = Some(BTreeMap::new());
        registry.put("10.0.0.5", entry);

        assert!(registry.mark_shutdown("10.0.0.5"));
        let entry = registry.get("10.0.0.5").unwrap();
        assert!(!entry.connected);
        assert!(entry.services.is_none());

        assert!(!registry.mark_shutdown("10.0.0.6"));
    }

    #[test]
    fn test_relocate_from_loopback_drops_old_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = Registry::open(snapshot_in(&dir)).unwrap();
        registry.put("127.0.0.1", Entry::new("127.0.0.1", "encoder-2", 9000));

        assert!(registry.relocate("127.0.0.1", "192.168.1.50"));
        assert!(registry.get("127.0.0.1").is_none());
        let moved = registry.get("192.168.1.50").unwrap();
        assert_eq!(moved.address, "192.168.1.50");
        assert!(moved.alias_addresses.contains("127.0.0.1"));
    }

    #[test]
    fn test_relocate_keeps_routable_old_key_and_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = Registry::open(snapshot_in(&dir)).unwrap();
        registry.put("10.0.0.5", Entry::new("10.0.0.5", "render-1", 9000));

        assert!(registry.relocate("10.0.0.5", "10.0.0.8"));
        assert!(registry.get("10.0.0.5").is_some());
        assert!(registry.get("10.0.0.8").is_some());

        registry.update("10.0.0.8", |e| e.version = Some("fresh".into()));
        assert!(!registry.relocate("10.0.0.5", "10.0.0.8"));
        assert_eq!(registry.get("10.0.0.8").unwrap().version.as_deref(), Some("fresh"));

        assert!(!registry.relocate("10.0.0.5", "127.0.0.1"));
    }
}
