use std::sync::Arc;
use std::time::Duration;
use shared::types::{Announcement, ShutdownNotice};
use crate::reconcile::Reconciler;
use crate::registration::{normalize_announced, RegistrationError};
use crate::store::EntryMap;
use crate::store_manager::StoreHandle;

/// Startup and shutdown announcements sent by monitored hosts themselves.
pub struct PushHandler {
    store: StoreHandle,
    reconciler: Arc<Reconciler>,
    default_port: u16,
    refresh_delay: Duration,
}

impl PushHandler {
    pub fn new(store: StoreHandle, reconciler: Arc<Reconciler>, default_port: u16, refresh_delay: Duration) -> Self {
        Self {
            store,
            reconciler,
            default_port,
            refresh_delay,
        }
    }

    /// Mark the host up, run a full pass right away, and return the registry as it stands after it.
    pub async fn notify_startup(&self, announcement: Announcement) -> Result<EntryMap, RegistrationError> {
        let address = normalize_announced(&announcement.address).await?;
        let port = announcement.port.unwrap_or(self.default_port);

        tracing::info!("Startup announced by {} ({:?})", address, announcement.name);
        self.store.upsert(address, announcement.name, port, true).await?;

        self.reconciler.run_pass().await;
        Ok(self.store.get_all().await?)
    }

    /// Mark the host down and schedule a pass shortly after.
    /// Returns false if the address was not being tracked.
    pub async fn notify_shutdown(&self, notice: ShutdownNotice) -> Result<bool, RegistrationError> {
        let address = normalize_announced(&notice.address).await?;

        let known = self.store.mark_shutdown(address.clone()).await?;
        if !known {
            tracing::debug!("Shutdown announced by untracked {}", address);
            return Ok(false);
        }

        tracing::info!("Shutdown announced by {}", address);
        let reconciler = self.reconciler.clone();
        let delay = self.refresh_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            reconciler.run_pass().await;
        });

        Ok(true)
    }
}
