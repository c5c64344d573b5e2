//! Per-entry network round trip: reachability, metadata, service status.
//!
//! Each step is bounded by its own timeout and fails independently; only an
//! unanswered reachability probe cuts the sequence short.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use async_trait::async_trait;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use shared::protocol::{REMOTE_METADATA_PATH, REMOTE_STATUS_PATH};
use shared::types::{Entry, HostMetadata, ServiceMap};
use crate::store_manager::StoreHandle;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("no response: {0}")]
    Unreachable(#[source] io::Error),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected HTTP status {0}")]
    Status(reqwest::StatusCode),

    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Network operations against one monitored host.
#[async_trait]
pub trait HostProber: Send + Sync {
    /// Round-trip time of a reachability probe.
    async fn ping(&self, address: &str, port: u16) -> Result<Duration, ProbeError>;

    async fn fetch_metadata(&self, address: &str, port: u16) -> Result<HostMetadata, ProbeError>;

    async fn fetch_status(&self, address: &str, port: u16) -> Result<ServiceMap, ProbeError>;
}

/// Probes hosts over TCP and their HTTP control port.
pub struct NetProber {
    client: reqwest::Client,
}

impl NetProber {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client for probes")?;
        Ok(Self { client })
    }

    async fn get_json<T: DeserializeOwned>(&self, address: &str, port: u16, path: &str) -> Result<T, ProbeError> {
        let url = format!("http://{}{}", socket_addr(address, port)?, path);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(ProbeError::Status(response.status()));
        }
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

fn socket_addr(address: &str, port: u16) -> Result<SocketAddr, ProbeError> {
    address
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, port))
        .map_err(|_| ProbeError::InvalidAddress(address.to_string()))
}

#[async_trait]
impl HostProber for NetProber {
    /// TCP connect to the control port. A refused connection still proves the
    /// host is up; only silence or a network-level error counts as unreachable.
    async fn ping(&self, address: &str, port: u16) -> Result<Duration, ProbeError> {
        let target = socket_addr(address, port)?;
        let started = Instant::now();
        match TcpStream::connect(target).await {
            Ok(_) => Ok(started.elapsed()),
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(started.elapsed()),
            Err(e) => Err(ProbeError::Unreachable(e)),
        }
    }

    async fn fetch_metadata(&self, address: &str, port: u16) -> Result<HostMetadata, ProbeError> {
        self.get_json(address, port, REMOTE_METADATA_PATH).await
    }

    async fn fetch_status(&self, address: &str, port: u16) -> Result<ServiceMap, ProbeError> {
        self.get_json(address, port, REMOTE_STATUS_PATH).await
    }
}

/// Run one network step under `limit`; expiry is an ordinary `ProbeError::Timeout`.
pub async fn bounded<T>(limit: Duration, step: impl Future<Output = Result<T, ProbeError>>) -> Result<T, ProbeError> {
    tokio::time::timeout(limit, step)
        .await
        .unwrap_or_else(|_| Err(ProbeError::Timeout(limit)))
}

pub fn record_ping(entry: &mut Entry, rtt: Duration, at: DateTime<Utc>) {
    entry.last_ping = Some(at);
    entry.last_rtt = Some(rtt.as_micros() as f64 / 1000.0);
    entry.push_ping(at);
}

/// Metadata fields the host left null keep their previous values.
pub fn record_metadata(entry: &mut Entry, metadata: HostMetadata, at: DateTime<Utc>) {
    entry.last_seen = at;
    entry.last_success = Some(at);
    if metadata.uptime.is_some() {
        entry.uptime = metadata.uptime;
    }
    if metadata.hostname.is_some() {
        entry.hostname = metadata.hostname;
    }
    if metadata.version.is_some() {
        entry.version = metadata.version;
    }
}

pub fn record_status(entry: &mut Entry, services: ServiceMap) {
    entry.services = Some(services);
    entry.connected = true;
}

/// Unanswered probe or failed status fetch. Metadata is left alone.
pub fn record_disconnected(entry: &mut Entry) {
    entry.connected = false;
    entry.services = None;
}

/// What one probe did to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    /// Key holding the entry afterwards; differs from the probed key after a merge away from loopback
    pub address: String,
    pub reachable: bool,
    pub changed: bool,
}

/// Probe the entry at `address` and apply every result to the store.
///
/// Remote failures are logged and recorded, never returned; an `Err` here
/// means the store itself is unavailable.
pub async fn probe_entry(
    store: &StoreHandle,
    prober: &dyn HostProber,
    address: &str,
    port: u16,
    limit: Duration,
) -> Result<ProbeReport> {
    let mut report = ProbeReport {
        address: address.to_string(),
        reachable: false,
        changed: false,
    };

    match bounded(limit, prober.ping(address, port)).await {
        Ok(rtt) => {
            report.reachable = true;
            let now = Utc::now();
            match store.update(address, move |e| record_ping(e, rtt, now)).await? {
                Some(changed) => report.changed |= changed,
                None => return Ok(report),
            }
        }
        Err(e) => {
            tracing::debug!("{} did not answer: {}", address, e);
            report.changed |= store.update(address, record_disconnected).await?.unwrap_or(false);
            return Ok(report);
        }
    }

    match bounded(limit, prober.fetch_metadata(address, port)).await {
        Ok(metadata) => {
            let hostname = metadata.hostname.clone();
            let now = Utc::now();
            match store.update(address, move |e| record_metadata(e, metadata, now)).await? {
                Some(changed) => report.changed |= changed,
                None => return Ok(report),
            }
            if let Some(hostname) = hostname {
                if let Some(key) = store.merge(address, hostname).await? {
                    report.changed = true;
                    report.address = key;
                }
            }
        }
        Err(e) => {
            tracing::warn!("Metadata fetch from {} failed: {}", address, e);
        }
    }

    let key = report.address.clone();
    let status = bounded(limit, prober.fetch_status(&key, port)).await;
    let changed = match status {
        Ok(services) => store.update(key, move |e| record_status(e, services)).await?,
        Err(e) => {
            tracing::warn!("Status fetch from {} failed: {}", key, e);
            store.update(key, record_disconnected).await?
        }
    };
    report.changed |= changed.unwrap_or(false);

    Ok(report)
}
