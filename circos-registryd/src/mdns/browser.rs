use std::collections::HashSet;
use std::net::IpAddr;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::Future;
use anyhow::{Context, Result};
use shared::protocol::DEFAULT_CONTROL_PORT;

/// A normalized advertisement, ready to be folded into the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEvent {
    pub name: String,
    pub address: String,
    pub port: u16,
}

type RecvResult = (usize, flume::Receiver<ServiceEvent>, std::result::Result<ServiceEvent, flume::RecvError>);
type RecvFuture = Pin<Box<dyn Future<Output = RecvResult> + Send>>;

/// Each future owns a clone of its receiver so the set can be polled without
/// borrowing from a vec of receivers. flume::Receiver is Clone (multi-consumer).
fn make_recv_future(idx: usize, rx: flume::Receiver<ServiceEvent>) -> RecvFuture {
    Box::pin(async move {
        let result = rx.recv_async().await;
        (idx, rx, result)
    })
}

pub async fn run_browser(
    daemon: ServiceDaemon,
    service_types: Vec<String>,
    tx: mpsc::Sender<DiscoveryEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut type_futures: FuturesUnordered<RecvFuture> = FuturesUnordered::new();
    let mut browsed = HashSet::new();

    for (idx, service_type) in service_types.iter().enumerate() {
        if !browsed.insert(service_type.as_str()) {
            continue;
        }
        let receiver = daemon
            .browse(service_type)
            .with_context(|| format!("Failed to browse {}", service_type))?;
        tracing::info!("Browsing for {}", service_type);
        type_futures.push(make_recv_future(idx, receiver));
    }

    loop {
        tokio::select! {
            Some((idx, rx, result)) = type_futures.next() => {
                match result {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        if let Some(event) = convert_service_info(&info) {
                            tracing::debug!("Resolved {} at {}", event.name, event.address);
                            if let Err(e) = tx.send(event).await {
                                tracing::error!("Failed to send discovery event: {}", e);
                            }
                        }
                        type_futures.push(make_recv_future(idx, rx));
                    }
                    Ok(ServiceEvent::ServiceRemoved(_typ, fullname)) => {
                        // Liveness is decided by probing, not by goodbye packets
                        tracing::debug!("Advertisement withdrawn: {}", fullname);
                        type_futures.push(make_recv_future(idx, rx));
                    }
                    Ok(_) => {
                        type_futures.push(make_recv_future(idx, rx));
                    }
                    Err(e) => {
                        tracing::warn!("Receiver {} disconnected: {}", idx, e);
                    }
                }
            }

            _ = cancel.cancelled() => {
                tracing::info!("mDNS browser shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Convert an mdns-sd ServiceInfo into a discovery event.
/// Advertisements carrying only loopback addresses are dropped.
fn convert_service_info(info: &ServiceInfo) -> Option<DiscoveryEvent> {
    let addresses: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
    let Some(address) = preferred_address(&addresses) else {
        tracing::debug!("Skipping {} - no routable address", info.get_fullname());
        return None;
    };

    let port = match info.get_port() {
        0 => DEFAULT_CONTROL_PORT,
        port => port,
    };

    Some(DiscoveryEvent {
        name: instance_name(info.get_fullname(), info.get_type()),
        address: address.to_string(),
        port,
    })
}

/// First non-loopback IPv4, else first non-loopback IPv6. Input order is not
/// meaningful (mdns-sd hands out a set), so the choice is made on sorted order.
fn preferred_address(addresses: &[IpAddr]) -> Option<IpAddr> {
    let mut routable: Vec<IpAddr> = addresses.iter().copied().filter(|ip| !ip.is_loopback()).collect();
    routable.sort();
    routable
        .iter()
        .copied()
        .find(IpAddr::is_ipv4)
        .or_else(|| routable.first().copied())
}

/// "render-1._circos._tcp.local." -> "render-1"
fn instance_name(fullname: &str, service_type: &str) -> String {
    let name = fullname
        .strip_suffix(service_type)
        .unwrap_or(fullname)
        .trim_end_matches('.');
    if name.is_empty() {
        "Unnamed".to_string()
    } else {
        name.to_string()
    }
}
