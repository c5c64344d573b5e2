use std::io;
use std::net::IpAddr;
use std::time::Duration;
use async_trait::async_trait;

/// Name lookup backend.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn lookup(&self, hostname: &str) -> io::Result<Vec<IpAddr>>;
}

/// Resolves through the operating system (getaddrinfo), which covers `.local`
/// names wherever nss-mdns or systemd-resolved is set up.
pub struct SystemResolver;

#[async_trait]
impl AddressResolver for SystemResolver {
    async fn lookup(&self, hostname: &str) -> io::Result<Vec<IpAddr>> {
        let records = tokio::net::lookup_host((hostname, 0)).await?;
        Ok(records.map(|addr| addr.ip()).collect())
    }
}

/// First non-loopback record, else the first record.
pub fn pick_address(records: &[IpAddr]) -> Option<IpAddr> {
    records
        .iter()
        .find(|ip| !ip.is_loopback())
        .or_else(|| records.first())
        .copied()
}

/// Resolve `hostname` within `limit`. Failures and timeouts yield `None`.
pub async fn resolve(resolver: &dyn AddressResolver, hostname: &str, limit: Duration) -> Option<String> {
    match tokio::time::timeout(limit, resolver.lookup(hostname)).await {
        Ok(Ok(records)) => pick_address(&records).map(|ip| ip.to_string()),
        Ok(Err(e)) => {
            tracing::debug!("Lookup of {} failed: {}", hostname, e);
            None
        }
        Err(_) => {
            tracing::debug!("Lookup of {} timed out", hostname);
            None
        }
    }
}
