use std::net::IpAddr;
use tokio::net::UdpSocket;
use shared::address::is_loopback;

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("Address required")]
    MissingAddress,

    #[error("{0} is a loopback address")]
    Loopback(String),

    #[error("{0} is not an IP address")]
    NotAnIp(String),

    #[error("No outbound address available to stand in for {0}")]
    NoOutboundAddress(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Check a manually registered address: present, an IP literal, not loopback.
/// Returns it in canonical textual form.
pub fn validate_address(address: &str) -> Result<String, RegistrationError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(RegistrationError::MissingAddress);
    }
    if is_loopback(address) {
        return Err(RegistrationError::Loopback(address.to_string()));
    }
    address
        .parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .map_err(|_| RegistrationError::NotAnIp(address.to_string()))
}

/// Like [`validate_address`], but a host announcing itself as loopback is
/// replaced by this machine's outbound address: the announcer runs here.
pub async fn normalize_announced(address: &str) -> Result<String, RegistrationError> {
    if !address.trim().is_empty() && is_loopback(address) {
        return local_outbound_address()
            .await
            .map(|ip| ip.to_string())
            .ok_or_else(|| RegistrationError::NoOutboundAddress(address.trim().to_string()));
    }
    validate_address(address)
}

/// Address the OS would use to reach the network. Connecting a UDP socket
/// only selects a route; nothing is sent.
pub async fn local_outbound_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect("192.0.2.1:9").await.ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified() && !ip.is_loopback()).then_some(ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_address() {
        assert_eq!(validate_address(" 10.0.0.5 ").unwrap(), "10.0.0.5");
        assert_eq!(validate_address("FD00::5").unwrap(), "fd00::5");
        assert!(matches!(validate_address(""), Err(RegistrationError::MissingAddress)));
        assert!(matches!(validate_address("127.0.0.1"), Err(RegistrationError::Loopback(_))));
        assert!(matches!(validate_address("localhost"), Err(RegistrationError::Loopback(_))));
        assert!(matches!(validate_address("render-1.local"), Err(RegistrationError::NotAnIp(_))));
    }

    #[tokio::test]
    async fn test_announced_loopback_never_survives() {
        match normalize_announced("127.0.0.1").await {
            Ok(address) => assert!(!is_loopback(&address)),
            // Sandboxes without a default route
            Err(e) => assert!(matches!(e, RegistrationError::NoOutboundAddress(_))),
        }
        assert_eq!(normalize_announced("192.168.1.50").await.unwrap(), "192.168.1.50");
        assert!(matches!(normalize_announced("  ").await, Err(RegistrationError::MissingAddress)));
    }
}
