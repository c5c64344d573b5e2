use std::net::SocketAddr;
use anyhow::{bail, Context, Result};
use tokio::net::UdpSocket;

pub const MAGIC_PACKET_LEN: usize = 102;

/// Parse `aa:bb:cc:dd:ee:ff` (or with `-` separators, or none at all).
pub fn parse_mac(mac: &str) -> Result<[u8; 6]> {
    let hex_digits: String = mac.chars().filter(|c| !matches!(c, ':' | '-')).collect();
    let bytes = hex::decode(&hex_digits).with_context(|| format!("Invalid MAC address: {}", mac))?;
    let Ok(bytes) = <[u8; 6]>::try_from(bytes.as_slice()) else {
        bail!("Invalid MAC address: {} (expected 6 bytes)", mac);
    };
    Ok(bytes)
}

/// Six 0xFF bytes followed by the MAC sixteen times.
pub fn magic_packet(mac: [u8; 6]) -> [u8; MAGIC_PACKET_LEN] {
    let mut packet = [0xFF; MAGIC_PACKET_LEN];
    for chunk in packet[6..].chunks_exact_mut(6) {
        chunk.copy_from_slice(&mac);
    }
    packet
}

/// Broadcast a wake-up packet for `mac`.
pub async fn send_magic_packet(mac: &str, broadcast: SocketAddr) -> Result<()> {
    let packet = magic_packet(parse_mac(mac)?);

    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("Failed to bind UDP socket")?;
    socket
        .set_broadcast(true)
        .context("Failed to enable broadcast")?;
    socket
        .send_to(&packet, broadcast)
        .await
        .with_context(|| format!("Failed to send magic packet to {}", broadcast))?;

    tracing::info!("Sent wake-on-LAN packet for {} to {}", mac, broadcast);
    Ok(())
}
