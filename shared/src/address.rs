use std::net::IpAddr;

/// True for `localhost` and any IPv4/IPv6 loopback literal.
///
/// Loopback addresses may show up in advertisements from a host talking to
/// itself, but they never identify a machine to anyone else.
pub fn is_loopback(address: &str) -> bool {
    let address = address.trim();
    if address.eq_ignore_ascii_case("localhost") {
        return true;
    }
    address
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map(|ip| match ip {
            IpAddr::V6(v6) => v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback()),
            IpAddr::V4(v4) => v4.is_loopback(),
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_detection() {
        assert!(is_loopback("127.0.0.1"));
        assert!(is_loopback("127.4.5.6"));
        assert!(is_loopback("::1"));
        assert!(is_loopback("[::1]"));
        assert!(is_loopback("::ffff:127.0.0.1"));
        assert!(is_loopback("localhost"));

        assert!(!is_loopback("10.0.0.5"));
        assert!(!is_loopback("fd00::1"));
        assert!(!is_loopback("render-1.local"));
        assert!(!is_loopback(""));
    }
}
