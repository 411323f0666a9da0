//! WebSocket address formatting.

use std::net::Ipv6Addr;

/// Build the `ws://` or `wss://` URL for a host, port and optional path.
///
/// IPv6 literals are bracketed, port 443 selects `wss`, and a path has one
/// leading space removed and gains a leading `/` when missing.
pub fn full_address(host: &str, port: u16, path: Option<&str>) -> String {
    let host = if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{}]", host)
    } else {
        host.to_string()
    };

    let mut path = path.unwrap_or_default();
    path = path.strip_prefix(' ').unwrap_or(path);
    let path = if !path.is_empty() && !path.starts_with('/') {
        format!("/{}", path)
    } else {
        path.to_string()
    };

    let scheme = if port == 443 { "wss" } else { "ws" };
    format!("{}://{}:{}{}", scheme, host, port, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_host() {
        assert_eq!(full_address("my.host.com", 80, None), "ws://my.host.com:80");
    }

    #[test]
    fn test_port_443_is_secure() {
        assert_eq!(full_address("my.host.com", 443, None), "wss://my.host.com:443");
    }

    #[test]
    fn test_ipv6_is_bracketed() {
        assert_eq!(full_address("::1", 80, Some("")), "ws://[::1]:80");
    }

    #[test]
    fn test_path_leading_space_is_dropped() {
        assert_eq!(
            full_address("192.168.1.1", 80, Some(" path")),
            "ws://192.168.1.1:80/path"
        );
        assert_eq!(full_address("h", 20901, Some("/ws2p")), "ws://h:20901/ws2p");
    }
}
