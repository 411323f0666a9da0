//! WS2P endpoints as advertised in peer documents.

use crate::address::full_address;
use crate::error::WireError;
use crate::head::is_instance_id_format;
use std::fmt;
use std::str::FromStr;

/// A reachable WS2P instance: `WS2P [version] <instanceId> <host> <port> [path]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ws2pEndpoint {
    /// Protocol version, when advertised
    pub version: Option<u32>,
    /// Instance id, 8 lower-case hex chars
    pub instance_id: String,
    /// Host name, IPv4 or IPv6 literal
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Optional URL path
    pub path: Option<String>,
}

fn is_host(host: &str) -> bool {
    let mut chars = host.chars();
    let dns = match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => chars.all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.')
        }),
        _ => false,
    };
    let ipv4 = !host.is_empty() && host.chars().all(|c| c.is_ascii_digit() || c == '.');
    let ipv6 = !host.is_empty() && host.chars().all(|c| c.is_ascii_hexdigit() || c == ':');
    dns || ipv4 || ipv6
}

impl Ws2pEndpoint {
    /// WebSocket URL to dial
    pub fn url(&self) -> String {
        full_address(&self.host, self.port, self.path.as_deref())
    }
}

impl FromStr for Ws2pEndpoint {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || WireError::Endpoint(s.to_string());
        let rest = s.strip_prefix("WS2P ").ok_or_else(invalid)?;
        let mut fields: Vec<&str> = rest.splitn(5, ' ').collect();

        let mut version = None;
        if let Some(first) = fields.first() {
            if !is_instance_id_format(first)
                && !first.starts_with('0')
                && !first.is_empty()
                && first.chars().all(|c| c.is_ascii_digit())
            {
                version = Some(first.parse().map_err(|_| invalid())?);
                fields = rest
                    .split_once(' ')
                    .map(|(_, tail)| tail.splitn(4, ' ').collect())
                    .ok_or_else(invalid)?;
            }
        }

        let (instance_id, host, port, path) = match fields.as_slice() {
            [uuid, host, port] => (*uuid, *host, *port, None),
            [uuid, host, port, path] if !path.is_empty() => {
                (*uuid, *host, *port, Some(path.to_string()))
            }
            _ => return Err(invalid()),
        };
        if !is_instance_id_format(instance_id) || !is_host(host) {
            return Err(invalid());
        }
        let port = port.parse().map_err(|_| invalid())?;

        Ok(Self {
            version,
            instance_id: instance_id.to_string(),
            host: host.to_string(),
            port,
            path,
        })
    }
}

impl fmt::Display for Ws2pEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WS2P")?;
        if let Some(version) = self.version {
            write!(f, " {}", version)?;
        }
        write!(f, " {} {} {}", self.instance_id, self.host, self.port)?;
        if let Some(path) = &self.path {
            write!(f, " {}", path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_path() {
        let ep: Ws2pEndpoint = "WS2P 3eaab4c7 g1.example.org 443 ws2p".parse().unwrap();
        assert_eq!(ep.instance_id, "3eaab4c7");
        assert_eq!(ep.port, 443);
        assert_eq!(ep.path.as_deref(), Some("ws2p"));
        assert_eq!(ep.url(), "wss://g1.example.org:443/ws2p");
    }

    #[test]
    fn test_parse_versioned_ipv4() {
        let ep: Ws2pEndpoint = "WS2P 2 3eaab4c7 10.0.0.4 20901".parse().unwrap();
        assert_eq!(ep.version, Some(2));
        assert_eq!(ep.host, "10.0.0.4");
        assert_eq!(ep.path, None);
        assert_eq!(ep.to_string(), "WS2P 2 3eaab4c7 10.0.0.4 20901");
    }

    #[test]
    fn test_rejects_bad_endpoints() {
        for bad in [
            "BASIC_MERKLED_API g1.example.org 80",
            "WS2P 3EAAB4C7 host 80",
            "WS2P 3eaab4c7 Host 80",
            "WS2P 3eaab4c7 host port",
            "WS2P 3eaab4c7 host",
        ] {
            assert!(bad.parse::<Ws2pEndpoint>().is_err(), "accepted {}", bad);
        }
    }
}
