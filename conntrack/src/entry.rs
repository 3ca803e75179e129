//! Flow identifiers tracked by the admission table.

use std::cmp::Ordering;
use std::fmt;
use std::net::IpAddr;

use serde::Serialize;

/// A tracked flow: protocol plus local and remote endpoint.
///
/// Endpoints are opaque strings, usually `host:port`. Two entries are the
/// same flow when all three fields are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Entry {
    pub protocol: String,
    pub local_addr: String,
    pub remote_addr: String,
}

impl Entry {
    pub fn new(
        protocol: impl Into<String>,
        local_addr: impl Into<String>,
        remote_addr: impl Into<String>,
    ) -> Self {
        Self {
            protocol: protocol.into(),
            local_addr: local_addr.into(),
            remote_addr: remote_addr.into(),
        }
    }

    /// Ordering used for diagnostics: remote endpoint, then protocol, then
    /// local endpoint. Endpoints compare by address family, IP, then port.
    pub(crate) fn display_cmp(&self, other: &Self) -> Ordering {
        EndpointKey::parse(&self.remote_addr)
            .cmp(&EndpointKey::parse(&other.remote_addr))
            .then_with(|| self.protocol.cmp(&other.protocol))
            .then_with(|| {
                EndpointKey::parse(&self.local_addr).cmp(&EndpointKey::parse(&other.local_addr))
            })
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}->{}", self.protocol, self.local_addr, self.remote_addr)
    }
}

/// Sort key for a `host:port` endpoint.
///
/// Field order is significant: well-formed endpoints sort before malformed
/// ones, IPv4 before everything else, then by address bytes and port.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct EndpointKey<'a> {
    malformed: bool,
    not_ipv4: bool,
    ip: Option<[u8; 16]>,
    port_malformed: bool,
    port_num: i64,
    port: &'a str,
}

impl<'a> EndpointKey<'a> {
    fn parse(endpoint: &'a str) -> Self {
        let (host, port, malformed) = match split_host_port(endpoint) {
            Some((host, port)) => (host, port, false),
            None => ("", "", true),
        };
        let ip = host.parse::<IpAddr>().ok();
        let port_num = port.parse::<i64>();
        Self {
            malformed,
            not_ipv4: !matches!(ip, Some(IpAddr::V4(_))),
            ip: ip.map(|ip| match ip {
                IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
                IpAddr::V6(v6) => v6.octets(),
            }),
            port_malformed: port_num.is_err(),
            port_num: port_num.unwrap_or_default(),
            port,
        }
    }
}

/// Splits `host:port` or `[v6host]:port`.
fn split_host_port(endpoint: &str) -> Option<(&str, &str)> {
    if let Some(rest) = endpoint.strip_prefix('[') {
        let (host, port) = rest.split_once("]:")?;
        return Some((host, port));
    }
    let (host, port) = endpoint.rsplit_once(':')?;
    if host.contains(':') {
        return None;
    }
    Some((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(endpoints: &[&str]) -> Vec<String> {
        let mut entries: Vec<Entry> = endpoints
            .iter()
            .map(|remote| Entry::new("tcp", "0.0.0.0:0", *remote))
            .collect();
        entries.sort_by(Entry::display_cmp);
        entries.into_iter().map(|e| e.remote_addr).collect()
    }

    #[test]
    fn entry_equality_is_structural() {
        let a = Entry::new("udp", "10.0.0.1:4000", "1.1.1.1:53");
        let b = Entry::new("udp", "10.0.0.1:4000", "1.1.1.1:53");
        let c = Entry::new("tcp", "10.0.0.1:4000", "1.1.1.1:53");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn entry_display() {
        let e = Entry::new("udp", "10.0.0.1:4000", "1.1.1.1:53");
        assert_eq!(e.to_string(), "udp 10.0.0.1:4000->1.1.1.1:53");
    }

    #[test]
    fn split_host_port_forms() {
        assert_eq!(split_host_port("1.2.3.4:80"), Some(("1.2.3.4", "80")));
        assert_eq!(split_host_port("[::1]:443"), Some(("::1", "443")));
        assert_eq!(split_host_port("example.com:http"), Some(("example.com", "http")));
        assert_eq!(split_host_port("::1"), None);
        assert_eq!(split_host_port("no-port"), None);
    }

    #[test]
    fn ipv4_sorts_before_ipv6_and_malformed_last() {
        assert_eq!(
            sorted(&["garbage", "[::1]:80", "10.0.0.1:80", "2.0.0.1:80"]),
            vec!["2.0.0.1:80", "10.0.0.1:80", "[::1]:80", "garbage"]
        );
    }

    #[test]
    fn ports_sort_numerically() {
        assert_eq!(
            sorted(&["1.1.1.1:1000", "1.1.1.1:99", "1.1.1.1:http", "1.1.1.1:443"]),
            vec!["1.1.1.1:99", "1.1.1.1:443", "1.1.1.1:1000", "1.1.1.1:http"]
        );
    }

    #[test]
    fn display_cmp_falls_back_to_protocol_then_local() {
        let mut entries = vec![
            Entry::new("udp", "0.0.0.0:2", "1.1.1.1:53"),
            Entry::new("tcp", "0.0.0.0:9", "1.1.1.1:53"),
            Entry::new("udp", "0.0.0.0:1", "1.1.1.1:53"),
        ];
        entries.sort_by(Entry::display_cmp);
        let got: Vec<_> = entries.iter().map(|e| e.to_string()).collect();
        assert_eq!(
            got,
            vec![
                "tcp 0.0.0.0:9->1.1.1.1:53",
                "udp 0.0.0.0:1->1.1.1.1:53",
                "udp 0.0.0.0:2->1.1.1.1:53",
            ]
        );
    }

    #[test]
    fn entry_serializes_as_object() {
        insta::assert_json_snapshot!(Entry::new("udp", "10.0.0.1:4000", "1.1.1.1:53"), @r###"
        {
          "protocol": "udp",
          "local_addr": "10.0.0.1:4000",
          "remote_addr": "1.1.1.1:53"
        }
        "###);
    }
}
