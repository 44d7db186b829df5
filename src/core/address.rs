//! Endpoint addresses in the engine's canonical 16-byte form.
//!
//! Every endpoint, IPv4 or IPv6, is stored as an IPv6-shaped host buffer.
//! IPv4 endpoints use the `::ffff:a.b.c.d` mapping, which round-trips exactly.
//! Ports are kept in host byte order; conversion to network order happens
//! inside the engine.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::str::FromStr;

use crate::error::{constants, BridgeError, Result};

/// Length of the canonical host buffer.
pub const HOST_LEN: usize = 16;

const IPV4_MAPPED_PREFIX: [u8; 12] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF];

/// An engine endpoint: 16-byte host, host-order port and IPv6 scope id.
///
/// `Address` is a plain value. Accessors hand out copies, so nothing a caller
/// does to a returned buffer can reach back into the address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address {
    host: [u8; HOST_LEN],
    port: u16,
    scope_id: u16,
}

impl Address {
    /// Builds an address from an already-sized host buffer.
    pub const fn new(host: [u8; HOST_LEN], port: u16, scope_id: u16) -> Self {
        Self {
            host,
            port,
            scope_id,
        }
    }

    /// Builds the IPv4-mapped form of `a.b.c.d:port`.
    pub const fn from_ipv4(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        let mut host = [0u8; HOST_LEN];
        host[10] = 0xFF;
        host[11] = 0xFF;
        host[12] = a;
        host[13] = b;
        host[14] = c;
        host[15] = d;
        Self::new(host, port, 0)
    }

    /// Builds an address from a raw host buffer.
    ///
    /// Fails with [`BridgeError::InvalidAddressLength`] unless `bytes` is
    /// exactly 16 bytes long.
    pub fn from_raw_host(bytes: &[u8], port: u16, scope_id: u16) -> Result<Self> {
        let host: [u8; HOST_LEN] = bytes
            .try_into()
            .map_err(|_| BridgeError::InvalidAddressLength(bytes.len()))?;
        Ok(Self::new(host, port, scope_id))
    }

    /// The unspecified address (`::`) on `port`; binds every interface.
    pub const fn any(port: u16) -> Self {
        Self::new([0u8; HOST_LEN], port, 0)
    }

    /// A copy of the host buffer.
    pub fn host(&self) -> [u8; HOST_LEN] {
        self.host
    }

    /// Replaces the host buffer. Leaves the address untouched on error.
    pub fn set_host(&mut self, bytes: &[u8]) -> Result<()> {
        let host: [u8; HOST_LEN] = bytes
            .try_into()
            .map_err(|_| BridgeError::InvalidAddressLength(bytes.len()))?;
        self.host = host;
        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    /// IPv6 scope id. Meaningless for IPv4-mapped hosts.
    pub fn scope_id(&self) -> u16 {
        self.scope_id
    }

    pub fn set_scope_id(&mut self, scope_id: u16) {
        self.scope_id = scope_id;
    }

    /// True when the host uses the `::ffff:a.b.c.d` convention.
    pub fn is_ipv4_mapped(&self) -> bool {
        self.host[..12] == IPV4_MAPPED_PREFIX
    }

    /// The embedded IPv4 address, if this is a mapped host.
    pub fn to_ipv4(&self) -> Option<Ipv4Addr> {
        if self.is_ipv4_mapped() {
            Some(Ipv4Addr::new(
                self.host[12],
                self.host[13],
                self.host[14],
                self.host[15],
            ))
        } else {
            None
        }
    }

    /// The host as a std IP address; mapped hosts come back as IPv4.
    pub fn ip(&self) -> IpAddr {
        match self.to_ipv4() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(Ipv6Addr::from(self.host)),
        }
    }

    fn from_ip(ip: IpAddr, port: u16, scope_id: u16) -> Self {
        match ip {
            IpAddr::V4(v4) => {
                let [a, b, c, d] = v4.octets();
                Self::from_ipv4(a, b, c, d, port)
            }
            IpAddr::V6(v6) => Self::new(v6.octets(), port, scope_id),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(v4) = self.to_ipv4() {
            let [a, b, c, d] = v4.octets();
            return write!(f, "{a}.{b}.{c}.{d}:{}", self.port);
        }

        for (i, pair) in self.host.chunks_exact(2).enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}{:02x}", pair[0], pair[1])?;
        }
        if self.scope_id != 0 {
            write!(f, "%{}", self.scope_id)?;
        }
        write!(f, ":{}", self.port)
    }
}

/// Parses `a.b.c.d:port`, `xxxx:...:xxxx[%scope]:port` and the bracketed
/// `[v6[%scope]]:port` form.
impl FromStr for Address {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        let (host_part, port_part) = s.rsplit_once(':').ok_or_else(|| {
            BridgeError::InvalidAddress(format!("{}: '{s}'", constants::ERR_MISSING_PORT))
        })?;

        let port = port_part
            .parse::<u16>()
            .map_err(|e| BridgeError::InvalidAddress(format!("bad port in '{s}': {e}")))?;

        let host_part = host_part
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host_part);

        let (ip_text, scope_id) = match host_part.split_once('%') {
            Some((ip, scope)) => {
                let scope = scope.parse::<u16>().map_err(|e| {
                    BridgeError::InvalidAddress(format!("bad scope id in '{s}': {e}"))
                })?;
                (ip, scope)
            }
            None => (host_part, 0),
        };

        let ip = ip_text
            .parse::<IpAddr>()
            .map_err(|e| BridgeError::InvalidAddress(format!("bad host in '{s}': {e}")))?;

        Ok(Self::from_ip(ip, port, scope_id))
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self::from_ip(IpAddr::V4(*v4.ip()), v4.port(), 0),
            // Scope ids wider than the engine's 16-bit field are truncated.
            SocketAddr::V6(v6) => Self::new(v6.ip().octets(), v6.port(), v6.scope_id() as u16),
        }
    }
}

impl From<Address> for SocketAddr {
    fn from(addr: Address) -> Self {
        match addr.to_ipv4() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), addr.port),
            None => SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(addr.host),
                addr.port,
                0,
                u32::from(addr.scope_id),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn test_ipv4_text() {
        let addr = Address::from_ipv4(127, 0, 0, 1, 7777);
        assert_eq!(addr.to_string(), "127.0.0.1:7777");
        assert!(addr.is_ipv4_mapped());
        assert_eq!(addr.scope_id(), 0);
    }

    #[test]
    fn test_mapped_layout() {
        let host = Address::from_ipv4(192, 168, 0, 1, 8080).host();
        assert_eq!(&host[..10], &[0u8; 10]);
        assert_eq!(&host[10..12], &[0xFF, 0xFF]);
        assert_eq!(&host[12..], &[192, 168, 0, 1]);
    }

    #[test]
    fn test_loopback_v6_text() {
        let mut host = [0u8; 16];
        host[15] = 1;
        let addr = Address::from_raw_host(&host, 9000, 0).unwrap();
        assert_eq!(addr.to_string(), "0000:0000:0000:0000:0000:0000:0000:0001:9000");
    }

    #[test]
    fn test_scope_id_rendered_for_v6_only() {
        let mut host = [0u8; 16];
        host[0] = 0xfe;
        host[1] = 0x80;
        host[15] = 0x2a;
        let addr = Address::new(host, 443, 3);
        assert_eq!(addr.to_string(), "fe80:0000:0000:0000:0000:0000:0000:002a%3:443");

        let mut mapped = Address::from_ipv4(10, 0, 0, 2, 443);
        mapped.set_scope_id(3);
        assert_eq!(mapped.to_string(), "10.0.0.2:443");
    }

    #[test]
    fn test_raw_host_length_checked() {
        for len in [0usize, 4, 15, 17, 32] {
            let err = Address::from_raw_host(&vec![0u8; len], 1, 0).unwrap_err();
            assert!(matches!(err, BridgeError::InvalidAddressLength(n) if n == len));
        }
    }

    #[test]
    fn test_set_host_is_all_or_nothing() {
        let mut addr = Address::from_ipv4(1, 2, 3, 4, 5);
        assert!(addr.set_host(&[9u8; 8]).is_err());
        assert_eq!(addr, Address::from_ipv4(1, 2, 3, 4, 5));

        addr.set_host(&[7u8; 16]).unwrap();
        assert_eq!(addr.host(), [7u8; 16]);
    }

    #[test]
    fn test_host_returns_copy() {
        let addr = Address::from_ipv4(1, 2, 3, 4, 5);
        let mut copy = addr.host();
        copy[15] = 99;
        assert_eq!(addr.host()[15], 4);
    }

    #[test]
    fn test_parse_both_forms() {
        let v4: Address = "127.0.0.1:7777".parse().unwrap();
        assert_eq!(v4, Address::from_ipv4(127, 0, 0, 1, 7777));

        let text = "fe80:0000:0000:0000:0000:0000:0000:002a%3:443";
        let v6: Address = text.parse().unwrap();
        assert_eq!(v6.scope_id(), 3);
        assert_eq!(v6.to_string(), text);

        let bracketed: Address = "[::1]:9000".parse().unwrap();
        assert_eq!(bracketed.host()[15], 1);
        assert_eq!(bracketed.port(), 9000);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("localhost".parse::<Address>().is_err());
        assert!("1.2.3.4:99999".parse::<Address>().is_err());
        assert!("1.2.3:80".parse::<Address>().is_err());
    }

    #[test]
    fn test_socket_addr_conversion() {
        let sock: SocketAddr = "10.1.2.3:4000".parse().unwrap();
        let addr = Address::from(sock);
        assert!(addr.is_ipv4_mapped());
        assert_eq!(SocketAddr::from(addr), sock);
    }
}
