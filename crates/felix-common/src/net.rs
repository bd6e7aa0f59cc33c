//! Address types shared by the sequencer and the BPF IP set reconciler.
//!
//! IP set members travel as strings between the calculation graph, the
//! sequencer and the dataplane. This module parses them into typed values:
//!
//! - `10.0.0.0/8`, `fd00::/64`: a CIDR
//! - `10.0.0.1`, `fd00::1`: a host address (full-length prefix)
//! - `10.0.0.1,tcp:8080`: an address plus protocol and port (named ports)

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from parsing address strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid CIDR '{0}'")]
    InvalidCidr(String),

    #[error("invalid protocol '{0}'")]
    InvalidProtocol(String),

    #[error("invalid IP set member '{0}'")]
    InvalidMember(String),
}

/// An IP network with host bits cleared.
///
/// Ordered and hashable so it can key ordered buffers (IP pools, routes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cidr {
    addr: IpAddr,
    prefix_len: u8,
}

impl Cidr {
    /// Creates a CIDR, masking off host bits.
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, ParseError> {
        let net = IpNetwork::new(addr, prefix_len)
            .map_err(|_| ParseError::InvalidCidr(format!("{}/{}", addr, prefix_len)))?;
        Ok(Self::from(net))
    }

    /// Returns the (masked) network address.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Returns the prefix length.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Returns true for an IPv4 network.
    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    /// Returns true for an IPv6 network.
    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }

    /// Returns the full prefix length for this address family.
    pub fn max_prefix_len(&self) -> u8 {
        if self.is_ipv4() {
            32
        } else {
            128
        }
    }
}

impl From<IpNetwork> for Cidr {
    fn from(net: IpNetwork) -> Self {
        Self {
            addr: net.network(),
            prefix_len: net.prefix(),
        }
    }
}

impl From<IpAddr> for Cidr {
    fn from(addr: IpAddr) -> Self {
        let prefix_len = if addr.is_ipv4() { 32 } else { 128 };
        Self { addr, prefix_len }
    }
}

impl FromStr for Cidr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let net: IpNetwork = s
            .trim()
            .parse()
            .map_err(|_| ParseError::InvalidCidr(s.to_string()))?;
        Ok(Self::from(net))
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl Serialize for Cidr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// L4 protocol of a named-port IP set member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    /// Returns the lowercase name used in member strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        }
    }

    /// Returns the IANA protocol number.
    pub fn number(&self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
            Protocol::Sctp => 132,
        }
    }

    /// Maps an IANA protocol number back to a protocol.
    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            6 => Some(Protocol::Tcp),
            17 => Some(Protocol::Udp),
            132 => Some(Protocol::Sctp),
            _ => None,
        }
    }
}

impl FromStr for Protocol {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "sctp" => Ok(Protocol::Sctp),
            _ => Err(ParseError::InvalidProtocol(s.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of an IP set, which decides the member format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IpSetType {
    /// Host addresses.
    Ip,
    /// Address plus protocol and port (named ports).
    IpAndPort,
    /// CIDRs.
    Net,
}

impl IpSetType {
    /// Returns the name as it appears in config and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            IpSetType::Ip => "ip",
            IpSetType::IpAndPort => "ip-and-port",
            IpSetType::Net => "net",
        }
    }
}

impl fmt::Display for IpSetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed IP set member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IpSetMember {
    Cidr(Cidr),
    IpAndPort {
        addr: IpAddr,
        protocol: Protocol,
        port: u16,
    },
}

impl IpSetMember {
    /// Returns true if the member is an IPv4 member.
    pub fn is_ipv4(&self) -> bool {
        match self {
            IpSetMember::Cidr(cidr) => cidr.is_ipv4(),
            IpSetMember::IpAndPort { addr, .. } => addr.is_ipv4(),
        }
    }

    /// Formats the member the way it is carried in messages.
    pub fn to_proto_format(&self) -> String {
        self.to_string()
    }
}

impl FromStr for IpSetMember {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let Some((addr, rest)) = s.split_once(',') else {
            return Ok(IpSetMember::Cidr(s.parse()?));
        };
        let (proto, port) = rest
            .split_once(':')
            .ok_or_else(|| ParseError::InvalidMember(s.to_string()))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| ParseError::InvalidMember(s.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ParseError::InvalidMember(s.to_string()))?;
        Ok(IpSetMember::IpAndPort {
            addr,
            protocol: proto.parse()?,
            port,
        })
    }
}

impl fmt::Display for IpSetMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpSetMember::Cidr(cidr) => write!(f, "{}", cidr),
            IpSetMember::IpAndPort {
                addr,
                protocol,
                port,
            } => write!(f, "{},{}:{}", addr, protocol, port),
        }
    }
}

/// Serde helpers for values carried as their text form (`Display`/`FromStr`).
pub mod as_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::fmt::Display;
    use std::str::FromStr;

    pub fn serialize<T: Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Like [`as_str`], for optional values.
pub mod opt_as_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::fmt::Display;
    use std::str::FromStr;

    pub fn serialize<T: Display, S: Serializer>(
        value: &Option<T>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.collect_str(v),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) if !s.is_empty() => s.parse().map(Some).map_err(serde::de::Error::custom),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_parse_masks_host_bits() {
        let cidr: Cidr = "10.1.2.3/8".parse().unwrap();
        assert_eq!(cidr.to_string(), "10.0.0.0/8");
        assert_eq!(cidr.prefix_len(), 8);
        assert!(cidr.is_ipv4());
    }

    #[test]
    fn test_cidr_bare_address_is_host_prefix() {
        let v4: Cidr = "10.0.0.1".parse().unwrap();
        assert_eq!(v4.to_string(), "10.0.0.1/32");

        let v6: Cidr = "fd00::1".parse().unwrap();
        assert_eq!(v6.prefix_len(), 128);
        assert_eq!(v6.max_prefix_len(), 128);
    }

    #[test]
    fn test_cidr_rejects_garbage() {
        assert!("10.0.0.1/33".parse::<Cidr>().is_err());
        assert!("not-an-ip".parse::<Cidr>().is_err());
    }

    #[test]
    fn test_member_parse() {
        let m: IpSetMember = "10.0.0.1/32".parse().unwrap();
        assert_eq!(m, IpSetMember::Cidr("10.0.0.1/32".parse().unwrap()));

        let m: IpSetMember = "10.0.0.1,tcp:8080".parse().unwrap();
        assert_eq!(
            m,
            IpSetMember::IpAndPort {
                addr: "10.0.0.1".parse().unwrap(),
                protocol: Protocol::Tcp,
                port: 8080,
            }
        );
        assert_eq!(m.to_proto_format(), "10.0.0.1,tcp:8080");

        let m: IpSetMember = "fd00::1,udp:53".parse().unwrap();
        assert!(!m.is_ipv4());
    }

    #[test]
    fn test_member_parse_errors() {
        assert!("10.0.0.1,tcp".parse::<IpSetMember>().is_err());
        assert!("10.0.0.1,icmp:1".parse::<IpSetMember>().is_err());
        assert!("10.0.0.1,tcp:99999".parse::<IpSetMember>().is_err());
    }

    #[test]
    fn test_serde_text_forms() {
        let cidr: Cidr = serde_json::from_str("\"192.168.1.7/24\"").unwrap();
        assert_eq!(serde_json::to_string(&cidr).unwrap(), "\"192.168.1.0/24\"");

        let ty: IpSetType = serde_json::from_str("\"ip-and-port\"").unwrap();
        assert_eq!(ty, IpSetType::IpAndPort);
    }

    #[test]
    fn test_protocol_numbers() {
        for proto in [Protocol::Tcp, Protocol::Udp, Protocol::Sctp] {
            assert_eq!(Protocol::from_number(proto.number()), Some(proto));
        }
        assert_eq!(Protocol::from_number(1), None);
    }
}
