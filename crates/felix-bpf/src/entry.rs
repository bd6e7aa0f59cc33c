//! Fixed-width IP set entry encoding.
//!
//! Entries are LPM trie keys. Layout, v4 (20 bytes) / v6 (32 bytes):
//!
//! ```text
//! 0        4          12            12+A    14+A    15+A
//! | prefix | set ID   | address (A) | port  | proto | pad |
//!   u32 LE   u64 BE     network order  u16 LE  u8
//! ```
//!
//! The prefix length counts bits after the prefix field itself. CIDR members
//! use `64 + cidr_len` so the trie matches on set ID and then the CIDR.
//! Named-port members use the full key length so they only match exactly.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use felix_common::{Cidr, IpSetMember, Protocol};
use tracing::warn;

pub const V4_ENTRY_SIZE: usize = 20;
pub const V6_ENTRY_SIZE: usize = 32;

/// Value stored for every entry; the trie is used as a set.
pub const DUMMY_VALUE: [u8; 4] = [1, 0, 0, 0];

const SET_ID_BITS: u32 = 64;

/// Address family an IP set map holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn from_version(version: u8) -> Option<Self> {
        match version {
            4 => Some(IpFamily::V4),
            6 => Some(IpFamily::V6),
            _ => None,
        }
    }

    pub fn version(&self) -> u8 {
        match self {
            IpFamily::V4 => 4,
            IpFamily::V6 => 6,
        }
    }

    pub fn entry_size(&self) -> usize {
        match self {
            IpFamily::V4 => V4_ENTRY_SIZE,
            IpFamily::V6 => V6_ENTRY_SIZE,
        }
    }

    fn addr_len(&self) -> usize {
        match self {
            IpFamily::V4 => 4,
            IpFamily::V6 => 16,
        }
    }

    fn matches(&self, addr: &IpAddr) -> bool {
        matches!(
            (self, addr),
            (IpFamily::V4, IpAddr::V4(_)) | (IpFamily::V6, IpAddr::V6(_))
        )
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => f.write_str("inet"),
            IpFamily::V6 => f.write_str("inet6"),
        }
    }
}

/// One encoded IP set entry.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IpSetEntry {
    V4([u8; V4_ENTRY_SIZE]),
    V6([u8; V6_ENTRY_SIZE]),
}

impl IpSetEntry {
    /// Encodes a CIDR (`protocol == 0`) or a named-port entry.
    pub fn new(set_id: u64, cidr: &Cidr, port: u16, protocol: u8) -> Self {
        match cidr.addr() {
            IpAddr::V4(addr) => {
                let mut buf = [0u8; V4_ENTRY_SIZE];
                encode(&mut buf, set_id, &addr.octets(), cidr.prefix_len(), port, protocol);
                IpSetEntry::V4(buf)
            }
            IpAddr::V6(addr) => {
                let mut buf = [0u8; V6_ENTRY_SIZE];
                encode(&mut buf, set_id, &addr.octets(), cidr.prefix_len(), port, protocol);
                IpSetEntry::V6(buf)
            }
        }
    }

    /// Decodes a raw map key. `None` if the length matches neither family.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if let Ok(buf) = <[u8; V4_ENTRY_SIZE]>::try_from(bytes) {
            return Some(IpSetEntry::V4(buf));
        }
        <[u8; V6_ENTRY_SIZE]>::try_from(bytes)
            .ok()
            .map(IpSetEntry::V6)
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            IpSetEntry::V4(b) => b,
            IpSetEntry::V6(b) => b,
        }
    }

    pub fn family(&self) -> IpFamily {
        match self {
            IpSetEntry::V4(_) => IpFamily::V4,
            IpSetEntry::V6(_) => IpFamily::V6,
        }
    }

    pub fn set_id(&self) -> u64 {
        let b = self.as_bytes();
        let mut id = [0u8; 8];
        id.copy_from_slice(&b[4..12]);
        u64::from_be_bytes(id)
    }

    pub fn addr(&self) -> IpAddr {
        match self {
            IpSetEntry::V4(b) => {
                let mut a = [0u8; 4];
                a.copy_from_slice(&b[12..16]);
                IpAddr::V4(Ipv4Addr::from(a))
            }
            IpSetEntry::V6(b) => {
                let mut a = [0u8; 16];
                a.copy_from_slice(&b[12..28]);
                IpAddr::V6(Ipv6Addr::from(a))
            }
        }
    }

    /// Raw LPM prefix length, including the set ID bits.
    pub fn lpm_prefix_len(&self) -> u32 {
        let b = self.as_bytes();
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    /// Prefix length of the address part.
    pub fn prefix_len(&self) -> u8 {
        let addr_bits = (self.family().addr_len() * 8) as u32;
        let bits = self.lpm_prefix_len().saturating_sub(SET_ID_BITS).min(addr_bits);
        bits as u8
    }

    pub fn port(&self) -> u16 {
        let off = 12 + self.family().addr_len();
        let b = self.as_bytes();
        u16::from_le_bytes([b[off], b[off + 1]])
    }

    pub fn protocol(&self) -> u8 {
        self.as_bytes()[14 + self.family().addr_len()]
    }
}

fn encode(buf: &mut [u8], set_id: u64, addr: &[u8], cidr_len: u8, port: u16, protocol: u8) {
    let prefix_len = if protocol == 0 {
        SET_ID_BITS + cidr_len as u32
    } else {
        (buf.len() as u32 - 4) * 8
    };
    let addr_end = 12 + addr.len();
    buf[0..4].copy_from_slice(&prefix_len.to_le_bytes());
    buf[4..12].copy_from_slice(&set_id.to_be_bytes());
    buf[12..addr_end].copy_from_slice(addr);
    buf[addr_end..addr_end + 2].copy_from_slice(&port.to_le_bytes());
    buf[addr_end + 2] = protocol;
}

impl fmt::Debug for IpSetEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpSetEntry")
            .field("set_id", &self.set_id())
            .field("addr", &self.addr())
            .field("prefix_len", &self.prefix_len())
            .field("port", &self.port())
            .field("protocol", &self.protocol())
            .finish()
    }
}

impl fmt::Display for IpSetEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}:{}/{}", self.set_id(), self.addr(), self.prefix_len())?;
        match Protocol::from_number(self.protocol()) {
            Some(proto) => write!(f, ",{}:{}", proto, self.port()),
            None => Ok(()),
        }
    }
}

/// Encodes a parsed member. `None` if it belongs to the other family.
pub fn member_to_entry(family: IpFamily, set_id: u64, member: &IpSetMember) -> Option<IpSetEntry> {
    match member {
        IpSetMember::Cidr(cidr) => {
            if !family.matches(&cidr.addr()) {
                return None;
            }
            Some(IpSetEntry::new(set_id, cidr, 0, 0))
        }
        IpSetMember::IpAndPort {
            addr,
            protocol,
            port,
        } => {
            if !family.matches(addr) {
                return None;
            }
            Some(IpSetEntry::new(
                set_id,
                &Cidr::from(*addr),
                *port,
                protocol.number(),
            ))
        }
    }
}

/// Parses and encodes a member string as carried in IP set messages.
/// Unparseable members and members of the other family yield `None`.
pub fn proto_member_to_entry(family: IpFamily, set_id: u64, member: &str) -> Option<IpSetEntry> {
    match member.parse::<IpSetMember>() {
        Ok(parsed) => member_to_entry(family, set_id, &parsed),
        Err(e) => {
            warn!(member, error = %e, "Ignoring unparseable IP set member");
            None
        }
    }
}
