//! Peer addresses.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::codec::{ensure_remaining, read_i16, read_u16};
use crate::error::{Error, Result};

/// Encoded length of every address in the grid (IPv4).
pub const ADDRESS_LEN: usize = 4;

/// A peer in the grid: IPv4 address plus replication port.
///
/// Ordered lexicographically by address octets, then by port.
///
/// Wire encoding (8 bytes):
/// - length: int16, always 4
/// - address: 4 bytes
/// - port: uint16
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AddressAndPort {
    address: Ipv4Addr,
    port: u16,
}

impl AddressAndPort {
    /// Encoded size in bytes.
    pub const ENCODED_LEN: usize = 2 + ADDRESS_LEN + 2;

    pub const fn new(address: Ipv4Addr, port: u16) -> Self {
        Self { address, port }
    }

    /// Build from raw address bytes, which must be exactly [`ADDRESS_LEN`] long.
    pub fn from_octets(octets: &[u8], port: u16) -> Result<Self> {
        let octets: [u8; ADDRESS_LEN] = octets.try_into().map_err(|_| Error::MalformedAddress {
            len: i16::try_from(octets.len()).unwrap_or(i16::MAX),
        })?;
        Ok(Self::new(Ipv4Addr::from(octets), port))
    }

    pub const fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    /// The low byte of the address, used to seed identifier allocation.
    pub const fn last_octet(&self) -> u8 {
        self.address.octets()[ADDRESS_LEN - 1]
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.port))
    }

    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_i16(ADDRESS_LEN as i16);
        out.put_slice(&self.address.octets());
        out.put_u16(self.port);
    }

    /// Decode one address.
    ///
    /// A declared length other than 4 fails with [`Error::MalformedAddress`],
    /// but only after the whole record (declared bytes and port) has been
    /// consumed, so a caller can skip the record and keep reading. A negative
    /// length fails with [`Error::InvalidLength`]; the input is then
    /// misaligned and must not be read further.
    pub fn decode(input: &mut impl Buf) -> Result<Self> {
        let len = read_i16(input)?;
        if len < 0 {
            return Err(Error::InvalidLength(len));
        }
        ensure_remaining(&*input, len as usize + 2)?;

        let mut octets = vec![0u8; len as usize];
        input.copy_to_slice(&mut octets);
        let port = read_u16(input)?;

        if octets.len() != ADDRESS_LEN {
            return Err(Error::MalformedAddress { len });
        }
        Self::from_octets(&octets, port)
    }
}

impl From<SocketAddrV4> for AddressAndPort {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

impl From<AddressAndPort> for SocketAddr {
    fn from(addr: AddressAndPort) -> Self {
        addr.socket_addr()
    }
}

impl fmt::Display for AddressAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}
