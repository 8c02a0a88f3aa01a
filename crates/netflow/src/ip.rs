//! 128-bit IP address container used as the host/flow identity key.
//!
//! IPv4 addresses live right-aligned in the low 4 bytes, mirroring the
//! `ip_addr_t` layout the original NEMEA detectors use so that a single
//! key type serves both families without a tagged union.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const V4_PREFIX: [u8; 12] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff];

/// A 128-bit container for an IPv4 or IPv6 address.
///
/// Keys are compared and hashed as opaque bytes; they never carry a
/// direction (src/dst is a property of where the key is used, not of the
/// key itself).
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IpKey(pub [u8; 16]);

impl IpKey {
    pub fn from_v4(octets: [u8; 4]) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..12].copy_from_slice(&V4_PREFIX);
        bytes[12..].copy_from_slice(&octets);
        Self(bytes)
    }

    pub fn from_v6(octets: [u8; 16]) -> Self {
        Self(octets)
    }

    pub fn from_ip_addr(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => Self::from_v4(v4.octets()),
            IpAddr::V6(v6) => Self::from_v6(v6.octets()),
        }
    }

    /// A freshly parsed dotted-quad address has `is_v4() == true`.
    pub fn is_v4(&self) -> bool {
        self.0[..12] == V4_PREFIX
    }

    pub fn is_v6(&self) -> bool {
        !self.is_v4()
    }

    /// The 32-bit representation, right-aligned, of an IPv4 key.
    pub fn as_u32_v4(&self) -> Option<u32> {
        if !self.is_v4() {
            return None;
        }
        Some(u32::from_be_bytes(self.0[12..16].try_into().unwrap()))
    }

    pub fn as_u128(&self) -> u128 {
        u128::from_be_bytes(self.0)
    }

    /// FNV-style hash over the 16 opaque bytes (spec §4.C2).
    pub fn fnv_hash(&self) -> u64 {
        const FNV_OFFSET: u64 = 0xcbf29ce484222325;
        const FNV_PRIME: u64 = 0x100000001b3;
        let mut hash = FNV_OFFSET;
        for byte in self.0 {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash
    }

    pub fn to_ip_addr(self) -> IpAddr {
        if self.is_v4() {
            IpAddr::V4(Ipv4Addr::new(self.0[12], self.0[13], self.0[14], self.0[15]))
        } else {
            IpAddr::V6(Ipv6Addr::from(self.0))
        }
    }

    /// Apply a CIDR mask, keeping the network part and zeroing host bits.
    /// For IPv4 keys `prefix` is interpreted as a /0..=32 IPv4 prefix; for
    /// IPv6 keys it is /0..=128.
    pub fn masked(&self, prefix: u8) -> Self {
        if self.is_v4() {
            let bits = prefix.min(32);
            let v = self.as_u32_v4().unwrap();
            let mask = if bits == 0 { 0 } else { !0u32 << (32 - bits) };
            Self::from_v4((v & mask).to_be_bytes())
        } else {
            let bits = prefix.min(128);
            let v = self.as_u128();
            let mask = if bits == 0 { 0 } else { !0u128 << (128 - bits) };
            Self::from_v6((v & mask).to_be_bytes())
        }
    }
}

impl From<IpAddr> for IpKey {
    fn from(addr: IpAddr) -> Self {
        Self::from_ip_addr(addr)
    }
}

impl fmt::Debug for IpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_ip_addr())
    }
}

impl fmt::Display for IpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_ip_addr())
    }
}
