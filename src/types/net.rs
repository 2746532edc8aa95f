//! A minimal IPv4 CIDR block, just enough for overlay subnet math (§4.7).

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv4Cidr {
    base: u32,
    prefix_len: u8,
}

impl Ipv4Cidr {
    pub fn new(base: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            base: u32::from(base) & mask(prefix_len),
            prefix_len,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let (addr, len) = s.split_once('/')?;
        let addr: Ipv4Addr = addr.parse().ok()?;
        let len: u8 = len.parse().ok()?;
        if len > 32 {
            return None;
        }
        Some(Self::new(addr, len))
    }

    pub fn base_u32(&self) -> u32 {
        self.base
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn network_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base)
    }

    /// Number of host-addressable bits below this prefix.
    pub fn host_bits(&self) -> u8 {
        32 - self.prefix_len
    }

    /// A sub-block of `new_prefix_len` bits carved out at `index` within
    /// this block (used to slice a runner subnet out of the overlay CIDR).
    pub fn subnet(&self, index: u32, new_prefix_len: u8) -> Ipv4Cidr {
        let shift = 32 - new_prefix_len;
        let base = self.base.wrapping_add(index << shift);
        Ipv4Cidr {
            base: base & mask(new_prefix_len),
            prefix_len: new_prefix_len,
        }
    }

    /// The address at `offset` from the network address of this block.
    pub fn nth(&self, offset: u32) -> Ipv4Addr {
        Ipv4Addr::from(self.base.wrapping_add(offset))
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        (u32::from(addr) & mask(self.prefix_len)) == self.base
    }

    /// All host addresses in this block (including network/broadcast
    /// addresses; callers exclude reserved offsets themselves).
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> + use<> {
        let base = self.base;
        let count: u64 = 1u64 << self.host_bits();
        (0..count).map(move |i| Ipv4Addr::from(base.wrapping_add(i as u32)))
    }
}

impl std::fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network_address(), self.prefix_len)
    }
}

fn mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_slicing_matches_overlay_math() {
        // BASE/NETWORK_PREFIX/NODE_BITS/SUBNET_BITS = 10.128.0.0/9/9/14? keep simple:
        // base 10.128.0.0/9, 9 node bits, 14 subnet bits -> runner subnet is /18.
        let overlay = Ipv4Cidr::parse("10.128.0.0/9").unwrap();
        let runner2 = overlay.subnet(2, 18);
        assert_eq!(runner2.to_string(), "10.128.128.0/18");
        assert_eq!(runner2.nth(1), "10.128.128.1".parse::<Ipv4Addr>().unwrap());
    }
}
