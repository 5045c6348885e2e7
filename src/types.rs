//! Zone and subnet types shared with the policy controller.
//!
//! These mirror the controller's JSON wire format: subnets are
//! `{CIDR, ZoneID, TPAddr}` records and transitions map a zone to the zones
//! it may send to.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::error::ZtpError;

/// Zone identifiers are 24-bit unsigned integers.
pub const MAX_ZONE: u32 = (1 << 24) - 1;

/// A validated 24-bit zone identifier.
///
/// Construction is the ingest point: out-of-range values never make it into
/// a `ZoneId`, whether they arrive from controller JSON or from local code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ZoneId(u32);

impl ZoneId {
    pub fn new(id: u32) -> Result<Self, ZtpError> {
        if id > MAX_ZONE {
            return Err(ZtpError::Config(format!(
                "zone ID {} exceeds 24-bit range",
                id
            )));
        }
        Ok(ZoneId(id))
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for ZoneId {
    type Error = ZtpError;

    fn try_from(id: u32) -> Result<Self, Self::Error> {
        ZoneId::new(id)
    }
}

impl From<ZoneId> for u32 {
    fn from(zone: ZoneId) -> u32 {
        zone.0
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Maps a zone ID to all zone IDs it is allowed to send data to.
pub type Transitions = HashMap<ZoneId, Vec<ZoneId>>;

/// An IP network in prefix notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl Cidr {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, ZtpError> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(ZtpError::Config(format!(
                "prefix length {} too long for {}",
                prefix_len, addr
            )));
        }
        Ok(Cidr { addr, prefix_len })
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    /// Network address bits, widened to u128 and left-aligned per family so
    /// the prefix occupies the high-order bits.
    pub fn bits(&self) -> u128 {
        addr_bits(self.addr)
    }

    /// True if `ip` belongs to this network. Families must match.
    pub fn contains(&self, ip: IpAddr) -> bool {
        if self.addr.is_ipv4() != ip.is_ipv4() {
            return false;
        }
        if self.prefix_len == 0 {
            return true;
        }
        let mask = !0u128 << (128 - self.prefix_len as u32);
        (addr_bits(ip) & mask) == (self.bits() & mask)
    }
}

/// Address bits left-aligned in a u128: IPv4 occupies the top 32 bits.
pub fn addr_bits(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => (u32::from(v4) as u128) << 96,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

impl FromStr for Cidr {
    type Err = ZtpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| ZtpError::Config(format!("invalid CIDR {:?}", s)))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| ZtpError::Config(format!("invalid address in CIDR {:?}", s)))?;
        let prefix_len: u8 = len
            .parse()
            .map_err(|_| ZtpError::Config(format!("invalid prefix length in CIDR {:?}", s)))?;
        Cidr::new(addr, prefix_len)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl Serialize for Cidr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// An IP subnet located behind a translation point.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subnet {
    #[serde(rename = "CIDR")]
    pub cidr: Cidr,
    #[serde(rename = "ZoneID")]
    pub zone_id: ZoneId,
    #[serde(rename = "TPAddr")]
    pub tp_addr: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_id_enforces_24_bit_range() {
        assert_eq!(ZoneId::new(0).unwrap().get(), 0);
        assert_eq!(ZoneId::new(MAX_ZONE).unwrap().get(), MAX_ZONE);
        assert!(ZoneId::new(MAX_ZONE + 1).is_err());
    }

    #[test]
    fn zone_id_rejected_at_deserialization() {
        assert!(serde_json::from_str::<ZoneId>("16777215").is_ok());
        assert!(serde_json::from_str::<ZoneId>("16777216").is_err());

        let json = r#"{"CIDR":"10.0.0.0/8","ZoneID":16777216,"TPAddr":"1-ff00:0:110,10.0.0.1"}"#;
        assert!(serde_json::from_str::<Subnet>(json).is_err());
    }

    #[test]
    fn transitions_reject_out_of_range_keys() {
        let ok: Transitions = serde_json::from_str(r#"{"1": [2, 3]}"#).unwrap();
        assert_eq!(
            ok[&ZoneId::new(1).unwrap()],
            vec![ZoneId::new(2).unwrap(), ZoneId::new(3).unwrap()]
        );
        assert!(serde_json::from_str::<Transitions>(r#"{"16777216": [1]}"#).is_err());
        assert!(serde_json::from_str::<Transitions>(r#"{"1": [16777216]}"#).is_err());
    }

    #[test]
    fn parses_and_prints_cidr() {
        let c: Cidr = "10.0.0.0/24".parse().unwrap();
        assert_eq!(c.prefix_len, 24);
        assert_eq!(c.to_string(), "10.0.0.0/24");
        let c6: Cidr = "fd00::/8".parse().unwrap();
        assert!(!c6.is_ipv4());
    }

    #[test]
    fn rejects_bad_cidr() {
        assert!("10.0.0.0".parse::<Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("fd00::/129".parse::<Cidr>().is_err());
        assert!("not-an-ip/8".parse::<Cidr>().is_err());
    }

    #[test]
    fn contains_respects_prefix() {
        let c: Cidr = "10.0.1.0/24".parse().unwrap();
        assert!(c.contains("10.0.1.200".parse().unwrap()));
        assert!(!c.contains("10.0.2.1".parse().unwrap()));
        assert!(!c.contains("fd00::1".parse().unwrap()));
        let all: Cidr = "0.0.0.0/0".parse().unwrap();
        assert!(all.contains("203.0.113.7".parse().unwrap()));
    }

    #[test]
    fn subnet_round_trips_controller_json() {
        let json = r#"{"CIDR":"192.168.0.0/16","ZoneID":42,"TPAddr":"1-ff00:0:110,10.0.0.1"}"#;
        let s: Subnet = serde_json::from_str(json).unwrap();
        assert_eq!(s.cidr.to_string(), "192.168.0.0/16");
        assert_eq!(s.zone_id.get(), 42);
        let back = serde_json::to_string(&s).unwrap();
        assert_eq!(back, json);
    }
}
