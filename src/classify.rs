//! IP header classification.
//!
//! Reads the source and destination addresses out of the raw packet at the
//! fixed IPv4/IPv6 header offsets. Pure function of the packet bytes.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{Result, ZtpError};
use crate::packet::Packet;

const IP4_VER: u8 = 0x4;
const IP6_VER: u8 = 0x6;
const IP4_SRC_OFF: usize = 12;
const IP4_DST_OFF: usize = 16;
const IP6_SRC_OFF: usize = 8;
const IP6_DST_OFF: usize = 24;

/// Classifier stage. Writes `src_host`/`dst_host` on the packet.
#[derive(Debug, Clone, Copy)]
pub struct Classifier;

impl Classifier {
    pub fn handle(&self, mut pkt: Packet) -> Result<Packet> {
        let (src, dst) = classify(&pkt.raw)?;
        pkt.src_host = Some(src);
        pkt.dst_host = Some(dst);
        Ok(pkt)
    }
}

fn classify(raw: &[u8]) -> Result<(IpAddr, IpAddr)> {
    if raw.is_empty() {
        return Err(ZtpError::BadHeader("empty packet".into()));
    }
    match raw[0] >> 4 {
        IP4_VER => {
            if raw.len() < IP4_DST_OFF + 4 {
                return Err(ZtpError::BadHeader(format!(
                    "IPv4 packet too short: {} bytes",
                    raw.len()
                )));
            }
            let src: [u8; 4] = raw[IP4_SRC_OFF..IP4_SRC_OFF + 4].try_into().unwrap();
            let dst: [u8; 4] = raw[IP4_DST_OFF..IP4_DST_OFF + 4].try_into().unwrap();
            Ok((
                IpAddr::V4(Ipv4Addr::from(src)),
                IpAddr::V4(Ipv4Addr::from(dst)),
            ))
        }
        IP6_VER => {
            if raw.len() < IP6_DST_OFF + 16 {
                return Err(ZtpError::BadHeader(format!(
                    "IPv6 packet too short: {} bytes",
                    raw.len()
                )));
            }
            let src: [u8; 16] = raw[IP6_SRC_OFF..IP6_SRC_OFF + 16].try_into().unwrap();
            let dst: [u8; 16] = raw[IP6_DST_OFF..IP6_DST_OFF + 16].try_into().unwrap();
            Ok((
                IpAddr::V6(Ipv6Addr::from(src)),
                IpAddr::V6(Ipv6Addr::from(dst)),
            ))
        }
        ver => Err(ZtpError::BadHeader(format!(
            "unsupported IP version {}",
            ver
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_ipv4() {
        let mut raw = vec![0u8; 20];
        raw[0] = 0x45;
        raw[12..16].copy_from_slice(&[192, 168, 1, 10]);
        raw[16..20].copy_from_slice(&[10, 0, 0, 1]);
        let (src, dst) = classify(&raw).unwrap();
        assert_eq!(src.to_string(), "192.168.1.10");
        assert_eq!(dst.to_string(), "10.0.0.1");
    }

    #[test]
    fn classifies_ipv6() {
        let mut raw = vec![0u8; 40];
        raw[0] = 0x60;
        raw[8] = 0xfd;
        raw[23] = 0x01;
        raw[24] = 0xfd;
        raw[39] = 0x02;
        let (src, dst) = classify(&raw).unwrap();
        assert!(src.is_ipv6());
        assert!(dst.is_ipv6());
        assert_ne!(src, dst);
    }

    #[test]
    fn classification_is_idempotent() {
        let mut raw = vec![0u8; 20];
        raw[0] = 0x45;
        raw[12..16].copy_from_slice(&[172, 16, 0, 1]);
        raw[16..20].copy_from_slice(&[172, 16, 0, 2]);
        let first = classify(&raw).unwrap();
        let second = classify(&raw).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_empty_packet() {
        assert!(matches!(classify(&[]), Err(ZtpError::BadHeader(_))));
    }

    #[test]
    fn rejects_unknown_version() {
        let raw = vec![0x50; 40];
        assert!(matches!(classify(&raw), Err(ZtpError::BadHeader(_))));
    }

    #[test]
    fn rejects_truncated_ipv4() {
        let mut raw = vec![0u8; 16];
        raw[0] = 0x45;
        assert!(matches!(classify(&raw), Err(ZtpError::BadHeader(_))));
    }

    #[test]
    fn rejects_truncated_ipv6() {
        let mut raw = vec![0u8; 24];
        raw[0] = 0x60;
        assert!(matches!(classify(&raw), Err(ZtpError::BadHeader(_))));
    }
}
