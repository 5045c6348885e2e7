//! Peer address book.
//!
//! Maps the configured peer ZTP identifiers (`"<IA>,<IP>"`) to their
//! underlay endpoints, with a reverse index from underlay IP to identifier.
//! The key-service listener uses the reverse index to attribute inbound
//! sessions; the datapath sender uses the forward map for data endpoints.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use crate::error::{Result, ZtpError};

/// Split a `"<IA>,<IP>"` identifier into its parts.
pub fn parse_peer_id(id: &str) -> Result<(String, IpAddr)> {
    let (ia, ip) = id
        .split_once(',')
        .ok_or_else(|| ZtpError::Config(format!("peer id {:?} is not \"<IA>,<IP>\"", id)))?;
    if ia.is_empty() {
        return Err(ZtpError::Config(format!("peer id {:?} has empty IA", id)));
    }
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| ZtpError::Config(format!("peer id {:?} has invalid IP", id)))?;
    Ok((ia.to_string(), ip))
}

/// Address of a peer's L1 key service, derived from its identifier.
pub fn key_service_addr(id: &str, port: u16) -> Result<SocketAddr> {
    let (_, ip) = parse_peer_id(id)?;
    Ok(SocketAddr::new(ip, port))
}

/// One configured remote ZTP.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: String,
    pub ip: IpAddr,
    pub data_port: u16,
}

impl Peer {
    pub fn data_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.data_port)
    }
}

/// Immutable address book built from configuration at startup.
pub struct PeerTable {
    by_id: HashMap<String, Peer>,
    by_ip: HashMap<IpAddr, String>,
}

impl PeerTable {
    pub fn new(peers: impl IntoIterator<Item = (String, u16)>) -> Result<Self> {
        let mut by_id = HashMap::new();
        let mut by_ip = HashMap::new();
        for (id, data_port) in peers {
            let (_, ip) = parse_peer_id(&id)?;
            if by_ip.insert(ip, id.clone()).is_some() {
                return Err(ZtpError::Config(format!(
                    "duplicate peer underlay IP {}",
                    ip
                )));
            }
            by_id.insert(id.clone(), Peer { id, ip, data_port });
        }
        Ok(PeerTable { by_id, by_ip })
    }

    /// Identify the peer behind an underlay source address.
    pub fn id_by_ip(&self, ip: IpAddr) -> Option<&str> {
        self.by_ip.get(&ip).map(String::as_str)
    }

    pub fn get(&self, id: &str) -> Option<&Peer> {
        self.by_id.get(id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_peer_id() {
        let (ia, ip) = parse_peer_id("1-ff00:0:110,10.0.0.1").unwrap();
        assert_eq!(ia, "1-ff00:0:110");
        assert_eq!(ip, "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn rejects_malformed_peer_id() {
        assert!(parse_peer_id("no-comma-here").is_err());
        assert!(parse_peer_id(",10.0.0.1").is_err());
        assert!(parse_peer_id("1-ff00:0:110,not-an-ip").is_err());
    }

    #[test]
    fn table_maps_both_directions() {
        let table = PeerTable::new(vec![
            ("1-ff00:0:111,10.0.0.2".to_string(), 30041),
            ("1-ff00:0:112,10.0.0.3".to_string(), 30042),
        ])
        .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.id_by_ip("10.0.0.2".parse().unwrap()),
            Some("1-ff00:0:111,10.0.0.2")
        );
        let peer = table.get("1-ff00:0:112,10.0.0.3").unwrap();
        assert_eq!(peer.data_addr().to_string(), "10.0.0.3:30042");
        assert_eq!(table.id_by_ip("10.9.9.9".parse().unwrap()), None);
    }

    #[test]
    fn rejects_duplicate_underlay_ip() {
        let res = PeerTable::new(vec![
            ("1-ff00:0:111,10.0.0.2".to_string(), 30041),
            ("1-ff00:0:112,10.0.0.2".to_string(), 30041),
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn key_service_addr_uses_id_ip() {
        let addr = key_service_addr("1-ff00:0:111,10.0.0.2", 9090).unwrap();
        assert_eq!(addr.to_string(), "10.0.0.2:9090");
    }
}
