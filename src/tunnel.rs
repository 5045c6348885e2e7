//! Local tunnel sink.
//!
//! Cleartext packets leaving the datapath (decrypted ingress traffic and
//! intra-site egress traffic) are handed to a `Tunnel`. The production
//! implementation forwards them over a local UDP socket; the real TUN
//! device sits outside this daemon.

use std::net::{SocketAddr, UdpSocket};

/// Sink for cleartext IP packets headed to the local network.
pub trait Tunnel: Send + Sync {
    fn write_packet(&self, raw: &[u8]) -> std::io::Result<()>;
}

/// Forwards packets to a local UDP endpoint.
pub struct UdpTunnel {
    socket: UdpSocket,
    forward: SocketAddr,
}

impl UdpTunnel {
    pub fn new(forward: SocketAddr) -> std::io::Result<Self> {
        let bind_addr: SocketAddr = if forward.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr)?;
        Ok(UdpTunnel { socket, forward })
    }
}

impl Tunnel for UdpTunnel {
    fn write_packet(&self, raw: &[u8]) -> std::io::Result<()> {
        self.socket.send_to(raw, self.forward)?;
        Ok(())
    }
}
