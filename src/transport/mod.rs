//! Collaborator seams: datagram sending, the TCP relay multiplex, and the
//! DHT announce directory.
//!
//! The group runtime never opens sockets. Everything leaves through the
//! [`Transport`] trait and public-group discoverability is maintained via
//! [`AnnounceDirectory`]. Wire types for addresses and relay nodes live here
//! because they appear inside handshake and sync payloads.

#[doc(hidden)]
pub mod testing;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

use crate::crypto::ENC_PUBLIC_KEY_SIZE;
use crate::wire::{Reader, WireError, Writer};

/// Family discriminators on the wire.
const FAMILY_V4: u8 = 2;
const FAMILY_V6: u8 = 10;

/// A peer's UDP endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpPort {
    pub ip: IpAddr,
    pub port: u16,
}

impl IpPort {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn pack(&self, w: &mut Writer) {
        match self.ip {
            IpAddr::V4(v4) => {
                w.put_u8(FAMILY_V4);
                w.put_bytes(&v4.octets());
            }
            IpAddr::V6(v6) => {
                w.put_u8(FAMILY_V6);
                w.put_bytes(&v6.octets());
            }
        }
        w.put_u16(self.port);
    }

    pub fn unpack(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let family = r.take_u8()?;
        let ip = match family {
            FAMILY_V4 => {
                let octets: [u8; 4] = r.take_array()?;
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            FAMILY_V6 => {
                let octets: [u8; 16] = r.take_array()?;
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            other => return Err(WireError::InvalidDiscriminator(other)),
        };
        let port = r.take_u16()?;
        Ok(Self { ip, port })
    }
}

impl fmt::Display for IpPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// A TCP relay: its endpoint plus the relay's long-term encryption key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpRelayNode {
    pub addr: IpPort,
    pub public_key: [u8; ENC_PUBLIC_KEY_SIZE],
}

impl TcpRelayNode {
    pub fn pack(&self, w: &mut Writer) {
        self.addr.pack(w);
        w.put_bytes(&self.public_key);
    }

    pub fn unpack(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let addr = IpPort::unpack(r)?;
        let public_key: [u8; ENC_PUBLIC_KEY_SIZE] = r.take_array()?;
        Ok(Self { addr, public_key })
    }

    /// Packs up to `nodes.len()` relay nodes back to back.
    pub fn pack_list(nodes: &[TcpRelayNode], w: &mut Writer) {
        for node in nodes {
            node.pack(w);
        }
    }

    /// Unpacks up to `max` relay nodes from the remaining bytes.
    pub fn unpack_list(r: &mut Reader<'_>, max: usize) -> Result<Vec<TcpRelayNode>, WireError> {
        let mut nodes = Vec::new();
        while nodes.len() < max && r.remaining() > 0 {
            nodes.push(TcpRelayNode::unpack(r)?);
        }
        Ok(nodes)
    }
}

/// Handle to one logical TCP channel inside the per-group multiplex.
pub type ChannelId = u32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("No channel for peer")]
    NoChannel,
}

/// Outbound network operations the group runtime consumes.
///
/// `send_udp` is fire-and-forget over the unreliable path. Channels are
/// logical per-peer links through the TCP relay multiplex; OOB sends travel
/// through a named relay toward a peer we have no channel for yet.
pub trait Transport: Send + Sync {
    fn send_udp(&self, addr: IpPort, data: &[u8]) -> Result<(), TransportError>;

    fn new_channel(&self, peer_enc_pk: &[u8; ENC_PUBLIC_KEY_SIZE]) -> Result<ChannelId, TransportError>;

    fn send_channel(&self, channel: ChannelId, data: &[u8]) -> Result<(), TransportError>;

    fn send_oob(
        &self,
        relay_pk: &[u8; ENC_PUBLIC_KEY_SIZE],
        peer_enc_pk: &[u8; ENC_PUBLIC_KEY_SIZE],
        data: &[u8],
    ) -> Result<(), TransportError>;

    /// Tells the multiplex whether the peer currently needs the TCP path.
    fn set_channel_direct(&self, channel: ChannelId, direct: bool);

    fn kill_channel(&self, channel: ChannelId);

    /// Registers a relay with an existing channel so the multiplex can route
    /// through it.
    fn add_channel_relay(&self, channel: ChannelId, relay: &TcpRelayNode);

    /// Relays the local node is currently connected to, best first.
    fn connected_relays(&self, max: usize) -> Vec<TcpRelayNode>;

    /// The local node's own reachable UDP endpoint, if known.
    fn self_announce_addr(&self) -> Option<IpPort>;
}

/// DHT announce registration for public groups.
pub trait AnnounceDirectory: Send + Sync {
    fn announce(&self, chat_id: &[u8; 32]);
    fn retract(&self, chat_id: &[u8; 32]);
}

/// A peer found through the DHT announce subsystem.
#[derive(Debug, Clone)]
pub struct AnnouncedPeer {
    pub enc_public_key: [u8; ENC_PUBLIC_KEY_SIZE],
    pub relay: TcpRelayNode,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, port: u16) -> IpPort {
        IpPort::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, a)), port)
    }

    #[test]
    fn test_ip_port_roundtrip_v4() {
        let addr = v4(9, 33445);
        let mut w = Writer::new();
        addr.pack(&mut w);
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), 1 + 4 + 2);

        let mut r = Reader::new(&bytes);
        assert_eq!(IpPort::unpack(&mut r).unwrap(), addr);
        r.finish().unwrap();
    }

    #[test]
    fn test_ip_port_roundtrip_v6() {
        let addr = IpPort::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 443);
        let mut w = Writer::new();
        addr.pack(&mut w);
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), 1 + 16 + 2);

        let mut r = Reader::new(&bytes);
        assert_eq!(IpPort::unpack(&mut r).unwrap(), addr);
    }

    #[test]
    fn test_bad_family_rejected() {
        let bytes = [77u8, 0, 0, 0, 0, 0, 0];
        let mut r = Reader::new(&bytes);
        assert_eq!(
            IpPort::unpack(&mut r).unwrap_err(),
            WireError::InvalidDiscriminator(77)
        );
    }

    #[test]
    fn test_relay_node_list_roundtrip() {
        let nodes = vec![
            TcpRelayNode {
                addr: v4(1, 100),
                public_key: [0xAA; 32],
            },
            TcpRelayNode {
                addr: v4(2, 200),
                public_key: [0xBB; 32],
            },
        ];

        let mut w = Writer::new();
        TcpRelayNode::pack_list(&nodes, &mut w);
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        let unpacked = TcpRelayNode::unpack_list(&mut r, 8).unwrap();
        assert_eq!(unpacked, nodes);
    }

    #[test]
    fn test_relay_node_truncation_rejected() {
        let node = TcpRelayNode {
            addr: v4(1, 100),
            public_key: [0xAA; 32],
        };
        let mut w = Writer::new();
        node.pack(&mut w);
        let mut bytes = w.into_bytes();
        bytes.truncate(bytes.len() - 1);

        let mut r = Reader::new(&bytes);
        assert!(TcpRelayNode::unpack_list(&mut r, 8).is_err());
    }
}
