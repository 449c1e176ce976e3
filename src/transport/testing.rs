// In-memory transport doubles for tests.
//
// `NullTransport` swallows everything. `LoopbackHub` wires several sessions
// together in one process: UDP sends and channel sends both land in the
// recipient's inbox, tagged with how they travelled, and the test pumps
// inboxes until the mesh goes quiet.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{AnnounceDirectory, ChannelId, IpPort, TcpRelayNode, Transport, TransportError};
use crate::crypto::ENC_PUBLIC_KEY_SIZE;

/// Discards all traffic. For unit tests that never read the wire.
#[derive(Default)]
pub struct NullTransport {
    next_channel: AtomicU32,
}

/// Announce directory that remembers nothing.
#[derive(Default)]
pub struct NullAnnounce;

impl AnnounceDirectory for NullAnnounce {
    fn announce(&self, _chat_id: &[u8; 32]) {}
    fn retract(&self, _chat_id: &[u8; 32]) {}
}

impl Transport for NullTransport {
    fn send_udp(&self, _addr: IpPort, _data: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    fn new_channel(&self, _peer: &[u8; ENC_PUBLIC_KEY_SIZE]) -> Result<ChannelId, TransportError> {
        Ok(self.next_channel.fetch_add(1, Ordering::SeqCst))
    }

    fn send_channel(&self, _channel: ChannelId, _data: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    fn send_oob(
        &self,
        _relay: &[u8; ENC_PUBLIC_KEY_SIZE],
        _peer: &[u8; ENC_PUBLIC_KEY_SIZE],
        _data: &[u8],
    ) -> Result<(), TransportError> {
        Ok(())
    }

    fn set_channel_direct(&self, _channel: ChannelId, _direct: bool) {}

    fn kill_channel(&self, _channel: ChannelId) {}

    fn add_channel_relay(&self, _channel: ChannelId, _relay: &TcpRelayNode) {}

    fn connected_relays(&self, _max: usize) -> Vec<TcpRelayNode> {
        Vec::new()
    }

    fn self_announce_addr(&self) -> Option<IpPort> {
        None
    }
}

/// One delivered datagram: the raw frame plus how it travelled.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub data: Vec<u8>,
    /// True for the UDP path, false for a relayed channel or OOB packet.
    pub direct: bool,
    pub from_addr: Option<IpPort>,
}

#[derive(Default)]
struct HubState {
    /// node key → inbox
    inboxes: HashMap<[u8; ENC_PUBLIC_KEY_SIZE], Vec<Delivery>>,
    /// UDP address → node key
    addresses: HashMap<IpPort, [u8; ENC_PUBLIC_KEY_SIZE]>,
    /// channel id → (owner key, remote peer key)
    channels: HashMap<ChannelId, ([u8; ENC_PUBLIC_KEY_SIZE], [u8; ENC_PUBLIC_KEY_SIZE])>,
    /// per-group identity key → node key; sessions address peers by their
    /// group identity, the hub delivers to nodes
    aliases: HashMap<[u8; ENC_PUBLIC_KEY_SIZE], [u8; ENC_PUBLIC_KEY_SIZE]>,
    next_channel: ChannelId,
    announced: Vec<[u8; 32]>,
}

impl HubState {
    fn resolve(&self, key: &[u8; ENC_PUBLIC_KEY_SIZE]) -> [u8; ENC_PUBLIC_KEY_SIZE] {
        self.aliases.get(key).copied().unwrap_or(*key)
    }
}

/// The shared in-memory network.
#[derive(Default)]
pub struct LoopbackHub {
    state: Mutex<HubState>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a node and returns its transport endpoint.
    pub fn endpoint(
        self: &Arc<Self>,
        node_key: [u8; ENC_PUBLIC_KEY_SIZE],
        addr: IpPort,
    ) -> Arc<LoopbackEndpoint> {
        let mut state = self.state.lock();
        state.inboxes.entry(node_key).or_default();
        state.addresses.insert(addr, node_key);
        Arc::new(LoopbackEndpoint {
            hub: Arc::clone(self),
            node_key,
            addr,
        })
    }

    /// Routes a group identity key to a node, so channel and OOB sends find
    /// the right inbox.
    pub fn alias(&self, identity_key: [u8; ENC_PUBLIC_KEY_SIZE], node_key: [u8; ENC_PUBLIC_KEY_SIZE]) {
        self.state.lock().aliases.insert(identity_key, node_key);
    }

    /// Drains everything queued for a node.
    pub fn drain(&self, node_key: &[u8; ENC_PUBLIC_KEY_SIZE]) -> Vec<Delivery> {
        let mut state = self.state.lock();
        state
            .inboxes
            .get_mut(node_key)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    pub fn announced_count(&self) -> usize {
        self.state.lock().announced.len()
    }
}

/// A node's handle onto the hub; implements the runtime's transport seams.
pub struct LoopbackEndpoint {
    hub: Arc<LoopbackHub>,
    node_key: [u8; ENC_PUBLIC_KEY_SIZE],
    addr: IpPort,
}

impl LoopbackEndpoint {
    pub fn addr(&self) -> IpPort {
        self.addr
    }
}

impl Transport for LoopbackEndpoint {
    fn send_udp(&self, addr: IpPort, data: &[u8]) -> Result<(), TransportError> {
        let mut state = self.hub.state.lock();
        let target = *state
            .addresses
            .get(&addr)
            .ok_or_else(|| TransportError::SendFailed("unknown address".into()))?;
        let from_addr = Some(self.addr);
        state.inboxes.entry(target).or_default().push(Delivery {
            data: data.to_vec(),
            direct: true,
            from_addr,
        });
        Ok(())
    }

    fn new_channel(&self, peer: &[u8; ENC_PUBLIC_KEY_SIZE]) -> Result<ChannelId, TransportError> {
        let mut state = self.hub.state.lock();
        let id = state.next_channel;
        state.next_channel += 1;
        state.channels.insert(id, (self.node_key, *peer));
        Ok(id)
    }

    fn send_channel(&self, channel: ChannelId, data: &[u8]) -> Result<(), TransportError> {
        let mut state = self.hub.state.lock();
        let (_, peer) = *state
            .channels
            .get(&channel)
            .ok_or(TransportError::NoChannel)?;
        let target = state.resolve(&peer);
        state.inboxes.entry(target).or_default().push(Delivery {
            data: data.to_vec(),
            direct: false,
            from_addr: None,
        });
        Ok(())
    }

    fn send_oob(
        &self,
        _relay: &[u8; ENC_PUBLIC_KEY_SIZE],
        peer: &[u8; ENC_PUBLIC_KEY_SIZE],
        data: &[u8],
    ) -> Result<(), TransportError> {
        let mut state = self.hub.state.lock();
        let target = state.resolve(peer);
        state.inboxes.entry(target).or_default().push(Delivery {
            data: data.to_vec(),
            direct: false,
            from_addr: None,
        });
        Ok(())
    }

    fn set_channel_direct(&self, _channel: ChannelId, _direct: bool) {}

    fn kill_channel(&self, channel: ChannelId) {
        self.hub.state.lock().channels.remove(&channel);
    }

    fn add_channel_relay(&self, _channel: ChannelId, _relay: &TcpRelayNode) {}

    fn connected_relays(&self, max: usize) -> Vec<TcpRelayNode> {
        // The hub itself plays the part of one well-known relay
        let node = TcpRelayNode {
            addr: IpPort::new(std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)), 33445),
            public_key: [0xFE; ENC_PUBLIC_KEY_SIZE],
        };
        if max == 0 {
            Vec::new()
        } else {
            vec![node]
        }
    }

    fn self_announce_addr(&self) -> Option<IpPort> {
        Some(self.addr)
    }
}

impl AnnounceDirectory for LoopbackHub {
    fn announce(&self, chat_id: &[u8; 32]) {
        let mut state = self.state.lock();
        if !state.announced.contains(chat_id) {
            state.announced.push(*chat_id);
        }
    }

    fn retract(&self, chat_id: &[u8; 32]) {
        let mut state = self.state.lock();
        state.announced.retain(|id| id != chat_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(last: u8) -> IpPort {
        IpPort::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), 33445)
    }

    #[test]
    fn test_udp_delivery() {
        let hub = LoopbackHub::new();
        let a = hub.endpoint([1u8; 32], addr(1));
        let _b = hub.endpoint([2u8; 32], addr(2));

        a.send_udp(addr(2), b"hello").unwrap();
        let got = hub.drain(&[2u8; 32]);
        assert_eq!(got.len(), 1);
        assert!(got[0].direct);
        assert_eq!(got[0].data, b"hello");
        assert_eq!(got[0].from_addr, Some(addr(1)));
    }

    #[test]
    fn test_channel_delivery() {
        let hub = LoopbackHub::new();
        let a = hub.endpoint([1u8; 32], addr(1));
        let _b = hub.endpoint([2u8; 32], addr(2));

        let ch = a.new_channel(&[2u8; 32]).unwrap();
        a.send_channel(ch, b"relayed").unwrap();
        let got = hub.drain(&[2u8; 32]);
        assert_eq!(got.len(), 1);
        assert!(!got[0].direct);

        a.kill_channel(ch);
        assert!(a.send_channel(ch, b"x").is_err());
    }

    #[test]
    fn test_announce_roundtrip() {
        let hub = LoopbackHub::new();
        hub.announce(&[9u8; 32]);
        hub.announce(&[9u8; 32]);
        assert_eq!(hub.announced_count(), 1);
        hub.retract(&[9u8; 32]);
        assert_eq!(hub.announced_count(), 0);
    }
}
