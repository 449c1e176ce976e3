// The periodic tick: channel upkeep, pending handshakes, retransmission,
// timeouts, pings, cooldown decay, and reconnection. One pass per group per
// tick, bounded work per peer.

use tracing::debug;

use crate::packet::GroupPacketType;
use crate::time::is_timeout_at;
use crate::transport::{AnnouncedPeer, TcpRelayNode};
use crate::wire::{Reader, Writer};
use crate::Error;

use super::connection::HandshakeRequestKind;
use super::{Group, GroupConnectionState, HandleError};

/// Seconds between sync probes to confirmed peers.
pub const PING_INTERVAL: u64 = 12;
/// Seconds between re-sharing our connected TCP relays with a peer.
pub const RELAYS_SHARE_INTERVAL: u64 = 300;
/// Seconds between re-sharing our own UDP endpoint with a peer.
pub const ADDR_SHARE_INTERVAL: u64 = 300;
/// Seconds between rejoin attempts while disconnected.
pub const JOIN_ATTEMPT_INTERVAL: u64 = 20;
/// Relays shared per TcpRelays packet.
pub const MAX_SHARED_RELAYS: usize = 3;
/// Ping body: confirmed count, state version, creds version, topic version.
const PING_BODY_SIZE: usize = 4 * 4;

impl Group {
    /// One tick of periodic work. Returns true when the group asked to be
    /// torn down.
    pub(crate) fn do_tick(&mut self, now: u64) -> bool {
        self.tick_channels(now);

        match self.connection_state {
            GroupConnectionState::Connected => {
                self.ping_peers(now);
                self.tick_peer_connections(now);
                self.connection_cooldown(now);
            }
            GroupConnectionState::Connecting => {
                if is_timeout_at(now, self.last_join_attempt, JOIN_ATTEMPT_INTERVAL) {
                    self.connection_state = GroupConnectionState::Disconnected;
                }
            }
            GroupConnectionState::Disconnected => {
                if self.peers.len() > 1
                    && is_timeout_at(now, self.last_join_attempt, JOIN_ATTEMPT_INTERVAL)
                {
                    debug!(group = self.group_number, "rejoin attempt");
                    self.last_join_attempt = now;
                    self.connection_state = GroupConnectionState::Connecting;
                    for index in 1..self.peers.len() {
                        let conn = &self.peers[index].conn;
                        if !conn.is_handshaked() && conn.pending_handshake.is_none() {
                            self.schedule_handshake(
                                index,
                                HandshakeRequestKind::InviteRequest,
                                false,
                                self.peers[index].conn.oob_relay_pk.is_some(),
                                now,
                            );
                        }
                    }
                }
            }
            GroupConnectionState::Closing => return true,
            GroupConnectionState::Failed => {}
        }

        false
    }

    /// Keeps the relay multiplex informed of path selection and fires due
    /// pending handshakes.
    fn tick_channels(&mut self, now: u64) {
        for index in 1..self.peers.len() {
            let conn = &self.peers[index].conn;
            if let Some(channel) = conn.tcp_channel {
                self.transport.set_channel_direct(channel, conn.is_direct(now));
            }
            self.dispatch_pending_handshake(index, now);
        }
    }

    /// Lossy sync probe carrying our version counters.
    fn ping_peers(&mut self, now: u64) {
        if !is_timeout_at(now, self.last_ping_sent, PING_INTERVAL) {
            return;
        }

        let mut w = Writer::with_capacity(PING_BODY_SIZE);
        w.put_u32(self.confirmed_count());
        w.put_u32(self.shared_state.version);
        w.put_u32(self.moderation.creds.version);
        w.put_u32(self.topic.version);
        let body = w.into_bytes();

        self.send_lossy_all(GroupPacketType::Ping, &body);
        self.last_ping_sent = now;
    }

    /// Per-peer periodic work. Deleting swap-removes, so the index only
    /// advances when the peer survived the pass.
    fn tick_peer_connections(&mut self, now: u64) {
        let mut index = 1;
        while index < self.peers.len() {
            if self.peers[index].conn.is_confirmed() {
                if is_timeout_at(now, self.peers[index].conn.last_relays_shared, RELAYS_SHARE_INTERVAL) {
                    let _ = self.share_tcp_relays(index, now);
                }
                if is_timeout_at(now, self.peers[index].conn.last_addr_shared, ADDR_SHARE_INTERVAL) {
                    let _ = self.share_ip_port(index, now);
                }
            }

            if self.peers[index].conn.timed_out(now) {
                self.peer_delete(index, b"Timed out");
                continue;
            }

            let batch = self.peers[index].conn.resend_stale(now);
            if batch.timed_out {
                self.peer_delete(index, b"Timed out");
                continue;
            }
            for frame in batch.frames {
                let _ = self.send_frame_to(index, &frame, now);
            }

            index += 1;
        }
    }

    /// Two-step state sync: the first ping that shows the peer ahead arms a
    /// flag, the second one sends the sync request. Transient races never
    /// reach the network.
    pub(crate) fn handle_ping(&mut self, index: usize, body: &[u8]) -> Result<(), HandleError> {
        if body.len() != PING_BODY_SIZE {
            return Err(HandleError::Malformed);
        }
        if !self.peers[index].conn.is_confirmed() {
            return Err(HandleError::Policy);
        }

        let mut r = Reader::new(body);
        let peer_confirmed = r.take_u32()?;
        let state_version = r.take_u32()?;
        let creds_version = r.take_u32()?;
        let topic_version = r.take_u32()?;

        let ahead = peer_confirmed > self.confirmed_count()
            || state_version > self.shared_state.version
            || creds_version > self.moderation.creds.version
            || topic_version > self.topic.version;

        if ahead {
            if self.peers[index].conn.pending_state_sync {
                self.peers[index].conn.pending_state_sync = false;
                let _ = self.send_sync_request(index);
            } else {
                self.peers[index].conn.pending_state_sync = true;
            }
        } else {
            self.peers[index].conn.pending_state_sync = false;
        }

        self.peers[index].conn.last_ping_recv = crate::time::unix_time();
        Ok(())
    }

    // ---- periodic shares ----

    fn share_tcp_relays(&mut self, index: usize, now: u64) -> Result<(), Error> {
        let relays = self.transport.connected_relays(MAX_SHARED_RELAYS);
        if relays.is_empty() {
            self.peers[index].conn.last_relays_shared = now;
            return Ok(());
        }

        if let Some(channel) = self.peers[index].conn.tcp_channel {
            for relay in &relays {
                self.transport.add_channel_relay(channel, relay);
            }
        }

        let mut w = Writer::new();
        TcpRelayNode::pack_list(&relays, &mut w);
        self.send_lossy_to(index, GroupPacketType::TcpRelays, &w.into_bytes())?;
        self.peers[index].conn.last_relays_shared = now;
        Ok(())
    }

    pub(crate) fn handle_tcp_relays(&mut self, index: usize, body: &[u8]) -> Result<(), HandleError> {
        if body.is_empty() {
            return Err(HandleError::Malformed);
        }
        if !self.peers[index].conn.is_confirmed() {
            return Err(HandleError::Policy);
        }

        let mut r = Reader::new(body);
        let relays = TcpRelayNode::unpack_list(&mut r, MAX_SHARED_RELAYS)?;
        if relays.is_empty() {
            return Err(HandleError::Malformed);
        }

        for relay in relays {
            if let Some(channel) = self.peers[index].conn.tcp_channel {
                self.transport.add_channel_relay(channel, &relay);
            }
            self.peers[index].conn.save_relay(relay);
        }
        Ok(())
    }

    fn share_ip_port(&mut self, index: usize, now: u64) -> Result<(), Error> {
        let Some(addr) = self.transport.self_announce_addr() else {
            self.peers[index].conn.last_addr_shared = now;
            return Ok(());
        };

        let mut w = Writer::new();
        addr.pack(&mut w);
        self.send_lossy_to(index, GroupPacketType::IpPort, &w.into_bytes())?;
        self.peers[index].conn.last_addr_shared = now;
        Ok(())
    }

    pub(crate) fn handle_ip_port(&mut self, index: usize, body: &[u8]) -> Result<(), HandleError> {
        if self.connection_state != GroupConnectionState::Connected {
            return Err(HandleError::Policy);
        }
        if !self.peers[index].conn.is_confirmed() {
            return Err(HandleError::Policy);
        }

        let mut r = Reader::new(body);
        let addr = crate::transport::IpPort::unpack(&mut r)?;
        r.finish()?;

        self.peers[index].conn.address = Some(addr);
        Ok(())
    }

    /// Installs peers discovered through the DHT announce subsystem, each
    /// with a pending out-of-band invite handshake. Returns how many were
    /// added.
    pub fn add_announced_peers(&mut self, announced: &[AnnouncedPeer], now: u64) -> usize {
        let mut added = 0;
        for peer in announced {
            let index = match self.peer_add(&peer.enc_public_key, None) {
                Ok(super::PeerAddOutcome::Added(i)) => i,
                _ => continue,
            };

            if let Some(channel) = self.peers[index].conn.tcp_channel {
                self.transport.add_channel_relay(channel, &peer.relay);
            }
            let conn = &mut self.peers[index].conn;
            conn.save_relay(peer.relay);
            conn.oob_relay_pk = Some(peer.relay.public_key);
            conn.last_ping_recv = now + super::handshake::HANDSHAKE_SEND_DELAY;

            self.schedule_handshake(index, HandshakeRequestKind::InviteRequest, false, true, now);
            added += 1;
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ExtendedKeyPair;
    use crate::events::Events;
    use crate::group::connection::ConnState;
    use crate::group::{JoinKind, PeerStatus, Role};
    use crate::time::unix_time;
    use crate::transport::testing::{NullAnnounce, NullTransport};
    use std::sync::Arc;

    fn test_group() -> Group {
        let chat_keys = ExtendedKeyPair::generate();
        let mut group = Group::new(
            0,
            Arc::new(NullTransport::default()),
            Arc::new(NullAnnounce),
            Events::new(),
            ExtendedKeyPair::generate(),
            *chat_keys.public(),
            Some(chat_keys),
            b"alice".to_vec(),
            PeerStatus::Online,
            Role::Founder,
            JoinKind::Private,
        )
        .unwrap();
        group.connection_state = GroupConnectionState::Connected;
        group
    }

    fn confirm_peer(group: &mut Group, pk: [u8; 32]) -> usize {
        group.peer_add(&pk, None).unwrap();
        let index = group.peer_index_by_enc_pk(&pk).unwrap();
        group.peers[index].conn.state = ConnState::Confirmed;
        index
    }

    #[test]
    fn test_ping_state_sync_two_step() {
        let mut group = test_group();
        let index = confirm_peer(&mut group, [3u8; 32]);

        // Ahead peer: first ping arms, second fires
        let mut w = Writer::new();
        w.put_u32(0);
        w.put_u32(group.shared_state.version + 5);
        w.put_u32(0);
        w.put_u32(0);
        let body = w.into_bytes();

        group.handle_ping(index, &body).unwrap();
        assert!(group.peers[index].conn.pending_state_sync);

        group.handle_ping(index, &body).unwrap();
        assert!(!group.peers[index].conn.pending_state_sync);

        // A peer that is not ahead clears the flag
        let mut w = Writer::new();
        w.put_u32(0);
        w.put_u32(0);
        w.put_u32(0);
        w.put_u32(0);
        group.handle_ping(index, &w.into_bytes()).unwrap();
        assert!(!group.peers[index].conn.pending_state_sync);
    }

    #[test]
    fn test_ping_wrong_size_rejected() {
        let mut group = test_group();
        let index = confirm_peer(&mut group, [3u8; 32]);
        assert_eq!(
            group.handle_ping(index, &[0u8; 15]),
            Err(HandleError::Malformed)
        );
    }

    #[test]
    fn test_unconfirmed_ping_rejected() {
        let mut group = test_group();
        group.peer_add(&[4u8; 32], None).unwrap();
        assert_eq!(
            group.handle_ping(1, &[0u8; PING_BODY_SIZE]),
            Err(HandleError::Policy)
        );
    }

    #[test]
    fn test_timeout_removes_peer() {
        let mut group = test_group();
        let index = confirm_peer(&mut group, [5u8; 32]);
        let now = unix_time();
        group.peers[index].conn.last_ping_recv =
            now - crate::group::connection::CONFIRMED_PEER_TIMEOUT;

        group.do_tick(now);
        assert!(group.peer_index_by_enc_pk(&[5u8; 32]).is_none());
    }

    #[test]
    fn test_disconnected_reschedules_handshakes() {
        let mut group = test_group();
        group.connection_state = GroupConnectionState::Disconnected;
        group.peer_add(&[6u8; 32], None).unwrap();
        // Fresh peers are unconfirmed; the timeout sweep must not run in
        // Disconnected, but the rejoin scheduler must
        let now = unix_time() + JOIN_ATTEMPT_INTERVAL + 1;
        group.last_join_attempt = unix_time();

        group.do_tick(now);
        assert_eq!(group.connection_state, GroupConnectionState::Connecting);
        assert!(group.peers[1].conn.pending_handshake.is_some());
    }

    #[test]
    fn test_closing_requests_teardown() {
        let mut group = test_group();
        group.connection_state = GroupConnectionState::Closing;
        assert!(group.do_tick(unix_time()));
    }

    #[test]
    fn test_add_announced_peers() {
        use crate::transport::IpPort;
        use std::net::{IpAddr, Ipv4Addr};

        let mut group = test_group();
        let announced = vec![AnnouncedPeer {
            enc_public_key: [9u8; 32],
            relay: TcpRelayNode {
                addr: IpPort::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1)), 443),
                public_key: [8u8; 32],
            },
        }];

        let added = group.add_announced_peers(&announced, unix_time());
        assert_eq!(added, 1);
        let index = group.peer_index_by_enc_pk(&[9u8; 32]).unwrap();
        assert!(group.peers[index].conn.pending_handshake.unwrap().via_oob);
        assert_eq!(group.peers[index].conn.oob_relay_pk, Some([8u8; 32]));

        // Duplicates are not re-added
        assert_eq!(group.add_announced_peers(&announced, unix_time()), 0);
    }
}
