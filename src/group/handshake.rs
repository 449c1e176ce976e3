// Two-way handshake: establishes the session shared key, exchanges
// signature keys, conveys intent (invite vs. peer-info exchange), and seeds
// the relay hint. Handshake frames are boxed under the static identity keys;
// everything after them runs on session keys.

use tracing::debug;

use crate::crypto::{
    compare_enc_keys, jenkins_hash, precompute_handshake_key, precompute_session_key,
    ENC_PUBLIC_KEY_SIZE, SIG_PUBLIC_KEY_SIZE,
};
use crate::packet::codec::{open_handshake_packet, wrap_handshake_packet, FrameHeader};
use crate::time::unix_time;
use crate::transport::{IpPort, TcpRelayNode};
use crate::wire::{Reader, WireError, Writer};
use crate::Error;

use super::connection::{ConnState, HandshakeRequestKind, PendingHandshake};
use super::{Group, GroupConnectionState, HandleError, JoinKind, PeerAddOutcome};

/// Seconds between scheduling a handshake and the driver sending it.
pub const HANDSHAKE_SEND_DELAY: u64 = 3;
/// A pending handshake that keeps failing is abandoned after this long.
pub const PENDING_HANDSHAKE_MAX_INTERVAL: u64 = 10;
/// Handshake requests accepted per meter window before new connections are
/// blocked; the meter drains one per second.
pub const NEW_CONNECTION_LIMIT: u32 = 10;

/// Request vs. response discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeType {
    Request = 0,
    Response = 1,
}

impl HandshakeType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(HandshakeType::Request),
            1 => Some(HandshakeType::Response),
            _ => None,
        }
    }
}

/// The boxed interior of a handshake frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePayload {
    pub hs_type: HandshakeType,
    pub sender_hash: u32,
    pub session_pk: [u8; ENC_PUBLIC_KEY_SIZE],
    pub sig_pk: [u8; SIG_PUBLIC_KEY_SIZE],
    pub request_kind: HandshakeRequestKind,
    pub join_kind: JoinKind,
    /// Sender's last-sent shared-state version; `u32::MAX` means none yet.
    pub state_version: u32,
    pub relay: Option<TcpRelayNode>,
}

impl HandshakePayload {
    pub fn pack(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(75 + 51);
        w.put_u8(self.hs_type as u8);
        w.put_u32(self.sender_hash);
        w.put_bytes(&self.session_pk);
        w.put_bytes(&self.sig_pk);
        w.put_u8(self.request_kind as u8);
        w.put_u8(self.join_kind as u8);
        w.put_u32(self.state_version);
        if let Some(relay) = &self.relay {
            relay.pack(&mut w);
        }
        w.into_bytes()
    }

    pub fn unpack(data: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(data);
        let hs_type = HandshakeType::from_u8(r.take_u8()?)
            .ok_or(WireError::FieldOutOfBounds("handshake type"))?;
        let sender_hash = r.take_u32()?;
        let session_pk: [u8; ENC_PUBLIC_KEY_SIZE] = r.take_array()?;
        let sig_pk: [u8; SIG_PUBLIC_KEY_SIZE] = r.take_array()?;
        let request_kind = HandshakeRequestKind::from_u8(r.take_u8()?)
            .ok_or(WireError::FieldOutOfBounds("request kind"))?;
        let join_kind =
            JoinKind::from_u8(r.take_u8()?).ok_or(WireError::FieldOutOfBounds("join kind"))?;
        let state_version = r.take_u32()?;
        let relay = if r.remaining() > 0 {
            Some(TcpRelayNode::unpack(&mut r)?)
        } else {
            None
        };
        Ok(Self {
            hs_type,
            sender_hash,
            session_pk,
            sig_pk,
            request_kind,
            join_kind,
            state_version,
            relay,
        })
    }
}

impl Group {
    /// Schedules a handshake for the periodic driver.
    pub(crate) fn schedule_handshake(
        &mut self,
        index: usize,
        kind: HandshakeRequestKind,
        is_response: bool,
        via_oob: bool,
        now: u64,
    ) {
        self.peers[index].conn.pending_handshake = Some(PendingHandshake {
            send_at: now + HANDSHAKE_SEND_DELAY,
            kind,
            is_response,
            via_oob,
        });
    }

    /// Builds a complete handshake frame for `index`, recording the
    /// shared-state version it advertises.
    fn make_handshake_frame(
        &mut self,
        index: usize,
        hs_type: HandshakeType,
        request_kind: HandshakeRequestKind,
        join_kind: JoinKind,
    ) -> Result<Vec<u8>, Error> {
        let connected = self.connection_state == GroupConnectionState::Connected;
        let current_version = self.shared_state.version;

        let conn = &mut self.peers[index].conn;
        let state_version = if conn.self_sent_state_version != u32::MAX {
            conn.self_sent_state_version
        } else if connected {
            current_version
        } else {
            0
        };
        conn.self_sent_state_version = state_version;

        let payload = HandshakePayload {
            hs_type,
            sender_hash: self.self_pk_hash,
            session_pk: *self.peers[index].conn.session.public(),
            sig_pk: *self.self_keys.public().sig(),
            request_kind,
            join_kind,
            state_version,
            relay: self.peers[index].conn.last_relay(),
        };

        let key = precompute_handshake_key(
            self.self_keys.enc_secret(),
            self.peers[index].conn.public_key.enc(),
        );
        wrap_handshake_packet(
            self.chat_id_hash,
            self.self_keys.public().enc(),
            &key,
            &payload.pack(),
        )
        .map_err(|_| Error::SendFailed)
    }

    /// Sends a handshake over every path we have to the peer.
    fn send_handshake(
        &mut self,
        index: usize,
        hs_type: HandshakeType,
        request_kind: HandshakeRequestKind,
        join_kind: JoinKind,
    ) -> Result<(), Error> {
        let frame = self.make_handshake_frame(index, hs_type, request_kind, join_kind)?;

        let conn = &self.peers[index].conn;
        let mut sent = false;
        if let Some(addr) = conn.address {
            sent |= self.transport.send_udp(addr, &frame).is_ok();
        }
        if let Some(channel) = conn.tcp_channel {
            sent |= self.transport.send_channel(channel, &frame).is_ok();
        }

        if sent {
            Ok(())
        } else {
            Err(Error::SendFailed)
        }
    }

    /// First contact with a peer known only through a relay hint: the
    /// handshake goes out-of-band through that relay.
    fn send_oob_handshake(
        &mut self,
        index: usize,
        request_kind: HandshakeRequestKind,
        join_kind: JoinKind,
    ) -> Result<(), Error> {
        let frame =
            self.make_handshake_frame(index, HandshakeType::Request, request_kind, join_kind)?;
        let conn = &self.peers[index].conn;
        let relay_pk = conn.oob_relay_pk.ok_or(Error::SendFailed)?;
        let peer_pk = *conn.public_key.enc();
        self.transport
            .send_oob(&relay_pk, &peer_pk, &frame)
            .map_err(|_| Error::SendFailed)
    }

    /// Driver hook: fires a due pending handshake for `index`.
    pub(crate) fn dispatch_pending_handshake(&mut self, index: usize, now: u64) {
        let Some(pending) = self.peers[index].conn.pending_handshake else {
            return;
        };
        if now < pending.send_at {
            return;
        }
        if self.peers[index].conn.is_handshaked() {
            self.peers[index].conn.pending_handshake = None;
            return;
        }

        let join_kind = self.join_kind;
        let result = if pending.is_response {
            self.send_handshake(index, HandshakeType::Response, pending.kind, join_kind)
        } else if pending.via_oob {
            self.send_oob_handshake(index, pending.kind, join_kind)
        } else {
            self.send_handshake(index, HandshakeType::Request, pending.kind, join_kind)
        };

        let conn = &mut self.peers[index].conn;
        match result {
            Ok(()) => {
                conn.pending_handshake = None;
                conn.last_handshake_kind = pending.kind;
                if pending.is_response {
                    conn.state = conn.state.max(ConnState::HandshakeSent);
                } else {
                    conn.state = ConnState::HandshakeSent;
                }
                // The handshake occupies one outbound message id
                let _ = conn.next_message_id();
            }
            Err(_) => {
                debug!(group = self.group_number, index, "handshake send failed");
                if now > pending.send_at + PENDING_HANDSHAKE_MAX_INTERVAL {
                    conn.pending_handshake = None;
                }
            }
        }
    }

    /// Entry point for inbound handshake frames.
    pub(crate) fn handle_handshake(
        &mut self,
        header: &FrameHeader,
        ciphertext: &[u8],
        direct: bool,
        from: Option<IpPort>,
    ) -> Result<(), HandleError> {
        let key = precompute_handshake_key(self.self_keys.enc_secret(), &header.sender_enc_pk);
        let plain = open_handshake_packet(header, ciphertext, &key)?;
        let payload = HandshakePayload::unpack(&plain)?;

        // The claimed hash must match the claimed key
        if payload.sender_hash != jenkins_hash(&header.sender_enc_pk) {
            return Err(HandleError::Auth);
        }

        match payload.hs_type {
            HandshakeType::Request => {
                self.handle_handshake_request(&header.sender_enc_pk, &payload, from, direct)
            }
            HandshakeType::Response => {
                self.handle_handshake_response(&header.sender_enc_pk, &payload, from, direct)
            }
        }
    }

    fn handle_handshake_request(
        &mut self,
        sender_pk: &[u8; ENC_PUBLIC_KEY_SIZE],
        payload: &HandshakePayload,
        from: Option<IpPort>,
        direct: bool,
    ) -> Result<(), HandleError> {
        // Sanctions apply before anything is allocated; moderators are exempt
        // so a stale IP ban can never lock out the moderation team.
        if self.shared_state.version > 0
            && !self
                .moderation
                .verify_sig_pk(self.shared_state.founder_public_key.sig(), &payload.sig_pk)
        {
            let ip_hit = from.map(|a| self.moderation.ip_banned(&a)).unwrap_or(false);
            if ip_hit || self.moderation.key_banned(sender_pk) {
                debug!(group = self.group_number, "handshake from banned peer dropped");
                return Err(HandleError::Policy);
            }
        }

        if self.block_handshakes || self.connection_meter >= NEW_CONNECTION_LIMIT {
            self.block_handshakes = true;
            return Err(HandleError::Policy);
        }
        self.connection_meter += 1;

        let now = unix_time();

        let index = match self.peer_index_by_enc_pk(sender_pk) {
            None => {
                // Unknown peers are admitted to public chats, or to private
                // ones when they reconnect from the confirmed ring
                if !self.is_public() && !self.recently_confirmed_contains(sender_pk) {
                    return Err(HandleError::Policy);
                }
                match self.peer_add(sender_pk, from).map_err(|_| HandleError::Policy)? {
                    PeerAddOutcome::Added(i) | PeerAddOutcome::AlreadyPresent(i) => i,
                }
            }
            Some(i) => {
                if self.peers[i].conn.is_handshaked() {
                    // A fresh request over a live connection is a reconnect
                    self.peer_delete(i, b"");
                    match self
                        .peer_add(sender_pk, from)
                        .map_err(|_| HandleError::Policy)?
                    {
                        PeerAddOutcome::Added(i) | PeerAddOutcome::AlreadyPresent(i) => i,
                    }
                } else {
                    i
                }
            }
        };

        if let Some(relay) = payload.relay {
            if let Some(channel) = self.peers[index].conn.tcp_channel {
                self.transport.add_channel_relay(channel, &relay);
            }
            self.peers[index].conn.save_relay(relay);
        }

        if payload.join_kind == JoinKind::Public && !self.is_public() {
            self.peer_delete(index, b"joined private chat as public");
            return Err(HandleError::Policy);
        }

        let conn = &mut self.peers[index].conn;
        conn.shared_key = Some(precompute_session_key(
            conn.session.secret(),
            &payload.session_pk,
        ));
        conn.public_key.set_sig(payload.sig_pk);
        conn.peer_state_version = payload.state_version;
        conn.last_handshake_kind = payload.request_kind;
        conn.note_handshake_request();
        if from.is_some() {
            conn.address = from;
        }
        if direct {
            conn.last_direct_recv = now;
        }
        conn.last_ping_recv = now + HANDSHAKE_SEND_DELAY;
        conn.pending_handshake = Some(PendingHandshake {
            send_at: now + HANDSHAKE_SEND_DELAY,
            kind: payload.request_kind,
            is_response: true,
            via_oob: false,
        });

        debug!(group = self.group_number, index, "handshake request accepted");
        Ok(())
    }

    fn handle_handshake_response(
        &mut self,
        sender_pk: &[u8; ENC_PUBLIC_KEY_SIZE],
        payload: &HandshakePayload,
        from: Option<IpPort>,
        direct: bool,
    ) -> Result<(), HandleError> {
        let index = self
            .peer_index_by_enc_pk(sender_pk)
            .ok_or(HandleError::Malformed)?;

        let now = unix_time();
        {
            let conn = &mut self.peers[index].conn;
            conn.shared_key = Some(precompute_session_key(
                conn.session.secret(),
                &payload.session_pk,
            ));
            conn.public_key.set_sig(payload.sig_pk);
            conn.peer_state_version = payload.state_version;
            conn.note_handshake_response();
            conn.state = conn.state.max(ConnState::Handshaked);
            conn.pending_handshake = None;
            conn.last_ping_recv = now;
            if from.is_some() {
                conn.address = from;
            }
            if direct {
                conn.last_direct_recv = now;
            }
        }

        self.send_lossless_to(index, crate::packet::GroupPacketType::HsResponseAck, &[])
            .map_err(|_| HandleError::Send)?;

        match payload.request_kind {
            HandshakeRequestKind::InviteRequest => {
                if self.should_send_invite_request(index) {
                    self.send_invite_request(index).map_err(|_| HandleError::Send)?;
                }
            }
            HandshakeRequestKind::PeerInfoExchange => {
                self.send_peer_exchange(index).map_err(|_| HandleError::Send)?;
            }
        }

        Ok(())
    }

    /// The other half of the handshake acked our response; the link is up.
    pub(crate) fn handle_hs_response_ack(&mut self, index: usize) -> Result<(), HandleError> {
        {
            let conn = &mut self.peers[index].conn;
            conn.state = conn.state.max(ConnState::Handshaked);
            conn.pending_handshake = None;
        }

        if self.peers[index].conn.last_handshake_kind == HandshakeRequestKind::InviteRequest
            && self.should_send_invite_request(index)
        {
            self.send_invite_request(index).map_err(|_| HandleError::Send)?;
        }
        Ok(())
    }

    /// Divergence tiebreak: after a handshake, exactly one side sends the
    /// invite request. The side holding the older shared state asks to be
    /// brought up to date; on equal versions the higher encryption key asks.
    fn should_send_invite_request(&self, index: usize) -> bool {
        let conn = &self.peers[index].conn;
        let self_version = if conn.self_sent_state_version == u32::MAX {
            0
        } else {
            conn.self_sent_state_version
        };
        let peer_version = if conn.peer_state_version == u32::MAX {
            0
        } else {
            conn.peer_state_version
        };

        if peer_version != self_version {
            return peer_version > self_version;
        }
        compare_enc_keys(self.self_keys.public().enc(), conn.public_key.enc())
            == std::cmp::Ordering::Greater
    }

    /// Meter decay, driven once per tick. Unblocks handshakes when drained.
    pub(crate) fn connection_cooldown(&mut self, now: u64) {
        if self.connection_meter == 0 {
            return;
        }
        if self.cooldown_timer < now {
            self.cooldown_timer = now;
            self.connection_meter -= 1;
            if self.connection_meter == 0 {
                self.block_handshakes = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn sample_payload(relay: bool) -> HandshakePayload {
        HandshakePayload {
            hs_type: HandshakeType::Request,
            sender_hash: 0xCAFEBABE,
            session_pk: [1u8; 32],
            sig_pk: [2u8; 32],
            request_kind: HandshakeRequestKind::InviteRequest,
            join_kind: JoinKind::Public,
            state_version: 3,
            relay: relay.then_some(TcpRelayNode {
                addr: IpPort::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 33445),
                public_key: [9u8; 32],
            }),
        }
    }

    #[test]
    fn test_payload_roundtrip_with_relay() {
        let payload = sample_payload(true);
        let unpacked = HandshakePayload::unpack(&payload.pack()).unwrap();
        assert_eq!(unpacked, payload);
    }

    #[test]
    fn test_payload_roundtrip_without_relay() {
        let payload = sample_payload(false);
        let unpacked = HandshakePayload::unpack(&payload.pack()).unwrap();
        assert_eq!(unpacked, payload);
    }

    #[test]
    fn test_payload_truncation_rejected() {
        let bytes = sample_payload(false).pack();
        for cut in [0usize, 5, 40, bytes.len() - 1] {
            assert!(HandshakePayload::unpack(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn test_payload_bad_discriminators_rejected() {
        let mut bytes = sample_payload(false).pack();
        bytes[0] = 9; // handshake type
        assert!(HandshakePayload::unpack(&bytes).is_err());

        let mut bytes = sample_payload(false).pack();
        bytes[69] = 9; // request kind
        assert!(HandshakePayload::unpack(&bytes).is_err());
    }

    #[test]
    fn test_state_version_sentinel_reads_back() {
        let mut payload = sample_payload(false);
        payload.state_version = u32::MAX;
        let unpacked = HandshakePayload::unpack(&payload.pack()).unwrap();
        assert_eq!(unpacked.state_version, u32::MAX);
    }
}
