// Per-peer connection state: session keys, the handshake state machine, and
// the lossless send/receive rings.
//
// Message ids are per-direction and strictly increasing from 1. The sender
// ring holds wrapped frames until a cumulative read-ack clears them; the
// receiver ring buffers out-of-order ids until the gap fills. Ring slots are
// keyed by message_id % ring size, so an id further ahead than the ring can
// hold is dropped rather than buffered.

use tracing::debug;

use crate::crypto::{
    jenkins_hash, ExtendedPublicKey, SessionKeys, SharedKey, ENC_PUBLIC_KEY_SIZE,
};
use crate::transport::{ChannelId, IpPort, TcpRelayNode};

/// Slots per reliability ring, each direction.
pub const RING_SIZE: u64 = 8192;
/// Seconds between retransmissions of an unacked frame.
pub const RESEND_INTERVAL: u64 = 1;
/// Confirmed peers must be heard from within this many seconds.
pub const CONFIRMED_PEER_TIMEOUT: u64 = 180;
/// Unconfirmed peers get a much shorter leash.
pub const UNCONFIRMED_PEER_TIMEOUT: u64 = 20;
/// A direct UDP path is trusted for this long after the last direct receive.
pub const DIRECT_PATH_TIMEOUT: u64 = 8;
/// Recently used TCP relays remembered per connection.
pub const MAX_SAVED_RELAYS: usize = 6;

/// Connection lifecycle. Ordering matters: everything from `Handshaked`
/// upward owns a session shared key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnState {
    Fresh,
    HandshakeSent,
    Handshaked,
    PeerInfoSent,
    Confirmed,
}

/// What a peer asked for in its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeRequestKind {
    InviteRequest = 0,
    PeerInfoExchange = 1,
}

impl HandshakeRequestKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(HandshakeRequestKind::InviteRequest),
            1 => Some(HandshakeRequestKind::PeerInfoExchange),
            _ => None,
        }
    }
}

/// A handshake scheduled for the periodic driver to send.
#[derive(Debug, Clone, Copy)]
pub struct PendingHandshake {
    /// Earliest time the driver may send it.
    pub send_at: u64,
    pub kind: HandshakeRequestKind,
    /// True when we owe the peer a handshake *response*.
    pub is_response: bool,
    /// True when the packet must travel out-of-band via a relay.
    pub via_oob: bool,
}

#[derive(Debug, Clone)]
struct SendEntry {
    message_id: u64,
    frame: Vec<u8>,
    time_added: u64,
    last_send_try: u64,
}

#[derive(Debug, Clone)]
struct RecvEntry {
    message_id: u64,
    packet_type: u8,
    payload: Vec<u8>,
}

/// Outcome of admitting an inbound lossless message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// Exactly the next expected id; deliver now.
    InOrder,
    /// A future id was buffered; request the missing one.
    Buffered,
    /// Already delivered or already buffered; ack but do not re-deliver.
    Duplicate,
    /// Beyond ring capacity; dropped.
    Discarded,
}

/// Frames the driver should push out again, plus whether the peer is dead.
#[derive(Debug, Default)]
pub struct ResendBatch {
    pub frames: Vec<Vec<u8>>,
    pub timed_out: bool,
}

/// Everything the group tracks about its link to one peer.
pub struct PeerConnection {
    /// Extended public key; the signature half is zero until the handshake
    /// delivers it.
    pub public_key: ExtendedPublicKey,
    pub public_key_hash: u32,
    pub session: SessionKeys,
    pub shared_key: Option<SharedKey>,
    pub state: ConnState,

    pub tcp_channel: Option<ChannelId>,
    pub address: Option<IpPort>,
    pub oob_relay_pk: Option<[u8; ENC_PUBLIC_KEY_SIZE]>,
    recent_relays: Vec<TcpRelayNode>,
    relay_index: usize,

    pub pending_handshake: Option<PendingHandshake>,
    /// Request kind of the most recent handshake on this connection, used by
    /// the post-ack tiebreak.
    pub last_handshake_kind: HandshakeRequestKind,
    /// Handshakes travel both paths; each direction is counted against the
    /// message stream exactly once.
    handshake_request_counted: bool,
    handshake_response_counted: bool,
    pub pending_sync_request: bool,
    pub pending_state_sync: bool,

    /// Shared-state version last written into an outgoing handshake.
    /// `u32::MAX` means none sent yet.
    pub self_sent_state_version: u32,
    /// Shared-state version the peer last advertised. Same sentinel.
    pub peer_state_version: u32,

    pub time_added: u64,
    pub last_ping_recv: u64,
    pub last_direct_recv: u64,
    pub last_relays_shared: u64,
    pub last_addr_shared: u64,

    send_message_id: u64,
    send_ring_start: u64,
    send_ring: Vec<Option<SendEntry>>,
    recv_message_id: u64,
    recv_ring: Vec<Option<RecvEntry>>,
}

impl PeerConnection {
    pub fn new(enc_public_key: [u8; ENC_PUBLIC_KEY_SIZE], now: u64) -> Self {
        Self {
            public_key: ExtendedPublicKey::new(enc_public_key, [0u8; 32]),
            public_key_hash: jenkins_hash(&enc_public_key),
            session: SessionKeys::generate(),
            shared_key: None,
            state: ConnState::Fresh,
            tcp_channel: None,
            address: None,
            oob_relay_pk: None,
            recent_relays: Vec::new(),
            relay_index: 0,
            pending_handshake: None,
            last_handshake_kind: HandshakeRequestKind::PeerInfoExchange,
            handshake_request_counted: false,
            handshake_response_counted: false,
            pending_sync_request: false,
            pending_state_sync: false,
            self_sent_state_version: u32::MAX,
            peer_state_version: u32::MAX,
            time_added: now,
            last_ping_recv: now,
            last_direct_recv: 0,
            last_relays_shared: 0,
            last_addr_shared: 0,
            send_message_id: 1,
            send_ring_start: 1,
            send_ring: (0..RING_SIZE).map(|_| None).collect(),
            recv_message_id: 0,
            recv_ring: (0..RING_SIZE).map(|_| None).collect(),
        }
    }

    pub fn is_handshaked(&self) -> bool {
        self.state >= ConnState::Handshaked
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == ConnState::Confirmed
    }

    /// True when frames should go over direct UDP instead of the relay.
    pub fn is_direct(&self, now: u64) -> bool {
        self.address.is_some() && now.saturating_sub(self.last_direct_recv) < DIRECT_PATH_TIMEOUT
    }

    /// Next outgoing message id, consumed by the caller. Used for the
    /// handshake, which occupies a stream slot without entering the ring.
    pub fn next_message_id(&mut self) -> u64 {
        let id = self.send_message_id;
        self.send_message_id += 1;
        id
    }

    /// The id the next lossless frame will carry. The stream only advances
    /// once [`Self::store_sent`] accepts the frame.
    pub fn peek_message_id(&self) -> u64 {
        self.send_message_id
    }

    /// Last delivered inbound id.
    pub fn recv_message_id(&self) -> u64 {
        self.recv_message_id
    }

    /// A handshake request occupies one slot of the inbound stream, however
    /// many copies of it arrive.
    pub fn note_handshake_request(&mut self) {
        if !self.handshake_request_counted {
            self.handshake_request_counted = true;
            self.recv_message_id += 1;
        }
    }

    /// Same accounting for the response direction.
    pub fn note_handshake_response(&mut self) {
        if !self.handshake_response_counted {
            self.handshake_response_counted = true;
            self.recv_message_id += 1;
        }
    }

    /// Stores a wrapped lossless frame until it is read-acked, advancing the
    /// outgoing stream. A full ring rejects the frame and leaves the stream
    /// untouched, so no id is ever skipped.
    pub fn store_sent(&mut self, message_id: u64, frame: Vec<u8>, now: u64) -> Result<(), ()> {
        let idx = (message_id % RING_SIZE) as usize;
        if self.send_ring[idx].is_some() {
            debug!(message_id, "send ring full, dropping frame");
            return Err(());
        }
        self.send_ring[idx] = Some(SendEntry {
            message_id,
            frame,
            time_added: now,
            last_send_try: now,
        });
        if message_id == self.send_message_id {
            self.send_message_id += 1;
        }
        Ok(())
    }

    /// Cumulative read-ack: clears every pending frame with id ≤ `read_id`.
    /// Returns true if anything was cleared.
    pub fn handle_read_ack(&mut self, read_id: u64) -> bool {
        if read_id < self.send_ring_start || read_id >= self.send_message_id {
            return false;
        }
        let mut cleared = false;
        for id in self.send_ring_start..=read_id {
            let idx = (id % RING_SIZE) as usize;
            if let Some(entry) = &self.send_ring[idx] {
                if entry.message_id <= read_id {
                    self.send_ring[idx] = None;
                    cleared = true;
                }
            }
        }
        self.send_ring_start = read_id + 1;
        cleared
    }

    /// A request-ack asks for one specific frame back. Frames sent this very
    /// second are skipped to avoid immediate duplicates.
    pub fn frame_for_request(&mut self, request_id: u64, now: u64) -> Option<Vec<u8>> {
        let idx = (request_id % RING_SIZE) as usize;
        let entry = self.send_ring[idx].as_mut()?;
        if entry.message_id != request_id {
            return None;
        }
        if entry.last_send_try == now && entry.time_added != now {
            return None;
        }
        entry.last_send_try = now;
        Some(entry.frame.clone())
    }

    /// Admits an inbound lossless id. For [`RecvOutcome::Buffered`] the
    /// payload is kept until [`Self::take_next_buffered`] releases it in
    /// order.
    pub fn check_recv(&mut self, message_id: u64, packet_type: u8, payload: &[u8]) -> RecvOutcome {
        let expected = self.recv_message_id + 1;

        if message_id == expected {
            self.recv_message_id = expected;
            return RecvOutcome::InOrder;
        }

        if message_id <= self.recv_message_id {
            return RecvOutcome::Duplicate;
        }

        if message_id >= expected + RING_SIZE {
            return RecvOutcome::Discarded;
        }

        let idx = (message_id % RING_SIZE) as usize;
        if self.recv_ring[idx].is_some() {
            return RecvOutcome::Duplicate;
        }

        self.recv_ring[idx] = Some(RecvEntry {
            message_id,
            packet_type,
            payload: payload.to_vec(),
        });
        RecvOutcome::Buffered
    }

    /// Releases the next in-order buffered message, if the gap has closed.
    pub fn take_next_buffered(&mut self) -> Option<(u8, Vec<u8>)> {
        let next = self.recv_message_id + 1;
        let idx = (next % RING_SIZE) as usize;
        if self.recv_ring[idx].as_ref()?.message_id != next {
            return None;
        }
        let entry = self.recv_ring[idx].take()?;
        self.recv_message_id = next;
        Some((entry.packet_type, entry.payload))
    }

    /// Collects frames overdue for retransmission. Marks the connection dead
    /// once its oldest unacked frame has outlived the confirmed timeout.
    pub fn resend_stale(&mut self, now: u64) -> ResendBatch {
        let mut batch = ResendBatch::default();

        for id in self.send_ring_start..self.send_message_id {
            let idx = (id % RING_SIZE) as usize;
            let Some(entry) = self.send_ring[idx].as_mut() else {
                continue;
            };
            if entry.message_id != id {
                continue;
            }
            if now.saturating_sub(entry.time_added) >= CONFIRMED_PEER_TIMEOUT {
                batch.timed_out = true;
                return batch;
            }
            // Skip frames added this second; they just went out
            if entry.time_added == now {
                continue;
            }
            if now.saturating_sub(entry.last_send_try) >= RESEND_INTERVAL {
                entry.last_send_try = now;
                batch.frames.push(entry.frame.clone());
            }
        }

        batch
    }

    /// True once nothing is waiting for an ack.
    pub fn send_ring_is_empty(&self) -> bool {
        (self.send_ring_start..self.send_message_id).all(|id| {
            self.send_ring[(id % RING_SIZE) as usize].is_none()
        })
    }

    /// Remembers a relay this connection was reached through.
    pub fn save_relay(&mut self, node: TcpRelayNode) {
        if self.recent_relays.len() < MAX_SAVED_RELAYS {
            self.recent_relays.push(node);
            self.relay_index = self.recent_relays.len() % MAX_SAVED_RELAYS;
            return;
        }
        self.recent_relays[self.relay_index] = node;
        self.relay_index = (self.relay_index + 1) % MAX_SAVED_RELAYS;
    }

    /// The relay most recently saved, used as the handshake relay hint.
    pub fn last_relay(&self) -> Option<TcpRelayNode> {
        if self.recent_relays.is_empty() {
            return None;
        }
        let idx = (self.relay_index + MAX_SAVED_RELAYS - 1) % MAX_SAVED_RELAYS;
        self.recent_relays.get(idx).or_else(|| self.recent_relays.last()).copied()
    }

    /// Whether the peer has been silent past its allowed window.
    pub fn timed_out(&self, now: u64) -> bool {
        let window = if self.is_confirmed() {
            CONFIRMED_PEER_TIMEOUT
        } else {
            UNCONFIRMED_PEER_TIMEOUT
        };
        now.saturating_sub(self.last_ping_recv) >= window
    }
}
