//! The group runtime: one [`Group`] per chat, holding the peer table, the
//! replicated signed state, and the per-peer connections.
//!
//! The peer table is an insertion-ordered vector with self at index 0.
//! Indices are volatile (deletion swap-removes); the public API only ever
//! sees stable random peer ids. Inbound frames are decrypted, pushed through
//! the reliability layer, then dispatched to the handler for their inner
//! packet type.

pub mod broadcast;
pub mod connection;
pub mod driver;
pub mod handshake;
pub mod moderation;
pub mod roles;
pub mod shared_state;
pub mod sync;
pub mod topic;

use std::sync::Arc;

use rand::RngCore;
use thiserror::Error as ThisError;
use tracing::{debug, warn};

use crate::crypto::{jenkins_hash, CryptoError, ExtendedKeyPair, ExtendedPublicKey, ENC_PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
use crate::events::Events;
use crate::packet::codec::{open_session_packet, wrap_session_packet, CodecError, FrameHeader};
use crate::packet::{GroupPacketType, PacketKind, MAX_NICK_SIZE};
use crate::time::unix_time;
use crate::transport::{AnnounceDirectory, IpPort, Transport};
use crate::wire::{Reader, WireError, Writer};
use crate::Error;

use connection::{ConnState, PeerConnection};
use moderation::Moderation;
use shared_state::SharedState;
use topic::TopicInfo;

/// Hard ceiling on the peer table; the shared state's own limit is below it.
pub const MAX_GROUP_PEERS: u32 = 1024;
/// Encryption keys of recently confirmed peers, kept to admit reconnects to
/// private chats.
const RECENTLY_CONFIRMED_RING: usize = 30;
/// Friend numbers we invited, so only they can complete the invite flow.
pub(crate) const MAX_SAVED_INVITES: usize = 10;
/// Packed size of a peer info blob.
pub const PACKED_PEER_INFO_SIZE: usize = 2 + MAX_NICK_SIZE + 1 + 1;

/// Group role, ordered by privilege (lower = more privileged).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Role {
    Founder = 0,
    Moderator = 1,
    User = 2,
    Observer = 3,
}

impl Role {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Role::Founder),
            1 => Some(Role::Moderator),
            2 => Some(Role::User),
            3 => Some(Role::Observer),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// User-visible presence status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerStatus {
    Online = 0,
    Away = 1,
    Busy = 2,
}

impl PeerStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PeerStatus::Online),
            1 => Some(PeerStatus::Away),
            2 => Some(PeerStatus::Busy),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Group privacy mode, part of the signed shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Privacy {
    Public = 0,
    Private = 1,
}

impl Privacy {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Privacy::Public),
            1 => Some(Privacy::Private),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// How we joined: announced publicly or via a private invite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JoinKind {
    Public = 0,
    Private = 1,
}

impl JoinKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(JoinKind::Public),
            1 => Some(JoinKind::Private),
            _ => None,
        }
    }
}

/// Connectivity of the group as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Failed,
}

/// Per-peer application data, as opposed to transport data in
/// [`PeerConnection`].
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub peer_id: u32,
    pub nick: Vec<u8>,
    pub status: PeerStatus,
    pub role: Role,
    pub ignore: bool,
}

impl PeerInfo {
    /// Packs the transferable subset (nick, status, role).
    pub fn pack(&self, w: &mut Writer) {
        w.put_u16(self.nick.len() as u16);
        w.put_padded(&self.nick, MAX_NICK_SIZE);
        w.put_u8(self.status.as_u8());
        w.put_u8(self.role.as_u8());
    }

    /// Unpacks a transferred blob. The peer id is local-only and set to zero.
    pub fn unpack(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let nick_len = (r.take_u16()? as usize).min(MAX_NICK_SIZE);
        let nick_field = r.take_bytes(MAX_NICK_SIZE)?;
        let status = PeerStatus::from_u8(r.take_u8()?).ok_or(WireError::FieldOutOfBounds("status"))?;
        let role = Role::from_u8(r.take_u8()?).ok_or(WireError::FieldOutOfBounds("role"))?;
        Ok(Self {
            peer_id: 0,
            nick: nick_field[..nick_len].to_vec(),
            status,
            role,
            ignore: false,
        })
    }
}

/// A seated peer: application info plus its connection.
pub struct GroupPeer {
    pub info: PeerInfo,
    pub conn: PeerConnection,
}

/// Classified failure of an inbound packet handler. Everything here results
/// in a silent drop; the classification only steers logging and recovery.
#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub(crate) enum HandleError {
    #[error("malformed input")]
    Malformed,

    #[error("authentication failure")]
    Auth,

    #[error("policy violation")]
    Policy,

    #[error("send failure")]
    Send,
}

impl From<WireError> for HandleError {
    fn from(_: WireError) -> Self {
        HandleError::Malformed
    }
}

impl From<CodecError> for HandleError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Crypto(CryptoError::DecryptionFailed) => HandleError::Auth,
            _ => HandleError::Malformed,
        }
    }
}

impl From<Error> for HandleError {
    fn from(_: Error) -> Self {
        HandleError::Send
    }
}

/// Result of [`Group::peer_add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PeerAddOutcome {
    Added(usize),
    AlreadyPresent(usize),
}

pub struct Group {
    pub(crate) group_number: u32,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) announce: Arc<dyn AnnounceDirectory>,
    pub(crate) events: Events,

    /// The chat identity. Only the founder holds the secret half.
    pub(crate) chat_public_key: ExtendedPublicKey,
    pub(crate) chat_keys: Option<ExtendedKeyPair>,
    pub(crate) self_keys: ExtendedKeyPair,
    pub(crate) chat_id_hash: u32,
    pub(crate) self_pk_hash: u32,

    pub(crate) shared_state: SharedState,
    pub(crate) shared_state_sig: [u8; SIGNATURE_SIZE],
    pub(crate) topic: TopicInfo,
    pub(crate) topic_sig: [u8; SIGNATURE_SIZE],
    pub(crate) moderation: Moderation,

    pub(crate) peers: Vec<GroupPeer>,
    pub(crate) connection_state: GroupConnectionState,
    pub(crate) join_kind: JoinKind,

    pub(crate) last_join_attempt: u64,
    pub(crate) last_ping_sent: u64,

    // Handshake flood control
    pub(crate) connection_meter: u32,
    pub(crate) block_handshakes: bool,
    pub(crate) cooldown_timer: u64,

    pub(crate) recently_confirmed: Vec<[u8; ENC_PUBLIC_KEY_SIZE]>,
    pub(crate) recently_confirmed_index: usize,
    pub(crate) saved_invites: Vec<u32>,
}

impl Group {
    /// Creates the group object with self seated at index 0.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        group_number: u32,
        transport: Arc<dyn Transport>,
        announce: Arc<dyn AnnounceDirectory>,
        events: Events,
        self_keys: ExtendedKeyPair,
        chat_public_key: ExtendedPublicKey,
        chat_keys: Option<ExtendedKeyPair>,
        nick: Vec<u8>,
        status: PeerStatus,
        self_role: Role,
        join_kind: JoinKind,
    ) -> Result<Self, Error> {
        if nick.is_empty() || nick.len() > MAX_NICK_SIZE {
            return Err(Error::InvalidArgument("nick length"));
        }

        let now = unix_time();
        let chat_id_hash = jenkins_hash(chat_public_key.chat_id());
        let self_pk_hash = jenkins_hash(self_keys.public().enc());

        let mut group = Self {
            group_number,
            transport,
            announce,
            events,
            chat_public_key,
            chat_keys,
            self_keys,
            chat_id_hash,
            self_pk_hash,
            shared_state: SharedState::default(),
            shared_state_sig: [0u8; SIGNATURE_SIZE],
            topic: TopicInfo::default(),
            topic_sig: [0u8; SIGNATURE_SIZE],
            moderation: Moderation::new(),
            peers: Vec::new(),
            connection_state: GroupConnectionState::Disconnected,
            join_kind,
            last_join_attempt: now,
            last_ping_sent: now,
            connection_meter: 0,
            block_handshakes: false,
            cooldown_timer: now,
            recently_confirmed: Vec::new(),
            recently_confirmed_index: 0,
            saved_invites: Vec::new(),
        };

        // Self is always peer 0 and always confirmed
        let self_enc = *group.self_keys.public().enc();
        let mut conn = PeerConnection::new(self_enc, now);
        conn.public_key = *group.self_keys.public();
        conn.state = ConnState::Confirmed;
        let peer_id = group.unused_peer_id();
        group.peers.push(GroupPeer {
            info: PeerInfo {
                peer_id,
                nick,
                status,
                role: self_role,
                ignore: false,
            },
            conn,
        });

        Ok(group)
    }

    // ---- lookups ----

    pub(crate) fn peer_index_by_enc_pk(&self, enc_pk: &[u8; ENC_PUBLIC_KEY_SIZE]) -> Option<usize> {
        self.peers
            .iter()
            .position(|p| p.conn.public_key.enc() == enc_pk)
    }

    pub(crate) fn peer_index_by_sig_pk(&self, sig_pk: &[u8; 32]) -> Option<usize> {
        self.peers
            .iter()
            .position(|p| p.conn.public_key.sig() == sig_pk)
    }

    pub(crate) fn peer_index_by_id(&self, peer_id: u32) -> Option<usize> {
        self.peers.iter().position(|p| p.info.peer_id == peer_id)
    }

    pub(crate) fn peer_index_by_nick(&self, nick: &[u8]) -> Option<usize> {
        if nick.is_empty() {
            return None;
        }
        self.peers.iter().position(|p| p.info.nick == nick)
    }

    fn unused_peer_id(&self) -> u32 {
        loop {
            let id = rand::rngs::OsRng.next_u32();
            if self.peer_index_by_id(id).is_none() {
                return id;
            }
        }
    }

    pub(crate) fn confirmed_count(&self) -> u32 {
        self.peers.iter().filter(|p| p.conn.is_confirmed()).count() as u32
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn chat_id(&self) -> &[u8; 32] {
        self.chat_public_key.chat_id()
    }

    pub fn self_peer_id(&self) -> u32 {
        self.peers[0].info.peer_id
    }

    pub fn self_role(&self) -> Role {
        self.peers[0].info.role
    }

    pub fn self_status(&self) -> PeerStatus {
        self.peers[0].info.status
    }

    pub fn self_nick(&self) -> &[u8] {
        &self.peers[0].info.nick
    }

    pub fn group_name(&self) -> &[u8] {
        &self.shared_state.group_name
    }

    pub fn privacy(&self) -> Privacy {
        self.shared_state.privacy
    }

    pub fn password(&self) -> &[u8] {
        &self.shared_state.password
    }

    pub fn peer_limit(&self) -> u32 {
        self.shared_state.max_peers
    }

    pub fn topic_bytes(&self) -> &[u8] {
        &self.topic.topic
    }

    pub fn shared_state_version(&self) -> u32 {
        self.shared_state.version
    }

    pub fn sanctions_creds_version(&self) -> u32 {
        self.moderation.creds.version
    }

    pub fn topic_version(&self) -> u32 {
        self.topic.version
    }

    pub fn connection_state(&self) -> GroupConnectionState {
        self.connection_state
    }

    pub fn is_public(&self) -> bool {
        self.shared_state.privacy == Privacy::Public
    }

    /// Stable peer ids of every seated peer except self.
    pub fn peer_ids(&self) -> Vec<u32> {
        self.peers.iter().skip(1).map(|p| p.info.peer_id).collect()
    }

    pub fn peer_nick(&self, peer_id: u32) -> Option<&[u8]> {
        let index = self.peer_index_by_id(peer_id)?;
        Some(self.peers[index].info.nick.as_slice())
    }

    pub fn peer_role(&self, peer_id: u32) -> Option<Role> {
        let index = self.peer_index_by_id(peer_id)?;
        Some(self.peers[index].info.role)
    }

    pub fn peer_status(&self, peer_id: u32) -> Option<PeerStatus> {
        let index = self.peer_index_by_id(peer_id)?;
        Some(self.peers[index].info.status)
    }

    pub fn peer_public_key(&self, peer_id: u32) -> Option<[u8; ENC_PUBLIC_KEY_SIZE]> {
        let index = self.peer_index_by_id(peer_id)?;
        Some(*self.peers[index].conn.public_key.enc())
    }

    // ---- peer table mutation ----

    pub(crate) fn recently_confirmed_contains(&self, enc_pk: &[u8; ENC_PUBLIC_KEY_SIZE]) -> bool {
        self.recently_confirmed.iter().any(|k| k == enc_pk)
    }

    fn remember_confirmed(&mut self, enc_pk: [u8; ENC_PUBLIC_KEY_SIZE]) {
        if self.recently_confirmed_contains(&enc_pk) {
            return;
        }
        if self.recently_confirmed.len() < RECENTLY_CONFIRMED_RING {
            self.recently_confirmed.push(enc_pk);
            self.recently_confirmed_index =
                self.recently_confirmed.len() % RECENTLY_CONFIRMED_RING;
            return;
        }
        self.recently_confirmed[self.recently_confirmed_index] = enc_pk;
        self.recently_confirmed_index =
            (self.recently_confirmed_index + 1) % RECENTLY_CONFIRMED_RING;
    }

    /// Seats a new peer with a fresh connection and TCP channel.
    pub(crate) fn peer_add(
        &mut self,
        public_key: &[u8; ENC_PUBLIC_KEY_SIZE],
        addr: Option<IpPort>,
    ) -> Result<PeerAddOutcome, Error> {
        if let Some(index) = self.peer_index_by_enc_pk(public_key) {
            return Ok(PeerAddOutcome::AlreadyPresent(index));
        }
        if self.peers.len() as u32 >= MAX_GROUP_PEERS {
            return Err(Error::InvalidArgument("peer table full"));
        }

        let channel = self
            .transport
            .new_channel(public_key)
            .map_err(|_| Error::SendFailed)?;

        let now = unix_time();
        let mut conn = PeerConnection::new(*public_key, now);
        conn.tcp_channel = Some(channel);
        conn.address = addr;

        let peer_id = self.unused_peer_id();
        self.peers.push(GroupPeer {
            info: PeerInfo {
                peer_id,
                nick: Vec::new(),
                status: PeerStatus::Online,
                role: Role::User,
                ignore: false,
            },
            conn,
        });

        Ok(PeerAddOutcome::Added(self.peers.len() - 1))
    }

    /// Removes a peer, releasing its channel and reliability state. Fires
    /// peer-exit for confirmed peers. Self (index 0) is never deleted.
    pub(crate) fn peer_delete(&mut self, index: usize, reason: &[u8]) {
        if index == 0 || index >= self.peers.len() {
            return;
        }

        let peer = &self.peers[index];
        if peer.conn.is_handshaked() {
            let pk = *peer.conn.public_key.enc();
            self.remember_confirmed(pk);
        }

        let peer = &self.peers[index];
        if peer.conn.is_confirmed() {
            let peer_id = peer.info.peer_id;
            let gn = self.group_number;
            self.events.emit(|o| o.on_peer_exit(gn, peer_id, reason));
        }

        if let Some(channel) = self.peers[index].conn.tcp_channel {
            self.transport.kill_channel(channel);
        }

        debug!(group = self.group_number, index, "peer removed");
        self.peers.swap_remove(index);
    }

    /// Applies a transferred peer blob. Duplicate nicks are treated as an
    /// attack and cost the sender its seat.
    pub(crate) fn peer_update(&mut self, index: usize, update: PeerInfo) -> Result<(), HandleError> {
        if update.nick.is_empty() {
            return Err(HandleError::Malformed);
        }

        if let Some(rival) = self.peer_index_by_nick(&update.nick) {
            if rival != index {
                self.peer_delete(index, b"duplicate nick");
                return Err(HandleError::Policy);
            }
        }

        let info = &mut self.peers[index].info;
        info.nick = update.nick;
        info.status = update.status;
        info.role = update.role;
        Ok(())
    }

    /// A peer's claimed role must be backed by the replicated state: founders
    /// by the shared state's founder key, moderators by the moderator list,
    /// and non-observers by sanction absence.
    pub(crate) fn validate_peer_role(&self, index: usize) -> bool {
        let peer = &self.peers[index];
        let enc_pk = peer.conn.public_key.enc();
        match peer.info.role {
            Role::Founder => self.shared_state.founder_public_key.enc() == enc_pk,
            Role::Moderator => self.moderation.is_mod(peer.conn.public_key.sig()),
            Role::User => !self.moderation.is_observer(enc_pk),
            Role::Observer => {
                // Self is exempt before the first sanctions sync
                index == 0 || self.moderation.is_observer(enc_pk)
            }
        }
    }

    /// Toggle local-only message filtering for a peer.
    pub fn toggle_ignore(&mut self, peer_id: u32, ignore: bool) -> Result<(), Error> {
        let index = self.peer_index_by_id(peer_id).ok_or(Error::InvalidPeer)?;
        if index == 0 {
            return Err(Error::InvalidPeer);
        }
        self.peers[index].info.ignore = ignore;
        Ok(())
    }

    // ---- outbound plumbing ----

    /// Sends a wrapped frame over the currently selected path.
    pub(crate) fn send_frame_to(&self, index: usize, frame: &[u8], now: u64) -> Result<(), Error> {
        let conn = &self.peers[index].conn;
        if conn.is_direct(now) {
            if let Some(addr) = conn.address {
                return self
                    .transport
                    .send_udp(addr, frame)
                    .map_err(|_| Error::SendFailed);
            }
        }
        match conn.tcp_channel {
            Some(channel) => self
                .transport
                .send_channel(channel, frame)
                .map_err(|_| Error::SendFailed),
            None => Err(Error::SendFailed),
        }
    }

    /// Wraps and sends one lossless packet, entering it into the send ring.
    pub(crate) fn send_lossless_to(
        &mut self,
        index: usize,
        packet_type: GroupPacketType,
        body: &[u8],
    ) -> Result<(), Error> {
        let now = unix_time();
        let chat_id_hash = self.chat_id_hash;
        let self_hash = self.self_pk_hash;
        let self_enc = *self.self_keys.public().enc();

        let conn = &mut self.peers[index].conn;
        if !conn.is_handshaked() {
            return Err(Error::NotConnected);
        }
        let key = conn.shared_key.clone().ok_or(Error::NotConnected)?;

        let mut payload = Writer::with_capacity(4 + body.len());
        payload.put_u32(self_hash);
        payload.put_bytes(body);

        let message_id = conn.peek_message_id();
        let frame = wrap_session_packet(
            PacketKind::Lossless,
            chat_id_hash,
            &self_enc,
            &key,
            packet_type.as_u8(),
            Some(message_id),
            &payload.into_bytes(),
        )
        .map_err(|_| Error::SendFailed)?;

        conn.store_sent(message_id, frame.clone(), now)
            .map_err(|_| Error::SendFailed)?;

        self.send_frame_to(index, &frame, now)
    }

    /// Wraps and sends one lossy packet.
    pub(crate) fn send_lossy_to(
        &mut self,
        index: usize,
        packet_type: GroupPacketType,
        body: &[u8],
    ) -> Result<(), Error> {
        let now = unix_time();
        let chat_id_hash = self.chat_id_hash;
        let self_hash = self.self_pk_hash;
        let self_enc = *self.self_keys.public().enc();

        let conn = &self.peers[index].conn;
        if !conn.is_handshaked() {
            return Err(Error::NotConnected);
        }
        let key = conn.shared_key.clone().ok_or(Error::NotConnected)?;

        let mut payload = Writer::with_capacity(4 + body.len());
        payload.put_u32(self_hash);
        payload.put_bytes(body);

        let frame = wrap_session_packet(
            PacketKind::Lossy,
            chat_id_hash,
            &self_enc,
            &key,
            packet_type.as_u8(),
            None,
            &payload.into_bytes(),
        )
        .map_err(|_| Error::SendFailed)?;

        self.send_frame_to(index, &frame, now)
    }

    /// Sends a lossless packet to every confirmed peer. Per-peer failures are
    /// absorbed; retransmission covers them.
    pub(crate) fn send_lossless_all(&mut self, packet_type: GroupPacketType, body: &[u8]) {
        for index in 1..self.peers.len() {
            if self.peers[index].conn.is_confirmed() {
                let _ = self.send_lossless_to(index, packet_type, body);
            }
        }
    }

    pub(crate) fn send_lossy_all(&mut self, packet_type: GroupPacketType, body: &[u8]) {
        for index in 1..self.peers.len() {
            if self.peers[index].conn.is_confirmed() {
                let _ = self.send_lossy_to(index, packet_type, body);
            }
        }
    }

    /// Lossy MessageAck. Exactly one of `read_id` / `request_id` is non-zero.
    pub(crate) fn send_message_ack(
        &mut self,
        index: usize,
        read_id: u64,
        request_id: u64,
    ) -> Result<(), Error> {
        let mut w = Writer::with_capacity(16);
        w.put_u64(read_id);
        w.put_u64(request_id);
        self.send_lossy_to(index, GroupPacketType::MessageAck, &w.into_bytes())
    }

    // ---- inbound dispatch ----

    /// Full lossless path: decrypt, authenticate, order, dispatch, ack,
    /// drain. `direct` marks frames that arrived over UDP.
    pub(crate) fn handle_lossless(
        &mut self,
        header: &FrameHeader,
        ciphertext: &[u8],
        direct: bool,
        from: Option<IpPort>,
    ) -> Result<(), HandleError> {
        let sender_pk = header.sender_enc_pk;
        let index = self
            .peer_index_by_enc_pk(&sender_pk)
            .ok_or(HandleError::Malformed)?;
        if index == 0 {
            return Err(HandleError::Auth);
        }

        let plain = {
            let conn = &self.peers[index].conn;
            let key = conn.shared_key.as_ref().ok_or(HandleError::Auth)?;
            open_session_packet(header, ciphertext, key)?
        };

        let Ok(packet_type) = GroupPacketType::from_u8(plain.packet_type) else {
            warn!(raw = plain.packet_type, "unknown lossless packet type");
            return Err(HandleError::Malformed);
        };
        let message_id = plain.message_id.ok_or(HandleError::Malformed)?;

        let mut r = Reader::new(&plain.payload);
        let sender_hash = r.take_u32()?;
        let body = r.take_rest().to_vec();

        {
            let conn = &self.peers[index].conn;
            if sender_hash != conn.public_key_hash {
                return Err(HandleError::Auth);
            }
            if packet_type != GroupPacketType::HsResponseAck && !conn.is_handshaked() {
                return Err(HandleError::Policy);
            }
        }

        use self::connection::RecvOutcome;
        match self.peers[index]
            .conn
            .check_recv(message_id, packet_type.as_u8(), &body)
        {
            RecvOutcome::Duplicate => {
                let _ = self.send_message_ack(index, message_id, 0);
                return Ok(());
            }
            RecvOutcome::Buffered => {
                let request = self.peers[index].conn.recv_message_id() + 1;
                let _ = self.send_message_ack(index, 0, request);
                return Ok(());
            }
            RecvOutcome::Discarded => return Ok(()),
            RecvOutcome::InOrder => {}
        }

        let result = self.dispatch_lossless(index, packet_type, &body);
        if let Err(err) = &result {
            debug!(?packet_type, %err, "lossless handler failed");
        }

        // The handler may have deleted or moved the sender
        let Some(index) = self.peer_index_by_enc_pk(&sender_pk) else {
            return result;
        };
        let _ = self.send_message_ack(index, message_id, 0);
        if direct {
            let conn = &mut self.peers[index].conn;
            conn.last_direct_recv = unix_time();
            if from.is_some() {
                conn.address = from;
            }
        }

        // Drain any buffered successors that are now in order
        loop {
            let Some(index) = self.peer_index_by_enc_pk(&sender_pk) else {
                break;
            };
            let Some((raw_type, payload)) = self.peers[index].conn.take_next_buffered() else {
                break;
            };
            let drained_id = self.peers[index].conn.recv_message_id();
            if let Ok(ty) = GroupPacketType::from_u8(raw_type) {
                let _ = self.dispatch_lossless(index, ty, &payload);
            }
            if let Some(ack_index) = self.peer_index_by_enc_pk(&sender_pk) {
                let _ = self.send_message_ack(ack_index, drained_id, 0);
            }
        }

        result
    }

    fn dispatch_lossless(
        &mut self,
        index: usize,
        packet_type: GroupPacketType,
        body: &[u8],
    ) -> Result<(), HandleError> {
        use GroupPacketType::*;
        match packet_type {
            Broadcast => self.handle_broadcast(index, body),
            PeerAnnounce => self.handle_peer_announce(index, body),
            PeerInfoRequest => self.handle_peer_info_request(index),
            PeerInfoResponse => self.handle_peer_info_response(index, body),
            SyncRequest => self.handle_sync_request(index, body),
            SyncResponse => self.handle_sync_response(index, body),
            InviteRequest => self.handle_invite_request(index, body),
            InviteResponse => self.handle_invite_response(index),
            Topic => self.handle_topic(index, body),
            SharedState => self.handle_shared_state(index, body),
            ModList => self.handle_mod_list(index, body),
            SanctionsList => self.handle_sanctions_list(index, body),
            HsResponseAck => self.handle_hs_response_ack(index),
            CustomPacket => self.handle_custom_packet(index, body),
            _ => {
                warn!(?packet_type, "packet type not valid as lossless");
                Err(HandleError::Malformed)
            }
        }
    }

    /// Full lossy path.
    pub(crate) fn handle_lossy(
        &mut self,
        header: &FrameHeader,
        ciphertext: &[u8],
        direct: bool,
        from: Option<IpPort>,
    ) -> Result<(), HandleError> {
        let sender_pk = header.sender_enc_pk;
        let index = self
            .peer_index_by_enc_pk(&sender_pk)
            .ok_or(HandleError::Malformed)?;
        if index == 0 {
            return Err(HandleError::Auth);
        }

        let plain = {
            let conn = &self.peers[index].conn;
            if !conn.is_handshaked() {
                return Err(HandleError::Policy);
            }
            let key = conn.shared_key.as_ref().ok_or(HandleError::Auth)?;
            open_session_packet(header, ciphertext, key)?
        };

        let Ok(packet_type) = GroupPacketType::from_u8(plain.packet_type) else {
            warn!(raw = plain.packet_type, "unknown lossy packet type");
            return Err(HandleError::Malformed);
        };

        let mut r = Reader::new(&plain.payload);
        let sender_hash = r.take_u32()?;
        let body = r.take_rest().to_vec();

        if sender_hash != self.peers[index].conn.public_key_hash {
            return Err(HandleError::Auth);
        }

        use GroupPacketType::*;
        let result = match packet_type {
            MessageAck => self.handle_message_ack(index, &body),
            Ping => self.handle_ping(index, &body),
            InviteResponseReject => self.handle_invite_response_reject(&body),
            TcpRelays => self.handle_tcp_relays(index, &body),
            IpPort => self.handle_ip_port(index, &body),
            CustomPacket => self.handle_custom_packet(index, &body),
            _ => {
                warn!(?packet_type, "packet type not valid as lossy");
                Err(HandleError::Malformed)
            }
        };

        if result.is_ok() && direct {
            if let Some(index) = self.peer_index_by_enc_pk(&sender_pk) {
                let conn = &mut self.peers[index].conn;
                conn.last_direct_recv = unix_time();
                if from.is_some() {
                    conn.address = from;
                }
            }
        }

        result
    }

    /// Lossy MessageAck handler: read-acks clear the send ring, request-acks
    /// trigger a direct resend of the wanted frame.
    fn handle_message_ack(&mut self, index: usize, body: &[u8]) -> Result<(), HandleError> {
        let mut r = Reader::new(body);
        let read_id = r.take_u64()?;
        let request_id = r.take_u64()?;
        r.finish()?;

        if read_id != 0 && request_id != 0 {
            return Err(HandleError::Malformed);
        }

        if read_id > 0 {
            self.peers[index].conn.handle_read_ack(read_id);
            return Ok(());
        }

        let now = unix_time();
        let frame = self.peers[index].conn.frame_for_request(request_id, now);
        match frame {
            Some(frame) => self
                .send_frame_to(index, &frame, now)
                .map_err(|_| HandleError::Send),
            None => Ok(()),
        }
    }

    /// Opaque application packets, observer- and ignore-filtered.
    fn handle_custom_packet(&mut self, index: usize, body: &[u8]) -> Result<(), HandleError> {
        if body.is_empty() {
            return Err(HandleError::Malformed);
        }
        let info = &self.peers[index].info;
        if info.ignore || info.role >= Role::Observer {
            return Ok(());
        }
        let (gn, peer_id) = (self.group_number, info.peer_id);
        self.events.emit(|o| o.on_custom_packet(gn, peer_id, body));
        Ok(())
    }

    /// Sends an opaque payload to every confirmed peer.
    pub fn send_custom_packet(&mut self, lossless: bool, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Err(Error::InvalidArgument("empty custom packet"));
        }
        if data.len() > crate::packet::MAX_MESSAGE_SIZE {
            return Err(Error::InvalidArgument("custom packet too long"));
        }
        if self.self_role() >= Role::Observer {
            return Err(Error::PermissionDenied);
        }
        if lossless {
            self.send_lossless_all(GroupPacketType::CustomPacket, data);
        } else {
            self.send_lossy_all(GroupPacketType::CustomPacket, data);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{NullAnnounce, NullTransport};

    fn test_group(role: Role) -> Group {
        let chat_keys = ExtendedKeyPair::generate();
        Group::new(
            0,
            Arc::new(NullTransport::default()),
            Arc::new(NullAnnounce),
            Events::new(),
            ExtendedKeyPair::generate(),
            *chat_keys.public(),
            Some(chat_keys),
            b"alice".to_vec(),
            PeerStatus::Online,
            role,
            JoinKind::Private,
        )
        .unwrap()
    }

    #[test]
    fn test_self_is_peer_zero() {
        let group = test_group(Role::Founder);
        assert_eq!(group.peer_count(), 1);
        assert_eq!(group.self_role(), Role::Founder);
        assert_eq!(group.self_nick(), b"alice");
        assert!(group.peers[0].conn.is_confirmed());
    }

    #[test]
    fn test_peer_add_and_duplicate() {
        let mut group = test_group(Role::Founder);
        let pk = [7u8; 32];
        let outcome = group.peer_add(&pk, None).unwrap();
        assert_eq!(outcome, PeerAddOutcome::Added(1));
        let outcome = group.peer_add(&pk, None).unwrap();
        assert_eq!(outcome, PeerAddOutcome::AlreadyPresent(1));
        assert_eq!(group.peer_count(), 2);
    }

    #[test]
    fn test_peer_delete_compacts_and_remembers() {
        let mut group = test_group(Role::Founder);
        group.peer_add(&[1u8; 32], None).unwrap();
        group.peer_add(&[2u8; 32], None).unwrap();
        group.peers[1].conn.state = ConnState::Handshaked;

        group.peer_delete(1, b"bye");
        assert_eq!(group.peer_count(), 2);
        // Swap-remove moved peer 2 into slot 1
        assert_eq!(group.peers[1].conn.public_key.enc(), &[2u8; 32]);
        // Handshaked peers enter the reconnect ring
        assert!(group.recently_confirmed_contains(&[1u8; 32]));
        assert!(!group.recently_confirmed_contains(&[2u8; 32]));
    }

    #[test]
    fn test_self_never_deleted() {
        let mut group = test_group(Role::Founder);
        group.peer_delete(0, b"");
        assert_eq!(group.peer_count(), 1);
    }

    #[test]
    fn test_duplicate_nick_deletes_offender() {
        let mut group = test_group(Role::Founder);
        group.peer_add(&[1u8; 32], None).unwrap();
        group.peer_add(&[2u8; 32], None).unwrap();

        let ok = PeerInfo {
            peer_id: 0,
            nick: b"bob".to_vec(),
            status: PeerStatus::Online,
            role: Role::User,
            ignore: false,
        };
        group.peer_update(1, ok.clone()).unwrap();

        // Second peer claiming the same nick is ejected
        assert_eq!(group.peer_update(2, ok), Err(HandleError::Policy));
        assert_eq!(group.peer_count(), 2);
        assert!(group.peer_index_by_enc_pk(&[2u8; 32]).is_none());
    }

    #[test]
    fn test_peer_info_pack_roundtrip() {
        let info = PeerInfo {
            peer_id: 42,
            nick: b"carol".to_vec(),
            status: PeerStatus::Busy,
            role: Role::Moderator,
            ignore: true,
        };
        let mut w = Writer::new();
        info.pack(&mut w);
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), PACKED_PEER_INFO_SIZE);

        let mut r = Reader::new(&bytes);
        let unpacked = PeerInfo::unpack(&mut r).unwrap();
        assert_eq!(unpacked.nick, b"carol");
        assert_eq!(unpacked.status, PeerStatus::Busy);
        assert_eq!(unpacked.role, Role::Moderator);
        // Local-only fields do not transfer
        assert_eq!(unpacked.peer_id, 0);
        assert!(!unpacked.ignore);
    }

    #[test]
    fn test_role_ordering() {
        assert!(Role::Founder < Role::Moderator);
        assert!(Role::Moderator < Role::User);
        assert!(Role::User < Role::Observer);
    }

    #[test]
    fn test_validate_founder_role() {
        let mut group = test_group(Role::Founder);
        group.shared_state.founder_public_key = *group.self_keys.public();
        assert!(group.validate_peer_role(0));

        group.peer_add(&[5u8; 32], None).unwrap();
        group.peers[1].info.role = Role::Founder;
        assert!(!group.validate_peer_role(1));
        group.peers[1].info.role = Role::Moderator;
        assert!(!group.validate_peer_role(1));
        group.peers[1].info.role = Role::User;
        assert!(group.validate_peer_role(1));
    }

    #[test]
    fn test_toggle_ignore() {
        let mut group = test_group(Role::Founder);
        group.peer_add(&[5u8; 32], None).unwrap();
        let peer_id = group.peers[1].info.peer_id;
        group.toggle_ignore(peer_id, true).unwrap();
        assert!(group.peers[1].info.ignore);
        // Self cannot be ignored
        assert!(group.toggle_ignore(group.self_peer_id(), true).is_err());
    }
}
