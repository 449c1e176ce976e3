//! The session: every live group, inbound dispatch, and lifecycle.
//!
//! Inbound datagrams carry a 4-byte chat-id hash right after the outer kind;
//! the session routes them to the owning group without decrypting anything.
//! The periodic [`GroupSession::do_tick`] drives every group's timers and
//! reaps groups that asked to close.

use std::sync::Arc;

use tracing::debug;

use crate::crypto::{ExtendedKeyPair, ExtendedPublicKey, CHAT_ID_SIZE, ENC_PUBLIC_KEY_SIZE};
use crate::events::{Events, GroupObserver};
use crate::group::{
    connection::HandshakeRequestKind, Group, GroupConnectionState, JoinKind, PeerStatus, Privacy,
    Role,
};
use crate::packet::codec::{parse_frame, peek_dispatch};
use crate::packet::{GroupPacketType, PacketKind, MAX_GROUP_NAME_SIZE, MAX_PASSWORD_SIZE};
use crate::time::unix_time;
use crate::transport::{AnnounceDirectory, IpPort, TcpRelayNode, Transport};
use crate::wire::{Reader, Writer};
use crate::Error;

/// Friend-invite sub-type, carried inside a FriendInvite messenger packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FriendInviteKind {
    Invite = 0,
    Accepted = 1,
    Confirmation = 2,
}

impl FriendInviteKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FriendInviteKind::Invite),
            1 => Some(FriendInviteKind::Accepted),
            2 => Some(FriendInviteKind::Confirmation),
            _ => None,
        }
    }
}

/// A parsed friend invite, handed to the application for display before it
/// decides to join.
#[derive(Debug, Clone)]
pub struct FriendInvite {
    pub chat_id: [u8; CHAT_ID_SIZE],
    pub inviter_enc_pk: [u8; ENC_PUBLIC_KEY_SIZE],
}

/// Container for every group this node participates in.
pub struct GroupSession {
    transport: Arc<dyn Transport>,
    announce: Arc<dyn AnnounceDirectory>,
    events: Events,
    groups: Vec<Option<Group>>,
}

impl GroupSession {
    pub fn new(transport: Arc<dyn Transport>, announce: Arc<dyn AnnounceDirectory>) -> Self {
        Self {
            transport,
            announce,
            events: Events::new(),
            groups: Vec::new(),
        }
    }

    /// Attaches (or detaches) the application's event observer.
    pub fn set_observer(&self, observer: Option<Box<dyn GroupObserver>>) {
        self.events.set_observer(observer);
    }

    pub fn group(&self, group_number: u32) -> Option<&Group> {
        self.groups.get(group_number as usize)?.as_ref()
    }

    pub fn group_mut(&mut self, group_number: u32) -> Option<&mut Group> {
        self.groups.get_mut(group_number as usize)?.as_mut()
    }

    pub fn group_count(&self) -> usize {
        self.groups.iter().flatten().count()
    }

    pub fn group_numbers(&self) -> Vec<u32> {
        self.groups
            .iter()
            .enumerate()
            .filter(|(_, g)| g.is_some())
            .map(|(i, _)| i as u32)
            .collect()
    }

    pub fn group_by_chat_id(&self, chat_id: &[u8; CHAT_ID_SIZE]) -> Option<u32> {
        self.groups
            .iter()
            .enumerate()
            .find(|(_, g)| g.as_ref().is_some_and(|g| g.chat_id() == chat_id))
            .map(|(i, _)| i as u32)
    }

    fn free_slot(&mut self) -> usize {
        match self.groups.iter().position(Option::is_none) {
            Some(slot) => slot,
            None => {
                self.groups.push(None);
                self.groups.len() - 1
            }
        }
    }

    // Handles for modules that assemble groups outside this file
    pub(crate) fn alloc_slot(&mut self) -> usize {
        self.free_slot()
    }

    pub(crate) fn transport_handle(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    pub(crate) fn announce_handle(&self) -> Arc<dyn AnnounceDirectory> {
        Arc::clone(&self.announce)
    }

    pub(crate) fn events_handle(&self) -> Events {
        self.events.clone()
    }

    pub(crate) fn install_group(&mut self, slot: usize, group: Group) -> u32 {
        self.groups[slot] = Some(group);
        slot as u32
    }

    fn group_mut_by_hash(&mut self, chat_id_hash: u32) -> Option<&mut Group> {
        self.groups
            .iter_mut()
            .flatten()
            .find(|g| g.chat_id_hash == chat_id_hash)
    }

    // ---- lifecycle ----

    /// Founds a new group. The caller becomes its founder and is immediately
    /// connected.
    pub fn new_group(
        &mut self,
        group_name: &[u8],
        privacy: Privacy,
        nick: &[u8],
        status: PeerStatus,
    ) -> Result<u32, Error> {
        if group_name.is_empty() || group_name.len() > MAX_GROUP_NAME_SIZE {
            return Err(Error::InvalidArgument("group name length"));
        }

        let slot = self.free_slot();
        let chat_keys = ExtendedKeyPair::generate();
        let self_keys = ExtendedKeyPair::generate();
        let chat_public = *chat_keys.public();

        let mut group = Group::new(
            slot as u32,
            Arc::clone(&self.transport),
            Arc::clone(&self.announce),
            self.events.clone(),
            self_keys,
            chat_public,
            Some(chat_keys),
            nick.to_vec(),
            status,
            Role::Founder,
            JoinKind::Private,
        )?;

        group.shared_state.founder_public_key = *group.self_keys.public();
        group.shared_state.group_name = group_name.to_vec();
        group.shared_state.max_peers = crate::group::MAX_GROUP_PEERS;
        group.shared_state.privacy = privacy;
        group.shared_state.mod_list_hash = group.moderation.mod_list_hash();
        group.sign_shared_state()?;

        let keys = group.self_keys.clone();
        group.moderation.make_creds(&keys);

        group.set_topic(b" ")?;
        group.connection_state = GroupConnectionState::Connected;

        if privacy == Privacy::Public {
            self.announce.announce(group.chat_public_key.chat_id());
        }

        debug!(group = slot, "group created");
        self.groups[slot] = Some(group);
        Ok(slot as u32)
    }

    /// Joins a public group by chat id. Peers come from the DHT lookup via
    /// [`Group::add_announced_peers`].
    pub fn join_group(
        &mut self,
        chat_id: &[u8; CHAT_ID_SIZE],
        password: &[u8],
        nick: &[u8],
        status: PeerStatus,
    ) -> Result<u32, Error> {
        if self.group_by_chat_id(chat_id).is_some() {
            return Err(Error::InvalidArgument("group already joined"));
        }
        if password.len() > MAX_PASSWORD_SIZE {
            return Err(Error::InvalidArgument("password too long"));
        }

        let chat_public =
            ExtendedPublicKey::from_chat_id(chat_id).map_err(|_| Error::InvalidArgument("chat id"))?;

        let slot = self.free_slot();
        let mut group = Group::new(
            slot as u32,
            Arc::clone(&self.transport),
            Arc::clone(&self.announce),
            self.events.clone(),
            ExtendedKeyPair::generate(),
            chat_public,
            None,
            nick.to_vec(),
            status,
            Role::User,
            JoinKind::Public,
        )?;

        group.shared_state.password = password.to_vec();
        group.connection_state = GroupConnectionState::Connecting;
        group.last_join_attempt = unix_time();

        self.groups[slot] = Some(group);
        Ok(slot as u32)
    }

    /// Broadcasts a parting message and tears the group down.
    pub fn leave_group(&mut self, group_number: u32, part_message: &[u8]) -> Result<(), Error> {
        let group = self.group_mut(group_number).ok_or(Error::InvalidGroup)?;
        let result = group.send_self_exit(part_message);
        self.delete_group(group_number);
        result
    }

    fn delete_group(&mut self, group_number: u32) {
        let Some(mut group) = self
            .groups
            .get_mut(group_number as usize)
            .and_then(Option::take)
        else {
            return;
        };

        if group.is_public() {
            self.announce.retract(group.chat_public_key.chat_id());
        }
        while group.peer_count() > 1 {
            let last = group.peer_count() - 1;
            group.peer_delete(last, b"");
        }
        debug!(group = group_number, "group deleted");
    }

    // ---- periodic driver ----

    /// One tick across every group. Call roughly once per second.
    pub fn do_tick(&mut self) {
        self.do_tick_at(unix_time());
    }

    /// Tick against an explicit clock reading, for embedders that sample the
    /// clock themselves.
    pub fn do_tick_at(&mut self, now: u64) {
        let numbers: Vec<u32> = self.group_numbers();
        for number in numbers {
            let close = match self.group_mut(number) {
                Some(group) => group.do_tick(now),
                None => false,
            };
            if close {
                self.delete_group(number);
            }
        }
    }

    // ---- inbound dispatch ----

    fn dispatch(&mut self, packet: &[u8], direct: bool, from: Option<IpPort>, oob: bool) {
        let Ok((kind, chat_id_hash)) = peek_dispatch(packet) else {
            return;
        };
        if oob && kind != PacketKind::Handshake {
            return;
        }

        let Some(group) = self.group_mut_by_hash(chat_id_hash) else {
            debug!(chat_id_hash, "no group for inbound packet");
            return;
        };
        if group.connection_state == GroupConnectionState::Failed {
            return;
        }

        let Ok((header, ciphertext)) = parse_frame(packet) else {
            return;
        };

        let result = match kind {
            PacketKind::Handshake => group.handle_handshake(&header, ciphertext, direct, from),
            PacketKind::Lossless => group.handle_lossless(&header, ciphertext, direct, from),
            PacketKind::Lossy => group.handle_lossy(&header, ciphertext, direct, from),
        };

        if let Err(err) = result {
            debug!(?kind, %err, "inbound packet dropped");
        }
    }

    /// Datagram received directly over UDP.
    pub fn handle_udp_packet(&mut self, from: IpPort, packet: &[u8]) {
        self.dispatch(packet, true, Some(from), false);
    }

    /// Packet received over a relay channel.
    pub fn handle_relay_packet(&mut self, packet: &[u8]) {
        self.dispatch(packet, false, None, false);
    }

    /// Out-of-band packet received through a relay; only handshakes may
    /// travel this way.
    pub fn handle_oob_packet(&mut self, packet: &[u8]) {
        self.dispatch(packet, false, None, true);
    }

    // ---- friend invites (carried by the outer messenger) ----

    /// Builds the invite packet for a friend and records the invitation.
    pub fn make_friend_invite(
        &mut self,
        group_number: u32,
        friend_number: u32,
    ) -> Result<Vec<u8>, Error> {
        let group = self.group_mut(group_number).ok_or(Error::InvalidGroup)?;

        let mut w = Writer::new();
        w.put_u8(GroupPacketType::FriendInvite.as_u8());
        w.put_u8(FriendInviteKind::Invite as u8);
        w.put_bytes(group.chat_public_key.chat_id());
        w.put_bytes(group.self_keys.public().enc());

        group.saved_invites.push(friend_number);
        if group.saved_invites.len() > crate::group::MAX_SAVED_INVITES {
            group.saved_invites.remove(0);
        }

        Ok(w.into_bytes())
    }

    /// Parses an invite packet received from a friend.
    pub fn parse_friend_invite(data: &[u8]) -> Result<FriendInvite, Error> {
        let mut r = Reader::new(data);
        let packet_type = r.take_u8().map_err(|_| Error::InvalidArgument("invite"))?;
        let kind = r.take_u8().map_err(|_| Error::InvalidArgument("invite"))?;
        if packet_type != GroupPacketType::FriendInvite.as_u8()
            || FriendInviteKind::from_u8(kind) != Some(FriendInviteKind::Invite)
        {
            return Err(Error::InvalidArgument("invite"));
        }
        let chat_id: [u8; CHAT_ID_SIZE] =
            r.take_array().map_err(|_| Error::InvalidArgument("invite"))?;
        let inviter_enc_pk: [u8; ENC_PUBLIC_KEY_SIZE] =
            r.take_array().map_err(|_| Error::InvalidArgument("invite"))?;
        Ok(FriendInvite {
            chat_id,
            inviter_enc_pk,
        })
    }

    /// Accepts a friend's invite: creates the group shell and returns the
    /// acceptance packet to send back through the messenger.
    pub fn accept_friend_invite(
        &mut self,
        invite: &FriendInvite,
        password: &[u8],
        nick: &[u8],
        status: PeerStatus,
    ) -> Result<(u32, Vec<u8>), Error> {
        if self.group_by_chat_id(&invite.chat_id).is_some() {
            return Err(Error::InvalidArgument("group already joined"));
        }
        if password.len() > MAX_PASSWORD_SIZE {
            return Err(Error::InvalidArgument("password too long"));
        }

        let chat_public = ExtendedPublicKey::from_chat_id(&invite.chat_id)
            .map_err(|_| Error::InvalidArgument("chat id"))?;

        let slot = self.free_slot();
        let mut group = Group::new(
            slot as u32,
            Arc::clone(&self.transport),
            Arc::clone(&self.announce),
            self.events.clone(),
            ExtendedKeyPair::generate(),
            chat_public,
            None,
            nick.to_vec(),
            status,
            Role::User,
            JoinKind::Private,
        )?;

        group.shared_state.password = password.to_vec();
        group.connection_state = GroupConnectionState::Connecting;
        group.last_join_attempt = unix_time();
        group
            .peer_add(&invite.inviter_enc_pk, None)
            .map_err(|_| Error::SendFailed)?;

        let mut w = Writer::new();
        w.put_u8(GroupPacketType::FriendInvite.as_u8());
        w.put_u8(FriendInviteKind::Accepted as u8);
        w.put_bytes(&invite.chat_id);
        w.put_bytes(group.self_keys.public().enc());

        self.groups[slot] = Some(group);
        Ok((slot as u32, w.into_bytes()))
    }

    /// Inviter side: a friend accepted. Seats them and returns the
    /// confirmation packet carrying our relays.
    pub fn handle_friend_invite_accepted(
        &mut self,
        friend_number: u32,
        data: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let mut r = Reader::new(data);
        let packet_type = r.take_u8().map_err(|_| Error::InvalidArgument("invite"))?;
        let kind = r.take_u8().map_err(|_| Error::InvalidArgument("invite"))?;
        if packet_type != GroupPacketType::FriendInvite.as_u8()
            || FriendInviteKind::from_u8(kind) != Some(FriendInviteKind::Accepted)
        {
            return Err(Error::InvalidArgument("invite"));
        }
        let chat_id: [u8; CHAT_ID_SIZE] =
            r.take_array().map_err(|_| Error::InvalidArgument("invite"))?;
        let peer_pk: [u8; ENC_PUBLIC_KEY_SIZE] =
            r.take_array().map_err(|_| Error::InvalidArgument("invite"))?;

        let relays = self.transport.connected_relays(crate::group::driver::MAX_SHARED_RELAYS);

        let group_number = self.group_by_chat_id(&chat_id).ok_or(Error::InvalidGroup)?;
        let group = self.group_mut(group_number).ok_or(Error::InvalidGroup)?;

        // Only friends we actually invited may accept
        let Some(pos) = group.saved_invites.iter().position(|&f| f == friend_number) else {
            return Err(Error::PermissionDenied);
        };
        group.saved_invites.remove(pos);

        let index = match group.peer_add(&peer_pk, None).map_err(|_| Error::SendFailed)? {
            crate::group::PeerAddOutcome::Added(i)
            | crate::group::PeerAddOutcome::AlreadyPresent(i) => i,
        };
        for relay in &relays {
            if let Some(channel) = group.peers[index].conn.tcp_channel {
                group.transport.add_channel_relay(channel, relay);
            }
            group.peers[index].conn.save_relay(*relay);
        }

        let mut w = Writer::new();
        w.put_u8(GroupPacketType::FriendInvite.as_u8());
        w.put_u8(FriendInviteKind::Confirmation as u8);
        w.put_bytes(&chat_id);
        w.put_bytes(group.self_keys.public().enc());
        TcpRelayNode::pack_list(&relays, &mut w);
        Ok(w.into_bytes())
    }

    /// Joiner side: the inviter confirmed. Connects through their relays.
    pub fn handle_friend_invite_confirmation(&mut self, data: &[u8]) -> Result<(), Error> {
        let mut r = Reader::new(data);
        let packet_type = r.take_u8().map_err(|_| Error::InvalidArgument("invite"))?;
        let kind = r.take_u8().map_err(|_| Error::InvalidArgument("invite"))?;
        if packet_type != GroupPacketType::FriendInvite.as_u8()
            || FriendInviteKind::from_u8(kind) != Some(FriendInviteKind::Confirmation)
        {
            return Err(Error::InvalidArgument("invite"));
        }
        let chat_id: [u8; CHAT_ID_SIZE] =
            r.take_array().map_err(|_| Error::InvalidArgument("invite"))?;
        let peer_pk: [u8; ENC_PUBLIC_KEY_SIZE] =
            r.take_array().map_err(|_| Error::InvalidArgument("invite"))?;
        let relays = TcpRelayNode::unpack_list(&mut r, crate::group::driver::MAX_SHARED_RELAYS)
            .map_err(|_| Error::InvalidArgument("invite"))?;

        let group_number = self.group_by_chat_id(&chat_id).ok_or(Error::InvalidGroup)?;
        let group = self.group_mut(group_number).ok_or(Error::InvalidGroup)?;
        let index = group
            .peer_index_by_enc_pk(&peer_pk)
            .ok_or(Error::InvalidPeer)?;

        for relay in &relays {
            if let Some(channel) = group.peers[index].conn.tcp_channel {
                group.transport.add_channel_relay(channel, relay);
            }
            group.peers[index].conn.save_relay(*relay);
        }

        let now = unix_time();
        group.peers[index].conn.last_ping_recv = now + crate::group::handshake::HANDSHAKE_SEND_DELAY;
        group.schedule_handshake(index, HandshakeRequestKind::InviteRequest, false, false, now);
        Ok(())
    }
}

impl Drop for GroupSession {
    fn drop(&mut self) {
        let numbers = self.group_numbers();
        for number in numbers {
            if let Some(group) = self.group_mut(number) {
                let _ = group.send_self_exit(&[]);
            }
            self.delete_group(number);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{NullAnnounce, NullTransport};

    fn session() -> GroupSession {
        GroupSession::new(Arc::new(NullTransport::default()), Arc::new(NullAnnounce))
    }

    #[test]
    fn test_new_group_initial_state() {
        let mut s = session();
        let gn = s
            .new_group(b"Test", Privacy::Private, b"founder", PeerStatus::Online)
            .unwrap();

        let group = s.group(gn).unwrap();
        assert_eq!(group.connection_state(), GroupConnectionState::Connected);
        assert_eq!(group.self_role(), Role::Founder);
        assert_eq!(group.group_name(), b"Test");
        // Creation signs version 1 and seeds sanctions credentials
        assert_eq!(group.shared_state.version, 1);
        assert_eq!(group.moderation.creds.version, 1);
        assert_eq!(group.topic.version, 1);
    }

    #[test]
    fn test_group_slots_reused() {
        let mut s = session();
        let a = s
            .new_group(b"A", Privacy::Private, b"n", PeerStatus::Online)
            .unwrap();
        let b = s
            .new_group(b"B", Privacy::Private, b"n", PeerStatus::Online)
            .unwrap();
        assert_ne!(a, b);

        s.leave_group(a, b"bye").unwrap();
        assert_eq!(s.group_count(), 1);

        let c = s
            .new_group(b"C", Privacy::Private, b"n", PeerStatus::Online)
            .unwrap();
        assert_eq!(c, a);
        assert_eq!(s.group_count(), 2);
    }

    #[test]
    fn test_join_duplicate_rejected() {
        let mut s = session();
        let keys = ExtendedKeyPair::generate();

        let gn = s
            .join_group(keys.public().chat_id(), b"", b"nick", PeerStatus::Online)
            .unwrap();
        assert!(s
            .join_group(keys.public().chat_id(), b"", b"nick", PeerStatus::Online)
            .is_err());
        assert_eq!(
            s.group(gn).unwrap().connection_state(),
            GroupConnectionState::Connecting
        );
    }

    #[test]
    fn test_friend_invite_roundtrip() {
        let mut inviter = session();
        let mut joiner = session();

        let gn = inviter
            .new_group(b"Test", Privacy::Private, b"founder", PeerStatus::Online)
            .unwrap();

        let invite_bytes = inviter.make_friend_invite(gn, 4).unwrap();
        let invite = GroupSession::parse_friend_invite(&invite_bytes).unwrap();
        assert_eq!(&invite.chat_id, inviter.group(gn).unwrap().chat_id());

        let (jn, accepted) = joiner
            .accept_friend_invite(&invite, b"", b"guest", PeerStatus::Online)
            .unwrap();
        assert_eq!(
            joiner.group(jn).unwrap().connection_state(),
            GroupConnectionState::Connecting
        );

        let confirmation = inviter.handle_friend_invite_accepted(4, &accepted).unwrap();
        // Unknown friend numbers are refused
        assert!(inviter
            .handle_friend_invite_accepted(4, &accepted)
            .is_err());

        joiner.handle_friend_invite_confirmation(&confirmation).unwrap();
        let group = joiner.group(jn).unwrap();
        let index = group
            .peer_index_by_enc_pk(&invite.inviter_enc_pk)
            .unwrap();
        assert!(group.peers[index].conn.pending_handshake.is_some());
    }

    #[test]
    fn test_unknown_packet_ignored() {
        let mut s = session();
        s.handle_relay_packet(&[0x5b, 1, 2, 3, 4, 5]);
        s.handle_oob_packet(&[0x5b, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }
}
