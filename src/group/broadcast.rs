// Application broadcasts: presence, nicks, messages, departures, and the
// moderation announcements that every member applies identically.
//
// A broadcast body is (type, timestamp, payload) wrapped as a lossless
// Broadcast packet to every confirmed peer; private messages reuse the same
// header toward a single connection.

use tracing::warn;

use crate::events::MessageKind;
use crate::packet::{
    BroadcastType, GroupPacketType, MAX_MESSAGE_SIZE, MAX_NICK_SIZE, MAX_PART_MESSAGE_SIZE,
};
use crate::time::unix_time;
use crate::wire::{Reader, Writer};
use crate::Error;

use super::{Group, GroupConnectionState, HandleError, PeerStatus, Role};

/// Broadcast body header: type byte plus the sender's wall-clock timestamp.
const BROADCAST_HEADER_SIZE: usize = 1 + 8;

impl Group {
    fn make_broadcast_body(&self, bc_type: BroadcastType, payload: &[u8]) -> Vec<u8> {
        let mut w = Writer::with_capacity(BROADCAST_HEADER_SIZE + payload.len());
        w.put_u8(bc_type.as_u8());
        w.put_u64(unix_time());
        w.put_bytes(payload);
        w.into_bytes()
    }

    /// Sends a broadcast to every confirmed peer.
    pub(crate) fn send_broadcast(&mut self, bc_type: BroadcastType, payload: &[u8]) {
        let body = self.make_broadcast_body(bc_type, payload);
        self.send_lossless_all(GroupPacketType::Broadcast, &body);
    }

    // ---- public send operations ----

    /// Sends a plain or action message to the group.
    pub fn send_message(&mut self, kind: MessageKind, message: &[u8]) -> Result<(), Error> {
        if message.is_empty() {
            return Err(Error::InvalidArgument("empty message"));
        }
        if message.len() > MAX_MESSAGE_SIZE {
            return Err(Error::InvalidArgument("message too long"));
        }
        if self.self_role() >= Role::Observer {
            return Err(Error::PermissionDenied);
        }

        let bc_type = match kind {
            MessageKind::Normal => BroadcastType::PlainMessage,
            MessageKind::Action => BroadcastType::ActionMessage,
        };
        self.send_broadcast(bc_type, message);
        Ok(())
    }

    /// Sends a private message to a single peer.
    pub fn send_private_message(&mut self, peer_id: u32, message: &[u8]) -> Result<(), Error> {
        if message.is_empty() {
            return Err(Error::InvalidArgument("empty message"));
        }
        if message.len() > MAX_MESSAGE_SIZE {
            return Err(Error::InvalidArgument("message too long"));
        }
        if self.self_role() >= Role::Observer {
            return Err(Error::PermissionDenied);
        }
        let index = self.peer_index_by_id(peer_id).ok_or(Error::InvalidPeer)?;
        if index == 0 {
            return Err(Error::InvalidPeer);
        }

        let body = self.make_broadcast_body(BroadcastType::PrivateMessage, message);
        self.send_lossless_to(index, GroupPacketType::Broadcast, &body)
    }

    /// Announces a new status for self.
    pub fn set_self_status(&mut self, status: PeerStatus) -> Result<(), Error> {
        let gn = self.group_number;
        let peer_id = self.self_peer_id();
        self.events.emit(|o| o.on_status_change(gn, peer_id, status));

        self.peers[0].info.status = status;
        self.send_broadcast(BroadcastType::Status, &[status.as_u8()]);
        Ok(())
    }

    /// Announces a new nick for self. The nick must be unused in our view.
    pub fn set_self_nick(&mut self, nick: &[u8]) -> Result<(), Error> {
        if nick.is_empty() {
            return Err(Error::InvalidArgument("empty nick"));
        }
        if nick.len() > MAX_NICK_SIZE {
            return Err(Error::InvalidArgument("nick too long"));
        }
        if self.peer_index_by_nick(nick).is_some() {
            return Err(Error::InvalidArgument("nick taken"));
        }

        let gn = self.group_number;
        let peer_id = self.self_peer_id();
        let nick_vec = nick.to_vec();
        self.events.emit(|o| o.on_nick_change(gn, peer_id, &nick_vec));

        self.peers[0].info.nick = nick_vec;
        self.send_broadcast(BroadcastType::Nick, nick);
        Ok(())
    }

    /// Broadcasts our departure with a part message.
    pub(crate) fn send_self_exit(&mut self, part_message: &[u8]) -> Result<(), Error> {
        if part_message.len() > MAX_PART_MESSAGE_SIZE {
            return Err(Error::InvalidArgument("part message too long"));
        }
        self.send_broadcast(BroadcastType::PeerExit, part_message);
        Ok(())
    }

    // ---- inbound ----

    pub(crate) fn handle_broadcast(&mut self, index: usize, body: &[u8]) -> Result<(), HandleError> {
        if body.len() < BROADCAST_HEADER_SIZE {
            return Err(HandleError::Malformed);
        }
        if self.connection_state != GroupConnectionState::Connected {
            return Err(HandleError::Policy);
        }
        if !self.peers[index].conn.is_confirmed() {
            return Err(HandleError::Policy);
        }

        let mut r = Reader::new(body);
        let raw_type = r.take_u8()?;
        let _timestamp = r.take_u64()?;
        let payload = r.take_rest().to_vec();

        let Ok(bc_type) = BroadcastType::from_u8(raw_type) else {
            warn!(raw = raw_type, "invalid broadcast type");
            return Err(HandleError::Malformed);
        };

        match bc_type {
            BroadcastType::Status => self.handle_bc_status(index, &payload),
            BroadcastType::Nick => self.handle_bc_nick(index, &payload),
            BroadcastType::PlainMessage => {
                self.handle_bc_message(index, &payload, MessageKind::Normal)
            }
            BroadcastType::ActionMessage => {
                self.handle_bc_message(index, &payload, MessageKind::Action)
            }
            BroadcastType::PrivateMessage => self.handle_bc_private_message(index, &payload),
            BroadcastType::PeerExit => self.handle_bc_peer_exit(index, &payload),
            BroadcastType::RemovePeer => self.handle_bc_remove_peer(index, &payload),
            BroadcastType::RemoveBan => self.handle_bc_remove_ban(index, &payload),
            BroadcastType::SetMod => self.handle_bc_set_mod(index, &payload),
            BroadcastType::SetObserver => self.handle_bc_set_observer(index, &payload),
        }
    }

    fn handle_bc_status(&mut self, index: usize, payload: &[u8]) -> Result<(), HandleError> {
        if payload.len() != 1 {
            return Err(HandleError::Malformed);
        }
        let status = PeerStatus::from_u8(payload[0]).ok_or(HandleError::Malformed)?;

        let gn = self.group_number;
        let peer_id = self.peers[index].info.peer_id;
        self.events.emit(|o| o.on_status_change(gn, peer_id, status));
        self.peers[index].info.status = status;
        Ok(())
    }

    fn handle_bc_nick(&mut self, index: usize, payload: &[u8]) -> Result<(), HandleError> {
        // A nick collision over broadcast is malicious by construction: the
        // sender can see the occupied nick just as well as we can
        if payload.is_empty()
            || payload.len() > MAX_NICK_SIZE
            || self.peer_index_by_nick(payload).is_some()
        {
            self.peer_delete(index, b"duplicate nick");
            return Err(HandleError::Policy);
        }

        let gn = self.group_number;
        let peer_id = self.peers[index].info.peer_id;
        let nick = payload.to_vec();
        self.events.emit(|o| o.on_nick_change(gn, peer_id, &nick));
        self.peers[index].info.nick = nick;
        Ok(())
    }

    fn handle_bc_message(
        &mut self,
        index: usize,
        payload: &[u8],
        kind: MessageKind,
    ) -> Result<(), HandleError> {
        if payload.is_empty() || payload.len() > MAX_MESSAGE_SIZE {
            return Err(HandleError::Malformed);
        }

        let info = &self.peers[index].info;
        if info.ignore || info.role >= Role::Observer {
            return Ok(());
        }

        let gn = self.group_number;
        let peer_id = info.peer_id;
        self.events.emit(|o| o.on_message(gn, peer_id, kind, payload));
        Ok(())
    }

    fn handle_bc_private_message(&mut self, index: usize, payload: &[u8]) -> Result<(), HandleError> {
        if payload.is_empty() || payload.len() > MAX_MESSAGE_SIZE {
            return Err(HandleError::Malformed);
        }

        let info = &self.peers[index].info;
        if info.ignore || info.role >= Role::Observer {
            return Ok(());
        }

        let gn = self.group_number;
        let peer_id = info.peer_id;
        self.events.emit(|o| o.on_private_message(gn, peer_id, payload));
        Ok(())
    }

    fn handle_bc_peer_exit(&mut self, index: usize, payload: &[u8]) -> Result<(), HandleError> {
        let part = &payload[..payload.len().min(MAX_PART_MESSAGE_SIZE)];
        self.peer_delete(index, part);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ExtendedKeyPair;
    use crate::events::Events;
    use crate::group::JoinKind;
    use crate::transport::testing::{NullAnnounce, NullTransport};
    use std::sync::Arc;

    fn test_group() -> Group {
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
            Role::Founder,
            JoinKind::Private,
        )
        .unwrap()
    }

    #[test]
    fn test_send_message_permission_gate() {
        let mut group = test_group();
        group.peers[0].info.role = Role::Observer;
        assert_eq!(
            group.send_message(MessageKind::Normal, b"hi"),
            Err(Error::PermissionDenied)
        );
        group.peers[0].info.role = Role::User;
        group.send_message(MessageKind::Normal, b"hi").unwrap();
    }

    #[test]
    fn test_send_message_length_gate() {
        let mut group = test_group();
        assert!(group.send_message(MessageKind::Normal, &[]).is_err());
        let long = vec![b'a'; MAX_MESSAGE_SIZE + 1];
        assert!(group.send_message(MessageKind::Normal, &long).is_err());
    }

    #[test]
    fn test_set_self_nick_rejects_taken() {
        let mut group = test_group();
        assert!(group.set_self_nick(b"alice").is_err());
        group.set_self_nick(b"alice2").unwrap();
        assert_eq!(group.self_nick(), b"alice2");
    }

    #[test]
    fn test_broadcast_body_layout() {
        let group = test_group();
        let body = group.make_broadcast_body(BroadcastType::Status, &[1]);
        assert_eq!(body.len(), BROADCAST_HEADER_SIZE + 1);
        assert_eq!(body[0], BroadcastType::Status.as_u8());
        assert_eq!(body[BROADCAST_HEADER_SIZE], 1);
    }

    #[test]
    fn test_handle_status_broadcast() {
        let mut group = test_group();
        group.connection_state = GroupConnectionState::Connected;
        group.peer_add(&[5u8; 32], None).unwrap();
        group.peers[1].conn.state = crate::group::connection::ConnState::Confirmed;
        group.peers[1].info.nick = b"bob".to_vec();

        let body = group.make_broadcast_body(BroadcastType::Status, &[PeerStatus::Busy.as_u8()]);
        group.handle_broadcast(1, &body).unwrap();
        assert_eq!(group.peers[1].info.status, PeerStatus::Busy);
    }

    #[test]
    fn test_unconfirmed_broadcast_rejected() {
        let mut group = test_group();
        group.connection_state = GroupConnectionState::Connected;
        group.peer_add(&[5u8; 32], None).unwrap();

        let body = group.make_broadcast_body(BroadcastType::Status, &[0]);
        assert_eq!(group.handle_broadcast(1, &body), Err(HandleError::Policy));
    }

    #[test]
    fn test_duplicate_nick_broadcast_deletes_sender() {
        let mut group = test_group();
        group.connection_state = GroupConnectionState::Connected;
        group.peer_add(&[5u8; 32], None).unwrap();
        group.peers[1].conn.state = crate::group::connection::ConnState::Confirmed;

        let body = group.make_broadcast_body(BroadcastType::Nick, b"alice");
        assert_eq!(group.handle_broadcast(1, &body), Err(HandleError::Policy));
        assert!(group.peer_index_by_enc_pk(&[5u8; 32]).is_none());
    }
}
