// Join and state synchronization: invite requests, the ordered sync
// response, peer announcements, and the peer-info exchange that confirms a
// connection.
//
// The responder's emission order (shared state → mod list → sanctions →
// topic → peer list) is what lets the joiner validate each piece against the
// one before it; per-peer lossless delivery preserves it.

use tracing::{debug, warn};

use crate::crypto::ENC_PUBLIC_KEY_SIZE;
use crate::packet::{GroupPacketType, RejectReason, MAX_NICK_SIZE, MAX_PASSWORD_SIZE};
use crate::time::unix_time;
use crate::transport::TcpRelayNode;
use crate::wire::{Reader, Writer};
use crate::Error;

use super::connection::{ConnState, HandshakeRequestKind};
use super::moderation::Moderation;
use super::{Group, GroupConnectionState, HandleError, PeerAddOutcome, PeerInfo, MAX_GROUP_PEERS, PACKED_PEER_INFO_SIZE};

impl Group {
    // ---- invite flow ----

    /// Asks the peer to admit us, carrying our nick and the group password.
    pub(crate) fn send_invite_request(&mut self, index: usize) -> Result<(), Error> {
        let nick = self.peers[0].info.nick.clone();
        let password = self.shared_state.password.clone();

        let mut w = Writer::with_capacity(2 + nick.len() + MAX_PASSWORD_SIZE);
        w.put_u16(nick.len() as u16);
        w.put_bytes(&nick);
        w.put_padded(&password, MAX_PASSWORD_SIZE);

        self.send_lossless_to(index, GroupPacketType::InviteRequest, &w.into_bytes())
    }

    pub(crate) fn handle_invite_request(
        &mut self,
        index: usize,
        body: &[u8],
    ) -> Result<(), HandleError> {
        if self.connection_state != GroupConnectionState::Connected
            || self.shared_state.version == 0
        {
            return Err(HandleError::Policy);
        }

        let reason = 'check: {
            if self.shared_state.max_peers != 0
                && self.confirmed_count() >= self.shared_state.max_peers
            {
                break 'check Some(RejectReason::GroupFull);
            }

            let mut r = Reader::new(body);
            let Ok(nick_len) = r.take_u16() else {
                break 'check Some(RejectReason::InviteFailed);
            };
            let nick_len = nick_len as usize;
            if nick_len == 0 || nick_len > MAX_NICK_SIZE {
                break 'check Some(RejectReason::InviteFailed);
            }
            let Ok(nick) = r.take_bytes(nick_len) else {
                break 'check Some(RejectReason::InviteFailed);
            };

            // A duplicate invite from the peer itself is idempotent
            if let Some(holder) = self.peer_index_by_nick(nick) {
                if holder != index {
                    break 'check Some(RejectReason::NickTaken);
                }
            }

            let Ok(password) = r.take_bytes(MAX_PASSWORD_SIZE) else {
                break 'check Some(RejectReason::InviteFailed);
            };
            if !self.shared_state.password_matches(password) {
                break 'check Some(RejectReason::InvalidPassword);
            }

            None
        };

        if let Some(reason) = reason {
            debug!(group = self.group_number, ?reason, "invite rejected");
            let _ = self.send_invite_response_reject(index, reason);
            self.peer_delete(index, b"");
            return Err(HandleError::Policy);
        }

        self.send_lossless_to(index, GroupPacketType::InviteResponse, &[])
            .map_err(|_| HandleError::Send)
    }

    pub(crate) fn handle_invite_response(&mut self, index: usize) -> Result<(), HandleError> {
        self.send_sync_request(index).map_err(|_| HandleError::Send)
    }

    fn send_invite_response_reject(
        &mut self,
        index: usize,
        reason: RejectReason,
    ) -> Result<(), Error> {
        self.send_lossy_to(
            index,
            GroupPacketType::InviteResponseReject,
            &[reason.as_u8()],
        )
    }

    pub(crate) fn handle_invite_response_reject(&mut self, body: &[u8]) -> Result<(), HandleError> {
        if body.len() != 1 {
            return Err(HandleError::Malformed);
        }
        if self.connection_state == GroupConnectionState::Connected {
            return Ok(());
        }

        let reason = RejectReason::from_u8(body[0]);
        self.connection_state = GroupConnectionState::Failed;

        let gn = self.group_number;
        self.events.emit(|o| o.on_rejected(gn, reason));
        Ok(())
    }

    // ---- sync ----

    /// Requests a full state sync from the peer. At most one outstanding
    /// request per connection.
    pub(crate) fn send_sync_request(&mut self, index: usize) -> Result<(), Error> {
        if self.peers[index].conn.pending_sync_request {
            return Ok(());
        }
        self.peers[index].conn.pending_sync_request = true;

        let password = self.shared_state.password.clone();
        let mut w = Writer::with_capacity(4 + MAX_PASSWORD_SIZE);
        w.put_u32(0);
        w.put_padded(&password, MAX_PASSWORD_SIZE);

        let result = self.send_lossless_to(index, GroupPacketType::SyncRequest, &w.into_bytes());
        if result.is_err() {
            self.peers[index].conn.pending_sync_request = false;
        }
        result
    }

    pub(crate) fn handle_sync_request(
        &mut self,
        index: usize,
        body: &[u8],
    ) -> Result<(), HandleError> {
        if body.len() != 4 + MAX_PASSWORD_SIZE {
            return Err(HandleError::Malformed);
        }
        if self.connection_state != GroupConnectionState::Connected
            || self.shared_state.version == 0
        {
            return Err(HandleError::Policy);
        }

        let mut r = Reader::new(body);
        let _num_peers = r.take_u32()?;
        let password = r.take_bytes(MAX_PASSWORD_SIZE)?;
        if !self.shared_state.password_matches(password) {
            return Err(HandleError::Auth);
        }

        // State first, strictly in this order; the peer list follows
        self.send_shared_state_to(index).map_err(|_| HandleError::Send)?;
        self.send_mod_list_to(index).map_err(|_| HandleError::Send)?;
        self.send_sanctions_to(index).map_err(|_| HandleError::Send)?;
        self.send_topic_to(index).map_err(|_| HandleError::Send)?;

        // Announce the joiner to everyone else, with its relay hint
        let joiner_pk = *self.peers[index].conn.public_key.enc();
        let joiner_relay = self.peers[index].conn.last_relay();
        let mut announce = Writer::new();
        announce.put_bytes(&joiner_pk);
        pack_optional_relay(&mut announce, joiner_relay);
        let announce_body = announce.into_bytes();

        let mut others: Vec<usize> = Vec::new();
        for i in 1..self.peers.len() {
            if i != index && self.peers[i].conn.is_confirmed() {
                others.push(i);
            }
        }
        for &i in &others {
            let _ = self.send_lossless_to(i, GroupPacketType::PeerAnnounce, &announce_body);
        }

        // Response: every confirmed peer except self and the joiner
        let mut w = Writer::new();
        w.put_u32(others.len() as u32);
        for &i in &others {
            let pk = *self.peers[i].conn.public_key.enc();
            let relay = self.peers[i].conn.last_relay();
            w.put_bytes(&pk);
            pack_optional_relay(&mut w, relay);
        }

        debug!(group = self.group_number, peers = others.len(), "sync response sent");
        self.send_lossless_to(index, GroupPacketType::SyncResponse, &w.into_bytes())
            .map_err(|_| HandleError::Send)
    }

    pub(crate) fn handle_sync_response(
        &mut self,
        index: usize,
        body: &[u8],
    ) -> Result<(), HandleError> {
        if !self.peers[index].conn.pending_sync_request {
            return Ok(());
        }
        self.peers[index].conn.pending_sync_request = false;

        let mut r = Reader::new(body);
        let num_peers = r.take_u32()?;
        if num_peers > MAX_GROUP_PEERS {
            return Err(HandleError::Malformed);
        }

        let now = unix_time();
        let self_pk = *self.self_keys.public().enc();

        for _ in 0..num_peers {
            let pk: [u8; ENC_PUBLIC_KEY_SIZE] = r.take_array()?;
            let relay = unpack_optional_relay(&mut r)?;

            if pk == self_pk {
                continue;
            }

            let new_index = match self.peer_add(&pk, None) {
                Ok(PeerAddOutcome::Added(i)) => i,
                Ok(PeerAddOutcome::AlreadyPresent(i)) => {
                    if let Some(relay) = relay {
                        self.peers[i].conn.save_relay(relay);
                    }
                    continue;
                }
                Err(_) => continue,
            };

            if let Some(relay) = relay {
                if let Some(channel) = self.peers[new_index].conn.tcp_channel {
                    self.transport.add_channel_relay(channel, &relay);
                }
                self.peers[new_index].conn.save_relay(relay);
            }

            self.schedule_handshake(
                new_index,
                HandshakeRequestKind::PeerInfoExchange,
                false,
                false,
                now,
            );
        }

        self.connection_state = GroupConnectionState::Connected;
        self.send_peer_exchange(index).map_err(|_| HandleError::Send)?;

        let gn = self.group_number;
        self.events.emit(|o| o.on_self_join(gn));
        debug!(group = self.group_number, "sync complete, connected");
        Ok(())
    }

    // ---- peer announcements ----

    pub(crate) fn handle_peer_announce(&mut self, _index: usize, body: &[u8]) -> Result<(), HandleError> {
        let mut r = Reader::new(body);
        let pk: [u8; ENC_PUBLIC_KEY_SIZE] = r.take_array()?;
        let relay = unpack_optional_relay(&mut r)?;

        if pk == *self.self_keys.public().enc() {
            return Ok(());
        }

        let new_index = match self.peer_add(&pk, None) {
            Ok(PeerAddOutcome::Added(i)) => i,
            Ok(PeerAddOutcome::AlreadyPresent(_)) => return Ok(()),
            Err(_) => return Err(HandleError::Policy),
        };

        if let Some(relay) = relay {
            if let Some(channel) = self.peers[new_index].conn.tcp_channel {
                self.transport.add_channel_relay(channel, &relay);
            }
            self.peers[new_index].conn.save_relay(relay);
        }

        let now = unix_time();
        self.schedule_handshake(
            new_index,
            HandshakeRequestKind::PeerInfoExchange,
            false,
            false,
            now,
        );
        Ok(())
    }

    // ---- peer info exchange ----

    /// Mutual introduction: our info to them, a request for theirs.
    pub(crate) fn send_peer_exchange(&mut self, index: usize) -> Result<(), Error> {
        self.send_self_to_peer(index)?;
        self.send_lossless_to(index, GroupPacketType::PeerInfoRequest, &[])
    }

    pub(crate) fn send_self_to_peer(&mut self, index: usize) -> Result<(), Error> {
        let password = self.shared_state.password.clone();
        let mut w = Writer::with_capacity(MAX_PASSWORD_SIZE + PACKED_PEER_INFO_SIZE);
        w.put_padded(&password, MAX_PASSWORD_SIZE);
        self.peers[0].info.pack(&mut w);
        self.send_lossless_to(index, GroupPacketType::PeerInfoResponse, &w.into_bytes())
    }

    pub(crate) fn handle_peer_info_request(&mut self, index: usize) -> Result<(), HandleError> {
        if !self.peers[index].conn.is_confirmed()
            && self.shared_state.max_peers != 0
            && self.confirmed_count() >= self.shared_state.max_peers
        {
            return Err(HandleError::Policy);
        }
        self.send_self_to_peer(index).map_err(|_| HandleError::Send)
    }

    pub(crate) fn handle_peer_info_response(
        &mut self,
        index: usize,
        body: &[u8],
    ) -> Result<(), HandleError> {
        if body.len() < MAX_PASSWORD_SIZE + PACKED_PEER_INFO_SIZE {
            return Err(HandleError::Malformed);
        }
        if self.connection_state != GroupConnectionState::Connected {
            return Err(HandleError::Policy);
        }

        let was_confirmed = self.peers[index].conn.is_confirmed();
        if !was_confirmed
            && self.shared_state.max_peers != 0
            && self.confirmed_count() >= self.shared_state.max_peers
        {
            return Err(HandleError::Policy);
        }

        let mut r = Reader::new(body);
        let password = r.take_bytes(MAX_PASSWORD_SIZE)?;
        if !self.shared_state.password_matches(password) {
            return Err(HandleError::Auth);
        }

        let info = PeerInfo::unpack(&mut r)?;
        self.peer_update(index, info)?;

        if !self.validate_peer_role(index) {
            warn!(group = self.group_number, index, "peer failed role validation");
            self.peer_delete(index, b"");
            return Err(HandleError::Policy);
        }

        if !was_confirmed {
            let peer_id = self.peers[index].info.peer_id;
            let gn = self.group_number;
            self.events.emit(|o| o.on_peer_join(gn, peer_id));
        }
        self.peers[index].conn.state = ConnState::Confirmed;

        Ok(())
    }

    // ---- state replication payloads used during sync ----

    pub(crate) fn send_mod_list_to(&mut self, index: usize) -> Result<(), Error> {
        let mut w = Writer::new();
        self.moderation.pack_mod_list(&mut w);
        self.send_lossless_to(index, GroupPacketType::ModList, &w.into_bytes())
    }

    pub(crate) fn broadcast_mod_list(&mut self) {
        let mut w = Writer::new();
        self.moderation.pack_mod_list(&mut w);
        self.send_lossless_all(GroupPacketType::ModList, &w.into_bytes());
    }

    pub(crate) fn handle_mod_list(&mut self, index: usize, body: &[u8]) -> Result<(), HandleError> {
        // The founder's own list is the source of truth
        if self.peers[0].info.role == super::Role::Founder {
            return Ok(());
        }

        let Ok(list) = Moderation::unpack_mod_list(body) else {
            self.bad_state_recovery(index, b"BAD MOD LIST");
            return Err(HandleError::Malformed);
        };

        let candidate = Moderation {
            mod_list: list,
            sanctions: Vec::new(),
            creds: Default::default(),
        };
        if candidate.mod_list_hash() != self.shared_state.mod_list_hash {
            warn!(group = self.group_number, "mod list does not match shared state hash");
            self.bad_state_recovery(index, b"BAD MOD LIST");
            return Err(HandleError::Auth);
        }

        self.moderation.mod_list = candidate.mod_list;

        // Our own role may have changed out from under us
        if !self.validate_peer_role(0) {
            self.peers[0].info.role = super::Role::User;
        }
        Ok(())
    }

    pub(crate) fn send_sanctions_to(&mut self, index: usize) -> Result<(), Error> {
        let mut w = Writer::new();
        w.put_u32(self.moderation.sanctions.len() as u32);
        Moderation::pack_sanctions(&self.moderation.sanctions, Some(&self.moderation.creds), &mut w);
        self.send_lossless_to(index, GroupPacketType::SanctionsList, &w.into_bytes())
    }

    pub(crate) fn broadcast_sanctions(&mut self) {
        let mut w = Writer::new();
        w.put_u32(self.moderation.sanctions.len() as u32);
        Moderation::pack_sanctions(&self.moderation.sanctions, Some(&self.moderation.creds), &mut w);
        self.send_lossless_all(GroupPacketType::SanctionsList, &w.into_bytes());
    }

    pub(crate) fn handle_sanctions_list(
        &mut self,
        index: usize,
        body: &[u8],
    ) -> Result<(), HandleError> {
        let parse = (|| -> Result<_, HandleError> {
            let mut r = Reader::new(body);
            let count = r.take_u32()? as usize;
            let (sanctions, creds) = Moderation::unpack_sanctions(r.take_rest(), count)
                .map_err(|_| HandleError::Malformed)?;
            Ok((sanctions, creds))
        })();

        let installed = parse.and_then(|(sanctions, creds)| {
            self.moderation
                .check_integrity(
                    self.shared_state.founder_public_key.sig(),
                    &sanctions,
                    &creds,
                )
                .map_err(|_| HandleError::Auth)?;
            self.moderation.sanctions = sanctions;
            self.moderation.creds = creds;
            Ok(())
        });

        if let Err(err) = installed {
            // An already-valid list stays; otherwise this peer misled us
            if self.moderation.creds.version > 0 {
                return Ok(());
            }
            warn!(group = self.group_number, "sanctions list rejected");
            self.bad_state_recovery(index, b"BAD SANCTIONS");
            return Err(err);
        }

        // Our observer role could not be verified before this sync
        if self.peers[0].info.role == super::Role::Observer
            && !self.moderation.is_observer(self.self_keys.public().enc())
        {
            self.peers[0].info.role = super::Role::User;
        }

        Ok(())
    }
}

fn pack_optional_relay(w: &mut Writer, relay: Option<TcpRelayNode>) {
    match relay {
        Some(node) => {
            w.put_u8(1);
            node.pack(w);
        }
        None => w.put_u8(0),
    }
}

fn unpack_optional_relay(r: &mut Reader<'_>) -> Result<Option<TcpRelayNode>, HandleError> {
    match r.take_u8()? {
        0 => Ok(None),
        1 => Ok(Some(TcpRelayNode::unpack(r).map_err(HandleError::from)?)),
        _ => Err(HandleError::Malformed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_relay_roundtrip() {
        use std::net::{IpAddr, Ipv4Addr};

        let node = TcpRelayNode {
            addr: crate::transport::IpPort::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)), 443),
            public_key: [4u8; 32],
        };

        let mut w = Writer::new();
        pack_optional_relay(&mut w, Some(node));
        pack_optional_relay(&mut w, None);
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        assert_eq!(unpack_optional_relay(&mut r).unwrap(), Some(node));
        assert_eq!(unpack_optional_relay(&mut r).unwrap(), None);
        r.finish().unwrap();
    }

    #[test]
    fn test_optional_relay_bad_tag_rejected() {
        let bytes = [7u8];
        let mut r = Reader::new(&bytes);
        assert_eq!(
            unpack_optional_relay(&mut r),
            Err(HandleError::Malformed)
        );
    }
}
