// Persisted group snapshot.
//
// The embedder owns storage; this module only defines the snapshot and its
// serialization. Key and signature material is carried as plain byte vectors
// so the serde layout stays stable. Restoring a group schedules an
// out-of-band invite handshake at every saved peer address.

use serde::{Deserialize, Serialize};

use crate::crypto::{ExtendedKeyPair, ExtendedPublicKey, SIGNATURE_SIZE};
use crate::group::connection::HandshakeRequestKind;
use crate::group::{Group, GroupConnectionState, JoinKind, PeerStatus, Privacy, Role};
use crate::session::GroupSession;
use crate::time::unix_time;
use crate::transport::TcpRelayNode;
use crate::wire::{Reader, Writer};
use crate::Error;

/// A peer we knew, with the relay it was last reachable through
/// (wire-packed, same layout as in sync payloads).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SavedPeer {
    pub enc_public_key: Vec<u8>,
    pub relay: Option<Vec<u8>>,
}

/// Everything needed to rejoin a group after a restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SavedGroup {
    pub founder_public_key: Vec<u8>,
    pub group_name: Vec<u8>,
    pub privacy: u8,
    pub max_peers: u32,
    pub password: Vec<u8>,
    pub mod_list_hash: Vec<u8>,
    pub state_version: u32,
    pub state_signature: Vec<u8>,

    pub topic: Vec<u8>,
    pub topic_sig_pk: Vec<u8>,
    pub topic_version: u32,
    pub topic_signature: Vec<u8>,

    pub chat_public_key: Vec<u8>,
    /// Founder only.
    pub chat_secret_key: Option<Vec<u8>>,
    pub self_secret_key: Vec<u8>,

    pub self_nick: Vec<u8>,
    pub self_role: u8,
    pub self_status: u8,

    pub mod_list: Vec<Vec<u8>>,
    pub peers: Vec<SavedPeer>,
}

impl SavedGroup {
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        bincode::serialize(self).map_err(|_| Error::Internal("snapshot serialization"))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        bincode::deserialize(bytes).map_err(|_| Error::InvalidArgument("snapshot bytes"))
    }
}

fn pack_relay(relay: &TcpRelayNode) -> Vec<u8> {
    let mut w = Writer::new();
    relay.pack(&mut w);
    w.into_bytes()
}

fn unpack_relay(bytes: &[u8]) -> Option<TcpRelayNode> {
    let mut r = Reader::new(bytes);
    TcpRelayNode::unpack(&mut r).ok()
}

impl GroupSession {
    /// Snapshots a group for persistence.
    pub fn save_group(&self, group_number: u32) -> Result<SavedGroup, Error> {
        let group = self.group(group_number).ok_or(Error::InvalidGroup)?;

        let mut peers = Vec::new();
        for peer in group.peers.iter().skip(1) {
            if !peer.conn.is_confirmed()
                && group.connection_state() == GroupConnectionState::Connected
            {
                continue;
            }
            peers.push(SavedPeer {
                enc_public_key: peer.conn.public_key.enc().to_vec(),
                relay: peer.conn.last_relay().map(|r| pack_relay(&r)),
            });
        }

        Ok(SavedGroup {
            founder_public_key: group.shared_state.founder_public_key.to_bytes().to_vec(),
            group_name: group.shared_state.group_name.clone(),
            privacy: group.shared_state.privacy.as_u8(),
            max_peers: group.shared_state.max_peers,
            password: group.shared_state.password.clone(),
            mod_list_hash: group.shared_state.mod_list_hash.to_vec(),
            state_version: group.shared_state.version,
            state_signature: group.shared_state_sig.to_vec(),
            topic: group.topic.topic.clone(),
            topic_sig_pk: group.topic.public_sig_key.to_vec(),
            topic_version: group.topic.version,
            topic_signature: group.topic_sig.to_vec(),
            chat_public_key: group.chat_public_key.to_bytes().to_vec(),
            chat_secret_key: group
                .chat_keys
                .as_ref()
                .map(|k| k.secret_bytes().to_vec()),
            self_secret_key: group.self_keys.secret_bytes().to_vec(),
            self_nick: group.peers[0].info.nick.clone(),
            self_role: group.peers[0].info.role.as_u8(),
            self_status: group.peers[0].info.status.as_u8(),
            mod_list: group
                .moderation
                .mod_list
                .iter()
                .map(|k| k.to_vec())
                .collect(),
            peers,
        })
    }

    /// Restores a saved group and begins reconnecting to its peers.
    pub fn restore_group(&mut self, saved: &SavedGroup) -> Result<u32, Error> {
        let chat_bytes: [u8; 64] = saved
            .chat_public_key
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidArgument("chat key"))?;
        let chat_public = ExtendedPublicKey::from_bytes(&chat_bytes);

        if self.group_by_chat_id(chat_public.chat_id()).is_some() {
            return Err(Error::InvalidArgument("group already joined"));
        }

        let self_keys = ExtendedKeyPair::from_secret_bytes(&saved.self_secret_key)
            .map_err(|_| Error::InvalidArgument("self key"))?;
        let chat_keys = match &saved.chat_secret_key {
            Some(bytes) => Some(
                ExtendedKeyPair::from_secret_bytes(bytes)
                    .map_err(|_| Error::InvalidArgument("chat key"))?,
            ),
            None => None,
        };

        let role = Role::from_u8(saved.self_role).ok_or(Error::InvalidArgument("role"))?;
        let status = PeerStatus::from_u8(saved.self_status).unwrap_or(PeerStatus::Online);
        let privacy = Privacy::from_u8(saved.privacy).ok_or(Error::InvalidArgument("privacy"))?;

        let slot = self.alloc_slot();

        let mut group = Group::new(
            slot as u32,
            self.transport_handle(),
            self.announce_handle(),
            self.events_handle(),
            self_keys,
            chat_public,
            chat_keys,
            saved.self_nick.clone(),
            status,
            role,
            JoinKind::Private,
        )?;

        let founder_bytes: [u8; 64] = saved
            .founder_public_key
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidArgument("founder key"))?;
        group.shared_state.founder_public_key = ExtendedPublicKey::from_bytes(&founder_bytes);
        group.shared_state.group_name = saved.group_name.clone();
        group.shared_state.privacy = privacy;
        group.shared_state.max_peers = saved.max_peers;
        group.shared_state.password = saved.password.clone();
        group.shared_state.mod_list_hash = saved
            .mod_list_hash
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidArgument("mod list hash"))?;
        group.shared_state.version = saved.state_version;
        group.shared_state_sig = to_sig(&saved.state_signature)?;

        group.topic.topic = saved.topic.clone();
        group.topic.public_sig_key = saved
            .topic_sig_pk
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidArgument("topic key"))?;
        group.topic.version = saved.topic_version;
        group.topic_sig = to_sig(&saved.topic_signature)?;

        for key in &saved.mod_list {
            let key: [u8; 32] = key
                .as_slice()
                .try_into()
                .map_err(|_| Error::InvalidArgument("mod key"))?;
            group
                .moderation
                .add_mod(key)
                .map_err(|_| Error::InvalidArgument("mod list"))?;
        }

        if role == Role::Founder {
            let keys = group.self_keys.clone();
            group.moderation.make_creds(&keys);
        }

        group.connection_state = GroupConnectionState::Connecting;
        group.last_join_attempt = unix_time();

        let now = unix_time();
        for saved_peer in &saved.peers {
            let Ok(pk) = <[u8; 32]>::try_from(saved_peer.enc_public_key.as_slice()) else {
                continue;
            };
            let index = match group.peer_add(&pk, None) {
                Ok(crate::group::PeerAddOutcome::Added(i)) => i,
                _ => continue,
            };

            let relay = saved_peer.relay.as_deref().and_then(unpack_relay);
            if let Some(relay) = relay {
                if let Some(channel) = group.peers[index].conn.tcp_channel {
                    group.transport.add_channel_relay(channel, &relay);
                }
                let conn = &mut group.peers[index].conn;
                conn.save_relay(relay);
                conn.oob_relay_pk = Some(relay.public_key);
            }

            let via_oob = group.peers[index].conn.oob_relay_pk.is_some();
            group.peers[index].conn.last_ping_recv =
                now + crate::group::handshake::HANDSHAKE_SEND_DELAY;
            group.schedule_handshake(index, HandshakeRequestKind::InviteRequest, false, via_oob, now);
        }

        if group.is_public() {
            self.announce_handle().announce(group.chat_public_key.chat_id());
        }

        Ok(self.install_group(slot, group))
    }
}

fn to_sig(bytes: &[u8]) -> Result<[u8; SIGNATURE_SIZE], Error> {
    bytes
        .try_into()
        .map_err(|_| Error::InvalidArgument("signature"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{NullAnnounce, NullTransport};
    use std::sync::Arc;

    fn session() -> GroupSession {
        GroupSession::new(Arc::new(NullTransport::default()), Arc::new(NullAnnounce))
    }

    #[test]
    fn test_snapshot_roundtrip_bincode() {
        let mut s = session();
        let gn = s
            .new_group(b"Persist", Privacy::Private, b"founder", PeerStatus::Online)
            .unwrap();

        let saved = s.save_group(gn).unwrap();
        let bytes = saved.to_bytes().unwrap();
        let restored = SavedGroup::from_bytes(&bytes).unwrap();
        assert_eq!(saved, restored);
    }

    #[test]
    fn test_restore_founder_group() {
        let mut s = session();
        let gn = s
            .new_group(b"Persist", Privacy::Private, b"founder", PeerStatus::Online)
            .unwrap();
        let chat_id = *s.group(gn).unwrap().chat_id();
        let version = s.group(gn).unwrap().shared_state.version;

        let saved = s.save_group(gn).unwrap();
        s.leave_group(gn, b"").unwrap();

        let restored = s.restore_group(&saved).unwrap();
        let group = s.group(restored).unwrap();
        assert_eq!(group.chat_id(), &chat_id);
        assert_eq!(group.self_role(), Role::Founder);
        assert_eq!(group.shared_state.version, version);
        assert_eq!(group.self_nick(), b"founder");
        assert_eq!(
            group.connection_state(),
            GroupConnectionState::Connecting
        );
        // The founder can still mutate state after a restore
        assert!(group.chat_keys.is_some());
    }

    #[test]
    fn test_restore_rejects_duplicate() {
        let mut s = session();
        let gn = s
            .new_group(b"Persist", Privacy::Private, b"founder", PeerStatus::Online)
            .unwrap();
        let saved = s.save_group(gn).unwrap();
        assert!(s.restore_group(&saved).is_err());
    }

    #[test]
    fn test_restore_schedules_peer_handshakes() {
        let mut s = session();
        let gn = s
            .new_group(b"Persist", Privacy::Private, b"founder", PeerStatus::Online)
            .unwrap();
        {
            let group = s.group_mut(gn).unwrap();
            group.peer_add(&[9u8; 32], None).unwrap();
            // Unconfirmed peers are saved while the group is connecting
            group.connection_state = GroupConnectionState::Connecting;
        }

        let saved = s.save_group(gn).unwrap();
        assert_eq!(saved.peers.len(), 1);

        s.leave_group(gn, b"").unwrap();
        let restored = s.restore_group(&saved).unwrap();
        let group = s.group(restored).unwrap();
        let index = group.peer_index_by_enc_pk(&[9u8; 32]).unwrap();
        assert!(group.peers[index].conn.pending_handshake.is_some());
    }
}
