// Founder-signed shared state.
//
// Only the founder mutates it: every mutation bumps the version, re-signs
// the packed bytes with the chat signing key, and re-broadcasts. Receivers
// verify against the chat's public signature key (which every member holds
// by construction), ignore stale versions, and treat bad signatures or
// structural violations as malice.

use tracing::{debug, warn};

use crate::crypto::{ExtendedPublicKey, EXT_PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
use crate::packet::{GroupPacketType, MAX_GROUP_NAME_SIZE, MAX_PASSWORD_SIZE};
use crate::wire::{Reader, WireError, Writer};
use crate::Error;

use super::{Group, GroupConnectionState, HandleError, Privacy, Role, MAX_GROUP_PEERS};

/// Packed size of the shared state.
pub const PACKED_SHARED_STATE_SIZE: usize =
    EXT_PUBLIC_KEY_SIZE + 4 + 2 + MAX_GROUP_NAME_SIZE + 1 + 2 + MAX_PASSWORD_SIZE + 32 + 4;

/// The group-wide configuration record, authoritative only when signed by
/// the founder's chat key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedState {
    pub founder_public_key: ExtendedPublicKey,
    pub max_peers: u32,
    pub group_name: Vec<u8>,
    pub privacy: Privacy,
    pub password: Vec<u8>,
    pub mod_list_hash: [u8; 32],
    pub version: u32,
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            founder_public_key: ExtendedPublicKey::new([0u8; 32], [0u8; 32]),
            max_peers: 0,
            group_name: Vec::new(),
            privacy: Privacy::Private,
            password: Vec::new(),
            mod_list_hash: [0u8; 32],
            version: 0,
        }
    }
}

impl SharedState {
    pub fn pack(&self, w: &mut Writer) {
        w.put_bytes(&self.founder_public_key.to_bytes());
        w.put_u32(self.max_peers);
        w.put_u16(self.group_name.len() as u16);
        w.put_padded(&self.group_name, MAX_GROUP_NAME_SIZE);
        w.put_u8(self.privacy.as_u8());
        w.put_u16(self.password.len() as u16);
        w.put_padded(&self.password, MAX_PASSWORD_SIZE);
        w.put_bytes(&self.mod_list_hash);
        w.put_u32(self.version);
    }

    pub fn packed(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(PACKED_SHARED_STATE_SIZE);
        self.pack(&mut w);
        w.into_bytes()
    }

    pub fn unpack(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let founder_bytes: [u8; EXT_PUBLIC_KEY_SIZE] = r.take_array()?;
        let max_peers = r.take_u32()?;
        let name_len = (r.take_u16()? as usize).min(MAX_GROUP_NAME_SIZE);
        let name_field = r.take_bytes(MAX_GROUP_NAME_SIZE)?;
        let privacy =
            Privacy::from_u8(r.take_u8()?).ok_or(WireError::FieldOutOfBounds("privacy"))?;
        let password_len = (r.take_u16()? as usize).min(MAX_PASSWORD_SIZE);
        let password_field = r.take_bytes(MAX_PASSWORD_SIZE)?;
        let mod_list_hash: [u8; 32] = r.take_array()?;
        let version = r.take_u32()?;

        Ok(Self {
            founder_public_key: ExtendedPublicKey::from_bytes(&founder_bytes),
            max_peers,
            group_name: name_field[..name_len].to_vec(),
            privacy,
            password: password_field[..password_len].to_vec(),
            mod_list_hash,
            version,
        })
    }

    /// Structural constraints every accepted state must satisfy.
    pub fn validate(&self) -> bool {
        self.max_peers <= MAX_GROUP_PEERS
            && !self.group_name.is_empty()
            && self.group_name.len() <= MAX_GROUP_NAME_SIZE
            && self.password.len() <= MAX_PASSWORD_SIZE
    }

    /// True when the supplied password matches ours.
    pub(crate) fn password_matches(&self, supplied: &[u8]) -> bool {
        if self.password.is_empty() {
            return true;
        }
        supplied.len() >= self.password.len()
            && &supplied[..self.password.len()] == self.password.as_slice()
    }
}

impl Group {
    /// Bumps the version and re-signs the shared state with the chat signing
    /// key. Founder only.
    pub(crate) fn sign_shared_state(&mut self) -> Result<(), Error> {
        if self.peers[0].info.role != Role::Founder {
            return Err(Error::PermissionDenied);
        }
        let chat_keys = self.chat_keys.as_ref().ok_or(Error::PermissionDenied)?;

        if self.shared_state.version != u32::MAX {
            self.shared_state.version += 1;
        }
        self.shared_state_sig = chat_keys.sign(&self.shared_state.packed());
        Ok(())
    }

    /// `[signature ‖ packed state]`, the body of a SharedState packet.
    pub(crate) fn make_shared_state_body(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(SIGNATURE_SIZE + PACKED_SHARED_STATE_SIZE);
        w.put_bytes(&self.shared_state_sig);
        w.put_bytes(&self.shared_state.packed());
        w.into_bytes()
    }

    pub(crate) fn send_shared_state_to(&mut self, index: usize) -> Result<(), Error> {
        if self.shared_state.version == 0 {
            return Err(Error::NotConnected);
        }
        let body = self.make_shared_state_body();
        self.send_lossless_to(index, GroupPacketType::SharedState, &body)
    }

    pub(crate) fn broadcast_shared_state(&mut self) {
        let body = self.make_shared_state_body();
        self.send_lossless_all(GroupPacketType::SharedState, &body);
    }

    /// Shared recovery for rejected replicated state: the sender loses its
    /// seat, and we either re-sync from another peer or, with no baseline to
    /// stand on, fall back to Disconnected.
    pub(crate) fn bad_state_recovery(&mut self, index: usize, reason: &[u8]) {
        self.peer_delete(index, reason);

        if self.shared_state.version == 0 {
            self.connection_state = GroupConnectionState::Disconnected;
            return;
        }
        if self.peers.len() > 1 {
            let _ = self.send_sync_request(1);
        }
    }

    pub(crate) fn handle_shared_state(
        &mut self,
        index: usize,
        body: &[u8],
    ) -> Result<(), HandleError> {
        if body.len() != SIGNATURE_SIZE + PACKED_SHARED_STATE_SIZE {
            self.bad_state_recovery(index, b"BAD SHARED STATE");
            return Err(HandleError::Malformed);
        }

        let mut r = Reader::new(body);
        let signature: [u8; SIGNATURE_SIZE] = r.take_array()?;
        let packed = r.take_rest();

        if self
            .chat_public_key
            .verify(packed, &signature)
            .is_err()
        {
            warn!(group = self.group_number, "shared state signature invalid");
            self.bad_state_recovery(index, b"BAD SHARED STATE");
            return Err(HandleError::Auth);
        }

        let mut pr = Reader::new(packed);
        let new_state = SharedState::unpack(&mut pr)?;

        // Stale versions are ignored; an equal version supersedes, since the
        // signature already proved it authentic.
        if new_state.version < self.shared_state.version {
            return Ok(());
        }

        if !new_state.validate() {
            warn!(group = self.group_number, "shared state failed validation");
            self.bad_state_recovery(index, b"BAD SHARED STATE");
            return Err(HandleError::Policy);
        }

        let old_state = std::mem::replace(&mut self.shared_state, new_state);
        self.shared_state_sig = signature;
        self.apply_shared_state_changes(&old_state);

        Ok(())
    }

    /// Fires change callbacks and maintains the DHT announce registration
    /// after an accepted shared-state update.
    pub(crate) fn apply_shared_state_changes(&mut self, old: &SharedState) {
        let gn = self.group_number;

        if self.shared_state.max_peers != old.max_peers {
            let limit = self.shared_state.max_peers;
            self.events.emit(|o| o.on_peer_limit(gn, limit));
        }

        if self.shared_state.privacy != old.privacy {
            let privacy = self.shared_state.privacy;
            self.events.emit(|o| o.on_privacy_state(gn, privacy));

            match privacy {
                Privacy::Public => self.announce.announce(self.chat_public_key.chat_id()),
                Privacy::Private => self.announce.retract(self.chat_public_key.chat_id()),
            }
        }

        if self.shared_state.password != old.password {
            let password = self.shared_state.password.clone();
            self.events.emit(|o| o.on_password(gn, &password));
        }
    }

    // ---- founder mutations ----

    fn founder_mutate<F>(&mut self, mutate: F) -> Result<(), Error>
    where
        F: FnOnce(&mut SharedState),
    {
        if self.peers[0].info.role != Role::Founder {
            return Err(Error::PermissionDenied);
        }

        let old_state = self.shared_state.clone();
        let old_sig = self.shared_state_sig;

        mutate(&mut self.shared_state);

        if let Err(err) = self.sign_shared_state() {
            self.shared_state = old_state;
            self.shared_state_sig = old_sig;
            return Err(err);
        }

        self.apply_shared_state_changes(&old_state);
        self.broadcast_shared_state();
        Ok(())
    }

    /// Sets or clears the group password and distributes the new state.
    pub fn founder_set_password(&mut self, password: &[u8]) -> Result<(), Error> {
        if password.len() > MAX_PASSWORD_SIZE {
            return Err(Error::InvalidArgument("password too long"));
        }
        let password = password.to_vec();
        self.founder_mutate(|state| state.password = password)
    }

    /// Flips the privacy state; the announce registration follows.
    pub fn founder_set_privacy(&mut self, privacy: Privacy) -> Result<(), Error> {
        if self.shared_state.privacy == privacy {
            return Ok(());
        }
        self.founder_mutate(|state| state.privacy = privacy)
    }

    /// Sets the peer limit, clamped to the hard table ceiling.
    pub fn founder_set_peer_limit(&mut self, max_peers: u32) -> Result<(), Error> {
        let max_peers = max_peers.min(MAX_GROUP_PEERS);
        if max_peers == self.shared_state.max_peers {
            return Ok(());
        }
        self.founder_mutate(|state| state.max_peers = max_peers)
    }

    /// Re-hashes the moderator list into the shared state, re-signs, and
    /// broadcasts. Used after any moderator list mutation.
    pub(crate) fn commit_mod_list(&mut self) -> Result<(), Error> {
        let hash = self.moderation.mod_list_hash();
        let old_state = self.shared_state.clone();
        let old_sig = self.shared_state_sig;

        self.shared_state.mod_list_hash = hash;
        if let Err(err) = self.sign_shared_state() {
            self.shared_state = old_state;
            self.shared_state_sig = old_sig;
            return Err(err);
        }

        debug!(group = self.group_number, version = self.shared_state.version, "mod list committed");
        self.broadcast_shared_state();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> SharedState {
        SharedState {
            founder_public_key: ExtendedPublicKey::new([1u8; 32], [2u8; 32]),
            max_peers: 100,
            group_name: b"rustaceans".to_vec(),
            privacy: Privacy::Public,
            password: b"hunter2".to_vec(),
            mod_list_hash: [3u8; 32],
            version: 7,
        }
    }

    #[test]
    fn test_pack_roundtrip() {
        let state = sample_state();
        let packed = state.packed();
        assert_eq!(packed.len(), PACKED_SHARED_STATE_SIZE);

        let mut r = Reader::new(&packed);
        let unpacked = SharedState::unpack(&mut r).unwrap();
        r.finish().unwrap();
        assert_eq!(unpacked, state);
    }

    #[test]
    fn test_unpack_truncated_rejected() {
        let packed = sample_state().packed();
        for cut in [0usize, 10, 64, PACKED_SHARED_STATE_SIZE - 1] {
            let mut r = Reader::new(&packed[..cut]);
            assert!(SharedState::unpack(&mut r).is_err());
        }
    }

    #[test]
    fn test_validate_bounds() {
        let mut state = sample_state();
        assert!(state.validate());

        state.group_name = Vec::new();
        assert!(!state.validate());

        state.group_name = b"ok".to_vec();
        state.max_peers = MAX_GROUP_PEERS + 1;
        assert!(!state.validate());
    }

    #[test]
    fn test_signature_gates_installation() {
        use crate::crypto::ExtendedKeyPair;
        use crate::events::Events;
        use crate::group::{JoinKind, PeerStatus};
        use crate::transport::testing::{NullAnnounce, NullTransport};
        use std::sync::Arc;

        let chat_keys = ExtendedKeyPair::generate();

        // A member holding state version 1, signed by the real chat key
        let mut member = Group::new(
            0,
            Arc::new(NullTransport::default()),
            Arc::new(NullAnnounce),
            Events::new(),
            ExtendedKeyPair::generate(),
            *chat_keys.public(),
            None,
            b"member".to_vec(),
            PeerStatus::Online,
            Role::User,
            JoinKind::Public,
        )
        .unwrap();
        member.peer_add(&[9u8; 32], None).unwrap();

        let mut state = sample_state();
        state.founder_public_key = *ExtendedKeyPair::generate().public();
        state.mod_list_hash = [0u8; 32];
        state.version = 1;
        let sig = chat_keys.sign(&state.packed());

        let mut body = sig.to_vec();
        body.extend_from_slice(&state.packed());
        member.handle_shared_state(1, &body).unwrap();
        assert_eq!(member.shared_state.version, 1);

        // A higher version with a broken signature must never replace it,
        // and costs the sender its seat
        state.version = 9;
        let mut forged = chat_keys.sign(&state.packed()).to_vec();
        forged[0] ^= 0xFF;
        forged.extend_from_slice(&state.packed());

        assert!(member.handle_shared_state(1, &forged).is_err());
        assert_eq!(member.shared_state.version, 1);
        assert!(member.peer_index_by_enc_pk(&[9u8; 32]).is_none());
    }

    #[test]
    fn test_stale_version_ignored() {
        use crate::crypto::ExtendedKeyPair;
        use crate::events::Events;
        use crate::group::{JoinKind, PeerStatus};
        use crate::transport::testing::{NullAnnounce, NullTransport};
        use std::sync::Arc;

        let chat_keys = ExtendedKeyPair::generate();
        let mut member = Group::new(
            0,
            Arc::new(NullTransport::default()),
            Arc::new(NullAnnounce),
            Events::new(),
            ExtendedKeyPair::generate(),
            *chat_keys.public(),
            None,
            b"member".to_vec(),
            PeerStatus::Online,
            Role::User,
            JoinKind::Public,
        )
        .unwrap();
        member.peer_add(&[9u8; 32], None).unwrap();

        let mut state = sample_state();
        state.mod_list_hash = [0u8; 32];
        state.version = 5;
        state.group_name = b"five".to_vec();
        let mut body = chat_keys.sign(&state.packed()).to_vec();
        body.extend_from_slice(&state.packed());
        member.handle_shared_state(1, &body).unwrap();

        // An older but correctly signed state does not regress anything
        state.version = 4;
        state.group_name = b"four".to_vec();
        let mut stale = chat_keys.sign(&state.packed()).to_vec();
        stale.extend_from_slice(&state.packed());
        member.handle_shared_state(1, &stale).unwrap();

        assert_eq!(member.shared_state.version, 5);
        assert_eq!(member.shared_state.group_name, b"five");
        // The sender keeps its seat; stale state is not malice
        assert!(member.peer_index_by_enc_pk(&[9u8; 32]).is_some());
    }

    #[test]
    fn test_password_matches_prefix_and_length() {
        let state = sample_state();
        assert!(state.password_matches(b"hunter2"));
        assert!(state.password_matches(b"hunter2\0\0\0"));
        assert!(!state.password_matches(b"hunter"));
        assert!(!state.password_matches(b"wrong!!"));

        let mut open = sample_state();
        open.password = Vec::new();
        assert!(open.password_matches(b"anything"));
    }
}
