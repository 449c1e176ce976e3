// Role transitions and the moderation broadcasts that carry them.
//
// The founder owns the moderator list; moderators and the founder own the
// sanctions list. Every role change is broadcast as a signed structural
// change (SetMod, SetObserver, RemovePeer, RemoveBan) and applied
// identically by every receiver, with the sender's own seat validated
// before anything is touched.

use tracing::{debug, warn};

use crate::crypto::{ENC_PUBLIC_KEY_SIZE, EXT_PUBLIC_KEY_SIZE, SIG_PUBLIC_KEY_SIZE};
use crate::events::ModerationEvent;
use crate::packet::BroadcastType;
use crate::time::unix_time;
use crate::wire::{Reader, Writer};
use crate::Error;

use super::moderation::{Moderation, Sanction, SanctionKind, SanctionsCreds, MAX_MODERATORS};
use super::{Group, GroupConnectionState, HandleError, Role};

impl Group {
    fn emit_moderation(&self, source_peer_id: u32, target_peer_id: u32, event: ModerationEvent) {
        let gn = self.group_number;
        self.events
            .emit(|o| o.on_moderation(gn, source_peer_id, target_peer_id, event));
    }

    /// Builds, signs, installs, and credentials-advances a sanction against
    /// the peer at `index`.
    fn make_sanction_entry(&mut self, index: usize, kind: SanctionKind) -> Result<Sanction, Error> {
        let conn = &self.peers[index].conn;
        let mut sanction = Sanction {
            kind,
            signer_sig_pk: *self.self_keys.public().sig(),
            time_set: unix_time(),
            target_enc_pk: *conn.public_key.enc(),
            target_addr: match kind {
                SanctionKind::Ban => conn.address,
                SanctionKind::Observer => None,
            },
            prev_creds_hash: self.moderation.creds.hash,
            signature: [0u8; 64],
        };
        sanction.sign(&self.self_keys);

        let founder_sig = *self.shared_state.founder_public_key.sig();
        self.moderation
            .add_entry(&founder_sig, sanction.clone(), None)
            .map_err(|_| Error::Internal("sanction rejected locally"))?;
        self.moderation.make_creds(&self.self_keys);
        Ok(sanction)
    }

    // ---- moderator list ----

    /// Drops the first moderator with no seated peer, then re-distributes
    /// the state bound to the list. Called when the list is full.
    fn prune_offline_mod(&mut self) -> Result<(), Error> {
        let offline = self
            .moderation
            .mod_list
            .iter()
            .position(|sig_pk| self.peer_index_by_sig_pk(sig_pk).is_none());

        let Some(idx) = offline else {
            return Err(Error::Internal("no offline moderator to prune"));
        };
        let sig_pk = self.moderation.mod_list[idx];
        self.moderation.mod_list.remove(idx);

        self.commit_mod_list()?;
        self.broadcast_mod_list();

        if self.moderation.replace_signatures(&sig_pk, &self.self_keys) > 0 {
            self.broadcast_sanctions();
        }
        self.refresh_topic_after_demotion(&sig_pk)?;
        Ok(())
    }

    fn send_set_mod(&mut self, sig_pk: &[u8; SIG_PUBLIC_KEY_SIZE], add: bool) {
        let mut w = Writer::with_capacity(1 + SIG_PUBLIC_KEY_SIZE);
        w.put_u8(add as u8);
        w.put_bytes(sig_pk);
        self.send_broadcast(BroadcastType::SetMod, &w.into_bytes());
    }

    /// Founder-only: seats or unseats the peer at `index` as a moderator and
    /// re-distributes the re-signed shared state.
    pub(crate) fn founder_set_moderator(&mut self, index: usize, add: bool) -> Result<(), Error> {
        if self.self_role() != Role::Founder {
            return Err(Error::PermissionDenied);
        }

        let sig_pk = *self.peers[index].conn.public_key.sig();

        if add {
            if self.moderation.mod_list.len() >= MAX_MODERATORS {
                self.prune_offline_mod()?;
            }
            self.moderation
                .add_mod(sig_pk)
                .map_err(|_| Error::Internal("moderator list full"))?;
        } else {
            self.moderation
                .remove_mod(&sig_pk)
                .map_err(|_| Error::InvalidPeer)?;

            if self.moderation.replace_signatures(&sig_pk, &self.self_keys) > 0 {
                self.broadcast_sanctions();
            }
            self.refresh_topic_after_demotion(&sig_pk)?;
        }

        self.commit_mod_list()?;
        self.send_set_mod(&sig_pk, add);
        Ok(())
    }

    pub(crate) fn handle_bc_set_mod(&mut self, index: usize, payload: &[u8]) -> Result<(), HandleError> {
        if self.peers[index].info.role != Role::Founder {
            return Err(HandleError::Policy);
        }

        let mut r = Reader::new(payload);
        let add = r.take_u8()? != 0;
        let sig_pk: [u8; SIG_PUBLIC_KEY_SIZE] = r.take_array()?;

        let target = self.peer_index_by_sig_pk(&sig_pk);
        if target == Some(index) {
            return Err(HandleError::Policy);
        }

        if add {
            self.moderation
                .add_mod(sig_pk)
                .map_err(|_| HandleError::Policy)?;
        } else {
            self.moderation
                .remove_mod(&sig_pk)
                .map_err(|_| HandleError::Policy)?;
        }

        if let Some(target) = target {
            self.peers[target].info.role = if add { Role::Moderator } else { Role::User };
            let source_id = self.peers[index].info.peer_id;
            let target_id = self.peers[target].info.peer_id;
            self.emit_moderation(
                source_id,
                target_id,
                if add {
                    ModerationEvent::Moderator
                } else {
                    ModerationEvent::User
                },
            );
        }
        Ok(())
    }

    // ---- observer sanctions ----

    fn send_set_observer(
        &mut self,
        target_ext_pk: &[u8; EXT_PUBLIC_KEY_SIZE],
        data: &[u8],
        add: bool,
    ) {
        let mut w = Writer::with_capacity(1 + EXT_PUBLIC_KEY_SIZE + data.len());
        w.put_u8(add as u8);
        w.put_bytes(target_ext_pk);
        w.put_bytes(data);
        self.send_broadcast(BroadcastType::SetObserver, &w.into_bytes());
    }

    /// Moderator or founder: adds or lifts the observer sanction on `index`.
    pub(crate) fn mod_set_observer(&mut self, index: usize, add: bool) -> Result<(), Error> {
        if self.self_role() >= Role::User {
            return Err(Error::PermissionDenied);
        }

        let target_ext = self.peers[index].conn.public_key.to_bytes();
        let target_enc = *self.peers[index].conn.public_key.enc();
        let founder_sig = *self.shared_state.founder_public_key.sig();

        let data = if add {
            let sanction = self.make_sanction_entry(index, SanctionKind::Observer)?;
            let mut w = Writer::new();
            Moderation::pack_sanctions(
                std::slice::from_ref(&sanction),
                Some(&self.moderation.creds),
                &mut w,
            );
            w.into_bytes()
        } else {
            self.moderation
                .remove_observer(&founder_sig, &target_enc, None)
                .map_err(|_| Error::InvalidPeer)?;
            self.moderation.make_creds(&self.self_keys);

            let mut w = Writer::new();
            self.moderation.creds.pack(&mut w);
            w.into_bytes()
        };

        self.send_set_observer(&target_ext, &data, add);
        Ok(())
    }

    pub(crate) fn handle_bc_set_observer(
        &mut self,
        index: usize,
        payload: &[u8],
    ) -> Result<(), HandleError> {
        if self.peers[index].info.role >= Role::User {
            return Err(HandleError::Policy);
        }

        let mut r = Reader::new(payload);
        let add = r.take_u8()? != 0;
        let target_bytes: [u8; EXT_PUBLIC_KEY_SIZE] = r.take_array()?;
        let target = crate::crypto::ExtendedPublicKey::from_bytes(&target_bytes);

        let founder_sig = *self.shared_state.founder_public_key.sig();

        // Moderators and the founder cannot be made observers
        if self.moderation.verify_sig_pk(&founder_sig, target.sig()) {
            return Err(HandleError::Policy);
        }

        let target_index = self.peer_index_by_enc_pk(target.enc());
        if target_index == Some(index) {
            return Err(HandleError::Policy);
        }

        if add {
            let (sanctions, creds) =
                Moderation::unpack_sanctions(r.take_rest(), 1).map_err(|_| HandleError::Malformed)?;
            let sanction = sanctions.into_iter().next().ok_or(HandleError::Malformed)?;
            self.moderation
                .add_entry(&founder_sig, sanction, Some(creds))
                .map_err(|_| HandleError::Auth)?;
        } else {
            let mut cr = Reader::new(r.take_rest());
            let creds = SanctionsCreds::unpack(&mut cr)?;
            self.moderation
                .remove_observer(&founder_sig, target.enc(), Some(creds))
                .map_err(|_| HandleError::Auth)?;
        }

        if let Some(target_index) = target_index {
            self.peers[target_index].info.role = if add { Role::Observer } else { Role::User };
            let source_id = self.peers[index].info.peer_id;
            let target_id = self.peers[target_index].info.peer_id;
            self.emit_moderation(
                source_id,
                target_id,
                if add {
                    ModerationEvent::Observer
                } else {
                    ModerationEvent::User
                },
            );
        }
        Ok(())
    }

    // ---- role assignment ----

    /// Assigns `role` to a peer, issuing the structural broadcasts that back
    /// the change. Founder may perform any transition; moderators may only
    /// move users to observer and back.
    pub fn set_peer_role(&mut self, peer_id: u32, role: Role) -> Result<(), Error> {
        if role == Role::Founder {
            return Err(Error::InvalidArgument("cannot assign founder"));
        }

        let index = self.peer_index_by_id(peer_id).ok_or(Error::InvalidPeer)?;
        if index == 0 || !self.peers[index].conn.is_confirmed() {
            return Err(Error::InvalidPeer);
        }

        let self_role = self.self_role();
        let target_role = self.peers[index].info.role;

        if self_role >= Role::User {
            return Err(Error::PermissionDenied);
        }
        if target_role == Role::Founder {
            return Err(Error::PermissionDenied);
        }
        if self_role != Role::Founder && (role == Role::Moderator || target_role <= Role::Moderator)
        {
            return Err(Error::PermissionDenied);
        }
        if target_role == role {
            return Err(Error::InvalidArgument("role unchanged"));
        }

        let mut event = ModerationEvent::User;

        // The old role comes off before the new one goes on
        match target_role {
            Role::Moderator => {
                self.founder_set_moderator(index, false)?;
                self.peers[index].info.role = Role::User;
                if role == Role::Observer {
                    event = ModerationEvent::Observer;
                    self.mod_set_observer(index, true)?;
                }
            }
            Role::Observer => {
                self.mod_set_observer(index, false)?;
                self.peers[index].info.role = Role::User;
                if role == Role::Moderator {
                    event = ModerationEvent::Moderator;
                    self.founder_set_moderator(index, true)?;
                }
            }
            Role::User => match role {
                Role::Moderator => {
                    event = ModerationEvent::Moderator;
                    self.founder_set_moderator(index, true)?;
                }
                Role::Observer => {
                    event = ModerationEvent::Observer;
                    self.mod_set_observer(index, true)?;
                }
                _ => {}
            },
            Role::Founder => unreachable!("guarded above"),
        }

        let source_id = self.self_peer_id();
        let target_id = self.peers[index].info.peer_id;
        self.emit_moderation(source_id, target_id, event);

        self.peers[index].info.role = role;
        Ok(())
    }

    // ---- kick / ban ----

    /// Removes a peer from every member's table, optionally adding a ban.
    pub fn remove_peer(&mut self, peer_id: u32, set_ban: bool) -> Result<(), Error> {
        let index = self.peer_index_by_id(peer_id).ok_or(Error::InvalidPeer)?;
        if index == 0 || !self.peers[index].conn.is_confirmed() {
            return Err(Error::InvalidPeer);
        }

        let self_role = self.self_role();
        let target_role = self.peers[index].info.role;

        if self_role >= Role::User || target_role == Role::Founder {
            return Err(Error::PermissionDenied);
        }
        if self_role != Role::Founder && target_role == Role::Moderator {
            return Err(Error::PermissionDenied);
        }

        // Strip privileged or sanctioned roles first so the lists stay clean
        if target_role == Role::Moderator || target_role == Role::Observer {
            self.set_peer_role(peer_id, Role::User)?;
        }
        let index = self.peer_index_by_id(peer_id).ok_or(Error::InvalidPeer)?;

        let event = if set_ban {
            ModerationEvent::Ban
        } else {
            ModerationEvent::Kick
        };

        let target_enc = *self.peers[index].conn.public_key.enc();
        let mut w = Writer::new();
        w.put_u8(event.as_u8());
        w.put_bytes(&target_enc);
        if set_ban {
            let sanction = self.make_sanction_entry(index, SanctionKind::Ban)?;
            Moderation::pack_sanctions(
                std::slice::from_ref(&sanction),
                Some(&self.moderation.creds),
                &mut w,
            );
        }
        self.send_broadcast(BroadcastType::RemovePeer, &w.into_bytes());

        let source_id = self.self_peer_id();
        self.emit_moderation(source_id, peer_id, event);

        let index = self.peer_index_by_id(peer_id).ok_or(Error::InvalidPeer)?;
        self.peer_delete(index, b"");
        debug!(group = self.group_number, peer_id, set_ban, "peer removed by moderation");
        Ok(())
    }

    pub(crate) fn handle_bc_remove_peer(
        &mut self,
        index: usize,
        payload: &[u8],
    ) -> Result<(), HandleError> {
        if self.peers[index].info.role >= Role::User {
            return Err(HandleError::Policy);
        }

        let mut r = Reader::new(payload);
        let event = ModerationEvent::from_u8(r.take_u8()?).ok_or(HandleError::Malformed)?;
        if event != ModerationEvent::Kick && event != ModerationEvent::Ban {
            return Err(HandleError::Malformed);
        }
        let target_pk: [u8; ENC_PUBLIC_KEY_SIZE] = r.take_array()?;

        let target_index = self.peer_index_by_enc_pk(&target_pk);

        // A seated target must be a plain user; mods and the founder cannot
        // be removed this way even if the guard is raced
        if let Some(t) = target_index {
            if t != 0 && self.peers[t].info.role != Role::User {
                return Err(HandleError::Policy);
            }
        }

        let source_id = self.peers[index].info.peer_id;

        if target_index == Some(0) {
            // We are the target: report and shut the group down
            let self_id = self.self_peer_id();
            self.emit_moderation(source_id, self_id, event);
            self.connection_state = GroupConnectionState::Closing;
            return Ok(());
        }

        if event == ModerationEvent::Ban {
            let (sanctions, creds) =
                Moderation::unpack_sanctions(r.take_rest(), 1).map_err(|_| HandleError::Malformed)?;
            let sanction = sanctions.into_iter().next().ok_or(HandleError::Malformed)?;
            let founder_sig = *self.shared_state.founder_public_key.sig();
            if let Err(err) = self.moderation.add_entry(&founder_sig, sanction, Some(creds)) {
                warn!(group = self.group_number, %err, "ban entry rejected");
                return Err(HandleError::Auth);
            }
        }

        let Some(target_index) = self.peer_index_by_enc_pk(&target_pk) else {
            // Nothing to kick locally; the ban (if any) is already applied
            return Ok(());
        };

        let target_id = self.peers[target_index].info.peer_id;
        self.emit_moderation(source_id, target_id, event);
        self.peer_delete(target_index, b"");
        Ok(())
    }

    // ---- ban removal ----

    /// Lifts a ban and broadcasts the fresh credentials.
    pub fn remove_ban(&mut self, target_enc_pk: &[u8; ENC_PUBLIC_KEY_SIZE]) -> Result<(), Error> {
        if self.self_role() >= Role::User {
            return Err(Error::PermissionDenied);
        }

        let founder_sig = *self.shared_state.founder_public_key.sig();
        self.moderation
            .remove_ban(&founder_sig, target_enc_pk, None)
            .map_err(|_| Error::InvalidArgument("no such ban"))?;
        self.moderation.make_creds(&self.self_keys);

        let mut w = Writer::new();
        w.put_bytes(target_enc_pk);
        self.moderation.creds.pack(&mut w);
        self.send_broadcast(BroadcastType::RemoveBan, &w.into_bytes());
        Ok(())
    }

    pub(crate) fn handle_bc_remove_ban(
        &mut self,
        index: usize,
        payload: &[u8],
    ) -> Result<(), HandleError> {
        if self.peers[index].info.role >= Role::User {
            return Err(HandleError::Policy);
        }

        let mut r = Reader::new(payload);
        let target_pk: [u8; ENC_PUBLIC_KEY_SIZE] = r.take_array()?;
        let creds = SanctionsCreds::unpack(&mut r)?;

        let founder_sig = *self.shared_state.founder_public_key.sig();
        self.moderation
            .remove_ban(&founder_sig, &target_pk, Some(creds))
            .map_err(|_| HandleError::Auth)?;
        Ok(())
    }

    /// Encryption keys currently banned, for the embedding UI.
    pub fn banned_keys(&self) -> Vec<[u8; ENC_PUBLIC_KEY_SIZE]> {
        self.moderation
            .sanctions
            .iter()
            .filter(|s| s.kind == SanctionKind::Ban)
            .map(|s| s.target_enc_pk)
            .collect()
    }
}
