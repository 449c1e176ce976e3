// Moderator list and sanctions list.
//
// The moderator list is founder-authored; its Blake3 hash is embedded in the
// signed shared state, which is what makes the list trustworthy. Sanctions
// are appended by moderators or the founder. Each entry signs the
// credentials hash that preceded it together with its own body, and the
// credentials (version, running hash over the ordered entry signatures,
// signer, signature) authenticate the whole list as one object.

use thiserror::Error;

use crate::crypto::{
    hash::content_hash, keys::verify_sig, ExtendedKeyPair, ENC_PUBLIC_KEY_SIZE, MOD_HASH_SIZE,
    SIGNATURE_SIZE, SIG_PUBLIC_KEY_SIZE,
};
use crate::transport::IpPort;
use crate::wire::{Reader, WireError, Writer};

/// Most moderators a group will seat.
pub const MAX_MODERATORS: usize = 30;
/// Most sanctions a group will carry.
pub const MAX_SANCTIONS: usize = 30;
/// Packed size of the sanctions credentials.
pub const CREDS_PACKED_SIZE: usize = 4 + MOD_HASH_SIZE + SIG_PUBLIC_KEY_SIZE + SIGNATURE_SIZE;
/// Packed size of one moderator list entry.
pub const MOD_LIST_ENTRY_SIZE: usize = SIG_PUBLIC_KEY_SIZE;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModerationError {
    #[error("Moderator list is full")]
    ModListFull,

    #[error("Key not found")]
    NotFound,

    #[error("Sanctions list is full")]
    SanctionsFull,

    #[error("Sanction entry failed validation")]
    InvalidEntry,

    #[error("Sanction already present")]
    DuplicateEntry,

    #[error("Credentials failed validation")]
    InvalidCreds,

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// What a sanction does to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SanctionKind {
    Ban = 0,
    Observer = 1,
}

impl SanctionKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SanctionKind::Ban),
            1 => Some(SanctionKind::Observer),
            _ => None,
        }
    }
}

/// One signed sanctions entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sanction {
    pub kind: SanctionKind,
    pub signer_sig_pk: [u8; SIG_PUBLIC_KEY_SIZE],
    pub time_set: u64,
    pub target_enc_pk: [u8; ENC_PUBLIC_KEY_SIZE],
    /// Bans may pin the target's last known address.
    pub target_addr: Option<IpPort>,
    /// Credentials hash of the list as it stood before this entry.
    pub prev_creds_hash: [u8; MOD_HASH_SIZE],
    pub signature: [u8; SIGNATURE_SIZE],
}

impl Sanction {
    /// Packs everything; the signature goes last so the signable prefix is
    /// the packed bytes minus the trailing signature.
    pub fn pack(&self, w: &mut Writer) {
        w.put_u8(self.kind as u8);
        w.put_bytes(&self.signer_sig_pk);
        w.put_u64(self.time_set);
        w.put_bytes(&self.target_enc_pk);
        match self.target_addr {
            Some(addr) => {
                w.put_u8(1);
                addr.pack(w);
            }
            None => w.put_u8(0),
        }
        w.put_bytes(&self.prev_creds_hash);
        w.put_bytes(&self.signature);
    }

    pub fn unpack(r: &mut Reader<'_>) -> Result<Self, ModerationError> {
        let kind = SanctionKind::from_u8(r.take_u8()?).ok_or(ModerationError::InvalidEntry)?;
        let signer_sig_pk: [u8; SIG_PUBLIC_KEY_SIZE] = r.take_array()?;
        let time_set = r.take_u64()?;
        let target_enc_pk: [u8; ENC_PUBLIC_KEY_SIZE] = r.take_array()?;
        let target_addr = match r.take_u8()? {
            0 => None,
            1 => Some(IpPort::unpack(r)?),
            _ => return Err(ModerationError::InvalidEntry),
        };
        let prev_creds_hash: [u8; MOD_HASH_SIZE] = r.take_array()?;
        let signature: [u8; SIGNATURE_SIZE] = r.take_array()?;
        Ok(Self {
            kind,
            signer_sig_pk,
            time_set,
            target_enc_pk,
            target_addr,
            prev_creds_hash,
            signature,
        })
    }

    fn signable(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.pack(&mut w);
        let mut bytes = w.into_bytes();
        bytes.truncate(bytes.len() - SIGNATURE_SIZE);
        bytes
    }

    /// Signs the entry with `keys`, whose signature key must already be in
    /// `signer_sig_pk`.
    pub fn sign(&mut self, keys: &ExtendedKeyPair) {
        self.signature = keys.sign(&self.signable());
    }

    pub fn verify_signature(&self) -> Result<(), ModerationError> {
        verify_sig(&self.signer_sig_pk, &self.signable(), &self.signature)
            .map_err(|_| ModerationError::InvalidEntry)
    }
}

/// Versioned credentials over the ordered sanctions list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanctionsCreds {
    pub version: u32,
    pub hash: [u8; MOD_HASH_SIZE],
    pub sig_pk: [u8; SIG_PUBLIC_KEY_SIZE],
    pub signature: [u8; SIGNATURE_SIZE],
}

impl Default for SanctionsCreds {
    fn default() -> Self {
        Self {
            version: 0,
            hash: [0u8; MOD_HASH_SIZE],
            sig_pk: [0u8; SIG_PUBLIC_KEY_SIZE],
            signature: [0u8; SIGNATURE_SIZE],
        }
    }
}

impl SanctionsCreds {
    pub fn pack(&self, w: &mut Writer) {
        w.put_u32(self.version);
        w.put_bytes(&self.hash);
        w.put_bytes(&self.sig_pk);
        w.put_bytes(&self.signature);
    }

    pub fn unpack(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            version: r.take_u32()?,
            hash: r.take_array()?,
            sig_pk: r.take_array()?,
            signature: r.take_array()?,
        })
    }
}

/// Running hash over the ordered entry signatures plus the version.
/// Zero when the list is empty.
pub fn sanctions_hash(sanctions: &[Sanction], version: u32) -> [u8; MOD_HASH_SIZE] {
    if sanctions.is_empty() {
        return [0u8; MOD_HASH_SIZE];
    }
    let mut data = Vec::with_capacity(sanctions.len() * SIGNATURE_SIZE + 4);
    for sanction in sanctions {
        data.extend_from_slice(&sanction.signature);
    }
    data.extend_from_slice(&version.to_be_bytes());
    content_hash(&data)
}

/// The moderation state of one group.
#[derive(Default)]
pub struct Moderation {
    pub mod_list: Vec<[u8; SIG_PUBLIC_KEY_SIZE]>,
    pub sanctions: Vec<Sanction>,
    pub creds: SanctionsCreds,
}

impl Moderation {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- moderator list ----

    pub fn mod_index(&self, sig_pk: &[u8; SIG_PUBLIC_KEY_SIZE]) -> Option<usize> {
        self.mod_list.iter().position(|k| k == sig_pk)
    }

    pub fn is_mod(&self, sig_pk: &[u8; SIG_PUBLIC_KEY_SIZE]) -> bool {
        self.mod_index(sig_pk).is_some()
    }

    /// True if `sig_pk` belongs to a seated moderator or the founder.
    pub fn verify_sig_pk(
        &self,
        founder_sig_pk: &[u8; SIG_PUBLIC_KEY_SIZE],
        sig_pk: &[u8; SIG_PUBLIC_KEY_SIZE],
    ) -> bool {
        sig_pk == founder_sig_pk || self.is_mod(sig_pk)
    }

    pub fn add_mod(&mut self, sig_pk: [u8; SIG_PUBLIC_KEY_SIZE]) -> Result<(), ModerationError> {
        if self.mod_list.len() >= MAX_MODERATORS {
            return Err(ModerationError::ModListFull);
        }
        if self.is_mod(&sig_pk) {
            return Ok(());
        }
        self.mod_list.push(sig_pk);
        Ok(())
    }

    pub fn remove_mod(&mut self, sig_pk: &[u8; SIG_PUBLIC_KEY_SIZE]) -> Result<(), ModerationError> {
        let idx = self.mod_index(sig_pk).ok_or(ModerationError::NotFound)?;
        self.mod_list.remove(idx);
        Ok(())
    }

    /// Blake3 hash of the packed moderator list; zero when empty. This value
    /// is embedded in the signed shared state.
    pub fn mod_list_hash(&self) -> [u8; MOD_HASH_SIZE] {
        if self.mod_list.is_empty() {
            return [0u8; MOD_HASH_SIZE];
        }
        let mut data = Vec::with_capacity(self.mod_list.len() * MOD_LIST_ENTRY_SIZE);
        for key in &self.mod_list {
            data.extend_from_slice(key);
        }
        content_hash(&data)
    }

    pub fn pack_mod_list(&self, w: &mut Writer) {
        w.put_u16(self.mod_list.len() as u16);
        for key in &self.mod_list {
            w.put_bytes(key);
        }
    }

    pub fn unpack_mod_list(data: &[u8]) -> Result<Vec<[u8; SIG_PUBLIC_KEY_SIZE]>, ModerationError> {
        let mut r = Reader::new(data);
        let count = r.take_u16()? as usize;
        if count > MAX_MODERATORS {
            return Err(ModerationError::ModListFull);
        }
        let mut list = Vec::with_capacity(count);
        for _ in 0..count {
            list.push(r.take_array()?);
        }
        Ok(list)
    }

    // ---- sanctions ----

    pub fn is_observer(&self, enc_pk: &[u8; ENC_PUBLIC_KEY_SIZE]) -> bool {
        self.sanctions
            .iter()
            .any(|s| s.kind == SanctionKind::Observer && &s.target_enc_pk == enc_pk)
    }

    pub fn key_banned(&self, enc_pk: &[u8; ENC_PUBLIC_KEY_SIZE]) -> bool {
        self.sanctions
            .iter()
            .any(|s| s.kind == SanctionKind::Ban && &s.target_enc_pk == enc_pk)
    }

    pub fn ip_banned(&self, addr: &IpPort) -> bool {
        self.sanctions.iter().any(|s| {
            s.kind == SanctionKind::Ban && s.target_addr.is_some_and(|a| a.ip == addr.ip)
        })
    }

    pub fn num_banned(&self) -> usize {
        self.sanctions
            .iter()
            .filter(|s| s.kind == SanctionKind::Ban)
            .count()
    }

    fn entry_exists(&self, sanction: &Sanction) -> bool {
        match sanction.kind {
            SanctionKind::Ban => self.key_banned(&sanction.target_enc_pk),
            SanctionKind::Observer => self.is_observer(&sanction.target_enc_pk),
        }
    }

    /// Structural and signature validation of a single entry.
    pub fn validate_entry(
        &self,
        founder_sig_pk: &[u8; SIG_PUBLIC_KEY_SIZE],
        sanction: &Sanction,
    ) -> Result<(), ModerationError> {
        if !self.verify_sig_pk(founder_sig_pk, &sanction.signer_sig_pk) {
            return Err(ModerationError::InvalidEntry);
        }
        if sanction.time_set == 0 {
            return Err(ModerationError::InvalidEntry);
        }
        if sanction.kind == SanctionKind::Observer && sanction.target_addr.is_some() {
            return Err(ModerationError::InvalidEntry);
        }
        sanction.verify_signature()
    }

    /// Validates credentials against a candidate sanctions list.
    pub fn validate_creds(
        &self,
        founder_sig_pk: &[u8; SIG_PUBLIC_KEY_SIZE],
        sanctions: &[Sanction],
        creds: &SanctionsCreds,
    ) -> Result<(), ModerationError> {
        if !self.verify_sig_pk(founder_sig_pk, &creds.sig_pk) {
            return Err(ModerationError::InvalidCreds);
        }

        let hash = sanctions_hash(sanctions, creds.version);
        if hash != creds.hash {
            return Err(ModerationError::InvalidCreds);
        }

        if creds.version < self.creds.version
            && !(creds.version == 0 && self.creds.version == u32::MAX)
        {
            return Err(ModerationError::InvalidCreds);
        }

        verify_sig(&creds.sig_pk, &creds.hash, &creds.signature)
            .map_err(|_| ModerationError::InvalidCreds)
    }

    /// Full integrity check of a received list before installing it.
    pub fn check_integrity(
        &self,
        founder_sig_pk: &[u8; SIG_PUBLIC_KEY_SIZE],
        sanctions: &[Sanction],
        creds: &SanctionsCreds,
    ) -> Result<(), ModerationError> {
        if sanctions.len() > MAX_SANCTIONS {
            return Err(ModerationError::SanctionsFull);
        }
        for sanction in sanctions {
            self.validate_entry(founder_sig_pk, sanction)?;
        }
        self.validate_creds(founder_sig_pk, sanctions, creds)
    }

    /// Replaces credentials after verifying them against the current list.
    pub fn install_creds(
        &mut self,
        founder_sig_pk: &[u8; SIG_PUBLIC_KEY_SIZE],
        creds: SanctionsCreds,
    ) -> Result<(), ModerationError> {
        self.validate_creds(founder_sig_pk, &self.sanctions, &creds)?;
        self.creds = creds;
        Ok(())
    }

    /// Re-derives and signs fresh credentials after a local list mutation.
    pub fn make_creds(&mut self, self_keys: &ExtendedKeyPair) {
        self.creds.version = self.creds.version.wrapping_add(1);
        self.creds.sig_pk = *self_keys.public().sig();
        self.creds.hash = sanctions_hash(&self.sanctions, self.creds.version);
        self.creds.signature = self_keys.sign(&self.creds.hash);
    }

    /// Appends a received entry. When `creds` is given, the resulting list is
    /// validated against them before anything is committed.
    pub fn add_entry(
        &mut self,
        founder_sig_pk: &[u8; SIG_PUBLIC_KEY_SIZE],
        sanction: Sanction,
        creds: Option<SanctionsCreds>,
    ) -> Result<(), ModerationError> {
        if self.sanctions.len() >= MAX_SANCTIONS {
            return Err(ModerationError::SanctionsFull);
        }
        self.validate_entry(founder_sig_pk, &sanction)?;
        if self.entry_exists(&sanction) {
            return Err(ModerationError::DuplicateEntry);
        }

        if let Some(creds) = creds {
            let mut candidate: Vec<Sanction> = self.sanctions.clone();
            candidate.push(sanction.clone());
            self.validate_creds(founder_sig_pk, &candidate, &creds)?;
            self.sanctions = candidate;
            self.creds = creds;
        } else {
            self.sanctions.push(sanction);
        }
        Ok(())
    }

    fn remove_matching(
        &mut self,
        founder_sig_pk: &[u8; SIG_PUBLIC_KEY_SIZE],
        index: usize,
        creds: Option<SanctionsCreds>,
    ) -> Result<(), ModerationError> {
        if let Some(creds) = creds {
            let mut candidate = self.sanctions.clone();
            candidate.remove(index);
            self.validate_creds(founder_sig_pk, &candidate, &creds)?;
            self.sanctions = candidate;
            self.creds = creds;
        } else {
            self.sanctions.remove(index);
        }
        Ok(())
    }

    /// Removes the ban for `target_enc_pk`. Moderators pass `None` and make
    /// fresh credentials afterwards; receivers pass the broadcast creds.
    pub fn remove_ban(
        &mut self,
        founder_sig_pk: &[u8; SIG_PUBLIC_KEY_SIZE],
        target_enc_pk: &[u8; ENC_PUBLIC_KEY_SIZE],
        creds: Option<SanctionsCreds>,
    ) -> Result<(), ModerationError> {
        let index = self
            .sanctions
            .iter()
            .position(|s| s.kind == SanctionKind::Ban && &s.target_enc_pk == target_enc_pk)
            .ok_or(ModerationError::NotFound)?;
        self.remove_matching(founder_sig_pk, index, creds)
    }

    /// Removes the observer entry for `target_enc_pk`.
    pub fn remove_observer(
        &mut self,
        founder_sig_pk: &[u8; SIG_PUBLIC_KEY_SIZE],
        target_enc_pk: &[u8; ENC_PUBLIC_KEY_SIZE],
        creds: Option<SanctionsCreds>,
    ) -> Result<(), ModerationError> {
        let index = self
            .sanctions
            .iter()
            .position(|s| s.kind == SanctionKind::Observer && &s.target_enc_pk == target_enc_pk)
            .ok_or(ModerationError::NotFound)?;
        self.remove_matching(founder_sig_pk, index, creds)
    }

    /// Re-signs every entry authored by `old_sig_pk` with our own key, used
    /// when the founder demotes a moderator. Returns how many were replaced.
    pub fn replace_signatures(
        &mut self,
        old_sig_pk: &[u8; SIG_PUBLIC_KEY_SIZE],
        self_keys: &ExtendedKeyPair,
    ) -> usize {
        let mut count = 0;
        for sanction in &mut self.sanctions {
            if &sanction.signer_sig_pk != old_sig_pk {
                continue;
            }
            sanction.signer_sig_pk = *self_keys.public().sig();
            sanction.sign(self_keys);
            count += 1;
        }
        if count > 0 {
            self.make_creds(self_keys);
        }
        count
    }

    /// Packs `sanctions` followed by `creds` when given.
    pub fn pack_sanctions(
        sanctions: &[Sanction],
        creds: Option<&SanctionsCreds>,
        w: &mut Writer,
    ) {
        for sanction in sanctions.iter().take(MAX_SANCTIONS) {
            sanction.pack(w);
        }
        if let Some(creds) = creds {
            creds.pack(w);
        }
    }

    /// Unpacks exactly `count` sanctions followed by credentials.
    pub fn unpack_sanctions(
        data: &[u8],
        count: usize,
    ) -> Result<(Vec<Sanction>, SanctionsCreds), ModerationError> {
        if count > MAX_SANCTIONS {
            return Err(ModerationError::SanctionsFull);
        }
        let mut r = Reader::new(data);
        let mut sanctions = Vec::with_capacity(count);
        for _ in 0..count {
            sanctions.push(Sanction::unpack(&mut r)?);
        }
        let creds = SanctionsCreds::unpack(&mut r)?;
        Ok((sanctions, creds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn keys() -> ExtendedKeyPair {
        ExtendedKeyPair::generate()
    }

    fn make_sanction(
        signer: &ExtendedKeyPair,
        kind: SanctionKind,
        target: [u8; 32],
        prev_hash: [u8; 32],
    ) -> Sanction {
        let mut sanction = Sanction {
            kind,
            signer_sig_pk: *signer.public().sig(),
            time_set: 1_700_000_000,
            target_enc_pk: target,
            target_addr: match kind {
                SanctionKind::Ban => Some(IpPort::new(
                    IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)),
                    33445,
                )),
                SanctionKind::Observer => None,
            },
            prev_creds_hash: prev_hash,
            signature: [0u8; 64],
        };
        sanction.sign(signer);
        sanction
    }

    #[test]
    fn test_sanction_pack_roundtrip() {
        let founder = keys();
        let sanction = make_sanction(&founder, SanctionKind::Ban, [7u8; 32], [0u8; 32]);

        let mut w = Writer::new();
        sanction.pack(&mut w);
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        let unpacked = Sanction::unpack(&mut r).unwrap();
        r.finish().unwrap();
        assert_eq!(unpacked, sanction);
        unpacked.verify_signature().unwrap();
    }

    #[test]
    fn test_sanction_truncation_rejected() {
        let founder = keys();
        let sanction = make_sanction(&founder, SanctionKind::Observer, [7u8; 32], [0u8; 32]);
        let mut w = Writer::new();
        sanction.pack(&mut w);
        let bytes = w.into_bytes();

        for cut in [1usize, 32, bytes.len() - 1] {
            let mut r = Reader::new(&bytes[..cut]);
            assert!(Sanction::unpack(&mut r).is_err());
        }
    }

    #[test]
    fn test_founder_ban_entry_and_creds() {
        let founder = keys();
        let founder_sig = *founder.public().sig();
        let mut moderation = Moderation::new();
        moderation.make_creds(&founder); // group creation seeds version 1

        let sanction = make_sanction(&founder, SanctionKind::Ban, [9u8; 32], moderation.creds.hash);
        moderation
            .add_entry(&founder_sig, sanction, None)
            .unwrap();
        let before = moderation.creds.version;
        moderation.make_creds(&founder);

        assert_eq!(moderation.creds.version, before + 1);
        assert!(moderation.key_banned(&[9u8; 32]));
        assert!(moderation.ip_banned(&IpPort::new(
            IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)),
            99
        )));
        moderation
            .check_integrity(
                &founder_sig,
                &moderation.sanctions.clone(),
                &moderation.creds.clone(),
            )
            .unwrap();
    }

    #[test]
    fn test_unseated_signer_rejected() {
        let founder = keys();
        let stranger = keys();
        let founder_sig = *founder.public().sig();
        let moderation = Moderation::new();

        let sanction = make_sanction(&stranger, SanctionKind::Observer, [2u8; 32], [0u8; 32]);
        assert_eq!(
            moderation.validate_entry(&founder_sig, &sanction),
            Err(ModerationError::InvalidEntry)
        );
    }

    #[test]
    fn test_tampered_entry_rejected() {
        let founder = keys();
        let founder_sig = *founder.public().sig();
        let moderation = Moderation::new();

        let mut sanction = make_sanction(&founder, SanctionKind::Observer, [2u8; 32], [0u8; 32]);
        sanction.target_enc_pk = [3u8; 32];
        assert!(moderation.validate_entry(&founder_sig, &sanction).is_err());
    }

    #[test]
    fn test_duplicate_entry_rejected() {
        let founder = keys();
        let founder_sig = *founder.public().sig();
        let mut moderation = Moderation::new();
        moderation.make_creds(&founder);

        let a = make_sanction(&founder, SanctionKind::Observer, [5u8; 32], moderation.creds.hash);
        moderation.add_entry(&founder_sig, a, None).unwrap();
        moderation.make_creds(&founder);

        let b = make_sanction(&founder, SanctionKind::Observer, [5u8; 32], moderation.creds.hash);
        assert_eq!(
            moderation.add_entry(&founder_sig, b, None),
            Err(ModerationError::DuplicateEntry)
        );
    }

    #[test]
    fn test_creds_version_must_not_regress() {
        let founder = keys();
        let founder_sig = *founder.public().sig();
        let mut moderation = Moderation::new();
        moderation.make_creds(&founder);
        moderation.make_creds(&founder); // version 2

        let mut stale = SanctionsCreds {
            version: 1,
            sig_pk: founder_sig,
            hash: sanctions_hash(&[], 1),
            signature: [0u8; 64],
        };
        stale.signature = founder.sign(&stale.hash);

        assert_eq!(
            moderation.validate_creds(&founder_sig, &[], &stale),
            Err(ModerationError::InvalidCreds)
        );
    }

    #[test]
    fn test_receiver_applies_broadcast_creds() {
        // Moderator-side mutation, receiver-side validation
        let founder = keys();
        let founder_sig = *founder.public().sig();

        let mut sender = Moderation::new();
        sender.make_creds(&founder);
        let seed_creds = sender.creds.clone();

        let sanction = make_sanction(&founder, SanctionKind::Observer, [8u8; 32], sender.creds.hash);
        sender.add_entry(&founder_sig, sanction.clone(), None).unwrap();
        sender.make_creds(&founder);

        let mut receiver = Moderation::new();
        receiver.creds = seed_creds;
        receiver
            .add_entry(&founder_sig, sanction, Some(sender.creds.clone()))
            .unwrap();
        assert!(receiver.is_observer(&[8u8; 32]));
        assert_eq!(receiver.creds, sender.creds);

        // Removal travels as credentials only
        sender
            .remove_observer(&founder_sig, &[8u8; 32], None)
            .unwrap();
        sender.make_creds(&founder);
        receiver
            .remove_observer(&founder_sig, &[8u8; 32], Some(sender.creds.clone()))
            .unwrap();
        assert!(!receiver.is_observer(&[8u8; 32]));
    }

    #[test]
    fn test_replace_signatures_on_demotion() {
        let founder = keys();
        let moderator = keys();
        let founder_sig = *founder.public().sig();

        let mut moderation = Moderation::new();
        moderation.make_creds(&founder);
        moderation.add_mod(*moderator.public().sig()).unwrap();

        let sanction = make_sanction(&moderator, SanctionKind::Observer, [4u8; 32], moderation.creds.hash);
        moderation.add_entry(&founder_sig, sanction, None).unwrap();
        moderation.make_creds(&moderator);

        moderation.remove_mod(moderator.public().sig()).unwrap();
        let replaced = moderation.replace_signatures(moderator.public().sig(), &founder);
        assert_eq!(replaced, 1);
        assert_eq!(
            moderation.sanctions[0].signer_sig_pk,
            *founder.public().sig()
        );
        moderation
            .check_integrity(
                &founder_sig,
                &moderation.sanctions.clone(),
                &moderation.creds.clone(),
            )
            .unwrap();
    }

    #[test]
    fn test_mod_list_hash_binds_content() {
        let mut moderation = Moderation::new();
        assert_eq!(moderation.mod_list_hash(), [0u8; 32]);

        moderation.add_mod([1u8; 32]).unwrap();
        let h1 = moderation.mod_list_hash();
        moderation.add_mod([2u8; 32]).unwrap();
        let h2 = moderation.mod_list_hash();
        assert_ne!(h1, h2);

        moderation.remove_mod(&[2u8; 32]).unwrap();
        assert_eq!(moderation.mod_list_hash(), h1);
    }

    #[test]
    fn test_mod_list_pack_roundtrip() {
        let mut moderation = Moderation::new();
        moderation.add_mod([1u8; 32]).unwrap();
        moderation.add_mod([2u8; 32]).unwrap();

        let mut w = Writer::new();
        moderation.pack_mod_list(&mut w);
        let bytes = w.into_bytes();

        let list = Moderation::unpack_mod_list(&bytes).unwrap();
        assert_eq!(list, vec![[1u8; 32], [2u8; 32]]);

        // Count larger than the cap is rejected before allocation
        let mut oversized = bytes.clone();
        oversized[0] = 0xFF;
        oversized[1] = 0xFF;
        assert!(Moderation::unpack_mod_list(&oversized).is_err());
    }

    #[test]
    fn test_sanctions_list_pack_roundtrip() {
        let founder = keys();
        let founder_sig = *founder.public().sig();
        let mut moderation = Moderation::new();
        moderation.make_creds(&founder);

        for i in 0..3u8 {
            let s = make_sanction(
                &founder,
                SanctionKind::Observer,
                [i + 10; 32],
                moderation.creds.hash,
            );
            moderation.add_entry(&founder_sig, s, None).unwrap();
            moderation.make_creds(&founder);
        }

        let mut w = Writer::new();
        Moderation::pack_sanctions(&moderation.sanctions, Some(&moderation.creds), &mut w);
        let bytes = w.into_bytes();

        let (sanctions, creds) = Moderation::unpack_sanctions(&bytes, 3).unwrap();
        assert_eq!(sanctions, moderation.sanctions);
        assert_eq!(creds, moderation.creds);
    }
}
