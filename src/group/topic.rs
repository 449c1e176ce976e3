// Group topic: set by the founder or any moderator, signed under the
// setter's own signature key, versioned monotonically. On a version tie the
// held topic wins, which keeps synced peers from flapping between equally
// recent values.

use tracing::debug;

use crate::crypto::{keys::verify_sig, SIGNATURE_SIZE, SIG_PUBLIC_KEY_SIZE};
use crate::packet::{GroupPacketType, MAX_TOPIC_SIZE};
use crate::wire::{Reader, WireError, Writer};
use crate::Error;

use super::{Group, GroupConnectionState, HandleError, Role};

/// Fixed part of a packed topic: length prefix, signer key, version.
pub const MIN_PACKED_TOPIC_SIZE: usize = 2 + SIG_PUBLIC_KEY_SIZE + 4;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopicInfo {
    pub topic: Vec<u8>,
    pub public_sig_key: [u8; SIG_PUBLIC_KEY_SIZE],
    pub version: u32,
}

impl TopicInfo {
    pub fn pack(&self, w: &mut Writer) {
        w.put_u16(self.topic.len() as u16);
        w.put_bytes(&self.topic);
        w.put_bytes(&self.public_sig_key);
        w.put_u32(self.version);
    }

    pub fn packed(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(self.topic.len() + MIN_PACKED_TOPIC_SIZE);
        self.pack(&mut w);
        w.into_bytes()
    }

    pub fn unpack(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let length = r.take_u16()? as usize;
        if length > MAX_TOPIC_SIZE {
            return Err(WireError::FieldOutOfBounds("topic length"));
        }
        let topic = r.take_bytes(length)?.to_vec();
        let public_sig_key: [u8; SIG_PUBLIC_KEY_SIZE] = r.take_array()?;
        let version = r.take_u32()?;
        Ok(Self {
            topic,
            public_sig_key,
            version,
        })
    }
}

impl Group {
    /// `[signature ‖ packed topic]`, the body of a Topic packet.
    pub(crate) fn make_topic_body(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(SIGNATURE_SIZE + self.topic.topic.len() + MIN_PACKED_TOPIC_SIZE);
        w.put_bytes(&self.topic_sig);
        w.put_bytes(&self.topic.packed());
        w.into_bytes()
    }

    pub(crate) fn send_topic_to(&mut self, index: usize) -> Result<(), Error> {
        let body = self.make_topic_body();
        self.send_lossless_to(index, GroupPacketType::Topic, &body)
    }

    pub(crate) fn broadcast_topic(&mut self) {
        let body = self.make_topic_body();
        self.send_lossless_all(GroupPacketType::Topic, &body);
    }

    /// Sets and broadcasts the topic. Caller must be founder or moderator.
    pub fn set_topic(&mut self, topic: &[u8]) -> Result<(), Error> {
        if topic.len() > MAX_TOPIC_SIZE {
            return Err(Error::InvalidArgument("topic too long"));
        }
        if self.self_role() > Role::Moderator {
            return Err(Error::PermissionDenied);
        }

        if self.topic.version != u32::MAX {
            self.topic.version += 1;
        }
        self.topic.topic = topic.to_vec();
        self.topic.public_sig_key = *self.self_keys.public().sig();
        self.topic_sig = self.self_keys.sign(&self.topic.packed());

        debug!(group = self.group_number, version = self.topic.version, "topic set");
        self.broadcast_topic();
        Ok(())
    }

    /// Re-signs the topic under our own key if `old_sig_pk` set it. Called by
    /// the founder when a moderator is demoted.
    pub(crate) fn refresh_topic_after_demotion(
        &mut self,
        old_sig_pk: &[u8; SIG_PUBLIC_KEY_SIZE],
    ) -> Result<(), Error> {
        if &self.topic.public_sig_key != old_sig_pk {
            return Ok(());
        }
        let text = self.topic.topic.clone();
        self.set_topic(&text)
    }

    pub(crate) fn handle_topic(&mut self, index: usize, body: &[u8]) -> Result<(), HandleError> {
        if body.len() < SIGNATURE_SIZE + MIN_PACKED_TOPIC_SIZE
            || body.len() > SIGNATURE_SIZE + MAX_TOPIC_SIZE + MIN_PACKED_TOPIC_SIZE
        {
            return Err(HandleError::Malformed);
        }

        let mut r = Reader::new(body);
        let signature: [u8; SIGNATURE_SIZE] = r.take_array()?;
        let packed = r.take_rest();

        let mut pr = Reader::new(packed);
        let info = TopicInfo::unpack(&mut pr)?;
        pr.finish()?;

        // The signer must currently be seated as founder or moderator
        if !self.moderation.verify_sig_pk(
            self.shared_state.founder_public_key.sig(),
            &info.public_sig_key,
        ) {
            return Err(HandleError::Auth);
        }

        if verify_sig(&info.public_sig_key, packed, &signature).is_err() {
            return Err(HandleError::Auth);
        }

        // Version monotone; the held topic wins ties
        if info.version <= self.topic.version {
            return Ok(());
        }

        let unchanged = self.topic.topic == info.topic;
        let setter_peer_id = self
            .peer_index_by_sig_pk(&info.public_sig_key)
            .map(|i| self.peers[i].info.peer_id);

        self.topic = info;
        self.topic_sig = signature;

        if !unchanged && self.connection_state == GroupConnectionState::Connected {
            let gn = self.group_number;
            let topic = self.topic.topic.clone();
            let peer_id = setter_peer_id.unwrap_or_else(|| self.peers[index].info.peer_id);
            self.events.emit(|o| o.on_topic_change(gn, peer_id, &topic));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_pack_roundtrip() {
        let info = TopicInfo {
            topic: b"release day".to_vec(),
            public_sig_key: [5u8; 32],
            version: 3,
        };
        let packed = info.packed();
        assert_eq!(packed.len(), MIN_PACKED_TOPIC_SIZE + 11);

        let mut r = Reader::new(&packed);
        let unpacked = TopicInfo::unpack(&mut r).unwrap();
        r.finish().unwrap();
        assert_eq!(unpacked, info);
    }

    #[test]
    fn test_topic_oversize_length_rejected() {
        let mut w = Writer::new();
        w.put_u16((MAX_TOPIC_SIZE + 1) as u16);
        w.put_bytes(&vec![0u8; MAX_TOPIC_SIZE + 1]);
        w.put_bytes(&[0u8; 32]);
        w.put_u32(1);
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        assert!(TopicInfo::unpack(&mut r).is_err());
    }

    #[test]
    fn test_topic_truncation_rejected() {
        let info = TopicInfo {
            topic: b"abc".to_vec(),
            public_sig_key: [5u8; 32],
            version: 1,
        };
        let packed = info.packed();
        let mut r = Reader::new(&packed[..packed.len() - 2]);
        assert!(TopicInfo::unpack(&mut r).is_err());
    }
}
