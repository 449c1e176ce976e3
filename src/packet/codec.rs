// Frame wrap/unwrap.
//
// Outer layout, cleartext:
//   [1 kind][4 chat-id hash][32 sender encryption key][24 nonce][ciphertext]
//
// Session ciphertext cleartext:
//   [zero padding][1 inner type][8 message id, lossless only][payload]
//
// Padding is variable, aligns the frame to a multiple of 8, and is stripped
// on receive by skipping leading zero bytes; inner type values never collide
// with zero. Handshake frames box their payload under the static handshake
// key with no padding.

use thiserror::Error;

use crate::crypto::{
    open_precomputed, seal_precomputed, CryptoError, SharedKey, ENC_PUBLIC_KEY_SIZE, MAC_SIZE,
    NONCE_SIZE,
};
use crate::wire::{Reader, WireError, Writer};

use super::{
    PacketKind, FRAME_HEADER_SIZE, HASH_ID_SIZE, MAX_PACKET_SIZE, MESSAGE_ID_SIZE,
    MIN_LOSSLESS_PACKET_SIZE, MIN_LOSSY_PACKET_SIZE, PACKET_PADDING_ALIGN,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes (max {MAX_PACKET_SIZE})")]
    FrameTooLarge(usize),

    #[error("Frame too short: need {need} bytes, got {got}")]
    FrameTooShort { need: usize, got: usize },

    #[error("Empty plaintext after padding strip")]
    EmptyPlaintext,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// The cleartext header shared by every group frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: PacketKind,
    pub chat_id_hash: u32,
    pub sender_enc_pk: [u8; ENC_PUBLIC_KEY_SIZE],
    pub nonce: [u8; NONCE_SIZE],
}

/// Splits a raw datagram into its header and ciphertext without decrypting.
pub fn parse_frame(packet: &[u8]) -> Result<(FrameHeader, &[u8]), CodecError> {
    if packet.len() > MAX_PACKET_SIZE {
        return Err(CodecError::FrameTooLarge(packet.len()));
    }
    if packet.len() < FRAME_HEADER_SIZE + MAC_SIZE {
        return Err(CodecError::FrameTooShort {
            need: FRAME_HEADER_SIZE + MAC_SIZE,
            got: packet.len(),
        });
    }

    let mut r = Reader::new(packet);
    let kind = PacketKind::from_u8(r.take_u8()?)?;
    let chat_id_hash = r.take_u32()?;
    let sender_enc_pk: [u8; ENC_PUBLIC_KEY_SIZE] = r.take_array()?;
    let nonce: [u8; NONCE_SIZE] = r.take_array()?;
    let ciphertext = r.take_rest();

    Ok((
        FrameHeader {
            kind,
            chat_id_hash,
            sender_enc_pk,
            nonce,
        },
        ciphertext,
    ))
}

/// Reads just the outer kind and chat-id hash, for dispatch before any group
/// state is touched.
pub fn peek_dispatch(packet: &[u8]) -> Result<(PacketKind, u32), CodecError> {
    if packet.len() <= 1 + HASH_ID_SIZE {
        return Err(CodecError::FrameTooShort {
            need: 1 + HASH_ID_SIZE + 1,
            got: packet.len(),
        });
    }
    let mut r = Reader::new(packet);
    let kind = PacketKind::from_u8(r.take_u8()?)?;
    let hash = r.take_u32()?;
    Ok((kind, hash))
}

fn padding_for(length: usize) -> usize {
    (MAX_PACKET_SIZE - length) % PACKET_PADDING_ALIGN
}

fn write_header(w: &mut Writer, kind: PacketKind, chat_id_hash: u32, sender_pk: &[u8; ENC_PUBLIC_KEY_SIZE], nonce: &[u8; NONCE_SIZE]) {
    w.put_u8(kind.as_u8());
    w.put_u32(chat_id_hash);
    w.put_bytes(sender_pk);
    w.put_bytes(nonce);
}

/// Builds a complete lossless or lossy frame.
///
/// `message_id` must be `Some` exactly for [`PacketKind::Lossless`].
pub fn wrap_session_packet(
    kind: PacketKind,
    chat_id_hash: u32,
    sender_enc_pk: &[u8; ENC_PUBLIC_KEY_SIZE],
    shared_key: &SharedKey,
    packet_type: u8,
    message_id: Option<u64>,
    payload: &[u8],
) -> Result<Vec<u8>, CodecError> {
    debug_assert_eq!(kind == PacketKind::Lossless, message_id.is_some());

    let padding = padding_for(payload.len());
    let inner_header = 1 + if message_id.is_some() { MESSAGE_ID_SIZE } else { 0 };
    let total = FRAME_HEADER_SIZE + MAC_SIZE + padding + inner_header + payload.len();

    if total > MAX_PACKET_SIZE {
        return Err(CodecError::FrameTooLarge(total));
    }

    let mut plain = Writer::with_capacity(padding + inner_header + payload.len());
    plain.put_bytes(&vec![0u8; padding]);
    plain.put_u8(packet_type);
    if let Some(id) = message_id {
        plain.put_u64(id);
    }
    plain.put_bytes(payload);

    let nonce = crate::crypto::new_nonce();
    let ciphertext = seal_precomputed(shared_key, &nonce, &plain.into_bytes())?;

    let mut w = Writer::with_capacity(FRAME_HEADER_SIZE + ciphertext.len());
    write_header(&mut w, kind, chat_id_hash, sender_enc_pk, &nonce);
    w.put_bytes(&ciphertext);

    Ok(w.into_bytes())
}

/// The decrypted interior of a session frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPlain {
    pub packet_type: u8,
    pub message_id: Option<u64>,
    pub payload: Vec<u8>,
}

/// Decrypts a session frame and strips the padding.
pub fn open_session_packet(
    header: &FrameHeader,
    ciphertext: &[u8],
    shared_key: &SharedKey,
) -> Result<SessionPlain, CodecError> {
    let lossless = header.kind == PacketKind::Lossless;
    let min_total = if lossless {
        MIN_LOSSLESS_PACKET_SIZE
    } else {
        MIN_LOSSY_PACKET_SIZE
    };
    if FRAME_HEADER_SIZE + ciphertext.len() < min_total {
        return Err(CodecError::FrameTooShort {
            need: min_total,
            got: FRAME_HEADER_SIZE + ciphertext.len(),
        });
    }

    let plain = open_precomputed(shared_key, &header.nonce, ciphertext)?;

    let min_plain = 1 + if lossless { MESSAGE_ID_SIZE } else { 0 };
    let mut start = 0usize;
    while start < plain.len() && plain[start] == 0 {
        start += 1;
        if plain.len() - start < min_plain {
            return Err(CodecError::EmptyPlaintext);
        }
    }
    if plain.len() - start < min_plain {
        return Err(CodecError::EmptyPlaintext);
    }

    let mut r = Reader::new(&plain[start..]);
    let packet_type = r.take_u8()?;
    let message_id = if lossless { Some(r.take_u64()?) } else { None };
    let payload = r.take_rest().to_vec();

    Ok(SessionPlain {
        packet_type,
        message_id,
        payload,
    })
}

/// Builds a handshake frame: the payload boxed under the static handshake key.
pub fn wrap_handshake_packet(
    chat_id_hash: u32,
    sender_enc_pk: &[u8; ENC_PUBLIC_KEY_SIZE],
    handshake_key: &SharedKey,
    payload: &[u8],
) -> Result<Vec<u8>, CodecError> {
    let total = FRAME_HEADER_SIZE + MAC_SIZE + payload.len();
    if total > MAX_PACKET_SIZE {
        return Err(CodecError::FrameTooLarge(total));
    }

    let nonce = crate::crypto::new_nonce();
    let ciphertext = seal_precomputed(handshake_key, &nonce, payload)?;

    let mut w = Writer::with_capacity(FRAME_HEADER_SIZE + ciphertext.len());
    write_header(&mut w, PacketKind::Handshake, chat_id_hash, sender_enc_pk, &nonce);
    w.put_bytes(&ciphertext);

    Ok(w.into_bytes())
}

/// Decrypts a handshake frame.
pub fn open_handshake_packet(
    header: &FrameHeader,
    ciphertext: &[u8],
    handshake_key: &SharedKey,
) -> Result<Vec<u8>, CodecError> {
    if ciphertext.len() < MAC_SIZE + 1 {
        return Err(CodecError::FrameTooShort {
            need: FRAME_HEADER_SIZE + MAC_SIZE + 1,
            got: FRAME_HEADER_SIZE + ciphertext.len(),
        });
    }
    Ok(open_precomputed(handshake_key, &header.nonce, ciphertext)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{precompute_session_key, SessionKeys};
    use crate::packet::GroupPacketType;

    fn shared_pair() -> (SharedKey, SharedKey) {
        let a = SessionKeys::generate();
        let b = SessionKeys::generate();
        (
            precompute_session_key(a.secret(), b.public()),
            precompute_session_key(b.secret(), a.public()),
        )
    }

    #[test]
    fn test_lossless_roundtrip() {
        let (tx, rx) = shared_pair();
        let sender_pk = [3u8; 32];

        let frame = wrap_session_packet(
            PacketKind::Lossless,
            0xAABBCCDD,
            &sender_pk,
            &tx,
            GroupPacketType::Broadcast.as_u8(),
            Some(42),
            b"group payload",
        )
        .unwrap();

        // Frame carries the expected zero padding for this payload length
        let padding = (MAX_PACKET_SIZE - 13) % PACKET_PADDING_ALIGN;
        assert_eq!(
            frame.len(),
            FRAME_HEADER_SIZE + MAC_SIZE + padding + 1 + MESSAGE_ID_SIZE + 13
        );

        let (header, ciphertext) = parse_frame(&frame).unwrap();
        assert_eq!(header.kind, PacketKind::Lossless);
        assert_eq!(header.chat_id_hash, 0xAABBCCDD);
        assert_eq!(header.sender_enc_pk, sender_pk);

        let plain = open_session_packet(&header, ciphertext, &rx).unwrap();
        assert_eq!(plain.packet_type, GroupPacketType::Broadcast.as_u8());
        assert_eq!(plain.message_id, Some(42));
        assert_eq!(plain.payload, b"group payload");
    }

    #[test]
    fn test_lossy_roundtrip() {
        let (tx, rx) = shared_pair();
        let frame = wrap_session_packet(
            PacketKind::Lossy,
            7,
            &[9u8; 32],
            &tx,
            GroupPacketType::Ping.as_u8(),
            None,
            &[1, 2, 3, 4],
        )
        .unwrap();

        let (header, ciphertext) = parse_frame(&frame).unwrap();
        let plain = open_session_packet(&header, ciphertext, &rx).unwrap();
        assert_eq!(plain.packet_type, GroupPacketType::Ping.as_u8());
        assert_eq!(plain.message_id, None);
        assert_eq!(plain.payload, &[1, 2, 3, 4]);
    }

    #[test]
    fn test_tampered_frame_rejected() {
        let (tx, rx) = shared_pair();
        let mut frame = wrap_session_packet(
            PacketKind::Lossy,
            7,
            &[9u8; 32],
            &tx,
            GroupPacketType::Ping.as_u8(),
            None,
            &[1, 2, 3, 4],
        )
        .unwrap();

        let last = frame.len() - 1;
        frame[last] ^= 0x01;

        let (header, ciphertext) = parse_frame(&frame).unwrap();
        assert!(matches!(
            open_session_packet(&header, ciphertext, &rx),
            Err(CodecError::Crypto(CryptoError::DecryptionFailed))
        ));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let (tx, _) = shared_pair();
        let (_, other) = shared_pair();
        let frame = wrap_session_packet(
            PacketKind::Lossy,
            7,
            &[9u8; 32],
            &tx,
            GroupPacketType::Ping.as_u8(),
            None,
            &[1],
        )
        .unwrap();
        let (header, ciphertext) = parse_frame(&frame).unwrap();
        assert!(open_session_packet(&header, ciphertext, &other).is_err());
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let bytes = [0x5b, 0, 0, 0, 1, 2, 3];
        assert!(matches!(
            parse_frame(&bytes),
            Err(CodecError::FrameTooShort { .. })
        ));
    }

    #[test]
    fn test_unknown_outer_kind_rejected() {
        let mut bytes = vec![0xFF];
        bytes.extend_from_slice(&[0u8; 100]);
        assert!(parse_frame(&bytes).is_err());
    }

    #[test]
    fn test_handshake_roundtrip() {
        use crate::crypto::{precompute_handshake_key, ExtendedKeyPair};

        let alice = ExtendedKeyPair::generate();
        let bob = ExtendedKeyPair::generate();
        let tx = precompute_handshake_key(alice.enc_secret(), bob.public().enc());
        let rx = precompute_handshake_key(bob.enc_secret(), alice.public().enc());

        let frame = wrap_handshake_packet(11, alice.public().enc(), &tx, b"hs data").unwrap();
        let (header, ciphertext) = parse_frame(&frame).unwrap();
        assert_eq!(header.kind, PacketKind::Handshake);
        assert_eq!(&header.sender_enc_pk, alice.public().enc());

        let plain = open_handshake_packet(&header, ciphertext, &rx).unwrap();
        assert_eq!(plain, b"hs data");
    }

    #[test]
    fn test_peek_dispatch() {
        let (tx, _) = shared_pair();
        let frame = wrap_session_packet(
            PacketKind::Lossy,
            0x01020304,
            &[9u8; 32],
            &tx,
            GroupPacketType::Ping.as_u8(),
            None,
            &[1],
        )
        .unwrap();
        let (kind, hash) = peek_dispatch(&frame).unwrap();
        assert_eq!(kind, PacketKind::Lossy);
        assert_eq!(hash, 0x01020304);
    }

    #[test]
    fn test_oversize_rejected() {
        let (tx, _) = shared_pair();
        let payload = vec![0xAAu8; MAX_PACKET_SIZE];
        assert!(matches!(
            wrap_session_packet(
                PacketKind::Lossy,
                0,
                &[0u8; 32],
                &tx,
                GroupPacketType::CustomPacket.as_u8(),
                None,
                &payload,
            ),
            Err(CodecError::FrameTooLarge(_))
        ));
    }
}
