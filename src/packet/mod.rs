//! Wire framing for group traffic.
//!
//! Every frame shares a plaintext header (outer kind, chat-id hash, sender
//! encryption key, nonce) followed by an authenticated ciphertext. Lossless
//! frames carry a 64-bit message id inside the ciphertext; lossy and
//! handshake frames do not. All discriminator values are stable protocol
//! numbers.

pub mod codec;

use crate::crypto::{ENC_PUBLIC_KEY_SIZE, MAC_SIZE, NONCE_SIZE};
use crate::wire::WireError;

/// Maximum size of any group frame (UDP payload ceiling).
pub const MAX_PACKET_SIZE: usize = 65507;
/// Frames are padded with leading zeros to a multiple of this.
pub const PACKET_PADDING_ALIGN: usize = 8;
/// Byte length of the chat-id / sender hash prefix.
pub const HASH_ID_SIZE: usize = 4;
/// Byte length of a lossless message id.
pub const MESSAGE_ID_SIZE: usize = 8;

/// Plaintext header: outer kind, chat-id hash, sender encryption key, nonce.
pub const FRAME_HEADER_SIZE: usize = 1 + HASH_ID_SIZE + ENC_PUBLIC_KEY_SIZE + NONCE_SIZE;
/// Smallest valid lossless frame: header + MAC + type byte + message id.
pub const MIN_LOSSLESS_PACKET_SIZE: usize = FRAME_HEADER_SIZE + MAC_SIZE + 1 + MESSAGE_ID_SIZE;
/// Smallest valid lossy frame: header + MAC + type byte.
pub const MIN_LOSSY_PACKET_SIZE: usize = FRAME_HEADER_SIZE + MAC_SIZE + 1;

// Application bounds. Receive handlers reject lengths above these before
// touching the payload.
pub const MAX_NICK_SIZE: usize = 128;
pub const MAX_GROUP_NAME_SIZE: usize = 48;
pub const MAX_PASSWORD_SIZE: usize = 32;
pub const MAX_TOPIC_SIZE: usize = 512;
pub const MAX_PART_MESSAGE_SIZE: usize = 128;
pub const MAX_MESSAGE_SIZE: usize = 1372;

/// Outer packet discriminator. The first byte of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Handshake = 0x5a,
    Lossless = 0x5b,
    Lossy = 0x5c,
}

impl PacketKind {
    pub fn from_u8(value: u8) -> Result<Self, WireError> {
        match value {
            0x5a => Ok(PacketKind::Handshake),
            0x5b => Ok(PacketKind::Lossless),
            0x5c => Ok(PacketKind::Lossy),
            other => Err(WireError::InvalidDiscriminator(other)),
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Inner group packet type, the first non-zero cleartext byte inside the
/// ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GroupPacketType {
    SyncRequest = 91,
    SyncResponse = 92,
    InviteRequest = 93,
    InviteResponse = 94,
    InviteResponseReject = 95,
    PeerInfoRequest = 96,
    PeerInfoResponse = 97,
    PeerAnnounce = 98,
    SharedState = 99,
    ModList = 100,
    SanctionsList = 101,
    Topic = 102,
    HsResponseAck = 103,
    Broadcast = 104,
    MessageAck = 105,
    Ping = 106,
    TcpRelays = 107,
    IpPort = 108,
    CustomPacket = 109,
    /// Carried out-of-band through the outer messenger, never in a group frame.
    FriendInvite = 110,
}

impl GroupPacketType {
    pub fn from_u8(value: u8) -> Result<Self, WireError> {
        use GroupPacketType::*;
        Ok(match value {
            91 => SyncRequest,
            92 => SyncResponse,
            93 => InviteRequest,
            94 => InviteResponse,
            95 => InviteResponseReject,
            96 => PeerInfoRequest,
            97 => PeerInfoResponse,
            98 => PeerAnnounce,
            99 => SharedState,
            100 => ModList,
            101 => SanctionsList,
            102 => Topic,
            103 => HsResponseAck,
            104 => Broadcast,
            105 => MessageAck,
            106 => Ping,
            107 => TcpRelays,
            108 => IpPort,
            109 => CustomPacket,
            110 => FriendInvite,
            other => return Err(WireError::InvalidDiscriminator(other)),
        })
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Broadcast sub-type carried in the broadcast header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BroadcastType {
    Status = 0,
    Nick = 1,
    PlainMessage = 2,
    ActionMessage = 3,
    PrivateMessage = 4,
    PeerExit = 5,
    RemovePeer = 6,
    RemoveBan = 7,
    SetMod = 8,
    SetObserver = 9,
}

impl BroadcastType {
    pub fn from_u8(value: u8) -> Result<Self, WireError> {
        use BroadcastType::*;
        Ok(match value {
            0 => Status,
            1 => Nick,
            2 => PlainMessage,
            3 => ActionMessage,
            4 => PrivateMessage,
            5 => PeerExit,
            6 => RemovePeer,
            7 => RemoveBan,
            8 => SetMod,
            9 => SetObserver,
            other => return Err(WireError::InvalidDiscriminator(other)),
        })
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Reason codes sent with InviteResponseReject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectReason {
    NickTaken = 0,
    GroupFull = 1,
    InvalidPassword = 2,
    InviteFailed = 3,
}

impl RejectReason {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => RejectReason::NickTaken,
            1 => RejectReason::GroupFull,
            2 => RejectReason::InvalidPassword,
            // Unknown reasons collapse to the generic failure
            _ => RejectReason::InviteFailed,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_kind_stable_values() {
        assert_eq!(PacketKind::Handshake.as_u8(), 0x5a);
        assert_eq!(PacketKind::Lossless.as_u8(), 0x5b);
        assert_eq!(PacketKind::Lossy.as_u8(), 0x5c);
        assert!(PacketKind::from_u8(0x5d).is_err());
    }

    #[test]
    fn test_group_packet_type_roundtrip() {
        for v in 91..=110u8 {
            let ty = GroupPacketType::from_u8(v).unwrap();
            assert_eq!(ty.as_u8(), v);
        }
        assert!(GroupPacketType::from_u8(90).is_err());
        assert!(GroupPacketType::from_u8(111).is_err());
    }

    #[test]
    fn test_broadcast_type_roundtrip() {
        for v in 0..=9u8 {
            assert_eq!(BroadcastType::from_u8(v).unwrap().as_u8(), v);
        }
        assert!(BroadcastType::from_u8(10).is_err());
    }

    #[test]
    fn test_reject_reason_unknown_collapses() {
        assert_eq!(RejectReason::from_u8(200), RejectReason::InviteFailed);
    }

    #[test]
    fn test_min_sizes() {
        assert_eq!(FRAME_HEADER_SIZE, 61);
        assert_eq!(MIN_LOSSLESS_PACKET_SIZE, 86);
        assert_eq!(MIN_LOSSY_PACKET_SIZE, 78);
    }
}
