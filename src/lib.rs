// Conclave — decentralized group chat runtime
//
// A group is a self-organizing mesh of peers identified by a long-term chat
// signing key. Every peer holds an independent view; the founder's signed
// shared state is the single source of truth for group-wide configuration,
// and the moderation lists ride on it. Transport is opportunistic: direct
// UDP when a path is proven, a TCP relay channel otherwise.

pub mod crypto;
pub mod events;
pub mod group;
pub mod packet;
pub mod persistence;
pub mod session;
pub mod time;
pub mod transport;
pub mod wire;

use thiserror::Error;

pub use events::{Events, GroupObserver, MessageKind, ModerationEvent};
pub use group::{
    Group, GroupConnectionState, JoinKind, PeerStatus, Privacy, Role,
};
pub use packet::RejectReason;
pub use persistence::SavedGroup;
pub use session::{FriendInvite, GroupSession};
pub use transport::{AnnounceDirectory, AnnouncedPeer, IpPort, TcpRelayNode, Transport};

/// Errors surfaced to the embedding application. Protocol-internal failures
/// (bad packets, bad signatures) never reach this type; they are dropped at
/// the wire per the error policy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid group number")]
    InvalidGroup,

    #[error("Invalid peer id")]
    InvalidPeer,

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Group is not connected")]
    NotConnected,

    #[error("Network send failed")]
    SendFailed,

    #[error("Internal failure: {0}")]
    Internal(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::InvalidGroup.to_string(), "Invalid group number");
        assert_eq!(
            Error::InvalidArgument("nick length").to_string(),
            "Invalid argument: nick length"
        );
    }
}
