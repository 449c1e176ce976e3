// Upward callback surface.
//
// The embedding application attaches one observer per session; every group
// event funnels through it. The observer slot lives behind a lock so it can
// be swapped while the session is shared with the network layer.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::group::{PeerStatus, Privacy};
use crate::packet::RejectReason;

/// Moderation events reported to the application and carried in RemovePeer
/// broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModerationEvent {
    Kick = 0,
    Ban = 1,
    Observer = 2,
    User = 3,
    Moderator = 4,
}

impl ModerationEvent {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ModerationEvent::Kick),
            1 => Some(ModerationEvent::Ban),
            2 => Some(ModerationEvent::Observer),
            3 => Some(ModerationEvent::User),
            4 => Some(ModerationEvent::Moderator),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Message flavor for plain group messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Normal,
    Action,
}

/// Callback interface for group events.
///
/// All methods default to no-ops so observers only implement what they need.
#[allow(unused_variables)]
pub trait GroupObserver: Send + Sync {
    fn on_message(&self, group_number: u32, peer_id: u32, kind: MessageKind, message: &[u8]) {}
    fn on_private_message(&self, group_number: u32, peer_id: u32, message: &[u8]) {}
    fn on_custom_packet(&self, group_number: u32, peer_id: u32, data: &[u8]) {}
    fn on_moderation(
        &self,
        group_number: u32,
        source_peer_id: u32,
        target_peer_id: u32,
        event: ModerationEvent,
    ) {
    }
    fn on_nick_change(&self, group_number: u32, peer_id: u32, nick: &[u8]) {}
    fn on_status_change(&self, group_number: u32, peer_id: u32, status: PeerStatus) {}
    fn on_topic_change(&self, group_number: u32, peer_id: u32, topic: &[u8]) {}
    fn on_peer_limit(&self, group_number: u32, limit: u32) {}
    fn on_privacy_state(&self, group_number: u32, privacy: Privacy) {}
    fn on_password(&self, group_number: u32, password: &[u8]) {}
    fn on_peer_join(&self, group_number: u32, peer_id: u32) {}
    fn on_peer_exit(&self, group_number: u32, peer_id: u32, part_message: &[u8]) {}
    fn on_self_join(&self, group_number: u32) {}
    fn on_rejected(&self, group_number: u32, reason: RejectReason) {}
}

/// Cloneable handle to the session's observer slot.
#[derive(Clone, Default)]
pub struct Events {
    observer: Arc<RwLock<Option<Arc<dyn GroupObserver>>>>,
}

impl Events {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_observer(&self, observer: Option<Box<dyn GroupObserver>>) {
        *self.observer.write() = observer.map(|o| Arc::from(o) as Arc<dyn GroupObserver>);
    }

    /// Runs `f` against the observer, if one is attached.
    pub(crate) fn emit<F: FnOnce(&dyn GroupObserver)>(&self, f: F) {
        if let Some(observer) = self.observer.read().as_ref() {
            f(observer.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counter(AtomicU32);

    impl GroupObserver for Counter {
        fn on_peer_join(&self, _group_number: u32, _peer_id: u32) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_emit_without_observer_is_noop() {
        let events = Events::new();
        events.emit(|o| o.on_peer_join(0, 0));
    }

    #[test]
    fn test_emit_reaches_observer() {
        let events = Events::new();
        events.set_observer(Some(Box::new(Counter(AtomicU32::new(0)))));
        events.emit(|o| o.on_peer_join(1, 2));
        events.emit(|o| o.on_peer_join(1, 3));
        // Detach works
        events.set_observer(None);
        events.emit(|o| o.on_peer_join(1, 4));
    }

    #[test]
    fn test_moderation_event_roundtrip() {
        for v in 0..=4u8 {
            assert_eq!(ModerationEvent::from_u8(v).unwrap().as_u8(), v);
        }
        assert!(ModerationEvent::from_u8(5).is_none());
    }
}
