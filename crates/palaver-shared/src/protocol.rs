//! Wire protocol: per-user push events and call signaling payloads.
//!
//! Every event delivered to a user's channel serializes as
//! `{"type": "...", "data": {...}}` so a browser client can dispatch on the
//! `type` string. Call signals additionally travel as the body of
//! `POST /call/signal` (see [`SignalEnvelope`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CallId, CallType, ConversationId, MessageId, UserId, UserProfile};

/// The four signal names that drive the call state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallSignalKind {
    CallIncoming,
    CallAccepted,
    CallRejected,
    CallEnded,
}

impl CallSignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallSignalKind::CallIncoming => "call_incoming",
            CallSignalKind::CallAccepted => "call_accepted",
            CallSignalKind::CallRejected => "call_rejected",
            CallSignalKind::CallEnded => "call_ended",
        }
    }
}

/// Body of a call signal, minus its `type` tag.
///
/// `peer_id` is the sender's advertised peer transport address; it is present
/// on `call_incoming` and `call_accepted` and must never be assumed to equal
/// any previously known identifier for that user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallSignal {
    pub call_id: CallId,
    pub call_type: CallType,
    pub caller: UserProfile,
    pub receiver: UserProfile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CallSignal {
    /// The counterpart of `actor` in this signal, if `actor` is a party to it.
    pub fn counterpart_of(&self, actor: &UserId) -> Option<&UserProfile> {
        if *actor == self.caller.id {
            Some(&self.receiver)
        } else if *actor == self.receiver.id {
            Some(&self.caller)
        } else {
            None
        }
    }
}

/// The `POST /call/signal` request body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: CallSignalKind,
    #[serde(flatten)]
    pub signal: CallSignal,
}

impl SignalEnvelope {
    pub fn into_event(self) -> PushEvent {
        PushEvent::from_signal(self.kind, self.signal)
    }
}

/// Compact message payload carried inside `new_message` events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageNotice {
    pub id: MessageId,
    pub sender_id: Option<UserId>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Everything that can land on a user's delivery channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PushEvent {
    #[serde(rename_all = "camelCase")]
    NewConversation { conversation_id: ConversationId },

    #[serde(rename_all = "camelCase")]
    NewBroadcastChannel {
        conversation_id: ConversationId,
        name: String,
    },

    #[serde(rename_all = "camelCase")]
    NewMessage {
        conversation_id: ConversationId,
        message: MessageNotice,
    },

    /// Emitted alongside `new_message` for broadcast conversations so clients
    /// can render channel-specific notifications.
    #[serde(rename_all = "camelCase")]
    NewBroadcastMessage {
        conversation_id: ConversationId,
        channel_name: String,
        message: MessageNotice,
    },

    #[serde(rename_all = "camelCase")]
    MessagesRead {
        conversation_id: ConversationId,
        read_by_user_id: UserId,
        timestamp: DateTime<Utc>,
    },

    CallIncoming(CallSignal),
    CallAccepted(CallSignal),
    CallRejected(CallSignal),
    CallEnded(CallSignal),
}

impl PushEvent {
    pub fn from_signal(kind: CallSignalKind, signal: CallSignal) -> Self {
        match kind {
            CallSignalKind::CallIncoming => PushEvent::CallIncoming(signal),
            CallSignalKind::CallAccepted => PushEvent::CallAccepted(signal),
            CallSignalKind::CallRejected => PushEvent::CallRejected(signal),
            CallSignalKind::CallEnded => PushEvent::CallEnded(signal),
        }
    }

    /// The wire `type` string, for log fields and diagnostics counters.
    pub fn event_type(&self) -> &'static str {
        match self {
            PushEvent::NewConversation { .. } => "new_conversation",
            PushEvent::NewBroadcastChannel { .. } => "new_broadcast_channel",
            PushEvent::NewMessage { .. } => "new_message",
            PushEvent::NewBroadcastMessage { .. } => "new_broadcast_message",
            PushEvent::MessagesRead { .. } => "messages_read",
            PushEvent::CallIncoming(_) => "call_incoming",
            PushEvent::CallAccepted(_) => "call_accepted",
            PushEvent::CallRejected(_) => "call_rejected",
            PushEvent::CallEnded(_) => "call_ended",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_signal() -> CallSignal {
        CallSignal {
            call_id: CallId::new(),
            call_type: CallType::Video,
            caller: UserProfile::new(UserId::new(), "alice"),
            receiver: UserProfile::new(UserId::new(), "bob"),
            peer_id: Some("alice-peer".into()),
            reason: None,
        }
    }

    #[test]
    fn test_signal_envelope_wire_shape() {
        let envelope = SignalEnvelope {
            kind: CallSignalKind::CallIncoming,
            signal: sample_signal(),
        };

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "call_incoming");
        assert_eq!(value["callType"], "video");
        assert_eq!(value["peerId"], "alice-peer");
        assert!(value.get("reason").is_none());

        let restored: SignalEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(restored, envelope);
    }

    #[test]
    fn test_push_event_type_tags() {
        let event = PushEvent::MessagesRead {
            conversation_id: ConversationId::new(),
            read_by_user_id: UserId::new(),
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "messages_read");
        assert!(value["data"]["readByUserId"].is_string());
        assert_eq!(event.event_type(), "messages_read");
    }

    #[test]
    fn test_signal_event_roundtrip() {
        let event = PushEvent::from_signal(CallSignalKind::CallEnded, sample_signal());
        assert_eq!(event.event_type(), "call_ended");

        let json = serde_json::to_string(&event).unwrap();
        let restored: PushEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, event);
    }

    #[test]
    fn test_counterpart_of() {
        let signal = sample_signal();
        let outsider = UserId::new();
        assert_eq!(
            signal.counterpart_of(&signal.caller.id).unwrap().id,
            signal.receiver.id
        );
        assert_eq!(
            signal.counterpart_of(&signal.receiver.id).unwrap().id,
            signal.caller.id
        );
        assert!(signal.counterpart_of(&outsider).is_none());
    }
}
