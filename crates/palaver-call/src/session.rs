//! The ephemeral per-call session record.
//!
//! Nothing here is persisted. Each side of a call reconstructs its own
//! session from signaling events, which is why the engine treats every
//! signal handler as idempotent.

use chrono::{DateTime, Utc};
use serde::Serialize;

use palaver_shared::protocol::CallSignal;
use palaver_shared::types::{CallId, CallType, UserProfile};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Idle,
    Calling,
    Ringing,
    Connecting,
    Connected,
    Ended,
    Rejected,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Ended | CallStatus::Rejected)
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CallStatus::Idle => "idle",
            CallStatus::Calling => "calling",
            CallStatus::Ringing => "ringing",
            CallStatus::Connecting => "connecting",
            CallStatus::Connected => "connected",
            CallStatus::Ended => "ended",
            CallStatus::Rejected => "rejected",
        };
        write!(f, "{s}")
    }
}

/// One call attempt as seen from one side.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub call_id: CallId,
    pub call_type: CallType,
    pub caller: UserProfile,
    pub receiver: UserProfile,
    pub is_outgoing: bool,
    pub status: CallStatus,
    /// The caller's advertised transport address, as carried by the offer
    /// signal.
    pub caller_peer_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub is_muted: bool,
    pub is_video_enabled: bool,
    pub is_speaker_on: bool,
}

impl CallSession {
    /// A freshly started outgoing call.
    pub fn outgoing(call_type: CallType, caller: UserProfile, receiver: UserProfile) -> Self {
        Self {
            call_id: CallId::new(),
            call_type,
            caller,
            receiver,
            is_outgoing: true,
            status: CallStatus::Calling,
            caller_peer_id: None,
            start_time: None,
            end_time: None,
            is_muted: false,
            is_video_enabled: matches!(call_type, CallType::Video),
            is_speaker_on: false,
        }
    }

    /// A ringing call reconstructed from an incoming offer signal.
    pub fn incoming(signal: &CallSignal) -> Self {
        Self {
            call_id: signal.call_id,
            call_type: signal.call_type,
            caller: signal.caller.clone(),
            receiver: signal.receiver.clone(),
            is_outgoing: false,
            status: CallStatus::Ringing,
            caller_peer_id: signal.peer_id.clone(),
            start_time: None,
            end_time: None,
            is_muted: false,
            is_video_enabled: matches!(signal.call_type, CallType::Video),
            is_speaker_on: false,
        }
    }

    pub fn remote_party(&self) -> &UserProfile {
        if self.is_outgoing {
            &self.receiver
        } else {
            &self.caller
        }
    }

    /// A signal body addressing this call, without peer address or reason.
    pub fn to_signal(&self) -> CallSignal {
        CallSignal {
            call_id: self.call_id,
            call_type: self.call_type,
            caller: self.caller.clone(),
            receiver: self.receiver.clone(),
            peer_id: None,
            reason: None,
        }
    }
}
