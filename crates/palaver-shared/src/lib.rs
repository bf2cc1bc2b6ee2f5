//! # palaver-shared
//!
//! Identifier newtypes, user profiles, and the wire protocol shared by the
//! messaging service, the delivery registry, and the call signaling engine.

pub mod protocol;
pub mod types;

pub use protocol::{CallSignal, CallSignalKind, MessageNotice, PushEvent, SignalEnvelope};
pub use types::{CallId, CallType, ConversationId, MessageId, UserId, UserProfile};
