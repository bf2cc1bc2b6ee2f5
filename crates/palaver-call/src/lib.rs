//! # palaver-call
//!
//! The call signaling engine: a per-user state machine driven by the four
//! call signals (`call_incoming`, `call_accepted`, `call_rejected`,
//! `call_ended`) plus local user actions. Media devices, the peer transport,
//! tone playback, and signal delivery are all injected behind traits so the
//! engine itself stays deterministic and testable.

pub mod config;
pub mod engine;
pub mod media;
pub mod peer;
pub mod session;
pub mod signal;
pub mod tones;

mod error;

pub use config::{CallConfig, IceConfig};
pub use engine::CallEngine;
pub use error::{CallError, MediaError, PeerError, SignalError};
pub use media::{MediaSource, MediaStream, MediaTrack, TrackKind};
pub use peer::{
    InboundCall, InboundResponder, LinkEvent, PeerCall, PeerConnector, PeerEndpoint,
    PeerEndpointRegistry, PeerLink,
};
pub use session::{CallSession, CallStatus};
pub use signal::{RegistrySignalSender, SignalSender};
pub use tones::{SilentTonePlayer, ToneController, ToneHandle, ToneKind, TonePlayer};
