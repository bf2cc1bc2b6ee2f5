//! Audible call feedback.
//!
//! The controller owns a single "currently playing" slot per engine:
//! starting a new tone silences the previous one, and the slot is emptied
//! before the media layer of a call is released.

use std::sync::{Arc, Mutex};

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToneKind {
    /// Incoming call alert on the receiving side.
    Ringtone,
    /// Outgoing call feedback on the calling side.
    Ringback,
    /// Short chime when the first remote media arrives.
    Connected,
    /// The remote side rejected the call.
    Busy,
    /// The call terminated.
    End,
}

/// A playing tone. `stop` must be idempotent.
pub trait ToneHandle: Send + Sync {
    fn stop(&self);
}

/// Platform audio output for tones.
pub trait TonePlayer: Send + Sync {
    fn start(&self, kind: ToneKind) -> Box<dyn ToneHandle>;
}

pub struct ToneController {
    player: Arc<dyn TonePlayer>,
    current: Mutex<Option<(ToneKind, Box<dyn ToneHandle>)>>,
}

impl ToneController {
    pub fn new(player: Arc<dyn TonePlayer>) -> Self {
        Self {
            player,
            current: Mutex::new(None),
        }
    }

    /// Start `kind`, silencing whatever was playing.
    pub fn play(&self, kind: ToneKind) {
        let Ok(mut current) = self.current.lock() else {
            return;
        };
        if let Some((previous, handle)) = current.take() {
            handle.stop();
            debug!(tone = ?previous, "tone replaced");
        }
        *current = Some((kind, self.player.start(kind)));
        debug!(tone = ?kind, "tone started");
    }

    /// Silence the current tone, if any.
    pub fn stop(&self) {
        let Ok(mut current) = self.current.lock() else {
            return;
        };
        if let Some((kind, handle)) = current.take() {
            handle.stop();
            debug!(tone = ?kind, "tone stopped");
        }
    }

    pub fn current(&self) -> Option<ToneKind> {
        self.current
            .lock()
            .ok()
            .and_then(|current| current.as_ref().map(|(kind, _)| *kind))
    }
}

/// Player for headless deployments: tones become log lines.
pub struct SilentTonePlayer;

struct SilentHandle;

impl ToneHandle for SilentHandle {
    fn stop(&self) {}
}

impl TonePlayer for SilentTonePlayer {
    fn start(&self, kind: ToneKind) -> Box<dyn ToneHandle> {
        debug!(tone = ?kind, "no audio output, tone skipped");
        Box::new(SilentHandle)
    }
}
