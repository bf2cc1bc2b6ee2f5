//! Local media acquisition seam.
//!
//! The engine never talks to devices directly; it acquires a
//! [`MediaStream`] from an injected [`MediaSource`] and guarantees that
//! every acquired track is stopped on every exit path of a call.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use palaver_shared::types::CallType;

use crate::error::{CallError, MediaError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// One live device track. `stop` releases the underlying device and must be
/// idempotent.
pub trait MediaTrack: Send + Sync {
    fn kind(&self) -> TrackKind;
    fn set_enabled(&self, enabled: bool);
    fn stop(&self);
}

/// A bundle of local tracks. Clones share the same underlying tracks, so a
/// clone handed to the peer transport stays stoppable from the session that
/// acquired it.
#[derive(Clone, Default)]
pub struct MediaStream {
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl MediaStream {
    pub fn new(tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
        debug!(tracks = self.tracks.len(), "stopped local media tracks");
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
        }
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

/// Camera/microphone access. Acquisition is asynchronous and can fail
/// (permission denied, device busy); implementations must release any
/// partially opened device before returning an error.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, call_type: CallType) -> Result<MediaStream, MediaError>;
}

/// A one-shot slot bridging "accept sent" and "devices ready".
///
/// The accepting side opens its devices in the background while the accept
/// signal is already in flight; whoever needs the stream waits on the gate
/// with a bound instead of polling.
pub(crate) struct MediaGate {
    slot: Mutex<Option<Result<MediaStream, MediaError>>>,
    notify: Notify,
}

impl MediaGate {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    pub fn resolve(&self, result: Result<MediaStream, MediaError>) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(result);
        }
        self.notify.notify_waiters();
    }

    /// Wait up to `limit` for the acquisition outcome.
    pub async fn wait(&self, limit: Duration) -> Result<MediaStream, CallError> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let notified = self.notify.notified();
            if let Ok(slot) = self.slot.lock() {
                if let Some(result) = slot.as_ref() {
                    return result.clone().map_err(CallError::Media);
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Err(CallError::MediaTimeout),
            }
        }
    }
}
