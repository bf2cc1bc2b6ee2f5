//! The per-user call state machine.
//!
//! States: `idle → calling|ringing → connecting → connected →
//! ended|rejected → idle`. The engine reacts to the four call signals plus
//! local user actions; every handler is idempotent under duplicate
//! delivery, and every exit path stops the local media tracks and the
//! current tone.
//!
//! Failures are absorbed into state transitions rather than returned;
//! there is no synchronous caller to report to once a call is in flight.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use palaver_shared::protocol::{CallSignal, CallSignalKind, PushEvent};
use palaver_shared::types::{CallType, UserProfile};

use crate::config::CallConfig;
use crate::media::{MediaGate, MediaSource, MediaStream, TrackKind};
use crate::peer::{LinkEvent, PeerCall, PeerEndpoint, PeerEndpointRegistry, PeerLink};
use crate::session::{CallSession, CallStatus};
use crate::signal::SignalSender;
use crate::tones::{ToneController, ToneKind, TonePlayer};

struct ActiveCall {
    session: CallSession,
    media: Option<MediaStream>,
    media_gate: Option<Arc<MediaGate>>,
    link: Option<Box<dyn PeerLink>>,
    /// Set once an outbound `call_ended` has been sent, or once the remote
    /// side terminated; either way no further end signal may leave.
    end_sent: bool,
}

impl ActiveCall {
    fn new(session: CallSession) -> Self {
        Self {
            session,
            media: None,
            media_gate: None,
            link: None,
            end_sent: false,
        }
    }
}

struct EngineState {
    call: Option<ActiveCall>,
    /// Bumped whenever a session is installed or cleared, so tasks spawned
    /// for an earlier call can never touch a later one.
    epoch: u64,
}

pub struct CallEngine {
    local: UserProfile,
    media: Arc<dyn MediaSource>,
    endpoints: Arc<PeerEndpointRegistry>,
    signals: Arc<dyn SignalSender>,
    tones: ToneController,
    config: CallConfig,
    state: Mutex<EngineState>,
}

impl CallEngine {
    pub fn new(
        local: UserProfile,
        media: Arc<dyn MediaSource>,
        endpoints: Arc<PeerEndpointRegistry>,
        signals: Arc<dyn SignalSender>,
        tone_player: Arc<dyn TonePlayer>,
        config: CallConfig,
    ) -> Self {
        Self {
            local,
            media,
            endpoints,
            signals,
            tones: ToneController::new(tone_player),
            config,
            state: Mutex::new(EngineState {
                call: None,
                epoch: 0,
            }),
        }
    }

    pub async fn status(&self) -> CallStatus {
        self.state
            .lock()
            .await
            .call
            .as_ref()
            .map(|call| call.session.status)
            .unwrap_or(CallStatus::Idle)
    }

    pub async fn session(&self) -> Option<CallSession> {
        self.state
            .lock()
            .await
            .call
            .as_ref()
            .map(|call| call.session.clone())
    }

    /// Drive the engine from a user's delivery channel.
    pub fn spawn_event_loop(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<PushEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                engine.handle_event(event).await;
            }
            debug!("delivery channel closed, call event loop stopped");
        })
    }

    pub async fn handle_event(self: &Arc<Self>, event: PushEvent) {
        match event {
            PushEvent::CallIncoming(signal) => self.on_call_incoming(signal).await,
            PushEvent::CallAccepted(signal) => self.on_call_accepted(signal).await,
            PushEvent::CallRejected(signal) => self.on_call_rejected(signal).await,
            PushEvent::CallEnded(signal) => self.on_call_ended(signal).await,
            other => debug!(event = other.event_type(), "ignoring non-call event"),
        }
    }

    // ------------------------------------------------------------------
    // Caller side
    // ------------------------------------------------------------------

    /// Start an outgoing call. Only legal from idle.
    pub async fn start_call(self: &Arc<Self>, receiver: UserProfile, call_type: CallType) {
        let epoch = {
            let mut st = self.state.lock().await;
            if let Some(call) = &st.call {
                warn!(
                    status = %call.session.status,
                    "start_call ignored, a call is already in progress"
                );
                return;
            }
            st.epoch += 1;
            let session = CallSession::outgoing(call_type, self.local.clone(), receiver);
            st.call = Some(ActiveCall::new(session));
            st.epoch
        };

        // Local media first: no signal leaves this side until the devices
        // actually opened.
        let stream = match self.media.acquire(call_type).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "could not acquire local media, abandoning call");
                self.abort_to_idle(epoch, "media acquisition failed").await;
                return;
            }
        };

        {
            let mut st = self.state.lock().await;
            let current = st.epoch == epoch;
            match st.call.as_mut() {
                Some(call) if current && call.session.status == CallStatus::Calling => {
                    call.media = Some(stream.clone());
                }
                _ => {
                    // Hung up while the devices were still opening.
                    stream.stop_all();
                    return;
                }
            }
        }

        let endpoint = match self.endpoints.get_or_create(&self.local.id).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(error = %e, "could not open peer endpoint");
                self.abort_to_idle(epoch, "peer endpoint unavailable").await;
                return;
            }
        };

        let signal = {
            let mut st = self.state.lock().await;
            if st.epoch != epoch {
                return;
            }
            let Some(call) = st.call.as_mut() else { return };
            if call.session.status != CallStatus::Calling {
                return;
            }
            call.session.caller_peer_id = Some(endpoint.address());
            let mut signal = call.session.to_signal();
            signal.peer_id = Some(endpoint.address());
            signal
        };

        let remote = signal.receiver.id;
        if let Err(e) = self.signals.send(CallSignalKind::CallIncoming, signal).await {
            warn!(error = %e, "failed to send call offer");
            self.abort_to_idle(epoch, "signaling failed").await;
            return;
        }

        self.tones.play(ToneKind::Ringback);
        info!(to = %remote.short(), call_type = %call_type, "outgoing call started");
    }

    async fn on_call_accepted(self: &Arc<Self>, signal: CallSignal) {
        let (epoch, media, remote) = {
            let mut st = self.state.lock().await;
            let epoch = st.epoch;
            let Some(call) = st.call.as_mut() else {
                debug!("accept signal with no active call, ignoring");
                return;
            };
            if call.session.call_id != signal.call_id
                || !call.session.is_outgoing
                || call.session.status != CallStatus::Calling
            {
                debug!(
                    status = %call.session.status,
                    "ignoring stale or duplicate accept signal"
                );
                return;
            }
            // The receiver's transport address for this call is whatever
            // the accept signal carries; it may differ per call.
            let Some(remote) = signal.peer_id.clone() else {
                warn!("accept signal without a peer address, ignoring");
                return;
            };
            call.session.status = CallStatus::Connecting;
            (epoch, call.media.clone(), remote)
        };

        self.tones.stop();

        let Some(media) = media else {
            warn!("accepted call has no local media");
            self.abort_to_idle(epoch, "local media missing").await;
            return;
        };

        let endpoint = match self.endpoints.get_or_create(&self.local.id).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(error = %e, "could not open peer endpoint for dialing");
                self.abort_to_idle(epoch, "peer endpoint unavailable").await;
                return;
            }
        };

        match endpoint.connect(&remote, media).await {
            Ok(peer_call) => {
                debug!(remote = %remote, "dialed receiver");
                self.install_link(epoch, peer_call).await;
            }
            Err(e) => {
                warn!(error = %e, "peer connection failed");
                self.finish(epoch, CallStatus::Ended, ToneKind::End).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Receiver side
    // ------------------------------------------------------------------

    async fn on_call_incoming(self: &Arc<Self>, signal: CallSignal) {
        let busy = {
            let mut st = self.state.lock().await;
            match &st.call {
                Some(call) if call.session.call_id == signal.call_id => {
                    debug!(call = %signal.call_id.short(), "duplicate call offer, ignoring");
                    return;
                }
                Some(_) => true,
                None => {
                    st.epoch += 1;
                    st.call = Some(ActiveCall::new(CallSession::incoming(&signal)));
                    false
                }
            }
        };

        if busy {
            // Turn the offer away without touching the call in progress.
            let mut reply = signal;
            reply.peer_id = None;
            reply.reason = Some("busy".into());
            debug!(call = %reply.call_id.short(), "busy, rejecting second call offer");
            if let Err(e) = self.signals.send(CallSignalKind::CallRejected, reply).await {
                debug!(error = %e, "failed to send busy rejection");
            }
            return;
        }

        self.tones.play(ToneKind::Ringtone);
        info!(
            from = %signal.caller.id.short(),
            call_type = %signal.call_type,
            "incoming call ringing"
        );
    }

    /// Accept the ringing call: open local media in the background, signal
    /// acceptance with this side's endpoint address, then wait (bounded)
    /// for the caller's inbound connection.
    pub async fn accept_call(self: &Arc<Self>) {
        let (epoch, call_type, gate) = {
            let mut st = self.state.lock().await;
            let epoch = st.epoch;
            let Some(call) = st.call.as_mut() else {
                warn!("accept_call with no ringing call");
                return;
            };
            if call.session.status != CallStatus::Ringing {
                warn!(status = %call.session.status, "accept_call ignored");
                return;
            }
            call.session.status = CallStatus::Connecting;
            let gate = Arc::new(MediaGate::new());
            call.media_gate = Some(gate.clone());
            (epoch, call.session.call_type, gate)
        };

        self.tones.stop();

        {
            let engine = self.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                engine.acquire_into_gate(epoch, call_type, gate).await;
            });
        }

        let endpoint = match self.endpoints.get_or_create(&self.local.id).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(error = %e, "could not open peer endpoint for accept");
                self.abort_to_idle(epoch, "peer endpoint unavailable").await;
                return;
            }
        };

        let signal = {
            let mut st = self.state.lock().await;
            if st.epoch != epoch {
                return;
            }
            let Some(call) = st.call.as_mut() else { return };
            if call.session.status != CallStatus::Connecting {
                return;
            }
            let mut signal = call.session.to_signal();
            signal.peer_id = Some(endpoint.address());
            signal
        };
        if let Err(e) = self.signals.send(CallSignalKind::CallAccepted, signal).await {
            warn!(error = %e, "failed to send call accept");
            self.abort_to_idle(epoch, "signaling failed").await;
            return;
        }

        // The caller dials us; we only answer.
        let engine = self.clone();
        tokio::spawn(async move {
            engine.await_inbound_and_answer(epoch, endpoint, gate).await;
        });
    }

    async fn acquire_into_gate(
        self: &Arc<Self>,
        epoch: u64,
        call_type: CallType,
        gate: Arc<MediaGate>,
    ) {
        let result = self.media.acquire(call_type).await;

        let mut st = self.state.lock().await;
        let usable = st.epoch == epoch
            && st
                .call
                .as_ref()
                .is_some_and(|call| !call.session.status.is_terminal());
        if !usable {
            // The call went away while the devices were opening.
            if let Ok(stream) = &result {
                stream.stop_all();
            }
            return;
        }
        if let (Some(call), Ok(stream)) = (st.call.as_mut(), &result) {
            call.media = Some(stream.clone());
        }
        gate.resolve(result);
    }

    async fn await_inbound_and_answer(
        self: &Arc<Self>,
        epoch: u64,
        endpoint: Arc<dyn PeerEndpoint>,
        gate: Arc<MediaGate>,
    ) {
        let wait = self.config.accept_wait;

        let inbound = match tokio::time::timeout(wait, endpoint.next_inbound()).await {
            Ok(Some(inbound)) => inbound,
            Ok(None) => {
                if self.is_current(epoch).await {
                    warn!("peer endpoint closed while waiting for the caller");
                    self.abort_to_idle(epoch, "peer endpoint closed").await;
                }
                return;
            }
            Err(_) => {
                if self.is_current(epoch).await {
                    warn!(
                        seconds = wait.as_secs_f32(),
                        "timed out waiting for the caller's connection"
                    );
                    self.abort_to_idle(epoch, "caller never connected").await;
                }
                return;
            }
        };
        if !self.is_current(epoch).await {
            return;
        }
        debug!(remote = %inbound.remote, "caller connected, waiting for local media");

        // Bounded wait bridging the race between the accept round trip and
        // the hardware opening the devices.
        let media = match gate.wait(wait).await {
            Ok(media) => media,
            Err(e) => {
                warn!(error = %e, "local media not ready in time");
                self.abort_to_idle(epoch, "local media timeout").await;
                return;
            }
        };

        match inbound.responder.answer(media).await {
            Ok(peer_call) => self.install_link(epoch, peer_call).await,
            Err(e) => {
                warn!(error = %e, "failed to answer the caller's connection");
                self.abort_to_idle(epoch, "answer failed").await;
            }
        }
    }

    /// Decline the ringing call. No media was ever acquired while ringing,
    /// so there is nothing to release.
    pub async fn reject_call(self: &Arc<Self>, reason: Option<String>) {
        let (epoch, signal) = {
            let st = self.state.lock().await;
            let Some(call) = st.call.as_ref() else {
                warn!("reject_call with no ringing call");
                return;
            };
            if call.session.status != CallStatus::Ringing {
                warn!(status = %call.session.status, "reject_call ignored");
                return;
            }
            let mut signal = call.session.to_signal();
            signal.reason = reason.or_else(|| Some("declined".into()));
            (st.epoch, signal)
        };

        if let Err(e) = self.signals.send(CallSignalKind::CallRejected, signal).await {
            debug!(error = %e, "failed to send rejection");
        }
        self.abort_to_idle(epoch, "call rejected locally").await;
    }

    // ------------------------------------------------------------------
    // Shared transitions
    // ------------------------------------------------------------------

    /// Hang up. This is the only place an outbound `call_ended` leaves the
    /// engine, at most once per session, and only for a call that actually
    /// addressed a counterpart.
    pub async fn end_call(self: &Arc<Self>) {
        let (epoch, outbound) = {
            let mut st = self.state.lock().await;
            let epoch = st.epoch;
            let Some(call) = st.call.as_mut() else {
                debug!("end_call with no active call");
                return;
            };
            if call.session.status.is_terminal() {
                debug!("end_call on a finished call, ignoring");
                return;
            }
            let outbound = if call.end_sent {
                None
            } else {
                call.end_sent = true;
                Some(call.session.to_signal())
            };
            (epoch, outbound)
        };

        if let Some(signal) = outbound {
            if let Err(e) = self.signals.send(CallSignalKind::CallEnded, signal).await {
                debug!(error = %e, "failed to send end signal");
            }
        }
        info!("call ended locally");
        self.finish(epoch, CallStatus::Ended, ToneKind::End).await;
    }

    async fn on_call_rejected(self: &Arc<Self>, signal: CallSignal) {
        let epoch = {
            let st = self.state.lock().await;
            match &st.call {
                Some(call) if call.session.call_id == signal.call_id => st.epoch,
                Some(_) => {
                    debug!("rejection for another call, ignoring");
                    return;
                }
                None => {
                    debug!("rejection with no active call, ignoring");
                    return;
                }
            }
        };
        info!(reason = ?signal.reason, "call rejected by remote");
        self.finish(epoch, CallStatus::Rejected, ToneKind::Busy).await;
    }

    async fn on_call_ended(self: &Arc<Self>, signal: CallSignal) {
        let epoch = {
            let mut st = self.state.lock().await;
            let epoch = st.epoch;
            match st.call.as_mut() {
                None => {
                    debug!("end signal while idle, nothing to do");
                    return;
                }
                Some(call) if call.session.call_id != signal.call_id => {
                    debug!("end signal for another call, ignoring");
                    return;
                }
                Some(call) => {
                    // The remote side terminated; never answer an end with
                    // an end.
                    call.end_sent = true;
                    epoch
                }
            }
        };
        info!("call ended by remote");
        self.finish(epoch, CallStatus::Ended, ToneKind::End).await;
    }

    async fn watch_link(
        self: &Arc<Self>,
        epoch: u64,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        while let Some(event) = events.recv().await {
            if !self.is_current(epoch).await {
                return;
            }
            match event {
                LinkEvent::RemoteStream => self.on_remote_stream(epoch).await,
                LinkEvent::Closed => {
                    debug!("peer link closed by remote");
                    self.finish(epoch, CallStatus::Ended, ToneKind::End).await;
                    return;
                }
                LinkEvent::Error(e) => {
                    warn!(error = %e, "peer link error");
                    self.finish(epoch, CallStatus::Ended, ToneKind::End).await;
                    return;
                }
            }
        }
    }

    async fn on_remote_stream(self: &Arc<Self>, epoch: u64) {
        {
            let mut st = self.state.lock().await;
            if st.epoch != epoch {
                return;
            }
            let Some(call) = st.call.as_mut() else { return };
            if call.session.status != CallStatus::Connecting {
                debug!(status = %call.session.status, "remote stream in unexpected state");
                return;
            }
            call.session.status = CallStatus::Connected;
            call.session.start_time = Some(Utc::now());
        }
        self.tones.play(ToneKind::Connected);
        info!("call connected");
    }

    async fn install_link(self: &Arc<Self>, epoch: u64, peer_call: PeerCall) {
        let PeerCall { link, events } = peer_call;
        {
            let mut st = self.state.lock().await;
            let usable = st.epoch == epoch
                && st
                    .call
                    .as_ref()
                    .is_some_and(|call| !call.session.status.is_terminal());
            if !usable {
                link.close();
                return;
            }
            if let Some(call) = st.call.as_mut() {
                call.link = Some(link);
            }
        }
        let engine = self.clone();
        tokio::spawn(async move { engine.watch_link(epoch, events).await });
    }

    /// Terminal transition: keep the session on display, release media and
    /// link, play the terminal tone, and schedule the reset to idle.
    async fn finish(self: &Arc<Self>, epoch: u64, status: CallStatus, tone: ToneKind) {
        let (media, link) = {
            let mut st = self.state.lock().await;
            if st.epoch != epoch {
                return;
            }
            let Some(call) = st.call.as_mut() else { return };
            if call.session.status.is_terminal() {
                return;
            }
            call.session.status = status;
            call.session.end_time = Some(Utc::now());
            call.media_gate = None;
            (call.media.take(), call.link.take())
        };

        // The tone slot turns over before the media layer is released.
        self.tones.play(tone);
        if let Some(media) = media {
            media.stop_all();
        }
        if let Some(link) = link {
            link.close();
        }

        self.schedule_reset(epoch);
    }

    /// Immediate reset: release everything and return straight to idle,
    /// with no terminal display.
    async fn abort_to_idle(self: &Arc<Self>, epoch: u64, context: &str) {
        let (media, link) = {
            let mut st = self.state.lock().await;
            if st.epoch != epoch {
                return;
            }
            let Some(call) = st.call.take() else { return };
            st.epoch += 1;
            (call.media, call.link)
        };

        self.tones.stop();
        if let Some(media) = media {
            media.stop_all();
        }
        if let Some(link) = link {
            link.close();
        }
        debug!(context, "call state reset to idle");
    }

    fn schedule_reset(self: &Arc<Self>, epoch: u64) {
        let engine = self.clone();
        let delay = self.config.reset_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let cleared = {
                let mut st = engine.state.lock().await;
                let terminal = st.epoch == epoch
                    && st
                        .call
                        .as_ref()
                        .is_some_and(|call| call.session.status.is_terminal());
                if terminal {
                    st.call = None;
                    st.epoch += 1;
                }
                terminal
            };
            if cleared {
                engine.tones.stop();
                debug!("terminal call display cleared");
            }
        });
    }

    async fn is_current(&self, epoch: u64) -> bool {
        let st = self.state.lock().await;
        st.epoch == epoch && st.call.is_some()
    }

    // ------------------------------------------------------------------
    // In-call controls
    // ------------------------------------------------------------------

    /// Flip the microphone. Returns the new muted state.
    pub async fn toggle_mute(&self) -> bool {
        let (muted, media) = {
            let mut st = self.state.lock().await;
            let Some(call) = st.call.as_mut() else {
                return false;
            };
            call.session.is_muted = !call.session.is_muted;
            (call.session.is_muted, call.media.clone())
        };
        if let Some(media) = media {
            media.set_enabled(TrackKind::Audio, !muted);
        }
        debug!(muted, "toggled microphone");
        muted
    }

    /// Flip the camera. Returns the new enabled state.
    pub async fn toggle_video(&self) -> bool {
        let (enabled, media) = {
            let mut st = self.state.lock().await;
            let Some(call) = st.call.as_mut() else {
                return false;
            };
            call.session.is_video_enabled = !call.session.is_video_enabled;
            (call.session.is_video_enabled, call.media.clone())
        };
        if let Some(media) = media {
            media.set_enabled(TrackKind::Video, enabled);
        }
        debug!(enabled, "toggled camera");
        enabled
    }

    /// Flip speaker routing. Output routing itself is a client concern;
    /// the engine only tracks the flag.
    pub async fn toggle_speaker(&self) -> bool {
        let mut st = self.state.lock().await;
        let Some(call) = st.call.as_mut() else {
            return false;
        };
        call.session.is_speaker_on = !call.session.is_speaker_on;
        call.session.is_speaker_on
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::oneshot;

    use crate::error::{MediaError, PeerError, SignalError};
    use crate::media::MediaTrack;
    use crate::peer::{InboundCall, InboundResponder, PeerConnector};
    use crate::tones::ToneHandle;
    use palaver_shared::types::{CallId, UserId};

    // -- media double ---------------------------------------------------

    struct TestTrack {
        kind: TrackKind,
        stops: Arc<AtomicUsize>,
        enabled: AtomicBool,
    }

    impl MediaTrack for TestTrack {
        fn kind(&self) -> TrackKind {
            self.kind
        }
        fn set_enabled(&self, enabled: bool) {
            self.enabled.store(enabled, Ordering::SeqCst);
        }
        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct TestMedia {
        acquired: AtomicUsize,
        stops: Arc<AtomicUsize>,
        tracks: StdMutex<Vec<Arc<TestTrack>>>,
        fail: AtomicBool,
        delay: StdMutex<Duration>,
    }

    impl TestMedia {
        fn new() -> Self {
            Self {
                acquired: AtomicUsize::new(0),
                stops: Arc::new(AtomicUsize::new(0)),
                tracks: StdMutex::new(Vec::new()),
                fail: AtomicBool::new(false),
                delay: StdMutex::new(Duration::ZERO),
            }
        }

        fn set_delay(&self, delay: Duration) {
            *self.delay.lock().unwrap() = delay;
        }

        fn acquired(&self) -> usize {
            self.acquired.load(Ordering::SeqCst)
        }

        fn stopped(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }

        fn track_enabled(&self, kind: TrackKind) -> bool {
            self.tracks
                .lock()
                .unwrap()
                .iter()
                .filter(|t| t.kind == kind)
                .all(|t| t.enabled.load(Ordering::SeqCst))
        }
    }

    #[async_trait]
    impl MediaSource for TestMedia {
        async fn acquire(&self, call_type: CallType) -> Result<MediaStream, MediaError> {
            let delay = *self.delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(MediaError::PermissionDenied);
            }
            let mut kinds = vec![TrackKind::Audio];
            if matches!(call_type, CallType::Video) {
                kinds.push(TrackKind::Video);
            }
            self.acquired.fetch_add(kinds.len(), Ordering::SeqCst);
            let tracks: Vec<Arc<TestTrack>> = kinds
                .into_iter()
                .map(|kind| {
                    Arc::new(TestTrack {
                        kind,
                        stops: self.stops.clone(),
                        enabled: AtomicBool::new(true),
                    })
                })
                .collect();
            self.tracks.lock().unwrap().extend(tracks.iter().cloned());
            Ok(MediaStream::new(
                tracks
                    .into_iter()
                    .map(|t| t as Arc<dyn MediaTrack>)
                    .collect(),
            ))
        }
    }

    // -- loopback peer transport ----------------------------------------

    #[derive(Default)]
    struct TestNet {
        inboxes: StdMutex<HashMap<String, mpsc::UnboundedSender<InboundCall>>>,
    }

    struct TestConnector {
        net: Arc<TestNet>,
    }

    #[async_trait]
    impl PeerConnector for TestConnector {
        async fn create(
            &self,
            address: &str,
            _ice: &crate::config::IceConfig,
        ) -> Result<Arc<dyn PeerEndpoint>, PeerError> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.net
                .inboxes
                .lock()
                .unwrap()
                .insert(address.to_string(), tx);
            Ok(Arc::new(TestEndpoint {
                address: address.to_string(),
                alive: AtomicBool::new(true),
                inbox: Mutex::new(rx),
                net: self.net.clone(),
            }))
        }
    }

    struct TestEndpoint {
        address: String,
        alive: AtomicBool,
        inbox: Mutex<mpsc::UnboundedReceiver<InboundCall>>,
        net: Arc<TestNet>,
    }

    #[async_trait]
    impl PeerEndpoint for TestEndpoint {
        fn address(&self) -> String {
            self.address.clone()
        }
        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
        async fn connect(&self, remote: &str, _media: MediaStream) -> Result<PeerCall, PeerError> {
            let inbox = self
                .net
                .inboxes
                .lock()
                .unwrap()
                .get(remote)
                .cloned()
                .ok_or_else(|| PeerError::ConnectionFailed(format!("no such peer: {remote}")))?;
            let (reply_tx, reply_rx) = oneshot::channel();
            inbox
                .send(InboundCall {
                    remote: self.address.clone(),
                    responder: Box::new(TestResponder { reply: reply_tx }),
                })
                .map_err(|_| PeerError::ConnectionFailed("peer endpoint gone".into()))?;
            reply_rx
                .await
                .map_err(|_| PeerError::ConnectionFailed("never answered".into()))
        }
        async fn next_inbound(&self) -> Option<InboundCall> {
            self.inbox.lock().await.recv().await
        }
        fn close(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    struct TestResponder {
        reply: oneshot::Sender<PeerCall>,
    }

    #[async_trait]
    impl InboundResponder for TestResponder {
        async fn answer(self: Box<Self>, _media: MediaStream) -> Result<PeerCall, PeerError> {
            let (dialer_tx, dialer_rx) = mpsc::unbounded_channel();
            let (answerer_tx, answerer_rx) = mpsc::unbounded_channel();
            // Both sides see the remote stream as soon as the answer lands.
            let _ = dialer_tx.send(LinkEvent::RemoteStream);
            let _ = answerer_tx.send(LinkEvent::RemoteStream);
            let dialer = PeerCall {
                link: Box::new(TestLink {
                    peer: answerer_tx,
                    closed: AtomicBool::new(false),
                }),
                events: dialer_rx,
            };
            self.reply
                .send(dialer)
                .map_err(|_| PeerError::ConnectionFailed("dialer gone".into()))?;
            Ok(PeerCall {
                link: Box::new(TestLink {
                    peer: dialer_tx,
                    closed: AtomicBool::new(false),
                }),
                events: answerer_rx,
            })
        }
    }

    struct TestLink {
        peer: mpsc::UnboundedSender<LinkEvent>,
        closed: AtomicBool,
    }

    impl PeerLink for TestLink {
        fn close(&self) {
            if !self.closed.swap(true, Ordering::SeqCst) {
                let _ = self.peer.send(LinkEvent::Closed);
            }
        }
    }

    // -- signal routing -------------------------------------------------

    #[derive(Default)]
    struct SignalRouter {
        engines: StdMutex<HashMap<UserId, Arc<CallEngine>>>,
        sent: StdMutex<Vec<(CallSignalKind, CallSignal)>>,
    }

    impl SignalRouter {
        fn register(&self, user: UserId, engine: Arc<CallEngine>) {
            self.engines.lock().unwrap().insert(user, engine);
        }

        fn count(&self, kind: CallSignalKind) -> usize {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(k, _)| *k == kind)
                .count()
        }

        fn last(&self, kind: CallSignalKind) -> Option<CallSignal> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(k, _)| *k == kind)
                .map(|(_, s)| s.clone())
        }
    }

    struct RouterSender {
        actor: UserId,
        router: Arc<SignalRouter>,
    }

    #[async_trait]
    impl SignalSender for RouterSender {
        async fn send(&self, kind: CallSignalKind, signal: CallSignal) -> Result<(), SignalError> {
            self.router
                .sent
                .lock()
                .unwrap()
                .push((kind, signal.clone()));
            let target = signal
                .counterpart_of(&self.actor)
                .map(|profile| profile.id)
                .ok_or_else(|| SignalError::Transport("not a party".into()))?;
            let engine = self.router.engines.lock().unwrap().get(&target).cloned();
            if let Some(engine) = engine {
                let event = PushEvent::from_signal(kind, signal);
                tokio::spawn(async move { engine.handle_event(event).await });
            }
            Ok(())
        }
    }

    // -- tone recording -------------------------------------------------

    struct RecordingPlayer {
        started: StdMutex<Vec<ToneKind>>,
        active: Arc<AtomicUsize>,
    }

    impl RecordingPlayer {
        fn new() -> Self {
            Self {
                started: StdMutex::new(Vec::new()),
                active: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn started(&self) -> Vec<ToneKind> {
            self.started.lock().unwrap().clone()
        }
    }

    struct RecordingHandle {
        active: Arc<AtomicUsize>,
    }

    impl ToneHandle for RecordingHandle {
        fn stop(&self) {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl TonePlayer for RecordingPlayer {
        fn start(&self, kind: ToneKind) -> Box<dyn ToneHandle> {
            self.started.lock().unwrap().push(kind);
            self.active.fetch_add(1, Ordering::SeqCst);
            Box::new(RecordingHandle {
                active: self.active.clone(),
            })
        }
    }

    // -- fixture --------------------------------------------------------

    struct Rig {
        router: Arc<SignalRouter>,
        net: Arc<TestNet>,
        config: CallConfig,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                router: Arc::new(SignalRouter::default()),
                net: Arc::new(TestNet::default()),
                config: CallConfig {
                    accept_wait: Duration::from_secs(2),
                    reset_delay: Duration::from_millis(400),
                    ice: crate::config::IceConfig::default(),
                },
            }
        }

        fn side(&self, name: &str) -> Side {
            let profile = UserProfile::new(UserId::new(), name);
            let media = Arc::new(TestMedia::new());
            let tones = Arc::new(RecordingPlayer::new());
            let endpoints = Arc::new(PeerEndpointRegistry::new(
                Arc::new(TestConnector {
                    net: self.net.clone(),
                }),
                self.config.ice.clone(),
            ));
            let engine = Arc::new(CallEngine::new(
                profile.clone(),
                media.clone(),
                endpoints,
                Arc::new(RouterSender {
                    actor: profile.id,
                    router: self.router.clone(),
                }),
                tones.clone(),
                self.config.clone(),
            ));
            self.router.register(profile.id, engine.clone());
            Side {
                profile,
                engine,
                media,
                tones,
            }
        }
    }

    struct Side {
        profile: UserProfile,
        engine: Arc<CallEngine>,
        media: Arc<TestMedia>,
        tones: Arc<RecordingPlayer>,
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    fn foreign_end_signal() -> CallSignal {
        CallSignal {
            call_id: CallId::new(),
            call_type: CallType::Audio,
            caller: UserProfile::new(UserId::new(), "x"),
            receiver: UserProfile::new(UserId::new(), "y"),
            peer_id: None,
            reason: None,
        }
    }

    #[tokio::test]
    async fn test_audio_call_end_to_end_single_end_signal() {
        let rig = Rig::new();
        let alice = rig.side("alice");
        let bob = rig.side("bob");

        alice
            .engine
            .start_call(bob.profile.clone(), CallType::Audio)
            .await;
        settle().await;
        assert_eq!(alice.engine.status().await, CallStatus::Calling);
        assert_eq!(bob.engine.status().await, CallStatus::Ringing);
        // No media on the receiving side while ringing.
        assert_eq!(bob.media.acquired(), 0);

        bob.engine.accept_call().await;
        settle().await;
        assert_eq!(alice.engine.status().await, CallStatus::Connected);
        assert_eq!(bob.engine.status().await, CallStatus::Connected);
        let session = alice.engine.session().await.unwrap();
        assert!(session.start_time.is_some());

        alice.engine.end_call().await;
        settle().await;
        assert_eq!(rig.router.count(CallSignalKind::CallEnded), 1);
        assert_eq!(alice.engine.status().await, CallStatus::Ended);
        assert_eq!(bob.engine.status().await, CallStatus::Ended);

        // Every acquired track was stopped on both sides.
        assert_eq!(alice.media.acquired(), 1);
        assert_eq!(alice.media.stopped(), 1);
        assert_eq!(bob.media.acquired(), 1);
        assert_eq!(bob.media.stopped(), 1);

        assert_eq!(
            alice.tones.started(),
            vec![ToneKind::Ringback, ToneKind::Connected, ToneKind::End]
        );
        assert_eq!(
            bob.tones.started(),
            vec![ToneKind::Ringtone, ToneKind::Connected, ToneKind::End]
        );

        // Terminal display clears back to idle on its own.
        tokio::time::sleep(rig.config.reset_delay + Duration::from_millis(100)).await;
        assert_eq!(alice.engine.status().await, CallStatus::Idle);
        assert_eq!(bob.engine.status().await, CallStatus::Idle);
        assert_eq!(alice.tones.active.load(Ordering::SeqCst), 0);
        assert_eq!(bob.tones.active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_receiver_hangup_suppresses_caller_end_signal() {
        let rig = Rig::new();
        let alice = rig.side("alice");
        let bob = rig.side("bob");

        alice
            .engine
            .start_call(bob.profile.clone(), CallType::Video)
            .await;
        settle().await;
        bob.engine.accept_call().await;
        settle().await;
        assert_eq!(alice.engine.status().await, CallStatus::Connected);

        bob.engine.end_call().await;
        settle().await;

        // The caller reacted to the remote end without answering with its
        // own end signal.
        assert_eq!(rig.router.count(CallSignalKind::CallEnded), 1);
        let ended = rig.router.last(CallSignalKind::CallEnded).unwrap();
        assert_eq!(alice.engine.status().await, CallStatus::Ended);
        assert_eq!(
            ended.call_id,
            bob.engine.session().await.unwrap().call_id
        );
        // Video call acquired two tracks per side, all stopped.
        assert_eq!(alice.media.stopped(), alice.media.acquired());
        assert_eq!(alice.media.acquired(), 2);
        assert_eq!(bob.media.stopped(), bob.media.acquired());
    }

    #[tokio::test]
    async fn test_media_failure_reverts_to_idle_without_signaling() {
        let rig = Rig::new();
        let alice = rig.side("alice");
        let bob = rig.side("bob");

        alice.media.fail.store(true, Ordering::SeqCst);
        alice
            .engine
            .start_call(bob.profile.clone(), CallType::Audio)
            .await;
        settle().await;

        assert_eq!(alice.engine.status().await, CallStatus::Idle);
        assert_eq!(bob.engine.status().await, CallStatus::Idle);
        // No offer ever left this side.
        assert_eq!(rig.router.count(CallSignalKind::CallIncoming), 0);
        assert_eq!(rig.router.count(CallSignalKind::CallEnded), 0);
    }

    #[tokio::test]
    async fn test_hangup_mid_acquisition_releases_tracks() {
        let rig = Rig::new();
        let alice = rig.side("alice");
        let bob = rig.side("bob");

        alice.media.set_delay(Duration::from_millis(150));
        let engine = alice.engine.clone();
        let receiver = bob.profile.clone();
        let starter =
            tokio::spawn(async move { engine.start_call(receiver, CallType::Audio).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(alice.engine.status().await, CallStatus::Calling);

        alice.engine.end_call().await;
        starter.await.unwrap();
        settle().await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        // The devices finished opening after the hangup and were released.
        assert_eq!(alice.media.acquired(), 1);
        assert_eq!(alice.media.stopped(), 1);
    }

    #[tokio::test]
    async fn test_reject_plays_busy_and_acquires_no_receiver_media() {
        let rig = Rig::new();
        let alice = rig.side("alice");
        let bob = rig.side("bob");

        alice
            .engine
            .start_call(bob.profile.clone(), CallType::Audio)
            .await;
        settle().await;

        bob.engine.reject_call(None).await;
        settle().await;

        assert_eq!(bob.engine.status().await, CallStatus::Idle);
        assert_eq!(bob.media.acquired(), 0);
        assert_eq!(alice.engine.status().await, CallStatus::Rejected);
        assert_eq!(alice.media.stopped(), alice.media.acquired());
        assert!(alice.tones.started().contains(&ToneKind::Busy));

        let rejected = rig.router.last(CallSignalKind::CallRejected).unwrap();
        assert_eq!(rejected.reason.as_deref(), Some("declined"));
        assert_eq!(rig.router.count(CallSignalKind::CallEnded), 0);

        tokio::time::sleep(rig.config.reset_delay + Duration::from_millis(100)).await;
        assert_eq!(alice.engine.status().await, CallStatus::Idle);
    }

    #[tokio::test]
    async fn test_duplicate_end_signal_is_noop() {
        let rig = Rig::new();
        let alice = rig.side("alice");

        let signal = foreign_end_signal();
        alice
            .engine
            .handle_event(PushEvent::CallEnded(signal.clone()))
            .await;
        alice
            .engine
            .handle_event(PushEvent::CallEnded(signal))
            .await;

        assert_eq!(alice.engine.status().await, CallStatus::Idle);
        assert!(alice.tones.started().is_empty());
        assert_eq!(rig.router.count(CallSignalKind::CallEnded), 0);
    }

    #[tokio::test]
    async fn test_duplicate_offer_ignored_and_second_caller_turned_away() {
        let rig = Rig::new();
        let alice = rig.side("alice");
        let bob = rig.side("bob");
        let carol = rig.side("carol");

        alice
            .engine
            .start_call(bob.profile.clone(), CallType::Audio)
            .await;
        settle().await;
        let offer = rig.router.last(CallSignalKind::CallIncoming).unwrap();

        // Redelivered offer for the same call changes nothing.
        bob.engine
            .handle_event(PushEvent::CallIncoming(offer))
            .await;
        assert_eq!(bob.engine.status().await, CallStatus::Ringing);
        assert_eq!(bob.tones.started(), vec![ToneKind::Ringtone]);

        // A second caller gets a busy rejection; the ringing call stands.
        carol
            .engine
            .start_call(bob.profile.clone(), CallType::Audio)
            .await;
        settle().await;
        let busy = rig.router.last(CallSignalKind::CallRejected).unwrap();
        assert_eq!(busy.reason.as_deref(), Some("busy"));
        assert_eq!(bob.engine.status().await, CallStatus::Ringing);
        assert_eq!(carol.engine.status().await, CallStatus::Rejected);
        let ringing = bob.engine.session().await.unwrap();
        assert_eq!(ringing.caller.id, alice.profile.id);
    }

    #[tokio::test]
    async fn test_user_actions_outside_their_state_are_ignored() {
        let rig = Rig::new();
        let alice = rig.side("alice");
        let bob = rig.side("bob");

        // Nothing ringing: accept, reject and hangup all do nothing.
        alice.engine.accept_call().await;
        alice.engine.reject_call(None).await;
        alice.engine.end_call().await;
        assert_eq!(alice.engine.status().await, CallStatus::Idle);
        assert_eq!(rig.router.count(CallSignalKind::CallEnded), 0);
        assert_eq!(rig.router.count(CallSignalKind::CallRejected), 0);

        // An accept signal with no outgoing call is stale, not an error.
        let mut stale = foreign_end_signal();
        stale.peer_id = Some("nowhere".into());
        alice
            .engine
            .handle_event(PushEvent::CallAccepted(stale))
            .await;
        assert_eq!(alice.engine.status().await, CallStatus::Idle);

        // A second start while already in a call is ignored.
        alice
            .engine
            .start_call(bob.profile.clone(), CallType::Audio)
            .await;
        settle().await;
        alice
            .engine
            .start_call(bob.profile.clone(), CallType::Video)
            .await;
        settle().await;
        assert_eq!(rig.router.count(CallSignalKind::CallIncoming), 1);
    }

    #[tokio::test]
    async fn test_accept_timeout_fails_back_to_idle() {
        let rig = Rig::new();
        let mut config = rig.config.clone();
        config.accept_wait = Duration::from_millis(200);

        let bob = {
            let profile = UserProfile::new(UserId::new(), "bob");
            let media = Arc::new(TestMedia::new());
            let tones = Arc::new(RecordingPlayer::new());
            let endpoints = Arc::new(PeerEndpointRegistry::new(
                Arc::new(TestConnector {
                    net: rig.net.clone(),
                }),
                config.ice.clone(),
            ));
            let engine = Arc::new(CallEngine::new(
                profile.clone(),
                media.clone(),
                endpoints,
                Arc::new(RouterSender {
                    actor: profile.id,
                    router: rig.router.clone(),
                }),
                tones.clone(),
                config,
            ));
            rig.router.register(profile.id, engine.clone());
            Side {
                profile,
                engine,
                media,
                tones,
            }
        };

        // An offer from a caller whose engine never dials.
        let ghost = UserProfile::new(UserId::new(), "ghost");
        let offer = CallSignal {
            call_id: CallId::new(),
            call_type: CallType::Audio,
            caller: ghost,
            receiver: bob.profile.clone(),
            peer_id: Some("ghost-address".into()),
            reason: None,
        };
        bob.engine
            .handle_event(PushEvent::CallIncoming(offer))
            .await;
        bob.engine.accept_call().await;
        settle().await;
        assert_eq!(bob.engine.status().await, CallStatus::Connecting);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(bob.engine.status().await, CallStatus::Idle);
        // Media opened for the accept was released on the way out.
        assert_eq!(bob.media.acquired(), 1);
        assert_eq!(bob.media.stopped(), 1);
    }

    #[tokio::test]
    async fn test_event_loop_drives_the_engine_from_a_delivery_channel() {
        let rig = Rig::new();
        let bob = rig.side("bob");
        let registry = palaver_net::DeliveryRegistry::new();
        let rx = registry.connect(&bob.profile.id);
        let handle = bob.engine.spawn_event_loop(rx);

        let ghost = UserProfile::new(UserId::new(), "ghost");
        let offer = CallSignal {
            call_id: CallId::new(),
            call_type: CallType::Audio,
            caller: ghost,
            receiver: bob.profile.clone(),
            peer_id: Some("ghost-address".into()),
            reason: None,
        };
        assert!(registry.send(&bob.profile.id, PushEvent::CallIncoming(offer)));
        settle().await;
        assert_eq!(bob.engine.status().await, CallStatus::Ringing);

        // Closing the channel stops the loop.
        registry.disconnect(&bob.profile.id);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_mute_and_video_toggles_reach_the_tracks() {
        let rig = Rig::new();
        let alice = rig.side("alice");
        let bob = rig.side("bob");

        alice
            .engine
            .start_call(bob.profile.clone(), CallType::Video)
            .await;
        settle().await;
        bob.engine.accept_call().await;
        settle().await;

        assert!(alice.engine.toggle_mute().await);
        assert!(!alice.engine.toggle_video().await);
        assert!(alice.engine.toggle_speaker().await);
        let session = alice.engine.session().await.unwrap();
        assert!(session.is_muted);
        assert!(!session.is_video_enabled);
        assert!(session.is_speaker_on);
        assert!(!alice.media.track_enabled(TrackKind::Audio));
        assert!(!alice.media.track_enabled(TrackKind::Video));

        assert!(!alice.engine.toggle_mute().await);
        assert!(alice.media.track_enabled(TrackKind::Audio));

        alice.engine.end_call().await;
        settle().await;
        assert_eq!(alice.media.stopped(), alice.media.acquired());
    }
}
