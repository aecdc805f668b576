use std::sync::{Arc, Mutex};

use crate::directive::CallKind;
use crate::errors::ParleyError;
use crate::events::{EventEmitter, ParleyEvent};
use crate::media::{MediaCapture, MediaConstraints, MediaStream, VideoSinks};
use crate::transport::{MediaConnection, TransportSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    /// Outbound call placed, waiting for the remote stream.
    Requesting,
    /// Inbound call being auto-answered.
    Ringing,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Microphone,
    Camera,
}

struct ActiveCall {
    handle: Arc<dyn MediaConnection>,
    local_stream: MediaStream,
    /// Set once a remote stream arrived on this call (or on the call it replaced).
    connected: bool,
}

struct CallInner {
    state: CallState,
    audio_enabled: bool,
    video_enabled: bool,
    active: Option<ActiveCall>,
    /// Counterpart of a call whose local media is still being captured.
    pending: Option<String>,
    /// Bumped by every teardown so in-flight captures can notice they are stale.
    epoch: u64,
    /// Last remote stream that matched no active call. A handle created while
    /// the lock was released may receive its stream before it is installed.
    unmatched_stream: Option<(String, MediaStream)>,
}

impl CallInner {
    fn constraints(&self) -> MediaConstraints {
        MediaConstraints {
            audio: self.audio_enabled,
            video: self.video_enabled,
        }
    }

    /// Make `call` the active call, returning the call it replaced and the
    /// remote stream that already arrived for it, if any.
    fn install(&mut self, mut call: ActiveCall) -> (Option<ActiveCall>, Option<MediaStream>) {
        let early = self
            .unmatched_stream
            .take_if(|(id, _)| id.as_str() == call.handle.connection_id())
            .map(|(_, stream)| stream);
        if early.is_some() {
            call.connected = true;
        }
        (self.active.replace(call), early)
    }

    fn busy_with(&self) -> Option<String> {
        match &self.active {
            Some(active) => Some(active.handle.remote_id().to_string()),
            None => self.pending.clone(),
        }
    }
}

/// Media call lifecycle for the single active counterpart.
///
/// Local media is captured per call with the current capability flags and
/// attached to the local preview; the remote stream goes to the remote
/// preview. Mute and camera toggles replace the whole call with a freshly
/// captured stream instead of toggling tracks in place.
pub struct CallSession {
    inner: Mutex<CallInner>,
    capture: Arc<dyn MediaCapture>,
    sinks: VideoSinks,
    emitter: EventEmitter,
}

impl CallSession {
    pub fn new(
        capture: Arc<dyn MediaCapture>,
        sinks: VideoSinks,
        emitter: EventEmitter,
        audio_enabled: bool,
        video_enabled: bool,
    ) -> Self {
        Self {
            inner: Mutex::new(CallInner {
                state: CallState::Idle,
                audio_enabled,
                video_enabled,
                active: None,
                pending: None,
                epoch: 0,
                unmatched_stream: None,
            }),
            capture,
            sinks,
            emitter,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CallInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> CallState {
        self.lock().state
    }

    pub fn audio_enabled(&self) -> bool {
        self.lock().audio_enabled
    }

    pub fn video_enabled(&self) -> bool {
        self.lock().video_enabled
    }

    pub fn is_connected(&self) -> bool {
        self.lock().active.as_ref().is_some_and(|a| a.connected)
    }

    pub fn active_remote_id(&self) -> Option<String> {
        self.lock()
            .active
            .as_ref()
            .map(|a| a.handle.remote_id().to_string())
    }

    pub fn active_connection_id(&self) -> Option<String> {
        self.lock()
            .active
            .as_ref()
            .map(|a| a.handle.connection_id().to_string())
    }

    /// Whether a close or error on `connection_id` ends the active call.
    ///
    /// Handles that were replaced or rejected are no longer active, so their
    /// late close notifications are ignored.
    pub fn is_active_connection(&self, connection_id: &str) -> bool {
        self.lock()
            .active
            .as_ref()
            .is_some_and(|a| a.handle.connection_id() == connection_id)
    }

    fn set_state(&self, state: CallState) {
        let changed = {
            let mut inner = self.lock();
            let changed = inner.state != state;
            inner.state = state;
            changed
        };
        if changed {
            self.emitter.emit(ParleyEvent::CallStateChanged(state));
        }
    }

    fn emit_flags(&self) {
        let (audio_enabled, video_enabled) = {
            let inner = self.lock();
            (inner.audio_enabled, inner.video_enabled)
        };
        self.emitter.emit(ParleyEvent::MediaFlagsChanged {
            audio_enabled,
            video_enabled,
        });
    }

    async fn capture_stream(&self, constraints: MediaConstraints) -> Result<MediaStream, ParleyError> {
        if !constraints.audio && !constraints.video {
            return Err(ParleyError::Capture("neither audio nor video requested".into()));
        }
        Ok(self.capture.get_local_stream(constraints).await?)
    }

    /// Show `stream` in the local preview unless a teardown ran meanwhile.
    ///
    /// Sinks are host code and may read call state, so this runs unlocked.
    fn show_local(&self, stream: &MediaStream, epoch: u64) {
        self.sinks.local.attach(Some(stream));
        if self.lock().epoch != epoch {
            self.sinks.local.attach(None);
        }
    }

    fn connect_early(&self, stream: Option<MediaStream>) {
        if let Some(stream) = stream {
            self.sinks.remote.attach(Some(&stream));
            self.set_state(CallState::Connected);
        }
    }

    /// Place an outbound call to `remote_id` with the current flags.
    pub async fn call(&self, session: &dyn TransportSession, remote_id: &str) -> Result<(), ParleyError> {
        self.place(session, remote_id, None).await
    }

    /// Place an outbound call requested by a call token.
    ///
    /// The token's flags replace the current ones only once the call is
    /// placed; a rejected or failed attempt leaves them untouched.
    pub async fn call_as(
        &self,
        session: &dyn TransportSession,
        remote_id: &str,
        kind: CallKind,
    ) -> Result<(), ParleyError> {
        self.place(session, remote_id, Some(kind)).await
    }

    async fn place(
        &self,
        session: &dyn TransportSession,
        remote_id: &str,
        kind: Option<CallKind>,
    ) -> Result<(), ParleyError> {
        let (constraints, epoch, previous) = {
            let mut inner = self.lock();
            if let Some(remote) = inner.busy_with() {
                return Err(ParleyError::CallInProgress(remote));
            }
            let previous = inner.state;
            inner.state = CallState::Requesting;
            inner.pending = Some(remote_id.to_string());
            let constraints = kind.map_or_else(|| inner.constraints(), CallKind::constraints);
            (constraints, inner.epoch, previous)
        };

        let stream = match self.capture_stream(constraints).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("outbound call to {remote_id} aborted: {e}");
                let mut inner = self.lock();
                if inner.epoch == epoch {
                    inner.state = previous;
                    inner.pending = None;
                }
                return Err(e);
            }
        };

        if self.lock().epoch != epoch {
            stream.stop_all();
            return Err(ParleyError::Call("session ended while capturing media".into()));
        }

        let handle = session.call(remote_id, &stream);
        tracing::info!(
            "calling {remote_id} (connection {}, audio={}, video={})",
            handle.connection_id(),
            constraints.audio,
            constraints.video
        );

        let outcome = {
            let mut inner = self.lock();
            if inner.epoch == epoch {
                if kind.is_some() {
                    inner.audio_enabled = constraints.audio;
                    inner.video_enabled = constraints.video;
                }
                inner.pending = None;
                Ok(inner.install(ActiveCall {
                    handle: handle.clone(),
                    local_stream: stream.clone(),
                    connected: false,
                }))
            } else {
                Err(())
            }
        };
        let Ok((_, early)) = outcome else {
            handle.close();
            stream.stop_all();
            return Err(ParleyError::Call("session ended while placing call".into()));
        };

        self.show_local(&stream, epoch);
        if kind.is_some() {
            self.emit_flags();
        }
        self.emitter.emit(ParleyEvent::CallStateChanged(CallState::Requesting));
        self.connect_early(early);
        Ok(())
    }

    /// Auto-answer an inbound call.
    ///
    /// A call from the active counterpart replaces the active handle; a call
    /// from anyone else while busy is closed unanswered.
    pub async fn answer(&self, handle: Arc<dyn MediaConnection>) -> Result<(), ParleyError> {
        let remote_id = handle.remote_id().to_string();
        let (constraints, epoch, replacing) = {
            let mut inner = self.lock();
            let replacing = match inner.busy_with() {
                Some(busy) if busy == remote_id && inner.active.is_some() => true,
                Some(busy) => {
                    drop(inner);
                    tracing::warn!("rejecting call from {remote_id}: busy with {busy}");
                    handle.close();
                    return Err(ParleyError::CallInProgress(busy));
                }
                None => {
                    inner.state = CallState::Ringing;
                    inner.pending = Some(remote_id.clone());
                    false
                }
            };
            (inner.constraints(), inner.epoch, replacing)
        };
        if !replacing {
            tracing::info!("incoming call from {remote_id}");
            self.emitter.emit(ParleyEvent::CallStateChanged(CallState::Ringing));
        }

        let stream = match self.capture_stream(constraints).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("cannot answer call from {remote_id}: {e}");
                handle.close();
                if !replacing {
                    let current = {
                        let mut inner = self.lock();
                        let current = inner.epoch == epoch;
                        if current {
                            inner.pending = None;
                        }
                        current
                    };
                    if current {
                        self.set_state(CallState::Idle);
                    }
                }
                return Err(e);
            }
        };

        if self.lock().epoch != epoch {
            handle.close();
            stream.stop_all();
            return Err(ParleyError::Call("session ended while capturing media".into()));
        }

        handle.answer(&stream);

        let outcome = {
            let mut inner = self.lock();
            if inner.epoch == epoch {
                let connected = replacing && inner.active.as_ref().is_some_and(|a| a.connected);
                inner.pending = None;
                Ok(inner.install(ActiveCall {
                    handle: handle.clone(),
                    local_stream: stream.clone(),
                    connected,
                }))
            } else {
                Err(())
            }
        };
        let Ok((replaced, early)) = outcome else {
            handle.close();
            stream.stop_all();
            return Err(ParleyError::Call("session ended while answering".into()));
        };

        self.show_local(&stream, epoch);
        if let Some(old) = replaced {
            tracing::debug!(
                "call {} from {remote_id} replaced by renegotiation",
                old.handle.connection_id()
            );
            old.handle.close();
            old.local_stream.stop_all();
        }
        self.connect_early(early);
        Ok(())
    }

    /// Attach a remote stream if it belongs to the active call.
    pub fn on_remote_stream(&self, connection_id: &str, stream: &MediaStream) -> bool {
        let was_connected = {
            let mut inner = self.lock();
            let active = inner
                .active
                .as_mut()
                .filter(|a| a.handle.connection_id() == connection_id);
            if let Some(active) = active {
                std::mem::replace(&mut active.connected, true)
            } else {
                tracing::debug!("no active call for stream on {connection_id}");
                inner.unmatched_stream = Some((connection_id.to_string(), stream.clone()));
                return false;
            }
        };
        self.sinks.remote.attach(Some(stream));
        if !was_connected {
            tracing::info!("call {connection_id} connected");
        }
        self.set_state(CallState::Connected);
        true
    }

    /// Flip a capability flag. With a call in progress the call is re-issued
    /// with a freshly captured stream; on capture failure the flag is restored
    /// and the running call is left untouched.
    pub async fn toggle(
        &self,
        capability: Capability,
        session: Option<&dyn TransportSession>,
    ) -> Result<(), ParleyError> {
        let (constraints, remote_id, epoch) = {
            let mut inner = self.lock();
            match capability {
                Capability::Microphone => inner.audio_enabled = !inner.audio_enabled,
                Capability::Camera => inner.video_enabled = !inner.video_enabled,
            }
            let remote_id = inner
                .active
                .as_ref()
                .map(|a| a.handle.remote_id().to_string());
            (inner.constraints(), remote_id, inner.epoch)
        };
        self.emit_flags();

        let (Some(remote_id), Some(session)) = (remote_id, session) else {
            return Ok(());
        };

        let stream = match self.capture_stream(constraints).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("{capability:?} toggle failed, keeping current call: {e}");
                {
                    let mut inner = self.lock();
                    match capability {
                        Capability::Microphone => inner.audio_enabled = !inner.audio_enabled,
                        Capability::Camera => inner.video_enabled = !inner.video_enabled,
                    }
                }
                self.emit_flags();
                return Err(e);
            }
        };

        let still_active = |inner: &CallInner| {
            inner.epoch == epoch
                && inner
                    .active
                    .as_ref()
                    .is_some_and(|a| a.handle.remote_id() == remote_id)
        };
        if !still_active(&*self.lock()) {
            stream.stop_all();
            return Ok(());
        }

        let handle = session.call(&remote_id, &stream);
        tracing::info!(
            "re-issuing call to {remote_id} as {} (audio={}, video={})",
            handle.connection_id(),
            constraints.audio,
            constraints.video
        );

        let outcome = {
            let mut inner = self.lock();
            if still_active(&*inner) {
                let connected = inner.active.as_ref().is_some_and(|a| a.connected);
                Ok(inner.install(ActiveCall {
                    handle: handle.clone(),
                    local_stream: stream.clone(),
                    connected,
                }))
            } else {
                Err(())
            }
        };
        let Ok((replaced, early)) = outcome else {
            handle.close();
            stream.stop_all();
            return Ok(());
        };

        self.show_local(&stream, epoch);
        if let Some(old) = replaced {
            old.handle.close();
            old.local_stream.stop_all();
        }
        self.connect_early(early);
        Ok(())
    }

    /// Close the active call, stop local media and detach both previews.
    pub(crate) fn tear_down(&self) {
        let (active, previous) = {
            let mut inner = self.lock();
            inner.epoch += 1;
            inner.pending = None;
            inner.unmatched_stream = None;
            let previous = inner.state;
            if previous != CallState::Idle {
                inner.state = CallState::Closed;
            }
            (inner.active.take(), previous)
        };

        if let Some(active) = active {
            tracing::info!("closing call {}", active.handle.connection_id());
            active.handle.close();
            active.local_stream.stop_all();
        }
        self.sinks.detach_all();

        if previous != CallState::Idle && previous != CallState::Closed {
            self.emitter.emit(ParleyEvent::CallStateChanged(CallState::Closed));
        }
    }
}
