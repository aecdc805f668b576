//! UniFFI bindings for parley-core.
//!
//! Provides a ParleyClient object wrapping the SessionManager behind a
//! blocking FFI-safe interface. The native shell implements the transport,
//! capture and preview bridges and pushes transport notifications back
//! through the `on_*` methods.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use parley_core::{
    self,
    call::CallState as CoreCallState,
    chat::{ChatMessage as CoreChatMessage, Sender as CoreSender},
    errors::{CaptureError, TransportError},
    events::{ParleyEvent as CoreParleyEvent, SessionState as CoreSessionState},
    media::{
        MediaCapture, MediaConstraints, MediaStream, MediaTrack, TrackKind as CoreTrackKind,
        VideoSink, VideoSinks,
    },
    transport::{
        DataConnection, MediaConnection, PeerTransport, TransportEvent, TransportEvents,
        TransportSession,
    },
};

uniffi::include_scaffolding!("parley");

// ── Namespace functions ──────────────────────────────────────────────

/// Initialize tracing/logging. Call once from the host before using ParleyClient.
fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "parley_core=debug,parley_ffi=debug".parse().unwrap()),
            )
            .with_ansi(false)
            .init();
    });
}

fn is_valid_peer_id(id: String) -> bool {
    parley_core::identity::validate_peer_id(&id).is_ok()
}

// ── FFI-safe type conversions ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Inactive,
    Active,
}

impl From<CoreSessionState> for SessionState {
    fn from(s: CoreSessionState) -> Self {
        match s {
            CoreSessionState::Inactive => Self::Inactive,
            CoreSessionState::Active => Self::Active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Requesting,
    Ringing,
    Connected,
    Closed,
}

impl From<CoreCallState> for CallState {
    fn from(s: CoreCallState) -> Self {
        match s {
            CoreCallState::Idle => Self::Idle,
            CoreCallState::Requesting => Self::Requesting,
            CoreCallState::Ringing => Self::Ringing,
            CoreCallState::Connected => Self::Connected,
            CoreCallState::Closed => Self::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    Local,
    Remote,
}

impl From<CoreSender> for Sender {
    fn from(s: CoreSender) -> Self {
        match s {
            CoreSender::Local => Self::Local,
            CoreSender::Remote => Self::Remote,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl From<CoreTrackKind> for TrackKind {
    fn from(k: CoreTrackKind) -> Self {
        match k {
            CoreTrackKind::Audio => Self::Audio,
            CoreTrackKind::Video => Self::Video,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkRole {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFault {
    IdTaken,
    PeerUnavailable,
    Network,
    Signaling,
}

fn transport_error(fault: TransportFault, detail: String) -> TransportError {
    match fault {
        TransportFault::IdTaken => TransportError::IdTaken(detail),
        TransportFault::PeerUnavailable => TransportError::PeerUnavailable(detail),
        TransportFault::Network => TransportError::Network,
        TransportFault::Signaling => TransportError::Signaling(detail),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender: Sender,
    pub conversation_key: String,
    pub timestamp_ms: i64,
    pub text: String,
}

impl From<CoreChatMessage> for ChatMessage {
    fn from(m: CoreChatMessage) -> Self {
        Self {
            sender: m.sender.into(),
            conversation_key: m.conversation_key.to_string(),
            timestamp_ms: m.timestamp.timestamp_millis(),
            text: m.text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub mic_enabled_on_call: bool,
    pub camera_enabled_on_call: bool,
    pub remember_counterpart: bool,
}

impl From<parley_core::Settings> for Settings {
    fn from(s: parley_core::Settings) -> Self {
        Self {
            mic_enabled_on_call: s.mic_enabled_on_call,
            camera_enabled_on_call: s.camera_enabled_on_call,
            remember_counterpart: s.remember_counterpart,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ParleyEvent {
    SessionStateChanged { state: SessionState },
    MessageRecorded { message: ChatMessage },
    IncognitoChanged { active: bool },
    CallStateChanged { state: CallState },
    MediaFlagsChanged { audio_enabled: bool, video_enabled: bool },
    Notice { message: String },
    Disconnected { reason: String },
}

impl From<CoreParleyEvent> for ParleyEvent {
    fn from(e: CoreParleyEvent) -> Self {
        match e {
            CoreParleyEvent::SessionStateChanged(s) => Self::SessionStateChanged { state: s.into() },
            CoreParleyEvent::MessageRecorded(m) => Self::MessageRecorded { message: m.into() },
            CoreParleyEvent::IncognitoChanged(active) => Self::IncognitoChanged { active },
            CoreParleyEvent::CallStateChanged(s) => Self::CallStateChanged { state: s.into() },
            CoreParleyEvent::MediaFlagsChanged {
                audio_enabled,
                video_enabled,
            } => Self::MediaFlagsChanged {
                audio_enabled,
                video_enabled,
            },
            CoreParleyEvent::Notice(message) => Self::Notice { message },
            CoreParleyEvent::Disconnected(reason) => Self::Disconnected {
                reason: reason.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub enum CaptureResult {
    Granted {
        stream_id: String,
        has_audio: bool,
        has_video: bool,
    },
    Denied {
        reason: String,
    },
    Unavailable {
        reason: String,
    },
}

// ── Error conversion ──────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ParleyError {
    #[error("Transport error: {msg}")]
    Transport { msg: String },
    #[error("Connection error: {msg}")]
    Connection { msg: String },
    #[error("Call error: {msg}")]
    Call { msg: String },
    #[error("Capture denied: {msg}")]
    CaptureDenied { msg: String },
    #[error("Capture failed: {msg}")]
    Capture { msg: String },
    #[error("Call in progress with {msg}")]
    CallInProgress { msg: String },
    #[error("Invalid peer id: {msg}")]
    InvalidPeerId { msg: String },
    #[error("Identity locked to {msg}")]
    IdentityLocked { msg: String },
    #[error("No identity: {msg}")]
    NoIdentity { msg: String },
}

impl From<parley_core::ParleyError> for ParleyError {
    fn from(e: parley_core::ParleyError) -> Self {
        tracing::error!("ParleyError: {e}");
        use parley_core::ParleyError as Core;
        match e {
            Core::Transport(msg) => Self::Transport { msg },
            Core::Connection(msg) => Self::Connection { msg },
            Core::Call(msg) => Self::Call { msg },
            Core::CaptureDenied(msg) => Self::CaptureDenied { msg },
            Core::Capture(msg) => Self::Capture { msg },
            Core::CallInProgress(msg) => Self::CallInProgress { msg },
            Core::InvalidPeerId(msg) => Self::InvalidPeerId { msg },
            Core::IdentityLocked(msg) => Self::IdentityLocked { msg },
            Core::NoIdentity => Self::NoIdentity {
                msg: "no local id bound".to_string(),
            },
        }
    }
}

// ── Callback interfaces ───────────────────────────────────────────────

pub trait ParleyEventListener: Send + Sync {
    fn on_event(&self, event: ParleyEvent);
}

/// Native broker/peer-link implementation. Every call must return promptly;
/// outcomes are reported back through the `ParleyClient::on_*` methods, which
/// are the only client methods safe to call from inside a bridge callback.
pub trait TransportBridge: Send + Sync {
    fn create(&self, local_id: String);
    fn connect_data(&self, connection_id: String, remote_id: String);
    fn send_data(&self, connection_id: String, text: String);
    fn close_data(&self, connection_id: String);
    fn call(&self, connection_id: String, remote_id: String, stream_id: String);
    fn answer(&self, connection_id: String, stream_id: String);
    fn close_call(&self, connection_id: String);
    fn destroy(&self, local_id: String);
}

/// Native camera/microphone access. `acquire_stream` may block on a
/// permission prompt; it is invoked off the async workers.
pub trait CaptureBridge: Send + Sync {
    fn acquire_stream(&self, audio: bool, video: bool) -> CaptureResult;
    fn stop_track(&self, stream_id: String, kind: TrackKind);
}

pub trait VideoSinkBridge: Send + Sync {
    fn attach(&self, role: SinkRole, stream_id: Option<String>);
}

// ── Bridge listener: FFI callback → core listener ─────────────────────

struct BridgeListener {
    ffi_listener: Arc<dyn ParleyEventListener>,
}

impl parley_core::ParleyEventListener for BridgeListener {
    fn on_event(&self, event: CoreParleyEvent) {
        self.ffi_listener.on_event(event.into());
    }
}

// ── Transport adapter: native bridge → core ports ─────────────────────

/// Sender side of the live session's event queue, shared with the `on_*`
/// push methods.
#[derive(Default)]
struct EventQueue {
    tx: StdMutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

impl EventQueue {
    fn lock(&self) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<TransportEvent>>> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn attach(&self, tx: mpsc::UnboundedSender<TransportEvent>) {
        *self.lock() = Some(tx);
    }

    fn detach(&self, tx: &mpsc::UnboundedSender<TransportEvent>) {
        let mut guard = self.lock();
        if guard.as_ref().is_some_and(|current| current.same_channel(tx)) {
            *guard = None;
        }
    }

    fn push(&self, event: TransportEvent) {
        match self.lock().as_ref() {
            Some(tx) => {
                if tx.send(event).is_err() {
                    tracing::debug!("session event loop gone, dropping transport event");
                }
            }
            None => tracing::debug!("no live session, dropping transport event {event:?}"),
        }
    }
}

struct FfiTransport {
    bridge: Arc<dyn TransportBridge>,
    queue: Arc<EventQueue>,
    next_connection: Arc<AtomicU64>,
}

impl PeerTransport for FfiTransport {
    fn create(&self, local_id: &str) -> (Arc<dyn TransportSession>, TransportEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.queue.attach(tx.clone());
        self.bridge.create(local_id.to_string());
        let session = Arc::new(FfiSession {
            local_id: local_id.to_string(),
            bridge: self.bridge.clone(),
            queue: self.queue.clone(),
            tx,
            next_connection: self.next_connection.clone(),
        });
        (session, rx)
    }
}

struct FfiSession {
    local_id: String,
    bridge: Arc<dyn TransportBridge>,
    queue: Arc<EventQueue>,
    tx: mpsc::UnboundedSender<TransportEvent>,
    next_connection: Arc<AtomicU64>,
}

impl FfiSession {
    fn connection_id(&self, prefix: &str) -> String {
        let n = self.next_connection.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}-{}-{n}", self.local_id)
    }
}

impl TransportSession for FfiSession {
    fn local_id(&self) -> &str {
        &self.local_id
    }

    fn connect_data(&self, remote_id: &str) -> Arc<dyn DataConnection> {
        let connection_id = self.connection_id("data");
        self.bridge
            .connect_data(connection_id.clone(), remote_id.to_string());
        Arc::new(FfiData {
            connection_id,
            remote_id: remote_id.to_string(),
            bridge: self.bridge.clone(),
        })
    }

    fn call(&self, remote_id: &str, stream: &MediaStream) -> Arc<dyn MediaConnection> {
        let connection_id = self.connection_id("call");
        self.bridge.call(
            connection_id.clone(),
            remote_id.to_string(),
            stream.id.clone(),
        );
        Arc::new(FfiCall {
            connection_id,
            remote_id: remote_id.to_string(),
            bridge: self.bridge.clone(),
        })
    }

    fn destroy(&self) {
        self.queue.detach(&self.tx);
        self.bridge.destroy(self.local_id.clone());
    }
}

struct FfiData {
    connection_id: String,
    remote_id: String,
    bridge: Arc<dyn TransportBridge>,
}

impl DataConnection for FfiData {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    fn send(&self, text: &str) {
        self.bridge
            .send_data(self.connection_id.clone(), text.to_string());
    }

    fn close(&self) {
        self.bridge.close_data(self.connection_id.clone());
    }
}

struct FfiCall {
    connection_id: String,
    remote_id: String,
    bridge: Arc<dyn TransportBridge>,
}

impl MediaConnection for FfiCall {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    fn answer(&self, stream: &MediaStream) {
        self.bridge
            .answer(self.connection_id.clone(), stream.id.clone());
    }

    fn close(&self) {
        self.bridge.close_call(self.connection_id.clone());
    }
}

// ── Media adapters ────────────────────────────────────────────────────

struct FfiTrack {
    stream_id: String,
    kind: CoreTrackKind,
    live: AtomicBool,
    /// Only locally captured tracks release a device on stop.
    capture: Option<Arc<dyn CaptureBridge>>,
}

impl MediaTrack for FfiTrack {
    fn kind(&self) -> CoreTrackKind {
        self.kind
    }

    fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            if let Some(capture) = &self.capture {
                capture.stop_track(self.stream_id.clone(), self.kind.into());
            }
        }
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

fn ffi_stream(
    stream_id: String,
    has_audio: bool,
    has_video: bool,
    capture: Option<Arc<dyn CaptureBridge>>,
) -> MediaStream {
    let mut tracks: Vec<Arc<dyn MediaTrack>> = Vec::new();
    for (present, kind) in [(has_audio, CoreTrackKind::Audio), (has_video, CoreTrackKind::Video)] {
        if present {
            tracks.push(Arc::new(FfiTrack {
                stream_id: stream_id.clone(),
                kind,
                live: AtomicBool::new(true),
                capture: capture.clone(),
            }));
        }
    }
    MediaStream::new(stream_id, tracks)
}

struct FfiCapture {
    bridge: Arc<dyn CaptureBridge>,
}

#[async_trait]
impl MediaCapture for FfiCapture {
    async fn get_local_stream(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, CaptureError> {
        let bridge = self.bridge.clone();
        let MediaConstraints { audio, video } = constraints;
        let result = tokio::task::spawn_blocking(move || bridge.acquire_stream(audio, video))
            .await
            .map_err(|e| CaptureError::Unavailable(format!("capture task failed: {e}")))?;
        match result {
            CaptureResult::Granted {
                stream_id,
                has_audio,
                has_video,
            } => Ok(ffi_stream(
                stream_id,
                has_audio,
                has_video,
                Some(self.bridge.clone()),
            )),
            CaptureResult::Denied { reason } => Err(CaptureError::Denied(reason)),
            CaptureResult::Unavailable { reason } => Err(CaptureError::Unavailable(reason)),
        }
    }
}

struct FfiSink {
    role: SinkRole,
    bridge: Arc<dyn VideoSinkBridge>,
}

impl VideoSink for FfiSink {
    fn attach(&self, stream: Option<&MediaStream>) {
        self.bridge.attach(self.role, stream.map(|s| s.id.clone()));
    }
}

// ── ParleyClient: main FFI object ─────────────────────────────────────

pub struct ParleyClient {
    manager: parley_core::SessionManager,
    settings: parley_core::SettingsStore,
    queue: Arc<EventQueue>,
    bridge: Arc<dyn TransportBridge>,
    rt: tokio::runtime::Runtime,
}

impl ParleyClient {
    /// Call flag settings are read here; changes apply to the next client.
    pub fn new(
        data_dir: String,
        transport: Box<dyn TransportBridge>,
        capture: Box<dyn CaptureBridge>,
        sinks: Box<dyn VideoSinkBridge>,
    ) -> Self {
        let rt = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
        let settings = parley_core::SettingsStore::new(&data_dir);
        let store = Arc::new(parley_core::storage::FileStore::open(&data_dir));
        tracing::info!("parley store at {}", store.path().display());

        let bridge: Arc<dyn TransportBridge> = Arc::from(transport);
        let sinks: Arc<dyn VideoSinkBridge> = Arc::from(sinks);
        let queue = Arc::new(EventQueue::default());

        let manager = parley_core::SessionManager::new(
            parley_core::Collaborators {
                transport: Arc::new(FfiTransport {
                    bridge: bridge.clone(),
                    queue: queue.clone(),
                    next_connection: Arc::new(AtomicU64::new(1)),
                }),
                capture: Arc::new(FfiCapture {
                    bridge: Arc::from(capture),
                }),
                sinks: VideoSinks::new(
                    Arc::new(FfiSink {
                        role: SinkRole::Local,
                        bridge: sinks.clone(),
                    }),
                    Arc::new(FfiSink {
                        role: SinkRole::Remote,
                        bridge: sinks,
                    }),
                ),
                store,
            },
            &settings.get(),
        );

        Self {
            manager,
            settings,
            queue,
            bridge,
            rt,
        }
    }

    pub fn create_session(&self, local_id: Option<String>) -> Result<String, ParleyError> {
        // Keep panics from crossing the FFI boundary.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.rt
                .block_on(self.manager.create_session(local_id.as_deref()))
                .map_err(ParleyError::from)
        }));
        match result {
            Ok(res) => res,
            Err(panic_info) => {
                let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                tracing::error!("create_session panicked: {msg}");
                Err(ParleyError::Transport {
                    msg: format!("panic in create_session: {msg}"),
                })
            }
        }
    }

    pub fn set_remote_id(&self, remote_id: String) -> Result<(), ParleyError> {
        self.rt
            .block_on(self.manager.set_remote_id(&remote_id))
            .map_err(ParleyError::from)
    }

    pub fn send(&self, text: String) -> Result<(), ParleyError> {
        self.rt
            .block_on(self.manager.send(&text))
            .map_err(ParleyError::from)
    }

    pub fn call(&self) -> Result<(), ParleyError> {
        self.rt
            .block_on(self.manager.call())
            .map_err(ParleyError::from)
    }

    pub fn toggle_mute(&self) -> Result<(), ParleyError> {
        self.rt
            .block_on(self.manager.toggle_mute())
            .map_err(ParleyError::from)
    }

    pub fn toggle_camera(&self) -> Result<(), ParleyError> {
        self.rt
            .block_on(self.manager.toggle_camera())
            .map_err(ParleyError::from)
    }

    pub fn disconnect(&self) {
        self.rt.block_on(self.manager.disconnect());
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.manager
            .messages()
            .into_iter()
            .map(ChatMessage::from)
            .collect()
    }

    pub fn call_connected(&self) -> bool {
        self.manager.call_connected()
    }

    pub fn audio_enabled(&self) -> bool {
        self.manager.audio_enabled()
    }

    pub fn video_enabled(&self) -> bool {
        self.manager.video_enabled()
    }

    pub fn is_incognito(&self) -> bool {
        self.manager.is_incognito()
    }

    pub fn call_state(&self) -> CallState {
        self.manager.call_state().into()
    }

    pub fn session_state(&self) -> SessionState {
        self.rt.block_on(self.manager.session_state()).into()
    }

    pub fn local_id(&self) -> Option<String> {
        self.manager.local_id()
    }

    pub fn remote_id(&self) -> Option<String> {
        self.manager.remote_id()
    }

    pub fn add_listener(&self, listener: Box<dyn ParleyEventListener>) {
        let bridge = Arc::new(BridgeListener {
            ffi_listener: Arc::from(listener),
        });
        self.manager.add_listener(bridge);
    }

    pub fn get_settings(&self) -> Settings {
        self.settings.get().into()
    }

    pub fn set_mic_enabled_on_call(&self, enabled: bool) {
        self.settings.set_mic_enabled_on_call(enabled);
    }

    pub fn set_camera_enabled_on_call(&self, enabled: bool) {
        self.settings.set_camera_enabled_on_call(enabled);
    }

    pub fn set_remember_counterpart(&self, remember: bool) {
        self.settings.set_remember_counterpart(remember);
    }

    // ── Transport notifications pushed by the native shell ──────────

    pub fn on_incoming_connection(&self, connection_id: String, remote_id: String) {
        self.queue
            .push(TransportEvent::IncomingConnection(Arc::new(FfiData {
                connection_id,
                remote_id,
                bridge: self.bridge.clone(),
            })));
    }

    pub fn on_data_open(&self, connection_id: String) {
        self.queue.push(TransportEvent::DataOpen { connection_id });
    }

    pub fn on_data_received(&self, connection_id: String, remote_id: String, text: String) {
        self.queue.push(TransportEvent::DataReceived {
            connection_id,
            remote_id,
            text,
        });
    }

    pub fn on_data_closed(&self, connection_id: String) {
        self.queue.push(TransportEvent::DataClosed { connection_id });
    }

    pub fn on_data_error(&self, connection_id: String, message: String) {
        self.queue.push(TransportEvent::DataError {
            connection_id,
            message,
        });
    }

    pub fn on_incoming_call(&self, connection_id: String, remote_id: String) {
        self.queue.push(TransportEvent::IncomingCall(Arc::new(FfiCall {
            connection_id,
            remote_id,
            bridge: self.bridge.clone(),
        })));
    }

    pub fn on_remote_stream(
        &self,
        connection_id: String,
        stream_id: String,
        has_audio: bool,
        has_video: bool,
    ) {
        self.queue.push(TransportEvent::RemoteStream {
            connection_id,
            stream: ffi_stream(stream_id, has_audio, has_video, None),
        });
    }

    pub fn on_call_closed(&self, connection_id: String) {
        self.queue.push(TransportEvent::CallClosed { connection_id });
    }

    pub fn on_call_error(&self, connection_id: String, message: String) {
        self.queue.push(TransportEvent::CallError {
            connection_id,
            message,
        });
    }

    pub fn on_broker_disconnected(&self) {
        self.queue.push(TransportEvent::Disconnected);
    }

    pub fn on_transport_error(&self, fault: TransportFault, detail: String) {
        self.queue
            .push(TransportEvent::Error(transport_error(fault, detail)));
    }
}
