use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};

use crate::call::{CallSession, CallState, Capability};
use crate::chat::{ChatMessage, MessageStore, Sender};
use crate::directive::{Directive, ENTER_INCOGNITO_TOKEN, EXIT_INCOGNITO_TOKEN};
use crate::errors::ParleyError;
use crate::events::{EventEmitter, ParleyEvent, ParleyEventListener, SessionState};
use crate::identity::IdentityStore;
use crate::media::{MediaCapture, VideoSinks};
use crate::recovery::{DisconnectReason, Teardown};
use crate::settings::Settings;
use crate::storage::KeyValueStore;
use crate::transport::{DataConnection, PeerTransport, TransportEvent, TransportSession};

/// Platform ports a [`SessionManager`] is wired to.
pub struct Collaborators {
    pub transport: Arc<dyn PeerTransport>,
    pub capture: Arc<dyn MediaCapture>,
    pub sinks: VideoSinks,
    pub store: Arc<dyn KeyValueStore>,
}

struct LiveSession {
    handle: Arc<dyn TransportSession>,
    cancel: watch::Sender<bool>,
}

/// Cached outbound data channel to the counterpart.
struct OutboundChannel {
    handle: Arc<dyn DataConnection>,
    open: bool,
    /// Texts sent before the channel opened, flushed in order on open.
    pending: VecDeque<String>,
}

/// Owns the transport session and routes everything that flows through it.
///
/// At most one transport session is live. Sending or calling without one
/// creates it lazily with the bound local id. Every transport notification
/// is handled on a single spawned task, in arrival order.
#[derive(Clone)]
pub struct SessionManager {
    transport: Arc<dyn PeerTransport>,
    identity: Arc<IdentityStore>,
    messages: Arc<MessageStore>,
    call: Arc<CallSession>,
    emitter: EventEmitter,
    live: Arc<Mutex<Option<LiveSession>>>,
    outbound: Arc<Mutex<Option<OutboundChannel>>>,
    inbound: Arc<Mutex<HashMap<String, Arc<dyn DataConnection>>>>,
}

impl SessionManager {
    pub fn new(collaborators: Collaborators, settings: &Settings) -> Self {
        let Collaborators {
            transport,
            capture,
            sinks,
            store,
        } = collaborators;
        let emitter = EventEmitter::new();
        let call = CallSession::new(
            capture,
            sinks,
            emitter.clone(),
            settings.mic_enabled_on_call,
            settings.camera_enabled_on_call,
        );
        Self {
            transport,
            identity: Arc::new(IdentityStore::load(store.clone(), settings.remember_counterpart)),
            messages: Arc::new(MessageStore::new(store)),
            call: Arc::new(call),
            emitter,
            live: Arc::new(Mutex::new(None)),
            outbound: Arc::new(Mutex::new(None)),
            inbound: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a listener for session events.
    pub fn add_listener(&self, listener: Arc<dyn ParleyEventListener>) {
        self.emitter.add_listener(listener);
    }

    pub fn local_id(&self) -> Option<String> {
        self.identity.local_id()
    }

    pub fn remote_id(&self) -> Option<String> {
        self.identity.remote_id()
    }

    pub async fn session_state(&self) -> SessionState {
        if self.live.lock().await.is_some() {
            SessionState::Active
        } else {
            SessionState::Inactive
        }
    }

    /// Messages of the active conversation, or nothing until both ids are known.
    pub fn messages(&self) -> Vec<ChatMessage> {
        match self.identity.conversation_key() {
            Some(key) => self.messages.list(&key),
            None => Vec::new(),
        }
    }

    pub fn is_incognito(&self) -> bool {
        self.messages.is_incognito()
    }

    pub fn call_state(&self) -> CallState {
        self.call.state()
    }

    pub fn call_connected(&self) -> bool {
        self.call.is_connected()
    }

    pub fn audio_enabled(&self) -> bool {
        self.call.audio_enabled()
    }

    pub fn video_enabled(&self) -> bool {
        self.call.video_enabled()
    }

    /// Register with the broker, returning the bound local id.
    ///
    /// A no-op while a session is live, provided `local_id` (if given)
    /// matches the bound id.
    pub async fn create_session(&self, local_id: Option<&str>) -> Result<String, ParleyError> {
        let session = self.open_session(local_id).await?;
        Ok(session.local_id().to_string())
    }

    async fn open_session(&self, requested: Option<&str>) -> Result<Arc<dyn TransportSession>, ParleyError> {
        let mut live = self.live.lock().await;
        if let Some(existing) = live.as_ref() {
            self.identity.bind_local_id(requested)?;
            return Ok(existing.handle.clone());
        }

        let local_id = self.identity.bind_local_id(requested)?;
        let (handle, events) = self.transport.create(&local_id);
        let (cancel, cancel_rx) = watch::channel(false);
        *live = Some(LiveSession {
            handle: handle.clone(),
            cancel,
        });
        drop(live);

        tracing::info!("transport session created for {local_id}");

        // Spawn event loop
        let manager = self.clone();
        tokio::spawn(async move {
            manager.event_loop(events, cancel_rx).await;
        });

        self.emitter
            .emit(ParleyEvent::SessionStateChanged(SessionState::Active));
        Ok(handle)
    }

    /// Switch the conversation counterpart.
    ///
    /// A cached outbound channel to a different peer is closed so the next
    /// send connects to the new one.
    pub async fn set_remote_id(&self, remote_id: &str) -> Result<(), ParleyError> {
        let remote_id = self.identity.set_remote_id(remote_id)?;
        let stale = {
            let mut outbound = self.outbound.lock().await;
            match outbound.as_ref() {
                Some(channel) if channel.handle.remote_id() != remote_id => outbound.take(),
                _ => None,
            }
        };
        if let Some(channel) = stale {
            tracing::debug!(
                "counterpart changed, dropping channel {}",
                channel.handle.connection_id()
            );
            channel.handle.close();
        }
        Ok(())
    }

    /// Send a line typed by the user.
    ///
    /// Control tokens are interpreted here and never recorded: call tokens
    /// start a call, incognito tokens switch mode locally and are relayed to
    /// the counterpart, and an empty line hangs up a live session. Without a
    /// counterpart every non-empty line is ignored.
    pub async fn send(&self, text: &str) -> Result<(), ParleyError> {
        let directive = Directive::parse(text);

        if directive == Directive::Hangup {
            if self.live.lock().await.is_some() {
                self.disconnect_with(DisconnectReason::Hangup).await;
            }
            return Ok(());
        }

        let Some(remote_id) = self.identity.remote_id() else {
            tracing::debug!("no counterpart set, ignoring outgoing text");
            return Ok(());
        };

        match directive {
            Directive::CallRequest(kind) => {
                tracing::info!("{} call requested", kind.token());
                let session = self.open_session(None).await?;
                self.call.call_as(&*session, &remote_id, kind).await
            }
            Directive::EnterIncognito => {
                self.set_incognito(true);
                self.transmit(&remote_id, ENTER_INCOGNITO_TOKEN).await
            }
            Directive::ExitIncognito => {
                self.set_incognito(false);
                self.transmit(&remote_id, EXIT_INCOGNITO_TOKEN).await
            }
            Directive::Chat(body) => {
                self.open_session(None).await?;
                let key = self
                    .identity
                    .key_for(&remote_id)
                    .ok_or(ParleyError::NoIdentity)?;
                let message = ChatMessage::new(Sender::Local, key, body.as_str());
                if self.messages.record(message.clone()) {
                    self.emitter.emit(ParleyEvent::MessageRecorded(message));
                }
                self.transmit(&remote_id, &body).await
            }
            Directive::Hangup => Ok(()),
        }
    }

    async fn transmit(&self, remote_id: &str, text: &str) -> Result<(), ParleyError> {
        let session = self.open_session(None).await?;
        let mut outbound = self.outbound.lock().await;

        if let Some(channel) = outbound.as_mut().filter(|c| c.handle.remote_id() == remote_id) {
            if channel.open {
                channel.handle.send(text);
            } else {
                channel.pending.push_back(text.to_string());
            }
            return Ok(());
        }

        if let Some(stale) = outbound.take() {
            stale.handle.close();
        }
        let handle = session.connect_data(remote_id);
        tracing::debug!(
            "opening data connection {} to {remote_id}",
            handle.connection_id()
        );
        *outbound = Some(OutboundChannel {
            handle,
            open: false,
            pending: VecDeque::from([text.to_string()]),
        });
        Ok(())
    }

    /// Call the counterpart with the current capability flags.
    pub async fn call(&self) -> Result<(), ParleyError> {
        let Some(remote_id) = self.identity.remote_id() else {
            tracing::debug!("no counterpart set, ignoring call");
            return Ok(());
        };
        let session = self.open_session(None).await?;
        self.call.call(&*session, &remote_id).await
    }

    pub async fn toggle_mute(&self) -> Result<(), ParleyError> {
        self.toggle(Capability::Microphone).await
    }

    pub async fn toggle_camera(&self) -> Result<(), ParleyError> {
        self.toggle(Capability::Camera).await
    }

    async fn toggle(&self, capability: Capability) -> Result<(), ParleyError> {
        let session = self.live.lock().await.as_ref().map(|l| l.handle.clone());
        self.call.toggle(capability, session.as_deref()).await
    }

    /// Tear the session down on user request.
    pub async fn disconnect(&self) {
        self.disconnect_with(DisconnectReason::User).await;
    }

    pub(crate) async fn disconnect_with(&self, reason: DisconnectReason) {
        let live = self.live.lock().await.take();
        let outbound = self.outbound.lock().await.take().map(|c| c.handle);
        let inbound: Vec<_> = self.inbound.lock().await.drain().map(|(_, c)| c).collect();
        let was_live = live.is_some();
        let (cancel_loop, session) = match live {
            Some(live) => (Some(live.cancel), Some(live.handle)),
            None => (None, None),
        };

        Teardown {
            cancel_loop,
            outbound,
            inbound,
            session,
        }
        .run(&self.call, &reason);

        if was_live {
            self.emitter.emit(ParleyEvent::Disconnected(reason));
            self.emitter
                .emit(ParleyEvent::SessionStateChanged(SessionState::Inactive));
        }
    }

    fn set_incognito(&self, active: bool) {
        if self.messages.set_incognito(active) {
            tracing::info!("incognito {}", if active { "on" } else { "off" });
            self.emitter.emit(ParleyEvent::IncognitoChanged(active));
        }
    }

    async fn event_loop(
        &self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut cancel: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = cancel.changed() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
        tracing::debug!("transport event loop ended");
    }

    async fn handle_event(&self, event: TransportEvent) {
        tracing::trace!("transport event: {event:?}");
        match event {
            TransportEvent::IncomingConnection(conn) => {
                tracing::info!(
                    "incoming data connection {} from {}",
                    conn.connection_id(),
                    conn.remote_id()
                );
                self.inbound
                    .lock()
                    .await
                    .insert(conn.connection_id().to_string(), conn);
            }
            TransportEvent::DataOpen { connection_id } => {
                let mut outbound = self.outbound.lock().await;
                match outbound
                    .as_mut()
                    .filter(|c| c.handle.connection_id() == connection_id)
                {
                    Some(channel) => {
                        channel.open = true;
                        while let Some(text) = channel.pending.pop_front() {
                            channel.handle.send(&text);
                        }
                    }
                    None => tracing::debug!("open for untracked connection {connection_id}"),
                }
            }
            TransportEvent::DataReceived { remote_id, text, .. } => {
                self.handle_incoming_text(&remote_id, &text);
            }
            TransportEvent::DataClosed { connection_id } => {
                if self.drop_outbound(&connection_id).await {
                    tracing::debug!("outbound connection {connection_id} closed, cache cleared");
                    return;
                }
                let was_inbound = self.inbound.lock().await.remove(&connection_id).is_some();
                if was_inbound {
                    self.disconnect_with(DisconnectReason::ConnectionClosed).await;
                }
            }
            TransportEvent::DataError {
                connection_id,
                message,
            } => {
                tracing::warn!("data connection {connection_id} failed: {message}");
                let known = self.drop_outbound(&connection_id).await
                    || self.inbound.lock().await.remove(&connection_id).is_some();
                if known {
                    self.disconnect_with(DisconnectReason::ConnectionError(message)).await;
                }
            }
            TransportEvent::IncomingCall(handle) => {
                if let Err(e) = self.call.answer(handle).await {
                    tracing::warn!("incoming call not answered: {e}");
                    self.emitter.emit(ParleyEvent::Notice(e.to_string()));
                }
            }
            TransportEvent::RemoteStream {
                connection_id,
                stream,
            } => {
                self.call.on_remote_stream(&connection_id, &stream);
            }
            TransportEvent::CallClosed { connection_id } => {
                if self.call.is_active_connection(&connection_id) {
                    self.disconnect_with(DisconnectReason::CallClosed).await;
                }
            }
            TransportEvent::CallError {
                connection_id,
                message,
            } => {
                tracing::warn!("call {connection_id} failed: {message}");
                if self.call.is_active_connection(&connection_id) {
                    self.disconnect_with(DisconnectReason::CallError(message)).await;
                }
            }
            TransportEvent::Disconnected => {
                tracing::warn!("lost connection to the signaling broker");
                self.emitter.emit(ParleyEvent::Notice(
                    "lost connection to the signaling broker".to_string(),
                ));
            }
            TransportEvent::Error(e) => {
                tracing::error!("transport error: {e}");
                self.emitter.emit(ParleyEvent::Notice(e.to_string()));
                self.disconnect_with(DisconnectReason::Transport(e)).await;
            }
        }
    }

    /// Forget the cached outbound channel if it is `connection_id`.
    async fn drop_outbound(&self, connection_id: &str) -> bool {
        let mut outbound = self.outbound.lock().await;
        if outbound
            .as_ref()
            .is_some_and(|c| c.handle.connection_id() == connection_id)
        {
            if let Some(channel) = outbound.take() {
                if !channel.pending.is_empty() {
                    tracing::warn!(
                        "dropping {} unsent messages on closed connection",
                        channel.pending.len()
                    );
                }
            }
            return true;
        }
        false
    }

    fn handle_incoming_text(&self, remote_id: &str, text: &str) {
        match Directive::parse(text) {
            Directive::Chat(body) => {
                let Some(key) = self.identity.key_for(remote_id) else {
                    tracing::warn!("message from {remote_id} before local id was bound");
                    return;
                };
                let message = ChatMessage::new(Sender::Remote, key, body);
                if self.messages.record(message.clone()) {
                    self.emitter.emit(ParleyEvent::MessageRecorded(message));
                }
            }
            Directive::EnterIncognito => self.set_incognito(true),
            Directive::ExitIncognito => self.set_incognito(false),
            Directive::CallRequest(kind) => {
                tracing::info!("{remote_id} sent a {} call request", kind.token());
            }
            Directive::Hangup => tracing::debug!("empty message from {remote_id}"),
        }
    }
}
