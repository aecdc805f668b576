//! In-process fakes for the platform ports.
//!
//! [`Loopback`] is a broker that wires sessions of several peers together
//! through their event queues, so two [`SessionManager`]s can talk to each
//! other inside one test runtime.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::errors::{CaptureError, TransportError};
use crate::events::{ParleyEvent, ParleyEventListener};
use crate::media::{MediaCapture, MediaConstraints, MediaStream, MediaTrack, TrackKind, VideoSink, VideoSinks};
use crate::session::{Collaborators, SessionManager};
use crate::settings::Settings;
use crate::storage::MemoryStore;
use crate::transport::{
    DataConnection, MediaConnection, PeerTransport, TransportEvent, TransportEvents, TransportSession,
};

type EventTx = UnboundedSender<TransportEvent>;

#[derive(Default)]
struct Broker {
    peers: Mutex<HashMap<String, EventTx>>,
    closed: Mutex<HashSet<String>>,
    hold_open: AtomicBool,
    held: Mutex<Vec<(EventTx, String)>>,
}

impl Broker {
    fn sender(&self, id: &str) -> Option<EventTx> {
        self.peers.lock().unwrap().get(id).cloned()
    }

    /// Marks `connection_id` closed; `true` only for the first close.
    fn close(&self, connection_id: &str) -> bool {
        self.closed.lock().unwrap().insert(connection_id.to_string())
    }

    fn is_closed(&self, connection_id: &str) -> bool {
        self.closed.lock().unwrap().contains(connection_id)
    }

    fn open(&self, events: &EventTx, connection_id: &str) {
        if self.hold_open.load(Ordering::SeqCst) {
            self.held
                .lock()
                .unwrap()
                .push((events.clone(), connection_id.to_string()));
        } else {
            let _ = events.send(TransportEvent::DataOpen {
                connection_id: connection_id.to_string(),
            });
        }
    }
}

#[derive(Clone, Default)]
pub(crate) struct Loopback {
    broker: Arc<Broker>,
}

impl Loopback {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn transport(&self) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            broker: self.broker.clone(),
            sessions_created: AtomicUsize::new(0),
            data_connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub(crate) fn is_registered(&self, id: &str) -> bool {
        self.broker.peers.lock().unwrap().contains_key(id)
    }

    pub(crate) fn is_closed(&self, connection_id: &str) -> bool {
        self.broker.is_closed(connection_id)
    }

    /// While held, new data connections stay unopened until [`Self::release_opens`].
    pub(crate) fn hold_opens(&self, hold: bool) {
        self.broker.hold_open.store(hold, Ordering::SeqCst);
    }

    pub(crate) fn release_opens(&self) {
        let held: Vec<_> = self.broker.held.lock().unwrap().drain(..).collect();
        for (events, connection_id) in held {
            let _ = events.send(TransportEvent::DataOpen { connection_id });
        }
    }

    /// Push a raw event onto `peer_id`'s queue.
    pub(crate) fn inject(&self, peer_id: &str, event: TransportEvent) -> bool {
        self.broker
            .sender(peer_id)
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    pub(crate) fn peer(&self) -> TestPeer {
        self.peer_with(Arc::new(MemoryStore::new()), Settings::default())
    }

    pub(crate) fn peer_with(&self, store: Arc<MemoryStore>, settings: Settings) -> TestPeer {
        let transport = self.transport();
        let capture = Arc::new(FakeCapture::new());
        let local_sink = Arc::new(RecordingSink::default());
        let remote_sink = Arc::new(RecordingSink::default());
        let events = Arc::new(EventLog::default());
        let manager = SessionManager::new(
            Collaborators {
                transport: transport.clone(),
                capture: capture.clone(),
                sinks: VideoSinks::new(local_sink.clone(), remote_sink.clone()),
                store: store.clone(),
            },
            &settings,
        );
        manager.add_listener(events.clone());
        TestPeer {
            manager,
            transport,
            capture,
            local_sink,
            remote_sink,
            store,
            events,
        }
    }
}

pub(crate) struct TestPeer {
    pub(crate) manager: SessionManager,
    pub(crate) transport: Arc<LoopbackTransport>,
    pub(crate) capture: Arc<FakeCapture>,
    pub(crate) local_sink: Arc<RecordingSink>,
    pub(crate) remote_sink: Arc<RecordingSink>,
    pub(crate) store: Arc<MemoryStore>,
    pub(crate) events: Arc<EventLog>,
}

impl TestPeer {
    pub(crate) fn texts(&self) -> Vec<String> {
        self.manager.messages().into_iter().map(|m| m.text).collect()
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.events
            .count(|e| matches!(e, ParleyEvent::Disconnected(_)))
    }
}

pub(crate) struct LoopbackTransport {
    broker: Arc<Broker>,
    sessions_created: AtomicUsize,
    data_connections: Arc<AtomicUsize>,
}

impl LoopbackTransport {
    pub(crate) fn sessions_created(&self) -> usize {
        self.sessions_created.load(Ordering::SeqCst)
    }

    pub(crate) fn data_connections(&self) -> usize {
        self.data_connections.load(Ordering::SeqCst)
    }
}

impl PeerTransport for LoopbackTransport {
    fn create(&self, local_id: &str) -> (Arc<dyn TransportSession>, TransportEvents) {
        self.sessions_created.fetch_add(1, Ordering::SeqCst);
        let (events, rx) = mpsc::unbounded_channel();
        {
            let mut peers = self.broker.peers.lock().unwrap();
            if peers.contains_key(local_id) {
                let _ = events.send(TransportEvent::Error(TransportError::IdTaken(
                    local_id.to_string(),
                )));
            } else {
                peers.insert(local_id.to_string(), events.clone());
            }
        }
        let session = Arc::new(LoopbackSession {
            local_id: local_id.to_string(),
            broker: self.broker.clone(),
            events,
            data_connections: self.data_connections.clone(),
        });
        (session, rx)
    }
}

struct LoopbackSession {
    local_id: String,
    broker: Arc<Broker>,
    events: EventTx,
    data_connections: Arc<AtomicUsize>,
}

fn dead_end() -> EventTx {
    mpsc::unbounded_channel().0
}

impl TransportSession for LoopbackSession {
    fn local_id(&self) -> &str {
        &self.local_id
    }

    fn connect_data(&self, remote_id: &str) -> Arc<dyn DataConnection> {
        let connection_id = uuid::Uuid::new_v4().to_string();
        self.data_connections.fetch_add(1, Ordering::SeqCst);
        let peer = match self.broker.sender(remote_id) {
            Some(peer) => {
                let remote_end = Arc::new(LoopbackData {
                    connection_id: connection_id.clone(),
                    local_id: remote_id.to_string(),
                    remote_id: self.local_id.clone(),
                    broker: self.broker.clone(),
                    own: peer.clone(),
                    peer: self.events.clone(),
                });
                let _ = peer.send(TransportEvent::IncomingConnection(remote_end));
                self.broker.open(&self.events, &connection_id);
                peer
            }
            None => {
                let _ = self.events.send(TransportEvent::Error(TransportError::PeerUnavailable(
                    remote_id.to_string(),
                )));
                dead_end()
            }
        };
        Arc::new(LoopbackData {
            connection_id,
            local_id: self.local_id.clone(),
            remote_id: remote_id.to_string(),
            broker: self.broker.clone(),
            own: self.events.clone(),
            peer,
        })
    }

    fn call(&self, remote_id: &str, stream: &MediaStream) -> Arc<dyn MediaConnection> {
        let connection_id = uuid::Uuid::new_v4().to_string();
        let peer = match self.broker.sender(remote_id) {
            Some(peer) => {
                let remote_end = Arc::new(LoopbackCall {
                    connection_id: connection_id.clone(),
                    remote_id: self.local_id.clone(),
                    broker: self.broker.clone(),
                    own: peer.clone(),
                    peer: self.events.clone(),
                    offered: Some(stream.clone()),
                });
                let _ = peer.send(TransportEvent::IncomingCall(remote_end));
                peer
            }
            None => {
                let _ = self.events.send(TransportEvent::Error(TransportError::PeerUnavailable(
                    remote_id.to_string(),
                )));
                dead_end()
            }
        };
        Arc::new(LoopbackCall {
            connection_id,
            remote_id: remote_id.to_string(),
            broker: self.broker.clone(),
            own: self.events.clone(),
            peer,
            offered: None,
        })
    }

    fn destroy(&self) {
        let mut peers = self.broker.peers.lock().unwrap();
        if peers
            .get(&self.local_id)
            .is_some_and(|tx| tx.same_channel(&self.events))
        {
            peers.remove(&self.local_id);
        }
    }
}

struct LoopbackData {
    connection_id: String,
    local_id: String,
    remote_id: String,
    broker: Arc<Broker>,
    own: EventTx,
    peer: EventTx,
}

impl DataConnection for LoopbackData {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    fn send(&self, text: &str) {
        if self.broker.is_closed(&self.connection_id) {
            return;
        }
        let _ = self.peer.send(TransportEvent::DataReceived {
            connection_id: self.connection_id.clone(),
            remote_id: self.local_id.clone(),
            text: text.to_string(),
        });
    }

    fn close(&self) {
        if self.broker.close(&self.connection_id) {
            for tx in [&self.own, &self.peer] {
                let _ = tx.send(TransportEvent::DataClosed {
                    connection_id: self.connection_id.clone(),
                });
            }
        }
    }
}

struct LoopbackCall {
    connection_id: String,
    remote_id: String,
    broker: Arc<Broker>,
    own: EventTx,
    peer: EventTx,
    /// Caller's stream, present on the answering end only.
    offered: Option<MediaStream>,
}

impl MediaConnection for LoopbackCall {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    fn answer(&self, stream: &MediaStream) {
        if self.broker.is_closed(&self.connection_id) {
            return;
        }
        let _ = self.peer.send(TransportEvent::RemoteStream {
            connection_id: self.connection_id.clone(),
            stream: stream.clone(),
        });
        if let Some(offered) = &self.offered {
            let _ = self.own.send(TransportEvent::RemoteStream {
                connection_id: self.connection_id.clone(),
                stream: offered.clone(),
            });
        }
    }

    fn close(&self) {
        if self.broker.close(&self.connection_id) {
            for tx in [&self.own, &self.peer] {
                let _ = tx.send(TransportEvent::CallClosed {
                    connection_id: self.connection_id.clone(),
                });
            }
        }
    }
}

pub(crate) struct FakeTrack {
    kind: TrackKind,
    live: AtomicBool,
}

impl MediaTrack for FakeTrack {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

/// Capture that hands out fresh fake tracks, or refuses while denied.
#[derive(Default)]
pub(crate) struct FakeCapture {
    denied: AtomicBool,
    requests: Mutex<Vec<MediaConstraints>>,
    issued: Mutex<Vec<MediaStream>>,
}

impl FakeCapture {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn deny(&self, denied: bool) {
        self.denied.store(denied, Ordering::SeqCst);
    }

    pub(crate) fn requests(&self) -> Vec<MediaConstraints> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn issued(&self) -> Vec<MediaStream> {
        self.issued.lock().unwrap().clone()
    }

    pub(crate) fn last_stream(&self) -> Option<MediaStream> {
        self.issued.lock().unwrap().last().cloned()
    }

    pub(crate) fn all_stopped(&self) -> bool {
        self.issued
            .lock()
            .unwrap()
            .iter()
            .flat_map(|s| s.tracks.iter())
            .all(|t| !t.is_live())
    }
}

#[async_trait]
impl MediaCapture for FakeCapture {
    async fn get_local_stream(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, CaptureError> {
        self.requests.lock().unwrap().push(constraints);
        if self.denied.load(Ordering::SeqCst) {
            return Err(CaptureError::Denied("user dismissed the prompt".into()));
        }
        let mut tracks: Vec<Arc<dyn MediaTrack>> = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(FakeTrack {
                kind: TrackKind::Audio,
                live: AtomicBool::new(true),
            }));
        }
        if constraints.video {
            tracks.push(Arc::new(FakeTrack {
                kind: TrackKind::Video,
                live: AtomicBool::new(true),
            }));
        }
        let mut issued = self.issued.lock().unwrap();
        let stream = MediaStream::new(format!("stream-{}", uuid::Uuid::new_v4().simple()), tracks);
        issued.push(stream.clone());
        Ok(stream)
    }
}

/// Preview surface remembering the id of the attached stream.
#[derive(Default)]
pub(crate) struct RecordingSink {
    attached: Mutex<Option<String>>,
}

impl RecordingSink {
    pub(crate) fn current(&self) -> Option<String> {
        self.attached.lock().unwrap().clone()
    }
}

impl VideoSink for RecordingSink {
    fn attach(&self, stream: Option<&MediaStream>) {
        *self.attached.lock().unwrap() = stream.map(|s| s.id.clone());
    }
}

#[derive(Default)]
pub(crate) struct EventLog {
    events: Mutex<Vec<ParleyEvent>>,
}

impl EventLog {
    pub(crate) fn snapshot(&self) -> Vec<ParleyEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, predicate: impl Fn(&ParleyEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }
}

impl ParleyEventListener for EventLog {
    fn on_event(&self, event: ParleyEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Poll `check` until it holds, yielding to spawned event loops in between.
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}

/// Let queued transport events drain.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
