//! Single teardown path for every fatal session condition.

use std::sync::Arc;

use tokio::sync::watch;

use crate::call::CallSession;
use crate::errors::TransportError;
use crate::transport::{DataConnection, TransportSession};

/// Why a session was torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Explicit user disconnect.
    User,
    /// Empty message sent while a session was live.
    Hangup,
    ConnectionClosed,
    ConnectionError(String),
    CallClosed,
    CallError(String),
    Transport(TransportError),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => f.write_str("disconnected by user"),
            Self::Hangup => f.write_str("hung up"),
            Self::ConnectionClosed => f.write_str("peer closed the connection"),
            Self::ConnectionError(msg) => write!(f, "connection error: {msg}"),
            Self::CallClosed => f.write_str("call ended"),
            Self::CallError(msg) => write!(f, "call error: {msg}"),
            Self::Transport(e) => write!(f, "{e}"),
        }
    }
}

/// Everything a live session owns, detached from the session manager.
///
/// Steps run in a fixed order: stop the event loop, close data links, end
/// the call (which also stops local media and clears both previews), and
/// finally destroy the broker registration.
#[derive(Default)]
pub(crate) struct Teardown {
    pub(crate) cancel_loop: Option<watch::Sender<bool>>,
    pub(crate) outbound: Option<Arc<dyn DataConnection>>,
    pub(crate) inbound: Vec<Arc<dyn DataConnection>>,
    pub(crate) session: Option<Arc<dyn TransportSession>>,
}

impl Teardown {
    pub(crate) fn run(self, call: &CallSession, reason: &DisconnectReason) {
        tracing::info!("tearing down session: {reason}");

        if let Some(cancel) = self.cancel_loop {
            let _ = cancel.send(true);
        }
        if let Some(conn) = self.outbound {
            tracing::debug!("closing outbound connection {}", conn.connection_id());
            conn.close();
        }
        for conn in self.inbound {
            tracing::debug!("closing inbound connection {}", conn.connection_id());
            conn.close();
        }

        call.tear_down();

        if let Some(session) = self.session {
            tracing::debug!("destroying transport session {}", session.local_id());
            session.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallState;
    use crate::events::EventEmitter;
    use crate::media::VideoSinks;
    use crate::test_support::{FakeCapture, Loopback, RecordingSink};
    use crate::transport::PeerTransport;

    fn call_session(capture: Arc<FakeCapture>, sink: Arc<RecordingSink>) -> CallSession {
        CallSession::new(
            capture,
            VideoSinks::new(sink.clone(), sink),
            EventEmitter::new(),
            true,
            true,
        )
    }

    #[test]
    fn reasons_render_for_notices() {
        assert_eq!(DisconnectReason::Hangup.to_string(), "hung up");
        assert_eq!(
            DisconnectReason::Transport(TransportError::IdTaken("alice".into())).to_string(),
            "id 'alice' is already taken on the broker"
        );
        assert_eq!(
            DisconnectReason::CallError("ice failed".into()).to_string(),
            "call error: ice failed"
        );
    }

    #[tokio::test]
    async fn teardown_releases_everything() {
        let loopback = Loopback::new();
        let transport = loopback.transport();
        let (_bob, _bob_events) = transport.create("bob");
        let (alice, _alice_events) = transport.create("alice");
        let capture = Arc::new(FakeCapture::new());
        let sink = Arc::new(RecordingSink::default());
        let call = call_session(capture.clone(), sink.clone());

        call.call(&*alice, "bob").await.unwrap();
        let outbound = alice.connect_data("bob");
        let (cancel_tx, cancel_rx) = watch::channel(false);

        Teardown {
            cancel_loop: Some(cancel_tx),
            outbound: Some(outbound.clone()),
            inbound: Vec::new(),
            session: Some(alice.clone()),
        }
        .run(&call, &DisconnectReason::User);

        assert!(*cancel_rx.borrow());
        assert!(loopback.is_closed(outbound.connection_id()));
        assert_eq!(call.state(), CallState::Closed);
        assert!(capture.all_stopped());
        assert_eq!(sink.current(), None);
        assert!(!loopback.is_registered("alice"));
        assert!(loopback.is_registered("bob"));
    }

    #[test]
    fn empty_teardown_is_harmless() {
        let capture = Arc::new(FakeCapture::new());
        let sink = Arc::new(RecordingSink::default());
        let call = call_session(capture, sink.clone());
        Teardown::default().run(&call, &DisconnectReason::User);
        Teardown::default().run(&call, &DisconnectReason::User);
        assert_eq!(call.state(), CallState::Idle);
        assert_eq!(sink.current(), None);
    }
}
