//! Peer transport port.
//!
//! The transport (an id-based signaling broker plus direct peer links) is an
//! external collaborator. Implementations never report faults synchronously:
//! every open, close, stream and error notification is pushed onto the
//! per-session event queue returned by [`PeerTransport::create`], which the
//! [`crate::session::SessionManager`] drains from a single task.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::errors::TransportError;
use crate::media::MediaStream;

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Factory for transport sessions bound to a local peer id.
pub trait PeerTransport: Send + Sync {
    /// Register `local_id` with the broker.
    ///
    /// Returns immediately; id collisions and broker failures arrive later as
    /// [`TransportEvent::Error`].
    fn create(&self, local_id: &str) -> (Arc<dyn TransportSession>, TransportEvents);
}

/// A live registration with the broker.
pub trait TransportSession: Send + Sync {
    fn local_id(&self) -> &str;

    /// Open a data connection. The handle is usable once
    /// [`TransportEvent::DataOpen`] fires for its connection id.
    fn connect_data(&self, remote_id: &str) -> Arc<dyn DataConnection>;

    /// Start an outbound media call carrying `stream`.
    fn call(&self, remote_id: &str, stream: &MediaStream) -> Arc<dyn MediaConnection>;

    /// Unregister from the broker and drop every link.
    fn destroy(&self);
}

pub trait DataConnection: Send + Sync {
    fn connection_id(&self) -> &str;
    fn remote_id(&self) -> &str;
    fn send(&self, text: &str);
    fn close(&self);
}

pub trait MediaConnection: Send + Sync {
    fn connection_id(&self) -> &str;
    fn remote_id(&self) -> &str;

    /// Accept an inbound call, replying with the local stream.
    fn answer(&self, stream: &MediaStream);
    fn close(&self);
}

/// Everything a transport session can report.
pub enum TransportEvent {
    IncomingConnection(Arc<dyn DataConnection>),
    IncomingCall(Arc<dyn MediaConnection>),
    DataOpen {
        connection_id: String,
    },
    DataReceived {
        connection_id: String,
        remote_id: String,
        text: String,
    },
    DataClosed {
        connection_id: String,
    },
    DataError {
        connection_id: String,
        message: String,
    },
    RemoteStream {
        connection_id: String,
        stream: MediaStream,
    },
    CallClosed {
        connection_id: String,
    },
    CallError {
        connection_id: String,
        message: String,
    },
    /// Lost the broker link; established peer links may still be alive.
    Disconnected,
    Error(TransportError),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IncomingConnection(conn) => f
                .debug_tuple("IncomingConnection")
                .field(&conn.connection_id())
                .finish(),
            Self::IncomingCall(call) => f
                .debug_tuple("IncomingCall")
                .field(&call.connection_id())
                .finish(),
            Self::DataOpen { connection_id } => {
                f.debug_struct("DataOpen").field("connection_id", connection_id).finish()
            }
            Self::DataReceived {
                connection_id,
                remote_id,
                text,
            } => f
                .debug_struct("DataReceived")
                .field("connection_id", connection_id)
                .field("remote_id", remote_id)
                .field("len", &text.len())
                .finish(),
            Self::DataClosed { connection_id } => {
                f.debug_struct("DataClosed").field("connection_id", connection_id).finish()
            }
            Self::DataError {
                connection_id,
                message,
            } => f
                .debug_struct("DataError")
                .field("connection_id", connection_id)
                .field("message", message)
                .finish(),
            Self::RemoteStream {
                connection_id,
                stream,
            } => f
                .debug_struct("RemoteStream")
                .field("connection_id", connection_id)
                .field("stream", stream)
                .finish(),
            Self::CallClosed { connection_id } => {
                f.debug_struct("CallClosed").field("connection_id", connection_id).finish()
            }
            Self::CallError {
                connection_id,
                message,
            } => f
                .debug_struct("CallError")
                .field("connection_id", connection_id)
                .field("message", message)
                .finish(),
            Self::Disconnected => f.write_str("Disconnected"),
            Self::Error(e) => f.debug_tuple("Error").field(e).finish(),
        }
    }
}
