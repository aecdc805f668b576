use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("call error: {0}")]
    Call(String),
    #[error("media capture denied: {0}")]
    CaptureDenied(String),
    #[error("media capture failed: {0}")]
    Capture(String),
    #[error("a call with {0} is already in progress")]
    CallInProgress(String),
    #[error("invalid peer id: '{0}'")]
    InvalidPeerId(String),
    #[error("local id is already bound to '{0}'")]
    IdentityLocked(String),
    #[error("no local identity available")]
    NoIdentity,
}

/// Failure reported by a [`crate::media::MediaCapture`] implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    /// The user or platform refused access to the microphone/camera.
    #[error("permission denied: {0}")]
    Denied(String),
    #[error("device unavailable: {0}")]
    Unavailable(String),
}

impl From<CaptureError> for ParleyError {
    fn from(e: CaptureError) -> Self {
        match e {
            CaptureError::Denied(msg) => ParleyError::CaptureDenied(msg),
            CaptureError::Unavailable(msg) => ParleyError::Capture(msg),
        }
    }
}

/// Transport-level fault delivered asynchronously on the session event queue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("id '{0}' is already taken on the broker")]
    IdTaken(String),
    #[error("peer '{0}' is unavailable")]
    PeerUnavailable(String),
    #[error("lost connection to the signaling broker")]
    Network,
    #[error("signaling failure: {0}")]
    Signaling(String),
}
