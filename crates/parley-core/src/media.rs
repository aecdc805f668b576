use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::CaptureError;

/// Which local devices a capture request should open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A single capture track owned by the platform.
pub trait MediaTrack: Send + Sync {
    fn kind(&self) -> TrackKind;

    /// Stop the track and release the underlying device.
    fn stop(&self);

    fn is_live(&self) -> bool;
}

/// A bundle of tracks, either captured locally or received from the peer.
#[derive(Clone)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<Arc<dyn MediaTrack>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn has_audio(&self) -> bool {
        self.tracks.iter().any(|t| t.kind() == TrackKind::Audio)
    }

    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind() == TrackKind::Video)
    }

    /// Stop every track in the stream.
    pub fn stop_all(&self) {
        for track in &self.tracks {
            if track.is_live() {
                track.stop();
            }
        }
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

/// Platform camera/microphone access.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Acquire a fresh local stream. May suspend on a permission prompt.
    async fn get_local_stream(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, CaptureError>;
}

/// A preview surface the UI shell renders a stream into.
pub trait VideoSink: Send + Sync {
    /// Attach `stream`, or detach whatever is shown when `None`.
    fn attach(&self, stream: Option<&MediaStream>);
}

/// The local self-view and the remote peer's view.
#[derive(Clone)]
pub struct VideoSinks {
    pub local: Arc<dyn VideoSink>,
    pub remote: Arc<dyn VideoSink>,
}

impl VideoSinks {
    pub fn new(local: Arc<dyn VideoSink>, remote: Arc<dyn VideoSink>) -> Self {
        Self { local, remote }
    }

    pub fn detach_all(&self) {
        self.local.attach(None);
        self.remote.attach(None);
    }
}
