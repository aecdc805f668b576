use std::sync::{Arc, RwLock};

use crate::call::CallState;
use crate::chat::ChatMessage;
use crate::recovery::DisconnectReason;

/// Events emitted by the core to native UI listeners.
#[derive(Debug, Clone)]
pub enum ParleyEvent {
    SessionStateChanged(SessionState),
    MessageRecorded(ChatMessage),
    IncognitoChanged(bool),
    CallStateChanged(CallState),
    MediaFlagsChanged { audio_enabled: bool, video_enabled: bool },
    /// Dismissible notice for the user (transport faults, broker loss).
    Notice(String),
    Disconnected(DisconnectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Inactive,
    Active,
}

/// Trait for receiving events from the core.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait ParleyEventListener: Send + Sync {
    fn on_event(&self, event: ParleyEvent);
}

/// Internal event emitter that dispatches to registered listeners.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<RwLock<Vec<Arc<dyn ParleyEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn ParleyEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    pub fn emit(&self, event: ParleyEvent) {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}
