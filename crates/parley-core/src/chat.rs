use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::directive::Directive;
use crate::identity::ConversationKey;
use crate::storage::{KEY_MESSAGES, KeyValueStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    Local,
    Remote,
}

/// One chat entry. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: Sender,
    pub conversation_key: ConversationKey,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

impl ChatMessage {
    pub fn new(sender: Sender, conversation_key: ConversationKey, text: impl Into<String>) -> Self {
        Self {
            sender,
            conversation_key,
            timestamp: Utc::now(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Default)]
struct Incognito {
    active: bool,
    /// Lives for the process only; never written to the durable store.
    messages: Vec<ChatMessage>,
}

/// Durable per-device chat log plus the volatile incognito overlay.
///
/// The durable log is one flat sequence shared by every conversation pair;
/// reads filter by conversation key, writes never do.
pub struct MessageStore {
    store: Arc<dyn KeyValueStore>,
    incognito: Mutex<Incognito>,
}

impl MessageStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            incognito: Mutex::new(Incognito::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Incognito> {
        self.incognito.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_incognito(&self) -> bool {
        self.lock().active
    }

    /// Switch incognito mode. Returns `true` if the flag changed.
    pub fn set_incognito(&self, active: bool) -> bool {
        let mut incognito = self.lock();
        let changed = incognito.active != active;
        incognito.active = active;
        changed
    }

    /// Append a chat message to the overlay or to the durable log.
    ///
    /// Returns `false` when the body is a reserved token and was dropped.
    pub fn record(&self, message: ChatMessage) -> bool {
        if !Directive::parse(&message.text).is_chat() {
            tracing::warn!("refusing to record reserved token as chat");
            return false;
        }

        // Held through the durable read-modify-write as well.
        let mut incognito = self.lock();
        if incognito.active {
            incognito.messages.push(message);
            return true;
        }

        let mut log = self.durable_log();
        log.push(message);
        match serde_json::to_string(&log) {
            Ok(json) => self.store.set(KEY_MESSAGES, &json),
            Err(e) => tracing::warn!("failed to serialize message log: {e}"),
        }
        drop(incognito);
        true
    }

    /// Messages of the conversation `key`, in record order.
    pub fn list(&self, key: &ConversationKey) -> Vec<ChatMessage> {
        {
            let incognito = self.lock();
            if incognito.active {
                return incognito
                    .messages
                    .iter()
                    .filter(|m| &m.conversation_key == key)
                    .cloned()
                    .collect();
            }
        }

        self.durable_log()
            .into_iter()
            .filter(|m| &m.conversation_key == key)
            .collect()
    }

    /// The full durable log across all pairs. Unparsable content reads as empty.
    pub fn durable_log(&self) -> Vec<ChatMessage> {
        let Some(raw) = self.store.get(KEY_MESSAGES) else {
            return Vec::new();
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!("message log is unreadable, treating as empty: {e}");
            Vec::new()
        })
    }
}
