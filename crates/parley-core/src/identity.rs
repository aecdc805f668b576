use std::sync::{Arc, Mutex, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::ParleyError;
use crate::storage::{KEY_LOCAL_ID, KEY_REMOTE_ID, KeyValueStore};

/// Groups messages by the ordered (local id, remote id) pair.
///
/// Peer ids never contain `:`, so the joined form is unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationKey(String);

impl ConversationKey {
    pub fn new(local_id: &str, remote_id: &str) -> Self {
        Self(format!("{local_id}:{remote_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn peer_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9]+(?:[ _-][A-Za-z0-9]+)*$").expect("static peer id pattern")
    })
}

/// Validate a peer id against the broker's id grammar.
///
/// Surrounding whitespace is ignored; the trimmed id is returned.
pub fn validate_peer_id(input: &str) -> Result<String, ParleyError> {
    let candidate = input.trim();
    if peer_id_regex().is_match(candidate) {
        Ok(candidate.to_string())
    } else {
        Err(ParleyError::InvalidPeerId(candidate.to_string()))
    }
}

fn generate_peer_id() -> String {
    format!("parley-{}", uuid::Uuid::new_v4().simple())
}

#[derive(Debug, Default)]
struct IdentityState {
    local_id: Option<String>,
    remote_id: Option<String>,
    /// Set once a transport session has been bound to `local_id`.
    bound: bool,
}

/// Owns the durable local id and the current counterpart id.
pub struct IdentityStore {
    store: Arc<dyn KeyValueStore>,
    state: Mutex<IdentityState>,
    remember_counterpart: bool,
}

impl IdentityStore {
    pub fn load(store: Arc<dyn KeyValueStore>, remember_counterpart: bool) -> Self {
        let local_id = store
            .get(KEY_LOCAL_ID)
            .and_then(|id| validate_peer_id(&id).ok());
        let remote_id = if remember_counterpart {
            store
                .get(KEY_REMOTE_ID)
                .and_then(|id| validate_peer_id(&id).ok())
        } else {
            None
        };
        tracing::debug!("identity loaded: local={local_id:?} remote={remote_id:?}");
        Self {
            store,
            state: Mutex::new(IdentityState {
                local_id,
                remote_id,
                bound: false,
            }),
            remember_counterpart,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IdentityState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn local_id(&self) -> Option<String> {
        self.lock().local_id.clone()
    }

    pub fn remote_id(&self) -> Option<String> {
        self.lock().remote_id.clone()
    }

    /// Resolve the id a transport session is created with.
    ///
    /// The first bind accepts an explicit id, falls back to the durable one,
    /// and generates a fresh id when neither exists. The result is persisted
    /// and immutable for the rest of the process.
    pub fn bind_local_id(&self, requested: Option<&str>) -> Result<String, ParleyError> {
        let requested = requested.map(validate_peer_id).transpose()?;
        let mut state = self.lock();

        if state.bound {
            let current = state.local_id.clone().ok_or(ParleyError::NoIdentity)?;
            return match requested {
                Some(id) if id != current => Err(ParleyError::IdentityLocked(current)),
                _ => Ok(current),
            };
        }

        let id = match requested.or_else(|| state.local_id.clone()) {
            Some(id) => id,
            None => {
                let id = generate_peer_id();
                tracing::info!("generated local peer id {id}");
                id
            }
        };
        self.store.set(KEY_LOCAL_ID, &id);
        state.local_id = Some(id.clone());
        state.bound = true;
        Ok(id)
    }

    /// Switch the active conversation to `remote_id`.
    pub fn set_remote_id(&self, remote_id: &str) -> Result<String, ParleyError> {
        let id = validate_peer_id(remote_id)?;
        self.lock().remote_id = Some(id.clone());
        if self.remember_counterpart {
            self.store.set(KEY_REMOTE_ID, &id);
        }
        Ok(id)
    }

    /// Key of the active pair, once both ids are known.
    pub fn conversation_key(&self) -> Option<ConversationKey> {
        let state = self.lock();
        match (&state.local_id, &state.remote_id) {
            (Some(local), Some(remote)) => Some(ConversationKey::new(local, remote)),
            _ => None,
        }
    }

    /// Key for a conversation between the local id and `remote_id`.
    pub fn key_for(&self, remote_id: &str) -> Option<ConversationKey> {
        self.lock()
            .local_id
            .as_deref()
            .map(|local| ConversationKey::new(local, remote_id))
    }
}
