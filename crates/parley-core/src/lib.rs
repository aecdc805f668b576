//! Parley core: peer-to-peer chat and call session logic.
//!
//! Pure Rust crate with no platform dependencies. The broker transport,
//! media capture, video previews and key-value storage are ports
//! implemented by the native shell. Consumed via UniFFI bindings.

pub mod call;
pub mod chat;
pub mod directive;
pub mod errors;
pub mod events;
pub mod identity;
pub mod media;
pub mod recovery;
pub mod session;
pub mod settings;
pub mod storage;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use call::{CallState, Capability};
pub use chat::{ChatMessage, Sender};
pub use errors::{CaptureError, ParleyError, TransportError};
pub use events::{ParleyEvent, ParleyEventListener, SessionState};
pub use recovery::DisconnectReason;
pub use session::{Collaborators, SessionManager};
pub use settings::{Settings, SettingsStore};
