pub mod entry;
pub mod registry;
pub mod session;

pub use entry::{CardInfo, CardStateEntry, EntryId};
pub use registry::CardStateRegistry;
pub use session::{Session, SessionManager};

/// Registry/session-manager precondition violations, surfaced synchronously
/// to the caller of the offending operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("a card entry for this (context, ifd, slot index) already exists")]
    DuplicateCardEntry,
    #[error("a session with identifier '{0}' already exists")]
    SessionAlreadyExists(String),
    #[error("no session with identifier '{0}'")]
    NoSuchSession(String),
}
