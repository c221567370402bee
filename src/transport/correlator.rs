//! WS-Addressing message id bookkeeping for one PAOS exchange.

use tracing::warn;
use uuid::Uuid;

/// Tracks the id pair of the message exchange: the remote id to relate the
/// next outbound message to, and the local id that message carries.
#[derive(Debug, Default)]
pub struct MessageIdGenerator {
    remote_id: Option<String>,
    local_id: Option<String>,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The id of the last inbound message, to go into `RelatesTo`.
    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    /// Records the id of an inbound message. Fails when the peer reflected
    /// our own id back instead of minting its own.
    pub fn set_remote_id(&mut self, id: String) -> Result<(), ReflectedMessageId> {
        if self.local_id.as_deref() == Some(id.as_str()) {
            warn!(id = %id, "peer reflected our message id");
            return Err(ReflectedMessageId { id });
        }
        self.remote_id = Some(id);
        Ok(())
    }

    /// Mints the id for the next outbound message.
    pub fn new_local_id(&mut self) -> String {
        let id = format!("urn:uuid:{}", Uuid::new_v4());
        self.local_id = Some(id.clone());
        id
    }
}

/// The peer answered with our own message id as its `MessageID`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("remote message id '{id}' is our own last message id")]
pub struct ReflectedMessageId {
    pub id: String,
}
