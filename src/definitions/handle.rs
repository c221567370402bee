use super::helpers::ByteHandle;
use serde::{Deserialize, Serialize};

/// Composite identifier correlating a network session, a card-reader-stack
/// context, a slot and a recognized card application (ISO 24727
/// `ConnectionHandleType`).
///
/// Every field is optional; a partially filled handle acts as a query against
/// the card state registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionHandle {
    pub channel_handle: Option<ChannelHandle>,
    pub context_handle: Option<ByteHandle>,
    pub ifd_name: Option<String>,
    pub slot_index: Option<u64>,
    /// Identifies one active card connection. Unique while the card stays
    /// connected; may be reassigned after a disconnect/reconnect cycle.
    pub slot_handle: Option<ByteHandle>,
    pub card_application: Option<ByteHandle>,
    pub recognition_info: Option<RecognitionInfo>,
}

/// Channel sub-structure of a connection handle, carrying the logical session
/// binding towards the local stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelHandle {
    pub session_identifier: Option<String>,
    pub protocol_termination_point: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognitionInfo {
    pub card_type: Option<String>,
}

impl ConnectionHandle {
    /// The session identifier embedded in the channel sub-structure, if any.
    pub fn session_identifier(&self) -> Option<&str> {
        self.channel_handle
            .as_ref()
            .and_then(|c| c.session_identifier.as_deref())
    }

    pub fn card_type(&self) -> Option<&str> {
        self.recognition_info
            .as_ref()
            .and_then(|r| r.card_type.as_deref())
    }

    /// Sets the session identifier, creating the channel sub-structure when
    /// absent.
    pub fn set_session_identifier(&mut self, session: Option<String>) {
        match (&mut self.channel_handle, session) {
            (Some(channel), session) => channel.session_identifier = session,
            (slot @ None, Some(session)) => {
                *slot = Some(ChannelHandle {
                    session_identifier: Some(session),
                    protocol_termination_point: None,
                });
            }
            (None, None) => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn session_identifier_injection() {
        let mut handle = ConnectionHandle::default();
        assert_eq!(handle.session_identifier(), None);

        handle.set_session_identifier(Some("abc".into()));
        assert_eq!(handle.session_identifier(), Some("abc"));

        handle.set_session_identifier(None);
        assert_eq!(handle.session_identifier(), None);
        // channel sub-structure stays in place once created
        assert!(handle.channel_handle.is_some());
    }
}
