use super::entry::{CardInfo, CardStateEntry, EntryId};
use super::registry::CardStateRegistry;
use super::Error;
use crate::definitions::{ByteHandle, ChannelHandle, ConnectionHandle};
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A server-independent authentication session.
///
/// At most one *floating* (not yet card-bound) session exists at a time;
/// creating a new floating session destroys the previous one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub context_handle: Option<ByteHandle>,
    /// Protocol URI selected by this session, once one is.
    pub protocol: Option<String>,
    /// The card entry this session is bound to, once a matching card appears.
    pub card: Option<EntryId>,
}

/// Tracks logical sessions and the cards adoptable by them, backed by the
/// shared [`CardStateRegistry`].
pub struct SessionManager {
    registry: Arc<CardStateRegistry>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    sessions: BTreeMap<String, Session>,
    floating: Option<String>,
}

impl SessionManager {
    pub fn new(registry: Arc<CardStateRegistry>) -> Self {
        SessionManager {
            registry,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn registry(&self) -> &Arc<CardStateRegistry> {
        &self.registry
    }

    /// Creates a session with a fresh, collision-checked random identifier.
    /// An existing floating session is destroyed first.
    pub fn create_session(&self) -> Session {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.floating.take() {
            debug!(session = %old, "replacing existing floating session");
            inner.sessions.remove(&old);
        }
        let id = loop {
            let candidate = random_session_id();
            if !inner.sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        let session = Session {
            session_id: id.clone(),
            context_handle: None,
            protocol: None,
            card: None,
        };
        inner.sessions.insert(id.clone(), session.clone());
        inner.floating = Some(id);
        session
    }

    /// Creates a session under a caller-chosen identifier.
    pub fn create_session_with_id(&self, id: impl Into<String>) -> Result<Session, Error> {
        let id = id.into();
        let mut inner = self.inner.lock();
        if inner.sessions.contains_key(&id) {
            return Err(Error::SessionAlreadyExists(id));
        }
        if let Some(old) = inner.floating.take() {
            debug!(session = %old, "replacing existing floating session");
            inner.sessions.remove(&old);
        }
        let session = Session {
            session_id: id.clone(),
            context_handle: None,
            protocol: None,
            card: None,
        };
        inner.sessions.insert(id.clone(), session.clone());
        inner.floating = Some(id);
        Ok(session)
    }

    pub fn get_session(&self, id: &str) -> Result<Session, Error> {
        self.inner
            .lock()
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NoSuchSession(id.to_string()))
    }

    /// Binds a session to an established card-reader-stack context. A
    /// context-bound session no longer counts as floating.
    pub fn set_context(&self, id: &str, ctx: ByteHandle) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| Error::NoSuchSession(id.to_string()))?;
        session.context_handle = Some(ctx);
        if inner.floating.as_deref() == Some(id) {
            inner.floating = None;
        }
        Ok(())
    }

    /// Records the card authentication protocol this session selected.
    pub fn select_protocol(&self, id: &str, protocol_uri: impl Into<String>) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| Error::NoSuchSession(id.to_string()))?;
        session.protocol = Some(protocol_uri.into());
        Ok(())
    }

    /// Inserts the card entry for a card-recognized event and attaches it to
    /// the session bound to (or floating and adoptable by) this context.
    pub fn add_card(
        &self,
        ctx: ByteHandle,
        ifd_name: impl Into<String>,
        slot_index: u64,
        card_info: CardInfo,
    ) -> Result<EntryId, Error> {
        let ifd_name = ifd_name.into();
        let mut inner = self.inner.lock();

        let lookup = ConnectionHandle {
            context_handle: Some(ctx.clone()),
            ifd_name: Some(ifd_name.clone()),
            slot_index: Some(slot_index),
            ..Default::default()
        };
        if !self.registry.matching_entries(&lookup, false).is_empty() {
            return Err(Error::DuplicateCardEntry);
        }

        // a session bound to this context adopts the card; otherwise the
        // floating session does, taking the context as its own
        let adopter = inner
            .sessions
            .values()
            .find(|s| s.context_handle.as_ref() == Some(&ctx))
            .map(|s| s.session_id.clone())
            .or_else(|| inner.floating.clone());

        let mut handle = lookup;
        if let Some(session_id) = &adopter {
            handle.channel_handle = Some(ChannelHandle {
                session_identifier: Some(session_id.clone()),
                protocol_termination_point: None,
            });
        }
        let id = self.registry.add_entry(CardStateEntry::new(handle, card_info));

        if let Some(session_id) = adopter {
            if let Some(session) = inner.sessions.get_mut(&session_id) {
                session.card = Some(id);
                session.context_handle.get_or_insert(ctx);
            }
            if inner.floating.as_deref() == Some(&session_id) {
                debug!(session = %session_id, "floating session adopted card");
                inner.floating = None;
            }
        }
        Ok(id)
    }

    /// Removes the card entries for a card-removed event. Returns whether
    /// anything was removed.
    pub fn remove_card(&self, ctx: &ByteHandle, ifd_name: &str, slot_index: u64) -> bool {
        let mut inner = self.inner.lock();
        let handle = ConnectionHandle {
            context_handle: Some(ctx.clone()),
            ifd_name: Some(ifd_name.to_string()),
            slot_index: Some(slot_index),
            ..Default::default()
        };
        let removed = self.registry.remove_entry(&handle);
        for session in inner.sessions.values_mut() {
            if session.context_handle.as_ref() == Some(ctx) {
                session.card = None;
            }
        }
        removed > 0
    }

    /// Destroys the session bound to `ctx`. When none is bound but a floating
    /// session exists, the floating one is destroyed instead, a best-effort
    /// fallback for contexts established before any card appeared.
    pub fn destroy_session_by_context(&self, ctx: &ByteHandle) -> bool {
        let mut inner = self.inner.lock();
        let bound = inner
            .sessions
            .iter()
            .find(|(_, s)| s.context_handle.as_ref() == Some(ctx))
            .map(|(id, _)| id.clone());
        match bound {
            Some(id) => {
                debug!(session = %id, "destroying session bound to context");
                inner.sessions.remove(&id);
                if inner.floating.as_deref() == Some(&id) {
                    inner.floating = None;
                }
                true
            }
            None => match inner.floating.take() {
                Some(id) => {
                    warn!(session = %id, "no session bound to context, destroying floating session");
                    inner.sessions.remove(&id);
                    true
                }
                None => false,
            },
        }
    }
}

fn random_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod test {
    use super::*;

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(CardStateRegistry::new()))
    }

    #[test]
    fn new_floating_session_replaces_old_one() {
        let mgr = manager();
        let first = mgr.create_session();
        let second = mgr.create_session();
        assert_ne!(first.session_id, second.session_id);
        assert!(mgr.get_session(&first.session_id).is_err());
        assert!(mgr.get_session(&second.session_id).is_ok());
    }

    #[test]
    fn create_session_with_existing_id_fails() {
        let mgr = manager();
        mgr.create_session_with_id("abc").unwrap();
        assert!(matches!(
            mgr.create_session_with_id("abc"),
            Err(Error::SessionAlreadyExists(_))
        ));
    }

    #[test]
    fn duplicate_card_entry_is_rejected() {
        let mgr = manager();
        let ctx = ByteHandle::from(vec![1]);
        mgr.add_card(ctx.clone(), "Reader", 0, CardInfo::default())
            .unwrap();
        assert!(matches!(
            mgr.add_card(ctx, "Reader", 0, CardInfo::default()),
            Err(Error::DuplicateCardEntry)
        ));
    }

    #[test]
    fn floating_session_adopts_card_and_context() {
        let mgr = manager();
        let session = mgr.create_session();
        let ctx = ByteHandle::from(vec![7]);
        let id = mgr
            .add_card(ctx.clone(), "Reader", 0, CardInfo::default())
            .unwrap();

        let session = mgr.get_session(&session.session_id).unwrap();
        assert_eq!(session.card, Some(id));
        assert_eq!(session.context_handle, Some(ctx));

        // once adopted the session is no longer floating, so a new session
        // does not destroy it
        let other = mgr.create_session();
        assert!(mgr.get_session(&session.session_id).is_ok());
        assert!(mgr.get_session(&other.session_id).is_ok());
    }

    #[test]
    fn card_entry_lands_in_session_index_after_adoption() {
        let mgr = manager();
        let session = mgr.create_session();
        mgr.add_card(ByteHandle::from(vec![7]), "Reader", 0, CardInfo::default())
            .unwrap();

        let q = ConnectionHandle {
            channel_handle: Some(ChannelHandle {
                session_identifier: Some(session.session_id),
                protocol_termination_point: None,
            }),
            ..Default::default()
        };
        assert_eq!(mgr.registry().matching_entries(&q, true).len(), 1);
    }

    #[test]
    fn remove_card_clears_session_reference() {
        let mgr = manager();
        let session = mgr.create_session();
        let ctx = ByteHandle::from(vec![7]);
        mgr.add_card(ctx.clone(), "Reader", 0, CardInfo::default())
            .unwrap();
        assert!(mgr.remove_card(&ctx, "Reader", 0));
        assert!(!mgr.remove_card(&ctx, "Reader", 0));
        let session = mgr.get_session(&session.session_id).unwrap();
        assert_eq!(session.card, None);
    }

    #[test]
    fn destroy_session_by_context_falls_back_to_floating() {
        let mgr = manager();
        let floating = mgr.create_session();
        let ctx = ByteHandle::from(vec![9]);
        // nothing bound to ctx, so the floating session goes
        assert!(mgr.destroy_session_by_context(&ctx));
        assert!(mgr.get_session(&floating.session_id).is_err());
        assert!(!mgr.destroy_session_by_context(&ctx));
    }

    #[test]
    fn destroy_session_by_context_prefers_bound_session() {
        let mgr = manager();
        let bound = mgr.create_session();
        let ctx = ByteHandle::from(vec![3]);
        mgr.set_context(&bound.session_id, ctx.clone()).unwrap();
        let floating = mgr.create_session();

        assert!(mgr.destroy_session_by_context(&ctx));
        assert!(mgr.get_session(&bound.session_id).is_err());
        assert!(mgr.get_session(&floating.session_id).is_ok());
    }
}
