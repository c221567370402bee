use crate::definitions::{ByteHandle, ConnectionHandle};
use crate::protocol::SalProtocol;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Stable identifier of a card state entry inside the registry arena.
///
/// Indices hold ids, never entry references, so removing an entry can never
/// leave a dangling back-pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(pub(crate) u64);

// Number authority so each entry gets a distinct serial for total ordering.
static NEXT_SERIAL: AtomicU64 = AtomicU64::new(0);

/// Metadata of a recognized card, as delivered by the recognition event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardInfo {
    pub card_type: String,
    /// Application selected implicitly when the card connects.
    pub implicit_application: Option<ByteHandle>,
}

/// One recognized card application bound to a connection-handle subset.
///
/// Owned exclusively by [`CardStateRegistry`](super::CardStateRegistry); the
/// step dispatcher only borrows an entry for the duration of one step
/// invocation.
pub struct CardStateEntry {
    serial: u64,
    handle: ConnectionHandle,
    card_info: CardInfo,
    authenticated_dids: BTreeSet<String>,
    protocols: BTreeMap<String, SalProtocol>,
    active_protocol: Option<String>,
}

impl CardStateEntry {
    pub fn new(mut handle: ConnectionHandle, card_info: CardInfo) -> Self {
        if handle.card_application.is_none() {
            handle.card_application = card_info.implicit_application.clone();
        }
        if handle.recognition_info.is_none() {
            handle.recognition_info = Some(crate::definitions::RecognitionInfo {
                card_type: Some(card_info.card_type.clone()),
            });
        }
        CardStateEntry {
            serial: NEXT_SERIAL.fetch_add(1, AtomicOrdering::Relaxed),
            handle,
            card_info,
            authenticated_dids: BTreeSet::new(),
            protocols: BTreeMap::new(),
            active_protocol: None,
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn handle_copy(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub fn card_type(&self) -> &str {
        &self.card_info.card_type
    }

    pub fn card_info(&self) -> &CardInfo {
        &self.card_info
    }

    pub fn set_card_application(&mut self, application: ByteHandle) {
        self.handle.card_application = Some(application);
    }

    pub fn set_slot_handle(&mut self, slot_handle: ByteHandle) {
        self.handle.slot_handle = Some(slot_handle);
    }

    pub fn add_authenticated_did(&mut self, did_name: impl Into<String>) {
        self.authenticated_dids.insert(did_name.into());
    }

    pub fn remove_authenticated_did(&mut self, did_name: &str) {
        self.authenticated_dids.remove(did_name);
    }

    pub fn is_authenticated(&self, did_name: &str) -> bool {
        self.authenticated_dids.contains(did_name)
    }

    pub fn protocol(&self, uri: &str) -> Option<&SalProtocol> {
        self.protocols.get(uri)
    }

    pub fn protocol_mut(&mut self, uri: &str) -> Option<&mut SalProtocol> {
        self.protocols.get_mut(uri)
    }

    /// Installs a protocol instance and marks it active for operations that
    /// do not name a protocol themselves (Sign, Hash, Transmit).
    pub fn insert_protocol(&mut self, uri: impl Into<String>, instance: SalProtocol) {
        let uri = uri.into();
        self.active_protocol = Some(uri.clone());
        self.protocols.insert(uri, instance);
    }

    pub fn active_protocol(&self) -> Option<&SalProtocol> {
        self.protocols.get(self.active_protocol.as_deref()?)
    }

    pub fn active_protocol_mut(&mut self) -> Option<&mut SalProtocol> {
        let uri = self.active_protocol.clone()?;
        self.protocols.get_mut(&uri)
    }

    /// Drops all protocol instances. Called when the entry is removed from
    /// the registry.
    pub fn remove_all_protocols(&mut self) -> usize {
        self.active_protocol = None;
        let n = self.protocols.len();
        self.protocols.clear();
        n
    }

    fn sort_key(&self) -> (Option<&ByteHandle>, Option<&str>, Option<u64>, u64) {
        (
            self.handle.context_handle.as_ref(),
            self.handle.ifd_name.as_deref(),
            self.handle.slot_index,
            self.serial,
        )
    }
}

impl std::fmt::Debug for CardStateEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardStateEntry")
            .field("serial", &self.serial)
            .field("handle", &self.handle)
            .field("card_type", &self.card_info.card_type)
            .field("protocols", &self.protocols.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PartialEq for CardStateEntry {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for CardStateEntry {}

impl PartialOrd for CardStateEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CardStateEntry {
    /// Deterministic set membership by `(context, ifd name, slot index)`,
    /// with the serial as tie breaker.
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}
