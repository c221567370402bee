use super::entry::{CardStateEntry, EntryId};
use crate::definitions::{ByteHandle, ConnectionHandle};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Concurrent, multiply-indexed store of card state entries.
///
/// Entries live in an arena addressed by [`EntryId`]; the per-key indices
/// (session identifier, context handle, slot handle) hold id sets. All
/// mutating and compound-read operations run under one registry-wide critical
/// section; this is not a hot path.
#[derive(Default)]
pub struct CardStateRegistry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    entries: BTreeMap<EntryId, CardStateEntry>,
    session_index: BTreeMap<String, BTreeSet<EntryId>>,
    context_index: BTreeMap<ByteHandle, BTreeSet<EntryId>>,
    slot_index: BTreeMap<ByteHandle, BTreeSet<EntryId>>,
}

impl CardStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry into every applicable index and the full set.
    ///
    /// Duplicate insertion is a caller error and is not deduplicated.
    pub fn add_entry(&self, entry: CardStateEntry) -> EntryId {
        let mut inner = self.inner.lock();
        let id = EntryId(inner.next_id);
        inner.next_id += 1;
        debug!(?id, entry = ?entry, "adding entry to card states");

        let handle = entry.handle_copy();
        if let Some(session) = handle.session_identifier() {
            inner
                .session_index
                .entry(session.to_string())
                .or_default()
                .insert(id);
        }
        if let Some(ctx) = handle.context_handle {
            inner.context_index.entry(ctx).or_default().insert(id);
        }
        if let Some(slot) = handle.slot_handle {
            inner.slot_index.entry(slot).or_default().insert(id);
        }
        inner.entries.insert(id, entry);
        id
    }

    /// Resolves exactly one entry. Zero matches and ambiguous matches are
    /// both logged and reported as not-found; an ambiguous match is never
    /// silently resolved.
    pub fn get_entry(
        &self,
        handle: &ConnectionHandle,
        filter_by_application: bool,
    ) -> Option<EntryId> {
        let inner = self.inner.lock();
        let matches = inner.matching_entries(handle, filter_by_application);
        match matches.len() {
            1 => matches.first().copied(),
            0 => {
                warn!("no state entry found for the given connection handle");
                None
            }
            n => {
                warn!(matches = n, "more than one state entry found for the given connection handle");
                None
            }
        }
    }

    /// All entries matching the partial handle, in entry order.
    pub fn matching_entries(
        &self,
        handle: &ConnectionHandle,
        filter_by_application: bool,
    ) -> Vec<EntryId> {
        self.inner.lock().matching_entries(handle, filter_by_application)
    }

    /// Removes every entry matching the handle from all indices and the full
    /// set, destroying any protocol instances bound to them.
    ///
    /// When the query carries no slot handle, each removed entry is purged
    /// from every slot-handle bucket it is registered under; slot handles may
    /// have been reassigned by a disconnect/reconnect cycle in between.
    pub fn remove_entry(&self, handle: &ConnectionHandle) -> usize {
        let mut inner = self.inner.lock();
        let matches = inner.matching_entries(handle, true);
        debug!(count = matches.len(), "removing card state entries for handle");
        let purge_all_slot_handles = handle.slot_handle.is_none();
        for id in &matches {
            inner.remove_one(*id, purge_all_slot_handles, handle.slot_handle.as_ref());
        }
        matches.len()
    }

    /// Convenience wrapper removing the entry bound to one card connection.
    pub fn remove_slot_handle_entry(&self, ctx: &ByteHandle, slot_handle: &ByteHandle) -> usize {
        debug!(slot = %slot_handle, "removing card state entries for slot");
        let handle = ConnectionHandle {
            context_handle: Some(ctx.clone()),
            slot_handle: Some(slot_handle.clone()),
            ..Default::default()
        };
        self.remove_entry(&handle)
    }

    /// Records the slot handle assigned when the card connection is opened
    /// and indexes the entry under it.
    pub fn set_slot_handle(&self, id: EntryId, slot_handle: ByteHandle) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&id) {
            Some(entry) => entry.set_slot_handle(slot_handle.clone()),
            None => return false,
        }
        inner.slot_index.entry(slot_handle).or_default().insert(id);
        true
    }

    /// Borrows the entry for the duration of one closure invocation, under
    /// the registry lock.
    pub fn with_entry_mut<R>(
        &self,
        id: EntryId,
        f: impl FnOnce(&mut CardStateEntry) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.lock();
        inner.entries.get_mut(&id).map(f)
    }

    pub fn entry_handle(&self, id: EntryId) -> Option<ConnectionHandle> {
        self.inner.lock().entries.get(&id).map(|e| e.handle_copy())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    /// The core matching algorithm: intersect the per-key index lookups for
    /// exactly the keys that were supplied, then shrink the set with the
    /// remaining filters. Filter order does not affect the result.
    fn matching_entries(
        &self,
        handle: &ConnectionHandle,
        filter_by_application: bool,
    ) -> Vec<EntryId> {
        let session = handle.session_identifier();
        let ctx = handle.context_handle.as_ref();
        let slot_handle = handle.slot_handle.as_ref();

        // when no indexed key is given, start from all entries
        let mut merged: BTreeSet<EntryId> = if session.is_none() && ctx.is_none() && slot_handle.is_none() {
            self.entries.keys().copied().collect()
        } else {
            let mut sets: Vec<&BTreeSet<EntryId>> = Vec::with_capacity(3);
            static EMPTY: BTreeSet<EntryId> = BTreeSet::new();
            if let Some(session) = session {
                sets.push(self.session_index.get(session).unwrap_or(&EMPTY));
            }
            if let Some(ctx) = ctx {
                sets.push(self.context_index.get(ctx).unwrap_or(&EMPTY));
            }
            if let Some(slot) = slot_handle {
                sets.push(self.slot_index.get(slot).unwrap_or(&EMPTY));
            }
            let mut merged: BTreeSet<EntryId> = sets[0].clone();
            for set in &sets[1..] {
                merged.retain(|id| set.contains(id));
            }
            merged
        };

        if let Some(idx) = handle.slot_index {
            merged.retain(|id| self.entry_matches(id, |e| e.handle().slot_index != Some(idx)));
        }
        if let Some(ifd_name) = handle.ifd_name.as_deref() {
            merged.retain(|id| {
                self.entry_matches(id, |e| {
                    matches!(e.handle().ifd_name.as_deref(), Some(other) if other != ifd_name)
                })
            });
        }
        if filter_by_application {
            if let Some(app) = handle.card_application.as_ref() {
                merged.retain(|id| {
                    self.entry_matches(id, |e| e.handle().card_application.as_ref() != Some(app))
                });
            }
        } else {
            // [TR-03112-4] if no card application is specified, paths to all
            // available card applications and unused slots are returned
        }
        if let Some(card_type) = handle.card_type() {
            merged.retain(|id| {
                self.entry_matches(id, |e| {
                    matches!(e.handle().card_type(), Some(other) if other != card_type)
                })
            });
        }

        merged.into_iter().collect()
    }

    /// Keeps `id` unless `mismatch` holds for its entry.
    fn entry_matches(&self, id: &EntryId, mismatch: impl Fn(&CardStateEntry) -> bool) -> bool {
        match self.entries.get(id) {
            Some(entry) => !mismatch(entry),
            None => false,
        }
    }

    fn remove_one(
        &mut self,
        id: EntryId,
        purge_all_slot_handles: bool,
        slot_handle: Option<&ByteHandle>,
    ) {
        let Some(mut entry) = self.entries.remove(&id) else {
            return;
        };
        let handle = entry.handle_copy();

        if let Some(session) = handle.session_identifier() {
            debug!(session, "removing entry from session index");
            remove_index_entry(&mut self.session_index, &session.to_string(), id);
        }
        if let Some(ctx) = handle.context_handle.as_ref() {
            debug!(ctx = %ctx, "removing entry from context index");
            remove_index_entry(&mut self.context_index, ctx, id);
        }
        if purge_all_slot_handles {
            debug!("purging entry from all slot handle buckets");
            let keys: Vec<ByteHandle> = self.slot_index.keys().cloned().collect();
            for key in keys {
                remove_index_entry(&mut self.slot_index, &key, id);
            }
        } else if let Some(slot) = slot_handle {
            debug!(slot = %slot, "removing entry from slot handle index");
            remove_index_entry(&mut self.slot_index, slot, id);
        }

        let dropped = entry.remove_all_protocols();
        if dropped > 0 {
            debug!(count = dropped, "destroyed protocol instances of removed entry");
        }
    }
}

fn remove_index_entry<K: Ord + Clone>(
    index: &mut BTreeMap<K, BTreeSet<EntryId>>,
    key: &K,
    id: EntryId,
) {
    if let Some(bucket) = index.get_mut(key) {
        bucket.remove(&id);
        if bucket.is_empty() {
            index.remove(key);
        }
    }
}
