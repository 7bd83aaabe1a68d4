//! Change sets and change notifications.
//!
//! # Responsibility
//! - Record inserts/updates/deletes made in one context.
//! - Fold change sets into each other when a child saves into its parent.
//! - Merge a notification's change set into a context under a merge policy.
//! - Overlay recorded changes on top of a base view for fetches.
//!
//! # Invariants
//! - An identity is in at most one of `inserted`, `updated`, `deleted`.
//! - Deleting an object inserted in the same change set erases it entirely;
//!   the parent never learns about it.
//! - Updated entries remember which attribute keys were changed locally, so
//!   merges can resolve conflicts per property. Entries created by a merge
//!   start with no locally changed keys.
//! - Save tickets travel with the changes they describe and are settled once
//!   those changes were committed or discarded below the context.

use crate::model::object::{ManagedObject, ObjectId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How a context resolves an incoming change against its own pending change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergePolicy {
    /// Locally changed attribute values win over incoming values for the same
    /// attribute; every other incoming attribute is taken.
    #[default]
    LocalWinsOnPropertyConflict,
}

#[derive(Debug, Clone, PartialEq)]
struct UpdatedObject {
    object: ManagedObject,
    changed: BTreeSet<String>,
}

/// Tracks one background save on its way to the store.
///
/// Clones share state. The ticket is settled when the writer commits the
/// changes it travelled with, or when a context discards them.
#[derive(Debug, Clone, Default)]
pub struct SaveTicket {
    settled: Arc<AtomicBool>,
}

impl SaveTicket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    pub(crate) fn settle(&self) {
        self.settled.store(true, Ordering::Release);
    }
}

impl PartialEq for SaveTicket {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.settled, &other.settled)
    }
}

/// Pending or saved changes of one context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    inserted: BTreeMap<ObjectId, ManagedObject>,
    updated: BTreeMap<ObjectId, UpdatedObject>,
    deleted: BTreeMap<ObjectId, String>,
    tickets: Vec<SaveTicket>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether no object changes are recorded. Tickets do not count.
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Number of object identities touched by this change set.
    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }

    pub fn inserted(&self) -> impl Iterator<Item = &ManagedObject> {
        self.inserted.values()
    }

    pub fn updated(&self) -> impl Iterator<Item = &ManagedObject> {
        self.updated.values().map(|entry| &entry.object)
    }

    /// Deleted identities with the entity each object belonged to.
    pub fn deleted(&self) -> impl Iterator<Item = (ObjectId, &str)> {
        self.deleted
            .iter()
            .map(|(id, entity)| (*id, entity.as_str()))
    }

    pub fn inserted_ids(&self) -> BTreeSet<ObjectId> {
        self.inserted.keys().copied().collect()
    }

    pub fn updated_ids(&self) -> BTreeSet<ObjectId> {
        self.updated.keys().copied().collect()
    }

    pub fn deleted_ids(&self) -> BTreeSet<ObjectId> {
        self.deleted.keys().copied().collect()
    }

    /// Objects that must exist after this change set is applied.
    pub fn upserts(&self) -> impl Iterator<Item = &ManagedObject> {
        self.inserted().chain(self.updated())
    }

    /// What this change set says about `id`.
    ///
    /// `None` when `id` is untouched, `Some(None)` when it was deleted and
    /// `Some(Some(object))` when it was inserted or updated.
    pub fn lookup(&self, id: ObjectId) -> Option<Option<&ManagedObject>> {
        if self.deleted.contains_key(&id) {
            return Some(None);
        }
        self.inserted
            .get(&id)
            .or_else(|| self.updated.get(&id).map(|entry| &entry.object))
            .map(Some)
    }

    pub fn has_tickets(&self) -> bool {
        !self.tickets.is_empty()
    }

    pub(crate) fn attach_ticket(&mut self, ticket: SaveTicket) {
        self.tickets.push(ticket);
    }

    /// Settles every ticket carried by this change set.
    pub(crate) fn settle_tickets(&self) {
        for ticket in &self.tickets {
            ticket.settle();
        }
    }

    /// Records a newly inserted object.
    pub fn record_insert(&mut self, object: ManagedObject) {
        if self.deleted.remove(&object.id).is_some() {
            // Re-inserting a deleted identity overwrites the stored row.
            let changed = object.attributes.keys().cloned().collect();
            self.updated
                .insert(object.id, UpdatedObject { object, changed });
            return;
        }
        self.inserted.insert(object.id, object);
    }

    /// Records a new full value for an object and which keys changed.
    pub fn record_update<I>(&mut self, object: ManagedObject, changed_keys: I)
    where
        I: IntoIterator<Item = String>,
    {
        if let Some(inserted) = self.inserted.get_mut(&object.id) {
            *inserted = object;
            return;
        }
        self.deleted.remove(&object.id);
        match self.updated.get_mut(&object.id) {
            Some(entry) => {
                entry.object = object;
                entry.changed.extend(changed_keys);
            }
            None => {
                self.updated.insert(
                    object.id,
                    UpdatedObject {
                        object,
                        changed: changed_keys.into_iter().collect(),
                    },
                );
            }
        }
    }

    /// Records a deletion of `id`, which belonged to `entity`.
    pub fn record_delete(&mut self, id: ObjectId, entity: impl Into<String>) {
        if self.inserted.remove(&id).is_some() {
            return;
        }
        self.updated.remove(&id);
        self.deleted.insert(id, entity.into());
    }

    /// Folds a later change set on top of this one.
    ///
    /// Used when a child context saves into its parent and when the writer
    /// flattens its staged batches into one commit.
    pub fn absorb(&mut self, later: ChangeSet) {
        for (id, entity) in later.deleted {
            self.record_delete(id, entity);
        }
        for object in later.inserted.into_values() {
            self.record_insert(object);
        }
        for entry in later.updated.into_values() {
            self.record_update(entry.object, entry.changed);
        }
        self.tickets.extend(later.tickets);
    }

    /// Merges changes saved by another context into this pending set.
    ///
    /// `current` holds this context's view of the objects the incoming set
    /// updates; objects missing from it are treated as deleted.
    ///
    /// - An incoming delete removes the object, discarding local edits.
    /// - A local delete wins over an incoming insert/update.
    /// - An incoming update only carries its changed keys, applied onto the
    ///   local object minus attributes changed locally.
    /// - An incoming insert colliding with a local entry keeps local values.
    pub fn merge_incoming(
        &mut self,
        incoming: &ChangeSet,
        policy: MergePolicy,
        current: &BTreeMap<ObjectId, ManagedObject>,
    ) {
        self.tickets.extend(incoming.tickets.iter().cloned());

        for (id, entity) in &incoming.deleted {
            self.inserted.remove(id);
            self.updated.remove(id);
            self.deleted.insert(*id, entity.clone());
        }

        for object in incoming.inserted.values() {
            if self.deleted.contains_key(&object.id) {
                continue;
            }
            if let Some(local) = self.inserted.get_mut(&object.id) {
                *local = resolve_conflict(object, local, None, policy);
            } else if let Some(local) = self.updated.get_mut(&object.id) {
                local.object = resolve_conflict(object, &local.object, Some(&local.changed), policy);
            } else {
                self.inserted.insert(object.id, object.clone());
            }
        }

        for entry in incoming.updated.values() {
            let id = entry.object.id;
            if self.deleted.contains_key(&id) {
                continue;
            }
            if let Some(local) = self.inserted.get_mut(&id) {
                apply_changed_keys(local, &entry.object, &entry.changed, None);
            } else if let Some(local) = self.updated.get_mut(&id) {
                apply_changed_keys(
                    &mut local.object,
                    &entry.object,
                    &entry.changed,
                    Some(&local.changed),
                );
            } else if let Some(base) = current.get(&id) {
                let mut object = base.clone();
                apply_changed_keys(&mut object, &entry.object, &entry.changed, None);
                self.updated.insert(
                    id,
                    UpdatedObject {
                        object,
                        changed: BTreeSet::new(),
                    },
                );
            }
        }
    }

    /// Applies this change set onto a view keyed by identity.
    ///
    /// `keep` filters which upserted objects belong in the view (for example
    /// objects of one entity); deletions always apply.
    pub fn apply_to<F>(&self, view: &mut BTreeMap<ObjectId, ManagedObject>, keep: F)
    where
        F: Fn(&ManagedObject) -> bool,
    {
        for id in self.deleted.keys() {
            view.remove(id);
        }
        for object in self.upserts() {
            if keep(object) {
                view.insert(object.id, object.clone());
            } else {
                view.remove(&object.id);
            }
        }
    }

    /// Removes every recorded change and ticket.
    pub fn clear(&mut self) {
        self.inserted.clear();
        self.updated.clear();
        self.deleted.clear();
        self.tickets.clear();
    }
}

/// Copies `keys` from `source` into `target`, skipping keys in `keep`.
/// A key absent from `source` is removed from `target`.
fn apply_changed_keys(
    target: &mut ManagedObject,
    source: &ManagedObject,
    keys: &BTreeSet<String>,
    keep: Option<&BTreeSet<String>>,
) {
    for key in keys {
        if keep.is_some_and(|keep| keep.contains(key)) {
            continue;
        }
        match source.attributes.get(key) {
            Some(value) => {
                target.attributes.insert(key.clone(), value.clone());
            }
            None => {
                target.attributes.remove(key);
            }
        }
    }
}

fn resolve_conflict(
    incoming: &ManagedObject,
    local: &ManagedObject,
    local_changed: Option<&BTreeSet<String>>,
    policy: MergePolicy,
) -> ManagedObject {
    match policy {
        MergePolicy::LocalWinsOnPropertyConflict => {
            let mut merged = incoming.clone();
            for (key, value) in &local.attributes {
                let changed_locally = local_changed.map_or(true, |keys| keys.contains(key));
                if changed_locally {
                    merged.attributes.insert(key.clone(), value.clone());
                }
            }
            merged
        }
    }
}

/// Identity of the context that produced a change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextOrigin {
    pub id: u64,
    pub name: Option<String>,
}

/// Emitted when a coordinator-attached context saves.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotification {
    pub origin: ContextOrigin,
    pub changes: ChangeSet,
}
