//! Persistence contexts: in-memory staging areas confined to one queue.
//!
//! # Responsibility
//! - Record inserts/updates/deletes against a layered view of the store.
//! - Save changes one level up: child into parent staging, writer into the
//!   coordinator, background into its own overlay plus a notification.
//! - Merge change notifications from other contexts.
//!
//! # Invariants
//! - Every public operation runs on the context's own executor; anything
//!   else is a fatal confinement violation.
//! - A context lock is never held across hooks, parent calls or store I/O.
//! - Fetches snapshot the overlays before reading the layer below, so a
//!   concurrent writer commit can only produce duplicates, never gaps.
//! - A background save stays in the saved overlay only until its ticket is
//!   settled; after that the layer below is authoritative.

use crate::executor::Executor;
use crate::fatal::fatal;
use crate::model::changes::{
    ChangeNotification, ChangeSet, ContextOrigin, MergePolicy, SaveTicket,
};
use crate::model::object::{Attributes, ManagedObject, ObjectId};
use crate::model::schema::{EntityDescription, Model};
use crate::repo::object_repo::FetchRequest;
use crate::store::{StoreCoordinator, StoreError};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

pub type ContextResult<T> = Result<T, ContextError>;

/// Error for context operations and persist completions.
#[derive(Debug)]
pub enum ContextError {
    UnknownEntity(String),
    UnknownAttribute { entity: String, attribute: String },
    NotFound(ObjectId),
    Store(StoreError),
}

impl Display for ContextError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownEntity(entity) => write!(f, "unknown entity `{entity}`"),
            Self::UnknownAttribute { entity, attribute } => {
                write!(f, "entity `{entity}` has no attribute `{attribute}`")
            }
            Self::NotFound(id) => write!(f, "object not found: {id}"),
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ContextError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for ContextError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

/// Role of a context inside a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    Writer,
    Main,
    Background,
    Disposable,
}

impl Display for ContextKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Writer => "writer",
            Self::Main => "main",
            Self::Background => "background",
            Self::Disposable => "disposable",
        };
        f.write_str(label)
    }
}

/// Execution domain a context is confined to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confinement {
    UiThread,
    PrivateQueue,
}

/// What a context saves into and reads through.
#[derive(Clone)]
pub enum ContextParent {
    Coordinator(Arc<StoreCoordinator>),
    Context(Context),
}

pub(crate) type WillSaveHook = Box<dyn Fn(&Context) + Send + Sync>;
pub(crate) type DidSaveHook = Box<dyn Fn(ChangeNotification) + Send + Sync>;

pub(crate) struct ContextOptions {
    pub name: Option<String>,
    pub kind: ContextKind,
    pub confinement: Confinement,
    pub executor: Arc<dyn Executor>,
    pub parent: ContextParent,
    pub model: Arc<Model>,
    pub merge_policy: MergePolicy,
    pub will_save: Option<WillSaveHook>,
    pub did_save: Option<DidSaveHook>,
}

#[derive(Default)]
struct ContextState {
    /// Unsaved changes.
    pending: ChangeSet,
    /// Batches pushed by child saves, oldest first.
    staged: VecDeque<ChangeSet>,
    /// Background saves whose tickets are not settled yet, oldest first.
    saved: VecDeque<SavedBatch>,
}

impl ContextState {
    fn prune_settled(&mut self) {
        self.saved.retain(|batch| !batch.ticket.is_settled());
    }
}

struct SavedBatch {
    ticket: SaveTicket,
    changes: ChangeSet,
}

struct ContextInner {
    id: u64,
    name: Option<String>,
    kind: ContextKind,
    confinement: Confinement,
    executor: Arc<dyn Executor>,
    parent: ContextParent,
    model: Arc<Model>,
    merge_policy: MergePolicy,
    state: Mutex<ContextState>,
    will_save: Option<WillSaveHook>,
    did_save: Option<DidSaveHook>,
}

/// Handle to one persistence context. Clones share the same context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub(crate) fn new(options: ContextOptions) -> Self {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            "event=context_create module=context status=ok context_id={} kind={} queue={}",
            id,
            options.kind,
            options.executor.label()
        );
        Self {
            inner: Arc::new(ContextInner {
                id,
                name: options.name,
                kind: options.kind,
                confinement: options.confinement,
                executor: options.executor,
                parent: options.parent,
                model: options.model,
                merge_policy: options.merge_policy,
                state: Mutex::new(ContextState::default()),
                will_save: options.will_save,
                did_save: options.did_save,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn kind(&self) -> ContextKind {
        self.inner.kind
    }

    pub fn confinement(&self) -> Confinement {
        self.inner.confinement
    }

    pub fn merge_policy(&self) -> MergePolicy {
        self.inner.merge_policy
    }

    pub fn model(&self) -> &Model {
        &self.inner.model
    }

    pub fn origin(&self) -> ContextOrigin {
        ContextOrigin {
            id: self.inner.id,
            name: self.inner.name.clone(),
        }
    }

    /// Returns whether both handles refer to the same context.
    pub fn same_context(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Schedules `operation` on this context's queue without waiting.
    pub fn perform<F>(&self, operation: F)
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        let context = self.clone();
        self.inner
            .executor
            .execute(Box::new(move || operation(&context)));
    }

    /// Runs `operation` on this context's queue and returns its result.
    ///
    /// Runs inline when called from the context's own queue.
    pub fn perform_and_wait<R, F>(&self, operation: F) -> R
    where
        F: FnOnce(&Context) -> R + Send + 'static,
        R: Send + 'static,
    {
        let context = self.clone();
        let slot = Arc::new(Mutex::new(None));
        let result = Arc::clone(&slot);
        self.inner.executor.execute_and_wait(Box::new(move || {
            *result.lock() = Some(operation(&context));
        }));

        let outcome = slot.lock().take();
        match outcome {
            Some(value) => value,
            None => fatal(
                "perform_and_wait",
                format!(
                    "queue `{}` finished without producing a result",
                    self.inner.executor.label()
                ),
            ),
        }
    }

    /// Inserts a new object of `entity` and returns its identity.
    pub fn insert(&self, entity: &str, attributes: Attributes) -> ContextResult<ObjectId> {
        self.assert_confined("insert");
        let description = self.entity_description(entity)?;
        validate_attributes(description, &attributes)?;

        let object = ManagedObject::new(entity, attributes);
        let id = object.id;
        self.inner.state.lock().pending.record_insert(object);
        Ok(id)
    }

    /// Overwrites the given attributes of an existing object.
    pub fn update(&self, id: ObjectId, attributes: Attributes) -> ContextResult<()> {
        self.assert_confined("update");
        let mut object = self.resolve(id)?.ok_or(ContextError::NotFound(id))?;
        let description = self.entity_description(&object.entity)?;
        validate_attributes(description, &attributes)?;

        let changed: Vec<String> = attributes.keys().cloned().collect();
        object.attributes.extend(attributes);
        self.inner
            .state
            .lock()
            .pending
            .record_update(object, changed);
        Ok(())
    }

    pub fn delete(&self, id: ObjectId) -> ContextResult<()> {
        self.assert_confined("delete");
        let object = self.resolve(id)?.ok_or(ContextError::NotFound(id))?;
        self.inner
            .state
            .lock()
            .pending
            .record_delete(id, object.entity);
        Ok(())
    }

    /// Returns the object as currently seen by this context.
    pub fn object(&self, id: ObjectId) -> ContextResult<Option<ManagedObject>> {
        self.assert_confined("object");
        self.resolve(id)
    }

    /// Returns objects of the requested entity ordered by identity.
    pub fn fetch(&self, request: &FetchRequest) -> ContextResult<Vec<ManagedObject>> {
        self.assert_confined("fetch");
        self.entity_description(&request.entity)?;

        let view = self.view_of(&request.entity)?;
        let limit = request.limit.map_or(usize::MAX, |limit| limit as usize);
        Ok(view.into_values().take(limit).collect())
    }

    pub fn count(&self, request: &FetchRequest) -> ContextResult<usize> {
        Ok(self.fetch(request)?.len())
    }

    /// Returns whether this context has unsaved changes.
    pub fn has_changes(&self) -> bool {
        self.assert_confined("has_changes");
        !self.inner.state.lock().pending.is_empty()
    }

    /// Saves pending changes one level up.
    ///
    /// - Child contexts push them into the parent's staging queue.
    /// - Background contexts keep them as a local overlay and emit a change
    ///   notification; nothing reaches the store.
    /// - Other coordinator-attached contexts commit staged and pending
    ///   changes in one transaction.
    ///
    /// # Errors
    /// - Returns `ContextError::Store` when the commit fails. Committed
    ///   batches are only drained on success, so a later save retries them.
    pub fn save(&self) -> ContextResult<()> {
        self.assert_confined("save");
        if let Some(will_save) = &self.inner.will_save {
            will_save(self);
        }

        match (&self.inner.parent, self.inner.kind) {
            (ContextParent::Context(parent), _) => {
                let changes = self.take_pending();
                if changes.is_empty() && !changes.has_tickets() {
                    return Ok(());
                }
                let count = changes.len();
                parent.stage(changes);
                debug!(
                    "event=context_save module=context status=ok context_id={} kind={} target=parent objects={}",
                    self.inner.id, self.inner.kind, count
                );
                Ok(())
            }
            (ContextParent::Coordinator(_), ContextKind::Background) => {
                self.save_to_overlay();
                Ok(())
            }
            (ContextParent::Coordinator(coordinator), _) => self.commit_staged(coordinator),
        }
    }

    /// Discards unsaved changes and the uncommitted saved overlay.
    ///
    /// Tickets of discarded merged changes are settled, so the background
    /// contexts that produced them fall back to the store.
    pub fn reset(&self) {
        self.assert_confined("reset");
        let mut state = self.inner.state.lock();
        state.pending.settle_tickets();
        state.pending.clear();
        state.saved.clear();
    }

    /// Merges changes saved by another context into this context's pending
    /// changes, resolving conflicts with the merge policy.
    ///
    /// Incoming updates are applied key by key onto this context's current
    /// view of each object; updates of objects it no longer sees are dropped.
    pub fn merge_changes(&self, notification: &ChangeNotification) -> ContextResult<()> {
        self.assert_confined("merge_changes");
        let mut current = BTreeMap::new();
        for id in notification.changes.updated_ids() {
            if let Some(object) = self.resolve(id)? {
                current.insert(id, object);
            }
        }

        self.inner.state.lock().pending.merge_incoming(
            &notification.changes,
            self.inner.merge_policy,
            &current,
        );
        debug!(
            "event=context_merge module=context status=ok context_id={} origin_id={} objects={}",
            self.inner.id,
            notification.origin.id,
            notification.changes.len()
        );
        Ok(())
    }

    /// Deletes every stored object of `entity` straight in the store.
    pub(crate) fn delete_stored_entity(&self, entity: &str) -> ContextResult<usize> {
        self.assert_confined("delete_stored_entity");
        self.entity_description(entity)?;
        match &self.inner.parent {
            ContextParent::Coordinator(coordinator) => Ok(coordinator.delete_entity(entity)?),
            ContextParent::Context(parent) => parent.perform_and_wait({
                let entity = entity.to_string();
                move |parent| parent.delete_stored_entity(&entity)
            }),
        }
    }

    fn stage(&self, changes: ChangeSet) {
        self.inner.state.lock().staged.push_back(changes);
    }

    fn take_pending(&self) -> ChangeSet {
        std::mem::take(&mut self.inner.state.lock().pending)
    }

    fn save_to_overlay(&self) {
        let changes = {
            let mut state = self.inner.state.lock();
            state.prune_settled();
            let mut changes = std::mem::take(&mut state.pending);
            if changes.is_empty() {
                return;
            }
            let ticket = SaveTicket::new();
            state.saved.push_back(SavedBatch {
                ticket: ticket.clone(),
                changes: changes.clone(),
            });
            changes.attach_ticket(ticket);
            changes
        };

        info!(
            "event=context_save module=context status=ok context_id={} kind={} target=overlay objects={}",
            self.inner.id,
            self.inner.kind,
            changes.len()
        );
        if let Some(did_save) = &self.inner.did_save {
            did_save(ChangeNotification {
                origin: self.origin(),
                changes,
            });
        }
    }

    fn commit_staged(&self, coordinator: &StoreCoordinator) -> ContextResult<()> {
        let (batches, flattened) = {
            let mut state = self.inner.state.lock();
            let pending = std::mem::take(&mut state.pending);
            if !pending.is_empty() || pending.has_tickets() {
                state.staged.push_back(pending);
            }
            if state.staged.is_empty() {
                return Ok(());
            }

            let mut flattened = ChangeSet::new();
            for batch in &state.staged {
                flattened.absorb(batch.clone());
            }
            (state.staged.len(), flattened)
        };

        if !flattened.is_empty() {
            if let Err(err) = coordinator.commit(&flattened) {
                warn!(
                    "event=context_save module=context status=error context_id={} kind={} batches={} error={}",
                    self.inner.id, self.inner.kind, batches, err
                );
                return Err(err.into());
            }
        }

        flattened.settle_tickets();
        self.inner.state.lock().staged.drain(..batches);
        info!(
            "event=context_save module=context status=ok context_id={} kind={} target=store batches={} objects={}",
            self.inner.id,
            self.inner.kind,
            batches,
            flattened.len()
        );
        Ok(())
    }

    /// Overlays from oldest to newest: staged batches, saved, pending.
    fn snapshot_overlays(&self) -> Vec<ChangeSet> {
        let mut state = self.inner.state.lock();
        state.prune_settled();
        let mut overlays = Vec::with_capacity(state.staged.len() + state.saved.len() + 1);
        overlays.extend(state.staged.iter().cloned());
        overlays.extend(state.saved.iter().map(|batch| batch.changes.clone()));
        overlays.push(state.pending.clone());
        overlays
    }

    fn view_of(&self, entity: &str) -> ContextResult<BTreeMap<ObjectId, ManagedObject>> {
        let overlays = self.snapshot_overlays();
        let mut view = match &self.inner.parent {
            ContextParent::Coordinator(coordinator) => coordinator
                .fetch(entity)?
                .into_iter()
                .map(|object| (object.id, object))
                .collect(),
            ContextParent::Context(parent) => parent.view_of(entity)?,
        };

        for overlay in &overlays {
            overlay.apply_to(&mut view, |object| object.entity == entity);
        }
        Ok(view)
    }

    fn resolve(&self, id: ObjectId) -> ContextResult<Option<ManagedObject>> {
        let overlays = self.snapshot_overlays();
        let base = match &self.inner.parent {
            ContextParent::Coordinator(coordinator) => coordinator.fetch_object(id)?,
            ContextParent::Context(parent) => parent.resolve(id)?,
        };

        Ok(overlays
            .iter()
            .fold(base, |current, overlay| match overlay.lookup(id) {
                Some(found) => found.cloned(),
                None => current,
            }))
    }

    fn entity_description(&self, entity: &str) -> ContextResult<&EntityDescription> {
        self.inner
            .model
            .entity(entity)
            .ok_or_else(|| ContextError::UnknownEntity(entity.to_string()))
    }

    fn assert_confined(&self, operation: &str) {
        if !self.inner.executor.is_current() {
            fatal(
                "confinement_violation",
                format!(
                    "{} context {} used off queue `{}` by `{operation}`",
                    self.inner.kind,
                    self.inner.id,
                    self.inner.executor.label()
                ),
            );
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("confinement", &self.inner.confinement)
            .field("queue", &self.inner.executor.label())
            .finish()
    }
}

fn validate_attributes(
    description: &EntityDescription,
    attributes: &Attributes,
) -> ContextResult<()> {
    match attributes
        .keys()
        .find(|attribute| !description.has_attribute(attribute))
    {
        Some(attribute) => Err(ContextError::UnknownAttribute {
            entity: description.name.clone(),
            attribute: attribute.clone(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Confinement, Context, ContextError, ContextKind, ContextOptions, ContextParent,
    };
    use crate::executor::SynchronousExecutor;
    use crate::model::changes::MergePolicy;
    use crate::model::object::attributes;
    use crate::model::schema::{EntityDescription, Model};
    use crate::repo::object_repo::FetchRequest;
    use crate::store::StoreCoordinator;
    use serde_json::json;
    use std::sync::Arc;

    fn model() -> Arc<Model> {
        let user = EntityDescription::new("User", ["remoteID", "name"]);
        Arc::new(Model::new("Model", [user]).unwrap())
    }

    fn context(kind: ContextKind, parent: ContextParent) -> Context {
        Context::new(ContextOptions {
            name: None,
            kind,
            confinement: Confinement::PrivateQueue,
            executor: Arc::new(SynchronousExecutor::new("datastack.test")),
            parent,
            model: model(),
            merge_policy: MergePolicy::default(),
            will_save: None,
            did_save: None,
        })
    }

    fn writer_and_child() -> (Arc<StoreCoordinator>, Context, Context) {
        let coordinator = Arc::new(StoreCoordinator::in_memory());
        let writer = context(
            ContextKind::Writer,
            ContextParent::Coordinator(Arc::clone(&coordinator)),
        );
        let child = context(ContextKind::Main, ContextParent::Context(writer.clone()));
        (coordinator, writer, child)
    }

    #[test]
    fn insert_rejects_unknown_entity_and_attribute() {
        let (_, _, child) = writer_and_child();

        let err = child.insert("Task", attributes([("title", json!("t"))])).unwrap_err();
        assert!(matches!(err, ContextError::UnknownEntity(_)));

        let err = child.insert("User", attributes([("email", json!("x"))])).unwrap_err();
        assert!(matches!(err, ContextError::UnknownAttribute { .. }));
    }

    #[test]
    fn child_save_stages_in_parent_without_touching_store() {
        let (coordinator, writer, child) = writer_and_child();
        child
            .insert("User", attributes([("name", json!("Joshua Ivanof"))]))
            .unwrap();
        child.save().unwrap();

        assert!(!child.has_changes());
        assert_eq!(coordinator.count_objects().unwrap(), 0);
        assert_eq!(writer.count(&FetchRequest::new("User")).unwrap(), 1);
        assert_eq!(child.count(&FetchRequest::new("User")).unwrap(), 1);

        writer.save().unwrap();
        assert_eq!(coordinator.count_objects().unwrap(), 1);
    }

    #[test]
    fn update_and_delete_resolve_through_parent_layers() {
        let (_, writer, child) = writer_and_child();
        let id = child
            .insert("User", attributes([("name", json!("a")), ("remoteID", json!(1))]))
            .unwrap();
        child.save().unwrap();
        writer.save().unwrap();

        child.update(id, attributes([("name", json!("b"))])).unwrap();
        let object = child.object(id).unwrap().unwrap();
        assert_eq!(object.get_str("name"), Some("b"));
        assert_eq!(object.get_i64("remoteID"), Some(1));

        child.delete(id).unwrap();
        assert!(child.object(id).unwrap().is_none());
        assert!(writer.object(id).unwrap().is_some());
        assert!(matches!(child.delete(id), Err(ContextError::NotFound(_))));
    }

    #[test]
    fn fetch_orders_by_identity_and_applies_limit() {
        let (_, _, child) = writer_and_child();
        let mut ids: Vec<_> = (0..5)
            .map(|index| {
                child
                    .insert("User", attributes([("remoteID", json!(index))]))
                    .unwrap()
            })
            .collect();
        ids.sort();

        let fetched = child.fetch(&FetchRequest::new("User").with_limit(3)).unwrap();
        let fetched_ids: Vec<_> = fetched.iter().map(|object| object.id).collect();
        assert_eq!(fetched_ids, ids[..3].to_vec());
    }

    #[test]
    fn reset_discards_pending_changes() {
        let (_, _, child) = writer_and_child();
        child
            .insert("User", attributes([("name", json!("draft"))]))
            .unwrap();
        child.reset();

        assert!(!child.has_changes());
        assert_eq!(child.count(&FetchRequest::new("User")).unwrap(), 0);
    }
}
