//! Data stack facade: store coordinator plus the context hierarchy.
//!
//! # Responsibility
//! - Lazily build the coordinator, the writer context and the main context.
//! - Create background and disposable contexts.
//! - Run the two-stage persist pipeline and publish its outcome.
//! - Drop the backing store and return to the uninitialized state.
//!
//! # Invariants
//! - Main and disposable contexts are confined to the UI executor.
//! - Persist stage two runs on the single writer queue, so disk commits of
//!   different persist calls are totally ordered.
//! - Every persist call publishes one notification, then calls its
//!   completion once on the UI executor.
//! - Background merges produced before a drop never reach the rebuilt main
//!   context.

use crate::config::{StackConfig, StoreType};
use crate::context::{
    Confinement, Context, ContextError, ContextKind, ContextOptions, ContextParent, ContextResult,
    DidSaveHook,
};
use crate::executor::{Executor, QueuedExecutor, SynchronousExecutor};
use crate::fatal::fatal;
use crate::model::changes::{ChangeNotification, MergePolicy};
use crate::model::schema::Model;
use crate::store::{
    BackupExclusion, CoordinatorOptions, PlatformBackupExclusion, StoreCoordinator, StoreLocation,
    StoreResult,
};
use directories::BaseDirs;
use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Weak};

mod events;

pub use events::PersistNotification;
use events::PersistBus;

const UI_QUEUE_LABEL: &str = "datastack.ui";
const WRITER_QUEUE_LABEL: &str = "datastack.writer";
const SEED_FILE_EXTENSION: &str = "sqlite";

/// Replaceable collaborators of a stack.
#[derive(Clone)]
pub struct StackComponents {
    /// Queue the main and disposable contexts are confined to. Defaults to a
    /// dedicated serial queue, or an inline executor in test mode.
    pub ui_executor: Option<Arc<dyn Executor>>,
    pub backup_exclusion: Arc<dyn BackupExclusion>,
}

impl Default for StackComponents {
    fn default() -> Self {
        Self {
            ui_executor: None,
            backup_exclusion: Arc::new(PlatformBackupExclusion),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackStatus {
    Uninitialized,
    Open,
}

#[derive(Clone)]
struct OpenStack {
    coordinator: Arc<StoreCoordinator>,
    writer: Context,
    main: Context,
    generation: u64,
}

enum StackState {
    Uninitialized,
    Open(OpenStack),
}

struct StackInner {
    config: StackConfig,
    model: Arc<Model>,
    location: StoreLocation,
    ui_executor: Arc<dyn Executor>,
    writer_executor: Arc<dyn Executor>,
    backup_exclusion: Arc<dyn BackupExclusion>,
    state: Mutex<StackState>,
    generation: AtomicU64,
    disposable_coordinator: OnceCell<Arc<StoreCoordinator>>,
    persist_bus: PersistBus,
}

/// Entry point of the library. Clones share the same stack.
#[derive(Clone)]
pub struct DataStack {
    inner: Arc<StackInner>,
}

impl DataStack {
    /// Builds a stack whose model is loaded from the configured bundle.
    ///
    /// # Panics
    /// - The model resource is missing or invalid (fatal).
    /// - See [`DataStack::with_components`].
    pub fn new(config: StackConfig) -> Self {
        let Some(bundle) = bundle_location(&config) else {
            fatal("model_load", "bundle location could not be resolved");
        };
        let model = match Model::load(&bundle, &config.model_name) {
            Ok(model) => model,
            Err(err) => fatal("model_load", err),
        };
        Self::with_model(config, model)
    }

    /// Builds a stack around an already constructed model.
    pub fn with_model(config: StackConfig, model: Model) -> Self {
        Self::with_components(config, model, StackComponents::default())
    }

    /// Builds a stack with explicit collaborators.
    ///
    /// # Panics
    /// - The config is invalid or the per-user data directory cannot be
    ///   resolved for an on-disk store (fatal).
    pub fn with_components(config: StackConfig, model: Model, components: StackComponents) -> Self {
        if let Err(err) = config.validate() {
            fatal("stack_config", err);
        }

        let location = store_location(&config);
        let test_mode = config.test_mode;
        let ui_executor = components
            .ui_executor
            .unwrap_or_else(|| serial_executor(UI_QUEUE_LABEL, test_mode));
        let writer_executor = serial_executor(WRITER_QUEUE_LABEL, test_mode);

        info!(
            "event=stack_create module=stack status=ok model={} store_type={:?} test_mode={} path={}",
            config.model_name,
            config.store_type,
            test_mode,
            location
                .path()
                .map_or_else(|| "memory".to_string(), |path| path.display().to_string())
        );

        Self {
            inner: Arc::new(StackInner {
                config,
                model: Arc::new(model),
                location,
                ui_executor,
                writer_executor,
                backup_exclusion: components.backup_exclusion,
                state: Mutex::new(StackState::Uninitialized),
                generation: AtomicU64::new(0),
                disposable_coordinator: OnceCell::new(),
                persist_bus: PersistBus::default(),
            }),
        }
    }

    pub fn config(&self) -> &StackConfig {
        &self.inner.config
    }

    pub fn model(&self) -> &Model {
        &self.inner.model
    }

    pub fn is_test_mode(&self) -> bool {
        self.inner.config.test_mode
    }

    pub fn status(&self) -> StackStatus {
        match *self.inner.state.lock() {
            StackState::Uninitialized => StackStatus::Uninitialized,
            StackState::Open(_) => StackStatus::Open,
        }
    }

    /// Path of the primary store file, `None` for in-memory stores.
    pub fn store_path(&self) -> Option<PathBuf> {
        self.inner.location.path().map(Path::to_path_buf)
    }

    /// UI-confined context that reads and edits the object graph.
    pub fn main_context(&self) -> Context {
        self.open_stack().main
    }

    /// Creates a context on its own private queue whose saves are merged
    /// into the main context.
    pub fn new_background_context(&self, name: Option<&str>) -> Context {
        let open = self.open_stack();
        let label = format!("datastack.background.{}", name.unwrap_or("anonymous"));
        let weak = Arc::downgrade(&self.inner);
        let generation = open.generation;
        let did_save: DidSaveHook = Box::new(move |notification| {
            merge_into_main(&weak, generation, notification);
        });

        Context::new(ContextOptions {
            name: name.map(str::to_string),
            kind: ContextKind::Background,
            confinement: Confinement::PrivateQueue,
            executor: serial_executor(&label, self.inner.config.test_mode),
            parent: ContextParent::Coordinator(open.coordinator),
            model: Arc::clone(&self.inner.model),
            merge_policy: MergePolicy::default(),
            will_save: None,
            did_save: Some(did_save),
        })
    }

    /// Runs `operation` on a fresh background context.
    ///
    /// Runs inline in test mode, otherwise returns immediately.
    pub fn perform_in_new_background_context<F>(&self, operation: F)
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        self.new_background_context(None).perform(operation);
    }

    /// UI-confined context whose saves never persist anything.
    pub fn new_disposable_main_context(&self) -> Context {
        let coordinator = Arc::clone(
            self.inner
                .disposable_coordinator
                .get_or_init(|| Arc::new(StoreCoordinator::in_memory())),
        );

        Context::new(ContextOptions {
            name: Some("disposable".to_string()),
            kind: ContextKind::Disposable,
            confinement: Confinement::UiThread,
            executor: Arc::clone(&self.inner.ui_executor),
            parent: ContextParent::Coordinator(coordinator),
            model: Arc::clone(&self.inner.model),
            merge_policy: MergePolicy::default(),
            will_save: Some(Box::new(|context: &Context| context.reset())),
            did_save: None,
        })
    }

    /// Saves the main context into the writer, then the writer to disk.
    ///
    /// `completion` runs exactly once on the UI executor. In test mode the
    /// whole pipeline finishes before this call returns.
    pub fn persist<F>(&self, completion: F)
    where
        F: FnOnce(ContextResult<()>) + Send + 'static,
    {
        let open = self.open_stack();
        let stack = self.clone();
        let writer = open.writer;

        open.main.perform(move |main| {
            if let Err(err) = main.save() {
                stack.finish_persist(Err(err), completion);
                return;
            }

            writer.perform(move |writer| {
                let outcome = writer.save();
                let ui_executor = Arc::clone(&stack.inner.ui_executor);
                ui_executor.execute(Box::new(move || stack.finish_persist(outcome, completion)));
            });
        });
    }

    /// Subscribes to the outcome of every later persist call.
    pub fn persist_events(&self) -> Receiver<PersistNotification> {
        self.inner.persist_bus.subscribe()
    }

    /// Deletes every stored object of `entity` directly in the store.
    ///
    /// Pending and staged changes of contexts are left untouched, so the
    /// object graph can still hold objects that are gone from disk.
    ///
    /// # Errors
    /// - `ContextError::UnknownEntity` when the model has no such entity.
    /// - `ContextError::Store` when the delete fails.
    pub fn drop_entity_collection(&self, entity: &str) -> ContextResult<usize> {
        if self.inner.model.entity(entity).is_none() {
            return Err(ContextError::UnknownEntity(entity.to_string()));
        }

        let writer = self.open_stack().writer;
        let target = entity.to_string();
        let removed = writer.perform_and_wait(move |writer| writer.delete_stored_entity(&target))?;
        info!(
            "event=entity_collection_drop module=stack status=ok entity={} removed={}",
            entity, removed
        );
        Ok(removed)
    }

    /// Closes the store, deletes its files and resets the stack.
    ///
    /// Every file is attempted even after a failure; failures come back
    /// together. The next context access rebuilds an empty stack.
    pub fn drop_store(&self) -> StoreResult<()> {
        let mut state = self.inner.state.lock();
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        let result = match std::mem::replace(&mut *state, StackState::Uninitialized) {
            StackState::Open(open) => open.coordinator.drop_store(),
            StackState::Uninitialized => self.new_coordinator().remove_files(),
        };

        match &result {
            Ok(()) => info!("event=stack_drop module=stack status=ok"),
            Err(err) => warn!("event=stack_drop module=stack status=error error={err}"),
        }
        result
    }

    fn open_stack(&self) -> OpenStack {
        let mut state = self.inner.state.lock();
        if let StackState::Open(open) = &*state {
            return open.clone();
        }

        let coordinator = Arc::new(self.new_coordinator());
        if let Err(err) = coordinator.open() {
            fatal("stack_open", err);
        }

        let writer = Context::new(ContextOptions {
            name: Some("writer".to_string()),
            kind: ContextKind::Writer,
            confinement: Confinement::PrivateQueue,
            executor: Arc::clone(&self.inner.writer_executor),
            parent: ContextParent::Coordinator(Arc::clone(&coordinator)),
            model: Arc::clone(&self.inner.model),
            merge_policy: MergePolicy::default(),
            will_save: None,
            did_save: None,
        });
        let main = Context::new(ContextOptions {
            name: Some("main".to_string()),
            kind: ContextKind::Main,
            confinement: Confinement::UiThread,
            executor: Arc::clone(&self.inner.ui_executor),
            parent: ContextParent::Context(writer.clone()),
            model: Arc::clone(&self.inner.model),
            merge_policy: MergePolicy::default(),
            will_save: None,
            did_save: None,
        });

        let open = OpenStack {
            coordinator,
            writer,
            main,
            generation: self.inner.generation.load(Ordering::SeqCst),
        };
        info!(
            "event=stack_open module=stack status=ok generation={}",
            open.generation
        );
        *state = StackState::Open(open.clone());
        open
    }

    fn new_coordinator(&self) -> StoreCoordinator {
        StoreCoordinator::new(
            self.inner.location.clone(),
            CoordinatorOptions {
                exclude_from_backup: !self.inner.config.test_mode,
                backup_exclusion: Arc::clone(&self.inner.backup_exclusion),
            },
        )
    }

    fn finish_persist<F>(&self, outcome: ContextResult<()>, completion: F)
    where
        F: FnOnce(ContextResult<()>),
    {
        let notification = match &outcome {
            Ok(()) => {
                info!("event=persist module=stack status=ok");
                PersistNotification::DidPersist
            }
            Err(err) => {
                warn!("event=persist module=stack status=error error={err}");
                PersistNotification::DidFailToPersist {
                    error: err.to_string(),
                }
            }
        };
        self.inner.persist_bus.publish(&notification);
        completion(outcome);
    }

    fn current_main(&self, generation: u64) -> Option<Context> {
        match &*self.inner.state.lock() {
            StackState::Open(open) if open.generation == generation => Some(open.main.clone()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for DataStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStack")
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish()
    }
}

/// Did-save handler of background contexts.
fn merge_into_main(stack: &Weak<StackInner>, generation: u64, notification: ChangeNotification) {
    let Some(inner) = stack.upgrade() else {
        debug!("event=background_merge module=stack status=skipped reason=stack_released");
        return;
    };
    let stack = DataStack { inner };

    if !stack.inner.config.test_mode && stack.inner.ui_executor.is_current() {
        fatal(
            "background_merge",
            "background save notification delivered on the UI queue",
        );
    }

    let Some(main) = stack.current_main(generation) else {
        debug!(
            "event=background_merge module=stack status=skipped reason=stale_generation origin_id={}",
            notification.origin.id
        );
        return;
    };
    main.perform(move |main| {
        if let Err(err) = main.merge_changes(&notification) {
            warn!(
                "event=background_merge module=stack status=error origin_id={} error={err}",
                notification.origin.id
            );
        }
    });
}

fn serial_executor(label: &str, test_mode: bool) -> Arc<dyn Executor> {
    if test_mode {
        Arc::new(SynchronousExecutor::new(label))
    } else {
        Arc::new(QueuedExecutor::spawn(label))
    }
}

fn bundle_location(config: &StackConfig) -> Option<PathBuf> {
    config.bundle_location.clone().or_else(|| {
        std::env::current_exe()
            .ok()?
            .parent()
            .map(Path::to_path_buf)
    })
}

fn store_location(config: &StackConfig) -> StoreLocation {
    match config.store_type {
        StoreType::InMemory => StoreLocation::InMemory,
        StoreType::OnDisk => {
            let directory = match &config.store_directory {
                Some(directory) => directory.clone(),
                None => match BaseDirs::new() {
                    Some(dirs) => dirs.data_dir().to_path_buf(),
                    None => fatal("data_dir", "per-user data directory could not be resolved"),
                },
            };
            let seed = bundle_location(config).map(|bundle| {
                bundle.join(format!("{}.{SEED_FILE_EXTENSION}", config.model_name))
            });
            StoreLocation::OnDisk {
                path: directory.join(config.store_file_name()),
                seed,
            }
        }
    }
}
