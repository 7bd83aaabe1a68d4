//! Shared fixtures for stack integration tests.
#![allow(dead_code)]

use datastack_core::{
    BackupExclusion, Context, ContextResult, DataStack, EntityDescription, FetchRequest, Model,
    StackComponents, StackConfig, StoreType,
};
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

pub const MODEL_NAME: &str = "Model";
pub const WAIT: Duration = Duration::from_secs(10);

const MODEL_JSON: &str = r#"{
  "entities": [
    { "name": "User", "attributes": ["remoteID", "name"] },
    { "name": "Task", "attributes": ["title"] }
  ]
}"#;

pub fn user_model() -> Model {
    Model::new(
        MODEL_NAME,
        [
            EntityDescription::new("User", ["remoteID", "name"]),
            EntityDescription::new("Task", ["title"]),
        ],
    )
    .unwrap()
}

/// Writes `Model.model.json` into `<root>/bundle` and returns that directory.
pub fn write_bundle(root: &Path) -> PathBuf {
    let bundle = root.join("bundle");
    std::fs::create_dir_all(&bundle).unwrap();
    std::fs::write(bundle.join(format!("{MODEL_NAME}.model.json")), MODEL_JSON).unwrap();
    bundle
}

/// On-disk test-mode config rooted in `root`.
pub fn disk_config(root: &Path) -> StackConfig {
    StackConfig::new(MODEL_NAME)
        .with_bundle_location(root.join("bundle"))
        .with_store_directory(root.join("store"))
        .with_test_mode(true)
}

pub fn memory_config() -> StackConfig {
    StackConfig::new(MODEL_NAME)
        .with_store_type(StoreType::InMemory)
        .with_test_mode(true)
}

pub fn disk_stack(root: &Path) -> DataStack {
    DataStack::with_model(disk_config(root), user_model())
}

pub fn memory_stack() -> DataStack {
    DataStack::with_model(memory_config(), user_model())
}

/// On-disk stack running real serial queues.
pub fn queued_stack(root: &Path) -> (DataStack, Arc<RecordingBackupExclusion>) {
    let backup = Arc::new(RecordingBackupExclusion::default());
    let stack = DataStack::with_components(
        disk_config(root).with_test_mode(false),
        user_model(),
        StackComponents {
            ui_executor: None,
            backup_exclusion: Arc::clone(&backup) as Arc<dyn BackupExclusion>,
        },
    );
    (stack, backup)
}

pub fn user_names(context: &Context) -> Vec<String> {
    let mut names: Vec<String> = context
        .fetch(&FetchRequest::new("User"))
        .unwrap()
        .iter()
        .filter_map(|user| user.get_str("name").map(str::to_string))
        .collect();
    names.sort();
    names
}

pub fn user_count(context: &Context) -> usize {
    context.count(&FetchRequest::new("User")).unwrap()
}

/// Runs `persist` and blocks until its completion has run.
pub fn persist_and_wait(stack: &DataStack) -> ContextResult<()> {
    let (tx, rx) = mpsc::channel();
    stack.persist(move |outcome| {
        tx.send(outcome).unwrap();
    });
    rx.recv_timeout(WAIT).unwrap()
}

/// Records every path it is asked to exclude from backups.
#[derive(Default)]
pub struct RecordingBackupExclusion {
    excluded: Mutex<Vec<PathBuf>>,
}

impl RecordingBackupExclusion {
    pub fn excluded(&self) -> Vec<PathBuf> {
        self.excluded.lock().clone()
    }
}

impl BackupExclusion for RecordingBackupExclusion {
    fn exclude(&self, path: &Path) -> io::Result<()> {
        self.excluded.lock().push(path.to_path_buf());
        Ok(())
    }
}

pub struct FailingBackupExclusion;

impl BackupExclusion for FailingBackupExclusion {
    fn exclude(&self, _path: &Path) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only volume"))
    }
}
