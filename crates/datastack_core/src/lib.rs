//! Concurrency-safe persistence contexts over an SQLite object store.
//!
//! A `DataStack` owns one store coordinator, a writer context with the only
//! durable edge to disk, and a UI-confined main context. Background contexts
//! save into their own overlay and are merged into the main context; persist
//! moves main changes through the writer to disk.

pub mod config;
pub mod context;
pub mod db;
pub mod executor;
mod fatal;
pub mod logging;
pub mod model;
pub mod repo;
pub mod stack;
pub mod store;

pub use config::{is_test_environment, ConfigError, StackConfig, StoreType};
pub use context::{Confinement, Context, ContextError, ContextKind, ContextResult};
pub use executor::{Executor, QueuedExecutor, SynchronousExecutor};
pub use logging::{active_log_dir, default_log_level, init_logging, LoggingError, LoggingResult};
pub use model::changes::{
    ChangeNotification, ChangeSet, ContextOrigin, MergePolicy, SaveTicket,
};
pub use model::object::{attributes, Attributes, ManagedObject, ObjectId};
pub use model::schema::{EntityDescription, Model, ModelError};
pub use repo::object_repo::FetchRequest;
pub use stack::{DataStack, PersistNotification, StackComponents, StackStatus};
pub use store::{BackupExclusion, StoreCoordinator, StoreError, StoreLocation, StoreResult};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
