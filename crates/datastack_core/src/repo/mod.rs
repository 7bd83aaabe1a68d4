//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define the object-store contract the coordinator commits through.
//! - Isolate SQLite query details from the context graph.
//!
//! # Invariants
//! - Change sets are applied atomically (one transaction per commit).
//! - Read paths reject invalid persisted rows instead of masking them.

pub mod object_repo;
