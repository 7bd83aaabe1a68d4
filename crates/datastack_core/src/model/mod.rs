//! Object-graph domain model shared by every context.
//!
//! # Responsibility
//! - Define managed objects, their identities and attribute bags.
//! - Define change sets, the unit moved between contexts on save and merge.
//! - Load and validate the schema (`Model`) that inserts are checked against.
//!
//! # Invariants
//! - Every managed object is identified by a stable `ObjectId`.
//! - Within one change set an object identity appears in at most one of the
//!   inserted/updated/deleted groups.

pub mod changes;
pub mod object;
pub mod schema;
