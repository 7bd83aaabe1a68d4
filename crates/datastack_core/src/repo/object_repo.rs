//! Object repository contract and SQLite implementation.
//!
//! # Responsibility
//! - Provide fetch/commit/delete APIs over the canonical `objects` table.
//! - Keep SQL details inside the persistence boundary.
//!
//! # Invariants
//! - Commits use upsert semantics, so replaying a committed change set is
//!   harmless.
//! - Attribute bags are stored as JSON objects.

use crate::db::DbError;
use crate::model::changes::ChangeSet;
use crate::model::object::{Attributes, ManagedObject, ObjectId};
use rusqlite::{params, Connection, Row};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

const OBJECT_SELECT_SQL: &str = "SELECT
    id,
    entity,
    attributes
FROM objects";

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error for object persistence and query operations.
#[derive(Debug)]
pub enum RepoError {
    Db(DbError),
    Serialization(serde_json::Error),
    InvalidData(String),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::Serialization(err) => write!(f, "failed to encode attributes: {err}"),
            Self::InvalidData(message) => write!(f, "invalid persisted object data: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Serialization(err) => Some(err),
            Self::InvalidData(_) => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Query options for fetching objects of one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub entity: String,
    pub limit: Option<u32>,
}

impl FetchRequest {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Repository interface for the object store.
pub trait ObjectRepository {
    /// Returns stored objects of `entity`, ordered by identity.
    fn fetch_entity(&self, entity: &str) -> RepoResult<Vec<ManagedObject>>;
    fn get_object(&self, id: ObjectId) -> RepoResult<Option<ManagedObject>>;
    /// Applies every change of `changes`; callers wrap this in a transaction.
    fn apply_changes(&self, changes: &ChangeSet) -> RepoResult<()>;
    /// Deletes every stored object of `entity` and returns how many went.
    fn delete_entity(&self, entity: &str) -> RepoResult<usize>;
    fn count_objects(&self) -> RepoResult<u64>;
}

/// SQLite-backed object repository.
pub struct SqliteObjectRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteObjectRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl ObjectRepository for SqliteObjectRepository<'_> {
    fn fetch_entity(&self, entity: &str) -> RepoResult<Vec<ManagedObject>> {
        let mut stmt = self.conn.prepare(&format!(
            "{OBJECT_SELECT_SQL}
             WHERE entity = ?1
             ORDER BY id ASC;"
        ))?;

        let mut rows = stmt.query(params![entity])?;
        let mut objects = Vec::new();
        while let Some(row) = rows.next()? {
            objects.push(parse_object_row(row)?);
        }

        Ok(objects)
    }

    fn get_object(&self, id: ObjectId) -> RepoResult<Option<ManagedObject>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{OBJECT_SELECT_SQL} WHERE id = ?1;"))?;

        let mut rows = stmt.query(params![id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_object_row(row)?));
        }

        Ok(None)
    }

    fn apply_changes(&self, changes: &ChangeSet) -> RepoResult<()> {
        for (id, _) in changes.deleted() {
            self.conn
                .execute("DELETE FROM objects WHERE id = ?1;", [id.to_string()])?;
        }

        for object in changes.upserts() {
            let encoded =
                serde_json::to_string(&object.attributes).map_err(RepoError::Serialization)?;
            self.conn.execute(
                "INSERT INTO objects (id, entity, attributes)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    entity = excluded.entity,
                    attributes = excluded.attributes,
                    updated_at = (strftime('%s', 'now') * 1000);",
                params![object.id.to_string(), object.entity.as_str(), encoded],
            )?;
        }

        Ok(())
    }

    fn delete_entity(&self, entity: &str) -> RepoResult<usize> {
        let removed = self
            .conn
            .execute("DELETE FROM objects WHERE entity = ?1;", [entity])?;
        Ok(removed)
    }

    fn count_objects(&self) -> RepoResult<u64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM objects;", [], |row| row.get::<_, i64>(0))?;
        u64::try_from(count)
            .map_err(|_| RepoError::InvalidData(format!("negative object count `{count}`")))
    }
}

fn parse_object_row(row: &Row<'_>) -> RepoResult<ManagedObject> {
    let id_text: String = row.get("id")?;
    let id = Uuid::parse_str(&id_text).map_err(|_| {
        RepoError::InvalidData(format!("invalid uuid value `{id_text}` in objects.id"))
    })?;

    let attributes_text: String = row.get("attributes")?;
    let attributes: Attributes = serde_json::from_str(&attributes_text).map_err(|err| {
        RepoError::InvalidData(format!(
            "invalid attributes for object `{id_text}` in objects.attributes: {err}"
        ))
    })?;

    Ok(ManagedObject::with_id(id, row.get::<_, String>("entity")?, attributes))
}
