//! Schema (model) loading and validation.
//!
//! # Responsibility
//! - Load `<modelName>.model.json` from a bundle directory.
//! - Validate entity/attribute names and reject duplicates.
//! - Check context writes against declared entities and attributes.
//!
//! # Invariants
//! - Names match `[A-Za-z_][A-Za-z0-9_]*`.
//! - Entity names are unique; attribute names are unique per entity.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

pub const MODEL_FILE_EXTENSION: &str = "model.json";

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid model name regex"));

pub type ModelResult<T> = Result<T, ModelError>;

/// Model resource loading and validation errors.
#[derive(Debug)]
pub enum ModelError {
    NotFound(PathBuf),
    Io { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, source: serde_json::Error },
    InvalidName(String),
    DuplicateEntity(String),
    DuplicateAttribute { entity: String, attribute: String },
}

impl Display for ModelError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(path) => write!(f, "model resource not found: {}", path.display()),
            Self::Io { path, source } => {
                write!(f, "failed to read model `{}`: {source}", path.display())
            }
            Self::Parse { path, source } => {
                write!(f, "failed to parse model `{}`: {source}", path.display())
            }
            Self::InvalidName(name) => write!(f, "invalid model element name: `{name}`"),
            Self::DuplicateEntity(name) => write!(f, "entity declared twice: {name}"),
            Self::DuplicateAttribute { entity, attribute } => {
                write!(f, "attribute `{attribute}` declared twice on entity {entity}")
            }
        }
    }
}

impl Error for ModelError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// One entity of the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescription {
    pub name: String,
    #[serde(default)]
    pub attributes: Vec<String>,
}

impl EntityDescription {
    pub fn new<I, S>(name: impl Into<String>, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            attributes: attributes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_attribute(&self, attribute: &str) -> bool {
        self.attributes.iter().any(|declared| declared == attribute)
    }
}

#[derive(Debug, Deserialize)]
struct ModelFile {
    entities: Vec<EntityDescription>,
}

/// Validated schema shared by every context of a stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    name: String,
    entities: BTreeMap<String, EntityDescription>,
}

impl Model {
    /// Builds a model from entity descriptions.
    ///
    /// # Errors
    /// - Returns an error for invalid or duplicate entity/attribute names.
    pub fn new(
        name: impl Into<String>,
        entities: impl IntoIterator<Item = EntityDescription>,
    ) -> ModelResult<Self> {
        let name = name.into();
        validate_name(&name)?;

        let mut by_name = BTreeMap::new();
        for entity in entities {
            validate_name(&entity.name)?;
            let mut seen = Vec::with_capacity(entity.attributes.len());
            for attribute in &entity.attributes {
                validate_name(attribute)?;
                if seen.contains(&attribute) {
                    return Err(ModelError::DuplicateAttribute {
                        entity: entity.name.clone(),
                        attribute: attribute.clone(),
                    });
                }
                seen.push(attribute);
            }
            if by_name.contains_key(&entity.name) {
                return Err(ModelError::DuplicateEntity(entity.name));
            }
            by_name.insert(entity.name.clone(), entity);
        }

        Ok(Self {
            name,
            entities: by_name,
        })
    }

    /// Returns the resource path of model `name` inside `bundle`.
    pub fn resource_path(bundle: &Path, name: &str) -> PathBuf {
        bundle.join(format!("{name}.{MODEL_FILE_EXTENSION}"))
    }

    /// Loads model `name` from the bundle directory.
    pub fn load(bundle: &Path, name: &str) -> ModelResult<Self> {
        let path = Self::resource_path(bundle, name);
        if !path.is_file() {
            return Err(ModelError::NotFound(path));
        }

        let raw = std::fs::read_to_string(&path).map_err(|source| ModelError::Io {
            path: path.clone(),
            source,
        })?;
        let file: ModelFile =
            serde_json::from_str(&raw).map_err(|source| ModelError::Parse { path, source })?;

        Self::new(name, file.entities)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDescription> {
        self.entities.get(name)
    }

    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }
}

/// Returns whether `value` is usable as a model, entity or attribute name.
pub fn is_valid_name(value: &str) -> bool {
    NAME_RE.is_match(value)
}

fn validate_name(value: &str) -> ModelResult<()> {
    if is_valid_name(value) {
        Ok(())
    } else {
        Err(ModelError::InvalidName(value.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::{EntityDescription, Model, ModelError};

    #[test]
    fn new_rejects_duplicate_entities() {
        let err = Model::new(
            "Model",
            [
                EntityDescription::new("User", ["name"]),
                EntityDescription::new("User", ["remoteID"]),
            ],
        )
        .expect_err("duplicate entity must be rejected");
        assert!(matches!(err, ModelError::DuplicateEntity(name) if name == "User"));
    }

    #[test]
    fn new_rejects_invalid_attribute_names() {
        let err = Model::new("Model", [EntityDescription::new("User", ["first name"])])
            .expect_err("spaces are not allowed");
        assert!(matches!(err, ModelError::InvalidName(_)));
    }

    #[test]
    fn load_reads_json_resource() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("DataModel.model.json"),
            r#"{"entities":[{"name":"User","attributes":["remoteID","name"]}]}"#,
        )
        .unwrap();

        let model = Model::load(dir.path(), "DataModel").unwrap();
        assert_eq!(model.name(), "DataModel");
        assert!(model.entity("User").unwrap().has_attribute("remoteID"));
        assert!(model.entity("Task").is_none());
    }

    #[test]
    fn load_reports_missing_resource() {
        let dir = tempfile::tempdir().unwrap();
        let err = Model::load(dir.path(), "Missing").unwrap_err();
        assert!(matches!(err, ModelError::NotFound(_)));
    }
}
