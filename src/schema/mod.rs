pub mod validate;

use crate::document::Document;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// A primary or secondary index over an ordered list of document fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub primary: bool,
    /// Indexes under online build are maintained on writes but excluded from
    /// query planning until the backfill completes.
    #[serde(default)]
    pub building: bool,
}

impl Index {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Validation("index requires a name".to_string()));
        }
        if self.fields.is_empty() {
            return Err(Error::Validation(format!(
                "index {} requires at least one field",
                self.name
            )));
        }
        Ok(())
    }
}

/// A named collection: a JSON Schema for validation plus its index set.
///
/// Parsed from a YAML or JSON configuration document carrying the schema and
/// the extension fields `x-collection`, `x-indexing` and `x-require-index`.
#[derive(Debug)]
pub struct CollectionSchema {
    collection: String,
    primary: Index,
    secondaries: RwLock<BTreeMap<String, Index>>,
    schema_root: Value,
    require_index: bool,
}

impl CollectionSchema {
    /// Parse a collection configuration document. JSON is accepted as a
    /// subset of YAML.
    pub fn parse(content: &str) -> Result<Self> {
        let root: Value = serde_yaml::from_str(content)?;
        let collection = root
            .get("x-collection")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                Error::Validation("collection configuration requires x-collection".to_string())
            })?
            .to_string();

        let mut primary: Option<Index> = None;
        let mut secondaries = BTreeMap::new();
        if let Some(indexing) = root.get("x-indexing") {
            let entries = indexing.as_object().ok_or_else(|| {
                Error::Validation(format!("{collection}: x-indexing must be a mapping"))
            })?;
            for (key, raw) in entries {
                let mut index: Index = serde_json::from_value(raw.clone()).map_err(|err| {
                    Error::Validation(format!("{collection}: invalid index {key}: {err}"))
                })?;
                if index.name.is_empty() {
                    index.name = key.clone();
                }
                index.validate()?;
                index.building = false;
                if index.primary {
                    index.unique = true;
                    if primary.replace(index).is_some() {
                        return Err(Error::Validation(format!(
                            "{collection}: exactly one index may be primary"
                        )));
                    }
                } else {
                    secondaries.insert(index.name.clone(), index);
                }
            }
        }
        let primary = primary.ok_or_else(|| {
            Error::Validation(format!("{collection}: primary index is required"))
        })?;
        if secondaries.contains_key(&primary.name) {
            return Err(Error::Validation(format!(
                "{collection}: index name {} is taken by the primary index",
                primary.name
            )));
        }

        let require_index = root
            .get("x-require-index")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(CollectionSchema {
            collection,
            primary,
            secondaries: RwLock::new(secondaries),
            schema_root: root,
            require_index,
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn primary_index(&self) -> &Index {
        &self.primary
    }

    /// The primary-key field: the first field of the primary index.
    pub fn primary_key(&self) -> &str {
        &self.primary.fields[0]
    }

    pub fn get_primary_key(&self, doc: &Document) -> String {
        doc.get_string(self.primary_key())
    }

    pub fn set_primary_key(&self, doc: &mut Document, id: &str) -> Result<()> {
        doc.set(self.primary_key(), json!(id))
    }

    pub fn require_query_index(&self) -> bool {
        self.require_index
    }

    /// Every index, primary first, secondaries ordered by name.
    pub fn indexes(&self) -> Vec<Index> {
        let mut indexes = vec![self.primary.clone()];
        indexes.extend(self.secondaries.read().values().cloned());
        indexes
    }

    /// Indexes eligible for query planning (building ones excluded).
    pub fn ready_indexes(&self) -> Vec<Index> {
        self.indexes()
            .into_iter()
            .filter(|index| !index.building)
            .collect()
    }

    pub fn get_index(&self, name: &str) -> Option<Index> {
        if name == self.primary.name {
            return Some(self.primary.clone());
        }
        self.secondaries.read().get(name).cloned()
    }

    /// Install or replace a secondary index. Touching the primary index is
    /// forbidden.
    pub fn set_index(&self, index: Index) -> Result<()> {
        index.validate()?;
        if index.primary || index.name == self.primary.name {
            return Err(Error::Forbidden(format!(
                "cannot modify the primary index: {}",
                index.name
            )));
        }
        self.secondaries.write().insert(index.name.clone(), index);
        Ok(())
    }

    /// Remove a secondary index, returning its definition.
    pub fn del_index(&self, name: &str) -> Result<Index> {
        if name == self.primary.name {
            return Err(Error::Forbidden(format!(
                "cannot delete the primary index: {name}"
            )));
        }
        self.secondaries.write().remove(name).ok_or_else(|| {
            Error::Validation(format!("{}: unknown index: {name}", self.collection))
        })
    }

    pub(crate) fn set_index_building(&self, name: &str, building: bool) {
        if let Some(index) = self.secondaries.write().get_mut(name) {
            index.building = building;
        }
    }

    /// Validate a document against the collection's JSON Schema. The error
    /// lists every failed path.
    pub fn validate_document(&self, doc: &Document) -> Result<()> {
        let failures = validate::validate(&self.schema_root, doc.as_value());
        if failures.is_empty() {
            return Ok(());
        }
        Err(Error::Validation(format!(
            "{}: invalid document: {}",
            self.collection,
            failures.join("; ")
        )))
    }
}
