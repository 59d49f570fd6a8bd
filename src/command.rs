use crate::document::Document;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The kind of state change a command applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Set,
    Update,
    Delete,
}

/// A single document mutation: the unit recorded in the `cdc` collection and
/// delivered on change streams.
///
/// `before` is the document as of the transaction read; `after` is the
/// post-image (for deletes, the last-known image). Timestamps are unix
/// microseconds, monotonic within a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub collection: String,
    pub action: Action,
    pub doc_id: String,
    pub before: Option<Document>,
    pub after: Option<Document>,
    pub timestamp: i64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}
