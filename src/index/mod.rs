pub mod keys;

use crate::command::{Action, Command};
use crate::document::Document;
use crate::error::{Error, Result};
use crate::kv::{IterOpts, KvTx};
use crate::schema::{CollectionSchema, Index};
use serde_json::{json, Value};

/// Maintains the primary and every secondary index for one command inside
/// the enclosing KV transaction.
///
/// Primary entries store the full document bytes; secondary entries store
/// only the docID and indirect through the primary index on read. Under
/// `indexing_only` (online backfill) the primary entry is left untouched.
pub fn apply(
    kv: &mut dyn KvTx,
    schema: &CollectionSchema,
    command: &Command,
    indexing_only: bool,
) -> Result<()> {
    if !indexing_only {
        let pkey = primary_key_ref(schema, &command.doc_id);
        match command.action {
            Action::Create | Action::Set | Action::Update => {
                let after = post_image(command)?;
                kv.set(&pkey, &after.to_bytes()?)?;
            }
            Action::Delete => {
                kv.delete(&pkey)?;
            }
        }
    }
    for index in schema.indexes() {
        if index.primary {
            continue;
        }
        update_secondary(kv, schema, &index, command)?;
    }
    Ok(())
}

/// The primary-index key holding a document's bytes.
pub fn primary_key_ref(schema: &CollectionSchema, doc_id: &str) -> Vec<u8> {
    keys::full_key(
        schema.collection(),
        schema.primary_index(),
        &[json!(doc_id)],
        doc_id,
    )
}

/// The ordered field values an index extracts from a document.
pub fn field_values(index: &Index, doc: &Document) -> Vec<Value> {
    index.fields.iter().map(|field| doc.get_value(field)).collect()
}

fn post_image(command: &Command) -> Result<&Document> {
    command.after.as_ref().ok_or_else(|| {
        Error::Internal(format!(
            "{:?} command for {}/{} has no post-image",
            command.action, command.collection, command.doc_id
        ))
    })
}

fn update_secondary(
    kv: &mut dyn KvTx,
    schema: &CollectionSchema,
    index: &Index,
    command: &Command,
) -> Result<()> {
    let collection = schema.collection();
    match command.action {
        Action::Delete => {
            if let Some(before) = &command.before {
                let values = field_values(index, before);
                kv.delete(&keys::full_key(collection, index, &values, &command.doc_id))?;
            }
        }
        Action::Create | Action::Set | Action::Update => {
            if let Some(before) = &command.before {
                let values = field_values(index, before);
                kv.delete(&keys::full_key(collection, index, &values, &command.doc_id))?;
            }
            let after = post_image(command)?;
            let values = field_values(index, after);
            if index.unique {
                unique_check(kv, collection, index, &values, &command.doc_id)?;
            }
            kv.set(
                &keys::full_key(collection, index, &values, &command.doc_id),
                command.doc_id.as_bytes(),
            )?;
        }
    }
    Ok(())
}

/// Prefix scan over the candidate value tuple; any entry whose trailing
/// docID differs is a violation. Runs inside the write transaction, so the
/// scan sees the transaction's own earlier writes and the serialized write
/// lock keeps concurrent creates from racing past it.
fn unique_check(
    kv: &dyn KvTx,
    collection: &str,
    index: &Index,
    values: &[Value],
    doc_id: &str,
) -> Result<()> {
    let prefix = keys::scan_prefix(collection, index, values);
    let mut it = kv.iter(IterOpts {
        prefix,
        ..Default::default()
    })?;
    while it.valid() {
        match keys::doc_id_from_key(it.key()) {
            Some(existing) if existing != doc_id => {
                return Err(Error::UniqueViolation {
                    index: index.name.clone(),
                    doc_id: doc_id.to_string(),
                });
            }
            _ => it.next(),
        }
    }
    Ok(())
}
