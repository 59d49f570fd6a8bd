use crate::command::{Action, Command};
use crate::context::Context;
use crate::db::{Database, CDC_COLLECTION};
use crate::document::Document;
use crate::error::{Error, Result};
use crate::index;
use crate::kv::KvTx;
use crate::query::{executor, Optimization, Page, Query, Where};
use chrono::Utc;

/// A handle over one KV transaction. Reads see the transaction's own
/// writes; every mutation runs the full persist pipeline (hooks, index
/// maintenance, CDC append) and is committed or rolled back atomically with
/// the rest of the transaction.
pub struct Tx<'a> {
    pub(crate) db: &'a Database,
    pub(crate) kv: &'a mut dyn KvTx,
    ctx: Context,
    read_only: bool,
    commands: Vec<Command>,
    last_timestamp: i64,
}

impl<'a> Tx<'a> {
    pub(crate) fn new(db: &'a Database, kv: &'a mut dyn KvTx, ctx: Context, read_only: bool) -> Self {
        Tx {
            db,
            kv,
            ctx,
            read_only,
            commands: Vec::new(),
            last_timestamp: 0,
        }
    }

    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    /// Commands persisted so far, handed to the bus after commit.
    pub(crate) fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    /// Point read through the primary index.
    pub fn get(&self, collection: &str, id: &str) -> Result<Document> {
        self.try_get(collection, id)?.ok_or_else(|| Error::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        })
    }

    pub(crate) fn try_get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let schema = self.db.schema(collection)?;
        match self.kv.get(&index::primary_key_ref(&schema, id))? {
            Some(bytes) => Ok(Some(Document::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn query(&self, collection: &str, query: &Query) -> Result<Page> {
        executor::query(self, collection, query)
    }

    /// Stream every document matching the where clauses to the callback, in
    /// index order; the callback returns false to stop early.
    pub fn for_each(
        &self,
        collection: &str,
        wheres: &[Where],
        mut f: impl FnMut(&Document) -> Result<bool>,
    ) -> Result<Optimization> {
        let (documents, optimization) = executor::scan(self, collection, wheres)?;
        for document in &documents {
            self.ctx.check()?;
            if !f(document)? {
                break;
            }
        }
        Ok(optimization)
    }

    /// Insert a document, generating a sortable unique ID when the primary
    /// key is unset. Returns the document ID.
    pub fn create(&mut self, collection: &str, mut doc: Document) -> Result<String> {
        let schema = self.db.schema(collection)?;
        let mut id = schema.get_primary_key(&doc);
        if id.is_empty() {
            id = ulid::Ulid::new().to_string().to_lowercase();
            schema.set_primary_key(&mut doc, &id)?;
        }
        self.persist(Action::Create, collection, id.clone(), Some(doc))?;
        Ok(id)
    }

    /// Full-document replace keyed by the document's primary key.
    pub fn set(&mut self, collection: &str, doc: Document) -> Result<()> {
        let schema = self.db.schema(collection)?;
        let id = schema.get_primary_key(&doc);
        if id.is_empty() {
            return Err(Error::Validation(format!(
                "document missing primary key {}",
                schema.primary_key()
            )));
        }
        self.persist(Action::Set, collection, id, Some(doc))
    }

    /// Deep partial merge of the patch into the stored document.
    pub fn update(&mut self, collection: &str, id: &str, patch: Document) -> Result<()> {
        self.persist(Action::Update, collection, id.to_string(), Some(patch))
    }

    pub fn delete(&mut self, collection: &str, id: &str) -> Result<()> {
        self.persist(Action::Delete, collection, id.to_string(), None)
    }

    /// Monotonic within the transaction even when the wall clock stalls.
    fn next_timestamp(&mut self) -> i64 {
        let now = Utc::now().timestamp_micros();
        let timestamp = now.max(self.last_timestamp + 1);
        self.last_timestamp = timestamp;
        timestamp
    }

    fn persist(
        &mut self,
        action: Action,
        collection: &str,
        doc_id: String,
        payload: Option<Document>,
    ) -> Result<()> {
        if self.read_only {
            return Err(Error::Forbidden(
                "write inside a read-only transaction".to_string(),
            ));
        }
        self.ctx.check()?;
        let db = self.db;
        let schema = db.schema(collection)?;
        if collection == CDC_COLLECTION && !self.ctx.is_indexing() {
            return Err(Error::Forbidden(
                "the cdc collection is written by the engine".to_string(),
            ));
        }
        if doc_id.is_empty() {
            return Err(Error::Validation("empty document id".to_string()));
        }

        let mut command = Command {
            collection: collection.to_string(),
            action,
            doc_id,
            before: None,
            after: payload,
            timestamp: self.next_timestamp(),
            metadata: self.ctx.metadata().clone(),
        };

        if self.ctx.is_indexing() {
            // backfill path: no hooks, no CDC, secondary maintenance only
            command.before = self.try_get(collection, &command.doc_id)?;
            return index::apply(self.kv, &schema, &command, true);
        }

        let ctx = self.ctx.clone();
        db.hooks.apply_persist_hooks(&ctx, self, &command, true)?;

        command.before = self.try_get(collection, &command.doc_id)?;
        match command.action {
            Action::Update => {
                let mut merged = command.before.clone().ok_or_else(|| Error::NotFound {
                    collection: collection.to_string(),
                    id: command.doc_id.clone(),
                })?;
                let patch = command.after.take().ok_or_else(|| {
                    Error::Internal("update command has no patch".to_string())
                })?;
                merged.set_all(patch.flatten())?;
                command.after = Some(merged);
            }
            Action::Delete => {
                if command.before.is_none() {
                    return Err(Error::NotFound {
                        collection: collection.to_string(),
                        id: command.doc_id.clone(),
                    });
                }
                // the post-image of a delete is the last-known image
                command.after = command.before.clone();
            }
            Action::Create | Action::Set => {}
        }

        if command.action != Action::Delete {
            let after = command.after.as_ref().ok_or_else(|| {
                Error::Internal("write command has no document".to_string())
            })?;
            if schema.get_primary_key(after) != command.doc_id {
                return Err(Error::Forbidden(format!(
                    "document id is immutable: {}/{}",
                    collection, command.doc_id
                )));
            }
            schema.validate_document(after)?;
        }
        db.hooks.apply_validators(&ctx, self, &command)?;

        index::apply(self.kv, &schema, &command, false)?;
        self.append_cdc(&command)?;

        db.hooks.apply_persist_hooks(&ctx, self, &command, false)?;
        self.commands.push(command);
        Ok(())
    }

    /// Record the command as a document in the reserved `cdc` collection,
    /// inside the same KV transaction as the state change itself.
    fn append_cdc(&mut self, command: &Command) -> Result<()> {
        if command.collection == CDC_COLLECTION {
            return Ok(());
        }
        let cdc = self.db.schema(CDC_COLLECTION)?;
        let mut doc = Document::from_serialize(command)?;
        let id = ulid::Ulid::new().to_string().to_lowercase();
        cdc.set_primary_key(&mut doc, &id)?;
        let entry = Command {
            collection: CDC_COLLECTION.to_string(),
            action: Action::Create,
            doc_id: id,
            before: None,
            after: Some(doc),
            timestamp: command.timestamp,
            metadata: command.metadata.clone(),
        };
        index::apply(self.kv, &cdc, &entry, false)
    }
}
