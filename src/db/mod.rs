pub mod transaction;

pub use transaction::Tx;

use crate::bus::{ChangeBus, ChangeStream};
use crate::command::Command;
use crate::context::Context;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::hooks::HookRegistry;
use crate::index::keys;
use crate::kv::{DriverRegistry, IterOpts, KvDriver};
use crate::query::{Optimization, Page, Query, Where};
use crate::schema::{CollectionSchema, Index};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Reserved collection recording every state-change command.
pub const CDC_COLLECTION: &str = "cdc";

/// Chunk size of online index backfills.
const BATCH_THRESHOLD: usize = 10;

const CDC_SCHEMA: &str = r#"
type: object
x-collection: cdc
x-indexing:
  primary:
    name: primary
    fields: [_id]
    primary: true
  timestamp:
    name: timestamp
    fields: [timestamp]
  collection:
    name: collection
    fields: [collection]
  doc_id:
    name: doc_id
    fields: [doc_id]
  action:
    name: action
    fields: [action]
properties:
  _id: { type: string }
  collection: { type: string }
  action: { type: string }
  doc_id: { type: string }
  timestamp: { type: number }
"#;

/// An embedded JSON-document database over an ordered key-value store.
///
/// Owns the KV handle, the schema registry, the hook registry and the change
/// bus. All public operations are thread-safe.
pub struct Database {
    kv: Box<dyn KvDriver>,
    schemas: RwLock<HashMap<String, Arc<CollectionSchema>>>,
    pub(crate) hooks: HookRegistry,
    bus: ChangeBus,
}

impl Database {
    /// Open a database on the named driver from the given factory table.
    pub fn open(registry: &DriverRegistry, driver: &str, params: Value) -> Result<Self> {
        let kv = registry.open(driver, &params)?;
        let db = Database {
            kv,
            schemas: RwLock::new(HashMap::new()),
            hooks: HookRegistry::new(),
            bus: ChangeBus::new(),
        };
        db.configure_collection(CDC_SCHEMA)?;
        Ok(db)
    }

    /// Open a database on the built-in in-memory driver.
    pub fn open_memory() -> Result<Self> {
        Self::open(&DriverRegistry::new(), "memory", json!({}))
    }

    /// Install or replace a collection schema from its configuration
    /// document. Schemas live for the database's lifetime.
    pub fn configure_collection(&self, content: &str) -> Result<()> {
        let schema = CollectionSchema::parse(content)?;
        self.schemas
            .write()
            .insert(schema.collection().to_string(), Arc::new(schema));
        Ok(())
    }

    pub fn has_collection(&self, collection: &str) -> bool {
        self.schemas.read().contains_key(collection)
    }

    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.schemas.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn schema(&self, collection: &str) -> Result<Arc<CollectionSchema>> {
        self.schemas.read().get(collection).cloned().ok_or_else(|| {
            Error::Validation(format!("unsupported collection: {collection}"))
        })
    }

    /// Run `f` inside a transaction; commit on `Ok`, roll back on error.
    /// After a successful commit, every command is published to the change
    /// bus in order.
    pub fn tx<R>(
        &self,
        ctx: &Context,
        read_only: bool,
        f: impl FnOnce(&mut Tx) -> Result<R>,
    ) -> Result<R> {
        ctx.check()?;
        let mut func = Some(f);
        let mut outcome: Option<R> = None;
        let mut committed: Vec<Command> = Vec::new();
        self.kv.tx(read_only, &mut |kv| {
            let func = func
                .take()
                .ok_or_else(|| Error::Internal("transaction closure entered twice".to_string()))?;
            let mut tx = Tx::new(self, kv, ctx.clone(), read_only);
            outcome = Some(func(&mut tx)?);
            committed = tx.take_commands();
            Ok(())
        })?;
        for command in committed {
            self.bus.publish(command);
        }
        outcome.ok_or_else(|| Error::Internal("transaction did not execute".to_string()))
    }

    pub fn get(&self, ctx: &Context, collection: &str, id: &str) -> Result<Document> {
        self.tx(ctx, true, |tx| tx.get(collection, id))
    }

    pub fn query(&self, ctx: &Context, collection: &str, query: &Query) -> Result<Page> {
        self.tx(ctx, true, |tx| tx.query(collection, query))
    }

    pub fn for_each(
        &self,
        ctx: &Context,
        collection: &str,
        wheres: &[Where],
        f: impl FnMut(&Document) -> Result<bool>,
    ) -> Result<Optimization> {
        self.tx(ctx, true, |tx| tx.for_each(collection, wheres, f))
    }

    pub fn create(&self, ctx: &Context, collection: &str, doc: Document) -> Result<String> {
        self.tx(ctx, false, |tx| tx.create(collection, doc))
    }

    pub fn set(&self, ctx: &Context, collection: &str, doc: Document) -> Result<()> {
        self.tx(ctx, false, |tx| tx.set(collection, doc))
    }

    pub fn update(&self, ctx: &Context, collection: &str, id: &str, patch: Document) -> Result<()> {
        self.tx(ctx, false, |tx| tx.update(collection, id, patch))
    }

    pub fn delete(&self, ctx: &Context, collection: &str, id: &str) -> Result<()> {
        self.tx(ctx, false, |tx| tx.delete(collection, id))
    }

    /// Hook registration (validators, where/read/persist hooks).
    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Subscribe to a collection's committed commands.
    pub fn change_stream(&self, collection: &str) -> ChangeStream {
        self.bus.subscribe(collection)
    }

    /// Install a secondary index and build it online: the index is
    /// maintained by live writes from the moment it is installed, stays out
    /// of query planning while building, and becomes plannable once the
    /// backfill of pre-existing documents completes.
    pub fn set_index(&self, ctx: &Context, collection: &str, mut index: Index) -> Result<()> {
        let schema = self.schema(collection)?;
        index.building = true;
        let name = index.name.clone();
        schema.set_index(index)?;
        match self.backfill(ctx, collection) {
            Ok(()) => {
                schema.set_index_building(&name, false);
                Ok(())
            }
            Err(err) => {
                if let Ok(removed) = schema.del_index(&name) {
                    let _ = self.purge_index_entries(collection, &removed);
                }
                Err(err)
            }
        }
    }

    /// Remove a secondary index and purge its entries.
    pub fn del_index(&self, collection: &str, name: &str) -> Result<()> {
        let schema = self.schema(collection)?;
        let removed = schema.del_index(name)?;
        self.purge_index_entries(collection, &removed)
    }

    /// Re-persist every document in chunks under the indexing context flag,
    /// which confines the index manager to secondary maintenance.
    fn backfill(&self, ctx: &Context, collection: &str) -> Result<()> {
        let indexing = ctx.with_indexing();
        let mut documents: Vec<Document> = Vec::new();
        self.tx(&indexing, true, |tx| {
            tx.for_each(collection, &[], |doc| {
                documents.push(doc.clone());
                Ok(true)
            })?;
            Ok(())
        })?;
        let total = documents.len();
        for (chunk_index, chunk) in documents.chunks(BATCH_THRESHOLD).enumerate() {
            ctx.check()?;
            self.tx(&indexing, false, |tx| {
                for doc in chunk {
                    tx.set(collection, doc.clone())?;
                }
                Ok(())
            })?;
            log::debug!(
                "index backfill on {collection}: {}/{total}",
                (chunk_index * BATCH_THRESHOLD + chunk.len()).min(total)
            );
        }
        Ok(())
    }

    /// Bulk index teardown through the driver's write batch; atomicity
    /// beyond the batch is not required here.
    fn purge_index_entries(&self, collection: &str, index: &Index) -> Result<()> {
        let prefix = keys::scan_prefix(collection, index, &[]);
        let mut stale: Vec<Vec<u8>> = Vec::new();
        self.kv.tx(true, &mut |kv| {
            let mut it = kv.iter(IterOpts {
                prefix: prefix.clone(),
                ..Default::default()
            })?;
            while it.valid() {
                stale.push(it.key().to_vec());
                it.next();
            }
            Ok(())
        })?;
        let mut batch = self.kv.batch();
        for key in &stale {
            batch.delete(key)?;
        }
        batch.flush()
    }

    pub fn close(self) -> Result<()> {
        self.kv.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Action;
    use crate::hooks::PersistHook;
    use crate::query::{Direction, OrderBy, Select, WhereOp};
    use chrono::Utc;
    use std::time::Duration;

    const USER_SCHEMA: &str = r#"
type: object
x-collection: user
x-indexing:
  primary: { name: primary, fields: [_id], primary: true }
  email: { name: email, fields: [contact.email], unique: true }
  account: { name: account, fields: [account_id] }
properties:
  _id: { type: string }
  name: { type: string }
  age: { type: number }
  account_id: { type: number }
  contact:
    type: object
    properties:
      email: { type: string }
required: [_id, name]
"#;

    const TASK_SCHEMA: &str = r#"
type: object
x-collection: task
x-indexing:
  primary: { name: primary, fields: [_id], primary: true }
  user: { name: user, fields: [user] }
properties:
  _id: { type: string }
  user: { type: string }
  title: { type: string }
"#;

    fn test_db() -> Database {
        let db = Database::open_memory().unwrap();
        db.configure_collection(USER_SCHEMA).unwrap();
        db.configure_collection(TASK_SCHEMA).unwrap();
        db
    }

    fn user(id: &str, name: &str, age: u64, account_id: u64, email: &str) -> Document {
        Document::from_value(json!({
            "_id": id,
            "name": name,
            "age": age,
            "account_id": account_id,
            "contact": {"email": email},
        }))
        .unwrap()
    }

    fn eq(field: &str, value: Value) -> Where {
        Where {
            field: field.into(),
            op: WhereOp::Eq,
            value,
        }
    }

    #[test]
    fn test_create_and_get() {
        let db = test_db();
        let ctx = Context::background();
        let mut doc = user("", "Alice", 30, 1, "alice@test.com");
        doc.del("_id");
        let id = db.create(&ctx, "user", doc).unwrap();
        assert!(!id.is_empty());
        let stored = db.get(&ctx, "user", &id).unwrap();
        assert_eq!(stored.get_string("_id"), id);
        assert_eq!(stored.get_string("name"), "Alice");
    }

    #[test]
    fn test_get_round_trips_last_set() {
        let db = test_db();
        let ctx = Context::background();
        let doc = user("a", "Alice", 30, 1, "alice@test.com");
        db.set(&ctx, "user", doc.clone()).unwrap();
        assert_eq!(db.get(&ctx, "user", "a").unwrap(), doc);
        db.delete(&ctx, "user", "a").unwrap();
        assert!(matches!(
            db.get(&ctx, "user", "a"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_validation_failure_rejects_write() {
        let db = test_db();
        let ctx = Context::background();
        // name is required
        let doc = Document::from_value(json!({"_id": "a", "age": 5})).unwrap();
        let err = db.set(&ctx, "user", doc).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
    }

    #[test]
    fn test_update_is_a_partial_merge() {
        let db = test_db();
        let ctx = Context::background();
        db.set(&ctx, "user", user("a", "Alice", 30, 1, "alice@test.com"))
            .unwrap();
        let patch =
            Document::from_value(json!({"contact": {"email": "new@test.com"}})).unwrap();
        db.update(&ctx, "user", "a", patch).unwrap();
        let stored = db.get(&ctx, "user", "a").unwrap();
        assert_eq!(stored.get_string("contact.email"), "new@test.com");
        assert_eq!(stored.get_string("name"), "Alice");
        // secondary entry moved with the value
        let page = db
            .query(
                &ctx,
                "user",
                &Query {
                    r#where: vec![eq("contact.email", json!("new@test.com"))],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page.count, 1);
    }

    #[test]
    fn test_update_missing_document_is_not_found() {
        let db = test_db();
        let ctx = Context::background();
        let err = db
            .update(&ctx, "user", "ghost", Document::new())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn test_primary_key_is_immutable() {
        let db = test_db();
        let ctx = Context::background();
        db.set(&ctx, "user", user("a", "Alice", 30, 1, "alice@test.com"))
            .unwrap();
        let patch = Document::from_value(json!({"_id": "b"})).unwrap();
        let err = db.update(&ctx, "user", "a", patch).unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    // Scenario: unique index violation on contact.email.
    #[test]
    fn test_unique_index_violation() {
        let db = test_db();
        let ctx = Context::background();
        db.set(&ctx, "user", user("a", "Alice", 30, 1, "x@y"))
            .unwrap();
        let err = db
            .set(&ctx, "user", user("b", "Bob", 40, 2, "x@y"))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UniqueViolation { ref index, .. } if index == "email"
        ));

        let page = db
            .query(
                &ctx,
                "user",
                &Query {
                    r#where: vec![eq("contact.email", json!("x@y"))],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page.count, 1);
        assert_eq!(page.documents[0].get_string("_id"), "a");
    }

    #[test]
    fn test_failed_transaction_rolls_back_every_write() {
        let db = test_db();
        let ctx = Context::background();
        let result = db.tx(&ctx, false, |tx| {
            tx.set("user", user("a", "Alice", 30, 1, "x@y"))?;
            tx.set("user", user("b", "Bob", 40, 2, "x@y"))?;
            Ok(())
        });
        assert!(result.is_err());
        assert!(db.get(&ctx, "user", "a").is_err());
        // no CDC entries either
        let mut entries = 0;
        db.for_each(&ctx, CDC_COLLECTION, &[], |_| {
            entries += 1;
            Ok(true)
        })
        .unwrap();
        assert_eq!(entries, 0);
    }

    // Scenario: index selection.
    #[test]
    fn test_index_selection() {
        let db = test_db();
        let ctx = Context::background();
        db.set(&ctx, "user", user("a", "John", 30, 1, "x@y"))
            .unwrap();

        let page = db
            .query(
                &ctx,
                "user",
                &Query {
                    r#where: vec![eq("contact.email", json!("x@y"))],
                    ..Default::default()
                },
            )
            .unwrap();
        let plan = &page.stats.optimization;
        assert_eq!(plan.matched_fields, vec!["contact.email".to_string()]);
        assert!(!plan.index.primary);

        let page = db
            .query(
                &ctx,
                "user",
                &Query {
                    r#where: vec![Where {
                        field: "name".into(),
                        op: WhereOp::Contains,
                        value: json!("Jo"),
                    }],
                    ..Default::default()
                },
            )
            .unwrap();
        let plan = &page.stats.optimization;
        assert!(plan.matched_fields.is_empty());
        assert!(plan.index.primary);
        assert_eq!(page.count, 1);
    }

    #[test]
    fn test_require_query_index() {
        let db = test_db();
        let ctx = Context::background();
        db.configure_collection(
            r#"
type: object
x-collection: audit
x-require-index: true
x-indexing:
  primary: { name: primary, fields: [_id], primary: true }
  actor: { name: actor, fields: [actor] }
"#,
        )
        .unwrap();
        let err = db
            .query(
                &ctx,
                "audit",
                &Query {
                    r#where: vec![Where {
                        field: "note".into(),
                        op: WhereOp::Contains,
                        value: json!("x"),
                    }],
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::IndexRequired { .. }));
        assert!(db
            .query(
                &ctx,
                "audit",
                &Query {
                    r#where: vec![eq("actor", json!("a"))],
                    ..Default::default()
                },
            )
            .is_ok());
    }

    // Scenario: order-by + pagination.
    #[test]
    fn test_order_by_and_pagination() {
        let db = test_db();
        let ctx = Context::background();
        for i in 0..10u64 {
            db.set(
                &ctx,
                "user",
                user(&format!("u{i}"), &format!("user {i}"), i, 1, &format!("u{i}@test.com")),
            )
            .unwrap();
        }
        for page_number in 0..10usize {
            let page = db
                .query(
                    &ctx,
                    "user",
                    &Query {
                        order_by: vec![OrderBy {
                            field: "age".into(),
                            direction: Direction::Desc,
                        }],
                        limit: 1,
                        page: page_number,
                        ..Default::default()
                    },
                )
                .unwrap();
            assert_eq!(page.count, 1);
            assert_eq!(page.documents[0].get_f64("age"), (9 - page_number) as f64);
            assert_eq!(page.next_page, page_number + 1);
        }
    }

    // Scenario: grouped aggregation.
    #[test]
    fn test_group_by_aggregation() {
        let db = test_db();
        let ctx = Context::background();
        let mut expected: std::collections::BTreeMap<u64, f64> = Default::default();
        for i in 0..10u64 {
            let account = i % 3;
            *expected.entry(account).or_default() += i as f64;
            db.set(
                &ctx,
                "user",
                user(&format!("u{i}"), &format!("user {i}"), i, account, &format!("u{i}@t.c")),
            )
            .unwrap();
        }
        let page = db
            .query(
                &ctx,
                "user",
                &Query {
                    select: vec![
                        Select::field("account_id"),
                        Select {
                            field: "age".into(),
                            alias: Some("age_sum".into()),
                            aggregate: Some(crate::query::Aggregate::Sum),
                        },
                    ],
                    group_by: vec!["account_id".into()],
                    order_by: vec![OrderBy {
                        field: "account_id".into(),
                        direction: Direction::Asc,
                    }],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page.count, expected.len());
        for (row, (account, sum)) in page.documents.iter().zip(expected.iter()) {
            assert_eq!(row.get_f64("account_id"), *account as f64);
            assert_eq!(row.get_f64("age_sum"), *sum);
        }
    }

    // Scenario: CDC range seek.
    #[test]
    fn test_cdc_range_seek() {
        let db = test_db();
        let ctx = Context::background();
        let t0 = Utc::now().timestamp_micros();
        std::thread::sleep(Duration::from_millis(2));
        for i in 0..5u64 {
            db.set(
                &ctx,
                "user",
                user(&format!("u{i}"), &format!("user {i}"), i, 1, &format!("u{i}@t.c")),
            )
            .unwrap();
        }

        let mut timestamps = Vec::new();
        let plan = db
            .for_each(
                &ctx,
                CDC_COLLECTION,
                &[Where {
                    field: "timestamp".into(),
                    op: WhereOp::Gt,
                    value: json!(t0),
                }],
                |doc| {
                    assert_eq!(doc.get_string("collection"), "user");
                    timestamps.push(doc.get_f64("timestamp"));
                    Ok(true)
                },
            )
            .unwrap();
        assert!(timestamps.len() >= 5, "expected >= 5 cdc entries");
        assert!(timestamps.windows(2).all(|w| w[0] <= w[1]), "ascending");
        assert!(!plan.reverse);
        assert_eq!(plan.index.name, "timestamp");

        let mut earlier = 0;
        let plan = db
            .for_each(
                &ctx,
                CDC_COLLECTION,
                &[Where {
                    field: "timestamp".into(),
                    op: WhereOp::Lt,
                    value: json!(t0),
                }],
                |_| {
                    earlier += 1;
                    Ok(true)
                },
            )
            .unwrap();
        assert_eq!(earlier, 0);
        assert!(plan.reverse);
    }

    #[test]
    fn test_cdc_entries_carry_before_and_after() {
        let db = test_db();
        let ctx = Context::background();
        db.set(&ctx, "user", user("a", "Alice", 30, 1, "a@t.c"))
            .unwrap();
        db.delete(&ctx, "user", "a").unwrap();
        let mut entries: Vec<(f64, String)> = Vec::new();
        db.for_each(&ctx, CDC_COLLECTION, &[eq("doc_id", json!("a"))], |doc| {
            entries.push((doc.get_f64("timestamp"), doc.get_string("action")));
            if doc.get_string("action") == "delete" {
                // post-image of a delete is the last-known image
                assert_eq!(doc.get_string("after.name"), "Alice");
            }
            Ok(true)
        })
        .unwrap();
        entries.sort_by(|a, b| a.0.total_cmp(&b.0));
        let actions: Vec<String> = entries.into_iter().map(|(_, action)| action).collect();
        assert_eq!(actions, vec!["set".to_string(), "delete".to_string()]);
    }

    #[test]
    fn test_cdc_collection_rejects_direct_writes() {
        let db = test_db();
        let ctx = Context::background();
        let doc = Document::from_value(json!({"_id": "x"})).unwrap();
        assert!(matches!(
            db.set(&ctx, CDC_COLLECTION, doc),
            Err(Error::Forbidden(_))
        ));
    }

    // Scenario: cascade delete through a persist hook.
    #[test]
    fn test_cascade_delete_via_persist_hook() {
        let db = test_db();
        let ctx = Context::background();
        db.hooks().register_persist_hook(
            "user",
            PersistHook::new("cascade-tasks", true, |_ctx, tx, command| {
                if command.action != Action::Delete {
                    return Ok(());
                }
                let mut task_ids = Vec::new();
                tx.for_each(
                    "task",
                    &[Where {
                        field: "user".into(),
                        op: WhereOp::Eq,
                        value: json!(command.doc_id),
                    }],
                    |task| {
                        task_ids.push(task.get_string("_id"));
                        Ok(true)
                    },
                )?;
                for task_id in task_ids {
                    tx.delete("task", &task_id)?;
                }
                Ok(())
            }),
        );

        db.set(&ctx, "user", user("a", "Alice", 30, 1, "a@t.c"))
            .unwrap();
        for i in 0..3 {
            let task = Document::from_value(json!({
                "_id": format!("t{i}"), "user": "a", "title": format!("task {i}")
            }))
            .unwrap();
            db.set(&ctx, "task", task).unwrap();
        }

        db.delete(&ctx, "user", "a").unwrap();
        assert!(db.get(&ctx, "user", "a").is_err());
        let mut remaining = 0;
        db.for_each(&ctx, "task", &[], |_| {
            remaining += 1;
            Ok(true)
        })
        .unwrap();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_failing_persist_hook_rolls_back_cascade() {
        let db = test_db();
        let ctx = Context::background();
        db.hooks().register_persist_hook(
            "user",
            PersistHook::new("cascade-then-fail", true, |_ctx, tx, command| {
                if command.action != Action::Delete {
                    return Ok(());
                }
                let mut task_ids = Vec::new();
                tx.for_each(
                    "task",
                    &[Where {
                        field: "user".into(),
                        op: WhereOp::Eq,
                        value: json!(command.doc_id),
                    }],
                    |task| {
                        task_ids.push(task.get_string("_id"));
                        Ok(true)
                    },
                )?;
                for task_id in task_ids {
                    tx.delete("task", &task_id)?;
                }
                Err(Error::Internal("hook failed mid-way".to_string()))
            }),
        );

        db.set(&ctx, "user", user("a", "Alice", 30, 1, "a@t.c"))
            .unwrap();
        let task = Document::from_value(json!({"_id": "t0", "user": "a"})).unwrap();
        db.set(&ctx, "task", task).unwrap();

        assert!(db.delete(&ctx, "user", "a").is_err());
        // neither the user nor its tasks were deleted
        assert!(db.get(&ctx, "user", "a").is_ok());
        assert!(db.get(&ctx, "task", "t0").is_ok());
    }

    #[test]
    fn test_where_and_read_hooks() {
        let db = test_db();
        let ctx = Context::background();
        db.hooks().register_where_hook(
            "user",
            crate::hooks::WhereHook::new("tenant-filter", |_ctx, _tx, mut wheres| {
                wheres.push(Where {
                    field: "account_id".into(),
                    op: WhereOp::Eq,
                    value: json!(1),
                });
                Ok(wheres)
            }),
        );
        db.hooks().register_read_hook(
            "user",
            crate::hooks::ReadHook::new("redact-email", |_ctx, _tx, mut doc| {
                doc.del("contact.email");
                Ok(doc)
            }),
        );
        db.set(&ctx, "user", user("a", "Alice", 30, 1, "a@t.c"))
            .unwrap();
        db.set(&ctx, "user", user("b", "Bob", 40, 2, "b@t.c"))
            .unwrap();

        let page = db.query(&ctx, "user", &Query::default()).unwrap();
        assert_eq!(page.count, 1);
        assert_eq!(page.documents[0].get_string("_id"), "a");
        assert_eq!(page.documents[0].get_value("contact.email"), Value::Null);
    }

    #[test]
    fn test_validator_hook_rejects_and_rolls_back() {
        let db = test_db();
        let ctx = Context::background();
        db.hooks().register_validator(
            "user",
            crate::hooks::Validator::new("no-minors", |_ctx, _tx, command| {
                let age = command
                    .after
                    .as_ref()
                    .map(|doc| doc.get_f64("age"))
                    .unwrap_or_default();
                if age < 18.0 {
                    return Err(Error::Validation("age must be >= 18".to_string()));
                }
                Ok(())
            }),
        );
        let err = db
            .set(&ctx, "user", user("kid", "Kid", 9, 1, "kid@t.c"))
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
        assert!(db.get(&ctx, "user", "kid").is_err());
    }

    #[test]
    fn test_change_stream_delivers_committed_commands() {
        let db = test_db();
        let ctx = Context::background();
        let stream = db.change_stream("user");
        db.set(&ctx, "user", user("a", "Alice", 30, 1, "a@t.c"))
            .unwrap();
        db.delete(&ctx, "user", "a").unwrap();

        let first = stream.recv().unwrap();
        assert_eq!(first.action, Action::Set);
        assert_eq!(first.doc_id, "a");
        let second = stream.recv().unwrap();
        assert_eq!(second.action, Action::Delete);
        assert!(second.timestamp >= first.timestamp);
    }

    #[test]
    fn test_rolled_back_commands_are_not_published() {
        let db = test_db();
        let ctx = Context::background();
        let stream = db.change_stream("user");
        let _ = db.tx(&ctx, false, |tx| {
            tx.set("user", user("a", "Alice", 30, 1, "a@t.c"))?;
            Err::<(), Error>(Error::Internal("abort".to_string()))
        });
        std::thread::sleep(Duration::from_millis(20));
        assert!(stream.try_recv().is_none());
    }

    #[test]
    fn test_join_attaches_matches_under_alias() {
        let db = test_db();
        let ctx = Context::background();
        db.set(&ctx, "user", user("a", "Alice", 30, 1, "a@t.c"))
            .unwrap();
        for i in 0..2 {
            let task = Document::from_value(json!({
                "_id": format!("t{i}"), "user": "a", "title": format!("task {i}")
            }))
            .unwrap();
            db.set(&ctx, "task", task).unwrap();
        }
        let page = db
            .query(
                &ctx,
                "user",
                &Query {
                    join: vec![crate::query::Join {
                        collection: "task".into(),
                        on: vec![Where {
                            field: "user".into(),
                            op: WhereOp::Eq,
                            value: json!("$_id"),
                        }],
                        alias: "tasks".into(),
                    }],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page.count, 1);
        let tasks = page.documents[0].get_value("tasks");
        assert_eq!(tasks.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn test_online_index_build() {
        let db = test_db();
        let ctx = Context::background();
        for i in 0..25u64 {
            db.set(
                &ctx,
                "user",
                user(&format!("u{i}"), &format!("user {i}"), i, 1, &format!("u{i}@t.c")),
            )
            .unwrap();
        }
        db.set_index(
            &ctx,
            "user",
            Index {
                name: "age".into(),
                fields: vec!["age".into()],
                unique: false,
                primary: false,
                building: false,
            },
        )
        .unwrap();

        let page = db
            .query(
                &ctx,
                "user",
                &Query {
                    r#where: vec![eq("age", json!(7))],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page.count, 1);
        assert_eq!(page.stats.optimization.index.name, "age");
        assert_eq!(page.stats.optimization.matched_fields, vec!["age".to_string()]);

        // writes keep the new index current
        db.set(&ctx, "user", user("u99", "user 99", 7, 2, "u99@t.c"))
            .unwrap();
        let page = db
            .query(
                &ctx,
                "user",
                &Query {
                    r#where: vec![eq("age", json!(7))],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page.count, 2);

        db.del_index("user", "age").unwrap();
        let page = db
            .query(
                &ctx,
                "user",
                &Query {
                    r#where: vec![eq("age", json!(7))],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page.count, 2);
        assert!(page.stats.optimization.index.primary);
    }

    #[test]
    fn test_canceled_context_aborts() {
        let db = test_db();
        let ctx = Context::background();
        db.set(&ctx, "user", user("a", "Alice", 30, 1, "a@t.c"))
            .unwrap();
        ctx.cancel();
        assert!(matches!(
            db.query(&ctx, "user", &Query::default()),
            Err(Error::Canceled)
        ));
        assert!(matches!(
            db.set(&ctx, "user", user("b", "Bob", 40, 2, "b@t.c")),
            Err(Error::Canceled)
        ));
    }

    #[test]
    fn test_idempotent_set() {
        let db = test_db();
        let ctx = Context::background();
        let doc = user("a", "Alice", 30, 1, "a@t.c");
        db.set(&ctx, "user", doc.clone()).unwrap();
        db.set(&ctx, "user", doc).unwrap();
        let page = db
            .query(
                &ctx,
                "user",
                &Query {
                    r#where: vec![eq("contact.email", json!("a@t.c"))],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page.count, 1);
    }

    #[test]
    fn test_unknown_collection() {
        let db = test_db();
        let ctx = Context::background();
        let err = db.get(&ctx, "nope", "a").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
    }
}
