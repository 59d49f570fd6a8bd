use crate::command::Command;
use crate::context::Context;
use crate::db::Tx;
use crate::document::Document;
use crate::error::Result;
use crate::query::Where;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

type ValidatorFn = dyn Fn(&Context, &mut Tx, &Command) -> Result<()> + Send + Sync;
type WhereFn = dyn Fn(&Context, &Tx, Vec<Where>) -> Result<Vec<Where>> + Send + Sync;
type ReadFn = dyn Fn(&Context, &Tx, Document) -> Result<Document> + Send + Sync;
type PersistFn = dyn Fn(&Context, &mut Tx, &Command) -> Result<()> + Send + Sync;

/// Rejects a command before it persists; an error rolls the transaction back.
pub struct Validator {
    pub name: String,
    func: Box<ValidatorFn>,
}

impl Validator {
    pub fn new(
        name: &str,
        func: impl Fn(&Context, &mut Tx, &Command) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Validator {
            name: name.to_string(),
            func: Box::new(func),
        }
    }
}

/// Rewrites the where-clause list before query planning (soft-delete,
/// tenancy).
pub struct WhereHook {
    pub name: String,
    func: Box<WhereFn>,
}

impl WhereHook {
    pub fn new(
        name: &str,
        func: impl Fn(&Context, &Tx, Vec<Where>) -> Result<Vec<Where>> + Send + Sync + 'static,
    ) -> Self {
        WhereHook {
            name: name.to_string(),
            func: Box::new(func),
        }
    }
}

/// Transforms documents as the executor emits them.
pub struct ReadHook {
    pub name: String,
    func: Box<ReadFn>,
}

impl ReadHook {
    pub fn new(
        name: &str,
        func: impl Fn(&Context, &Tx, Document) -> Result<Document> + Send + Sync + 'static,
    ) -> Self {
        ReadHook {
            name: name.to_string(),
            func: Box::new(func),
        }
    }
}

/// Side-effect hook around writes (cascades, audit). Receives the in-flight
/// transaction and may issue further reads and writes.
pub struct PersistHook {
    pub name: String,
    pub before: bool,
    func: Box<PersistFn>,
}

impl PersistHook {
    pub fn new(
        name: &str,
        before: bool,
        func: impl Fn(&Context, &mut Tx, &Command) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        PersistHook {
            name: name.to_string(),
            before,
            func: Box::new(func),
        }
    }
}

/// Per-collection hook registries. Handlers run in registration order; each
/// registry is snapshotted before invocation so hooks may themselves reach
/// back into the database.
#[derive(Default)]
pub struct HookRegistry {
    validators: RwLock<HashMap<String, Vec<Arc<Validator>>>>,
    where_hooks: RwLock<HashMap<String, Vec<Arc<WhereHook>>>>,
    read_hooks: RwLock<HashMap<String, Vec<Arc<ReadHook>>>>,
    persist_hooks: RwLock<HashMap<String, Vec<Arc<PersistHook>>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_validator(&self, collection: &str, hook: Validator) {
        self.validators
            .write()
            .entry(collection.to_string())
            .or_default()
            .push(Arc::new(hook));
    }

    pub fn register_where_hook(&self, collection: &str, hook: WhereHook) {
        self.where_hooks
            .write()
            .entry(collection.to_string())
            .or_default()
            .push(Arc::new(hook));
    }

    pub fn register_read_hook(&self, collection: &str, hook: ReadHook) {
        self.read_hooks
            .write()
            .entry(collection.to_string())
            .or_default()
            .push(Arc::new(hook));
    }

    pub fn register_persist_hook(&self, collection: &str, hook: PersistHook) {
        self.persist_hooks
            .write()
            .entry(collection.to_string())
            .or_default()
            .push(Arc::new(hook));
    }

    pub(crate) fn apply_validators(
        &self,
        ctx: &Context,
        tx: &mut Tx,
        command: &Command,
    ) -> Result<()> {
        let hooks = snapshot(&self.validators, &command.collection);
        for hook in hooks {
            (hook.func)(ctx, tx, command)?;
        }
        Ok(())
    }

    pub(crate) fn apply_where_hooks(
        &self,
        ctx: &Context,
        tx: &Tx,
        collection: &str,
        mut wheres: Vec<Where>,
    ) -> Result<Vec<Where>> {
        let hooks = snapshot(&self.where_hooks, collection);
        for hook in hooks {
            wheres = (hook.func)(ctx, tx, wheres)?;
        }
        Ok(wheres)
    }

    pub(crate) fn apply_read_hooks(
        &self,
        ctx: &Context,
        tx: &Tx,
        collection: &str,
        mut doc: Document,
    ) -> Result<Document> {
        let hooks = snapshot(&self.read_hooks, collection);
        for hook in hooks {
            doc = (hook.func)(ctx, tx, doc)?;
        }
        Ok(doc)
    }

    pub(crate) fn apply_persist_hooks(
        &self,
        ctx: &Context,
        tx: &mut Tx,
        command: &Command,
        before: bool,
    ) -> Result<()> {
        let hooks = snapshot(&self.persist_hooks, &command.collection);
        for hook in hooks {
            if hook.before == before {
                (hook.func)(ctx, tx, command)?;
            }
        }
        Ok(())
    }
}

fn snapshot<T>(registry: &RwLock<HashMap<String, Vec<Arc<T>>>>, collection: &str) -> Vec<Arc<T>> {
    registry
        .read()
        .get(collection)
        .map(|hooks| hooks.to_vec())
        .unwrap_or_default()
}
