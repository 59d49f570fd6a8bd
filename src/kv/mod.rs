pub mod memory;

use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;

/// Options for creating an iterator over an ordered keyspace.
///
/// Forward iteration yields keys matching `prefix` in ascending order,
/// starting at `seek` when one is given. Reverse iteration yields matching
/// keys in descending order, starting at the largest key `<= seek` (or the
/// last key under the prefix when `seek` is empty).
#[derive(Debug, Clone, Default)]
pub struct IterOpts {
    pub prefix: Vec<u8>,
    pub seek: Vec<u8>,
    pub reverse: bool,
}

/// A key-value transaction. Iterators are only valid while the transaction
/// is held.
pub trait KvTx {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&mut self, key: &[u8]) -> Result<()>;
    fn iter<'a>(&'a self, opts: IterOpts) -> Result<Box<dyn KvIter + 'a>>;
}

/// A cursor over an ordered range of keys. `key` and `value` may only be
/// called while `valid` returns true; dropping the iterator closes it.
pub trait KvIter {
    fn valid(&self) -> bool;
    fn key(&self) -> &[u8];
    fn value(&self) -> Result<Vec<u8>>;
    fn next(&mut self);
}

/// A bulk writer for internal mutations where atomicity beyond the batch is
/// not required.
pub trait KvBatch {
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&mut self, key: &[u8]) -> Result<()>;
    fn flush(self: Box<Self>) -> Result<()>;
}

/// An ordered byte-key store with transactional access.
pub trait KvDriver: Send + Sync {
    /// Run `f` against a transaction; commit on `Ok`, roll back on error.
    /// Write transactions are serialized; read transactions run concurrently
    /// against a point-in-time snapshot.
    fn tx(&self, read_only: bool, f: &mut dyn FnMut(&mut dyn KvTx) -> Result<()>) -> Result<()>;
    fn batch(&self) -> Box<dyn KvBatch + '_>;
    fn close(&self) -> Result<()>;
}

/// The smallest key strictly greater than every key with the given prefix,
/// or `None` when no such key exists (empty or all-0xff prefix). Reverse
/// scans use it as their upper seek bound.
pub fn prefix_next(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut next = prefix.to_vec();
    while let Some(last) = next.last_mut() {
        if *last == 0xff {
            next.pop();
        } else {
            *last += 1;
            return Some(next);
        }
    }
    None
}

pub type DriverFactory = Box<dyn Fn(&Value) -> Result<Box<dyn KvDriver>> + Send + Sync>;

/// An explicit factory table mapping driver names to constructors. Passed
/// into database construction; there is no process-wide registry.
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        let mut registry = DriverRegistry {
            factories: HashMap::new(),
        };
        registry.register("memory", Box::new(|_params| {
            Ok(Box::new(memory::MemoryDriver::new()) as Box<dyn KvDriver>)
        }));
        registry
    }
}

impl DriverRegistry {
    /// A registry with the built-in `memory` driver.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty registry for callers that supply every driver themselves.
    pub fn empty() -> Self {
        DriverRegistry {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, factory: DriverFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Construct the named driver with an untyped parameter map.
    pub fn open(&self, name: &str, params: &Value) -> Result<Box<dyn KvDriver>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            Error::Validation(format!("unknown kv driver: {name}"))
        })?;
        factory(params)
    }
}
