use crate::error::{Error, Result};
use crate::kv::{prefix_next, IterOpts, KvBatch, KvDriver, KvIter, KvTx};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;

type Entries = BTreeMap<Vec<u8>, Vec<u8>>;
type Overlay = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// Ordered in-memory store. Readers share a snapshot under a read lock;
/// writers serialize on the write lock and stage mutations in a tombstone
/// overlay that merges on commit and is discarded on error.
pub struct MemoryDriver {
    entries: RwLock<Entries>,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        MemoryDriver {
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl KvDriver for MemoryDriver {
    fn tx(&self, read_only: bool, f: &mut dyn FnMut(&mut dyn KvTx) -> Result<()>) -> Result<()> {
        if read_only {
            let guard = self.entries.read();
            let mut tx = MemoryTx {
                base: &guard,
                overlay: None,
            };
            return f(&mut tx);
        }
        let mut guard = self.entries.write();
        let mut tx = MemoryTx {
            base: &guard,
            overlay: Some(Overlay::new()),
        };
        f(&mut tx)?;
        let overlay = tx.overlay.take().unwrap_or_default();
        for (key, entry) in overlay {
            match entry {
                Some(value) => {
                    guard.insert(key, value);
                }
                None => {
                    guard.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn batch(&self) -> Box<dyn KvBatch + '_> {
        Box::new(MemoryBatch {
            driver: self,
            pending: Vec::new(),
        })
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryTx<'a> {
    base: &'a Entries,
    /// `None` marks a read-only transaction; tombstones are `None` values.
    overlay: Option<Overlay>,
}

impl KvTx for MemoryTx<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(overlay) = &self.overlay {
            if let Some(entry) = overlay.get(key) {
                return Ok(entry.clone());
            }
        }
        Ok(self.base.get(key).cloned())
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        match &mut self.overlay {
            Some(overlay) => {
                overlay.insert(key.to_vec(), Some(value.to_vec()));
                Ok(())
            }
            None => Err(Error::Internal(
                "set on a read-only transaction".to_string(),
            )),
        }
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        match &mut self.overlay {
            Some(overlay) => {
                overlay.insert(key.to_vec(), None);
                Ok(())
            }
            None => Err(Error::Internal(
                "delete on a read-only transaction".to_string(),
            )),
        }
    }

    fn iter<'a>(&'a self, opts: IterOpts) -> Result<Box<dyn KvIter + 'a>> {
        let lower = Bound::Included(opts.prefix.clone());
        let upper = match prefix_next(&opts.prefix) {
            Some(next) => Bound::Excluded(next),
            None => Bound::Unbounded,
        };
        let range = (lower, upper);

        let mut merged: Entries = self
            .base
            .range(range.clone())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(overlay) = &self.overlay {
            for (key, entry) in overlay.range(range) {
                match entry {
                    Some(value) => {
                        merged.insert(key.clone(), value.clone());
                    }
                    None => {
                        merged.remove(key);
                    }
                }
            }
        }

        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = merged.into_iter().collect();
        if opts.reverse {
            if !opts.seek.is_empty() {
                entries.retain(|(key, _)| key.as_slice() <= opts.seek.as_slice());
            }
            entries.reverse();
        } else if !opts.seek.is_empty() {
            entries.retain(|(key, _)| key.as_slice() >= opts.seek.as_slice());
        }
        Ok(Box::new(MemoryIter { entries, position: 0 }))
    }
}

struct MemoryIter {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    position: usize,
}

impl KvIter for MemoryIter {
    fn valid(&self) -> bool {
        self.position < self.entries.len()
    }

    fn key(&self) -> &[u8] {
        &self.entries[self.position].0
    }

    fn value(&self) -> Result<Vec<u8>> {
        Ok(self.entries[self.position].1.clone())
    }

    fn next(&mut self) {
        self.position += 1;
    }
}

struct MemoryBatch<'a> {
    driver: &'a MemoryDriver,
    pending: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl KvBatch for MemoryBatch<'_> {
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.pending.push((key.to_vec(), Some(value.to_vec())));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.pending.push((key.to_vec(), None));
        Ok(())
    }

    fn flush(self: Box<Self>) -> Result<()> {
        let mut guard = self.driver.entries.write();
        for (key, entry) in self.pending {
            match entry {
                Some(value) => {
                    guard.insert(key, value);
                }
                None => {
                    guard.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> MemoryDriver {
        let driver = MemoryDriver::new();
        driver
            .tx(false, &mut |tx| {
                for (k, v) in [("a/1", "1"), ("a/2", "2"), ("a/3", "3"), ("b/1", "9")] {
                    tx.set(k.as_bytes(), v.as_bytes())?;
                }
                Ok(())
            })
            .unwrap();
        driver
    }

    fn collect_keys(tx: &dyn KvTx, opts: IterOpts) -> Vec<String> {
        let mut keys = Vec::new();
        let mut it = tx.iter(opts).unwrap();
        while it.valid() {
            keys.push(String::from_utf8(it.key().to_vec()).unwrap());
            it.next();
        }
        keys
    }

    #[test]
    fn test_get_set_delete() {
        let driver = seeded();
        driver
            .tx(false, &mut |tx| {
                assert_eq!(tx.get(b"a/1")?, Some(b"1".to_vec()));
                tx.delete(b"a/1")?;
                // read-your-writes inside the transaction
                assert_eq!(tx.get(b"a/1")?, None);
                Ok(())
            })
            .unwrap();
        driver
            .tx(true, &mut |tx| {
                assert_eq!(tx.get(b"a/1")?, None);
                assert_eq!(tx.get(b"a/2")?, Some(b"2".to_vec()));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_rollback_on_error() {
        let driver = seeded();
        let result = driver.tx(false, &mut |tx| {
            tx.set(b"a/9", b"9")?;
            Err(Error::Internal("boom".to_string()))
        });
        assert!(result.is_err());
        driver
            .tx(true, &mut |tx| {
                assert_eq!(tx.get(b"a/9")?, None);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let driver = seeded();
        let result = driver.tx(true, &mut |tx| tx.set(b"x", b"y"));
        assert!(result.is_err());
    }

    #[test]
    fn test_prefix_iteration() {
        let driver = seeded();
        driver
            .tx(true, &mut |tx| {
                let keys = collect_keys(tx, IterOpts {
                    prefix: b"a/".to_vec(),
                    ..Default::default()
                });
                assert_eq!(keys, vec!["a/1", "a/2", "a/3"]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_seek_and_reverse() {
        let driver = seeded();
        driver
            .tx(true, &mut |tx| {
                let keys = collect_keys(tx, IterOpts {
                    prefix: b"a/".to_vec(),
                    seek: b"a/2".to_vec(),
                    reverse: false,
                });
                assert_eq!(keys, vec!["a/2", "a/3"]);

                let keys = collect_keys(tx, IterOpts {
                    prefix: b"a/".to_vec(),
                    seek: Vec::new(),
                    reverse: true,
                });
                assert_eq!(keys, vec!["a/3", "a/2", "a/1"]);

                let keys = collect_keys(tx, IterOpts {
                    prefix: b"a/".to_vec(),
                    seek: b"a/2".to_vec(),
                    reverse: true,
                });
                assert_eq!(keys, vec!["a/2", "a/1"]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_iterator_sees_overlay() {
        let driver = seeded();
        driver
            .tx(false, &mut |tx| {
                tx.set(b"a/0", b"0")?;
                tx.delete(b"a/2")?;
                let keys = collect_keys(tx, IterOpts {
                    prefix: b"a/".to_vec(),
                    ..Default::default()
                });
                assert_eq!(keys, vec!["a/0", "a/1", "a/3"]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_batch_flush() {
        let driver = seeded();
        let mut batch = driver.batch();
        batch.set(b"c/1", b"7").unwrap();
        batch.delete(b"b/1").unwrap();
        batch.flush().unwrap();
        driver
            .tx(true, &mut |tx| {
                assert_eq!(tx.get(b"c/1")?, Some(b"7".to_vec()));
                assert_eq!(tx.get(b"b/1")?, None);
                Ok(())
            })
            .unwrap();
    }

}
