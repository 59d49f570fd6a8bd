use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Ambient context threaded through every operation: cancellation, caller
/// metadata (attached to commands), and internal engine flags.
///
/// Cloning yields a handle to the same cancellation token, so a context
/// handed to a long-running query can be canceled from another thread.
#[derive(Debug, Clone, Default)]
pub struct Context {
    canceled: Arc<AtomicBool>,
    metadata: Arc<Map<String, Value>>,
    indexing: bool,
}

impl Context {
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_metadata(metadata: Map<String, Value>) -> Self {
        Context {
            canceled: Arc::new(AtomicBool::new(false)),
            metadata: Arc::new(metadata),
            indexing: false,
        }
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Cancel every operation holding a clone of this context.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Returns `Error::Canceled` once the context is canceled. Iterators and
    /// loops call this at every step.
    pub fn check(&self) -> crate::error::Result<()> {
        if self.is_canceled() {
            Err(crate::error::Error::Canceled)
        } else {
            Ok(())
        }
    }

    /// Derive a context flagged for index backfill. The index manager only
    /// maintains secondary indexes under this flag.
    pub(crate) fn with_indexing(&self) -> Self {
        let mut ctx = self.clone();
        ctx.indexing = true;
        ctx
    }

    pub(crate) fn is_indexing(&self) -> bool {
        self.indexing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_propagates_to_clones() {
        let ctx = Context::background();
        let clone = ctx.clone();
        assert!(clone.check().is_ok());
        ctx.cancel();
        assert!(clone.is_canceled());
        assert!(clone.check().is_err());
    }

    #[test]
    fn test_indexing_flag_is_derived() {
        let ctx = Context::background();
        assert!(!ctx.is_indexing());
        let indexing = ctx.with_indexing();
        assert!(indexing.is_indexing());
        assert!(!ctx.is_indexing());
    }
}
