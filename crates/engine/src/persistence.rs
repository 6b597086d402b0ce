// Pluggable document persistence.
//
// The engine never decides what "stored" means; it only promises to call
// `bind_state` exactly once per document creation (before the document
// becomes observable) and `write_state` on the final detach and on the
// debounce timer. Both merge under CRDT semantics, so a stale write can
// never destroy newer state that is bound on top of it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::error::EngineError;

/// Durable storage for document state.
#[async_trait]
pub trait DocStorage: Send + Sync {
    /// Merge any previously persisted state into a freshly created doc
    /// and begin tracking it for later writes. Called once per document
    /// creation, before any connection can observe the doc.
    async fn bind_state(&self, doc_name: &str, doc: &Doc) -> Result<(), EngineError>;

    /// Persist the doc's current state. Must be durable before
    /// returning; a no-op implementation is valid.
    async fn write_state(&self, doc_name: &str, doc: &Doc) -> Result<(), EngineError>;
}

/// One-time content bootstrap for documents that start from external
/// data (e.g. a file or database row). Runs after `bind_state`.
#[async_trait]
pub trait ContentLoader: Send + Sync {
    async fn load(&self, doc_name: &str, doc: &Doc) -> Result<(), EngineError>;
}

/// In-memory full-state storage. The reference implementation of the
/// `DocStorage` contract, and the one the tests use.
#[derive(Default)]
pub struct MemoryStorage {
    states: Mutex<HashMap<String, Vec<u8>>>,
    writes: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `write_state` calls served so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn contains(&self, doc_name: &str) -> bool {
        self.states.lock().expect("state lock should not be poisoned").contains_key(doc_name)
    }
}

#[async_trait]
impl DocStorage for MemoryStorage {
    async fn bind_state(&self, doc_name: &str, doc: &Doc) -> Result<(), EngineError> {
        let stored = self
            .states
            .lock()
            .expect("state lock should not be poisoned")
            .get(doc_name)
            .cloned();
        if let Some(bytes) = stored {
            let update = Update::decode_v1(&bytes)
                .map_err(|error| EngineError::storage(doc_name, error))?;
            doc.transact_mut()
                .apply_update(update)
                .map_err(|error| EngineError::storage(doc_name, error))?;
        }
        Ok(())
    }

    async fn write_state(&self, doc_name: &str, doc: &Doc) -> Result<(), EngineError> {
        let state = doc.transact().encode_diff_v1(&StateVector::default());
        self.states
            .lock()
            .expect("state lock should not be poisoned")
            .insert(doc_name.to_string(), state);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use yrs::{Doc, GetString, Text, Transact};

    use super::{DocStorage, MemoryStorage};

    fn doc_with_text(content: &str) -> Doc {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("content");
        text.insert(&mut doc.transact_mut(), 0, content);
        doc
    }

    #[tokio::test]
    async fn written_state_is_restored_on_bind() {
        let storage = MemoryStorage::new();
        let doc = doc_with_text("hello");
        storage.write_state("notes", &doc).await.expect("write should succeed");
        assert!(storage.contains("notes"));
        assert_eq!(storage.write_count(), 1);

        let restored = Doc::new();
        storage.bind_state("notes", &restored).await.expect("bind should succeed");
        let text = restored.get_or_insert_text("content");
        assert_eq!(text.get_string(&restored.transact()), "hello");
    }

    #[tokio::test]
    async fn bind_of_unknown_doc_is_a_noop() {
        let storage = MemoryStorage::new();
        let doc = Doc::new();
        storage.bind_state("missing", &doc).await.expect("bind should succeed");
        assert!(!storage.contains("missing"));
    }
}
