// Process-scoped document registry.
//
// There is deliberately no global map; the registry is constructed by
// the embedding application and injected wherever documents are needed,
// so two registries in one process never share state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use quillstream_transport::{Connection, ConnectionId};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::error::EngineError;
use crate::persistence::{ContentLoader, DocStorage};
use crate::protocol;
use crate::shared_doc::SharedDoc;

const DEFAULT_PERSIST_DEBOUNCE: Duration = Duration::from_secs(2);

pub struct DocumentRegistry {
    docs: RwLock<HashMap<String, Arc<SharedDoc>>>,
    storage: Option<Arc<dyn DocStorage>>,
    loader: Option<Arc<dyn ContentLoader>>,
    evict_when_idle: bool,
    persist_debounce: Duration,
}

impl Default for DocumentRegistry {
    fn default() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            storage: None,
            loader: None,
            evict_when_idle: false,
            persist_debounce: DEFAULT_PERSIST_DEBOUNCE,
        }
    }
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_storage(mut self, storage: Arc<dyn DocStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn ContentLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Evict idle documents even without storage configured. Off by
    /// default: an unpersisted doc that is evicted loses its state, so
    /// retention is the safer baseline.
    pub fn evict_when_idle(mut self, evict: bool) -> Self {
        self.evict_when_idle = evict;
        self
    }

    /// How long after the last update before `write_state` runs.
    pub fn persist_debounce(mut self, debounce: Duration) -> Self {
        self.persist_debounce = debounce;
        self
    }

    /// Get the live document for `name`, creating it on first access.
    pub async fn get_or_create(self: &Arc<Self>, name: &str) -> Result<Arc<SharedDoc>, EngineError> {
        let mut docs = self.docs.write().await;
        self.open_locked(&mut docs, name).await
    }

    /// Shared slow path for `get_or_create` and `attach`. The caller
    /// holds the registry lock across `bind_state` and the content
    /// load, which guarantees at most one `SharedDoc` per name even
    /// when many connections race on first subscription, and that no
    /// connection can observe the doc before its persisted state is
    /// merged in.
    async fn open_locked(
        self: &Arc<Self>,
        docs: &mut HashMap<String, Arc<SharedDoc>>,
        name: &str,
    ) -> Result<Arc<SharedDoc>, EngineError> {
        if let Some(doc) = docs.get(name) {
            return Ok(Arc::clone(doc));
        }

        let (doc, updates) = SharedDoc::new(name);
        if let Some(storage) = &self.storage {
            storage.bind_state(name, doc.doc()).await?;
        }
        if let Some(loader) = &self.loader {
            loader.load(name, doc.doc()).await?;
        }
        self.spawn_fanout(&doc, updates);

        info!(doc = %name, "document loaded");
        docs.insert(name.to_string(), Arc::clone(&doc));
        Ok(doc)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<SharedDoc>> {
        self.docs.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.docs.read().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    /// Subscribe a connection to a document, creating it if needed.
    /// Registration happens under the registry lock so it cannot
    /// interleave with an idle-eviction check for the same name.
    pub async fn attach(
        self: &Arc<Self>,
        name: &str,
        conn: Arc<dyn Connection>,
    ) -> Result<Arc<SharedDoc>, EngineError> {
        let mut docs = self.docs.write().await;
        let doc = self.open_locked(&mut docs, name).await?;
        doc.add_connection(conn).await?;
        Ok(doc)
    }

    /// Unsubscribe a connection. On the last detach the document is
    /// persisted (when storage is configured) and evicted. Peers that
    /// could not be reached by the awareness removal broadcast are
    /// detached in turn.
    pub async fn detach(&self, name: &str, conn_id: ConnectionId) {
        let mut pending = vec![conn_id];
        while let Some(conn_id) = pending.pop() {
            let Some(doc) = self.get(name).await else { return };
            let (remaining, dead) = doc.remove_connection(conn_id).await;
            pending.extend(dead);
            if remaining == 0 {
                self.handle_idle(name, &doc).await;
            }
        }
    }

    pub async fn evict(&self, name: &str) {
        if self.docs.write().await.remove(name).is_some() {
            info!(doc = %name, "document evicted");
        }
    }

    async fn handle_idle(&self, name: &str, doc: &Arc<SharedDoc>) {
        if let Some(storage) = &self.storage {
            // Evicted either way; a failed write is the storage
            // implementation's problem to retry on the next load.
            if let Err(error) = storage.write_state(name, doc.doc()).await {
                error!(doc = %name, %error, "failed to persist document before eviction");
            }
        } else if !self.evict_when_idle {
            return;
        }

        // A subscriber may have arrived while `write_state` ran.
        // Eviction only proceeds if the entry is still this doc and
        // still idle, checked under the lock `attach` registers through.
        let mut docs = self.docs.write().await;
        let still_idle = doc.connection_count().await == 0;
        match docs.get(name) {
            Some(current) if Arc::ptr_eq(current, doc) && still_idle => {
                docs.remove(name);
                info!(doc = %name, "document evicted");
            }
            _ => debug!(doc = %name, "eviction skipped, document is in use again"),
        }
    }

    /// One task per document: drains the update channel, broadcasts each
    /// update to all attached connections, and debounces `write_state`.
    /// Holds only weak references so an evicted document can actually
    /// drop, which closes the channel and ends the task.
    fn spawn_fanout(self: &Arc<Self>, doc: &Arc<SharedDoc>, mut updates: mpsc::UnboundedReceiver<Vec<u8>>) {
        let registry = Arc::downgrade(self);
        let doc_ref = Arc::downgrade(doc);
        let name = doc.name().to_string();
        let storage = self.storage.clone();
        let debounce = self.persist_debounce;

        tokio::spawn(async move {
            let mut flush_at: Option<Instant> = None;
            loop {
                let update = match flush_at {
                    Some(at) => tokio::select! {
                        update = updates.recv() => update,
                        _ = tokio::time::sleep_until(at) => {
                            flush_at = None;
                            if let (Some(storage), Some(doc)) = (storage.as_ref(), doc_ref.upgrade()) {
                                if let Err(error) = storage.write_state(&name, doc.doc()).await {
                                    error!(doc = %name, %error, "debounced persist failed");
                                }
                            }
                            continue;
                        }
                    },
                    None => updates.recv().await,
                };

                let Some(update) = update else { break };
                let Some(doc) = doc_ref.upgrade() else { break };

                let dead = doc.broadcast(protocol::encode_sync_update(update)).await;
                drop(doc);
                if !dead.is_empty() {
                    if let Some(registry) = registry.upgrade() {
                        for conn_id in dead {
                            registry.detach(&name, conn_id).await;
                        }
                    }
                }

                if storage.is_some() {
                    flush_at = Some(Instant::now() + debounce);
                }
            }
        });
    }
}
