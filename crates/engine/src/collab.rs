// The bridge between transport lifecycle events and the sync engine.

use std::sync::Arc;

use async_trait::async_trait;
use quillstream_transport::{
    CloseEvent, Connection, LifecycleHooks, Message, TransportError, UpgradeRequest,
};
use tracing::{debug, info, warn};

use crate::registry::DocumentRegistry;

/// Context key holding the document name a connection subscribed to.
const DOC_KEY: &str = "doc";

/// Routes each connection to the document named by its request path and
/// feeds inbound binary frames into the sync protocol. Text frames are
/// ignored; the protocol is binary-only.
pub struct CollabHooks {
    registry: Arc<DocumentRegistry>,
}

impl CollabHooks {
    pub fn new(registry: Arc<DocumentRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    /// Document name from the request path: leading slash and query
    /// string stripped, empty path mapped to "default".
    fn doc_name(request: &UpgradeRequest) -> String {
        let name = request.path().trim_start_matches('/');
        if name.is_empty() {
            "default".to_string()
        } else {
            name.to_string()
        }
    }
}

fn attached_doc_name(conn: &Arc<dyn Connection>) -> Option<String> {
    conn.context().get(DOC_KEY).and_then(|value| value.as_str().map(ToOwned::to_owned))
}

#[async_trait]
impl LifecycleHooks for CollabHooks {
    async fn on_open(&self, conn: &Arc<dyn Connection>) -> Result<(), TransportError> {
        let name = Self::doc_name(conn.request());
        conn.context().insert(DOC_KEY, serde_json::Value::String(name.clone()));
        self.registry
            .attach(&name, Arc::clone(conn))
            .await
            .map_err(TransportError::hook)?;
        info!(doc = %name, conn_id = %conn.id(), "subscriber joined");
        Ok(())
    }

    async fn on_message(
        &self,
        conn: &Arc<dyn Connection>,
        message: Message,
    ) -> Result<(), TransportError> {
        if !message.is_binary() {
            debug!(conn_id = %conn.id(), "ignoring text frame");
            return Ok(());
        }
        let Some(name) = attached_doc_name(conn) else {
            return Err(TransportError::hook("connection has no document attached"));
        };
        let Some(doc) = self.registry.get(&name).await else {
            return Err(TransportError::hook(format!("document '{name}' is not loaded")));
        };
        // Malformed frames surface as an error event; the connection
        // stays open.
        let dead =
            doc.handle_message(conn, message.as_bytes()).await.map_err(TransportError::hook)?;
        for conn_id in dead {
            self.registry.detach(&name, conn_id).await;
        }
        Ok(())
    }

    async fn on_close(
        &self,
        conn: &Arc<dyn Connection>,
        _event: CloseEvent,
    ) -> Result<(), TransportError> {
        if let Some(name) = attached_doc_name(conn) {
            self.registry.detach(&name, conn.id()).await;
            info!(doc = %name, conn_id = %conn.id(), "subscriber left");
        }
        Ok(())
    }

    async fn on_error(&self, conn: &Arc<dyn Connection>, error: &TransportError) {
        warn!(conn_id = %conn.id(), %error, "connection error");
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderMap;
    use quillstream_transport::UpgradeRequest;

    use super::CollabHooks;

    #[test]
    fn doc_name_strips_slash_and_query() {
        let request =
            UpgradeRequest::new("http://localhost/notes/alpha?token=x", HeaderMap::new(), None);
        assert_eq!(CollabHooks::doc_name(&request), "notes/alpha");
    }

    #[test]
    fn bare_path_falls_back_to_default() {
        let request = UpgradeRequest::new("http://localhost/", HeaderMap::new(), None);
        assert_eq!(CollabHooks::doc_name(&request), "default");
    }
}
