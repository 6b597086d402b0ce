use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use http::HeaderMap;
use uuid::Uuid;

use crate::error::TransportError;
use crate::message::Message;

pub type ConnectionId = Uuid;

/// The HTTP request that initiated the WebSocket upgrade, captured once
/// and kept for the connection's lifetime.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    /// Full request URL. Adapters that only see a path reconstruct this
    /// from the `Host` header and forwarded-proto, defaulting to `http`.
    pub url: String,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
}

impl UpgradeRequest {
    pub fn new(url: impl Into<String>, headers: HeaderMap, remote_addr: Option<SocketAddr>) -> Self {
        Self { url: url.into(), headers, remote_addr }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Path component of the url, without scheme/authority or query string.
    pub fn path(&self) -> &str {
        let after_scheme = match self.url.find("://") {
            Some(index) => &self.url[index + 3..],
            None => self.url.as_str(),
        };
        let path = match after_scheme.find('/') {
            Some(index) => &after_scheme[index..],
            None => "/",
        };
        path.split('?').next().unwrap_or("/")
    }
}

/// Per-connection mutable key/value store.
///
/// Created once per connection and shared with every hook invocation, so
/// an `upgrade` hook can stash data (e.g. an authenticated user) that
/// `message`/`close` handlers read back later without closures over the
/// native socket.
#[derive(Debug, Default)]
pub struct ConnectionContext {
    values: Mutex<HashMap<String, serde_json::Value>>,
}

impl ConnectionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.values.lock().expect("context lock should not be poisoned").get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: serde_json::Value) {
        self.values.lock().expect("context lock should not be poisoned").insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<serde_json::Value> {
        self.values.lock().expect("context lock should not be poisoned").remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.lock().expect("context lock should not be poisoned").contains_key(key)
    }
}

/// Connection identity, generated on first access and stable thereafter.
#[derive(Debug, Default)]
pub struct LazyConnectionId {
    id: OnceLock<ConnectionId>,
}

impl LazyConnectionId {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> ConnectionId {
        *self.id.get_or_init(Uuid::new_v4)
    }
}

/// WebSocket-compatible view of a connection, computed eagerly from the
/// stored upgrade request for native sockets that do not expose
/// `protocol`/`extensions`/`url` themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketView {
    pub protocol: Option<String>,
    pub extensions: Option<String>,
    pub url: String,
}

impl SocketView {
    pub fn from_request(request: &UpgradeRequest) -> Self {
        let url = if let Some(rest) = request.url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = request.url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            request.url.clone()
        };

        Self {
            protocol: request.header("sec-websocket-protocol").map(ToOwned::to_owned),
            extensions: request.header("sec-websocket-extensions").map(ToOwned::to_owned),
            url,
        }
    }
}

/// One live peer, independent of the host runtime that accepted it.
///
/// Adapters construct exactly one `Connection` per native socket and
/// reuse it for every event; the adapter keeps exclusive ownership of the
/// native handle and this trait only exposes `send`/`close` side effects.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    fn request(&self) -> &UpgradeRequest;

    fn context(&self) -> &ConnectionContext;

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.request().remote_addr
    }

    fn socket_view(&self) -> SocketView {
        SocketView::from_request(self.request())
    }

    /// Deliver a frame to the peer. Any error means the connection is no
    /// longer usable; callers decide whether to tear it down.
    async fn send(&self, message: Message) -> Result<(), TransportError>;

    /// Graceful teardown with an optional close code and reason.
    async fn close(&self, code: Option<u16>, reason: Option<String>) -> Result<(), TransportError>;

    /// Abrupt teardown. Defaults to a plain `close()` for runtimes without
    /// a harder primitive.
    async fn terminate(&self) {
        let _ = self.close(None, None).await;
    }
}
