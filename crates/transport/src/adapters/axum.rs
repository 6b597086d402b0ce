// Fetch-style adapter for axum.
//
// The upgrade handler returns a `Response` (101 on success, the hook's
// rejection verbatim otherwise); message/close/error handling is attached
// in the task axum spawns once the protocol switch completes.

use std::net::SocketAddr;
use std::sync::Arc;

use ::axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use ::axum::http::{HeaderMap, StatusCode, Uri};
use ::axum::response::{IntoResponse, Response};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream, StreamExt};
use futures_util::SinkExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::connection::{
    Connection, ConnectionContext, ConnectionId, LazyConnectionId, UpgradeRequest,
};
use crate::error::TransportError;
use crate::hooks::{CloseEvent, HookDispatcher, RejectResponse, UpgradeOutcome};
use crate::message::Message;

/// Build an `UpgradeRequest` from the pieces an axum handler extracts.
///
/// The request URL is reconstructed from the `Host` header and
/// forwarded-proto when the URI carries only a path.
pub fn upgrade_request_from_parts(
    uri: &Uri,
    headers: &HeaderMap,
    remote_addr: Option<SocketAddr>,
) -> UpgradeRequest {
    let url = if uri.scheme().is_some() {
        uri.to_string()
    } else {
        let scheme = headers
            .get("x-forwarded-proto")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("http");
        let host = headers
            .get("host")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("localhost");
        format!("{scheme}://{host}{uri}")
    };
    UpgradeRequest::new(url, headers.clone(), remote_addr)
}

pub struct AxumAdapter {
    hooks: Arc<HookDispatcher>,
}

impl AxumAdapter {
    pub fn new(hooks: Arc<HookDispatcher>) -> Self {
        Self { hooks }
    }

    /// Resolve the upgrade hook and either return the rejection response
    /// or complete the handshake and start relaying events.
    pub async fn handle_upgrade(&self, ws: WebSocketUpgrade, request: UpgradeRequest) -> Response {
        let context = ConnectionContext::new();

        match self.hooks.upgrade(&request, &context).await {
            Err(error) => {
                warn!(url = %request.url, %error, "upgrade hook failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
            Ok(UpgradeOutcome::Reject(rejection)) => reject_response(rejection),
            Ok(UpgradeOutcome::Accept { headers }) => {
                let hooks = Arc::clone(&self.hooks);
                let mut response = ws.on_upgrade(move |socket| async move {
                    drive_socket(hooks, request, context, socket).await;
                });
                response.headers_mut().extend(headers);
                response
            }
        }
    }
}

fn reject_response(rejection: RejectResponse) -> Response {
    let status =
        StatusCode::from_u16(rejection.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, rejection.body.unwrap_or_default()).into_response();
    response.headers_mut().extend(rejection.headers);
    response
}

struct AxumConnection {
    id: LazyConnectionId,
    request: UpgradeRequest,
    context: ConnectionContext,
    sink: Mutex<SplitSink<WebSocket, WsMessage>>,
}

#[async_trait]
impl Connection for AxumConnection {
    fn id(&self) -> ConnectionId {
        self.id.get()
    }

    fn request(&self) -> &UpgradeRequest {
        &self.request
    }

    fn context(&self) -> &ConnectionContext {
        &self.context
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        let frame = match message.into_payload() {
            crate::message::Payload::Text(text) => WsMessage::Text(text.into()),
            crate::message::Payload::Binary(bytes) => WsMessage::Binary(bytes.into()),
        };
        self.sink.lock().await.send(frame).await.map_err(TransportError::socket)
    }

    async fn close(&self, code: Option<u16>, reason: Option<String>) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: code.unwrap_or(close_code::NORMAL),
            reason: reason.unwrap_or_default().into(),
        };
        self.sink
            .lock()
            .await
            .send(WsMessage::Close(Some(frame)))
            .await
            .map_err(TransportError::socket)
    }
}

async fn drive_socket(
    hooks: Arc<HookDispatcher>,
    request: UpgradeRequest,
    context: ConnectionContext,
    socket: WebSocket,
) {
    let (sink, stream) = socket.split();
    let connection: Arc<dyn Connection> = Arc::new(AxumConnection {
        id: LazyConnectionId::new(),
        request,
        context,
        sink: Mutex::new(sink),
    });

    if let Err(error) = hooks.open(&connection).await {
        warn!(conn_id = %connection.id(), %error, "open hook failed, closing connection");
        let _ = connection.close(None, None).await;
        let _ = hooks.close(&connection, CloseEvent::default()).await;
        return;
    }

    let close_event = relay_frames(&hooks, &connection, stream).await;

    if let Err(error) = hooks.close(&connection, close_event).await {
        warn!(conn_id = %connection.id(), %error, "close hook failed");
    }
}

async fn relay_frames(
    hooks: &HookDispatcher,
    connection: &Arc<dyn Connection>,
    mut stream: SplitStream<WebSocket>,
) -> CloseEvent {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                dispatch_message(hooks, connection, Message::text(text.to_string())).await;
            }
            Ok(WsMessage::Binary(bytes)) => {
                dispatch_message(hooks, connection, Message::binary(bytes.to_vec())).await;
            }
            // axum answers pings itself.
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
            Ok(WsMessage::Close(frame)) => {
                return frame
                    .map(|frame| CloseEvent {
                        code: Some(frame.code),
                        reason: Some(frame.reason.to_string()),
                    })
                    .unwrap_or_default();
            }
            Err(error) => {
                let error = TransportError::socket(error);
                hooks.error(connection, &error).await;
                break;
            }
        }
    }
    CloseEvent::default()
}

async fn dispatch_message(
    hooks: &HookDispatcher,
    connection: &Arc<dyn Connection>,
    message: Message,
) {
    if let Err(error) = hooks.message(connection, message).await {
        debug!(conn_id = %connection.id(), %error, "message hook failed");
        hooks.error(connection, &error).await;
    }
}

// The upgrade path needs a real HTTP connection: `WebSocketUpgrade`
// only extracts when hyper has armed the request for a protocol switch,
// so the tests below bind a loopback listener and drive a client
// through it.
#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use ::axum::extract::ws::WebSocketUpgrade;
    use ::axum::http::{HeaderMap, Uri};
    use ::axum::routing::any;
    use ::axum::Router;
    use async_trait::async_trait;
    use futures_util::SinkExt;
    use http::header::HeaderValue;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::{Error as TtError, Message as TtMessage};

    use super::{upgrade_request_from_parts, AxumAdapter};
    use crate::connection::{Connection, ConnectionContext, UpgradeRequest};
    use crate::error::TransportError;
    use crate::hooks::{
        CloseEvent, HookDispatcher, LifecycleHooks, RejectResponse, UpgradeOutcome,
    };
    use crate::message::Message;

    #[derive(Default)]
    struct RecordingHooks {
        events: Mutex<Vec<String>>,
    }

    impl RecordingHooks {
        fn events(&self) -> Vec<String> {
            self.events.lock().expect("event lock should not be poisoned").clone()
        }

        fn push(&self, event: impl Into<String>) {
            self.events.lock().expect("event lock should not be poisoned").push(event.into());
        }
    }

    #[async_trait]
    impl LifecycleHooks for RecordingHooks {
        async fn on_upgrade(
            &self,
            _request: &UpgradeRequest,
            _context: &ConnectionContext,
        ) -> Result<UpgradeOutcome, TransportError> {
            let mut headers = HeaderMap::new();
            headers.insert("x-doc-server", HeaderValue::from_static("quillstream"));
            Ok(UpgradeOutcome::accept_with_headers(headers))
        }

        async fn on_open(&self, connection: &Arc<dyn Connection>) -> Result<(), TransportError> {
            self.push(format!("open {}", connection.request().path()));
            Ok(())
        }

        async fn on_message(
            &self,
            _connection: &Arc<dyn Connection>,
            message: Message,
        ) -> Result<(), TransportError> {
            self.push(format!("message {} bytes", message.as_bytes().len()));
            Ok(())
        }

        async fn on_close(
            &self,
            _connection: &Arc<dyn Connection>,
            _event: CloseEvent,
        ) -> Result<(), TransportError> {
            self.push("close");
            Ok(())
        }
    }

    #[derive(Default)]
    struct RejectingHooks {
        events: Mutex<Vec<String>>,
    }

    impl RejectingHooks {
        fn events(&self) -> Vec<String> {
            self.events.lock().expect("event lock should not be poisoned").clone()
        }
    }

    #[async_trait]
    impl LifecycleHooks for RejectingHooks {
        async fn on_upgrade(
            &self,
            _request: &UpgradeRequest,
            _context: &ConnectionContext,
        ) -> Result<UpgradeOutcome, TransportError> {
            Ok(UpgradeOutcome::Reject(RejectResponse::new(403).with_body("denied")))
        }

        async fn on_open(&self, _connection: &Arc<dyn Connection>) -> Result<(), TransportError> {
            self.events.lock().expect("event lock should not be poisoned").push("open".into());
            Ok(())
        }

        async fn on_message(
            &self,
            _connection: &Arc<dyn Connection>,
            _message: Message,
        ) -> Result<(), TransportError> {
            self.events.lock().expect("event lock should not be poisoned").push("message".into());
            Ok(())
        }

        async fn on_close(
            &self,
            _connection: &Arc<dyn Connection>,
            _event: CloseEvent,
        ) -> Result<(), TransportError> {
            self.events.lock().expect("event lock should not be poisoned").push("close".into());
            Ok(())
        }
    }

    fn app(adapter: Arc<AxumAdapter>) -> Router {
        Router::new().route(
            "/{*doc}",
            any(move |ws: WebSocketUpgrade, uri: Uri, headers: HeaderMap| {
                let adapter = Arc::clone(&adapter);
                async move {
                    let request = upgrade_request_from_parts(&uri, &headers, None);
                    adapter.handle_upgrade(ws, request).await
                }
            }),
        )
    }

    async fn serve(adapter: Arc<AxumAdapter>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let addr = listener.local_addr().expect("listener should have an address");
        tokio::spawn(async move {
            let _ = ::axum::serve(listener, app(adapter)).await;
        });
        addr
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met within timeout");
    }

    #[tokio::test]
    async fn accepted_upgrade_switches_protocols_and_merges_headers() {
        let hooks = Arc::new(RecordingHooks::default());
        let dispatcher =
            Arc::new(HookDispatcher::new().with_hooks(Arc::clone(&hooks) as Arc<dyn LifecycleHooks>));
        let addr = serve(Arc::new(AxumAdapter::new(dispatcher))).await;

        let (mut client, response) =
            tokio_tungstenite::connect_async(format!("ws://{addr}/docs/alpha"))
                .await
                .expect("client should connect");
        assert_eq!(response.status(), 101);
        assert_eq!(
            response.headers().get("x-doc-server").map(|v| v.to_str().unwrap()),
            Some("quillstream")
        );

        client
            .send(TtMessage::Binary(vec![1, 2, 3].into()))
            .await
            .expect("client frame should send");
        client.close(None).await.expect("client close should send");

        wait_for(|| hooks.events().len() >= 3).await;
        assert_eq!(
            hooks.events(),
            vec!["open /docs/alpha".to_string(), "message 3 bytes".to_string(), "close".to_string()]
        );
    }

    #[tokio::test]
    async fn rejected_upgrade_returns_hook_response() {
        let hooks = Arc::new(RejectingHooks::default());
        let dispatcher =
            Arc::new(HookDispatcher::new().with_hooks(Arc::clone(&hooks) as Arc<dyn LifecycleHooks>));
        let addr = serve(Arc::new(AxumAdapter::new(dispatcher))).await;

        let error = tokio_tungstenite::connect_async(format!("ws://{addr}/docs/alpha"))
            .await
            .expect_err("handshake should be refused");
        match error {
            TtError::Http(response) => assert_eq!(response.status(), 403),
            other => panic!("expected http rejection, got {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(hooks.events().is_empty(), "no open/message/close may fire after rejection");
    }

    #[test]
    fn upgrade_request_reconstructs_url_from_host_header() {
        let uri: Uri = "/docs/alpha?token=1".parse().expect("test uri should parse");
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("example.com"));
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));

        let request = upgrade_request_from_parts(&uri, &headers, None);
        assert_eq!(request.url, "https://example.com/docs/alpha?token=1");
        assert_eq!(request.path(), "/docs/alpha");
    }
}
