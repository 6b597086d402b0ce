// Raw-socket adapter over tokio-tungstenite.
//
// The upgrade hook has to run before the WebSocket handshake, but the
// handshake callback tungstenite offers is synchronous. So we peek the
// HTTP request head off the TCP stream without consuming it, resolve the
// hook, and only then either write a plain HTTP rejection onto the raw
// stream or let `accept_hdr_async` re-read the head and finish the
// handshake with the hook's extra headers injected.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream, StreamExt};
use futures_util::SinkExt;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as TtMessage;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, warn};

use crate::connection::{
    Connection, ConnectionContext, ConnectionId, LazyConnectionId, UpgradeRequest,
};
use crate::error::TransportError;
use crate::hooks::{CloseEvent, HookDispatcher, RejectResponse, UpgradeOutcome};
use crate::message::Message;

/// Upper bound on the HTTP request head. Anything larger is refused
/// before the handshake starts.
const MAX_HEAD_BYTES: usize = 8192;

pub struct TungsteniteAdapter {
    hooks: Arc<HookDispatcher>,
}

impl TungsteniteAdapter {
    pub fn new(hooks: Arc<HookDispatcher>) -> Self {
        Self { hooks }
    }

    /// Accept connections until the listener fails, spawning one task per
    /// socket.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), TransportError> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "websocket listener started");
        }
        loop {
            let (stream, remote_addr) = listener.accept().await.map_err(TransportError::socket)?;
            let hooks = Arc::clone(&self.hooks);
            tokio::spawn(async move {
                if let Err(error) = handle_connection(hooks, stream, remote_addr).await {
                    debug!(%remote_addr, %error, "connection ended with error");
                }
            });
        }
    }
}

async fn handle_connection(
    hooks: Arc<HookDispatcher>,
    mut stream: TcpStream,
    remote_addr: SocketAddr,
) -> Result<(), TransportError> {
    let head = peek_request_head(&stream).await?;
    let request = parse_request_head(&head, Some(remote_addr))?;
    let context = ConnectionContext::new();

    match hooks.upgrade(&request, &context).await {
        Err(error) => {
            warn!(url = %request.url, %error, "upgrade hook failed");
            write_rejection(&mut stream, RejectResponse::new(500)).await?;
            Err(error)
        }
        Ok(UpgradeOutcome::Reject(rejection)) => {
            debug!(url = %request.url, status = rejection.status, "upgrade rejected");
            write_rejection(&mut stream, rejection).await
        }
        Ok(UpgradeOutcome::Accept { headers }) => {
            let socket = accept_hdr_async(stream, move |_req: &_, mut response: http::Response<()>| {
                response.headers_mut().extend(headers);
                Ok(response)
            })
            .await
            .map_err(|error| TransportError::BadUpgrade(error.to_string()))?;
            drive_socket(hooks, request, context, socket).await;
            Ok(())
        }
    }
}

/// Read the request head via `peek` so the bytes stay in the socket
/// buffer for the real handshake.
async fn peek_request_head(stream: &TcpStream) -> Result<Vec<u8>, TransportError> {
    let mut buf = vec![0u8; MAX_HEAD_BYTES];
    loop {
        let n = stream.peek(&mut buf).await.map_err(TransportError::socket)?;
        if n == 0 {
            return Err(TransportError::BadUpgrade(
                "connection closed before handshake completed".into(),
            ));
        }
        if let Some(end) = find_head_end(&buf[..n]) {
            return Ok(buf[..end].to_vec());
        }
        if n == buf.len() {
            return Err(TransportError::BadUpgrade("request head too large".into()));
        }
        // Head not complete yet; peek again once more bytes arrive.
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

fn find_head_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|window| window == b"\r\n\r\n").map(|index| index + 4)
}

fn parse_request_head(
    head: &[u8],
    remote_addr: Option<SocketAddr>,
) -> Result<UpgradeRequest, TransportError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| TransportError::BadUpgrade("request head is not valid utf-8".into()))?;
    let mut lines = text.split("\r\n");

    let request_line = lines
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| TransportError::BadUpgrade("empty request head".into()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| TransportError::BadUpgrade("missing request method".into()))?;
    let target = parts
        .next()
        .ok_or_else(|| TransportError::BadUpgrade("missing request target".into()))?;
    if !method.eq_ignore_ascii_case("GET") {
        return Err(TransportError::BadUpgrade(format!(
            "method {method} is not valid for a websocket upgrade"
        )));
    }

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| TransportError::BadUpgrade(format!("malformed header line: {line}")))?;
        let name = name
            .trim()
            .parse::<HeaderName>()
            .map_err(|_| TransportError::BadUpgrade(format!("invalid header name: {name}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| TransportError::BadUpgrade(format!("invalid header value for {name}")))?;
        headers.append(name, value);
    }

    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get("host")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    let url = format!("{scheme}://{host}{target}");

    Ok(UpgradeRequest::new(url, headers, remote_addr))
}

async fn write_rejection(
    stream: &mut TcpStream,
    rejection: RejectResponse,
) -> Result<(), TransportError> {
    let bytes = rejection_bytes(&rejection);
    stream.write_all(&bytes).await.map_err(TransportError::socket)?;
    stream.shutdown().await.map_err(TransportError::socket)
}

fn rejection_bytes(rejection: &RejectResponse) -> Vec<u8> {
    let body = rejection.body.as_deref().unwrap_or("");
    let mut out = format!("HTTP/1.1 {} {}\r\n", rejection.status, rejection.status_text());
    for (name, value) in &rejection.headers {
        if let Ok(value) = value.to_str() {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
    }
    out.push_str(&format!("content-length: {}\r\nconnection: close\r\n\r\n{body}", body.len()));
    out.into_bytes()
}

struct TungsteniteConnection {
    id: LazyConnectionId,
    request: UpgradeRequest,
    context: ConnectionContext,
    sink: Mutex<SplitSink<WebSocketStream<TcpStream>, TtMessage>>,
}

#[async_trait]
impl Connection for TungsteniteConnection {
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
            crate::message::Payload::Text(text) => TtMessage::Text(text.into()),
            crate::message::Payload::Binary(bytes) => TtMessage::Binary(bytes.into()),
        };
        self.sink.lock().await.send(frame).await.map_err(TransportError::socket)
    }

    async fn close(&self, code: Option<u16>, reason: Option<String>) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(code.unwrap_or(1000)),
            reason: reason.unwrap_or_default().into(),
        };
        self.sink
            .lock()
            .await
            .send(TtMessage::Close(Some(frame)))
            .await
            .map_err(TransportError::socket)
    }
}

async fn drive_socket(
    hooks: Arc<HookDispatcher>,
    request: UpgradeRequest,
    context: ConnectionContext,
    socket: WebSocketStream<TcpStream>,
) {
    let (sink, stream) = socket.split();
    let connection: Arc<dyn Connection> = Arc::new(TungsteniteConnection {
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
    mut stream: SplitStream<WebSocketStream<TcpStream>>,
) -> CloseEvent {
    while let Some(frame) = stream.next().await {
        match frame {
            // tungstenite reassembles fragmented frames before yielding.
            Ok(TtMessage::Text(text)) => {
                dispatch_message(hooks, connection, Message::text(text.as_str())).await;
            }
            Ok(TtMessage::Binary(bytes)) => {
                dispatch_message(hooks, connection, Message::binary(bytes.to_vec())).await;
            }
            // Pong replies are queued by tungstenite itself.
            Ok(TtMessage::Ping(_)) | Ok(TtMessage::Pong(_)) | Ok(TtMessage::Frame(_)) => {}
            Ok(TtMessage::Close(frame)) => {
                return frame
                    .map(|frame| CloseEvent {
                        code: Some(u16::from(frame.code)),
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

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use futures_util::SinkExt;
    use http::header::HeaderValue;
    use http::HeaderMap;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::{Error as TtError, Message as TtMessage};

    use super::{find_head_end, parse_request_head, rejection_bytes, TungsteniteAdapter};
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

        async fn on_open(
            &self,
            connection: &Arc<dyn Connection>,
        ) -> Result<(), TransportError> {
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

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met within timeout");
    }

    #[test]
    fn head_end_requires_blank_line() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\n"), Some(18));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\nhost: x"), None);
    }

    #[test]
    fn request_head_parses_target_and_headers() {
        let head = b"GET /docs/alpha?token=1 HTTP/1.1\r\nHost: example.com\r\nX-User: ada\r\n\r\n";
        let request = parse_request_head(head, None).expect("head should parse");
        assert_eq!(request.url, "http://example.com/docs/alpha?token=1");
        assert_eq!(request.path(), "/docs/alpha");
        assert_eq!(request.header("x-user"), Some("ada"));
    }

    #[test]
    fn non_get_method_is_refused() {
        let head = b"POST /docs HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let error = parse_request_head(head, None).expect_err("POST should be refused");
        assert!(matches!(error, TransportError::BadUpgrade(_)));
    }

    #[test]
    fn rejection_bytes_form_a_complete_http_response() {
        let rejection = RejectResponse::new(403).with_body("denied");
        let text = String::from_utf8(rejection_bytes(&rejection)).expect("response should be utf-8");
        assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(text.contains("content-length: 6\r\n"));
        assert!(text.ends_with("\r\n\r\ndenied"));
    }

    #[tokio::test]
    async fn loopback_client_sees_full_lifecycle() {
        let hooks = Arc::new(RecordingHooks::default());
        let dispatcher =
            Arc::new(HookDispatcher::new().with_hooks(Arc::clone(&hooks) as Arc<dyn LifecycleHooks>));
        let adapter = Arc::new(TungsteniteAdapter::new(dispatcher));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let addr = listener.local_addr().expect("listener should have an address");
        tokio::spawn(async move {
            let _ = adapter.serve(listener).await;
        });

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
    async fn rejected_upgrade_dispatches_no_lifecycle_events() {
        let hooks = Arc::new(RejectingHooks::default());
        let dispatcher =
            Arc::new(HookDispatcher::new().with_hooks(Arc::clone(&hooks) as Arc<dyn LifecycleHooks>));
        let adapter = Arc::new(TungsteniteAdapter::new(dispatcher));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let addr = listener.local_addr().expect("listener should have an address");
        tokio::spawn(async move {
            let _ = adapter.serve(listener).await;
        });

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
}
