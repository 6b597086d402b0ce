// Adapter for actix-web's event-loop runtime via actix-ws.
//
// actix keeps its own header types, so the upgrade request is copied into
// the shared `http` types once at handshake time. Outbound frames go
// through a cloned `Session`; actix handles the actual socket on its
// arbiter thread.

use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_ws::{AggregatedMessage, AggregatedMessageStream, CloseReason, Session};
use async_trait::async_trait;
use futures_util::StreamExt;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::connection::{
    Connection, ConnectionContext, ConnectionId, LazyConnectionId, UpgradeRequest,
};
use crate::error::TransportError;
use crate::hooks::{CloseEvent, HookDispatcher, RejectResponse, UpgradeOutcome};
use crate::message::Message;

/// Frames above this size are refused rather than reassembled.
const MAX_CONTINUATION_BYTES: usize = 16 * 1024 * 1024;

pub struct ActixAdapter {
    hooks: Arc<HookDispatcher>,
}

impl ActixAdapter {
    pub fn new(hooks: Arc<HookDispatcher>) -> Self {
        Self { hooks }
    }

    /// Resolve the upgrade hook and either return the rejection response
    /// or complete the handshake and relay events on the actix arbiter.
    pub async fn handle_upgrade(
        &self,
        req: &HttpRequest,
        body: web::Payload,
    ) -> actix_web::Result<HttpResponse> {
        let request = upgrade_request_from_actix(req);
        let context = ConnectionContext::new();

        match self.hooks.upgrade(&request, &context).await {
            Err(error) => {
                warn!(url = %request.url, %error, "upgrade hook failed");
                Ok(HttpResponse::InternalServerError().finish())
            }
            Ok(UpgradeOutcome::Reject(rejection)) => Ok(reject_response(rejection)),
            Ok(UpgradeOutcome::Accept { headers }) => {
                let (mut response, session, stream) = actix_ws::handle(req, body)?;
                merge_headers(&mut response, &headers);

                let stream = stream
                    .aggregate_continuations()
                    .max_continuation_size(MAX_CONTINUATION_BYTES);
                let hooks = Arc::clone(&self.hooks);
                actix_web::rt::spawn(async move {
                    drive_session(hooks, request, context, session, stream).await;
                });
                Ok(response)
            }
        }
    }
}

fn upgrade_request_from_actix(req: &HttpRequest) -> UpgradeRequest {
    let mut headers = HeaderMap::new();
    for (name, value) in req.headers() {
        let name = name.as_str().parse::<HeaderName>();
        let value = HeaderValue::from_bytes(value.as_bytes());
        if let (Ok(name), Ok(value)) = (name, value) {
            headers.append(name, value);
        }
    }

    let info = req.connection_info();
    let url = format!("{}://{}{}", info.scheme(), info.host(), req.uri());
    let remote_addr = req.peer_addr();
    drop(info);

    UpgradeRequest::new(url, headers, remote_addr)
}

fn reject_response(rejection: RejectResponse) -> HttpResponse {
    let status =
        StatusCode::from_u16(rejection.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = HttpResponse::build(status);
    for (name, value) in &rejection.headers {
        if let Ok(value) = value.to_str() {
            builder.insert_header((name.as_str(), value));
        }
    }
    match rejection.body {
        Some(body) => builder.body(body),
        None => builder.finish(),
    }
}

fn merge_headers(response: &mut HttpResponse, headers: &HeaderMap) {
    for (name, value) in headers {
        let name = actix_web::http::header::HeaderName::from_bytes(name.as_str().as_bytes());
        let value = actix_web::http::header::HeaderValue::from_bytes(value.as_bytes());
        if let (Ok(name), Ok(value)) = (name, value) {
            response.headers_mut().insert(name, value);
        }
    }
}

struct ActixConnection {
    id: LazyConnectionId,
    request: UpgradeRequest,
    context: ConnectionContext,
    session: Mutex<Session>,
}

#[async_trait]
impl Connection for ActixConnection {
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
        let mut session = self.session.lock().await;
        let result = match message.into_payload() {
            crate::message::Payload::Text(text) => session.text(text).await,
            crate::message::Payload::Binary(bytes) => session.binary(bytes).await,
        };
        result.map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&self, code: Option<u16>, reason: Option<String>) -> Result<(), TransportError> {
        let session = self.session.lock().await.clone();
        let reason = CloseReason {
            code: code.unwrap_or(1000).into(),
            description: reason,
        };
        session.close(Some(reason)).await.map_err(|_| TransportError::ConnectionClosed)
    }
}

async fn drive_session(
    hooks: Arc<HookDispatcher>,
    request: UpgradeRequest,
    context: ConnectionContext,
    session: Session,
    mut stream: AggregatedMessageStream,
) {
    let connection: Arc<dyn Connection> = Arc::new(ActixConnection {
        id: LazyConnectionId::new(),
        request,
        context,
        session: Mutex::new(session.clone()),
    });

    if let Err(error) = hooks.open(&connection).await {
        warn!(conn_id = %connection.id(), %error, "open hook failed, closing connection");
        let _ = connection.close(None, None).await;
        let _ = hooks.close(&connection, CloseEvent::default()).await;
        return;
    }

    let mut pong_session = session;
    let mut close_event = CloseEvent::default();
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(AggregatedMessage::Text(text)) => {
                dispatch_message(&hooks, &connection, Message::text(text.to_string())).await;
            }
            Ok(AggregatedMessage::Binary(bytes)) => {
                dispatch_message(&hooks, &connection, Message::binary(bytes.to_vec())).await;
            }
            Ok(AggregatedMessage::Ping(bytes)) => {
                if pong_session.pong(&bytes).await.is_err() {
                    break;
                }
            }
            Ok(AggregatedMessage::Pong(_)) => {}
            Ok(AggregatedMessage::Close(reason)) => {
                close_event = reason
                    .map(|reason| CloseEvent {
                        code: Some(reason.code.into()),
                        reason: reason.description,
                    })
                    .unwrap_or_default();
                break;
            }
            Err(error) => {
                let error = TransportError::socket(error);
                hooks.error(&connection, &error).await;
                break;
            }
        }
    }

    if let Err(error) = hooks.close(&connection, close_event).await {
        warn!(conn_id = %connection.id(), %error, "close hook failed");
    }
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
