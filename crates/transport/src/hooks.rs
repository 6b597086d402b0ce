use std::sync::Arc;

use async_trait::async_trait;
use http::HeaderMap;

use crate::connection::{Connection, ConnectionContext, UpgradeRequest};
use crate::error::TransportError;
use crate::message::Message;

/// Close code and reason as reported by the native socket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseEvent {
    pub code: Option<u16>,
    pub reason: Option<String>,
}

/// Terminal HTTP response sent instead of completing the handshake.
#[derive(Debug, Clone)]
pub struct RejectResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Option<String>,
}

impl RejectResponse {
    pub fn new(status: u16) -> Self {
        Self { status, headers: HeaderMap::new(), body: None }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn status_text(&self) -> &'static str {
        match self.status {
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            426 => "Upgrade Required",
            429 => "Too Many Requests",
            500 => "Internal Server Error",
            503 => "Service Unavailable",
            _ => "Error",
        }
    }
}

/// Result of upgrade-hook dispatch.
#[derive(Debug, Clone)]
pub enum UpgradeOutcome {
    /// Complete the handshake; `headers` are merged into the 101 response.
    Accept { headers: HeaderMap },
    /// Send this response instead of completing the handshake. No
    /// `Connection` is constructed and no further events fire.
    Reject(RejectResponse),
}

impl UpgradeOutcome {
    pub fn accept() -> Self {
        Self::Accept { headers: HeaderMap::new() }
    }

    pub fn accept_with_headers(headers: HeaderMap) -> Self {
        Self::Accept { headers }
    }

    pub fn is_reject(&self) -> bool {
        matches!(self, Self::Reject(_))
    }
}

/// The five lifecycle events consumed by this crate and implemented by
/// the embedding application. Every method defaults to a no-op so hook
/// sets only implement what they care about.
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    async fn on_upgrade(
        &self,
        _request: &UpgradeRequest,
        _context: &ConnectionContext,
    ) -> Result<UpgradeOutcome, TransportError> {
        Ok(UpgradeOutcome::accept())
    }

    async fn on_open(&self, _connection: &Arc<dyn Connection>) -> Result<(), TransportError> {
        Ok(())
    }

    async fn on_message(
        &self,
        _connection: &Arc<dyn Connection>,
        _message: Message,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn on_close(
        &self,
        _connection: &Arc<dyn Connection>,
        _event: CloseEvent,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn on_error(&self, _connection: &Arc<dyn Connection>, _error: &TransportError) {}
}

/// Supplies a per-request hook set resolved from the upgrade request,
/// e.g. routing different paths to different collaboration backends.
#[async_trait]
pub trait HookResolver: Send + Sync {
    async fn resolve(&self, request: &UpgradeRequest) -> Option<Arc<dyn LifecycleHooks>>;
}

/// Single dispatch point for all five lifecycle events.
///
/// Merges a statically configured global hook set with an optionally
/// resolved per-request set; the per-request result takes precedence
/// wherever both produce one. Without a resolver, dispatch goes straight
/// to the global hooks.
#[derive(Clone, Default)]
pub struct HookDispatcher {
    global: Option<Arc<dyn LifecycleHooks>>,
    resolver: Option<Arc<dyn HookResolver>>,
}

impl HookDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.global = Some(hooks);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HookResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    async fn resolved_for(&self, request: &UpgradeRequest) -> Option<Arc<dyn LifecycleHooks>> {
        match &self.resolver {
            Some(resolver) => resolver.resolve(request).await,
            None => None,
        }
    }

    /// Dispatch the `upgrade` event.
    ///
    /// Three outcomes per hook: accept with no extra headers, accept with
    /// headers (merged, resolved hooks last), or reject. A hook that
    /// raises `TransportError::Rejected` is treated the same as one that
    /// returned the rejection; other errors propagate to the adapter.
    pub async fn upgrade(
        &self,
        request: &UpgradeRequest,
        context: &ConnectionContext,
    ) -> Result<UpgradeOutcome, TransportError> {
        let mut merged = HeaderMap::new();

        if let Some(global) = &self.global {
            match Self::run_upgrade_hook(global, request, context).await? {
                UpgradeOutcome::Reject(response) => {
                    // A resolved hook may still override a global rejection.
                    if let Some(resolved) = self.resolved_for(request).await {
                        return Self::run_upgrade_hook(&resolved, request, context).await;
                    }
                    return Ok(UpgradeOutcome::Reject(response));
                }
                UpgradeOutcome::Accept { headers } => merged.extend(headers),
            }
        }

        if let Some(resolved) = self.resolved_for(request).await {
            match Self::run_upgrade_hook(&resolved, request, context).await? {
                UpgradeOutcome::Reject(response) => return Ok(UpgradeOutcome::Reject(response)),
                UpgradeOutcome::Accept { headers } => merged.extend(headers),
            }
        }

        Ok(UpgradeOutcome::Accept { headers: merged })
    }

    async fn run_upgrade_hook(
        hooks: &Arc<dyn LifecycleHooks>,
        request: &UpgradeRequest,
        context: &ConnectionContext,
    ) -> Result<UpgradeOutcome, TransportError> {
        match hooks.on_upgrade(request, context).await {
            Ok(outcome) => Ok(outcome),
            Err(TransportError::Rejected(response)) => Ok(UpgradeOutcome::Reject(response)),
            Err(error) => Err(error),
        }
    }

    pub async fn open(&self, connection: &Arc<dyn Connection>) -> Result<(), TransportError> {
        if let Some(global) = &self.global {
            global.on_open(connection).await?;
        }
        if let Some(resolved) = self.resolved_for(connection.request()).await {
            resolved.on_open(connection).await?;
        }
        Ok(())
    }

    pub async fn message(
        &self,
        connection: &Arc<dyn Connection>,
        message: Message,
    ) -> Result<(), TransportError> {
        if let Some(resolved) = self.resolved_for(connection.request()).await {
            if let Some(global) = &self.global {
                global.on_message(connection, message.clone()).await?;
            }
            resolved.on_message(connection, message).await
        } else if let Some(global) = &self.global {
            global.on_message(connection, message).await
        } else {
            Ok(())
        }
    }

    pub async fn close(
        &self,
        connection: &Arc<dyn Connection>,
        event: CloseEvent,
    ) -> Result<(), TransportError> {
        if let Some(global) = &self.global {
            global.on_close(connection, event.clone()).await?;
        }
        if let Some(resolved) = self.resolved_for(connection.request()).await {
            resolved.on_close(connection, event).await?;
        }
        Ok(())
    }

    pub async fn error(&self, connection: &Arc<dyn Connection>, error: &TransportError) {
        if let Some(global) = &self.global {
            global.on_error(connection, error).await;
        }
        if let Some(resolved) = self.resolved_for(connection.request()).await {
            resolved.on_error(connection, error).await;
        }
    }
}
