use thiserror::Error;

use crate::hooks::RejectResponse;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer is gone; writes can no longer be delivered.
    #[error("connection is closed")]
    ConnectionClosed,

    /// A failure reported by the underlying socket library.
    #[error("websocket transport failure: {0}")]
    Socket(String),

    /// The inbound HTTP request could not be interpreted as an upgrade.
    #[error("invalid upgrade request: {0}")]
    BadUpgrade(String),

    /// An upgrade hook raised a terminal HTTP response instead of
    /// returning one. `HookDispatcher::upgrade` catches this variant and
    /// converts it into `UpgradeOutcome::Reject`.
    #[error("upgrade rejected with status {}", .0.status)]
    Rejected(RejectResponse),

    /// A caller-supplied hook failed for a reason of its own.
    #[error("lifecycle hook failed: {0}")]
    Hook(String),
}

impl TransportError {
    pub fn socket(error: impl std::fmt::Display) -> Self {
        Self::Socket(error.to_string())
    }

    pub fn hook(error: impl std::fmt::Display) -> Self {
        Self::Hook(error.to_string())
    }
}
