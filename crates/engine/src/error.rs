use quillstream_transport::TransportError;
use thiserror::Error;

/// Errors from the sync engine. Protocol failures are scoped to a
/// document and never fatal to the connection that caused them.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("protocol error on doc '{doc}': {reason}")]
    Protocol { doc: String, reason: String },

    #[error("failed to apply update to doc '{doc}': {reason}")]
    Update { doc: String, reason: String },

    #[error("storage error for doc '{doc}': {reason}")]
    Storage { doc: String, reason: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl EngineError {
    pub fn protocol(doc: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Protocol { doc: doc.into(), reason: reason.to_string() }
    }

    pub fn update(doc: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Update { doc: doc.into(), reason: reason.to_string() }
    }

    pub fn storage(doc: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Storage { doc: doc.into(), reason: reason.to_string() }
    }
}
