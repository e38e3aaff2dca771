//! Error types for Tiersync

use crate::types::Layer;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("agent not found: {0}")]
    NotFound(String),

    #[error("agent already registered: {0}")]
    AlreadyRegistered(String),

    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error("layer violation: {from} -> {to} ({detail})")]
    LayerViolation {
        from: Layer,
        to: Layer,
        detail: String,
    },

    #[error("source agent not found: {0}")]
    SourceNotFound(String),

    #[error("conflict unresolved: {agent_id}.{field}")]
    ConflictUnresolved { agent_id: String, field: String },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("sync timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("approval denied: {0}")]
    ApprovalDenied(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn layer_violation(from: Layer, to: Layer, detail: impl Into<String>) -> Self {
        Self::LayerViolation {
            from,
            to,
            detail: detail.into(),
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence(message.into())
    }

    pub fn conflict_unresolved(agent_id: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ConflictUnresolved {
            agent_id: agent_id.into(),
            field: field.into(),
        }
    }

    /// Whether this error belongs to the layer rule family.
    pub fn is_layer_violation(&self) -> bool {
        matches!(self, Self::LayerViolation { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::SourceNotFound(_) | Self::MessageNotFound(_)
        )
    }
}
