//! Error taxonomy (spec §7), generalized from the teacher's ad hoc
//! `Result<T, String>` call sites into typed variants that know their own
//! HTTP status and OpenAI-shaped error body.

use serde_json::json;
use thiserror::Error;

/// Every error the gateway surfaces to an HTTP client or a CLI exit code.
#[derive(Debug, Error)]
pub enum AfmError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("conflicting sampling modes: {0}")]
    ConflictingSamplingModes(String),

    #[error("invalid randomness string: {0}")]
    InvalidRandomness(String),

    #[error("unsupported schema type: {0}")]
    UnsupportedSchemaType(String),

    #[error("not available: {0}")]
    NotAvailable(String),

    #[error("session creation failed: {0}")]
    SessionCreationFailed(String),

    #[error("no model loaded")]
    NoModelLoaded,

    #[error("context window exceeded: provided {provided}, maximum {maximum}")]
    ContextWindowExceeded { provided: u64, maximum: u64 },

    #[error("guardrail violation: {reason}")]
    GuardrailViolation { reason: String },

    #[error("schema conversion failed: {0}")]
    SchemaConversionFailed(String),

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("model not found in cache: {0}")]
    ModelNotFoundInCache(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("load failed: {0}")]
    LoadFailed(String),

    #[error("service shutting down")]
    ServiceShuttingDown,

    #[error("cancelled")]
    Cancelled,

    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),
}

impl AfmError {
    /// The HTTP status this error maps to (spec §7).
    pub fn status_code(&self) -> u16 {
        match self {
            AfmError::InvalidRequest(_)
            | AfmError::UnknownModel(_)
            | AfmError::ConflictingSamplingModes(_)
            | AfmError::InvalidRandomness(_)
            | AfmError::UnsupportedSchemaType(_)
            | AfmError::ContextWindowExceeded { .. }
            | AfmError::GuardrailViolation { .. }
            | AfmError::SchemaConversionFailed(_) => 400,
            AfmError::NotAvailable(_) => 501,
            AfmError::SessionCreationFailed(_) | AfmError::NoModelLoaded => 503,
            AfmError::PayloadTooLarge => 413,
            AfmError::ModelNotFoundInCache(_)
            | AfmError::DownloadFailed(_)
            | AfmError::LoadFailed(_) => 400,
            AfmError::ServiceShuttingDown => 503,
            AfmError::Cancelled => 499,
            AfmError::BackendUnreachable(_) => 200, // diagnostic delivered as a chat-visible SSE chunk
        }
    }

    /// OpenAI-shaped `{error:{message, type, code}}` body.
    pub fn to_openai_body(&self) -> serde_json::Value {
        let (error_type, code) = match self {
            AfmError::InvalidRequest(_)
            | AfmError::UnknownModel(_)
            | AfmError::ConflictingSamplingModes(_)
            | AfmError::InvalidRandomness(_) => ("invalid_request_error", None),
            AfmError::UnsupportedSchemaType(_) => ("invalid_schema", None),
            AfmError::ContextWindowExceeded { .. } => {
                ("invalid_request_error", Some("context_length_exceeded"))
            }
            AfmError::GuardrailViolation { .. } => {
                ("invalid_request_error", Some("guardrail_violation"))
            }
            AfmError::SchemaConversionFailed(_) => ("invalid_schema", None),
            AfmError::NotAvailable(_) => ("service_unavailable", None),
            AfmError::SessionCreationFailed(_) | AfmError::NoModelLoaded => {
                ("service_unavailable", None)
            }
            AfmError::PayloadTooLarge => ("invalid_request_error", Some("payload_too_large")),
            AfmError::ModelNotFoundInCache(_)
            | AfmError::DownloadFailed(_)
            | AfmError::LoadFailed(_) => ("invalid_request_error", None),
            AfmError::ServiceShuttingDown => ("service_unavailable", None),
            AfmError::Cancelled => ("cancelled", None),
            AfmError::BackendUnreachable(_) => ("backend_unreachable", None),
        };
        json!({
            "error": {
                "message": self.to_string(),
                "type": error_type,
                "code": code,
            }
        })
    }
}

pub type AfmResult<T> = Result<T, AfmError>;
