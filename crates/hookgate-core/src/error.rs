use thiserror::Error;

use crate::types::{ErrorKind, ReasonCode};

#[derive(Debug, Error)]
pub enum GateError {
    #[error("no authentication mode configured")]
    AuthNotConfigured,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("replay detected: {0}")]
    ReplayDetected(String),

    #[error("schema invalid: {0}")]
    SchemaInvalid(String),

    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("duplicate submission still in flight: {0}")]
    DuplicatePending(String),

    #[error("concurrency exceeded for lane {lane}")]
    ConcurrencyExceeded { lane: String },

    #[error("rendered payload is {size} bytes, budget is {limit}")]
    RenderTooLarge { size: usize, limit: usize },

    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("approval not found: {0}")]
    ApprovalNotFound(String),

    #[error("approval expired: {0}")]
    ApprovalExpired(String),

    #[error("execution engine unavailable: {0}")]
    Engine(String),

    #[error("audit trail unavailable: {0}")]
    AuditUnavailable(String),

    #[error("audit chain broken at seq {seq}: {detail}")]
    AuditChainBroken { seq: u64, detail: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("not initialized: run 'hookgate init'")]
    NotInitialized,

    #[error("store error: {0}")]
    Store(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl GateError {
    /// Stable machine-readable reason code for responses and audit entries.
    pub fn reason(&self) -> ReasonCode {
        match self {
            GateError::AuthNotConfigured => ReasonCode::AuthNotConfigured,
            GateError::Unauthorized(_) => ReasonCode::Unauthorized,
            GateError::ReplayDetected(_) => ReasonCode::ReplayDetected,
            GateError::SchemaInvalid(_) => ReasonCode::SchemaInvalid,
            GateError::TemplateNotFound(_) => ReasonCode::TemplateNotFound,
            GateError::DuplicatePending(_) => ReasonCode::Duplicate,
            GateError::ConcurrencyExceeded { .. } => ReasonCode::ConcurrencyExceeded,
            GateError::RenderTooLarge { .. } => ReasonCode::RenderTooLarge,
            GateError::IntegrityViolation(_) | GateError::AuditChainBroken { .. } => {
                ReasonCode::IntegrityViolation
            }
            GateError::InvalidTransition { .. } => ReasonCode::InvalidTransition,
            GateError::ApprovalNotFound(_) => ReasonCode::ApprovalNotFound,
            GateError::ApprovalExpired(_) => ReasonCode::ApprovalExpired,
            GateError::Engine(_) => ReasonCode::EngineUnavailable,
            GateError::AuditUnavailable(_) => ReasonCode::AuditUnavailable,
            GateError::Config(_)
            | GateError::NotInitialized
            | GateError::Store(_)
            | GateError::Internal(_)
            | GateError::Io(_)
            | GateError::Yaml(_)
            | GateError::Json(_) => ReasonCode::Internal,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.reason().kind()
    }

    /// Admission and engine failures are worth retrying after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Admission | ErrorKind::Engine)
    }
}

pub type Result<T> = std::result::Result<T, GateError>;
