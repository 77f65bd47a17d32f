use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::GateError;

// ---------------------------------------------------------------------------
// Lane
// ---------------------------------------------------------------------------

/// Source category of a request. Each lane has its own concurrency budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Webhook,
    Trigger,
    Scheduler,
    Bridge,
}

impl Lane {
    pub fn all() -> &'static [Lane] {
        &[Lane::Webhook, Lane::Trigger, Lane::Scheduler, Lane::Bridge]
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Lane::Webhook => "webhook",
            Lane::Trigger => "trigger",
            Lane::Scheduler => "scheduler",
            Lane::Bridge => "bridge",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Lane {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webhook" => Ok(Lane::Webhook),
            "trigger" => Ok(Lane::Trigger),
            "scheduler" => Ok(Lane::Scheduler),
            "bridge" => Ok(Lane::Bridge),
            _ => Err(GateError::SchemaInvalid(format!(
                "unknown lane '{s}': must be webhook, trigger, scheduler, or bridge"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// AuthMode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    Bearer,
    Hmac,
    BearerOrHmac,
}

impl AuthMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMode::Bearer => "bearer",
            AuthMode::Hmac => "hmac",
            AuthMode::BearerOrHmac => "bearer_or_hmac",
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    Validation,
    Duplicate,
    Admission,
    Integrity,
    Engine,
    Internal,
}

// ---------------------------------------------------------------------------
// ReasonCode
// ---------------------------------------------------------------------------

/// Machine-readable rejection reason shared by API responses and audit entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    AuthNotConfigured,
    Unauthorized,
    ReplayDetected,
    SchemaInvalid,
    TemplateNotFound,
    Duplicate,
    ConcurrencyExceeded,
    RenderTooLarge,
    IntegrityViolation,
    InvalidTransition,
    ApprovalNotFound,
    ApprovalExpired,
    EngineUnavailable,
    AuditUnavailable,
    Internal,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::AuthNotConfigured => "auth_not_configured",
            ReasonCode::Unauthorized => "unauthorized",
            ReasonCode::ReplayDetected => "replay_detected",
            ReasonCode::SchemaInvalid => "schema_invalid",
            ReasonCode::TemplateNotFound => "template_not_found",
            ReasonCode::Duplicate => "duplicate",
            ReasonCode::ConcurrencyExceeded => "concurrency_exceeded",
            ReasonCode::RenderTooLarge => "render_too_large",
            ReasonCode::IntegrityViolation => "integrity_violation",
            ReasonCode::InvalidTransition => "invalid_transition",
            ReasonCode::ApprovalNotFound => "approval_not_found",
            ReasonCode::ApprovalExpired => "approval_expired",
            ReasonCode::EngineUnavailable => "engine_unavailable",
            ReasonCode::AuditUnavailable => "audit_unavailable",
            ReasonCode::Internal => "internal",
        }
    }

    pub fn kind(self) -> ErrorKind {
        match self {
            ReasonCode::AuthNotConfigured | ReasonCode::Unauthorized | ReasonCode::ReplayDetected => {
                ErrorKind::Auth
            }
            ReasonCode::SchemaInvalid
            | ReasonCode::TemplateNotFound
            | ReasonCode::InvalidTransition
            | ReasonCode::ApprovalNotFound
            | ReasonCode::ApprovalExpired => ErrorKind::Validation,
            ReasonCode::Duplicate => ErrorKind::Duplicate,
            ReasonCode::ConcurrencyExceeded | ReasonCode::RenderTooLarge => ErrorKind::Admission,
            ReasonCode::IntegrityViolation => ErrorKind::Integrity,
            ReasonCode::EngineUnavailable => ErrorKind::Engine,
            ReasonCode::AuditUnavailable | ReasonCode::Internal => ErrorKind::Internal,
        }
    }

    pub fn http_status(self) -> u16 {
        match self {
            ReasonCode::AuthNotConfigured | ReasonCode::ReplayDetected => 403,
            ReasonCode::Unauthorized => 401,
            ReasonCode::SchemaInvalid => 400,
            ReasonCode::TemplateNotFound | ReasonCode::ApprovalNotFound => 404,
            ReasonCode::Duplicate
            | ReasonCode::IntegrityViolation
            | ReasonCode::InvalidTransition
            | ReasonCode::ApprovalExpired => 409,
            ReasonCode::RenderTooLarge => 413,
            ReasonCode::ConcurrencyExceeded => 429,
            ReasonCode::EngineUnavailable => 502,
            ReasonCode::AuditUnavailable | ReasonCode::Internal => 500,
        }
    }

    /// Fixed human-readable text; safe to return to untrusted callers.
    pub fn public_message(self) -> &'static str {
        match self {
            ReasonCode::AuthNotConfigured => "authentication is not configured",
            ReasonCode::Unauthorized => "credentials missing or invalid",
            ReasonCode::ReplayDetected => "request replay rejected",
            ReasonCode::SchemaInvalid => "payload does not match the job schema",
            ReasonCode::TemplateNotFound => "unknown template",
            ReasonCode::Duplicate => "an identical submission is still in progress",
            ReasonCode::ConcurrencyExceeded => "too many concurrent jobs, retry later",
            ReasonCode::RenderTooLarge => "rendered job exceeds the size budget",
            ReasonCode::IntegrityViolation => "integrity check failed",
            ReasonCode::InvalidTransition => "approval is not in a state that allows this action",
            ReasonCode::ApprovalNotFound => "unknown approval",
            ReasonCode::ApprovalExpired => "approval has expired",
            ReasonCode::EngineUnavailable => "execution engine unavailable",
            ReasonCode::AuditUnavailable => "audit trail unavailable",
            ReasonCode::Internal => "internal error",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lane_parse_and_display() {
        for lane in Lane::all() {
            let parsed: Lane = lane.as_str().parse().unwrap();
            assert_eq!(parsed, *lane);
            assert_eq!(lane.to_string(), lane.as_str());
        }
        assert!("email".parse::<Lane>().is_err());
    }

    #[test]
    fn lane_serializes_snake_case() {
        let json = serde_json::to_string(&Lane::Scheduler).unwrap();
        assert_eq!(json, "\"scheduler\"");
    }

    #[test]
    fn reason_codes_match_serde_names() {
        let codes = [
            ReasonCode::AuthNotConfigured,
            ReasonCode::ReplayDetected,
            ReasonCode::ConcurrencyExceeded,
            ReasonCode::RenderTooLarge,
        ];
        for code in codes {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn reason_status_mapping() {
        assert_eq!(ReasonCode::AuthNotConfigured.http_status(), 403);
        assert_eq!(ReasonCode::Duplicate.http_status(), 409);
        assert_eq!(ReasonCode::ConcurrencyExceeded.http_status(), 429);
        assert_eq!(ReasonCode::RenderTooLarge.http_status(), 413);
    }

    #[test]
    fn auth_mode_serde() {
        let mode: AuthMode = serde_yaml::from_str("bearer_or_hmac").unwrap();
        assert_eq!(mode, AuthMode::BearerOrHmac);
    }
}
