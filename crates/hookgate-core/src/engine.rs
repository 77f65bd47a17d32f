//! Hand-off to the downstream execution engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::EngineConfig;
use crate::error::{GateError, Result};

/// Upper bound on `engine.max_attempts`, whatever the config says.
pub const MAX_ATTEMPTS_CAP: u32 = 10;

/// A rendered job on its way to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedPayload {
    pub job_id: String,
    pub trace_id: String,
    pub profile_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
    pub document: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineReceipt {
    pub job_id: String,
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct EngineFailure {
    pub message: String,
    /// Transport errors and 5xx are worth another attempt; 4xx is not.
    pub retryable: bool,
}

impl EngineFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

pub trait ExecutionEngine: Send + Sync {
    fn submit(&self, payload: &RenderedPayload) -> std::result::Result<EngineReceipt, EngineFailure>;
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Linear: attempt `n` waits `n * backoff` before the next try.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.clamp(1, MAX_ATTEMPTS_CAP),
            backoff: Duration::from_millis(cfg.backoff_ms),
        }
    }
}

/// Submit with a bounded number of attempts. Never loops forever.
pub fn submit_with_retry(
    engine: &dyn ExecutionEngine,
    payload: &RenderedPayload,
    policy: RetryPolicy,
) -> Result<EngineReceipt> {
    let max = policy.max_attempts.clamp(1, MAX_ATTEMPTS_CAP);
    let mut attempt = 1;
    loop {
        match engine.submit(payload) {
            Ok(receipt) => return Ok(receipt),
            Err(f) if f.retryable && attempt < max => {
                tracing::warn!(
                    job_id = %payload.job_id,
                    attempt,
                    max,
                    error = %f,
                    "engine submit failed, retrying"
                );
                std::thread::sleep(policy.backoff * attempt);
                attempt += 1;
            }
            Err(f) => {
                tracing::warn!(job_id = %payload.job_id, attempt, error = %f, "engine submit failed");
                return Err(GateError::Engine(f.message));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HttpEngine
// ---------------------------------------------------------------------------

pub struct HttpEngine {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpEngine {
    pub fn new(base_url: &str, submit_path: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(timeout.min(Duration::from_secs(15)))
            .timeout(timeout)
            .build()
            .map_err(|e| GateError::Config(format!("engine http client: {e}")))?;
        let url = format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            submit_path.trim_start_matches('/')
        );
        Ok(Self { client, url })
    }

    pub fn from_config(cfg: &EngineConfig) -> Result<Self> {
        let base_url = cfg
            .base_url
            .as_deref()
            .ok_or_else(|| GateError::Config("engine.base_url is not set".into()))?;
        Self::new(
            base_url,
            &cfg.submit_path,
            Duration::from_secs(cfg.timeout_seconds),
        )
    }
}

impl ExecutionEngine for HttpEngine {
    fn submit(&self, payload: &RenderedPayload) -> std::result::Result<EngineReceipt, EngineFailure> {
        let response = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .map_err(|e| EngineFailure::transient(format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(EngineFailure::transient(format!("engine returned {status}")));
        }
        if !status.is_success() {
            return Err(EngineFailure::permanent(format!("engine returned {status}")));
        }

        let body: serde_json::Value = response.json().unwrap_or(serde_json::Value::Null);
        let job_id = ["job_id", "prompt_id"]
            .iter()
            .find_map(|k| body.get(*k).and_then(|v| v.as_str()))
            .map(String::from)
            .unwrap_or_else(|| payload.job_id.clone());
        Ok(EngineReceipt { job_id })
    }
}

/// Stand-in used when `engine.base_url` is absent: every hand-off fails.
pub struct UnconfiguredEngine;

impl ExecutionEngine for UnconfiguredEngine {
    fn submit(&self, _payload: &RenderedPayload) -> std::result::Result<EngineReceipt, EngineFailure> {
        Err(EngineFailure::permanent("no execution engine configured"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn payload() -> RenderedPayload {
        RenderedPayload {
            job_id: "abc123".into(),
            trace_id: "t-1".into(),
            profile_id: "SDXL-v1".into(),
            callback: None,
            document: json!({"prompt": "a cat"}),
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(1),
        }
    }

    struct Flaky {
        calls: AtomicU32,
        fail_first: u32,
        retryable: bool,
    }

    impl ExecutionEngine for Flaky {
        fn submit(&self, p: &RenderedPayload) -> std::result::Result<EngineReceipt, EngineFailure> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                Err(EngineFailure {
                    message: format!("failure {n}"),
                    retryable: self.retryable,
                })
            } else {
                Ok(EngineReceipt {
                    job_id: p.job_id.clone(),
                })
            }
        }
    }

    #[test]
    fn transient_failures_are_retried() {
        let engine = Flaky {
            calls: AtomicU32::new(0),
            fail_first: 2,
            retryable: true,
        };
        let receipt = submit_with_retry(&engine, &payload(), fast()).unwrap();
        assert_eq!(receipt.job_id, "abc123");
        assert_eq!(engine.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retries_are_bounded() {
        let engine = Flaky {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
            retryable: true,
        };
        let err = submit_with_retry(&engine, &payload(), fast()).unwrap_err();
        assert!(matches!(err, GateError::Engine(_)));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        let engine = Flaky {
            calls: AtomicU32::new(0),
            fail_first: 1,
            retryable: false,
        };
        assert!(submit_with_retry(&engine, &payload(), fast()).is_err());
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn policy_caps_attempts() {
        let cfg = EngineConfig {
            max_attempts: 50,
            ..EngineConfig::default()
        };
        assert_eq!(RetryPolicy::from_config(&cfg).max_attempts, MAX_ATTEMPTS_CAP);
        let cfg = EngineConfig {
            max_attempts: 0,
            ..EngineConfig::default()
        };
        assert_eq!(RetryPolicy::from_config(&cfg).max_attempts, 1);
    }

    #[test]
    fn http_engine_posts_payload_and_reads_prompt_id() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/prompt")
            .match_body(mockito::Matcher::PartialJson(json!({"job_id": "abc123"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"prompt_id":"p-77"}"#)
            .expect(1)
            .create();

        let engine = HttpEngine::new(&server.url(), "/prompt", Duration::from_secs(5)).unwrap();
        let receipt = engine.submit(&payload()).unwrap();
        assert_eq!(receipt.job_id, "p-77");
        mock.assert();
    }

    #[test]
    fn http_engine_falls_back_to_our_job_id() {
        let mut server = mockito::Server::new();
        let _m = server
            .mock("POST", "/prompt")
            .with_status(202)
            .with_body("queued")
            .create();
        let engine = HttpEngine::new(&server.url(), "prompt", Duration::from_secs(5)).unwrap();
        assert_eq!(engine.submit(&payload()).unwrap().job_id, "abc123");
    }

    #[test]
    fn http_engine_classifies_status_codes() {
        let mut server = mockito::Server::new();
        let _busy = server.mock("POST", "/busy").with_status(503).create();
        let _bad = server.mock("POST", "/bad").with_status(422).create();

        let busy = HttpEngine::new(&server.url(), "/busy", Duration::from_secs(5)).unwrap();
        assert!(busy.submit(&payload()).unwrap_err().retryable);

        let bad = HttpEngine::new(&server.url(), "/bad", Duration::from_secs(5)).unwrap();
        assert!(!bad.submit(&payload()).unwrap_err().retryable);
    }

    #[test]
    fn http_engine_retry_stops_on_4xx() {
        let mut server = mockito::Server::new();
        let mock = server.mock("POST", "/prompt").with_status(400).expect(1).create();
        let engine = HttpEngine::new(&server.url(), "/prompt", Duration::from_secs(5)).unwrap();
        assert!(submit_with_retry(&engine, &payload(), fast()).is_err());
        mock.assert();
    }

    #[test]
    fn unconfigured_engine_always_fails() {
        assert!(!UnconfiguredEngine.submit(&payload()).unwrap_err().retryable);
    }
}
