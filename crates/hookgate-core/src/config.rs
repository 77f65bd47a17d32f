use crate::admission::{LaneLimits, Limits};
use crate::auth::{Credential, ReplayPolicy};
use crate::error::{GateError, Result};
use crate::normalize::MappingProfile;
use crate::paths;
use crate::render::DEFAULT_MAX_RENDER_BYTES;
use crate::types::{AuthMode, Lane};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

const REDACTED: &str = "<redacted>";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Absent means every inbound request is rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<AuthMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Environment variable holding the secret; wins over `secret`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_env: Option<String>,
    #[serde(default)]
    pub replay: ReplayPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default)]
    pub lanes: LaneLimits,
    #[serde(default = "default_total")]
    pub total: usize,
    /// How long a request may wait for a slot; 0 rejects immediately.
    #[serde(default)]
    pub wait_timeout_ms: u64,
}

fn default_total() -> usize {
    8
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            lanes: LaneLimits::default(),
            total: default_total(),
            wait_timeout_ms: 0,
        }
    }
}

impl AdmissionConfig {
    pub fn limits(&self) -> Limits {
        Limits {
            lanes: self.lanes,
            total: self.total,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
}

fn default_max_bytes() -> usize {
    DEFAULT_MAX_RENDER_BYTES
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyBackend {
    Memory,
    #[default]
    Disk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default)]
    pub backend: IdempotencyBackend,
}

fn default_ttl_seconds() -> u64 {
    24 * 60 * 60
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
            backend: IdempotencyBackend::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default = "default_expiry_seconds")]
    pub expiry_seconds: i64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

fn default_expiry_seconds() -> i64 {
    24 * 60 * 60
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            expiry_seconds: default_expiry_seconds(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default = "default_submit_path")]
    pub submit_path: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_submit_path() -> String {
    "/prompt".to_string()
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            submit_path: default_submit_path(),
            timeout_seconds: default_timeout_seconds(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default)]
    pub approvals: ApprovalConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mappings: BTreeMap<String, MappingProfile>,
}

fn default_version() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            auth: AuthConfig::default(),
            admin: AdminConfig::default(),
            admission: AdmissionConfig::default(),
            render: RenderConfig::default(),
            idempotency: IdempotencyConfig::default(),
            approvals: ApprovalConfig::default(),
            engine: EngineConfig::default(),
            mappings: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(GateError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    /// Load and refuse anything with an error-level finding.
    pub fn load_validated(root: &Path) -> Result<(Self, Vec<ConfigWarning>)> {
        let cfg = Self::load(root)?;
        let warnings = cfg.check()?;
        Ok((cfg, warnings))
    }

    /// `validate()`, turned into an error when any finding is fatal.
    pub fn check(&self) -> Result<Vec<ConfigWarning>> {
        let warnings = self.validate();
        let errors: Vec<&str> = warnings
            .iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message.as_str())
            .collect();
        if errors.is_empty() {
            Ok(warnings)
        } else {
            Err(GateError::Config(errors.join("; ")))
        }
    }

    pub fn credential(&self) -> Credential {
        self.credential_with(|name| std::env::var(name).ok())
    }

    pub fn credential_with(&self, env: impl Fn(&str) -> Option<String>) -> Credential {
        let secret = resolve(self.auth.secret.as_deref(), self.auth.secret_env.as_deref(), &env);
        Credential::new(self.auth.mode, secret, self.auth.replay)
    }

    pub fn admin_token(&self) -> Option<String> {
        self.admin_token_with(|name| std::env::var(name).ok())
    }

    pub fn admin_token_with(&self, env: impl Fn(&str) -> Option<String>) -> Option<String> {
        resolve(self.admin.token.as_deref(), self.admin.token_env.as_deref(), &env)
    }

    pub fn mapping(&self, name: &str) -> Result<&MappingProfile> {
        self.mappings
            .get(name)
            .ok_or_else(|| GateError::SchemaInvalid(format!("unknown mapping profile '{name}'")))
    }

    /// Copy safe to print: inline secrets replaced.
    pub fn redacted(&self) -> Self {
        let mut cfg = self.clone();
        if cfg.auth.secret.is_some() {
            cfg.auth.secret = Some(REDACTED.into());
        }
        if cfg.admin.token.is_some() {
            cfg.admin.token = Some(REDACTED.into());
        }
        cfg
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        self.validate_with(|name| std::env::var(name).ok())
    }

    pub fn validate_with(&self, env: impl Fn(&str) -> Option<String>) -> Vec<ConfigWarning> {
        let mut out = Vec::new();
        let mut warn = |msg: String| {
            out.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: msg,
            })
        };
        let mut errors = Vec::new();
        let mut error = |msg: String| errors.push(msg);

        // Auth
        match self.auth.mode {
            None => warn("auth.mode is not set: every inbound request will be rejected".into()),
            Some(mode) => {
                if !self.credential_with(&env).is_configured() {
                    error(format!(
                        "auth.mode is '{mode}' but no secret resolves from auth.secret or auth.secret_env"
                    ));
                }
            }
        }
        if self.auth.secret.is_some() {
            warn("auth.secret is inline; prefer auth.secret_env".into());
        }
        let replay = &self.auth.replay;
        if replay.skew_seconds <= 0 {
            error("auth.replay.skew_seconds must be positive".into());
        }
        if replay.nonce_ttl_seconds < replay.skew_seconds {
            error(format!(
                "auth.replay.nonce_ttl_seconds ({}) must be at least skew_seconds ({})",
                replay.nonce_ttl_seconds, replay.skew_seconds
            ));
        }

        // Admin
        if self.admin_token_with(&env).is_none() {
            warn("admin token is not set: the admin API will reject every call".into());
        }

        // Admission
        if self.admission.total == 0 {
            error("admission.total must be at least 1".into());
        }
        for lane in Lane::all() {
            let cap = self.admission.lanes.cap(*lane);
            if cap == 0 {
                warn(format!("admission lane '{lane}' has cap 0 and will admit nothing"));
            } else if cap > self.admission.total {
                warn(format!(
                    "admission lane '{lane}' cap {cap} exceeds total {}",
                    self.admission.total
                ));
            }
        }

        // Render, idempotency, approvals
        if self.render.max_bytes == 0 {
            error("render.max_bytes must be positive".into());
        }
        if self.idempotency.ttl_seconds == 0 {
            error("idempotency.ttl_seconds must be positive".into());
        }
        if self.approvals.expiry_seconds <= 0 {
            error("approvals.expiry_seconds must be positive".into());
        }
        if self.approvals.sweep_interval_seconds == 0 {
            error("approvals.sweep_interval_seconds must be positive".into());
        }

        // Engine
        match self.engine.base_url.as_deref() {
            None => warn("engine.base_url is not set: accepted jobs cannot be handed off".into()),
            Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
                error(format!("engine.base_url '{url}' must be an http(s) URL"));
            }
            Some(_) => {}
        }
        if self.engine.max_attempts == 0 || self.engine.max_attempts > crate::engine::MAX_ATTEMPTS_CAP {
            warn(format!(
                "engine.max_attempts={} is clamped to 1..={}",
                self.engine.max_attempts,
                crate::engine::MAX_ATTEMPTS_CAP
            ));
        }

        // Mappings
        for (name, profile) in &self.mappings {
            if let Err(e) = paths::validate_ident("mapping name", name) {
                error(e.to_string());
            }
            if let Err(e) = profile.validate() {
                error(format!("mapping '{name}': {e}"));
            }
        }

        out.extend(errors.into_iter().map(|message| ConfigWarning {
            level: WarnLevel::Error,
            message,
        }));
        out
    }
}

fn resolve(
    inline: Option<&str>,
    env_name: Option<&str>,
    env: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_name
        .and_then(env)
        .filter(|v| !v.is_empty())
        .or_else(|| inline.filter(|v| !v.is_empty()).map(String::from))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
