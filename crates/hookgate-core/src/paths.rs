use crate::error::{GateError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const HOOKGATE_DIR: &str = ".hookgate";
pub const TEMPLATES_DIR: &str = ".hookgate/templates";
pub const APPROVALS_DIR: &str = ".hookgate/approvals";

pub const CONFIG_FILE: &str = ".hookgate/config.yaml";
pub const AUDIT_FILE: &str = ".hookgate/audit.jsonl";
pub const IDEMPOTENCY_DB: &str = ".hookgate/idempotency.redb";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn hookgate_dir(root: &Path) -> PathBuf {
    root.join(HOOKGATE_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn templates_dir(root: &Path) -> PathBuf {
    root.join(TEMPLATES_DIR)
}

pub fn approvals_dir(root: &Path) -> PathBuf {
    root.join(APPROVALS_DIR)
}

pub fn audit_path(root: &Path) -> PathBuf {
    root.join(AUDIT_FILE)
}

pub fn idempotency_db_path(root: &Path) -> PathBuf {
    root.join(IDEMPOTENCY_DB)
}

// ---------------------------------------------------------------------------
// Identifier validation
// ---------------------------------------------------------------------------

fn ident_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("static regex"))
}

/// Identifiers that become file names (template ids, approval ids) must
/// contain only letters, digits, hyphens and underscores.
pub fn validate_ident(kind: &str, id: &str) -> Result<()> {
    if ident_re().is_match(id) {
        Ok(())
    } else {
        Err(GateError::SchemaInvalid(format!(
            "invalid {kind} '{id}': must contain only letters, digits, hyphens, and underscores"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_ident_accepts_template_ids() {
        assert!(validate_ident("template_id", "portrait_v1").is_ok());
        assert!(validate_ident("template_id", "SDXL-v1").is_ok());
    }

    #[test]
    fn validate_ident_rejects_traversal() {
        assert!(validate_ident("template_id", "../etc/passwd").is_err());
        assert!(validate_ident("template_id", "a/b").is_err());
        assert!(validate_ident("template_id", "").is_err());
    }
}
