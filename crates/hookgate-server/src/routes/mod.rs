pub mod admin;
pub mod approvals;
pub mod audit;
pub mod webhook;

use hookgate_core::error::GateError;
use serde::de::DeserializeOwned;

use crate::error::AppError;

/// Actor name recorded in the audit trail for admin API calls.
pub(crate) fn admin_actor(name: Option<&str>) -> String {
    match name.map(str::trim) {
        Some(n) if !n.is_empty() => format!("admin:{n}"),
        _ => "admin".to_string(),
    }
}

/// Parse a required JSON body; failures surface as `schema_invalid`.
pub(crate) fn json_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, AppError> {
    serde_json::from_slice(bytes)
        .map_err(|e| AppError(GateError::SchemaInvalid(format!("request body: {e}")).into()))
}

/// Like [`json_body`], but an empty body yields `T::default()`.
pub(crate) fn optional_body<T: DeserializeOwned + Default>(bytes: &[u8]) -> Result<T, AppError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        Ok(T::default())
    } else {
        json_body(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, serde::Deserialize)]
    struct Body {
        #[serde(default)]
        flag: bool,
    }

    #[test]
    fn admin_actor_names_the_operator() {
        assert_eq!(admin_actor(None), "admin");
        assert_eq!(admin_actor(Some("  ")), "admin");
        assert_eq!(admin_actor(Some("alice")), "admin:alice");
    }

    #[test]
    fn optional_body_defaults_when_empty() {
        let b: Body = optional_body(b"").unwrap();
        assert!(!b.flag);
        let b: Body = optional_body(br#"{"flag":true}"#).unwrap();
        assert!(b.flag);
    }

    #[test]
    fn malformed_body_is_schema_invalid() {
        let err = json_body::<Body>(b"{nope").unwrap_err();
        assert_eq!(err.reason(), hookgate_core::types::ReasonCode::SchemaInvalid);
    }
}
