//! Payload normalization: arbitrary inbound JSON → `CanonicalJobRequest`.
//!
//! Without a mapping profile the body must already be a canonical job
//! request (strict mode, unknown fields rejected). With a profile, each
//! rule copies one value from a dotted source path into a canonical
//! field, coercing it on the way. Everything not named by a rule is
//! dropped. Normalization is pure: same input, same output.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::canonical;
use crate::error::{GateError, Result};
use crate::paths::validate_ident;

pub const SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// InputValue
// ---------------------------------------------------------------------------

/// Template inputs are scalars only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputValue {
    Bool(bool),
    Number(serde_json::Number),
    String(String),
}

impl InputValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            InputValue::Bool(b) => serde_json::Value::Bool(*b),
            InputValue::Number(n) => serde_json::Value::Number(n.clone()),
            InputValue::String(s) => serde_json::Value::String(s.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// CanonicalJobRequest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CanonicalJobRequest {
    #[serde(default = "default_version")]
    pub version: u32,
    pub template_id: String,
    pub profile_id: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
}

fn default_version() -> u32 {
    SCHEMA_VERSION
}

#[derive(Serialize)]
struct JobIdentity<'a> {
    template_id: &'a str,
    profile_id: &'a str,
    inputs: &'a BTreeMap<String, InputValue>,
}

impl CanonicalJobRequest {
    /// Digest of `(template_id, profile_id, inputs)`; the stable identity
    /// of a job when the caller did not name it.
    pub fn identity_digest(&self) -> Result<String> {
        canonical::digest(&JobIdentity {
            template_id: &self.template_id,
            profile_id: &self.profile_id,
            inputs: &self.inputs,
        })
    }

    /// Caller-supplied job id, or one derived from the identity digest.
    pub fn effective_job_id(&self) -> Result<String> {
        match &self.job_id {
            Some(id) => Ok(id.clone()),
            None => Ok(format!("job-{}", &self.identity_digest()?[..16])),
        }
    }

    pub fn idempotency_key(&self) -> Result<String> {
        match &self.job_id {
            Some(id) => Ok(id.clone()),
            None => Ok(format!("auto:{}", self.identity_digest()?)),
        }
    }

    fn check(&self) -> Result<()> {
        if self.version != SCHEMA_VERSION {
            return Err(GateError::SchemaInvalid(format!(
                "unsupported schema version {}",
                self.version
            )));
        }
        validate_ident("template_id", &self.template_id)?;
        if self.profile_id.trim().is_empty() {
            return Err(GateError::SchemaInvalid("profile_id must not be empty".into()));
        }
        if let Some(job_id) = &self.job_id {
            validate_ident("job_id", job_id)?;
        }
        for key in self.inputs.keys() {
            if key.is_empty() {
                return Err(GateError::SchemaInvalid("input names must not be empty".into()));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mapping profiles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coercion {
    String,
    Number,
    Bool,
    #[default]
    Passthrough,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingRule {
    /// Dotted path into the inbound body; numeric segments index arrays.
    pub source: String,
    /// `template_id`, `profile_id`, `job_id`, `trace_id`, `callback`, or `inputs.<name>`.
    pub target: String,
    #[serde(default)]
    pub coerce: Coercion,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingProfile {
    /// Constant values applied before the rules (rules override them).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub defaults: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub rules: Vec<MappingRule>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    TemplateId,
    ProfileId,
    JobId,
    TraceId,
    Callback,
    Input(String),
}

impl std::str::FromStr for Target {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "template_id" => Ok(Target::TemplateId),
            "profile_id" => Ok(Target::ProfileId),
            "job_id" => Ok(Target::JobId),
            "trace_id" => Ok(Target::TraceId),
            "callback" => Ok(Target::Callback),
            _ => match s.strip_prefix("inputs.") {
                Some(name) if !name.is_empty() => Ok(Target::Input(name.to_string())),
                _ => Err(GateError::SchemaInvalid(format!(
                    "unknown mapping target '{s}'"
                ))),
            },
        }
    }
}

impl MappingProfile {
    /// Static checks run at config load so a bad profile never reaches a request.
    pub fn validate(&self) -> Result<()> {
        for target in self.defaults.keys() {
            target.parse::<Target>()?;
        }
        for rule in &self.rules {
            rule.target.parse::<Target>()?;
            if rule.source.trim().is_empty() {
                return Err(GateError::SchemaInvalid(format!(
                    "mapping rule for '{}' has an empty source path",
                    rule.target
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// normalize
// ---------------------------------------------------------------------------

/// Parse raw body bytes and normalize them.
pub fn normalize_bytes(body: &[u8], profile: Option<&MappingProfile>) -> Result<CanonicalJobRequest> {
    let raw: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| GateError::SchemaInvalid(format!("body is not valid JSON: {e}")))?;
    normalize(&raw, profile)
}

pub fn normalize(raw: &serde_json::Value, profile: Option<&MappingProfile>) -> Result<CanonicalJobRequest> {
    let request = match profile {
        None => strict(raw)?,
        Some(p) => apply_profile(raw, p)?,
    };
    request.check()?;
    Ok(request)
}

fn strict(raw: &serde_json::Value) -> Result<CanonicalJobRequest> {
    if !raw.is_object() {
        return Err(GateError::SchemaInvalid("body must be a JSON object".into()));
    }
    serde_json::from_value(raw.clone()).map_err(|e| GateError::SchemaInvalid(e.to_string()))
}

#[derive(Default)]
struct Draft {
    template_id: Option<String>,
    profile_id: Option<String>,
    job_id: Option<String>,
    trace_id: Option<String>,
    callback: Option<String>,
    inputs: BTreeMap<String, InputValue>,
}

impl Draft {
    fn set(&mut self, target: Target, value: InputValue) {
        match target {
            Target::TemplateId => self.template_id = Some(scalar_to_string(&value)),
            Target::ProfileId => self.profile_id = Some(scalar_to_string(&value)),
            Target::JobId => self.job_id = Some(scalar_to_string(&value)),
            Target::TraceId => self.trace_id = Some(scalar_to_string(&value)),
            Target::Callback => self.callback = Some(scalar_to_string(&value)),
            Target::Input(name) => {
                self.inputs.insert(name, value);
            }
        }
    }
}

fn apply_profile(raw: &serde_json::Value, profile: &MappingProfile) -> Result<CanonicalJobRequest> {
    let mut draft = Draft::default();

    for (target, value) in &profile.defaults {
        let value = coerce(value, Coercion::Passthrough, target)?;
        draft.set(target.parse()?, value);
    }

    for rule in &profile.rules {
        let target: Target = rule.target.parse()?;
        match lookup(raw, &rule.source) {
            Some(v) if !v.is_null() => {
                let value = coerce(v, rule.coerce, &rule.source)?;
                draft.set(target, value);
            }
            _ if rule.required => {
                return Err(GateError::SchemaInvalid(format!(
                    "missing required source field '{}'",
                    rule.source
                )));
            }
            _ => {}
        }
    }

    Ok(CanonicalJobRequest {
        version: SCHEMA_VERSION,
        template_id: draft
            .template_id
            .ok_or_else(|| GateError::SchemaInvalid("missing required field 'template_id'".into()))?,
        profile_id: draft
            .profile_id
            .ok_or_else(|| GateError::SchemaInvalid("missing required field 'profile_id'".into()))?,
        inputs: draft.inputs,
        job_id: draft.job_id,
        trace_id: draft.trace_id,
        callback: draft.callback,
    })
}

/// Resolve a dotted path. Numeric segments index into arrays.
fn lookup<'a>(root: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    path.split('.').try_fold(root, |node, segment| match node {
        serde_json::Value::Object(map) => map.get(segment),
        serde_json::Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn coerce(value: &serde_json::Value, how: Coercion, source: &str) -> Result<InputValue> {
    use serde_json::Value;

    let fail = |want: &str| {
        GateError::SchemaInvalid(format!("field '{source}' cannot be coerced to {want}"))
    };

    match how {
        Coercion::Passthrough => match value {
            Value::Bool(b) => Ok(InputValue::Bool(*b)),
            Value::Number(n) => Ok(InputValue::Number(n.clone())),
            Value::String(s) => Ok(InputValue::String(s.clone())),
            _ => Err(fail("a scalar")),
        },
        Coercion::String => match value {
            Value::String(s) => Ok(InputValue::String(s.clone())),
            Value::Number(n) => Ok(InputValue::String(n.to_string())),
            Value::Bool(b) => Ok(InputValue::String(b.to_string())),
            _ => Err(fail("string")),
        },
        Coercion::Number => match value {
            Value::Number(n) => Ok(InputValue::Number(n.clone())),
            Value::String(s) => parse_number(s.trim()).map(InputValue::Number).ok_or_else(|| fail("number")),
            _ => Err(fail("number")),
        },
        Coercion::Bool => match value {
            Value::Bool(b) => Ok(InputValue::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Ok(InputValue::Bool(false)),
                Some(1) => Ok(InputValue::Bool(true)),
                _ => Err(fail("bool")),
            },
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(InputValue::Bool(true)),
                "false" | "0" | "no" => Ok(InputValue::Bool(false)),
                _ => Err(fail("bool")),
            },
            _ => Err(fail("bool")),
        },
    }
}

fn parse_number(s: &str) -> Option<serde_json::Number> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(i.into());
    }
    s.parse::<f64>().ok().and_then(serde_json::Number::from_f64)
}

fn scalar_to_string(value: &InputValue) -> String {
    match value {
        InputValue::String(s) => s.clone(),
        InputValue::Number(n) => n.to_string(),
        InputValue::Bool(b) => b.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn telegram_profile() -> MappingProfile {
        serde_yaml::from_str(
            r#"
defaults:
  template_id: portrait_v1
  profile_id: SDXL-v1
rules:
  - source: message.text
    target: inputs.requirements
    coerce: string
    required: true
  - source: message.message_id
    target: job_id
    coerce: string
  - source: message.photo.0.width
    target: inputs.width
    coerce: number
  - source: message.nsfw
    target: inputs.nsfw
    coerce: bool
"#,
        )
        .unwrap()
    }

    #[test]
    fn strict_mode_accepts_canonical_body() {
        let raw = json!({
            "template_id": "portrait_v1",
            "profile_id": "SDXL-v1",
            "inputs": {"requirements": "a cat", "steps": 20, "hd": true},
            "job_id": "abc123"
        });
        let req = normalize(&raw, None).unwrap();
        assert_eq!(req.version, 1);
        assert_eq!(req.job_id.as_deref(), Some("abc123"));
        assert_eq!(req.inputs["requirements"], InputValue::String("a cat".into()));
        assert_eq!(req.inputs["steps"], InputValue::Number(20.into()));
        assert_eq!(req.inputs["hd"], InputValue::Bool(true));
    }

    #[test]
    fn strict_mode_rejects_unknown_fields() {
        let raw = json!({"template_id": "t", "profile_id": "p", "extra": 1});
        let err = normalize(&raw, None).unwrap_err();
        assert!(matches!(err, GateError::SchemaInvalid(_)));
    }

    #[test]
    fn strict_mode_rejects_nested_inputs() {
        let raw = json!({"template_id": "t", "profile_id": "p", "inputs": {"a": {"b": 1}}});
        assert!(normalize(&raw, None).is_err());
    }

    #[test]
    fn strict_mode_rejects_non_object() {
        assert!(normalize(&json!([1, 2]), None).is_err());
        assert!(normalize_bytes(b"not json", None).is_err());
    }

    #[test]
    fn profile_maps_fixed_input_to_fixed_output() {
        let raw = json!({
            "update_id": 99,
            "message": {
                "message_id": 4211,
                "text": "a cat in a hat",
                "photo": [{"width": "512"}],
                "nsfw": "no",
                "chat": {"id": 1}
            }
        });
        let req = normalize(&raw, Some(&telegram_profile())).unwrap();
        let expected = CanonicalJobRequest {
            version: 1,
            template_id: "portrait_v1".into(),
            profile_id: "SDXL-v1".into(),
            inputs: BTreeMap::from([
                ("nsfw".to_string(), InputValue::Bool(false)),
                ("requirements".to_string(), InputValue::String("a cat in a hat".into())),
                ("width".to_string(), InputValue::Number(512.into())),
            ]),
            job_id: Some("4211".into()),
            trace_id: None,
            callback: None,
        };
        assert_eq!(req, expected);
    }

    #[test]
    fn profile_missing_required_source_fails() {
        let raw = json!({"message": {"message_id": 1}});
        let err = normalize(&raw, Some(&telegram_profile())).unwrap_err();
        assert!(err.to_string().contains("message.text"), "{err}");
    }

    #[test]
    fn profile_missing_optional_source_is_skipped() {
        let raw = json!({"message": {"text": "hi"}});
        let req = normalize(&raw, Some(&telegram_profile())).unwrap();
        assert!(req.job_id.is_none());
        assert_eq!(req.inputs.len(), 1);
    }

    #[test]
    fn profile_without_template_fails() {
        let profile = MappingProfile {
            defaults: BTreeMap::new(),
            rules: vec![MappingRule {
                source: "text".into(),
                target: "inputs.prompt".into(),
                coerce: Coercion::String,
                required: false,
            }],
        };
        let err = normalize(&json!({"text": "x"}), Some(&profile)).unwrap_err();
        assert!(err.to_string().contains("template_id"));
    }

    #[test]
    fn bad_coercion_fails() {
        let raw = json!({"message": {"text": "hi", "photo": [{"width": "wide"}]}});
        let err = normalize(&raw, Some(&telegram_profile())).unwrap_err();
        assert!(err.to_string().contains("number"));
    }

    #[test]
    fn unknown_target_is_rejected_by_validate() {
        let profile = MappingProfile {
            defaults: BTreeMap::new(),
            rules: vec![MappingRule {
                source: "a".into(),
                target: "outputs.x".into(),
                coerce: Coercion::Passthrough,
                required: false,
            }],
        };
        assert!(profile.validate().is_err());
        assert!(telegram_profile().validate().is_ok());
    }

    #[test]
    fn derived_job_id_is_deterministic() {
        let a = normalize(
            &json!({"template_id": "t", "profile_id": "p", "inputs": {"x": "1", "y": 2}}),
            None,
        )
        .unwrap();
        let b = normalize(
            &json!({"inputs": {"y": 2, "x": "1"}, "profile_id": "p", "template_id": "t"}),
            None,
        )
        .unwrap();
        assert_eq!(a.effective_job_id().unwrap(), b.effective_job_id().unwrap());
        assert!(a.effective_job_id().unwrap().starts_with("job-"));
        assert!(a.idempotency_key().unwrap().starts_with("auto:"));
    }

    #[test]
    fn caller_job_id_is_the_idempotency_key() {
        let req = normalize(
            &json!({"template_id": "t", "profile_id": "p", "job_id": "abc123"}),
            None,
        )
        .unwrap();
        assert_eq!(req.idempotency_key().unwrap(), "abc123");
        assert_eq!(req.effective_job_id().unwrap(), "abc123");
    }

    #[test]
    fn path_traversal_template_id_rejected() {
        let err = normalize(&json!({"template_id": "../x", "profile_id": "p"}), None).unwrap_err();
        assert!(matches!(err, GateError::SchemaInvalid(_)));
    }
}
