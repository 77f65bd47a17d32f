//! Strict placeholder substitution into a template document.
//!
//! A JSON string value is replaced only when it is exactly `{{key}}` and
//! `key` is a supplied input; the replacement keeps the input's JSON type.
//! Placeholders embedded in longer strings are never expanded. Whatever
//! placeholders survive are reported as warnings, not errors.

use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::error::{GateError, Result};
use crate::normalize::InputValue;
use crate::template::Template;

/// Compiled-in budget used when the configuration does not set one.
pub const DEFAULT_MAX_RENDER_BYTES: usize = 256 * 1024;

fn exact_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\{\{([A-Za-z0-9_.-]+)\}\}$").expect("static regex"))
}

fn any_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([A-Za-z0-9_.-]+)\}\}").expect("static regex"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderWarning {
    pub placeholder: String,
    /// JSON pointer of the string that still contains the placeholder.
    pub path: String,
    /// True when the placeholder sits inside a longer string.
    pub embedded: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub document: serde_json::Value,
    pub size_bytes: usize,
    pub warnings: Vec<RenderWarning>,
}

pub fn render_template(
    template: &Template,
    inputs: &BTreeMap<String, InputValue>,
    max_bytes: usize,
) -> Result<Rendered> {
    let mut document = template.document.clone();
    substitute(&mut document, inputs);

    let size_bytes = serde_json::to_vec(&document)?.len();
    if size_bytes > max_bytes {
        return Err(GateError::RenderTooLarge {
            size: size_bytes,
            limit: max_bytes,
        });
    }

    let mut warnings = Vec::new();
    collect_warnings(&document, &mut String::new(), &mut warnings);

    Ok(Rendered {
        document,
        size_bytes,
        warnings,
    })
}

fn substitute(node: &mut serde_json::Value, inputs: &BTreeMap<String, InputValue>) {
    use serde_json::Value;
    match node {
        Value::String(s) => {
            let replacement = exact_re()
                .captures(s)
                .and_then(|c| inputs.get(&c[1]))
                .map(InputValue::to_json);
            if let Some(value) = replacement {
                *node = value;
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| substitute(v, inputs)),
        Value::Object(map) => map.values_mut().for_each(|v| substitute(v, inputs)),
        _ => {}
    }
}

fn collect_warnings(node: &serde_json::Value, path: &mut String, out: &mut Vec<RenderWarning>) {
    use serde_json::Value;
    match node {
        Value::String(s) => {
            let embedded = !exact_re().is_match(s);
            for cap in any_re().captures_iter(s) {
                out.push(RenderWarning {
                    placeholder: cap[1].to_string(),
                    path: if path.is_empty() { "/".into() } else { path.clone() },
                    embedded,
                });
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                let len = path.len();
                path.push('/');
                path.push_str(&i.to_string());
                collect_warnings(v, path, out);
                path.truncate(len);
            }
        }
        Value::Object(map) => {
            for (k, v) in map {
                let len = path.len();
                path.push('/');
                path.push_str(&k.replace('~', "~0").replace('/', "~1"));
                collect_warnings(v, path, out);
                path.truncate(len);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn template(document: serde_json::Value) -> Template {
        Template {
            id: "portrait_v1".into(),
            description: None,
            allowed_inputs: BTreeSet::from(["requirements".to_string(), "steps".to_string()]),
            requires_approval: false,
            document,
        }
    }

    fn inputs() -> BTreeMap<String, InputValue> {
        BTreeMap::from([
            ("requirements".to_string(), InputValue::String("a cat".into())),
            ("steps".to_string(), InputValue::Number(30.into())),
        ])
    }

    #[test]
    fn exact_placeholders_are_replaced_with_typed_values() {
        let t = template(json!({
            "nodes": [{"prompt": "{{requirements}}"}, {"steps": "{{steps}}"}]
        }));
        let out = render_template(&t, &inputs(), DEFAULT_MAX_RENDER_BYTES).unwrap();
        assert_eq!(out.document["nodes"][0]["prompt"], "a cat");
        assert_eq!(out.document["nodes"][1]["steps"], 30);
        assert!(out.warnings.is_empty());
        assert_eq!(out.size_bytes, serde_json::to_vec(&out.document).unwrap().len());
    }

    #[test]
    fn embedded_placeholders_are_left_alone() {
        let t = template(json!({"caption": "a {{requirements}} b"}));
        let out = render_template(&t, &inputs(), DEFAULT_MAX_RENDER_BYTES).unwrap();
        assert_eq!(out.document["caption"], "a {{requirements}} b");
        assert_eq!(
            out.warnings,
            vec![RenderWarning {
                placeholder: "requirements".into(),
                path: "/caption".into(),
                embedded: true,
            }]
        );
    }

    #[test]
    fn unresolved_placeholders_stay_literal_with_warning() {
        let t = template(json!({"a": "{{seed}}", "b": ["{{requirements}}"]}));
        let out = render_template(&t, &inputs(), DEFAULT_MAX_RENDER_BYTES).unwrap();
        assert_eq!(out.document["a"], "{{seed}}");
        assert_eq!(out.document["b"][0], "a cat");
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(out.warnings[0].placeholder, "seed");
        assert_eq!(out.warnings[0].path, "/a");
        assert!(!out.warnings[0].embedded);
    }

    #[test]
    fn fully_resolved_template_fits_budget() {
        let t = template(json!({"p": "{{requirements}}", "s": "{{steps}}"}));
        let out = render_template(&t, &inputs(), 64).unwrap();
        assert!(out.size_bytes <= 64);
        let text = serde_json::to_string(&out.document).unwrap();
        assert!(!text.contains("{{"));
    }

    #[test]
    fn oversize_render_is_rejected_not_truncated() {
        let big = "x".repeat(200);
        let t = template(json!({"p": "{{requirements}}"}));
        let inputs = BTreeMap::from([("requirements".to_string(), InputValue::String(big))]);
        let err = render_template(&t, &inputs, 100).unwrap_err();
        match err {
            GateError::RenderTooLarge { size, limit } => {
                assert!(size > 100);
                assert_eq!(limit, 100);
            }
            other => panic!("expected RenderTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn object_keys_are_not_substituted() {
        let t = template(json!({"{{requirements}}": 1}));
        let out = render_template(&t, &inputs(), DEFAULT_MAX_RENDER_BYTES).unwrap();
        assert!(out.document.get("{{requirements}}").is_some());
    }
}
