use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use crate::error::{GateError, Result};
use crate::paths::{self, validate_ident};

/// A job-definition template: a raw document with `{{key}}` placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Template {
    /// Filled from the file name when loaded from disk.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub allowed_inputs: BTreeSet<String>,
    #[serde(default)]
    pub requires_approval: bool,
    pub document: serde_json::Value,
}

impl Template {
    /// Input names not declared in `allowed_inputs`, sorted.
    pub fn undeclared<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        names
            .into_iter()
            .filter(|n| !self.allowed_inputs.contains(*n))
            .cloned()
            .collect()
    }
}

pub trait TemplateStore: Send + Sync {
    fn get(&self, template_id: &str) -> Result<Template>;
}

// ---------------------------------------------------------------------------
// DirTemplateStore
// ---------------------------------------------------------------------------

/// Reads `<dir>/<id>.yaml` or `<dir>/<id>.json` on every lookup so edits
/// take effect without a restart.
pub struct DirTemplateStore {
    dir: PathBuf,
}

impl DirTemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn for_root(root: &Path) -> Self {
        Self::new(paths::templates_dir(root))
    }
}

impl TemplateStore for DirTemplateStore {
    fn get(&self, template_id: &str) -> Result<Template> {
        validate_ident("template_id", template_id)?;
        for ext in ["yaml", "yml", "json"] {
            let path = self.dir.join(format!("{template_id}.{ext}"));
            if path.exists() {
                let data = std::fs::read_to_string(&path)?;
                let mut template: Template = serde_yaml::from_str(&data)?;
                template.id = template_id.to_string();
                return Ok(template);
            }
        }
        Err(GateError::TemplateNotFound(template_id.to_string()))
    }
}

// ---------------------------------------------------------------------------
// MemoryTemplateStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryTemplateStore {
    templates: HashMap<String, Template>,
}

impl MemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, template: Template) -> Self {
        self.templates.insert(template.id.clone(), template);
        self
    }
}

impl TemplateStore for MemoryTemplateStore {
    fn get(&self, template_id: &str) -> Result<Template> {
        self.templates
            .get(template_id)
            .cloned()
            .ok_or_else(|| GateError::TemplateNotFound(template_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PORTRAIT: &str = r#"
description: Portrait generation
allowed_inputs: [requirements, steps]
document:
  prompt: "{{requirements}}"
  sampler:
    steps: "{{steps}}"
"#;

    #[test]
    fn dir_store_loads_yaml_and_sets_id() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("portrait_v1.yaml"), PORTRAIT).unwrap();
        let store = DirTemplateStore::new(dir.path());
        let t = store.get("portrait_v1").unwrap();
        assert_eq!(t.id, "portrait_v1");
        assert!(t.allowed_inputs.contains("requirements"));
        assert!(!t.requires_approval);
        assert_eq!(t.document["prompt"], "{{requirements}}");
    }

    #[test]
    fn dir_store_loads_json() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("upscale.json"),
            r#"{"allowed_inputs":["image"],"requires_approval":true,"document":{"img":"{{image}}"}}"#,
        )
        .unwrap();
        let t = DirTemplateStore::new(dir.path()).get("upscale").unwrap();
        assert!(t.requires_approval);
    }

    #[test]
    fn dir_store_missing_template() {
        let dir = TempDir::new().unwrap();
        let err = DirTemplateStore::new(dir.path()).get("nope").unwrap_err();
        assert!(matches!(err, GateError::TemplateNotFound(_)));
    }

    #[test]
    fn dir_store_rejects_traversal_ids() {
        let dir = TempDir::new().unwrap();
        let err = DirTemplateStore::new(dir.path()).get("../secret").unwrap_err();
        assert!(matches!(err, GateError::SchemaInvalid(_)));
    }

    #[test]
    fn undeclared_inputs_are_reported() {
        let t: Template = serde_yaml::from_str(PORTRAIT).unwrap();
        let names = vec!["requirements".to_string(), "seed".to_string()];
        assert_eq!(t.undeclared(&names), vec!["seed".to_string()]);
    }
}
