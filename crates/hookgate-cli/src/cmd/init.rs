use anyhow::Context;
use hookgate_core::{config::Config, io, paths};
use std::path::Path;

const EXAMPLE_TEMPLATE_ID: &str = "example_v1";

const EXAMPLE_TEMPLATE: &str = r#"description: Example job template. Copy it and edit the document.
allowed_inputs:
  - requirements
  - steps
requires_approval: false
document:
  prompt: "{{requirements}}"
  sampler:
    steps: "{{steps}}"
"#;

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing hookgate in: {}", root.display());

    // 1. Directory tree
    for dir in [paths::HOOKGATE_DIR, paths::TEMPLATES_DIR, paths::APPROVALS_DIR] {
        let p = root.join(dir);
        io::ensure_dir(&p).with_context(|| format!("failed to create {}", p.display()))?;
    }

    // 2. config.yaml, never overwritten
    let config_path = paths::config_path(root);
    if !config_path.exists() {
        Config::default()
            .save(root)
            .context("failed to write config.yaml")?;
        println!("  created: {}", paths::CONFIG_FILE);
    } else {
        println!("  exists:  {}", paths::CONFIG_FILE);
    }

    // 3. Example template
    let template_path = paths::templates_dir(root).join(format!("{EXAMPLE_TEMPLATE_ID}.yaml"));
    let rel = format!("{}/{EXAMPLE_TEMPLATE_ID}.yaml", paths::TEMPLATES_DIR);
    if io::write_if_missing(&template_path, EXAMPLE_TEMPLATE.as_bytes())
        .with_context(|| format!("failed to write {rel}"))?
    {
        println!("  created: {rel}");
    } else {
        println!("  exists:  {rel}");
    }

    println!(
        "\nInbound requests are refused until auth.mode and a secret are set in {}.",
        paths::CONFIG_FILE
    );
    Ok(())
}
