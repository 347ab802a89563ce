//! `superego flows`: List, validate, and add flow definitions.

use std::path::{Path, PathBuf};

use superego_config::AppConfig;
use superego_core::error::FlowError;
use superego_core::flow::{FlowDefinition, NodeConfig};
use superego_core::store::FlowStore;
use superego_core::tool::ToolRegistry;

pub async fn list(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_store(config).await?;
    let mut definitions = store.list_flow_definitions().await?;
    definitions.sort_by(|a, b| a.id.cmp(&b.id));

    if definitions.is_empty() {
        println!(
            "  No flow definitions found; run `superego onboard` or `superego flows add <file>`"
        );
        return Ok(());
    }

    for def in &definitions {
        let state = match def.validate() {
            Ok(()) => "ok".to_string(),
            Err(e) => format!("invalid: {e}"),
        };
        println!(
            "  {:<24} {:<32} {} nodes, start={} [{}]",
            def.id,
            def.name,
            def.nodes.len(),
            def.start,
            state
        );
    }
    Ok(())
}

pub async fn validate(
    config: &AppConfig,
    file: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let definitions = match file {
        Some(path) => vec![read_definition(&path)?],
        None => super::open_store(config).await?.list_flow_definitions().await?,
    };

    let tools = superego_tools::default_registry();
    let mut failures = 0;
    for def in &definitions {
        match check(def, &tools) {
            Ok(notes) => {
                println!("  ✅ {}", def.id);
                for note in notes {
                    println!("     ⚠️  {note}");
                }
            }
            Err(e) => {
                failures += 1;
                println!("  ❌ {}: {e}", def.id);
            }
        }
    }

    if failures > 0 {
        return Err(format!("{failures} invalid flow definition(s)").into());
    }
    Ok(())
}

pub async fn add(config: &AppConfig, file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let def = read_definition(file)?;
    def.validate()?;
    let store = super::definition_store(config);
    store.save_flow_definition(&def).await?;
    println!("✅ Saved flow '{}' to {}", def.id, store.flows_dir().display());
    Ok(())
}

fn read_definition(path: &Path) -> Result<FlowDefinition, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
    let def =
        toml::from_str(&text).map_err(|e| format!("Failed to parse {}: {e}", path.display()))?;
    Ok(def)
}

/// Validate a definition; `Ok` carries non-fatal notes.
fn check(def: &FlowDefinition, tools: &ToolRegistry) -> Result<Vec<String>, FlowError> {
    def.validate()?;
    let mut notes: Vec<String> = def
        .uncovered_decisions()
        .into_iter()
        .map(|(node, decision)| {
            format!("node '{node}' has no transition for {decision}; the instance would end with an error")
        })
        .collect();

    for (id, node) in &def.nodes {
        if let NodeConfig::InnerAgent(agent) = node {
            for tool in agent.tools.iter().filter(|t| tools.get(t.as_str()).is_none()) {
                notes.push(format!(
                    "node '{id}' lists tool '{tool}', which is not installed; calls to it end in ERROR"
                ));
            }
        }
    }
    Ok(notes)
}
