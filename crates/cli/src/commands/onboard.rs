//! `superego onboard`: First-time setup.

use super::EXAMPLE_FLOW;
use superego_config::AppConfig;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config_dir = AppConfig::config_dir();
    let config_path = AppConfig::config_path();

    println!("Superego: First-Time Setup");
    println!("===========================\n");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
        println!("✅ Created config directory: {}", config_dir.display());
    } else {
        println!("  Config directory exists: {}", config_dir.display());
    }

    if config_path.exists() {
        println!("⚠️  Config already exists at: {}", config_path.display());
        println!("   Edit it manually or delete and re-run onboard.");
    } else {
        std::fs::write(&config_path, AppConfig::default_toml())?;
        println!("✅ Created config.toml at: {}", config_path.display());
    }

    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let flows_dir = config.storage.resolved_data_dir().join("flows");
    std::fs::create_dir_all(&flows_dir)?;
    let flow_path = flows_dir.join("guarded_calculator.toml");
    if flow_path.exists() {
        println!("  Example flow exists: {}", flow_path.display());
    } else {
        std::fs::write(&flow_path, EXAMPLE_FLOW)?;
        println!("✅ Created example flow: {}", flow_path.display());
    }

    println!("\n📝 Next steps:");
    if !config.has_api_key() {
        println!("   1. Set an API key: export OPENROUTER_API_KEY=sk-or-...");
    } else {
        println!("   1. API key found");
    }
    println!("   2. Try it: superego run guarded_calculator --input \"What is 5 * 10?\"");
    println!("   3. Serve it: superego gateway");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use superego_core::flow::FlowDefinition;

    #[test]
    fn example_flow_is_valid() {
        let definition: FlowDefinition = toml::from_str(EXAMPLE_FLOW).unwrap();
        definition.validate().unwrap();
        assert_eq!(definition.id, "guarded_calculator");
        assert!(definition.uncovered_decisions().is_empty());
    }
}
