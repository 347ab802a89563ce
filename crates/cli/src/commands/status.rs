//! `superego status`: Show configuration and stored state.

use std::collections::BTreeMap;

use superego_config::{AppConfig, StorageBackend};

pub async fn run(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("Superego Status");
    println!("===============");
    println!("  Config dir:   {}", AppConfig::config_dir().display());
    println!("  Provider:     {}", config.default_provider);
    println!("  Model:        {}", config.effective_model());
    println!("  Temperature:  {}", config.default_temperature);
    println!("  API key:      {}", if config.has_api_key() { "configured" } else { "missing" });
    println!("  Gateway:      {}:{}", config.gateway.host, config.gateway.port);
    println!("  Tools:        {}", superego_tools::default_registry().names().join(", "));
    println!(
        "  Timeout:      {}",
        match config.engine.timeout_secs {
            0 => "none".to_string(),
            secs => format!("{secs}s"),
        }
    );

    let data_dir = config.storage.resolved_data_dir();
    let backend = match config.storage.backend {
        StorageBackend::Memory => "memory",
        StorageBackend::File => "file",
    };
    println!("  Storage:      {backend} ({})", data_dir.display());

    let store = super::open_store(config).await?;
    let flows = store.list_flow_definitions().await?;
    println!("  Flows:        {}", flows.len());

    if config.storage.backend == StorageBackend::File {
        let instances = store.list_instances().await?;
        let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
        for instance in &instances {
            *by_status.entry(instance.status.to_string()).or_default() += 1;
        }
        println!("  Instances:    {}", instances.len());
        for (status, count) in by_status {
            println!("    {status:<12} {count}");
        }
    }

    if AppConfig::config_path().exists() {
        println!("\n  ✅ Config file found");
    } else {
        println!("\n  ⚠️  No config file; run `superego onboard` first");
    }

    Ok(())
}
