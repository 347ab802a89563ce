pub mod flows;
pub mod gateway;
pub mod onboard;
pub mod run;
pub mod status;

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use superego_config::{AppConfig, StorageBackend};
use superego_core::flow::FlowDefinition;
use superego_core::store::FlowStore;
use superego_flow::{AuditSink, FlowEngine, GenerationSettings, NodeRegistry};
use superego_store::{FileFlowStore, InMemoryFlowStore};

/// The example flow shipped with the binary.
pub const EXAMPLE_FLOW: &str = include_str!("../../flows/guarded_calculator.toml");

/// The persistence collaborator selected by `[storage]`.
///
/// Definitions always live under `<data_dir>/flows`. The memory backend
/// loads them at startup and keeps only instances in memory.
pub async fn open_store(config: &AppConfig) -> Result<Arc<dyn FlowStore>, Box<dyn Error>> {
    let definitions = definition_store(config);
    match config.storage.backend {
        StorageBackend::File => Ok(Arc::new(definitions)),
        StorageBackend::Memory => {
            let seeded = seed_definitions(&definitions).await?;
            debug!(flows = seeded.len(), "Memory store seeded");
            Ok(Arc::new(InMemoryFlowStore::with_definitions(seeded)))
        }
    }
}

/// Where `flows add` writes, whichever backend holds instances.
pub fn definition_store(config: &AppConfig) -> FileFlowStore {
    FileFlowStore::new(config.storage.resolved_data_dir())
}

/// Stored definitions plus the example flow when no stored one has its id.
async fn seed_definitions(source: &FileFlowStore) -> Result<Vec<FlowDefinition>, Box<dyn Error>> {
    let mut definitions = source.list_flow_definitions().await?;
    let example: FlowDefinition = toml::from_str(EXAMPLE_FLOW)?;
    if !definitions.iter().any(|def| def.id == example.id) {
        definitions.push(example);
    }
    Ok(definitions)
}

/// Wire providers, tools, store, and audit into an engine.
pub async fn build_engine(
    config: &AppConfig,
    audit: Arc<dyn AuditSink>,
) -> Result<FlowEngine, Box<dyn Error>> {
    let router = superego_providers::build_from_config(config)
        .map_err(|e| format!("Failed to configure providers: {e}"))?;
    let tools = Arc::new(superego_tools::default_registry());
    let settings = GenerationSettings {
        default_model: config.effective_model().to_string(),
        temperature: config.default_temperature,
        max_tokens: Some(config.default_max_tokens),
    };

    let registry = NodeRegistry::standard(Arc::new(router), tools, settings);
    let timeout = (config.engine.timeout_secs > 0)
        .then(|| Duration::from_secs(config.engine.timeout_secs));

    let store = open_store(config).await?;
    debug!(
        provider = %config.default_provider,
        model = %config.effective_model(),
        store = store.name(),
        timeout_secs = config.engine.timeout_secs,
        "Engine configured"
    );

    Ok(FlowEngine::new(registry, store)
        .with_audit(audit)
        .with_timeout(timeout)
        .with_event_buffer(config.engine.event_buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use superego_config::StorageConfig;

    fn memory_config(dir: &std::path::Path) -> AppConfig {
        AppConfig {
            storage: StorageConfig {
                backend: StorageBackend::Memory,
                data_dir: Some(dir.to_path_buf()),
            },
            ..AppConfig::default()
        }
    }

    #[tokio::test]
    async fn memory_store_starts_with_the_example_flow() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&memory_config(dir.path())).await.unwrap();

        assert_eq!(store.name(), "memory");
        let def = store.load_flow_definition("guarded_calculator").await.unwrap();
        assert_eq!(def.start, "input_superego");
    }

    #[tokio::test]
    async fn memory_store_loads_definitions_from_the_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = memory_config(dir.path());
        let custom = EXAMPLE_FLOW.replace(
            "id = \"guarded_calculator\"",
            "id = \"custom\"",
        );
        let def: FlowDefinition = toml::from_str(&custom).unwrap();
        definition_store(&config).save_flow_definition(&def).await.unwrap();

        let store = open_store(&config).await.unwrap();
        let mut ids: Vec<String> = store
            .list_flow_definitions()
            .await
            .unwrap()
            .into_iter()
            .map(|def| def.id)
            .collect();
        ids.sort();
        assert_eq!(ids, ["custom", "guarded_calculator"]);
    }

    #[tokio::test]
    async fn file_store_uses_the_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = memory_config(dir.path());
        config.storage.backend = StorageBackend::File;

        let store = open_store(&config).await.unwrap();
        assert_eq!(store.name(), "file");
        assert!(store.list_flow_definitions().await.unwrap().is_empty());
    }
}
