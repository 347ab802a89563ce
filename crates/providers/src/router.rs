//! Provider router: selects the LLM provider a node talks to.

use std::collections::HashMap;
use std::sync::Arc;
use superego_config::AppConfig;
use superego_core::error::ProviderError;
use superego_core::provider::Provider;

use crate::openai_compat::OpenAiCompatProvider;

/// Named providers plus a default.
pub struct ProviderRouter {
    providers: HashMap<String, Arc<dyn Provider>>,
    default_provider: String,
}

impl ProviderRouter {
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: default_provider.into(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn default_provider(&self) -> Option<Arc<dyn Provider>> {
        self.providers.get(&self.default_provider).cloned()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// Split a node model string into provider and model.
    ///
    /// `"ollama:llama3"` selects the registered `ollama` provider; anything
    /// without a known `name:` prefix goes to the default provider unchanged.
    pub fn resolve(&self, model: &str) -> Result<(Arc<dyn Provider>, String), ProviderError> {
        if let Some((prefix, rest)) = model.split_once(':')
            && let Some(provider) = self.get(prefix)
        {
            return Ok((provider, rest.to_string()));
        }
        self.default_provider()
            .map(|p| (p, model.to_string()))
            .ok_or_else(|| ProviderError::NotConfigured(self.default_provider.clone()))
    }

    /// Registered provider names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

/// Build providers from configuration.
pub fn build_from_config(config: &AppConfig) -> Result<ProviderRouter, ProviderError> {
    let mut router = ProviderRouter::new(&config.default_provider);

    for (name, provider_config) in &config.providers {
        let api_key = provider_config
            .api_key
            .clone()
            .or_else(|| config.api_key.clone())
            .unwrap_or_default();
        let base_url = provider_config
            .api_url
            .clone()
            .unwrap_or_else(|| default_base_url(name));
        router.register(
            name.clone(),
            Arc::new(OpenAiCompatProvider::new(name, base_url, api_key)?),
        );
    }

    if router.get(&config.default_provider).is_none() {
        let provider = OpenAiCompatProvider::new(
            &config.default_provider,
            default_base_url(&config.default_provider),
            config.api_key.clone().unwrap_or_default(),
        )?;
        router.register(config.default_provider.clone(), Arc::new(provider));
    }

    Ok(router)
}

/// Base URL for well-known OpenAI-compatible providers.
pub fn default_base_url(provider_name: &str) -> String {
    match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1".into(),
        "openai" => "https://api.openai.com/v1".into(),
        "ollama" => "http://localhost:11434/v1".into(),
        "groq" => "https://api.groq.com/openai/v1".into(),
        "together" => "https://api.together.xyz/v1".into(),
        "vllm" => "http://localhost:8000/v1".into(),
        "llamacpp" | "llama.cpp" => "http://localhost:8080/v1".into(),
        other => format!("http://localhost:8080/{other}/v1"),
    }
}
