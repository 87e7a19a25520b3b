//! Provider router — selects the correct LLM provider based on config.
//!
//! Handles provider creation and routing "provider/model" strings to the
//! right backend.

use std::collections::HashMap;
use std::sync::Arc;
use agentry_core::provider::Provider;
use crate::openai_compat::OpenAiCompatProvider;

/// Routes LLM requests to the correct provider.
#[derive(Clone)]
pub struct ProviderRouter {
    providers: HashMap<String, Arc<dyn Provider>>,
    default_provider: String,
}

impl ProviderRouter {
    /// Create a new router with a default provider.
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: default_provider.into(),
        }
    }

    /// Register a provider.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(name.into(), provider);
    }

    /// Get the default provider.
    pub fn default(&self) -> Option<Arc<dyn Provider>> {
        self.providers.get(&self.default_provider).cloned()
    }

    /// Get a specific provider by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// Resolve a "provider/model" string to a provider and the bare model name.
    ///
    /// A string whose prefix is not a registered provider is sent as-is to the
    /// default provider (model ids such as "deepseek-ai/DeepSeek-V3" contain slashes).
    pub fn resolve(&self, model: &str) -> Option<(Arc<dyn Provider>, String)> {
        if let Some((provider, name)) = model.split_once('/')
            && let Some(p) = self.get(provider)
        {
            return Some((p, name.to_string()));
        }

        self.default().map(|p| (p, model.to_string()))
    }

    /// List all registered provider names.
    pub fn list(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }
}

/// Build providers from configuration.
pub fn build_from_config(
    config: &agentry_config::AppConfig,
) -> ProviderRouter {
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
            Arc::new(OpenAiCompatProvider::new(name, &base_url, &api_key)),
        );
    }

    // Ensure the default provider exists (even if not explicitly configured)
    if router.get(&config.default_provider).is_none() {
        let api_key = config.api_key.clone().unwrap_or_default();
        let base_url = default_base_url(&config.default_provider);

        router.register(
            config.default_provider.clone(),
            Arc::new(OpenAiCompatProvider::new(
                &config.default_provider,
                &base_url,
                &api_key,
            )),
        );
    }

    router
}

/// Get the default base URL for well-known providers.
fn default_base_url(provider_name: &str) -> String {
    match provider_name {
        "openai" => "https://api.openai.com/v1".into(),
        "openrouter" => "https://openrouter.ai/api/v1".into(),
        "dashscope" => "https://dashscope.aliyuncs.com/compatible-mode/v1".into(),
        "deepseek" => "https://api.deepseek.com/v1".into(),
        "ollama" => "http://localhost:11434/v1".into(),
        "vllm" => "http://localhost:8000/v1".into(),
        _ => format!("https://{provider_name}.api.example.com/v1"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_register_and_lookup() {
        let mut router = ProviderRouter::new("openai");
        router.register("openai", Arc::new(OpenAiCompatProvider::openai("sk-test")));

        assert!(router.get("openai").is_some());
        assert!(router.get("nonexistent").is_none());
        assert!(router.default().is_some());
    }

    #[test]
    fn resolve_splits_known_provider_prefix() {
        let mut router = ProviderRouter::new("openai");
        router.register("openai", Arc::new(OpenAiCompatProvider::openai("sk")));
        router.register("ollama", Arc::new(OpenAiCompatProvider::ollama(None)));

        let (provider, model) = router.resolve("ollama/qwen2.5:7b").unwrap();
        assert_eq!(provider.name(), "ollama");
        assert_eq!(model, "qwen2.5:7b");

        let (provider, model) = router.resolve("deepseek-ai/DeepSeek-V3").unwrap();
        assert_eq!(provider.name(), "openai");
        assert_eq!(model, "deepseek-ai/DeepSeek-V3");

        let (_, model) = router.resolve("gpt-4o").unwrap();
        assert_eq!(model, "gpt-4o");
    }

    #[test]
    fn default_base_urls() {
        assert!(default_base_url("openai").contains("api.openai.com"));
        assert!(default_base_url("dashscope").contains("dashscope"));
        assert!(default_base_url("ollama").contains("localhost:11434"));
    }

    #[test]
    fn build_from_default_config() {
        let config = agentry_config::AppConfig::default();
        let router = build_from_config(&config);
        assert!(router.default().is_some());
        assert_eq!(router.list(), vec!["openai"]);
    }
}
