use std::collections::HashMap;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::errors::{MirrorClawError, MirrorClawResult};
use crate::llm::provider::ModelClient;
use crate::llm::providers::openai_compatible::OpenAiCompatibleProvider;
use crate::llm::types::CallConfig;

/// Every configured model client, keyed by its config.toml identifier.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ModelClient>>,
    active: String,
}

impl ProviderRegistry {
    pub fn new(active: String) -> Self {
        Self {
            providers: HashMap::new(),
            active,
        }
    }

    pub fn register(&mut self, provider: Arc<dyn ModelClient>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get_active(&self) -> MirrorClawResult<Arc<dyn ModelClient>> {
        self.providers.get(&self.active).cloned().ok_or_else(|| {
            MirrorClawError::Config(format!("Active provider '{}' not found in registry", self.active))
        })
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build a registry from the loaded app config.
    /// API keys are read from `MIRRORCLAW_<ID>_API_KEY`, falling back to the file.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut registry = Self::new(config.llm.active_provider.clone());
        for (id, entry) in &config.llm.providers {
            let api_key = std::env::var(format!("MIRRORCLAW_{}_API_KEY", id.to_uppercase()))
                .ok()
                .filter(|k| !k.is_empty())
                .unwrap_or_else(|| entry.api_key.clone().unwrap_or_default());
            let call = CallConfig {
                model: entry.model.clone(),
                temperature: entry.temperature,
                top_p: entry.top_p,
                max_tokens: entry.max_tokens,
                stream: entry.stream,
            };
            tracing::debug!(provider = %id, model = %entry.model, "registering model provider");
            registry.register(Arc::new(OpenAiCompatibleProvider::new(
                id.clone(),
                &entry.api_base,
                api_key,
                call,
            )));
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[test]
    fn active_provider_is_resolved_from_config() {
        let cfg = parse_config(
            r#"
[llm]
active_provider = "b"

[llm.providers.a]
display_name = "A"
api_base = "http://a/v1"
model = "m-a"

[llm.providers.b]
display_name = "B"
api_base = "http://b/v1"
model = "m-b"
"#,
        )
        .unwrap();
        let registry = ProviderRegistry::from_config(&cfg);
        assert_eq!(registry.list_names(), vec!["a", "b"]);
        assert_eq!(registry.get_active().unwrap().name(), "b");
    }

    #[test]
    fn missing_active_provider_is_a_config_error() {
        let registry = ProviderRegistry::new("nope".into());
        assert!(matches!(registry.get_active(), Err(MirrorClawError::Config(_))));
    }
}
