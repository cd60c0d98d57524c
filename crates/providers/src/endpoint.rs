//! Resolves the model endpoint turns are sent to.
//!
//! Exactly one provider is active: `default_provider`. A `[providers.<name>]`
//! table for it may override the URL, key and model; well-known names need
//! no table at all.

use std::sync::Arc;

use deepsearch_config::AppConfig;
use deepsearch_core::error::ProviderError;
use deepsearch_core::provider::Provider;
use tracing::debug;

use crate::openai_compat::OpenAiCompatProvider;

/// The provider a turn talks to, and the model it asks for.
pub struct ModelEndpoint {
    pub provider: Arc<dyn Provider>,
    pub model: String,
}

/// Build the endpoint for `config.default_provider`.
pub fn resolve(config: &AppConfig) -> Result<ModelEndpoint, ProviderError> {
    let name = config.default_provider.as_str();
    let overrides = config.providers.get(name);

    let base_url = overrides
        .and_then(|p| p.api_url.clone())
        .or_else(|| well_known_base_url(name).map(str::to_string))
        .ok_or_else(|| {
            ProviderError::NotConfigured(format!(
                "provider '{name}' needs an api_url in [providers.{name}]"
            ))
        })?;

    let api_key = overrides
        .and_then(|p| p.api_key.clone())
        .or_else(|| config.api_key.clone());
    let api_key = match api_key {
        Some(key) => key,
        None if is_local(&base_url) => String::new(),
        None => {
            return Err(ProviderError::NotConfigured(format!(
                "no API key for provider '{name}'"
            )));
        }
    };

    let model = overrides
        .and_then(|p| p.default_model.clone())
        .unwrap_or_else(|| config.default_model.clone());

    debug!(provider = name, base_url = %base_url, model = %model, "Resolved model endpoint");
    Ok(ModelEndpoint {
        provider: Arc::new(OpenAiCompatProvider::new(name, base_url, api_key)),
        model,
    })
}

fn well_known_base_url(name: &str) -> Option<&'static str> {
    match name {
        "openrouter" => Some("https://openrouter.ai/api/v1"),
        "openai" => Some("https://api.openai.com/v1"),
        "groq" => Some("https://api.groq.com/openai/v1"),
        "together" => Some("https://api.together.xyz/v1"),
        "ollama" => Some("http://localhost:11434/v1"),
        "vllm" => Some("http://localhost:8000/v1"),
        _ => None,
    }
}

/// Local servers run without a key.
fn is_local(base_url: &str) -> bool {
    ["http://localhost", "http://127.0.0.1"]
        .iter()
        .any(|prefix| base_url.starts_with(prefix))
}
