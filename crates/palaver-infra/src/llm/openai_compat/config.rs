//! Configuration for the OpenAI-compatible backend.
//!
//! Built from the flat `[backends.openai]` key/value map. `api_key` and
//! `model` are required; `base_url` defaults to the public OpenAI endpoint.

use secrecy::SecretString;

use palaver_types::backend::BackendConfig;
use palaver_types::error::GatewayError;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Configuration for an OpenAI-compatible backend.
///
/// Does not derive Debug so the API key never ends up in logs.
pub struct OpenAiCompatConfig {
    /// Tag the backend was registered under (e.g., "openai").
    pub provider_name: String,
    /// Base URL for the API (e.g., "https://api.openai.com/v1").
    pub base_url: String,
    pub api_key: SecretString,
    /// Model identifier (e.g., "gpt-4o-mini").
    pub model: String,
}

impl OpenAiCompatConfig {
    /// Read and validate the backend map registered under `tag`.
    pub fn from_backend_config(tag: &str, config: &BackendConfig) -> Result<Self, GatewayError> {
        let api_key = config.require(tag, "api_key")?;
        let model = config.require(tag, "model")?;
        Ok(Self {
            provider_name: tag.to_string(),
            base_url: config
                .get_or("base_url", DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: SecretString::from(api_key.to_string()),
            model: model.to_string(),
        })
    }
}
