//! Backend implementations.
//!
//! Contains concrete implementations of the [`LlmProvider`] trait
//! defined in `palaver-core`, plus [`register_builtin_backends`], which
//! installs their constructors into a [`BackendFactory`] under the
//! `openai` and `ollama` tags.
//!
//! [`LlmProvider`]: palaver_core::llm::provider::LlmProvider

pub mod ollama;
pub mod openai_compat;

use palaver_core::llm::box_provider::BoxLlmProvider;
use palaver_core::llm::factory::BackendFactory;

use self::ollama::OllamaProvider;
use self::openai_compat::OpenAiCompatibleProvider;
use self::openai_compat::config::OpenAiCompatConfig;

pub const OPENAI_TAG: &str = "openai";
pub const OLLAMA_TAG: &str = "ollama";

/// Register the built-in backend constructors.
pub fn register_builtin_backends(factory: &BackendFactory) {
    factory.register_backend(OPENAI_TAG, |config| {
        let config = OpenAiCompatConfig::from_backend_config(OPENAI_TAG, config)?;
        Ok(BoxLlmProvider::new(OpenAiCompatibleProvider::new(config)))
    });
    factory.register_backend(OLLAMA_TAG, |config| {
        let provider = OllamaProvider::from_backend_config(OLLAMA_TAG, config)?;
        Ok(BoxLlmProvider::new(provider))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_types::backend::BackendConfig;
    use palaver_types::error::GatewayError;

    #[test]
    fn test_builtin_tags() {
        let factory = BackendFactory::new();
        register_builtin_backends(&factory);
        assert_eq!(factory.registered_tags(), vec!["ollama", "openai"]);
    }

    #[test]
    fn test_openai_constructor_validates_config() {
        let factory = BackendFactory::new();
        register_builtin_backends(&factory);

        let err = factory
            .create_backend(OPENAI_TAG, &BackendConfig::new())
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::BackendConfig { .. }));

        let ok = factory
            .create_backend(
                OPENAI_TAG,
                &BackendConfig::new().with("api_key", "k").with("model", "gpt-4o-mini"),
            )
            .unwrap();
        assert_eq!(ok.name(), "openai");
        assert_eq!(ok.model(), "gpt-4o-mini");
    }

    #[test]
    fn test_ollama_constructor() {
        let factory = BackendFactory::new();
        register_builtin_backends(&factory);
        let backend = factory
            .create_backend(OLLAMA_TAG, &BackendConfig::new().with("model", "llama3.2"))
            .unwrap();
        assert_eq!(backend.name(), "ollama");
    }
}
