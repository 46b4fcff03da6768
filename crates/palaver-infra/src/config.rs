//! Global configuration loader for Palaver.
//!
//! Reads a TOML file and deserializes it into [`GlobalConfig`]. Falls back to
//! defaults when the file is missing or malformed, then applies environment
//! overrides.

use std::path::{Path, PathBuf};

use palaver_types::config::GlobalConfig;

use crate::llm::OPENAI_TAG;

/// Directory holding the per-environment config files.
const CONFIG_DIR: &str = "config";

/// Map `APP_ENV` to the config file name suffix.
pub fn environment_name(app_env: Option<&str>) -> &'static str {
    match app_env.map(|e| e.trim().to_ascii_lowercase()).as_deref() {
        Some("production") | Some("prod") => "prod",
        Some("test") => "test",
        _ => "dev",
    }
}

/// `config/config.<env>.toml` for the given `APP_ENV` value.
pub fn default_config_path(app_env: Option<&str>) -> PathBuf {
    Path::new(CONFIG_DIR).join(format!("config.{}.toml", environment_name(app_env)))
}

/// Load global configuration from `config_path`.
///
/// - If the file does not exist, returns [`GlobalConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - If the file exists and parses successfully, returns the parsed config.
pub async fn load_global_config(config_path: &Path) -> GlobalConfig {
    let content = match tokio::fs::read_to_string(config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config file at {}, using defaults", config_path.display());
            return GlobalConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return GlobalConfig::default();
        }
    };

    match toml::from_str::<GlobalConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            GlobalConfig::default()
        }
    }
}

/// Resolve the file (explicit path, else by `APP_ENV`), load it and apply
/// process environment overrides.
pub async fn load_effective_config(explicit: Option<&Path>) -> GlobalConfig {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => default_config_path(std::env::var("APP_ENV").ok().as_deref()),
    };
    let mut config = load_global_config(&path).await;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config
}

/// Apply environment overrides through `lookup`.
///
/// `OPENAI_API_KEY`, `OPENAI_BASE_URL` and `OPENAI_MODEL_NAME` only fill keys
/// the `[backends.openai]` table leaves unset. `PALAVER_BROKER_URL` and
/// `PALAVER_DATABASE_URL` always win over the file.
pub fn apply_env_overrides(config: &mut GlobalConfig, lookup: impl Fn(&str) -> Option<String>) {
    let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    for (env_key, config_key) in [
        ("OPENAI_API_KEY", "api_key"),
        ("OPENAI_BASE_URL", "base_url"),
        ("OPENAI_MODEL_NAME", "model"),
    ] {
        if let Some(value) = lookup(env_key) {
            config
                .backends
                .entry(OPENAI_TAG.to_string())
                .or_default()
                .set_default(config_key, Some(value));
        }
    }

    if let Some(url) = lookup("PALAVER_BROKER_URL") {
        config.broker.url = url;
    }
    if let Some(url) = lookup("PALAVER_DATABASE_URL") {
        config.database.url = url;
    }
}
