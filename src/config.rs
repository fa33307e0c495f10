use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_NAME: &str = "anthropic-facade";

/// Process configuration. Built once at startup and passed by reference afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Client-facing model name -> model name the routing service knows.
    #[serde(default)]
    pub models: HashMap<String, String>,
    #[serde(default)]
    pub translation: TranslationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranslationConfig {
    /// Strip JSON-Schema keywords some backends reject from tool definitions.
    #[serde(default)]
    pub sanitize_tool_schemas: bool,
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_base_url() -> String {
    "http://localhost:4000".to_string()
}

fn default_api_key_env() -> String {
    "LITELLM_API_KEY".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            log_level: default_log_level(),
            upstream: UpstreamConfig::default(),
            models: HashMap::new(),
            translation: TranslationConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Search standard locations for a config file, falling back to defaults.
    /// Priority: CLI arg > CWD > XDG config > home dir
    ///
    /// Also returns the file that was used. Runs before logging is set up, so the
    /// caller reports it.
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        let source = match explicit_path {
            Some(path) => Some(path.to_path_buf()),
            None => config_search_paths().into_iter().find(|p| p.exists()),
        };

        match source {
            Some(path) => Ok((Self::load(&path)?, Some(path))),
            None => Ok((Self::default(), None)),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.upstream.base_url.as_str();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ProxyError::config(format!(
                "upstream.base_url must be an http(s) URL, got '{url}'"
            )));
        }
        if self.upstream.timeout_secs == 0 {
            return Err(ProxyError::config("upstream.timeout_secs must be positive"));
        }
        Ok(())
    }

    /// Chat completions endpoint of the routing service.
    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.upstream.base_url.trim_end_matches('/'))
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.timeout_secs)
    }

    /// The routing service key, if one is configured. LiteLLM can run without one.
    pub fn resolve_api_key(&self) -> Option<String> {
        std::env::var(&self.upstream.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }

    /// Map a client-facing model name; unmapped names pass through unchanged.
    pub fn map_model(&self, model: &str) -> String {
        self.models
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from(format!("{APP_NAME}.toml")));

    // XDG config dir
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(xdg).join(APP_NAME).join("config.toml"));
    }
    if let Some(home) = home_dir() {
        paths.push(home.join(".config").join(APP_NAME).join("config.toml"));
        // Home directory fallback
        paths.push(home.join(format!(".{APP_NAME}.toml")));
    }

    paths
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
