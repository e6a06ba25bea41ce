use std::path::{Path, PathBuf};

use parley_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

const CONFIG_DIR: &str = ".parley";
const DEFAULT_FILE: &str = "config.yml";

/// Environment variables that override file settings.
const ENV_MODEL: &str = "PARLEY_MODEL";
const ENV_FALLBACK_MODELS: &str = "PARLEY_FALLBACK_MODELS";
const ENV_API_KEY: &str = "PARLEY_API_KEY";
const ENV_BASE_URL: &str = "PARLEY_BASE_URL";

/// Loads [`AppConfig`] from YAML or TOML plus environment overrides.
pub struct ConfigLoader {
    path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { path: None }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// `~/.parley/config.yml`, if a home directory can be resolved.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(CONFIG_DIR).join(DEFAULT_FILE))
    }

    /// Read the file (if any), then apply environment overrides.
    ///
    /// An explicit path that does not exist is an error; a missing default
    /// file just means "use defaults".
    pub fn load(&self) -> Result<AppConfig> {
        let mut config = match &self.path {
            Some(path) => {
                if !path.is_file() {
                    return Err(Error::Config(format!(
                        "config file not found: {}",
                        path.display()
                    )));
                }
                Self::read_file(path)?
            }
            None => match Self::default_path().filter(|p| p.is_file()) {
                Some(path) => Self::read_file(&path)?,
                None => {
                    debug!("no config file found, using defaults");
                    AppConfig::default()
                }
            },
        };

        apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<AppConfig> {
        info!("loading config from {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        parse_config(path, &contents)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_config(path: &Path, contents: &str) -> Result<AppConfig> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    match extension.as_str() {
        "toml" => toml::from_str(contents)
            .map_err(|e| Error::Config(format!("invalid TOML in {}: {e}", path.display()))),
        "yml" | "yaml" | "" => serde_yaml::from_str(contents)
            .map_err(|e| Error::Config(format!("invalid YAML in {}: {e}", path.display()))),
        other => Err(Error::Config(format!(
            "unsupported config format '.{other}' (expected .yml, .yaml or .toml)"
        ))),
    }
}

fn apply_env_overrides(config: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
    let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    if let Some(model) = non_empty(ENV_MODEL) {
        config.failover.primary_model = model;
    }
    if let Some(list) = non_empty(ENV_FALLBACK_MODELS) {
        config.failover.fallback_models = list
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(key) = non_empty(ENV_API_KEY) {
        config.llm.api_key = Some(key);
    }
    if let Some(url) = non_empty(ENV_BASE_URL) {
        config.llm.base_url = Some(url);
    }
}
