//! Configuration file loading
//!
//! Reads `config.yaml` (or `.yml` / `.toml`) from the working directory, or
//! `~/.config/switchboard/config.yaml`. Every string value may reference
//! environment variables as `${NAME}`; unknown names are left as written.
//! All fields are optional and fall back to defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use super::ModuleConfig;
use crate::{Error, Result};

static ENV_REF: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").ok());

/// Top-level configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    /// Reasoning collaborator settings
    #[serde(default)]
    pub core: CoreFileConfig,

    /// Orchestration engine settings
    #[serde(default)]
    pub engine: EngineFileConfig,

    /// Message bus settings
    #[serde(default)]
    pub bus: BusFileConfig,

    #[serde(default)]
    pub inputs: ModuleSectionFile,

    #[serde(default)]
    pub outputs: ModuleSectionFile,

    #[serde(default)]
    pub tools: ModuleSectionFile,
}

/// Reasoning collaborator configuration
#[derive(Debug, Default, Deserialize)]
pub struct CoreFileConfig {
    /// Reasoner type ("openai" or "echo")
    #[serde(alias = "type")]
    pub reasoner: Option<String>,

    /// Model identifier (e.g. "gpt-4o-mini")
    #[serde(alias = "model_name")]
    pub model: Option<String>,

    /// Base URL of an OpenAI-compatible API
    pub base_url: Option<String>,

    pub api_key: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,

    /// HTTP timeout for one reasoning request, in seconds
    pub request_timeout_secs: Option<u64>,

    /// Older configs put the iteration limit here
    pub max_iterations: Option<usize>,
}

/// Orchestration engine configuration
#[derive(Debug, Default, Deserialize)]
pub struct EngineFileConfig {
    pub decision_timeout_ms: Option<u64>,
    pub max_iterations: Option<usize>,
    pub max_parallel_tools: Option<usize>,
    pub history_limit: Option<usize>,
}

/// Message bus configuration
#[derive(Debug, Default, Deserialize)]
pub struct BusFileConfig {
    /// Per-subscriber queue capacity
    pub capacity: Option<usize>,
}

/// One module section (`inputs`, `outputs` or `tools`)
#[derive(Debug, Default, Deserialize)]
pub struct ModuleSectionFile {
    /// Master switch for the whole section
    pub enabled: Option<bool>,

    /// Instance name → settings
    #[serde(flatten)]
    pub instances: BTreeMap<String, ModuleConfig>,
}

/// Locate the configuration file
///
/// Checks `./config.yaml`, `./config.yml`, `./config.toml`, then the user
/// config directory.
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    let local = ["config.yaml", "config.yml", "config.toml"]
        .into_iter()
        .map(PathBuf::from)
        .find(|p| p.exists());
    if local.is_some() {
        return local;
    }

    directories::ProjectDirs::from("", "", "switchboard")
        .map(|d| d.config_dir().join("config.yaml"))
        .filter(|p| p.exists())
}

/// Load the configuration file
///
/// An explicit `path` must exist and parse. Without one, a missing file
/// yields defaults.
///
/// # Errors
///
/// Returns `ConfigValidation` if the file cannot be read or parsed
pub fn load_config_file(path: Option<&Path>) -> Result<ConfigFile> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match config_file_path() {
            Some(p) => p,
            None => {
                tracing::warn!("no config file found, using defaults");
                return Ok(ConfigFile::default());
            }
        },
    };

    let content = std::fs::read_to_string(&path).map_err(|e| {
        Error::ConfigValidation(format!("failed to read {}: {e}", path.display()))
    })?;

    let config = parse_config(&content, &path)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Parse configuration text, choosing the format from the file extension
///
/// # Errors
///
/// Returns `ConfigValidation` on syntax or schema errors
pub fn parse_config(content: &str, path: &Path) -> Result<ConfigFile> {
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

    let mut raw: Value = if is_toml {
        toml::from_str(content)?
    } else {
        serde_yaml::from_str(content)?
    };

    if raw.is_null() {
        raw = Value::Object(serde_json::Map::new());
    }

    substitute_env(&mut raw);

    serde_json::from_value(raw).map_err(|e| {
        Error::ConfigValidation(format!("invalid config in {}: {e}", path.display()))
    })
}

/// Replace `${NAME}` references in every string of `value`
pub fn substitute_env(value: &mut Value) {
    match value {
        Value::String(s) => {
            if let Some(replaced) = expand(s) {
                *s = replaced;
            }
        }
        Value::Array(items) => items.iter_mut().for_each(substitute_env),
        Value::Object(map) => map.values_mut().for_each(substitute_env),
        _ => {}
    }
}

fn expand(s: &str) -> Option<String> {
    let re = ENV_REF.as_ref()?;
    if !re.is_match(s) {
        return None;
    }

    let replaced = re.replace_all(s, |caps: &regex::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_else(|_| {
            tracing::warn!(variable = &caps[1], "environment variable not set");
            caps[0].to_string()
        })
    });
    Some(replaced.into_owned())
}
