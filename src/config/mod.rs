//! Configuration management for Switchboard

pub mod file;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::{Error, Result};

/// Settings of one module instance
///
/// `type` selects the factory; when absent the instance name is used. All
/// other keys are passed to the factory untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModuleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(rename = "type", default)]
    pub module_type: Option<String>,

    #[serde(flatten)]
    pub params: Map<String, Value>,
}

const fn default_true() -> bool {
    true
}

impl ModuleConfig {
    /// Config with the given type and parameters
    #[must_use]
    pub fn new(module_type: &str, params: Map<String, Value>) -> Self {
        Self {
            enabled: true,
            module_type: Some(module_type.to_string()),
            params,
        }
    }

    /// Factory type name, defaulting to the instance name
    #[must_use]
    pub fn type_name<'a>(&'a self, instance: &'a str) -> &'a str {
        self.module_type.as_deref().unwrap_or(instance)
    }

    /// Deserialize the factory-specific parameters
    ///
    /// # Errors
    ///
    /// Returns `ConfigValidation` describing the offending key
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.params.clone()))
            .map_err(|e| Error::ConfigValidation(e.to_string()))
    }
}

/// Reasoning collaborator configuration
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Reasoner type ("openai" or "echo")
    pub reasoner: String,
    pub model: String,
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
    pub request_timeout: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            reasoner: "openai".to_string(),
            model: "gpt-3.5-turbo".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            temperature: 0.1,
            max_tokens: None,
            system_prompt: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Orchestration engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Budget for one reasoning decision
    pub decision_timeout: Duration,
    /// Reasoning rounds per inbound message
    pub max_iterations: usize,
    /// Concurrent normal-priority tool calls per decision
    pub max_parallel_tools: usize,
    /// Conversation turns kept per origin
    pub history_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            decision_timeout: Duration::from_secs(30),
            max_iterations: 10,
            max_parallel_tools: 4,
            history_limit: 20,
        }
    }
}

/// Message bus configuration
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

/// Instances of one module kind
#[derive(Debug, Clone)]
pub struct ModuleSection {
    /// Master switch; when false no instance of this kind starts
    pub enabled: bool,
    pub instances: BTreeMap<String, ModuleConfig>,
}

impl Default for ModuleSection {
    fn default() -> Self {
        Self {
            enabled: true,
            instances: BTreeMap::new(),
        }
    }
}

impl ModuleSection {
    /// Add an instance
    #[must_use]
    pub fn with(mut self, name: &str, config: ModuleConfig) -> Self {
        self.instances.insert(name.to_string(), config);
        self
    }
}

/// Switchboard configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub core: CoreConfig,
    pub engine: EngineConfig,
    pub bus: BusConfig,
    pub inputs: ModuleSection,
    pub outputs: ModuleSection,
    pub tools: ModuleSection,
}

impl Config {
    /// Load configuration (env > file > default)
    ///
    /// Reads `.env` first so its variables are visible to `${NAME}`
    /// substitution.
    ///
    /// # Errors
    ///
    /// Returns `ConfigValidation` if the file is unreadable or malformed
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!(path = %path.display(), "loaded .env"),
            Err(e) if e.not_found() => {}
            Err(e) => tracing::warn!(error = %e, "failed to read .env"),
        }

        let fc = file::load_config_file(path)?;
        Ok(Self::from_file(fc))
    }

    /// Build configuration from a parsed file, applying env overrides
    #[must_use]
    pub fn from_file(fc: file::ConfigFile) -> Self {
        let core_defaults = CoreConfig::default();
        let engine_defaults = EngineConfig::default();

        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .or(fc.core.api_key)
            .filter(|k| !k.is_empty())
            .map(SecretString::from);

        let core = CoreConfig {
            reasoner: std::env::var("SWITCHBOARD_REASONER")
                .ok()
                .or(fc.core.reasoner)
                .unwrap_or(core_defaults.reasoner),
            model: std::env::var("SWITCHBOARD_MODEL")
                .ok()
                .or(fc.core.model)
                .unwrap_or(core_defaults.model),
            base_url: std::env::var("OPENAI_BASE_URL")
                .ok()
                .or(fc.core.base_url)
                .unwrap_or(core_defaults.base_url),
            api_key,
            temperature: fc.core.temperature.unwrap_or(core_defaults.temperature),
            max_tokens: fc.core.max_tokens,
            system_prompt: fc.core.system_prompt,
            request_timeout: fc
                .core
                .request_timeout_secs
                .map_or(core_defaults.request_timeout, Duration::from_secs),
        };

        let engine = EngineConfig {
            decision_timeout: fc
                .engine
                .decision_timeout_ms
                .map_or(engine_defaults.decision_timeout, Duration::from_millis),
            max_iterations: fc
                .engine
                .max_iterations
                .or(fc.core.max_iterations)
                .unwrap_or(engine_defaults.max_iterations)
                .max(1),
            max_parallel_tools: fc
                .engine
                .max_parallel_tools
                .unwrap_or(engine_defaults.max_parallel_tools)
                .max(1),
            history_limit: fc
                .engine
                .history_limit
                .unwrap_or(engine_defaults.history_limit),
        };

        let bus = BusConfig {
            capacity: fc.bus.capacity.unwrap_or(BusConfig::default().capacity),
        };

        Self {
            core,
            engine,
            bus,
            inputs: section(fc.inputs),
            outputs: section(fc.outputs),
            tools: section(fc.tools),
        }
    }
}

fn section(file: file::ModuleSectionFile) -> ModuleSection {
    ModuleSection {
        enabled: file.enabled.unwrap_or(true),
        instances: file.instances,
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use serde_json::json;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct PinConfig {
        gpio_pin: u8,
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_file(file::ConfigFile::default());
        assert_eq!(config.bus.capacity, 256);
        assert_eq!(config.engine.max_iterations, 10);
        assert!(config.tools.enabled);
        assert!(config.tools.instances.is_empty());
    }

    #[test]
    fn test_bus_capacity_zero_passes_through() {
        // Rejected later when the bus is built
        let fc = file::parse_config("bus:\n  capacity: 0\n", Path::new("c.yaml")).unwrap();
        assert_eq!(Config::from_file(fc).bus.capacity, 0);
    }

    #[test]
    fn test_module_params_parse() {
        let config = ModuleConfig::new(
            "infrared_amp",
            json!({"gpio_pin": 18}).as_object().cloned().unwrap(),
        );
        let parsed: PinConfig = config.parse().unwrap();
        assert_eq!(parsed.gpio_pin, 18);

        let bad = ModuleConfig::new(
            "infrared_amp",
            json!({"gpio_pin": "eighteen"}).as_object().cloned().unwrap(),
        );
        assert!(matches!(
            bad.parse::<PinConfig>(),
            Err(Error::ConfigValidation(_))
        ));
    }

    #[test]
    fn test_section_master_switch() {
        let fc = file::parse_config(
            "outputs:\n  enabled: false\n  terminal: {}\n",
            Path::new("c.yaml"),
        )
        .unwrap();
        let config = Config::from_file(fc);
        assert!(!config.outputs.enabled);
        assert!(config.outputs.instances.contains_key("terminal"));
    }
}
