//! Name → factory registries
//!
//! One registry exists per module kind. Registries are filled once at startup
//! (see [`crate::builtin`]) and only read afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::config::ModuleConfig;
use crate::{Error, Result};

/// Kind of pluggable component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    Input,
    Output,
    Tool,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Tool => "tool",
        };
        f.pad(s)
    }
}

/// What a [`FactoryRegistry`] needs from its factories to check and build
pub trait ModuleFactory: Send + Sync {
    /// What one successful build yields
    type Module;

    /// Check configuration without constructing anything
    ///
    /// # Errors
    ///
    /// Returns `ConfigValidation` when the configuration is unusable
    fn check_config(&self, config: &ModuleConfig) -> Result<()>;

    /// Construct the module
    ///
    /// # Errors
    ///
    /// Returns the factory's failure, unwrapped
    fn construct(&self, name: &str, config: &ModuleConfig) -> Result<Self::Module>;
}

/// Registry of factories of one kind, keyed by type name
pub struct FactoryRegistry<F: ?Sized> {
    kind: ModuleKind,
    factories: BTreeMap<String, Arc<F>>,
}

impl<F: ?Sized> fmt::Debug for FactoryRegistry<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryRegistry")
            .field("kind", &self.kind)
            .field("types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<F: ?Sized> FactoryRegistry<F> {
    /// Create an empty registry
    #[must_use]
    pub const fn new(kind: ModuleKind) -> Self {
        Self {
            kind,
            factories: BTreeMap::new(),
        }
    }

    /// Kind of module this registry builds
    #[must_use]
    pub const fn kind(&self) -> ModuleKind {
        self.kind
    }

    /// Register a factory under `name`
    ///
    /// # Errors
    ///
    /// Returns `DuplicateName` if `name` is taken; the first registration stays active
    pub fn register(&mut self, name: impl Into<String>, factory: Arc<F>) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::DuplicateName(format!("{} type {name}", self.kind)));
        }

        tracing::debug!(kind = %self.kind, module_type = %name, "registered factory");
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Look up the factory for `name`
    ///
    /// # Errors
    ///
    /// Returns `UnknownModule` if nothing is registered under `name`
    pub fn get(&self, name: &str) -> Result<Arc<F>> {
        self.factories.get(name).cloned().ok_or_else(|| {
            Error::UnknownModule(format!(
                "{} type '{name}' (known: {})",
                self.kind,
                self.names().join(", ")
            ))
        })
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered type names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl<F: ModuleFactory + ?Sized> FactoryRegistry<F> {
    /// Check an instance's configuration without building anything
    ///
    /// # Errors
    ///
    /// Returns `UnknownModule` or `ConfigValidation`
    pub fn check(&self, module_type: &str, config: &ModuleConfig) -> Result<()> {
        self.get(module_type)?.check_config(config)
    }

    /// Build instance `instance` of `module_type`
    ///
    /// # Errors
    ///
    /// Returns `UnknownModule`, `ConfigValidation`, or `Construction`
    pub fn create(
        &self,
        module_type: &str,
        instance: &str,
        config: &ModuleConfig,
    ) -> Result<F::Module> {
        let factory = self.get(module_type)?;
        factory.check_config(config)?;
        let module = factory
            .construct(instance, config)
            .map_err(|e| e.into_construction(instance))?;
        tracing::debug!(kind = %self.kind, module_type, instance, "module created");
        Ok(module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> &'static str;
    }

    struct Hello;
    impl Greeter for Hello {
        fn greet(&self) -> &'static str {
            "hello"
        }
    }

    struct Bonjour;
    impl Greeter for Bonjour {
        fn greet(&self) -> &'static str {
            "bonjour"
        }
    }

    #[test]
    fn test_duplicate_keeps_first() {
        let mut registry: FactoryRegistry<dyn Greeter> = FactoryRegistry::new(ModuleKind::Output);
        registry.register("greeter", Arc::new(Hello)).unwrap();

        let err = registry.register("greeter", Arc::new(Bonjour)).unwrap_err();
        assert!(matches!(err, Error::DuplicateName(_)));
        assert_eq!(registry.get("greeter").unwrap().greet(), "hello");
    }

    #[test]
    fn test_unknown_type() {
        let registry: FactoryRegistry<dyn Greeter> = FactoryRegistry::new(ModuleKind::Input);
        let err = registry.get("missing").err().unwrap();
        assert!(matches!(err, Error::UnknownModule(ref msg) if msg.contains("missing")));
    }

    /// Builds counters, refusing negative starts
    struct CounterFactory;

    impl ModuleFactory for CounterFactory {
        type Module = i64;

        fn check_config(&self, config: &ModuleConfig) -> Result<()> {
            match config.params.get("start").and_then(serde_json::Value::as_i64) {
                Some(_) => Ok(()),
                None => Err(Error::ConfigValidation("start must be an integer".to_string())),
            }
        }

        fn construct(&self, _name: &str, config: &ModuleConfig) -> Result<i64> {
            let start = config.params["start"].as_i64().unwrap_or_default();
            if start < 0 {
                return Err(Error::Bus("counter underflow".to_string()));
            }
            Ok(start)
        }
    }

    fn counter_config(start: serde_json::Value) -> ModuleConfig {
        let mut params = serde_json::Map::new();
        params.insert("start".to_string(), start);
        ModuleConfig::new("counter", params)
    }

    fn counters() -> FactoryRegistry<CounterFactory> {
        let mut registry = FactoryRegistry::new(ModuleKind::Input);
        registry.register("counter", Arc::new(CounterFactory)).unwrap();
        registry
    }

    #[test]
    fn test_create_builds_module() {
        let module = counters()
            .create("counter", "clicks", &counter_config(serde_json::json!(3)))
            .unwrap();
        assert_eq!(module, 3);
    }

    #[test]
    fn test_create_rejects_config_before_building() {
        let err = counters()
            .create("counter", "clicks", &counter_config(serde_json::json!("three")))
            .unwrap_err();
        assert!(matches!(err, Error::ConfigValidation(_)));
        assert!(counters().check("counter", &counter_config(serde_json::json!(1))).is_ok());
        assert!(matches!(
            counters().check("abacus", &counter_config(serde_json::json!(1))),
            Err(Error::UnknownModule(_))
        ));
    }

    #[test]
    fn test_create_wraps_build_failure() {
        let err = counters()
            .create("counter", "clicks", &counter_config(serde_json::json!(-1)))
            .unwrap_err();
        assert!(
            matches!(err, Error::Construction { ref name, ref reason } if name == "clicks" && reason.contains("underflow"))
        );
    }

    #[test]
    fn test_names_sorted() {
        let mut registry: FactoryRegistry<dyn Greeter> = FactoryRegistry::new(ModuleKind::Tool);
        registry.register("zeta", Arc::new(Hello)).unwrap();
        registry.register("alpha", Arc::new(Bonjour)).unwrap();
        assert_eq!(registry.names(), vec!["alpha", "zeta"]);
        assert_eq!(registry.kind().to_string(), "tool");
    }
}
