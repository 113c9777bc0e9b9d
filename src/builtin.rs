//! Factories shipped with switchboard

use std::sync::Arc;

use crate::Result;
use crate::modules::discord::DiscordInputFactory;
use crate::modules::terminal::{TerminalInputFactory, TerminalOutputFactory};
use crate::modules::tts::TtsOutputFactory;
use crate::modules::web::WebInputFactory;
use crate::modules::{InputFactory, OutputFactory};
use crate::registry::{FactoryRegistry, ModuleKind};
use crate::tools::infrared::{InfraredFactory, OsramLight, YamahaAmp};
use crate::tools::smart_plug::SmartPlugFactory;
use crate::tools::weather::WeatherFactory;
use crate::tools::ToolRegistry;

/// One registry per module kind
#[derive(Debug)]
pub struct Registries {
    pub inputs: FactoryRegistry<dyn InputFactory>,
    pub outputs: FactoryRegistry<dyn OutputFactory>,
    pub tools: ToolRegistry,
}

impl Default for Registries {
    fn default() -> Self {
        Self::empty()
    }
}

impl Registries {
    /// Registries with nothing registered
    #[must_use]
    pub fn empty() -> Self {
        Self {
            inputs: FactoryRegistry::new(ModuleKind::Input),
            outputs: FactoryRegistry::new(ModuleKind::Output),
            tools: ToolRegistry::new(),
        }
    }

    /// Registries holding every built-in factory
    ///
    /// # Errors
    ///
    /// Returns `DuplicateName` if two built-ins share a type name
    pub fn builtin() -> Result<Self> {
        Ok(Self {
            inputs: input_registry()?,
            outputs: output_registry()?,
            tools: tool_registry()?,
        })
    }
}

/// Built-in input factories
///
/// # Errors
///
/// Returns `DuplicateName` if two built-ins share a type name
pub fn input_registry() -> Result<FactoryRegistry<dyn InputFactory>> {
    let mut inputs: FactoryRegistry<dyn InputFactory> = FactoryRegistry::new(ModuleKind::Input);
    inputs.register("discord", Arc::new(DiscordInputFactory))?;
    inputs.register("terminal", Arc::new(TerminalInputFactory))?;
    inputs.register("web", Arc::new(WebInputFactory))?;
    Ok(inputs)
}

/// Built-in output factories
///
/// # Errors
///
/// Returns `DuplicateName` if two built-ins share a type name
pub fn output_registry() -> Result<FactoryRegistry<dyn OutputFactory>> {
    let mut outputs: FactoryRegistry<dyn OutputFactory> = FactoryRegistry::new(ModuleKind::Output);
    outputs.register("terminal", Arc::new(TerminalOutputFactory))?;
    outputs.register("tts", Arc::new(TtsOutputFactory))?;
    Ok(outputs)
}

/// Built-in tool factories
///
/// `tapo` is kept as an alias of `smart_plug`.
///
/// # Errors
///
/// Returns `DuplicateName` if two built-ins share a type name
pub fn tool_registry() -> Result<ToolRegistry> {
    let mut tools = ToolRegistry::new();
    let smart_plug = Arc::new(SmartPlugFactory);
    tools.register("smart_plug", smart_plug.clone())?;
    tools.register("tapo", smart_plug)?;
    tools.register("infrared_amp", Arc::new(InfraredFactory::<YamahaAmp>::default()))?;
    tools.register(
        "infrared_light",
        Arc::new(InfraredFactory::<OsramLight>::default()),
    )?;
    tools.register("weather", Arc::new(WeatherFactory))?;
    Ok(tools)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_types() {
        let registries = Registries::builtin().unwrap();
        assert_eq!(registries.inputs.names(), ["discord", "terminal", "web"]);
        assert_eq!(registries.outputs.names(), ["terminal", "tts"]);
        assert_eq!(
            registries.tools.types(),
            ["infrared_amp", "infrared_light", "smart_plug", "tapo", "weather"]
        );
    }
}
