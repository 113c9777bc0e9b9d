//! Infrared remote-control tools
//!
//! Each remote is an [`IrDevice`]: a command table, a parameter schema, and
//! a rule for how many times a command is sent. [`InfraredTool`] turns a
//! validated call into an NEC frame and hands it to the emission thread.

pub mod nec;
pub mod osram;
pub mod transmitter;
pub mod yamaha;

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

pub use osram::OsramLight;
pub use transmitter::{Burst, Carrier, DryRunTransmitter, FrameLog, IrTransmitter, IrWorker};
pub use yamaha::YamahaAmp;

use super::{DispatchPriority, ToolAdapter, ToolFactory, ToolOutput};
use crate::config::ModuleConfig;
use crate::schema::{ToolSchema, ValidatedParams};
use crate::{Error, Result};

/// Default budget for one infrared call; covers the longest repeat sequence
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A remote-controlled device
pub trait IrDevice: Send + Sync + 'static {
    /// Default instance description
    fn description(&self) -> &'static str;

    /// NEC address byte
    fn address(&self) -> u8;

    fn default_pin(&self) -> u8;

    fn schema(&self) -> ToolSchema;

    /// NEC command byte for a canonical command name
    fn code(&self, command: &str) -> Option<u8>;

    /// How many times to send and the gap between sends
    fn repeats(&self, params: &ValidatedParams) -> (u32, Duration);
}

/// Emission backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IrDriver {
    /// Drive a GPIO line (needs the `gpio` feature on Linux)
    #[default]
    Gpio,
    /// Log frames without touching hardware
    DryRun,
}

/// Configuration shared by infrared tools
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IrConfig {
    pub gpio_pin: Option<u8>,
    #[serde(default)]
    pub driver: IrDriver,
    #[serde(default)]
    pub carrier: Carrier,
    pub timeout_ms: Option<u64>,
    pub description: Option<String>,
}

impl IrConfig {
    fn pin<D: IrDevice>(&self, device: &D) -> u8 {
        self.gpio_pin.unwrap_or_else(|| device.default_pin())
    }
}

/// Tool adapter for one infrared remote
pub struct InfraredTool<D> {
    name: String,
    description: String,
    device: D,
    schema: ToolSchema,
    worker: IrWorker,
    timeout: Duration,
}

impl<D: IrDevice> std::fmt::Debug for InfraredTool<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfraredTool")
            .field("name", &self.name)
            .field("address", &self.device.address())
            .finish_non_exhaustive()
    }
}

impl<D: IrDevice> InfraredTool<D> {
    /// Create a tool emitting through `transmitter`
    ///
    /// # Errors
    ///
    /// Returns `Io` if the emission thread cannot start
    pub fn new(name: &str, device: D, transmitter: Box<dyn IrTransmitter>) -> Result<Self> {
        let worker = IrWorker::spawn(name, transmitter)?;
        Ok(Self {
            name: name.to_string(),
            description: device.description().to_string(),
            schema: device.schema(),
            device,
            worker,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: String) -> Self {
        self.description = description;
        self
    }
}

#[async_trait]
impl<D: IrDevice> ToolAdapter for InfraredTool<D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn priority(&self) -> DispatchPriority {
        DispatchPriority::TimeCritical
    }

    async fn execute(&self, params: &ValidatedParams) -> Result<ToolOutput> {
        let command = params
            .command()
            .ok_or_else(|| Error::validation("command", "required"))?;
        let code = self
            .device
            .code(command)
            .ok_or_else(|| Error::ToolExecution(format!("no infrared code for {command}")))?;
        let (count, gap) = self.device.repeats(params);

        tracing::info!(
            tool = %self.name,
            command,
            code = format_args!("0x{code:02X}"),
            count,
            "sending infrared command"
        );

        self.worker
            .send(Burst {
                frame: nec::encode(self.device.address(), code),
                count,
                gap,
            })
            .await?;

        let mut message = format!("{} sent to {}", command, self.name);
        if count > 1 {
            message.push_str(&format!(" (x{count})"));
        }

        Ok(ToolOutput::message(message).with_data(json!({
            "action": params.action(),
            "command": command,
            "code": format!("0x{code:02X}"),
            "sends": count,
        })))
    }

    async fn shutdown(&self) {
        self.worker.shutdown().await;
    }
}

/// Builds [`InfraredTool`]s for device type `D`
pub struct InfraredFactory<D> {
    device: PhantomData<fn() -> D>,
}

impl<D> Default for InfraredFactory<D> {
    fn default() -> Self {
        Self {
            device: PhantomData,
        }
    }
}

impl<D: IrDevice + Default> ToolFactory for InfraredFactory<D> {
    fn validate_config(&self, config: &ModuleConfig) -> Result<()> {
        config.parse::<IrConfig>().map(|_| ())
    }

    fn resources(&self, config: &ModuleConfig) -> Result<Vec<String>> {
        let ir: IrConfig = config.parse()?;
        Ok(vec![format!("gpio:{}", ir.pin(&D::default()))])
    }

    fn build(&self, name: &str, config: &ModuleConfig) -> Result<Arc<dyn ToolAdapter>> {
        let ir: IrConfig = config.parse()?;
        let device = D::default();
        let pin = ir.pin(&device);

        let transmitter: Box<dyn IrTransmitter> = match ir.driver {
            IrDriver::Gpio => transmitter::open_gpio(pin, ir.carrier)?,
            IrDriver::DryRun => {
                tracing::warn!(tool = name, pin, "infrared tool running in dry-run mode");
                Box::new(DryRunTransmitter::new())
            }
        };

        let mut tool = InfraredTool::new(name, device, transmitter)?;
        if let Some(ms) = ir.timeout_ms {
            tool = tool.with_timeout(Duration::from_millis(ms));
        }
        if let Some(description) = ir.description {
            tool = tool.with_description(description);
        }
        Ok(Arc::new(tool))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Map, Value};

    use super::*;

    fn config(value: Value) -> ModuleConfig {
        ModuleConfig::new("infrared_amp", value.as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn test_resources_use_default_pin() {
        let factory = InfraredFactory::<YamahaAmp>::default();
        assert_eq!(
            factory.resources(&config(json!({}))).unwrap(),
            vec!["gpio:18".to_string()]
        );

        let factory = InfraredFactory::<OsramLight>::default();
        assert_eq!(
            factory.resources(&config(json!({"gpio_pin": 22}))).unwrap(),
            vec!["gpio:22".to_string()]
        );
    }

    #[test]
    fn test_unknown_config_key_rejected() {
        let factory = InfraredFactory::<YamahaAmp>::default();
        let err = factory
            .validate_config(&config(json!({"gpio": 18})))
            .unwrap_err();
        assert!(matches!(err, Error::ConfigValidation(_)));
    }

    #[cfg(not(all(feature = "gpio", target_os = "linux")))]
    #[test]
    fn test_gpio_driver_unavailable_without_feature() {
        let factory = InfraredFactory::<YamahaAmp>::default();
        let err = factory.build("amp", &config(json!({}))).err().unwrap();
        assert!(matches!(err, Error::Construction { .. }));
    }

    #[tokio::test]
    async fn test_execute_sends_encoded_frame() {
        let dry = DryRunTransmitter::new();
        let log = dry.log();
        let tool = InfraredTool::new("amp", YamahaAmp, Box::new(dry)).unwrap();

        let mut raw = Map::new();
        raw.insert("action".to_string(), json!("volume"));
        raw.insert("command".to_string(), json!("vol_down"));
        let params = tool.schema().validate(&raw).unwrap();

        let output = tool.execute(&params).await.unwrap();
        assert_eq!(output.data.unwrap()["code"], "0x1F");

        let frames = log.lock().unwrap().clone();
        assert_eq!(frames.len(), 1);
        assert_eq!(nec::decode(&frames[0]), Some((0x78, 0x1F)));
        tool.shutdown().await;
    }
}
