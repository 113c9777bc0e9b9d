//! Tapo smart plugs and bulbs through an HTTP bridge
//!
//! The bridge exposes one endpoint per operation:
//! `POST {bridge_url}/devices/{model}/{operation}` with a JSON body carrying
//! the device `ip` and operation arguments, authenticated with the Tapo
//! account credentials as HTTP basic auth. Responses are JSON.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};

use super::retry::{RetryPolicy, classify_request_error, classify_status};
use super::{ToolAdapter, ToolFactory, ToolOutput};
use crate::config::ModuleConfig;
use crate::schema::{FieldSpec, ToolSchema, ValidatedParams};
use crate::{Error, Result};

/// Colors accepted by name, as (hue, saturation)
const NAMED_COLORS: &[(&str, (u16, u8))] = &[
    ("rouge", (0, 100)),
    ("red", (0, 100)),
    ("vert", (120, 100)),
    ("green", (120, 100)),
    ("bleu", (240, 100)),
    ("blue", (240, 100)),
    ("jaune", (60, 100)),
    ("yellow", (60, 100)),
    ("violet", (270, 100)),
    ("purple", (270, 100)),
    ("orange", (30, 100)),
    ("rose", (300, 100)),
    ("pink", (300, 100)),
    ("cyan", (180, 100)),
    ("blanc", (0, 0)),
    ("white", (0, 0)),
];

/// Device model family
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceModel {
    /// Smart plug with energy monitoring
    #[default]
    P110,
    P100,
    /// Color bulb
    L530,
    L630,
}

impl DeviceModel {
    fn as_str(self) -> &'static str {
        match self {
            Self::P110 => "p110",
            Self::P100 => "p100",
            Self::L530 => "l530",
            Self::L630 => "l630",
        }
    }

    /// Whether the device has brightness and color
    #[must_use]
    pub const fn is_light(self) -> bool {
        matches!(self, Self::L530 | Self::L630)
    }
}

/// One configured device
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub ip: String,
    #[serde(default, alias = "type")]
    pub model: DeviceModel,
}

/// Smart plug tool configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SmartPlugConfig {
    pub bridge_url: String,
    /// Tapo account email; falls back to `TAPO_EMAIL`
    #[serde(alias = "email")]
    pub username: Option<String>,
    /// Tapo account password; falls back to `TAPO_PASSWORD`
    pub password: Option<String>,
    pub devices: BTreeMap<String, DeviceConfig>,
    pub default_device: Option<String>,
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: RetryPolicy,
    pub description: Option<String>,
}

impl SmartPlugConfig {
    fn credentials(&self) -> Result<(String, SecretString)> {
        let username = self
            .username
            .clone()
            .or_else(|| std::env::var("TAPO_EMAIL").ok())
            .filter(|u| !u.is_empty());
        let password = self
            .password
            .clone()
            .or_else(|| std::env::var("TAPO_PASSWORD").ok())
            .filter(|p| !p.is_empty());

        match (username, password) {
            (Some(u), Some(p)) => Ok((u, SecretString::from(p))),
            _ => Err(Error::ConfigValidation(
                "smart plug needs username and password (or TAPO_EMAIL / TAPO_PASSWORD)"
                    .to_string(),
            )),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(Error::ConfigValidation(
                "smart plug needs at least one device".to_string(),
            ));
        }
        if let Some(default) = &self.default_device
            && !self.devices.contains_key(default)
        {
            return Err(Error::ConfigValidation(format!(
                "default_device '{default}' is not a configured device"
            )));
        }
        self.credentials().map(|_| ())
    }
}

/// Convert `#rrggbb` to (hue 0-360, saturation 0-100)
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn hex_to_hue_saturation(hex: &str) -> Option<(u16, u8)> {
    let hex = hex.strip_prefix('#').unwrap_or(hex);
    if hex.len() != 6 {
        return None;
    }
    let channel = |i: usize| {
        u8::from_str_radix(hex.get(i..i + 2)?, 16)
            .ok()
            .map(|v| f64::from(v) / 255.0)
    };
    let (r, g, b) = (channel(0)?, channel(2)?, channel(4)?);

    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let diff = max - min;

    let hue = if diff == 0.0 {
        0.0
    } else if (max - r).abs() < f64::EPSILON {
        (60.0 * ((g - b) / diff) + 360.0) % 360.0
    } else if (max - g).abs() < f64::EPSILON {
        (60.0 * ((b - r) / diff) + 120.0) % 360.0
    } else {
        (60.0 * ((r - g) / diff) + 240.0) % 360.0
    };
    let saturation = if max == 0.0 { 0.0 } else { diff / max * 100.0 };

    Some((hue as u16, saturation as u8))
}

fn named_color(name: &str) -> Option<(u16, u8)> {
    NAMED_COLORS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, hs)| *hs)
}

/// Tapo devices behind an HTTP bridge
pub struct SmartPlugTool {
    name: String,
    description: String,
    schema: ToolSchema,
    client: reqwest::Client,
    bridge_url: String,
    username: String,
    password: SecretString,
    devices: BTreeMap<String, DeviceConfig>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl std::fmt::Debug for SmartPlugTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartPlugTool")
            .field("name", &self.name)
            .field("bridge_url", &self.bridge_url)
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl SmartPlugTool {
    /// Create the tool from its configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigValidation` for missing devices or credentials and
    /// `Construction` if the HTTP client cannot be built
    pub fn new(name: &str, config: SmartPlugConfig) -> Result<Self> {
        config.validate()?;
        let (username, password) = config.credentials()?;

        let device_names: Vec<&str> = config.devices.keys().map(String::as_str).collect();
        let default_device = config
            .default_device
            .clone()
            .or_else(|| device_names.first().map(ToString::to_string));

        let color_names: Vec<&str> = NAMED_COLORS.iter().map(|(n, _)| *n).collect();
        let color_pattern = Regex::new(&format!(
            "^(?i:#[0-9a-f]{{6}}|{})$",
            color_names.join("|")
        ))
        .map_err(|e| Error::construction(name, e))?;

        let mut device_field =
            FieldSpec::choice("device", device_names.as_slice()).describe("Device to control");
        if let Some(default) = &default_device {
            device_field = device_field.default_choice(default);
        }

        let schema = ToolSchema::new()
            .action("power", &["on", "off", "toggle"])
            .action("brightness", &["set"])
            .action("color", &["set"])
            .action("info", &["get"])
            .alias("set_brightness", "set")
            .alias("set_color", "set")
            .alias("get_info", "get")
            .field(device_field.required())
            .field(
                FieldSpec::integer("brightness", 1, 100)
                    .describe("Brightness percentage")
                    .required_for(&["brightness"])
                    .only_for(&["brightness"]),
            )
            .field(
                FieldSpec::text("color", 1, 16)
                    .describe(&format!("Color name ({}) or hex #rrggbb", color_names.join(", ")))
                    .pattern(color_pattern)
                    .only_for(&["color"]),
            )
            .field(
                FieldSpec::integer("hue", 0, 360)
                    .describe("Hue in degrees")
                    .only_for(&["color"]),
            )
            .field(
                FieldSpec::integer("saturation", 0, 100)
                    .describe("Saturation percentage, defaults to 100 with hue")
                    .only_for(&["color"]),
            )
            .require_any("color", &["color", "hue"]);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::construction(name, e))?;

        Ok(Self {
            name: name.to_string(),
            description: config.description.unwrap_or_else(|| {
                "Controls Tapo smart plugs and bulbs: power on/off/toggle, brightness, color, info"
                    .to_string()
            }),
            schema,
            client,
            bridge_url: config.bridge_url.trim_end_matches('/').to_string(),
            username,
            password,
            devices: config.devices,
            timeout: Duration::from_millis(config.timeout_ms.unwrap_or(15_000)),
            retry: config.retry,
        })
    }

    fn device(&self, params: &ValidatedParams) -> Result<(&str, &DeviceConfig)> {
        let name = params
            .text("device")
            .ok_or_else(|| Error::validation("device", "required"))?;
        // Choice values are lowercased during validation
        self.devices
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(n, d)| (n.as_str(), d))
            .ok_or_else(|| Error::validation("device", format!("unknown device '{name}'")))
    }

    async fn call(&self, device: &DeviceConfig, operation: &str, args: Value) -> Result<Value> {
        let mut body = json!({ "ip": device.ip });
        if let (Some(body), Value::Object(args)) = (body.as_object_mut(), args) {
            body.extend(args);
        }

        self.retry
            .run(operation, || self.call_once(device, operation, body.clone()))
            .await
    }

    async fn call_once(&self, device: &DeviceConfig, operation: &str, body: Value) -> Result<Value> {
        let url = format!(
            "{}/devices/{}/{}",
            self.bridge_url,
            device.model.as_str(),
            operation
        );

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(self.password.expose_secret()))
            .json(&body)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &text));
        }

        let text = response.text().await.map_err(classify_request_error)?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    fn color_args(params: &ValidatedParams) -> Result<(u16, u8, String)> {
        if let Some(color) = params.text("color") {
            let lower = color.to_lowercase();
            if let Some((h, s)) = named_color(&lower) {
                return Ok((h, s, lower));
            }
            let (h, s) = hex_to_hue_saturation(&lower)
                .ok_or_else(|| Error::validation("color", "expected a color name or #rrggbb"))?;
            return Ok((h, s, format!("hue {h}, saturation {s}")));
        }

        let hue = params
            .integer("hue")
            .and_then(|h| u16::try_from(h).ok())
            .ok_or_else(|| Error::validation("hue", "required"))?;
        let saturation = params
            .integer("saturation")
            .and_then(|s| u8::try_from(s).ok())
            .unwrap_or(100);
        Ok((hue, saturation, format!("hue {hue}, saturation {saturation}")))
    }
}

#[async_trait]
impl ToolAdapter for SmartPlugTool {
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

    async fn execute(&self, params: &ValidatedParams) -> Result<ToolOutput> {
        let (device_name, device) = self.device(params)?;
        let action = params.action().unwrap_or_default();
        let command = params.command().unwrap_or_default();

        if matches!(action, "brightness" | "color") && !device.model.is_light() {
            return Err(Error::validation(
                "device",
                format!("{device_name} does not support {action}"),
            ));
        }

        tracing::info!(tool = %self.name, device = device_name, action, command, "smart plug call");

        match (action, command) {
            ("power", "on" | "off") => {
                self.call(device, command, Value::Null).await?;
                let state = if command == "on" { "on" } else { "off" };
                Ok(ToolOutput::message(format!("{device_name} turned {state}"))
                    .with_data(json!({ "device": device_name, "device_on": command == "on" })))
            }
            ("power", "toggle") => {
                let info = self.call(device, "info", Value::Null).await?;
                let is_on = info
                    .get("device_on")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let next = if is_on { "off" } else { "on" };
                self.call(device, next, Value::Null).await?;
                Ok(
                    ToolOutput::message(format!("{device_name} toggled {next}"))
                        .with_data(json!({ "device": device_name, "device_on": !is_on })),
                )
            }
            ("brightness", _) => {
                let brightness = params
                    .integer("brightness")
                    .ok_or_else(|| Error::validation("brightness", "required"))?;
                self.call(device, "brightness", json!({ "brightness": brightness }))
                    .await?;
                Ok(
                    ToolOutput::message(format!("{device_name} brightness set to {brightness}%"))
                        .with_data(json!({ "device": device_name, "brightness": brightness })),
                )
            }
            ("color", _) => {
                let (hue, saturation, label) = Self::color_args(params)?;
                self.call(
                    device,
                    "color",
                    json!({ "hue": hue, "saturation": saturation }),
                )
                .await?;
                Ok(ToolOutput::message(format!("{device_name} color set to {label}"))
                    .with_data(json!({
                        "device": device_name,
                        "hue": hue,
                        "saturation": saturation,
                    })))
            }
            ("info", _) => {
                let info = self.call(device, "info", Value::Null).await?;
                let summary = json!({
                    "device": device_name,
                    "device_on": info.get("device_on"),
                    "brightness": info.get("brightness"),
                    "color_temp": info.get("color_temp"),
                    "hue": info.get("hue"),
                    "saturation": info.get("saturation"),
                });
                let state = match info.get("device_on").and_then(Value::as_bool) {
                    Some(true) => "on",
                    Some(false) => "off",
                    None => "unknown",
                };
                Ok(ToolOutput::message(format!("{device_name} is {state}")).with_data(summary))
            }
            _ => Err(Error::IncompatibleActionCommand {
                action: action.to_string(),
                command: command.to_string(),
            }),
        }
    }
}

/// Builds [`SmartPlugTool`]s
#[derive(Debug, Default)]
pub struct SmartPlugFactory;

impl ToolFactory for SmartPlugFactory {
    fn validate_config(&self, config: &ModuleConfig) -> Result<()> {
        config.parse::<SmartPlugConfig>()?.validate()
    }

    fn build(&self, name: &str, config: &ModuleConfig) -> Result<Arc<dyn ToolAdapter>> {
        Ok(Arc::new(SmartPlugTool::new(name, config.parse()?)?))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;

    fn config() -> SmartPlugConfig {
        serde_json::from_value(json!({
            "bridge_url": "http://127.0.0.1:9/",
            "username": "me@example.com",
            "password": "hunter2",
            "devices": {
                "lamp": { "ip": "192.168.1.20", "model": "l530" },
                "heater": { "ip": "192.168.1.21", "model": "p110" }
            },
            "default_device": "lamp"
        }))
        .unwrap()
    }

    fn validate(tool: &SmartPlugTool, value: Value) -> Result<ValidatedParams> {
        let raw: Map<String, Value> = value.as_object().cloned().unwrap();
        tool.schema().validate(&raw)
    }

    #[test]
    fn test_hex_conversion() {
        assert_eq!(hex_to_hue_saturation("#FF0000"), Some((0, 100)));
        assert_eq!(hex_to_hue_saturation("#00ff00"), Some((120, 100)));
        assert_eq!(hex_to_hue_saturation("0000ff"), Some((240, 100)));
        assert_eq!(hex_to_hue_saturation("#ffffff"), Some((0, 0)));
        assert_eq!(hex_to_hue_saturation("#zzzzzz"), None);
        assert_eq!(hex_to_hue_saturation("#fff"), None);
    }

    #[test]
    fn test_default_device_applied() {
        let tool = SmartPlugTool::new("tapo", config()).unwrap();
        let params = validate(&tool, json!({"action": "power", "command": "on"})).unwrap();
        assert_eq!(params.text("device"), Some("lamp"));
    }

    #[test]
    fn test_unknown_device_rejected() {
        let tool = SmartPlugTool::new("tapo", config()).unwrap();
        let err = validate(
            &tool,
            json!({"action": "power", "command": "on", "device": "garage"}),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "device"));
    }

    #[test]
    fn test_brightness_required_and_bounded() {
        let tool = SmartPlugTool::new("tapo", config()).unwrap();
        assert!(validate(&tool, json!({"action": "brightness"})).is_err());
        assert!(validate(&tool, json!({"action": "brightness", "brightness": 101})).is_err());

        let params = validate(&tool, json!({"action": "brightness", "brightness": 40})).unwrap();
        assert_eq!(params.command(), Some("set"));
        assert_eq!(params.integer("brightness"), Some(40));
    }

    #[test]
    fn test_color_requires_value() {
        let tool = SmartPlugTool::new("tapo", config()).unwrap();
        assert!(validate(&tool, json!({"action": "color"})).is_err());
        assert!(validate(&tool, json!({"action": "color", "color": "chartreuse"})).is_err());
        assert!(validate(&tool, json!({"action": "color", "color": "Rouge"})).is_ok());
        assert!(validate(&tool, json!({"action": "color", "color": "#00FF00"})).is_ok());
        assert!(validate(&tool, json!({"action": "color", "hue": 200})).is_ok());
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let mut cfg = config();
        cfg.username = Some(String::new());
        cfg.password = Some(String::new());
        assert!(matches!(
            SmartPlugTool::new("tapo", cfg),
            Err(Error::ConfigValidation(_))
        ));
    }

    #[test]
    fn test_bad_default_device_rejected() {
        let mut cfg = config();
        cfg.default_device = Some("garage".to_string());
        assert!(matches!(cfg.validate(), Err(Error::ConfigValidation(_))));
    }

    #[tokio::test]
    async fn test_plug_has_no_brightness() {
        let tool = SmartPlugTool::new("tapo", config()).unwrap();
        let params = validate(
            &tool,
            json!({"action": "brightness", "brightness": 50, "device": "heater"}),
        )
        .unwrap();
        let err = tool.execute(&params).await.unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "device"));
    }

    #[test]
    fn test_color_args_from_name_and_hue() {
        let tool = SmartPlugTool::new("tapo", config()).unwrap();

        let params = validate(&tool, json!({"action": "color", "color": "bleu"})).unwrap();
        let (hue, saturation, _) = SmartPlugTool::color_args(&params).unwrap();
        assert_eq!((hue, saturation), (240, 100));

        let params = validate(&tool, json!({"action": "color", "hue": 30})).unwrap();
        let (hue, saturation, _) = SmartPlugTool::color_args(&params).unwrap();
        assert_eq!((hue, saturation), (30, 100));
    }
}
