//! Current weather from OpenWeatherMap

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

/// Letters (including Latin-1 accents), spaces, and `-'.,`
const CITY_PATTERN: &str = r"^[a-zA-ZÀ-ÿ\s\-'.,]+$";

/// Weather tool configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WeatherConfig {
    /// Falls back to `OPENWEATHER_API_KEY`
    pub api_key: Option<String>,
    #[serde(default = "default_units", alias = "default_units")]
    pub units: String,
    #[serde(default = "default_language", alias = "default_language")]
    pub language: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_geo_url")]
    pub geo_url: String,
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_units() -> String {
    "metric".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

fn default_api_url() -> String {
    "https://api.openweathermap.org/data/2.5".to_string()
}

fn default_geo_url() -> String {
    "https://api.openweathermap.org/geo/1.0".to_string()
}

impl WeatherConfig {
    fn api_key(&self) -> Result<SecretString> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("OPENWEATHER_API_KEY").ok())
            .filter(|k| !k.is_empty())
            .map(SecretString::from)
            .ok_or_else(|| {
                Error::ConfigValidation(
                    "weather tool needs api_key (or OPENWEATHER_API_KEY)".to_string(),
                )
            })
    }
}

#[derive(Debug, Deserialize)]
struct GeoHit {
    lat: f64,
    lon: f64,
}

/// Current conditions for a city
pub struct WeatherTool {
    name: String,
    schema: ToolSchema,
    client: reqwest::Client,
    config: WeatherConfig,
    api_key: SecretString,
    timeout: Duration,
}

impl std::fmt::Debug for WeatherTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeatherTool")
            .field("name", &self.name)
            .field("units", &self.config.units)
            .finish_non_exhaustive()
    }
}

impl WeatherTool {
    /// Create the tool
    ///
    /// # Errors
    ///
    /// Returns `ConfigValidation` without an API key
    pub fn new(name: &str, config: WeatherConfig) -> Result<Self> {
        let api_key = config.api_key()?;
        let pattern = Regex::new(CITY_PATTERN).map_err(|e| Error::construction(name, e))?;
        let schema = ToolSchema::new().field(
            FieldSpec::text("city", 2, 100)
                .describe("City name, e.g. Paris or Saint-Étienne")
                .pattern(pattern)
                .required(),
        );
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::construction(name, e))?;

        Ok(Self {
            name: name.to_string(),
            schema,
            client,
            timeout: Duration::from_millis(config.timeout_ms.unwrap_or(20_000)),
            config,
            api_key,
        })
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value> {
        self.config
            .retry
            .run("weather request", || async {
                let response = self
                    .client
                    .get(url)
                    .query(query)
                    .query(&[("appid", self.api_key.expose_secret())])
                    .send()
                    .await
                    .map_err(classify_request_error)?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(classify_status(status.as_u16(), &body));
                }
                response.json::<Value>().await.map_err(classify_request_error)
            })
            .await
    }

    async fn coordinates(&self, city: &str) -> Result<Option<(f64, f64)>> {
        let url = format!("{}/direct", self.config.geo_url);
        let hits = self
            .get_json(&url, &[("q", city.to_string()), ("limit", "1".to_string())])
            .await?;
        let hits: Vec<GeoHit> = serde_json::from_value(hits)?;
        Ok(hits.first().map(|h| (h.lat, h.lon)))
    }
}

/// Build the spoken summary and structured data from a weather response
///
/// # Errors
///
/// Returns `ToolExecution` if required fields are missing
pub fn summarize(data: &Value, units: &str) -> Result<ToolOutput> {
    let missing = |what: &str| Error::ToolExecution(format!("incomplete weather data: {what}"));

    let city = data["name"].as_str().ok_or_else(|| missing("name"))?;
    let temperature = data["main"]["temp"]
        .as_f64()
        .ok_or_else(|| missing("main.temp"))?
        .round();
    let feels_like = data["main"]["feels_like"].as_f64().map(f64::round);
    let humidity = data["main"]["humidity"]
        .as_i64()
        .ok_or_else(|| missing("main.humidity"))?;
    let description = data["weather"][0]["description"]
        .as_str()
        .unwrap_or_default();
    let icon = data["weather"][0]["icon"].as_str().unwrap_or_default();
    // Clear or few clouds, daytime
    let sunny = icon.ends_with('d') && (icon.starts_with("01") || icon.starts_with("02"));

    let unit = match units {
        "imperial" => "°F",
        "standard" => "K",
        _ => "°C",
    };

    let mut message = format!("Weather in {city}: {temperature}{unit}, humidity {humidity}%");
    if !description.is_empty() {
        message.push_str(&format!(", {description}"));
    }
    if sunny {
        message.push_str(", sunny");
    }

    Ok(ToolOutput::message(message).with_data(json!({
        "city": city,
        "country": data["sys"]["country"],
        "temperature": temperature,
        "feels_like": feels_like,
        "humidity": humidity,
        "pressure": data["main"]["pressure"],
        "description": description,
        "wind_speed": data["wind"]["speed"],
        "sunny": sunny,
        "units": unit,
        "icon": icon,
    })))
}

#[async_trait]
impl ToolAdapter for WeatherTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Gets the current weather for a city: temperature, humidity and conditions"
    }

    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn execute(&self, params: &ValidatedParams) -> Result<ToolOutput> {
        let city = params
            .text("city")
            .ok_or_else(|| Error::validation("city", "required"))?;
        tracing::info!(tool = %self.name, city, "weather lookup");

        let (lat, lon) = self
            .coordinates(city)
            .await?
            .ok_or_else(|| Error::ToolExecution(format!("city '{city}' not found")))?;

        let url = format!("{}/weather", self.config.api_url);
        let data = self
            .get_json(
                &url,
                &[
                    ("lat", lat.to_string()),
                    ("lon", lon.to_string()),
                    ("units", self.config.units.clone()),
                    ("lang", self.config.language.clone()),
                ],
            )
            .await?;

        summarize(&data, &self.config.units)
    }
}

/// Builds [`WeatherTool`]s
#[derive(Debug, Default)]
pub struct WeatherFactory;

impl ToolFactory for WeatherFactory {
    fn validate_config(&self, config: &ModuleConfig) -> Result<()> {
        config.parse::<WeatherConfig>()?.api_key().map(|_| ())
    }

    fn build(&self, name: &str, config: &ModuleConfig) -> Result<Arc<dyn ToolAdapter>> {
        Ok(Arc::new(WeatherTool::new(name, config.parse()?)?))
    }
}
