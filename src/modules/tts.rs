//! Speech output through external commands
//!
//! The synthesis command reads text on stdin and writes a WAV file; the
//! player command plays it. `{output}` in either command line is replaced
//! with the WAV path.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::{OutputFactory, OutputModule};
use crate::bus::Envelope;
use crate::config::ModuleConfig;
use crate::{Error, Result};

/// Placeholder for the generated WAV path
const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Speech output settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TtsConfig {
    #[serde(default = "default_synth_command")]
    pub synth_command: Vec<String>,
    #[serde(default = "default_player_command")]
    pub player_command: Vec<String>,
    /// Budget for synthesis plus playback
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub sources: Vec<String>,
}

fn default_synth_command() -> Vec<String> {
    [
        "piper",
        "--model",
        "models/en_US-lessac-medium.onnx",
        "--output_file",
        OUTPUT_PLACEHOLDER,
    ]
    .map(String::from)
    .to_vec()
}

fn default_player_command() -> Vec<String> {
    ["aplay", "-q", OUTPUT_PLACEHOLDER].map(String::from).to_vec()
}

const fn default_timeout_secs() -> u64 {
    60
}

impl TtsConfig {
    fn check(&self) -> Result<()> {
        if self.synth_command.is_empty() {
            return Err(Error::ConfigValidation("tts synth_command is empty".to_string()));
        }
        if self.player_command.is_empty() {
            return Err(Error::ConfigValidation("tts player_command is empty".to_string()));
        }
        Ok(())
    }
}

/// Substitute the WAV path into a command line
#[must_use]
pub fn expand_command(command: &[String], output: &Path) -> Vec<String> {
    let output = output.to_string_lossy();
    command
        .iter()
        .map(|arg| arg.replace(OUTPUT_PLACEHOLDER, &output))
        .collect()
}

/// Speaks responses
pub struct TtsOutput {
    name: String,
    config: TtsConfig,
    workdir: TempDir,
    /// One utterance at a time
    speaking: Mutex<()>,
}

impl std::fmt::Debug for TtsOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtsOutput")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TtsOutput {
    /// Create the output with its own scratch directory
    ///
    /// # Errors
    ///
    /// Returns `ConfigValidation` for empty commands and `Io` if the scratch
    /// directory cannot be created
    pub fn new(name: &str, config: TtsConfig) -> Result<Self> {
        config.check()?;
        Ok(Self {
            name: name.to_string(),
            config,
            workdir: tempfile::Builder::new().prefix("switchboard-tts").tempdir()?,
            speaking: Mutex::new(()),
        })
    }

    async fn run(&self, command: &[String], stdin: Option<&str>) -> Result<()> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| Error::ConfigValidation("empty command".to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ToolExecution(format!("failed to spawn {program}: {e}")))?;

        if let (Some(text), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(text.as_bytes()).await?;
            // Close stdin so the synthesizer sees end of input
            drop(pipe);
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ToolExecution(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn speak(&self, text: &str) -> Result<()> {
        let wav = self.workdir.path().join(format!("{}.wav", uuid::Uuid::new_v4()));

        self.run(&expand_command(&self.config.synth_command, &wav), Some(text))
            .await?;
        let played = self
            .run(&expand_command(&self.config.player_command, &wav), None)
            .await;

        if let Err(e) = tokio::fs::remove_file(&wav).await {
            tracing::debug!(output = %self.name, error = %e, "could not remove wav");
        }
        played
    }
}

#[async_trait]
impl OutputModule for TtsOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn sources(&self) -> &[String] {
        &self.config.sources
    }

    async fn deliver(&self, envelope: &Envelope) -> Result<()> {
        let text = envelope.payload.text().unwrap_or_default().trim();
        if text.is_empty() {
            return Ok(());
        }

        let _speaking = self.speaking.lock().await;
        tracing::info!(output = %self.name, text, "speaking");

        let budget = Duration::from_secs(self.config.timeout_secs);
        timeout(budget, self.speak(text))
            .await
            .map_err(|_| Error::ToolExecution(format!("speech timed out after {budget:?}")))?
    }
}

/// Builds [`TtsOutput`]s
#[derive(Debug, Default)]
pub struct TtsOutputFactory;

impl OutputFactory for TtsOutputFactory {
    fn validate_config(&self, config: &ModuleConfig) -> Result<()> {
        config.parse::<TtsConfig>()?.check()
    }

    fn build(&self, name: &str, config: &ModuleConfig) -> Result<Arc<dyn OutputModule>> {
        Ok(Arc::new(TtsOutput::new(name, config.parse()?)?))
    }
}
