//! Terminal input and output

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::{InputFactory, InputModule, ModuleContext, OutputFactory, OutputModule};
use crate::Result;
use crate::bus::{Envelope, EnvelopeKind, LifecycleKind, Payload};
use crate::config::ModuleConfig;

/// History entries shown by the `history` command
const HISTORY_SHOWN: usize = 10;

const HELP: &str = "\
Commands:
  help, ?       show this help
  history       show recent messages
  clear         clear the screen
  test          check the terminal works
  exit, quit, q stop switchboard

Anything else is sent to the assistant, e.g. \"turn on the bedroom lamp\".
";

/// Terminal input settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TerminalInputConfig {
    #[serde(default = "default_prompt")]
    pub prompt: String,
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// Request shutdown when stdin closes
    #[serde(default = "default_true")]
    pub exit_on_eof: bool,
}

impl Default for TerminalInputConfig {
    fn default() -> Self {
        Self {
            prompt: default_prompt(),
            history_size: default_history_size(),
            exit_on_eof: true,
        }
    }
}

fn default_prompt() -> String {
    "switchboard> ".to_string()
}

const fn default_history_size() -> usize {
    100
}

const fn default_true() -> bool {
    true
}

/// What a line typed at the prompt means
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineCommand {
    Empty,
    Exit,
    Help,
    History,
    Clear,
    Test,
    Message(String),
}

impl LineCommand {
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        match line.to_lowercase().as_str() {
            "" => Self::Empty,
            "exit" | "quit" | "q" => Self::Exit,
            "help" | "?" => Self::Help,
            "history" => Self::History,
            "clear" => Self::Clear,
            "test" => Self::Test,
            _ => Self::Message(line.to_string()),
        }
    }
}

type Reader = Box<dyn AsyncBufRead + Unpin + Send>;
type Writer = Box<dyn AsyncWrite + Unpin + Send>;

/// Reads lines from stdin and publishes them
pub struct TerminalInput {
    name: String,
    config: TerminalInputConfig,
    reader: Reader,
    writer: Writer,
    history: VecDeque<String>,
}

impl std::fmt::Debug for TerminalInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalInput")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TerminalInput {
    /// Terminal input on stdin/stdout
    #[must_use]
    pub fn new(name: &str, config: TerminalInputConfig) -> Self {
        Self::with_io(
            name,
            config,
            Box::new(BufReader::new(tokio::io::stdin())),
            Box::new(tokio::io::stdout()),
        )
    }

    /// Terminal input on arbitrary streams
    #[must_use]
    pub fn with_io(name: &str, config: TerminalInputConfig, reader: Reader, writer: Writer) -> Self {
        Self {
            name: name.to_string(),
            history: VecDeque::with_capacity(config.history_size.min(1024)),
            config,
            reader,
            writer,
        }
    }

    fn remember(&mut self, line: &str) {
        if self.config.history_size == 0 {
            return;
        }
        self.history.push_back(line.to_string());
        while self.history.len() > self.config.history_size {
            self.history.pop_front();
        }
    }

    fn render_history(&self) -> String {
        if self.history.is_empty() {
            return "No messages yet.\n".to_string();
        }
        let skip = self.history.len().saturating_sub(HISTORY_SHOWN);
        let mut out = String::new();
        for (i, line) in self.history.iter().skip(skip).enumerate() {
            let _ = writeln!(out, "{:2}. {line}", i + 1);
        }
        if skip > 0 {
            let _ = writeln!(out, "... and {skip} earlier");
        }
        out
    }

    async fn write(&mut self, text: &str) -> Result<()> {
        self.writer.write_all(text.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl InputModule for TerminalInput {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(mut self: Box<Self>, ctx: ModuleContext) -> Result<()> {
        self.write("Type 'help' for commands, 'exit' to quit.\n").await?;

        loop {
            let prompt = self.config.prompt.clone();
            self.write(&prompt).await?;

            let mut line = String::new();
            let read = tokio::select! {
                () = ctx.shutdown.cancelled() => break,
                read = self.reader.read_line(&mut line) => read?,
            };

            if read == 0 {
                tracing::info!(input = %self.name, "terminal input closed");
                if self.config.exit_on_eof {
                    ctx.bus.publish(Envelope::lifecycle(
                        &self.name,
                        LifecycleKind::Stop,
                        Some("end of input".to_string()),
                    ));
                }
                break;
            }

            match LineCommand::parse(&line) {
                LineCommand::Empty => {}
                LineCommand::Exit => {
                    self.write("Goodbye!\n").await?;
                    ctx.bus.publish(Envelope::lifecycle(
                        &self.name,
                        LifecycleKind::Stop,
                        Some("exit requested".to_string()),
                    ));
                    break;
                }
                LineCommand::Help => self.write(HELP).await?,
                LineCommand::History => {
                    let history = self.render_history();
                    self.write(&history).await?;
                }
                LineCommand::Clear => self.write("\x1b[2J\x1b[H").await?,
                LineCommand::Test => self.write("Terminal works.\n").await?,
                LineCommand::Message(text) => {
                    self.remember(&text);
                    tracing::debug!(input = %self.name, text = %text, "terminal message");
                    ctx.bus.publish(Envelope::inbound(&self.name, text));
                }
            }
        }
        Ok(())
    }
}

/// Builds [`TerminalInput`]s
#[derive(Debug, Default)]
pub struct TerminalInputFactory;

impl InputFactory for TerminalInputFactory {
    fn validate_config(&self, config: &ModuleConfig) -> Result<()> {
        config.parse::<TerminalInputConfig>().map(|_| ())
    }

    fn build(&self, name: &str, config: &ModuleConfig) -> Result<Box<dyn InputModule>> {
        Ok(Box::new(TerminalInput::new(name, config.parse()?)))
    }
}

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";

fn color_code(name: &str) -> &'static str {
    match name {
        "blue" => "\x1b[94m",
        "red" => "\x1b[91m",
        "yellow" => "\x1b[93m",
        "magenta" => "\x1b[95m",
        "cyan" => "\x1b[96m",
        "white" => "\x1b[97m",
        _ => "\x1b[92m",
    }
}

/// Terminal output settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TerminalOutputConfig {
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Color of normal responses
    #[serde(default = "default_color_scheme")]
    pub color_scheme: String,
    /// Emit ANSI escape codes
    #[serde(default = "default_true")]
    pub colors: bool,
    #[serde(default)]
    pub show_timestamp: bool,
    #[serde(default)]
    pub show_source: bool,
    /// Also print lifecycle errors
    #[serde(default = "default_true")]
    pub show_errors: bool,
    #[serde(default)]
    pub sources: Vec<String>,
}

impl Default for TerminalOutputConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            color_scheme: default_color_scheme(),
            colors: true,
            show_timestamp: false,
            show_source: false,
            show_errors: true,
            sources: Vec::new(),
        }
    }
}

fn default_prefix() -> String {
    "[switchboard] ".to_string()
}

fn default_color_scheme() -> String {
    "green".to_string()
}

/// Prints responses to stdout
#[derive(Debug)]
pub struct TerminalOutput {
    name: String,
    config: TerminalOutputConfig,
}

impl TerminalOutput {
    #[must_use]
    pub fn new(name: &str, config: TerminalOutputConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
        }
    }

    /// Render an envelope as one terminal line
    #[must_use]
    pub fn format(&self, envelope: &Envelope) -> String {
        let paint = |code: &str| if self.config.colors { code.to_string() } else { String::new() };
        let reset = paint(RESET);

        let (color, content) = match (&envelope.kind, &envelope.payload) {
            (EnvelopeKind::Lifecycle(LifecycleKind::Error), payload) => (
                "red",
                format!("Error: {}", payload.text().unwrap_or("unknown")),
            ),
            (_, Payload::Response { text, results }) if results.iter().any(|r| !r.success) => {
                ("yellow", text.clone())
            }
            (_, payload) => (
                self.config.color_scheme.as_str(),
                payload.text().unwrap_or_default().to_string(),
            ),
        };
        let color = paint(color_code(color));

        let mut parts = Vec::new();
        if self.config.show_timestamp {
            parts.push(format!(
                "[{}]",
                envelope.timestamp.with_timezone(&chrono::Local).format("%H:%M:%S")
            ));
        }
        parts.push(format!(
            "{color}{}{}{reset}",
            paint(BOLD),
            self.config.prefix.trim_end()
        ));
        if self.config.show_source {
            let source = envelope.target.as_deref().unwrap_or(&envelope.origin);
            parts.push(format!("{}({source}){reset}", paint(DIM)));
        }
        parts.push(format!("{color}{content}{reset}"));
        parts.join(" ")
    }
}

#[async_trait]
impl OutputModule for TerminalOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn sources(&self) -> &[String] {
        &self.config.sources
    }

    fn accepts(&self, envelope: &Envelope) -> bool {
        let routed = envelope.kind == EnvelopeKind::OutboundText
            && (self.config.sources.is_empty()
                || envelope
                    .target
                    .as_ref()
                    .is_some_and(|t| self.config.sources.contains(t)));
        routed || (self.config.show_errors && envelope.is_lifecycle(LifecycleKind::Error))
    }

    async fn deliver(&self, envelope: &Envelope) -> Result<()> {
        let line = format!("{}\n", self.format(envelope));
        let mut stdout = tokio::io::stdout();
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }
}

/// Builds [`TerminalOutput`]s
#[derive(Debug, Default)]
pub struct TerminalOutputFactory;

impl OutputFactory for TerminalOutputFactory {
    fn validate_config(&self, config: &ModuleConfig) -> Result<()> {
        config.parse::<TerminalOutputConfig>().map(|_| ())
    }

    fn build(&self, name: &str, config: &ModuleConfig) -> Result<Arc<dyn OutputModule>> {
        Ok(Arc::new(TerminalOutput::new(name, config.parse()?)))
    }
}
