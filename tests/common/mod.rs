//! Shared test utilities

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use switchboard::bus::{Envelope, Subscription};
use switchboard::config::ModuleConfig;
use switchboard::modules::{InputFactory, InputModule, ModuleContext, OutputFactory, OutputModule};
use switchboard::reasoning::{ConversationContext, Decision, Reasoner};
use switchboard::schema::{FieldSpec, ToolSchema, ValidatedParams};
use switchboard::tools::{
    DispatchPriority, ToolAdapter, ToolCallRequest, ToolFactory, ToolOutput,
};
use switchboard::{Error, Result};
use tokio::sync::mpsc;

/// Ordered record of tool activity shared between mocks and the test
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Turn a JSON object literal into raw parameters
pub fn params(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// Tool call request from a JSON object literal
pub fn call(tool: &str, value: Value) -> ToolCallRequest {
    ToolCallRequest::new(tool, params(value))
}

/// Module config of the given type from a JSON object literal
pub fn module(module_type: &str, value: Value) -> ModuleConfig {
    ModuleConfig::new(module_type, params(value))
}

/// Receive the next envelope or fail after five seconds
pub async fn next(subscription: &mut Subscription) -> Arc<Envelope> {
    tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("timed out waiting for envelope")
        .expect("subscription closed")
}

// -- tools ------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MockToolConfig {
    #[serde(default)]
    delay_ms: u64,
    timeout_ms: Option<u64>,
    #[serde(default)]
    time_critical: bool,
    gpio_pin: Option<u8>,
    #[serde(default)]
    fail_build: bool,
    /// Panic inside `execute`
    #[serde(default)]
    panic: bool,
}

/// Lamp-like tool that records every execution
pub struct MockTool {
    name: String,
    schema: ToolSchema,
    delay: Duration,
    timeout: Duration,
    priority: DispatchPriority,
    panics: bool,
    log: CallLog,
}

fn lamp_schema() -> ToolSchema {
    ToolSchema::new()
        .action("power", &["on", "off"])
        .action("brightness", &["set"])
        .field(
            FieldSpec::integer("level", 0, 100)
                .only_for(&["brightness"])
                .required_for(&["brightness"]),
        )
}

#[async_trait]
impl ToolAdapter for MockTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Test lamp"
    }

    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn priority(&self) -> DispatchPriority {
        self.priority
    }

    async fn execute(&self, params: &ValidatedParams) -> Result<ToolOutput> {
        let command = params.command().unwrap_or_default().to_string();
        self.log.push(format!("start {} {command}", self.name));
        tokio::time::sleep(self.delay).await;
        assert!(!self.panics, "{} blew a fuse", self.name);
        self.log.push(format!("end {} {command}", self.name));
        Ok(ToolOutput::message(format!("{} turned {command}", self.name)))
    }
}

/// Builds [`MockTool`]s and counts constructions
#[derive(Debug, Clone, Default)]
pub struct MockToolFactory {
    pub log: CallLog,
    pub builds: Arc<AtomicUsize>,
}

impl MockToolFactory {
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl ToolFactory for MockToolFactory {
    fn validate_config(&self, config: &ModuleConfig) -> Result<()> {
        config.parse::<MockToolConfig>().map(|_| ())
    }

    fn resources(&self, config: &ModuleConfig) -> Result<Vec<String>> {
        let cfg: MockToolConfig = config.parse()?;
        Ok(cfg.gpio_pin.map(|pin| format!("gpio:{pin}")).into_iter().collect())
    }

    fn build(&self, name: &str, config: &ModuleConfig) -> Result<Arc<dyn ToolAdapter>> {
        let cfg: MockToolConfig = config.parse()?;
        if cfg.fail_build {
            return Err(Error::construction(name, "device unreachable"));
        }
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockTool {
            name: name.to_string(),
            schema: lamp_schema(),
            delay: Duration::from_millis(cfg.delay_ms),
            timeout: cfg
                .timeout_ms
                .map_or(Duration::from_secs(10), Duration::from_millis),
            priority: if cfg.time_critical {
                DispatchPriority::TimeCritical
            } else {
                DispatchPriority::Normal
            },
            panics: cfg.panic,
            log: self.log.clone(),
        }))
    }
}

// -- reasoning --------------------------------------------------------------

type Script = dyn Fn(&str, &ConversationContext) -> Result<Decision> + Send + Sync;

/// Reasoner driven by a closure
pub struct ScriptedReasoner {
    script: Box<Script>,
    delay: Duration,
    pub inputs: CallLog,
}

impl ScriptedReasoner {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&str, &ConversationContext) -> Result<Decision> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            delay: Duration::ZERO,
            inputs: CallLog::default(),
        }
    }

    /// Wait this long before every decision
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Issue `calls` on the first round, then answer with the tool messages
    pub fn tool_then_answer(calls: Vec<ToolCallRequest>) -> Self {
        Self::new(move |_, context| {
            if context.steps.is_empty() {
                Ok(Decision::ToolCalls(calls.clone()))
            } else {
                let messages: Vec<&str> = context.results().map(|r| r.message.as_str()).collect();
                Ok(Decision::FinalAnswer(format!("Done: {}", messages.join(", "))))
            }
        })
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn decide(&self, input: &str, context: &ConversationContext) -> Result<Decision> {
        self.inputs.push(input.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.script)(input, context)
    }
}

// -- modules ----------------------------------------------------------------

/// Output that forwards every delivered envelope to the test
pub struct RecordingOutput {
    name: String,
    tx: mpsc::UnboundedSender<Envelope>,
}

#[async_trait]
impl OutputModule for RecordingOutput {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, envelope: &Envelope) -> Result<()> {
        self.tx
            .send(envelope.clone())
            .map_err(|e| Error::Bus(e.to_string()))
    }
}

/// Builds [`RecordingOutput`]s that all report to one receiver
pub struct RecordingOutputFactory {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl RecordingOutputFactory {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl OutputFactory for RecordingOutputFactory {
    fn build(&self, name: &str, _config: &ModuleConfig) -> Result<Arc<dyn OutputModule>> {
        Ok(Arc::new(RecordingOutput {
            name: name.to_string(),
            tx: self.tx.clone(),
        }))
    }
}

/// Input that publishes its configured lines, then idles until shutdown
pub struct ScriptedInput {
    name: String,
    lines: Vec<String>,
}

#[async_trait]
impl InputModule for ScriptedInput {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Box<Self>, ctx: ModuleContext) -> Result<()> {
        for line in &self.lines {
            ctx.bus.publish(Envelope::inbound(&self.name, line.as_str()));
        }
        ctx.shutdown.cancelled().await;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ScriptedInputConfig {
    #[serde(default)]
    lines: Vec<String>,
    #[serde(default)]
    panic: bool,
    /// Fail construction the way a busy device would
    #[serde(default)]
    fail_build: bool,
}

/// Builds [`ScriptedInput`]s, or inputs that panic when `panic: true`
pub struct ScriptedInputFactory;

struct PanickingInput {
    name: String,
}

#[async_trait]
impl InputModule for PanickingInput {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Box<Self>, _ctx: ModuleContext) -> Result<()> {
        // Give the test time to subscribe to lifecycle errors
        tokio::time::sleep(Duration::from_millis(200)).await;
        panic!("input {} exploded", self.name);
    }
}

impl InputFactory for ScriptedInputFactory {
    fn build(&self, name: &str, config: &ModuleConfig) -> Result<Box<dyn InputModule>> {
        let cfg: ScriptedInputConfig = config.parse()?;
        if cfg.fail_build {
            return Err(Error::Bus("microphone busy".to_string()));
        }
        if cfg.panic {
            return Ok(Box::new(PanickingInput {
                name: name.to_string(),
            }));
        }
        Ok(Box::new(ScriptedInput {
            name: name.to_string(),
            lines: cfg.lines,
        }))
    }
}
