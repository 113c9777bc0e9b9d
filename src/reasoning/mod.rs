//! Reasoning collaborators
//!
//! The engine treats reasoning as an opaque "decide next action" call: given
//! the user's text and the conversation so far, a [`Reasoner`] either answers
//! directly or asks for tool calls. Tool results are appended to the context
//! as a [`Step`] and the reasoner is consulted again.

pub mod openai;

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

pub use openai::OpenAiReasoner;

use crate::config::CoreConfig;
use crate::tools::{ToolCallRequest, ToolCallResult};
use crate::{Error, Result};

/// What the reasoner wants to happen next
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Reply to the user
    FinalAnswer(String),
    /// Run these tools, in order, then consult the reasoner again
    ToolCalls(Vec<ToolCallRequest>),
}

/// One completed user/assistant exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exchange {
    pub user: String,
    pub assistant: String,
}

/// One round of tool calls within the current exchange
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    pub calls: Vec<ToolCallRequest>,
    pub results: Vec<ToolCallResult>,
}

/// Everything the reasoner may look at besides the current input
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    /// Input module the conversation belongs to
    pub origin: String,
    /// Earlier exchanges with this origin, oldest first
    pub history: Vec<Exchange>,
    /// Tool rounds already taken for the current input
    pub steps: Vec<Step>,
    /// Function definitions of the live tools
    pub tools: Vec<Value>,
}

impl ConversationContext {
    /// Fresh context for `origin`
    pub fn new(origin: impl Into<String>, history: Vec<Exchange>, tools: Vec<Value>) -> Self {
        Self {
            origin: origin.into(),
            history,
            steps: Vec::new(),
            tools,
        }
    }

    /// Every tool result of the current input, in request order
    pub fn results(&self) -> impl Iterator<Item = &ToolCallResult> {
        self.steps.iter().flat_map(|s| s.results.iter())
    }
}

/// The "decide next action" service
#[async_trait]
pub trait Reasoner: Send + Sync {
    fn name(&self) -> &str;

    /// Decide how to answer `input`
    ///
    /// # Errors
    ///
    /// Returns `Reasoning` when the collaborator fails or answers with
    /// something unusable
    async fn decide(&self, input: &str, context: &ConversationContext) -> Result<Decision>;
}

/// Repeats the input back; needs no network
#[derive(Debug, Default)]
pub struct EchoReasoner;

#[async_trait]
impl Reasoner for EchoReasoner {
    fn name(&self) -> &str {
        "echo"
    }

    async fn decide(&self, input: &str, _context: &ConversationContext) -> Result<Decision> {
        Ok(Decision::FinalAnswer(input.to_string()))
    }
}

/// Default system prompt listing the live tools
#[must_use]
pub fn system_prompt(preamble: Option<&str>, tools: &[Value]) -> String {
    let mut prompt = preamble
        .unwrap_or(
            "You are Switchboard, a voice assistant that controls smart devices.\n\
             Be concise. Use the tools to act on devices and report what happened.\n\
             If a tool fails, say so plainly.",
        )
        .trim_end()
        .to_string();

    if !tools.is_empty() {
        prompt.push_str("\n\nAvailable tools:\n");
        for tool in tools {
            let function = &tool["function"];
            let _ = writeln!(
                prompt,
                "- {}: {}",
                function["name"].as_str().unwrap_or_default(),
                function["description"].as_str().unwrap_or_default()
            );
        }
    }
    prompt
}

/// Build the reasoner selected by `core.reasoner`
///
/// # Errors
///
/// Returns `UnknownModule` for an unknown reasoner type and
/// `ConfigValidation` when the selected one is misconfigured
pub fn from_config(core: &CoreConfig) -> Result<Arc<dyn Reasoner>> {
    match core.reasoner.as_str() {
        "openai" => Ok(Arc::new(OpenAiReasoner::new(core)?)),
        "echo" => Ok(Arc::new(EchoReasoner)),
        other => Err(Error::UnknownModule(format!(
            "reasoner {other} (known: echo, openai)"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_echo_reasoner() {
        let decision = EchoReasoner
            .decide("hello", &ConversationContext::default())
            .await
            .unwrap();
        assert_eq!(decision, Decision::FinalAnswer("hello".to_string()));
    }

    #[test]
    fn test_system_prompt_lists_tools() {
        let tools = vec![json!({
            "type": "function",
            "function": {"name": "lamp", "description": "Bedroom lamp"}
        })];
        let prompt = system_prompt(Some("Custom preamble."), &tools);
        assert!(prompt.starts_with("Custom preamble."));
        assert!(prompt.contains("- lamp: Bedroom lamp"));
    }

    #[test]
    fn test_unknown_reasoner() {
        let core = CoreConfig {
            reasoner: "oracle".to_string(),
            ..CoreConfig::default()
        };
        assert!(matches!(from_config(&core), Err(Error::UnknownModule(_))));
    }
}
