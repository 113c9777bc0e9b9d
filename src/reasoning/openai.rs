//! OpenAI-compatible chat completions with function calling

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::{ConversationContext, Decision, Reasoner, system_prompt};
use crate::config::CoreConfig;
use crate::tools::ToolCallRequest;
use crate::{Error, Result};

/// Reasoner backed by a chat completions endpoint
pub struct OpenAiReasoner {
    client: Client,
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    preamble: Option<String>,
}

impl std::fmt::Debug for OpenAiReasoner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiReasoner")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl OpenAiReasoner {
    /// Create a reasoner from core settings
    ///
    /// Local OpenAI-compatible servers may run without a key; the hosted API
    /// may not.
    ///
    /// # Errors
    ///
    /// Returns `ConfigValidation` if the hosted API is selected without a key
    pub fn new(core: &CoreConfig) -> Result<Self> {
        if core.api_key.is_none() && core.base_url.contains("api.openai.com") {
            return Err(Error::ConfigValidation(
                "openai reasoner needs core.api_key or OPENAI_API_KEY".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(core.request_timeout)
            .build()
            .map_err(|e| Error::construction("openai", e))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", core.base_url.trim_end_matches('/')),
            api_key: core.api_key.clone(),
            model: core.model.clone(),
            temperature: core.temperature,
            max_tokens: core.max_tokens,
            preamble: core.system_prompt.clone(),
        })
    }

    fn messages(&self, input: &str, context: &ConversationContext) -> Vec<Message> {
        let mut messages = vec![Message::text(
            "system",
            system_prompt(self.preamble.as_deref(), &context.tools),
        )];

        for exchange in &context.history {
            messages.push(Message::text("user", exchange.user.clone()));
            messages.push(Message::text("assistant", exchange.assistant.clone()));
        }
        messages.push(Message::text("user", input.to_string()));

        for step in &context.steps {
            messages.push(Message {
                role: "assistant",
                content: None,
                tool_calls: step.calls.iter().map(WireToolCall::from_request).collect(),
                tool_call_id: None,
            });
            for result in &step.results {
                messages.push(Message {
                    role: "tool",
                    content: Some(
                        serde_json::to_string(result).unwrap_or_else(|_| result.message.clone()),
                    ),
                    tool_calls: Vec::new(),
                    tool_call_id: result.call_id.clone(),
                });
            }
        }
        messages
    }
}

#[async_trait]
impl Reasoner for OpenAiReasoner {
    fn name(&self) -> &str {
        "openai"
    }

    async fn decide(&self, input: &str, context: &ConversationContext) -> Result<Decision> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: self.messages(input, context),
            tools: &context.tools,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Reasoning(format!("chat completions request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Reasoning(format!(
                "chat completions error: {status} - {body}"
            )));
        }

        let result: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::Reasoning(format!("failed to parse chat completion: {e}")))?;

        let message = result
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| Error::Reasoning("chat completion had no choices".to_string()))?;

        Ok(decision_from(message))
    }
}

fn decision_from(message: ResponseMessage) -> Decision {
    if message.tool_calls.is_empty() {
        return Decision::FinalAnswer(message.content.unwrap_or_default());
    }

    let calls = message
        .tool_calls
        .into_iter()
        .map(|call| {
            // Bad JSON arguments become an empty map; the tool's schema rejects it
            let arguments = match serde_json::from_str::<Value>(&call.function.arguments) {
                Ok(Value::Object(map)) => map,
                _ => {
                    tracing::warn!(
                        tool = %call.function.name,
                        arguments = %call.function.arguments,
                        "unparseable tool arguments"
                    );
                    Map::new()
                }
            };
            ToolCallRequest::new(call.function.name, arguments).with_call_id(call.id)
        })
        .collect();
    Decision::ToolCalls(calls)
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [Value],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn no_tools(tools: &&[Value]) -> bool {
    tools.is_empty()
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl Message {
    const fn text(role: &'static str, content: String) -> Self {
        Self {
            role,
            content: Some(content),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    kind: String,
    function: WireFunction,
}

fn function_type() -> String {
    "function".to_string()
}

impl WireToolCall {
    fn from_request(request: &ToolCallRequest) -> Self {
        Self {
            id: request.call_id.clone().unwrap_or_default(),
            kind: function_type(),
            function: WireFunction {
                name: request.tool_name.clone(),
                arguments: json!(request.merged_parameters()).to_string(),
            },
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireFunction {
    name: String,
    /// JSON-encoded argument object
    arguments: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}
