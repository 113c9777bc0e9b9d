//! Tool adapters and dispatch
//!
//! A tool adapter wraps one side-effecting capability (a smart plug, an
//! infrared remote, a weather lookup) behind a typed parameter schema. The
//! [`ToolRegistry`] owns live adapters, validates every call against the
//! adapter's schema, and enforces the adapter's timeout.

pub mod infrared;
pub mod registry;
pub mod retry;
pub mod smart_plug;
pub mod weather;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use registry::ToolRegistry;

use crate::config::ModuleConfig;
use crate::error::ErrorKind;
use crate::schema::{ToolSchema, ValidatedParams};
use crate::{Error, Result};

/// Time budget applied when a tool does not declare its own
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Scheduling class of a tool call within one decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPriority {
    /// Dispatched first, one at a time, ahead of normal calls
    TimeCritical,
    Normal,
}

/// A request to invoke a tool, produced from a reasoning decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Identifier echoed back to the reasoning collaborator
    #[serde(default)]
    pub call_id: Option<String>,
    pub tool_name: String,
    /// Action, when given separately from the parameters
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub raw_parameters: Map<String, Value>,
}

impl ToolCallRequest {
    /// Create a request with raw parameters
    pub fn new(tool_name: impl Into<String>, raw_parameters: Map<String, Value>) -> Self {
        Self {
            call_id: None,
            tool_name: tool_name.into(),
            action: None,
            raw_parameters,
        }
    }

    /// Attach a call id
    #[must_use]
    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    /// Parameters with a separately supplied action merged in
    #[must_use]
    pub fn merged_parameters(&self) -> Map<String, Value> {
        let mut params = self.raw_parameters.clone();
        if let Some(action) = &self.action {
            params
                .entry(crate::schema::ACTION_FIELD)
                .or_insert_with(|| Value::String(action.clone()));
        }
        params
    }
}

/// Outcome of one tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ToolCallResult {
    /// Successful result
    #[must_use]
    pub fn success(request: &ToolCallRequest, output: ToolOutput) -> Self {
        Self {
            tool_name: request.tool_name.clone(),
            call_id: request.call_id.clone(),
            success: true,
            message: output.message,
            structured_data: output.data,
            error_kind: None,
        }
    }

    /// Failed result carrying the error taxonomy
    #[must_use]
    pub fn failure(request: &ToolCallRequest, error: &Error) -> Self {
        Self {
            tool_name: request.tool_name.clone(),
            call_id: request.call_id.clone(),
            success: false,
            message: error.to_string(),
            structured_data: None,
            error_kind: Some(error.kind()),
        }
    }
}

/// What a tool returns on success
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub message: String,
    pub data: Option<Value>,
}

impl ToolOutput {
    /// Plain message
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// A side-effecting capability exposed to the reasoning collaborator
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Instance name the reasoning collaborator calls the tool by
    fn name(&self) -> &str;

    /// One-line description for the function definition
    fn description(&self) -> &str;

    /// Parameter schema checked before every `execute`
    fn schema(&self) -> &ToolSchema;

    /// Time budget for one `execute`
    fn timeout(&self) -> Duration {
        DEFAULT_TOOL_TIMEOUT
    }

    fn priority(&self) -> DispatchPriority {
        DispatchPriority::Normal
    }

    /// Perform the action
    ///
    /// Only called with parameters that passed [`ToolAdapter::schema`].
    async fn execute(&self, params: &ValidatedParams) -> Result<ToolOutput>;

    /// Release hardware or connections
    async fn shutdown(&self) {}

    /// Function definition for the reasoning collaborator
    fn definition(&self) -> Value {
        self.schema()
            .to_function_definition(self.name(), self.description())
    }
}

/// Builds tool adapters of one type from configuration
pub trait ToolFactory: Send + Sync {
    /// Check configuration without constructing anything
    ///
    /// # Errors
    ///
    /// Returns `ConfigValidation` when the configuration is unusable
    fn validate_config(&self, config: &ModuleConfig) -> Result<()> {
        let _ = config;
        Ok(())
    }

    /// Exclusive hardware resources the tool would claim, e.g. `gpio:18`
    ///
    /// # Errors
    ///
    /// Returns `ConfigValidation` when the configuration is unusable
    fn resources(&self, config: &ModuleConfig) -> Result<Vec<String>> {
        let _ = config;
        Ok(Vec::new())
    }

    /// Construct the adapter
    ///
    /// # Errors
    ///
    /// Returns `Construction` or `ConfigValidation` on failure
    fn build(&self, name: &str, config: &ModuleConfig) -> Result<Arc<dyn ToolAdapter>>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(DispatchPriority::TimeCritical < DispatchPriority::Normal);
    }

    #[test]
    fn test_separate_action_merged() {
        let mut request = ToolCallRequest::new(
            "amp",
            json!({"command": "vol_up"}).as_object().cloned().unwrap(),
        );
        request.action = Some("volume".to_string());

        let merged = request.merged_parameters();
        assert_eq!(merged["action"], "volume");
        assert_eq!(merged["command"], "vol_up");
    }

    #[test]
    fn test_failure_result_carries_kind() {
        let request = ToolCallRequest::new("amp", Map::new()).with_call_id("call_1");
        let result = ToolCallResult::failure(&request, &Error::validation("action", "required"));

        assert!(!result.success);
        assert_eq!(result.call_id.as_deref(), Some("call_1"));
        assert_eq!(result.error_kind, Some(ErrorKind::Validation));
    }
}
