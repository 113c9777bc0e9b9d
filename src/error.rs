//! Error types for Switchboard

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for Switchboard operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Switchboard
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration is malformed or fails a factory's declared check
    #[error("configuration error: {0}")]
    ConfigValidation(String),

    /// No factory registered under the requested type name
    #[error("unknown module type: {0}")]
    UnknownModule(String),

    /// A name is already registered or subscribed
    #[error("duplicate name: {0}")]
    DuplicateName(String),

    /// A hardware resource is already claimed by another live tool
    #[error("resource {resource} already claimed by {holder}")]
    ResourceConflict {
        /// Resource identifier, e.g. `gpio:18`
        resource: String,
        /// Tool instance holding the claim
        holder: String,
    },

    /// A module or tool failed to construct
    #[error("construction of {name} failed: {reason}")]
    Construction {
        /// Instance name
        name: String,
        /// Lower-level cause
        reason: String,
    },

    /// A parameter failed schema validation
    #[error("invalid parameter {field}: {reason}")]
    Validation {
        /// Offending field
        field: String,
        /// What was wrong with it
        reason: String,
    },

    /// Action and command are individually valid but not together
    #[error("command {command} is not valid for action {action}")]
    IncompatibleActionCommand {
        /// Requested action
        action: String,
        /// Requested command
        command: String,
    },

    /// A tool exceeded its time budget
    #[error("tool {tool} timed out after {timeout:?}")]
    ToolTimeout {
        /// Tool instance name
        tool: String,
        /// Configured budget
        timeout: Duration,
    },

    /// A tool ran and failed
    #[error("tool execution failed: {0}")]
    ToolExecution(String),

    /// A network failure worth retrying
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// The reasoning collaborator did not answer in time
    #[error("reasoning timed out after {0:?}")]
    ReasoningTimeout(Duration),

    /// The reasoning collaborator returned an error
    #[error("reasoning error: {0}")]
    Reasoning(String),

    /// Message bus error
    #[error("bus error: {0}")]
    Bus(String),

    /// Chat service error
    #[error("channel error: {0}")]
    Channel(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Shorthand for a validation failure
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a construction failure
    pub fn construction(name: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Construction {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Wrap a build failure of `name` as `Construction`
    ///
    /// Configuration and construction errors pass through unchanged.
    #[must_use]
    pub fn into_construction(self, name: &str) -> Self {
        match self {
            Self::ConfigValidation(_) | Self::Construction { .. } => self,
            other => Self::construction(name, other),
        }
    }

    /// Classify this error for a [`crate::tools::ToolCallResult`]
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigValidation(_) | Self::Yaml(_) | Self::Toml(_) => ErrorKind::ConfigValidation,
            Self::UnknownModule(_) => ErrorKind::UnknownModule,
            Self::DuplicateName(_) => ErrorKind::DuplicateName,
            Self::ResourceConflict { .. } => ErrorKind::ResourceConflict,
            Self::Construction { .. } => ErrorKind::Construction,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::IncompatibleActionCommand { .. } => ErrorKind::IncompatibleActionCommand,
            Self::ToolTimeout { .. } => ErrorKind::ToolTimeout,
            Self::TransientNetwork(_) => ErrorKind::TransientNetwork,
            Self::ReasoningTimeout(_) => ErrorKind::ReasoningTimeout,
            Self::ToolExecution(_)
            | Self::Reasoning(_)
            | Self::Bus(_)
            | Self::Channel(_)
            | Self::Io(_)
            | Self::Http(_)
            | Self::Serialization(_) => ErrorKind::ToolExecution,
        }
    }
}

/// Serializable error taxonomy carried in tool results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigValidation,
    UnknownModule,
    DuplicateName,
    ResourceConflict,
    Construction,
    Validation,
    IncompatibleActionCommand,
    ToolTimeout,
    ToolExecution,
    TransientNetwork,
    ReasoningTimeout,
}

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
