//! Typed parameter schemas for tool calls
//!
//! A [`ToolSchema`] describes what a tool accepts: an optional closed set of
//! actions, each with the commands it supports, plus typed scalar fields.
//! [`ToolSchema::validate`] turns an untyped JSON map into
//! [`ValidatedParams`] or the first validation failure. It performs no I/O.

use std::collections::{BTreeMap, HashMap};

use regex::Regex;
use serde_json::{Map, Value, json};

use crate::{Error, Result};

/// Field carrying the action name
pub const ACTION_FIELD: &str = "action";

/// Field carrying the command name
pub const COMMAND_FIELD: &str = "command";

/// Type and constraints of a scalar field
#[derive(Debug, Clone)]
pub enum FieldKind {
    /// Integer within `min..=max`
    Integer {
        min: i64,
        max: i64,
        default: Option<i64>,
    },
    Boolean {
        default: Option<bool>,
    },
    /// String with a character-length range and optional pattern
    Text {
        min_len: usize,
        max_len: usize,
        pattern: Option<Regex>,
    },
    /// One of a closed set of lowercase values
    Choice {
        values: Vec<String>,
        default: Option<String>,
    },
}

/// When a field must be present
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Optional,
    Always,
    /// Required only when the action is one of these
    ForActions(Vec<String>),
}

/// A typed scalar field
#[derive(Debug, Clone)]
pub struct FieldSpec {
    name: String,
    description: String,
    kind: FieldKind,
    requirement: Requirement,
    /// Actions this field applies to; `None` means all
    scope: Option<Vec<String>>,
}

impl FieldSpec {
    fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            kind,
            requirement: Requirement::Optional,
            scope: None,
        }
    }

    /// Integer field within `min..=max`
    #[must_use]
    pub fn integer(name: &str, min: i64, max: i64) -> Self {
        Self::new(
            name,
            FieldKind::Integer {
                min,
                max,
                default: None,
            },
        )
    }

    /// Boolean field
    #[must_use]
    pub fn boolean(name: &str) -> Self {
        Self::new(name, FieldKind::Boolean { default: None })
    }

    /// String field whose length in characters lies within `min_len..=max_len`
    #[must_use]
    pub fn text(name: &str, min_len: usize, max_len: usize) -> Self {
        Self::new(
            name,
            FieldKind::Text {
                min_len,
                max_len,
                pattern: None,
            },
        )
    }

    /// Closed set of values
    #[must_use]
    pub fn choice<S: AsRef<str>>(name: &str, values: &[S]) -> Self {
        Self::new(
            name,
            FieldKind::Choice {
                values: values.iter().map(|v| v.as_ref().to_lowercase()).collect(),
                default: None,
            },
        )
    }

    /// Human-readable description for the function definition
    #[must_use]
    pub fn describe(mut self, description: &str) -> Self {
        description.clone_into(&mut self.description);
        self
    }

    /// Regex the whole value must match (text fields only)
    #[must_use]
    pub fn pattern(mut self, regex: Regex) -> Self {
        if let FieldKind::Text { pattern, .. } = &mut self.kind {
            *pattern = Some(regex);
        }
        self
    }

    /// Default integer value
    #[must_use]
    pub fn default_integer(mut self, value: i64) -> Self {
        if let FieldKind::Integer { default, .. } = &mut self.kind {
            *default = Some(value);
        }
        self
    }

    /// Default boolean value
    #[must_use]
    pub fn default_bool(mut self, value: bool) -> Self {
        if let FieldKind::Boolean { default } = &mut self.kind {
            *default = Some(value);
        }
        self
    }

    /// Default choice value
    #[must_use]
    pub fn default_choice(mut self, value: &str) -> Self {
        if let FieldKind::Choice { default, .. } = &mut self.kind {
            *default = Some(value.to_lowercase());
        }
        self
    }

    /// Mark as always required
    #[must_use]
    pub fn required(mut self) -> Self {
        self.requirement = Requirement::Always;
        self
    }

    /// Mark as required for the given actions
    #[must_use]
    pub fn required_for(mut self, actions: &[&str]) -> Self {
        self.requirement = Requirement::ForActions(to_strings(actions));
        self
    }

    /// Restrict the field to the given actions; it is ignored for others
    #[must_use]
    pub fn only_for(mut self, actions: &[&str]) -> Self {
        self.scope = Some(to_strings(actions));
        self
    }

    /// Field name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn applies_to(&self, action: Option<&str>) -> bool {
        match (&self.scope, action) {
            (None, _) => true,
            (Some(scope), Some(action)) => scope.iter().any(|a| a == action),
            (Some(_), None) => false,
        }
    }

    fn is_required(&self, action: Option<&str>) -> bool {
        match &self.requirement {
            Requirement::Optional => false,
            Requirement::Always => true,
            Requirement::ForActions(actions) => {
                action.is_some_and(|action| actions.iter().any(|a| a == action))
            }
        }
    }

    fn default_value(&self) -> Option<ParamValue> {
        match &self.kind {
            FieldKind::Integer { default, .. } => default.map(ParamValue::Integer),
            FieldKind::Boolean { default } => default.map(ParamValue::Boolean),
            FieldKind::Choice { default, .. } => default.clone().map(ParamValue::Text),
            FieldKind::Text { .. } => None,
        }
    }

    fn coerce(&self, value: &Value) -> Result<ParamValue> {
        let field = self.name.as_str();
        match &self.kind {
            FieldKind::Integer { min, max, .. } => {
                let number = match value {
                    Value::Number(n) => n.as_i64(),
                    Value::String(s) => s.trim().parse::<i64>().ok(),
                    _ => None,
                }
                .ok_or_else(|| Error::validation(field, "expected an integer"))?;

                if number < *min || number > *max {
                    return Err(Error::validation(
                        field,
                        format!("must be between {min} and {max}, got {number}"),
                    ));
                }
                Ok(ParamValue::Integer(number))
            }
            FieldKind::Boolean { .. } => match value {
                Value::Bool(b) => Ok(ParamValue::Boolean(*b)),
                Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(ParamValue::Boolean(true)),
                Value::String(s) if s.eq_ignore_ascii_case("false") => {
                    Ok(ParamValue::Boolean(false))
                }
                _ => Err(Error::validation(field, "expected a boolean")),
            },
            FieldKind::Text {
                min_len,
                max_len,
                pattern,
            } => {
                let text = value
                    .as_str()
                    .ok_or_else(|| Error::validation(field, "expected a string"))?
                    .trim();
                let len = text.chars().count();
                if len < *min_len || len > *max_len {
                    return Err(Error::validation(
                        field,
                        format!("length must be between {min_len} and {max_len}, got {len}"),
                    ));
                }
                if let Some(pattern) = pattern
                    && !pattern.is_match(text)
                {
                    return Err(Error::validation(field, "contains invalid characters"));
                }
                Ok(ParamValue::Text(text.to_string()))
            }
            FieldKind::Choice { values, .. } => {
                let text = value
                    .as_str()
                    .ok_or_else(|| Error::validation(field, "expected a string"))?
                    .trim()
                    .to_lowercase();
                if values.contains(&text) {
                    Ok(ParamValue::Text(text))
                } else {
                    Err(Error::validation(
                        field,
                        format!("must be one of: {}", values.join(", ")),
                    ))
                }
            }
        }
    }

    fn json_schema(&self) -> Value {
        let mut schema = match &self.kind {
            FieldKind::Integer { min, max, default } => {
                let mut s = json!({ "type": "integer", "minimum": min, "maximum": max });
                if let Some(d) = default {
                    s["default"] = json!(d);
                }
                s
            }
            FieldKind::Boolean { default } => {
                let mut s = json!({ "type": "boolean" });
                if let Some(d) = default {
                    s["default"] = json!(d);
                }
                s
            }
            FieldKind::Text {
                min_len,
                max_len,
                pattern,
            } => {
                let mut s = json!({ "type": "string", "minLength": min_len, "maxLength": max_len });
                if let Some(p) = pattern {
                    s["pattern"] = json!(p.as_str());
                }
                s
            }
            FieldKind::Choice { values, default } => {
                let mut s = json!({ "type": "string", "enum": values });
                if let Some(d) = default {
                    s["default"] = json!(d);
                }
                s
            }
        };

        let mut description = self.description.clone();
        if let Some(scope) = &self.scope {
            if !description.is_empty() {
                description.push(' ');
            }
            description.push_str(&format!("(only for action: {})", scope.join(", ")));
        }
        if !description.is_empty() {
            schema["description"] = json!(description);
        }
        schema
    }
}

/// A validated scalar value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Integer(i64),
    Boolean(bool),
    Text(String),
}

/// Parameters that passed schema validation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatedParams {
    action: Option<String>,
    command: Option<String>,
    values: BTreeMap<String, ParamValue>,
}

impl ValidatedParams {
    /// Normalized action, if the schema has an action table
    #[must_use]
    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    /// Normalized command with aliases resolved
    #[must_use]
    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    /// Integer field value
    #[must_use]
    pub fn integer(&self, name: &str) -> Option<i64> {
        match self.values.get(name) {
            Some(ParamValue::Integer(n)) => Some(*n),
            _ => None,
        }
    }

    /// Boolean field value
    #[must_use]
    pub fn boolean(&self, name: &str) -> Option<bool> {
        match self.values.get(name) {
            Some(ParamValue::Boolean(b)) => Some(*b),
            _ => None,
        }
    }

    /// Text or choice field value
    #[must_use]
    pub fn text(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(ParamValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    /// Whether a field is present after defaults were applied
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }
}

/// Schema describing the parameters a tool accepts
#[derive(Debug, Clone, Default)]
pub struct ToolSchema {
    /// Action → compatible commands, in declaration order
    actions: Vec<(String, Vec<String>)>,
    /// Command alias → canonical command
    aliases: HashMap<String, String>,
    fields: Vec<FieldSpec>,
    /// Per action, at least one of these fields must be present
    any_of: Vec<(String, Vec<String>)>,
}

impl ToolSchema {
    /// Empty schema accepting no fields
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an action and the commands compatible with it
    #[must_use]
    pub fn action(mut self, action: &str, commands: &[&str]) -> Self {
        self.actions
            .push((action.to_lowercase(), to_strings(commands)));
        self
    }

    /// Map an alternative spelling onto a canonical command
    #[must_use]
    pub fn alias(mut self, alias: &str, command: &str) -> Self {
        self.aliases
            .insert(alias.to_lowercase(), command.to_lowercase());
        self
    }

    /// Add a scalar field
    #[must_use]
    pub fn field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    /// Require at least one of `fields` when `action` is selected
    #[must_use]
    pub fn require_any(mut self, action: &str, fields: &[&str]) -> Self {
        self.any_of.push((action.to_lowercase(), to_strings(fields)));
        self
    }

    /// Whether the schema has an action table
    #[must_use]
    pub fn has_actions(&self) -> bool {
        !self.actions.is_empty()
    }

    /// Declared actions
    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.actions.iter().map(|(a, _)| a.as_str())
    }

    /// Commands compatible with `action`
    #[must_use]
    pub fn commands_for(&self, action: &str) -> Option<&[String]> {
        self.actions
            .iter()
            .find(|(a, _)| a == action)
            .map(|(_, commands)| commands.as_slice())
    }

    /// Every known command, deduplicated, in declaration order
    #[must_use]
    pub fn all_commands(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for (_, commands) in &self.actions {
            for command in commands {
                if !seen.contains(&command.as_str()) {
                    seen.push(command.as_str());
                }
            }
        }
        seen
    }

    /// Resolve a command alias
    #[must_use]
    pub fn resolve_alias<'a>(&'a self, command: &'a str) -> &'a str {
        self.aliases.get(command).map_or(command, String::as_str)
    }

    /// Validate raw parameters
    ///
    /// # Errors
    ///
    /// Returns `Validation` for the first failing field, or
    /// `IncompatibleActionCommand` when action and command are individually
    /// valid but not compatible
    pub fn validate(&self, raw: &Map<String, Value>) -> Result<ValidatedParams> {
        let mut params = ValidatedParams::default();

        if self.has_actions() {
            let (action, command) = self.validate_action_command(raw)?;
            params.action = Some(action);
            params.command = Some(command);
        }

        let action = params.action.clone();
        for field in &self.fields {
            if !field.applies_to(action.as_deref()) {
                if raw.contains_key(&field.name) {
                    tracing::debug!(
                        field = %field.name,
                        action = ?action,
                        "ignoring field not applicable to action"
                    );
                }
                continue;
            }

            match raw.get(&field.name).filter(|v| !v.is_null()) {
                Some(value) => {
                    let value = field.coerce(value)?;
                    params.values.insert(field.name.clone(), value);
                }
                None => {
                    if let Some(default) = field.default_value() {
                        params.values.insert(field.name.clone(), default);
                    } else if field.is_required(action.as_deref()) {
                        return Err(Error::validation(&field.name, "required"));
                    }
                }
            }
        }

        for (rule_action, fields) in &self.any_of {
            if action.as_deref() == Some(rule_action.as_str())
                && !fields.iter().any(|f| params.contains(f))
            {
                return Err(Error::validation(
                    fields.join("|"),
                    format!("one of {} is required", fields.join(", ")),
                ));
            }
        }

        for key in raw.keys() {
            if key != ACTION_FIELD
                && key != COMMAND_FIELD
                && !self.fields.iter().any(|f| &f.name == key)
            {
                tracing::debug!(field = %key, "ignoring unknown parameter");
            }
        }

        Ok(params)
    }

    fn validate_action_command(&self, raw: &Map<String, Value>) -> Result<(String, String)> {
        let action = match raw.get(ACTION_FIELD) {
            None | Some(Value::Null) => return Err(Error::validation(ACTION_FIELD, "required")),
            Some(Value::String(s)) => s.trim().to_lowercase(),
            Some(_) => return Err(Error::validation(ACTION_FIELD, "expected a string")),
        };

        let Some(compatible) = self.commands_for(&action) else {
            let known: Vec<&str> = self.actions().collect();
            return Err(Error::validation(
                ACTION_FIELD,
                format!("unknown action '{action}', expected one of: {}", known.join(", ")),
            ));
        };

        let command = match raw.get(COMMAND_FIELD) {
            None | Some(Value::Null) => match compatible {
                [only] => only.clone(),
                _ => return Err(Error::validation(COMMAND_FIELD, "required")),
            },
            Some(Value::String(s)) => {
                let lower = s.trim().to_lowercase();
                self.resolve_alias(&lower).to_string()
            }
            // Digit commands often arrive as bare numbers
            Some(Value::Number(n)) => {
                let lower = n.to_string();
                self.resolve_alias(&lower).to_string()
            }
            Some(_) => return Err(Error::validation(COMMAND_FIELD, "expected a string")),
        };

        if !self.all_commands().contains(&command.as_str()) {
            return Err(Error::validation(
                COMMAND_FIELD,
                format!("unknown command '{command}'"),
            ));
        }

        if !compatible.contains(&command) {
            return Err(Error::IncompatibleActionCommand { action, command });
        }

        Ok((action, command))
    }

    /// JSON schema of the parameters object
    #[must_use]
    pub fn parameters_json(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();

        if self.has_actions() {
            let table: Vec<String> = self
                .actions
                .iter()
                .map(|(a, c)| format!("{a}: {}", c.join(", ")))
                .collect();
            properties.insert(
                ACTION_FIELD.to_string(),
                json!({
                    "type": "string",
                    "enum": self.actions().collect::<Vec<_>>(),
                    "description": "Action category",
                }),
            );
            properties.insert(
                COMMAND_FIELD.to_string(),
                json!({
                    "type": "string",
                    "enum": self.all_commands(),
                    "description": format!("Command for the action. Valid pairs: {}", table.join("; ")),
                }),
            );
            required.push(ACTION_FIELD.to_string());
            required.push(COMMAND_FIELD.to_string());
        }

        for field in &self.fields {
            properties.insert(field.name.clone(), field.json_schema());
            if field.requirement == Requirement::Always {
                required.push(field.name.clone());
            }
        }

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// OpenAI-style function definition for a tool using this schema
    #[must_use]
    pub fn to_function_definition(&self, name: &str, description: &str) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": name,
                "description": description,
                "parameters": self.parameters_json(),
            }
        })
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_lowercase()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amp_schema() -> ToolSchema {
        ToolSchema::new()
            .action("power", &["power"])
            .action("volume", &["vol_up", "vol_down"])
            .action("playback", &["play", "pause", "stop"])
            .alias("vol+", "vol_up")
            .field(FieldSpec::integer("repeat_count", 1, 10).default_integer(1).only_for(&["volume"]))
            .field(FieldSpec::boolean("double_send").default_bool(false).only_for(&["power"]))
    }

    fn raw(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    // -- action / command ---------------------------------------------------

    #[test]
    fn test_valid_pair_with_defaults() {
        let params = amp_schema()
            .validate(&raw(json!({"action": "volume", "command": "vol_up"})))
            .unwrap();
        assert_eq!(params.action(), Some("volume"));
        assert_eq!(params.command(), Some("vol_up"));
        assert_eq!(params.integer("repeat_count"), Some(1));
        assert!(!params.contains("double_send"));
    }

    #[test]
    fn test_incompatible_pair() {
        let err = amp_schema()
            .validate(&raw(json!({"action": "volume", "command": "play"})))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::IncompatibleActionCommand { ref action, ref command }
                if action == "volume" && command == "play"
        ));
    }

    #[test]
    fn test_unknown_action() {
        let err = amp_schema()
            .validate(&raw(json!({"action": "explode", "command": "play"})))
            .unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "action"));
    }

    #[test]
    fn test_unknown_command() {
        let err = amp_schema()
            .validate(&raw(json!({"action": "volume", "command": "louder"})))
            .unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "command"));
    }

    #[test]
    fn test_alias_resolved() {
        let params = amp_schema()
            .validate(&raw(json!({"action": "VOLUME", "command": "Vol+"})))
            .unwrap();
        assert_eq!(params.command(), Some("vol_up"));
    }

    #[test]
    fn test_single_command_defaults() {
        let params = amp_schema()
            .validate(&raw(json!({"action": "power"})))
            .unwrap();
        assert_eq!(params.command(), Some("power"));
    }

    #[test]
    fn test_missing_command_for_multi_command_action() {
        let err = amp_schema()
            .validate(&raw(json!({"action": "volume"})))
            .unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "command"));
    }

    // -- fields -------------------------------------------------------------

    #[test]
    fn test_integer_range() {
        let err = amp_schema()
            .validate(&raw(json!({"action": "volume", "command": "vol_up", "repeat_count": 11})))
            .unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "repeat_count"));

        let params = amp_schema()
            .validate(&raw(json!({"action": "volume", "command": "vol_up", "repeat_count": "3"})))
            .unwrap();
        assert_eq!(params.integer("repeat_count"), Some(3));
    }

    #[test]
    fn test_field_out_of_scope_ignored() {
        let params = amp_schema()
            .validate(&raw(json!({"action": "playback", "command": "play", "repeat_count": 99})))
            .unwrap();
        assert!(!params.contains("repeat_count"));
    }

    #[test]
    fn test_text_pattern_and_length() {
        let schema = ToolSchema::new().field(
            FieldSpec::text("city", 2, 10)
                .pattern(Regex::new(r"^[a-zA-Z\s]+$").unwrap())
                .required(),
        );

        assert!(schema.validate(&raw(json!({"city": "Paris"}))).is_ok());
        assert!(matches!(
            schema.validate(&raw(json!({"city": "P"}))),
            Err(Error::Validation { .. })
        ));
        assert!(matches!(
            schema.validate(&raw(json!({"city": "P4ris"}))),
            Err(Error::Validation { .. })
        ));
        assert!(matches!(
            schema.validate(&raw(json!({}))),
            Err(Error::Validation { ref reason, .. }) if reason == "required"
        ));
    }

    #[test]
    fn test_require_any() {
        let schema = ToolSchema::new()
            .action("color", &["set"])
            .field(FieldSpec::text("color", 1, 20))
            .field(FieldSpec::integer("hue", 0, 360))
            .require_any("color", &["color", "hue"]);

        assert!(schema.validate(&raw(json!({"action": "color", "hue": 120}))).is_ok());
        assert!(matches!(
            schema.validate(&raw(json!({"action": "color"}))),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let params = amp_schema()
            .validate(&raw(json!({"action": "power", "command": "power", "colour": "red"})))
            .unwrap();
        assert_eq!(params.action(), Some("power"));
    }

    #[test]
    fn test_function_definition_shape() {
        let def = amp_schema().to_function_definition("amp", "Control the amplifier");
        assert_eq!(def["function"]["name"], "amp");
        let params = &def["function"]["parameters"];
        assert_eq!(params["properties"]["action"]["enum"][1], "volume");
        assert_eq!(params["required"][0], "action");
        assert_eq!(params["properties"]["repeat_count"]["maximum"], 10);
    }
}
