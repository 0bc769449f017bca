//! Catalog of remote browser tools.
//!
//! Known tools are a closed set with JSON-schema-checked arguments. Anything
//! else passes through to the server unchanged as [`ToolCall::Passthrough`].

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{ClientError, Result};

/// Prefix the server uses for its tool names (`navigate` is `browser_navigate`).
pub const REMOTE_PREFIX: &str = "browser_";

/// How a tool relates to page state. Drives snapshot decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// Acts on the current page without replacing it (click, fill, hover).
    Interaction,
    /// Moves the page to a new state the caller must observe (navigation, waits).
    StateChange,
    /// Exists to report page state (snapshot, screenshot, console).
    Diagnostic,
    /// Manages the browser itself (close, resize).
    Administrative,
}

impl ToolKind {
    /// Classify a remote tool name, with or without the `browser_` prefix.
    pub fn of(name: &str) -> Self {
        let short = name.strip_prefix(REMOTE_PREFIX).unwrap_or(name);
        match short {
            "navigate" | "navigate_back" | "navigate_forward" | "wait" | "wait_for"
            | "tab_new" | "tab_select" => Self::StateChange,
            "snapshot" | "screenshot" | "take_screenshot" | "console_messages"
            | "network_requests" => Self::Diagnostic,
            "close" | "resize" | "install" => Self::Administrative,
            _ => Self::Interaction,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

/// One invocation of a remote tool.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "tool", content = "arguments", rename_all = "snake_case")]
pub enum ToolCall {
    Navigate {
        url: String,
    },
    Click {
        selector: String,
    },
    Fill {
        selector: String,
        value: String,
    },
    Select {
        selector: String,
        value: String,
    },
    Snapshot {},
    Scroll {
        direction: ScrollDirection,
        #[serde(default)]
        amount: Option<u32>,
    },
    Hover {
        selector: String,
    },
    Screenshot {
        #[serde(default)]
        path: Option<String>,
    },
    Wait {
        seconds: f64,
    },
    Close {},
    /// Unrecognized tool, forwarded verbatim.
    #[serde(skip)]
    Passthrough { name: String, arguments: Value },
}

struct CatalogEntry {
    name: &'static str,
    schema: fn() -> Value,
}

fn selector_schema() -> Value {
    json!({
        "type": "object",
        "properties": {"selector": {"type": "string", "minLength": 1}},
        "required": ["selector"],
        "additionalProperties": false
    })
}

fn selector_value_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "selector": {"type": "string", "minLength": 1},
            "value": {"type": "string"}
        },
        "required": ["selector", "value"],
        "additionalProperties": false
    })
}

fn empty_schema() -> Value {
    json!({"type": "object", "additionalProperties": false})
}

fn navigate_schema() -> Value {
    json!({
        "type": "object",
        "properties": {"url": {"type": "string", "minLength": 1}},
        "required": ["url"],
        "additionalProperties": false
    })
}

fn scroll_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "direction": {"enum": ["up", "down", "left", "right"]},
            "amount": {"type": "integer", "minimum": 0}
        },
        "required": ["direction"],
        "additionalProperties": false
    })
}

fn screenshot_schema() -> Value {
    json!({
        "type": "object",
        "properties": {"path": {"type": "string", "minLength": 1}},
        "additionalProperties": false
    })
}

fn wait_schema() -> Value {
    json!({
        "type": "object",
        "properties": {"seconds": {"type": "number", "minimum": 0}},
        "required": ["seconds"],
        "additionalProperties": false
    })
}

const CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        name: "navigate",
        schema: navigate_schema,
    },
    CatalogEntry {
        name: "click",
        schema: selector_schema,
    },
    CatalogEntry {
        name: "fill",
        schema: selector_value_schema,
    },
    CatalogEntry {
        name: "select",
        schema: selector_value_schema,
    },
    CatalogEntry {
        name: "snapshot",
        schema: empty_schema,
    },
    CatalogEntry {
        name: "scroll",
        schema: scroll_schema,
    },
    CatalogEntry {
        name: "hover",
        schema: selector_schema,
    },
    CatalogEntry {
        name: "screenshot",
        schema: screenshot_schema,
    },
    CatalogEntry {
        name: "wait",
        schema: wait_schema,
    },
    CatalogEntry {
        name: "close",
        schema: empty_schema,
    },
];

fn validators() -> &'static HashMap<&'static str, jsonschema::Validator> {
    static VALIDATORS: OnceLock<HashMap<&'static str, jsonschema::Validator>> = OnceLock::new();
    VALIDATORS.get_or_init(|| {
        CATALOG
            .iter()
            .filter_map(|entry| {
                jsonschema::validator_for(&(entry.schema)())
                    .inspect_err(|e| {
                        tracing::error!(tool = entry.name, error = %e, "Failed to compile tool schema");
                    })
                    .ok()
                    .map(|v| (entry.name, v))
            })
            .collect()
    })
}

impl ToolCall {
    /// Build a call from a tool name and raw arguments.
    ///
    /// Accepts either the short name (`navigate`) or the remote name
    /// (`browser_navigate`). Known tools are schema-checked; unknown names
    /// become [`ToolCall::Passthrough`] with the name left untouched.
    pub fn parse(name: &str, arguments: Value) -> Result<Self> {
        let short = name.strip_prefix(REMOTE_PREFIX).unwrap_or(name);
        let Some(entry) = CATALOG.iter().find(|e| e.name == short) else {
            return Ok(Self::Passthrough {
                name: name.to_string(),
                arguments,
            });
        };

        let arguments = match arguments {
            Value::Null => json!({}),
            other => other,
        };

        if let Some(validator) = validators().get(entry.name) {
            let problems: Vec<String> = validator
                .iter_errors(&arguments)
                .map(|e| e.to_string())
                .collect();
            if !problems.is_empty() {
                return Err(ClientError::InvalidArguments {
                    tool: entry.name.to_string(),
                    reason: problems.join("; "),
                });
            }
        }

        serde_json::from_value(json!({"tool": entry.name, "arguments": arguments})).map_err(|e| {
            ClientError::InvalidArguments {
                tool: entry.name.to_string(),
                reason: e.to_string(),
            }
        })
    }

    pub fn navigate(url: impl Into<String>) -> Self {
        Self::Navigate { url: url.into() }
    }

    pub fn click(selector: impl Into<String>) -> Self {
        Self::Click {
            selector: selector.into(),
        }
    }

    pub fn fill(selector: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Fill {
            selector: selector.into(),
            value: value.into(),
        }
    }

    pub fn select(selector: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Select {
            selector: selector.into(),
            value: value.into(),
        }
    }

    pub fn screenshot(path: Option<String>) -> Self {
        Self::Screenshot { path }
    }

    /// Short catalog name, or the verbatim name for pass-through calls.
    pub fn name(&self) -> &str {
        match self {
            Self::Navigate { .. } => "navigate",
            Self::Click { .. } => "click",
            Self::Fill { .. } => "fill",
            Self::Select { .. } => "select",
            Self::Snapshot {} => "snapshot",
            Self::Scroll { .. } => "scroll",
            Self::Hover { .. } => "hover",
            Self::Screenshot { .. } => "screenshot",
            Self::Wait { .. } => "wait",
            Self::Close {} => "close",
            Self::Passthrough { name, .. } => name,
        }
    }

    /// Name sent in `tools/call`.
    pub fn remote_name(&self) -> String {
        match self {
            Self::Passthrough { name, .. } => name.clone(),
            known => format!("{REMOTE_PREFIX}{}", known.name()),
        }
    }

    pub fn kind(&self) -> ToolKind {
        ToolKind::of(self.name())
    }

    /// Arguments document sent in `tools/call`.
    pub fn arguments(&self) -> Value {
        match self {
            Self::Navigate { url } => json!({"url": url}),
            Self::Click { selector } | Self::Hover { selector } => json!({"selector": selector}),
            Self::Fill { selector, value } | Self::Select { selector, value } => {
                json!({"selector": selector, "value": value})
            }
            Self::Snapshot {} | Self::Close {} => json!({}),
            Self::Scroll { direction, amount } => {
                let mut args = json!({"direction": direction});
                if let Some(amount) = amount {
                    args["amount"] = json!(amount);
                }
                args
            }
            Self::Screenshot { path } => match path {
                Some(path) => json!({"path": path}),
                None => json!({}),
            },
            Self::Wait { seconds } => json!({"seconds": seconds}),
            Self::Passthrough { arguments, .. } => arguments.clone(),
        }
    }
}

/// Tool advertised by the server in `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}
