//! Decoded script output

use serde_json::Value;
use std::fmt;

/// Result of one script invocation.
///
/// Helper scripts either print JSON or a line of plain text. Blank output
/// (and a literal JSON `null`) means the script had nothing to report.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum ScriptOutput {
    Json(Value),
    Text(String),
    #[default]
    Unavailable,
}

impl ScriptOutput {
    /// Decode raw stdout: JSON first, then trimmed text.
    pub fn decode(raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Null) => ScriptOutput::Unavailable,
            Ok(value) => ScriptOutput::Json(value),
            Err(_) => {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    ScriptOutput::Unavailable
                } else {
                    ScriptOutput::Text(trimmed.to_string())
                }
            }
        }
    }

    pub fn is_available(&self) -> bool {
        !matches!(self, ScriptOutput::Unavailable)
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ScriptOutput::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ScriptOutput::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Deserialize JSON output into a typed value.
    /// Text and unavailable output never parse.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        self.as_json()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Keep this output if it carries data, otherwise use `fallback`.
    pub fn or(self, fallback: ScriptOutput) -> ScriptOutput {
        if self.is_available() { self } else { fallback }
    }
}

impl fmt::Display for ScriptOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptOutput::Json(value) => write!(f, "{value}"),
            ScriptOutput::Text(text) => write!(f, "{text}"),
            ScriptOutput::Unavailable => write!(f, "-"),
        }
    }
}
