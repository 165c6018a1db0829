//! Message types for agent response fragments
//!
//! The upstream agent emits events shaped like
//! `{"content":{"parts":[{"text":"...","thought":true}]},"author":"..."}`.
//! A single part becomes a [`ContentUnit`]; every other field of the event
//! belongs to its [`Envelope`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Envelope keys that are worth forwarding on their own.
///
/// Both snake_case and camelCase spellings are observed upstream.
pub const SUPPLEMENTARY_KEYS: &[&str] = &[
    "usage_metadata",
    "usageMetadata",
    "invocation_id",
    "invocationId",
    "actions",
    "isFinal",
    "is_final",
    "turn_complete",
    "turnComplete",
    "error_code",
    "errorCode",
    "error_message",
    "errorMessage",
    "grounding_metadata",
    "groundingMetadata",
];

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub args: Value,
}

/// The result of a tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub response: Value,
}

/// One discrete piece of generated text, ready for incremental display
#[derive(Debug, Clone, PartialEq)]
pub struct ContentUnit {
    /// Generated text; empty only for forwarded tool activity
    pub text: String,

    /// Internal reasoning rather than user-facing answer text
    pub thought: bool,

    pub function_call: Option<FunctionCall>,

    pub function_response: Option<FunctionResponse>,

    /// Attribution; filled in by the session before emission
    pub author: String,
}

impl ContentUnit {
    /// Create a plain text unit
    #[must_use]
    pub fn text(text: impl Into<String>, thought: bool) -> Self {
        Self {
            text: text.into(),
            thought,
            function_call: None,
            function_response: None,
            author: String::new(),
        }
    }

    /// Whether a function call or response rides along with this unit
    #[must_use]
    pub fn has_tool_activity(&self) -> bool {
        self.function_call.is_some() || self.function_response.is_some()
    }

    /// Downstream JSON payload for this unit
    #[must_use]
    pub fn to_payload(&self) -> Value {
        let mut part = Map::new();
        part.insert("text".to_string(), Value::String(self.text.clone()));
        part.insert("thought".to_string(), Value::Bool(self.thought));
        if let Some(call) = &self.function_call {
            part.insert("functionCall".to_string(), json!(call));
        }
        if let Some(response) = &self.function_response {
            part.insert("functionResponse".to_string(), json!(response));
        }

        json!({
            "content": { "parts": [Value::Object(part)] },
            "author": self.author,
        })
    }
}

/// Non-content fields of an upstream event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    fields: Map<String, Value>,
}

impl Envelope {
    /// Build an envelope from a parsed event, dropping its `content`
    #[must_use]
    pub fn from_map(mut fields: Map<String, Value>) -> Self {
        fields.remove("content");
        Self { fields }
    }

    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    #[must_use]
    pub fn author(&self) -> Option<&str> {
        self.fields.get("author").and_then(Value::as_str)
    }

    /// The forwardable subset: supplementary keys plus `author`.
    ///
    /// Returns `None` when the event carries nothing worth forwarding.
    #[must_use]
    pub fn supplementary(&self) -> Option<Envelope> {
        let mut picked = Map::new();
        for key in SUPPLEMENTARY_KEYS {
            if let Some(value) = self.fields.get(*key) {
                picked.insert((*key).to_string(), value.clone());
            }
        }
        if picked.is_empty() {
            return None;
        }
        if let Some(author) = self.fields.get("author") {
            picked.insert("author".to_string(), author.clone());
        }
        Some(Envelope { fields: picked })
    }

    /// Downstream JSON payload for this envelope
    #[must_use]
    pub fn to_payload(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}
