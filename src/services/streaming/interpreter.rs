//! Fragment interpreter
//!
//! Turns a balanced span located by the scanner into something the session
//! can act on: a content unit, an envelope, or nothing at all.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::{
    error::Result,
    messages::{ContentUnit, Envelope},
};

/// What a parsed span turned out to be
#[derive(Debug, Clone, PartialEq)]
pub enum Interpretation {
    /// A usable content unit
    Unit(ContentUnit),

    /// An event object; its content (if any) is handled separately
    Envelope(Envelope),

    /// Valid JSON without anything to emit
    Ignored,
}

/// Parses spans and extracts unit metadata
#[derive(Debug, Clone, Default)]
pub struct FragmentInterpreter {
    /// Emit text-less parts that carry a function call or response
    forward_tool_activity: bool,
}

impl FragmentInterpreter {
    pub fn new(forward_tool_activity: bool) -> Self {
        Self {
            forward_tool_activity,
        }
    }

    /// Parse a span and classify it.
    ///
    /// # Errors
    ///
    /// Returns an error if the span is not valid JSON
    pub fn interpret(&self, span: &str) -> Result<Interpretation> {
        let value: Value = serde_json::from_str(span)?;
        Ok(self.classify(value))
    }

    /// Classify an already parsed value
    pub fn classify(&self, value: Value) -> Interpretation {
        let Value::Object(map) = value else {
            return Interpretation::Ignored;
        };

        if is_part(&map) {
            return self
                .unit_from_part(&map)
                .map_or(Interpretation::Ignored, Interpretation::Unit);
        }

        Interpretation::Envelope(Envelope::from_map(map))
    }

    /// Build a unit from one element of a parts array.
    ///
    /// `None` when the part has no usable text (and is not forwardable tool
    /// activity). The author is left empty for the session to fill in.
    pub fn unit_from_part(&self, part: &Map<String, Value>) -> Option<ContentUnit> {
        let text = part
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let thought = part
            .get("thought")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let function_call = typed_field(part, "functionCall", "function_call");
        let function_response = typed_field(part, "functionResponse", "function_response");

        let mut unit = ContentUnit::text(text, thought);
        unit.function_call = function_call;
        unit.function_response = function_response;

        if unit.text.is_empty() && !(self.forward_tool_activity && unit.has_tool_activity()) {
            return None;
        }
        Some(unit)
    }
}

/// The parts array of an event, in either the agent shape
/// (`content.parts`) or the model shape (`candidates[0].content.parts`)
pub fn parts_of(event: &Value) -> &[Value] {
    event
        .pointer("/content/parts")
        .or_else(|| event.pointer("/candidates/0/content/parts"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// A bare part rather than a whole event
fn is_part(map: &Map<String, Value>) -> bool {
    if map.contains_key("content") {
        return false;
    }
    [
        "text",
        "thought",
        "functionCall",
        "function_call",
        "functionResponse",
        "function_response",
    ]
    .iter()
    .any(|key| map.contains_key(*key))
}

fn typed_field<T: DeserializeOwned>(
    map: &Map<String, Value>,
    camel: &str,
    snake: &str,
) -> Option<T> {
    let value = map.get(camel).or_else(|| map.get(snake))?;
    match serde_json::from_value(value.clone()) {
        Ok(typed) => Some(typed),
        Err(e) => {
            tracing::debug!(field = camel, error = %e, "ignoring malformed tool payload");
            None
        }
    }
}
