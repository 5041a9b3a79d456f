//! Per-route output shape validation.
//!
//! Validates structure only, never content: a plain-text answer is wrapped
//! into the route's minimal object before checking, and a violation is
//! surfaced in response metadata without blocking the answer.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::warn;

use strata_core::RouteKind;

/// JSON value kinds a property may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonKind {
    String,
    Number,
    Bool,
    Array,
    Object,
    Null,
}

impl JsonKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            JsonKind::String => value.is_string(),
            JsonKind::Number => value.is_number(),
            JsonKind::Bool => value.is_boolean(),
            JsonKind::Array => value.is_array(),
            JsonKind::Object => value.is_object(),
            JsonKind::Null => value.is_null(),
        }
    }
}

/// Structural schema for one route's output object.
#[derive(Debug, Clone)]
pub struct RouteSchema {
    pub required: Vec<&'static str>,
    /// Allowed kinds per known property; unknown properties pass through.
    pub properties: BTreeMap<&'static str, Vec<JsonKind>>,
}

impl RouteSchema {
    fn rag() -> Self {
        let mut properties = BTreeMap::new();
        properties.insert("answer", vec![JsonKind::String]);
        properties.insert("confidence", vec![JsonKind::Number]);
        properties.insert("sources_used", vec![JsonKind::Array]);
        properties.insert("caveats", vec![JsonKind::String, JsonKind::Null]);
        Self {
            required: vec!["answer"],
            properties,
        }
    }

    fn direct() -> Self {
        let mut properties = BTreeMap::new();
        properties.insert("answer", vec![JsonKind::String]);
        properties.insert("confidence", vec![JsonKind::Number]);
        Self {
            required: vec!["answer"],
            properties,
        }
    }
}

/// Result of a validation pass.
#[derive(Debug, Clone)]
pub struct SchemaOutcome {
    pub valid: bool,
    /// Whether a plain-text answer was auto-wrapped.
    pub wrapped: bool,
    pub value: Value,
    pub errors: Vec<String>,
}

/// Validates LLM output against per-route structural schemas.
pub struct OutputSchemaValidator {
    schemas: BTreeMap<RouteKind, RouteSchema>,
}

impl Default for OutputSchemaValidator {
    fn default() -> Self {
        let mut schemas = BTreeMap::new();
        schemas.insert(RouteKind::Rag, RouteSchema::rag());
        schemas.insert(RouteKind::Direct, RouteSchema::direct());
        Self { schemas }
    }
}

impl OutputSchemaValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate raw LLM output for a route. Non-JSON output is wrapped as
    /// `{"answer": <text>}` and considered valid.
    pub fn validate(&self, raw_output: &str, route: RouteKind) -> SchemaOutcome {
        let Some(schema) = self.schemas.get(&route) else {
            // No schema declared for this route; pass through wrapped.
            return SchemaOutcome {
                valid: true,
                wrapped: true,
                value: serde_json::json!({ "answer": raw_output.trim() }),
                errors: Vec::new(),
            };
        };

        let parsed = try_parse_object(raw_output);
        let Some(object) = parsed else {
            return SchemaOutcome {
                valid: true,
                wrapped: true,
                value: serde_json::json!({ "answer": raw_output.trim() }),
                errors: Vec::new(),
            };
        };

        let mut errors = Vec::new();
        for field in &schema.required {
            if object.get(*field).map_or(true, Value::is_null) {
                errors.push(format!("missing required property: {}", field));
            }
        }
        for (field, kinds) in &schema.properties {
            if let Some(value) = object.get(*field) {
                if !kinds.iter().any(|k| k.matches(value)) {
                    errors.push(format!("property {} has wrong type", field));
                }
            }
        }

        if errors.is_empty() {
            SchemaOutcome {
                valid: true,
                wrapped: false,
                value: Value::Object(object),
                errors,
            }
        } else {
            warn!(route = %route, errors = ?errors, "output schema violation");
            SchemaOutcome {
                valid: false,
                wrapped: true,
                value: serde_json::json!({ "answer": raw_output.trim() }),
                errors,
            }
        }
    }
}

fn try_parse_object(text: &str) -> Option<serde_json::Map<String, Value>> {
    let trimmed = text.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}
