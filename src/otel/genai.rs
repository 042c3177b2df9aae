//! Gen-AI semantic convention extraction
//!
//! Maps the `gen_ai.*` attribute keys onto [`GenAiFields`]. Coercion is
//! tolerant: a value that cannot be read as the declared type leaves the
//! field absent instead of failing the span.

use serde::de::DeserializeOwned;

use super::model::{AttributeValue, Attributes, GenAiFields};

/// Recognized attribute keys
pub mod keys {
    pub const PROVIDER_NAME: &str = "gen_ai.provider.name";
    pub const OPERATION_NAME: &str = "gen_ai.operation.name";
    pub const REQUEST_MODEL: &str = "gen_ai.request.model";
    pub const REQUEST_MAX_TOKENS: &str = "gen_ai.request.max_tokens";
    pub const REQUEST_TEMPERATURE: &str = "gen_ai.request.temperature";
    pub const REQUEST_TOP_P: &str = "gen_ai.request.top_p";
    pub const RESPONSE_ID: &str = "gen_ai.response.id";
    pub const RESPONSE_MODEL: &str = "gen_ai.response.model";
    pub const RESPONSE_FINISH_REASONS: &str = "gen_ai.response.finish_reasons";
    pub const USAGE_INPUT_TOKENS: &str = "gen_ai.usage.input_tokens";
    pub const USAGE_OUTPUT_TOKENS: &str = "gen_ai.usage.output_tokens";
    pub const SYSTEM_INSTRUCTIONS: &str = "gen_ai.system_instructions";
    pub const INPUT_MESSAGES: &str = "gen_ai.input.messages";
    pub const OUTPUT_MESSAGES: &str = "gen_ai.output.messages";
}

/// Extract the gen-AI call profile from a decoded span attribute map
pub fn extract_gen_ai(attrs: &Attributes) -> GenAiFields {
    GenAiFields {
        provider_name: text(attrs, keys::PROVIDER_NAME),
        operation_name: text(attrs, keys::OPERATION_NAME),
        request_model: text(attrs, keys::REQUEST_MODEL),
        max_tokens: integer(attrs, keys::REQUEST_MAX_TOKENS),
        temperature: float(attrs, keys::REQUEST_TEMPERATURE),
        top_p: float(attrs, keys::REQUEST_TOP_P),
        response_id: text(attrs, keys::RESPONSE_ID),
        response_model: text(attrs, keys::RESPONSE_MODEL),
        finish_reasons: structured(attrs, keys::RESPONSE_FINISH_REASONS),
        input_tokens: integer(attrs, keys::USAGE_INPUT_TOKENS),
        output_tokens: integer(attrs, keys::USAGE_OUTPUT_TOKENS),
        system_instructions: structured(attrs, keys::SYSTEM_INSTRUCTIONS),
        input_messages: structured(attrs, keys::INPUT_MESSAGES),
        output_messages: structured(attrs, keys::OUTPUT_MESSAGES),
    }
}

fn text(attrs: &Attributes, key: &str) -> Option<String> {
    match attrs.get(key)? {
        AttributeValue::String(s) => Some(s.clone()),
        AttributeValue::Int(i) => Some(i.to_string()),
        AttributeValue::Float(f) => Some(f.to_string()),
        AttributeValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn integer(attrs: &Attributes, key: &str) -> Option<i64> {
    let parsed = match attrs.get(key)? {
        AttributeValue::Int(i) => Some(*i),
        AttributeValue::Float(f) if f.is_finite() && f.abs() < i64::MAX as f64 => {
            Some(f.trunc() as i64)
        }
        AttributeValue::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    if parsed.is_none() {
        tracing::debug!(key, "gen_ai attribute is not an integer, dropping");
    }
    parsed
}

fn float(attrs: &Attributes, key: &str) -> Option<f64> {
    let parsed = match attrs.get(key)? {
        AttributeValue::Float(f) => Some(*f),
        AttributeValue::Int(i) => Some(*i as f64),
        AttributeValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    let parsed = parsed.filter(|f| f.is_finite());
    if parsed.is_none() {
        tracing::debug!(key, "gen_ai attribute is not a number, dropping");
    }
    parsed
}

/// JSON-typed field: either a JSON document in a string or an already
/// structured array value
fn structured<T: DeserializeOwned>(attrs: &Attributes, key: &str) -> Option<T> {
    let json = match attrs.get(key)? {
        AttributeValue::Null => return None,
        AttributeValue::String(s) => serde_json::from_str(s),
        AttributeValue::Array(items) => serde_json::from_value(serde_json::Value::Array(
            items.iter().map(embedded_json).collect(),
        )),
        other => serde_json::from_value(other.to_json()),
    };
    match json {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!(key, error = %e, "gen_ai attribute is not valid JSON, dropping");
            None
        }
    }
}

/// Array items may themselves be JSON-encoded objects
fn embedded_json(item: &AttributeValue) -> serde_json::Value {
    if let AttributeValue::String(s) = item {
        let trimmed = s.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(value) = serde_json::from_str(s) {
                return value;
            }
        }
    }
    item.to_json()
}
