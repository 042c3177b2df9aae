//! OTLP attribute decoding
//!
//! Turns the wire `KeyValue` list into a plain [`Attributes`] map. Decoding is
//! total: every input key shows up in the output, and any value the decoder
//! does not understand becomes [`AttributeValue::Null`].

use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};

use super::model::{AttributeValue, Attributes};

/// Decode a wire attribute list. Later duplicates of a key win.
pub fn decode_attributes(attrs: &[KeyValue]) -> Attributes {
    attrs
        .iter()
        .map(|kv| (kv.key.clone(), decode_value(kv.value.as_ref())))
        .collect()
}

/// Decode one value, descending a single level into arrays
pub fn decode_value(value: Option<&AnyValue>) -> AttributeValue {
    match value.and_then(|v| v.value.as_ref()) {
        Some(any_value::Value::ArrayValue(arr)) => AttributeValue::Array(
            arr.values
                .iter()
                .map(|item| decode_scalar(item.value.as_ref()))
                .collect(),
        ),
        other => decode_scalar(other),
    }
}

fn decode_scalar(value: Option<&any_value::Value>) -> AttributeValue {
    match value {
        Some(any_value::Value::StringValue(s)) => AttributeValue::String(s.clone()),
        Some(any_value::Value::BoolValue(b)) => AttributeValue::Bool(*b),
        Some(any_value::Value::IntValue(i)) => AttributeValue::Int(*i),
        Some(any_value::Value::DoubleValue(d)) => AttributeValue::Float(*d),
        Some(any_value::Value::BytesValue(b)) => AttributeValue::Bytes(b.clone()),
        // nested arrays and key/value lists are outside the supported shape
        Some(any_value::Value::ArrayValue(_)) | Some(any_value::Value::KvlistValue(_)) => {
            AttributeValue::Null
        }
        None => AttributeValue::Null,
    }
}
