//! OTLP request builders shared by unit tests

use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span};
use prost::Message;

pub const TRACE_ID: [u8; 16] = [
    0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89,
];
pub const TRACE_ID_HEX: &str = "abcdef0123456789abcdef0123456789";

/// 2024-01-01T00:00:00Z
pub const BASE_NANOS: u64 = 1_704_067_200_000_000_000;

pub fn kv_str(key: &str, value: &str) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(any_value::Value::StringValue(value.to_string())),
        }),
    }
}

pub fn span_id(n: u8) -> [u8; 8] {
    [0, 0, 0, 0, 0, 0, 0, n]
}

pub fn span(n: u8, name: &str, start: u64, end: u64, attributes: Vec<KeyValue>) -> Span {
    Span {
        trace_id: TRACE_ID.to_vec(),
        span_id: span_id(n).to_vec(),
        name: name.to_string(),
        kind: 3,
        start_time_unix_nano: start,
        end_time_unix_nano: end,
        attributes,
        ..Default::default()
    }
}

pub fn resource_spans(resource_attrs: Vec<KeyValue>, spans: Vec<Span>) -> ResourceSpans {
    ResourceSpans {
        resource: Some(Resource {
            attributes: resource_attrs,
            ..Default::default()
        }),
        scope_spans: vec![ScopeSpans {
            spans,
            ..Default::default()
        }],
        ..Default::default()
    }
}

pub fn request(groups: Vec<ResourceSpans>) -> ExportTraceServiceRequest {
    ExportTraceServiceRequest {
        resource_spans: groups,
    }
}

/// One resource group, one scope, two spans sharing [`TRACE_ID`]; the second
/// span is an LLM call.
pub fn chat_request() -> ExportTraceServiceRequest {
    request(vec![resource_spans(
        vec![kv_str("service.name", "support-bot")],
        vec![
            span(1, "agent.run", BASE_NANOS, BASE_NANOS + 3_000_000_000, vec![]),
            span(
                2,
                "chat gpt-4o",
                BASE_NANOS + 1_000_000_000,
                BASE_NANOS + 2_000_000_000,
                vec![
                    kv_str("gen_ai.provider.name", "openai"),
                    kv_str("gen_ai.request.model", "gpt-4o"),
                    kv_str("gen_ai.usage.input_tokens", "120"),
                ],
            ),
        ],
    )])
}

pub fn chat_payload() -> Vec<u8> {
    chat_request().encode_to_vec()
}
