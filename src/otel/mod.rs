//! OpenTelemetry decoding for Tracehub
//!
//! Turns OTLP/protobuf trace documents into the projected trace model:
//!
//! - [`attributes`]: wire `KeyValue` lists to plain attribute maps
//! - [`genai`]: `gen_ai.*` semantic conventions to typed call profiles
//! - [`projector`]: resource/scope/span walk producing one [`ExtractedTrace`]
//!
//! Send traces via OTLP/HTTP:
//! ```bash
//! OTEL_EXPORTER_OTLP_TRACES_ENDPOINT=http://localhost:4318/v1/traces
//! OTEL_EXPORTER_OTLP_PROTOCOL=http/protobuf
//! OTEL_EXPORTER_OTLP_HEADERS="Authorization=Bearer <api key>"
//! ```

pub mod attributes;
pub mod genai;
pub mod model;
pub mod projector;

#[cfg(test)]
pub(crate) mod testing;

pub use attributes::decode_attributes;
pub use genai::extract_gen_ai;
pub use model::{
    AttributeValue, Attributes, ChatMessage, ExtractedSpan, ExtractedTrace, GenAiFields,
    MessagePart, SpanId, SpanKind, SpanStatus, TraceId,
};
pub use projector::{parse_trace_request, project, ProjectionError};
