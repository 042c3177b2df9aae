use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span};
use prost::Message;
use reqwest::Client;
use serde_json::Value;
use std::time::{Duration, Instant};

const SERVICES: &[&str] = &["support-bot", "search-agent", "summarizer", "triage", "copilot"];
const PROVIDERS: &[&str] = &["openai", "anthropic", "aws.bedrock", "gcp.vertex_ai"];
const MODELS: &[&str] = &["gpt-4o", "gpt-4o-mini", "claude-sonnet", "llama-3-70b", "gemini-pro"];
const OPERATIONS: &[&str] = &["chat", "text_completion", "embeddings"];
const FINISH_REASONS: &[&str] = &["stop", "length", "tool_calls"];
const PROMPTS: &[&str] = &["Where is my order?", "Summarize this ticket", "Translate to French", "What is the refund policy?", "Draft a reply"];

fn fast_random(seed: &mut u64) -> u64 {
    *seed ^= *seed << 13;
    *seed ^= *seed >> 7;
    *seed ^= *seed << 17;
    *seed
}

fn pick<'a>(items: &[&'a str], seed: &mut u64) -> &'a str {
    items[fast_random(seed) as usize % items.len()]
}

fn random_id<const N: usize>(seed: &mut u64) -> Vec<u8> {
    let mut id = Vec::with_capacity(N);
    while id.len() < N {
        id.extend_from_slice(&fast_random(seed).to_le_bytes());
    }
    id.truncate(N);
    id[0] |= 1; // never all-zero
    id
}

fn string_kv(key: &str, value: impl Into<String>) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(any_value::Value::StringValue(value.into())),
        }),
    }
}

fn int_kv(key: &str, value: i64) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(any_value::Value::IntValue(value)),
        }),
    }
}

/// One trace: an agent root span plus `llm_calls` model-call children
fn generate_trace(llm_calls: usize, seed: &mut u64) -> ExportTraceServiceRequest {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();

    let trace_id = random_id::<16>(seed);
    let root_id = random_id::<8>(seed);
    let mut cursor = now;

    let mut spans = Vec::with_capacity(llm_calls + 1);
    for _ in 0..llm_calls {
        let model = pick(MODELS, seed);
        let operation = pick(OPERATIONS, seed);
        let duration = 50_000_000 + fast_random(seed) % 2_000_000_000;
        let messages = format!(
            r#"{{"role":"user","parts":[{{"type":"text","content":"{}"}}]}}"#,
            pick(PROMPTS, seed)
        );

        spans.push(Span {
            trace_id: trace_id.clone(),
            span_id: random_id::<8>(seed),
            parent_span_id: root_id.clone(),
            name: format!("{} {}", operation, model),
            kind: 3,
            start_time_unix_nano: cursor,
            end_time_unix_nano: cursor + duration,
            attributes: vec![
                string_kv("gen_ai.provider.name", pick(PROVIDERS, seed)),
                string_kv("gen_ai.operation.name", operation),
                string_kv("gen_ai.request.model", model),
                int_kv("gen_ai.request.max_tokens", 1024),
                string_kv("gen_ai.response.model", model),
                string_kv("gen_ai.response.id", hex::encode(random_id::<8>(seed))),
                string_kv(
                    "gen_ai.response.finish_reasons",
                    format!(r#"["{}"]"#, pick(FINISH_REASONS, seed)),
                ),
                int_kv("gen_ai.usage.input_tokens", (10 + fast_random(seed) % 4000) as i64),
                // some SDKs report usage as strings
                string_kv(
                    "gen_ai.usage.output_tokens",
                    (1 + fast_random(seed) % 1000).to_string(),
                ),
                string_kv("gen_ai.input.messages", format!("[{}]", messages)),
            ],
            ..Default::default()
        });
        cursor += duration;
    }

    spans.insert(
        0,
        Span {
            trace_id,
            span_id: root_id,
            name: "agent.run".to_string(),
            kind: 1,
            start_time_unix_nano: now,
            end_time_unix_nano: cursor,
            ..Default::default()
        },
    );

    ExportTraceServiceRequest {
        resource_spans: vec![ResourceSpans {
            resource: Some(Resource {
                attributes: vec![
                    string_kv("service.name", pick(SERVICES, seed)),
                    string_kv("telemetry.sdk.language", "python"),
                ],
                ..Default::default()
            }),
            scope_spans: vec![ScopeSpans {
                spans,
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

struct BenchmarkStats {
    total_spans: usize,
    total_duration: Duration,
    request_latencies: Vec<Duration>,
}

impl BenchmarkStats {
    fn spans_per_sec(&self) -> f64 {
        self.total_spans as f64 / self.total_duration.as_secs_f64()
    }

    fn sorted(&self) -> Vec<Duration> {
        let mut sorted = self.request_latencies.clone();
        sorted.sort();
        sorted
    }

    fn avg_latency(&self) -> Duration {
        let sum: Duration = self.request_latencies.iter().sum();
        sum / self.request_latencies.len().max(1) as u32
    }

    fn percentile(&self, p: usize) -> Duration {
        let sorted = self.sorted();
        sorted
            .get((sorted.len() * p / 100).min(sorted.len().saturating_sub(1)))
            .copied()
            .unwrap_or_default()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    let num_traces: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(1000);
    let llm_calls: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(4);
    let host = std::env::var("TRACEHUB_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port = std::env::var("TRACEHUB_PORT").unwrap_or_else(|_| "4318".to_string());
    let api_key = std::env::var("TRACEHUB_API_KEY").unwrap_or_else(|_| "dev-key".to_string());
    let base_url = format!("http://{}:{}", host, port);

    println!("Tracehub Benchmark");
    println!("==================");
    println!("Target:          {}", base_url);
    println!("Traces:          {}", num_traces);
    println!("LLM calls/trace: {}", llm_calls);
    println!("Total spans:     {}", num_traces * (llm_calls + 1));
    println!();

    let client = Client::new();
    let mut seed: u64 = 12345;

    print!("Posting traces... ");
    std::io::Write::flush(&mut std::io::stdout())?;

    let mut request_latencies = Vec::with_capacity(num_traces);
    let mut payload_bytes = 0usize;
    let start = Instant::now();

    for _ in 0..num_traces {
        let body = generate_trace(llm_calls, &mut seed).encode_to_vec();
        payload_bytes += body.len();

        let request_start = Instant::now();
        let response = client
            .post(format!("{}/v1/traces", base_url))
            .bearer_auth(&api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/x-protobuf")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            eprintln!("Error: {} {}", response.status(), response.text().await?);
            return Ok(());
        }
        request_latencies.push(request_start.elapsed());
    }

    let stats = BenchmarkStats {
        total_spans: num_traces * (llm_calls + 1),
        total_duration: start.elapsed(),
        request_latencies,
    };

    println!("done");
    println!("  Spans/sec:   {:.0}", stats.spans_per_sec());
    println!("  Total time:  {:?}", stats.total_duration);
    println!("  Payload:     {:.2} MB", payload_bytes as f64 / 1024.0 / 1024.0);
    println!("  Latency:     avg={:?} p50={:?} p99={:?}",
        stats.avg_latency(), stats.percentile(50), stats.percentile(99));
    println!();

    // Wait for the workers to drain the queue
    print!("Waiting for processing... ");
    std::io::Write::flush(&mut std::io::stdout())?;
    let drain_start = Instant::now();
    let resp: Value = loop {
        let resp: Value = client
            .get(format!("{}/stats", base_url))
            .send()
            .await?
            .json()
            .await?;
        if resp["pending_batches"].as_u64().unwrap_or(0) == 0
            || drain_start.elapsed() > Duration::from_secs(120)
        {
            break resp;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };
    println!("done in {:?}", drain_start.elapsed());

    println!("Store Statistics:");
    println!("  Batches: {} ({} pending)", resp["batches"], resp["pending_batches"]);
    println!("  Traces:  {}", resp["traces"]);
    println!("  Spans:   {}", resp["spans"]);
    let workers = &resp["workers"];
    if workers.is_object() {
        println!(
            "  Workers: {} processed, {} failed, {} skipped",
            workers["processed"], workers["failed"], workers["skipped"]
        );
    }

    Ok(())
}
