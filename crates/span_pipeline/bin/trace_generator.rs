//! Sample Trace Generator
//!
//! Produces demo traces from a fixed set of scenarios and ships them to a
//! trace collector through the span pipeline:
//! - weighted-equal random choice between five scenarios
//! - random duration within each scenario's range
//! - error spans carry an `error` log at the span midpoint
//! - random pause between traces
//!
//! Run with: `cargo run --bin trace_generator -- --endpoint http://localhost:14268 --count 20`
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use clap::Parser;
use rand::Rng;
use span_pipeline::{
    now_micros, EnqueueError, HttpExporter, IdGenerator, KeyValue, PipelineConfig,
    PipelineController, RandomIdGenerator, Span, SpanError, SpanLog, StdoutExporter, TagValue,
};
use std::ops::RangeInclusive;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "trace_generator", about = "Send sample traces through the span pipeline")]
struct Args {
    /// Collector base URL; spans are POSTed to `<endpoint>/api/traces`
    #[arg(long, default_value = "http://localhost:14268")]
    endpoint: String,

    /// Service name reported in every span
    #[arg(long, default_value = "demo-service")]
    service: String,

    /// Number of traces to generate
    #[arg(long, default_value_t = 20)]
    count: u32,

    /// Shortest pause between traces, in milliseconds
    #[arg(long, default_value_t = 500)]
    min_delay_ms: u64,

    /// Longest pause between traces, in milliseconds
    #[arg(long, default_value_t = 2_000)]
    max_delay_ms: u64,

    /// Print batches to stdout instead of sending them
    #[arg(long)]
    stdout: bool,
}

/// One kind of request the demo service handles.
struct Scenario {
    name: &'static str,
    operation: &'static str,
    duration_ms: RangeInclusive<u64>,
    tags: &'static [(&'static str, Tag)],
    /// Probability that the span fails
    error_rate: f64,
}

#[derive(Clone, Copy)]
enum Tag {
    Str(&'static str),
    Int(i64),
    Bool(bool),
}

impl From<Tag> for TagValue {
    fn from(tag: Tag) -> Self {
        match tag {
            Tag::Str(s) => TagValue::from(s),
            Tag::Int(i) => TagValue::from(i),
            Tag::Bool(b) => TagValue::from(b),
        }
    }
}

static SCENARIOS: [Scenario; 5] = [
    Scenario {
        name: "fast_user_lookup",
        operation: "GET /api/users/123",
        duration_ms: 50..=150,
        tags: &[
            ("http.method", Tag::Str("GET")),
            ("user.id", Tag::Str("123")),
            ("http.status_code", Tag::Int(200)),
        ],
        error_rate: 0.0,
    },
    Scenario {
        name: "slow_database_query",
        operation: "database_query",
        duration_ms: 800..=1_200,
        tags: &[
            ("db.statement", Tag::Str("SELECT * FROM users")),
            ("db.type", Tag::Str("postgresql")),
        ],
        error_rate: 0.0,
    },
    Scenario {
        name: "payment_timeout",
        operation: "POST /api/payments",
        duration_ms: 2_000..=3_000,
        tags: &[
            ("http.method", Tag::Str("POST")),
            ("payment.amount", Tag::Str("99.99")),
            ("http.status_code", Tag::Int(500)),
        ],
        error_rate: 1.0,
    },
    Scenario {
        name: "cache_hit",
        operation: "cache_lookup",
        duration_ms: 5..=15,
        tags: &[("cache.key", Tag::Str("user:123")), ("cache.hit", Tag::Bool(true))],
        error_rate: 0.0,
    },
    Scenario {
        name: "external_api_call",
        operation: "external_service_call",
        duration_ms: 300..=600,
        tags: &[
            ("service.name", Tag::Str("payment-gateway")),
            ("http.url", Tag::Str("https://api.stripe.com")),
        ],
        error_rate: 0.2,
    },
];

fn build_span(
    scenario: &Scenario,
    service: &str,
    ids: &RandomIdGenerator,
    rng: &mut impl Rng,
) -> Result<(Span, u64, bool), SpanError> {
    let duration_ms = rng.gen_range(scenario.duration_ms.clone());
    let failed = rng.gen_bool(scenario.error_rate);
    let start = now_micros();

    let mut builder = Span::builder(ids.new_trace_id(), ids.new_span_id(), scenario.operation)
        .start_time_micros(start)
        .duration_micros(duration_ms * 1_000)
        .tag("service.name", service)
        .tag("span.kind", "server");
    for (key, value) in scenario.tags {
        builder = builder.tag(*key, *value);
    }
    if failed {
        builder = builder.error(true).log(SpanLog::new(
            start + duration_ms * 500,
            vec![
                KeyValue::new("event", "error"),
                KeyValue::new("message", "Operation failed"),
            ],
        ));
    }

    Ok((builder.build()?, duration_ms, failed))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.min_delay_ms > args.max_delay_ms {
        return Err("--min-delay-ms must not exceed --max-delay-ms".into());
    }

    let config = PipelineConfig::from_env()?
        .with_sink_endpoint(format!("{}/api/traces", args.endpoint.trim_end_matches('/')))
        .with_service_name(args.service.clone())
        .with_flush_interval(Duration::from_secs(1));

    let mut pipeline = if args.stdout {
        PipelineController::new(config.clone(), StdoutExporter::new(args.service.clone()))?
    } else {
        let exporter = HttpExporter::new(&config)?;
        PipelineController::new(config.clone(), exporter)?
    };
    pipeline.start()?;
    info!(endpoint = %config.sink_endpoint, count = args.count, "generating sample traces");

    let ids = RandomIdGenerator::new();
    let mut rng = rand::thread_rng();
    for _ in 0..args.count {
        let scenario = &SCENARIOS[rng.gen_range(0..SCENARIOS.len())];
        let (span, duration_ms, failed) = build_span(scenario, &args.service, &ids, &mut rng)?;

        match pipeline.enqueue(span) {
            Ok(()) => info!(
                scenario = scenario.name,
                duration_ms,
                error = failed,
                "trace enqueued"
            ),
            Err(EnqueueError::BufferFull) => {
                warn!(scenario = scenario.name, "buffer full, trace dropped");
            }
            Err(e) => {
                error!(error = %e, "pipeline refused trace");
                break;
            }
        }

        let pause = rng.gen_range(args.min_delay_ms..=args.max_delay_ms);
        tokio::time::sleep(Duration::from_millis(pause)).await;
    }

    let report = pipeline.shutdown().await?;
    println!("{}", serde_json::to_string_pretty(&report.metrics)?);
    if !report.is_clean() {
        warn!(timed_out_spans = report.timed_out_spans, "some spans were lost at shutdown");
    }
    Ok(())
}
