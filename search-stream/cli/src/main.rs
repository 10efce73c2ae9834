//! Search Stream CLI - Run One Streaming Search
//!
//! Issues a single query against the streaming search endpoint and prints each
//! envelope as one JSON line on stdout. Logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! # Last 15 minutes of logs
//! search-stream --org default --sql 'SELECT * FROM "default" LIMIT 10'
//!
//! # Explicit time range (microseconds since epoch)
//! search-stream --sql 'SELECT count(*) FROM logs' --start 1700000000000000 --end 1700000600000000
//!
//! # Full request body from a file, bypassing the result cache
//! search-stream --query-file query.json --no-cache
//!
//! # Verbose logging
//! RUST_LOG=search_stream_core=debug search-stream --sql '...'
//! ```
//!
//! # Signals
//!
//! - `SIGINT` (Ctrl-C): close the stream and exit

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::Parser;
use search_stream_core::{
    default_config_path, load_config_from_path, ConfigOverrides, Envelope, QueryRequest,
    StreamHandlers, StreamingSession, TraceId,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Default look-back window when no start time is given
const DEFAULT_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Search Stream - run a streaming search query
#[derive(Parser, Debug)]
#[command(name = "search-stream")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Organization identifier
    #[arg(short = 'o', long, env = "SEARCH_STREAM_ORG", default_value = "default")]
    org: String,

    /// SQL query text
    #[arg(short = 'q', long, conflicts_with = "query_file", required_unless_present = "query_file")]
    sql: Option<String>,

    /// JSON file holding the complete request body
    #[arg(short = 'f', long, value_name = "FILE")]
    query_file: Option<PathBuf>,

    /// Start time in microseconds since the epoch (default: 15 minutes ago)
    #[arg(long, value_name = "MICROS")]
    start: Option<i64>,

    /// End time in microseconds since the epoch (default: now)
    #[arg(long, value_name = "MICROS")]
    end: Option<i64>,

    /// Maximum number of hits
    #[arg(long, default_value_t = 100)]
    size: u64,

    /// Page type sent as the `type` parameter
    #[arg(long, default_value = "logs")]
    page_type: String,

    /// Search type
    #[arg(long, default_value = "ui")]
    search_type: String,

    /// Trace identifier (default: random)
    #[arg(long, value_name = "ID")]
    trace_id: Option<String>,

    /// Bypass the server-side result cache
    #[arg(long)]
    no_cache: bool,

    /// Configuration file path
    #[arg(short = 'c', long, env = "SEARCH_STREAM_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Server base URL
    #[arg(short = 'u', long, value_name = "URL")]
    base_url: Option<String>,

    /// User-Agent header sent with each request
    #[arg(long, value_name = "AGENT")]
    user_agent: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "SEARCH_STREAM_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// How the query ended
#[derive(Debug)]
enum Outcome {
    Complete,
    Failed(String),
}

/// Initialize logging on stderr
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "search_stream={level},search_stream_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn now_micros() -> Result<i64> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("System clock is before the Unix epoch")?;
    i64::try_from(elapsed.as_micros()).context("Timestamp out of range")
}

/// Build the request body from the arguments
fn build_query(args: &Args) -> Result<Value> {
    if let Some(ref path) = args.query_file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read query file: {path:?}"))?;
        return serde_json::from_str(&text)
            .with_context(|| format!("Query file is not valid JSON: {path:?}"));
    }

    let Some(ref sql) = args.sql else {
        bail!("Either --sql or --query-file is required");
    };

    let end = match args.end {
        Some(end) => end,
        None => now_micros()?,
    };
    let window = i64::try_from(DEFAULT_WINDOW.as_micros()).context("Window out of range")?;
    let start = args.start.unwrap_or(end - window);
    if start > end {
        bail!("Start time {start} is after end time {end}");
    }

    Ok(json!({
        "query": {
            "sql": sql,
            "start_time": start,
            "end_time": end,
            "from": 0,
            "size": args.size,
        }
    }))
}

fn print_envelope(envelope: &Envelope) {
    match serde_json::to_string(envelope) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, "Failed to encode envelope"),
    }
}

fn handlers(outcome: mpsc::UnboundedSender<Outcome>) -> StreamHandlers {
    let on_error = outcome.clone();
    StreamHandlers::new()
        .on_data(|_, envelope| print_envelope(envelope))
        .on_error(move |_, envelope| {
            print_envelope(envelope);
            let message = envelope
                .as_error()
                .and_then(|content| content.message())
                .unwrap_or("unknown error")
                .to_string();
            let _ = on_error.send(Outcome::Failed(message));
        })
        .on_complete(move |_| {
            let _ = outcome.send(Outcome::Complete);
        })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let mut config = load_config_from_path(args.config.clone().or_else(default_config_path))
        .context("Failed to load configuration")?;
    let mut overrides = ConfigOverrides::new();
    if let Some(ref base_url) = args.base_url {
        overrides = overrides.with_base_url(base_url.clone());
    }
    if let Some(ref agent) = args.user_agent {
        overrides = overrides.with_user_agent(agent.clone());
    }
    if args.no_cache {
        overrides = overrides.with_use_cache(false);
    }
    overrides.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        base_url = %config.base_url,
        source = %config.source(),
        "Search stream client starting"
    );

    let trace_id = args
        .trace_id
        .clone()
        .map_or_else(TraceId::generate, TraceId::from);
    let request = QueryRequest::new(trace_id.clone(), args.org.clone(), build_query(&args)?)
        .with_page_type(args.page_type.clone())
        .with_search_type(args.search_type.clone());

    let session = StreamingSession::new(config).context("Failed to create HTTP client")?;
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();

    info!(trace_id = %trace_id, org_id = %args.org, "Running query");
    session.fetch_query_data_with_http_stream(request, handlers(outcome_tx));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            info!("Received SIGINT, closing stream");
            session.close_stream();
            Ok(())
        }
        outcome = outcome_rx.recv() => match outcome {
            Some(Outcome::Complete) => {
                info!(trace_id = %trace_id, "Query complete");
                Ok(())
            }
            Some(Outcome::Failed(message)) => {
                session.close_stream_with_error();
                bail!("Query failed: {message}")
            }
            None => bail!("Stream ended without a result"),
        },
    }
}
