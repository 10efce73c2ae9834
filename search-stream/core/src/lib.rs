//! Search Stream Core - Streaming Search Client
//!
//! Issues search queries against a streaming HTTP endpoint and delivers the
//! results incrementally. Response bodies arrive as arbitrary byte chunks; a
//! shared background worker reassembles them into messages, classifies each
//! one, and the session hands uniform [`Envelope`]s to the subscribers of the
//! query's trace id.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        StreamingSession                          │
//! │  fetch / cancel / close / restart                                │
//! │  ┌───────────────┐   ┌───────────────────┐   ┌────────────────┐  │
//! │  │ TraceRegistry │◀──│ ConnectionManager │──▶│ HttpTransport  │  │
//! │  │  handlers per │   │  one task per     │   │  (reqwest)     │  │
//! │  │  trace id     │   │  connection       │   └────────────────┘  │
//! │  └───────▲───────┘   └─────────┬─────────┘                       │
//! │          │ Envelope            │ WorkerCommand                   │
//! │  ┌───────┴───────┐   ┌─────────▼─────────┐                       │
//! │  │  event pump   │◀──│   StreamWorker    │                       │
//! │  └───────────────┘   └───────────────────┘                       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`StreamingSession`]: the facade callers construct once and share
//! - [`QueryRequest`]: one query, addressed by its [`TraceId`]
//! - [`StreamHandlers`]: a subscriber's data/error/complete/reset callbacks
//! - [`Envelope`]: the `{ type, content }` message handed to handlers
//! - [`StreamConfig`]: endpoint, cache default, and client settings
//!
//! # Quick Start
//!
//! ```ignore
//! use search_stream_core::{load_config, QueryRequest, StreamHandlers, StreamingSession, TraceId};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let session = StreamingSession::new(load_config()?)?;
//!
//!     let request = QueryRequest::new(
//!         TraceId::generate(),
//!         "default",
//!         json!({"query": {"sql": "SELECT * FROM logs", "from": 0, "size": 100}}),
//!     );
//!     let handlers = StreamHandlers::new()
//!         .on_data(|_, envelope| println!("{}", serde_json::to_string(envelope).unwrap()))
//!         .on_error(|_, envelope| eprintln!("{:?}", envelope.as_error()))
//!         .on_complete(|_| println!("done"));
//!
//!     session.fetch_query_data_with_http_stream(request, handlers);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`config`]: configuration loading (TOML file, environment, overrides)
//! - [`connection`]: connection tasks, body relay, and cancellation
//! - [`envelope`]: worker event to envelope conversion
//! - [`registry`]: per-trace handler registrations
//! - [`request`]: query descriptors, trace ids, and endpoint URLs
//! - [`session`]: the public query lifecycle facade
//! - [`transport`]: HTTP transport abstraction
//! - [`worker`]: the shared chunk-parsing worker

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod connection;
pub mod envelope;
pub mod registry;
pub mod request;
pub mod session;
pub mod transport;
pub mod worker;

// Session exports
pub use session::StreamingSession;

// Request exports
pub use request::{CancelRequest, QueryKind, QueryMeta, QueryRequest, RequestError, TraceId};

// Registry exports
pub use registry::{Dispatch, StreamHandlers, TraceRecord, TraceRegistry};

// Envelope exports
pub use envelope::{
    DataContent, EndContent, Envelope, EnvelopeContent, EnvelopeType, ErrorContent,
    ProgressContent,
};

// Worker exports
pub use worker::{StreamEvent, StreamWorker, WorkerCommand, WorkerEvent, WorkerHandle};

// Transport exports
pub use transport::{ByteStream, HttpTransport, ReqwestTransport, StreamRequest, TransportError};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, StreamConfig,
};
