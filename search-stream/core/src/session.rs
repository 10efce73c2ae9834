//! Streaming Session - Query Lifecycle Facade
//!
//! The public entry point. A [`StreamingSession`] owns one trace registry, one
//! connection manager, and (lazily) one shared worker; callers construct it
//! once and clone it wherever queries are issued.
//!
//! # Event Flow
//!
//! ```text
//! fetch_query_data_with_http_stream(request, handlers)
//!        │
//!        ▼
//!  TraceRegistry::register ──first subscriber?──▶ ConnectionManager::open
//!                                                        │ bytes
//!                                                        ▼
//!                                                  StreamWorker
//!                                                        │ WorkerEvent
//!                                                        ▼
//!  handlers ◀── Envelope ◀── event pump (this module) ◀──┘
//! ```
//!
//! The event pump is a single task, so data, error, and complete handler calls
//! for a session are serialized and events for one trace reach handlers in
//! body order. Reset handlers are the exception: they run on the thread that
//! calls [`StreamingSession::restart_stream_query`], before the new connection
//! is opened, and may overlap with the pump delivering other traces.
//!
//! Dropping the last handle to a session cancels every connection it opened.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::StreamConfig;
use crate::connection::ConnectionManager;
use crate::envelope::from_stream_event;
use crate::registry::{Dispatch, StreamHandlers, TraceRegistry};
use crate::request::{CancelRequest, QueryRequest, TraceId};
use crate::transport::{HttpTransport, ReqwestTransport, TransportError};
use crate::worker::{StreamEvent, WorkerEvent};

/// Handle to a streaming search session
///
/// Cloning is cheap; clones share the same registry, connections, and worker.
#[derive(Clone)]
pub struct StreamingSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    registry: TraceRegistry,
    connections: Arc<ConnectionManager>,
    pump: Mutex<Option<mpsc::UnboundedReceiver<WorkerEvent>>>,
}

impl StreamingSession {
    /// Create a session that talks HTTP through reqwest
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built from `config`.
    pub fn new(config: StreamConfig) -> Result<Self, TransportError> {
        let transport = ReqwestTransport::new(&config)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Create a session over a custom transport
    #[must_use]
    pub fn with_transport(config: StreamConfig, transport: Arc<dyn HttpTransport>) -> Self {
        let registry = TraceRegistry::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connections = Arc::new(ConnectionManager::new(
            transport,
            config,
            registry.clone(),
            events_tx,
        ));

        Self {
            inner: Arc::new(SessionInner {
                registry,
                connections,
                pump: Mutex::new(Some(events_rx)),
            }),
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Subscribe `handlers` to a query, opening the stream on first use
    ///
    /// Later calls with the same trace id join the running stream instead of
    /// issuing another request. Results and failures arrive only through the
    /// handlers.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn fetch_query_data_with_http_stream(&self, request: QueryRequest, handlers: StreamHandlers) {
        self.ensure_pump();

        let trace_id = request.trace_id.clone();
        let request = Arc::new(request);
        let registry = &self.inner.registry;

        registry.register(&trace_id, Arc::clone(&request), handlers);
        if registry.mark_initiated(&trace_id) {
            self.inner.connections.open(trace_id, request);
        } else {
            tracing::debug!(trace_id = %trace_id, "Joined running search stream");
        }
    }

    /// Cancel one query; unknown or finished traces are ignored
    pub fn cancel_stream_query_based_on_request_id(&self, request: &CancelRequest) {
        if !self.inner.connections.cancel_one(&request.trace_id) {
            tracing::debug!(
                trace_id = %request.trace_id,
                org_id = %request.org_id,
                "Cancel for unknown search stream"
            );
        }
    }

    /// Tear down every query
    pub fn close_stream(&self) {
        tracing::info!(traces = self.inner.registry.len(), "Closing search streams");
        self.inner.connections.cancel_all();
    }

    /// Tear down every query after a caller-side failure
    ///
    /// Cleanup is identical to [`close_stream`](Self::close_stream).
    pub fn close_stream_with_error(&self) {
        tracing::warn!(
            traces = self.inner.registry.len(),
            "Closing search streams after error"
        );
        self.inner.connections.cancel_all();
    }

    /// Re-issue a running query from scratch
    ///
    /// The current connection is dropped, every subscriber's reset handler
    /// runs, and the retained request is sent again. Returns false if the
    /// trace is unknown or a reset handler cancelled it.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn restart_stream_query(&self, trace_id: &TraceId) -> bool {
        self.ensure_pump();

        let Some(request) = self.inner.connections.detach(trace_id) else {
            return false;
        };
        tracing::info!(trace_id = %trace_id, "Restarting search stream");

        self.inner.registry.dispatch(trace_id, Dispatch::Reset);
        if !self.inner.registry.contains(trace_id) {
            return false;
        }
        self.inner.connections.open(trace_id.clone(), request);
        true
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Most recently opened trace that is still running
    #[must_use]
    pub fn active_trace_id(&self) -> Option<TraceId> {
        self.inner.connections.active_trace_id()
    }

    /// Number of traces with an open connection
    #[must_use]
    pub fn active_stream_count(&self) -> usize {
        self.inner.connections.active_count()
    }

    /// Whether a trace is registered and not yet finished
    #[must_use]
    pub fn is_streaming(&self, trace_id: &TraceId) -> bool {
        self.inner.registry.contains(trace_id)
    }

    /// Client configuration
    #[must_use]
    pub fn config(&self) -> &StreamConfig {
        self.inner.connections.config()
    }

    /// Number of subscribers attached to a trace
    #[must_use]
    pub fn subscriber_count(&self, trace_id: &TraceId) -> usize {
        self.inner.registry.subscriber_count(trace_id)
    }

    fn ensure_pump(&self) {
        if let Some(events) = self.inner.pump.lock().take() {
            tokio::spawn(run_event_pump(events, Arc::downgrade(&self.inner)));
        }
    }
}

impl std::fmt::Debug for StreamingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingSession")
            .field("registry", &self.inner.registry)
            .field("connections", &self.inner.connections)
            .finish()
    }
}

// ============================================================================
// Event Pump
// ============================================================================

async fn run_event_pump(mut events: mpsc::UnboundedReceiver<WorkerEvent>, session: Weak<SessionInner>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = session.upgrade() else {
            break;
        };
        inner.deliver(event);
    }
    tracing::debug!("Search stream event pump stopped");
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.connections.cancel_all();
    }
}

impl SessionInner {
    fn deliver(&self, event: WorkerEvent) {
        let WorkerEvent {
            trace_id,
            generation,
            event,
        } = event;

        if self.registry.generation(&trace_id) != Some(generation) {
            tracing::trace!(trace_id = %trace_id, generation, "Dropping late stream event");
            return;
        }

        let envelope = from_stream_event(&trace_id, &event);
        match event {
            StreamEvent::End => {
                if let Some(record) = self.connections.finish(&trace_id, generation) {
                    record.dispatch(Dispatch::Complete);
                }
            }
            StreamEvent::Error(_) => {
                if let Some(record) = self.connections.fail(&trace_id, generation) {
                    record.dispatch(Dispatch::Error(&envelope));
                }
            }
            StreamEvent::SearchResponseMetadata(_)
            | StreamEvent::SearchResponseHits(_)
            | StreamEvent::Progress(_) => {
                self.registry.dispatch(&trace_id, Dispatch::Data(&envelope));
            }
        }
    }
}
