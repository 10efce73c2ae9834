//! Trace Registry - Per-Query Handler Registrations
//!
//! Maps each in-flight trace identifier to a [`TraceRecord`]: four append-only
//! handler lists, the connection's cancellation token, and the request that
//! started the trace. Several subscribers may register against one trace; only
//! the first one causes a connection to be opened.
//!
//! # Architecture
//!
//! ```text
//!                        TraceRegistry
//!          ┌───────────────────────────────────────────┐
//!          │ HashMap<TraceId, TraceRecord>             │
//!          │   - wrapped in Arc<Mutex<>>               │
//!          └──────────────────┬────────────────────────┘
//!                             │
//!            ┌────────────────┼────────────────┐
//!     ┌──────▼──────┐  ┌──────▼──────┐  ┌──────▼──────┐
//!     │  trace A    │  │  trace B    │  │  trace C    │
//!     │ data  [2]   │  │ data  [1]   │  │ data  [1]   │
//!     │ error [2]   │  │ error [1]   │  │ error [1]   │
//!     └─────────────┘  └─────────────┘  └─────────────┘
//! ```
//!
//! # Dispatch
//!
//! Handler lists are cloned out under the lock and invoked after it is
//! released, so a handler may call back into the session (cancel, subscribe)
//! without deadlocking. A missing record is the normal "already finished"
//! state: dispatching to it does nothing.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::envelope::Envelope;
use crate::request::{QueryRequest, TraceId};

// ============================================================================
// Handler Bundle
// ============================================================================

/// Receives data and error envelopes
pub type EnvelopeHandler = Arc<dyn Fn(&QueryRequest, &Envelope) + Send + Sync>;
/// Called once when the trace completes normally
pub type CompleteHandler = Arc<dyn Fn(&QueryRequest) + Send + Sync>;
/// Called when the trace is restarted
pub type ResetHandler = Arc<dyn Fn(&QueryRequest, &TraceId) + Send + Sync>;

/// Callbacks supplied by one subscriber
///
/// Unset callbacks are simply not registered.
#[derive(Clone, Default)]
pub struct StreamHandlers {
    data: Option<EnvelopeHandler>,
    error: Option<EnvelopeHandler>,
    complete: Option<CompleteHandler>,
    reset: Option<ResetHandler>,
}

impl StreamHandlers {
    /// Create an empty bundle
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive hits, metadata, and progress envelopes
    #[must_use]
    pub fn on_data(mut self, f: impl Fn(&QueryRequest, &Envelope) + Send + Sync + 'static) -> Self {
        self.data = Some(Arc::new(f));
        self
    }

    /// Receive the error envelope
    #[must_use]
    pub fn on_error(
        mut self,
        f: impl Fn(&QueryRequest, &Envelope) + Send + Sync + 'static,
    ) -> Self {
        self.error = Some(Arc::new(f));
        self
    }

    /// Be told when the stream ends normally
    #[must_use]
    pub fn on_complete(mut self, f: impl Fn(&QueryRequest) + Send + Sync + 'static) -> Self {
        self.complete = Some(Arc::new(f));
        self
    }

    /// Be told when the stream restarts from scratch
    #[must_use]
    pub fn on_reset(mut self, f: impl Fn(&QueryRequest, &TraceId) + Send + Sync + 'static) -> Self {
        self.reset = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for StreamHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandlers")
            .field("data", &self.data.is_some())
            .field("error", &self.error.is_some())
            .field("complete", &self.complete.is_some())
            .field("reset", &self.reset.is_some())
            .finish()
    }
}

// ============================================================================
// Trace Record
// ============================================================================

type BoundEnvelopeHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;
type BoundHandler = Arc<dyn Fn() + Send + Sync>;

/// Handlers bound to their subscriber's request
#[derive(Clone, Default)]
struct HandlerLists {
    data: Vec<BoundEnvelopeHandler>,
    error: Vec<BoundEnvelopeHandler>,
    complete: Vec<BoundHandler>,
    reset: Vec<BoundHandler>,
}

impl HandlerLists {
    fn append(&mut self, trace_id: &TraceId, request: &Arc<QueryRequest>, handlers: StreamHandlers) {
        if let Some(h) = handlers.data {
            let request = Arc::clone(request);
            self.data.push(Arc::new(move |env: &Envelope| h(&request, env)));
        }
        if let Some(h) = handlers.error {
            let request = Arc::clone(request);
            self.error.push(Arc::new(move |env: &Envelope| h(&request, env)));
        }
        if let Some(h) = handlers.complete {
            let request = Arc::clone(request);
            self.complete.push(Arc::new(move || h(&request)));
        }
        if let Some(h) = handlers.reset {
            let request = Arc::clone(request);
            let trace_id = trace_id.clone();
            self.reset.push(Arc::new(move || h(&request, &trace_id)));
        }
    }

    fn dispatch(&self, event: Dispatch<'_>) {
        match event {
            Dispatch::Data(envelope) => self.data.iter().for_each(|h| h(envelope)),
            Dispatch::Error(envelope) => self.error.iter().for_each(|h| h(envelope)),
            Dispatch::Complete => self.complete.iter().for_each(|h| h()),
            Dispatch::Reset => self.reset.iter().for_each(|h| h()),
        }
    }
}

/// Which handler list to invoke
#[derive(Clone, Copy, Debug)]
pub enum Dispatch<'a> {
    /// Data handlers, with the envelope
    Data(&'a Envelope),
    /// Error handlers, with the envelope
    Error(&'a Envelope),
    /// Complete handlers
    Complete,
    /// Reset handlers
    Reset,
}

/// Registry entry for one in-flight trace
pub struct TraceRecord {
    handlers: HandlerLists,
    subscribers: usize,
    is_initiated: bool,
    cancellation: CancellationToken,
    generation: u64,
    request: Arc<QueryRequest>,
}

impl TraceRecord {
    fn new(request: Arc<QueryRequest>) -> Self {
        Self {
            handlers: HandlerLists::default(),
            subscribers: 0,
            is_initiated: false,
            cancellation: CancellationToken::new(),
            generation: 0,
            request,
        }
    }

    /// Whether a connection has been opened
    #[must_use]
    pub fn is_initiated(&self) -> bool {
        self.is_initiated
    }

    /// Number of registered subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
    }

    /// Current connection generation (0 before the first connection)
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Request that started the trace
    #[must_use]
    pub fn request(&self) -> &Arc<QueryRequest> {
        &self.request
    }

    /// Cancel the record's connection
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Invoke every handler of the matching kind, in registration order
    pub fn dispatch(&self, event: Dispatch<'_>) {
        self.handlers.dispatch(event);
    }
}

impl fmt::Debug for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceRecord")
            .field("subscribers", &self.subscribers)
            .field("is_initiated", &self.is_initiated)
            .field("generation", &self.generation)
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Thread-safe map of in-flight traces
#[derive(Clone, Default)]
pub struct TraceRegistry {
    inner: Arc<Mutex<HashMap<TraceId, TraceRecord>>>,
}

impl TraceRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber to `trace_id`, creating the record if needed
    ///
    /// Each callback is bound to `request` so it later receives the request
    /// its own subscriber issued.
    pub fn register(&self, trace_id: &TraceId, request: Arc<QueryRequest>, handlers: StreamHandlers) {
        let mut inner = self.inner.lock();
        let record = inner
            .entry(trace_id.clone())
            .or_insert_with(|| TraceRecord::new(Arc::clone(&request)));
        record.handlers.append(trace_id, &request, handlers);
        record.subscribers += 1;

        tracing::debug!(
            trace_id = %trace_id,
            subscribers = record.subscribers,
            "Stream handlers registered"
        );
    }

    /// Claim the right to open the connection
    ///
    /// Returns true exactly once per record; later callers join the existing
    /// stream.
    pub fn mark_initiated(&self, trace_id: &TraceId) -> bool {
        match self.inner.lock().get_mut(trace_id) {
            Some(record) if !record.is_initiated => {
                record.is_initiated = true;
                true
            }
            _ => false,
        }
    }

    /// Bind a new connection to the record
    ///
    /// Returns false if the record no longer exists.
    pub fn attach_connection(
        &self,
        trace_id: &TraceId,
        cancellation: CancellationToken,
        generation: u64,
    ) -> bool {
        match self.inner.lock().get_mut(trace_id) {
            Some(record) => {
                record.cancellation = cancellation;
                record.generation = generation;
                true
            }
            None => false,
        }
    }

    /// Invoke the matching handlers of a live record
    pub fn dispatch(&self, trace_id: &TraceId, event: Dispatch<'_>) {
        let handlers = self.inner.lock().get(trace_id).map(|r| r.handlers.clone());
        match handlers {
            Some(handlers) => handlers.dispatch(event),
            None => tracing::trace!(trace_id = %trace_id, "No record for stream event"),
        }
    }

    /// Remove a record; removing twice is harmless
    pub fn remove(&self, trace_id: &TraceId) -> Option<TraceRecord> {
        self.inner.lock().remove(trace_id)
    }

    /// Remove a record only if it still belongs to `generation`
    pub fn remove_if_generation(&self, trace_id: &TraceId, generation: u64) -> Option<TraceRecord> {
        let mut inner = self.inner.lock();
        if inner.get(trace_id).is_some_and(|r| r.generation == generation) {
            inner.remove(trace_id)
        } else {
            None
        }
    }

    /// Remove and return every record
    pub fn clear(&self) -> Vec<TraceRecord> {
        self.inner.lock().drain().map(|(_, record)| record).collect()
    }

    /// Whether a record exists
    #[must_use]
    pub fn contains(&self, trace_id: &TraceId) -> bool {
        self.inner.lock().contains_key(trace_id)
    }

    /// Generation of a live record
    #[must_use]
    pub fn generation(&self, trace_id: &TraceId) -> Option<u64> {
        self.inner.lock().get(trace_id).map(TraceRecord::generation)
    }

    /// Request that started a live trace
    #[must_use]
    pub fn request(&self, trace_id: &TraceId) -> Option<Arc<QueryRequest>> {
        self.inner
            .lock()
            .get(trace_id)
            .map(|r| Arc::clone(&r.request))
    }

    /// Cancellation token of a live record
    #[must_use]
    pub fn cancellation_token(&self, trace_id: &TraceId) -> Option<CancellationToken> {
        self.inner
            .lock()
            .get(trace_id)
            .map(|r| r.cancellation.clone())
    }

    /// Subscribers registered for a trace (0 if unknown)
    #[must_use]
    pub fn subscriber_count(&self, trace_id: &TraceId) -> usize {
        self.inner
            .lock()
            .get(trace_id)
            .map_or(0, TraceRecord::subscriber_count)
    }

    /// Number of live records
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether no records are live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Identifiers of every live trace
    #[must_use]
    pub fn trace_ids(&self) -> Vec<TraceId> {
        self.inner.lock().keys().cloned().collect()
    }
}

impl fmt::Debug for TraceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceRegistry")
            .field("traces", &self.len())
            .finish()
    }
}
