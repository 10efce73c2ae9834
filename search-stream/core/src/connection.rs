//! Stream Connection Manager
//!
//! Owns the outbound HTTP requests and feeds their bodies to the shared
//! worker. One task is spawned per connection; it opens the stream through the
//! [`HttpTransport`], decodes the body bytes into text, and relays the text to
//! the worker tagged with the trace id and connection generation.
//!
//! # Cancellation
//!
//! Every connection has a [`CancellationToken`], stored both here and in the
//! trace's registry record. The read loop re-checks that its token is live and
//! that the record still belongs to its generation before every read and
//! before every chunk, so a cancelled or restarted trace stops emitting
//! immediately. Aborts are expected and never reported.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::StreamConfig;
use crate::registry::{TraceRecord, TraceRegistry};
use crate::request::{traceparent, QueryRequest, TraceId};
use crate::transport::{ByteStream, HttpTransport, StreamRequest, TransportError};
use crate::worker::{StreamEvent, WorkerCommand, WorkerEvent, WorkerHandle};

#[derive(Debug)]
struct ActiveConnection {
    token: CancellationToken,
    generation: u64,
}

/// Opens, relays, and cancels streaming connections
pub struct ConnectionManager {
    transport: Arc<dyn HttpTransport>,
    config: StreamConfig,
    registry: TraceRegistry,
    handles: Mutex<HashMap<TraceId, ActiveConnection>>,
    worker: Mutex<Option<WorkerHandle>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    generations: AtomicU64,
    active_trace: Mutex<Option<TraceId>>,
}

impl ConnectionManager {
    /// Create a manager; worker events and connection errors go to `events`
    #[must_use]
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        config: StreamConfig,
        registry: TraceRegistry,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            transport,
            config,
            registry,
            handles: Mutex::new(HashMap::new()),
            worker: Mutex::new(None),
            events,
            generations: AtomicU64::new(0),
            active_trace: Mutex::new(None),
        }
    }

    /// Client configuration
    #[must_use]
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Most recently opened trace that is still running
    #[must_use]
    pub fn active_trace_id(&self) -> Option<TraceId> {
        self.active_trace.lock().clone()
    }

    /// Number of open connections
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.handles.lock().len()
    }

    /// Whether `trace_id` has an open connection
    #[must_use]
    pub fn is_open(&self, trace_id: &TraceId) -> bool {
        self.handles.lock().contains_key(trace_id)
    }

    // ========================================================================
    // Open
    // ========================================================================

    /// Open a connection for a registered trace
    ///
    /// Does nothing if the trace has no registry record. Must be called from
    /// within a tokio runtime.
    pub fn open(self: &Arc<Self>, trace_id: TraceId, request: Arc<QueryRequest>) {
        let token = CancellationToken::new();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;

        if !self
            .registry
            .attach_connection(&trace_id, token.clone(), generation)
        {
            tracing::debug!(trace_id = %trace_id, "Trace gone before connection opened");
            return;
        }

        let previous = self.handles.lock().insert(
            trace_id.clone(),
            ActiveConnection {
                token: token.clone(),
                generation,
            },
        );
        if let Some(previous) = previous {
            previous.token.cancel();
        }
        *self.active_trace.lock() = Some(trace_id.clone());

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_stream(trace_id, generation, request, token).await;
        });
    }

    async fn run_stream(
        self: Arc<Self>,
        trace_id: TraceId,
        generation: u64,
        request: Arc<QueryRequest>,
        token: CancellationToken,
    ) {
        let body = match self.open_body(&trace_id, &request, &token).await {
            Ok(body) => body,
            Err(err) => {
                self.report_failure(&trace_id, generation, &token, &err, false);
                return;
            }
        };

        if !self.is_current(&trace_id, generation, &token) {
            return;
        }

        let worker = self.ensure_worker();
        worker.send(WorkerCommand::StartStream {
            trace_id: trace_id.clone(),
            generation,
        });

        if let Err(err) = self
            .read_body(&trace_id, generation, body, &token, &worker)
            .await
        {
            self.report_failure(&trace_id, generation, &token, &err, true);
        }
    }

    async fn open_body(
        &self,
        trace_id: &TraceId,
        request: &QueryRequest,
        token: &CancellationToken,
    ) -> Result<ByteStream, TransportError> {
        let url = request.stream_url(&self.config.base_url, self.config.use_cache)?;

        tracing::info!(
            trace_id = %trace_id,
            org_id = %request.org_id,
            endpoint = request.kind.endpoint(),
            "Opening search stream"
        );

        let stream_request = StreamRequest {
            url,
            traceparent: traceparent(trace_id),
            body: request.query.clone(),
        };
        self.transport
            .open_stream(stream_request, token.clone())
            .await
    }

    async fn read_body(
        &self,
        trace_id: &TraceId,
        generation: u64,
        mut body: ByteStream,
        token: &CancellationToken,
        worker: &WorkerHandle,
    ) -> Result<(), TransportError> {
        let mut decoder = Utf8ChunkDecoder::default();
        let mut bytes_read = 0usize;

        loop {
            if !self.is_current(trace_id, generation, token) {
                return Err(TransportError::Aborted);
            }

            let next = tokio::select! {
                biased;
                () = token.cancelled() => return Err(TransportError::Aborted),
                next = body.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;

            if !self.is_current(trace_id, generation, token) {
                return Err(TransportError::Aborted);
            }

            bytes_read += chunk.len();
            let text = decoder.decode(&chunk);
            if !text.is_empty() {
                worker.send(WorkerCommand::ProcessChunk {
                    trace_id: trace_id.clone(),
                    generation,
                    text,
                });
            }
        }

        let tail = decoder.finish();
        if !tail.is_empty() {
            worker.send(WorkerCommand::ProcessChunk {
                trace_id: trace_id.clone(),
                generation,
                text: tail,
            });
        }

        tracing::debug!(trace_id = %trace_id, bytes_read, "Search stream body exhausted");
        worker.send(WorkerCommand::EndStream {
            trace_id: trace_id.clone(),
            generation,
        });
        Ok(())
    }

    fn is_current(&self, trace_id: &TraceId, generation: u64, token: &CancellationToken) -> bool {
        !token.is_cancelled() && self.registry.generation(trace_id) == Some(generation)
    }

    fn report_failure(
        &self,
        trace_id: &TraceId,
        generation: u64,
        token: &CancellationToken,
        err: &TransportError,
        started: bool,
    ) {
        if err.is_abort() || token.is_cancelled() {
            tracing::debug!(trace_id = %trace_id, "Search stream aborted");
            return;
        }

        tracing::warn!(trace_id = %trace_id, error = %err, "Search stream failed");
        let payload = err.to_payload();

        // Once the worker holds a context, the error must queue behind the
        // messages it has already parsed
        let worker = if started {
            self.worker.lock().clone()
        } else {
            None
        };
        if let Some(worker) = worker {
            worker.send(WorkerCommand::FailStream {
                trace_id: trace_id.clone(),
                generation,
                error: payload,
            });
            return;
        }

        let _ = self.events.send(WorkerEvent {
            trace_id: trace_id.clone(),
            generation,
            event: StreamEvent::Error(payload),
        });
    }

    fn ensure_worker(&self) -> WorkerHandle {
        self.worker
            .lock()
            .get_or_insert_with(|| WorkerHandle::spawn(self.events.clone()))
            .clone()
    }

    fn send_to_worker(&self, command: WorkerCommand) -> bool {
        match self.worker.lock().as_ref() {
            Some(worker) => worker.send(command),
            None => false,
        }
    }

    // ========================================================================
    // Terminal Events
    // ========================================================================

    /// Tear down a trace that ended normally
    ///
    /// Returns the removed record so the caller can notify its subscribers.
    pub fn finish(&self, trace_id: &TraceId, generation: u64) -> Option<TraceRecord> {
        let record = self.registry.remove_if_generation(trace_id, generation)?;
        self.release(trace_id, generation);
        tracing::info!(trace_id = %trace_id, "Search stream completed");
        Some(record)
    }

    /// Tear down a trace that reported an error
    ///
    /// The connection is cancelled in case the server kept the body open.
    pub fn fail(&self, trace_id: &TraceId, generation: u64) -> Option<TraceRecord> {
        let record = self.registry.remove_if_generation(trace_id, generation)?;
        record.cancel();
        self.release(trace_id, generation);
        self.send_to_worker(WorkerCommand::CancelStream {
            trace_id: trace_id.clone(),
        });
        Some(record)
    }

    fn release(&self, trace_id: &TraceId, generation: u64) {
        {
            let mut handles = self.handles.lock();
            if handles
                .get(trace_id)
                .is_some_and(|conn| conn.generation == generation)
            {
                handles.remove(trace_id);
            }
        }
        self.clear_active(trace_id);
    }

    fn clear_active(&self, trace_id: &TraceId) {
        let mut active = self.active_trace.lock();
        if active.as_ref() == Some(trace_id) {
            *active = None;
        }
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Cancel one trace and drop its record
    ///
    /// Returns false if nothing was running. Safe to call repeatedly.
    pub fn cancel_one(&self, trace_id: &TraceId) -> bool {
        let handle = self.handles.lock().remove(trace_id);
        if let Some(ref handle) = handle {
            handle.token.cancel();
        }

        self.send_to_worker(WorkerCommand::CancelStream {
            trace_id: trace_id.clone(),
        });

        let record = self.registry.remove(trace_id);
        if let Some(ref record) = record {
            record.cancel();
        }
        self.clear_active(trace_id);

        let cancelled = handle.is_some() || record.is_some();
        if cancelled {
            tracing::info!(trace_id = %trace_id, "Search stream cancelled");
        }
        cancelled
    }

    /// Cancel every connection and drop every record
    pub fn cancel_all(&self) {
        let handles: Vec<ActiveConnection> =
            self.handles.lock().drain().map(|(_, conn)| conn).collect();
        for handle in &handles {
            handle.token.cancel();
        }

        self.send_to_worker(WorkerCommand::CloseAll);

        let records = self.registry.clear();
        for record in &records {
            record.cancel();
        }
        *self.active_trace.lock() = None;

        tracing::debug!(
            connections = handles.len(),
            traces = records.len(),
            "All search streams closed"
        );
    }

    /// Cancel the current connection but keep the record for a restart
    ///
    /// Returns the retained request, or `None` if the trace is unknown.
    pub fn detach(&self, trace_id: &TraceId) -> Option<Arc<QueryRequest>> {
        let request = self.registry.request(trace_id)?;
        if let Some(handle) = self.handles.lock().remove(trace_id) {
            handle.token.cancel();
        }
        if let Some(token) = self.registry.cancellation_token(trace_id) {
            token.cancel();
        }
        self.send_to_worker(WorkerCommand::CancelStream {
            trace_id: trace_id.clone(),
        });
        Some(request)
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("base_url", &self.config.base_url)
            .field("connections", &self.active_count())
            .field("worker", &self.worker.lock().is_some())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// UTF-8 Decoding
// ============================================================================

/// Decodes byte chunks whose boundaries may split a UTF-8 sequence
///
/// Incomplete trailing sequences are held for the next chunk; invalid bytes
/// become U+FFFD.
#[derive(Debug, Default)]
struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest).into_owned()
    }
}
