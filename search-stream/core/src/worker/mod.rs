//! Shared Stream Worker
//!
//! One background task per session that turns decoded response text into typed
//! events. Every active trace gets its own parsing context inside the worker;
//! commands and events carry the trace identifier (and connection generation)
//! so any number of queries share the one task.
//!
//! # Protocol
//!
//! ```text
//!  connection tasks ──WorkerCommand──▶ StreamWorker ──WorkerEvent──▶ session pump
//!                     StartStream                    search_response_metadata
//!                     ProcessChunk                   search_response_hits
//!                     EndStream                      progress
//!                     FailStream                     error
//!                     CancelStream                   end
//!                     CloseAll
//! ```
//!
//! # Context State Machine
//!
//! `Idle → Streaming → (Ended | Cancelled)`. Terminated contexts are removed,
//! so anything that still arrives for them is dropped.

mod parser;

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::request::TraceId;

pub use parser::{classify, SseDecoder, DONE_MARKER};

// ============================================================================
// Messages
// ============================================================================

/// Commands sent to the worker
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerCommand {
    /// Begin a parsing context for a trace
    StartStream {
        /// Trace the context belongs to
        trace_id: TraceId,
        /// Connection generation
        generation: u64,
    },
    /// Deliver decoded text
    ProcessChunk {
        /// Target trace
        trace_id: TraceId,
        /// Connection generation that read the text
        generation: u64,
        /// Decoded text, split at an arbitrary point
        text: String,
    },
    /// The response body is exhausted
    EndStream {
        /// Target trace
        trace_id: TraceId,
        /// Connection generation
        generation: u64,
    },
    /// The body failed mid-stream; emit the error after pending messages
    FailStream {
        /// Target trace
        trace_id: TraceId,
        /// Connection generation
        generation: u64,
        /// Error payload to report
        error: Value,
    },
    /// Abandon one trace's context silently
    CancelStream {
        /// Target trace
        trace_id: TraceId,
    },
    /// Abandon every context silently
    CloseAll,
}

/// A typed message parsed from a response body
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Aggregate/summary information about a response
    SearchResponseMetadata(Value),
    /// A batch of result rows
    SearchResponseHits(Value),
    /// Completion percentage update
    Progress(Value),
    /// Server- or transport-reported failure
    Error(Value),
    /// The body ended normally
    End,
}

impl StreamEvent {
    /// Raw payload, if the event carries one
    #[must_use]
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::SearchResponseMetadata(v)
            | Self::SearchResponseHits(v)
            | Self::Progress(v)
            | Self::Error(v) => Some(v),
            Self::End => None,
        }
    }

    /// Whether this event ends the trace
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error(_) | Self::End)
    }
}

/// An event addressed to one trace
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkerEvent {
    /// Trace the event belongs to
    pub trace_id: TraceId,
    /// Connection generation that produced it
    #[serde(skip)]
    pub generation: u64,
    /// The event itself
    #[serde(flatten)]
    pub event: StreamEvent,
}

// ============================================================================
// Worker Handle
// ============================================================================

/// Cheap handle used to post commands to the worker task
#[derive(Clone, Debug)]
pub struct WorkerHandle {
    tx: mpsc::UnboundedSender<WorkerCommand>,
}

impl WorkerHandle {
    /// Spawn a worker task that posts its events to `events`
    ///
    /// The task exits once every handle is dropped.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn spawn(events: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(StreamWorker::new(events).run(rx));
        tracing::debug!("Stream worker started");
        Self { tx }
    }

    /// Wrap an existing command channel
    #[cfg(test)]
    pub(crate) fn from_sender(tx: mpsc::UnboundedSender<WorkerCommand>) -> Self {
        Self { tx }
    }

    /// Post a command; returns false if the worker has stopped
    pub fn send(&self, command: WorkerCommand) -> bool {
        self.tx.send(command).is_ok()
    }
}

// ============================================================================
// Worker
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ContextPhase {
    Idle,
    Streaming,
}

#[derive(Debug)]
struct StreamContext {
    generation: u64,
    phase: ContextPhase,
    decoder: SseDecoder,
}

/// Parsing state for every active trace
#[derive(Debug)]
pub struct StreamWorker {
    contexts: HashMap<TraceId, StreamContext>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl StreamWorker {
    /// Create a worker that posts events to `events`
    #[must_use]
    pub fn new(events: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Self {
            contexts: HashMap::new(),
            events,
        }
    }

    /// Number of live contexts
    #[must_use]
    pub fn active_contexts(&self) -> usize {
        self.contexts.len()
    }

    /// Process commands until the channel closes
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<WorkerCommand>) {
        while let Some(command) = commands.recv().await {
            self.handle(command);
        }
        tracing::debug!("Stream worker stopped");
    }

    /// Apply one command
    pub fn handle(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::StartStream {
                trace_id,
                generation,
            } => {
                // Generations only grow; a late start from a superseded
                // connection must not replace the current context
                if self
                    .contexts
                    .get(&trace_id)
                    .is_some_and(|context| context.generation > generation)
                {
                    return;
                }
                self.contexts.insert(
                    trace_id,
                    StreamContext {
                        generation,
                        phase: ContextPhase::Idle,
                        decoder: SseDecoder::new(),
                    },
                );
            }
            WorkerCommand::ProcessChunk {
                trace_id,
                generation,
                text,
            } => {
                let Some(context) = self.context_mut(&trace_id, generation) else {
                    tracing::trace!(trace_id = %trace_id, "Dropping chunk for inactive stream");
                    return;
                };
                context.phase = ContextPhase::Streaming;
                let events = context.decoder.feed(&text);
                self.emit_all(&trace_id, generation, events);
            }
            WorkerCommand::EndStream {
                trace_id,
                generation,
            } => {
                if let Some(mut context) = self.take_context(&trace_id, generation) {
                    let events = context.decoder.finish();
                    self.emit_all(&trace_id, generation, events);
                    self.emit(&trace_id, generation, StreamEvent::End);
                }
            }
            WorkerCommand::FailStream {
                trace_id,
                generation,
                error,
            } => {
                if self.take_context(&trace_id, generation).is_some() {
                    self.emit(&trace_id, generation, StreamEvent::Error(error));
                }
            }
            WorkerCommand::CancelStream { trace_id } => {
                if let Some(context) = self.contexts.remove(&trace_id) {
                    tracing::trace!(
                        trace_id = %trace_id,
                        phase = ?context.phase,
                        buffered = context.decoder.buffered_len(),
                        "Stream context cancelled"
                    );
                }
            }
            WorkerCommand::CloseAll => {
                self.contexts.clear();
            }
        }
    }

    fn context_mut(&mut self, trace_id: &TraceId, generation: u64) -> Option<&mut StreamContext> {
        self.contexts
            .get_mut(trace_id)
            .filter(|context| context.generation == generation)
    }

    fn take_context(&mut self, trace_id: &TraceId, generation: u64) -> Option<StreamContext> {
        if self.context_mut(trace_id, generation).is_some() {
            self.contexts.remove(trace_id)
        } else {
            None
        }
    }

    fn emit_all(&self, trace_id: &TraceId, generation: u64, events: Vec<StreamEvent>) {
        for event in events {
            self.emit(trace_id, generation, event);
        }
    }

    fn emit(&self, trace_id: &TraceId, generation: u64, event: StreamEvent) {
        // Receiver gone means the session is shutting down
        let _ = self.events.send(WorkerEvent {
            trace_id: trace_id.clone(),
            generation,
            event,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn worker() -> (StreamWorker, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StreamWorker::new(tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn chunk(trace: &str, generation: u64, text: &str) -> WorkerCommand {
        WorkerCommand::ProcessChunk {
            trace_id: TraceId::from(trace),
            generation,
            text: text.to_string(),
        }
    }

    fn start(trace: &str, generation: u64) -> WorkerCommand {
        WorkerCommand::StartStream {
            trace_id: TraceId::from(trace),
            generation,
        }
    }

    #[test]
    fn test_stream_lifecycle() {
        let (mut worker, mut rx) = worker();

        worker.handle(start("t1", 1));
        worker.handle(chunk("t1", 1, "data: {\"hits\":[1]}\n\ndata: {\"hi"));
        worker.handle(chunk("t1", 1, "ts\":[2]}\n\n"));
        worker.handle(WorkerCommand::EndStream {
            trace_id: TraceId::from("t1"),
            generation: 1,
        });

        let events: Vec<StreamEvent> = drain(&mut rx).into_iter().map(|e| e.event).collect();
        assert_eq!(
            events,
            vec![
                StreamEvent::SearchResponseHits(json!({"hits": [1]})),
                StreamEvent::SearchResponseHits(json!({"hits": [2]})),
                StreamEvent::End,
            ]
        );
        assert_eq!(worker.active_contexts(), 0);
    }

    #[test]
    fn test_end_flushes_trailing_message() {
        let (mut worker, mut rx) = worker();

        worker.handle(start("t1", 1));
        worker.handle(chunk("t1", 1, "data: {\"percent\":100}"));
        worker.handle(WorkerCommand::EndStream {
            trace_id: TraceId::from("t1"),
            generation: 1,
        });

        let events: Vec<StreamEvent> = drain(&mut rx).into_iter().map(|e| e.event).collect();
        assert_eq!(
            events,
            vec![StreamEvent::Progress(json!({"percent": 100})), StreamEvent::End]
        );
    }

    #[test]
    fn test_interleaved_traces_isolated() {
        let (mut worker, mut rx) = worker();

        worker.handle(start("a", 1));
        worker.handle(start("b", 2));
        worker.handle(chunk("a", 1, "{\"from\":"));
        worker.handle(chunk("b", 2, "{\"from\":\"b\"}"));
        worker.handle(chunk("a", 1, "\"a\"}"));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].trace_id, TraceId::from("b"));
        assert_eq!(events[0].event.payload(), Some(&json!({"from": "b"})));
        assert_eq!(events[1].trace_id, TraceId::from("a"));
        assert_eq!(events[1].generation, 1);
    }

    #[test]
    fn test_cancelled_context_drops_messages() {
        let (mut worker, mut rx) = worker();

        worker.handle(start("t1", 1));
        worker.handle(chunk("t1", 1, "{\"partial\":"));
        worker.handle(WorkerCommand::CancelStream {
            trace_id: TraceId::from("t1"),
        });
        worker.handle(chunk("t1", 1, "1}"));
        worker.handle(WorkerCommand::EndStream {
            trace_id: TraceId::from("t1"),
            generation: 1,
        });

        assert!(drain(&mut rx).is_empty());
        // Double cancel is harmless
        worker.handle(WorkerCommand::CancelStream {
            trace_id: TraceId::from("t1"),
        });
    }

    #[test]
    fn test_stale_generation_dropped() {
        let (mut worker, mut rx) = worker();

        worker.handle(start("t1", 1));
        worker.handle(WorkerCommand::CancelStream {
            trace_id: TraceId::from("t1"),
        });
        worker.handle(start("t1", 2));
        worker.handle(chunk("t1", 1, "{\"old\":true}"));
        worker.handle(chunk("t1", 2, "{\"new\":true}"));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].generation, 2);
        assert_eq!(events[0].event.payload(), Some(&json!({"new": true})));
    }

    #[test]
    fn test_late_start_does_not_replace_newer_context() {
        let (mut worker, mut rx) = worker();

        worker.handle(start("t1", 2));
        worker.handle(chunk("t1", 2, "{\"n\":"));
        worker.handle(start("t1", 1));
        worker.handle(chunk("t1", 2, "2}"));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.payload(), Some(&json!({"n": 2})));
    }

    #[test]
    fn test_fail_stream_emits_error_once() {
        let (mut worker, mut rx) = worker();

        worker.handle(start("t1", 1));
        let fail = WorkerCommand::FailStream {
            trace_id: TraceId::from("t1"),
            generation: 1,
            error: json!({"message": "connection reset"}),
        };
        worker.handle(fail.clone());
        worker.handle(fail);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].event,
            StreamEvent::Error(json!({"message": "connection reset"}))
        );
    }

    #[test]
    fn test_close_all() {
        let (mut worker, mut rx) = worker();

        worker.handle(start("a", 1));
        worker.handle(start("b", 2));
        worker.handle(WorkerCommand::CloseAll);
        worker.handle(chunk("a", 1, "{\"x\":1}"));

        assert_eq!(worker.active_contexts(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_worker_event_wire_shape() {
        let event = WorkerEvent {
            trace_id: TraceId::from("t1"),
            generation: 3,
            event: StreamEvent::Progress(json!({"percent": 5})),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"trace_id": "t1", "type": "progress", "data": {"percent": 5}})
        );
        let end = WorkerEvent {
            trace_id: TraceId::from("t1"),
            generation: 3,
            event: StreamEvent::End,
        };
        assert_eq!(
            serde_json::to_value(&end).unwrap(),
            json!({"trace_id": "t1", "type": "end"})
        );
    }

    #[tokio::test]
    async fn test_spawned_worker() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = WorkerHandle::spawn(tx);

        assert!(handle.send(start("t1", 7)));
        assert!(handle.send(chunk("t1", 7, "{\"results\":{\"total\":1}}")));
        assert!(handle.send(WorkerCommand::EndStream {
            trace_id: TraceId::from("t1"),
            generation: 7,
        }));

        let first = rx.recv().await.unwrap();
        assert!(matches!(first.event, StreamEvent::SearchResponseMetadata(_)));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.event, StreamEvent::End);
        assert_eq!(second.generation, 7);
    }
}
