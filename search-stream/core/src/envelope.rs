//! Response Envelopes
//!
//! Handlers never see raw worker events. Every event is normalised into an
//! [`Envelope`] of the shape `{ "type": .., "content": .. }` whose content is a
//! per-kind record:
//!
//! | type                       | content                                              |
//! |----------------------------|------------------------------------------------------|
//! | `search_response_metadata` | `{ results, streaming_aggs, time_offset, trace_id }` |
//! | `search_response_hits`     | `{ results, streaming_aggs, time_offset, trace_id }` |
//! | `error`                    | `{ ...payload, trace_id }`                           |
//! | `progress`                 | `{ percent }`                                        |
//! | `end`                      | `{ end: true }`                                      |
//!
//! The converters are pure and total: malformed payloads degrade to absent
//! fields, never to a panic.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::request::TraceId;
use crate::worker::StreamEvent;

/// Envelope discriminant
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    /// Response metadata
    SearchResponseMetadata,
    /// Response hits
    SearchResponseHits,
    /// Progress update
    Progress,
    /// Failure
    Error,
    /// Normal end of stream
    End,
}

/// Uniform message handed to handlers
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Envelope {
    /// What kind of message this is
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    /// Per-kind content
    pub content: EnvelopeContent,
}

/// Per-kind envelope content
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EnvelopeContent {
    /// Hits or metadata
    Data(DataContent),
    /// Failure details
    Error(ErrorContent),
    /// Progress update
    Progress(ProgressContent),
    /// End marker
    End(EndContent),
}

/// Content of hits and metadata envelopes
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DataContent {
    /// Nested `results`, or the whole payload when there is none
    pub results: Value,
    /// Streaming aggregation state, when the server sent it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streaming_aggs: Option<Value>,
    /// Time offset window; `{}` when absent
    pub time_offset: Value,
    /// Owning trace
    pub trace_id: TraceId,
}

/// Content of error envelopes
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ErrorContent {
    /// Every field of the reported error
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    /// Owning trace
    pub trace_id: TraceId,
}

impl ErrorContent {
    /// The `message` field, if it is a string
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.fields.get("message").and_then(Value::as_str)
    }
}

/// Content of progress envelopes
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressContent {
    /// Whatever `percent` the payload carried
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<Value>,
}

/// Content of end envelopes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct EndContent {
    /// Always true
    pub end: bool,
}

impl Envelope {
    /// Data content, for hits and metadata envelopes
    #[must_use]
    pub fn as_data(&self) -> Option<&DataContent> {
        match &self.content {
            EnvelopeContent::Data(content) => Some(content),
            _ => None,
        }
    }

    /// Error content, for error envelopes
    #[must_use]
    pub fn as_error(&self) -> Option<&ErrorContent> {
        match &self.content {
            EnvelopeContent::Error(content) => Some(content),
            _ => None,
        }
    }

    /// Progress content, for progress envelopes
    #[must_use]
    pub fn as_progress(&self) -> Option<&ProgressContent> {
        match &self.content {
            EnvelopeContent::Progress(content) => Some(content),
            _ => None,
        }
    }

    /// Whether this envelope ends its trace
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EnvelopeType::Error | EnvelopeType::End)
    }
}

// ============================================================================
// Converters
// ============================================================================

/// Convert any worker event
#[must_use]
pub fn from_stream_event(trace_id: &TraceId, event: &StreamEvent) -> Envelope {
    match event {
        StreamEvent::SearchResponseMetadata(payload) => {
            data_envelope(EnvelopeType::SearchResponseMetadata, trace_id, payload)
        }
        StreamEvent::SearchResponseHits(payload) => {
            data_envelope(EnvelopeType::SearchResponseHits, trace_id, payload)
        }
        StreamEvent::Progress(payload) => progress_envelope(payload),
        StreamEvent::Error(payload) => error_envelope(trace_id, payload),
        StreamEvent::End => end_envelope(),
    }
}

/// Hits/metadata envelope
#[must_use]
pub fn data_envelope(kind: EnvelopeType, trace_id: &TraceId, payload: &Value) -> Envelope {
    let results = payload
        .get("results")
        .cloned()
        .unwrap_or_else(|| payload.clone());
    let time_offset = payload
        .get("time_offset")
        .cloned()
        .unwrap_or_else(|| Value::Object(Map::new()));

    Envelope {
        kind,
        content: EnvelopeContent::Data(DataContent {
            results,
            streaming_aggs: payload.get("streaming_aggs").cloned(),
            time_offset,
            trace_id: trace_id.clone(),
        }),
    }
}

/// Error envelope; the owning trace overrides any `trace_id` in the payload
#[must_use]
pub fn error_envelope(trace_id: &TraceId, payload: &Value) -> Envelope {
    let mut fields = match payload {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("message".to_string(), other.clone());
            map
        }
    };
    fields.remove("trace_id");

    Envelope {
        kind: EnvelopeType::Error,
        content: EnvelopeContent::Error(ErrorContent {
            fields,
            trace_id: trace_id.clone(),
        }),
    }
}

/// Progress envelope
#[must_use]
pub fn progress_envelope(payload: &Value) -> Envelope {
    Envelope {
        kind: EnvelopeType::Progress,
        content: EnvelopeContent::Progress(ProgressContent {
            percent: payload.get("percent").cloned(),
        }),
    }
}

/// End envelope
#[must_use]
pub fn end_envelope() -> Envelope {
    Envelope {
        kind: EnvelopeType::End,
        content: EnvelopeContent::End(EndContent { end: true }),
    }
}
