//! Query Request Descriptors
//!
//! A [`QueryRequest`] is the immutable snapshot of everything needed to open one
//! streaming search: the trace identifier that correlates the HTTP request,
//! parser messages, and handler dispatch, plus the organization, query kind,
//! page hints, and the JSON query body.
//!
//! # Endpoint
//!
//! ```text
//! POST {base}/api/{org_id}/_search_stream?type=logs&search_type=ui&use_cache=true
//! POST {base}/api/{org_id}/_values_stream?...          (values queries)
//! traceparent: 00-{trace_id}-{span_id}-01
//! ```

use std::fmt;

use rand::RngCore;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors building the outbound request
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    /// The configured base URL could not be parsed
    #[error("invalid base URL '{url}': {reason}")]
    InvalidBaseUrl {
        /// The offending URL
        url: String,
        /// Parser message
        reason: String,
    },

    /// The base URL cannot carry a path (e.g. `mailto:`)
    #[error("base URL '{0}' cannot be used as an API root")]
    CannotBeABase(String),
}

// ============================================================================
// Identifiers
// ============================================================================

/// Caller-supplied identifier naming one logical streaming query
///
/// The same value is sent as the trace-id part of the `traceparent` header,
/// so generated identifiers are 32 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(String);

impl TraceId {
    /// Wrap an existing identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random W3C-compatible trace identifier
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Borrow the raw identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TraceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TraceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Generate a fresh 16-hex-character span identifier
#[must_use]
pub fn new_span_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Build a `traceparent` header value for a trace, with a new span each call
#[must_use]
pub fn traceparent(trace_id: &TraceId) -> String {
    format!("00-{trace_id}-{}-01", new_span_id())
}

// ============================================================================
// Request Descriptor
// ============================================================================

/// Which streaming endpoint a query targets
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    /// Regular search (`_search_stream`)
    #[default]
    Search,
    /// Field values lookup (`_values_stream`)
    Values,
}

impl QueryKind {
    /// Final path segment of the endpoint
    #[must_use]
    pub fn endpoint(self) -> &'static str {
        match self {
            Self::Search => "_search_stream",
            Self::Values => "_values_stream",
        }
    }
}

/// Optional dashboard hints forwarded as query-string parameters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryMeta {
    /// Dashboard issuing the query
    pub dashboard_id: Option<String>,
    /// Folder containing that dashboard
    pub folder_id: Option<String>,
    /// Column to order by when the query has no explicit ordering
    pub fallback_order_by_col: Option<String>,
}

/// Everything needed to open one streaming query
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Correlates request, parser messages, and handlers
    pub trace_id: TraceId,
    /// Organization identifier (first path segment after `/api`)
    pub org_id: String,
    /// Endpoint selection
    pub kind: QueryKind,
    /// Page type (`type` query parameter)
    pub page_type: String,
    /// Search type (`search_type` query parameter)
    pub search_type: String,
    /// Per-request cache override; `None` uses the session default
    pub use_cache: Option<bool>,
    /// Optional dashboard hints
    pub meta: QueryMeta,
    /// JSON body sent to the server
    pub query: serde_json::Value,
}

impl QueryRequest {
    /// Create a search request with `logs` page type and `ui` search type
    pub fn new(
        trace_id: impl Into<TraceId>,
        org_id: impl Into<String>,
        query: serde_json::Value,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            org_id: org_id.into(),
            kind: QueryKind::Search,
            page_type: "logs".to_string(),
            search_type: "ui".to_string(),
            use_cache: None,
            meta: QueryMeta::default(),
            query,
        }
    }

    /// Set the query kind
    #[must_use]
    pub fn with_kind(mut self, kind: QueryKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the page type
    #[must_use]
    pub fn with_page_type(mut self, page_type: impl Into<String>) -> Self {
        self.page_type = page_type.into();
        self
    }

    /// Set the search type
    #[must_use]
    pub fn with_search_type(mut self, search_type: impl Into<String>) -> Self {
        self.search_type = search_type.into();
        self
    }

    /// Override the cache flag for this request
    #[must_use]
    pub fn with_use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = Some(use_cache);
        self
    }

    /// Set the dashboard hints
    #[must_use]
    pub fn with_meta(mut self, meta: QueryMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Build the endpoint URL under `base_url`
    ///
    /// `default_use_cache` applies when the request carries no override.
    ///
    /// # Errors
    ///
    /// Returns an error if `base_url` is not an absolute hierarchical URL.
    pub fn stream_url(&self, base_url: &str, default_use_cache: bool) -> Result<Url, RequestError> {
        let mut url = Url::parse(base_url).map_err(|e| RequestError::InvalidBaseUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;

        url.path_segments_mut()
            .map_err(|()| RequestError::CannotBeABase(base_url.to_string()))?
            .pop_if_empty()
            .extend(["api", self.org_id.as_str(), self.kind.endpoint()]);

        {
            let use_cache = self.use_cache.unwrap_or(default_use_cache);
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("type", &self.page_type)
                .append_pair("search_type", &self.search_type)
                .append_pair("use_cache", if use_cache { "true" } else { "false" });

            if let Some(ref id) = self.meta.dashboard_id {
                pairs.append_pair("dashboard_id", id);
            }
            if let Some(ref id) = self.meta.folder_id {
                pairs.append_pair("folder_id", id);
            }
            if let Some(ref col) = self.meta.fallback_order_by_col {
                pairs.append_pair("fallback_order_by_col", col);
            }
        }

        Ok(url)
    }
}

/// Identifies a query to cancel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    /// Trace to cancel
    pub trace_id: TraceId,
    /// Organization the trace belongs to
    pub org_id: String,
}

impl CancelRequest {
    /// Create a cancel request
    pub fn new(trace_id: impl Into<TraceId>, org_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            org_id: org_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generated_ids_are_hex() {
        let trace_id = TraceId::generate();
        assert_eq!(trace_id.as_str().len(), 32);
        assert!(trace_id.as_str().chars().all(|c| c.is_ascii_hexdigit()));

        let span = new_span_id();
        assert_eq!(span.len(), 16);
        assert!(span.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_traceparent_format() {
        let trace_id = TraceId::new("4bf92f3577b34da6a3ce929d0e0e4736");
        let header = traceparent(&trace_id);
        let parts: Vec<&str> = header.split('-').collect();

        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "00");
        assert_eq!(parts[1], "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(parts[2].len(), 16);
        assert_eq!(parts[3], "01");

        // Fresh span per call
        assert_ne!(traceparent(&trace_id), header);
    }

    #[test]
    fn test_search_url() {
        let request = QueryRequest::new("abc", "default", json!({}));
        let url = request.stream_url("http://localhost:5080", true).unwrap();

        assert_eq!(
            url.as_str(),
            "http://localhost:5080/api/default/_search_stream?type=logs&search_type=ui&use_cache=true"
        );
    }

    #[test]
    fn test_values_url_with_meta() {
        let request = QueryRequest::new("abc", "acme", json!({}))
            .with_kind(QueryKind::Values)
            .with_page_type("dashboards")
            .with_search_type("dashboards")
            .with_meta(QueryMeta {
                dashboard_id: Some("d1".to_string()),
                folder_id: Some("f1".to_string()),
                fallback_order_by_col: Some("_timestamp".to_string()),
            });
        let url = request.stream_url("https://o2.example.com/", true).unwrap();

        assert_eq!(url.path(), "/api/acme/_values_stream");
        assert_eq!(
            url.query(),
            Some(
                "type=dashboards&search_type=dashboards&use_cache=true\
                 &dashboard_id=d1&folder_id=f1&fallback_order_by_col=_timestamp"
            )
        );
    }

    #[test]
    fn test_use_cache_override() {
        let request = QueryRequest::new("abc", "default", json!({}));
        let url = request.stream_url("http://localhost:5080", false).unwrap();
        assert!(url.query().unwrap().contains("use_cache=false"));

        let request = request.with_use_cache(true);
        let url = request.stream_url("http://localhost:5080", false).unwrap();
        assert!(url.query().unwrap().contains("use_cache=true"));
    }

    #[test]
    fn test_base_url_with_prefix_path() {
        let request = QueryRequest::new("abc", "default", json!({}));
        let url = request.stream_url("http://host/o2/", true).unwrap();
        assert_eq!(url.path(), "/o2/api/default/_search_stream");
    }

    #[test]
    fn test_invalid_base_url() {
        let request = QueryRequest::new("abc", "default", json!({}));
        let err = request.stream_url("not a url", true).unwrap_err();
        assert!(matches!(err, RequestError::InvalidBaseUrl { .. }));

        let err = request.stream_url("mailto:ops@example.com", true).unwrap_err();
        assert!(matches!(err, RequestError::CannotBeABase(_)));
    }
}
