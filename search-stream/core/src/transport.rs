//! HTTP Transport
//!
//! The connection manager talks to the network only through the
//! [`HttpTransport`] trait, so the streaming pipeline can run against a real
//! server ([`ReqwestTransport`]) or a scripted one in tests.
//!
//! A transport opens one streaming POST and hands back the response body as a
//! stream of byte chunks. Chunk boundaries are arbitrary; reassembly into
//! messages happens in the worker.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Url;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::StreamConfig;
use crate::request::RequestError;

/// Response body as a stream of raw chunks
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while opening or reading a stream
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request was cancelled by its owner
    #[error("request aborted")]
    Aborted,

    /// The server answered with a non-success status
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Raw response body
        body: String,
    },

    /// Network, DNS, TLS, or body read failure
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The request could not be built
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RequestError),

    /// A header value could not be encoded
    #[error("invalid header value for {0}")]
    InvalidHeader(&'static str),
}

impl TransportError {
    /// Whether this error is the expected result of a cancellation
    #[must_use]
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// JSON payload handed to error handlers
    ///
    /// Status errors carry the server's JSON error body (object fields are
    /// kept as-is) plus `status`; everything else becomes `{ "message": .. }`.
    #[must_use]
    pub fn to_payload(&self) -> Value {
        match self {
            Self::Status { status, body } => {
                let mut payload = match serde_json::from_str::<Value>(body) {
                    Ok(Value::Object(map)) => map,
                    _ => {
                        let mut map = Map::new();
                        map.insert("message".to_string(), Value::String(body.clone()));
                        map
                    }
                };
                payload
                    .entry("status")
                    .or_insert_with(|| Value::from(*status));
                Value::Object(payload)
            }
            other => {
                let mut map = Map::new();
                map.insert("message".to_string(), Value::String(other.to_string()));
                Value::Object(map)
            }
        }
    }
}

// ============================================================================
// Transport Trait
// ============================================================================

/// One outbound streaming POST
#[derive(Clone, Debug)]
pub struct StreamRequest {
    /// Fully built endpoint URL
    pub url: Url,
    /// `traceparent` header value
    pub traceparent: String,
    /// JSON query body
    pub body: Value,
}

/// Opens streaming HTTP requests
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send `request` and return its body stream
    ///
    /// Implementations must resolve to [`TransportError::Aborted`] once
    /// `cancel` fires, and must return [`TransportError::Status`] (with the
    /// error body read) for non-success responses.
    async fn open_stream(
        &self,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> Result<ByteStream, TransportError>;
}

// ============================================================================
// reqwest Implementation
// ============================================================================

/// [`HttpTransport`] backed by a cookie-retaining `reqwest::Client`
#[derive(Clone)]
pub struct ReqwestTransport {
    http_client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a client from the configuration
    ///
    /// # Errors
    ///
    /// Fails if the authorization value is not a valid header or the TLS
    /// backend cannot be initialised.
    pub fn new(config: &StreamConfig) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        if let Some(ref auth) = config.authorization {
            let mut value = HeaderValue::from_str(auth)
                .map_err(|_| TransportError::InvalidHeader("authorization"))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let http_client = reqwest::Client::builder()
            .cookie_store(true)
            .connect_timeout(config.connect_timeout())
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()?;

        Ok(Self { http_client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn open_stream(
        &self,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> Result<ByteStream, TransportError> {
        let pending = self
            .http_client
            .post(request.url)
            .header("traceparent", request.traceparent)
            .json(&request.body)
            .send();

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(TransportError::Aborted),
            response = pending => response?,
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(TransportError::Aborted),
                body = response.text() => body.unwrap_or_default(),
            };
            return Err(TransportError::Status { status, body });
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from));
        Ok(Box::pin(stream))
    }
}
