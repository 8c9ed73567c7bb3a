//! Shared types for the AppKit streaming layer.
//!
//! This crate provides the foundational types used across the other AppKit crates:
//! - `AppKitError`: unified error taxonomy
//! - `SseErrorCode` / `SseWarningCode`: codes carried by typed SSE events
//! - `BufferedEvent` / `EventId`: one emitted stream event
//! - `StreamConfig` / `BufferConfig`: manager and ring buffer settings

pub mod config;
pub mod duration_serde;

pub use config::{BufferConfig, StreamConfig};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unified error type for all AppKit streaming subsystems.
#[derive(Debug, thiserror::Error)]
pub enum AppKitError {
    // === Registry Errors ===
    #[error("Stream '{stream_id}' not found")]
    NotFound { stream_id: String },

    #[error("Stream '{stream_id}' already exists and is still running")]
    AlreadyExists { stream_id: String },

    #[error("Stream '{stream_id}' was aborted")]
    Aborted { stream_id: String },

    #[error("Stream '{stream_id}' was evicted")]
    Evicted { stream_id: String },

    #[error("Operation '{operation_id}' is already registered")]
    DuplicateOperation { operation_id: String },

    // === Execution Errors ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Temporarily unavailable: {0}")]
    TemporarilyUnavailable(String),

    // === Client Errors ===
    #[error("SSE buffer exceeded {limit} bytes without a frame boundary")]
    BufferOverflow { size: usize, limit: usize },

    #[error("Server returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: usize, last_error: String },

    // === Configuration ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppKitError {
    /// Returns `true` if the error is transient and a reconnect may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppKitError::Connection(_)
                | AppKitError::Http { .. }
                | AppKitError::Timeout { .. }
                | AppKitError::BufferOverflow { .. }
                | AppKitError::TemporarilyUnavailable(_)
        )
    }

    /// The code reported to SSE clients when this error terminates a stream.
    pub fn sse_code(&self) -> SseErrorCode {
        match self {
            AppKitError::Aborted { .. } => SseErrorCode::StreamAborted,
            AppKitError::Evicted { .. } | AppKitError::NotFound { .. } => {
                SseErrorCode::StreamEvicted
            }
            AppKitError::InvalidRequest(_)
            | AppKitError::AlreadyExists { .. }
            | AppKitError::DuplicateOperation { .. } => SseErrorCode::InvalidRequest,
            AppKitError::Timeout { .. } => SseErrorCode::Timeout,
            AppKitError::TemporarilyUnavailable(_) => SseErrorCode::TemporaryUnavailable,
            _ => SseErrorCode::InternalError,
        }
    }

    /// Maps the error to an HTTP status code for non-streaming responses.
    pub fn http_status(&self) -> u16 {
        match self {
            AppKitError::NotFound { .. } => 404,
            AppKitError::AlreadyExists { .. } | AppKitError::DuplicateOperation { .. } => 409,
            AppKitError::InvalidRequest(_) | AppKitError::Json(_) => 400,
            AppKitError::Timeout { .. } => 504,
            AppKitError::TemporarilyUnavailable(_) => 503,
            _ => 500,
        }
    }

    /// Payload for an SSE `error` event describing this error.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            error: self.to_string(),
            code: self.sse_code(),
        }
    }
}

/// A convenience alias for `Result<T, AppKitError>`.
pub type Result<T> = std::result::Result<T, AppKitError>;

// ---------------------------------------------------------------------------
// SSE error / warning codes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SseErrorCode {
    TemporaryUnavailable,
    Timeout,
    InternalError,
    InvalidRequest,
    StreamAborted,
    StreamEvicted,
}

impl SseErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SseErrorCode::TemporaryUnavailable => "TEMPORARY_UNAVAILABLE",
            SseErrorCode::Timeout => "TIMEOUT",
            SseErrorCode::InternalError => "INTERNAL_ERROR",
            SseErrorCode::InvalidRequest => "INVALID_REQUEST",
            SseErrorCode::StreamAborted => "STREAM_ABORTED",
            SseErrorCode::StreamEvicted => "STREAM_EVICTED",
        }
    }

    /// Terminal codes end a stream for good; a client must not reconnect.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            SseErrorCode::TemporaryUnavailable | SseErrorCode::Timeout
        )
    }
}

impl fmt::Display for SseErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SseWarningCode {
    BufferOverflowRestart,
}

/// Body of an SSE `error` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
    pub code: SseErrorCode,
}

impl ErrorPayload {
    pub fn new(error: impl Into<String>, code: SseErrorCode) -> Self {
        Self {
            error: error.into(),
            code,
        }
    }
}

/// Body of an SSE `warning` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningPayload {
    pub code: SseWarningCode,
}

// ---------------------------------------------------------------------------
// EventId / BufferedEvent
// ---------------------------------------------------------------------------

pub const EVENT_MESSAGE: &str = "message";
pub const EVENT_COMPLETE: &str = "complete";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_WARNING: &str = "warning";

/// Per-stream monotonic event id. Rendered on the wire as a decimal string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EventId(pub u64);

impl EventId {
    pub fn next(self) -> EventId {
        EventId(self.0 + 1)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventId {
    type Err = AppKitError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u64>()
            .map(EventId)
            .map_err(|_| AppKitError::InvalidRequest(format!("invalid event id '{s}'")))
    }
}

impl Serialize for EventId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One event emitted by a stream. Immutable once appended to a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedEvent {
    pub id: EventId,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl BufferedEvent {
    pub fn new(id: EventId, event_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            id,
            event_type: event_type.into(),
            data: data.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Terminal event pushed after a generator finishes normally.
    pub fn complete(id: EventId) -> Self {
        Self::new(id, EVENT_COMPLETE, "{}")
    }

    /// Terminal event carrying an error payload.
    pub fn error(id: EventId, payload: &ErrorPayload) -> Self {
        let data = serde_json::to_string(payload)
            .unwrap_or_else(|_| format!(r#"{{"error":"internal","code":"{}"}}"#, payload.code));
        Self::new(id, EVENT_ERROR, data)
    }

    /// Size counted against a buffer's byte capacity.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type == EVENT_COMPLETE || self.event_type == EVENT_ERROR
    }

    /// Decode the payload of an `error` event.
    pub fn error_payload(&self) -> Option<ErrorPayload> {
        if self.event_type != EVENT_ERROR {
            return None;
        }
        serde_json::from_str(&self.data).ok()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
