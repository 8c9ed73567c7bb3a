//! Resilient SSE consumer.
//!
//! [`StreamClient::connect`] opens a stream, decodes frames as they arrive,
//! and on any transient failure reconnects with `Last-Event-ID` set to the
//! last id it saw, so the server resumes right after it.

use std::future::Future;
use std::time::Duration;

use appkit_types::{
    AppKitError, ErrorPayload, Result, SseErrorCode, EVENT_COMPLETE, EVENT_ERROR,
};
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffPolicy;
use crate::parser::{SseMessage, SseParser, DEFAULT_MAX_BUFFER_SIZE};

pub const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Request body. Supplying one switches the request from GET to POST.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    /// Sent verbatim with a JSON content type.
    Raw(String),
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub url: String,
    pub payload: Option<Payload>,
    /// Resume point for the first request.
    pub last_event_id: Option<String>,
    pub backoff: BackoffPolicy,
    /// Consecutive failed attempts tolerated before giving up. `None` retries forever.
    pub max_retries: Option<usize>,
    /// Longest wait for response headers or for the next body chunk.
    pub timeout: Option<Duration>,
    pub max_buffer_size: usize,
}

impl ConnectOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            payload: None,
            last_event_id: None,
            backoff: BackoffPolicy::default(),
            max_retries: None,
            timeout: None,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn last_event_id(mut self, id: impl Into<String>) -> Self {
        self.last_event_id = Some(id.into());
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.backoff = BackoffPolicy::Fixed(delay);
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_buffer_size(mut self, bytes: usize) -> Self {
        self.max_buffer_size = bytes;
        self
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEnd {
    /// The server sent `complete`.
    Completed,
    /// The server sent an `error` event with a code that will not change on retry.
    Failed(ErrorPayload),
    /// The caller's token fired.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectSummary {
    pub end: StreamEnd,
    pub last_event_id: Option<String>,
    /// Requests issued, including the first.
    pub attempts: usize,
    pub messages: usize,
}

enum AttemptEnd {
    Finished(StreamEnd),
    /// Body ended before a terminal event.
    Disconnected,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct StreamClient {
    http: reqwest::Client,
}

impl StreamClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Consume the stream at `options.url` until it finishes, the token is
    /// cancelled, or retries run out.
    ///
    /// `on_message` fires once per `data:` line. `on_error` fires for every
    /// failed attempt before the reconnect wait. Neither fires after
    /// cancellation has been observed.
    pub async fn connect<M, E>(
        &self,
        options: ConnectOptions,
        mut on_message: M,
        mut on_error: E,
        cancel: CancellationToken,
    ) -> Result<ConnectSummary>
    where
        M: FnMut(SseMessage) + Send,
        E: FnMut(&AppKitError) + Send,
    {
        let mut parser =
            SseParser::new(options.max_buffer_size).with_last_event_id(options.last_event_id.clone());
        let mut attempts = 0usize;
        let mut failures = 0usize;
        let mut messages = 0usize;

        loop {
            attempts += 1;
            let mut delivered = 0usize;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.attempt(&options, &mut parser, &mut on_message, &mut delivered, &cancel) => Some(result),
            };
            messages += delivered;

            let error = match result {
                None => return Ok(summary(StreamEnd::Cancelled, &parser, attempts, messages)),
                Some(Ok(AttemptEnd::Finished(end))) => {
                    tracing::debug!(url = %options.url, ?end, attempts, "Stream finished");
                    return Ok(summary(end, &parser, attempts, messages));
                }
                Some(Ok(AttemptEnd::Disconnected)) => {
                    AppKitError::Connection("stream closed before a terminal event".into())
                }
                Some(Err(err)) => err,
            };

            if cancel.is_cancelled() {
                return Ok(summary(StreamEnd::Cancelled, &parser, attempts, messages));
            }
            on_error(&error);
            if !error.is_retryable() {
                return Err(error);
            }

            if delivered > 0 {
                failures = 0;
            }
            failures += 1;
            if let Some(max) = options.max_retries {
                if failures > max {
                    tracing::warn!(url = %options.url, attempts, error = %error, "Giving up on stream");
                    return Err(AppKitError::RetriesExhausted {
                        attempts,
                        last_error: error.to_string(),
                    });
                }
            }

            let delay = options.backoff.delay_for_attempt(failures - 1);
            tracing::warn!(
                url = %options.url,
                attempt = attempts,
                delay_ms = %delay.as_millis(),
                last_event_id = parser.last_event_id().unwrap_or_default(),
                error = %error,
                "Stream interrupted, reconnecting"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Ok(summary(StreamEnd::Cancelled, &parser, attempts, messages));
                }
                _ = tokio::time::sleep(delay) => {}
            }
            parser.reset();
        }
    }

    async fn attempt<M>(
        &self,
        options: &ConnectOptions,
        parser: &mut SseParser,
        on_message: &mut M,
        delivered: &mut usize,
        cancel: &CancellationToken,
    ) -> Result<AttemptEnd>
    where
        M: FnMut(SseMessage) + Send,
    {
        let mut request = match &options.payload {
            None => self.http.get(&options.url),
            Some(Payload::Json(body)) => self.http.post(&options.url).json(body),
            Some(Payload::Raw(body)) => self
                .http
                .post(&options.url)
                .header(CONTENT_TYPE, "application/json")
                .body(body.clone()),
        };
        request = request.header(ACCEPT, "text/event-stream");
        if let Some(id) = parser.last_event_id() {
            request = request.header(LAST_EVENT_ID_HEADER, id);
        }

        let response = with_timeout(options.timeout, request.send())
            .await?
            .map_err(|e| AppKitError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AppKitError::Http {
                status: status.as_u16(),
                message,
            });
        }
        tracing::debug!(
            url = %options.url,
            last_event_id = parser.last_event_id().unwrap_or_default(),
            "Stream connected"
        );

        let mut body = response.bytes_stream();
        loop {
            let chunk = match with_timeout(options.timeout, body.next()).await? {
                None => return Ok(AttemptEnd::Disconnected),
                Some(Err(e)) => return Err(AppKitError::Connection(e.to_string())),
                Some(Ok(chunk)) => chunk,
            };

            let feed = parser.feed(&chunk);
            for message in feed.messages {
                if cancel.is_cancelled() {
                    return Ok(AttemptEnd::Finished(StreamEnd::Cancelled));
                }
                *delivered += 1;
                let end = terminal_outcome(&message);
                on_message(message);
                if let Some(end) = end {
                    return Ok(AttemptEnd::Finished(end));
                }
            }
            // Raised only after the frames completed before it were delivered.
            if let Some(overflow) = feed.overflow {
                return Err(overflow);
            }
        }
    }
}

async fn with_timeout<F: Future>(timeout: Option<Duration>, fut: F) -> Result<F::Output> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| AppKitError::Timeout {
                timeout_ms: limit.as_millis() as u64,
            }),
        None => Ok(fut.await),
    }
}

/// Whether `message` ends the stream for good.
fn terminal_outcome(message: &SseMessage) -> Option<StreamEnd> {
    match message.event.as_deref() {
        Some(EVENT_COMPLETE) => Some(StreamEnd::Completed),
        Some(EVENT_ERROR) => {
            let payload = serde_json::from_str::<ErrorPayload>(&message.data).unwrap_or_else(|_| {
                ErrorPayload::new(message.data.clone(), SseErrorCode::InternalError)
            });
            payload.code.is_terminal().then_some(StreamEnd::Failed(payload))
        }
        _ => None,
    }
}

fn summary(end: StreamEnd, parser: &SseParser, attempts: usize, messages: usize) -> ConnectSummary {
    ConnectSummary {
        end,
        last_event_id: parser.last_event_id().map(str::to_string),
        attempts,
        messages,
    }
}
