//! Writes a client's feed onto an HTTP response in SSE wire format.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use appkit_stream::{ClientFeed, ClientId, OperationGuard, StreamManager};
use appkit_types::{
    AppKitError, BufferedEvent, SseWarningCode, WarningPayload, EVENT_ERROR, EVENT_MESSAGE,
    EVENT_WARNING,
};
use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream::{Stream, StreamExt};
use serde::Serialize;

/// One attached HTTP client. Dropping it (the response body went away)
/// detaches the client and ends its request operation.
pub(crate) struct Subscription {
    pub(crate) manager: Arc<StreamManager>,
    pub(crate) stream_id: String,
    pub(crate) client: ClientId,
    pub(crate) live: bool,
    pub(crate) operation: OperationGuard,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.live {
            return;
        }
        // Err means the stream was swept or evicted while the connection was open.
        if let Ok(remaining) = self.manager.detach_client(&self.stream_id, self.client) {
            tracing::debug!(
                stream_id = %self.stream_id,
                client = self.client,
                operation = %self.operation.id(),
                remaining,
                "SSE connection closed"
            );
        }
    }
}

pub(crate) fn to_sse_event(event: &BufferedEvent) -> Event {
    let mut sse = Event::default().id(event.id.to_string());
    if event.event_type != EVENT_MESSAGE {
        sse = sse.event(&event.event_type);
    }
    sse.data(&event.data)
}

fn payload_event(kind: &str, payload: &impl Serialize) -> Event {
    let data = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(kind).data(data)
}

pub(crate) fn restart_warning() -> Event {
    payload_event(
        EVENT_WARNING,
        &WarningPayload {
            code: SseWarningCode::BufferOverflowRestart,
        },
    )
}

/// `prelude` goes out first, then the feed until a terminal event has been
/// written, the feed closes, or the request operation is cancelled.
pub(crate) fn client_stream(
    prelude: Vec<Event>,
    feed: ClientFeed,
    subscription: Subscription,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let cancel = subscription.operation.token();
    let live = futures::stream::unfold(
        (feed, subscription, cancel, false),
        |(mut feed, subscription, cancel, finished)| async move {
            if finished {
                return None;
            }
            // Feed first: a terminal event queued before cancellation still goes out.
            let event = tokio::select! {
                biased;
                event = feed.recv() => event,
                _ = cancel.cancelled() => None,
            }?;
            let finished = event.is_terminal();
            Some((Ok(to_sse_event(&event)), (feed, subscription, cancel, finished)))
        },
    );
    futures::stream::iter(prelude.into_iter().map(Ok)).chain(live)
}

pub(crate) fn sse_response<S>(stream: S, heartbeat: Duration) -> Response
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    let sse = Sse::new(stream).keep_alive(KeepAlive::new().interval(heartbeat).text("heartbeat"));
    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        sse,
    )
        .into_response()
}

/// Single `STREAM_EVICTED` error for a resume attempt on a stream that is gone.
pub(crate) fn evicted_response(stream_id: &str, heartbeat: Duration) -> Response {
    tracing::info!(%stream_id, "Resume requested for unknown stream");
    let payload = AppKitError::Evicted {
        stream_id: stream_id.to_string(),
    }
    .to_payload();
    let event = payload_event(EVENT_ERROR, &payload);
    sse_response(futures::stream::iter([Ok(event)]), heartbeat)
}
