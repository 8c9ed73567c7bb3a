//! One long-running stream: its buffer, attached clients, and driving loop.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use appkit_types::{
    AppKitError, BufferConfig, BufferedEvent, ErrorPayload, Result, SseErrorCode,
    EVENT_COMPLETE, EVENT_ERROR, EVENT_MESSAGE, EVENT_WARNING,
};
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::buffer::{EventRingBuffer, Replay};

/// The generator behind a stream. Each item becomes one event.
pub type EventGenerator = BoxStream<'static, Result<Value>>;

// ---------------------------------------------------------------------------
// Clients
// ---------------------------------------------------------------------------

pub type ClientId = u64;

/// Receiving end of a client's event feed. Ends when the stream finishes
/// or the client is detached.
pub type ClientFeed = mpsc::Receiver<Arc<BufferedEvent>>;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Sending half of one client connection's feed.
///
/// Attaching moves the handle into the stream, so the feed closes as soon
/// as the stream lets go of it.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    tx: mpsc::Sender<Arc<BufferedEvent>>,
}

impl ClientHandle {
    pub fn channel(capacity: usize) -> (ClientHandle, ClientFeed) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        (ClientHandle { id, tx }, rx)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }
}

/// What a client got when it attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Attachment {
    /// Buffered events queued before any live event.
    pub replayed: usize,
    /// The resume point was not available; the replay started from scratch.
    pub restart_required: bool,
    /// The client is registered for live events. `false` once the stream
    /// has finished: the feed ends after the replay.
    pub live: bool,
    /// The same client was already attached; nothing was queued.
    pub already_attached: bool,
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Created,
    Running,
    Completed,
    Failed,
    Aborted,
    Evicted,
}

impl StreamStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamStatus::Created | StreamStatus::Running)
    }
}

// ---------------------------------------------------------------------------
// StreamEntry
// ---------------------------------------------------------------------------

pub struct StreamEntry {
    id: String,
    single_consumer: bool,
    cancel: CancellationToken,
    state: Mutex<EntryState>,
}

struct EntryState {
    buffer: EventRingBuffer,
    clients: HashMap<ClientId, mpsc::Sender<Arc<BufferedEvent>>>,
    status: StreamStatus,
    last_access: Instant,
}

impl StreamEntry {
    pub(crate) fn new(id: String, buffer: BufferConfig, single_consumer: bool) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            id,
            single_consumer,
            cancel: CancellationToken::new(),
            state: Mutex::new(EntryState {
                buffer: EventRingBuffer::new(buffer)?,
                clients: HashMap::new(),
                status: StreamStatus::Created,
                last_access: Instant::now(),
            }),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> StreamStatus {
        self.lock().status
    }

    pub fn last_access(&self) -> Instant {
        self.lock().last_access
    }

    /// Mark the stream as in use without emitting anything.
    pub fn touch(&self) {
        self.lock().last_access = Instant::now();
    }

    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    pub fn is_single_consumer(&self) -> bool {
        self.single_consumer
    }

    pub fn buffer_config(&self) -> BufferConfig {
        *self.lock().buffer.config()
    }

    /// Snapshot of the retained events.
    pub fn buffered(&self) -> Vec<Arc<BufferedEvent>> {
        match self.lock().buffer.events_since(None) {
            Replay::Events(events) => events,
            Replay::Gap => Vec::new(),
        }
    }

    fn mark_running(&self) {
        let mut state = self.lock();
        if state.status == StreamStatus::Created {
            state.status = StreamStatus::Running;
        }
    }

    /// Append one generator item and push it to every attached client.
    /// Returns `false` once the stream is terminal.
    fn publish(&self, value: &Value, max_event_size: usize) -> bool {
        let data = match serde_json::to_string(value) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(stream_id = %self.id, error = %e, "Dropping unserializable item");
                return true;
            }
        };
        if data.len() > max_event_size {
            tracing::warn!(
                stream_id = %self.id,
                size = data.len(),
                limit = max_event_size,
                "Dropping oversized event"
            );
            return true;
        }

        let event_type = match value.get("type").and_then(Value::as_str) {
            // Terminal and transport types are reserved.
            Some(EVENT_COMPLETE | EVENT_ERROR | EVENT_WARNING) | None => EVENT_MESSAGE,
            Some(other) if other.is_empty() || other.contains(['\r', '\n']) => EVENT_MESSAGE,
            Some(other) => other,
        };

        let mut state = self.lock();
        if state.status.is_terminal() {
            return false;
        }
        let event = state.buffer.push(event_type, data);
        state.last_access = Instant::now();
        fan_out(&self.id, &mut state.clients, &event);
        true
    }

    /// Move to a terminal state, push the terminal event, and release all
    /// client feeds. Returns `false` if the stream had already finished.
    fn finish(&self, status: StreamStatus, error: Option<ErrorPayload>) -> bool {
        let mut state = self.lock();
        if state.status.is_terminal() {
            return false;
        }

        let id = state.buffer.next_id();
        let event = state.buffer.append(match &error {
            Some(payload) => BufferedEvent::error(id, payload),
            None => BufferedEvent::complete(id),
        });
        state.status = status;
        state.last_access = Instant::now();
        fan_out(&self.id, &mut state.clients, &event);
        // Dropping the senders ends every feed after the terminal event.
        state.clients.clear();
        drop(state);

        self.cancel.cancel();
        match &error {
            Some(payload) => tracing::info!(
                stream_id = %self.id,
                ?status,
                code = %payload.code,
                "Stream finished with error"
            ),
            None => tracing::info!(stream_id = %self.id, "Stream completed"),
        }
        true
    }

    pub(crate) fn abort(&self) -> bool {
        let payload = AppKitError::Aborted {
            stream_id: self.id.clone(),
        }
        .to_payload();
        self.finish(StreamStatus::Aborted, Some(payload))
    }

    pub(crate) fn evict(&self) {
        let payload = AppKitError::Evicted {
            stream_id: self.id.clone(),
        }
        .to_payload();
        if !self.finish(StreamStatus::Evicted, Some(payload)) {
            self.lock().clients.clear();
            self.cancel.cancel();
        }
    }

    /// Queue the replay for `client` and register it for live events.
    ///
    /// Both happen under the entry lock, so no live event can overtake the
    /// replay.
    pub(crate) fn attach(&self, client: ClientHandle, last_event_id: Option<&str>) -> Attachment {
        let mut state = self.lock();
        state.last_access = Instant::now();

        if state.clients.contains_key(&client.id) {
            return Attachment {
                live: true,
                already_attached: true,
                ..Attachment::default()
            };
        }

        let (events, restart_required) = match state.buffer.events_since_raw(last_event_id) {
            Replay::Events(events) => (events, false),
            Replay::Gap => {
                tracing::warn!(
                    stream_id = %self.id,
                    last_event_id = last_event_id.unwrap_or_default(),
                    oldest = ?state.buffer.oldest_id(),
                    "Resume point not buffered, restarting client"
                );
                match state.buffer.events_since(None) {
                    Replay::Events(events) => (events, true),
                    Replay::Gap => (Vec::new(), true),
                }
            }
        };

        let mut replayed = 0;
        for event in events {
            if client.tx.try_send(event).is_err() {
                tracing::warn!(
                    stream_id = %self.id,
                    client = client.id,
                    replayed,
                    "Client feed too small for replay"
                );
                return Attachment {
                    replayed,
                    restart_required,
                    ..Attachment::default()
                };
            }
            replayed += 1;
        }

        let live = !state.status.is_terminal();
        let client_id = client.id;
        if live {
            state.clients.insert(client.id, client.tx);
        }
        tracing::debug!(
            stream_id = %self.id,
            client = client_id,
            replayed,
            restart_required,
            live,
            "Client attached"
        );

        Attachment {
            replayed,
            restart_required,
            live,
            already_attached: false,
        }
    }

    /// Remove a client. Returns how many clients remain.
    pub(crate) fn detach(&self, client: ClientId) -> usize {
        let mut state = self.lock();
        if state.clients.remove(&client).is_some() {
            tracing::debug!(stream_id = %self.id, client, "Client detached");
        }
        state.clients.len()
    }
}

fn fan_out(
    stream_id: &str,
    clients: &mut HashMap<ClientId, mpsc::Sender<Arc<BufferedEvent>>>,
    event: &Arc<BufferedEvent>,
) {
    clients.retain(|client, tx| match tx.try_send(event.clone()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::warn!(%stream_id, client, "Client lagging, detaching");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    });
}

/// Drive `generator` until it ends, fails, or the entry is cancelled.
pub(crate) async fn drive(entry: Arc<StreamEntry>, mut generator: EventGenerator, max_event_size: usize) {
    entry.mark_running();
    tracing::debug!(stream_id = %entry.id, "Stream running");

    loop {
        let next = tokio::select! {
            biased;
            _ = entry.cancel.cancelled() => break,
            next = AssertUnwindSafe(generator.next()).catch_unwind() => next,
        };

        match next {
            Ok(Some(Ok(value))) => {
                if !entry.publish(&value, max_event_size) {
                    break;
                }
            }
            Ok(Some(Err(err))) => {
                tracing::error!(stream_id = %entry.id, error = %err, "Generator failed");
                entry.finish(
                    StreamStatus::Failed,
                    Some(ErrorPayload::new(err.to_string(), SseErrorCode::InternalError)),
                );
                break;
            }
            Ok(None) => {
                entry.finish(StreamStatus::Completed, None);
                break;
            }
            Err(_) => {
                tracing::error!(stream_id = %entry.id, "Generator panicked");
                entry.finish(
                    StreamStatus::Failed,
                    Some(ErrorPayload::new("generator panicked", SseErrorCode::InternalError)),
                );
                break;
            }
        }
    }

    // Cancelled through the token alone, e.g. manager shutdown.
    entry.abort();
}
