//! Registry of running streams: start, attach, detach, abort, and sweep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use appkit_types::{AppKitError, BufferConfig, Result, StreamConfig};
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::entry::{
    drive, Attachment, ClientFeed, ClientHandle, ClientId, StreamEntry, StreamStatus,
};

/// Per-stream options for [`StreamManager::start_stream`].
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Caller-chosen id; a UUID is generated when absent.
    pub stream_id: Option<String>,
    /// Overrides the manager's default buffer bounds.
    pub buffer: Option<BufferConfig>,
    /// Abort the stream when its last client detaches.
    pub single_consumer: bool,
}

impl StreamOptions {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            stream_id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn buffer(mut self, buffer: BufferConfig) -> Self {
        self.buffer = Some(buffer);
        self
    }

    pub fn single_consumer(mut self) -> Self {
        self.single_consumer = true;
        self
    }
}

pub struct StreamManager {
    config: StreamConfig,
    streams: Mutex<HashMap<String, Arc<StreamEntry>>>,
    shutdown: CancellationToken,
}

impl StreamManager {
    pub fn new(config: StreamConfig) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            streams: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<StreamEntry>>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    fn entry(&self, stream_id: &str) -> Result<Arc<StreamEntry>> {
        self.lock()
            .get(stream_id)
            .cloned()
            .ok_or_else(|| AppKitError::NotFound {
                stream_id: stream_id.to_string(),
            })
    }

    /// Start driving `generator` as a new stream. Returns the stream id.
    ///
    /// A finished stream with the same id is replaced; a running one is an
    /// `AlreadyExists` error.
    pub fn start_stream<S>(&self, options: StreamOptions, generator: S) -> Result<String>
    where
        S: Stream<Item = Result<Value>> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(AppKitError::TemporarilyUnavailable(
                "stream manager is shut down".into(),
            ));
        }

        let stream_id = options
            .stream_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let buffer = options.buffer.unwrap_or(self.config.buffer);
        let entry = StreamEntry::new(stream_id.clone(), buffer, options.single_consumer)?;

        let mut evicted = Vec::new();
        {
            let mut streams = self.lock();
            if let Some(existing) = streams.get(&stream_id) {
                if !existing.status().is_terminal() {
                    return Err(AppKitError::AlreadyExists { stream_id });
                }
                streams.remove(&stream_id);
            }

            while streams.len() >= self.config.max_active_streams {
                let Some(oldest) = streams
                    .values()
                    .min_by_key(|e| e.last_access())
                    .map(|e| e.id().to_string())
                else {
                    break;
                };
                if let Some(entry) = streams.remove(&oldest) {
                    evicted.push(entry);
                }
            }

            streams.insert(stream_id.clone(), entry.clone());
        }

        for old in evicted {
            tracing::warn!(stream_id = %old.id(), "Active stream limit reached, evicting");
            old.evict();
        }

        tokio::spawn(drive(entry, generator.boxed(), self.config.max_event_size));
        tracing::info!(
            %stream_id,
            max_events = buffer.max_events,
            single_consumer = options.single_consumer,
            "Stream started"
        );
        Ok(stream_id)
    }

    /// A feed sized for `stream_id`'s buffer, so a full replay always fits.
    pub fn client_channel(&self, stream_id: &str) -> (ClientHandle, ClientFeed) {
        let buffer = self
            .lock()
            .get(stream_id)
            .map(|e| e.buffer_config())
            .unwrap_or(self.config.buffer);
        ClientHandle::channel(self.config.client_channel_capacity(&buffer))
    }

    /// Replay events after `last_event_id` into the client's feed, then
    /// register it for live events.
    pub fn attach_client(
        &self,
        stream_id: &str,
        client: ClientHandle,
        last_event_id: Option<&str>,
    ) -> Result<Attachment> {
        let entry = self.entry(stream_id)?;
        Ok(entry.attach(client, last_event_id))
    }

    /// Detach a client. Returns the number of clients still attached.
    ///
    /// The generator keeps running unless the stream was started with
    /// [`StreamOptions::single_consumer`] and this was its last client.
    pub fn detach_client(&self, stream_id: &str, client: ClientId) -> Result<usize> {
        let entry = self.entry(stream_id)?;
        let remaining = entry.detach(client);
        if remaining == 0 && entry.is_single_consumer() && entry.abort() {
            tracing::info!(%stream_id, "Last consumer left, stream aborted");
        }
        Ok(remaining)
    }

    /// Refresh a stream's last access time. Returns `false` for unknown ids.
    ///
    /// Connected clients call this periodically so a watched stream whose
    /// generator is quiet does not look idle to LRU eviction.
    pub fn touch(&self, stream_id: &str) -> bool {
        match self.lock().get(stream_id) {
            Some(entry) => {
                entry.touch();
                true
            }
            None => false,
        }
    }

    /// Cancel a stream. Attached clients receive a `STREAM_ABORTED` error event.
    pub fn abort_stream(&self, stream_id: &str) -> Result<()> {
        let entry = self.entry(stream_id)?;
        if !entry.abort() {
            tracing::debug!(%stream_id, status = ?entry.status(), "Abort on finished stream ignored");
        }
        Ok(())
    }

    /// Evict finished streams past the retention window and running
    /// streams without clients past the abandonment window.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let removed: Vec<Arc<StreamEntry>> = {
            let mut streams = self.lock();
            let expired: Vec<String> = streams
                .values()
                .filter(|entry| {
                    let idle = now.saturating_duration_since(entry.last_access());
                    if entry.status().is_terminal() {
                        idle > self.config.retention
                    } else {
                        entry.client_count() == 0 && idle > self.config.abandonment
                    }
                })
                .map(|entry| entry.id().to_string())
                .collect();
            expired
                .iter()
                .filter_map(|id| streams.remove(id))
                .collect()
        };

        for entry in &removed {
            tracing::debug!(stream_id = %entry.id(), status = ?entry.status(), "Sweeping idle stream");
            entry.evict();
        }
        removed.len()
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        let evicted = manager.sweep();
                        if evicted > 0 {
                            tracing::info!(evicted, remaining = manager.len(), "Idle sweep");
                        }
                    }
                }
            }
        })
    }

    pub fn status(&self, stream_id: &str) -> Option<StreamStatus> {
        self.lock().get(stream_id).map(|e| e.status())
    }

    pub fn client_count(&self, stream_id: &str) -> Option<usize> {
        self.lock().get(stream_id).map(|e| e.client_count())
    }

    pub fn stream_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Abort every stream, stop the sweeper, and clear the registry.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let drained: Vec<Arc<StreamEntry>> = self.lock().drain().map(|(_, e)| e).collect();
        for entry in &drained {
            entry.abort();
        }
        tracing::info!(streams = drained.len(), "Stream manager shut down");
    }
}
