//! Bounded, id-ordered event buffer used for replay on reconnect.
//!
//! Events are evicted oldest-first once either the count or byte bound
//! would be exceeded. The buffer remembers the highest evicted id so a
//! resume request that points into evicted history is reported as a
//! [`Replay::Gap`] instead of silently skipping events.

use std::collections::VecDeque;
use std::sync::Arc;

use appkit_types::{AppKitError, BufferConfig, BufferedEvent, EventId, Result};

/// Result of a resume lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replay {
    /// Every retained event after the requested id, in id order.
    Events(Vec<Arc<BufferedEvent>>),
    /// The requested id is not resumable; the consumer must restart.
    Gap,
}

impl Replay {
    pub fn is_gap(&self) -> bool {
        matches!(self, Replay::Gap)
    }
}

#[derive(Debug)]
pub struct EventRingBuffer {
    config: BufferConfig,
    events: VecDeque<Arc<BufferedEvent>>,
    bytes: usize,
    /// Highest id ever appended.
    last_id: EventId,
    /// Highest id dropped by eviction.
    evicted_through: EventId,
}

impl EventRingBuffer {
    pub fn new(config: BufferConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            events: VecDeque::with_capacity(config.max_events.min(1024)),
            bytes: 0,
            last_id: EventId(0),
            evicted_through: EventId(0),
        })
    }

    /// Id the next appended event must carry.
    pub fn next_id(&self) -> EventId {
        self.last_id.next()
    }

    /// Build an event with the next sequential id and append it.
    pub fn push(&mut self, event_type: &str, data: String) -> Arc<BufferedEvent> {
        self.append(BufferedEvent::new(self.next_id(), event_type, data))
    }

    /// Append a caller-built event and return the shared copy handed to
    /// clients. Ids that do not increase are dropped.
    pub fn append(&mut self, event: BufferedEvent) -> Arc<BufferedEvent> {
        let event = Arc::new(event);
        if event.id <= self.last_id {
            tracing::warn!(
                id = %event.id,
                last_id = %self.last_id,
                "Dropping out-of-order event"
            );
            return event;
        }

        let size = event.size();
        while let Some(oldest) = self.events.front() {
            let over_count = self.events.len() + 1 > self.config.max_events;
            let over_bytes = self.bytes + size > self.config.max_bytes;
            if !over_count && !over_bytes {
                break;
            }
            self.bytes -= oldest.size();
            self.evicted_through = oldest.id;
            self.events.pop_front();
        }

        self.last_id = event.id;
        self.bytes += size;
        self.events.push_back(event.clone());
        event
    }

    /// Events strictly after `last_id`, or the whole buffer for `None`.
    ///
    /// The returned vector is a snapshot; later appends do not affect it.
    pub fn events_since(&self, last_id: Option<EventId>) -> Replay {
        let Some(last_id) = last_id else {
            return Replay::Events(self.events.iter().cloned().collect());
        };

        // Ids newer than anything appended belong to another incarnation.
        if last_id > self.last_id || last_id < self.evicted_through {
            return Replay::Gap;
        }

        Replay::Events(
            self.events
                .iter()
                .filter(|e| e.id > last_id)
                .cloned()
                .collect(),
        )
    }

    /// Like [`events_since`](Self::events_since) but for a raw wire id.
    pub fn events_since_raw(&self, last_id: Option<&str>) -> Replay {
        match last_id.map(str::parse::<EventId>) {
            None => self.events_since(None),
            Some(Ok(id)) => self.events_since(Some(id)),
            Some(Err(AppKitError::InvalidRequest(msg))) => {
                tracing::debug!(%msg, "Unparseable resume point treated as gap");
                Replay::Gap
            }
            Some(Err(_)) => Replay::Gap,
        }
    }

    /// Lowest id still retained.
    pub fn oldest_id(&self) -> Option<EventId> {
        self.events.front().map(|e| e.id)
    }

    pub fn last_id(&self) -> EventId {
        self.last_id
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }
}
