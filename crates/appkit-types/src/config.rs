//! Configuration for the stream manager and its ring buffers.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{AppKitError, Result};

/// Capacity bounds for one stream's event ring buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Maximum number of retained events.
    pub max_events: usize,
    /// Maximum total payload bytes across retained events.
    pub max_bytes: usize,
}

impl BufferConfig {
    pub fn new(max_events: usize, max_bytes: usize) -> Self {
        Self {
            max_events,
            max_bytes,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_events == 0 {
            return Err(AppKitError::InvalidConfig(
                "buffer max_events must be greater than zero".into(),
            ));
        }
        if self.max_bytes == 0 {
            return Err(AppKitError::InvalidConfig(
                "buffer max_bytes must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_events: 100,
            max_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Settings for one stream manager instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Default buffer bounds for streams started without their own.
    pub buffer: BufferConfig,
    /// Items whose serialized payload exceeds this are dropped.
    pub max_event_size: usize,
    /// How long a finished stream stays available for late replay.
    #[serde(with = "crate::duration_serde")]
    pub retention: Duration,
    /// How long a running stream with no attached clients is kept.
    #[serde(with = "crate::duration_serde")]
    pub abandonment: Duration,
    /// Period of the idle sweep.
    #[serde(with = "crate::duration_serde")]
    pub sweep_interval: Duration,
    /// Idle time after which the transport writes a heartbeat comment.
    #[serde(with = "crate::duration_serde")]
    pub heartbeat_interval: Duration,
    /// Live streams beyond this evict the least recently accessed one.
    pub max_active_streams: usize,
    /// Extra per-client channel capacity on top of the buffer size.
    pub client_channel_slack: usize,
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        self.buffer.validate()?;
        if self.max_event_size == 0 {
            return Err(AppKitError::InvalidConfig(
                "max_event_size must be greater than zero".into(),
            ));
        }
        if self.max_active_streams == 0 {
            return Err(AppKitError::InvalidConfig(
                "max_active_streams must be greater than zero".into(),
            ));
        }
        if self.sweep_interval.is_zero() || self.heartbeat_interval.is_zero() {
            return Err(AppKitError::InvalidConfig(
                "sweep and heartbeat intervals must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Capacity of the channel feeding one attached client.
    pub fn client_channel_capacity(&self, buffer: &BufferConfig) -> usize {
        buffer.max_events + self.client_channel_slack.max(1)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer: BufferConfig::default(),
            max_event_size: 1024 * 1024,
            retention: Duration::from_secs(10 * 60),
            abandonment: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(10),
            max_active_streams: 1000,
            client_channel_slack: 32,
        }
    }
}
