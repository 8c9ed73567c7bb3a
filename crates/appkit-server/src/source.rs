//! Generators the server can start on behalf of a POST request.

use std::time::Duration;

use appkit_stream::EventGenerator;
use appkit_types::{AppKitError, Result};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

/// Builds the generator for a stream started over HTTP.
pub trait StreamSource: Send + Sync {
    /// `payload` is the `payload` field of the POST body. Reject payloads
    /// the source does not understand with [`AppKitError::InvalidRequest`].
    fn open(&self, stream_id: &str, payload: Option<Value>) -> Result<EventGenerator>;
}

/// Emits `{"type":"tick","n":..,"count":..}` items at a fixed interval.
#[derive(Debug, Clone)]
pub struct TickerSource {
    pub default_count: u64,
    pub default_interval: Duration,
    pub max_count: u64,
}

impl Default for TickerSource {
    fn default() -> Self {
        Self {
            default_count: 10,
            default_interval: Duration::from_secs(1),
            max_count: 10_000,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct TickerRequest {
    count: Option<u64>,
    interval_ms: Option<u64>,
    /// Fail instead of emitting tick `fail_at`.
    fail_at: Option<u64>,
}

impl StreamSource for TickerSource {
    fn open(&self, stream_id: &str, payload: Option<Value>) -> Result<EventGenerator> {
        let request: TickerRequest = match payload {
            None | Some(Value::Null) => TickerRequest::default(),
            Some(value) => serde_json::from_value(value)
                .map_err(|e| AppKitError::InvalidRequest(format!("invalid ticker payload: {e}")))?,
        };

        let count = request.count.unwrap_or(self.default_count);
        if count > self.max_count {
            return Err(AppKitError::InvalidRequest(format!(
                "count {count} exceeds the limit of {}",
                self.max_count
            )));
        }
        let interval = request
            .interval_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_interval);
        let fail_at = request.fail_at;
        tracing::debug!(%stream_id, count, interval_ms = interval.as_millis() as u64, "Opening ticker");

        let ticks = futures::stream::unfold(1u64, move |n| async move {
            if n > count {
                return None;
            }
            if n > 1 {
                tokio::time::sleep(interval).await;
            }
            if fail_at == Some(n) {
                return Some((Err(AppKitError::Internal(format!("ticker failed at {n}"))), count + 1));
            }
            Some((Ok(json!({ "type": "tick", "n": n, "count": count })), n + 1))
        });
        Ok(ticks.boxed())
    }
}
