//! Client side of the AppKit streaming layer.
//!
//! - `SseParser`: incremental frame decoder
//! - `BackoffPolicy`: wait between reconnect attempts
//! - `StreamClient`: resilient consumer resuming from the last seen event id

pub mod backoff;
pub mod client;
pub mod parser;

pub use backoff::BackoffPolicy;
pub use client::{ConnectOptions, ConnectSummary, Payload, StreamClient, StreamEnd};
pub use parser::{Feed, SseMessage, SseParser};

use appkit_types::Result;
use tokio_util::sync::CancellationToken;

/// Connect with a default [`StreamClient`].
pub async fn connect_sse<M, E>(
    options: ConnectOptions,
    on_message: M,
    on_error: E,
    cancel: CancellationToken,
) -> Result<ConnectSummary>
where
    M: FnMut(SseMessage) + Send,
    E: FnMut(&appkit_types::AppKitError) + Send,
{
    StreamClient::new()
        .connect(options, on_message, on_error, cancel)
        .await
}
