//! Server-side stream broker: bounded replay buffers, multi-client fan-out,
//! and resumable long-running operations.
//!
//! A [`StreamManager`] drives one generator per stream, appends every item
//! to the stream's [`EventRingBuffer`], and pushes it to all attached
//! clients. Clients reconnecting with a last-event-id get the missed
//! events replayed before any live event, or a restart signal if those
//! events were already evicted.

pub mod buffer;
pub mod capability;
pub mod entry;
pub mod manager;
pub mod operation;
pub mod pending;

pub use buffer::{EventRingBuffer, Replay};
pub use capability::Capability;
pub use entry::{
    Attachment, ClientFeed, ClientHandle, ClientId, EventGenerator, StreamEntry, StreamStatus,
};
pub use manager::{StreamManager, StreamOptions};
pub use operation::{CancelReason, OperationGuard, OperationKind, OperationRegistry};
pub use pending::PendingRequests;
