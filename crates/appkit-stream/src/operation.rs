//! Request-scoped cancellation and timeout tracking.
//!
//! Every in-flight query or stream request registers an operation here and
//! holds the returned [`OperationGuard`] for as long as the request lives.
//! Dropping the guard removes the operation and stops its timers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use appkit_types::{AppKitError, Result};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Query,
    Stream,
}

/// Why an operation's token was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Cancelled,
    TimedOut,
}

struct Operation {
    kind: OperationKind,
    token: CancellationToken,
    reason: Arc<Mutex<Option<CancelReason>>>,
    timeout: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl Operation {
    fn stop_timers(&mut self) {
        if let Some(handle) = self.timeout.take() {
            handle.abort();
        }
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
    }
}

#[derive(Default)]
pub struct OperationRegistry {
    operations: Mutex<HashMap<String, Operation>>,
}

impl OperationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Operation>> {
        self.operations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an operation. With a `timeout`, the operation is cancelled
    /// (reason [`CancelReason::TimedOut`]) once it elapses.
    pub fn register(
        self: &Arc<Self>,
        id: impl Into<String>,
        kind: OperationKind,
        timeout: Option<Duration>,
    ) -> Result<OperationGuard> {
        let id = id.into();
        let token = CancellationToken::new();
        let reason = Arc::new(Mutex::new(None));

        let mut operations = self.lock();
        if operations.contains_key(&id) {
            return Err(AppKitError::DuplicateOperation { operation_id: id });
        }

        let timeout = timeout.map(|after| {
            let token = token.clone();
            let reason = reason.clone();
            let op_id = id.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(after) => {
                        tracing::warn!(operation = %op_id, timeout_ms = after.as_millis() as u64, "Operation timed out");
                        set_reason(&reason, CancelReason::TimedOut);
                        token.cancel();
                    }
                }
            })
        });

        operations.insert(
            id.clone(),
            Operation {
                kind,
                token: token.clone(),
                reason: reason.clone(),
                timeout,
                heartbeat: None,
            },
        );
        tracing::debug!(operation = %id, ?kind, "Operation registered");

        Ok(OperationGuard {
            id,
            token,
            reason,
            registry: Arc::downgrade(self),
        })
    }

    /// Cancel an operation by id. Returns `false` if it is not registered.
    pub fn cancel(&self, id: &str) -> bool {
        let operations = self.lock();
        match operations.get(id) {
            Some(op) => {
                set_reason(&op.reason, CancelReason::Cancelled);
                op.token.cancel();
                tracing::info!(operation = %id, kind = ?op.kind, "Operation cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every registered operation.
    pub fn cancel_all(&self) {
        for op in self.lock().values() {
            set_reason(&op.reason, CancelReason::Cancelled);
            op.token.cancel();
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn kind(&self, id: &str) -> Option<OperationKind> {
        self.lock().get(id).map(|op| op.kind)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn attach_heartbeat(&self, id: &str, handle: JoinHandle<()>) {
        match self.lock().get_mut(id) {
            Some(op) => {
                if let Some(previous) = op.heartbeat.replace(handle) {
                    previous.abort();
                }
            }
            None => handle.abort(),
        }
    }

    fn remove(&self, id: &str) {
        if let Some(mut op) = self.lock().remove(id) {
            op.stop_timers();
            tracing::debug!(operation = %id, "Operation removed");
        }
    }
}

fn set_reason(slot: &Mutex<Option<CancelReason>>, reason: CancelReason) {
    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    slot.get_or_insert(reason);
}

/// Keeps an operation registered. Dropping it deregisters the operation.
pub struct OperationGuard {
    id: String,
    token: CancellationToken,
    reason: Arc<Mutex<Option<CancelReason>>>,
    registry: Weak<OperationRegistry>,
}

impl OperationGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token cancelled on explicit cancel or timeout.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `tick` every `period` until the operation ends. Replaces any
    /// previous heartbeat of this operation.
    pub fn start_heartbeat<F>(&self, period: Duration, mut tick: F)
    where
        F: FnMut() + Send + 'static,
    {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => tick(),
                }
            }
        });
        registry.attach_heartbeat(&self.id, handle);
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // 1. Register and drop removes the operation
    #[tokio::test]
    async fn guard_drop_removes_operation() {
        let registry = OperationRegistry::new();
        let guard = registry
            .register("op-1", OperationKind::Query, None)
            .unwrap();
        assert!(registry.contains("op-1"));
        assert_eq!(registry.kind("op-1"), Some(OperationKind::Query));
        drop(guard);
        assert!(registry.is_empty());
    }

    // 2. Duplicate ids are rejected
    #[tokio::test]
    async fn duplicate_registration_fails() {
        let registry = OperationRegistry::new();
        let _guard = registry
            .register("op-1", OperationKind::Stream, None)
            .unwrap();
        let err = registry
            .register("op-1", OperationKind::Stream, None)
            .err()
            .unwrap();
        assert!(matches!(err, AppKitError::DuplicateOperation { .. }));
    }

    // 3. Explicit cancel fires the token
    #[tokio::test]
    async fn cancel_fires_token() {
        let registry = OperationRegistry::new();
        let guard = registry
            .register("op-1", OperationKind::Stream, None)
            .unwrap();
        assert!(registry.cancel("op-1"));
        assert!(guard.is_cancelled());
        assert_eq!(guard.cancel_reason(), Some(CancelReason::Cancelled));
        assert!(!registry.cancel("missing"));
    }

    // 4. Timeout cancels with TimedOut reason
    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_operation() {
        let registry = OperationRegistry::new();
        let guard = registry
            .register("op-1", OperationKind::Query, Some(Duration::from_secs(5)))
            .unwrap();
        let token = guard.token();
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!token.is_cancelled());
        token.cancelled().await;
        assert_eq!(guard.cancel_reason(), Some(CancelReason::TimedOut));
    }

    // 5. Heartbeat ticks until the guard is dropped
    #[tokio::test(start_paused = true)]
    async fn heartbeat_stops_with_guard() {
        let registry = OperationRegistry::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let guard = registry
            .register("op-1", OperationKind::Stream, None)
            .unwrap();
        let counter = ticks.clone();
        guard.start_heartbeat(Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        drop(guard);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    // 6. cancel_all reaches every operation
    #[tokio::test]
    async fn cancel_all_cancels_everything() {
        let registry = OperationRegistry::new();
        let a = registry.register("a", OperationKind::Query, None).unwrap();
        let b = registry.register("b", OperationKind::Stream, None).unwrap();
        registry.cancel_all();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
        assert_eq!(registry.len(), 2);
    }
}
