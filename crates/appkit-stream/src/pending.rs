//! Pending-request map for request/response exchanges over a shared channel.
//!
//! Each registered request is settled exactly once: either a response
//! arrives through [`PendingRequests::resolve`] / [`PendingRequests::reject`],
//! or its timeout fires. Whichever removes the entry first wins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use appkit_types::{AppKitError, Result};
use tokio::sync::oneshot;

type Waiters<T> = HashMap<String, oneshot::Sender<Result<T>>>;

pub struct PendingRequests<T> {
    waiters: Arc<Mutex<Waiters<T>>>,
}

impl<T> Clone for PendingRequests<T> {
    fn clone(&self) -> Self {
        Self {
            waiters: self.waiters.clone(),
        }
    }
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self {
            waiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T: Send + 'static> PendingRequests<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Waiters<T>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `id` and wait for its response for at most `timeout`.
    ///
    /// Registration happens before this returns, so a response sent right
    /// after the call is never lost.
    pub fn register(
        &self,
        id: impl Into<String>,
        timeout: Duration,
    ) -> Result<impl std::future::Future<Output = Result<T>> + Send + 'static> {
        let id = id.into();
        let (tx, mut rx) = oneshot::channel();
        {
            let mut waiters = self.lock();
            if waiters.contains_key(&id) {
                return Err(AppKitError::DuplicateOperation { operation_id: id });
            }
            waiters.insert(id.clone(), tx);
        }

        let waiters = self.waiters.clone();
        Ok(async move {
            match tokio::time::timeout(timeout, &mut rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(AppKitError::Internal(format!(
                    "pending request '{id}' dropped without a response"
                ))),
                Err(_) => {
                    let removed = waiters
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&id)
                        .is_some();
                    if removed {
                        tracing::warn!(request = %id, "Pending request timed out");
                        return Err(AppKitError::Timeout {
                            timeout_ms: timeout.as_millis() as u64,
                        });
                    }
                    // A response won the race after the timer fired.
                    rx.try_recv().unwrap_or_else(|_| {
                        Err(AppKitError::Timeout {
                            timeout_ms: timeout.as_millis() as u64,
                        })
                    })
                }
            }
        })
    }

    /// Deliver a response. Returns `false` if `id` is unknown or already settled.
    pub fn resolve(&self, id: &str, value: T) -> bool {
        self.settle(id, Ok(value))
    }

    /// Fail a pending request. Returns `false` if `id` is unknown or already settled.
    pub fn reject(&self, id: &str, error: AppKitError) -> bool {
        self.settle(id, Err(error))
    }

    fn settle(&self, id: &str, result: Result<T>) -> bool {
        match self.lock().remove(id) {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Reject every pending request, e.g. when the underlying connection closes.
    pub fn reject_all(&self, reason: &str) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(AppKitError::Connection(reason.to_string())));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
