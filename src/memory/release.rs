//! Deferred Release Module
//!
//! Routes evicted entries to a destination where their destructors run
//! without blocking cache readers.

use tokio::runtime::Handle;
use tokio::sync::mpsc;

// == Release Policy ==
/// Where destructors of evicted values run.
///
/// Evicted entries are always collected into a holder while the cache
/// mutex is held and destroyed only after it is released; the policy
/// picks the thread that performs the destruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleasePolicy {
    /// Hand batches to a dedicated serial release task (the default).
    /// Falls back to [`Inline`](ReleasePolicy::Inline) when no tokio
    /// runtime is available at cache construction.
    #[default]
    Background,
    /// Drop batches on the calling thread, after the lock is released.
    Inline,
}

// == Releaser ==
/// Owns the serial release channel for one cache.
///
/// Every batch sent here is dropped by a single worker task, so
/// destructors run in submission order and never under the cache mutex.
pub(crate) struct Releaser<T> {
    tx: Option<mpsc::UnboundedSender<T>>,
}

impl<T: Send + 'static> Releaser<T> {
    pub fn new(policy: ReleasePolicy, runtime: Option<&Handle>) -> Self {
        let tx = match (policy, runtime) {
            (ReleasePolicy::Background, Some(handle)) => {
                let (tx, mut rx) = mpsc::unbounded_channel::<T>();
                handle.spawn(async move {
                    // Drain until every sender is gone, dropping each
                    // batch as it arrives.
                    while let Some(batch) = rx.recv().await {
                        drop(batch);
                    }
                });
                Some(tx)
            }
            _ => None,
        };
        Self { tx }
    }

    /// Sends a batch to the worker, or drops it in place when the
    /// policy is inline or the worker is gone.
    pub fn release(&self, batch: T) {
        if let Some(tx) = &self.tx {
            if let Err(returned) = tx.send(batch) {
                drop(returned.0);
            }
        } else {
            drop(batch);
        }
    }
}
