use std::sync::Arc;

use bytes::Bytes;
use sentry::{Hub, SentryFutureExt};
use tokio::sync::{mpsc, oneshot};

use super::CacheStore;
use crate::metric;

/// Message to send store writes across the [`PersistQueue::queue_tx`].
#[derive(Debug)]
struct PersistMessage {
    /// The path the document belongs to.
    path: String,
    /// The document.
    data: Bytes,
    /// A channel to notify completion of storage.
    done_tx: oneshot::Sender<()>,
}

/// Writes documents into a [`CacheStore`] in the background.
#[derive(Debug, Clone)]
pub struct PersistQueue {
    store: Arc<dyn CacheStore>,
    queue_tx: mpsc::Sender<PersistMessage>,
}

impl PersistQueue {
    /// Creates the queue and spawns its worker on the current runtime.
    pub fn new(
        store: Arc<dyn CacheStore>,
        max_queue_size: usize,
        max_concurrent_persists: usize,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(max_queue_size.max(1));
        tokio::spawn(
            Self::persist_worker(queue_rx, store.clone(), max_concurrent_persists.max(1))
                .bind_hub(Hub::new_from_top(Hub::current())),
        );
        Self { store, queue_tx }
    }

    /// The store documents are written to.
    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Long running task managing concurrent writes to the store.
    async fn persist_worker(
        mut work_rx: mpsc::Receiver<PersistMessage>,
        store: Arc<dyn CacheStore>,
        max_concurrent_persists: usize,
    ) {
        let (done_tx, mut done_rx) = mpsc::channel::<()>(max_concurrent_persists);
        let mut persists_counter = max_concurrent_persists;
        loop {
            tokio::select! {
                Some(message) = work_rx.recv(), if persists_counter > 0 => {
                    persists_counter -= 1;
                    tokio::spawn(
                        Self::single_persist(done_tx.clone(), store.clone(), message)
                            .bind_hub(Hub::new_from_top(Hub::current()))
                    );
                    let persists_in_flight = (max_concurrent_persists - persists_counter) as u64;
                    metric!(gauge("store.persists_in_flight") = persists_in_flight);
                }
                Some(_) = done_rx.recv() => {
                    persists_counter += 1;
                }
                else => break,
            }
        }
        tracing::info!("Store persist worker terminated");
    }

    /// Does a single write to the store.
    ///
    /// Handles metrics and error reporting.
    async fn single_persist(
        done_tx: mpsc::Sender<()>,
        store: Arc<dyn CacheStore>,
        message: PersistMessage,
    ) {
        let PersistMessage {
            path,
            data,
            done_tx: complete_tx,
        } = message;

        let bytes = data.len() as u64;
        match store.set(&path, data).await {
            Ok(()) => {
                metric!(
                    counter("store.persist") += 1,
                    "store" => store.name(),
                    "status" => "ok",
                );
                metric!(histogram("store.persist.size") = bytes, "store" => store.name());
            }
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    path = %path,
                    "Error storing document in {} store",
                    store.name(),
                );
                metric!(
                    counter("store.persist") += 1,
                    "store" => store.name(),
                    "status" => "error",
                );
            }
        }

        // Tell the worker we're done.
        done_tx.send(()).await.unwrap_or_else(|err| {
            let stderr: &dyn std::error::Error = &err;
            tracing::error!(stderr, "Store single_persist failed to send done message");
        });

        // Tell the original submitter we're done, if they dropped this we don't care.
        complete_tx.send(()).ok();
    }

    /// Writes `data` for `path` into the store, in the background.
    ///
    /// Errors are transparently hidden, this queue handles any errors itself.
    ///
    /// # Return
    ///
    /// A [`oneshot::Receiver`] is returned which will receive a value once the document has
    /// been written. When the queue is full the document is dropped without being written, in
    /// which case the corresponding [`oneshot::Sender`] is dropped and awaiting the receiver
    /// resolves into an [`Err`].
    ///
    /// The receiver can safely be ignored, it mostly exists to enable testing.
    pub fn persist(&self, path: &str, data: Bytes) -> oneshot::Receiver<()> {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        metric!(gauge("store.persist_queue_capacity") = self.queue_tx.capacity() as u64);
        self.queue_tx
            .try_send(PersistMessage {
                path: path.to_owned(),
                data,
                done_tx,
            })
            .unwrap_or_else(|_| {
                metric!(counter("store.persist.dropped") += 1);
                tracing::error!(path, "Store persist queue full");
            });
        done_rx
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot::error::TryRecvError;

    use super::*;
    use crate::store::MemoryStore;
    use crate::test::{BrokenStore, StalledStore};

    #[tokio::test]
    async fn test_persist() {
        let queue = PersistQueue::new(Arc::new(MemoryStore::new()), 10, 2);

        let done = queue.persist("/a", Bytes::from_static(b"{}"));
        done.await.unwrap();

        let stored = queue.store().get("/a").await.unwrap();
        assert_eq!(stored.unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_many_persists() {
        let queue = PersistQueue::new(Arc::new(MemoryStore::new()), 100, 2);

        let done: Vec<_> = (0..20)
            .map(|i| queue.persist(&format!("/{i}"), Bytes::from(i.to_string())))
            .collect();
        for done in done {
            done.await.unwrap();
        }

        for i in 0..20 {
            let stored = queue.store().get(&format!("/{i}")).await.unwrap();
            assert_eq!(stored.unwrap(), i.to_string().as_str());
        }
    }

    #[tokio::test]
    async fn test_failed_persist_completes() {
        let queue = PersistQueue::new(Arc::new(BrokenStore), 10, 2);

        // a broken store is logged, the write still counts as done
        let done = queue.persist("/a", Bytes::from_static(b"{}"));
        done.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_drops_writes() {
        let queue = PersistQueue::new(Arc::new(StalledStore), 2, 1);

        // the worker takes the first write off the queue, which then never finishes
        let mut stalled = queue.persist("/0", Bytes::from_static(b"{}"));
        while queue.queue_tx.capacity() < 2 {
            tokio::task::yield_now().await;
        }

        let mut done: Vec<_> = (1..10)
            .map(|i| queue.persist(&format!("/{i}"), Bytes::from_static(b"{}")))
            .collect();

        let dropped = done
            .iter_mut()
            .map(|done| done.try_recv())
            .filter(|result| matches!(result, Err(TryRecvError::Closed)))
            .count();
        assert_eq!(dropped, 7);

        // the accepted writes are waiting, not dropped
        assert!(matches!(stalled.try_recv(), Err(TryRecvError::Empty)));
        for done in &mut done[..2] {
            assert!(matches!(done.try_recv(), Err(TryRecvError::Empty)));
        }
    }
}
