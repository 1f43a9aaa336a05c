//! Messages exchanged with the keep actor.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use super::state::EntryInfo;

/// The private reply channel of a caller that asked to fetch a path.
pub type Waiter = oneshot::Sender<Fetching>;

/// Creates a waiter together with the receiving end its owner blocks on.
pub fn waiter() -> (Waiter, oneshot::Receiver<Fetching>) {
    oneshot::channel()
}

/// The answer to a [`Keep::fetching`](super::Keep::fetching) call.
#[derive(Debug)]
pub enum Fetching {
    /// Nobody else is fetching the path, the caller has to fetch it.
    ///
    /// The [`FetchLease`] reports the outcome back to the keep, it has to be held until the
    /// fetch is done.
    Lead(FetchLease),
    /// Another caller fetched the path in the meantime.
    Data(Bytes),
    /// The fetch another caller was running did not produce any data.
    Failed,
}

#[derive(Debug)]
pub(crate) enum KeepMessage {
    /// A client accessed `path`.
    Request { path: String },
    /// A caller wants the current data of `path`.
    Fetching { path: String, waiter: Waiter },
    /// The outstanding fetch of `path` completed, `data` is `None` if it failed.
    Fetched { path: String, data: Option<Bytes> },
    /// Asks for a listing of all entries.
    Snapshot {
        reply: oneshot::Sender<Vec<EntryInfo>>,
    },
}

/// The permission, and the obligation, to fetch a single path.
///
/// Exactly one lease exists for a path while it is being fetched. Completing the lease, or
/// dropping it, reports the fetch as done to the keep and releases all followers waiting on it.
/// A lease that is dropped without being completed counts as a failed fetch.
#[derive(Debug)]
pub struct FetchLease {
    path: String,
    tx: Option<mpsc::UnboundedSender<KeepMessage>>,
}

impl FetchLease {
    pub(crate) fn new(path: String, tx: mpsc::UnboundedSender<KeepMessage>) -> Self {
        Self { path, tx: Some(tx) }
    }

    /// The path this lease allows to fetch.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Reports the fetch as done, handing `data` to all followers.
    pub fn complete(mut self, data: Option<Bytes>) {
        self.report(data);
    }

    fn report(&mut self, data: Option<Bytes>) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        let path = std::mem::take(&mut self.path);
        if tx.send(KeepMessage::Fetched { path, data }).is_err() {
            tracing::debug!("Keep stopped before a fetch completed");
        }
    }
}

impl Drop for FetchLease {
    fn drop(&mut self) {
        self.report(None);
    }
}
