//! Coordinates fetches of upstream paths.
//!
//! The [`Keep`] is a handle to a single actor task that owns the metadata of every path that was
//! ever seen. All state changes are messages to that actor, which processes them one at a time,
//! so there is no locking anywhere:
//!
//! - [`Keep::request`] counts an access to a path.
//! - [`Keep::fetching`] asks to fetch a path. The first caller becomes the leader and receives a
//!   [`FetchLease`], every caller arriving while that fetch is outstanding waits for its result.
//! - Completing (or dropping) the [`FetchLease`] hands the result to all waiting callers.
//!
//! In addition the actor refreshes every path in the background once it is older than the
//! configured ttl, using a [`Refresher`].

use std::time::Duration;

use sentry::{Hub, SentryFutureExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::metric;

mod protocol;
mod state;

use protocol::KeepMessage;
pub use protocol::{FetchLease, Fetching};
pub use state::{EntryInfo, KeepState, ProtocolViolation};

/// Launches background refreshes for the keep.
pub trait Refresher: Send + Sync + 'static {
    /// Starts fetching the leased path without blocking.
    ///
    /// There is nobody waiting for the response, so the fetched data only updates the cache
    /// store. The lease must be completed or dropped once the fetch is done.
    fn refresh(&self, lease: FetchLease);
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum KeepError {
    #[error("the keep has stopped")]
    Stopped,
}

/// A handle to the keep actor.
///
/// Handles are cheap to clone. The actor stops once all handles and all outstanding leases
/// are gone.
#[derive(Debug, Clone)]
pub struct Keep {
    tx: mpsc::UnboundedSender<KeepMessage>,
}

impl Keep {
    /// Spawns the actor on the current runtime.
    pub fn spawn(ttl: Duration, refresher: impl Refresher) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = KeepActor {
            state: KeepState::new(ttl),
            tx: tx.downgrade(),
            refresher: Box::new(refresher),
        };
        tokio::spawn(actor.run(rx).bind_hub(Hub::new_from_top(Hub::current())));
        Self { tx }
    }

    /// Records an access to `path`.
    pub fn request(&self, path: impl Into<String>) {
        let path = path.into();
        if self.tx.send(KeepMessage::Request { path }).is_err() {
            tracing::debug!("Dropping request, the keep has stopped");
        }
    }

    /// Asks for the current data of `path`.
    ///
    /// Resolves right away with [`Fetching::Lead`] if nobody is fetching the path, otherwise it
    /// waits for the outstanding fetch to complete.
    pub async fn fetching(&self, path: impl Into<String>) -> Result<Fetching, KeepError> {
        let (waiter, rx) = protocol::waiter();
        let path = path.into();
        self.tx
            .send(KeepMessage::Fetching { path, waiter })
            .map_err(|_| KeepError::Stopped)?;
        // the waiter is dropped unanswered if the keep stops while we wait
        Ok(rx.await.unwrap_or(Fetching::Failed))
    }

    /// Whether the keep is still processing messages.
    ///
    /// The keep only stops on its own after a protocol violation, which leaves the process
    /// unable to fetch anything.
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Lists all known paths, ordered by path.
    pub async fn entries(&self) -> Result<Vec<EntryInfo>, KeepError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(KeepMessage::Snapshot { reply })
            .map_err(|_| KeepError::Stopped)?;
        rx.await.map_err(|_| KeepError::Stopped)
    }
}

struct KeepActor {
    state: KeepState,
    /// Used to hand out leases, without keeping the actor alive by itself.
    tx: mpsc::WeakUnboundedSender<KeepMessage>,
    refresher: Box<dyn Refresher>,
}

impl KeepActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<KeepMessage>) {
        self.service_timer();
        loop {
            let timer = self.state.timer();
            tokio::select! {
                message = rx.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    if let Err(err) = self.handle(message) {
                        tracing::error!(
                            error = &err as &dyn std::error::Error,
                            "Keep protocol violated, stopping",
                        );
                        break;
                    }
                }
                () = sleep_until(timer) => {
                    self.state.timer_fired();
                }
            }
            self.service_timer();
        }
        tracing::info!("Keep terminated");
    }

    fn handle(&mut self, message: KeepMessage) -> Result<(), ProtocolViolation> {
        let now = Instant::now();
        match message {
            KeepMessage::Request { path } => {
                metric!(counter("keep.request") += 1);
                self.state.request(&path, now);
            }
            KeepMessage::Fetching { path, waiter } => {
                let Some(waiter) = self.state.fetching(&path, waiter, now) else {
                    metric!(counter("keep.waiters") += 1);
                    return Ok(());
                };
                if let Some(lease) = self.lease(path) {
                    // A leader that gave up waiting still owes its followers the fetch.
                    if let Err(Fetching::Lead(lease)) = waiter.send(Fetching::Lead(lease)) {
                        tracing::debug!(path = lease.path(), "Leader went away, refreshing instead");
                        self.refresher.refresh(lease);
                    }
                }
            }
            KeepMessage::Fetched { path, data } => {
                let released = self.state.fetched(&path, data, now)?;
                if released > 0 {
                    metric!(counter("keep.waiters.released") += released as i64);
                }
            }
            KeepMessage::Snapshot { reply } => {
                reply.send(self.state.snapshot(now)).ok();
            }
        }
        metric!(gauge("keep.entries") = self.state.len() as u64);
        Ok(())
    }

    fn service_timer(&mut self) {
        for path in self.state.service_timer(Instant::now()) {
            match self.lease(path) {
                Some(lease) => self.refresher.refresh(lease),
                None => tracing::debug!("Keep is shutting down, skipping refresh"),
            }
        }
    }

    fn lease(&self, path: String) -> Option<FetchLease> {
        self.tx.upgrade().map(|tx| FetchLease::new(path, tx))
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
