//! The cache store fetched documents are persisted to.
//!
//! The keep never reads the store itself. Fetches write into it through the [`PersistQueue`],
//! which never blocks and never fails a fetch. The client facing side may read from it directly.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::config::StoreConfig;

mod filesystem;
mod memory;
mod queue;

pub use filesystem::FilesystemStore;
pub use memory::MemoryStore;
pub use queue::PersistQueue;

/// Errors reading from or writing to a [`CacheStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access the store")]
    Io(#[from] std::io::Error),
    #[error("failed to persist a document")]
    Persist(#[from] tempfile::PersistError),
}

/// A key value store, keyed by the requested path.
pub trait CacheStore: fmt::Debug + Send + Sync + 'static {
    /// The name of the backend, for logs and metrics.
    fn name(&self) -> &'static str;

    /// Looks up the document stored for `path`.
    fn get<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, StoreError>>;

    /// Stores `data` for `path`, replacing what was stored before.
    fn set<'a>(&'a self, path: &'a str, data: Bytes) -> BoxFuture<'a, Result<(), StoreError>>;
}

impl StoreConfig {
    /// Creates the configured store backend.
    pub fn create(&self) -> Arc<dyn CacheStore> {
        match self {
            StoreConfig::Filesystem(cfg) => Arc::new(FilesystemStore::new(cfg.path.clone())),
            StoreConfig::Memory => Arc::new(MemoryStore::new()),
        }
    }
}
