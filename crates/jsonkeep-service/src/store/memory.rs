use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;

use super::{CacheStore, StoreError};

/// Keeps documents in process memory.
///
/// The store is unbounded, just like the set of paths the keep tracks.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    documents: moka::sync::Cache<String, Bytes>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            documents: moka::sync::Cache::builder().name("documents").build(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, StoreError>> {
        let document = self.documents.get(path);
        async move { Ok(document) }.boxed()
    }

    fn set<'a>(&'a self, path: &'a str, data: Bytes) -> BoxFuture<'a, Result<(), StoreError>> {
        self.documents.insert(path.to_owned(), data);
        async move { Ok(()) }.boxed()
    }
}
