//! Cache stores misbehaving in ways the service has to cope with.

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::store::{CacheStore, StoreError};

/// A store that fails every read and write.
#[derive(Debug)]
pub struct BrokenStore;

impl CacheStore for BrokenStore {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn get<'a>(&'a self, _path: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, StoreError>> {
        async { Err(StoreError::Io(std::io::Error::other("broken"))) }.boxed()
    }

    fn set<'a>(&'a self, _path: &'a str, _data: Bytes) -> BoxFuture<'a, Result<(), StoreError>> {
        async { Err(StoreError::Io(std::io::Error::other("broken"))) }.boxed()
    }
}

/// A store whose writes never finish.
#[derive(Debug)]
pub struct StalledStore;

impl CacheStore for StalledStore {
    fn name(&self) -> &'static str {
        "stalled"
    }

    fn get<'a>(&'a self, _path: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, StoreError>> {
        async { Ok(None) }.boxed()
    }

    fn set<'a>(&'a self, _path: &'a str, _data: Bytes) -> BoxFuture<'a, Result<(), StoreError>> {
        futures::future::pending().boxed()
    }
}
