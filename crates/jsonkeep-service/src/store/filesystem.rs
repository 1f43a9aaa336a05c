use std::io;
use std::path::PathBuf;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use url::form_urlencoded;

use super::{CacheStore, StoreError};

/// Stores every document as a file in a single directory.
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// The file a path is stored in.
    ///
    /// The path is encoded into a single file name, so it can never point outside of the root
    /// directory and nested paths never collide with their parents.
    fn file_path(&self, path: &str) -> PathBuf {
        let mut name: String = form_urlencoded::byte_serialize(path.as_bytes()).collect();
        name.push_str(".json");
        self.root.join(name)
    }

    async fn read(&self, path: &str) -> Result<Option<Bytes>, StoreError> {
        let file_path = self.file_path(path);
        tracing::trace!("Reading {} from {}", path, file_path.display());
        match fs::read(&file_path).await {
            Ok(data) => Ok(Some(data.into())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<(), StoreError> {
        let file_path = self.file_path(path);

        let temp_dir = self.root.join(".tmp");
        fs::create_dir_all(&temp_dir).await?;
        let temp_file = NamedTempFile::new_in(&temp_dir)?;
        let mut dest = fs::File::from_std(temp_file.reopen()?);
        dest.write_all(&data).await?;
        dest.flush().await?;
        drop(dest);

        // readers only ever see complete documents
        temp_file.persist(&file_path)?;
        tracing::trace!("Stored {} at {}", path, file_path.display());
        Ok(())
    }
}

impl CacheStore for FilesystemStore {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn get<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, StoreError>> {
        self.read(path).boxed()
    }

    fn set<'a>(&'a self, path: &'a str, data: Bytes) -> BoxFuture<'a, Result<(), StoreError>> {
        self.write(path, data).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip() {
        let dir = jsonkeep_test::tempdir();
        let store = FilesystemStore::new(dir.path().to_owned());

        assert_eq!(store.get("/users?page=2").await.unwrap(), None);

        store
            .set("/users?page=2", Bytes::from_static(br#"[{"id":1}]"#))
            .await
            .unwrap();
        assert_eq!(
            store.get("/users?page=2").await.unwrap().unwrap(),
            &br#"[{"id":1}]"#[..]
        );

        // overwriting replaces the document
        store
            .set("/users?page=2", Bytes::from_static(b"[]"))
            .await
            .unwrap();
        assert_eq!(store.get("/users?page=2").await.unwrap().unwrap(), "[]");
    }

    #[tokio::test]
    async fn test_nested_paths() {
        let dir = jsonkeep_test::tempdir();
        let store = FilesystemStore::new(dir.path().to_owned());

        store.set("/a", Bytes::from_static(b"1")).await.unwrap();
        store.set("/a/b", Bytes::from_static(b"2")).await.unwrap();

        assert_eq!(store.get("/a").await.unwrap().unwrap(), "1");
        assert_eq!(store.get("/a/b").await.unwrap().unwrap(), "2");
    }

    #[test]
    fn test_file_path_stays_in_root() {
        let store = FilesystemStore::new(PathBuf::from("/cache"));

        for path in ["/../../etc/passwd", "..", "/a/./b", "", "/"] {
            let file_path = store.file_path(path);
            assert_eq!(file_path.parent(), Some(std::path::Path::new("/cache")));
        }
        assert_eq!(
            store.file_path("/a/b"),
            PathBuf::from("/cache/%2Fa%2Fb.json")
        );
    }
}
