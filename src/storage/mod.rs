//! Storage abstraction over `object_store`.
//!
//! Provides a unified interface for the local filesystem, in-memory stores
//! and the cloud backends `object_store` understands (S3, GCS, Azure).
//! All paths handed to and returned from a [`StorageProvider`] are relative
//! to the location it was opened on.

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use url::Url;

use crate::emit;
use crate::error::{CreateDirSnafu, InvalidUrlSnafu, ObjectStoreSnafu, StorageError, UrlParseSnafu};
use crate::metrics::events::{
    RequestStatus, StorageOperation, StorageRequest, StorageRequestDuration,
};

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// An object listed under a storage location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedObject {
    /// Path relative to the provider's location.
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
}

/// Storage provider rooted at a single location.
#[derive(Clone)]
pub struct StorageProvider {
    object_store: Arc<dyn ObjectStore>,
    prefix: Option<Path>,
    canonical_url: String,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

impl StorageProvider {
    /// Open an existing location.
    ///
    /// Local paths must already exist; a missing raw-zone directory is an
    /// error rather than an empty source.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        Self::open(url, options, false).await
    }

    /// Open a location, creating local directories as needed.
    pub async fn create_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        Self::open(url, options, true).await
    }

    async fn open(
        url: &str,
        options: HashMap<String, String>,
        create: bool,
    ) -> Result<Self, StorageError> {
        ensure!(!url.trim().is_empty(), InvalidUrlSnafu { url });

        if !url.contains("://") {
            return Self::local(std::path::Path::new(url), create).await;
        }

        let parsed = Url::parse(url).context(UrlParseSnafu { url })?;
        match parsed.scheme() {
            "file" => {
                let path = parsed
                    .to_file_path()
                    .map_err(|_| InvalidUrlSnafu { url }.build())?;
                Self::local(&path, create).await
            }
            "memory" => {
                let key = format!("{}{}", parsed.host_str().unwrap_or_default(), parsed.path());
                Ok(Self {
                    object_store: Arc::new(InMemory::new()),
                    prefix: non_empty_path(&key),
                    canonical_url: url.to_string(),
                })
            }
            _ => {
                let (store, path) =
                    object_store::parse_url_opts(&parsed, options).context(ObjectStoreSnafu)?;
                Ok(Self {
                    object_store: Arc::from(store),
                    prefix: non_empty_path(path.as_ref()),
                    canonical_url: url.to_string(),
                })
            }
        }
    }

    async fn local(path: &std::path::Path, create: bool) -> Result<Self, StorageError> {
        if create {
            tokio::fs::create_dir_all(path)
                .await
                .context(CreateDirSnafu { path })?;
        }
        let store = LocalFileSystem::new_with_prefix(path).context(ObjectStoreSnafu)?;
        Ok(Self {
            object_store: Arc::new(store),
            prefix: None,
            canonical_url: path.display().to_string(),
        })
    }

    /// The URL or path this provider was opened on.
    pub fn url(&self) -> &str {
        &self.canonical_url
    }

    /// Qualify a relative path with the configured prefix.
    fn qualify(&self, path: &str) -> Path {
        let relative = Path::from(path);
        match &self.prefix {
            Some(prefix) => prefix.parts().chain(relative.parts()).collect(),
            None => relative,
        }
    }

    /// List every object below `sub` (relative), sorted by path.
    ///
    /// A location that does not exist yet lists as empty.
    pub async fn list(&self, sub: Option<&str>) -> Result<Vec<ListedObject>, StorageError> {
        let start = Instant::now();
        let prefix = match sub {
            Some(sub) => Some(self.qualify(sub)),
            None => self.prefix.clone(),
        };
        let skip = self
            .prefix
            .as_ref()
            .map(|p| p.parts().count())
            .unwrap_or_default();

        let result: Result<Vec<_>, _> = self.object_store.list(prefix.as_ref()).try_collect().await;
        record_request(StorageOperation::List, result.is_ok(), start);

        let metas = match result {
            Ok(metas) => metas,
            Err(object_store::Error::NotFound { .. }) => Vec::new(),
            Err(source) => return Err(StorageError::ObjectStore { source }),
        };

        let mut objects: Vec<ListedObject> = metas
            .into_iter()
            .map(|meta| {
                let relative: Path = meta.location.parts().skip(skip).collect();
                ListedObject {
                    path: relative.to_string(),
                    size: meta.size as u64,
                }
            })
            .collect();
        objects.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(objects)
    }

    /// Read a whole object.
    pub async fn get(&self, path: &str) -> Result<Bytes, StorageError> {
        let start = Instant::now();
        let result = self.object_store.get(&self.qualify(path)).await;
        record_request(StorageOperation::Get, result.is_ok(), start);

        result
            .context(ObjectStoreSnafu)?
            .bytes()
            .await
            .context(ObjectStoreSnafu)
    }

    /// Write an object, replacing any previous content.
    pub async fn put(&self, path: &str, bytes: Bytes) -> Result<(), StorageError> {
        let start = Instant::now();
        let result = self
            .object_store
            .put(&self.qualify(path), PutPayload::from(bytes))
            .await;
        record_request(StorageOperation::Put, result.is_ok(), start);
        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Write an object only if nothing exists at `path` yet.
    ///
    /// Fails with an `AlreadyExists` error (see [`StorageError::is_already_exists`])
    /// when another writer got there first.
    pub async fn put_if_absent(&self, path: &str, bytes: Bytes) -> Result<(), StorageError> {
        let start = Instant::now();
        let options = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        let result = self
            .object_store
            .put_opts(&self.qualify(path), PutPayload::from(bytes), options)
            .await;
        record_request(StorageOperation::Put, result.is_ok(), start);
        result.context(ObjectStoreSnafu)?;
        Ok(())
    }
}

fn non_empty_path(path: &str) -> Option<Path> {
    let path = Path::from(path.trim_matches('/'));
    (!path.as_ref().is_empty()).then_some(path)
}

fn record_request(operation: StorageOperation, ok: bool, start: Instant) {
    let status = if ok {
        RequestStatus::Success
    } else {
        RequestStatus::Error
    };
    emit!(StorageRequest { operation, status });
    emit!(StorageRequestDuration {
        operation,
        duration: start.elapsed(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_put_get_list() {
        let dir = TempDir::new().unwrap();
        let storage = StorageProvider::for_url_with_options(
            dir.path().to_str().unwrap(),
            HashMap::new(),
        )
        .await
        .unwrap();

        storage
            .put("b/2.json", Bytes::from_static(b"two"))
            .await
            .unwrap();
        storage
            .put("a/1.json", Bytes::from_static(b"one"))
            .await
            .unwrap();

        let listed = storage.list(None).await.unwrap();
        let paths: Vec<_> = listed.iter().map(|o| o.path.as_str()).collect();
        assert_eq!(paths, vec!["a/1.json", "b/2.json"]);

        let only_b = storage.list(Some("b")).await.unwrap();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].path, "b/2.json");

        assert_eq!(storage.get("a/1.json").await.unwrap().as_ref(), b"one");
    }

    #[tokio::test]
    async fn test_missing_local_path_fails() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("does-not-exist");
        let result =
            StorageProvider::for_url_with_options(missing.to_str().unwrap(), HashMap::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_create_makes_directories() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("silver").join("tables");
        StorageProvider::create_with_options(nested.to_str().unwrap(), HashMap::new())
            .await
            .unwrap();
        assert!(nested.is_dir());
    }

    #[tokio::test]
    async fn test_put_if_absent_conflict() {
        let storage = StorageProvider::for_url_with_options("memory://test", HashMap::new())
            .await
            .unwrap();

        storage
            .put_if_absent("log/0.json", Bytes::from_static(b"first"))
            .await
            .unwrap();
        let err = storage
            .put_if_absent("log/0.json", Bytes::from_static(b"second"))
            .await
            .unwrap_err();

        assert!(err.is_already_exists());
        assert_eq!(storage.get("log/0.json").await.unwrap().as_ref(), b"first");
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let storage = StorageProvider::for_url_with_options("memory://test", HashMap::new())
            .await
            .unwrap();
        let err = storage.get("nope.json").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_empty_location() {
        let storage = StorageProvider::for_url_with_options("memory://", HashMap::new())
            .await
            .unwrap();
        assert!(storage.list(Some("nothing")).await.unwrap().is_empty());
    }
}
