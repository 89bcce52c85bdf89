use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{path::Path as ObjPath, ObjectStore};

use crate::utils::config::{AppConfig, StorageKind};

pub type DynStore = Arc<dyn ObjectStore>;

/// Blob storage for content bodies and batch job artifacts.
///
/// Thin wrapper over `object_store` so the backend (local filesystem, memory,
/// S3-compatible) stays a configuration concern.
#[derive(Clone)]
pub struct StorageManager {
    store: DynStore,
    backend_kind: StorageKind,
}

impl StorageManager {
    pub async fn new(cfg: &AppConfig) -> object_store::Result<Self> {
        let store: DynStore = match cfg.storage {
            StorageKind::Local => {
                let base = resolve_base_dir(cfg);
                if !base.exists() {
                    tokio::fs::create_dir_all(&base).await.map_err(|e| {
                        object_store::Error::Generic {
                            store: "LocalFileSystem",
                            source: e.into(),
                        }
                    })?;
                }
                Arc::new(LocalFileSystem::new_with_prefix(base)?)
            }
            StorageKind::Memory => Arc::new(InMemory::new()),
        };

        Ok(Self {
            store,
            backend_kind: cfg.storage.clone(),
        })
    }

    /// Inject a specific backend, mainly for tests.
    pub fn with_backend(store: DynStore, backend_kind: StorageKind) -> Self {
        Self {
            store,
            backend_kind,
        }
    }

    pub fn backend_kind(&self) -> &StorageKind {
        &self.backend_kind
    }

    pub async fn put(&self, location: &str, data: Bytes) -> object_store::Result<()> {
        let path = ObjPath::from(location);
        let payload = object_store::PutPayload::from_bytes(data);
        self.store.put(&path, payload).await.map(|_| ())
    }

    pub async fn get(&self, location: &str) -> object_store::Result<Bytes> {
        let path = ObjPath::from(location);
        let result = self.store.get(&path).await?;
        result.bytes().await
    }

    pub async fn exists(&self, location: &str) -> object_store::Result<bool> {
        let path = ObjPath::from(location);
        self.store
            .head(&path)
            .await
            .map(|_| true)
            .or_else(|e| match e {
                object_store::Error::NotFound { .. } => Ok(false),
                _ => Err(e),
            })
    }

    pub async fn list(
        &self,
        prefix: Option<&str>,
    ) -> object_store::Result<Vec<object_store::ObjectMeta>> {
        let prefix_path = prefix.map(ObjPath::from);
        self.store.list(prefix_path.as_ref()).try_collect().await
    }

    pub async fn delete_prefix(&self, prefix: &str) -> object_store::Result<()> {
        let prefix_path = ObjPath::from(prefix);
        let locations = self
            .store
            .list(Some(&prefix_path))
            .map_ok(|m| m.location)
            .boxed();
        self.store
            .delete_stream(locations)
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }
}

/// Resolve the local storage root; relative `data_dir` is anchored at the cwd.
fn resolve_base_dir(cfg: &AppConfig) -> PathBuf {
    if cfg.data_dir.starts_with('/') {
        PathBuf::from(&cfg.data_dir)
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(&cfg.data_dir)
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    use super::*;

    /// Memory-backed storage for unit tests.
    pub fn memory_storage() -> StorageManager {
        StorageManager::with_backend(Arc::new(InMemory::new()), StorageKind::Memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn memory_round_trip() {
        let storage = testing::memory_storage();

        let location = "content/abc";
        let data = b"test data for storage manager";

        storage
            .put(location, Bytes::from(data.to_vec()))
            .await
            .expect("put");
        let retrieved = storage.get(location).await.expect("get");
        assert_eq!(retrieved.as_ref(), data);

        assert!(storage.exists(location).await.expect("exists check"));

        storage.delete_prefix("content/").await.expect("delete");
        assert!(!storage
            .exists(location)
            .await
            .expect("exists check after delete"));
    }

    #[tokio::test]
    async fn local_round_trip() {
        let base = format!("/tmp/backbone_storage_test_{}", Uuid::new_v4());
        let cfg = AppConfig {
            data_dir: base.clone(),
            storage: StorageKind::Local,
            ..Default::default()
        };
        let storage = StorageManager::new(&cfg).await.expect("create storage");

        let location = "content/xyz";
        let data = b"local bytes";

        storage
            .put(location, Bytes::from(data.to_vec()))
            .await
            .expect("put");
        assert_eq!(storage.get(location).await.expect("get").as_ref(), data);

        let _ = tokio::fs::remove_dir_all(&base).await;
    }

    #[tokio::test]
    async fn missing_object_is_an_error() {
        let storage = testing::memory_storage();
        assert!(storage.get("nope").await.is_err());
        assert!(!storage.exists("nope").await.expect("exists"));
    }

    #[tokio::test]
    async fn list_with_prefix() {
        let storage = testing::memory_storage();
        for (loc, body) in [
            ("batch/j1/input.jsonl", "a"),
            ("batch/j1/output.jsonl", "b"),
            ("content/c1", "c"),
        ] {
            storage
                .put(loc, Bytes::from(body.as_bytes().to_vec()))
                .await
                .expect("put");
        }

        let batch = storage.list(Some("batch/j1/")).await.expect("list");
        assert_eq!(batch.len(), 2);
        let all = storage.list(None).await.expect("list all");
        assert_eq!(all.len(), 3);
    }
}
