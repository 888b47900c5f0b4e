use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::proxy::cache_store::lock::MemoryLock;
use crate::proxy::cache_store::{CacheStore, CachedBlob, CachedManifest, Error, ManifestRevision};
use crate::proxy::storage;

/// JSON records on the local filesystem, one file per key.
///
/// Keys are base64 encoded so that image names containing `/` or `:` map to
/// a single path component.
#[derive(Clone, Debug)]
pub struct Backend {
    root: PathBuf,
    sync_to_disk: bool,
    lock: MemoryLock,
}

fn encode_key(file_name: &str) -> String {
    URL_SAFE_NO_PAD.encode(file_name)
}

impl Backend {
    pub fn new(config: &storage::fs::BackendConfig) -> Self {
        Self {
            root: PathBuf::from(&config.root_dir).join("records"),
            sync_to_disk: config.sync_to_disk,
            lock: MemoryLock::new(),
        }
    }

    fn manifest_path(&self, group: &str, file_name: &str) -> PathBuf {
        self.root
            .join(group)
            .join("manifests")
            .join(format!("{}.json", encode_key(file_name)))
    }

    fn blob_path(&self, group: &str, file_name: &str) -> PathBuf {
        self.root
            .join(group)
            .join("blobs")
            .join(format!("{}.json", encode_key(file_name)))
    }

    async fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, Error> {
        match fs::read(path).await {
            Ok(content) => Ok(Some(serde_json::from_slice(&content)?)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn write_record<T: Serialize>(&self, path: &Path, record: &T) -> Result<(), Error> {
        let data = serde_json::to_vec(record)?;
        let parent = path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(parent).await?;

        let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;
        temp_file.write_all(&data)?;

        if self.sync_to_disk {
            temp_file.flush()?;
            temp_file.as_file().sync_all()?;
        }

        temp_file.persist(path).map_err(|error| Error::Io(error.error))?;
        Ok(())
    }
}

#[async_trait]
impl CacheStore for Backend {
    #[instrument(skip(self))]
    async fn find_active_manifest(
        &self,
        group: &str,
        file_name: &str,
    ) -> Result<Option<CachedManifest>, Error> {
        let record: Option<CachedManifest> =
            Self::read_record(&self.manifest_path(group, file_name)).await?;
        Ok(record.filter(|manifest| manifest.active))
    }

    #[instrument(skip(self, revision))]
    async fn upsert_manifest(
        &self,
        group: &str,
        file_name: &str,
        revision: ManifestRevision,
    ) -> Result<CachedManifest, Error> {
        let path = self.manifest_path(group, file_name);
        let _guard = self.lock.acquire(&path.to_string_lossy()).await;

        let now = Utc::now();
        let existing: Option<CachedManifest> = Self::read_record(&path).await?;
        let manifest = match existing {
            Some(existing) if existing.active => {
                debug!("Replacing active manifest {}", existing.id);
                CachedManifest {
                    digest: revision.digest,
                    content_type: revision.content_type,
                    size: revision.size,
                    storage_handle: revision.storage_handle,
                    updated_at: now,
                    ..existing
                }
            }
            _ => CachedManifest {
                id: Uuid::new_v4(),
                group: group.to_string(),
                file_name: file_name.to_string(),
                size: revision.size,
                content_type: revision.content_type,
                digest: revision.digest,
                active: true,
                storage_handle: revision.storage_handle,
                created_at: now,
                updated_at: now,
            },
        };

        self.write_record(&path, &manifest).await?;
        Ok(manifest)
    }

    #[instrument(skip(self))]
    async fn find_blob(&self, group: &str, file_name: &str) -> Result<Option<CachedBlob>, Error> {
        Self::read_record(&self.blob_path(group, file_name)).await
    }

    #[instrument(skip(self))]
    async fn insert_blob(
        &self,
        group: &str,
        file_name: &str,
        size: u64,
        storage_handle: &str,
    ) -> Result<CachedBlob, Error> {
        let path = self.blob_path(group, file_name);
        let _guard = self.lock.acquire(&path.to_string_lossy()).await;

        if let Some(existing) = Self::read_record(&path).await? {
            debug!("Blob record already present");
            return Ok(existing);
        }

        let blob = CachedBlob {
            group: group.to_string(),
            file_name: file_name.to_string(),
            size,
            storage_handle: storage_handle.to_string(),
            created_at: Utc::now(),
        };

        self.write_record(&path, &blob).await?;
        Ok(blob)
    }
}
