use std::sync::Arc;
use tracing::{info, instrument};

use crate::oci::Digest;
use crate::proxy::names::{blob_handle, manifest_handle};
use crate::proxy::storage::{ObjectStorage, StagedObject};
use crate::proxy::utils::Reader;
use crate::proxy::Error;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    pub storage_handle: String,
    pub size: u64,
}

/// Moves payloads into durable storage.
///
/// Bytes are first staged, then published under a handle derived from the
/// group and file name. Nothing is visible to readers until publishing succeeds.
#[derive(Clone)]
pub struct UploadBroker {
    storage: Arc<dyn ObjectStorage>,
}

fn check_declared_size(staged: &StagedObject, declared_size: Option<u64>) -> Result<(), Error> {
    match declared_size {
        Some(declared) if declared != staged.size() => Err(Error::InvalidPayload(format!(
            "declared size {declared} does not match actual size {}",
            staged.size()
        ))),
        _ => Ok(()),
    }
}

impl UploadBroker {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self { storage }
    }

    pub async fn stage(
        &self,
        reader: &mut dyn Reader,
        maximum_size: u64,
    ) -> Result<StagedObject, Error> {
        Ok(self.storage.stage(reader, maximum_size).await?)
    }

    #[instrument(skip(self, staged))]
    pub async fn store_blob(
        &self,
        group: &str,
        file_name: &str,
        staged: StagedObject,
        declared_size: Option<u64>,
    ) -> Result<StoredObject, Error> {
        check_declared_size(&staged, declared_size)?;

        let size = staged.size();
        let storage_handle = blob_handle(group, file_name);
        self.storage.publish(staged, &storage_handle).await?;

        info!("Stored blob ({size} bytes)");
        Ok(StoredObject {
            storage_handle,
            size,
        })
    }

    #[instrument(skip(self, staged))]
    pub async fn store_manifest(
        &self,
        group: &str,
        file_name: &str,
        staged: StagedObject,
        declared_size: Option<u64>,
        content_type: &str,
        digest: &Digest,
    ) -> Result<StoredObject, Error> {
        check_declared_size(&staged, declared_size)?;
        if content_type.trim().is_empty() {
            return Err(Error::InvalidPayload("missing content type".to_string()));
        }

        let size = staged.size();
        let storage_handle = manifest_handle(group, file_name, digest);
        self.storage.publish(staged, &storage_handle).await?;

        info!("Stored manifest ({size} bytes)");
        Ok(StoredObject {
            storage_handle,
            size,
        })
    }

    pub async fn open(&self, storage_handle: &str) -> Result<(Box<dyn Reader>, u64), Error> {
        Ok(self.storage.open(storage_handle).await?)
    }
}
