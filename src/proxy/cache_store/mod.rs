use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::oci::Digest;

mod error;
pub mod fs;
mod lock;

pub use error::Error;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedBlob {
    pub group: String,
    pub file_name: String,
    pub size: u64,
    pub storage_handle: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedManifest {
    pub id: Uuid,
    pub group: String,
    pub file_name: String,
    pub size: u64,
    pub content_type: String,
    pub digest: Digest,
    pub active: bool,
    pub storage_handle: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The mutable part of a manifest record.
#[derive(Clone, Debug, PartialEq)]
pub struct ManifestRevision {
    pub digest: Digest,
    pub content_type: String,
    pub size: u64,
    pub storage_handle: String,
}

/// Cache records, scoped per group.
///
/// Blobs are immutable and keyed by a digest-derived file name. Manifests are
/// keyed by `image:tag` and there is at most one active record per key: a
/// new revision replaces the active record in place, keeping its identity.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn find_active_manifest(
        &self,
        group: &str,
        file_name: &str,
    ) -> Result<Option<CachedManifest>, Error>;

    async fn upsert_manifest(
        &self,
        group: &str,
        file_name: &str,
        revision: ManifestRevision,
    ) -> Result<CachedManifest, Error>;

    async fn find_blob(&self, group: &str, file_name: &str) -> Result<Option<CachedBlob>, Error>;

    /// Idempotent: returns the existing record when one is already present.
    async fn insert_blob(
        &self,
        group: &str,
        file_name: &str,
        size: u64,
        storage_handle: &str,
    ) -> Result<CachedBlob, Error>;
}
