use async_trait::async_trait;
use tempfile::TempPath;

use crate::oci::Digest;
use crate::proxy::utils::Reader;

mod error;
pub mod fs;

pub use error::Error;

/// Bytes written to the staging area and not yet visible under any handle.
///
/// Dropping a staged object discards it.
#[derive(Debug)]
pub struct StagedObject {
    path: TempPath,
    size: u64,
    digest: Digest,
}

impl StagedObject {
    pub fn new(path: TempPath, size: u64, digest: Digest) -> Self {
        Self { path, size, digest }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn into_path(self) -> TempPath {
        self.path
    }
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Streams `reader` to the staging area until end of stream.
    ///
    /// Fails with `Error::TooLarge` as soon as more than `maximum_size` bytes are read.
    async fn stage(&self, reader: &mut dyn Reader, maximum_size: u64)
        -> Result<StagedObject, Error>;

    /// Atomically makes a staged object readable under `handle`, replacing any previous content.
    async fn publish(&self, staged: StagedObject, handle: &str) -> Result<(), Error>;

    async fn open(&self, handle: &str) -> Result<(Box<dyn Reader>, u64), Error>;
}
