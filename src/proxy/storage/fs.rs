use async_trait::async_trait;
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument};

use crate::proxy::storage::{Error, ObjectStorage, StagedObject};
use crate::proxy::utils::{HashingReader, Reader};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct BackendConfig {
    #[serde(default = "BackendConfig::default_root_dir")]
    pub root_dir: String,
    #[serde(default)]
    pub sync_to_disk: bool,
}

impl BackendConfig {
    fn default_root_dir() -> String {
        "/var/lib/dependency-proxy".to_string()
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            root_dir: Self::default_root_dir(),
            sync_to_disk: false,
        }
    }
}

/// Filesystem object storage.
///
/// Objects live under `<root>/objects/<handle>`; staged objects are temporary
/// files under `<root>/staging` so that publishing is a same-filesystem rename.
#[derive(Clone, Debug)]
pub struct Backend {
    root: PathBuf,
    sync_to_disk: bool,
}

impl Backend {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            root: PathBuf::from(&config.root_dir),
            sync_to_disk: config.sync_to_disk,
        }
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    fn object_path(&self, handle: &str) -> Result<PathBuf, Error> {
        let path = Path::new(handle);
        let is_relative_and_plain = !handle.is_empty()
            && path
                .components()
                .all(|component| matches!(component, Component::Normal(_)));

        if !is_relative_and_plain {
            return Err(Error::InvalidHandle(handle.to_string()));
        }

        Ok(self.root.join("objects").join(path))
    }
}

#[async_trait]
impl ObjectStorage for Backend {
    #[instrument(skip(self, reader))]
    async fn stage(
        &self,
        reader: &mut dyn Reader,
        maximum_size: u64,
    ) -> Result<StagedObject, Error> {
        let staging_dir = self.staging_dir();
        fs::create_dir_all(&staging_dir).await?;

        let (file, path) = tempfile::Builder::new()
            .prefix("staged-")
            .tempfile_in(&staging_dir)?
            .into_parts();
        let mut file = fs::File::from_std(file);

        let mut reader = HashingReader::new(reader);
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buf).await.map_err(Error::Source)?;
            if n == 0 {
                break;
            }
            if reader.size() > maximum_size {
                return Err(Error::TooLarge(maximum_size));
            }
            file.write_all(&buf[..n]).await?;
        }

        file.flush().await?;
        if self.sync_to_disk {
            file.sync_all().await?;
        }

        let size = reader.size();
        debug!("Staged {size} bytes");
        Ok(StagedObject::new(path, size, reader.digest()))
    }

    #[instrument(skip(self, staged))]
    async fn publish(&self, staged: StagedObject, handle: &str) -> Result<(), Error> {
        let target = self.object_path(handle)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        staged
            .into_path()
            .persist(&target)
            .map_err(|error| Error::Io(error.error))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn open(&self, handle: &str) -> Result<(Box<dyn Reader>, u64), Error> {
        let path = self.object_path(handle)?;
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(Error::NotFound(handle.to_string()));
            }
            Err(error) => return Err(error.into()),
        };

        let size = file.metadata().await?.len();
        Ok((Box::new(file), size))
    }
}
