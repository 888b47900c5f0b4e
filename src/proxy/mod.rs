use std::future::Future;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

pub mod authorization;
pub mod cache_store;
mod error;
pub mod names;
pub mod registry_client;
pub mod settings;
pub mod storage;
pub mod tracking;
pub mod upload;
pub mod utils;

use crate::oci::Digest;
use authorization::{UploadAuthorization, MAX_BLOB_FILE_SIZE, MAX_MANIFEST_FILE_SIZE};
use cache_store::{CacheStore, ManifestRevision};
pub use error::Error;
use registry_client::{Upstream, DOCKER_CONTENT_DIGEST};
use settings::{GroupSetting, GroupSettings};
use storage::{ObjectStorage, StagedObject};
use tracking::{ArtifactKind, EventTracker, PullEvent};
use upload::UploadBroker;
use utils::{tee_reader, ChannelReader, Reader, TeeConfig};

pub const DISTRIBUTION_API_VERSION_HEADER: &str = "Docker-Distribution-Api-Version";
pub const DISTRIBUTION_API_VERSION: &str = "registry/2.0";

pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

pub const ACCEPTED_MANIFEST_TYPES: [&str; 3] = [
    "application/vnd.docker.distribution.manifest.v1+json",
    "application/vnd.docker.distribution.manifest.v2+json",
    OCI_MANIFEST_MEDIA_TYPE,
];

const BLOB_CONTENT_TYPE: &str = "application/octet-stream";

/// Response headers and a body stream, ready to be relayed to the client.
pub struct PullResponse {
    pub headers: Vec<(&'static str, String)>,
    pub body: Box<dyn Reader>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum PullMethod {
    Get,
    Head,
}

/// Metadata sent alongside an uploaded manifest.
#[derive(Clone, Debug, Default)]
pub struct ManifestUpload {
    pub image: String,
    pub tag: String,
    pub content_type: Option<String>,
    pub digest: Option<String>,
    pub declared_size: Option<u64>,
}

/// Pull-through cache for container images, scoped per group.
///
/// Pulls are served from the cache store when possible. On a miss the
/// upstream body is relayed to the client and, in the background, copied
/// into storage. A cache record only appears once the copy is complete and
/// verified.
pub struct DependencyProxy {
    settings: Arc<GroupSettings>,
    upstream: Arc<dyn Upstream>,
    cache_store: Arc<dyn CacheStore>,
    uploads: UploadBroker,
    tracker: Arc<dyn EventTracker>,
    tee: TeeConfig,
    cache_jobs: TaskTracker,
}

impl DependencyProxy {
    pub fn new(
        settings: Arc<GroupSettings>,
        upstream: Arc<dyn Upstream>,
        cache_store: Arc<dyn CacheStore>,
        storage: Arc<dyn ObjectStorage>,
        tracker: Arc<dyn EventTracker>,
        tee: TeeConfig,
    ) -> Self {
        Self {
            settings,
            upstream,
            cache_store,
            uploads: UploadBroker::new(storage),
            tracker,
            tee,
            cache_jobs: TaskTracker::new(),
        }
    }

    /// Resolves the settings of `group`, failing when the proxy is disabled for it.
    ///
    /// Malformed group names are reported exactly like disabled groups.
    pub fn ensure_enabled(&self, group: &str) -> Result<Arc<GroupSetting>, Error> {
        if !names::is_valid_group(group) {
            return Err(Error::NotEnabled);
        }

        let setting = self.settings.find(group);
        if setting.enabled {
            Ok(setting)
        } else {
            Err(Error::NotEnabled)
        }
    }

    pub fn check_auth(&self, group: &str) -> Result<(), Error> {
        self.ensure_enabled(group).map(|_| ())
    }

    pub fn authorize_upload(
        &self,
        group: &str,
        kind: ArtifactKind,
    ) -> Result<UploadAuthorization, Error> {
        self.ensure_enabled(group)?;
        Ok(authorization::authorize(false, kind.maximum_size()))
    }

    fn track(&self, kind: ArtifactKind, from_cache: bool, group: &str, user: Option<&str>) {
        self.tracker.track(&PullEvent {
            kind,
            from_cache,
            group: group.to_string(),
            user: user.map(ToString::to_string),
        });
    }

    fn spawn_cache_job<F>(&self, description: String, job: F)
    where
        F: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.cache_jobs.spawn(async move {
            match job.await {
                Ok(()) => debug!("Cached {description}"),
                Err(err) => warn!("Discarding cache write for {description}: {err}"),
            }
        });
    }

    /// Waits until every pending cache write has either been committed or discarded.
    pub async fn wait_for_cache_jobs(&self) {
        self.cache_jobs.close();
        self.cache_jobs.wait().await;
        self.cache_jobs.reopen();
    }

    /// Serves a manifest from the cache, or relays it from upstream while caching it.
    pub async fn get_manifest(
        &self,
        group: &str,
        image: Option<&str>,
        tag: Option<&str>,
        user: Option<&str>,
    ) -> Result<PullResponse, Error> {
        self.pull_manifest(group, image, tag, user, PullMethod::Get).await
    }

    /// Manifest headers only. Nothing is cached and no pull is recorded.
    pub async fn head_manifest(
        &self,
        group: &str,
        image: Option<&str>,
        tag: Option<&str>,
    ) -> Result<PullResponse, Error> {
        self.pull_manifest(group, image, tag, None, PullMethod::Head).await
    }

    /// Serves a blob from the cache, or relays it from upstream while caching it.
    pub async fn get_blob(
        &self,
        group: &str,
        image: Option<&str>,
        sha: Option<&str>,
        user: Option<&str>,
    ) -> Result<PullResponse, Error> {
        self.pull_blob(group, image, sha, user, PullMethod::Get).await
    }

    /// Blob headers only. Nothing is cached and no pull is recorded.
    pub async fn head_blob(
        &self,
        group: &str,
        image: Option<&str>,
        sha: Option<&str>,
    ) -> Result<PullResponse, Error> {
        self.pull_blob(group, image, sha, None, PullMethod::Head).await
    }

    #[instrument(skip(self))]
    async fn pull_manifest(
        &self,
        group: &str,
        image: Option<&str>,
        tag: Option<&str>,
        user: Option<&str>,
        method: PullMethod,
    ) -> Result<PullResponse, Error> {
        let setting = self.ensure_enabled(group)?;

        let image = image
            .filter(|image| names::is_valid_image(image))
            .ok_or_else(|| Error::InvalidPayload("missing or invalid image".to_string()))?;
        let tag = tag
            .filter(|tag| names::is_valid_tag(tag))
            .ok_or_else(|| Error::InvalidPayload("missing or invalid tag".to_string()))?;

        let file_name = names::manifest_file_name(image, tag);
        if let Some(manifest) = self
            .cache_store
            .find_active_manifest(group, &file_name)
            .await?
        {
            let (body, size) = self.uploads.open(&manifest.storage_handle).await?;
            let digest = manifest.digest.to_string();
            let headers = vec![
                (DOCKER_CONTENT_DIGEST, digest.clone()),
                ("Content-Length", size.to_string()),
                (DISTRIBUTION_API_VERSION_HEADER, DISTRIBUTION_API_VERSION.to_string()),
                ("Etag", format!("\"{digest}\"")),
                ("Content-Type", manifest.content_type),
            ];

            if method == PullMethod::Get {
                self.track(ArtifactKind::Manifest, true, group, user);
            }
            return Ok(PullResponse { headers, body });
        }

        let token = self.upstream.request_token(image, &setting).await?;
        let accept = ACCEPTED_MANIFEST_TYPES.map(ToString::to_string);
        let url = self.upstream.manifest_url(image, tag);

        if method == PullMethod::Head {
            let response = self.upstream.fetch_head(&url, &token, &accept).await?;
            let mut headers = response.forwarded_headers();
            headers.push((DISTRIBUTION_API_VERSION_HEADER, DISTRIBUTION_API_VERSION.to_string()));
            return Ok(PullResponse {
                headers,
                body: Box::new(tokio::io::empty()),
            });
        }

        let response = self.upstream.fetch(&url, &token, &accept).await?;

        let mut headers = response.forwarded_headers();
        headers.push((DISTRIBUTION_API_VERSION_HEADER, DISTRIBUTION_API_VERSION.to_string()));

        let expected_digest = match response.digest.as_deref().map(str::parse::<Digest>) {
            Some(Ok(digest)) => Some(digest),
            Some(Err(err)) => {
                warn!("Ignoring upstream manifest digest: {err}");
                None
            }
            None => None,
        };
        let content_type = response
            .content_type
            .clone()
            .unwrap_or_else(|| OCI_MANIFEST_MEDIA_TYPE.to_string());
        let content_length = response.content_length;

        let (primary, secondary) = tee_reader(response.body, self.tee);

        let uploads = self.uploads.clone();
        let cache_store = self.cache_store.clone();
        let group_name = group.to_string();
        self.spawn_cache_job(format!("manifest {group}/{file_name}"), async move {
            let staged = stage_relayed(&uploads, secondary, MAX_MANIFEST_FILE_SIZE).await?;
            let digest = staged.digest().clone();
            if let Some(expected) = expected_digest {
                verify_digest(&expected, &digest)?;
            }

            let stored = uploads
                .store_manifest(
                    &group_name,
                    &file_name,
                    staged,
                    content_length,
                    &content_type,
                    &digest,
                )
                .await?;

            let revision = ManifestRevision {
                digest,
                content_type,
                size: stored.size,
                storage_handle: stored.storage_handle,
            };
            cache_store
                .upsert_manifest(&group_name, &file_name, revision)
                .await?;
            Ok(())
        });

        self.track(ArtifactKind::Manifest, false, group, user);
        Ok(PullResponse {
            headers,
            body: Box::new(primary),
        })
    }

    #[instrument(skip(self))]
    async fn pull_blob(
        &self,
        group: &str,
        image: Option<&str>,
        sha: Option<&str>,
        user: Option<&str>,
        method: PullMethod,
    ) -> Result<PullResponse, Error> {
        let setting = self.ensure_enabled(group)?;

        let digest: Digest = sha
            .ok_or_else(|| Error::InvalidPayload("missing sha".to_string()))?
            .parse()?;
        if let Some(image) = image {
            if !names::is_valid_image(image) {
                return Err(Error::InvalidPayload("invalid image".to_string()));
            }
        }

        let file_name = names::blob_file_name(&digest);
        if let Some(blob) = self.cache_store.find_blob(group, &file_name).await? {
            let (body, size) = self.uploads.open(&blob.storage_handle).await?;
            let headers = vec![
                ("Content-Length", size.to_string()),
                (DOCKER_CONTENT_DIGEST, digest.to_string()),
                ("Content-Type", BLOB_CONTENT_TYPE.to_string()),
            ];

            if method == PullMethod::Get {
                self.track(ArtifactKind::Blob, true, group, user);
            }
            return Ok(PullResponse { headers, body });
        }

        let image = image.ok_or_else(|| Error::InvalidPayload("missing image".to_string()))?;
        let token = self.upstream.request_token(image, &setting).await?;
        let url = self.upstream.blob_url(image, &digest);

        if method == PullMethod::Head {
            let response = self.upstream.fetch_head(&url, &token, &[]).await?;
            return Ok(PullResponse {
                headers: response.forwarded_headers(),
                body: Box::new(tokio::io::empty()),
            });
        }

        let response = self.upstream.fetch(&url, &token, &[]).await?;

        let headers = response.forwarded_headers();
        let content_length = response.content_length;
        let (primary, secondary) = tee_reader(response.body, self.tee);

        let uploads = self.uploads.clone();
        let cache_store = self.cache_store.clone();
        let group_name = group.to_string();
        self.spawn_cache_job(format!("blob {group}/{file_name}"), async move {
            let staged = stage_relayed(&uploads, secondary, MAX_BLOB_FILE_SIZE).await?;
            verify_digest(&digest, staged.digest())?;

            let stored = uploads
                .store_blob(&group_name, &file_name, staged, content_length)
                .await?;
            cache_store
                .insert_blob(&group_name, &file_name, stored.size, &stored.storage_handle)
                .await?;
            Ok(())
        });

        self.track(ArtifactKind::Blob, false, group, user);
        Ok(PullResponse {
            headers,
            body: Box::new(primary),
        })
    }

    /// Streams an uploaded file into the staging area.
    pub async fn stage_upload(
        &self,
        group: &str,
        kind: ArtifactKind,
        reader: &mut dyn Reader,
    ) -> Result<StagedObject, Error> {
        self.ensure_enabled(group)?;
        self.uploads.stage(reader, kind.maximum_size()).await
    }

    #[instrument(skip(self, staged))]
    pub async fn upload_blob(
        &self,
        group: &str,
        sha: &str,
        staged: StagedObject,
        declared_size: Option<u64>,
        user: Option<&str>,
    ) -> Result<(), Error> {
        self.ensure_enabled(group)?;

        let digest: Digest = sha.parse()?;
        verify_digest(&digest, staged.digest())?;

        let file_name = names::blob_file_name(&digest);
        let stored = self
            .uploads
            .store_blob(group, &file_name, staged, declared_size)
            .await?;
        self.cache_store
            .insert_blob(group, &file_name, stored.size, &stored.storage_handle)
            .await?;

        info!("Blob {digest} uploaded to {group}");
        self.track(ArtifactKind::Blob, false, group, user);
        Ok(())
    }

    #[instrument(skip(self, staged))]
    pub async fn upload_manifest(
        &self,
        group: &str,
        upload: ManifestUpload,
        staged: StagedObject,
        user: Option<&str>,
    ) -> Result<(), Error> {
        self.ensure_enabled(group)?;

        if !names::is_valid_image(&upload.image) || !names::is_valid_tag(&upload.tag) {
            return Err(Error::InvalidPayload("missing or invalid image or tag".to_string()));
        }

        let digest = staged.digest().clone();
        if let Some(declared) = upload.digest.as_deref().filter(|d| !d.is_empty()) {
            verify_digest(&declared.parse::<Digest>()?, &digest)?;
        }

        let content_type = upload
            .content_type
            .filter(|content_type| !content_type.trim().is_empty())
            .unwrap_or_else(|| OCI_MANIFEST_MEDIA_TYPE.to_string());

        let file_name = names::manifest_file_name(&upload.image, &upload.tag);
        let stored = self
            .uploads
            .store_manifest(
                group,
                &file_name,
                staged,
                upload.declared_size,
                &content_type,
                &digest,
            )
            .await?;

        let revision = ManifestRevision {
            digest,
            content_type,
            size: stored.size,
            storage_handle: stored.storage_handle,
        };
        self.cache_store
            .upsert_manifest(group, &file_name, revision)
            .await?;

        info!("Manifest {file_name} uploaded to {group}");
        self.track(ArtifactKind::Manifest, false, group, user);
        Ok(())
    }
}

async fn stage_relayed(
    uploads: &UploadBroker,
    mut reader: ChannelReader,
    maximum_size: u64,
) -> Result<StagedObject, Error> {
    uploads.stage(&mut reader, maximum_size).await
}

fn verify_digest(expected: &Digest, actual: &Digest) -> Result<(), Error> {
    if expected == actual {
        Ok(())
    } else {
        Err(Error::InvalidPayload(format!(
            "digest mismatch: expected {expected}, got {actual}"
        )))
    }
}
