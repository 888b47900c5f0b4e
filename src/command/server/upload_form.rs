use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use multer::{Constraints, Multipart, SizeLimit};
use std::io;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::command::server::error::Error;
use crate::proxy::storage::StagedObject;
use crate::proxy::tracking::ArtifactKind;
use crate::proxy::DependencyProxy;

const FILE_FIELD: &str = "file";
const MAX_TEXT_FIELD_SIZE: u64 = 16 * 1024;

/// Fields of an upload form, with the `file` part already staged.
#[derive(Debug, Default)]
pub struct UploadForm {
    pub staged: Option<StagedObject>,
    pub sha: Option<String>,
    pub image: Option<String>,
    pub tag: Option<String>,
    pub file_size: Option<u64>,
}

impl UploadForm {
    pub fn take_staged(&mut self) -> Result<StagedObject, Error> {
        self.staged
            .take()
            .ok_or_else(|| Error::BadRequest("missing file field".to_string()))
    }
}

/// Reads a multipart upload, streaming its `file` field into the staging area.
pub async fn read_upload_form<S, E>(
    proxy: &DependencyProxy,
    group: &str,
    kind: ArtifactKind,
    boundary: String,
    body: S,
) -> Result<UploadForm, Error>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
{
    let constraints = Constraints::new().size_limit(
        SizeLimit::new()
            .per_field(MAX_TEXT_FIELD_SIZE)
            .for_field(FILE_FIELD, kind.maximum_size()),
    );
    let mut multipart = Multipart::with_constraints(body, boundary, constraints);
    let mut form = UploadForm::default();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();

        if name == FILE_FIELD {
            if form.staged.is_some() {
                return Err(Error::BadRequest("duplicate file field".to_string()));
            }

            let mut reader = StreamReader::new(Box::pin(field.map_err(io::Error::other)));
            let staged = proxy.stage_upload(group, kind, &mut reader).await?;
            debug!("Staged upload of {} bytes", staged.size());
            form.staged = Some(staged);
            continue;
        }

        let value = field.text().await?;
        match name.as_str() {
            "sha" => form.sha = Some(value),
            "image" => form.image = Some(value),
            "tag" => form.tag = Some(value),
            "file.size" => {
                let size = value.trim().parse().map_err(|_| {
                    Error::BadRequest(format!("invalid file.size value: '{value}'"))
                })?;
                form.file_size = Some(size);
            }
            _ => debug!("Ignoring multipart field '{name}'"),
        }
    }

    Ok(form)
}
