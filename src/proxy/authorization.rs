use serde::Serialize;

use crate::proxy::tracking::ArtifactKind;

pub const MAX_BLOB_FILE_SIZE: u64 = 5 * 1024 * 1024 * 1024;
pub const MAX_MANIFEST_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Pre-flight descriptor handed to the relay that streams an upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAuthorization {
    pub has_known_length: bool,
    pub maximum_size: u64,
}

pub fn authorize(has_known_length: bool, maximum_size: u64) -> UploadAuthorization {
    UploadAuthorization {
        has_known_length,
        maximum_size,
    }
}

impl ArtifactKind {
    pub fn maximum_size(self) -> u64 {
        match self {
            ArtifactKind::Blob => MAX_BLOB_FILE_SIZE,
            ArtifactKind::Manifest => MAX_MANIFEST_FILE_SIZE,
        }
    }
}
