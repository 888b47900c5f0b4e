use crate::proxy::tracking::ArtifactKind;

/// Parsed request path and action.
#[derive(Debug, PartialEq)]
pub enum Route<'a> {
    Healthz,
    Metrics,
    ApiVersion,
    GetManifest {
        group: &'a str,
        image: Option<String>,
        tag: Option<String>,
    },
    HeadManifest {
        group: &'a str,
        image: Option<String>,
        tag: Option<String>,
    },
    GetBlob {
        group: &'a str,
        image: Option<String>,
        sha: Option<String>,
    },
    HeadBlob {
        group: &'a str,
        image: Option<String>,
        sha: Option<String>,
    },
    AuthorizeUpload {
        group: &'a str,
        kind: ArtifactKind,
    },
    UploadBlob {
        group: &'a str,
    },
    UploadManifest {
        group: &'a str,
    },
    Auth {
        group: &'a str,
    },
    Unknown,
}

impl Route<'_> {
    pub fn action_name(&self) -> &'static str {
        match self {
            Route::Healthz => "healthz",
            Route::Metrics => "metrics",
            Route::ApiVersion => "get-api-version",
            Route::GetManifest { .. } | Route::HeadManifest { .. } => "get-manifest",
            Route::GetBlob { .. } | Route::HeadBlob { .. } => "get-blob",
            Route::AuthorizeUpload {
                kind: ArtifactKind::Blob,
                ..
            } => "authorize-blob-upload",
            Route::AuthorizeUpload {
                kind: ArtifactKind::Manifest,
                ..
            } => "authorize-manifest-upload",
            Route::UploadBlob { .. } => "upload-blob",
            Route::UploadManifest { .. } => "upload-manifest",
            Route::Auth { .. } => "auth",
            Route::Unknown => "unknown",
        }
    }
}
