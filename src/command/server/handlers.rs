use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE};
use hyper::http::request::Parts;
use hyper::{Method, Response, StatusCode};
use tracing::instrument;

use crate::command::server::error::Error;
use crate::command::server::request_ext::HeaderExt;
use crate::command::server::response_body::ResponseBody;
use crate::command::server::route::Route;
use crate::command::server::upload_form::read_upload_form;
use crate::command::server::ServerContext;
use crate::metrics_provider::METRICS_PROVIDER;
use crate::proxy::registry_client::DOCKER_CONTENT_DIGEST;
use crate::proxy::tracking::ArtifactKind;
use crate::proxy::{
    ManifestUpload, PullResponse, DISTRIBUTION_API_VERSION, DISTRIBUTION_API_VERSION_HEADER,
};

const DEPENDENCY_CONTENT_TYPE: &str = "X-Dependency-Content-Type";

#[instrument(skip(context, parts, incoming))]
pub async fn dispatch_route(
    context: &ServerContext,
    route: Route<'_>,
    parts: &Parts,
    incoming: Incoming,
) -> Result<Response<ResponseBody>, Error> {
    match route {
        Route::Healthz => handle_healthz(),
        Route::Metrics => handle_metrics(),
        Route::ApiVersion => handle_api_version(),
        Route::GetManifest { group, image, tag } => {
            handle_get_manifest(context, parts, group, image, tag, false).await
        }
        Route::HeadManifest { group, image, tag } => {
            handle_get_manifest(context, parts, group, image, tag, true).await
        }
        Route::GetBlob { group, image, sha } => {
            handle_get_blob(context, parts, group, image, sha, false).await
        }
        Route::HeadBlob { group, image, sha } => {
            handle_get_blob(context, parts, group, image, sha, true).await
        }
        Route::AuthorizeUpload { group, kind } => handle_authorize_upload(context, group, kind),
        Route::UploadBlob { group } => handle_upload_blob(context, parts, incoming, group).await,
        Route::UploadManifest { group } => {
            handle_upload_manifest(context, parts, incoming, group).await
        }
        Route::Auth { group } => handle_auth(context, group),
        Route::Unknown => handle_unknown_route(parts),
    }
}

fn handle_unknown_route(parts: &Parts) -> Result<Response<ResponseBody>, Error> {
    if [Method::GET, Method::HEAD].contains(&parts.method) {
        let msg = format!("unknown route: {} {}", parts.method, parts.uri.path());
        Err(Error::NotFound(msg))
    } else {
        let msg = format!("unsupported route: {} {}", parts.method, parts.uri.path());
        Err(Error::BadRequest(msg))
    }
}

fn build_response(
    status: StatusCode,
    headers: &[(&str, String)],
    body: ResponseBody,
) -> Result<Response<ResponseBody>, Error> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(*name, value);
    }

    builder
        .body(body)
        .map_err(|e| Error::Internal(format!("Failed to build response: {e}")))
}

fn pull_response(pull: PullResponse, head: bool) -> Result<Response<ResponseBody>, Error> {
    let body = if head {
        ResponseBody::empty()
    } else {
        ResponseBody::streaming(pull.body)
    };

    build_response(StatusCode::OK, &pull.headers, body)
}

async fn handle_get_manifest(
    context: &ServerContext,
    parts: &Parts,
    group: &str,
    image: Option<String>,
    tag: Option<String>,
    head: bool,
) -> Result<Response<ResponseBody>, Error> {
    let (image, tag) = (image.as_deref(), tag.as_deref());
    let pull = if head {
        context.proxy.head_manifest(group, image, tag).await?
    } else {
        let user = parts.username();
        context
            .proxy
            .get_manifest(group, image, tag, user.as_deref())
            .await?
    };

    pull_response(pull, head)
}

async fn handle_get_blob(
    context: &ServerContext,
    parts: &Parts,
    group: &str,
    image: Option<String>,
    sha: Option<String>,
    head: bool,
) -> Result<Response<ResponseBody>, Error> {
    let (image, sha) = (image.as_deref(), sha.as_deref());
    let pull = if head {
        context.proxy.head_blob(group, image, sha).await?
    } else {
        let user = parts.username();
        context
            .proxy
            .get_blob(group, image, sha, user.as_deref())
            .await?
    };

    pull_response(pull, head)
}

fn handle_authorize_upload(
    context: &ServerContext,
    group: &str,
    kind: ArtifactKind,
) -> Result<Response<ResponseBody>, Error> {
    let authorization = context.proxy.authorize_upload(group, kind)?;
    let body = serde_json::to_vec(&authorization)
        .map_err(|e| Error::Internal(format!("Failed to serialize upload authorization: {e}")))?;

    build_response(
        StatusCode::OK,
        &[(CONTENT_TYPE.as_str(), "application/json".to_string())],
        ResponseBody::fixed(body),
    )
}

async fn handle_upload_blob(
    context: &ServerContext,
    parts: &Parts,
    incoming: Incoming,
    group: &str,
) -> Result<Response<ResponseBody>, Error> {
    context.proxy.check_auth(group)?;

    let boundary = parts.multipart_boundary()?;
    let body = incoming.into_data_stream();
    let mut form =
        read_upload_form(&context.proxy, group, ArtifactKind::Blob, boundary, body).await?;

    let sha = form
        .sha
        .take()
        .ok_or_else(|| Error::BadRequest("missing sha field".to_string()))?;
    let staged = form.take_staged()?;

    let user = parts.username();
    context
        .proxy
        .upload_blob(group, &sha, staged, form.file_size, user.as_deref())
        .await?;

    build_response(StatusCode::OK, &[], ResponseBody::empty())
}

async fn handle_upload_manifest(
    context: &ServerContext,
    parts: &Parts,
    incoming: Incoming,
    group: &str,
) -> Result<Response<ResponseBody>, Error> {
    context.proxy.check_auth(group)?;

    let boundary = parts.multipart_boundary()?;
    let body = incoming.into_data_stream();
    let mut form =
        read_upload_form(&context.proxy, group, ArtifactKind::Manifest, boundary, body).await?;
    let staged = form.take_staged()?;

    let upload = ManifestUpload {
        image: form.image.unwrap_or_default(),
        tag: form.tag.unwrap_or_default(),
        content_type: parts.get_header(DEPENDENCY_CONTENT_TYPE),
        digest: parts.get_header(DOCKER_CONTENT_DIGEST),
        declared_size: form.file_size,
    };

    let user = parts.username();
    context
        .proxy
        .upload_manifest(group, upload, staged, user.as_deref())
        .await?;

    build_response(StatusCode::OK, &[], ResponseBody::empty())
}

fn handle_auth(context: &ServerContext, group: &str) -> Result<Response<ResponseBody>, Error> {
    context.proxy.check_auth(group)?;
    build_response(
        StatusCode::OK,
        &[(CONTENT_LENGTH.as_str(), "0".to_string())],
        ResponseBody::empty(),
    )
}

fn handle_api_version() -> Result<Response<ResponseBody>, Error> {
    build_response(
        StatusCode::OK,
        &[
            (CONTENT_TYPE.as_str(), "application/json".to_string()),
            (
                DISTRIBUTION_API_VERSION_HEADER,
                DISTRIBUTION_API_VERSION.to_string(),
            ),
        ],
        ResponseBody::fixed("{}"),
    )
}

fn handle_healthz() -> Result<Response<ResponseBody>, Error> {
    build_response(
        StatusCode::OK,
        &[(CONTENT_TYPE.as_str(), "application/json".to_string())],
        ResponseBody::fixed(r#"{"status":"ok"}"#),
    )
}

fn handle_metrics() -> Result<Response<ResponseBody>, Error> {
    let (content_type, metrics) = METRICS_PROVIDER.gather()?;
    build_response(
        StatusCode::OK,
        &[(CONTENT_TYPE.as_str(), content_type)],
        ResponseBody::fixed(metrics),
    )
}
