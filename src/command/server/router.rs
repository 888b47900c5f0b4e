use hyper::{Method, Uri};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::route::Route;
use crate::proxy::tracking::ArtifactKind;

const DEPENDENCY_PROXY_SEGMENT: &str = "/dependency_proxy/";
const CONTAINERS_SEGMENT: &str = "/dependency_proxy/containers/";

fn parse_query<T: DeserializeOwned + Default>(params: Option<&str>) -> T {
    params
        .and_then(|params| serde_urlencoded::from_str(params).ok())
        .unwrap_or_default()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.is_empty())
}

#[derive(Deserialize, Default)]
struct ManifestQuery {
    image: Option<String>,
    tag: Option<String>,
}

#[derive(Deserialize, Default)]
struct BlobQuery {
    sha: Option<String>,
    image: Option<String>,
}

pub fn parse<'a>(method: &Method, uri: &'a Uri) -> Route<'a> {
    let path = uri.path();
    let params = uri.query();

    match path {
        "/healthz" if method == Method::GET => return Route::Healthz,
        "/metrics" if method == Method::GET => return Route::Metrics,
        "/v2" | "/v2/" if method == Method::GET => return Route::ApiVersion,
        _ => {}
    }

    if let Some(path) = path.strip_prefix("/v2/") {
        return try_parse_containers(method, path).unwrap_or(Route::Unknown);
    }

    let Some(path) = path.strip_prefix('/') else {
        return Route::Unknown;
    };

    try_parse_dependency_proxy(method, path, params).unwrap_or(Route::Unknown)
}

fn try_parse_dependency_proxy<'a>(
    method: &Method,
    path: &'a str,
    params: Option<&str>,
) -> Option<Route<'a>> {
    let position = path.find(DEPENDENCY_PROXY_SEGMENT)?;
    let group = &path[..position];
    if group.is_empty() {
        return None;
    }

    let action = &path[position + DEPENDENCY_PROXY_SEGMENT.len()..];
    let route = match (method, action) {
        (&Method::GET | &Method::HEAD, "manifests") => {
            let query = parse_query::<ManifestQuery>(params);
            let (image, tag) = (non_empty(query.image), non_empty(query.tag));
            if method == Method::HEAD {
                Route::HeadManifest { group, image, tag }
            } else {
                Route::GetManifest { group, image, tag }
            }
        }
        (&Method::GET | &Method::HEAD, "blobs") => {
            let query = parse_query::<BlobQuery>(params);
            let (image, sha) = (non_empty(query.image), non_empty(query.sha));
            if method == Method::HEAD {
                Route::HeadBlob { group, image, sha }
            } else {
                Route::GetBlob { group, image, sha }
            }
        }
        (&Method::POST, "blobs/authorize") => Route::AuthorizeUpload {
            group,
            kind: ArtifactKind::Blob,
        },
        (&Method::POST, "manifests/authorize") => Route::AuthorizeUpload {
            group,
            kind: ArtifactKind::Manifest,
        },
        (&Method::PUT, "blobs") => Route::UploadBlob { group },
        (&Method::PUT, "manifests") => Route::UploadManifest { group },
        (&Method::GET, "auth") => Route::Auth { group },
        _ => return None,
    };

    Some(route)
}

fn try_parse_containers<'a>(method: &Method, path: &'a str) -> Option<Route<'a>> {
    if method != Method::GET && method != Method::HEAD {
        return None;
    }

    let position = path.find(CONTAINERS_SEGMENT)?;
    let group = &path[..position];
    let rest = &path[position + CONTAINERS_SEGMENT.len()..];
    if group.is_empty() {
        return None;
    }

    if let Some(position) = rest.rfind("/manifests/") {
        let image = non_empty(Some(rest[..position].to_string()));
        let tag = non_empty(Some(rest[position + "/manifests/".len()..].to_string()));

        return Some(if method == Method::HEAD {
            Route::HeadManifest { group, image, tag }
        } else {
            Route::GetManifest { group, image, tag }
        });
    }

    if let Some(position) = rest.rfind("/blobs/") {
        let image = non_empty(Some(rest[..position].to_string()));
        let sha = non_empty(Some(rest[position + "/blobs/".len()..].to_string()));

        return Some(if method == Method::HEAD {
            Route::HeadBlob { group, image, sha }
        } else {
            Route::GetBlob { group, image, sha }
        });
    }

    None
}
