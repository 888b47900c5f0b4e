use std::convert::Infallible;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use opentelemetry::trace::TraceContextExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::pin;
use tracing::{debug, error, info, instrument, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::command::server::error::Error;
use crate::command::server::handlers::dispatch_route;
use crate::command::server::response_body::ResponseBody;
use crate::command::server::{router, ServerContext};
use crate::metrics_provider::{IN_FLIGHT_REQUESTS, METRICS_PROVIDER};

fn update_in_flight_gauge() {
    METRICS_PROVIDER.metric_http_request_in_flight.set(
        i64::try_from(IN_FLIGHT_REQUESTS.load(Ordering::Relaxed)).unwrap_or(i64::MAX),
    );
}

pub async fn serve_request<S>(
    stream: TokioIo<S>,
    context: Arc<ServerContext>,
    timeouts: Arc<[Duration; 2]>,
    remote_address: SocketAddr,
) where
    S: Unpin + AsyncWrite + AsyncRead + Send + Debug + 'static,
{
    let conn = http1::Builder::new().serve_connection(
        stream,
        service_fn(move |mut request| {
            request.extensions_mut().insert(remote_address);
            handle_request(Arc::clone(&context), request)
        }),
    );
    pin!(conn);

    IN_FLIGHT_REQUESTS.fetch_add(1, Ordering::Relaxed);
    update_in_flight_gauge();

    for (iter, sleep_duration) in timeouts.iter().enumerate() {
        tokio::select! {
            res = conn.as_mut() => {
                match res {
                    Ok(()) => debug!("Connection from {remote_address} closed"),
                    Err(error) => debug!("Error serving connection from {remote_address}: {error}"),
                }
                break;
            }
            () = tokio::time::sleep(*sleep_duration) => {
                debug!("iter = {iter} got timeout_interval, calling conn.graceful_shutdown");
                conn.as_mut().graceful_shutdown();
            }
        }
    }

    IN_FLIGHT_REQUESTS.fetch_sub(1, Ordering::Relaxed);
    update_in_flight_gauge();
}

#[instrument(skip(context, request))]
async fn handle_request(
    context: Arc<ServerContext>,
    request: Request<Incoming>,
) -> Result<Response<ResponseBody>, Infallible> {
    let start_time = Instant::now();
    let method = request.method().to_owned();
    let path = request.uri().path().to_owned();
    let route_action = router::parse(request.method(), request.uri()).action_name();

    let trace_id = {
        let context = Span::current().context();
        let span = context.span();
        let span_context = span.span_context();
        if span_context.is_valid() {
            Some(span_context.trace_id().to_string())
        } else {
            None
        }
    };

    let response = match route_request(&context, request).await {
        Ok(response) => response,
        Err(error) => error_to_response(&error, trace_id.as_ref()),
    };

    #[allow(clippy::cast_precision_loss)]
    let elapsed = start_time.elapsed().as_millis() as f64;
    let status = response.status();

    METRICS_PROVIDER
        .metric_http_request_total
        .with_label_values(&[method.as_str(), route_action, status.as_str()])
        .inc();
    METRICS_PROVIDER
        .metric_http_request_duration
        .with_label_values(&[method.as_str(), route_action])
        .observe(elapsed);

    let log = if let Some(trace_id) = trace_id {
        format!("{trace_id} {elapsed:?} - {status} {method} {path}")
    } else {
        format!("{elapsed:?} - {status} {method} {path}")
    };

    if status.is_server_error() {
        error!("{log}");
    } else {
        info!("{log}");
    }

    Ok(response)
}

async fn route_request(
    context: &ServerContext,
    request: Request<Incoming>,
) -> Result<Response<ResponseBody>, Error> {
    let (parts, incoming) = request.into_parts();
    let route = router::parse(&parts.method, &parts.uri);

    dispatch_route(context, route, &parts, incoming).await
}

pub fn error_to_response(error: &Error, request_id: Option<&String>) -> Response<ResponseBody> {
    let body = error.as_json(request_id).to_string();

    let mut response = Response::new(ResponseBody::fixed(body));
    *response.status_mut() = error.status_code();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::server::server_context::tests::{
        create_test_proxy, DISABLED_GROUP, ENABLED_GROUP,
    };
    use crate::oci::Digest;
    use crate::proxy;
    use crate::proxy::registry_client::{MockUpstream, UpstreamResponse};
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use hyper::{Method, StatusCode};
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioExecutor;
    use std::io::Cursor;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    const MANIFEST: &[u8] = br#"{"schemaVersion":2,"layers":[]}"#;
    const BOUNDARY: &str = "X-BOUNDARY";

    struct TestServer {
        address: SocketAddr,
        proxy: Arc<proxy::DependencyProxy>,
        _temp_dir: TempDir,
    }

    async fn start_server(upstream: MockUpstream) -> TestServer {
        let (proxy, temp_dir) = create_test_proxy(upstream);
        let context = Arc::new(ServerContext::new(proxy.clone()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let timeouts = Arc::new([Duration::from_secs(30), Duration::from_secs(1)]);

        tokio::spawn(async move {
            loop {
                let (tcp, remote_address) = listener.accept().await.unwrap();
                tokio::spawn(serve_request(
                    TokioIo::new(tcp),
                    Arc::clone(&context),
                    Arc::clone(&timeouts),
                    remote_address,
                ));
            }
        });

        TestServer {
            address,
            proxy,
            _temp_dir: temp_dir,
        }
    }

    async fn send(
        server: &TestServer,
        request: Request<Full<Bytes>>,
    ) -> (StatusCode, hyper::HeaderMap, Bytes) {
        let client = Client::builder(TokioExecutor::new()).build_http();
        let (mut parts, body) = request.into_parts();
        parts.uri = format!("http://{}{}", server.address, parts.uri).parse().unwrap();

        let response = client
            .request(Request::from_parts(parts, body))
            .await
            .unwrap();
        let (parts, body) = response.into_parts();
        let body = body.collect().await.unwrap().to_bytes();
        (parts.status, parts.headers, body)
    }

    fn empty_request(method: Method, path: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    fn multipart_request(path: &str) -> hyper::http::request::Builder {
        Request::builder()
            .method(Method::PUT)
            .uri(path)
            .header(
                CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
    }

    fn multipart_body(fields: &[(&str, &[u8])]) -> Full<Bytes> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
            );
            body.extend_from_slice(value);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        Full::new(Bytes::from(body))
    }

    fn manifest_upstream(calls: usize) -> MockUpstream {
        let digest = Digest::of(MANIFEST);
        let mut upstream = MockUpstream::new();
        upstream
            .expect_request_token()
            .returning(|_, _| Ok("token".to_string()));
        upstream
            .expect_manifest_url()
            .returning(|image, tag| format!("https://upstream/v2/{image}/manifests/{tag}"));
        upstream.expect_fetch().times(calls).returning(move |_, _, _| {
            Ok(UpstreamResponse {
                content_type: Some("application/vnd.docker.distribution.manifest.v2+json".to_string()),
                content_length: Some(MANIFEST.len() as u64),
                digest: Some(digest.to_string()),
                etag: None,
                body: Box::new(Cursor::new(MANIFEST)),
            })
        });
        upstream
    }

    #[test]
    fn test_error_to_response_not_found() {
        let response = error_to_response(&Error::from(proxy::Error::NotEnabled), None);

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[tokio::test]
    async fn test_error_to_response_body() {
        let error = Error::from(proxy::Error::UpstreamTimeout);
        let request_id = Some("req-timeout".to_string());

        let response = error_to_response(&error, request_id.as_ref());
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["errors"][0]["code"], "UPSTREAM_TIMEOUT");
        assert_eq!(json["errors"][0]["detail"]["request_id"], "req-timeout");
    }

    #[tokio::test]
    async fn test_manifest_pull_through_and_cache_hit() {
        let server = start_server(manifest_upstream(1)).await;
        let path = format!("/{ENABLED_GROUP}/dependency_proxy/manifests?image=alpine&tag=latest");

        let (status, headers, body) = send(&server, empty_request(Method::GET, &path)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], MANIFEST);
        assert_eq!(
            headers.get("docker-distribution-api-version").unwrap(),
            "registry/2.0"
        );

        server.proxy.wait_for_cache_jobs().await;

        let (status, headers, body) = send(&server, empty_request(Method::GET, &path)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], MANIFEST);
        assert_eq!(
            headers.get("docker-content-digest").unwrap(),
            Digest::of(MANIFEST).to_string().as_str()
        );
        assert_eq!(
            headers.get("etag").unwrap(),
            format!("\"{}\"", Digest::of(MANIFEST)).as_str()
        );
    }

    #[tokio::test]
    async fn test_docker_native_head_manifest_from_cache() {
        let server = start_server(manifest_upstream(1)).await;
        let query = format!("/{ENABLED_GROUP}/dependency_proxy/manifests?image=alpine&tag=latest");
        send(&server, empty_request(Method::GET, &query)).await;
        server.proxy.wait_for_cache_jobs().await;

        let path = format!("/v2/{ENABLED_GROUP}/dependency_proxy/containers/alpine/manifests/latest");
        let (status, headers, body) = send(&server, empty_request(Method::HEAD, &path)).await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
        assert_eq!(
            headers.get("content-length").unwrap(),
            MANIFEST.len().to_string().as_str()
        );
    }

    #[tokio::test]
    async fn test_head_manifest_miss_uses_upstream_head() {
        let mut upstream = manifest_upstream(0);
        upstream.expect_fetch_head().times(1).returning(|_, _, _| {
            Ok(UpstreamResponse {
                content_type: None,
                content_length: Some(MANIFEST.len() as u64),
                digest: Some(Digest::of(MANIFEST).to_string()),
                etag: None,
                body: Box::new(tokio::io::empty()),
            })
        });
        let server = start_server(upstream).await;

        let path = format!("/v2/{ENABLED_GROUP}/dependency_proxy/containers/alpine/manifests/latest");
        let (status, headers, body) = send(&server, empty_request(Method::HEAD, &path)).await;
        server.proxy.wait_for_cache_jobs().await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
        assert_eq!(
            headers.get("docker-content-digest").unwrap(),
            Digest::of(MANIFEST).to_string().as_str()
        );
    }

    #[tokio::test]
    async fn test_disabled_group_is_not_found_everywhere() {
        let server = start_server(MockUpstream::new()).await;
        let unknown_group = "/nobody/dependency_proxy/auth".to_string();

        let requests = vec![
            empty_request(Method::GET, &format!("/{DISABLED_GROUP}/dependency_proxy/manifests")),
            empty_request(Method::HEAD, &format!("/{DISABLED_GROUP}/dependency_proxy/blobs?sha=bogus")),
            empty_request(Method::POST, &format!("/{DISABLED_GROUP}/dependency_proxy/blobs/authorize")),
            empty_request(Method::GET, &format!("/{DISABLED_GROUP}/dependency_proxy/auth")),
            empty_request(Method::PUT, &format!("/{DISABLED_GROUP}/dependency_proxy/manifests")),
            empty_request(Method::GET, &unknown_group),
        ];

        let mut bodies = Vec::new();
        for request in requests {
            let is_head = request.method() == Method::HEAD;
            let (status, _, body) = send(&server, request).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            if !is_head {
                bodies.push(body);
            }
        }

        assert!(bodies.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[tokio::test]
    async fn test_missing_parameters_are_bad_request() {
        let server = start_server(MockUpstream::new()).await;

        let path = format!("/{ENABLED_GROUP}/dependency_proxy/manifests?image=alpine");
        let (status, _, body) = send(&server, empty_request(Method::GET, &path)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["errors"][0]["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_authorize_and_auth() {
        let server = start_server(MockUpstream::new()).await;

        let path = format!("/{ENABLED_GROUP}/dependency_proxy/blobs/authorize");
        let (status, _, body) = send(&server, empty_request(Method::POST, &path)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            &body[..],
            br#"{"hasKnownLength":false,"maximumSize":5368709120}"#
        );

        let path = format!("/{ENABLED_GROUP}/dependency_proxy/manifests/authorize");
        let (_, _, body) = send(&server, empty_request(Method::POST, &path)).await;
        assert_eq!(
            &body[..],
            br#"{"hasKnownLength":false,"maximumSize":10485760}"#
        );

        let path = format!("/{ENABLED_GROUP}/dependency_proxy/auth");
        let (status, _, body) = send(&server, empty_request(Method::GET, &path)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_upload_blob_then_pull_from_cache() {
        let server = start_server(MockUpstream::new()).await;
        let layer = b"layer bytes";
        let digest = Digest::of(layer).to_string();

        let path = format!("/{ENABLED_GROUP}/dependency_proxy/blobs");
        let request = multipart_request(&path)
            .body(multipart_body(&[
                ("sha", digest.as_bytes()),
                ("file", layer),
            ]))
            .unwrap();
        let (status, _, _) = send(&server, request).await;
        assert_eq!(status, StatusCode::OK);

        let path = format!("/{ENABLED_GROUP}/dependency_proxy/blobs?sha={digest}");
        let (status, headers, body) = send(&server, empty_request(Method::GET, &path)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], layer);
        assert_eq!(
            headers.get("docker-content-digest").unwrap(),
            digest.as_str()
        );
    }

    #[tokio::test]
    async fn test_upload_blob_with_wrong_digest() {
        let server = start_server(MockUpstream::new()).await;
        let digest = Digest::of(b"something else").to_string();

        let path = format!("/{ENABLED_GROUP}/dependency_proxy/blobs");
        let request = multipart_request(&path)
            .body(multipart_body(&[
                ("sha", digest.as_bytes()),
                ("file", b"layer bytes"),
            ]))
            .unwrap();
        let (status, _, _) = send(&server, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_upload_manifest_then_pull_from_cache() {
        let mut upstream = MockUpstream::new();
        upstream
            .expect_request_token()
            .returning(|_, _| Ok("token".to_string()));
        let server = start_server(upstream).await;
        let digest = Digest::of(MANIFEST).to_string();
        let content_type = "application/vnd.docker.distribution.manifest.v2+json";

        let path = format!("/{ENABLED_GROUP}/dependency_proxy/manifests");
        let request = multipart_request(&path)
            .header("X-Dependency-Content-Type", content_type)
            .header("Docker-Content-Digest", digest.as_str())
            .body(multipart_body(&[
                ("image", b"alpine"),
                ("tag", b"3.19"),
                ("file", MANIFEST),
            ]))
            .unwrap();
        let (status, _, _) = send(&server, request).await;
        assert_eq!(status, StatusCode::OK);

        let path = format!("/{ENABLED_GROUP}/dependency_proxy/manifests?image=alpine&tag=3.19");
        let (status, headers, body) = send(&server, empty_request(Method::GET, &path)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], MANIFEST);
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), content_type);
        assert_eq!(headers.get("docker-content-digest").unwrap(), digest.as_str());
    }

    #[tokio::test]
    async fn test_upload_manifest_with_mismatched_digest() {
        let server = start_server(MockUpstream::new()).await;

        let path = format!("/{ENABLED_GROUP}/dependency_proxy/manifests");
        let request = multipart_request(&path)
            .header("Docker-Content-Digest", Digest::of(b"other").to_string())
            .body(multipart_body(&[
                ("image", b"alpine"),
                ("tag", b"3.19"),
                ("file", MANIFEST),
            ]))
            .unwrap();
        let (status, _, _) = send(&server, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_routes() {
        let server = start_server(MockUpstream::new()).await;

        let (status, _, _) = send(&server, empty_request(Method::GET, "/nothing/here")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _, _) = send(&server, empty_request(Method::DELETE, "/nothing/here")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_api_version_and_healthz() {
        let server = start_server(MockUpstream::new()).await;

        let (status, headers, body) = send(&server, empty_request(Method::GET, "/v2/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"{}");
        assert!(headers.contains_key("docker-distribution-api-version"));

        let (status, _, body) = send(&server, empty_request(Method::GET, "/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], br#"{"status":"ok"}"#);
    }
}
