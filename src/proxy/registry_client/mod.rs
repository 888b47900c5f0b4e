mod authentication_scheme;
mod bearer_token;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use http_body_util::{BodyExt, Empty, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{
    ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, ETAG, LOCATION, WWW_AUTHENTICATE,
};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::RootCertStore;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use serde::Deserialize;
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::configuration;
use crate::oci::Digest;
use crate::proxy::settings::GroupSetting;
use crate::proxy::utils::{body_reader, Reader};
use crate::proxy::Error;
use authentication_scheme::AuthenticationScheme;
use bearer_token::BearerToken;

pub const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

const MAX_TOKEN_RESPONSE_SIZE: usize = 64 * 1024;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "Config::default_url")]
    pub url: String,
    pub auth_url: Option<String>,
    pub service: Option<String>,
    #[serde(default = "Config::default_official_images_namespace")]
    pub official_images_namespace: bool,
    #[serde(default = "Config::default_max_redirect")]
    pub max_redirect: u8,
    #[serde(default = "Config::default_token_timeout")]
    pub token_timeout: u64,
    #[serde(default = "Config::default_fetch_timeout")]
    pub fetch_timeout: u64,
    #[serde(default = "Config::default_read_timeout")]
    pub read_timeout: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub server_ca_bundle: Option<String>,
    pub client_certificate: Option<String>,
    pub client_private_key: Option<String>,
}

impl Config {
    fn default_url() -> String {
        "https://registry-1.docker.io".to_string()
    }

    fn default_official_images_namespace() -> bool {
        true
    }

    fn default_max_redirect() -> u8 {
        5
    }

    fn default_token_timeout() -> u64 {
        30
    }

    fn default_fetch_timeout() -> u64 {
        60
    }

    fn default_read_timeout() -> u64 {
        300
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
            auth_url: None,
            service: None,
            official_images_namespace: Self::default_official_images_namespace(),
            max_redirect: Self::default_max_redirect(),
            token_timeout: Self::default_token_timeout(),
            fetch_timeout: Self::default_fetch_timeout(),
            read_timeout: Self::default_read_timeout(),
            username: None,
            password: None,
            server_ca_bundle: None,
            client_certificate: None,
            client_private_key: None,
        }
    }
}

/// A successful upstream response, body not yet consumed.
pub struct UpstreamResponse {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub digest: Option<String>,
    pub etag: Option<String>,
    pub body: Box<dyn Reader>,
}

impl UpstreamResponse {
    fn from_response(response: Response<Incoming>) -> Self {
        let headers = response.headers();
        let header = |name: &str| -> Option<String> {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(ToString::to_string)
        };

        Self {
            content_type: header(CONTENT_TYPE.as_str()),
            content_length: header(CONTENT_LENGTH.as_str()).and_then(|v| v.parse().ok()),
            digest: header(DOCKER_CONTENT_DIGEST),
            etag: header(ETAG.as_str()),
            body: Box::new(body_reader(response.into_body())),
        }
    }

    /// Headers relayed to the client on a cache miss.
    pub fn forwarded_headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::new();
        if let Some(content_type) = &self.content_type {
            headers.push(("Content-Type", content_type.clone()));
        }
        if let Some(content_length) = self.content_length {
            headers.push(("Content-Length", content_length.to_string()));
        }
        if let Some(digest) = &self.digest {
            headers.push((DOCKER_CONTENT_DIGEST, digest.clone()));
        }
        if let Some(etag) = &self.etag {
            headers.push(("Etag", etag.clone()));
        }
        headers
    }
}

/// The upstream registry, as seen by the proxy.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Exchanges credentials for a pull-scoped bearer token for `image`.
    ///
    /// An empty token means the registry serves pulls anonymously.
    async fn request_token(&self, image: &str, setting: &GroupSetting) -> Result<String, Error>;

    fn manifest_url(&self, image: &str, tag: &str) -> String;

    fn blob_url(&self, image: &str, digest: &Digest) -> String;

    async fn fetch(
        &self,
        url: &str,
        token: &str,
        accept: &[String],
    ) -> Result<UpstreamResponse, Error>;

    /// Same as `fetch` with a `HEAD` request: headers only, empty body.
    async fn fetch_head(
        &self,
        url: &str,
        token: &str,
        accept: &[String],
    ) -> Result<UpstreamResponse, Error>;
}

#[derive(Clone, Debug)]
struct TokenEndpoint {
    realm: String,
    service: Option<String>,
}

/// How the upstream registry expects pulls to be authorized.
#[derive(Clone, Debug)]
enum TokenPolicy {
    Anonymous,
    Bearer(TokenEndpoint),
}

pub struct RegistryClient {
    client: Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
    registry_url: String,
    configured_endpoint: Option<TokenEndpoint>,
    discovered_policy: RwLock<Option<TokenPolicy>>,
    official_images_namespace: bool,
    basic_auth: Option<(String, String)>,
    max_redirect: u8,
    token_timeout: Duration,
    fetch_timeout: Duration,
}

fn basic_auth_header(username: &str, password: &str) -> String {
    let encoded = BASE64_STANDARD.encode(format!("{username}:{password}"));
    format!("Basic {encoded}")
}

fn resolve_location(current: &Uri, location: &str) -> Result<Uri, Error> {
    if location.starts_with('/') {
        let mut builder = Uri::builder().path_and_query(location);
        if let Some(scheme) = current.scheme() {
            builder = builder.scheme(scheme.clone());
        }
        if let Some(authority) = current.authority() {
            builder = builder.authority(authority.clone());
        }
        builder
            .build()
            .map_err(|err| Error::UpstreamFetch(format!("invalid redirect location: {err}")))
    } else {
        location
            .parse()
            .map_err(|err| Error::UpstreamFetch(format!("invalid redirect location: {err}")))
    }
}

impl RegistryClient {
    pub fn new(config: &Config) -> Result<Self, configuration::Error> {
        let tls_config = build_tls_config(
            config.server_ca_bundle.as_deref(),
            config.client_certificate.as_deref(),
            config.client_private_key.as_deref(),
        )?;

        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .build();

        let client = Client::builder(TokioExecutor::new()).build(connector);

        let basic_auth = match (&config.username, &config.password) {
            (Some(username), Some(password)) => Some((username.clone(), password.clone())),
            (Some(_), None) | (None, Some(_)) => {
                warn!("Upstream username and password must be both provided");
                None
            }
            _ => None,
        };

        let configured_endpoint = config.auth_url.as_ref().map(|realm| TokenEndpoint {
            realm: realm.clone(),
            service: config.service.clone(),
        });

        Ok(Self {
            client,
            registry_url: config.url.trim_end_matches('/').to_string(),
            configured_endpoint,
            discovered_policy: RwLock::new(None),
            official_images_namespace: config.official_images_namespace,
            basic_auth,
            max_redirect: config.max_redirect,
            token_timeout: Duration::from_secs(config.token_timeout),
            fetch_timeout: Duration::from_secs(config.fetch_timeout),
        })
    }

    /// Repository path on the upstream registry.
    ///
    /// Single-segment images live under `library/` on Docker Hub.
    fn image_path(&self, image: &str) -> String {
        if self.official_images_namespace && !image.contains('/') {
            format!("library/{image}")
        } else {
            image.to_string()
        }
    }

    async fn send(&self, request: Request<Empty<Bytes>>) -> Result<Response<Incoming>, Error> {
        timeout(self.token_timeout, self.client.request(request))
            .await
            .map_err(|_| Error::UpstreamAuth("token request timed out".to_string()))?
            .map_err(|err| Error::UpstreamAuth(format!("token request failed: {err}")))
    }

    async fn token_policy(&self) -> Result<TokenPolicy, Error> {
        if let Some(endpoint) = &self.configured_endpoint {
            return Ok(TokenPolicy::Bearer(endpoint.clone()));
        }

        let cached = self
            .discovered_policy
            .read()
            .ok()
            .and_then(|policy| policy.clone());
        if let Some(policy) = cached {
            return Ok(policy);
        }

        let request = Request::builder()
            .method(Method::GET)
            .uri(format!("{}/v2/", self.registry_url))
            .body(Empty::new())
            .map_err(|err| Error::UpstreamAuth(format!("invalid registry URL: {err}")))?;

        let response = self.send(request).await?;
        let policy = match response.status() {
            status if status.is_success() => {
                debug!("Registry accepts anonymous pulls");
                TokenPolicy::Anonymous
            }
            StatusCode::UNAUTHORIZED => {
                let challenge = response
                    .headers()
                    .get(WWW_AUTHENTICATE)
                    .and_then(|value| value.to_str().ok())
                    .ok_or_else(|| {
                        Error::UpstreamAuth("missing WWW-Authenticate header".to_string())
                    })?;

                match AuthenticationScheme::from_www_authenticate_header(challenge)? {
                    AuthenticationScheme::Bearer(realm, mut parameters) => {
                        debug!("Discovered token endpoint {realm}");
                        TokenPolicy::Bearer(TokenEndpoint {
                            realm,
                            service: parameters.remove("service"),
                        })
                    }
                    AuthenticationScheme::Basic => {
                        return Err(Error::UpstreamAuth(
                            "registry requires basic authentication".to_string(),
                        ))
                    }
                }
            }
            status => {
                return Err(Error::UpstreamAuth(format!(
                    "registry did not issue a bearer challenge ({status})"
                )))
            }
        };

        if let Ok(mut discovered) = self.discovered_policy.write() {
            *discovered = Some(policy.clone());
        }

        Ok(policy)
    }

    async fn follow_redirects(
        &self,
        method: &Method,
        url: &str,
        token: &str,
        accept: &[String],
    ) -> Result<Response<Incoming>, Error> {
        let origin: Uri = url
            .parse()
            .map_err(|err| Error::UpstreamFetch(format!("invalid upstream URL: {err}")))?;
        let origin_authority = origin.authority().cloned();
        let mut uri = origin;

        for _ in 0..=self.max_redirect {
            let mut request = Request::builder().method(method).uri(uri.clone());
            // Pre-signed redirect targets reject foreign credentials.
            if !token.is_empty() && uri.authority() == origin_authority.as_ref() {
                request = request.header(AUTHORIZATION, format!("Bearer {token}"));
            }
            for media_type in accept {
                request = request.header(ACCEPT, media_type);
            }
            let request = request
                .body(Empty::new())
                .map_err(|err| Error::UpstreamFetch(format!("invalid upstream request: {err}")))?;

            let response = self
                .client
                .request(request)
                .await
                .map_err(|err| Error::UpstreamFetch(format!("upstream request failed: {err}")))?;

            if !response.status().is_redirection() {
                return Ok(response);
            }

            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| Error::UpstreamFetch("missing Location header".to_string()))?;

            debug!("Following redirect to {location}");
            uri = resolve_location(&uri, location)?;
        }

        Err(Error::UpstreamFetch("too many redirects".to_string()))
    }

    async fn fetch_with(
        &self,
        method: &Method,
        url: &str,
        token: &str,
        accept: &[String],
    ) -> Result<UpstreamResponse, Error> {
        let response = timeout(
            self.fetch_timeout,
            self.follow_redirects(method, url, token, accept),
        )
        .await
        .map_err(|_| Error::UpstreamTimeout)??;

        match response.status() {
            status if status.is_success() => Ok(UpstreamResponse::from_response(response)),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::UpstreamAuth(format!(
                "upstream rejected credentials ({})",
                response.status()
            ))),
            StatusCode::NOT_FOUND => Err(Error::NotFound(url.to_string())),
            StatusCode::GATEWAY_TIMEOUT => Err(Error::UpstreamTimeout),
            status => Err(Error::UpstreamFetch(format!("upstream returned {status}"))),
        }
    }
}

#[async_trait]
impl Upstream for RegistryClient {
    #[instrument(skip(self, setting))]
    async fn request_token(&self, image: &str, setting: &GroupSetting) -> Result<String, Error> {
        let endpoint = match self.token_policy().await? {
            TokenPolicy::Anonymous => return Ok(String::new()),
            TokenPolicy::Bearer(endpoint) => endpoint,
        };

        let scope = format!("repository:{}:pull", self.image_path(image));
        let mut parameters = Vec::new();
        if let Some(service) = &endpoint.service {
            parameters.push(("service", service.as_str()));
        }
        parameters.push(("scope", scope.as_str()));
        let query = serde_urlencoded::to_string(&parameters)
            .map_err(|err| Error::UpstreamAuth(format!("invalid token parameters: {err}")))?;

        let separator = if endpoint.realm.contains('?') { '&' } else { '?' };
        let mut request = Request::builder()
            .method(Method::GET)
            .uri(format!("{}{separator}{query}", endpoint.realm));

        let credentials = setting.credentials().or_else(|| {
            self.basic_auth
                .as_ref()
                .map(|(username, password)| (username.as_str(), password.as_str()))
        });
        if let Some((username, password)) = credentials {
            request = request.header(AUTHORIZATION, basic_auth_header(username, password));
        }

        let request = request
            .body(Empty::new())
            .map_err(|err| Error::UpstreamAuth(format!("invalid token realm: {err}")))?;

        let response = self.send(request).await?;
        if !response.status().is_success() {
            return Err(Error::UpstreamAuth(format!(
                "token request returned {}",
                response.status()
            )));
        }

        let body = timeout(
            self.token_timeout,
            Limited::new(response.into_body(), MAX_TOKEN_RESPONSE_SIZE).collect(),
        )
        .await
        .map_err(|_| Error::UpstreamAuth("token response timed out".to_string()))?
        .map_err(|err| Error::UpstreamAuth(format!("unable to read token response: {err}")))?
        .to_bytes();

        BearerToken::from_slice(&body)?.token()
    }

    fn manifest_url(&self, image: &str, tag: &str) -> String {
        format!(
            "{}/v2/{}/manifests/{tag}",
            self.registry_url,
            self.image_path(image)
        )
    }

    fn blob_url(&self, image: &str, digest: &Digest) -> String {
        format!(
            "{}/v2/{}/blobs/{digest}",
            self.registry_url,
            self.image_path(image)
        )
    }

    #[instrument(skip(self, token))]
    async fn fetch(
        &self,
        url: &str,
        token: &str,
        accept: &[String],
    ) -> Result<UpstreamResponse, Error> {
        self.fetch_with(&Method::GET, url, token, accept).await
    }

    #[instrument(skip(self, token))]
    async fn fetch_head(
        &self,
        url: &str,
        token: &str,
        accept: &[String],
    ) -> Result<UpstreamResponse, Error> {
        self.fetch_with(&Method::HEAD, url, token, accept).await
    }
}

fn build_tls_config(
    ca_bundle: Option<&str>,
    client_cert: Option<&str>,
    client_key: Option<&str>,
) -> Result<rustls::ClientConfig, configuration::Error> {
    let mut root_store = RootCertStore::empty();

    let certs = if let Some(bundle) = ca_bundle {
        CertificateDer::pem_file_iter(bundle)?.collect::<Result<Vec<_>, _>>()?
    } else {
        rustls_native_certs::load_native_certs().certs
    };

    root_store.add_parsable_certificates(certs);

    let config = rustls::ClientConfig::builder().with_root_certificates(root_store);

    match (client_cert, client_key) {
        (Some(cert), Some(key)) => {
            let certs = CertificateDer::pem_file_iter(cert)?.collect::<Result<Vec<_>, _>>()?;
            let key = PrivateKeyDer::from_pem_file(key)?;
            Ok(config.with_client_auth_cert(certs, key)?)
        }
        (None, None) => Ok(config.with_no_client_auth()),
        _ => {
            warn!("Client certificate and key must both be provided");
            Ok(config.with_no_client_auth())
        }
    }
}
