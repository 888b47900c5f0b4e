use std::fmt;

use hyper::StatusCode;
use serde_json::json;
use tracing::{debug, error, warn};

use crate::{configuration, proxy};

const NOT_FOUND_MESSAGE: &str = "dependency proxy resource not found";

#[derive(Debug, PartialEq)]
pub enum Error {
    Initialization(String),
    Execution(String),
    // mappable to classical HTTP responses
    BadRequest(String),
    NotFound(String),
    Internal(String),
    Custom {
        status_code: StatusCode,
        code: String,
        msg: Option<String>,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Initialization(err) | Error::Execution(err) => write!(f, "{err}"),
            Error::BadRequest(err) => write!(f, "Bad Request: {err}"),
            Error::NotFound(err) => write!(f, "Not Found: {err}"),
            Error::Internal(err) => write!(f, "Internal Server Error: {err}"),
            Error::Custom {
                status_code,
                code: message,
                msg: details,
            } => {
                if let Some(details) = details {
                    write!(f, "Error {status_code}: {message} - {details}")
                } else {
                    write!(f, "Error {status_code}: {message}")
                }
            }
        }
    }
}

impl From<proxy::Error> for Error {
    fn from(error: proxy::Error) -> Self {
        match error {
            proxy::Error::NotEnabled => Error::NotFound(NOT_FOUND_MESSAGE.to_string()),
            proxy::Error::NotFound(what) => {
                debug!("Upstream resource not found: {what}");
                Error::NotFound(NOT_FOUND_MESSAGE.to_string())
            }
            proxy::Error::InvalidPayload(msg) => Error::BadRequest(msg),
            proxy::Error::UpstreamAuth(msg) => {
                warn!("Upstream authentication failed: {msg}");
                Error::Custom {
                    status_code: StatusCode::UNAUTHORIZED,
                    code: "UNAUTHORIZED".to_string(),
                    msg: Some("upstream authentication failed".to_string()),
                }
            }
            proxy::Error::UpstreamFetch(msg) => {
                warn!("Upstream fetch failed: {msg}");
                Error::Custom {
                    status_code: StatusCode::BAD_GATEWAY,
                    code: "UPSTREAM_ERROR".to_string(),
                    msg: Some("upstream request failed".to_string()),
                }
            }
            proxy::Error::UpstreamTimeout => Error::Custom {
                status_code: StatusCode::GATEWAY_TIMEOUT,
                code: "UPSTREAM_TIMEOUT".to_string(),
                msg: Some("upstream request timed out".to_string()),
            },
            proxy::Error::Storage(msg) => {
                error!("Storage failure: {msg}");
                Error::Internal("storage failure".to_string())
            }
        }
    }
}

impl From<configuration::Error> for Error {
    fn from(error: configuration::Error) -> Self {
        Error::Initialization(error.to_string())
    }
}

impl From<prometheus::Error> for Error {
    fn from(error: prometheus::Error) -> Self {
        Error::Internal(format!("Unable to encode metrics: {error}"))
    }
}

impl From<multer::Error> for Error {
    fn from(error: multer::Error) -> Self {
        debug!("Multipart error: {error}");
        Error::BadRequest(format!("invalid multipart payload: {error}"))
    }
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Initialization(_) | Error::Execution(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Error::Custom { status_code, .. } => *status_code,
        }
    }

    pub fn as_json(&self, request_id: Option<&String>) -> serde_json::Value {
        let (code, message) = match self {
            Error::BadRequest(msg) => ("BAD_REQUEST", Some(msg.as_str())),
            Error::NotFound(msg) => ("NOT_FOUND", Some(msg.as_str())),
            Error::Initialization(msg) | Error::Execution(msg) | Error::Internal(msg) => {
                ("INTERNAL_SERVER_ERROR", Some(msg.as_str()))
            }
            Error::Custom { code, msg, .. } => (code.as_str(), msg.as_deref()),
        };

        if let Some(request_id) = request_id {
            json!({
                "errors": [{
                    "code": code,
                    "message": message,
                    "detail": { "request_id": request_id }
                }]
            })
        } else {
            json!({
                "errors": [{
                    "code": code,
                    "message": message,
                }]
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = Error::Initialization("Some init error".to_string());
        assert_eq!(format!("{error}"), "Some init error");

        let error = Error::BadRequest("Malformed request".to_string());
        assert_eq!(format!("{error}"), "Bad Request: Malformed request");

        let error = Error::NotFound("Item not found".to_string());
        assert_eq!(format!("{error}"), "Not Found: Item not found");

        let error = Error::Custom {
            status_code: StatusCode::BAD_GATEWAY,
            code: "UPSTREAM_ERROR".to_string(),
            msg: Some("upstream request failed".to_string()),
        };
        assert_eq!(
            format!("{error}"),
            "Error 502 Bad Gateway: UPSTREAM_ERROR - upstream request failed"
        );
    }

    #[test]
    fn test_proxy_error_status_mapping() {
        let cases = [
            (proxy::Error::NotEnabled, StatusCode::NOT_FOUND),
            (proxy::Error::NotFound("x".to_string()), StatusCode::NOT_FOUND),
            (
                proxy::Error::UpstreamAuth("x".to_string()),
                StatusCode::UNAUTHORIZED,
            ),
            (
                proxy::Error::UpstreamFetch("x".to_string()),
                StatusCode::BAD_GATEWAY,
            ),
            (proxy::Error::UpstreamTimeout, StatusCode::GATEWAY_TIMEOUT),
            (
                proxy::Error::Storage("x".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                proxy::Error::InvalidPayload("x".to_string()),
                StatusCode::BAD_REQUEST,
            ),
        ];

        for (error, status) in cases {
            assert_eq!(Error::from(error).status_code(), status);
        }
    }

    #[test]
    fn test_not_enabled_and_not_found_are_indistinguishable() {
        let disabled = Error::from(proxy::Error::NotEnabled);
        let missing = Error::from(proxy::Error::NotFound(
            "https://registry.example.com/v2/library/alpine/manifests/latest".to_string(),
        ));

        assert_eq!(disabled, missing);
        assert_eq!(disabled.as_json(None), missing.as_json(None));
    }

    #[test]
    fn test_upstream_details_are_not_exposed() {
        let error = Error::from(proxy::Error::UpstreamFetch(
            "connection refused to 10.0.0.1".to_string(),
        ));
        let json = error.as_json(None).to_string();

        assert!(json.contains("UPSTREAM_ERROR"));
        assert!(!json.contains("10.0.0.1"));

        let error = Error::from(proxy::Error::Storage("/var/lib/x: EACCES".to_string()));
        assert!(!error.as_json(None).to_string().contains("/var/lib"));
    }

    #[test]
    fn test_as_json_without_request_id() {
        let error = Error::BadRequest("Missing parameter".to_string());
        let json = error.as_json(None);

        assert_eq!(json["errors"][0]["code"], "BAD_REQUEST");
        assert_eq!(json["errors"][0]["message"], "Missing parameter");
        assert!(json["errors"][0].get("detail").is_none());
    }

    #[test]
    fn test_as_json_with_request_id() {
        let error = Error::from(proxy::Error::UpstreamTimeout);
        let request_id = Some("req-12345".to_string());
        let json = error.as_json(request_id.as_ref());

        assert_eq!(json["errors"][0]["code"], "UPSTREAM_TIMEOUT");
        assert_eq!(json["errors"][0]["detail"]["request_id"], "req-12345");
    }
}
