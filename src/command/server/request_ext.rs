use crate::command::server::error::Error;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use hyper::header::{AsHeaderName, AUTHORIZATION, CONTENT_TYPE};
use hyper::http::request::Parts;

static BASIC_PREFIX: &str = "Basic ";

pub trait HeaderExt {
    fn get_header<K: AsHeaderName>(&self, header: K) -> Option<String>;
    fn basic_auth(&self) -> Option<(String, String)>;
    fn username(&self) -> Option<String>;
    fn multipart_boundary(&self) -> Result<String, Error>;
}

impl HeaderExt for Parts {
    fn get_header<K>(&self, header: K) -> Option<String>
    where
        K: AsHeaderName,
    {
        self.headers
            .get(header)
            .and_then(|header| header.to_str().ok())
            .map(ToString::to_string)
    }

    fn basic_auth(&self) -> Option<(String, String)> {
        let authorization = self.get_header(AUTHORIZATION)?;

        let value = authorization.strip_prefix(BASIC_PREFIX)?;
        let value = BASE64_STANDARD.decode(value).ok()?;
        let value = String::from_utf8(value).ok()?;

        let (username, password) = value.split_once(':')?;
        Some((username.to_string(), password.to_string()))
    }

    fn username(&self) -> Option<String> {
        self.basic_auth()
            .map(|(username, _)| username)
            .filter(|username| !username.is_empty())
    }

    fn multipart_boundary(&self) -> Result<String, Error> {
        let content_type = self
            .get_header(CONTENT_TYPE)
            .ok_or_else(|| Error::BadRequest("missing Content-Type header".to_string()))?;

        Ok(multer::parse_boundary(content_type)?)
    }
}
