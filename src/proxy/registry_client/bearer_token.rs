use serde::Deserialize;

use crate::proxy::Error;

#[derive(Deserialize)]
pub struct BearerToken {
    token: Option<String>,
    access_token: Option<String>,
}

impl BearerToken {
    pub fn from_slice(slice: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(slice)
            .map_err(|err| Error::UpstreamAuth(format!("malformed token response: {err}")))
    }

    pub fn token(self) -> Result<String, Error> {
        self.token
            .or(self.access_token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| Error::UpstreamAuth("missing token in token response".to_string()))
    }
}
