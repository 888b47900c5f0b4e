use regex::Regex;
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::LazyLock;

use crate::oci::Error;

static DIGEST_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<algorithm>[a-z0-9]+):(?P<hash>[a-f0-9]{64})$").unwrap()
});

#[derive(Debug, Clone, Eq, Hash, PartialEq)]
pub enum Digest {
    Sha256(String),
}

impl Digest {
    pub fn algorithm(&self) -> &str {
        match self {
            Digest::Sha256(_) => "sha256",
        }
    }

    pub fn hash(&self) -> &str {
        match self {
            Digest::Sha256(s) => s,
        }
    }

    /// Digest of the finalized hasher state.
    pub fn from_hasher(hasher: Sha256) -> Self {
        let hash = hasher.finalize();
        Digest::Sha256(hex::encode(hash.as_slice()))
    }

    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self::from_hasher(hasher)
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let captures = DIGEST_REGEX
            .captures(s)
            .ok_or_else(|| Error::InvalidFormat(s.to_string()))?;

        match &captures["algorithm"] {
            "sha256" => Ok(Digest::Sha256(captures["hash"].to_string())),
            algorithm => Err(Error::UnsupportedAlgorithm(algorithm.to_string())),
        }
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm(), self.hash())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Digest, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DigestVisitor;

        impl Visitor<'_> for DigestVisitor {
            type Value = Digest;

            fn expecting(&self, formatter: &mut Formatter) -> fmt::Result {
                formatter.write_str("a valid digest string")
            }

            fn visit_str<E>(self, value: &str) -> Result<Digest, E>
            where
                E: serde::de::Error,
            {
                value.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_str(DigestVisitor)
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_WORLD: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_parse_sha256() {
        let digest: Digest = format!("sha256:{HELLO_WORLD}").parse().unwrap();
        assert_eq!(digest.algorithm(), "sha256");
        assert_eq!(digest.hash(), HELLO_WORLD);
        assert_eq!(digest.to_string(), format!("sha256:{HELLO_WORLD}"));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(matches!(
            "sha256:abc".parse::<Digest>(),
            Err(Error::InvalidFormat(_))
        ));
        assert!(matches!(
            "../../etc/passwd".parse::<Digest>(),
            Err(Error::InvalidFormat(_))
        ));
        assert_eq!(
            format!("sha512:{HELLO_WORLD}").parse::<Digest>(),
            Err(Error::UnsupportedAlgorithm("sha512".to_string()))
        );
    }

    #[test]
    fn test_digest_of() {
        assert_eq!(Digest::of(b"hello world").hash(), HELLO_WORLD);
    }

    #[test]
    fn test_serde() {
        let digest = Digest::of(b"hello world");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"sha256:{HELLO_WORLD}\""));

        let parsed: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, digest);
    }
}
