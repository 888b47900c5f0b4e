use bytesize::ByteSize;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use tracing::error;

mod error;
pub mod watcher;

use crate::command::server::listeners::tls::ServerTlsConfig;
use crate::proxy::settings::GroupSetting;
use crate::proxy::{names, registry_client, storage};
pub use error::Error;

#[derive(Clone, Debug, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub upstream: registry_client::Config,
    #[serde(default)]
    pub storage: storage::fs::BackendConfig,
    #[serde(default)]
    pub group: HashMap<String, GroupSetting>, // hashmap of group path <-> dependency proxy setting
    #[serde(default)]
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "ServerConfig::default_bind_address")]
    pub bind_address: IpAddr,
    #[serde(default = "ServerConfig::default_port")]
    pub port: u16,
    #[serde(default = "ServerConfig::default_query_timeout")]
    pub query_timeout: u64,
    #[serde(default = "ServerConfig::default_query_timeout_grace_period")]
    pub query_timeout_grace_period: u64,
    pub tls: Option<ServerTlsConfig>,
}

impl ServerConfig {
    fn default_bind_address() -> IpAddr {
        IpAddr::from(Ipv4Addr::UNSPECIFIED)
    }

    fn default_port() -> u16 {
        8000
    }

    fn default_query_timeout() -> u64 {
        3600
    }

    fn default_query_timeout_grace_period() -> u64 {
        60
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: Self::default_bind_address(),
            port: Self::default_port(),
            query_timeout: Self::default_query_timeout(),
            query_timeout_grace_period: Self::default_query_timeout_grace_period(),
            tls: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "GlobalConfig::default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "GlobalConfig::default_streaming_buffer_size")]
    pub streaming_buffer_size: ByteSize,
    #[serde(default = "GlobalConfig::default_streaming_channel_capacity")]
    pub streaming_channel_capacity: usize,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            max_concurrent_requests: GlobalConfig::default_max_concurrent_requests(),
            streaming_buffer_size: GlobalConfig::default_streaming_buffer_size(),
            streaming_channel_capacity: GlobalConfig::default_streaming_channel_capacity(),
        }
    }
}

impl GlobalConfig {
    fn default_max_concurrent_requests() -> usize {
        4
    }

    fn default_streaming_buffer_size() -> ByteSize {
        ByteSize::kib(64)
    }

    fn default_streaming_channel_capacity() -> usize {
        16
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub tracing: Option<TracingConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TracingConfig {
    pub endpoint: String,
    pub sampling_rate: f64,
}

impl Configuration {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let config_str = fs::read_to_string(path)?;
        Self::load_from_str(&config_str)
    }

    pub fn load_from_str(slice: &str) -> Result<Self, Error> {
        let config: Configuration = toml::from_str(slice).inspect_err(|e| {
            error!("Configuration file format error: {e}");
        })?;

        if config.global.streaming_buffer_size.as_u64() == 0 {
            return Err(Error::Streaming(
                "Streaming buffer size must be greater than zero".to_string(),
            ));
        }
        if config.global.streaming_channel_capacity == 0 {
            return Err(Error::Streaming(
                "Streaming channel capacity must be greater than zero".to_string(),
            ));
        }

        if let Some(group) = config.group.keys().find(|g| !names::is_valid_group(g)) {
            return Err(Error::InvalidGroup(group.clone()));
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_minimal_config() {
        let config = Configuration::load_from_str("").unwrap();

        assert_eq!(config.global.max_concurrent_requests, 4);
        assert_eq!(config.global.streaming_buffer_size, ByteSize::kib(64));
        assert_eq!(config.global.streaming_channel_capacity, 16);

        assert_eq!(config.server.bind_address.to_string(), "0.0.0.0");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.query_timeout, 3600);
        assert_eq!(config.server.query_timeout_grace_period, 60);
        assert!(config.server.tls.is_none());

        assert_eq!(config.upstream.url, "https://registry-1.docker.io");
        assert!(config.upstream.official_images_namespace);
        assert_eq!(config.upstream.token_timeout, 30);
        assert_eq!(config.upstream.fetch_timeout, 60);
        assert_eq!(config.upstream.read_timeout, 300);

        assert_eq!(config.storage, storage::fs::BackendConfig::default());
        assert!(config.group.is_empty());
        assert!(config.observability.is_none());
    }

    #[test]
    fn test_load_full_config() {
        let config = r#"
        [server]
        bind_address = "127.0.0.1"
        port = 5000

        [server.tls]
        server_certificate_bundle = "/tls/server.crt"
        server_private_key = "/tls/server.key"

        [global]
        streaming_buffer_size = "128KiB"
        streaming_channel_capacity = 4

        [upstream]
        url = "https://mirror.example.com"
        auth_url = "https://auth.example.com/token"
        service = "mirror"
        official_images_namespace = false
        username = "robot"
        password = "secret"

        [storage]
        root_dir = "/data/proxy"
        sync_to_disk = true

        [group.acme]
        enabled = true

        [group."acme/team"]
        enabled = true
        username = "team-robot"
        password = "team-secret"

        [group.archived]

        [observability.tracing]
        endpoint = "http://otel:4317"
        sampling_rate = 0.5
        "#;

        let config = Configuration::load_from_str(config).unwrap();

        assert_eq!(config.server.port, 5000);
        let tls = config.server.tls.unwrap();
        assert_eq!(tls.server_certificate_bundle, "/tls/server.crt");
        assert!(tls.client_ca_bundle.is_none());

        assert_eq!(config.global.streaming_buffer_size, ByteSize::kib(128));
        assert_eq!(config.global.streaming_channel_capacity, 4);

        assert_eq!(config.upstream.url, "https://mirror.example.com");
        assert_eq!(
            config.upstream.auth_url.as_deref(),
            Some("https://auth.example.com/token")
        );
        assert!(!config.upstream.official_images_namespace);

        assert_eq!(config.storage.root_dir, "/data/proxy");
        assert!(config.storage.sync_to_disk);

        assert!(config.group["acme"].enabled);
        assert_eq!(
            config.group["acme/team"].credentials(),
            Some(("team-robot", "team-secret"))
        );
        assert!(!config.group["archived"].enabled);

        let tracing = config.observability.unwrap().tracing.unwrap();
        assert_eq!(tracing.endpoint, "http://otel:4317");
    }

    #[test]
    fn test_reject_zero_streaming_settings() {
        let config = r#"
        [global]
        streaming_buffer_size = 0
        "#;
        assert!(matches!(
            Configuration::load_from_str(config),
            Err(Error::Streaming(_))
        ));

        let config = r"
        [global]
        streaming_channel_capacity = 0
        ";
        assert!(matches!(
            Configuration::load_from_str(config),
            Err(Error::Streaming(_))
        ));
    }

    #[test]
    fn test_reject_invalid_group_name() {
        let config = r#"
        [group."../etc"]
        enabled = true
        "#;

        assert!(matches!(
            Configuration::load_from_str(config),
            Err(Error::InvalidGroup(_))
        ));
    }

    #[test]
    fn test_reject_malformed_file() {
        let config = r#"
        [server]
        port = "not a port"
        "#;

        assert!(matches!(
            Configuration::load_from_str(config),
            Err(Error::ConfigurationFileFormat(_))
        ));
    }
}
