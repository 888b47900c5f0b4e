use crate::command::server::error::Error;
use crate::command::server::listeners::{accept, binding_address, build_listener, timeouts};
use crate::command::server::serve_request;
use crate::command::server::ServerContext;
use crate::configuration::{self, ServerConfig};
use arc_swap::ArcSwap;
use hyper_util::rt::TokioIo;
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ServerTlsConfig {
    pub server_certificate_bundle: String,
    pub server_private_key: String,
    pub client_ca_bundle: Option<String>,
}

pub struct TlsListener {
    binding_address: SocketAddr,
    tls_acceptor: ArcSwap<TlsAcceptor>,
    context: Arc<ServerContext>,
    timeouts: ArcSwap<[Duration; 2]>,
}

impl TlsListener {
    pub fn new(
        config: &ServerConfig,
        tls_config: &ServerTlsConfig,
        context: Arc<ServerContext>,
    ) -> Result<Self, configuration::Error> {
        let tls_acceptor = ArcSwap::from_pointee(Self::build_tls_acceptor(tls_config)?);

        Ok(Self {
            binding_address: binding_address(config),
            tls_acceptor,
            context,
            timeouts: ArcSwap::from_pointee(timeouts(config)),
        })
    }

    pub fn notify_config_change(&self, config: &ServerConfig) -> Result<(), configuration::Error> {
        if let Some(tls_config) = &config.tls {
            self.notify_tls_config_change(tls_config)?;
        }

        self.timeouts.store(Arc::new(timeouts(config)));
        Ok(())
    }

    pub fn notify_tls_config_change(
        &self,
        tls_config: &ServerTlsConfig,
    ) -> Result<(), configuration::Error> {
        let acceptor = Arc::new(Self::build_tls_acceptor(tls_config)?);
        self.tls_acceptor.store(acceptor);

        Ok(())
    }

    fn build_tls_acceptor(tls_config: &ServerTlsConfig) -> Result<TlsAcceptor, configuration::Error> {
        debug!("Detected TLS configuration");
        let server_certs = CertificateDer::pem_file_iter(&tls_config.server_certificate_bundle)?
            .collect::<Result<_, _>>()?;
        let server_key = PrivateKeyDer::from_pem_file(&tls_config.server_private_key)?;

        let server_config = if let Some(client_ca_bundle) = tls_config.client_ca_bundle.as_ref() {
            debug!("Client CA bundle detected (will serve with TLS client authentication)");
            let client_certs: Vec<CertificateDer> =
                CertificateDer::pem_file_iter(client_ca_bundle)?.collect::<Result<_, _>>()?;

            let mut client_cert_store = RootCertStore::empty();
            for client_cert in client_certs {
                client_cert_store.add(client_cert)?;
            }

            let client_cert_verifier = WebPkiClientVerifier::builder(Arc::new(client_cert_store))
                .allow_unauthenticated()
                .build()?;

            rustls::ServerConfig::builder()
                .with_client_cert_verifier(client_cert_verifier)
                .with_single_cert(server_certs, server_key)?
        } else {
            debug!("No client CA bundle detected (will serve without TLS client authentication)");

            rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(server_certs, server_key)?
        };

        Ok(TlsAcceptor::from(Arc::new(server_config)))
    }

    pub async fn serve(&self) -> Result<(), Error> {
        info!("Listening on {} (TLS)", self.binding_address);
        let listener = build_listener(self.binding_address).await?;

        loop {
            let (tcp, remote_address) = accept(&listener).await?;

            let tls_acceptor = self.tls_acceptor.load();
            let tls_stream = tls_acceptor.accept(tcp).await;
            drop(tls_acceptor);

            let tls = match tls_stream {
                Ok(tls) => tls,
                Err(err) => {
                    warn!("TLS handshake with {remote_address} failed: {err}");
                    continue;
                }
            };

            let stream = TokioIo::new(tls);
            let context = Arc::clone(&self.context);
            let timeouts = Arc::clone(&self.timeouts.load());

            tokio::spawn(Box::pin(serve_request(
                stream,
                context,
                timeouts,
                remote_address,
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_deserialize_tls_config() {
        let config: ServerTlsConfig = toml::from_str(
            r#"
            server_certificate_bundle = "server.crt"
            server_private_key = "server.key"
            client_ca_bundle = "ca.crt"
            "#,
        )
        .unwrap();

        assert_eq!(config.server_certificate_bundle, "server.crt");
        assert_eq!(config.client_ca_bundle.as_deref(), Some("ca.crt"));
    }

    #[test]
    fn test_build_tls_acceptor_missing_files() {
        let tls_config = ServerTlsConfig {
            server_certificate_bundle: "/nonexistent/server.crt".to_string(),
            server_private_key: "/nonexistent/server.key".to_string(),
            client_ca_bundle: None,
        };

        assert!(matches!(
            TlsListener::build_tls_acceptor(&tls_config),
            Err(configuration::Error::Tls(_))
        ));
    }

    #[test]
    fn test_build_tls_acceptor_without_certificates() {
        let temp_dir = TempDir::new().unwrap();
        let cert = temp_dir.path().join("server.crt");
        let key = temp_dir.path().join("server.key");
        fs::write(&cert, "not a certificate").unwrap();
        fs::write(&key, "not a key").unwrap();

        let tls_config = ServerTlsConfig {
            server_certificate_bundle: cert.to_string_lossy().to_string(),
            server_private_key: key.to_string_lossy().to_string(),
            client_ca_bundle: None,
        };

        assert!(TlsListener::build_tls_acceptor(&tls_config).is_err());
    }
}
