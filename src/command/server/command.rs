use std::sync::Arc;
use std::time::Duration;

use argh::FromArgs;
use tracing::{info, warn};

use super::listeners::insecure::InsecureListener;
use super::listeners::tls::{ServerTlsConfig, TlsListener};
use super::ServerContext;
use crate::command::server::error::Error;
use crate::configuration::{Configuration, GlobalConfig};
use crate::proxy::registry_client::RegistryClient;
use crate::proxy::settings::GroupSettings;
use crate::proxy::tracking::MetricsTracker;
use crate::proxy::utils::TeeConfig;
use crate::proxy::{cache_store, storage, DependencyProxy};

pub enum ServiceListener {
    Insecure(InsecureListener),
    Secure(TlsListener),
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(
    subcommand,
    name = "serve",
    description = "Run the dependency proxy listener"
)]
pub struct Options {}

pub struct Command {
    listener: ServiceListener,
    settings: Arc<GroupSettings>,
    proxy: Arc<DependencyProxy>,
}

fn build_tee_config(global: &GlobalConfig, read_timeout: u64) -> TeeConfig {
    TeeConfig {
        buffer_size: usize::try_from(global.streaming_buffer_size.as_u64()).unwrap_or(usize::MAX),
        channel_capacity: global.streaming_channel_capacity,
        read_timeout: Duration::from_secs(read_timeout),
    }
}

fn build_proxy(
    config: &Configuration,
    settings: Arc<GroupSettings>,
) -> Result<DependencyProxy, Error> {
    let upstream = match RegistryClient::new(&config.upstream) {
        Ok(client) => client,
        Err(err) => {
            let msg = format!("Failed to initialize upstream registry client: {err}");
            return Err(Error::Initialization(msg));
        }
    };

    let storage = storage::fs::Backend::new(&config.storage);
    let cache_store = cache_store::fs::Backend::new(&config.storage);
    let tee = build_tee_config(&config.global, config.upstream.read_timeout);

    Ok(DependencyProxy::new(
        settings,
        Arc::new(upstream),
        Arc::new(cache_store),
        Arc::new(storage),
        Arc::new(MetricsTracker),
        tee,
    ))
}

impl Command {
    pub fn new(config: &Configuration) -> Result<Command, Error> {
        let settings = Arc::new(GroupSettings::new(&config.group));
        let proxy = Arc::new(build_proxy(config, settings.clone())?);
        let context = Arc::new(ServerContext::new(proxy.clone()));

        let listener = match &config.server.tls {
            None => ServiceListener::Insecure(InsecureListener::new(&config.server, context)),
            Some(tls_config) => {
                ServiceListener::Secure(TlsListener::new(&config.server, tls_config, context)?)
            }
        };

        Ok(Command {
            listener,
            settings,
            proxy,
        })
    }

    /// Applies a reloaded configuration: group settings, query timeouts and TLS material.
    ///
    /// Upstream and storage settings are read once at startup.
    pub fn notify_config_change(&self, config: &Configuration) -> Result<(), Error> {
        self.settings.replace(&config.group);

        match (&self.listener, &config.server.tls) {
            (ServiceListener::Insecure(listener), None) => {
                listener.notify_config_change(&config.server);
            }
            (ServiceListener::Secure(listener), Some(_)) => {
                listener.notify_config_change(&config.server)?;
            }
            _ => warn!("Switching between TLS and plain listeners requires a restart"),
        }

        Ok(())
    }

    pub fn notify_tls_config_change(&self, tls_config: &ServerTlsConfig) -> Result<(), Error> {
        if let ServiceListener::Secure(listener) = &self.listener {
            listener.notify_tls_config_change(tls_config)?;
        }

        Ok(())
    }

    pub async fn run(&self) -> Result<(), Error> {
        let serve = async {
            match &self.listener {
                ServiceListener::Insecure(listener) => listener.serve().await,
                ServiceListener::Secure(listener) => listener.serve().await,
            }
        };

        tokio::select! {
            result = serve => result?,
            _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
        }

        info!("Waiting for pending cache writes");
        self.proxy.wait_for_cache_jobs().await;
        Ok(())
    }
}
