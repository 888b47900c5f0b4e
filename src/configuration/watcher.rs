use crate::command;
use crate::command::server;
use crate::command::server::listeners::tls::ServerTlsConfig;
use crate::configuration::Configuration;
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

pub struct ConfigWatcher {
    _handle: tokio::task::JoinHandle<()>,
}

impl ConfigWatcher {
    pub fn new(config_path: &str, server: Arc<server::Command>) -> Result<Self, command::Error> {
        info!("Setting up config watcher for: {config_path}");

        let config_file_path = std::fs::canonicalize(PathBuf::from(config_path))?;

        let handle = tokio::spawn(async move {
            if let Err(e) = watch_config_loop(config_file_path, server).await {
                error!("Config watcher failed: {e}");
            }
        });

        Ok(Self { _handle: handle })
    }
}

fn get_tls_paths(tls_config: &ServerTlsConfig, config_dir: &Path) -> HashSet<PathBuf> {
    [
        Some(&tls_config.server_certificate_bundle),
        Some(&tls_config.server_private_key),
        tls_config.client_ca_bundle.as_ref(),
    ]
    .into_iter()
    .flatten()
    .filter_map(|path_str| {
        let path = Path::new(path_str);
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            config_dir.join(path)
        };
        resolved.canonicalize().ok()
    })
    .collect()
}

fn tls_paths(config: &Configuration, config_dir: &Path) -> HashSet<PathBuf> {
    config
        .server
        .tls
        .as_ref()
        .map(|tls| get_tls_paths(tls, config_dir))
        .unwrap_or_default()
}

async fn watch_config_loop(
    config_path: PathBuf,
    server: Arc<server::Command>,
) -> Result<(), command::Error> {
    let (tx, mut rx) = mpsc::channel::<Event>(100);
    let config_dir = config_path
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    loop {
        let tx_clone = tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx_clone.blocking_send(event);
            }
        })?;

        watcher.watch(&config_path, RecursiveMode::NonRecursive)?;

        let current_config = Configuration::load(&config_path)?;
        let watched_tls_paths = tls_paths(&current_config, &config_dir);
        for path in &watched_tls_paths {
            watcher.watch(path, RecursiveMode::NonRecursive)?;
            info!("Watching TLS file: {path:?}");
        }

        let mut should_restart_watcher = false;

        while !should_restart_watcher {
            match rx.recv().await {
                Some(event)
                    if matches!(
                        event.kind,
                        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any)
                    ) =>
                {
                    if event.paths.iter().any(|p| p == &config_path) {
                        info!("Configuration file changed, reloading");

                        let new_config = match Configuration::load(&config_path) {
                            Ok(config) => config,
                            Err(err) => {
                                error!("Failed to reload configuration: {err}");
                                continue;
                            }
                        };

                        if tls_paths(&new_config, &config_dir) != watched_tls_paths {
                            info!("TLS file paths changed, recreating watchers");
                            should_restart_watcher = true;
                        }

                        match server.notify_config_change(&new_config) {
                            Ok(()) => info!("Configuration reloaded"),
                            Err(err) => {
                                error!("Failed to notify server of configuration change: {err}");
                            }
                        }
                    } else if event.paths.iter().any(|p| watched_tls_paths.contains(p)) {
                        info!("TLS certificate changed, reloading");
                        reload_tls_only(&server, &config_path);
                    }
                }
                None => {
                    error!("Config watcher channel closed");
                    return Ok(());
                }
                _ => {}
            }
        }

        drop(watcher);
    }
}

fn reload_tls_only(server: &server::Command, config_path: &Path) {
    let Ok(config) = Configuration::load(config_path) else {
        return;
    };

    if let Some(tls_config) = &config.server.tls {
        match server.notify_tls_config_change(tls_config) {
            Ok(()) => info!("TLS configuration reloaded"),
            Err(err) => error!("Failed to reload TLS configuration: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_get_tls_paths_resolves_relative_paths() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("server.crt"), "cert").unwrap();
        fs::write(temp_dir.path().join("server.key"), "key").unwrap();

        let tls_config = ServerTlsConfig {
            server_certificate_bundle: "server.crt".to_string(),
            server_private_key: "server.key".to_string(),
            client_ca_bundle: Some("missing-ca.crt".to_string()),
        };

        let paths = get_tls_paths(&tls_config, temp_dir.path());

        assert_eq!(paths.len(), 2);
        let root = temp_dir.path().canonicalize().unwrap();
        assert!(paths.contains(&root.join("server.crt")));
        assert!(paths.contains(&root.join("server.key")));
    }

    #[test]
    fn test_tls_paths_without_tls_section() {
        let config = Configuration::load_from_str("").unwrap();
        assert!(tls_paths(&config, Path::new(".")).is_empty());
    }
}
