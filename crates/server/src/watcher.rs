//! Env-file reloading.
//!
//! The configuration surface is a flat env file plus the process environment
//! (the environment wins on conflicts). A background task polls the file's
//! mtime; when it changes, the merged map is re-parsed and published as a new
//! snapshot, and the registry and egress pool are rebuilt from it. Invalid
//! content is rejected without a swap, so a botched edit never takes the
//! proxy down.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use spindle_core::{ConfigSnapshot, ConfigStore, EgressPool, ProviderRegistry};
use tokio::{sync::broadcast, time::interval};
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Reads the env file (when present) and overlays the process environment.
#[must_use]
pub fn load_config_map(path: &Path) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if path.exists() {
        match dotenvy::from_path_iter(path) {
            Ok(entries) => {
                for entry in entries {
                    match entry {
                        Ok((key, value)) => {
                            map.insert(key, value);
                        }
                        Err(err) => {
                            warn!(path = %path.display(), error = %err, "skipping malformed env line");
                        }
                    }
                }
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read env file");
            }
        }
    }
    map.extend(std::env::vars());
    map
}

/// Spawns the mtime poller. Exits on the shutdown signal.
#[must_use]
pub fn start_env_watcher(
    path: PathBuf,
    config: Arc<ConfigStore>,
    registry: Arc<ProviderRegistry>,
    egresses: EgressPool,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(POLL_INTERVAL);
        let mut last_modified = modified_at(&path);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let modified = modified_at(&path);
                    if modified != last_modified {
                        last_modified = modified;
                        info!(path = %path.display(), "env file changed, reloading");
                        apply_env_file(&path, &config, &registry, &egresses);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("env watcher shutting down");
                    break;
                }
            }
        }
    })
}

/// Re-reads the env file and, when it parses and differs from the active
/// snapshot, publishes it and rebuilds the derived state.
pub fn apply_env_file(
    path: &Path,
    config: &Arc<ConfigStore>,
    registry: &Arc<ProviderRegistry>,
    egresses: &EgressPool,
) {
    let map = load_config_map(path);
    match ConfigSnapshot::from_map(&map) {
        Ok(snapshot) => {
            let before = config.version();
            let version = config.publish(snapshot);
            if version != before {
                let active = config.snapshot();
                registry.reload(&active);
                egresses.reload(&active.proxies, active.proxy_max_failures);
                info!(version, "configuration reload applied");
            }
        }
        Err(err) => {
            warn!(error = %err, "configuration reload rejected, previous snapshot stays active");
        }
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_env_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("spindle-test-{name}-{}.env", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    fn state_from(
        map: &HashMap<String, String>,
    ) -> (Arc<ConfigStore>, Arc<ProviderRegistry>, EgressPool) {
        let snapshot = ConfigSnapshot::from_map(map).unwrap();
        let registry = Arc::new(ProviderRegistry::new(&snapshot));
        let egresses = EgressPool::new(&snapshot.proxies, snapshot.proxy_max_failures);
        (Arc::new(ConfigStore::new(snapshot)), registry, egresses)
    }

    #[test]
    fn env_file_values_are_loaded() {
        let path = temp_env_file(
            "load",
            "ALLOWED_TOKENS=tk\nAPI_KEYS=[\"sk-A\"]\nBASE_URL=https://api.example.com/v1\n",
        );
        let map = load_config_map(&path);
        assert_eq!(map.get("ALLOWED_TOKENS").map(String::as_str), Some("tk"));
        assert!(ConfigSnapshot::from_map(&map).is_ok());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_file_still_yields_process_env() {
        let map = load_config_map(Path::new("/nonexistent/spindle.env"));
        // The process environment is present even without a file.
        assert!(map.contains_key("PATH"));
    }

    #[test]
    fn valid_change_is_published_and_applied() {
        let initial = HashMap::from([
            ("ALLOWED_TOKENS".to_string(), "tk".to_string()),
            ("API_KEYS".to_string(), r#"["sk-A"]"#.to_string()),
        ]);
        let (config, registry, egresses) = state_from(&initial);

        let path = temp_env_file(
            "apply",
            "ALLOWED_TOKENS=tk\nAPI_KEYS=[\"sk-A\",\"sk-B\"]\nMAX_RETRIES=7\n",
        );
        apply_env_file(&path, &config, &registry, &egresses);

        assert_eq!(config.snapshot().max_retries, 7);
        assert_eq!(registry.provider("default").unwrap().credentials.len(), 2);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn invalid_change_keeps_previous_snapshot() {
        let initial = HashMap::from([
            ("ALLOWED_TOKENS".to_string(), "tk".to_string()),
            ("API_KEYS".to_string(), r#"["sk-A"]"#.to_string()),
        ]);
        let (config, registry, egresses) = state_from(&initial);
        let before = config.version();

        // No providers at all: the snapshot fails validation.
        let path = temp_env_file("reject", "ALLOWED_TOKENS=tk\nMAX_RETRIES=bogus\n");
        apply_env_file(&path, &config, &registry, &egresses);

        assert_eq!(config.version(), before);
        assert_eq!(config.snapshot().max_retries, 3);
        std::fs::remove_file(&path).ok();
    }
}
