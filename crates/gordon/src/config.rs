//! Configuration loading, atomic save, and live reload.
//!
//! `Config`/`ConfigManager` use serde-derived sections with
//! `#[serde(default = "...")]` per field, TOML (de)serialization, and a
//! write-to-temp-then-rename `save()` with 0600 permissions on Unix. There
//! are no upstream/cache/S3/TLS sections (Gordon has no upstream registry
//! and no pull-through cache); the recognized sections are exactly
//! `[server]`, `[auth]`, `[auto_route]`, `[routes]`, `[logging]`.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub auto_route: AutoRouteConfig,
    #[serde(default)]
    pub routes: HashMap<String, String>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_registry_port")]
    pub registry_port: u16,
    #[serde(default = "default_registry_domain")]
    pub registry_domain: String,
    #[serde(default = "default_runtime")]
    pub runtime: String,
    #[serde(default = "default_data_root")]
    pub data_root: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            registry_port: default_registry_port(),
            registry_domain: default_registry_domain(),
            runtime: default_runtime(),
            data_root: default_data_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_auth_method")]
    pub method: String,
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_token_validity")]
    pub token_validity: i64,
    #[serde(default = "default_anonymous_pull")]
    pub anonymous_pull: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            method: default_auth_method(),
            jwt_secret: default_jwt_secret(),
            api_key: None,
            token_validity: default_token_validity(),
            anonymous_pull: default_anonymous_pull(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AutoRouteConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_enabled")]
    pub enabled: bool,
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: default_logging_enabled(),
            level: default_log_level(),
            dir: None,
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_registry_port() -> u16 {
    5000
}

fn default_registry_domain() -> String {
    "registry.local".to_string()
}

fn default_runtime() -> String {
    "docker".to_string()
}

fn default_data_root() -> String {
    "./data/gordon".to_string()
}

fn default_auth_method() -> String {
    "jwt".to_string()
}

fn default_jwt_secret() -> String {
    "change-me-in-production".to_string()
}

fn default_token_validity() -> i64 {
    24 * 3600
}

fn default_anonymous_pull() -> bool {
    true
}

fn default_logging_enabled() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            auto_route: AutoRouteConfig::default(),
            routes: HashMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Locate a config file by the documented search order: an explicit
    /// `--config`, else `./gordon.toml`, else
    /// `$XDG_CONFIG_HOME/gordon/gordon.toml`, else `$HOME/.gordon/gordon.toml`,
    /// else `/etc/gordon/gordon.toml`. `None` if none of these exist and no
    /// explicit path was given — startup then fails.
    pub fn locate(explicit: Option<&str>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(PathBuf::from(path));
        }

        let candidates = [
            Some(PathBuf::from("./gordon.toml")),
            std::env::var_os("XDG_CONFIG_HOME")
                .map(|base| PathBuf::from(base).join("gordon/gordon.toml")),
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".gordon/gordon.toml")),
            Some(PathBuf::from("/etc/gordon/gordon.toml")),
        ];

        candidates.into_iter().flatten().find(|p| p.exists())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Atomic write-to-temp-then-rename, 0600 on Unix, so a crash mid-save
    /// never corrupts the file on disk.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).with_context(|| "failed to serialize configuration")?;
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        let temp_file = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("failed to create temp file in {:?}", parent))?;

        {
            let mut file = temp_file.as_file();
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
        }

        #[cfg(unix)]
        {
            let metadata = temp_file.as_file().metadata()?;
            let mut perms = metadata.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(temp_file.path(), perms)?;
        }

        temp_file
            .persist(path)
            .with_context(|| format!("failed to persist config file: {}", path.display()))?;

        info!(path = %path.display(), "saved configuration");
        Ok(())
    }
}

/// Thread-safe configuration handle shared between the HTTP layer, the
/// Deployment Controller, and the config-file watcher.
#[derive(Clone)]
pub struct ConfigManager {
    config: Arc<RwLock<Config>>,
    path: Arc<RwLock<PathBuf>>,
}

impl ConfigManager {
    pub fn new(config: Config, path: PathBuf) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            path: Arc::new(RwLock::new(path)),
        }
    }

    pub fn get(&self) -> Config {
        self.config.read().clone()
    }

    /// Reload from disk. On parse failure the previous configuration
    /// remains active and the error is only logged (config errors are
    /// fatal at startup, but merely logged on reload).
    pub fn reload(&self) {
        let path = self.path.read().clone();
        match Config::load(&path) {
            Ok(new_config) => {
                *self.config.write() = new_config;
                info!(path = %path.display(), "configuration reloaded");
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "config reload failed, keeping previous configuration");
            }
        }
    }
}

/// Watches the config file for changes with a 500ms debounce, collapsing a
/// burst of rapid edits (e.g. an editor's save-then-rewrite) into a single
/// reload. Returns the watcher, which must be kept alive for the duration
/// of the watch.
///
/// `on_reload` runs after each debounced re-read of the file and is the seam
/// that pushes the freshly loaded config's routes into the Deployment
/// Controller and publishes `config.reload` onto the Event Bus: re-read,
/// diff, emit, converge — this module only owns the filesystem-watch/debounce
/// mechanics, not what a reload means.
pub fn spawn_config_watch<F>(
    manager: ConfigManager,
    path: PathBuf,
    on_reload: F,
) -> Result<notify::RecommendedWatcher>
where
    F: Fn(Config) + Send + 'static,
{
    use notify::{Event, RecursiveMode, Watcher};

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Event>();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            let _ = tx.send(event);
        }
    })?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    tokio::spawn(async move {
        loop {
            let Some(_first) = rx.recv().await else {
                break;
            };

            loop {
                match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
                    Ok(Some(_)) => continue,
                    Ok(None) => return,
                    Err(_) => break,
                }
            }

            manager.reload();
            on_reload(manager.get());
        }
    });

    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = Config::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.server.port, config.server.port);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gordon.toml");
        let mut config = Config::default();
        config.routes.insert("app.example.com".to_string(), "app:latest".to_string());

        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.routes.get("app.example.com"), Some(&"app:latest".to_string()));
    }

    #[test]
    fn locate_prefers_explicit_path() {
        let located = Config::locate(Some("/some/explicit/path.toml"));
        assert_eq!(located, Some(PathBuf::from("/some/explicit/path.toml")));
    }
}
