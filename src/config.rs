//! Gateway Configuration
//!
//! Two layers, matching how they change:
//!
//! - [`GatewayConfig`]: process-level settings loaded once from environment
//!   variables (ports, public address, signature key).
//! - [`ChatConfig`]: routing and debug settings loaded from `mqtt.json` and
//!   hot-reloaded by the [`ConfigManager`], which hands out the current
//!   snapshot and change notifications.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use tokio::sync::watch;
use tracing::{info, warn};

/// Process-level configuration from environment variables.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// TCP port for the device pub/sub listener.
    pub mqtt_port: u16,
    /// UDP port for the audio channel.
    pub udp_port: u16,
    /// Public address advertised to devices in the hello reply.
    pub public_ip: String,
    /// HTTP admin API port.
    pub admin_port: u16,
    /// Key mixed into the daily admin bearer token.
    pub signature_key: String,
    /// Bearer token presented to upstream chat servers.
    pub upstream_token: String,
    /// Path to the hot-reloaded routing config.
    pub config_file: PathBuf,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            mqtt_port: 1883,
            udp_port: 8884,
            public_ip: "mqtt.xiaozhi.me".to_string(),
            admin_port: 8007,
            signature_key: "test".to_string(),
            upstream_token: "test-token".to_string(),
            config_file: PathBuf::from("mqtt.json"),
        }
    }
}

impl GatewayConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("MQTT_PORT") {
            if let Ok(parsed) = val.parse() {
                config.mqtt_port = parsed;
            }
        }

        if let Ok(val) = std::env::var("UDP_PORT") {
            if let Ok(parsed) = val.parse() {
                config.udp_port = parsed;
            }
        }

        if let Ok(val) = std::env::var("PUBLIC_IP") {
            config.public_ip = val;
        }

        if let Ok(val) = std::env::var("ADMIN_PORT") {
            if let Ok(parsed) = val.parse() {
                config.admin_port = parsed;
            }
        }

        if let Ok(val) = std::env::var("MQTT_SIGNATURE_KEY") {
            config.signature_key = val;
        }

        if let Ok(val) = std::env::var("UPSTREAM_TOKEN") {
            config.upstream_token = val;
        }

        if let Ok(val) = std::env::var("MQTT_CONFIG_FILE") {
            config.config_file = PathBuf::from(val);
        }

        config
    }
}

/// One routing bucket of `mqtt.json`.
///
/// `mac_addresss` keeps the historical spelling of the deployed config files.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatBucket {
    #[serde(default)]
    pub mac_addresss: Vec<String>,
    #[serde(default)]
    pub chat_servers: Vec<String>,
}

/// Hot-reloadable contents of `mqtt.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatConfig {
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub log_invalid_cookie: bool,
    #[serde(default)]
    pub development: ChatBucket,
    #[serde(default)]
    pub production: ChatBucket,
}

impl ChatConfig {
    pub fn from_file(path: &std::path::Path) -> std::io::Result<Self> {
        let raw = std::fs::read(path)?;
        serde_json::from_slice(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// Owns the current [`ChatConfig`] snapshot and publishes changes.
///
/// Collaborators take `snapshot()` for point-in-time reads and `subscribe()`
/// to react to reloads (the debug-level toggle in `main` does).
pub struct ConfigManager {
    current: watch::Sender<Arc<ChatConfig>>,
    path: Option<PathBuf>,
}

impl ConfigManager {
    /// Creates a manager over a fixed in-memory config (no file, no reload).
    pub fn fixed(config: ChatConfig) -> Self {
        let (tx, _) = watch::channel(Arc::new(config));
        ConfigManager { current: tx, path: None }
    }

    /// Loads the file and creates a manager that will reload it on change.
    ///
    /// A missing or unparsable file logs a warning and starts empty; the
    /// gateway still serves devices, they just cannot open sessions until a
    /// valid config appears.
    pub fn from_file(path: PathBuf) -> Self {
        let config = match ChatConfig::from_file(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!("failed to load {}: {}", path.display(), e);
                ChatConfig::default()
            }
        };
        let (tx, _) = watch::channel(Arc::new(config));
        ConfigManager { current: tx, path: Some(path) }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<ChatConfig> {
        self.current.borrow().clone()
    }

    /// Subscribes to config changes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ChatConfig>> {
        self.current.subscribe()
    }

    /// Replaces the snapshot (used by tests and by the reload task).
    pub fn replace(&self, config: ChatConfig) {
        self.current.send_replace(Arc::new(config));
    }

    /// Polls the config file mtime and republishes on change.
    ///
    /// Runs until the shutdown signal fires. No-op for fixed managers.
    pub async fn run_reload(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let path = match &self.path {
            Some(p) => p.clone(),
            None => return,
        };

        let mut last_mtime = file_mtime(&path);
        let mut interval = tokio::time::interval(Duration::from_secs(2));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let mtime = file_mtime(&path);
                    if mtime == last_mtime {
                        continue;
                    }
                    last_mtime = mtime;

                    match ChatConfig::from_file(&path) {
                        Ok(config) => {
                            info!("reloaded {}", path.display());
                            self.replace(config);
                        }
                        Err(e) => warn!("config reload failed, keeping previous: {}", e),
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}

fn file_mtime(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
