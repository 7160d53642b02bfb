use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [relay]
//                    url = "http://10.0.0.5:3100"
//
//   env var:         VMUX_RELAY__URL=http://10.0.0.5:3100   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub relay: RelayFileConfig,
    #[serde(default)]
    pub persistence: PersistenceFileConfig,
    #[serde(default)]
    pub notifications: NotificationFileConfig,
}

/// Relay connection tunables (lives under `[relay]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayFileConfig {
    #[serde(default = "default_relay_url")]
    pub url: String,
    #[serde(default = "default_control_path")]
    pub control_path: String,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Room used for sessions that don't advertise a `room_name`.
    #[serde(default = "default_room")]
    pub default_room: String,
}

impl Default for RelayFileConfig {
    fn default() -> Self {
        Self {
            url: default_relay_url(),
            control_path: default_control_path(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            default_room: default_room(),
        }
    }
}

/// Local cache tunables (lives under `[persistence]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceFileConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for PersistenceFileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: default_retention_days(),
            flush_interval_ms: default_flush_interval_ms(),
            batch_size: default_batch_size(),
        }
    }
}

/// Audio cue tunables (lives under `[notifications]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotificationFileConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Ring the terminal bell for cues.
    #[serde(default = "default_true")]
    pub bell: bool,
}

impl Default for NotificationFileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bell: true,
        }
    }
}

fn default_relay_url() -> String {
    "http://127.0.0.1:3100".to_string()
}
fn default_control_path() -> String {
    "/ws/client".to_string()
}
fn default_reconnect_delay_ms() -> u64 {
    2000
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_room() -> String {
    "multiplexer".to_string()
}
fn default_true() -> bool {
    true
}
fn default_retention_days() -> u64 {
    30
}
fn default_flush_interval_ms() -> u64 {
    500
}
fn default_batch_size() -> usize {
    50
}

/// Build a figment that layers: defaults → config.toml → VMUX_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `VMUX_RELAY__URL=...`  →  `relay.url = ...`
///   `VMUX_PERSISTENCE__RETENTION_DAYS=7`  →  `persistence.retention_days = 7`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("VMUX_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Relay endpoints and timing (runtime view).
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// HTTP base URL without trailing slash
    pub base_url: String,
    /// Full ws:// or wss:// URL of the control channel
    pub control_url: String,
    pub reconnect_delay: Duration,
    pub request_timeout: Duration,
    pub default_room: String,
}

impl RelayConfig {
    pub fn from_file(fc: &RelayFileConfig) -> Self {
        let base_url = fc.url.trim_end_matches('/').to_string();
        let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base_url.clone()
        };
        let path = if fc.control_path.starts_with('/') {
            fc.control_path.clone()
        } else {
            format!("/{}", fc.control_path)
        };
        Self {
            control_url: format!("{}{}", ws_base, path),
            base_url,
            reconnect_delay: Duration::from_millis(fc.reconnect_delay_ms),
            request_timeout: Duration::from_secs(fc.request_timeout_secs),
            default_room: fc.default_room.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub retention: chrono::Duration,
    pub flush_interval: Duration,
    pub batch_size: usize,
}

impl PersistenceConfig {
    pub fn from_file(fc: &PersistenceFileConfig) -> Self {
        Self {
            enabled: fc.enabled,
            retention: chrono::Duration::days(fc.retention_days as i64),
            flush_interval: Duration::from_millis(fc.flush_interval_ms.max(1)),
            batch_size: fc.batch_size.max(1),
        }
    }
}

#[derive(Clone, Debug)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub bell: bool,
}

impl NotificationConfig {
    pub fn from_file(fc: &NotificationFileConfig) -> Self {
        Self {
            enabled: fc.enabled,
            bell: fc.bell,
        }
    }
}

// =============================================================================
// Directory layout config (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct VmuxConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
}

impl VmuxConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".vmux"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let db_path = data_dir.join("vmux.db");

        info!("Data directory: {}", data_dir.display());

        Ok(Self {
            data_dir,
            db_path,
        })
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir.join("credentials.json")
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    /// Extract the layered tunables for this data directory.
    pub fn file_config(&self) -> Result<FileConfig> {
        load_config(&self.data_dir)
            .extract()
            .with_context(|| format!("Invalid configuration in {}", self.config_toml_path().display()))
    }
}
