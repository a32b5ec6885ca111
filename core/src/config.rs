use std::{fs, path::PathBuf};

use anyhow::{bail, Context, Result};
use clap::Args;
use directories::ProjectDirs;
use serde::Deserialize;
use tokio::time::Duration;

use crate::audio::{PlayerSettings, RecorderSettings};
use crate::context::{Role, UserContext};
use crate::session::SessionSettings;
use crate::sync::SyncSettings;

/// Connection and logging options shared by every subcommand.
#[derive(Args, Debug, Default, Clone)]
pub struct ConfigArgs {
    /// Path to configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Base URL of the conversation service.
    #[arg(long, global = true)]
    pub server: Option<String>,
    /// Bearer token for the conversation service.
    #[arg(long, global = true)]
    pub token: Option<String>,
    /// Enable or disable logging (true/false).
    #[arg(long, global = true)]
    pub logging: Option<bool>,
}

/// Client configuration resolved from file, env and CLI.
#[derive(Clone)]
pub struct Config {
    pub server_url: String,
    pub token: String,
    pub user: UserContext,
    pub sync: SyncSettings,
    pub recorder: RecorderSettings,
    pub player: PlayerSettings,
    /// Quiet period before a recipient count is resolved.
    pub debounce: Duration,
    pub logging_enabled: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("server_url", &self.server_url)
            .field("token", &"<redacted>")
            .field("user", &self.user)
            .field("sync", &self.sync)
            .field("recorder", &self.recorder)
            .field("player", &self.player)
            .field("debounce", &self.debounce)
            .field("logging_enabled", &self.logging_enabled)
            .finish()
    }
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    user: FileUser,
    #[serde(default)]
    sync: FileSync,
    #[serde(default)]
    audio: FileAudio,
    #[serde(default)]
    broadcast: FileBroadcast,
    #[serde(default)]
    logging: FileLogging,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_server_url")]
    url: String,
    #[serde(default)]
    token: String,
}

#[derive(Deserialize)]
struct FileUser {
    #[serde(default = "default_user_id")]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    roles: Vec<Role>,
}

#[derive(Deserialize)]
struct FileSync {
    #[serde(default = "default_poll_ms")]
    poll_interval_ms: u64,
    #[serde(default = "default_edit_window_secs")]
    edit_window_secs: u64,
}

#[derive(Deserialize)]
struct FileAudio {
    #[serde(default = "default_max_recording_secs")]
    max_recording_secs: u64,
    #[serde(default = "default_min_recording_bytes")]
    min_recording_bytes: usize,
    #[serde(default = "default_assumed_bytes_per_sec")]
    assumed_bytes_per_sec: u64,
}

#[derive(Deserialize)]
struct FileBroadcast {
    #[serde(default = "default_debounce_ms")]
    debounce_ms: u64,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

fn default_server_url() -> String {
    "http://127.0.0.1:8787".into()
}

fn default_user_id() -> String {
    "me".into()
}

fn default_poll_ms() -> u64 {
    3000
}

fn default_edit_window_secs() -> u64 {
    15 * 60
}

fn default_max_recording_secs() -> u64 {
    60
}

fn default_min_recording_bytes() -> usize {
    crate::audio::DEFAULT_MIN_RECORDING_BYTES
}

fn default_assumed_bytes_per_sec() -> u64 {
    crate::audio::DEFAULT_ASSUMED_BYTES_PER_SEC
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_logging() -> bool {
    true
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            url: default_server_url(),
            token: String::new(),
        }
    }
}

impl Default for FileUser {
    fn default() -> Self {
        Self {
            id: default_user_id(),
            name: String::new(),
            roles: Vec::new(),
        }
    }
}

impl Default for FileSync {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_ms(),
            edit_window_secs: default_edit_window_secs(),
        }
    }
}

impl Default for FileAudio {
    fn default() -> Self {
        Self {
            max_recording_secs: default_max_recording_secs(),
            min_recording_bytes: default_min_recording_bytes(),
            assumed_bytes_per_sec: default_assumed_bytes_per_sec(),
        }
    }
}

impl Default for FileBroadcast {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_logging(),
        }
    }
}

impl Config {
    /// Resolve configuration from CLI, environment variables, config file and defaults.
    pub fn load(args: &ConfigArgs) -> Result<Self> {
        // config file path precedence: CLI -> ENV -> per-user config dir
        let config_path = args
            .config
            .clone()
            .or_else(|| std::env::var("CHATCORE_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(default_config_path);

        let file_cfg = match fs::read(&config_path) {
            Ok(bytes) => {
                let contents = String::from_utf8_lossy(&bytes);
                toml::from_str::<FileConfig>(&contents)
                    .with_context(|| format!("invalid config file {}", config_path.display()))?
            }
            Err(_) => FileConfig::default(),
        };

        let mut server_url = file_cfg.server.url;
        let mut token = file_cfg.server.token;
        let mut poll_ms = file_cfg.sync.poll_interval_ms;
        let mut logging = file_cfg.logging.enabled;

        // environment overrides
        if let Ok(url) = std::env::var("CHATCORE_SERVER_URL") {
            server_url = url;
        }
        if let Ok(t) = std::env::var("CHATCORE_TOKEN") {
            token = t;
        }
        if let Ok(p) = std::env::var("CHATCORE_POLL_MS") {
            if let Ok(p) = p.parse::<u64>() {
                poll_ms = p;
            }
        }
        if let Ok(l) = std::env::var("CHATCORE_LOGGING") {
            if let Ok(l) = l.parse::<bool>() {
                logging = l;
            }
        }

        // CLI overrides
        if let Some(url) = &args.server {
            server_url = url.clone();
        }
        if let Some(t) = &args.token {
            token = t.clone();
        }
        if let Some(l) = args.logging {
            logging = l;
        }

        if url::Url::parse(&server_url).is_err() {
            bail!("invalid server url: {server_url}");
        }
        if poll_ms < 100 {
            bail!("poll interval must be at least 100ms");
        }
        if file_cfg.audio.max_recording_secs == 0 {
            bail!("max_recording_secs must be positive");
        }
        if file_cfg.audio.assumed_bytes_per_sec == 0 {
            bail!("assumed_bytes_per_sec must be positive");
        }

        let mut user = UserContext::new(file_cfg.user.id, file_cfg.user.name);
        for role in file_cfg.user.roles {
            user = user.with_role(role);
        }

        Ok(Self {
            server_url,
            token,
            user,
            sync: SyncSettings {
                poll_interval: Duration::from_millis(poll_ms),
                edit_window: Duration::from_secs(file_cfg.sync.edit_window_secs),
            },
            recorder: RecorderSettings {
                ceiling: Duration::from_secs(file_cfg.audio.max_recording_secs),
                min_bytes: file_cfg.audio.min_recording_bytes,
                ..Default::default()
            },
            player: PlayerSettings {
                assumed_bytes_per_sec: file_cfg.audio.assumed_bytes_per_sec,
            },
            debounce: Duration::from_millis(file_cfg.broadcast.debounce_ms),
            logging_enabled: logging,
        })
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            sync: self.sync,
            recorder: self.recorder,
            player: self.player,
            debounce: self.debounce,
        }
    }
}

/// Default location of the config file.
pub fn default_config_path() -> PathBuf {
    ProjectDirs::from("org", "chatcore", "chatcore")
        .map(|dirs| dirs.config_dir().join("chatcore.toml"))
        .unwrap_or_else(|| PathBuf::from("config/chatcore.toml"))
}
