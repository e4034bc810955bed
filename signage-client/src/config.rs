//! Persisted client settings.
//!
//! Settings live in `config.json` under the config directory. Saves are
//! atomic (tmp write + rename) with a short bounded retry, matching how the
//! rest of the system treats the file as the single source of truth for the
//! connection target: discovery results and registration responses are
//! written back here.

use std::{
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use signage_core::{RegistrationResponse, ServerCandidate};
use thiserror::Error;
use tracing::warn;

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const DEFAULT_SERVER_PORT: u16 = 9090;
pub const DEFAULT_ENDPOINT_PATH: &str = "/display";
pub const DEFAULT_DISCOVERY_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientSettings {
    pub client_id: String,
    pub display_name: String,
    #[serde(default = "default_true")]
    pub auto_discover: bool,
    #[serde(rename = "discovery_timeout", default = "default_discovery_timeout")]
    pub discovery_timeout_secs: u64,
    #[serde(default)]
    pub show_cached_layout_on_disconnect: bool,
    #[serde(default)]
    pub server_host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_endpoint_path")]
    pub endpoint_path: String,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default)]
    pub registration_token: Option<String>,
    #[serde(default)]
    pub display_group: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_discovery_timeout() -> u64 {
    DEFAULT_DISCOVERY_TIMEOUT_SECS
}

fn default_port() -> u16 {
    DEFAULT_SERVER_PORT
}

fn default_endpoint_path() -> String {
    DEFAULT_ENDPOINT_PATH.to_owned()
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            client_id: generate_client_id(),
            display_name: "Signage Display".to_owned(),
            auto_discover: true,
            discovery_timeout_secs: DEFAULT_DISCOVERY_TIMEOUT_SECS,
            show_cached_layout_on_disconnect: false,
            server_host: String::new(),
            port: DEFAULT_SERVER_PORT,
            endpoint_path: DEFAULT_ENDPOINT_PATH.to_owned(),
            use_ssl: false,
            registration_token: None,
            display_group: None,
            location: None,
        }
    }
}

impl ClientSettings {
    /// WebSocket URL for the configured connection target.
    pub fn server_url(&self) -> String {
        let scheme = if self.use_ssl { "wss" } else { "ws" };
        let path = if self.endpoint_path.starts_with('/') {
            self.endpoint_path.clone()
        } else {
            format!("/{}", self.endpoint_path)
        };
        format!("{scheme}://{}:{}{path}", self.server_host, self.port)
    }
}

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("serialize failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("tmp write failed: {0}")]
    WriteTmp(std::io::Error),
    #[error("rename failed: {0}")]
    Rename(std::io::Error),
}

/// Shared handle to the persisted settings. Mutations go through [`update`]
/// so the in-memory view and the file never diverge.
///
/// [`update`]: SettingsStore::update
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    inner: Mutex<ClientSettings>,
}

impl SettingsStore {
    /// Load settings from `dir`, falling back to defaults when the file is
    /// missing or unreadable. An invalid file is logged and replaced on the
    /// next save rather than aborting startup.
    pub fn load_or_default(dir: &Path) -> Self {
        let path = dir.join(CONFIG_FILE_NAME);
        let settings = match std::fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str::<ClientSettings>(&data) {
                Ok(settings) => settings,
                Err(err) => {
                    warn!(path = %path.display(), "config file invalid, using defaults: {err}");
                    ClientSettings::default()
                }
            },
            Err(_) => ClientSettings::default(),
        };
        Self {
            path,
            inner: Mutex::new(settings),
        }
    }

    pub fn snapshot(&self) -> ClientSettings {
        self.lock().clone()
    }

    pub fn server_url(&self) -> String {
        self.lock().server_url()
    }

    /// Apply a mutation and persist the result.
    pub fn update<F: FnOnce(&mut ClientSettings)>(&self, mutate: F) -> Result<(), SaveError> {
        let snapshot = {
            let mut guard = self.lock();
            mutate(&mut guard);
            guard.clone()
        };
        save_with_retry(&self.path, &snapshot)
    }

    /// Persist a discovered server as the connection target.
    pub fn apply_candidate(&self, candidate: &ServerCandidate) -> Result<(), SaveError> {
        let Some(address) = candidate.addresses.first() else {
            return Ok(());
        };
        let address = *address;
        self.update(|settings| {
            settings.server_host = address.to_string();
            settings.port = candidate.port;
            settings.use_ssl = candidate.use_ssl;
            settings.endpoint_path = candidate.endpoint_path.clone();
        })
    }

    /// Persist the group/location/token assigned by a registration response.
    pub fn apply_registration(&self, response: &RegistrationResponse) -> Result<(), SaveError> {
        self.update(|settings| {
            settings.display_group = response.display_group.clone();
            settings.location = response.location.clone();
            if response.auth_token.is_some() {
                settings.registration_token = response.auth_token.clone();
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClientSettings> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn save_with_retry(path: &Path, settings: &ClientSettings) -> Result<(), SaveError> {
    const MAX_ATTEMPTS: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 50;

    let mut attempt: u32 = 1;
    loop {
        match save_once(path, settings) {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= MAX_ATTEMPTS => return Err(err),
            Err(_) => {
                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                std::thread::sleep(Duration::from_millis(backoff_ms));
                attempt += 1;
            }
        }
    }
}

fn save_once(path: &Path, settings: &ClientSettings) -> Result<(), SaveError> {
    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(settings)?;
    std::fs::write(&tmp, payload.as_bytes()).map_err(SaveError::WriteTmp)?;

    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
    std::fs::rename(&tmp, path).map_err(SaveError::Rename)?;
    Ok(())
}

/// Config directory resolution: CLI override, then `SIGNAGE_CONFIG_DIR`,
/// then `~/.config/signage`, then the working directory.
pub fn config_dir(cli_override: Option<PathBuf>) -> PathBuf {
    let dir = if let Some(dir) = cli_override {
        dir
    } else if let Some(dir) = std::env::var_os("SIGNAGE_CONFIG_DIR") {
        PathBuf::from(dir)
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".config").join("signage")
    } else {
        PathBuf::from(".")
    };
    let _ = std::fs::create_dir_all(&dir);
    dir
}

fn generate_client_id() -> String {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
        ^ u64::from(std::process::id()).rotate_left(32);
    format!("display-{seed:016x}")
}
