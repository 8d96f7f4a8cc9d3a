//! Persisted agent record: TOML file + single-writer store.
//!
//! One file per agent holds the mode, control endpoint, credentials and the
//! last-known tunnel state for the agent's role. [`StateStore`] is the only
//! writer; every mutation goes through [`StateStore::update`], which persists
//! before releasing the lock.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use wirewarp_core::{WarpError, WarpResult};

use crate::tunnel::PeerRecord;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/wirewarp/agent.toml";

/// Which side of the tunnel this agent runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    Server,
    Client,
}

impl AgentMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentMode::Server => "server",
            AgentMode::Client => "client",
        }
    }
}

impl fmt::Display for AgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentMode {
    type Err = WarpError;

    fn from_str(s: &str) -> WarpResult<Self> {
        match s {
            "server" => Ok(AgentMode::Server),
            "client" => Ok(AgentMode::Client),
            other => Err(WarpError::Config(format!(
                "unknown mode: {other} (must be 'server' or 'client')"
            ))),
        }
    }
}

/// The on-disk agent record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub mode: AgentMode,
    pub control_server_url: String,
    /// One-time registration token; cleared after a successful registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_token: Option<String>,
    /// Session credential issued at registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_jwt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Plain-text "what is my IP" endpoint; empty disables the probe.
    #[serde(default = "default_public_ip_url")]
    pub public_ip_url: String,
    /// argv handed to the external updater on `agent_update`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_command: Option<Vec<String>>,
    #[serde(default)]
    pub wireguard: WireguardPaths,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientState>,
}

fn default_public_ip_url() -> String {
    "https://icanhazip.com".to_string()
}

impl AgentConfig {
    /// A fresh record built from first-run flags.
    pub fn bootstrap(mode: AgentMode, control_server_url: &str, token: &str) -> Self {
        Self {
            mode,
            control_server_url: control_server_url.trim_end_matches('/').to_string(),
            agent_token: Some(token.to_string()).filter(|t| !t.is_empty()),
            agent_jwt: None,
            agent_id: None,
            public_ip_url: default_public_ip_url(),
            update_command: None,
            wireguard: WireguardPaths::default(),
            server: None,
            client: None,
        }
    }

    /// Load and parse a record.
    pub fn load(path: &Path) -> WarpResult<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| WarpError::Config(format!("parse {}: {e}", path.display())))
    }

    /// Write the record with owner-only permissions.
    pub fn save(&self, path: &Path) -> WarpResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| WarpError::Config(format!("serialize config: {e}")))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
                }
            }
        }
        write_private(path, content.as_bytes())
    }

    /// Whether any credential remains to authenticate with.
    pub fn has_credentials(&self) -> bool {
        self.agent_jwt.as_deref().is_some_and(|j| !j.is_empty())
            || self.agent_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// Write `data` to `path`, readable by the owner only.
pub(crate) fn write_private(path: &Path, data: &[u8]) -> WarpResult<()> {
    std::fs::write(path, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Host paths used by the tunnel and routing components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireguardPaths {
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
    #[serde(default = "default_rt_tables")]
    pub rt_tables: PathBuf,
}

impl Default for WireguardPaths {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            rt_tables: default_rt_tables(),
        }
    }
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/etc/wireguard")
}

fn default_rt_tables() -> PathBuf {
    PathBuf::from("/etc/iproute2/rt_tables")
}

/// Last-known state of the tunnel server role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerState {
    #[serde(default)]
    pub wg_interface: String,
    #[serde(default)]
    pub wg_port: u16,
    #[serde(default)]
    pub tunnel_network: String,
    #[serde(default)]
    pub tunnel_ip: String,
    #[serde(default)]
    pub public_iface: String,
    #[serde(default)]
    pub public_ip: String,
    #[serde(default)]
    pub initialized: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peers: Vec<PeerRecord>,
}

/// Last-known state of the gateway client role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientState {
    #[serde(default)]
    pub wg_interface: String,
    #[serde(default)]
    pub tunnel_ip: String,
    #[serde(default)]
    pub server_public_key: String,
    #[serde(default)]
    pub server_endpoint: String,
    #[serde(default)]
    pub vps_tunnel_ip: String,
    #[serde(default)]
    pub lan_iface: String,
    #[serde(default)]
    pub lan_network: String,
    #[serde(default)]
    pub lan_ip: String,
    #[serde(default)]
    pub is_gateway: bool,
    #[serde(default)]
    pub initialized: bool,
}

/// Owner of the persisted record.
pub struct StateStore {
    path: PathBuf,
    inner: Mutex<AgentConfig>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, config: AgentConfig) -> Self {
        Self {
            path: path.into(),
            inner: Mutex::new(config),
        }
    }

    /// Load the record at `path`.
    pub fn open(path: impl Into<PathBuf>) -> WarpResult<Self> {
        let path = path.into();
        let config = AgentConfig::load(&path)?;
        debug!(path = %path.display(), "loaded agent config");
        Ok(Self::new(path, config))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, AgentConfig> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A copy of the current record.
    pub fn snapshot(&self) -> AgentConfig {
        self.lock().clone()
    }

    /// Read a projection of the record without cloning all of it.
    pub fn read<R>(&self, f: impl FnOnce(&AgentConfig) -> R) -> R {
        f(&self.lock())
    }

    /// Mutate the record and persist it.
    ///
    /// The in-memory change stands even when writing the file fails; the
    /// error is returned so the caller can log it.
    pub fn update<R>(&self, f: impl FnOnce(&mut AgentConfig) -> R) -> WarpResult<R> {
        let mut guard = self.lock();
        let out = f(&mut guard);
        guard.save(&self.path)?;
        Ok(out)
    }

    /// Registration succeeded: keep the session credential, drop the token.
    pub fn record_registration(&self, agent_id: &str, jwt: &str) -> WarpResult<()> {
        self.update(|cfg| {
            cfg.agent_id = Some(agent_id.to_string());
            cfg.agent_jwt = Some(jwt.to_string());
            cfg.agent_token = None;
        })?;
        info!(agent_id, "stored session credential");
        Ok(())
    }

    /// The session credential was rejected; forget it.
    pub fn clear_session(&self) -> WarpResult<()> {
        self.update(|cfg| cfg.agent_jwt = None)
    }
}
