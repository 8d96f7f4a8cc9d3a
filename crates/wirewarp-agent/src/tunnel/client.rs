//! Client role: a single upstream peer (the server).
//!
//! Routing is disabled at the interface (`Table = off`); the gateway routing
//! engine owns every route and rule that sends traffic into the tunnel.

use tracing::info;
use wirewarp_core::WarpResult;

use super::conf::{InterfaceSection, PeerSection, WgConfig};
use super::keys::{self, KeyPair};
use super::{Applied, TunnelFiles};
use crate::backend::SharedBackend;

const CLIENT_PREFIX: u8 = 24;
const PERSISTENT_KEEPALIVE: u16 = 25;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientTunnelConfig {
    pub interface: String,
    pub tunnel_ip: String,
    pub server_public_key: String,
    /// `host:port` of the server.
    pub server_endpoint: String,
    /// Defaults to `0.0.0.0/0` when empty.
    pub allowed_ips: Vec<String>,
}

pub struct ClientTunnel {
    config: ClientTunnelConfig,
    keys: KeyPair,
    backend: SharedBackend,
    files: TunnelFiles,
}

impl ClientTunnel {
    pub fn new(
        backend: SharedBackend,
        files: TunnelFiles,
        config: ClientTunnelConfig,
    ) -> WarpResult<Self> {
        let keys = keys::load_or_generate(backend.as_ref(), &files.key_path())?;
        Ok(Self {
            config,
            keys,
            backend,
            files,
        })
    }

    pub fn config(&self) -> &ClientTunnelConfig {
        &self.config
    }

    pub fn public_key(&self) -> &str {
        self.keys.public_key()
    }

    pub fn render(&self) -> WgConfig {
        let allowed_ips = if self.config.allowed_ips.is_empty() {
            vec!["0.0.0.0/0".to_string()]
        } else {
            self.config.allowed_ips.clone()
        };
        WgConfig {
            interface: InterfaceSection {
                address: format!("{}/{CLIENT_PREFIX}", self.config.tunnel_ip),
                listen_port: None,
                private_key: self.keys.private_key().to_string(),
                table_off: true,
            },
            peers: vec![PeerSection {
                comment: None,
                public_key: self.config.server_public_key.clone(),
                endpoint: Some(self.config.server_endpoint.clone()),
                allowed_ips,
                persistent_keepalive: Some(PERSISTENT_KEEPALIVE),
            }],
        }
    }

    pub fn up(&self) -> WarpResult<Applied> {
        let applied = super::apply(
            self.backend.as_ref(),
            &self.files,
            &self.config.interface,
            &self.render(),
        )?;
        info!(
            interface = %self.config.interface,
            endpoint = %self.config.server_endpoint,
            ?applied,
            "client tunnel applied"
        );
        Ok(applied)
    }

    /// Point the peer at a new endpoint without dropping the session.
    pub fn update_endpoint(&mut self, endpoint: &str) -> WarpResult<()> {
        self.config.server_endpoint = endpoint.to_string();
        super::resync(
            self.backend.as_ref(),
            &self.files,
            &self.config.interface,
            &self.render(),
        )?;
        info!(interface = %self.config.interface, endpoint, "server endpoint updated");
        Ok(())
    }

    pub fn down(&self) -> WarpResult<()> {
        super::down(self.backend.as_ref(), &self.files, &self.config.interface)
    }
}
