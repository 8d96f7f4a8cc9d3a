//! Server role: the tunnel concentrator holding one peer per client.

use std::collections::BTreeMap;

use tracing::{info, warn};
use wirewarp_core::{WarpError, WarpResult};

use super::conf::{self, InterfaceSection, PeerSection, WgConfig};
use super::keys::{self, KeyPair};
use super::{Applied, PeerRecord, TunnelFiles};
use crate::backend::{Invocation, SharedBackend};

const DEFAULT_PREFIX: u8 = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTunnelConfig {
    pub interface: String,
    pub listen_port: u16,
    /// CIDR of the whole tunnel network; its prefix sizes the interface address.
    pub tunnel_network: String,
    pub tunnel_ip: String,
}

impl ServerTunnelConfig {
    /// `Address` for the interface, e.g. `10.0.0.1/24`.
    pub fn address(&self) -> String {
        let prefix = conf::prefix_len(&self.tunnel_network).unwrap_or(DEFAULT_PREFIX);
        format!("{}/{prefix}", self.tunnel_ip)
    }
}

pub struct ServerTunnel {
    config: ServerTunnelConfig,
    keys: KeyPair,
    peers: BTreeMap<String, PeerRecord>,
    backend: SharedBackend,
    files: TunnelFiles,
}

impl ServerTunnel {
    /// Load (or create) the key pair. Starts with no peers.
    pub fn new(
        backend: SharedBackend,
        files: TunnelFiles,
        config: ServerTunnelConfig,
    ) -> WarpResult<Self> {
        let keys = keys::load_or_generate(backend.as_ref(), &files.key_path())?;
        Ok(Self {
            config,
            keys,
            peers: BTreeMap::new(),
            backend,
            files,
        })
    }

    /// Seed the peer mapping, e.g. from persisted state on restart.
    pub fn with_peers(mut self, peers: impl IntoIterator<Item = PeerRecord>) -> Self {
        for peer in peers {
            self.peers.insert(peer.public_key.clone(), peer);
        }
        self
    }

    pub fn config(&self) -> &ServerTunnelConfig {
        &self.config
    }

    pub fn public_key(&self) -> &str {
        self.keys.public_key()
    }

    pub fn peer(&self, public_key: &str) -> Option<&PeerRecord> {
        self.peers.get(public_key)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    pub fn render(&self) -> WgConfig {
        WgConfig {
            interface: InterfaceSection {
                address: self.config.address(),
                listen_port: Some(self.config.listen_port),
                private_key: self.keys.private_key().to_string(),
                table_off: false,
            },
            peers: self
                .peers
                .values()
                .map(|p| PeerSection {
                    comment: Some(p.name.clone()),
                    public_key: p.public_key.clone(),
                    endpoint: None,
                    allowed_ips: p.rendered_allowed_ips(),
                    persistent_keepalive: None,
                })
                .collect(),
        }
    }

    /// Apply the full configuration, preserving sessions if the interface is
    /// already running.
    pub fn init(&self) -> WarpResult<Applied> {
        let applied = super::apply(
            self.backend.as_ref(),
            &self.files,
            &self.config.interface,
            &self.render(),
        )?;
        info!(
            interface = %self.config.interface,
            peers = self.peers.len(),
            ?applied,
            "server tunnel applied"
        );
        Ok(applied)
    }

    /// Insert or replace the peer with this public key, then live-sync and
    /// route its advertised subnets.
    pub fn add_peer(&mut self, peer: PeerRecord) -> WarpResult<()> {
        let key = peer.public_key.clone();
        let routed = peer.routed_subnets();
        if self.peers.insert(key.clone(), peer).is_some() {
            info!(public_key = %key, "replacing existing peer");
        }
        self.sync()?;

        for subnet in routed {
            if let Err(e) = self.ensure_route(&subnet) {
                warn!(%subnet, error = %e, "failed to add route for peer subnet");
            }
        }
        Ok(())
    }

    /// Remove a peer and live-sync. Unknown keys leave everything untouched.
    pub fn remove_peer(&mut self, public_key: &str) -> WarpResult<PeerRecord> {
        let removed = self
            .peers
            .remove(public_key)
            .ok_or_else(|| WarpError::NotFound(format!("peer {public_key} not found")))?;
        self.sync()?;
        Ok(removed)
    }

    /// `ip route add <subnet> dev <iface>`; an existing route counts as done.
    pub fn ensure_route(&self, subnet: &str) -> WarpResult<()> {
        let add = Invocation::ip(["route", "add", subnet, "dev", self.config.interface.as_str()]);
        match self.backend.run(&add) {
            Ok(_) => Ok(()),
            Err(WarpError::Backend { output, .. }) if output.contains("File exists") => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn down(&self) -> WarpResult<()> {
        super::down(self.backend.as_ref(), &self.files, &self.config.interface)
    }

    fn sync(&self) -> WarpResult<()> {
        super::resync(
            self.backend.as_ref(),
            &self.files,
            &self.config.interface,
            &self.render(),
        )
    }
}
