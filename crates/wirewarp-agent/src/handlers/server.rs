//! Server role: tunnel concentrator and port forwarding.

use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};
use wirewarp_core::{WarpError, WarpResult};

use super::{lock, parse};
use crate::backend::SharedBackend;
use crate::config::{ServerState, StateStore};
use crate::forward::{ForwardRule, ForwardRuleManager, Protocol};
use crate::tunnel::{PeerRecord, ServerTunnel, ServerTunnelConfig, TunnelFiles};

#[derive(Debug, Deserialize)]
struct InitParams {
    wg_interface: String,
    wg_port: u16,
    tunnel_network: String,
    tunnel_ip: String,
    #[serde(default)]
    public_iface: String,
    #[serde(default)]
    public_ip: String,
}

#[derive(Debug, Deserialize)]
struct AddPeerParams {
    peer_name: String,
    public_key: String,
    tunnel_ip: String,
    #[serde(default)]
    allowed_ips: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RemovePeerParams {
    public_key: String,
}

#[derive(Debug, Deserialize)]
struct ForwardParams {
    protocol: Protocol,
    public_port: u16,
    destination_ip: String,
    destination_port: u16,
}

impl From<ForwardParams> for ForwardRule {
    fn from(p: ForwardParams) -> Self {
        ForwardRule {
            protocol: p.protocol,
            public_port: p.public_port,
            dest_ip: p.destination_ip,
            dest_port: p.destination_port,
        }
    }
}

pub struct ServerHandlers {
    store: Arc<StateStore>,
    backend: SharedBackend,
    forwards: ForwardRuleManager,
    tunnel: Mutex<Option<ServerTunnel>>,
}

impl ServerHandlers {
    pub fn new(store: Arc<StateStore>, backend: SharedBackend) -> Self {
        Self {
            forwards: ForwardRuleManager::new(backend.clone()),
            store,
            backend,
            tunnel: Mutex::new(None),
        }
    }

    fn files(&self) -> TunnelFiles {
        TunnelFiles::new(self.store.read(|cfg| cfg.wireguard.config_dir.clone()))
    }

    /// Bring back the tunnel, its peers, forwarding and masquerade from the
    /// persisted state.
    pub fn restore(&self) {
        let Some(state) = self
            .store
            .read(|cfg| cfg.server.clone())
            .filter(|s| s.initialized)
        else {
            info!("no saved server state; waiting for wg_init");
            return;
        };

        let config = ServerTunnelConfig {
            interface: state.wg_interface.clone(),
            listen_port: state.wg_port,
            tunnel_network: state.tunnel_network.clone(),
            tunnel_ip: state.tunnel_ip.clone(),
        };
        let tunnel = match ServerTunnel::new(self.backend.clone(), self.files(), config) {
            Ok(t) => t.with_peers(state.peers.iter().cloned()),
            Err(e) => {
                warn!(error = %e, "cannot restore server tunnel");
                return;
            }
        };

        match tunnel.init() {
            Ok(_) => {
                info!(
                    interface = %state.wg_interface,
                    peers = state.peers.len(),
                    "server tunnel restored from saved state"
                );
                if let Err(e) = self.forwards.enable_ip_forward() {
                    warn!(error = %e, "failed to enable IP forwarding");
                }
                if !state.public_iface.is_empty() {
                    if let Err(e) = self.forwards.ensure_masquerade(&state.public_iface) {
                        warn!(iface = %state.public_iface, error = %e, "failed to add masquerade");
                    }
                }
            }
            Err(e) => warn!(error = %e, "failed to restore server tunnel on startup"),
        }
        *lock(&self.tunnel) = Some(tunnel);
    }

    /// Take the interface down when the agent exits.
    pub fn shutdown(&self) {
        if let Some(tunnel) = lock(&self.tunnel).as_ref() {
            match tunnel.down() {
                Ok(()) => info!(interface = %tunnel.config().interface, "server tunnel down"),
                Err(e) => warn!(error = %e, "failed to take server tunnel down"),
            }
        }
    }

    pub fn wg_init(&self, params: &Value) -> WarpResult<String> {
        let p: InitParams = parse(params)?;
        let config = ServerTunnelConfig {
            interface: p.wg_interface.clone(),
            listen_port: p.wg_port,
            tunnel_network: p.tunnel_network.clone(),
            tunnel_ip: p.tunnel_ip.clone(),
        };

        let mut slot = lock(&self.tunnel);
        let tunnel = ServerTunnel::new(self.backend.clone(), self.files(), config)?;
        tunnel.init()?;
        let public_key = tunnel.public_key().to_string();
        *slot = Some(tunnel);
        drop(slot);

        if let Err(e) = self.forwards.enable_ip_forward() {
            warn!(error = %e, "failed to enable IP forwarding");
        }
        if !p.public_iface.is_empty() {
            if let Err(e) = self.forwards.ensure_masquerade(&p.public_iface) {
                warn!(iface = %p.public_iface, error = %e, "failed to add masquerade");
            }
        }
        self.forwards.save();

        let state = ServerState {
            wg_interface: p.wg_interface.clone(),
            wg_port: p.wg_port,
            tunnel_network: p.tunnel_network,
            tunnel_ip: p.tunnel_ip,
            public_iface: p.public_iface,
            public_ip: p.public_ip,
            initialized: true,
            peers: Vec::new(),
        };
        if let Err(e) = self.store.update(|cfg| cfg.server = Some(state)) {
            warn!(error = %e, "failed to save state after wg_init");
        }

        Ok(format!(
            "WireGuard interface {} initialised; public key: {public_key}",
            p.wg_interface
        ))
    }

    pub fn add_peer(&self, params: &Value) -> WarpResult<String> {
        let mut slot = lock(&self.tunnel);
        let tunnel = slot.as_mut().ok_or_else(|| {
            WarpError::NotInitialised("WireGuard not initialised; send wg_init first".into())
        })?;
        let p: AddPeerParams = parse(params)?;

        tunnel.add_peer(PeerRecord {
            name: p.peer_name.clone(),
            public_key: p.public_key,
            tunnel_ip: p.tunnel_ip.clone(),
            allowed_ips: p.allowed_ips,
        })?;
        self.persist_peers(tunnel);

        Ok(format!("peer {} ({}) added", p.peer_name, p.tunnel_ip))
    }

    pub fn remove_peer(&self, params: &Value) -> WarpResult<String> {
        let mut slot = lock(&self.tunnel);
        let tunnel = slot
            .as_mut()
            .ok_or_else(|| WarpError::NotInitialised("WireGuard not initialised".into()))?;
        let p: RemovePeerParams = parse(params)?;

        tunnel.remove_peer(&p.public_key)?;
        self.persist_peers(tunnel);

        Ok(format!("peer {} removed", p.public_key))
    }

    pub fn add_forward(&self, params: &Value) -> WarpResult<String> {
        let rule: ForwardRule = parse::<ForwardParams>(params)?.into();
        let public_ip = self.public_ip();
        self.forwards.add(public_ip.as_deref(), &rule)?;
        self.forwards.save();
        Ok(format!("forward {rule} added"))
    }

    pub fn remove_forward(&self, params: &Value) -> WarpResult<String> {
        let rule: ForwardRule = parse::<ForwardParams>(params)?.into();
        let public_ip = self.public_ip();
        if let Err(e) = self.forwards.remove(public_ip.as_deref(), &rule) {
            warn!(forward = %rule, error = %e, "port forward removal incomplete");
        }
        self.forwards.save();
        Ok(format!("forward {rule} removed"))
    }

    fn public_ip(&self) -> Option<String> {
        self.store
            .read(|cfg| cfg.server.as_ref().map(|s| s.public_ip.clone()))
            .filter(|ip| !ip.is_empty())
    }

    fn persist_peers(&self, tunnel: &ServerTunnel) {
        let peers: Vec<PeerRecord> = tunnel.peers().cloned().collect();
        let saved = self.store.update(|cfg| {
            if let Some(server) = cfg.server.as_mut() {
                server.peers = peers;
            }
        });
        if let Err(e) = saved {
            warn!(error = %e, "failed to save peer set");
        }
    }
}
