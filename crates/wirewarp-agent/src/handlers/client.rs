//! Client role: tunnel to the server plus gateway policy routing.

use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};
use wirewarp_core::{WarpError, WarpResult};

use super::{lock, parse};
use crate::backend::{iptables, SharedBackend};
use crate::config::{ClientState, StateStore};
use crate::gateway::{endpoint_host, GatewayConfig, GatewayRouting};
use crate::tunnel::{ClientTunnel, ClientTunnelConfig, TunnelFiles};

#[derive(Debug, Deserialize)]
struct ConfigureParams {
    wg_interface: String,
    tunnel_ip: String,
    server_public_key: String,
    server_endpoint: String,
    #[serde(default)]
    vps_tunnel_ip: String,
    #[serde(default)]
    lan_iface: String,
    #[serde(default)]
    lan_network: String,
    #[serde(default)]
    lan_ip: String,
    #[serde(default)]
    is_gateway: bool,
}

#[derive(Debug, Deserialize)]
struct UpdateEndpointParams {
    server_endpoint: String,
}

pub struct ClientHandlers {
    store: Arc<StateStore>,
    backend: SharedBackend,
    tunnel: Mutex<Option<ClientTunnel>>,
}

impl ClientHandlers {
    pub fn new(store: Arc<StateStore>, backend: SharedBackend) -> Self {
        Self {
            store,
            backend,
            tunnel: Mutex::new(None),
        }
    }

    fn files(&self) -> TunnelFiles {
        TunnelFiles::new(self.store.read(|cfg| cfg.wireguard.config_dir.clone()))
    }

    fn routing(&self) -> GatewayRouting {
        GatewayRouting::new(
            self.backend.clone(),
            self.store.read(|cfg| cfg.wireguard.rt_tables.clone()),
        )
    }

    fn apply_gateway(&self, state: &ClientState) -> WarpResult<()> {
        let control_url = self.store.read(|cfg| cfg.control_server_url.clone());
        let cfg = GatewayConfig::derive(state, &control_url)?;
        self.routing().apply(&cfg)
    }

    /// Bring the tunnel and gateway routing back from the persisted state.
    pub fn restore(&self) {
        let Some(state) = self
            .store
            .read(|cfg| cfg.client.clone())
            .filter(|s| s.initialized)
        else {
            info!("no saved client state; waiting for wg_configure");
            return;
        };

        let tunnel = match ClientTunnel::new(self.backend.clone(), self.files(), tunnel_config(&state)) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "cannot restore client tunnel");
                return;
            }
        };
        match tunnel.up() {
            Ok(_) => {
                info!(interface = %state.wg_interface, "client tunnel restored from saved state");
                if let Err(e) = self.apply_gateway(&state) {
                    warn!(error = %e, "failed to restore gateway routing");
                }
            }
            Err(e) => warn!(error = %e, "failed to restore client tunnel on startup"),
        }
        *lock(&self.tunnel) = Some(tunnel);
    }

    /// The tunnel and routing stay up across agent restarts.
    pub fn shutdown(&self) {
        if lock(&self.tunnel).is_some() {
            info!("leaving client tunnel and gateway routing in place");
        }
    }

    pub fn configure(&self, params: &Value) -> WarpResult<String> {
        let p: ConfigureParams = parse(params)?;
        let state = ClientState {
            wg_interface: p.wg_interface,
            tunnel_ip: p.tunnel_ip,
            server_public_key: p.server_public_key,
            server_endpoint: p.server_endpoint,
            vps_tunnel_ip: p.vps_tunnel_ip,
            lan_iface: p.lan_iface,
            lan_network: p.lan_network,
            lan_ip: p.lan_ip,
            is_gateway: p.is_gateway,
            initialized: true,
        };

        let mut slot = lock(&self.tunnel);
        let tunnel = ClientTunnel::new(self.backend.clone(), self.files(), tunnel_config(&state))?;
        tunnel.up()?;
        let public_key = tunnel.public_key().to_string();
        *slot = Some(tunnel);
        drop(slot);

        let saved = state.clone();
        if let Err(e) = self.store.update(|cfg| cfg.client = Some(saved)) {
            warn!(error = %e, "failed to save state after wg_configure");
        }

        self.apply_gateway(&state)
            .map_err(|e| e.context("gateway routing"))?;
        if let Err(e) = iptables::save(self.backend.as_ref()) {
            warn!(error = %e, "failed to persist iptables rules");
        }

        Ok(format!(
            "WireGuard interface {} up; public key: {public_key}",
            state.wg_interface
        ))
    }

    pub fn update_endpoint(&self, params: &Value) -> WarpResult<String> {
        let mut slot = lock(&self.tunnel);
        let tunnel = slot.as_mut().ok_or_else(|| {
            WarpError::NotInitialised("WireGuard not configured; send wg_configure first".into())
        })?;
        let p: UpdateEndpointParams = parse(params)?;

        let previous = tunnel.config().server_endpoint.clone();
        tunnel.update_endpoint(&p.server_endpoint)?;
        drop(slot);

        let updated = self.store.update(|cfg| {
            cfg.client.as_mut().map(|client| {
                client.server_endpoint = p.server_endpoint.clone();
                client.clone()
            })
        });
        let state = match updated {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "failed to save state after endpoint update");
                self.store.read(|cfg| cfg.client.clone())
            }
        };

        // The endpoint exception rule must follow the server's new address.
        if let Some(state) = state {
            if endpoint_host(&previous) != endpoint_host(&p.server_endpoint) {
                self.apply_gateway(&state)
                    .map_err(|e| e.context("gateway routing"))?;
            }
        }

        Ok(format!("server endpoint updated to {}", p.server_endpoint))
    }

    pub fn down(&self, _params: &Value) -> WarpResult<String> {
        let mut slot = lock(&self.tunnel);
        let Some(tunnel) = slot.as_ref() else {
            return Ok("already down".to_string());
        };

        let iface = tunnel.config().interface.clone();
        if self.store.read(|cfg| cfg.client.is_some()) {
            // Best-effort; failures are already logged step by step.
            let _ = self.routing().teardown(&iface);
        }
        tunnel.down()?;
        *slot = None;
        drop(slot);

        if let Err(e) = self.store.update(|cfg| {
            if let Some(client) = cfg.client.as_mut() {
                client.initialized = false;
            }
        }) {
            warn!(error = %e, "failed to save state after wg_down");
        }
        info!(interface = %iface, "client tunnel down");
        Ok("WireGuard interface down".to_string())
    }
}

fn tunnel_config(state: &ClientState) -> ClientTunnelConfig {
    ClientTunnelConfig {
        interface: state.wg_interface.clone(),
        tunnel_ip: state.tunnel_ip.clone(),
        server_public_key: state.server_public_key.clone(),
        server_endpoint: state.server_endpoint.clone(),
        allowed_ips: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::backend::fake::FakeBackend;
    use crate::config::{AgentConfig, AgentMode};
    use crate::gateway::{priority, TUNNEL_OUT_TABLE};
    use crate::handlers::testing;

    fn configure_params() -> Value {
        json!({
            "wg_interface": "wg0",
            "tunnel_ip": "10.0.0.3",
            "server_public_key": "SERVERPUB",
            "server_endpoint": "203.0.113.7:51820",
            "vps_tunnel_ip": "10.0.0.1",
            "lan_iface": "eth0",
            "lan_network": "192.168.20.0/24",
            "lan_ip": "192.168.20.110",
            "is_gateway": true
        })
    }

    fn setup(dir: &tempfile::TempDir) -> (Arc<FakeBackend>, Arc<StateStore>, ClientHandlers) {
        let backend = Arc::new(FakeBackend::new());
        let store = testing::store(dir.path(), AgentMode::Client);
        let handlers = ClientHandlers::new(store.clone(), backend.clone());
        (backend, store, handlers)
    }

    #[test]
    fn configure_brings_up_tunnel_and_routing() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, store, h) = setup(&dir);

        let out = h.configure(&configure_params()).unwrap();
        assert_eq!(out, "WireGuard interface wg0 up; public key: pub-privkey-1=");
        assert!(backend.interface_up("wg0"));

        let rules = backend.ip_rules();
        assert!(rules.contains(&(priority::CONTROL_SERVER, "to 198.51.100.10 table main".into())));
        assert!(rules.contains(&(priority::TUNNEL_ENDPOINT, "to 203.0.113.7 table main".into())));
        assert_eq!(backend.routes(TUNNEL_OUT_TABLE), vec!["default dev wg0"]);
        assert_eq!(backend.saves(), 1);

        let saved = AgentConfig::load(store.path()).unwrap().client.unwrap();
        assert!(saved.initialized);
        assert!(saved.is_gateway);

        // Re-configuring is idempotent.
        h.configure(&configure_params()).unwrap();
        assert_eq!(backend.ip_rules(), rules);
    }

    #[test]
    fn routing_failure_is_reported_after_tunnel_is_up() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, store, h) = setup(&dir);
        backend.fail_matching("ip route add default via", "Error: Nexthop has invalid gateway.");

        let err = h.configure(&configure_params()).unwrap_err();
        assert!(
            err.to_string()
                .starts_with("gateway routing: routing tables: ip route add default via 10.0.0.1"),
            "{err}"
        );
        assert!(backend.interface_up("wg0"));
        assert!(store.snapshot().client.unwrap().initialized);
    }

    #[test]
    fn endpoint_update_requires_configure_and_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, store, h) = setup(&dir);
        let params = json!({"server_endpoint": "198.51.100.4:51820"});

        assert!(matches!(
            h.update_endpoint(&params).unwrap_err(),
            WarpError::NotInitialised(_)
        ));

        h.configure(&configure_params()).unwrap();
        assert_eq!(
            h.update_endpoint(&params).unwrap(),
            "server endpoint updated to 198.51.100.4:51820"
        );
        assert_eq!(
            store.snapshot().client.unwrap().server_endpoint,
            "198.51.100.4:51820"
        );
        assert!(backend
            .ip_rules()
            .contains(&(priority::TUNNEL_ENDPOINT, "to 198.51.100.4 table main".into())));
    }

    #[test]
    fn down_tears_everything_down_once() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, store, h) = setup(&dir);

        assert_eq!(h.down(&Value::Null).unwrap(), "already down");

        h.configure(&configure_params()).unwrap();
        assert_eq!(h.down(&Value::Null).unwrap(), "WireGuard interface down");
        assert!(!backend.interface_up("wg0"));
        assert!(backend.ip_rules().is_empty());
        assert!(backend.iptables_rules("mangle", "PREROUTING").is_empty());
        assert!(!store.snapshot().client.unwrap().initialized);

        assert_eq!(h.down(&Value::Null).unwrap(), "already down");
    }

    #[test]
    fn restore_and_shutdown_leave_tunnel_up() {
        let dir = tempfile::tempdir().unwrap();
        let (_backend, store, h) = setup(&dir);
        h.configure(&configure_params()).unwrap();

        let backend = Arc::new(FakeBackend::new());
        let restarted = ClientHandlers::new(store, backend.clone());
        restarted.restore();
        assert!(backend.interface_up("wg0"));
        assert_eq!(backend.ip_rules().len(), 7);

        restarted.shutdown();
        assert!(backend.interface_up("wg0"));
    }
}
