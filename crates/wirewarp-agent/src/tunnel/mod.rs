//! Tunnel endpoint: key material, rendered configuration and interface
//! lifecycle for both roles.
//!
//! Declared state (keys, peers, endpoint) lives in [`ServerTunnel`] /
//! [`ClientTunnel`]; every change re-renders the whole configuration and
//! re-applies it. A live interface is updated with `wg syncconf`, which keeps
//! existing sessions; a missing one is brought up with `wg-quick up`.

pub mod client;
pub mod conf;
pub mod keys;
pub mod server;

pub use client::{ClientTunnel, ClientTunnelConfig};
pub use keys::KeyPair;
pub use server::{ServerTunnel, ServerTunnelConfig};

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use wirewarp_core::WarpResult;

use crate::backend::{Invocation, NetworkBackend, Program};
use crate::config::write_private;
use conf::{Flavor, WgConfig};

/// One peer of the server role, keyed by its public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub name: String,
    pub public_key: String,
    pub tunnel_ip: String,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

impl PeerRecord {
    /// `<tunnel_ip>/32`.
    pub fn host_route(&self) -> String {
        format!("{}/32", self.tunnel_ip)
    }

    /// AllowedIPs for the peer block: the host route first, then the
    /// advertised subnets in order, without repeats.
    pub fn rendered_allowed_ips(&self) -> Vec<String> {
        let mut out = vec![self.host_route()];
        for ip in &self.allowed_ips {
            if !out.contains(ip) {
                out.push(ip.clone());
            }
        }
        out
    }

    /// Advertised subnets other than the peer's own tunnel address. These need
    /// an explicit kernel route because live-sync installs none.
    pub fn routed_subnets(&self) -> Vec<String> {
        self.rendered_allowed_ips().split_off(1)
    }
}

/// Where tunnel files live on the host.
#[derive(Debug, Clone)]
pub struct TunnelFiles {
    dir: PathBuf,
}

impl TunnelFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join("agent.key")
    }

    /// Full config read by `wg-quick`.
    pub fn quick_path(&self, iface: &str) -> PathBuf {
        self.dir.join(format!("{iface}.conf"))
    }

    /// Stripped config read by `wg syncconf`.
    pub fn sync_path(&self, iface: &str) -> PathBuf {
        self.dir.join(format!("{iface}.sync.conf"))
    }
}

/// How a configuration reached the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    LiveSync,
    BringUp,
}

fn write_config(files: &TunnelFiles, iface: &str, config: &WgConfig) -> WarpResult<()> {
    keys::ensure_private_dir(files.dir())?;
    write_private(
        &files.quick_path(iface),
        config.render(Flavor::WgQuick).as_bytes(),
    )?;
    write_private(&files.sync_path(iface), config.render(Flavor::Wg).as_bytes())?;
    Ok(())
}

/// Write `config` and apply it: live-sync when the interface exists, full
/// bring-up otherwise.
pub(crate) fn apply(
    backend: &dyn NetworkBackend,
    files: &TunnelFiles,
    iface: &str,
    config: &WgConfig,
) -> WarpResult<Applied> {
    if backend.interface_exists(iface) {
        resync(backend, files, iface, config)?;
        return Ok(Applied::LiveSync);
    }
    write_config(files, iface, config)?;
    let path = files.quick_path(iface);
    backend.run(&Invocation::new(
        Program::WgQuick,
        ["up".to_string(), path.display().to_string()],
    ))?;
    debug!(interface = iface, "tunnel brought up");
    Ok(Applied::BringUp)
}

/// Write `config` and push it to the running interface.
pub(crate) fn resync(
    backend: &dyn NetworkBackend,
    files: &TunnelFiles,
    iface: &str,
    config: &WgConfig,
) -> WarpResult<()> {
    write_config(files, iface, config)?;
    let path = files.sync_path(iface);
    backend.run(&Invocation::new(
        Program::Wg,
        [
            "syncconf".to_string(),
            iface.to_string(),
            path.display().to_string(),
        ],
    ))?;
    debug!(interface = iface, "tunnel live-synced");
    Ok(())
}

/// Full teardown of the interface.
pub(crate) fn down(backend: &dyn NetworkBackend, files: &TunnelFiles, iface: &str) -> WarpResult<()> {
    let path = files.quick_path(iface);
    backend
        .run(&Invocation::new(
            Program::WgQuick,
            ["down".to_string(), path.display().to_string()],
        ))
        .map(|_| ())
}
