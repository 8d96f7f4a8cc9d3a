//! WireGuard configuration model and rendering.
//!
//! The same [`WgConfig`] renders in two flavours: the full `wg-quick` file
//! used for bring-up/teardown, and the stripped `wg` file that
//! `wg syncconf` accepts (no `Address`, no `Table`).

use std::fmt::Write;

/// Which tool will read the rendered file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    WgQuick,
    Wg,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSection {
    /// `ip/prefix`, applied by wg-quick only.
    pub address: String,
    pub listen_port: Option<u16>,
    pub private_key: String,
    /// `Table = off`: wg-quick installs no routes for AllowedIPs.
    pub table_off: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSection {
    pub comment: Option<String>,
    pub public_key: String,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
    pub persistent_keepalive: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgConfig {
    pub interface: InterfaceSection,
    pub peers: Vec<PeerSection>,
}

impl WgConfig {
    pub fn render(&self, flavor: Flavor) -> String {
        let mut out = String::new();
        let iface = &self.interface;

        out.push_str("[Interface]\n");
        if flavor == Flavor::WgQuick {
            let _ = writeln!(out, "Address = {}", iface.address);
        }
        if let Some(port) = iface.listen_port {
            let _ = writeln!(out, "ListenPort = {port}");
        }
        let _ = writeln!(out, "PrivateKey = {}", iface.private_key);
        if flavor == Flavor::WgQuick && iface.table_off {
            out.push_str("Table = off\n");
        }
        out.push('\n');

        for peer in &self.peers {
            out.push_str("[Peer]\n");
            if let Some(comment) = peer.comment.as_deref().filter(|c| !c.is_empty()) {
                let _ = writeln!(out, "# {comment}");
            }
            let _ = writeln!(out, "PublicKey = {}", peer.public_key);
            if let Some(endpoint) = &peer.endpoint {
                let _ = writeln!(out, "Endpoint = {endpoint}");
            }
            let _ = writeln!(out, "AllowedIPs = {}", peer.allowed_ips.join(", "));
            if let Some(keepalive) = peer.persistent_keepalive {
                let _ = writeln!(out, "PersistentKeepalive = {keepalive}");
            }
            out.push('\n');
        }

        out
    }
}

/// Prefix length of a CIDR string, if it carries one.
pub fn prefix_len(cidr: &str) -> Option<u8> {
    cidr.split_once('/')
        .and_then(|(_, p)| p.parse::<u8>().ok())
        .filter(|p| *p <= 32)
}
