//! Port forwards from the server's public address into the tunnel.
//!
//! A forward is two rules: a DNAT in `nat PREROUTING` and an ACCEPT in
//! `FORWARD` for the rewritten destination. Both are check-then-insert, so
//! repeating an add never stacks duplicates. The pair is not atomic: if the
//! FORWARD insert fails the DNAT stays installed and re-running the add is
//! the recovery path.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use wirewarp_core::WarpResult;

use crate::backend::iptables::{self, Rule};
use crate::backend::{sysctl, SharedBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A forward is identified by its full tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardRule {
    pub protocol: Protocol,
    pub public_port: u16,
    pub dest_ip: String,
    pub dest_port: u16,
}

impl ForwardRule {
    /// `nat PREROUTING` DNAT, scoped to `public_ip` when known.
    pub fn dnat(&self, public_ip: Option<&str>) -> Rule {
        let mut spec = vec!["-p".to_string(), self.protocol.to_string()];
        if let Some(ip) = public_ip.filter(|ip| !ip.is_empty()) {
            spec.push("-d".into());
            spec.push(ip.to_string());
        }
        spec.extend([
            "--dport".to_string(),
            self.public_port.to_string(),
            "-j".to_string(),
            "DNAT".to_string(),
            "--to-destination".to_string(),
            format!("{}:{}", self.dest_ip, self.dest_port),
        ]);
        Rule::new("PREROUTING", spec).table("nat")
    }

    /// `FORWARD` accept for the post-DNAT destination.
    pub fn accept(&self) -> Rule {
        Rule::new(
            "FORWARD",
            [
                "-p".to_string(),
                self.protocol.to_string(),
                "-d".to_string(),
                self.dest_ip.clone(),
                "--dport".to_string(),
                self.dest_port.to_string(),
                "-j".to_string(),
                "ACCEPT".to_string(),
            ],
        )
    }
}

impl fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} -> {}:{}",
            self.protocol, self.public_port, self.dest_ip, self.dest_port
        )
    }
}

pub struct ForwardRuleManager {
    backend: SharedBackend,
}

impl ForwardRuleManager {
    pub fn new(backend: SharedBackend) -> Self {
        Self { backend }
    }

    /// Install the DNAT, then the FORWARD accept.
    pub fn add(&self, public_ip: Option<&str>, rule: &ForwardRule) -> WarpResult<()> {
        let backend = self.backend.as_ref();
        iptables::ensure(backend, &rule.dnat(public_ip)).map_err(|e| e.context("DNAT rule"))?;
        iptables::ensure(backend, &rule.accept()).map_err(|e| e.context("FORWARD rule"))?;
        info!(forward = %rule, "port forward installed");
        Ok(())
    }

    /// Delete both rules. Absent rules are fine.
    ///
    /// Best-effort: both deletes are attempted and the first failure is
    /// returned for the caller to log or discard.
    pub fn remove(&self, public_ip: Option<&str>, rule: &ForwardRule) -> WarpResult<()> {
        let backend = self.backend.as_ref();
        let dnat = iptables::remove(backend, &rule.dnat(public_ip));
        let accept = iptables::remove(backend, &rule.accept());
        info!(forward = %rule, "port forward removed");
        dnat.and(accept)
    }

    pub fn enable_ip_forward(&self) -> WarpResult<()> {
        self.backend
            .run(&sysctl("net.ipv4.ip_forward", "1"))
            .map(|_| ())
    }

    /// Masquerade traffic leaving `iface`.
    pub fn ensure_masquerade(&self, iface: &str) -> WarpResult<()> {
        iptables::ensure(self.backend.as_ref(), &iptables::masquerade(iface)).map(|_| ())
    }

    /// Persist the rule set, logging instead of failing.
    pub fn save(&self) {
        if let Err(e) = iptables::save(self.backend.as_ref()) {
            warn!(error = %e, "failed to persist iptables rules");
        }
    }
}
