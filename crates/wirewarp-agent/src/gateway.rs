//! Policy routing for gateway clients.
//!
//! [`GatewayRouting::apply`] sends LAN and self-originated traffic into the
//! tunnel while control-plane, tunnel-endpoint and LAN-local traffic keep the
//! main table. Two idempotency strategies are used and kept apart:
//!
//! - routes, policy rules and connection marks are **flushed then
//!   re-created** on every apply;
//! - NAT, forwarding, container-hook and MSS rules are **check-then-insert**.
//!
//! Nothing is rolled back on failure; re-running `apply` is the recovery path.

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use wirewarp_core::{WarpError, WarpResult};

use crate::backend::iptables::{self, Rule};
use crate::backend::{sysctl, Invocation, NetworkBackend, SharedBackend};
use crate::config::ClientState;

/// Numeric table for traffic leaving through the tunnel.
pub const TUNNEL_OUT_TABLE: &str = "51820";
/// Named table steering replies to tunnel-originated connections.
pub const REPLY_TABLE: &str = "tunnel";
/// Registry entries for both tables.
pub const RT_TABLE_ENTRIES: [(u32, &str); 2] = [(51820, "wgout"), (100, REPLY_TABLE)];

const RT_TABLES_SKELETON: &str = "255 local\n254 main\n253 default\n0 unspec\n";

/// Firewall mark carried by connections that entered via the tunnel.
pub const FWMARK: &str = "0x1";

/// `ip rule` priorities. Lower is evaluated first.
pub mod priority {
    pub const CONTROL_SERVER: u32 = 99;
    pub const TUNNEL_ENDPOINT: u32 = 100;
    pub const LAN: u32 = 200;
    pub const LAN_FORWARD: u32 = 5000;
    pub const SELF_FORWARD: u32 = 5100;
    pub const REPLY_MARK: u32 = 30000;
    /// Slots used by older agent versions; flushed, never written.
    pub const LEGACY: [u32; 2] = [1000, 2000];

    /// Every slot the engine owns.
    pub const OWNED: [u32; 8] = [
        CONTROL_SERVER,
        TUNNEL_ENDPOINT,
        LAN,
        LAN_FORWARD,
        SELF_FORWARD,
        REPLY_MARK,
        LEGACY[0],
        LEGACY[1],
    ];
}

// Exceptions must beat forwarding, which must beat the reply mark.
const _: () = assert!(
    priority::CONTROL_SERVER < priority::TUNNEL_ENDPOINT
        && priority::TUNNEL_ENDPOINT < priority::LAN
        && priority::LAN < priority::LAN_FORWARD
        && priority::LAN_FORWARD < priority::SELF_FORWARD
        && priority::SELF_FORWARD < priority::REPLY_MARK
);

/// Upper bound on deletes per priority slot during a flush.
const MAX_RULES_PER_SLOT: usize = 16;

/// Everything the engine needs, derived from [`ClientState`] plus resolved
/// addresses. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub tunnel_iface: String,
    pub lan_iface: String,
    /// Public IPv4 of the tunnel server.
    pub endpoint_ip: String,
    /// The server's address inside the tunnel.
    pub vps_tunnel_ip: String,
    /// This host's address inside the tunnel.
    pub tunnel_ip: String,
    pub lan_ip: String,
    pub lan_network: String,
    /// Forward other LAN hosts' traffic, not just this host's.
    pub is_gateway: bool,
    /// IPv4 of the control server, when it could be resolved.
    pub control_server_ip: Option<String>,
}

impl GatewayConfig {
    /// Build the routing view of a configured client.
    ///
    /// The endpoint host is resolved to IPv4; failure to resolve it is an
    /// error because the endpoint exception rule cannot be written without
    /// it. The control server is optional.
    pub fn derive(state: &ClientState, control_server_url: &str) -> WarpResult<Self> {
        let host = endpoint_host(&state.server_endpoint);
        let endpoint_ip = resolve_ipv4(host).ok_or_else(|| {
            WarpError::Config(format!("cannot resolve tunnel endpoint host '{host}'"))
        })?;
        let control_server_ip = url_host(control_server_url).and_then(|h| resolve_ipv4(&h));

        Ok(Self {
            tunnel_iface: state.wg_interface.clone(),
            lan_iface: state.lan_iface.clone(),
            endpoint_ip,
            vps_tunnel_ip: state.vps_tunnel_ip.clone(),
            tunnel_ip: state.tunnel_ip.clone(),
            lan_ip: state.lan_ip.clone(),
            lan_network: state.lan_network.clone(),
            is_gateway: state.is_gateway,
            control_server_ip,
        })
    }
}

/// Host part of `host:port` / `[v6]:port`.
pub fn endpoint_host(endpoint: &str) -> &str {
    let host = match endpoint.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => endpoint,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

fn url_host(url: &str) -> Option<String> {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

/// A literal IPv4 address, or the first IPv4 the resolver returns.
pub fn resolve_ipv4(host: &str) -> Option<String> {
    if host.is_empty() {
        return None;
    }
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Some(ip.to_string());
    }
    let addrs = (host, 0u16).to_socket_addrs().ok()?;
    addrs
        .filter_map(|a| match a.ip() {
            IpAddr::V4(v4) => Some(v4.to_string()),
            IpAddr::V6(_) => None,
        })
        .next()
}

/// One `ip rule`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    pub priority: u32,
    /// e.g. `["to", "203.0.113.7"]`, `["fwmark", "0x1"]`.
    pub selector: Vec<String>,
    pub table: &'static str,
}

impl PolicyRule {
    fn new(priority: u32, selector: [&str; 2], table: &'static str) -> Self {
        Self {
            priority,
            selector: selector.iter().map(|s| s.to_string()).collect(),
            table,
        }
    }

    pub fn add(&self) -> Invocation {
        let mut args = vec!["rule".to_string(), "add".to_string()];
        args.extend(self.selector.iter().cloned());
        args.extend([
            "table".to_string(),
            self.table.to_string(),
            "priority".to_string(),
            self.priority.to_string(),
        ]);
        Invocation::ip(args)
    }
}

/// Policy rules for `cfg`, in ascending priority.
pub fn policy_rules(cfg: &GatewayConfig) -> Vec<PolicyRule> {
    let mut rules = Vec::new();

    if let Some(ctrl) = cfg
        .control_server_ip
        .as_deref()
        .filter(|ip| !ip.is_empty() && *ip != cfg.endpoint_ip)
    {
        rules.push(PolicyRule::new(priority::CONTROL_SERVER, ["to", ctrl], "main"));
    }
    rules.push(PolicyRule::new(
        priority::TUNNEL_ENDPOINT,
        ["to", cfg.endpoint_ip.as_str()],
        "main",
    ));
    if !cfg.lan_network.is_empty() {
        rules.push(PolicyRule::new(priority::LAN, ["to", cfg.lan_network.as_str()], "main"));
        if cfg.is_gateway {
            rules.push(PolicyRule::new(
                priority::LAN_FORWARD,
                ["from", cfg.lan_network.as_str()],
                TUNNEL_OUT_TABLE,
            ));
        }
    }
    rules.push(PolicyRule::new(
        priority::SELF_FORWARD,
        ["from", cfg.tunnel_ip.as_str()],
        TUNNEL_OUT_TABLE,
    ));
    if !cfg.lan_ip.is_empty() {
        rules.push(PolicyRule::new(
            priority::SELF_FORWARD,
            ["from", cfg.lan_ip.as_str()],
            TUNNEL_OUT_TABLE,
        ));
    }
    rules.push(PolicyRule::new(priority::REPLY_MARK, ["fwmark", FWMARK], REPLY_TABLE));

    rules
}

/// Connection-marking rules, in the order they must be installed.
pub fn mark_rules(tunnel_iface: &str) -> [Rule; 3] {
    [
        Rule::new(
            "PREROUTING",
            ["-i", tunnel_iface, "-j", "MARK", "--set-mark", FWMARK],
        )
        .table("mangle"),
        Rule::new(
            "PREROUTING",
            ["-i", tunnel_iface, "-j", "CONNMARK", "--save-mark"],
        )
        .table("mangle"),
        Rule::new("OUTPUT", ["-j", "CONNMARK", "--restore-mark"]).table("mangle"),
    ]
}

/// MSS clamp on tunnel egress.
pub fn mss_clamp(tunnel_iface: &str) -> Rule {
    Rule::new(
        "POSTROUTING",
        [
            "-p",
            "tcp",
            "--tcp-flags",
            "SYN,RST",
            "SYN",
            "-o",
            tunnel_iface,
            "-j",
            "TCPMSS",
            "--clamp-mss-to-pmtu",
        ],
    )
    .table("mangle")
}

/// `DOCKER-USER` accepts in both directions between tunnel and LAN.
pub fn container_hook_rules(cfg: &GatewayConfig) -> [Rule; 2] {
    let accept = |from: &str, to: &str| {
        Rule::new("DOCKER-USER", ["-i", from, "-o", to, "-j", "ACCEPT"]).at_head()
    };
    [
        accept(&cfg.tunnel_iface, &cfg.lan_iface),
        accept(&cfg.lan_iface, &cfg.tunnel_iface),
    ]
}

/// Make sure both tables are named in the iproute2 registry.
pub fn ensure_rt_tables(path: &Path) -> WarpResult<()> {
    let existing = match std::fs::read_to_string(path) {
        Ok(content) => Some(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };

    let Some(content) = existing else {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut content = RT_TABLES_SKELETON.to_string();
        for (id, name) in RT_TABLE_ENTRIES {
            content.push_str(&format!("{id} {name}\n"));
        }
        std::fs::write(path, content)?;
        info!(path = %path.display(), "created routing table registry");
        return Ok(());
    };

    let entries: Vec<(&str, &str)> = content
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some((fields.next()?, fields.next()?))
        })
        .collect();

    let mut missing = Vec::new();
    for (id, name) in RT_TABLE_ENTRIES {
        if entries.iter().any(|(_, n)| *n == name) {
            continue;
        }
        let id = id.to_string();
        if let Some((_, taken)) = entries.iter().find(|(i, _)| *i == id) {
            return Err(WarpError::Config(format!(
                "routing table id {id} is already registered as '{taken}' in {}; cannot add '{name}'",
                path.display()
            )));
        }
        missing.push(format!("{id} {name}\n"));
    }
    if missing.is_empty() {
        return Ok(());
    }

    let mut file = std::fs::OpenOptions::new().append(true).open(path)?;
    if !content.is_empty() && !content.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    for entry in &missing {
        file.write_all(entry.as_bytes())?;
    }
    debug!(path = %path.display(), added = missing.len(), "registered routing tables");
    Ok(())
}

pub struct GatewayRouting {
    backend: SharedBackend,
    rt_tables: PathBuf,
}

impl GatewayRouting {
    pub fn new(backend: SharedBackend, rt_tables: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            rt_tables: rt_tables.into(),
        }
    }

    /// Reconcile host routing with `cfg`. Safe to repeat.
    pub fn apply(&self, cfg: &GatewayConfig) -> WarpResult<()> {
        let backend = self.backend.as_ref();

        ensure_rt_tables(&self.rt_tables).map_err(|e| e.context("rt_tables"))?;
        apply_sysctls(backend, cfg).map_err(|e| e.context("sysctl"))?;

        flush_routes(backend);
        flush_policy_rules(backend);
        flush_mark_rules(backend, &cfg.tunnel_iface);

        add_routes(backend, cfg).map_err(|e| e.context("routing tables"))?;
        for rule in policy_rules(cfg) {
            backend.run(&rule.add()).map_err(|e| e.context("ip rules"))?;
        }
        for rule in mark_rules(&cfg.tunnel_iface) {
            iptables::ensure(backend, &rule).map_err(|e| e.context("mangle rules"))?;
        }
        apply_nat_and_forwarding(backend, cfg).map_err(|e| e.context("NAT/forwarding"))?;
        iptables::ensure(backend, &mss_clamp(&cfg.tunnel_iface))
            .map_err(|e| e.context("MSS clamping"))?;

        info!(
            tunnel = %cfg.tunnel_iface,
            lan = %cfg.lan_iface,
            gateway = cfg.is_gateway,
            "gateway routing applied"
        );
        Ok(())
    }

    /// Remove routes, rules, marks, masquerade and MSS clamp for the gateway
    /// on `tunnel_iface`.
    ///
    /// Best-effort: every step runs, failures are logged, and the first one is
    /// returned for callers that want it.
    pub fn teardown(&self, tunnel_iface: &str) -> WarpResult<()> {
        let backend = self.backend.as_ref();
        let mut first = None;
        let mut note = |step: &str, result: WarpResult<()>| {
            if let Err(e) = result {
                warn!(step, error = %e, "gateway teardown step failed");
                first.get_or_insert(e);
            }
        };

        flush_routes(backend);
        flush_policy_rules(backend);
        for rule in mark_rules(tunnel_iface) {
            note("mangle rules", iptables::remove(backend, &rule));
        }
        note(
            "masquerade",
            iptables::remove(backend, &iptables::masquerade(tunnel_iface)),
        );
        note("MSS clamping", iptables::remove(backend, &mss_clamp(tunnel_iface)));

        info!(tunnel = tunnel_iface, "gateway routing torn down");
        first.map_or(Ok(()), Err)
    }
}

fn apply_sysctls(backend: &dyn NetworkBackend, cfg: &GatewayConfig) -> WarpResult<()> {
    let mut keys = vec![
        "net.ipv4.conf.all.rp_filter".to_string(),
        "net.ipv4.conf.default.rp_filter".to_string(),
    ];
    for iface in [&cfg.lan_iface, &cfg.tunnel_iface] {
        if !iface.is_empty() {
            keys.push(format!("net.ipv4.conf.{iface}.rp_filter"));
        }
    }

    backend.run(&sysctl("net.ipv4.ip_forward", "1"))?;
    for key in keys {
        backend.run(&sysctl(&key, "0"))?;
    }
    Ok(())
}

fn flush_routes(backend: &dyn NetworkBackend) {
    for table in [TUNNEL_OUT_TABLE, REPLY_TABLE] {
        if let Err(e) = backend.try_run(&Invocation::ip(["route", "flush", "table", table])) {
            debug!(table, error = %e, "route flush skipped");
        }
    }
}

/// Delete every rule at each owned priority. Several rules can share a slot.
fn flush_policy_rules(backend: &dyn NetworkBackend) {
    for prio in priority::OWNED {
        let del = Invocation::ip(["rule".to_string(), "del".into(), "priority".into(), prio.to_string()]);
        for _ in 0..MAX_RULES_PER_SLOT {
            if backend.try_run(&del).is_err() {
                break;
            }
        }
    }
}

fn flush_mark_rules(backend: &dyn NetworkBackend, tunnel_iface: &str) {
    for rule in mark_rules(tunnel_iface) {
        if let Err(e) = iptables::remove(backend, &rule) {
            debug!(error = %e, "mark rule flush skipped");
        }
    }
}

fn add_routes(backend: &dyn NetworkBackend, cfg: &GatewayConfig) -> WarpResult<()> {
    let tun = cfg.tunnel_iface.as_str();
    backend.run(&Invocation::ip([
        "route", "add", "default", "dev", tun, "table", TUNNEL_OUT_TABLE,
    ]))?;
    backend.run(&Invocation::ip([
        "route",
        "add",
        "default",
        "via",
        cfg.vps_tunnel_ip.as_str(),
        "dev",
        tun,
        "table",
        REPLY_TABLE,
    ]))?;
    Ok(())
}

fn apply_nat_and_forwarding(backend: &dyn NetworkBackend, cfg: &GatewayConfig) -> WarpResult<()> {
    iptables::set_policy(backend, "FORWARD", "ACCEPT")?;
    iptables::ensure(backend, &iptables::masquerade(&cfg.tunnel_iface))?;

    if cfg.is_gateway && iptables::chain_exists(backend, "DOCKER-USER") {
        for rule in container_hook_rules(cfg) {
            if let Err(e) = iptables::ensure(backend, &rule) {
                warn!(error = %e, "failed to add DOCKER-USER accept rule");
            }
        }
    }
    Ok(())
}
