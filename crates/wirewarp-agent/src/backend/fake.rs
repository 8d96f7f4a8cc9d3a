//! In-memory backend for tests.
//!
//! Models just enough kernel state (iptables chains, policy rules, routing
//! tables, sysctls, interfaces) to observe idempotency and de-duplication.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use super::{Invocation, NetworkBackend, Output, Program};

const BUILTIN_CHAINS: &[&str] = &["INPUT", "OUTPUT", "FORWARD", "PREROUTING", "POSTROUTING"];

#[derive(Default)]
struct FakeState {
    log: Vec<Invocation>,
    failures: Vec<(String, String)>,
    iptables: BTreeMap<(String, String), Vec<String>>,
    policies: BTreeMap<String, String>,
    chains: BTreeSet<String>,
    ip_rules: Vec<(u32, String)>,
    routes: BTreeMap<String, Vec<String>>,
    sysctl: BTreeMap<String, String>,
    interfaces: BTreeSet<String>,
    next_key: u32,
    saves: usize,
}

pub struct FakeBackend {
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn with_interface(self, iface: &str) -> Self {
        self.state().interfaces.insert(iface.to_string());
        self
    }

    pub fn with_chain(self, chain: &str) -> Self {
        self.state().chains.insert(chain.to_string());
        self
    }

    /// Make every invocation whose command line contains `pattern` fail.
    pub fn fail_matching(&self, pattern: &str, stderr: &str) {
        self.state()
            .failures
            .push((pattern.to_string(), stderr.to_string()));
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    pub fn log(&self) -> Vec<String> {
        self.state().log.iter().map(ToString::to_string).collect()
    }

    pub fn clear_log(&self) {
        self.state().log.clear();
    }

    pub fn iptables_rules(&self, table: &str, chain: &str) -> Vec<String> {
        self.state()
            .iptables
            .get(&(table.to_string(), chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn policy(&self, chain: &str) -> Option<String> {
        self.state().policies.get(chain).cloned()
    }

    pub fn ip_rules(&self) -> Vec<(u32, String)> {
        self.state().ip_rules.clone()
    }

    pub fn routes(&self, table: &str) -> Vec<String> {
        self.state().routes.get(table).cloned().unwrap_or_default()
    }

    pub fn sysctl(&self, key: &str) -> Option<String> {
        self.state().sysctl.get(key).cloned()
    }

    pub fn saves(&self) -> usize {
        self.state().saves
    }

    pub fn interface_up(&self, iface: &str) -> bool {
        self.state().interfaces.contains(iface)
    }
}

impl NetworkBackend for FakeBackend {
    fn execute(&self, invocation: &Invocation) -> std::io::Result<Output> {
        let mut state = self.state();
        state.log.push(invocation.clone());

        let line = invocation.to_string();
        if let Some((_, stderr)) = state.failures.iter().find(|(p, _)| line.contains(p.as_str())) {
            return Ok(Output::failed(stderr.clone()));
        }

        let args: Vec<&str> = invocation.args.iter().map(String::as_str).collect();
        Ok(match invocation.program {
            Program::Iptables => iptables(&mut state, &args),
            Program::Ip => ip(&mut state, &args),
            Program::Wg => wg(&mut state, &args, invocation.stdin.as_deref()),
            Program::WgQuick => wg_quick(&mut state, &args),
            Program::Sysctl => {
                if let Some((k, v)) = args.get(1).and_then(|kv| kv.split_once('=')) {
                    state.sysctl.insert(k.to_string(), v.to_string());
                }
                Output::ok("")
            }
            Program::NetfilterPersistent => {
                state.saves += 1;
                Output::ok("")
            }
        })
    }

    fn interface_exists(&self, iface: &str) -> bool {
        self.interface_up(iface)
    }
}

fn iptables(state: &mut FakeState, args: &[&str]) -> Output {
    let (table, rest) = match args {
        ["-t", table, rest @ ..] => (*table, rest),
        rest => ("filter", rest),
    };
    let (action, chain, spec) = match rest {
        [action, chain, spec @ ..] => (*action, *chain, spec.join(" ")),
        _ => return Output::failed("iptables: bad invocation"),
    };
    let key = (table.to_string(), chain.to_string());
    let missing = "iptables: Bad rule (does a matching rule exist in that chain?).";

    match action {
        "-C" => match state.iptables.get(&key) {
            Some(rules) if rules.contains(&spec) => Output::ok(""),
            _ => Output::failed(missing),
        },
        "-A" => {
            state.iptables.entry(key).or_default().push(spec);
            Output::ok("")
        }
        "-I" => {
            state.iptables.entry(key).or_default().insert(0, spec);
            Output::ok("")
        }
        "-D" => {
            let rules = state.iptables.entry(key).or_default();
            match rules.iter().position(|r| *r == spec) {
                Some(i) => {
                    rules.remove(i);
                    Output::ok("")
                }
                None => Output::failed(missing),
            }
        }
        "-P" => {
            state.policies.insert(chain.to_string(), spec);
            Output::ok("")
        }
        "-L" => {
            if BUILTIN_CHAINS.contains(&chain) || state.chains.contains(chain) {
                Output::ok("")
            } else {
                Output::failed("iptables: No chain/target/match by that name.")
            }
        }
        _ => Output::failed("iptables: unknown action"),
    }
}

fn ip(state: &mut FakeState, args: &[&str]) -> Output {
    match args {
        ["rule", "add", selector @ ..] => {
            let Some(pos) = selector.iter().position(|a| *a == "priority") else {
                return Output::failed("fake: rule without priority");
            };
            let Some(prio) = selector.get(pos + 1).and_then(|p| p.parse::<u32>().ok()) else {
                return Output::failed("Error: argument is not a number");
            };
            let text = selector[..pos].join(" ");
            state.ip_rules.push((prio, text));
            Output::ok("")
        }
        ["rule", "del", "priority", prio] => {
            let prio = prio.parse::<u32>().unwrap_or(u32::MAX);
            match state.ip_rules.iter().position(|(p, _)| *p == prio) {
                Some(i) => {
                    state.ip_rules.remove(i);
                    Output::ok("")
                }
                None => Output::failed("RTNETLINK answers: No such file or directory"),
            }
        }
        ["route", "add", spec @ ..] => {
            let (table, spec) = split_table(spec);
            let routes = state.routes.entry(table).or_default();
            if routes.contains(&spec) {
                return Output::failed("RTNETLINK answers: File exists");
            }
            routes.push(spec);
            Output::ok("")
        }
        ["route", "flush", "table", table] => {
            state.routes.remove(*table);
            Output::ok("")
        }
        _ => Output::failed("fake: unsupported ip command"),
    }
}

fn split_table(spec: &[&str]) -> (String, String) {
    match spec.iter().position(|a| *a == "table") {
        Some(i) => {
            let table = spec.get(i + 1).copied().unwrap_or("main").to_string();
            let mut rest: Vec<&str> = spec[..i].to_vec();
            rest.extend_from_slice(spec.get(i + 2..).unwrap_or(&[]));
            (table, rest.join(" "))
        }
        None => ("main".to_string(), spec.join(" ")),
    }
}

fn wg(state: &mut FakeState, args: &[&str], stdin: Option<&str>) -> Output {
    match args {
        ["genkey"] => {
            state.next_key += 1;
            Output::ok(format!("privkey-{}=\n", state.next_key))
        }
        ["pubkey"] => Output::ok(format!("pub-{}\n", stdin.unwrap_or_default().trim())),
        ["syncconf", iface, _path] => {
            if state.interfaces.contains(*iface) {
                Output::ok("")
            } else {
                Output::failed("Unable to modify interface: No such device")
            }
        }
        _ => Output::failed("fake: unsupported wg command"),
    }
}

fn wg_quick(state: &mut FakeState, args: &[&str]) -> Output {
    // wg-quick takes either an interface name or a config path named after it.
    let name = |arg: &str| {
        std::path::Path::new(arg)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| arg.to_string())
    };
    match args {
        ["up", target] => {
            let iface = name(*target);
            if !state.interfaces.insert(iface.to_string()) {
                return Output::failed(format!("wg-quick: `{iface}' already exists"));
            }
            Output::ok("")
        }
        ["down", target] => {
            let iface = name(*target);
            if !state.interfaces.remove(&iface) {
                return Output::failed(format!("wg-quick: `{iface}' is not a WireGuard interface"));
            }
            Output::ok("")
        }
        _ => Output::failed("fake: unsupported wg-quick command"),
    }
}
