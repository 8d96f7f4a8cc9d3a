//! iptables rule helpers with check-then-insert semantics.
//!
//! A [`Rule`] is identified by its table, chain and match/target spec. The
//! same description renders to `-C` (exists?), `-A`/`-I` (insert) and `-D`
//! (delete), so a rule is never appended twice.

use super::{Invocation, NetworkBackend, Program};
use wirewarp_core::WarpResult;

/// Upper bound on repeated deletes when clearing duplicates left by older
/// agent versions.
const MAX_DUPLICATE_DELETES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// `-A`: end of chain.
    Append,
    /// `-I`: head of chain.
    Insert,
}

/// One iptables rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub table: Option<&'static str>,
    pub chain: String,
    pub spec: Vec<String>,
    pub placement: Placement,
}

impl Rule {
    /// A rule in the default `filter` table, appended on insert.
    pub fn new<I, S>(chain: &str, spec: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            table: None,
            chain: chain.to_string(),
            spec: spec.into_iter().map(Into::into).collect(),
            placement: Placement::Append,
        }
    }

    pub fn table(mut self, table: &'static str) -> Self {
        self.table = Some(table);
        self
    }

    pub fn at_head(mut self) -> Self {
        self.placement = Placement::Insert;
        self
    }

    fn invocation(&self, action: &str) -> Invocation {
        let mut args = Vec::with_capacity(self.spec.len() + 4);
        if let Some(table) = self.table {
            args.push("-t".to_string());
            args.push(table.to_string());
        }
        args.push(action.to_string());
        args.push(self.chain.clone());
        args.extend(self.spec.iter().cloned());
        Invocation::new(Program::Iptables, args)
    }

    pub fn check(&self) -> Invocation {
        self.invocation("-C")
    }

    pub fn insert(&self) -> Invocation {
        match self.placement {
            Placement::Append => self.invocation("-A"),
            Placement::Insert => self.invocation("-I"),
        }
    }

    pub fn delete(&self) -> Invocation {
        self.invocation("-D")
    }
}

/// Insert `rule` unless an identical rule is already present.
///
/// Returns `true` when the rule was inserted.
pub fn ensure(backend: &dyn NetworkBackend, rule: &Rule) -> WarpResult<bool> {
    if backend.probe(&rule.check()) {
        return Ok(false);
    }
    backend.run(&rule.insert())?;
    Ok(true)
}

/// Delete every copy of `rule`. An absent rule is not an error.
///
/// Best-effort: the result may be discarded.
pub fn remove(backend: &dyn NetworkBackend, rule: &Rule) -> WarpResult<()> {
    for _ in 0..MAX_DUPLICATE_DELETES {
        if !backend.probe(&rule.check()) {
            return Ok(());
        }
        backend.run(&rule.delete())?;
    }
    Ok(())
}

/// `iptables -P <chain> <target>`.
pub fn set_policy(backend: &dyn NetworkBackend, chain: &str, target: &str) -> WarpResult<()> {
    backend
        .run(&Invocation::new(Program::Iptables, ["-P", chain, target]))
        .map(|_| ())
}

/// Whether a chain exists in the filter table.
pub fn chain_exists(backend: &dyn NetworkBackend, chain: &str) -> bool {
    backend.probe(&Invocation::new(Program::Iptables, ["-L", chain, "-n"]))
}

/// Persist the live rule set so it survives a reboot.
///
/// Best-effort: callers log a failure and carry on.
pub fn save(backend: &dyn NetworkBackend) -> WarpResult<()> {
    backend
        .run(&Invocation::new(Program::NetfilterPersistent, ["save"]))
        .map(|_| ())
}

/// `nat POSTROUTING -o <iface> -j MASQUERADE`.
pub fn masquerade(iface: &str) -> Rule {
    Rule::new("POSTROUTING", ["-o", iface, "-j", "MASQUERADE"]).table("nat")
}
