//! Network configuration backend.
//!
//! Every privileged change the agent makes goes through [`NetworkBackend`]:
//! `wg`, `wg-quick`, `ip`, `iptables`, `sysctl` and `netfilter-persistent`
//! invocations, plus the interface-existence probe. The agent owns *what*
//! state must exist; the backend owns how the command is executed.
//!
//! Three calling conventions sit on top of [`NetworkBackend::execute`]:
//!
//! - [`NetworkBackend::run`]: the change must happen; failure carries the
//!   command line and its captured output.
//! - [`NetworkBackend::probe`]: existence checks (`iptables -C`, `-L`);
//!   only the exit status matters.
//! - [`NetworkBackend::try_run`]: best-effort cleanup. The returned result
//!   may be discarded by contract; callers that care log it.

pub mod iptables;

#[cfg(test)]
pub mod fake;

use std::fmt;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use wirewarp_core::{WarpError, WarpResult};

/// External tools the agent drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Program {
    Wg,
    WgQuick,
    Ip,
    Iptables,
    Sysctl,
    NetfilterPersistent,
}

impl Program {
    pub fn binary(self) -> &'static str {
        match self {
            Program::Wg => "wg",
            Program::WgQuick => "wg-quick",
            Program::Ip => "ip",
            Program::Iptables => "iptables",
            Program::Sysctl => "sysctl",
            Program::NetfilterPersistent => "netfilter-persistent",
        }
    }
}

/// One command line to hand to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: Program,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

impl Invocation {
    pub fn new<I, S>(program: Program, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program,
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
        }
    }

    pub fn ip<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Program::Ip, args)
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program.binary())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// stdout and stderr joined and trimmed; the diagnostic reported upstream.
    pub fn combined(&self) -> String {
        let mut text = String::new();
        text.push_str(self.stdout.trim());
        if !self.stderr.trim().is_empty() {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(self.stderr.trim());
        }
        text
    }
}

/// Executes privileged networking commands.
pub trait NetworkBackend: Send + Sync {
    /// Run one invocation to completion. `Err` means the program could not be
    /// started at all; a non-zero exit is `Ok` with `success == false`.
    fn execute(&self, invocation: &Invocation) -> std::io::Result<Output>;

    /// Whether a network interface with this name exists right now.
    fn interface_exists(&self, iface: &str) -> bool;

    /// Run an invocation that must succeed.
    fn run(&self, invocation: &Invocation) -> WarpResult<Output> {
        let output = self.execute(invocation).map_err(|e| WarpError::Backend {
            command: invocation.to_string(),
            output: e.to_string(),
        })?;
        if !output.success {
            return Err(WarpError::Backend {
                command: invocation.to_string(),
                output: output.combined(),
            });
        }
        Ok(output)
    }

    /// Run an existence check; true when the command exits successfully.
    fn probe(&self, invocation: &Invocation) -> bool {
        matches!(self.execute(invocation), Ok(out) if out.success)
    }

    /// Best-effort variant of [`run`](Self::run). Callers are allowed to
    /// discard the result.
    fn try_run(&self, invocation: &Invocation) -> WarpResult<()> {
        self.run(invocation).map(|_| ())
    }
}

pub type SharedBackend = Arc<dyn NetworkBackend>;

/// Backend that shells out to the real tools on the host.
#[derive(Debug, Default, Clone)]
pub struct SystemBackend;

impl NetworkBackend for SystemBackend {
    fn execute(&self, invocation: &Invocation) -> std::io::Result<Output> {
        tracing::debug!(command = %invocation, "exec");

        let mut cmd = std::process::Command::new(invocation.program.binary());
        cmd.args(&invocation.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if invocation.stdin.is_some() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }

        let mut child = cmd.spawn()?;
        if let Some(input) = &invocation.stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes())?;
            }
        }
        let out = child.wait_with_output()?;

        Ok(Output {
            success: out.status.success(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }

    fn interface_exists(&self, iface: &str) -> bool {
        Path::new("/sys/class/net").join(iface).exists()
    }
}

/// `sysctl -w key=value`.
pub fn sysctl(key: &str, value: &str) -> Invocation {
    Invocation::new(Program::Sysctl, ["-w".to_string(), format!("{key}={value}")])
}
