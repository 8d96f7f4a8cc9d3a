//! `agent_update`: hand off to an external updater.
//!
//! The agent does not replace its own binary. The configured argv is run to
//! completion and its output is reported back.

use tracing::info;
use wirewarp_core::{WarpError, WarpResult};

/// Run the update command and report what it printed.
pub fn run_update(command: Option<&[String]>) -> WarpResult<String> {
    let Some((program, args)) = command.and_then(|argv| argv.split_first()) else {
        return Err(WarpError::Config(
            "no update_command configured; agent update is not available".into(),
        ));
    };

    info!(program = %program, "running update command");
    let out = std::process::Command::new(program).args(args).output()?;

    let mut text = String::from_utf8_lossy(&out.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&out.stderr);
    if !stderr.trim().is_empty() {
        if !text.is_empty() {
            text.push(' ');
        }
        text.push_str(stderr.trim());
    }

    if out.status.success() {
        Ok(if text.is_empty() {
            "update command finished".to_string()
        } else {
            text
        })
    } else {
        Err(WarpError::Backend {
            command: format!("{program} {}", args.join(" ")).trim_end().to_string(),
            output: if text.is_empty() {
                out.status.to_string()
            } else {
                text
            },
        })
    }
}
