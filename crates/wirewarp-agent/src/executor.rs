//! Command registry: command type → handler.
//!
//! Every dispatched [`Command`] yields exactly one [`CommandResult`], whether
//! or not a handler is bound for its type. Handlers run synchronously, so a
//! slow one delays the commands queued behind it.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{info, warn};
use wirewarp_core::{Command, CommandResult, WarpResult};

/// A bound command handler. Returns the success message, or the error whose
/// text becomes the failure output.
pub type Handler = Box<dyn Fn(&Value) -> WarpResult<String> + Send + Sync>;

#[derive(Default)]
pub struct CommandExecutor {
    handlers: HashMap<String, Handler>,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `kind`, replacing any previous binding.
    pub fn register<F>(&mut self, kind: &str, handler: F)
    where
        F: Fn(&Value) -> WarpResult<String> + Send + Sync + 'static,
    {
        if self
            .handlers
            .insert(kind.to_string(), Box::new(handler))
            .is_some()
        {
            warn!(command_type = kind, "handler replaced");
        }
    }

    /// Registered command types, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Run the handler for `cmd` and build its result.
    pub fn dispatch(&self, cmd: &Command) -> CommandResult {
        let Some(handler) = self.handlers.get(&cmd.kind) else {
            warn!(command_id = %cmd.id, command_type = %cmd.kind, "unknown command type");
            return CommandResult::failed(&cmd.id, format!("unknown command type: {}", cmd.kind));
        };

        info!(command_id = %cmd.id, command_type = %cmd.kind, "executing command");
        match handler(&cmd.params) {
            Ok(output) => {
                info!(command_id = %cmd.id, command_type = %cmd.kind, "command succeeded");
                CommandResult::ok(&cmd.id, output)
            }
            Err(e) => {
                warn!(command_id = %cmd.id, command_type = %cmd.kind, error = %e, "command failed");
                CommandResult::failed(&cmd.id, e.to_string())
            }
        }
    }
}
