//! WireWarp control protocol messages.
//!
//! Agent → server messages are a tagged enum keyed by `type`. Server → agent
//! traffic is either a handshake reply (`registered`, `authenticated`, or a
//! rejection carrying `message`) or a command envelope `{id, type, params}`.

use serde::{Deserialize, Serialize};

/// Messages sent by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// First contact: trade the one-time registration token for a session JWT.
    Register {
        token: String,
        hostname: String,
        agent_type: String,
    },
    /// Resume an existing identity with the stored session JWT.
    Auth { jwt: String },
    Heartbeat {
        /// RFC 3339, UTC.
        timestamp: String,
        version: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_ip: Option<String>,
    },
    CommandResult(CommandResult),
}

/// Outcome of exactly one [`Command`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: String,
    pub success: bool,
    /// Handler output on success, stringified error on failure.
    pub output: String,
}

impl CommandResult {
    pub fn ok(command_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            success: true,
            output: output.into(),
        }
    }

    pub fn failed(command_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            success: false,
            output: output.into(),
        }
    }
}

/// A remote request. `params` is opaque until a handler parses it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// A handshake reply from the control server.
///
/// Kept loose on purpose: anything other than the expected `type` is a
/// rejection, and `message` is surfaced verbatim in the log line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerReply {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ServerReply {
    pub const REGISTERED: &'static str = "registered";
    pub const AUTHENTICATED: &'static str = "authenticated";

    /// Reason text for a rejection, falling back to the reply type.
    pub fn reason(&self) -> String {
        match &self.message {
            Some(m) if !m.is_empty() => m.clone(),
            _ if self.kind.is_empty() => "no reason given".to_string(),
            _ => format!("unexpected reply '{}'", self.kind),
        }
    }
}
