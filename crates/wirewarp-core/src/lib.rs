//! wirewarp-core: shared protocol library for the WireWarp agent.
//!
//! Provides the JSON control-message types exchanged with the control server,
//! the text-frame codec, and the error type used across the agent.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode, encode};
pub use error::{WarpError, WarpResult};
pub use messages::{AgentMessage, Command, CommandResult, ServerReply};
