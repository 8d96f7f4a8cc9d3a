//! WireWarp agent.
//!
//! Turns a host into a WireGuard concentrator (server role) or a
//! tunnel-attached gateway (client role), driven by commands that arrive over
//! a persistent WebSocket control channel.

pub mod backend;
pub mod channel;
pub mod config;
pub mod executor;
pub mod forward;
pub mod gateway;
pub mod handlers;
pub mod public_ip;
pub mod tunnel;
pub mod update;
