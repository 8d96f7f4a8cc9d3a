//! Control channel: the agent's single persistent connection to the control
//! server.
//!
//! States: disconnected → connecting → registering | authenticating → active
//! → disconnected. [`ControlChannel::run`] loops through them with jittered
//! exponential backoff until the shutdown flag flips.

pub mod backoff;
mod session;

pub use session::{ws_url, HEARTBEAT_INTERVAL};

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};
use wirewarp_core::WarpError;

use crate::config::{AgentConfig, StateStore};
use crate::executor::CommandExecutor;
use session::SessionEnd;

pub struct ControlChannel {
    store: Arc<StateStore>,
    executor: Arc<CommandExecutor>,
    hostname: String,
    http: reqwest::Client,
}

impl ControlChannel {
    pub fn new(store: Arc<StateStore>, executor: Arc<CommandExecutor>) -> Self {
        Self {
            store,
            executor,
            hostname: local_hostname(),
            http: reqwest::Client::new(),
        }
    }

    /// Override the hostname reported at registration.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Keep a session alive until `shutdown` becomes true (or its sender is
    /// dropped).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if self.store.read(AgentConfig::has_credentials) {
                match self.connect_once(&mut shutdown).await {
                    Ok(SessionEnd::Shutdown) | Err(WarpError::Cancelled) => break,
                    Ok(SessionEnd::Lost { uptime }) => {
                        info!(
                            uptime_ms = u64::try_from(uptime.as_millis()).unwrap_or(u64::MAX),
                            "control connection lost"
                        );
                        attempt = backoff::after_session(attempt, uptime);
                    }
                    Err(e) => warn!(attempt, error = %e, "control connection failed"),
                }
            } else {
                warn!("no registration token or session credential; re-provision the agent");
            }

            let wait = backoff::delay(attempt, self.store.read(AgentConfig::has_credentials));
            attempt = attempt.saturating_add(1);
            info!(
                delay_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                attempt, "reconnecting after delay"
            );
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancelled(&mut shutdown) => break,
            }
        }

        info!("control channel stopped");
    }
}

/// Resolves once shutdown is requested. A dropped sender counts as a request.
pub(crate) async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn local_hostname() -> String {
    ["/proc/sys/kernel/hostname", "/etc/hostname"]
        .iter()
        .filter_map(|p| std::fs::read_to_string(p).ok())
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{accept_async, WebSocketStream};

    use super::*;
    use crate::config::AgentMode;

    const STEP: Duration = Duration::from_secs(5);

    async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (tcp, _) = timeout(STEP, listener.accept()).await.unwrap().unwrap();
        accept_async(tcp).await.unwrap()
    }

    async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
        loop {
            match timeout(STEP, ws.next()).await.unwrap() {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("expected a text frame, got {other:?}"),
            }
        }
    }

    async fn reply(ws: &mut WebSocketStream<TcpStream>, value: Value) {
        ws.send(Message::Text(value.to_string())).await.unwrap();
    }

    fn agent(
        dir: &tempfile::TempDir,
        addr: std::net::SocketAddr,
        token: &str,
        jwt: Option<&str>,
    ) -> (Arc<StateStore>, ControlChannel) {
        let mut exec = CommandExecutor::new();
        exec.register("echo", |params| {
            Ok(params["text"].as_str().unwrap_or_default().to_string())
        });
        agent_with(dir, addr, token, jwt, exec)
    }

    fn agent_with(
        dir: &tempfile::TempDir,
        addr: std::net::SocketAddr,
        token: &str,
        jwt: Option<&str>,
        exec: CommandExecutor,
    ) -> (Arc<StateStore>, ControlChannel) {
        let mut cfg = AgentConfig::bootstrap(AgentMode::Client, &format!("http://{addr}"), token);
        cfg.agent_jwt = jwt.map(str::to_string);
        cfg.public_ip_url = String::new();
        let store = Arc::new(StateStore::new(dir.path().join("agent.toml"), cfg));
        let channel = ControlChannel::new(store.clone(), Arc::new(exec)).with_hostname("h1");
        (store, channel)
    }

    /// Accept a resumed session and consume the initial heartbeat.
    async fn accept_authenticated(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let mut ws = accept(listener).await;
        assert_eq!(next_json(&mut ws).await, json!({"type": "auth", "jwt": "j1"}));
        reply(&mut ws, json!({"type": "authenticated"})).await;
        assert_eq!(next_json(&mut ws).await["type"], "heartbeat");
        ws
    }

    async fn next_result(ws: &mut WebSocketStream<TcpStream>) -> Value {
        loop {
            let msg = next_json(ws).await;
            if msg["type"] == "command_result" {
                return msg;
            }
        }
    }

    #[tokio::test]
    async fn registers_then_resumes_with_session_credential() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (store, channel) = agent(&dir, listener.local_addr().unwrap(), "abc", None);
        let (stop_tx, stop_rx) = watch::channel(false);
        let running = tokio::spawn(async move { channel.run(stop_rx).await });

        let mut ws = accept(&listener).await;
        assert_eq!(
            next_json(&mut ws).await,
            json!({"type": "register", "token": "abc", "hostname": "h1", "agent_type": "client"})
        );
        reply(&mut ws, json!({"type": "registered", "agent_id": "a1", "jwt": "j1"})).await;
        let beat = next_json(&mut ws).await;
        assert_eq!(beat["type"], "heartbeat");
        assert!(beat.get("public_ip").is_none());
        drop(ws);

        let mut ws = accept(&listener).await;
        assert_eq!(next_json(&mut ws).await, json!({"type": "auth", "jwt": "j1"}));
        reply(&mut ws, json!({"type": "authenticated"})).await;
        assert_eq!(next_json(&mut ws).await["type"], "heartbeat");

        reply(&mut ws, json!({"id": "c1", "type": "echo", "params": {"text": "hi"}})).await;
        reply(&mut ws, json!({"not": "a command"})).await;
        reply(&mut ws, json!({"id": "c2", "type": "wg_explode"})).await;
        assert_eq!(
            next_json(&mut ws).await,
            json!({"type": "command_result", "command_id": "c1", "success": true, "output": "hi"})
        );
        let second = next_json(&mut ws).await;
        assert_eq!(second["command_id"], "c2");
        assert_eq!(second["output"], "unknown command type: wg_explode");

        stop_tx.send(true).unwrap();
        loop {
            match timeout(STEP, ws.next()).await.unwrap() {
                Some(Ok(Message::Close(frame))) => {
                    assert_eq!(frame.unwrap().code, CloseCode::Normal);
                    break;
                }
                Some(Ok(_)) => continue,
                other => panic!("expected a close frame, got {other:?}"),
            }
        }
        timeout(STEP, running).await.unwrap().unwrap();

        let saved = AgentConfig::load(store.path()).unwrap();
        assert_eq!(saved.agent_id.as_deref(), Some("a1"));
        assert_eq!(saved.agent_jwt.as_deref(), Some("j1"));
        assert!(saved.agent_token.is_none());
    }

    #[tokio::test]
    async fn rejected_credential_falls_back_to_registration() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (store, channel) = agent(&dir, listener.local_addr().unwrap(), "abc", Some("stale"));
        let (stop_tx, stop_rx) = watch::channel(false);
        let running = tokio::spawn(async move { channel.run(stop_rx).await });

        let mut ws = accept(&listener).await;
        assert_eq!(next_json(&mut ws).await, json!({"type": "auth", "jwt": "stale"}));
        reply(&mut ws, json!({"type": "error", "message": "invalid token"})).await;

        let mut ws = accept(&listener).await;
        let msg = next_json(&mut ws).await;
        assert_eq!(msg["type"], "register");
        assert_eq!(msg["token"], "abc");
        assert!(store.snapshot().agent_jwt.is_none());

        stop_tx.send(true).unwrap();
        timeout(STEP, running).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn commands_complete_in_arrival_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut exec = CommandExecutor::new();
        exec.register("slow", |_| {
            std::thread::sleep(Duration::from_millis(300));
            Ok("slow done".to_string())
        });
        exec.register("fast", |_| Ok("fast done".to_string()));
        let (_store, channel) = agent_with(&dir, listener.local_addr().unwrap(), "", Some("j1"), exec);
        let (stop_tx, stop_rx) = watch::channel(false);
        let running = tokio::spawn(async move { channel.run(stop_rx).await });

        let mut ws = accept_authenticated(&listener).await;
        reply(&mut ws, json!({"id": "a", "type": "slow"})).await;
        reply(&mut ws, json!({"id": "b", "type": "fast"})).await;

        let first = next_result(&mut ws).await;
        let second = next_result(&mut ws).await;
        assert_eq!(first["command_id"], "a");
        assert_eq!(first["output"], "slow done");
        assert_eq!(second["command_id"], "b");
        assert_eq!(second["output"], "fast done");

        stop_tx.send(true).unwrap();
        timeout(STEP, running).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_completes_when_the_server_stops_reading() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut exec = CommandExecutor::new();
        exec.register("bulk", |_| Ok("x".repeat(512 * 1024)));
        let (_store, channel) = agent_with(&dir, listener.local_addr().unwrap(), "", Some("j1"), exec);
        let (stop_tx, stop_rx) = watch::channel(false);
        let running = tokio::spawn(async move { channel.run(stop_rx).await });

        // Flood the agent with large results and never read them, so its
        // socket, writer and outbound queue all back up.
        let mut ws = accept_authenticated(&listener).await;
        for i in 0..200 {
            reply(&mut ws, json!({"id": format!("b{i}"), "type": "bulk"})).await;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        stop_tx.send(true).unwrap();
        timeout(Duration::from_secs(10), running)
            .await
            .expect("run must return after shutdown")
            .unwrap();
        drop(ws);
    }

    #[tokio::test]
    async fn without_credentials_no_connection_is_attempted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (_store, channel) = agent(&dir, listener.local_addr().unwrap(), "", None);
        let (stop_tx, stop_rx) = watch::channel(false);
        let running = tokio::spawn(async move { channel.run(stop_rx).await });

        assert!(timeout(Duration::from_millis(300), listener.accept())
            .await
            .is_err());
        stop_tx.send(true).unwrap();
        timeout(STEP, running).await.unwrap().unwrap();
    }
}
