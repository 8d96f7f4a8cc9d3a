//! One control connection: handshake, writer, reader and heartbeat.
//!
//! All outbound frames go through a bounded queue owned by a single writer
//! task. The reader task decodes commands and runs them one at a time on a
//! blocking thread; the session loop only ticks heartbeats and watches for
//! shutdown or the reader ending.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use wirewarp_core::{
    decode, encode, AgentMessage, Command, CommandResult, ServerReply, WarpError, WarpResult,
};

use super::{cancelled, ControlChannel};
use crate::config::AgentConfig;
use crate::executor::CommandExecutor;
use crate::public_ip;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const OUTBOUND_QUEUE: usize = 64;
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// How long the writer gets to flush the close frame on shutdown.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// How an established connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum SessionEnd {
    Shutdown,
    /// The connection dropped after being active for `uptime`.
    Lost { uptime: Duration },
}

enum Outbound {
    Message(AgentMessage),
    Close,
}

/// `http(s)://host` → `ws(s)://host/ws/agent`.
pub fn ws_url(base: &str) -> String {
    let base = base.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{base}/ws/agent")
}

fn close_frame() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "shutting down".into(),
    }))
}

fn heartbeat(public_ip: Option<&str>) -> AgentMessage {
    AgentMessage::Heartbeat {
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        version: env!("CARGO_PKG_VERSION").to_string(),
        public_ip: public_ip.filter(|ip| !ip.is_empty()).map(str::to_string),
    }
}

impl ControlChannel {
    /// Connect, authenticate and serve until the connection drops or
    /// shutdown is requested. `Err` means the session never became active.
    pub(super) async fn connect_once(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> WarpResult<SessionEnd> {
        let cfg = self.store.snapshot();
        let url = ws_url(&cfg.control_server_url);
        debug!(%url, "connecting to control server");

        let connected = tokio::select! {
            res = connect_async(url.as_str()) => Some(res),
            _ = cancelled(shutdown) => None,
        };
        let Some(connected) = connected else {
            return Ok(SessionEnd::Shutdown);
        };
        let (ws, _response) =
            connected.map_err(|e| WarpError::Transport(format!("connect {url}: {e}")))?;
        let (mut sink, mut source) = ws.split();

        let handshake = tokio::select! {
            res = self.handshake(&cfg, &mut sink, &mut source) => Some(res),
            _ = cancelled(shutdown) => None,
        };
        let Some(handshake) = handshake else {
            let _ = sink.send(close_frame()).await;
            return Ok(SessionEnd::Shutdown);
        };
        handshake?;
        info!(url = %url, mode = %cfg.mode, "control session active");

        let public_ip = tokio::select! {
            ip = public_ip::lookup(&self.http, &cfg.public_ip_url) => Some(ip),
            _ = cancelled(shutdown) => None,
        };
        let Some(public_ip) = public_ip else {
            let _ = sink.send(close_frame()).await;
            return Ok(SessionEnd::Shutdown);
        };

        Ok(self.serve(sink, source, public_ip, shutdown).await)
    }

    async fn handshake(
        &self,
        cfg: &AgentConfig,
        sink: &mut WsSink,
        source: &mut WsSource,
    ) -> WarpResult<()> {
        if let Some(jwt) = cfg.agent_jwt.as_deref().filter(|j| !j.is_empty()) {
            debug!("authenticating with session credential");
            send(sink, &AgentMessage::Auth { jwt: jwt.to_string() }).await?;
            let reply = read_reply(source).await?;
            if reply.kind == ServerReply::AUTHENTICATED {
                return Ok(());
            }

            let reason = reply.reason();
            warn!(%reason, "session credential rejected; clearing it");
            if let Err(e) = self.store.clear_session() {
                warn!(error = %e, "failed to persist cleared credential");
            }
            if !self.store.read(AgentConfig::has_credentials) {
                error!("no registration token left; the agent must be re-provisioned");
            }
            return Err(WarpError::AuthRejected(reason));
        }

        debug!("registering with one-time token");
        let register = AgentMessage::Register {
            token: cfg.agent_token.clone().unwrap_or_default(),
            hostname: self.hostname.clone(),
            agent_type: cfg.mode.as_str().to_string(),
        };
        send(sink, &register).await?;
        let reply = read_reply(source).await?;
        if reply.kind != ServerReply::REGISTERED {
            return Err(WarpError::RegistrationFailed(reply.reason()));
        }
        let (Some(agent_id), Some(jwt)) = (reply.agent_id, reply.jwt.filter(|j| !j.is_empty()))
        else {
            return Err(WarpError::RegistrationFailed(
                "registered reply is missing agent_id or jwt".into(),
            ));
        };
        if let Err(e) = self.store.record_registration(&agent_id, &jwt) {
            warn!(error = %e, "failed to persist session credential");
        }
        info!(agent_id = %agent_id, "registered with control server");
        Ok(())
    }

    async fn serve(
        &self,
        sink: WsSink,
        source: WsSource,
        public_ip: Option<String>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let mut writer = tokio::spawn(write_loop(sink, rx));
        let mut reader = tokio::spawn(read_loop(source, self.executor.clone(), tx.clone()));
        let started = Instant::now();

        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let end = loop {
            tokio::select! {
                _ = cancelled(shutdown) => break SessionEnd::Shutdown,
                _ = &mut reader => break SessionEnd::Lost { uptime: started.elapsed() },
                // The first tick fires at once: that is the initial heartbeat.
                _ = ticker.tick() => {
                    match tx.try_send(Outbound::Message(heartbeat(public_ip.as_deref()))) {
                        Ok(()) => debug!("heartbeat queued"),
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!("outbound queue full; heartbeat skipped");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            break SessionEnd::Lost { uptime: started.elapsed() };
                        }
                    }
                }
            }
        };

        match end {
            SessionEnd::Shutdown => {
                reader.abort();
                // A stalled peer can leave both the queue and the writer stuck;
                // the grace period bounds the whole close.
                let closed = tokio::time::timeout(CLOSE_GRACE, async {
                    if tx.send(Outbound::Close).await.is_ok() {
                        drop(tx);
                        let _ = (&mut writer).await;
                    }
                })
                .await;
                if closed.is_err() {
                    debug!("close frame not flushed in time");
                    writer.abort();
                }
            }
            SessionEnd::Lost { .. } => {
                drop(tx);
                writer.abort();
            }
        }
        end
    }
}

async fn send(sink: &mut WsSink, msg: &AgentMessage) -> WarpResult<()> {
    let text = encode(msg)?;
    sink.send(Message::Text(text))
        .await
        .map_err(|e| WarpError::Transport(format!("send: {e}")))
}

async fn read_reply(source: &mut WsSource) -> WarpResult<ServerReply> {
    loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => {
                return decode(&text).map_err(|e| WarpError::Protocol(format!("handshake reply: {e}")))
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(WarpError::Transport(
                    "connection closed during handshake".into(),
                ))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(WarpError::Transport(format!("receive: {e}"))),
        }
    }
}

async fn write_loop(mut sink: WsSink, mut rx: mpsc::Receiver<Outbound>) {
    while let Some(item) = rx.recv().await {
        let frame = match item {
            Outbound::Message(msg) => match encode(&msg) {
                Ok(text) => Message::Text(text),
                Err(e) => {
                    warn!(error = %e, "dropping unencodable message");
                    continue;
                }
            },
            Outbound::Close => {
                if let Err(e) = sink.send(close_frame()).await {
                    debug!(error = %e, "close frame not sent");
                }
                break;
            }
        };
        if let Err(e) = sink.send(frame).await {
            warn!(error = %e, "control connection write failed");
            break;
        }
    }
}

async fn read_loop(
    mut source: WsSource,
    executor: Arc<CommandExecutor>,
    tx: mpsc::Sender<Outbound>,
) {
    while let Some(frame) = source.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(frame)) => {
                info!(?frame, "control server closed the connection");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "control connection read failed");
                break;
            }
        };

        let cmd: Command = match decode(&text) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(error = %e, "skipping undecodable message");
                continue;
            }
        };
        let command_id = cmd.id.clone();
        let result = dispatch_blocking(&executor, cmd).await;
        if tx
            .send(Outbound::Message(AgentMessage::CommandResult(result)))
            .await
            .is_err()
        {
            warn!(%command_id, "result not sent: connection writer is gone");
        }
    }
}

/// Run a handler off the async workers and wait for it.
pub(crate) async fn dispatch_blocking(executor: &Arc<CommandExecutor>, cmd: Command) -> CommandResult {
    let id = cmd.id.clone();
    let exec = Arc::clone(executor);
    match tokio::task::spawn_blocking(move || exec.dispatch(&cmd)).await {
        Ok(result) => result,
        Err(e) => {
            error!(command_id = %id, error = %e, "command handler panicked");
            CommandResult::failed(id, format!("handler panicked: {e}"))
        }
    }
}
