//! Realtime change-notification client.
//!
//! Speaks the Phoenix channel protocol over one WebSocket. Each subscription
//! is its own channel topic joined with a `postgres_changes` config; rows
//! from matching changes are forwarded to the subscription's receiver.
//!
//! A background task owns the socket. It sends heartbeats, reconnects with
//! exponential backoff (1s, 2s, 4s, ... capped at 30s), and re-joins every
//! live subscription after a reconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{ChangeEvent, Filter, Row, Subscription, SubscriptionId};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 30;

/// Phoenix wire frame (protocol vsn 1.0.0).
#[derive(Debug, Serialize, Deserialize)]
struct PhoenixMessage {
    topic: String,
    event: String,
    payload: serde_json::Value,
    #[serde(rename = "ref", default)]
    msg_ref: Option<String>,
}

#[derive(Debug, Clone)]
struct ChannelSpec {
    table: String,
    event: ChangeEvent,
    filter: Filter,
}

struct Channel {
    topic: String,
    spec: ChannelSpec,
    tx: mpsc::UnboundedSender<Row>,
}

enum Command {
    Join {
        id: u64,
        spec: ChannelSpec,
        tx: mpsc::UnboundedSender<Row>,
    },
    Leave {
        id: u64,
    },
}

/// Why a connected session stopped.
enum SessionEnd {
    /// The client was dropped. Do not reconnect.
    Shutdown,
    /// Socket error or server close. Reconnect.
    Lost(anyhow::Error),
}

/// Handle to the realtime connection task.
pub struct RealtimeClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
}

impl RealtimeClient {
    /// Spawn the connection task. Connection errors are retried in the
    /// background; subscriptions made while disconnected are joined once the
    /// socket comes up.
    pub fn connect(ws_url: String, access_token: Option<String>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(ws_url, access_token, cmd_rx));
        Self {
            cmd_tx,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, table: &str, event: ChangeEvent, filter: Filter) -> Result<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let spec = ChannelSpec {
            table: table.to_string(),
            event,
            filter,
        };
        self.cmd_tx
            .send(Command::Join { id, spec, tx })
            .map_err(|_| anyhow!("Realtime connection task has stopped"))?;
        Ok(Subscription {
            id: SubscriptionId(id),
            rows: rx,
        })
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        if self.cmd_tx.send(Command::Leave { id: id.0 }).is_err() {
            tracing::debug!("Realtime task gone; nothing to leave for {:?}", id);
        }
    }
}

/// Build the realtime WebSocket URL from the project URL.
pub fn websocket_url(base_url: &str, anon_key: &str) -> Result<String> {
    let mut url = url::Url::parse(base_url).context("Invalid backend URL")?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => bail!("Unsupported backend URL scheme: {}", other),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("Cannot switch {} to {}", base_url, scheme))?;
    url.set_path("/realtime/v1/websocket");
    url.query_pairs_mut()
        .clear()
        .append_pair("apikey", anon_key)
        .append_pair("vsn", "1.0.0");
    Ok(url.to_string())
}

fn topic_for(id: u64, spec: &ChannelSpec) -> String {
    format!("realtime:{}:{}", spec.table, id)
}

fn join_message(topic: &str, spec: &ChannelSpec, access_token: Option<&str>, msg_ref: u64) -> PhoenixMessage {
    let mut payload = serde_json::json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": "" },
            "postgres_changes": [{
                "event": spec.event.as_str(),
                "schema": "public",
                "table": spec.table,
                "filter": spec.filter.to_postgrest(),
            }]
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = token.into();
    }
    PhoenixMessage {
        topic: topic.to_string(),
        event: "phx_join".into(),
        payload,
        msg_ref: Some(msg_ref.to_string()),
    }
}

fn control_message(topic: &str, event: &str, msg_ref: u64) -> PhoenixMessage {
    PhoenixMessage {
        topic: topic.to_string(),
        event: event.to_string(),
        payload: serde_json::json!({}),
        msg_ref: Some(msg_ref.to_string()),
    }
}

/// Pull `(topic, record)` out of a `postgres_changes` frame.
fn extract_change(text: &str) -> Option<(String, Row)> {
    let msg: PhoenixMessage = serde_json::from_str(text).ok()?;
    if msg.event != "postgres_changes" {
        return None;
    }
    let record = msg.payload.pointer("/data/record")?.clone();
    Some((msg.topic, record))
}

async fn send_frame(ws: &mut WsStream, msg: &PhoenixMessage) -> Result<()> {
    let text = serde_json::to_string(msg)?;
    tracing::debug!("Realtime send: {}", text);
    ws.send(Message::Text(text))
        .await
        .context("Failed to send realtime frame")
}

fn apply_offline(cmd: Command, channels: &mut HashMap<u64, Channel>) {
    match cmd {
        Command::Join { id, spec, tx } => {
            let topic = topic_for(id, &spec);
            channels.insert(id, Channel { topic, spec, tx });
        }
        Command::Leave { id } => {
            channels.remove(&id);
        }
    }
}

async fn run(ws_url: String, access_token: Option<String>, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
    let mut channels: HashMap<u64, Channel> = HashMap::new();
    let mut backoff = INITIAL_BACKOFF_SECS;

    loop {
        match connect_async(&ws_url).await {
            Ok((stream, response)) => {
                tracing::info!("Realtime connected (status={})", response.status());
                backoff = INITIAL_BACKOFF_SECS;
                match run_session(stream, access_token.as_deref(), &mut channels, &mut cmd_rx).await {
                    SessionEnd::Shutdown => {
                        tracing::debug!("Realtime client dropped, closing socket");
                        return;
                    }
                    SessionEnd::Lost(e) => {
                        tracing::warn!("Realtime disconnected: {:#}. Reconnecting in {}s...", e, backoff);
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Realtime connect failed: {}. Retrying in {}s...", e, backoff);
            }
        }

        // Keep tracking joins/leaves while waiting to reconnect.
        let sleep = time::sleep(Duration::from_secs(backoff));
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => apply_offline(cmd, &mut channels),
                    None => return,
                },
            }
        }
        backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
    }
}

async fn run_session(
    mut ws: WsStream,
    access_token: Option<&str>,
    channels: &mut HashMap<u64, Channel>,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
) -> SessionEnd {
    let mut next_ref: u64 = 0;
    let mut bump = || {
        next_ref += 1;
        next_ref
    };

    for channel in channels.values() {
        let join = join_message(&channel.topic, &channel.spec, access_token, bump());
        if let Err(e) = send_frame(&mut ws, &join).await {
            return SessionEnd::Lost(e);
        }
    }

    let mut heartbeat = time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // skip first immediate tick

    loop {
        tokio::select! {
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => dispatch(&text, channels),
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = ws.send(Message::Pong(data)).await {
                        return SessionEnd::Lost(anyhow::Error::new(e).context("Failed to send pong"));
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    return SessionEnd::Lost(anyhow!("closed by server: {:?}", frame));
                }
                Some(Ok(other)) => tracing::debug!("Realtime frame (ignored): {:?}", other),
                Some(Err(e)) => return SessionEnd::Lost(anyhow::Error::new(e).context("Realtime receive error")),
                None => return SessionEnd::Lost(anyhow!("stream ended")),
            },
            cmd = cmd_rx.recv() => match cmd {
                None => {
                    let _ = ws.close(None).await;
                    return SessionEnd::Shutdown;
                }
                Some(Command::Join { id, spec, tx }) => {
                    let topic = topic_for(id, &spec);
                    let join = join_message(&topic, &spec, access_token, bump());
                    channels.insert(id, Channel { topic, spec, tx });
                    if let Err(e) = send_frame(&mut ws, &join).await {
                        return SessionEnd::Lost(e);
                    }
                }
                Some(Command::Leave { id }) => {
                    if let Some(channel) = channels.remove(&id) {
                        let leave = control_message(&channel.topic, "phx_leave", bump());
                        if let Err(e) = send_frame(&mut ws, &leave).await {
                            return SessionEnd::Lost(e);
                        }
                    }
                }
            },
            _ = heartbeat.tick() => {
                let beat = control_message("phoenix", "heartbeat", bump());
                if let Err(e) = send_frame(&mut ws, &beat).await {
                    return SessionEnd::Lost(e.context("Heartbeat send failed"));
                }
            }
        }
    }
}

fn dispatch(text: &str, channels: &HashMap<u64, Channel>) {
    tracing::debug!("Realtime recv: {}", text);

    if let Some((topic, record)) = extract_change(text) {
        match channels.values().find(|c| c.topic == topic) {
            Some(channel) => {
                if channel.tx.send(record).is_err() {
                    tracing::debug!("Subscriber for {} went away", topic);
                }
            }
            None => tracing::debug!("Change for unknown topic {}", topic),
        }
        return;
    }

    let Ok(msg) = serde_json::from_str::<PhoenixMessage>(text) else {
        tracing::warn!("Unparseable realtime frame: {}", text);
        return;
    };
    match msg.event.as_str() {
        "phx_reply" => {
            let status = msg.payload.get("status").and_then(|s| s.as_str());
            if status != Some("ok") {
                tracing::warn!("Realtime {} rejected: {}", msg.topic, msg.payload);
            }
        }
        "phx_error" | "phx_close" => {
            tracing::warn!("Realtime channel {} reported {}", msg.topic, msg.event);
        }
        _ => {}
    }
}
