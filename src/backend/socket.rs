//! Realtime websocket client for the service's row change stream.
//!
//! One socket is shared by every table. Each table gets a topic (`realtime:{table}_changes`)
//! joined on the first listener and left when the last listener is released. Decoded changes
//! fan out to listeners over a `broadcast` channel; when the socket drops, the channels are
//! closed so listeners notice instead of waiting forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::{ChangeFeed, ChangeKind, RawChange};
use crate::errors::SyncError;
use crate::models::Table;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Topic a table's changes are delivered on.
pub fn topic_for(table: Table) -> String {
    format!("realtime:{}_changes", table)
}

/// Phoenix channel message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

impl Frame {
    fn new(topic: impl Into<String>, event: &str, payload: Value, reference: u64) -> Self {
        Self {
            topic: topic.into(),
            event: event.to_string(),
            payload,
            reference: Some(reference.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChangePayload {
    data: ChangeData,
}

#[derive(Debug, Deserialize)]
struct ChangeData {
    table: String,
    #[serde(rename = "type", alias = "eventType")]
    kind: ChangeKind,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    old_record: Option<Value>,
    #[serde(default)]
    commit_timestamp: Option<DateTime<Utc>>,
}

/// Decode a text frame; frames other than row changes yield `None`.
pub fn decode_frame(text: &str) -> Result<Option<RawChange>, SyncError> {
    let frame: Frame = serde_json::from_str(text)?;
    if frame.event != "postgres_changes" {
        return Ok(None);
    }

    let payload: ChangePayload = serde_json::from_value(frame.payload)?;
    let Some(table) = Table::from_str(&payload.data.table) else {
        tracing::debug!(table = %payload.data.table, "Ignoring change for unknown table");
        return Ok(None);
    };

    Ok(Some(RawChange {
        table,
        kind: payload.data.kind,
        new: payload.data.record.filter(|v| !is_empty_object(v)),
        old: payload.data.old_record.filter(|v| !is_empty_object(v)),
        commit_timestamp: payload.data.commit_timestamp,
    }))
}

fn is_empty_object(value: &Value) -> bool {
    value.as_object().is_some_and(|o| o.is_empty()) || value.is_null()
}

#[derive(Debug)]
enum Command {
    Join(Table),
    Leave(Table),
    AccessToken,
}

struct TableChannel {
    sender: broadcast::Sender<RawChange>,
    listeners: usize,
    generation: u64,
}

#[derive(Default)]
struct SocketState {
    commands: Option<mpsc::UnboundedSender<Command>>,
    channels: HashMap<Table, TableChannel>,
    access_token: Option<String>,
    next_generation: u64,
}

fn lock_state(state: &Mutex<SocketState>) -> MutexGuard<'_, SocketState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared realtime connection.
pub struct RealtimeSocket {
    url: String,
    heartbeat: Duration,
    capacity: usize,
    state: Arc<Mutex<SocketState>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl RealtimeSocket {
    pub fn new(url: impl Into<String>, heartbeat: Duration, capacity: usize) -> Self {
        Self {
            url: url.into(),
            heartbeat,
            capacity: capacity.max(1),
            state: Arc::new(Mutex::new(SocketState::default())),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Add a listener for `table`, connecting and joining its topic if needed.
    pub async fn subscribe(&self, table: Table) -> Result<ChangeFeed, SyncError> {
        self.ensure_connected().await?;

        let mut state = lock_state(&self.state);
        if let Some(channel) = state.channels.get_mut(&table) {
            channel.listeners += 1;
            tracing::debug!(table = %table, listeners = channel.listeners, "Realtime listener added");
            return Ok(ChangeFeed {
                receiver: channel.sender.subscribe(),
                generation: channel.generation,
            });
        }

        let commands = state
            .commands
            .clone()
            .ok_or_else(|| SyncError::Transport("Realtime socket closed".to_string()))?;
        commands
            .send(Command::Join(table))
            .map_err(|_| SyncError::Transport("Realtime socket closed".to_string()))?;

        state.next_generation += 1;
        let generation = state.next_generation;
        let (sender, receiver) = broadcast::channel(self.capacity);
        state.channels.insert(
            table,
            TableChannel {
                sender,
                listeners: 1,
                generation,
            },
        );
        tracing::info!(table = %table, topic = %topic_for(table), generation, "Joining realtime topic");
        Ok(ChangeFeed {
            receiver,
            generation,
        })
    }

    /// Drop a listener of channel `generation`; the topic is left when none remain. Extra calls
    /// and calls for a channel the socket already dropped are no-ops.
    pub fn release(&self, table: Table, generation: u64) {
        let mut state = lock_state(&self.state);
        let Some(channel) = state.channels.get_mut(&table) else {
            return;
        };
        if channel.generation != generation {
            tracing::debug!(table = %table, generation, "Ignoring release of a stale realtime channel");
            return;
        }

        channel.listeners = channel.listeners.saturating_sub(1);
        if channel.listeners > 0 {
            return;
        }

        state.channels.remove(&table);
        if let Some(commands) = &state.commands {
            let _ = commands.send(Command::Leave(table));
        }
        tracing::info!(table = %table, "Leaving realtime topic");
    }

    /// Token sent with joins so row-level rules apply to the delivered changes.
    pub fn set_access_token(&self, token: Option<String>) {
        let mut state = lock_state(&self.state);
        state.access_token = token;
        if let Some(commands) = &state.commands {
            let _ = commands.send(Command::AccessToken);
        }
    }

    pub fn is_listening(&self, table: Table) -> bool {
        lock_state(&self.state).channels.contains_key(&table)
    }

    async fn ensure_connected(&self) -> Result<(), SyncError> {
        let _guard = self.connect_lock.lock().await;
        let connected = lock_state(&self.state)
            .commands
            .as_ref()
            .is_some_and(|commands| !commands.is_closed());
        if connected {
            return Ok(());
        }

        let (ws, _) = connect_async(self.url.as_str()).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        lock_state(&self.state).commands = Some(tx);
        tokio::spawn(run_socket(ws, rx, Arc::clone(&self.state), self.heartbeat));
        tracing::info!("Realtime socket connected");
        Ok(())
    }
}

impl Drop for RealtimeSocket {
    fn drop(&mut self) {
        // Dropping the command sender ends the socket task.
        lock_state(&self.state).commands = None;
    }
}

async fn run_socket(
    ws: WsStream,
    mut commands: mpsc::UnboundedReceiver<Command>,
    state: Arc<Mutex<SocketState>>,
    heartbeat: Duration,
) {
    let (mut sink, mut stream) = ws.split();
    let mut next_ref: u64 = 0;
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.tick().await;

    'socket: loop {
        let outgoing = tokio::select! {
            command = commands.recv() => match command {
                Some(command) => command_frames(command, &state, &mut next_ref),
                None => break 'socket,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    dispatch_frame(&text, &state);
                    Vec::new()
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::warn!("Realtime socket closed by server");
                    break 'socket;
                }
                Some(Ok(_)) => Vec::new(),
                Some(Err(err)) => {
                    tracing::error!(error = %err, "Realtime socket failed");
                    break 'socket;
                }
            },
            _ = ticker.tick() => {
                next_ref += 1;
                vec![Frame::new("phoenix", "heartbeat", json!({}), next_ref)]
            }
        };

        for frame in outgoing {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(err) => {
                    tracing::error!(error = %err, "Failed to encode realtime frame");
                    continue;
                }
            };
            if let Err(err) = sink.send(Message::Text(text)).await {
                tracing::error!(error = %err, "Realtime send failed");
                break 'socket;
            }
        }
    }

    let _ = sink.close().await;
    let mut state = lock_state(&state);
    state.commands = None;
    // Closing the senders wakes every listener with `Closed`.
    state.channels.clear();
    tracing::info!("Realtime socket task finished");
}

fn command_frames(command: Command, state: &Mutex<SocketState>, next_ref: &mut u64) -> Vec<Frame> {
    let state = lock_state(state);
    let token = state.access_token.clone();
    match command {
        Command::Join(table) => {
            *next_ref += 1;
            let mut payload = json!({
                "config": {
                    "broadcast": { "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": [
                        { "event": "*", "schema": "public", "table": table.as_str() }
                    ]
                }
            });
            if let Some(token) = token {
                payload["access_token"] = Value::String(token);
            }
            vec![Frame::new(topic_for(table), "phx_join", payload, *next_ref)]
        }
        Command::Leave(table) => {
            *next_ref += 1;
            vec![Frame::new(topic_for(table), "phx_leave", json!({}), *next_ref)]
        }
        Command::AccessToken => {
            let Some(token) = token else {
                return Vec::new();
            };
            state
                .channels
                .keys()
                .map(|table| {
                    *next_ref += 1;
                    Frame::new(
                        topic_for(*table),
                        "access_token",
                        json!({ "access_token": token }),
                        *next_ref,
                    )
                })
                .collect()
        }
    }
}

fn dispatch_frame(text: &str, state: &Mutex<SocketState>) {
    match decode_frame(text) {
        Ok(Some(change)) => {
            let state = lock_state(state);
            if let Some(channel) = state.channels.get(&change.table) {
                let delivered = channel.sender.send(change).unwrap_or(0);
                tracing::debug!(delivered, "Realtime change dispatched");
            }
        }
        Ok(None) => {}
        Err(err) => tracing::warn!(error = %err, "Dropping undecodable realtime frame"),
    }
}
