use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ClientConfig;
use crate::tokio_tools::spawn_named_task;

use super::{
    BroadcastMessage, BroadcastSink, ChangeKind, ChannelHandle, ChannelSpec, ChannelStatus,
    Publisher, RealtimeError, RealtimeEvent, RealtimeHub, Table, TableChange,
};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

const LOG_TARGET: &str = "realtime::supabase";
const OUTGOING_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct SupabaseRealtimeConfig {
    pub realtime_url: Url,
    pub api_key: String,
    pub schema: String,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    pub event_capacity: usize,
}

impl From<&ClientConfig> for SupabaseRealtimeConfig {
    fn from(cfg: &ClientConfig) -> Self {
        Self {
            realtime_url: cfg.realtime_url.clone(),
            api_key: cfg.anon_key.clone(),
            schema: "public".to_string(),
            handshake_timeout: cfg.handshake_timeout,
            heartbeat_interval: cfg.heartbeat_interval,
            reconnect_delay: cfg.reconnect_delay,
            event_capacity: cfg.event_capacity,
        }
    }
}

/// Phoenix-protocol client for Supabase Realtime. Each opened channel runs
/// its own socket on a background task and reconnects until stopped.
#[derive(Clone)]
pub struct SupabaseRealtime {
    cfg: SupabaseRealtimeConfig,
    access_token: Arc<RwLock<Option<String>>>,
}

impl SupabaseRealtime {
    pub fn new(cfg: SupabaseRealtimeConfig) -> Self {
        Self {
            cfg,
            access_token: Arc::new(RwLock::new(None)),
        }
    }

    /// User JWT sent on join so row-level security applies to the feed.
    /// Channels opened later pick up the new token.
    pub fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write() = token;
    }
}

#[async_trait]
impl RealtimeHub for SupabaseRealtime {
    async fn open(&self, spec: ChannelSpec) -> Result<ChannelHandle, RealtimeError> {
        let (tx, rx) = broadcast::channel(self.cfg.event_capacity);
        let (out_tx, out_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let stop = CancellationToken::new();
        let topic = spec.topic.clone();

        let access_token = self
            .access_token
            .read()
            .clone()
            .unwrap_or_else(|| self.cfg.api_key.clone());
        let worker = ChannelWorker {
            cfg: self.cfg.clone(),
            access_token,
            topic: format!("realtime:{}", spec.topic),
            spec,
            tx,
            outgoing: out_rx,
            stop: stop.clone(),
            next_ref: 0,
        };
        spawn_named_task(format!("realtime-{topic}"), worker.run());

        let sink = SupabaseSink {
            topic: topic.clone(),
            tx: out_tx,
        };
        Ok(ChannelHandle::new(
            topic,
            rx,
            Publisher::new(Arc::new(sink)),
            stop,
        ))
    }
}

struct SupabaseSink {
    topic: String,
    tx: mpsc::Sender<BroadcastMessage>,
}

#[async_trait]
impl BroadcastSink for SupabaseSink {
    async fn publish(&self, message: BroadcastMessage) -> Result<(), RealtimeError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| RealtimeError::Closed(self.topic.clone()))
    }
}

enum Flow {
    Continue,
    Reconnect(String),
}

struct ChannelWorker {
    cfg: SupabaseRealtimeConfig,
    access_token: String,
    spec: ChannelSpec,
    topic: String,
    tx: broadcast::Sender<RealtimeEvent>,
    outgoing: mpsc::Receiver<BroadcastMessage>,
    stop: CancellationToken,
    next_ref: u64,
}

impl ChannelWorker {
    async fn run(mut self) {
        info!(
            target = LOG_TARGET,
            url = %redacted(&self.cfg.realtime_url),
            topic = %self.topic,
            "starting Supabase realtime channel"
        );
        while !self.stop.is_cancelled() {
            let reason = match self.connect().await {
                Ok(stream) => match self.pump(stream).await {
                    Ok(()) => None,
                    Err(err) => Some(err.to_string()),
                },
                Err(err) => Some(err.to_string()),
            };

            if self.stop.is_cancelled() {
                break;
            }

            let reason = reason.unwrap_or_else(|| "socket closed".to_string());
            warn!(target = LOG_TARGET, topic = %self.topic, error = %reason, "realtime channel interrupted");
            self.emit(RealtimeEvent::Status(ChannelStatus::ChannelError(reason)));

            debug!(
                target = LOG_TARGET,
                delay_secs = self.cfg.reconnect_delay.as_secs_f32(),
                "waiting before reconnect attempt"
            );
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = sleep(self.cfg.reconnect_delay) => {}
            }
        }

        self.emit(RealtimeEvent::Status(ChannelStatus::Closed));
        info!(target = LOG_TARGET, topic = %self.topic, "Supabase realtime channel stopped");
    }

    fn emit(&self, event: RealtimeEvent) {
        let _ = self.tx.send(event);
    }

    fn reference(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    async fn connect(&self) -> Result<WsStream, RealtimeError> {
        let connect_fut = connect_async(self.cfg.realtime_url.as_str());
        match timeout(self.cfg.handshake_timeout, connect_fut).await {
            Err(_) => {
                self.emit(RealtimeEvent::Status(ChannelStatus::TimedOut));
                Err(RealtimeError::Connection(
                    "Supabase realtime handshake timed out".to_string(),
                ))
            }
            Ok(Err(err)) => Err(RealtimeError::Connection(format!(
                "Supabase realtime handshake failed: {err}"
            ))),
            Ok(Ok((stream, _))) => Ok(stream),
        }
    }

    async fn pump(&mut self, stream: WsStream) -> Result<(), RealtimeError> {
        let (mut sink, mut source) = stream.split();

        let join = self.join_message()?;
        send_text(&mut sink, join).await?;

        let mut heartbeat = interval(self.cfg.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut joined = false;
        let outcome = loop {
            tokio::select! {
                _ = self.stop.cancelled() => {
                    debug!(target = LOG_TARGET, "shutdown signal received");
                    break Ok(());
                }
                _ = heartbeat.tick() => {
                    let msg = self.heartbeat_message()?;
                    if let Err(err) = send_text(&mut sink, msg).await {
                        break Err(err);
                    }
                }
                Some(outgoing) = self.outgoing.recv() => {
                    let msg = self.broadcast_message(&outgoing)?;
                    if let Err(err) = send_text(&mut sink, msg).await {
                        break Err(err);
                    }
                }
                msg = source.next() => {
                    match msg {
                        Some(Ok(Message::Text(txt))) => match self.handle_text(&mut joined, &txt) {
                            Ok(Flow::Continue) => {}
                            Ok(Flow::Reconnect(reason)) => break Err(RealtimeError::Connection(reason)),
                            Err(err) => {
                                warn!(target = LOG_TARGET, error = %err, "failed to handle realtime message");
                            }
                        },
                        Some(Ok(Message::Ping(payload))) => {
                            sink.send(Message::Pong(payload)).await.ok();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(target = LOG_TARGET, ?frame, "socket closed by server");
                            break Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            break Err(RealtimeError::Connection(format!("websocket error: {err}")));
                        }
                        None => {
                            debug!(target = LOG_TARGET, "websocket stream ended");
                            break Ok(());
                        }
                    }
                }
            }
        };

        if let Ok(leave) = self.leave_message() {
            send_text(&mut sink, leave).await.ok();
        }
        let _ = sink.close().await;
        outcome
    }

    fn handle_text(&self, joined: &mut bool, txt: &str) -> Result<Flow, RealtimeError> {
        let message: IncomingMessage = serde_json::from_str(txt)
            .map_err(|err| RealtimeError::decode(format!("envelope: {err}")))?;
        if message.topic != self.topic {
            return Ok(Flow::Continue);
        }
        let payload = message.payload.unwrap_or(Value::Null);

        match message.event.as_str() {
            "phx_reply" => {
                let reply: ReplyPayload = serde_json::from_value(payload)
                    .map_err(|err| RealtimeError::decode(format!("phx_reply: {err}")))?;
                if reply.status == "ok" {
                    if !*joined {
                        *joined = true;
                        debug!(target = LOG_TARGET, topic = %self.topic, "subscription acknowledged");
                        self.emit(RealtimeEvent::Status(ChannelStatus::Subscribed));
                    }
                } else {
                    let reason = format!("subscription rejected: {}", reply.response);
                    warn!(target = LOG_TARGET, topic = %self.topic, status = %reply.status, "subscription rejected");
                    return Ok(Flow::Reconnect(reason));
                }
            }
            "system" => {
                let system: SystemPayload = serde_json::from_value(payload)
                    .map_err(|err| RealtimeError::decode(format!("system: {err}")))?;
                if system.status.as_deref() == Some("error") {
                    let reason = system.message.unwrap_or_else(|| "channel error".to_string());
                    self.emit(RealtimeEvent::Status(ChannelStatus::ChannelError(reason)));
                }
            }
            "postgres_changes" => {
                if !*joined {
                    debug!(target = LOG_TARGET, "ignoring change before join ack");
                    return Ok(Flow::Continue);
                }
                if let Some(change) = decode_postgres_change(payload)? {
                    self.emit(RealtimeEvent::Table(change));
                }
            }
            "broadcast" => {
                let frame: BroadcastFrame = serde_json::from_value(payload)
                    .map_err(|err| RealtimeError::decode(format!("broadcast: {err}")))?;
                match BroadcastMessage::decode(&frame.event, frame.payload)? {
                    Some(message) => self.emit(RealtimeEvent::Broadcast(message)),
                    None => debug!(target = LOG_TARGET, event = %frame.event, "ignoring unknown broadcast"),
                }
            }
            "phx_error" => return Ok(Flow::Reconnect("channel crashed on server".to_string())),
            "phx_close" => return Ok(Flow::Reconnect("channel closed by server".to_string())),
            other => {
                debug!(target = LOG_TARGET, event = other, "ignoring realtime event");
            }
        }
        Ok(Flow::Continue)
    }

    fn join_message(&mut self) -> Result<String, RealtimeError> {
        let postgres_changes = self
            .spec
            .bindings
            .iter()
            .map(|binding| PostgresChange {
                event: "*",
                schema: self.cfg.schema.clone(),
                table: binding.table.as_str(),
                filter: binding.filter.as_ref().map(|f| f.render()),
            })
            .collect();
        let payload = JoinPayload {
            access_token: self.access_token.clone(),
            config: JoinConfig {
                broadcast: BroadcastConfig {
                    echo_self: self.spec.broadcast_self,
                    ack: false,
                },
                presence: PresenceConfig { key: "" },
                postgres_changes,
                private: false,
            },
        };
        let envelope = PhoenixEnvelope {
            topic: self.topic.clone(),
            event: "phx_join",
            reference: self.reference(),
            payload,
        };
        encode_message(&envelope)
    }

    fn broadcast_message(&mut self, message: &BroadcastMessage) -> Result<String, RealtimeError> {
        let envelope = PhoenixEnvelope {
            topic: self.topic.clone(),
            event: "broadcast",
            reference: self.reference(),
            payload: BroadcastFrame {
                kind: "broadcast".to_string(),
                event: message.event().to_string(),
                payload: message.payload()?,
            },
        };
        encode_message(&envelope)
    }

    fn heartbeat_message(&mut self) -> Result<String, RealtimeError> {
        let envelope = PhoenixEnvelope {
            topic: "phoenix".to_string(),
            event: "heartbeat",
            reference: self.reference(),
            payload: EmptyPayload {},
        };
        encode_message(&envelope)
    }

    fn leave_message(&mut self) -> Result<String, RealtimeError> {
        let envelope = PhoenixEnvelope {
            topic: self.topic.clone(),
            event: "phx_leave",
            reference: self.reference(),
            payload: EmptyPayload {},
        };
        encode_message(&envelope)
    }
}

async fn send_text(sink: &mut WsSink, text: String) -> Result<(), RealtimeError> {
    sink.send(Message::Text(text))
        .await
        .map_err(|err| RealtimeError::Connection(format!("send failed: {err}")))
}

fn encode_message<T: Serialize>(value: &T) -> Result<String, RealtimeError> {
    serde_json::to_string(value).map_err(|err| RealtimeError::encode(err.to_string()))
}

fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

/// Decodes the payload of a `postgres_changes` frame. Unknown tables yield `None`.
pub(crate) fn decode_postgres_change(payload: Value) -> Result<Option<TableChange>, RealtimeError> {
    let payload: PgPayload = serde_json::from_value(payload)
        .map_err(|err| RealtimeError::decode(format!("postgres_changes: {err}")))?;
    let Some(data) = payload.data else {
        return Ok(None);
    };
    let Some(table) = Table::parse(&data.table) else {
        debug!(target = LOG_TARGET, table = %data.table, "ignoring change on unknown table");
        return Ok(None);
    };
    let kind = ChangeKind::parse(&data.event_type)
        .ok_or_else(|| RealtimeError::decode(format!("unknown change type {}", data.event_type)))?;
    TableChange::decode(table, kind, data.record, data.old_record).map(Some)
}

#[derive(Serialize)]
struct PhoenixEnvelope<T> {
    topic: String,
    event: &'static str,
    #[serde(rename = "ref")]
    reference: String,
    payload: T,
}

#[derive(Serialize)]
struct EmptyPayload {}

#[derive(Serialize)]
struct JoinPayload {
    access_token: String,
    config: JoinConfig,
}

#[derive(Serialize)]
struct JoinConfig {
    broadcast: BroadcastConfig,
    presence: PresenceConfig,
    postgres_changes: Vec<PostgresChange>,
    private: bool,
}

#[derive(Serialize)]
struct BroadcastConfig {
    #[serde(rename = "self")]
    echo_self: bool,
    ack: bool,
}

#[derive(Serialize)]
struct PresenceConfig {
    key: &'static str,
}

#[derive(Serialize)]
struct PostgresChange {
    event: &'static str,
    schema: String,
    table: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct BroadcastFrame {
    #[serde(rename = "type", default)]
    kind: String,
    event: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ReplyPayload {
    status: String,
    #[serde(default)]
    response: Value,
}

#[derive(Debug, Deserialize)]
struct SystemPayload {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PgPayload {
    data: Option<PgChange>,
}

#[derive(Debug, Deserialize)]
struct PgChange {
    table: String,
    #[serde(rename = "type", alias = "eventType")]
    event_type: String,
    #[serde(default, alias = "new")]
    record: Option<Value>,
    #[serde(default, alias = "old")]
    old_record: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::{Change, Filter, TableBinding};
    use serde_json::json;
    use uuid::Uuid;

    fn worker(spec: ChannelSpec) -> (ChannelWorker, broadcast::Receiver<RealtimeEvent>) {
        let cfg = ClientConfig::new("https://abc.supabase.co", "anon").unwrap();
        let (tx, rx) = broadcast::channel(16);
        let (_out_tx, out_rx) = mpsc::channel(1);
        let worker = ChannelWorker {
            cfg: SupabaseRealtimeConfig::from(&cfg),
            access_token: "jwt".to_string(),
            topic: format!("realtime:{}", spec.topic),
            spec,
            tx,
            outgoing: out_rx,
            stop: CancellationToken::new(),
            next_ref: 0,
        };
        (worker, rx)
    }

    #[test]
    fn join_message_lists_bindings_and_filters() {
        let room = Uuid::new_v4();
        let spec = ChannelSpec::new(format!("game:{room}"))
            .bind(TableBinding::filtered(Table::PlayerPigs, Filter::eq("room_id", room)))
            .bind(TableBinding::all(Table::Rooms));
        let (mut worker, _rx) = worker(spec);
        let join: Value = serde_json::from_str(&worker.join_message().unwrap()).unwrap();

        assert_eq!(join["event"], "phx_join");
        assert_eq!(join["topic"], format!("realtime:game:{room}"));
        assert_eq!(join["payload"]["access_token"], "jwt");
        assert_eq!(join["payload"]["config"]["broadcast"]["self"], false);
        let changes = join["payload"]["config"]["postgres_changes"].as_array().unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0]["table"], "player_pigs");
        assert_eq!(changes[0]["filter"], format!("room_id=eq.{room}"));
        assert!(changes[1].get("filter").is_none());
    }

    #[test]
    fn handles_reply_then_change_then_broadcast() {
        let (worker, mut rx) = worker(ChannelSpec::new("game:x"));
        let mut joined = false;

        let reply = json!({
            "topic": "realtime:game:x", "event": "phx_reply", "ref": "1",
            "payload": { "status": "ok", "response": {} }
        });
        worker.handle_text(&mut joined, &reply.to_string()).unwrap();
        assert!(joined);
        assert_eq!(rx.try_recv().unwrap(), RealtimeEvent::Status(ChannelStatus::Subscribed));

        let room = Uuid::new_v4();
        let change = json!({
            "topic": "realtime:game:x", "event": "postgres_changes", "ref": null,
            "payload": { "ids": [1], "data": {
                "schema": "public", "table": "game_states", "type": "UPDATE",
                "commit_timestamp": "2024-05-01T10:00:00Z",
                "record": {
                    "room_id": room, "current_player_order": 2, "game_phase": "playing",
                    "winner_player_id": null, "deck_remaining": 30,
                    "started_at": "2024-05-01T09:00:00Z", "finished_at": null,
                    "created_at": "2024-05-01T09:00:00Z", "updated_at": "2024-05-01T10:00:00Z"
                },
                "old_record": { "room_id": room }
            }}
        });
        worker.handle_text(&mut joined, &change.to_string()).unwrap();
        match rx.try_recv().unwrap() {
            RealtimeEvent::Table(TableChange::GameStates(Change::Update(state))) => {
                assert_eq!(state.current_player_order, 2);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let broadcast = json!({
            "topic": "realtime:game:x", "event": "broadcast", "ref": null,
            "payload": { "type": "broadcast", "event": "game_action", "payload": {
                "action": "mud", "player_id": Uuid::new_v4(),
                "target_pig_id": Uuid::new_v4(), "timestamp": "2024-05-01T10:00:00Z"
            }}
        });
        worker.handle_text(&mut joined, &broadcast.to_string()).unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            RealtimeEvent::Broadcast(BroadcastMessage::GameAction(_))
        ));
    }

    #[test]
    fn rejected_join_requests_reconnect() {
        let (worker, _rx) = worker(ChannelSpec::new("game:y"));
        let mut joined = false;
        let reply = json!({
            "topic": "realtime:game:y", "event": "phx_reply", "ref": "1",
            "payload": { "status": "error", "response": { "reason": "unauthorized" } }
        });
        let flow = worker.handle_text(&mut joined, &reply.to_string()).unwrap();
        assert!(matches!(flow, Flow::Reconnect(_)));
        assert!(!joined);
    }

    #[test]
    fn changes_before_join_are_dropped() {
        let (worker, mut rx) = worker(ChannelSpec::new("game:z"));
        let mut joined = false;
        let change = json!({
            "topic": "realtime:game:z", "event": "postgres_changes",
            "payload": { "data": { "table": "player_hands", "type": "DELETE",
                "old_record": { "id": Uuid::new_v4() } } }
        });
        worker.handle_text(&mut joined, &change.to_string()).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn accepts_legacy_change_field_names() {
        let id = Uuid::new_v4();
        let payload = json!({ "data": { "table": "player_hands", "eventType": "DELETE", "old": { "id": id } } });
        let change = decode_postgres_change(payload).unwrap();
        assert_eq!(change, Some(TableChange::PlayerHands(Change::Delete(id))));
    }
}
