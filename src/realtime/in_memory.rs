use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::DEFAULT_EVENT_CAPACITY;
use crate::tokio_tools::spawn_named_task;

use super::{
    BroadcastMessage, BroadcastSink, ChannelHandle, ChannelSpec, ChannelStatus, Publisher,
    RealtimeError, RealtimeEvent, RealtimeHub, TableChange,
};

const LOG_TARGET: &str = "realtime::in_memory";

struct Subscriber {
    id: u64,
    spec: ChannelSpec,
    tx: broadcast::Sender<RealtimeEvent>,
    stop: CancellationToken,
}

impl Subscriber {
    fn is_live(&self) -> bool {
        !self.stop.is_cancelled() && self.tx.receiver_count() > 0
    }
}

#[derive(Default)]
struct Inner {
    subscribers: Vec<Subscriber>,
    next_id: u64,
    refuse_next_open: Option<String>,
}

/// Process-local hub that routes row changes by table binding and filter,
/// and fans broadcasts out per topic.
#[derive(Clone)]
pub struct InMemoryRealtime {
    inner: Arc<RwLock<Inner>>,
    capacity: usize,
}

impl Default for InMemoryRealtime {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRealtime {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            capacity,
        }
    }

    /// Delivers a committed change to every live channel whose bindings match
    /// `row` (the new row, or the old row for deletes).
    pub fn emit(&self, change: &TableChange, row: &Value) {
        let table = change.table();
        let mut inner = self.inner.write();
        inner.subscribers.retain(Subscriber::is_live);
        for sub in &inner.subscribers {
            if sub.spec.bindings.iter().any(|b| b.matches(table, row)) {
                trace!(
                    target = LOG_TARGET,
                    topic = %sub.spec.topic,
                    table = table.as_str(),
                    kind = change.kind().as_str(),
                    "delivering change"
                );
                let _ = sub.tx.send(RealtimeEvent::Table(change.clone()));
            }
        }
    }

    fn fan_out(&self, topic: &str, sender: u64, message: &BroadcastMessage) -> usize {
        let mut inner = self.inner.write();
        inner.subscribers.retain(Subscriber::is_live);
        let echo = inner
            .subscribers
            .iter()
            .find(|sub| sub.id == sender)
            .map(|sub| sub.spec.broadcast_self)
            .unwrap_or(false);
        let mut delivered = 0;
        for sub in inner.subscribers.iter().filter(|sub| sub.spec.topic == topic) {
            if sub.id == sender && !echo {
                continue;
            }
            if sub
                .tx
                .send(RealtimeEvent::Broadcast(message.clone()))
                .is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// Reports a channel error on every live channel of `topic`.
    pub fn disconnect(&self, topic: &str, reason: impl Into<String>) {
        let reason = reason.into();
        let inner = self.inner.read();
        for sub in inner.subscribers.iter().filter(|sub| sub.spec.topic == topic) {
            let _ = sub.tx.send(RealtimeEvent::Status(ChannelStatus::ChannelError(
                reason.clone(),
            )));
        }
    }

    /// The next `open` fails with a connection error.
    pub fn refuse_next_open(&self, reason: impl Into<String>) {
        self.inner.write().refuse_next_open = Some(reason.into());
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        let inner = self.inner.read();
        inner
            .subscribers
            .iter()
            .filter(|sub| sub.spec.topic == topic && sub.is_live())
            .count()
    }

    fn remove(&self, id: u64) {
        self.inner.write().subscribers.retain(|sub| sub.id != id);
    }
}

struct InMemorySink {
    hub: InMemoryRealtime,
    topic: String,
    subscriber: u64,
    stop: CancellationToken,
}

#[async_trait]
impl BroadcastSink for InMemorySink {
    async fn publish(&self, message: BroadcastMessage) -> Result<(), RealtimeError> {
        if self.stop.is_cancelled() {
            return Err(RealtimeError::Closed(self.topic.clone()));
        }
        let delivered = self.hub.fan_out(&self.topic, self.subscriber, &message);
        debug!(
            target = LOG_TARGET,
            topic = %self.topic,
            event = message.event(),
            delivered,
            "broadcast published"
        );
        Ok(())
    }
}

#[async_trait]
impl RealtimeHub for InMemoryRealtime {
    async fn open(&self, spec: ChannelSpec) -> Result<ChannelHandle, RealtimeError> {
        if let Some(reason) = self.inner.write().refuse_next_open.take() {
            return Err(RealtimeError::Connection(reason));
        }

        let (tx, rx) = broadcast::channel(self.capacity);
        let stop = CancellationToken::new();
        let topic = spec.topic.clone();
        let id = {
            let mut inner = self.inner.write();
            inner.next_id += 1;
            let id = inner.next_id;
            inner.subscribers.push(Subscriber {
                id,
                spec,
                tx: tx.clone(),
                stop: stop.clone(),
            });
            id
        };
        let _ = tx.send(RealtimeEvent::Status(ChannelStatus::Subscribed));
        debug!(target = LOG_TARGET, topic = %topic, subscriber = id, "channel opened");

        let hub = self.clone();
        let closing = stop.clone();
        let closing_topic = topic.clone();
        spawn_named_task(format!("realtime-close-{topic}"), async move {
            closing.cancelled().await;
            let _ = tx.send(RealtimeEvent::Status(ChannelStatus::Closed));
            hub.remove(id);
            debug!(target = LOG_TARGET, topic = %closing_topic, subscriber = id, "channel closed");
        });

        let sink = InMemorySink {
            hub: self.clone(),
            topic: topic.clone(),
            subscriber: id,
            stop: stop.clone(),
        };
        Ok(ChannelHandle::new(
            topic,
            rx,
            Publisher::new(Arc::new(sink)),
            stop,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CardType, GameState};
    use crate::realtime::{Change, Filter, GameActionPayload, Table, TableBinding};
    use anyhow::Result;
    use chrono::Utc;
    use uuid::Uuid;

    fn action() -> BroadcastMessage {
        BroadcastMessage::GameAction(GameActionPayload {
            action: CardType::Rain,
            player_id: Uuid::new_v4(),
            target_pig_id: None,
            timestamp: Utc::now(),
        })
    }

    fn state(room_id: Uuid) -> GameState {
        let now = Utc::now();
        GameState {
            room_id,
            current_player_order: 1,
            game_phase: crate::domain::GamePhase::Playing,
            winner_player_id: None,
            deck_remaining: 40,
            started_at: Some(now),
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn routes_changes_by_filter() -> Result<()> {
        let hub = InMemoryRealtime::new();
        let room = Uuid::new_v4();
        let spec = ChannelSpec::new("game:a").bind(TableBinding::filtered(
            Table::GameStates,
            Filter::eq("room_id", room),
        ));
        let mut handle = hub.open(spec).await?;
        assert_eq!(
            handle.events.recv().await?,
            RealtimeEvent::Status(ChannelStatus::Subscribed)
        );

        let other = state(Uuid::new_v4());
        hub.emit(
            &TableChange::GameStates(Change::Update(other.clone())),
            &serde_json::to_value(&other)?,
        );
        let mine = state(room);
        hub.emit(
            &TableChange::GameStates(Change::Update(mine.clone())),
            &serde_json::to_value(&mine)?,
        );

        let event = handle.events.recv().await?;
        assert_eq!(
            event,
            RealtimeEvent::Table(TableChange::GameStates(Change::Update(mine)))
        );
        Ok(())
    }

    #[tokio::test]
    async fn broadcasts_skip_sender_unless_echo_requested() -> Result<()> {
        let hub = InMemoryRealtime::new();
        let mut sender = hub.open(ChannelSpec::new("game:b")).await?;
        let mut peer = hub.open(ChannelSpec::new("game:b")).await?;
        sender.events.recv().await?;
        peer.events.recv().await?;

        sender.publisher.send(action()).await?;
        assert!(matches!(
            peer.events.recv().await?,
            RealtimeEvent::Broadcast(BroadcastMessage::GameAction(_))
        ));
        assert!(sender.events.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn closing_handle_reports_closed_and_unsubscribes() -> Result<()> {
        let hub = InMemoryRealtime::new();
        let handle = hub.open(ChannelSpec::new("room:c")).await?;
        let (mut events, _publisher, stop) = handle.into_parts();
        events.recv().await?;
        assert_eq!(hub.subscriber_count("room:c"), 1);

        stop.cancel();
        assert_eq!(
            events.recv().await?,
            RealtimeEvent::Status(ChannelStatus::Closed)
        );
        tokio::task::yield_now().await;
        assert_eq!(hub.subscriber_count("room:c"), 0);
        Ok(())
    }

    #[tokio::test]
    async fn refused_open_is_a_connection_error() {
        let hub = InMemoryRealtime::new();
        hub.refuse_next_open("offline");
        let result = hub.open(ChannelSpec::new("room:d")).await;
        assert!(matches!(result, Err(RealtimeError::Connection(_))));
    }
}
