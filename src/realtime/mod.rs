//! Row-level change feeds and ephemeral broadcasts for rooms.
//!
//! A [`RealtimeHub`] opens one channel per [`ChannelSpec`]. The returned
//! [`ChannelHandle`] yields [`RealtimeEvent`]s, carries a publisher for
//! outgoing broadcasts, and stops the channel when closed or dropped.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::{CancellationToken, DropGuard};

pub mod events;
pub mod fold;
pub mod in_memory;
pub mod supabase;

pub use events::{
    BroadcastMessage, Change, ChangeKind, ChannelSpec, ChannelStatus, Filter,
    GameActionPayload, GameFinishedPayload, RealtimeEvent, Row, Table, TableBinding, TableChange,
};
pub use fold::{fold, upsert};
pub use in_memory::InMemoryRealtime;
pub use supabase::SupabaseRealtime;

#[derive(Debug, Clone, Error)]
pub enum RealtimeError {
    #[error("realtime connection error: {0}")]
    Connection(String),
    #[error("failed to decode realtime message: {0}")]
    Decode(String),
    #[error("failed to encode realtime message: {0}")]
    Encode(String),
    #[error("channel {0} is closed")]
    Closed(String),
}

impl RealtimeError {
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }
}

/// Outgoing side of a channel.
#[async_trait]
pub trait BroadcastSink: Send + Sync {
    async fn publish(&self, message: BroadcastMessage) -> Result<(), RealtimeError>;
}

#[derive(Clone)]
pub struct Publisher {
    sink: Arc<dyn BroadcastSink>,
}

impl Publisher {
    pub fn new(sink: Arc<dyn BroadcastSink>) -> Self {
        Self { sink }
    }

    pub async fn send(&self, message: BroadcastMessage) -> Result<(), RealtimeError> {
        self.sink.publish(message).await
    }
}

/// An open channel. Dropping the handle stops it.
pub struct ChannelHandle {
    pub topic: String,
    pub events: broadcast::Receiver<RealtimeEvent>,
    pub publisher: Publisher,
    stop: CancellationToken,
    _guard: DropGuard,
}

impl ChannelHandle {
    pub fn new(
        topic: String,
        events: broadcast::Receiver<RealtimeEvent>,
        publisher: Publisher,
        stop: CancellationToken,
    ) -> Self {
        let guard = stop.clone().drop_guard();
        Self {
            topic,
            events,
            publisher,
            stop,
            _guard: guard,
        }
    }

    pub fn close(&self) {
        self.stop.cancel();
    }

    /// Splits the handle so the receiver can move into a task. The channel
    /// then stays open until the returned token is cancelled.
    pub fn into_parts(
        self,
    ) -> (
        broadcast::Receiver<RealtimeEvent>,
        Publisher,
        CancellationToken,
    ) {
        let Self {
            events,
            publisher,
            stop,
            _guard: guard,
            ..
        } = self;
        guard.disarm();
        (events, publisher, stop)
    }
}

#[async_trait]
pub trait RealtimeHub: Send + Sync {
    async fn open(&self, spec: ChannelSpec) -> Result<ChannelHandle, RealtimeError>;
}
