use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::RoomId;
use crate::tokio_tools::spawn_cancellable;

use super::GameStore;

const LOG_TARGET: &str = "game::poller";

/// Refetches the game row every `period` until `stop` fires.
pub(crate) fn spawn_poller(
    store: GameStore,
    room_id: RoomId,
    period: Duration,
    stop: CancellationToken,
) -> JoinHandle<Option<()>> {
    spawn_cancellable(format!("game-poller-{room_id}"), stop, async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(target = LOG_TARGET, room_id = %room_id, ?period, "poller started");
        loop {
            ticker.tick().await;
            store.poll_once(room_id).await;
        }
    })
}
