use thiserror::Error;

use crate::backend::BackendError;
use crate::domain::RoomId;
use crate::realtime::RealtimeError;

#[derive(Debug, Clone, Error)]
pub enum LobbyError {
    #[error("not signed in")]
    NotAuthenticated,
    #[error("room {0} is not accepting players")]
    RoomNotWaiting(RoomId),
    #[error("room {0} is full")]
    RoomFull(RoomId),
    #[error("not in a room")]
    NoCurrentRoom,
    #[error("game cannot be started yet")]
    CannotStart,
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Realtime(#[from] RealtimeError),
}
