use thiserror::Error;

use crate::backend::BackendError;
use crate::domain::{CardType, EffectError, RoomId, RowId};
use crate::realtime::RealtimeError;

#[derive(Debug, Clone, Error)]
pub enum GameError {
    #[error("not signed in")]
    NotAuthenticated,
    #[error("no game loaded")]
    NoGame,
    #[error("game state not found for room {0}")]
    GameNotFound(RoomId),
    #[error("game is already finished")]
    GameFinished,
    #[error("it is not your turn")]
    NotYourTurn,
    #[error("a turn action is already in progress")]
    TurnInProgress,
    #[error("another card is still being played")]
    ActionInFlight,
    #[error("no {0} card in hand")]
    CardNotInHand(CardType),
    #[error("no valid target for {0}")]
    NoValidTarget(CardType),
    #[error("pig {pig_id} is not a valid target for {card}")]
    InvalidTarget { card: CardType, pig_id: RowId },
    #[error("hand cannot be discarded")]
    CannotDiscardAll,
    #[error("no target selection is pending")]
    NoPendingSelection,
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Realtime(#[from] RealtimeError),
}

impl From<EffectError> for GameError {
    fn from(err: EffectError) -> Self {
        match err {
            EffectError::MissingTarget { card } | EffectError::NothingAffected { card } => {
                Self::NoValidTarget(card)
            }
            EffectError::IllegalTarget { card, pig_id } => Self::InvalidTarget { card, pig_id },
        }
    }
}

impl GameError {
    /// Rejected before anything was mutated.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::NotYourTurn
                | Self::TurnInProgress
                | Self::ActionInFlight
                | Self::CardNotInHand(_)
                | Self::NoValidTarget(_)
                | Self::InvalidTarget { .. }
                | Self::CannotDiscardAll
                | Self::GameFinished
        )
    }
}
