use std::sync::Arc;

use parking_lot::RwLock;

use super::state::GameSnapshot;
use super::GameError;

/// Holds the per-client card-in-flight flag; dropping it clears the flag.
#[must_use]
pub(crate) struct InFlight {
    state: Arc<RwLock<GameSnapshot>>,
}

impl InFlight {
    pub(crate) fn acquire(state: &Arc<RwLock<GameSnapshot>>) -> Result<Self, GameError> {
        let mut guard = state.write();
        if guard.card_in_flight {
            return Err(GameError::ActionInFlight);
        }
        guard.card_in_flight = true;
        Ok(Self {
            state: Arc::clone(state),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.state.write().card_in_flight = false;
    }
}
