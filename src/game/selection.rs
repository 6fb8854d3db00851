//! Interactive target picking on top of [`GameStore::play_card`].

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::domain::targeting::{target_scope, TargetScope};
use crate::domain::{CardType, PlayerPig, RowId};

use super::{GameError, GameStore};

const LOG_TARGET: &str = "game::selection";

/// Outcome of starting a card play.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// The card was played straight away.
    Played,
    /// Several pigs qualify; the selector is open with these candidates.
    AwaitingTarget(Vec<PlayerPig>),
}

#[derive(Debug, Default)]
struct Selector {
    visible: bool,
    pending: Option<CardType>,
    candidates: Vec<PlayerPig>,
}

#[derive(Clone)]
pub struct TargetSelector {
    store: GameStore,
    selector: Arc<Mutex<Selector>>,
}

impl TargetSelector {
    pub fn new(store: GameStore) -> Self {
        Self {
            store,
            selector: Arc::new(Mutex::new(Selector::default())),
        }
    }

    pub fn is_visible(&self) -> bool {
        self.selector.lock().visible
    }

    pub fn pending(&self) -> Option<CardType> {
        self.selector.lock().pending
    }

    pub fn candidates(&self) -> Vec<PlayerPig> {
        self.selector.lock().candidates.clone()
    }

    /// Plays `card` right away unless the player has to pick among several
    /// targets, in which case the turn is held and the selector opens.
    pub async fn initiate(&self, card: CardType) -> Result<Selection, GameError> {
        self.store.check_playable(card)?;
        let scope = target_scope(card);
        let candidates = self.store.valid_targets(card);
        if matches!(scope, TargetScope::Own | TargetScope::Opposing) && candidates.len() > 1 {
            self.store.claim_turn();
            let mut selector = self.selector.lock();
            selector.visible = true;
            selector.pending = Some(card);
            selector.candidates = candidates.clone();
            debug!(target = LOG_TARGET, %card, candidates = candidates.len(), "awaiting target");
            return Ok(Selection::AwaitingTarget(candidates));
        }
        let target = candidates.first().map(|pig| pig.id);
        self.store.play_card(card, target).await?;
        Ok(Selection::Played)
    }

    /// Plays the pending card on `pig_id`. The selector closes before the
    /// play starts, so a second pick finds nothing pending.
    pub async fn select(&self, pig_id: RowId) -> Result<(), GameError> {
        let card = {
            let mut selector = self.selector.lock();
            let card = selector.pending.ok_or(GameError::NoPendingSelection)?;
            if !selector.candidates.iter().any(|pig| pig.id == pig_id) {
                return Err(GameError::InvalidTarget { card, pig_id });
            }
            *selector = Selector::default();
            card
        };
        debug!(target = LOG_TARGET, %card, pig_id = %pig_id, "target selected");
        self.store.play_claimed(card, Some(pig_id)).await
    }

    pub fn cancel(&self) {
        let had_pending = {
            let mut selector = self.selector.lock();
            let had_pending = selector.pending.is_some();
            *selector = Selector::default();
            had_pending
        };
        if had_pending {
            self.store.release_turn();
            debug!(target = LOG_TARGET, "target selection cancelled");
        }
    }
}
