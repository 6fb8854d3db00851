//! Card effects as field-level pig patches.
//!
//! A resolved effect is a list of [`PigPatch`] values. The game store applies
//! them to its cached pigs first, persists them, and reverts them when the
//! write fails. Peers replay the same resolution when a `game_action`
//! broadcast arrives.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::targeting::{bulk_targets, pig_qualifies, target_scope, TargetScope};
use super::types::{CardType, PigState, PlayerId, PlayerPig, RowId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EffectError {
    #[error("card {card} needs a target pig")]
    MissingTarget { card: CardType },
    #[error("pig {pig_id} is not a legal target for {card}")]
    IllegalTarget { card: CardType, pig_id: RowId },
    #[error("no pig is affected by {card}")]
    NothingAffected { card: CardType },
}

/// Field updates for one pig row. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PigPatch {
    #[serde(skip)]
    pub pig_id: RowId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pig_state: Option<PigState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_barn: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub barn_locked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_lightning_rod: Option<bool>,
}

impl PigPatch {
    pub fn new(pig_id: RowId) -> Self {
        Self {
            pig_id,
            ..Self::default()
        }
    }

    pub fn state(mut self, state: PigState) -> Self {
        self.pig_state = Some(state);
        self
    }

    pub fn barn(mut self, value: bool) -> Self {
        self.has_barn = Some(value);
        self
    }

    pub fn lock(mut self, value: bool) -> Self {
        self.barn_locked = Some(value);
        self
    }

    pub fn rod(mut self, value: bool) -> Self {
        self.has_lightning_rod = Some(value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pig_state.is_none()
            && self.has_barn.is_none()
            && self.barn_locked.is_none()
            && self.has_lightning_rod.is_none()
    }

    pub fn apply(&self, pig: &mut PlayerPig) {
        if let Some(state) = self.pig_state {
            pig.pig_state = state;
        }
        if let Some(barn) = self.has_barn {
            pig.has_barn = barn;
        }
        if let Some(lock) = self.barn_locked {
            pig.barn_locked = lock;
        }
        if let Some(rod) = self.has_lightning_rod {
            pig.has_lightning_rod = rod;
        }
    }

    /// Column/value body for a row update.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Applies every patch to the matching pig in `pigs`. Patches for unknown
/// pigs are skipped; the number of pigs touched is returned.
pub fn apply_patches(pigs: &mut [PlayerPig], patches: &[PigPatch]) -> usize {
    let mut touched = 0;
    for patch in patches {
        if let Some(pig) = pigs.iter_mut().find(|pig| pig.id == patch.pig_id) {
            patch.apply(pig);
            touched += 1;
        }
    }
    touched
}

fn single_patch(card: CardType, pig: &PlayerPig) -> PigPatch {
    let patch = PigPatch::new(pig.id);
    match card {
        CardType::Mud => patch.state(PigState::Dirty),
        CardType::Bath | CardType::Escape | CardType::Rain => patch.state(PigState::Clean),
        CardType::Barn => patch.barn(true).lock(false).rod(false),
        CardType::Lightning => patch.barn(false).lock(false),
        CardType::LightningRod => patch.rod(true),
        CardType::BarnLock => patch.lock(true),
        CardType::BeautifulPig => patch.state(PigState::Beautiful),
        CardType::LuckyBird => patch,
    }
}

/// Resolves the effect of `actor` playing `card` against `target`.
///
/// Targeted cards check the target against the card's rule, ownership
/// included. Rain ignores `target` and patches every dirty unsheltered pig.
pub fn resolve(
    card: CardType,
    target: Option<&PlayerPig>,
    pigs: &[PlayerPig],
    actor: PlayerId,
) -> Result<Vec<PigPatch>, EffectError> {
    match target_scope(card) {
        TargetScope::Untargeted => Ok(Vec::new()),
        TargetScope::Bulk => {
            let patches: Vec<PigPatch> = bulk_targets(card, pigs)
                .into_iter()
                .map(|pig| single_patch(card, pig))
                .collect();
            if patches.is_empty() {
                return Err(EffectError::NothingAffected { card });
            }
            Ok(patches)
        }
        scope => {
            let pig = target.ok_or(EffectError::MissingTarget { card })?;
            let owned = pig.player_id == actor;
            let owner_ok = match scope {
                TargetScope::Own => owned,
                _ => !owned,
            };
            if !owner_ok || !pig_qualifies(card, pig) {
                return Err(EffectError::IllegalTarget {
                    card,
                    pig_id: pig.id,
                });
            }
            Ok(vec![single_patch(card, pig)])
        }
    }
}

/// Best-effort replay of a peer's action on the local cache. Ownership and
/// eligibility are not re-checked: the peer already passed the server's turn
/// check, and the change feed corrects any divergence.
pub fn predict(card: CardType, target_pig_id: Option<RowId>, pigs: &[PlayerPig]) -> Vec<PigPatch> {
    match target_scope(card) {
        TargetScope::Untargeted => Vec::new(),
        TargetScope::Bulk => bulk_targets(card, pigs)
            .into_iter()
            .map(|pig| single_patch(card, pig))
            .collect(),
        TargetScope::Own | TargetScope::Opposing => target_pig_id
            .and_then(|id| pigs.iter().find(|pig| pig.id == id))
            .map(|pig| vec![single_patch(card, pig)])
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn pig(owner: PlayerId, state: PigState, barn: bool, lock: bool, rod: bool) -> PlayerPig {
        let now = Utc::now();
        PlayerPig {
            id: Uuid::new_v4(),
            room_id: Uuid::nil(),
            player_id: owner,
            pig_index: 0,
            pig_state: state,
            has_barn: barn,
            barn_locked: lock,
            has_lightning_rod: rod,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn mud_dirties_clean_pig() {
        let me = Uuid::new_v4();
        let mut pigs = vec![pig(me, PigState::Clean, false, false, false)];
        let patches = resolve(CardType::Mud, Some(&pigs[0]), &pigs, me).unwrap();
        assert_eq!(apply_patches(&mut pigs, &patches), 1);
        assert_eq!(pigs[0].pig_state, PigState::Dirty);
    }

    #[test]
    fn mud_without_eligible_pig_is_rejected_and_leaves_state() {
        let me = Uuid::new_v4();
        let pigs = vec![
            pig(me, PigState::Dirty, false, false, false),
            pig(me, PigState::Clean, true, false, false),
        ];
        let before = pigs.clone();
        for target in &pigs {
            let err = resolve(CardType::Mud, Some(target), &pigs, me).unwrap_err();
            assert!(matches!(err, EffectError::IllegalTarget { .. }));
        }
        assert_eq!(pigs, before);
    }

    #[test]
    fn lightning_clears_barn_and_lock() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        for locked in [true, false] {
            let mut pigs = vec![pig(other, PigState::Dirty, true, locked, false)];
            let patches = resolve(CardType::Lightning, Some(&pigs[0]), &pigs, me).unwrap();
            apply_patches(&mut pigs, &patches);
            assert!(!pigs[0].has_barn);
            assert!(!pigs[0].barn_locked);
            assert_eq!(pigs[0].pig_state, PigState::Dirty);
        }
    }

    #[test]
    fn rain_cleans_every_exposed_dirty_pig() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut pigs = vec![
            pig(me, PigState::Dirty, false, false, false),
            pig(other, PigState::Dirty, false, false, false),
            pig(other, PigState::Dirty, true, false, false),
            pig(other, PigState::Clean, false, false, false),
        ];
        let patches = resolve(CardType::Rain, None, &pigs, me).unwrap();
        assert_eq!(patches.len(), 2);
        apply_patches(&mut pigs, &patches);
        let states: Vec<PigState> = pigs.iter().map(|p| p.pig_state).collect();
        assert_eq!(
            states,
            vec![
                PigState::Clean,
                PigState::Clean,
                PigState::Dirty,
                PigState::Clean
            ]
        );
    }

    #[test]
    fn escape_returns_beautiful_pig_to_clean() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut pigs = vec![pig(other, PigState::Beautiful, false, false, false)];
        let patches = resolve(CardType::Escape, Some(&pigs[0]), &pigs, me).unwrap();
        apply_patches(&mut pigs, &patches);
        assert!(pigs[0].is_clean());
    }

    #[test]
    fn own_cards_refuse_opponent_pigs() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let pigs = vec![pig(other, PigState::Clean, false, false, false)];
        assert!(resolve(CardType::Barn, Some(&pigs[0]), &pigs, me).is_err());
        assert_eq!(
            resolve(CardType::Barn, None, &pigs, me),
            Err(EffectError::MissingTarget {
                card: CardType::Barn
            })
        );
    }

    #[test]
    fn patch_body_only_names_changed_columns() {
        let patch = PigPatch::new(Uuid::new_v4()).barn(false).lock(false);
        assert_eq!(
            patch.to_json(),
            serde_json::json!({ "has_barn": false, "barn_locked": false })
        );
    }

    #[test]
    fn prediction_skips_unknown_pig() {
        let other = Uuid::new_v4();
        let pigs = vec![pig(other, PigState::Clean, false, false, false)];
        assert!(predict(CardType::Mud, Some(Uuid::new_v4()), &pigs).is_empty());
        assert_eq!(predict(CardType::Mud, Some(pigs[0].id), &pigs).len(), 1);
    }

    #[test]
    fn new_barn_drops_stale_lock_and_rod() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut pigs = vec![
            pig(me, PigState::Dirty, false, true, true),
            pig(other, PigState::Clean, false, false, false),
        ];
        let patches = resolve(CardType::Barn, Some(&pigs[0]), &pigs, me).unwrap();
        apply_patches(&mut pigs, &patches);
        assert!(pigs[0].has_barn);
        assert!(!pigs[0].barn_locked);
        assert!(!pigs[0].has_lightning_rod);

        let targets = |card| crate::domain::targeting::valid_targets(card, &pigs, other).len();
        assert_eq!(targets(CardType::Lightning), 1);
        assert_eq!(targets(CardType::Bath), 1);
    }
}
