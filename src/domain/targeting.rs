//! Target eligibility for each card.
//!
//! Every rule reads only the cached pig rows and the local player's identity,
//! so the same functions back the legality predicate, the auto-target path and
//! the target selector.

use super::types::{CardType, PlayerId, PlayerPig};

/// Which pigs a card may be aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetScope {
    /// One pig owned by the acting player.
    Own,
    /// One pig owned by somebody else.
    Opposing,
    /// Every qualifying pig at once; no target is chosen.
    Bulk,
    /// The card touches no pig.
    Untargeted,
}

pub fn target_scope(card: CardType) -> TargetScope {
    match card {
        CardType::Mud
        | CardType::Barn
        | CardType::LightningRod
        | CardType::BarnLock
        | CardType::BeautifulPig => TargetScope::Own,
        CardType::Bath | CardType::Lightning | CardType::Escape => TargetScope::Opposing,
        CardType::Rain => TargetScope::Bulk,
        CardType::LuckyBird => TargetScope::Untargeted,
    }
}

/// Pig-level condition for `card`, ignoring ownership.
pub fn pig_qualifies(card: CardType, pig: &PlayerPig) -> bool {
    match card {
        CardType::Mud => pig.is_clean() && !pig.has_barn,
        CardType::Barn => !pig.has_barn,
        CardType::Bath => pig.is_dirty() && !pig.effective_lock(),
        CardType::Rain => pig.is_dirty() && !pig.has_barn,
        CardType::Lightning => pig.has_barn && !pig.effective_rod(),
        CardType::LightningRod => pig.has_barn && !pig.effective_rod(),
        CardType::BarnLock => pig.has_barn && pig.is_dirty() && !pig.effective_lock(),
        CardType::BeautifulPig => !pig.is_beautiful(),
        CardType::Escape => pig.is_beautiful(),
        CardType::LuckyBird => false,
    }
}

/// Pigs that `card` may be aimed at by `actor`. Bulk and untargeted cards
/// return an empty list: they bypass target search.
pub fn valid_targets<'a>(
    card: CardType,
    pigs: &'a [PlayerPig],
    actor: PlayerId,
) -> Vec<&'a PlayerPig> {
    let owned_by_actor = match target_scope(card) {
        TargetScope::Own => true,
        TargetScope::Opposing => false,
        TargetScope::Bulk | TargetScope::Untargeted => return Vec::new(),
    };
    pigs.iter()
        .filter(|pig| (pig.player_id == actor) == owned_by_actor)
        .filter(|pig| pig_qualifies(card, pig))
        .collect()
}

/// Pigs a bulk card would touch, regardless of owner.
pub fn bulk_targets<'a>(card: CardType, pigs: &'a [PlayerPig]) -> Vec<&'a PlayerPig> {
    if target_scope(card) != TargetScope::Bulk {
        return Vec::new();
    }
    pigs.iter().filter(|pig| pig_qualifies(card, pig)).collect()
}

/// Whether at least one legal target exists for `card`.
pub fn has_valid_target(card: CardType, pigs: &[PlayerPig], actor: PlayerId) -> bool {
    match target_scope(card) {
        TargetScope::Own | TargetScope::Opposing => !valid_targets(card, pigs, actor).is_empty(),
        TargetScope::Bulk => !bulk_targets(card, pigs).is_empty(),
        TargetScope::Untargeted => true,
    }
}

/// More than one legal target: the player has to pick.
pub fn needs_selection(card: CardType, pigs: &[PlayerPig], actor: PlayerId) -> bool {
    valid_targets(card, pigs, actor).len() > 1
}
