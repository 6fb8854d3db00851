//! Turn rotation and win detection.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::types::{PigState, PlayerPig, TurnOrder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WinCondition {
    Dirty,
    Beautiful,
}

impl WinCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dirty => "dirty",
            Self::Beautiful => "beautiful",
        }
    }
}

/// A player wins once every one of their pigs is dirty, or every one is
/// beautiful. A player without pigs never wins.
pub fn win_condition<'a, I>(own_pigs: I) -> Option<WinCondition>
where
    I: IntoIterator<Item = &'a PlayerPig>,
{
    let mut iter = own_pigs.into_iter();
    let first = iter.next()?.pig_state;
    if iter.any(|pig| pig.pig_state != first) {
        return None;
    }
    match first {
        PigState::Dirty => Some(WinCondition::Dirty),
        PigState::Beautiful => Some(WinCondition::Beautiful),
        PigState::Clean => None,
    }
}

/// Next order in the cyclic sequence of member orders.
///
/// When `current` is not a member order (for example after its owner left)
/// the rotation continues from the smallest order above it.
pub fn next_turn_order<I>(orders: I, current: TurnOrder) -> Option<TurnOrder>
where
    I: IntoIterator<Item = TurnOrder>,
{
    let sorted: BTreeSet<TurnOrder> = orders.into_iter().collect();
    let first = *sorted.iter().next()?;
    Some(
        sorted
            .range((current + 1)..)
            .next()
            .copied()
            .unwrap_or(first),
    )
}

/// Lowest positive order not taken yet.
pub fn lowest_unused_order<I>(used: I) -> TurnOrder
where
    I: IntoIterator<Item = TurnOrder>,
{
    let used: BTreeSet<TurnOrder> = used.into_iter().collect();
    let mut candidate = 1;
    while used.contains(&candidate) {
        candidate += 1;
    }
    candidate
}

/// Orders are unique and form exactly `1..=N`.
pub fn orders_are_contiguous(orders: &[TurnOrder]) -> bool {
    let unique: BTreeSet<TurnOrder> = orders.iter().copied().collect();
    unique.len() == orders.len() && unique.into_iter().eq(1..=orders.len() as TurnOrder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn pigs(states: &[PigState]) -> Vec<PlayerPig> {
        let now = Utc::now();
        let owner = Uuid::new_v4();
        states
            .iter()
            .enumerate()
            .map(|(i, state)| PlayerPig {
                id: Uuid::new_v4(),
                room_id: Uuid::nil(),
                player_id: owner,
                pig_index: i as i32,
                pig_state: *state,
                has_barn: false,
                barn_locked: false,
                has_lightning_rod: false,
                created_at: now,
                updated_at: now,
            })
            .collect()
    }

    #[test]
    fn detects_uniform_pig_states() {
        use PigState::*;
        assert_eq!(
            win_condition(&pigs(&[Dirty, Dirty, Dirty])),
            Some(WinCondition::Dirty)
        );
        assert_eq!(
            win_condition(&pigs(&[Beautiful, Beautiful])),
            Some(WinCondition::Beautiful)
        );
        assert_eq!(win_condition(&pigs(&[Clean, Dirty])), None);
        assert_eq!(win_condition(&pigs(&[Clean, Clean])), None);
        assert_eq!(win_condition(&pigs(&[Dirty, Beautiful])), None);
        assert_eq!(win_condition(&pigs(&[])), None);
    }

    #[test]
    fn rotation_wraps_around() {
        assert_eq!(next_turn_order([1, 2, 3], 3), Some(1));
        assert_eq!(next_turn_order([1, 2, 3], 1), Some(2));
        assert_eq!(next_turn_order([3, 1, 2], 2), Some(3));
        assert_eq!(next_turn_order([1], 1), Some(1));
        assert_eq!(next_turn_order(Vec::new(), 1), None);
    }

    #[test]
    fn rotation_skips_departed_order() {
        assert_eq!(next_turn_order([1, 3], 2), Some(3));
        assert_eq!(next_turn_order([1, 2], 5), Some(1));
    }

    #[test]
    fn lowest_unused_fills_gaps() {
        assert_eq!(lowest_unused_order(Vec::new()), 1);
        assert_eq!(lowest_unused_order([1, 2, 3]), 4);
        assert_eq!(lowest_unused_order([1, 3]), 2);
        assert_eq!(lowest_unused_order([2, 3]), 1);
    }

    #[test]
    fn contiguity() {
        assert!(orders_are_contiguous(&[]));
        assert!(orders_are_contiguous(&[2, 1, 3]));
        assert!(!orders_are_contiguous(&[1, 1, 2]));
        assert!(!orders_are_contiguous(&[1, 3]));
        assert!(!orders_are_contiguous(&[0, 1]));
    }
}
