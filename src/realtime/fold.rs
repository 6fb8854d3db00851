//! Folding change-feed deltas into cached row collections.
//!
//! Push deliveries and poll-synthesised changes both go through [`fold`], so
//! a collection only ever changes one way regardless of where the delta came
//! from.

use super::events::{Change, Row};

/// Applies one delta to `rows`, keyed by row identity.
///
/// Inserts append only when the key is absent, updates upsert, deletes remove.
/// Returns whether the collection changed.
pub fn fold<T: Row + PartialEq>(rows: &mut Vec<T>, change: &Change<T>) -> bool {
    match change {
        Change::Insert(row) => {
            if rows.iter().any(|existing| existing.key() == row.key()) {
                return false;
            }
            rows.push(row.clone());
            true
        }
        Change::Update(row) => upsert(rows, row.clone()),
        Change::Delete(key) => {
            let before = rows.len();
            rows.retain(|existing| existing.key() != *key);
            rows.len() != before
        }
    }
}

/// Replaces the row with the same key or appends it.
pub fn upsert<T: Row + PartialEq>(rows: &mut Vec<T>, row: T) -> bool {
    match rows.iter_mut().find(|existing| existing.key() == row.key()) {
        Some(existing) if *existing == row => false,
        Some(existing) => {
            *existing = row;
            true
        }
        None => {
            rows.push(row);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PigState, PlayerPig};
    use chrono::Utc;
    use uuid::Uuid;

    fn pig(state: PigState) -> PlayerPig {
        let now = Utc::now();
        PlayerPig {
            id: Uuid::new_v4(),
            room_id: Uuid::new_v4(),
            player_id: Uuid::new_v4(),
            pig_index: 0,
            pig_state: state,
            has_barn: false,
            barn_locked: false,
            has_lightning_rod: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn duplicate_deliveries_are_idempotent() {
        let clean = pig(PigState::Clean);
        let mut dirty = clean.clone();
        dirty.pig_state = PigState::Dirty;

        let mut once = Vec::new();
        fold(&mut once, &Change::Insert(clean.clone()));
        fold(&mut once, &Change::Update(dirty.clone()));

        let mut twice = Vec::new();
        for change in [
            Change::Insert(clean.clone()),
            Change::Insert(clean),
            Change::Update(dirty.clone()),
            Change::Update(dirty),
        ] {
            fold(&mut twice, &change);
        }
        assert_eq!(once, twice);
        assert_eq!(once.len(), 1);
    }

    #[test]
    fn insert_keeps_the_cached_row() {
        let cached = pig(PigState::Dirty);
        let mut stale = cached.clone();
        stale.pig_state = PigState::Clean;

        let mut rows = vec![cached.clone()];
        assert!(!fold(&mut rows, &Change::Insert(stale)));
        assert_eq!(rows, vec![cached]);
    }

    #[test]
    fn update_of_unknown_row_inserts_and_delete_removes() {
        let row = pig(PigState::Beautiful);
        let mut rows = Vec::new();
        assert!(fold(&mut rows, &Change::Update(row.clone())));
        assert!(fold(&mut rows, &Change::<PlayerPig>::Delete(row.id)));
        assert!(rows.is_empty());
        assert!(!fold(&mut rows, &Change::<PlayerPig>::Delete(row.id)));
    }
}
