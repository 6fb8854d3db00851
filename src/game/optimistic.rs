use crate::realtime::Row;

/// A local mutation of cached rows together with the rows it replaced.
///
/// `rollback` puts back exactly the captured rows at their old positions and
/// drops rows the mutation added. Rows the mutation did not touch are left
/// alone, so deltas folded in meanwhile for other rows survive.
#[must_use = "an optimistic change must be committed or rolled back"]
pub(crate) struct Optimistic<T: Row> {
    keys: Vec<T::Key>,
    before: Vec<(usize, T)>,
}

impl<T: Row> Optimistic<T> {
    /// Captures the rows with `keys`, then runs `mutate` on the collection.
    pub(crate) fn apply<F>(rows: &mut Vec<T>, keys: Vec<T::Key>, mutate: F) -> Self
    where
        F: FnOnce(&mut Vec<T>),
    {
        let before = rows
            .iter()
            .enumerate()
            .filter(|(_, row)| keys.contains(&row.key()))
            .map(|(pos, row)| (pos, row.clone()))
            .collect();
        mutate(rows);
        Self { keys, before }
    }

    pub(crate) fn rollback(self, rows: &mut Vec<T>) {
        rows.retain(|row| !self.keys.contains(&row.key()));
        for (pos, row) in self.before {
            let at = pos.min(rows.len());
            rows.insert(at, row);
        }
    }

    pub(crate) fn commit(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CardType, PlayerHand};
    use chrono::Utc;
    use uuid::Uuid;

    fn hand(card: CardType, count: i32) -> PlayerHand {
        let now = Utc::now();
        PlayerHand {
            id: Uuid::new_v4(),
            room_id: Uuid::nil(),
            player_id: Uuid::nil(),
            card_type: card,
            card_count: count,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn rollback_restores_removed_row_in_place() {
        let mut rows = vec![
            hand(CardType::Mud, 1),
            hand(CardType::Bath, 1),
            hand(CardType::Rain, 2),
        ];
        let before = rows.clone();
        let target = rows[1].id;
        let change = Optimistic::apply(&mut rows, vec![target], |rows| {
            rows.retain(|r| r.id != target)
        });
        assert_eq!(rows.len(), 2);
        change.rollback(&mut rows);
        assert_eq!(rows, before);
    }

    #[test]
    fn rollback_undoes_updates_only_for_captured_rows() {
        let mut rows = vec![hand(CardType::Mud, 2), hand(CardType::Rain, 1)];
        let mud = rows[0].id;
        let change = Optimistic::apply(&mut rows, vec![mud], |rows| rows[0].card_count = 1);
        rows[1].card_count = 5;
        change.rollback(&mut rows);
        assert_eq!(rows[0].card_count, 2);
        assert_eq!(rows[1].card_count, 5);
    }
}
