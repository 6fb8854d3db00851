//! Cached game state and the predicates derived from it.

use crate::domain::cards::HAND_SIZE;
use crate::domain::rules::{self, WinCondition};
use crate::domain::targeting::has_valid_target;
use crate::domain::{
    CardType, GameDeck, GameState, PlayerHand, PlayerId, PlayerPig, RoomId, RoomPlayer,
    TurnOrder,
};
use crate::realtime::GameFinishedPayload;

#[derive(Debug, Clone, Default)]
pub struct GameSnapshot {
    pub room_id: Option<RoomId>,
    pub game_state: Option<GameState>,
    pub pigs: Vec<PlayerPig>,
    /// Own hand only.
    pub hand: Vec<PlayerHand>,
    pub deck: Vec<GameDeck>,
    /// Ordered by turn order.
    pub members: Vec<RoomPlayer>,
    pub turn_in_progress: bool,
    pub card_in_flight: bool,
    pub loading: bool,
    pub error: Option<String>,
    pub last_action: Option<String>,
    pub finished: Option<GameFinishedPayload>,
    pub connected: bool,
    pub connection_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WinnerInfo {
    pub player_id: PlayerId,
    pub name: Option<String>,
    pub win_condition: Option<WinCondition>,
}

impl GameSnapshot {
    pub fn my_player_order(&self, me: PlayerId) -> Option<TurnOrder> {
        self.members
            .iter()
            .find(|member| member.player_id == me)
            .map(|member| member.player_order)
    }

    pub fn is_game_finished(&self) -> bool {
        self.game_state
            .as_ref()
            .is_some_and(|state| state.game_phase.is_terminal())
    }

    pub fn is_my_turn(&self, me: PlayerId) -> bool {
        match (&self.game_state, self.my_player_order(me)) {
            (Some(state), Some(order)) => {
                state.game_phase.is_active() && state.current_player_order == order
            }
            _ => false,
        }
    }

    pub fn current_player(&self) -> Option<&RoomPlayer> {
        let order = self.game_state.as_ref()?.current_player_order;
        self.members.iter().find(|m| m.player_order == order)
    }

    pub fn my_pigs(&self, me: PlayerId) -> Vec<&PlayerPig> {
        let mut pigs: Vec<&PlayerPig> = self.pigs.iter().filter(|p| p.player_id == me).collect();
        pigs.sort_by_key(|pig| pig.pig_index);
        pigs
    }

    pub fn other_pigs(&self, me: PlayerId) -> Vec<&PlayerPig> {
        self.pigs.iter().filter(|p| p.player_id != me).collect()
    }

    /// Held cards with a positive count.
    pub fn my_hand(&self) -> Vec<&PlayerHand> {
        self.hand.iter().filter(|h| h.card_count > 0).collect()
    }

    pub fn hand_count(&self, card: CardType) -> i32 {
        self.hand
            .iter()
            .filter(|h| h.card_type == card)
            .map(|h| h.card_count)
            .sum()
    }

    pub fn cards_in_hand(&self) -> i32 {
        self.hand.iter().map(|h| h.card_count.max(0)).sum()
    }

    pub fn deck_count(&self) -> i32 {
        self.deck.iter().map(|d| d.remaining_count.max(0)).sum()
    }

    pub fn can_play_card(&self, card: CardType, me: PlayerId) -> bool {
        self.is_my_turn(me)
            && !self.turn_in_progress
            && !self.card_in_flight
            && self.hand_count(card) >= 1
            && has_valid_target(card, &self.pigs, me)
    }

    /// A full hand with nothing playable may be swapped for a fresh one.
    pub fn can_discard_all_cards(&self, me: PlayerId) -> bool {
        self.is_my_turn(me)
            && !self.turn_in_progress
            && !self.card_in_flight
            && self.cards_in_hand() == HAND_SIZE
            && self
                .my_hand()
                .iter()
                .all(|h| !has_valid_target(h.card_type, &self.pigs, me))
    }

    pub fn win_condition(&self, me: PlayerId) -> Option<WinCondition> {
        rules::win_condition(self.pigs.iter().filter(|p| p.player_id == me))
    }

    pub fn is_winner(&self, me: PlayerId) -> bool {
        self.game_state
            .as_ref()
            .and_then(|state| state.winner_player_id)
            .is_some_and(|winner| winner == me)
    }

    pub fn winner_info(&self) -> Option<WinnerInfo> {
        let winner = self.game_state.as_ref()?.winner_player_id?;
        let announced = self
            .finished
            .as_ref()
            .filter(|payload| payload.winner_player_id == winner);
        let name = self
            .members
            .iter()
            .find(|m| m.player_id == winner)
            .and_then(|m| m.display_name().map(str::to_owned))
            .or_else(|| announced.map(|p| p.winner_name.clone()));
        let win_condition = announced
            .map(|p| p.win_condition)
            .or_else(|| rules::win_condition(self.pigs.iter().filter(|p| p.player_id == winner)));
        Some(WinnerInfo {
            player_id: winner,
            name,
            win_condition,
        })
    }

    pub fn member_name(&self, player_id: PlayerId) -> String {
        self.members
            .iter()
            .find(|m| m.player_id == player_id)
            .and_then(|m| m.display_name())
            .map(str::to_owned)
            .unwrap_or_else(|| "someone".to_owned())
    }

    /// Whether a row belongs to the loaded room.
    pub(crate) fn in_room(&self, room_id: RoomId) -> bool {
        self.room_id == Some(room_id)
    }
}
