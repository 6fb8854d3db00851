//! Seams to the hosted relational store and its stored procedures.

use async_trait::async_trait;
use serde::Serialize;

use crate::domain::{
    CardType, GameDeck, GameState, PigPatch, PlayerHand, PlayerId, PlayerPig, Room, RoomId,
    RoomPlayer, RowId, TurnOrder,
};

pub mod error;
pub mod in_memory;
pub mod supabase;

pub use error::BackendError;
pub use in_memory::InMemoryBackend;
pub use supabase::SupabaseBackend;

pub const DEFAULT_MAX_PLAYERS: i32 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewRoom {
    pub name: String,
    pub max_players: i32,
    pub creator_id: PlayerId,
    pub is_expansion: bool,
}

impl NewRoom {
    pub fn new(name: impl Into<String>, creator_id: PlayerId) -> Self {
        Self {
            name: name.into(),
            max_players: DEFAULT_MAX_PLAYERS,
            creator_id,
            is_expansion: false,
        }
    }
}

/// Remote operations that can be made to fail once, for rollback tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    ListRooms,
    CreateRoom,
    InsertMember,
    DeleteMember,
    SetReady,
    AssignTurnOrder,
    StartGame,
    InitializeGame,
    FetchGameState,
    UpdatePig,
    UpdateHand,
    DeleteHand,
    DrawCard,
    TurnCheck,
    SetTurn,
    FinishGame,
    CheckWinner,
}

#[async_trait]
pub trait RoomBackend: Send + Sync {
    /// Newest first.
    async fn list_rooms(&self) -> Result<Vec<Room>, BackendError>;

    async fn fetch_room(&self, room_id: RoomId) -> Result<Room, BackendError>;

    async fn create_room(&self, room: NewRoom) -> Result<Room, BackendError>;

    /// Members ordered by turn order, with their profile joined in.
    async fn list_members(&self, room_id: RoomId) -> Result<Vec<RoomPlayer>, BackendError>;

    async fn insert_member(
        &self,
        room_id: RoomId,
        player_id: PlayerId,
        player_order: TurnOrder,
    ) -> Result<RoomPlayer, BackendError>;

    async fn delete_member(&self, room_id: RoomId, player_id: PlayerId) -> Result<(), BackendError>;

    async fn set_ready(&self, member_id: RowId, ready: bool) -> Result<(), BackendError>;

    /// Lowest turn order not yet taken in the room, decided server-side.
    async fn assign_next_turn_order(&self, room_id: RoomId) -> Result<TurnOrder, BackendError>;

    async fn start_game(&self, room_id: RoomId) -> Result<(), BackendError>;
}

#[async_trait]
pub trait GameBackend: Send + Sync {
    async fn fetch_game_state(&self, room_id: RoomId) -> Result<Option<GameState>, BackendError>;

    async fn fetch_pigs(&self, room_id: RoomId) -> Result<Vec<PlayerPig>, BackendError>;

    /// Only rows owned by `player_id` are ever returned.
    async fn fetch_hand(
        &self,
        room_id: RoomId,
        player_id: PlayerId,
    ) -> Result<Vec<PlayerHand>, BackendError>;

    async fn fetch_deck(&self, room_id: RoomId) -> Result<Vec<GameDeck>, BackendError>;

    async fn update_pig(&self, patch: &PigPatch) -> Result<(), BackendError>;

    async fn set_card_count(&self, hand_id: RowId, count: i32) -> Result<(), BackendError>;

    async fn delete_hand_row(&self, hand_id: RowId) -> Result<(), BackendError>;

    /// Removes every hand row of `player_id` in the room.
    async fn clear_hand(&self, room_id: RoomId, player_id: PlayerId) -> Result<(), BackendError>;

    async fn set_current_turn(&self, room_id: RoomId, order: TurnOrder)
        -> Result<(), BackendError>;

    async fn finish_game(&self, room_id: RoomId, winner: PlayerId) -> Result<(), BackendError>;

    async fn initialize_game(&self, room_id: RoomId) -> Result<(), BackendError>;

    /// Draws one card into the player's hand. `None` when the deck is empty.
    async fn draw_card(
        &self,
        room_id: RoomId,
        player_id: PlayerId,
    ) -> Result<Option<CardType>, BackendError>;

    async fn is_player_turn(&self, room_id: RoomId, player_id: PlayerId)
        -> Result<bool, BackendError>;

    async fn check_winner(&self, room_id: RoomId, player_id: PlayerId)
        -> Result<bool, BackendError>;
}

/// Both halves of the remote store.
pub trait Backend: RoomBackend + GameBackend {}

impl<T: RoomBackend + GameBackend + ?Sized> Backend for T {}
