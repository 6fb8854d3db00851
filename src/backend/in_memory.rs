use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::cards::{deck_composition, HAND_SIZE};
use crate::domain::rules::{lowest_unused_order, win_condition};
use crate::domain::{
    CardType, GamePhase, GameDeck, GameState, MemberProfile, PigPatch, PigState, PlayerHand,
    PlayerId, PlayerPig, Room, RoomId, RoomPlayer, RoomStatus, RowId, TurnOrder,
};
use crate::realtime::{Change, InMemoryRealtime, Row, TableChange};

use super::{BackendError, FailPoint, GameBackend, NewRoom, RoomBackend};

const LOG_TARGET: &str = "backend::in_memory";

/// Pigs dealt to each player for a given table size.
pub fn pigs_per_player(players: usize) -> i32 {
    match players {
        0..=2 => 5,
        3 => 4,
        _ => 3,
    }
}

struct Inner {
    rooms: Vec<Room>,
    members: Vec<RoomPlayer>,
    profiles: HashMap<PlayerId, MemberProfile>,
    states: HashMap<RoomId, GameState>,
    pigs: Vec<PlayerPig>,
    hands: Vec<PlayerHand>,
    deck: Vec<GameDeck>,
    draw_piles: HashMap<RoomId, Vec<CardType>>,
    fail_points: HashMap<FailPoint, u32>,
    rng: StdRng,
}

impl Inner {
    fn new(rng: StdRng) -> Self {
        Self {
            rooms: Vec::new(),
            members: Vec::new(),
            profiles: HashMap::new(),
            states: HashMap::new(),
            pigs: Vec::new(),
            hands: Vec::new(),
            deck: Vec::new(),
            draw_piles: HashMap::new(),
            fail_points: HashMap::new(),
            rng,
        }
    }

    fn trip(&mut self, point: FailPoint) -> Result<(), BackendError> {
        let Some(skip) = self.fail_points.get_mut(&point) else {
            return Ok(());
        };
        if *skip > 0 {
            *skip -= 1;
            return Ok(());
        }
        self.fail_points.remove(&point);
        debug!(target = LOG_TARGET, ?point, "injected failure");
        Err(BackendError::Injected(point))
    }

    fn room_mut(&mut self, room_id: RoomId) -> Result<&mut Room, BackendError> {
        self.rooms
            .iter_mut()
            .find(|room| room.id == room_id)
            .ok_or_else(|| BackendError::not_found(format!("room {room_id}")))
    }

    fn with_profile(&self, member: &RoomPlayer) -> RoomPlayer {
        let mut member = member.clone();
        member.profile = self.profiles.get(&member.player_id).cloned();
        member
    }

    fn member_order(&self, room_id: RoomId, player_id: PlayerId) -> Option<TurnOrder> {
        self.members
            .iter()
            .find(|m| m.room_id == room_id && m.player_id == player_id)
            .map(|m| m.player_order)
    }

    fn sync_occupancy(&mut self, room_id: RoomId, outbox: &mut Outbox) {
        let count = self.members.iter().filter(|m| m.room_id == room_id).count() as i32;
        if let Ok(room) = self.room_mut(room_id) {
            room.current_players = count;
            room.updated_at = Utc::now();
            let room = room.clone();
            outbox.update(room);
        }
    }

    fn sync_deck_remaining(&mut self, room_id: RoomId, outbox: &mut Outbox) {
        let remaining = self
            .draw_piles
            .get(&room_id)
            .map(|pile| pile.len() as i32)
            .unwrap_or(0);
        if let Some(state) = self.states.get_mut(&room_id) {
            state.deck_remaining = remaining;
            state.updated_at = Utc::now();
            outbox.update(state.clone());
        }
    }

    fn add_to_hand(&mut self, room_id: RoomId, player_id: PlayerId, card: CardType, outbox: &mut Outbox) {
        let now = Utc::now();
        if let Some(row) = self
            .hands
            .iter_mut()
            .find(|h| h.room_id == room_id && h.player_id == player_id && h.card_type == card)
        {
            row.card_count += 1;
            row.updated_at = now;
            outbox.update(row.clone());
            return;
        }
        let row = PlayerHand {
            id: Uuid::new_v4(),
            room_id,
            player_id,
            card_type: card,
            card_count: 1,
            created_at: now,
            updated_at: now,
        };
        self.hands.push(row.clone());
        outbox.insert(row);
    }

    fn take_from_pile(&mut self, room_id: RoomId, outbox: &mut Outbox) -> Option<CardType> {
        let card = self.draw_piles.get_mut(&room_id)?.pop()?;
        if let Some(row) = self
            .deck
            .iter_mut()
            .find(|d| d.room_id == room_id && d.card_type == card)
        {
            row.remaining_count -= 1;
            row.updated_at = Utc::now();
            outbox.update(row.clone());
        }
        Some(card)
    }
}

/// Changes committed under the lock, published after it is released.
#[derive(Default)]
struct Outbox(Vec<(TableChange, Value)>);

impl Outbox {
    fn insert<T: Row>(&mut self, row: T)
    where
        TableChange: From<Change<T>>,
    {
        let json = serde_json::to_value(&row).unwrap_or(Value::Null);
        self.0.push((Change::Insert(row).into(), json));
    }

    fn update<T: Row>(&mut self, row: T)
    where
        TableChange: From<Change<T>>,
    {
        let json = serde_json::to_value(&row).unwrap_or(Value::Null);
        self.0.push((Change::Update(row).into(), json));
    }

    fn delete<T: Row>(&mut self, row: &T)
    where
        TableChange: From<Change<T>>,
    {
        let json = serde_json::to_value(row).unwrap_or(Value::Null);
        self.0.push((Change::<T>::Delete(row.key()).into(), json));
    }
}

/// Process-local emulation of the hosted tables and stored procedures.
///
/// Row changes are pushed into an attached [`InMemoryRealtime`] with the same
/// table/filter routing the hosted change feed applies.
#[derive(Clone)]
pub struct InMemoryBackend {
    inner: Arc<RwLock<Inner>>,
    realtime: Option<InMemoryRealtime>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::new(rng))),
            realtime: None,
        }
    }

    pub fn with_realtime(mut self, realtime: InMemoryRealtime) -> Self {
        self.realtime = Some(realtime);
        self
    }

    /// Makes the next call through `point` fail once.
    pub fn fail_next(&self, point: FailPoint) {
        self.fail_after(point, 0);
    }

    /// Lets `skip` calls through `point` succeed, then fails the next one.
    pub fn fail_after(&self, point: FailPoint, skip: u32) {
        self.inner.write().fail_points.insert(point, skip);
    }

    /// Identity-table entry joined into membership rows.
    pub fn register_player(&self, player_id: PlayerId, email: impl Into<String>) {
        self.inner.write().profiles.insert(
            player_id,
            MemberProfile {
                email: Some(email.into()),
            },
        );
    }

    pub fn pigs_of(&self, room_id: RoomId, player_id: PlayerId) -> Vec<PlayerPig> {
        self.inner
            .read()
            .pigs
            .iter()
            .filter(|pig| pig.room_id == room_id && pig.player_id == player_id)
            .cloned()
            .collect()
    }

    pub fn hand_of(&self, room_id: RoomId, player_id: PlayerId) -> Vec<PlayerHand> {
        self.inner
            .read()
            .hands
            .iter()
            .filter(|h| h.room_id == room_id && h.player_id == player_id)
            .cloned()
            .collect()
    }

    pub fn game_state(&self, room_id: RoomId) -> Option<GameState> {
        self.inner.read().states.get(&room_id).cloned()
    }

    /// Overwrites pig rows without going through the change feed.
    pub fn seed_pigs(&self, pigs: Vec<PlayerPig>) {
        let mut inner = self.inner.write();
        for pig in pigs {
            match inner.pigs.iter_mut().find(|p| p.id == pig.id) {
                Some(existing) => *existing = pig,
                None => inner.pigs.push(pig),
            }
        }
    }

    /// Replaces a player's hand without going through the change feed.
    pub fn seed_hand(&self, room_id: RoomId, player_id: PlayerId, cards: &[(CardType, i32)]) {
        let now = Utc::now();
        let mut inner = self.inner.write();
        inner
            .hands
            .retain(|h| !(h.room_id == room_id && h.player_id == player_id));
        for (card, count) in cards {
            inner.hands.push(PlayerHand {
                id: Uuid::new_v4(),
                room_id,
                player_id,
                card_type: *card,
                card_count: *count,
                created_at: now,
                updated_at: now,
            });
        }
    }

    /// Puts `cards` on top of the draw pile, last element drawn first.
    pub fn stack_draw_pile(&self, room_id: RoomId, cards: &[CardType]) {
        let mut inner = self.inner.write();
        inner
            .draw_piles
            .entry(room_id)
            .or_default()
            .extend_from_slice(cards);
    }

    fn publish(&self, outbox: Outbox) {
        let Some(realtime) = &self.realtime else {
            return;
        };
        for (change, row) in outbox.0 {
            realtime.emit(&change, &row);
        }
    }
}

#[async_trait]
impl RoomBackend for InMemoryBackend {
    async fn list_rooms(&self) -> Result<Vec<Room>, BackendError> {
        let mut inner = self.inner.write();
        inner.trip(FailPoint::ListRooms)?;
        let mut rooms = inner.rooms.clone();
        rooms.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rooms)
    }

    async fn fetch_room(&self, room_id: RoomId) -> Result<Room, BackendError> {
        let inner = self.inner.read();
        inner
            .rooms
            .iter()
            .find(|room| room.id == room_id)
            .cloned()
            .ok_or_else(|| BackendError::not_found(format!("room {room_id}")))
    }

    async fn create_room(&self, room: NewRoom) -> Result<Room, BackendError> {
        let mut outbox = Outbox::default();
        let created = {
            let mut inner = self.inner.write();
            inner.trip(FailPoint::CreateRoom)?;
            if room.max_players < 2 {
                return Err(BackendError::rejected("a room needs at least two seats"));
            }
            let now = Utc::now();
            let created = Room {
                id: Uuid::new_v4(),
                name: room.name,
                max_players: room.max_players,
                current_players: 0,
                status: RoomStatus::Waiting,
                creator_id: room.creator_id,
                is_expansion: room.is_expansion,
                created_at: now,
                updated_at: now,
            };
            inner.rooms.push(created.clone());
            outbox.insert(created.clone());
            created
        };
        self.publish(outbox);
        info!(target = LOG_TARGET, room_id = %created.id, name = %created.name, "room created");
        Ok(created)
    }

    async fn list_members(&self, room_id: RoomId) -> Result<Vec<RoomPlayer>, BackendError> {
        let inner = self.inner.read();
        let mut members: Vec<RoomPlayer> = inner
            .members
            .iter()
            .filter(|m| m.room_id == room_id)
            .map(|m| inner.with_profile(m))
            .collect();
        members.sort_by_key(|m| m.player_order);
        Ok(members)
    }

    async fn insert_member(
        &self,
        room_id: RoomId,
        player_id: PlayerId,
        player_order: TurnOrder,
    ) -> Result<RoomPlayer, BackendError> {
        let mut outbox = Outbox::default();
        let member = {
            let mut inner = self.inner.write();
            inner.trip(FailPoint::InsertMember)?;
            let room = inner.room_mut(room_id)?.clone();
            if room.status != RoomStatus::Waiting {
                return Err(BackendError::rejected("room is not accepting players"));
            }
            if room.is_full() {
                return Err(BackendError::rejected("room is full"));
            }
            let in_room = inner.members.iter().filter(|m| m.room_id == room_id);
            for existing in in_room {
                if existing.player_id == player_id {
                    return Err(BackendError::Conflict(format!(
                        "player {player_id} already in room {room_id}"
                    )));
                }
                if existing.player_order == player_order {
                    return Err(BackendError::Conflict(format!(
                        "turn order {player_order} already taken in room {room_id}"
                    )));
                }
            }
            let member = RoomPlayer {
                id: Uuid::new_v4(),
                room_id,
                player_id,
                player_order,
                is_ready: false,
                joined_at: Utc::now(),
                profile: None,
            };
            inner.members.push(member.clone());
            outbox.insert(member.clone());
            inner.sync_occupancy(room_id, &mut outbox);
            member
        };
        self.publish(outbox);
        Ok(member)
    }

    async fn delete_member(&self, room_id: RoomId, player_id: PlayerId) -> Result<(), BackendError> {
        let mut outbox = Outbox::default();
        {
            let mut inner = self.inner.write();
            inner.trip(FailPoint::DeleteMember)?;
            let Some(pos) = inner
                .members
                .iter()
                .position(|m| m.room_id == room_id && m.player_id == player_id)
            else {
                return Ok(());
            };
            let removed = inner.members.remove(pos);
            outbox.delete(&removed);

            let waiting = inner
                .rooms
                .iter()
                .any(|room| room.id == room_id && room.status == RoomStatus::Waiting);
            if waiting {
                // Keep orders contiguous while seats can still change.
                let mut remaining: Vec<&mut RoomPlayer> = inner
                    .members
                    .iter_mut()
                    .filter(|m| m.room_id == room_id)
                    .collect();
                remaining.sort_by_key(|m| m.player_order);
                for (idx, member) in remaining.into_iter().enumerate() {
                    let order = idx as TurnOrder + 1;
                    if member.player_order != order {
                        member.player_order = order;
                        outbox.update(member.clone());
                    }
                }
            }
            inner.sync_occupancy(room_id, &mut outbox);
        }
        self.publish(outbox);
        Ok(())
    }

    async fn set_ready(&self, member_id: RowId, ready: bool) -> Result<(), BackendError> {
        let mut outbox = Outbox::default();
        {
            let mut inner = self.inner.write();
            inner.trip(FailPoint::SetReady)?;
            let member = inner
                .members
                .iter_mut()
                .find(|m| m.id == member_id)
                .ok_or_else(|| BackendError::not_found(format!("membership {member_id}")))?;
            member.is_ready = ready;
            outbox.update(member.clone());
        }
        self.publish(outbox);
        Ok(())
    }

    async fn assign_next_turn_order(&self, room_id: RoomId) -> Result<TurnOrder, BackendError> {
        let mut inner = self.inner.write();
        inner.trip(FailPoint::AssignTurnOrder)?;
        let used = inner
            .members
            .iter()
            .filter(|m| m.room_id == room_id)
            .map(|m| m.player_order);
        Ok(lowest_unused_order(used))
    }

    async fn start_game(&self, room_id: RoomId) -> Result<(), BackendError> {
        let mut outbox = Outbox::default();
        {
            let mut inner = self.inner.write();
            inner.trip(FailPoint::StartGame)?;
            let members: Vec<&RoomPlayer> =
                inner.members.iter().filter(|m| m.room_id == room_id).collect();
            if members.len() < 2 {
                return Err(BackendError::rejected("at least two players are required"));
            }
            if members.iter().any(|m| !m.is_ready) {
                return Err(BackendError::rejected("not every player is ready"));
            }
            let room = inner.room_mut(room_id)?;
            if room.status != RoomStatus::Waiting {
                return Err(BackendError::rejected("room is not waiting"));
            }
            room.status = RoomStatus::Playing;
            room.updated_at = Utc::now();
            let room = room.clone();
            outbox.update(room);
        }
        self.publish(outbox);
        info!(target = LOG_TARGET, room_id = %room_id, "room started");
        Ok(())
    }
}

#[async_trait]
impl GameBackend for InMemoryBackend {
    async fn fetch_game_state(&self, room_id: RoomId) -> Result<Option<GameState>, BackendError> {
        let mut inner = self.inner.write();
        inner.trip(FailPoint::FetchGameState)?;
        Ok(inner.states.get(&room_id).cloned())
    }

    async fn fetch_pigs(&self, room_id: RoomId) -> Result<Vec<PlayerPig>, BackendError> {
        let inner = self.inner.read();
        Ok(inner
            .pigs
            .iter()
            .filter(|pig| pig.room_id == room_id)
            .cloned()
            .collect())
    }

    async fn fetch_hand(
        &self,
        room_id: RoomId,
        player_id: PlayerId,
    ) -> Result<Vec<PlayerHand>, BackendError> {
        Ok(self.hand_of(room_id, player_id))
    }

    async fn fetch_deck(&self, room_id: RoomId) -> Result<Vec<GameDeck>, BackendError> {
        let inner = self.inner.read();
        Ok(inner
            .deck
            .iter()
            .filter(|d| d.room_id == room_id)
            .cloned()
            .collect())
    }

    async fn update_pig(&self, patch: &PigPatch) -> Result<(), BackendError> {
        let mut outbox = Outbox::default();
        {
            let mut inner = self.inner.write();
            inner.trip(FailPoint::UpdatePig)?;
            let pig = inner
                .pigs
                .iter_mut()
                .find(|pig| pig.id == patch.pig_id)
                .ok_or_else(|| BackendError::not_found(format!("pig {}", patch.pig_id)))?;
            patch.apply(pig);
            pig.updated_at = Utc::now();
            outbox.update(pig.clone());
        }
        self.publish(outbox);
        Ok(())
    }

    async fn set_card_count(&self, hand_id: RowId, count: i32) -> Result<(), BackendError> {
        let mut outbox = Outbox::default();
        {
            let mut inner = self.inner.write();
            inner.trip(FailPoint::UpdateHand)?;
            let row = inner
                .hands
                .iter_mut()
                .find(|h| h.id == hand_id)
                .ok_or_else(|| BackendError::not_found(format!("hand {hand_id}")))?;
            row.card_count = count;
            row.updated_at = Utc::now();
            outbox.update(row.clone());
        }
        self.publish(outbox);
        Ok(())
    }

    async fn delete_hand_row(&self, hand_id: RowId) -> Result<(), BackendError> {
        let mut outbox = Outbox::default();
        {
            let mut inner = self.inner.write();
            inner.trip(FailPoint::DeleteHand)?;
            if let Some(pos) = inner.hands.iter().position(|h| h.id == hand_id) {
                let removed = inner.hands.remove(pos);
                outbox.delete(&removed);
            }
        }
        self.publish(outbox);
        Ok(())
    }

    async fn clear_hand(&self, room_id: RoomId, player_id: PlayerId) -> Result<(), BackendError> {
        let mut outbox = Outbox::default();
        {
            let mut inner = self.inner.write();
            inner.trip(FailPoint::DeleteHand)?;
            let (removed, kept): (Vec<PlayerHand>, Vec<PlayerHand>) = inner
                .hands
                .drain(..)
                .partition(|h| h.room_id == room_id && h.player_id == player_id);
            inner.hands = kept;
            for row in &removed {
                outbox.delete(row);
            }
        }
        self.publish(outbox);
        Ok(())
    }

    async fn set_current_turn(
        &self,
        room_id: RoomId,
        order: TurnOrder,
    ) -> Result<(), BackendError> {
        let mut outbox = Outbox::default();
        {
            let mut inner = self.inner.write();
            inner.trip(FailPoint::SetTurn)?;
            let state = inner
                .states
                .get_mut(&room_id)
                .ok_or_else(|| BackendError::not_found(format!("game state {room_id}")))?;
            state.current_player_order = order;
            state.updated_at = Utc::now();
            outbox.update(state.clone());
        }
        self.publish(outbox);
        Ok(())
    }

    async fn finish_game(&self, room_id: RoomId, winner: PlayerId) -> Result<(), BackendError> {
        let mut outbox = Outbox::default();
        {
            let mut inner = self.inner.write();
            inner.trip(FailPoint::FinishGame)?;
            let now = Utc::now();
            let state = inner
                .states
                .get_mut(&room_id)
                .ok_or_else(|| BackendError::not_found(format!("game state {room_id}")))?;
            state.game_phase = GamePhase::Finished;
            state.winner_player_id = Some(winner);
            state.finished_at = Some(now);
            state.updated_at = now;
            outbox.update(state.clone());
            if let Ok(room) = inner.room_mut(room_id) {
                room.status = RoomStatus::Finished;
                room.updated_at = now;
                let room = room.clone();
                outbox.update(room);
            }
        }
        self.publish(outbox);
        info!(target = LOG_TARGET, room_id = %room_id, winner = %winner, "game finished");
        Ok(())
    }

    async fn initialize_game(&self, room_id: RoomId) -> Result<(), BackendError> {
        let mut outbox = Outbox::default();
        {
            let mut inner = self.inner.write();
            inner.trip(FailPoint::InitializeGame)?;
            if inner.states.contains_key(&room_id) {
                debug!(target = LOG_TARGET, room_id = %room_id, "game already initialized");
                return Ok(());
            }
            let room = inner.room_mut(room_id)?.clone();
            let mut members: Vec<RoomPlayer> = inner
                .members
                .iter()
                .filter(|m| m.room_id == room_id)
                .cloned()
                .collect();
            members.sort_by_key(|m| m.player_order);
            if members.len() < 2 {
                return Err(BackendError::rejected("at least two players are required"));
            }

            let now = Utc::now();
            let mut pile: Vec<CardType> = deck_composition(room.is_expansion)
                .flat_map(|(card, count)| std::iter::repeat(card).take(count as usize))
                .collect();
            pile.shuffle(&mut inner.rng);
            for (card, count) in deck_composition(room.is_expansion) {
                let row = GameDeck {
                    room_id,
                    card_type: card,
                    remaining_count: count,
                    created_at: now,
                    updated_at: now,
                };
                inner.deck.push(row.clone());
                outbox.insert(row);
            }
            inner.draw_piles.insert(room_id, pile);

            let per_player = pigs_per_player(members.len());
            for member in &members {
                for index in 0..per_player {
                    let pig = PlayerPig {
                        id: Uuid::new_v4(),
                        room_id,
                        player_id: member.player_id,
                        pig_index: index,
                        pig_state: PigState::Clean,
                        has_barn: false,
                        barn_locked: false,
                        has_lightning_rod: false,
                        created_at: now,
                        updated_at: now,
                    };
                    inner.pigs.push(pig.clone());
                    outbox.insert(pig);
                }
                for _ in 0..HAND_SIZE {
                    if let Some(card) = inner.take_from_pile(room_id, &mut outbox) {
                        inner.add_to_hand(room_id, member.player_id, card, &mut outbox);
                    }
                }
            }

            let state = GameState {
                room_id,
                current_player_order: members[0].player_order,
                game_phase: GamePhase::Playing,
                winner_player_id: None,
                deck_remaining: inner.draw_piles.get(&room_id).map_or(0, |p| p.len() as i32),
                started_at: Some(now),
                finished_at: None,
                created_at: now,
                updated_at: now,
            };
            inner.states.insert(room_id, state.clone());
            outbox.insert(state);

            let room = inner.room_mut(room_id)?;
            if room.status == RoomStatus::Waiting {
                room.status = RoomStatus::Playing;
                room.updated_at = now;
                let room = room.clone();
                outbox.update(room);
            }
            info!(
                target = LOG_TARGET,
                room_id = %room_id,
                players = members.len(),
                pigs_per_player = per_player,
                "game initialized"
            );
        }
        self.publish(outbox);
        Ok(())
    }

    async fn draw_card(
        &self,
        room_id: RoomId,
        player_id: PlayerId,
    ) -> Result<Option<CardType>, BackendError> {
        let mut outbox = Outbox::default();
        let card = {
            let mut inner = self.inner.write();
            inner.trip(FailPoint::DrawCard)?;
            if inner.member_order(room_id, player_id).is_none() {
                return Err(BackendError::rejected("player is not in this room"));
            }
            let card = inner.take_from_pile(room_id, &mut outbox);
            if let Some(card) = card {
                inner.add_to_hand(room_id, player_id, card, &mut outbox);
                inner.sync_deck_remaining(room_id, &mut outbox);
            }
            card
        };
        self.publish(outbox);
        Ok(card)
    }

    async fn is_player_turn(
        &self,
        room_id: RoomId,
        player_id: PlayerId,
    ) -> Result<bool, BackendError> {
        let mut inner = self.inner.write();
        inner.trip(FailPoint::TurnCheck)?;
        let Some(state) = inner.states.get(&room_id) else {
            return Ok(false);
        };
        Ok(state.game_phase == GamePhase::Playing
            && inner.member_order(room_id, player_id) == Some(state.current_player_order))
    }

    async fn check_winner(
        &self,
        room_id: RoomId,
        player_id: PlayerId,
    ) -> Result<bool, BackendError> {
        let mut inner = self.inner.write();
        inner.trip(FailPoint::CheckWinner)?;
        let own = inner
            .pigs
            .iter()
            .filter(|pig| pig.room_id == room_id && pig.player_id == player_id);
        Ok(win_condition(own).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::rules::orders_are_contiguous;
    use crate::realtime::{ChannelSpec, RealtimeEvent, RealtimeHub};
    use anyhow::Result;

    async fn seated_room(backend: &InMemoryBackend, players: usize) -> Result<(Room, Vec<PlayerId>)> {
        let creator = Uuid::new_v4();
        let mut room = NewRoom::new("sty", creator);
        room.max_players = players.max(2) as i32;
        let room = backend.create_room(room).await?;
        let mut ids = vec![creator];
        ids.extend((1..players).map(|_| Uuid::new_v4()));
        for id in &ids {
            let order = backend.assign_next_turn_order(room.id).await?;
            backend.insert_member(room.id, *id, order).await?;
        }
        Ok((room, ids))
    }

    #[tokio::test]
    async fn deals_pigs_and_hands_by_table_size() -> Result<()> {
        for (players, pigs) in [(2, 5), (3, 4), (4, 3)] {
            let backend = InMemoryBackend::with_seed(7);
            let (room, ids) = seated_room(&backend, players).await?;
            backend.initialize_game(room.id).await?;

            for id in &ids {
                assert_eq!(backend.pigs_of(room.id, *id).len(), pigs);
                let held: i32 = backend.hand_of(room.id, *id).iter().map(|h| h.card_count).sum();
                assert_eq!(held, HAND_SIZE);
            }
            let state = backend.game_state(room.id).expect("state");
            assert_eq!(state.current_player_order, 1);
            assert_eq!(state.deck_remaining, 54 - HAND_SIZE * players as i32);
            let deck: i32 = backend
                .fetch_deck(room.id)
                .await?
                .iter()
                .map(|d| d.remaining_count)
                .sum();
            assert_eq!(deck, state.deck_remaining);
        }
        Ok(())
    }

    #[tokio::test]
    async fn turn_orders_stay_unique_and_compact_on_leave() -> Result<()> {
        let backend = InMemoryBackend::new();
        let (room, ids) = seated_room(&backend, 4).await?;

        let clash = backend.insert_member(room.id, Uuid::new_v4(), 2).await;
        assert!(matches!(clash, Err(BackendError::Rejected(_))));

        backend.delete_member(room.id, ids[1]).await?;
        let orders: Vec<TurnOrder> = backend
            .list_members(room.id)
            .await?
            .iter()
            .map(|m| m.player_order)
            .collect();
        assert!(orders_are_contiguous(&orders));
        assert_eq!(backend.fetch_room(room.id).await?.current_players, 3);

        let order = backend.assign_next_turn_order(room.id).await?;
        assert_eq!(order, 4);
        let duplicate = backend.insert_member(room.id, Uuid::new_v4(), 1).await;
        assert!(matches!(duplicate, Err(BackendError::Conflict(_))));
        Ok(())
    }

    #[tokio::test]
    async fn draw_moves_a_card_from_pile_to_hand() -> Result<()> {
        let backend = InMemoryBackend::with_seed(1);
        let (room, ids) = seated_room(&backend, 2).await?;
        backend.initialize_game(room.id).await?;
        backend.stack_draw_pile(room.id, &[CardType::Rain]);

        let before = backend.game_state(room.id).expect("state").deck_remaining;
        let card = backend.draw_card(room.id, ids[0]).await?;
        assert_eq!(card, Some(CardType::Rain));
        assert_eq!(
            backend.game_state(room.id).expect("state").deck_remaining,
            before
        );
        assert!(backend
            .hand_of(room.id, ids[0])
            .iter()
            .any(|h| h.card_type == CardType::Rain));
        Ok(())
    }

    #[tokio::test]
    async fn turn_check_follows_current_order() -> Result<()> {
        let backend = InMemoryBackend::new();
        let (room, ids) = seated_room(&backend, 3).await?;
        backend.initialize_game(room.id).await?;

        assert!(backend.is_player_turn(room.id, ids[0]).await?);
        assert!(!backend.is_player_turn(room.id, ids[1]).await?);
        backend.set_current_turn(room.id, 2).await?;
        assert!(backend.is_player_turn(room.id, ids[1]).await?);
        Ok(())
    }

    #[tokio::test]
    async fn fail_points_trip_once() -> Result<()> {
        let backend = InMemoryBackend::new();
        backend.fail_next(FailPoint::ListRooms);
        assert_eq!(
            backend.list_rooms().await,
            Err(BackendError::Injected(FailPoint::ListRooms))
        );
        assert!(backend.list_rooms().await?.is_empty());

        backend.fail_after(FailPoint::ListRooms, 1);
        assert!(backend.list_rooms().await.is_ok());
        assert!(backend.list_rooms().await.is_err());
        assert!(backend.list_rooms().await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn hand_changes_only_reach_their_owner() -> Result<()> {
        let realtime = InMemoryRealtime::new();
        let backend = InMemoryBackend::with_seed(3).with_realtime(realtime.clone());
        let (room, ids) = seated_room(&backend, 2).await?;

        let mut mine = realtime.open(ChannelSpec::game(room.id, ids[0])).await?;
        mine.events.recv().await?;
        backend.initialize_game(room.id).await?;

        let mut hand_owners = Vec::new();
        while let Ok(event) = mine.events.try_recv() {
            if let RealtimeEvent::Table(TableChange::PlayerHands(change)) = event {
                if let Some(row) = change.row() {
                    hand_owners.push(row.player_id);
                }
            }
        }
        assert!(!hand_owners.is_empty());
        assert!(hand_owners.iter().all(|owner| *owner == ids[0]));
        Ok(())
    }
}
