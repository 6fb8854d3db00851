use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::config::DEFAULT_POLL_INTERVAL;
use crate::domain::cards::HAND_SIZE;
use crate::domain::effects::{self, apply_patches};
use crate::domain::rules::{next_turn_order, WinCondition};
use crate::domain::targeting::{target_scope, valid_targets, TargetScope};
use crate::domain::{
    CardType, GamePhase, PigPatch, PlayerHand, PlayerId, PlayerPig, RoomId, RowId, TurnOrder,
};
use crate::realtime::{
    fold, BroadcastMessage, Change, ChannelSpec, ChannelStatus, GameActionPayload,
    GameFinishedPayload, Publisher, RealtimeEvent, RealtimeHub, TableChange,
};
use crate::session::Identity;
use crate::tokio_tools::spawn_named_task;

use super::guard::InFlight;
use super::optimistic::Optimistic;
use super::poller::spawn_poller;
use super::state::{GameSnapshot, WinnerInfo};
use super::GameError;

const LOG_TARGET: &str = "game::store";

struct GameChannel {
    room_id: RoomId,
    stop: CancellationToken,
    publisher: Publisher,
    poller: Option<CancellationToken>,
}

/// Client-side mirror of one room's game, plus the turn actions.
#[derive(Clone)]
pub struct GameStore {
    backend: Arc<dyn Backend>,
    realtime: Arc<dyn RealtimeHub>,
    identity: watch::Receiver<Option<Identity>>,
    poll_interval: Duration,
    state: Arc<RwLock<GameSnapshot>>,
    channel: Arc<Mutex<Option<GameChannel>>>,
}

impl GameStore {
    pub fn new(
        backend: Arc<dyn Backend>,
        realtime: Arc<dyn RealtimeHub>,
        identity: watch::Receiver<Option<Identity>>,
    ) -> Self {
        Self {
            backend,
            realtime,
            identity,
            poll_interval: DEFAULT_POLL_INTERVAL,
            state: Arc::new(RwLock::new(GameSnapshot::default())),
            channel: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn snapshot(&self) -> GameSnapshot {
        self.state.read().clone()
    }

    fn me(&self) -> Option<Identity> {
        self.identity.borrow().clone()
    }

    fn require_me(&self) -> Result<PlayerId, GameError> {
        self.me()
            .map(|identity| identity.id)
            .ok_or(GameError::NotAuthenticated)
    }

    fn require_room(&self) -> Result<RoomId, GameError> {
        self.state.read().room_id.ok_or(GameError::NoGame)
    }

    pub fn player_id(&self) -> Option<PlayerId> {
        self.me().map(|identity| identity.id)
    }

    pub fn my_player_order(&self) -> Option<TurnOrder> {
        let me = self.player_id()?;
        self.state.read().my_player_order(me)
    }

    pub fn is_my_turn(&self) -> bool {
        self.player_id()
            .is_some_and(|me| self.state.read().is_my_turn(me))
    }

    pub fn current_player(&self) -> Option<PlayerId> {
        self.state.read().current_player().map(|m| m.player_id)
    }

    pub fn my_pigs(&self) -> Vec<PlayerPig> {
        let Some(me) = self.player_id() else {
            return Vec::new();
        };
        self.state.read().my_pigs(me).into_iter().cloned().collect()
    }

    pub fn other_pigs(&self) -> Vec<PlayerPig> {
        let Some(me) = self.player_id() else {
            return Vec::new();
        };
        self.state.read().other_pigs(me).into_iter().cloned().collect()
    }

    pub fn my_hand(&self) -> Vec<PlayerHand> {
        self.state.read().my_hand().into_iter().cloned().collect()
    }

    pub fn deck_count(&self) -> i32 {
        self.state.read().deck_count()
    }

    pub fn can_play_card(&self, card: CardType) -> bool {
        self.player_id()
            .is_some_and(|me| self.state.read().can_play_card(card, me))
    }

    pub fn can_discard_all_cards(&self) -> bool {
        self.player_id()
            .is_some_and(|me| self.state.read().can_discard_all_cards(me))
    }

    pub fn win_condition(&self) -> Option<WinCondition> {
        let me = self.player_id()?;
        self.state.read().win_condition(me)
    }

    pub fn is_game_finished(&self) -> bool {
        self.state.read().is_game_finished()
    }

    pub fn is_winner(&self) -> bool {
        self.player_id()
            .is_some_and(|me| self.state.read().is_winner(me))
    }

    pub fn winner_info(&self) -> Option<WinnerInfo> {
        self.state.read().winner_info()
    }

    pub fn valid_targets(&self, card: CardType) -> Vec<PlayerPig> {
        let Some(me) = self.player_id() else {
            return Vec::new();
        };
        let state = self.state.read();
        valid_targets(card, &state.pigs, me)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn error(&self) -> Option<String> {
        self.state.read().error.clone()
    }

    pub fn last_action(&self) -> Option<String> {
        self.state.read().last_action.clone()
    }

    /// Own turn, game running, nothing else in progress.
    fn check_turn_open(&self) -> Result<(), GameError> {
        let me = self.require_me()?;
        let state = self.state.read();
        if state.game_state.is_none() {
            return Err(GameError::NoGame);
        }
        if state.is_game_finished() {
            return Err(GameError::GameFinished);
        }
        if !state.is_my_turn(me) {
            return Err(GameError::NotYourTurn);
        }
        if state.card_in_flight {
            return Err(GameError::ActionInFlight);
        }
        if state.turn_in_progress {
            return Err(GameError::TurnInProgress);
        }
        Ok(())
    }

    /// Synchronous legality check with the specific rejection.
    pub fn check_playable(&self, card: CardType) -> Result<(), GameError> {
        self.check_turn_open()?;
        let me = self.require_me()?;
        let state = self.state.read();
        if state.hand_count(card) < 1 {
            return Err(GameError::CardNotInHand(card));
        }
        if !state.can_play_card(card, me) {
            return Err(GameError::NoValidTarget(card));
        }
        Ok(())
    }

    /// Marks the turn as taken while the player picks a target.
    pub(crate) fn claim_turn(&self) {
        let mut state = self.state.write();
        state.turn_in_progress = true;
        state.error = None;
    }

    pub(crate) fn release_turn(&self) {
        self.state.write().turn_in_progress = false;
    }

    /// Records a rejection that happened before anything was touched.
    fn reject(&self, err: GameError) -> GameError {
        debug!(target = LOG_TARGET, error = %err, "game action rejected");
        self.state.write().error = Some(err.to_string());
        err
    }

    /// Records a failure after the turn was claimed and releases it.
    fn fail(&self, err: &GameError) {
        warn!(target = LOG_TARGET, error = %err, "game action failed");
        let mut state = self.state.write();
        state.turn_in_progress = false;
        state.error = Some(err.to_string());
    }

    pub async fn initialize_game(&self, room_id: RoomId) -> Result<(), GameError> {
        if let Err(err) = self.backend.initialize_game(room_id).await {
            let err = GameError::from(err);
            self.state.write().error = Some(err.to_string());
            return Err(err);
        }
        info!(target = LOG_TARGET, room_id = %room_id, "game initialized");
        self.load_game(room_id).await
    }

    /// Loads every cached collection for the room and subscribes to it.
    /// A call made while a load is running returns immediately.
    pub async fn load_game(&self, room_id: RoomId) -> Result<(), GameError> {
        {
            let mut state = self.state.write();
            if state.loading {
                debug!(target = LOG_TARGET, room_id = %room_id, "load already running");
                return Ok(());
            }
            state.loading = true;
            state.error = None;
        }
        let result = self.load(room_id).await;
        {
            let mut state = self.state.write();
            state.loading = false;
            if let Err(err) = &result {
                state.error = Some(err.to_string());
            }
        }
        if let Err(err) = &result {
            warn!(target = LOG_TARGET, room_id = %room_id, error = %err, "load failed");
            return result;
        }
        let subscribed = self
            .channel
            .lock()
            .as_ref()
            .is_some_and(|channel| channel.room_id == room_id);
        if !subscribed {
            self.subscribe(room_id).await?;
        }
        Ok(())
    }

    async fn load(&self, room_id: RoomId) -> Result<(), GameError> {
        let me = self.require_me()?;
        let game_state = self
            .backend
            .fetch_game_state(room_id)
            .await?
            .ok_or(GameError::GameNotFound(room_id))?;
        let pigs = self.backend.fetch_pigs(room_id).await?;
        let hand = self.backend.fetch_hand(room_id, me).await?;
        let deck = self.backend.fetch_deck(room_id).await?;
        let members = self.backend.list_members(room_id).await?;

        let mut state = self.state.write();
        if state.room_id != Some(room_id) {
            state.finished = None;
            state.last_action = None;
            state.turn_in_progress = false;
        }
        state.room_id = Some(room_id);
        state.game_state = Some(game_state);
        state.pigs = pigs;
        state.hand = hand;
        state.deck = deck;
        state.members = members;
        debug!(
            target = LOG_TARGET,
            room_id = %room_id,
            pigs = state.pigs.len(),
            cards = state.cards_in_hand(),
            "game loaded"
        );
        Ok(())
    }

    /// Plays `card`, aimed at `target` when the card needs one.
    pub async fn play_card(&self, card: CardType, target: Option<RowId>) -> Result<(), GameError> {
        self.play(card, target, false).await
    }

    /// Plays a card whose turn was already claimed by target selection.
    pub(crate) async fn play_claimed(
        &self,
        card: CardType,
        target: Option<RowId>,
    ) -> Result<(), GameError> {
        self.play(card, target, true).await
    }

    async fn play(&self, card: CardType, target: Option<RowId>, claimed: bool) -> Result<(), GameError> {
        if !claimed {
            self.check_playable(card).map_err(|err| self.reject(err))?;
        }
        let _flight = match InFlight::acquire(&self.state) {
            Ok(flight) => flight,
            Err(err) if claimed => {
                self.fail(&err);
                return Err(err);
            }
            Err(err) => return Err(self.reject(err)),
        };
        let result = self.run_play(card, target).await;
        if let Err(err) = &result {
            self.fail(err);
        }
        result
    }

    async fn run_play(&self, card: CardType, target: Option<RowId>) -> Result<(), GameError> {
        let me = self.require_me()?;
        let room_id = self.require_room()?;
        self.claim_turn();
        {
            let state = self.state.read();
            if state.is_game_finished() {
                return Err(GameError::GameFinished);
            }
            if !state.is_my_turn(me) {
                return Err(GameError::NotYourTurn);
            }
            if state.hand_count(card) < 1 {
                return Err(GameError::CardNotInHand(card));
            }
        }
        if !self.backend.is_player_turn(room_id, me).await? {
            return Err(GameError::NotYourTurn);
        }

        let patches = self.resolve_effect(card, target, me)?;
        self.persist_effect(&patches).await?;
        let target_pig_id = match target_scope(card) {
            TargetScope::Own | TargetScope::Opposing => patches.first().map(|p| p.pig_id),
            _ => None,
        };
        self.announce(BroadcastMessage::GameAction(GameActionPayload {
            action: card,
            player_id: me,
            target_pig_id,
            timestamp: Utc::now(),
        }))
        .await;

        self.remove_card(card).await?;
        self.draw_into_hand(room_id, me, 1).await?;
        self.state.write().last_action = Some(format!("You played {card}"));
        info!(target = LOG_TARGET, room_id = %room_id, %card, ?target_pig_id, "card played");

        match self.win_condition() {
            Some(condition) => self.end_game(room_id, me, condition).await,
            None => self.advance_turn().await,
        }
    }

    fn resolve_effect(
        &self,
        card: CardType,
        target: Option<RowId>,
        me: PlayerId,
    ) -> Result<Vec<PigPatch>, GameError> {
        let state = self.state.read();
        let target_pig = match (target_scope(card), target) {
            (TargetScope::Own | TargetScope::Opposing, Some(pig_id)) => Some(
                state
                    .pigs
                    .iter()
                    .find(|pig| pig.id == pig_id)
                    .ok_or(GameError::InvalidTarget { card, pig_id })?,
            ),
            (TargetScope::Own | TargetScope::Opposing, None) => {
                let first = valid_targets(card, &state.pigs, me).into_iter().next();
                if first.is_none() {
                    return Err(GameError::NoValidTarget(card));
                }
                first
            }
            _ => None,
        };
        Ok(effects::resolve(card, target_pig, &state.pigs, me)?)
    }

    /// Applies the patches to the cache, then persists them one by one.
    async fn persist_effect(&self, patches: &[PigPatch]) -> Result<(), GameError> {
        if patches.is_empty() {
            return Ok(());
        }
        let change = {
            let mut state = self.state.write();
            let keys = patches.iter().map(|p| p.pig_id).collect();
            Optimistic::apply(&mut state.pigs, keys, |pigs| {
                apply_patches(pigs, patches);
            })
        };
        for (written, patch) in patches.iter().enumerate() {
            if let Err(err) = self.backend.update_pig(patch).await {
                // Rows already written stay patched; only the rest revert.
                let mut state = self.state.write();
                change.rollback(&mut state.pigs);
                apply_patches(&mut state.pigs, &patches[..written]);
                return Err(err.into());
            }
        }
        change.commit();
        Ok(())
    }

    /// Takes one `card` out of the hand: decrement, or drop the row at one.
    async fn remove_card(&self, card: CardType) -> Result<(), GameError> {
        let (row, change) = {
            let mut state = self.state.write();
            let row = state
                .hand
                .iter()
                .find(|h| h.card_type == card && h.card_count > 0)
                .cloned()
                .ok_or(GameError::CardNotInHand(card))?;
            let change = Optimistic::apply(&mut state.hand, vec![row.id], |hand| {
                if row.card_count > 1 {
                    if let Some(held) = hand.iter_mut().find(|h| h.id == row.id) {
                        held.card_count -= 1;
                    }
                } else {
                    hand.retain(|h| h.id != row.id);
                }
            });
            (row, change)
        };
        let persisted = if row.card_count > 1 {
            self.backend.set_card_count(row.id, row.card_count - 1).await
        } else {
            self.backend.delete_hand_row(row.id).await
        };
        match persisted {
            Ok(()) => {
                change.commit();
                Ok(())
            }
            Err(err) => {
                change.rollback(&mut self.state.write().hand);
                Err(err.into())
            }
        }
    }

    async fn draw_into_hand(&self, room_id: RoomId, me: PlayerId, count: i32) -> Result<(), GameError> {
        for _ in 0..count {
            match self.backend.draw_card(room_id, me).await? {
                Some(card) => debug!(target = LOG_TARGET, %card, "card drawn"),
                None => {
                    info!(target = LOG_TARGET, room_id = %room_id, "deck is empty");
                    break;
                }
            }
        }
        self.refresh_hand(room_id, me).await
    }

    async fn refresh_hand(&self, room_id: RoomId, me: PlayerId) -> Result<(), GameError> {
        let hand = self.backend.fetch_hand(room_id, me).await?;
        let mut state = self.state.write();
        if state.in_room(room_id) {
            state.hand = hand;
        }
        Ok(())
    }

    /// Draws one card on the own turn and reloads the own hand.
    pub async fn draw_card(&self) -> Result<Option<CardType>, GameError> {
        self.check_turn_open().map_err(|err| self.reject(err))?;
        let _flight = InFlight::acquire(&self.state).map_err(|err| self.reject(err))?;
        let result = self.run_draw().await;
        if let Err(err) = &result {
            self.fail(err);
        }
        result
    }

    async fn run_draw(&self) -> Result<Option<CardType>, GameError> {
        let me = self.require_me()?;
        let room_id = self.require_room()?;
        self.claim_turn();
        if !self.backend.is_player_turn(room_id, me).await? {
            return Err(GameError::NotYourTurn);
        }
        let card = self.backend.draw_card(room_id, me).await?;
        self.refresh_hand(room_id, me).await?;
        self.release_turn();
        Ok(card)
    }

    /// Discards one card, draws a replacement and passes the turn.
    pub async fn discard_card(&self, card: CardType) -> Result<(), GameError> {
        self.check_turn_open()
            .and_then(|()| {
                if self.state.read().hand_count(card) < 1 {
                    return Err(GameError::CardNotInHand(card));
                }
                Ok(())
            })
            .map_err(|err| self.reject(err))?;
        let _flight = InFlight::acquire(&self.state).map_err(|err| self.reject(err))?;
        let result = self.run_discard(card).await;
        if let Err(err) = &result {
            self.fail(err);
        }
        result
    }

    async fn run_discard(&self, card: CardType) -> Result<(), GameError> {
        let me = self.require_me()?;
        let room_id = self.require_room()?;
        self.claim_turn();
        if !self.backend.is_player_turn(room_id, me).await? {
            return Err(GameError::NotYourTurn);
        }
        self.remove_card(card).await?;
        self.draw_into_hand(room_id, me, 1).await?;
        self.state.write().last_action = Some(format!("You discarded {card}"));
        info!(target = LOG_TARGET, room_id = %room_id, %card, "card discarded");
        self.advance_turn().await
    }

    /// Swaps a dead hand for a fresh one and passes the turn.
    pub async fn discard_all_cards(&self) -> Result<(), GameError> {
        self.check_turn_open()
            .and_then(|()| {
                if !self.can_discard_all_cards() {
                    return Err(GameError::CannotDiscardAll);
                }
                Ok(())
            })
            .map_err(|err| self.reject(err))?;
        let _flight = InFlight::acquire(&self.state).map_err(|err| self.reject(err))?;
        let result = self.run_discard_all().await;
        if let Err(err) = &result {
            self.fail(err);
        }
        result
    }

    async fn run_discard_all(&self) -> Result<(), GameError> {
        let me = self.require_me()?;
        let room_id = self.require_room()?;
        self.claim_turn();
        if !self.backend.is_player_turn(room_id, me).await? {
            return Err(GameError::NotYourTurn);
        }
        let change = {
            let mut state = self.state.write();
            let keys = state.hand.iter().map(|h| h.id).collect();
            Optimistic::apply(&mut state.hand, keys, |hand| hand.clear())
        };
        if let Err(err) = self.backend.clear_hand(room_id, me).await {
            change.rollback(&mut self.state.write().hand);
            return Err(err.into());
        }
        change.commit();
        self.draw_into_hand(room_id, me, HAND_SIZE).await?;
        self.state.write().last_action = Some("You discarded your hand".to_owned());
        info!(target = LOG_TARGET, room_id = %room_id, "hand discarded");
        self.advance_turn().await
    }

    /// Passes the own turn without playing.
    pub async fn end_turn(&self) -> Result<(), GameError> {
        self.check_turn_open().map_err(|err| self.reject(err))?;
        let _flight = InFlight::acquire(&self.state).map_err(|err| self.reject(err))?;
        let result = self.run_end_turn().await;
        if let Err(err) = &result {
            self.fail(err);
        }
        result
    }

    async fn run_end_turn(&self) -> Result<(), GameError> {
        let me = self.require_me()?;
        let room_id = self.require_room()?;
        self.claim_turn();
        if !self.backend.is_player_turn(room_id, me).await? {
            return Err(GameError::NotYourTurn);
        }
        self.advance_turn().await
    }

    /// Moves the turn pointer to the next member order. Callers have
    /// already checked turn ownership.
    async fn advance_turn(&self) -> Result<(), GameError> {
        let room_id = self.require_room()?;
        let current = self
            .state
            .read()
            .game_state
            .as_ref()
            .map(|s| s.current_player_order)
            .ok_or(GameError::NoGame)?;
        let members = self.backend.list_members(room_id).await?;
        let next = next_turn_order(members.iter().map(|m| m.player_order), current)
            .ok_or(GameError::NoGame)?;
        self.backend.set_current_turn(room_id, next).await?;
        let mut state = self.state.write();
        if let Some(game) = state.game_state.as_mut() {
            game.current_player_order = next;
        }
        state.turn_in_progress = false;
        debug!(target = LOG_TARGET, room_id = %room_id, from = current, to = next, "turn ended");
        Ok(())
    }

    async fn end_game(
        &self,
        room_id: RoomId,
        me: PlayerId,
        condition: WinCondition,
    ) -> Result<(), GameError> {
        self.backend.finish_game(room_id, me).await?;
        let finished_at = Utc::now();
        let winner_name = self
            .me()
            .and_then(|identity| identity.display_name().map(str::to_owned))
            .unwrap_or_else(|| self.state.read().member_name(me));
        let payload = GameFinishedPayload {
            winner_player_id: me,
            winner_name,
            win_condition: condition,
            finished_at,
        };
        {
            let mut state = self.state.write();
            if let Some(game) = state.game_state.as_mut() {
                game.game_phase = GamePhase::Finished;
                game.winner_player_id = Some(me);
                game.finished_at = Some(finished_at);
            }
            state.turn_in_progress = false;
            state.finished = Some(payload.clone());
            state.last_action = Some(format!("You won with {} pigs", condition.as_str()));
        }
        self.announce(BroadcastMessage::GameFinished(payload)).await;
        match self.backend.check_winner(room_id, me).await {
            Ok(confirmed) => {
                info!(target = LOG_TARGET, room_id = %room_id, condition = condition.as_str(), confirmed, "game won");
            }
            Err(err) => warn!(target = LOG_TARGET, error = %err, "winner check failed"),
        }
        Ok(())
    }

    async fn announce(&self, message: BroadcastMessage) {
        let publisher = self
            .channel
            .lock()
            .as_ref()
            .map(|channel| channel.publisher.clone());
        let Some(publisher) = publisher else {
            debug!(target = LOG_TARGET, event = message.event(), "no channel to broadcast on");
            return;
        };
        if let Err(err) = publisher.send(message).await {
            warn!(target = LOG_TARGET, error = %err, "broadcast failed");
        }
    }

    /// Opens the room's game channel, replacing any previous one.
    pub async fn subscribe(&self, room_id: RoomId) -> Result<(), GameError> {
        let me = self.require_me()?;
        let handle = match self.realtime.open(ChannelSpec::game(room_id, me)).await {
            Ok(handle) => handle,
            Err(err) => {
                let mut state = self.state.write();
                state.connected = false;
                state.connection_error = Some(err.to_string());
                return Err(err.into());
            }
        };
        let (events, publisher, stop) = handle.into_parts();
        let previous = self.channel.lock().replace(GameChannel {
            room_id,
            stop: stop.clone(),
            publisher,
            poller: None,
        });
        if let Some(previous) = previous {
            previous.shutdown();
        }
        let store = self.clone();
        spawn_named_task(format!("game-channel-{room_id}"), async move {
            store.pump(room_id, events, stop).await;
        });
        Ok(())
    }

    async fn pump(
        &self,
        room_id: RoomId,
        mut events: broadcast::Receiver<RealtimeEvent>,
        stop: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                received = events.recv() => received,
            };
            match event {
                Ok(RealtimeEvent::Status(ChannelStatus::Closed)) => {
                    self.on_status(room_id, ChannelStatus::Closed);
                    break;
                }
                Ok(RealtimeEvent::Status(status)) => self.on_status(room_id, status),
                Ok(RealtimeEvent::Table(change)) => self.apply_change(change),
                Ok(RealtimeEvent::Broadcast(message)) => self.apply_broadcast(message),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target = LOG_TARGET, room_id = %room_id, skipped, "game events lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!(target = LOG_TARGET, room_id = %room_id, "game pump stopped");
    }

    fn on_status(&self, room_id: RoomId, status: ChannelStatus) {
        match status {
            ChannelStatus::Subscribed => {
                {
                    let mut state = self.state.write();
                    state.connected = true;
                    state.connection_error = None;
                }
                self.start_poller(room_id);
                info!(target = LOG_TARGET, room_id = %room_id, "game channel subscribed");
            }
            ChannelStatus::ChannelError(reason) => {
                warn!(target = LOG_TARGET, room_id = %room_id, %reason, "game channel error");
                let mut state = self.state.write();
                state.connected = false;
                state.error = Some(format!("realtime connection error: {reason}"));
                state.connection_error = Some(reason);
            }
            ChannelStatus::TimedOut => {
                warn!(target = LOG_TARGET, room_id = %room_id, "game channel timed out");
                let mut state = self.state.write();
                let reason = "realtime subscription timed out".to_owned();
                state.connected = false;
                state.error = Some(reason.clone());
                state.connection_error = Some(reason);
            }
            ChannelStatus::Closed => {
                self.stop_poller(room_id);
                self.state.write().connected = false;
            }
        }
    }

    fn start_poller(&self, room_id: RoomId) {
        let mut channel = self.channel.lock();
        let Some(channel) = channel.as_mut().filter(|c| c.room_id == room_id) else {
            return;
        };
        if channel.poller.is_some() {
            return;
        }
        let stop = channel.stop.child_token();
        spawn_poller(self.clone(), room_id, self.poll_interval, stop.clone());
        channel.poller = Some(stop);
    }

    fn stop_poller(&self, room_id: RoomId) {
        let mut channel = self.channel.lock();
        if let Some(channel) = channel.as_mut().filter(|c| c.room_id == room_id) {
            if let Some(poller) = channel.poller.take() {
                poller.cancel();
            }
        }
    }

    pub fn is_polling(&self) -> bool {
        self.channel
            .lock()
            .as_ref()
            .is_some_and(|channel| channel.poller.is_some())
    }

    /// Folds one row-level delta into the cache. Push and poll share it.
    pub(crate) fn apply_change(&self, change: TableChange) {
        let me = self.player_id();
        let mut state = self.state.write();
        let Some(room_id) = state.room_id else {
            return;
        };
        match change {
            TableChange::GameStates(Change::Delete(key)) => {
                if key == room_id {
                    state.game_state = None;
                    state.turn_in_progress = false;
                }
            }
            TableChange::GameStates(Change::Insert(row) | Change::Update(row)) => {
                if row.room_id != room_id {
                    return;
                }
                let previous = state.game_state.as_ref().map(|s| s.current_player_order);
                let order = row.current_player_order;
                state.game_state = Some(row);
                let my_order = me.and_then(|me| state.my_player_order(me));
                if previous != Some(order) && my_order != Some(order) {
                    state.turn_in_progress = false;
                }
            }
            TableChange::PlayerPigs(change) => {
                if change.row().map_or(true, |row| row.room_id == room_id) {
                    fold(&mut state.pigs, &change);
                }
            }
            TableChange::PlayerHands(change) => {
                let mine = change
                    .row()
                    .map_or(true, |row| row.room_id == room_id && Some(row.player_id) == me);
                if mine {
                    fold(&mut state.hand, &change);
                }
            }
            TableChange::GameDeck(change) => {
                if change.key().0 == room_id {
                    fold(&mut state.deck, &change);
                }
            }
            TableChange::RoomPlayers(change) => {
                if change.row().map_or(true, |row| row.room_id == room_id) {
                    let profiles: Vec<_> = state
                        .members
                        .iter()
                        .map(|m| (m.id, m.profile.clone()))
                        .collect();
                    fold(&mut state.members, &change);
                    for member in state.members.iter_mut().filter(|m| m.profile.is_none()) {
                        member.profile = profiles
                            .iter()
                            .find(|(id, _)| *id == member.id)
                            .and_then(|(_, profile)| profile.clone());
                    }
                    state.members.sort_by_key(|m| m.player_order);
                }
            }
            TableChange::Rooms(_) => {}
        }
    }

    pub(crate) fn apply_broadcast(&self, message: BroadcastMessage) {
        let me = self.player_id();
        let mut state = self.state.write();
        match message {
            BroadcastMessage::GameAction(action) => {
                if Some(action.player_id) == me {
                    return;
                }
                let patches = effects::predict(action.action, action.target_pig_id, &state.pigs);
                apply_patches(&mut state.pigs, &patches);
                let name = state.member_name(action.player_id);
                state.last_action = Some(format!("{name} played {}", action.action));
            }
            BroadcastMessage::GameFinished(finished) => {
                if let Some(game) = state.game_state.as_mut() {
                    game.game_phase = GamePhase::Finished;
                    game.winner_player_id = Some(finished.winner_player_id);
                    game.finished_at = Some(finished.finished_at);
                }
                state.turn_in_progress = false;
                if Some(finished.winner_player_id) != me {
                    state.last_action = Some(format!(
                        "{} won with {} pigs",
                        finished.winner_name,
                        finished.win_condition.as_str()
                    ));
                }
                state.finished = Some(finished);
            }
        }
    }

    /// Fallback for missed pushes: refetches the game row and feeds a
    /// synthetic update through [`GameStore::apply_change`] when the turn
    /// owner differs from the cache.
    pub(crate) async fn poll_once(&self, room_id: RoomId) {
        let fetched = match self.backend.fetch_game_state(room_id).await {
            Ok(fetched) => fetched,
            Err(err) => {
                debug!(target = LOG_TARGET, room_id = %room_id, error = %err, "poll failed");
                return;
            }
        };
        let Some(fetched) = fetched else {
            return;
        };
        let cached = self
            .state
            .read()
            .game_state
            .as_ref()
            .map(|s| s.current_player_order);
        if cached != Some(fetched.current_player_order) {
            debug!(
                target = LOG_TARGET,
                room_id = %room_id,
                cached = ?cached,
                fetched = fetched.current_player_order,
                "poll found a turn change"
            );
            self.apply_change(TableChange::GameStates(Change::Update(fetched)));
        }
    }

    pub fn stop_subscription(&self) {
        if let Some(channel) = self.channel.lock().take() {
            debug!(target = LOG_TARGET, room_id = %channel.room_id, "game subscription stopped");
            channel.shutdown();
        }
        self.state.write().connected = false;
    }

    /// Ends an own turn left half-done, then forgets the room.
    pub async fn safe_cleanup_on_leave(&self) {
        let unfinished = {
            let state = self.state.read();
            self.player_id()
                .is_some_and(|me| state.is_my_turn(me) && state.turn_in_progress)
        };
        if unfinished {
            if let Err(err) = self.leave_turn().await {
                warn!(target = LOG_TARGET, error = %err, "could not end turn on leave");
            }
        }
        self.cleanup();
    }

    async fn leave_turn(&self) -> Result<(), GameError> {
        let me = self.require_me()?;
        let room_id = self.require_room()?;
        if !self.backend.is_player_turn(room_id, me).await? {
            return Err(GameError::NotYourTurn);
        }
        self.advance_turn().await
    }

    pub fn cleanup(&self) {
        self.stop_subscription();
        *self.state.write() = GameSnapshot::default();
    }
}

impl GameChannel {
    fn shutdown(self) {
        if let Some(poller) = self.poller {
            poller.cancel();
        }
        self.stop.cancel();
    }
}
