use std::future::Future;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Backend, NewRoom};
use crate::domain::{PlayerId, Room, RoomId, RoomPlayer, RoomStatus};
use crate::realtime::{fold, ChannelSpec, ChannelStatus, RealtimeEvent, RealtimeHub, TableChange};
use crate::session::Identity;
use crate::tokio_tools::spawn_named_task;

use super::LobbyError;

const LOG_TARGET: &str = "lobby::store";

#[derive(Debug, Clone, Default)]
pub struct LobbySnapshot {
    pub rooms: Vec<Room>,
    pub current_room: Option<Room>,
    /// Ordered by turn order.
    pub members: Vec<RoomPlayer>,
    pub loading: bool,
    pub error: Option<String>,
}

#[derive(Default)]
struct Channels {
    lobby: Option<CancellationToken>,
    room: Option<(RoomId, CancellationToken)>,
}

/// Client-side mirror of the lobby and of the room the player sits in.
#[derive(Clone)]
pub struct LobbyStore {
    backend: Arc<dyn Backend>,
    realtime: Arc<dyn RealtimeHub>,
    identity: watch::Receiver<Option<Identity>>,
    state: Arc<RwLock<LobbySnapshot>>,
    channels: Arc<Mutex<Channels>>,
}

impl LobbyStore {
    pub fn new(
        backend: Arc<dyn Backend>,
        realtime: Arc<dyn RealtimeHub>,
        identity: watch::Receiver<Option<Identity>>,
    ) -> Self {
        Self {
            backend,
            realtime,
            identity,
            state: Arc::new(RwLock::new(LobbySnapshot::default())),
            channels: Arc::new(Mutex::new(Channels::default())),
        }
    }

    pub fn snapshot(&self) -> LobbySnapshot {
        self.state.read().clone()
    }

    fn me(&self) -> Option<PlayerId> {
        self.identity.borrow().as_ref().map(|identity| identity.id)
    }

    fn require_me(&self) -> Result<PlayerId, LobbyError> {
        self.me().ok_or(LobbyError::NotAuthenticated)
    }

    pub fn rooms(&self) -> Vec<Room> {
        self.state.read().rooms.clone()
    }

    pub fn current_room(&self) -> Option<Room> {
        self.state.read().current_room.clone()
    }

    pub fn members(&self) -> Vec<RoomPlayer> {
        self.state.read().members.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.state.read().error.clone()
    }

    /// Waiting rooms with a free seat.
    pub fn available_rooms(&self) -> Vec<Room> {
        self.state
            .read()
            .rooms
            .iter()
            .filter(|room| room.is_joinable())
            .cloned()
            .collect()
    }

    /// Rooms the signed-in player created.
    pub fn my_rooms(&self) -> Vec<Room> {
        let Some(me) = self.me() else {
            return Vec::new();
        };
        self.state
            .read()
            .rooms
            .iter()
            .filter(|room| room.creator_id == me)
            .cloned()
            .collect()
    }

    pub fn is_room_creator(&self) -> bool {
        let me = self.me();
        self.state
            .read()
            .current_room
            .as_ref()
            .is_some_and(|room| Some(room.creator_id) == me)
    }

    pub fn current_member(&self) -> Option<RoomPlayer> {
        let me = self.me()?;
        self.state
            .read()
            .members
            .iter()
            .find(|member| member.player_id == me)
            .cloned()
    }

    pub fn can_start_game(&self) -> bool {
        if !self.is_room_creator() {
            return false;
        }
        let state = self.state.read();
        let waiting = state
            .current_room
            .as_ref()
            .is_some_and(|room| room.status == RoomStatus::Waiting);
        waiting && state.members.len() >= 2 && state.members.iter().all(|m| m.is_ready)
    }

    async fn tracked<T, F>(&self, op: &'static str, fut: F) -> Result<T, LobbyError>
    where
        F: Future<Output = Result<T, LobbyError>>,
    {
        {
            let mut state = self.state.write();
            state.loading = true;
            state.error = None;
        }
        let result = fut.await;
        let mut state = self.state.write();
        state.loading = false;
        if let Err(err) = &result {
            warn!(target = LOG_TARGET, op, error = %err, "lobby operation failed");
            state.error = Some(err.to_string());
        }
        result
    }

    pub async fn fetch_rooms(&self) -> Result<Vec<Room>, LobbyError> {
        self.tracked("fetch_rooms", self.refresh_rooms()).await
    }

    async fn refresh_rooms(&self) -> Result<Vec<Room>, LobbyError> {
        let rooms = self.backend.list_rooms().await?;
        self.state.write().rooms = rooms.clone();
        Ok(rooms)
    }

    /// Creates a room and seats its creator in it.
    pub async fn create_room(
        &self,
        name: &str,
        max_players: i32,
        expansion: bool,
    ) -> Result<Room, LobbyError> {
        self.tracked("create_room", async {
            let me = self.require_me()?;
            let mut request = NewRoom::new(name, me);
            request.max_players = max_players;
            request.is_expansion = expansion;
            let room = self.backend.create_room(request).await?;
            info!(target = LOG_TARGET, room_id = %room.id, "room created");
            self.join(room.id).await?;
            Ok(room)
        })
        .await
    }

    pub async fn join_room(&self, room_id: RoomId) -> Result<(), LobbyError> {
        self.tracked("join_room", self.join(room_id)).await
    }

    async fn join(&self, room_id: RoomId) -> Result<(), LobbyError> {
        let me = self.require_me()?;
        let room = self.backend.fetch_room(room_id).await?;
        let members = self.backend.list_members(room_id).await?;
        if members.iter().any(|member| member.player_id == me) {
            debug!(target = LOG_TARGET, room_id = %room_id, "already a member");
            return self.load(room_id).await;
        }
        if room.status != RoomStatus::Waiting {
            return Err(LobbyError::RoomNotWaiting(room_id));
        }
        if room.is_full() {
            return Err(LobbyError::RoomFull(room_id));
        }
        let order = self.backend.assign_next_turn_order(room_id).await?;
        self.backend.insert_member(room_id, me, order).await?;
        info!(target = LOG_TARGET, room_id = %room_id, player_order = order, "joined room");
        self.load(room_id).await
    }

    pub async fn leave_room(&self, room_id: RoomId) -> Result<(), LobbyError> {
        self.tracked("leave_room", async {
            let me = self.require_me()?;
            self.backend.delete_member(room_id, me).await?;
            let was_current = {
                let mut state = self.state.write();
                let current = state
                    .current_room
                    .as_ref()
                    .is_some_and(|room| room.id == room_id);
                if current {
                    state.current_room = None;
                    state.members.clear();
                }
                current
            };
            if was_current {
                self.stop_room_subscription();
            }
            info!(target = LOG_TARGET, room_id = %room_id, "left room");
            self.refresh_rooms().await?;
            Ok(())
        })
        .await
    }

    pub async fn load_room(&self, room_id: RoomId) -> Result<(), LobbyError> {
        self.tracked("load_room", self.load(room_id)).await
    }

    async fn load(&self, room_id: RoomId) -> Result<(), LobbyError> {
        let room = self.backend.fetch_room(room_id).await?;
        let members = self.backend.list_members(room_id).await?;
        let mut state = self.state.write();
        state.current_room = Some(room);
        state.members = members;
        Ok(())
    }

    pub async fn toggle_ready(&self) -> Result<bool, LobbyError> {
        self.tracked("toggle_ready", async {
            let member = self.current_member().ok_or(LobbyError::NoCurrentRoom)?;
            let ready = !member.is_ready;
            self.backend.set_ready(member.id, ready).await?;
            let mut state = self.state.write();
            if let Some(cached) = state.members.iter_mut().find(|m| m.id == member.id) {
                cached.is_ready = ready;
            }
            Ok(ready)
        })
        .await
    }

    pub async fn start_game(&self) -> Result<RoomId, LobbyError> {
        self.tracked("start_game", async {
            if !self.can_start_game() {
                return Err(LobbyError::CannotStart);
            }
            let room_id = self
                .current_room()
                .map(|room| room.id)
                .ok_or(LobbyError::NoCurrentRoom)?;
            self.backend.start_game(room_id).await?;
            if let Some(room) = self.state.write().current_room.as_mut() {
                room.status = RoomStatus::Playing;
            }
            info!(target = LOG_TARGET, room_id = %room_id, "game started");
            Ok(room_id)
        })
        .await
    }

    /// Keeps the room list current.
    pub async fn subscribe_rooms(&self) -> Result<(), LobbyError> {
        let handle = self.realtime.open(ChannelSpec::lobby()).await?;
        let (events, _, stop) = handle.into_parts();
        if let Some(previous) = self.channels.lock().lobby.replace(stop.clone()) {
            previous.cancel();
        }
        let store = self.clone();
        spawn_named_task("lobby-rooms", async move {
            store.pump(events, stop, None).await;
        });
        Ok(())
    }

    /// Keeps the current room and its roster current.
    pub async fn subscribe_room(&self, room_id: RoomId) -> Result<(), LobbyError> {
        let handle = self.realtime.open(ChannelSpec::room(room_id)).await?;
        let (events, _, stop) = handle.into_parts();
        if let Some((_, previous)) = self.channels.lock().room.replace((room_id, stop.clone())) {
            previous.cancel();
        }
        let store = self.clone();
        spawn_named_task(format!("lobby-room-{room_id}"), async move {
            store.pump(events, stop, Some(room_id)).await;
        });
        Ok(())
    }

    async fn pump(
        &self,
        mut events: broadcast::Receiver<RealtimeEvent>,
        stop: CancellationToken,
        room: Option<RoomId>,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                received = events.recv() => received,
            };
            match event {
                Ok(RealtimeEvent::Table(change)) => self.apply(change, room).await,
                Ok(RealtimeEvent::Status(ChannelStatus::Closed)) => break,
                Ok(RealtimeEvent::Status(status)) => {
                    debug!(target = LOG_TARGET, ?status, ?room, "channel status");
                }
                Ok(RealtimeEvent::Broadcast(_)) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target = LOG_TARGET, skipped, "lobby events lagged; reloading");
                    self.resync(room).await;
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!(target = LOG_TARGET, ?room, "lobby pump stopped");
    }

    async fn apply(&self, change: TableChange, room: Option<RoomId>) {
        match (room, change) {
            (None, TableChange::Rooms(change)) => {
                fold(&mut self.state.write().rooms, &change);
            }
            (None, TableChange::RoomPlayers(_)) => self.resync(None).await,
            (Some(room_id), _) => self.resync(Some(room_id)).await,
            (None, other) => {
                debug!(target = LOG_TARGET, table = other.table().as_str(), "ignored change");
            }
        }
    }

    async fn resync(&self, room: Option<RoomId>) {
        let result = match room {
            Some(room_id) => self.reload_subscribed(room_id).await,
            None => self.refresh_rooms().await.map(|_| ()),
        };
        if let Err(err) = result {
            warn!(target = LOG_TARGET, error = %err, ?room, "lobby resync failed");
        }
    }

    /// Reloads the room unless its subscription was stopped in the meantime.
    async fn reload_subscribed(&self, room_id: RoomId) -> Result<(), LobbyError> {
        let room = self.backend.fetch_room(room_id).await?;
        let members = self.backend.list_members(room_id).await?;
        let channels = self.channels.lock();
        let active = channels
            .room
            .as_ref()
            .is_some_and(|(id, stop)| *id == room_id && !stop.is_cancelled());
        if active {
            let mut state = self.state.write();
            state.current_room = Some(room);
            state.members = members;
        }
        Ok(())
    }

    pub fn stop_room_subscription(&self) {
        if let Some((room_id, stop)) = self.channels.lock().room.take() {
            debug!(target = LOG_TARGET, room_id = %room_id, "room subscription stopped");
            stop.cancel();
        }
    }

    pub fn stop_lobby_subscription(&self) {
        if let Some(stop) = self.channels.lock().lobby.take() {
            stop.cancel();
        }
    }

    /// Stops every channel and forgets cached lobby state.
    pub fn cleanup(&self) {
        self.stop_lobby_subscription();
        self.stop_room_subscription();
        *self.state.write() = LobbySnapshot::default();
    }
}
