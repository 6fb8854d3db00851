use std::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::{
    CardType, GameDeck, GameState, PlayerHand, PlayerId, PlayerPig, Room, RoomId, RoomPlayer,
    RowId, WinCondition,
};

use super::RealtimeError;

/// Tables mirrored by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Rooms,
    RoomPlayers,
    GameStates,
    PlayerPigs,
    PlayerHands,
    GameDeck,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rooms => "rooms",
            Self::RoomPlayers => "room_players",
            Self::GameStates => "game_states",
            Self::PlayerPigs => "player_pigs",
            Self::PlayerHands => "player_hands",
            Self::GameDeck => "game_deck",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        [
            Self::Rooms,
            Self::RoomPlayers,
            Self::GameStates,
            Self::PlayerPigs,
            Self::PlayerHands,
            Self::GameDeck,
        ]
        .into_iter()
        .find(|table| table.as_str() == raw)
    }
}

/// A typed row with a stable identity used to fold change deltas.
pub trait Row: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Key: Clone + Debug + PartialEq + Send + Sync + 'static;

    const TABLE: Table;

    fn key(&self) -> Self::Key;

    /// Extracts the key from a delete payload, which may only carry the
    /// primary key columns.
    fn key_from_json(old: &Value) -> Option<Self::Key>;
}

fn uuid_field(value: &Value, field: &str) -> Option<Uuid> {
    value.get(field)?.as_str()?.parse().ok()
}

impl Row for Room {
    type Key = RoomId;
    const TABLE: Table = Table::Rooms;

    fn key(&self) -> RoomId {
        self.id
    }

    fn key_from_json(old: &Value) -> Option<RoomId> {
        uuid_field(old, "id")
    }
}

impl Row for RoomPlayer {
    type Key = RowId;
    const TABLE: Table = Table::RoomPlayers;

    fn key(&self) -> RowId {
        self.id
    }

    fn key_from_json(old: &Value) -> Option<RowId> {
        uuid_field(old, "id")
    }
}

impl Row for GameState {
    type Key = RoomId;
    const TABLE: Table = Table::GameStates;

    fn key(&self) -> RoomId {
        self.room_id
    }

    fn key_from_json(old: &Value) -> Option<RoomId> {
        uuid_field(old, "room_id")
    }
}

impl Row for PlayerPig {
    type Key = RowId;
    const TABLE: Table = Table::PlayerPigs;

    fn key(&self) -> RowId {
        self.id
    }

    fn key_from_json(old: &Value) -> Option<RowId> {
        uuid_field(old, "id")
    }
}

impl Row for PlayerHand {
    type Key = RowId;
    const TABLE: Table = Table::PlayerHands;

    fn key(&self) -> RowId {
        self.id
    }

    fn key_from_json(old: &Value) -> Option<RowId> {
        uuid_field(old, "id")
    }
}

impl Row for GameDeck {
    type Key = (RoomId, CardType);
    const TABLE: Table = Table::GameDeck;

    fn key(&self) -> (RoomId, CardType) {
        (self.room_id, self.card_type)
    }

    fn key_from_json(old: &Value) -> Option<(RoomId, CardType)> {
        let room = uuid_field(old, "room_id")?;
        let card = CardType::parse(old.get("card_type")?.as_str()?)?;
        Some((room, card))
    }
}

/// One row-level delta.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<T: Row> {
    Insert(T),
    Update(T),
    Delete(T::Key),
}

impl<T: Row> Change<T> {
    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Insert(_) => ChangeKind::Insert,
            Self::Update(_) => ChangeKind::Update,
            Self::Delete(_) => ChangeKind::Delete,
        }
    }

    pub fn key(&self) -> T::Key {
        match self {
            Self::Insert(row) | Self::Update(row) => row.key(),
            Self::Delete(key) => key.clone(),
        }
    }

    pub fn row(&self) -> Option<&T> {
        match self {
            Self::Insert(row) | Self::Update(row) => Some(row),
            Self::Delete(_) => None,
        }
    }

    fn decode(kind: ChangeKind, record: Option<Value>, old: Option<Value>) -> Result<Self, RealtimeError> {
        match kind {
            ChangeKind::Insert | ChangeKind::Update => {
                let record = record.ok_or_else(|| {
                    RealtimeError::decode(format!("{} change on {} without record", kind.as_str(), T::TABLE.as_str()))
                })?;
                let row: T = serde_json::from_value(record).map_err(|err| {
                    RealtimeError::decode(format!("{} row: {err}", T::TABLE.as_str()))
                })?;
                Ok(match kind {
                    ChangeKind::Insert => Self::Insert(row),
                    _ => Self::Update(row),
                })
            }
            ChangeKind::Delete => {
                let old = old.ok_or_else(|| {
                    RealtimeError::decode(format!("delete on {} without old record", T::TABLE.as_str()))
                })?;
                let key = T::key_from_json(&old).ok_or_else(|| {
                    RealtimeError::decode(format!("delete on {} without primary key", T::TABLE.as_str()))
                })?;
                Ok(Self::Delete(key))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "INSERT" => Some(Self::Insert),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// A change on any mirrored table.
#[derive(Debug, Clone, PartialEq)]
pub enum TableChange {
    Rooms(Change<Room>),
    RoomPlayers(Change<RoomPlayer>),
    GameStates(Change<GameState>),
    PlayerPigs(Change<PlayerPig>),
    PlayerHands(Change<PlayerHand>),
    GameDeck(Change<GameDeck>),
}

macro_rules! impl_from_change {
    ($($row:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<Change<$row>> for TableChange {
                fn from(change: Change<$row>) -> Self {
                    Self::$variant(change)
                }
            }
        )*
    };
}

impl_from_change!(
    Room => Rooms,
    RoomPlayer => RoomPlayers,
    GameState => GameStates,
    PlayerPig => PlayerPigs,
    PlayerHand => PlayerHands,
    GameDeck => GameDeck,
);

impl TableChange {
    pub fn table(&self) -> Table {
        match self {
            Self::Rooms(_) => Table::Rooms,
            Self::RoomPlayers(_) => Table::RoomPlayers,
            Self::GameStates(_) => Table::GameStates,
            Self::PlayerPigs(_) => Table::PlayerPigs,
            Self::PlayerHands(_) => Table::PlayerHands,
            Self::GameDeck(_) => Table::GameDeck,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Rooms(change) => change.kind(),
            Self::RoomPlayers(change) => change.kind(),
            Self::GameStates(change) => change.kind(),
            Self::PlayerPigs(change) => change.kind(),
            Self::PlayerHands(change) => change.kind(),
            Self::GameDeck(change) => change.kind(),
        }
    }

    /// Decodes a `postgres_changes` record pair into a typed change.
    pub fn decode(
        table: Table,
        kind: ChangeKind,
        record: Option<Value>,
        old: Option<Value>,
    ) -> Result<Self, RealtimeError> {
        Ok(match table {
            Table::Rooms => Self::Rooms(Change::decode(kind, record, old)?),
            Table::RoomPlayers => Self::RoomPlayers(Change::decode(kind, record, old)?),
            Table::GameStates => Self::GameStates(Change::decode(kind, record, old)?),
            Table::PlayerPigs => Self::PlayerPigs(Change::decode(kind, record, old)?),
            Table::PlayerHands => Self::PlayerHands(Change::decode(kind, record, old)?),
            Table::GameDeck => Self::GameDeck(Change::decode(kind, record, old)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameActionPayload {
    pub action: CardType,
    pub player_id: PlayerId,
    #[serde(default)]
    pub target_pig_id: Option<RowId>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameFinishedPayload {
    pub winner_player_id: PlayerId,
    pub winner_name: String,
    pub win_condition: WinCondition,
    pub finished_at: DateTime<Utc>,
}

/// Ephemeral peer notification carried on a room channel.
#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastMessage {
    GameAction(GameActionPayload),
    GameFinished(GameFinishedPayload),
}

impl BroadcastMessage {
    pub const GAME_ACTION: &'static str = "game_action";
    pub const GAME_FINISHED: &'static str = "game_finished";

    pub fn event(&self) -> &'static str {
        match self {
            Self::GameAction(_) => Self::GAME_ACTION,
            Self::GameFinished(_) => Self::GAME_FINISHED,
        }
    }

    pub fn payload(&self) -> Result<Value, RealtimeError> {
        let value = match self {
            Self::GameAction(payload) => serde_json::to_value(payload),
            Self::GameFinished(payload) => serde_json::to_value(payload),
        };
        value.map_err(|err| RealtimeError::encode(err.to_string()))
    }

    /// `Ok(None)` for broadcast events this client does not know.
    pub fn decode(event: &str, payload: Value) -> Result<Option<Self>, RealtimeError> {
        let message = match event {
            Self::GAME_ACTION => Self::GameAction(
                serde_json::from_value(payload)
                    .map_err(|err| RealtimeError::decode(format!("game_action: {err}")))?,
            ),
            Self::GAME_FINISHED => Self::GameFinished(
                serde_json::from_value(payload)
                    .map_err(|err| RealtimeError::decode(format!("game_finished: {err}")))?,
            ),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    ChannelError(String),
    TimedOut,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    Table(TableChange),
    Broadcast(BroadcastMessage),
    Status(ChannelStatus),
}

/// `column=eq.value` row filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub column: &'static str,
    pub value: String,
}

impl Filter {
    pub fn eq(column: &'static str, value: impl ToString) -> Self {
        Self {
            column,
            value: value.to_string(),
        }
    }

    pub fn render(&self) -> String {
        format!("{}=eq.{}", self.column, self.value)
    }

    /// Whether the row's column, rendered as text, equals the filter value.
    pub fn matches(&self, row: &Value) -> bool {
        match row.get(self.column) {
            Some(Value::String(s)) => *s == self.value,
            Some(Value::Null) | None => false,
            Some(other) => other.to_string() == self.value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableBinding {
    pub table: Table,
    pub filter: Option<Filter>,
}

impl TableBinding {
    pub fn all(table: Table) -> Self {
        Self {
            table,
            filter: None,
        }
    }

    pub fn filtered(table: Table, filter: Filter) -> Self {
        Self {
            table,
            filter: Some(filter),
        }
    }

    pub fn matches(&self, table: Table, row: &Value) -> bool {
        self.table == table && self.filter.as_ref().map_or(true, |f| f.matches(row))
    }
}

/// Topic plus the table bindings a channel listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub topic: String,
    pub bindings: Vec<TableBinding>,
    /// Deliver this client's own broadcasts back to it.
    pub broadcast_self: bool,
}

impl ChannelSpec {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            bindings: Vec::new(),
            broadcast_self: false,
        }
    }

    pub fn bind(mut self, binding: TableBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Lobby-wide channel: every room and membership change.
    pub fn lobby() -> Self {
        Self::new("public:rooms")
            .bind(TableBinding::all(Table::Rooms))
            .bind(TableBinding::all(Table::RoomPlayers))
    }

    /// Waiting-room channel: the room row and its roster.
    pub fn room(room_id: RoomId) -> Self {
        Self::new(format!("room:{room_id}"))
            .bind(TableBinding::filtered(
                Table::RoomPlayers,
                Filter::eq("room_id", room_id),
            ))
            .bind(TableBinding::filtered(Table::Rooms, Filter::eq("id", room_id)))
    }

    /// In-game channel. Hands are filtered by owner only; the store drops
    /// rows of other rooms on arrival.
    pub fn game(room_id: RoomId, me: PlayerId) -> Self {
        Self::new(format!("game:{room_id}"))
            .bind(TableBinding::filtered(
                Table::GameStates,
                Filter::eq("room_id", room_id),
            ))
            .bind(TableBinding::filtered(
                Table::PlayerPigs,
                Filter::eq("room_id", room_id),
            ))
            .bind(TableBinding::filtered(
                Table::PlayerHands,
                Filter::eq("player_id", me),
            ))
            .bind(TableBinding::filtered(
                Table::GameDeck,
                Filter::eq("room_id", room_id),
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_pig_update_and_delete() {
        let id = Uuid::new_v4();
        let room = Uuid::new_v4();
        let record = json!({
            "id": id,
            "room_id": room,
            "player_id": Uuid::new_v4(),
            "pig_index": 1,
            "pig_state": "dirty",
            "has_barn": false,
            "barn_locked": false,
            "has_lightning_rod": false,
            "created_at": "2024-05-01T10:00:00Z",
            "updated_at": "2024-05-01T10:00:00Z"
        });
        let change =
            TableChange::decode(Table::PlayerPigs, ChangeKind::Update, Some(record), None).unwrap();
        match change {
            TableChange::PlayerPigs(Change::Update(pig)) => assert!(pig.is_dirty()),
            other => panic!("unexpected change {other:?}"),
        }

        let delete = TableChange::decode(
            Table::PlayerPigs,
            ChangeKind::Delete,
            None,
            Some(json!({ "id": id })),
        )
        .unwrap();
        assert_eq!(delete, TableChange::PlayerPigs(Change::Delete(id)));
    }

    #[test]
    fn delete_without_key_is_a_decode_error() {
        let result = TableChange::decode(Table::PlayerHands, ChangeKind::Delete, None, Some(json!({})));
        assert!(result.is_err());
    }

    #[test]
    fn deck_key_uses_room_and_card() {
        let room = Uuid::new_v4();
        let key = GameDeck::key_from_json(&json!({ "room_id": room, "card_type": "barn" }));
        assert_eq!(key, Some((room, CardType::Barn)));
    }

    #[test]
    fn filters_render_and_match() {
        let room = Uuid::new_v4();
        let filter = Filter::eq("room_id", room);
        assert_eq!(filter.render(), format!("room_id=eq.{room}"));
        assert!(filter.matches(&json!({ "room_id": room.to_string() })));
        assert!(!filter.matches(&json!({ "room_id": Uuid::new_v4() })));
        assert!(Filter::eq("player_order", 2).matches(&json!({ "player_order": 2 })));
    }

    #[test]
    fn unknown_broadcast_event_is_ignored() {
        assert_eq!(BroadcastMessage::decode("cursor", json!({})).unwrap(), None);
        let payload = json!({
            "action": "rain",
            "player_id": Uuid::new_v4(),
            "target_pig_id": null,
            "timestamp": "2024-05-01T10:00:00Z"
        });
        let message = BroadcastMessage::decode("game_action", payload).unwrap();
        assert!(matches!(
            message,
            Some(BroadcastMessage::GameAction(GameActionPayload {
                action: CardType::Rain,
                target_pig_id: None,
                ..
            }))
        ));
    }

    #[test]
    fn finished_payload_keeps_wire_names() {
        let payload = GameFinishedPayload {
            winner_player_id: Uuid::new_v4(),
            winner_name: "ada".into(),
            win_condition: crate::domain::WinCondition::Beautiful,
            finished_at: "2024-05-01T10:00:00Z".parse().unwrap(),
        };
        crate::test_utils::serde::assert_round_trip_json(&payload);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["win_condition"], "beautiful");
        assert_eq!(json["winner_name"], "ada");
    }
}
