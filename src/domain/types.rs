use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type RoomId = Uuid;
pub type PlayerId = Uuid;
pub type RowId = Uuid;

/// Turn-order rank of a room member. Ranks start at 1.
pub type TurnOrder = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardType {
    Mud,
    Rain,
    Lightning,
    LightningRod,
    Barn,
    BarnLock,
    Bath,
    BeautifulPig,
    Escape,
    LuckyBird,
}

impl CardType {
    pub const ALL: [CardType; 10] = [
        CardType::Mud,
        CardType::Rain,
        CardType::Lightning,
        CardType::LightningRod,
        CardType::Barn,
        CardType::BarnLock,
        CardType::Bath,
        CardType::BeautifulPig,
        CardType::Escape,
        CardType::LuckyBird,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mud => "mud",
            Self::Rain => "rain",
            Self::Lightning => "lightning",
            Self::LightningRod => "lightning_rod",
            Self::Barn => "barn",
            Self::BarnLock => "barn_lock",
            Self::Bath => "bath",
            Self::BeautifulPig => "beautiful_pig",
            Self::Escape => "escape",
            Self::LuckyBird => "lucky_bird",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|card| card.as_str() == raw)
    }
}

impl std::fmt::Display for CardType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PigState {
    #[default]
    Clean,
    Dirty,
    Beautiful,
}

impl PigState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Dirty => "dirty",
            Self::Beautiful => "beautiful",
        }
    }
}

/// `setup → playing → finished`; `finished` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GamePhase {
    #[default]
    Setup,
    Playing,
    Finished,
}

impl GamePhase {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Playing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    #[default]
    Waiting,
    Playing,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub max_players: i32,
    pub current_players: i32,
    pub status: RoomStatus,
    pub creator_id: PlayerId,
    /// Ruleset variant: the expansion adds beautiful_pig, escape and lucky_bird.
    pub is_expansion: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Room {
    pub fn is_full(&self) -> bool {
        self.current_players >= self.max_players
    }

    pub fn is_joinable(&self) -> bool {
        self.status == RoomStatus::Waiting && !self.is_full()
    }
}

/// Membership profile joined from the identity table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemberProfile {
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomPlayer {
    pub id: RowId,
    pub room_id: RoomId,
    pub player_id: PlayerId,
    pub player_order: TurnOrder,
    pub is_ready: bool,
    pub joined_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<MemberProfile>,
}

impl RoomPlayer {
    /// Local part of the member's e-mail, if the profile was joined in.
    pub fn display_name(&self) -> Option<&str> {
        self.profile
            .as_ref()
            .and_then(|p| p.email.as_deref())
            .and_then(|email| email.split('@').next())
            .filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameState {
    pub room_id: RoomId,
    pub current_player_order: TurnOrder,
    pub game_phase: GamePhase,
    #[serde(default)]
    pub winner_player_id: Option<PlayerId>,
    pub deck_remaining: i32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerPig {
    pub id: RowId,
    pub room_id: RoomId,
    pub player_id: PlayerId,
    pub pig_index: i32,
    pub pig_state: PigState,
    /// Shelter.
    pub has_barn: bool,
    /// Only meaningful while `has_barn` is set; see [`PlayerPig::effective_lock`].
    pub barn_locked: bool,
    /// Only meaningful while `has_barn` is set; see [`PlayerPig::effective_rod`].
    pub has_lightning_rod: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PlayerPig {
    pub fn is_clean(&self) -> bool {
        self.pig_state == PigState::Clean
    }

    pub fn is_dirty(&self) -> bool {
        self.pig_state == PigState::Dirty
    }

    pub fn is_beautiful(&self) -> bool {
        self.pig_state == PigState::Beautiful
    }

    /// Barn lock as the rules see it: a stale lock on a pig without a barn is ignored.
    pub fn effective_lock(&self) -> bool {
        self.has_barn && self.barn_locked
    }

    /// Lightning rod as the rules see it: a stale rod on a pig without a barn is ignored.
    pub fn effective_rod(&self) -> bool {
        self.has_barn && self.has_lightning_rod
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerHand {
    pub id: RowId,
    pub room_id: RoomId,
    pub player_id: PlayerId,
    pub card_type: CardType,
    pub card_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameDeck {
    pub room_id: RoomId,
    pub card_type: CardType,
    pub remaining_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn card_type_round_trips_wire_names() {
        for card in CardType::ALL {
            let json = serde_json::to_value(card).unwrap();
            assert_eq!(json, serde_json::json!(card.as_str()));
            assert_eq!(CardType::parse(card.as_str()), Some(card));
        }
        assert_eq!(CardType::parse("joker"), None);
    }

    #[test]
    fn stale_shelter_flags_are_ignored() {
        let now = Utc::now();
        let pig = PlayerPig {
            id: Uuid::new_v4(),
            room_id: Uuid::new_v4(),
            player_id: Uuid::new_v4(),
            pig_index: 0,
            pig_state: PigState::Dirty,
            has_barn: false,
            barn_locked: true,
            has_lightning_rod: true,
            created_at: now,
            updated_at: now,
        };
        assert!(!pig.effective_lock());
        assert!(!pig.effective_rod());
    }

    #[test]
    fn decodes_room_player_with_profile() {
        let raw = serde_json::json!({
            "id": "3f1c1a4e-7a3b-4a55-9b0d-0f8e0b3f2d11",
            "room_id": "b3c0d1a2-0000-4000-8000-000000000001",
            "player_id": "b3c0d1a2-0000-4000-8000-000000000002",
            "player_order": 2,
            "is_ready": true,
            "joined_at": "2024-05-01T10:00:00Z",
            "profile": { "email": "oink@example.com" }
        });
        let member: RoomPlayer = serde_json::from_value(raw).unwrap();
        assert_eq!(member.player_order, 2);
        assert_eq!(member.display_name(), Some("oink"));
    }
}
