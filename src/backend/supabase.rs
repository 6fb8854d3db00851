use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use postgrest::{Builder, Postgrest};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::domain::{
    CardType, GameDeck, GameState, PigPatch, PlayerHand, PlayerId, PlayerPig, Room, RoomId,
    RoomPlayer, RowId, TurnOrder,
};

use super::{BackendError, GameBackend, NewRoom, RoomBackend};

const LOG_TARGET: &str = "backend::supabase";
const MEMBER_COLUMNS: &str = "*,profile:player_id(email)";

/// PostgREST-backed store. Requests carry the anon key and, once signed in,
/// the user's access token so row-level security applies.
#[derive(Clone)]
pub struct SupabaseBackend {
    client: Arc<Postgrest>,
    anon_key: String,
    access_token: Arc<RwLock<Option<String>>>,
}

impl SupabaseBackend {
    pub fn new(cfg: &ClientConfig) -> Self {
        let client = Postgrest::new(cfg.rest_url()).insert_header("apikey", &cfg.anon_key);
        Self {
            client: Arc::new(client),
            anon_key: cfg.anon_key.clone(),
            access_token: Arc::new(RwLock::new(None)),
        }
    }

    pub fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write() = token;
    }

    fn bearer(&self) -> String {
        self.access_token
            .read()
            .clone()
            .unwrap_or_else(|| self.anon_key.clone())
    }

    fn table(&self, name: &str) -> Builder {
        self.client.from(name).auth(self.bearer())
    }

    fn rpc(&self, name: &str, params: Value) -> Builder {
        self.client.rpc(name, params.to_string()).auth(self.bearer())
    }

    async fn send(&self, resource: &str, builder: Builder) -> Result<String, BackendError> {
        let response = builder.execute().await.map_err(BackendError::transport)?;
        let status = response.status();
        let body = response.text().await.map_err(BackendError::transport)?;
        if !status.is_success() {
            warn!(
                target = LOG_TARGET,
                resource,
                status = status.as_u16(),
                "request failed"
            );
            return Err(error_from_body(resource, status.as_u16(), &body));
        }
        debug!(target = LOG_TARGET, resource, bytes = body.len(), "request succeeded");
        Ok(body)
    }

    async fn rows<T: DeserializeOwned>(
        &self,
        resource: &str,
        builder: Builder,
    ) -> Result<Vec<T>, BackendError> {
        let body = self.send(resource, builder).await?;
        decode(resource, &body)
    }

    async fn first<T: DeserializeOwned>(
        &self,
        resource: &str,
        builder: Builder,
    ) -> Result<Option<T>, BackendError> {
        Ok(self.rows(resource, builder).await?.into_iter().next())
    }
}

fn decode<T: DeserializeOwned>(resource: &str, body: &str) -> Result<T, BackendError> {
    serde_json::from_str(body).map_err(|err| BackendError::decode(resource, err))
}

/// PostgREST error bodies carry `code` and `message`; unique violations map
/// to [`BackendError::Conflict`] and raised exceptions to `Rejected`.
fn error_from_body(resource: &str, status: u16, body: &str) -> BackendError {
    let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let message = parsed
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or(body)
        .to_string();
    match parsed.get("code").and_then(Value::as_str) {
        Some("23505") => BackendError::Conflict(message),
        Some("P0001") => BackendError::Rejected(message),
        Some("PGRST116") => BackendError::NotFound(resource.to_string()),
        _ => BackendError::Status {
            resource: resource.to_string(),
            status,
            message,
        },
    }
}

#[async_trait]
impl RoomBackend for SupabaseBackend {
    async fn list_rooms(&self) -> Result<Vec<Room>, BackendError> {
        let query = self.table("rooms").select("*").order("created_at.desc");
        self.rows("rooms", query).await
    }

    async fn fetch_room(&self, room_id: RoomId) -> Result<Room, BackendError> {
        let query = self.table("rooms").select("*").eq("id", room_id.to_string());
        self.first("rooms", query)
            .await?
            .ok_or_else(|| BackendError::not_found(format!("room {room_id}")))
    }

    async fn create_room(&self, room: NewRoom) -> Result<Room, BackendError> {
        let body = serde_json::to_string(&room).map_err(|err| BackendError::decode("rooms", err))?;
        let query = self.table("rooms").insert(body);
        self.first("rooms", query)
            .await?
            .ok_or_else(|| BackendError::rejected("room insert returned no row"))
    }

    async fn list_members(&self, room_id: RoomId) -> Result<Vec<RoomPlayer>, BackendError> {
        let query = self
            .table("room_players")
            .select(MEMBER_COLUMNS)
            .eq("room_id", room_id.to_string())
            .order("player_order");
        self.rows("room_players", query).await
    }

    async fn insert_member(
        &self,
        room_id: RoomId,
        player_id: PlayerId,
        player_order: TurnOrder,
    ) -> Result<RoomPlayer, BackendError> {
        let body = json!({
            "room_id": room_id,
            "player_id": player_id,
            "player_order": player_order,
        });
        let query = self.table("room_players").insert(body.to_string());
        self.first("room_players", query)
            .await?
            .ok_or_else(|| BackendError::rejected("membership insert returned no row"))
    }

    async fn delete_member(&self, room_id: RoomId, player_id: PlayerId) -> Result<(), BackendError> {
        let query = self
            .table("room_players")
            .delete()
            .eq("room_id", room_id.to_string())
            .eq("player_id", player_id.to_string());
        self.send("room_players", query).await.map(|_| ())
    }

    async fn set_ready(&self, member_id: RowId, ready: bool) -> Result<(), BackendError> {
        let query = self
            .table("room_players")
            .update(json!({ "is_ready": ready }).to_string())
            .eq("id", member_id.to_string());
        self.send("room_players", query).await.map(|_| ())
    }

    async fn assign_next_turn_order(&self, room_id: RoomId) -> Result<TurnOrder, BackendError> {
        let query = self.rpc(
            "assign_next_turn_order",
            json!({ "room_id_param": room_id }),
        );
        let body = self.send("assign_next_turn_order", query).await?;
        decode("assign_next_turn_order", &body)
    }

    async fn start_game(&self, room_id: RoomId) -> Result<(), BackendError> {
        let query = self.rpc("start_game", json!({ "room_id_param": room_id }));
        self.send("start_game", query).await.map(|_| ())
    }
}

#[async_trait]
impl GameBackend for SupabaseBackend {
    async fn fetch_game_state(&self, room_id: RoomId) -> Result<Option<GameState>, BackendError> {
        let query = self
            .table("game_states")
            .select("*")
            .eq("room_id", room_id.to_string());
        self.first("game_states", query).await
    }

    async fn fetch_pigs(&self, room_id: RoomId) -> Result<Vec<PlayerPig>, BackendError> {
        let query = self
            .table("player_pigs")
            .select("*")
            .eq("room_id", room_id.to_string())
            .order("pig_index");
        self.rows("player_pigs", query).await
    }

    async fn fetch_hand(
        &self,
        room_id: RoomId,
        player_id: PlayerId,
    ) -> Result<Vec<PlayerHand>, BackendError> {
        let query = self
            .table("player_hands")
            .select("*")
            .eq("room_id", room_id.to_string())
            .eq("player_id", player_id.to_string());
        self.rows("player_hands", query).await
    }

    async fn fetch_deck(&self, room_id: RoomId) -> Result<Vec<GameDeck>, BackendError> {
        let query = self
            .table("game_deck")
            .select("*")
            .eq("room_id", room_id.to_string());
        self.rows("game_deck", query).await
    }

    async fn update_pig(&self, patch: &PigPatch) -> Result<(), BackendError> {
        let query = self
            .table("player_pigs")
            .update(patch.to_json().to_string())
            .eq("id", patch.pig_id.to_string());
        self.send("player_pigs", query).await.map(|_| ())
    }

    async fn set_card_count(&self, hand_id: RowId, count: i32) -> Result<(), BackendError> {
        let query = self
            .table("player_hands")
            .update(json!({ "card_count": count }).to_string())
            .eq("id", hand_id.to_string());
        self.send("player_hands", query).await.map(|_| ())
    }

    async fn delete_hand_row(&self, hand_id: RowId) -> Result<(), BackendError> {
        let query = self
            .table("player_hands")
            .delete()
            .eq("id", hand_id.to_string());
        self.send("player_hands", query).await.map(|_| ())
    }

    async fn clear_hand(&self, room_id: RoomId, player_id: PlayerId) -> Result<(), BackendError> {
        let query = self
            .table("player_hands")
            .delete()
            .eq("room_id", room_id.to_string())
            .eq("player_id", player_id.to_string());
        self.send("player_hands", query).await.map(|_| ())
    }

    async fn set_current_turn(
        &self,
        room_id: RoomId,
        order: TurnOrder,
    ) -> Result<(), BackendError> {
        let query = self
            .table("game_states")
            .update(json!({ "current_player_order": order }).to_string())
            .eq("room_id", room_id.to_string());
        self.send("game_states", query).await.map(|_| ())
    }

    async fn finish_game(&self, room_id: RoomId, winner: PlayerId) -> Result<(), BackendError> {
        let body = json!({
            "game_phase": "finished",
            "winner_player_id": winner,
            "finished_at": Utc::now(),
        });
        let query = self
            .table("game_states")
            .update(body.to_string())
            .eq("room_id", room_id.to_string());
        self.send("game_states", query).await.map(|_| ())
    }

    async fn initialize_game(&self, room_id: RoomId) -> Result<(), BackendError> {
        let query = self.rpc("initialize_game", json!({ "room_id_param": room_id }));
        self.send("initialize_game", query).await.map(|_| ())
    }

    async fn draw_card(
        &self,
        room_id: RoomId,
        player_id: PlayerId,
    ) -> Result<Option<CardType>, BackendError> {
        let query = self.rpc(
            "draw_card",
            json!({ "room_id_param": room_id, "player_id_param": player_id }),
        );
        let body = self.send("draw_card", query).await?;
        decode("draw_card", &body)
    }

    async fn is_player_turn(
        &self,
        room_id: RoomId,
        player_id: PlayerId,
    ) -> Result<bool, BackendError> {
        let query = self.rpc(
            "is_player_turn",
            json!({ "room_id_param": room_id, "player_id_param": player_id }),
        );
        let body = self.send("is_player_turn", query).await?;
        decode("is_player_turn", &body)
    }

    async fn check_winner(
        &self,
        room_id: RoomId,
        player_id: PlayerId,
    ) -> Result<bool, BackendError> {
        let query = self.rpc(
            "check_game_winner",
            json!({ "room_id_param": room_id, "player_id_param": player_id }),
        );
        let body = self.send("check_game_winner", query).await?;
        decode("check_game_winner", &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_postgrest_error_codes() {
        let conflict = error_from_body(
            "room_players",
            409,
            r#"{"code":"23505","message":"duplicate key value violates unique constraint"}"#,
        );
        assert!(matches!(conflict, BackendError::Conflict(_)));

        let raised = error_from_body("draw_card", 400, r#"{"code":"P0001","message":"deck empty"}"#);
        assert_eq!(raised, BackendError::Rejected("deck empty".to_string()));

        let other = error_from_body("rooms", 502, "bad gateway");
        assert_eq!(
            other,
            BackendError::Status {
                resource: "rooms".to_string(),
                status: 502,
                message: "bad gateway".to_string(),
            }
        );
    }

    #[test]
    fn decodes_procedure_results() {
        let card: Option<CardType> = decode("draw_card", r#""lightning_rod""#).unwrap();
        assert_eq!(card, Some(CardType::LightningRod));
        let empty: Option<CardType> = decode("draw_card", "null").unwrap();
        assert_eq!(empty, None);
        let turn: bool = decode("is_player_turn", "true").unwrap();
        assert!(turn);
    }

    #[test]
    fn uses_access_token_once_signed_in() {
        let cfg = ClientConfig::new("http://127.0.0.1:54321", "anon").unwrap();
        let backend = SupabaseBackend::new(&cfg);
        assert_eq!(backend.bearer(), "anon");
        backend.set_access_token(Some("jwt".to_string()));
        assert_eq!(backend.bearer(), "jwt");
    }
}
