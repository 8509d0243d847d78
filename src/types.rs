use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Player id to square, serialised as a JSON object with stable key order.
pub type Positions = BTreeMap<String, u32>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeatColor {
    Yellow,
    Pink,
    Blue,
    Green,
}

impl SeatColor {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yellow => "yellow",
            Self::Pink => "pink",
            Self::Blue => "blue",
            Self::Green => "green",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectKind {
    Ascend,
    Descend,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    Normal,
    Ascend,
    Descend,
    Win,
}

impl From<RedirectKind> for EffectKind {
    fn from(kind: RedirectKind) -> Self {
        match kind {
            RedirectKind::Ascend => Self::Ascend,
            RedirectKind::Descend => Self::Descend,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectStep {
    pub kind: RedirectKind,
    pub origin: u32,
    pub target: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveEffect {
    pub kind: EffectKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub detail: Vec<RedirectStep>,
}

/// Declaration order is lifecycle order; status only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    Waiting,
    Active,
    Finished,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Finished,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRecord {
    pub sequence: u64,
    #[serde(rename = "playerId")]
    pub player_id: String,
    pub step: u32,
    #[serde(rename = "startSquare")]
    pub start_square: u32,
    #[serde(rename = "endSquare")]
    pub end_square: u32,
    pub effect: MoveEffect,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seat {
    #[serde(rename = "playerId")]
    pub player_id: String,
    pub name: String,
    pub color: SeatColor,
    #[serde(rename = "joinedAt")]
    pub joined_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RoomView {
    pub code: String,
    pub name: String,
    #[serde(rename = "hostId")]
    pub host_id: String,
    pub capacity: usize,
    pub private: bool,
    pub status: RoomStatus,
    pub seats: Vec<Seat>,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "roomCode")]
    pub room_code: String,
    #[serde(rename = "turnOrder")]
    pub turn_order: Vec<String>,
    #[serde(rename = "currentPlayer")]
    pub current_player: Option<String>,
    pub positions: Positions,
    #[serde(rename = "moveCount")]
    pub move_count: u64,
    #[serde(rename = "winnerId")]
    pub winner_id: Option<String>,
    pub status: SessionStatus,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "finishedAt")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MoveResult {
    pub record: MoveRecord,
    pub positions: Positions,
    #[serde(rename = "nextPlayer")]
    pub next_player: Option<String>,
    #[serde(rename = "winnerId")]
    pub winner_id: Option<String>,
    pub status: SessionStatus,
}

/// Fan-out payloads addressed to every connection of a room.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEvent {
    PlayerJoined {
        #[serde(rename = "playerId")]
        player_id: String,
        color: SeatColor,
    },
    PlayerLeft {
        #[serde(rename = "playerId")]
        player_id: String,
        #[serde(rename = "hostId")]
        host_id: String,
    },
    GameStarted {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "turnOrder")]
        turn_order: Vec<String>,
        positions: Positions,
    },
    MoveMade {
        #[serde(rename = "playerId")]
        player_id: String,
        step: u32,
        #[serde(rename = "startSquare")]
        start_square: u32,
        #[serde(rename = "endSquare")]
        end_square: u32,
        effect: MoveEffect,
        positions: Positions,
        #[serde(rename = "nextPlayer")]
        next_player: Option<String>,
        #[serde(rename = "winnerId")]
        winner_id: Option<String>,
        status: SessionStatus,
    },
}

impl RoomEvent {
    pub fn move_made(result: &MoveResult) -> Self {
        Self::MoveMade {
            player_id: result.record.player_id.clone(),
            step: result.record.step,
            start_square: result.record.start_square,
            end_square: result.record.end_square,
            effect: result.record.effect.clone(),
            positions: result.positions.clone(),
            next_player: result.next_player.clone(),
            winner_id: result.winner_id.clone(),
            status: result.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn move_made_serialises_nulls_and_camel_case() {
        let mut positions = Positions::new();
        positions.insert("p1".to_string(), 78);
        let event = RoomEvent::MoveMade {
            player_id: "p1".to_string(),
            step: 3,
            start_square: 95,
            end_square: 78,
            effect: MoveEffect {
                kind: EffectKind::Descend,
                detail: vec![RedirectStep {
                    kind: RedirectKind::Descend,
                    origin: 98,
                    target: 78,
                }],
            },
            positions,
            next_player: Some("p2".to_string()),
            winner_id: None,
            status: SessionStatus::Active,
        };

        let value = serde_json::to_value(&event).expect("event serialises");
        assert_eq!(
            value,
            json!({
                "type": "move_made",
                "playerId": "p1",
                "step": 3,
                "startSquare": 95,
                "endSquare": 78,
                "effect": {
                    "kind": "descend",
                    "detail": [{"kind": "descend", "origin": 98, "target": 78}]
                },
                "positions": {"p1": 78},
                "nextPlayer": "p2",
                "winnerId": null,
                "status": "active"
            })
        );
    }

    #[test]
    fn normal_effect_omits_detail() {
        let effect = MoveEffect {
            kind: EffectKind::Normal,
            detail: Vec::new(),
        };
        assert_eq!(
            serde_json::to_value(&effect).expect("effect serialises"),
            json!({"kind": "normal"})
        );
    }

    #[test]
    fn room_status_orders_by_lifecycle() {
        assert!(RoomStatus::Waiting < RoomStatus::Active);
        assert!(RoomStatus::Active < RoomStatus::Finished);
    }
}
