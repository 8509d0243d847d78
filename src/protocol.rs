use serde::Serialize;
use serde_json::Value;

use crate::error::GameError;
use crate::hub::ConnectionId;
use crate::types::{MoveRecord, SessionSnapshot};

#[derive(Debug, PartialEq)]
pub enum ParsedClientMessage {
    Hello { player_id: String },
    Roll,
    Move { step: u32 },
    Snapshot,
    Ping { t: f64 },
}

/// Replies addressed to a single socket.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        #[serde(rename = "roomCode")]
        room_code: String,
        #[serde(rename = "connectionId")]
        connection_id: ConnectionId,
    },
    Snapshot {
        session: Option<SessionSnapshot>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        moves: Vec<MoveRecord>,
    },
    Error {
        code: String,
        message: String,
    },
    Pong {
        t: f64,
    },
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn rejection(error: &GameError) -> Self {
        Self::error(error.code(), error.to_string())
    }
}

pub fn parse_client_message(raw: &str) -> Option<ParsedClientMessage> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let object = value.as_object()?;
    let message_type = object.get("type")?.as_str()?;

    match message_type {
        "hello" => {
            let player_id = object.get("playerId")?.as_str()?.trim();
            if player_id.is_empty() {
                return None;
            }
            Some(ParsedClientMessage::Hello {
                player_id: player_id.to_string(),
            })
        }
        "roll" => Some(ParsedClientMessage::Roll),
        "move" => {
            let step = object.get("step")?.as_u64()?;
            let step = u32::try_from(step).ok()?;
            Some(ParsedClientMessage::Move { step })
        }
        "snapshot" => Some(ParsedClientMessage::Snapshot),
        "ping" => {
            let t = object.get("t")?.as_f64()?;
            if !t.is_finite() {
                return None;
            }
            Some(ParsedClientMessage::Ping { t })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hello_message() {
        let parsed = parse_client_message(r#"{"type":"hello","playerId":" p1 "}"#)
            .expect("hello message should parse");
        assert_eq!(
            parsed,
            ParsedClientMessage::Hello {
                player_id: "p1".to_string()
            }
        );
    }

    #[test]
    fn parse_hello_rejects_blank_player() {
        assert!(parse_client_message(r#"{"type":"hello","playerId":"  "}"#).is_none());
        assert!(parse_client_message(r#"{"type":"hello"}"#).is_none());
    }

    #[test]
    fn parse_move_requires_unsigned_step() {
        assert_eq!(
            parse_client_message(r#"{"type":"move","step":4}"#),
            Some(ParsedClientMessage::Move { step: 4 })
        );
        assert!(parse_client_message(r#"{"type":"move","step":-1}"#).is_none());
        assert!(parse_client_message(r#"{"type":"move","step":2.5}"#).is_none());
        assert!(parse_client_message(r#"{"type":"move","step":"3"}"#).is_none());
        assert!(parse_client_message(r#"{"type":"move","step":18446744073709551615}"#).is_none());
    }

    #[test]
    fn parse_bare_commands() {
        assert_eq!(
            parse_client_message(r#"{"type":"roll"}"#),
            Some(ParsedClientMessage::Roll)
        );
        assert_eq!(
            parse_client_message(r#"{"type":"snapshot"}"#),
            Some(ParsedClientMessage::Snapshot)
        );
    }

    #[test]
    fn parse_ping_requires_finite_number() {
        let parsed = parse_client_message(r#"{"type":"ping","t":12.5}"#);
        assert_eq!(parsed, Some(ParsedClientMessage::Ping { t: 12.5 }));
        assert!(parse_client_message(r#"{"type":"ping","t":"soon"}"#).is_none());
    }

    #[test]
    fn unknown_or_malformed_messages_are_ignored() {
        assert!(parse_client_message("not json").is_none());
        assert!(parse_client_message(r#"["hello"]"#).is_none());
        assert!(parse_client_message(r#"{"type":"place_ping"}"#).is_none());
    }

    #[test]
    fn rejection_carries_stable_code() {
        let message = ServerMessage::rejection(&GameError::NotYourTurn {
            player_id: "p2".to_string(),
        });
        let value = serde_json::to_value(&message).expect("serialises");
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "not_your_turn");
        assert_eq!(value["message"], "it is not p2's turn");
    }

    #[test]
    fn welcome_uses_camel_case() {
        let value = serde_json::to_value(ServerMessage::Welcome {
            room_code: "AB12CD".to_string(),
            connection_id: 7,
        })
        .expect("serialises");
        assert_eq!(
            value,
            serde_json::json!({"type": "welcome", "roomCode": "AB12CD", "connectionId": 7})
        );
    }
}
