use thiserror::Error;

/// Every rejection the engine can hand back to a client.
///
/// Validation always runs before mutation, so none of these leave a room or
/// session half-updated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GameError {
    #[error("it is not {player_id}'s turn")]
    NotYourTurn { player_id: String },
    #[error("game has already finished")]
    GameAlreadyFinished,
    #[error("session has too many pending moves")]
    SessionBusy,
    #[error("invalid board configuration: {detail}")]
    BoardConfiguration { detail: String },
    #[error("step {step} is not a legal die roll")]
    InvalidStep { step: u32 },
    #[error("room {code} not found")]
    RoomNotFound { code: String },
    #[error("session {session_id} not found")]
    SessionNotFound { session_id: String },
    #[error("room is not accepting players")]
    RoomNotJoinable,
    #[error("room is full")]
    RoomFull,
    #[error("invalid room secret")]
    InvalidSecret,
    #[error("player is already seated in this room")]
    AlreadySeated,
    #[error("only the host can start the game")]
    NotHost,
    #[error("need at least {required} players to start")]
    NotEnoughPlayers { required: usize },
    #[error("game has already started")]
    AlreadyStarted,
    #[error("room code space exhausted after {attempts} attempts")]
    CodeSpaceExhausted { attempts: usize },
    #[error("storage unavailable: {detail}")]
    StorageUnavailable { detail: String },
    #[error("internal error: {detail}")]
    Internal { detail: String },
}

impl GameError {
    pub fn board(detail: impl Into<String>) -> Self {
        Self::BoardConfiguration {
            detail: detail.into(),
        }
    }

    pub fn storage(detail: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            detail: detail.into(),
        }
    }

    /// Stable machine-readable code for structured client rejections.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotYourTurn { .. } => "not_your_turn",
            Self::GameAlreadyFinished => "game_already_finished",
            Self::SessionBusy => "session_busy",
            Self::BoardConfiguration { .. } => "board_configuration_error",
            Self::InvalidStep { .. } => "invalid_step",
            Self::RoomNotFound { .. } => "room_not_found",
            Self::SessionNotFound { .. } => "session_not_found",
            Self::RoomNotJoinable => "room_not_joinable",
            Self::RoomFull => "room_full",
            Self::InvalidSecret => "invalid_secret",
            Self::AlreadySeated => "already_seated",
            Self::NotHost => "not_host",
            Self::NotEnoughPlayers { .. } => "not_enough_players",
            Self::AlreadyStarted => "already_started",
            Self::CodeSpaceExhausted { .. } => "code_space_exhausted",
            Self::StorageUnavailable { .. } => "storage_unavailable",
            Self::Internal { .. } => "internal_error",
        }
    }
}

impl From<crate::store::StoreError> for GameError {
    fn from(error: crate::store::StoreError) -> Self {
        Self::storage(error.to_string())
    }
}
