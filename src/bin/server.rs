use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use eels_escalators_rust_server::board::Board;
use eels_escalators_rust_server::config::EngineConfig;
use eels_escalators_rust_server::constants::{OUTBOUND_QUEUE_LEN, STORE_TIMEOUT_MS};
use eels_escalators_rust_server::error::GameError;
use eels_escalators_rust_server::hub::{BroadcastHub, ConnectionId, OutboundMessage};
use eels_escalators_rust_server::logging;
use eels_escalators_rust_server::protocol::{parse_client_message, ParsedClientMessage, ServerMessage};
use eels_escalators_rust_server::registry::{CreateRoom, RoomRegistry};
use eels_escalators_rust_server::store::JsonFileStore;
use eels_escalators_rust_server::types::{MoveRecord, MoveResult, RoomView, Seat, SessionSnapshot};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tracing::{debug, error, info, warn};

const PLAYER_HEADER: &str = "x-player-id";

type SharedState = Arc<RoomRegistry>;

#[derive(Parser, Debug)]
#[command(name = "server")]
#[command(about = "Eels & Escalators room and session server")]
struct Args {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// JSON document holding rooms, sessions and move logs
    #[arg(long, env = "DATA_PATH", default_value = ".data/eels.json")]
    data_path: PathBuf,

    /// Built client to serve as fallback (must contain index.html)
    #[arg(long, env = "STATIC_DIR")]
    static_dir: Option<PathBuf>,

    /// Square every player starts on; 0 is off the board
    #[arg(long, env = "START_SQUARE", default_value_t = 0)]
    start_square: u32,

    #[arg(long, env = "STORE_TIMEOUT_MS", default_value_t = STORE_TIMEOUT_MS)]
    store_timeout_ms: u64,
}

#[derive(Debug, Default, Deserialize)]
struct CreateRoomBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    capacity: Option<i64>,
    #[serde(default)]
    private: bool,
    #[serde(default)]
    secret: Option<String>,
    #[serde(default, rename = "playerName")]
    player_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct JoinRoomBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    secret: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MoveBody {
    #[serde(default)]
    step: Option<u32>,
}

#[derive(Debug)]
enum ApiError {
    MissingPlayer,
    Game(GameError),
}

impl From<GameError> for ApiError {
    fn from(error: GameError) -> Self {
        Self::Game(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::MissingPlayer => (
                StatusCode::UNAUTHORIZED,
                "missing_player_id",
                format!("{PLAYER_HEADER} header is required"),
            ),
            Self::Game(error) => (status_for(&error), error.code(), error.to_string()),
        };
        (status, Json(json!({ "code": code, "message": message }))).into_response()
    }
}

fn status_for(error: &GameError) -> StatusCode {
    match error {
        GameError::RoomNotFound { .. } | GameError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
        GameError::InvalidSecret | GameError::NotHost => StatusCode::FORBIDDEN,
        GameError::InvalidStep { .. } | GameError::NotEnoughPlayers { .. } => {
            StatusCode::BAD_REQUEST
        }
        GameError::NotYourTurn { .. }
        | GameError::GameAlreadyFinished
        | GameError::RoomNotJoinable
        | GameError::RoomFull
        | GameError::AlreadySeated
        | GameError::AlreadyStarted => StatusCode::CONFLICT,
        GameError::SessionBusy => StatusCode::TOO_MANY_REQUESTS,
        GameError::StorageUnavailable { .. } | GameError::CodeSpaceExhausted { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        GameError::BoardConfiguration { .. } | GameError::Internal { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init("eels_escalators_rust_server=info,server=info");
    let args = Args::parse();

    let board = Arc::new(Board::standard());
    if args.start_square >= board.length() {
        error!(
            start_square = args.start_square,
            length = board.length(),
            "start square must lie before the final square"
        );
        return Err(GameError::board(format!(
            "start square {} is not before square {}",
            args.start_square,
            board.length()
        ))
        .into());
    }

    let config = EngineConfig::default()
        .with_start_square(args.start_square)
        .with_store_timeout_ms(args.store_timeout_ms);
    let store = Arc::new(JsonFileStore::open(args.data_path.clone()).await);
    info!(path = %store.file_path().display(), "using json store");
    let registry = Arc::new(RoomRegistry::new(
        board,
        store,
        Arc::new(BroadcastHub::new()),
        config,
    ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/api/board", get(board_handler))
        .route("/api/rooms", get(list_rooms).post(create_room))
        .route("/api/rooms/{code}", get(room_handler))
        .route("/api/rooms/{code}/join", post(join_room))
        .route("/api/rooms/{code}/start", post(start_game))
        .route("/api/rooms/{code}/leave", post(leave_room))
        .route("/api/sessions/{id}", get(session_handler))
        .route("/api/sessions/{id}/moves", get(session_moves))
        .route("/api/sessions/{id}/move", post(submit_move))
        .route("/ws/{code}", get(ws_handler))
        .layer(cors)
        .with_state(registry);

    let app = if let Some(static_dir) = resolve_static_dir(args.static_dir) {
        let index_file = static_dir.join("index.html");
        info!(root = %static_dir.display(), "serving static client");
        app.fallback_service(
            ServeDir::new(static_dir).not_found_service(ServeFile::new(index_file)),
        )
    } else {
        warn!("static client not found, serving api only");
        app
    };

    let bind_addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(port = args.port, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn resolve_static_dir(configured: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = configured {
        if path.join("index.html").is_file() {
            return Some(path);
        }
        warn!(path = %path.display(), "configured static dir has no index.html");
    }

    let candidates = [PathBuf::from("dist/client"), PathBuf::from("../../dist/client")];
    candidates
        .into_iter()
        .find(|path| path.join("index.html").is_file())
}

fn player_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(PLAYER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or(ApiError::MissingPlayer)
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

async fn board_handler(State(state): State<SharedState>) -> impl IntoResponse {
    let board = state.board();
    let redirects: Vec<Value> = board
        .redirects()
        .map(|(origin, redirect)| {
            json!({
                "origin": origin,
                "target": redirect.target,
                "kind": redirect.kind,
                "name": redirect.name,
            })
        })
        .collect();
    Json(json!({
        "length": board.length(),
        "columns": board.columns(),
        "dieFaces": state.config().die_faces,
        "redirects": redirects,
    }))
}

async fn list_rooms(State(state): State<SharedState>) -> Json<Vec<RoomView>> {
    Json(state.list_open_rooms().await)
}

async fn create_room(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<CreateRoomBody>,
) -> Result<(StatusCode, Json<RoomView>), ApiError> {
    let host_id = player_id(&headers)?;
    let host_name = body.player_name.clone().unwrap_or_default();
    let room = state
        .create_room(
            &host_id,
            &host_name,
            CreateRoom {
                name: body.name,
                capacity: body.capacity,
                private: body.private,
                secret: body.secret,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(room)))
}

async fn room_handler(
    State(state): State<SharedState>,
    Path(code): Path<String>,
) -> Result<Json<RoomView>, ApiError> {
    Ok(Json(state.room(&code).await?))
}

async fn join_room(
    State(state): State<SharedState>,
    Path(code): Path<String>,
    headers: HeaderMap,
    Json(body): Json<JoinRoomBody>,
) -> Result<Json<Seat>, ApiError> {
    let player = player_id(&headers)?;
    let seat = state
        .join_room(
            &code,
            &player,
            body.name.as_deref().unwrap_or_default(),
            body.secret.as_deref(),
        )
        .await?;
    Ok(Json(seat))
}

async fn start_game(
    State(state): State<SharedState>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let requester = player_id(&headers)?;
    Ok(Json(state.start_game(&code, &requester).await?))
}

async fn leave_room(
    State(state): State<SharedState>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let player = player_id(&headers)?;
    let room = state.leave_room(&code, &player).await?;
    Ok(Json(json!({ "room": room })))
}

async fn session_handler(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    Ok(Json(state.session_snapshot(&session_id).await?))
}

async fn session_moves(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<MoveRecord>>, ApiError> {
    Ok(Json(state.session_history(&session_id).await?))
}

/// Applies a move for the caller. Without an explicit step the server rolls.
async fn submit_move(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<MoveBody>,
) -> Result<Json<MoveResult>, ApiError> {
    let mover = player_id(&headers)?;
    let step = body.step.unwrap_or_else(|| roll_die(&state));
    Ok(Json(state.submit_move(&session_id, &mover, step).await?))
}

fn roll_die(state: &SharedState) -> u32 {
    rand::rng().random_range(1..=state.config().die_faces.max(1))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(code): Path<String>,
    State(state): State<SharedState>,
) -> Result<Response, ApiError> {
    let room = state.room(&code).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(state, room.code, socket)))
}

async fn handle_socket(state: SharedState, room_code: String, socket: WebSocket) {
    let hub = Arc::clone(state.hub());
    let connection_id = hub.next_connection_id();
    let (tx, mut rx) = mpsc::channel::<OutboundMessage>(OUTBOUND_QUEUE_LEN);
    hub.connect(&room_code, connection_id, tx.clone());
    info!(room = %room_code, connection_id, "socket connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let should_close = matches!(outbound, OutboundMessage::Close { .. });
            let result = match outbound {
                OutboundMessage::Text(payload) => {
                    ws_sender.send(Message::Text(payload.into())).await
                }
                OutboundMessage::Close { code, reason } => {
                    let frame = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    ws_sender.send(Message::Close(Some(frame))).await
                }
            };
            if result.is_err() || should_close {
                break;
            }
        }
    });

    hub.send_to(
        &room_code,
        connection_id,
        &ServerMessage::Welcome {
            room_code: room_code.clone(),
            connection_id,
        },
    );

    let mut client = ClientContext {
        room_code: room_code.clone(),
        connection_id,
        player_id: None,
    };
    while let Some(received) = ws_receiver.next().await {
        let Ok(message) = received else {
            break;
        };

        match message {
            Message::Text(raw) => {
                handle_client_message(&state, &mut client, raw.as_str()).await;
            }
            Message::Binary(raw) => {
                if let Ok(text) = String::from_utf8(raw.to_vec()) {
                    handle_client_message(&state, &mut client, &text).await;
                } else {
                    reply(&state, &client, &ServerMessage::error("invalid_message", "invalid utf8 message"));
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    hub.disconnect(&room_code, connection_id);
    info!(room = %room_code, connection_id, player = ?client.player_id, "socket closed");
    drop(tx);
    let _ = writer.await;
}

struct ClientContext {
    room_code: String,
    connection_id: ConnectionId,
    player_id: Option<String>,
}

fn reply(state: &SharedState, client: &ClientContext, message: &ServerMessage) {
    if !state
        .hub()
        .send_to(&client.room_code, client.connection_id, message)
    {
        debug!(room = %client.room_code, connection_id = client.connection_id, "direct reply dropped");
    }
}

async fn handle_client_message(state: &SharedState, client: &mut ClientContext, raw: &str) {
    let Some(message) = parse_client_message(raw) else {
        reply(state, client, &ServerMessage::error("invalid_message", "invalid message"));
        return;
    };

    match message {
        ParsedClientMessage::Hello { player_id } => {
            match state.room(&client.room_code).await {
                Ok(room) if room.seats.iter().any(|seat| seat.player_id == player_id) => {
                    debug!(room = %client.room_code, player = %player_id, "socket bound to player");
                    client.player_id = Some(player_id);
                    let snapshot = snapshot_message(state, &client.room_code).await;
                    reply(state, client, &snapshot);
                }
                Ok(_) => reply(
                    state,
                    client,
                    &ServerMessage::error("not_seated", "player is not seated in this room"),
                ),
                Err(error) => reply(state, client, &ServerMessage::rejection(&error)),
            }
        }
        ParsedClientMessage::Roll => {
            let step = roll_die(state);
            handle_move(state, client, step).await;
        }
        ParsedClientMessage::Move { step } => {
            handle_move(state, client, step).await;
        }
        ParsedClientMessage::Snapshot => {
            let snapshot = snapshot_message(state, &client.room_code).await;
            reply(state, client, &snapshot);
        }
        ParsedClientMessage::Ping { t } => {
            reply(state, client, &ServerMessage::Pong { t });
        }
    }
}

/// The outcome reaches this socket through the room broadcast, so only
/// rejections are answered directly.
async fn handle_move(state: &SharedState, client: &ClientContext, step: u32) {
    let Some(player_id) = client.player_id.as_deref() else {
        reply(state, client, &ServerMessage::error("hello_required", "send hello first"));
        return;
    };
    let session_id = match state.room(&client.room_code).await {
        Ok(RoomView {
            session_id: Some(session_id),
            ..
        }) => session_id,
        Ok(_) => {
            reply(state, client, &ServerMessage::error("no_session", "game has not started"));
            return;
        }
        Err(error) => {
            reply(state, client, &ServerMessage::rejection(&error));
            return;
        }
    };
    if let Err(error) = state.submit_move(&session_id, player_id, step).await {
        debug!(room = %client.room_code, player = player_id, code = error.code(), "move rejected");
        reply(state, client, &ServerMessage::rejection(&error));
    }
}

async fn snapshot_message(state: &SharedState, room_code: &str) -> ServerMessage {
    let session_id = match state.room(room_code).await {
        Ok(room) => room.session_id,
        Err(error) => return ServerMessage::rejection(&error),
    };
    let Some(session_id) = session_id else {
        return ServerMessage::Snapshot {
            session: None,
            moves: Vec::new(),
        };
    };
    match (
        state.session_snapshot(&session_id).await,
        state.session_history(&session_id).await,
    ) {
        (Ok(session), Ok(moves)) => ServerMessage::Snapshot {
            session: Some(session),
            moves,
        },
        (Err(error), _) | (_, Err(error)) => ServerMessage::rejection(&error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_player_header_is_rejected() {
        let headers = HeaderMap::new();
        assert!(matches!(player_id(&headers), Err(ApiError::MissingPlayer)));

        let mut headers = HeaderMap::new();
        headers.insert(PLAYER_HEADER, " p1 ".parse().expect("header value"));
        assert_eq!(player_id(&headers).expect("player id"), "p1");
    }

    #[test]
    fn rejections_map_to_http_statuses() {
        assert_eq!(
            status_for(&GameError::RoomNotFound {
                code: "AB12CD".to_string()
            }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&GameError::NotYourTurn {
                player_id: "p2".to_string()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(status_for(&GameError::SessionBusy), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            status_for(&GameError::storage("offline")),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_for(&GameError::InvalidSecret), StatusCode::FORBIDDEN);
    }

    #[test]
    fn create_room_body_accepts_partial_input() {
        let body: CreateRoomBody =
            serde_json::from_str(r#"{"private":true,"secret":"x"}"#).expect("body parses");
        assert!(body.private);
        assert_eq!(body.capacity, None);
        assert_eq!(body.secret.as_deref(), Some("x"));
    }
}
