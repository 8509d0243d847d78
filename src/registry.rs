//! Rooms, seats and the sessions started from them.
//!
//! Each room sits behind its own async mutex inside a sharded map, so rooms
//! never contend with each other. Storage is written before memory changes:
//! a failed store call leaves the registry exactly as it was.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::FutureExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::board::Board;
use crate::config::EngineConfig;
use crate::constants::{lowest_free_color, MIN_ROOM_CAPACITY, SEAT_PALETTE};
use crate::coordinator::{FinishHook, TurnCoordinator};
use crate::error::GameError;
use crate::hub::BroadcastHub;
use crate::server_utils::{
    normalize_capacity, normalize_room_code, normalize_secret, random_room_code, random_suffix,
    sanitize_name, sanitize_room_name,
};
use crate::session::SessionState;
use crate::store::{bounded, GameStore, RoomRecord, StoreError, StoredRoom};
use crate::types::{
    MoveRecord, MoveResult, RoomEvent, RoomStatus, RoomView, Seat, SessionSnapshot,
    SessionStatus,
};

type CodeGenerator = Box<dyn Fn() -> String + Send + Sync>;
type SharedRoom = Arc<Mutex<Room>>;
type RoomMap = DashMap<String, SharedRoom>;
type SessionMap = DashMap<String, Arc<TurnCoordinator>>;

#[derive(Clone, Debug, Default)]
pub struct CreateRoom {
    pub name: Option<String>,
    pub capacity: Option<i64>,
    pub private: bool,
    pub secret: Option<String>,
}

#[derive(Debug)]
struct Room {
    record: RoomRecord,
    seats: Vec<Seat>,
    session_id: Option<String>,
    closed: bool,
}

impl Room {
    fn view(&self) -> RoomView {
        RoomView {
            code: self.record.code.clone(),
            name: self.record.name.clone(),
            host_id: self.record.host_id.clone(),
            capacity: self.record.capacity,
            private: self.record.private,
            status: self.record.status,
            seats: self.seats.clone(),
            session_id: self.session_id.clone(),
            created_at: self.record.created_at,
        }
    }

    fn is_seated(&self, player_id: &str) -> bool {
        self.seats.iter().any(|seat| seat.player_id == player_id)
    }

    fn advance(&mut self, status: RoomStatus) {
        if status > self.record.status {
            self.record.status = status;
        }
    }

    fn reusable(&self) -> bool {
        self.closed || self.record.status == RoomStatus::Finished
    }
}

impl From<StoredRoom> for Room {
    fn from(stored: StoredRoom) -> Self {
        Self {
            record: stored.room,
            seats: stored.seats,
            session_id: stored.session_id,
            closed: false,
        }
    }
}

/// Live rooms and sessions.
///
/// Memory only holds what can still change: a finished game drops its room
/// and session, and later reads are answered from the store.
pub struct RoomRegistry {
    rooms: Arc<RoomMap>,
    sessions: Arc<SessionMap>,
    board: Arc<Board>,
    store: Arc<dyn GameStore>,
    hub: Arc<BroadcastHub>,
    config: EngineConfig,
    code_generator: CodeGenerator,
    next_session_seq: AtomicU64,
}

impl RoomRegistry {
    pub fn new(
        board: Arc<Board>,
        store: Arc<dyn GameStore>,
        hub: Arc<BroadcastHub>,
        config: EngineConfig,
    ) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            sessions: Arc::new(DashMap::new()),
            board,
            store,
            hub,
            config,
            code_generator: Box::new(random_room_code),
            next_session_seq: AtomicU64::new(1),
        }
    }

    pub fn with_code_generator(
        mut self,
        generator: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        self.code_generator = Box::new(generator);
        self
    }

    pub fn board(&self) -> &Arc<Board> {
        &self.board
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Opens a waiting room with the host already seated.
    pub async fn create_room(
        &self,
        host_id: &str,
        host_name: &str,
        request: CreateRoom,
    ) -> Result<RoomView, GameError> {
        let host_name = sanitize_name(host_name);
        let name = sanitize_room_name(request.name.as_deref(), &host_name);
        let capacity = normalize_capacity(request.capacity);
        let secret = if request.private {
            normalize_secret(request.secret.as_deref())
        } else {
            None
        };
        let attempts = self.config.code_attempts.max(1);

        for attempt in 1..=attempts {
            let code = normalize_room_code(&(self.code_generator)());
            let now = Utc::now();
            let host_seat = Seat {
                player_id: host_id.to_string(),
                name: host_name.clone(),
                color: SEAT_PALETTE[0],
                joined_at: now,
            };
            let room = Room {
                record: RoomRecord {
                    code: code.clone(),
                    name: name.clone(),
                    host_id: host_id.to_string(),
                    capacity,
                    private: request.private,
                    secret: secret.clone(),
                    status: RoomStatus::Waiting,
                    created_at: now,
                },
                seats: vec![host_seat.clone()],
                session_id: None,
                closed: false,
            };

            let Some((slot, mut guard)) = self.reserve(&code, room) else {
                debug!(room = %code, attempt, "room code in use, drawing again");
                continue;
            };

            match self.persist_new_room(&guard.record, &host_seat).await {
                Ok(true) => {
                    info!(room = %code, host = host_id, capacity, private = request.private, "room created");
                    return Ok(guard.view());
                }
                Ok(false) => {
                    guard.closed = true;
                    drop(guard);
                    self.rooms
                        .remove_if(&code, |_, existing| Arc::ptr_eq(existing, &slot));
                    debug!(room = %code, attempt, "room code taken in storage, drawing again");
                }
                Err(error) => {
                    guard.closed = true;
                    drop(guard);
                    self.rooms
                        .remove_if(&code, |_, existing| Arc::ptr_eq(existing, &slot));
                    return Err(error);
                }
            }
        }

        warn!(attempts, "room code space exhausted");
        Err(GameError::CodeSpaceExhausted { attempts })
    }

    pub async fn join_room(
        &self,
        code: &str,
        player_id: &str,
        name: &str,
        secret: Option<&str>,
    ) -> Result<Seat, GameError> {
        let code = normalize_room_code(code);
        let slot = self.lookup(&code).await?;
        let mut room = slot.lock().await;
        if room.closed {
            return Err(GameError::RoomNotFound { code });
        }
        if room.record.status != RoomStatus::Waiting {
            return Err(GameError::RoomNotJoinable);
        }
        if room.is_seated(player_id) {
            return Err(GameError::AlreadySeated);
        }
        if room.record.private {
            if let Some(expected) = room.record.secret.as_deref() {
                if secret.map(str::trim) != Some(expected) {
                    warn!(room = %code, player = player_id, "rejected join with wrong secret");
                    return Err(GameError::InvalidSecret);
                }
            }
        }
        if room.seats.len() >= room.record.capacity {
            return Err(GameError::RoomFull);
        }

        let taken: Vec<_> = room.seats.iter().map(|seat| seat.color).collect();
        let color = lowest_free_color(&taken).ok_or(GameError::RoomFull)?;
        let seat = Seat {
            player_id: player_id.to_string(),
            name: sanitize_name(name),
            color,
            joined_at: Utc::now(),
        };
        bounded(
            self.config.store_timeout,
            "record_seat",
            self.store.record_seat(&code, &seat),
        )
        .await?;

        room.seats.push(seat.clone());
        let delivered = self.hub.publish(
            &code,
            &RoomEvent::PlayerJoined {
                player_id: seat.player_id.clone(),
                color,
            },
        );
        info!(room = %code, player = player_id, color = color.as_str(), delivered, "player joined");
        Ok(seat)
    }

    pub async fn start_game(
        &self,
        code: &str,
        requester_id: &str,
    ) -> Result<SessionSnapshot, GameError> {
        let code = normalize_room_code(code);
        let slot = self.lookup(&code).await?;
        let mut room = slot.lock().await;
        if room.closed {
            return Err(GameError::RoomNotFound { code });
        }
        if room.record.host_id != requester_id {
            return Err(GameError::NotHost);
        }
        if room.record.status != RoomStatus::Waiting {
            return Err(GameError::AlreadyStarted);
        }
        if room.seats.len() < MIN_ROOM_CAPACITY {
            return Err(GameError::NotEnoughPlayers {
                required: MIN_ROOM_CAPACITY,
            });
        }

        let session_id = self.make_session_id();
        let turn_order: Vec<String> = room
            .seats
            .iter()
            .map(|seat| seat.player_id.clone())
            .collect();
        let state = SessionState::new(
            session_id.clone(),
            code.clone(),
            turn_order,
            Arc::clone(&self.board),
            self.config.start_square,
            self.config.die_faces,
            Utc::now(),
        );
        let snapshot = state.snapshot();
        bounded(
            self.config.store_timeout,
            "create_session",
            self.store.create_session(&snapshot),
        )
        .await?;

        room.advance(RoomStatus::Active);
        room.session_id = Some(session_id.clone());
        let coordinator = TurnCoordinator::with_finish_hook(
            state,
            Arc::clone(&self.store),
            Arc::clone(&self.hub),
            self.config.store_timeout,
            self.finish_hook(&code, &slot, &session_id),
        );
        self.sessions.insert(session_id.clone(), coordinator);

        let delivered = self.hub.publish(
            &code,
            &RoomEvent::GameStarted {
                session_id: session_id.clone(),
                turn_order: snapshot.turn_order.clone(),
                positions: snapshot.positions.clone(),
            },
        );
        info!(
            room = %code,
            session = %session_id,
            players = snapshot.turn_order.len(),
            delivered,
            "game started"
        );
        Ok(snapshot)
    }

    pub async fn submit_move(
        &self,
        session_id: &str,
        mover_id: &str,
        step: u32,
    ) -> Result<MoveResult, GameError> {
        if let Some(coordinator) = self.live_session(session_id) {
            return coordinator.submit_move(mover_id, step).await;
        }
        match self.stored_session(session_id).await? {
            Some(stored) if stored.status == SessionStatus::Finished => {
                Err(GameError::GameAlreadyFinished)
            }
            _ => Err(session_not_found(session_id)),
        }
    }

    /// Removes a waiting-room seat. Seats in a started game are kept, so this
    /// is a no-op once the room is active. Returns `None` when the last seat
    /// left and the room was torn down.
    pub async fn leave_room(
        &self,
        code: &str,
        player_id: &str,
    ) -> Result<Option<RoomView>, GameError> {
        let code = normalize_room_code(code);
        let slot = self.lookup(&code).await?;
        let mut room = slot.lock().await;
        if room.closed {
            return Err(GameError::RoomNotFound { code });
        }
        if room.record.status != RoomStatus::Waiting || !room.is_seated(player_id) {
            return Ok(Some(room.view()));
        }

        if room.seats.len() == 1 {
            bounded(
                self.config.store_timeout,
                "remove_room",
                self.store.remove_room(&code),
            )
            .await?;
        } else {
            bounded(
                self.config.store_timeout,
                "release_seat",
                self.store.release_seat(&code, player_id),
            )
            .await?;
        }

        room.seats.retain(|seat| seat.player_id != player_id);
        if room.seats.is_empty() {
            room.closed = true;
            room.advance(RoomStatus::Finished);
            let session_id = room.session_id.take();
            drop(room);
            self.forget(&code, &slot, session_id);
            info!(room = %code, player = player_id, "last player left, room closed");
            return Ok(None);
        }

        if room.record.host_id == player_id {
            if let Some(next_host) = room.seats.first() {
                room.record.host_id = next_host.player_id.clone();
            }
        }
        let host_id = room.record.host_id.clone();
        let delivered = self.hub.publish(
            &code,
            &RoomEvent::PlayerLeft {
                player_id: player_id.to_string(),
                host_id: host_id.clone(),
            },
        );
        info!(room = %code, player = player_id, host = %host_id, delivered, "player left");
        Ok(Some(room.view()))
    }

    /// Deletes the room from memory and storage, drops its session and closes
    /// every client channel of the room. Sessions and moves already stored
    /// are kept.
    ///
    /// If storage cannot be reached the room stays in memory as closed, so it
    /// is not reloaded while the stored copy still says waiting.
    pub async fn teardown(&self, code: &str) -> bool {
        let code = normalize_room_code(code);
        let Ok(slot) = self.lookup(&code).await else {
            return false;
        };
        let mut room = slot.lock().await;
        if room.closed {
            return false;
        }
        room.closed = true;
        let session_id = room.session_id.take();
        let removed = bounded(
            self.config.store_timeout,
            "remove_room",
            self.store.remove_room(&code),
        )
        .await;
        drop(room);

        if let Some(session_id) = session_id {
            self.sessions.remove(&session_id);
        }
        match removed {
            Ok(()) => {
                self.rooms
                    .remove_if(&code, |_, existing| Arc::ptr_eq(existing, &slot));
            }
            Err(error) => {
                warn!(room = %code, %error, "stored room kept, code held closed in memory");
            }
        }
        let closed = self.hub.close_room(&code, "room closed");
        info!(room = %code, connections = closed, "room torn down");
        true
    }

    /// Current view of a room. Rooms that are no longer live are read from
    /// the store.
    pub async fn room(&self, code: &str) -> Result<RoomView, GameError> {
        let code = normalize_room_code(code);
        if let Some(slot) = self.resident(&code) {
            let room = slot.lock().await;
            if room.closed {
                return Err(GameError::RoomNotFound { code });
            }
            return Ok(room.view());
        }
        match self.stored_room(&code).await? {
            Some(stored) if stored.room.status == RoomStatus::Waiting => {
                let slot = self.restore(&code, stored);
                let room = slot.lock().await;
                Ok(room.view())
            }
            Some(stored) => Ok(Room::from(stored).view()),
            None => Err(GameError::RoomNotFound { code }),
        }
    }

    pub async fn session_snapshot(&self, session_id: &str) -> Result<SessionSnapshot, GameError> {
        if let Some(coordinator) = self.live_session(session_id) {
            return Ok(coordinator.snapshot().await);
        }
        self.stored_session(session_id)
            .await?
            .ok_or_else(|| session_not_found(session_id))
    }

    pub async fn session_history(&self, session_id: &str) -> Result<Vec<MoveRecord>, GameError> {
        if let Some(coordinator) = self.live_session(session_id) {
            return Ok(coordinator.history().await);
        }
        if self.stored_session(session_id).await?.is_none() {
            return Err(session_not_found(session_id));
        }
        bounded(
            self.config.store_timeout,
            "list_moves",
            self.store.list_moves(session_id),
        )
        .await
    }

    /// Public rooms still waiting for players, oldest first.
    pub async fn list_open_rooms(&self) -> Vec<RoomView> {
        let slots: Vec<SharedRoom> = self
            .rooms
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut open = Vec::new();
        for slot in slots {
            let room = slot.lock().await;
            if !room.closed && !room.record.private && room.record.status == RoomStatus::Waiting {
                open.push(room.view());
            }
        }
        open.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.code.cmp(&b.code)));
        open
    }

    fn live_session(&self, session_id: &str) -> Option<Arc<TurnCoordinator>> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    async fn stored_session(&self, session_id: &str) -> Result<Option<SessionSnapshot>, GameError> {
        bounded(
            self.config.store_timeout,
            "find_session",
            self.store.find_session(session_id),
        )
        .await
    }

    /// Marks the room finished once its game is won, then drops both the room
    /// and the session from memory. Runs on the move task, so it completes
    /// even when the submitter has gone away.
    fn finish_hook(&self, code: &str, slot: &SharedRoom, session_id: &str) -> FinishHook {
        let rooms: Weak<RoomMap> = Arc::downgrade(&self.rooms);
        let sessions: Weak<SessionMap> = Arc::downgrade(&self.sessions);
        let code = code.to_string();
        let slot = Arc::clone(slot);
        let session_id = session_id.to_string();
        Box::new(move |result: MoveResult| {
            let rooms = rooms.clone();
            let sessions = sessions.clone();
            let code = code.clone();
            let slot = Arc::clone(&slot);
            let session_id = session_id.clone();
            async move {
                {
                    let mut room = slot.lock().await;
                    if room.session_id.as_deref() != Some(session_id.as_str()) {
                        return;
                    }
                    room.advance(RoomStatus::Finished);
                }
                if let Some(rooms) = rooms.upgrade() {
                    rooms.remove_if(&code, |_, existing| Arc::ptr_eq(existing, &slot));
                }
                if let Some(sessions) = sessions.upgrade() {
                    sessions.remove(&session_id);
                }
                info!(
                    room = %code,
                    session = %session_id,
                    winner = ?result.winner_id,
                    moves = result.record.sequence,
                    "game finished"
                );
            }
            .boxed()
        })
    }

    /// Claims `code` for a new room, returning it already locked so no other
    /// caller can see it before it is stored.
    fn reserve(&self, code: &str, room: Room) -> Option<(SharedRoom, OwnedMutexGuard<Room>)> {
        let slot = Arc::new(Mutex::new(room));
        let guard = Arc::clone(&slot).try_lock_owned().ok()?;
        match self.rooms.entry(code.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&slot));
            }
            Entry::Occupied(mut entry) => {
                let stale_session = entry
                    .get()
                    .try_lock()
                    .ok()
                    .filter(|existing| existing.reusable())
                    .map(|existing| existing.session_id.clone())?;
                entry.insert(Arc::clone(&slot));
                if let Some(session_id) = stale_session {
                    self.sessions.remove(&session_id);
                }
            }
        }
        Some((slot, guard))
    }

    /// `Ok(false)` means storage already holds a live room with this code.
    async fn persist_new_room(&self, record: &RoomRecord, host: &Seat) -> Result<bool, GameError> {
        match tokio::time::timeout(self.config.store_timeout, self.store.create_room(record)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(StoreError::Conflict(_))) => return Ok(false),
            Ok(Err(error)) => {
                warn!(room = %record.code, %error, "create_room failed");
                return Err(error.into());
            }
            Err(_) => {
                warn!(room = %record.code, "create_room timed out");
                return Err(GameError::storage("create_room timed out"));
            }
        }

        let seated = bounded(
            self.config.store_timeout,
            "record_seat",
            self.store.record_seat(&record.code, host),
        )
        .await;
        if let Err(error) = seated {
            let removed = bounded(
                self.config.store_timeout,
                "remove_room",
                self.store.remove_room(&record.code),
            )
            .await;
            if let Err(cleanup) = removed {
                warn!(room = %record.code, error = %cleanup, "room stored without its host");
            }
            return Err(error);
        }
        Ok(true)
    }

    fn resident(&self, code: &str) -> Option<SharedRoom> {
        self.rooms.get(code).map(|entry| Arc::clone(entry.value()))
    }

    /// Reads a room from the store. A room whose host holds no seat is
    /// treated as missing.
    async fn stored_room(&self, code: &str) -> Result<Option<StoredRoom>, GameError> {
        let stored = bounded(
            self.config.store_timeout,
            "find_room_by_code",
            self.store.find_room_by_code(code),
        )
        .await?;
        Ok(stored.filter(|stored| !stored.is_orphaned()))
    }

    /// Finds a room in memory, falling back to a waiting room still held by
    /// the store.
    async fn lookup(&self, code: &str) -> Result<SharedRoom, GameError> {
        if let Some(slot) = self.resident(code) {
            return Ok(slot);
        }
        match self.stored_room(code).await? {
            Some(stored) if stored.room.status == RoomStatus::Waiting => {
                Ok(self.restore(code, stored))
            }
            _ => Err(GameError::RoomNotFound {
                code: code.to_string(),
            }),
        }
    }

    fn restore(&self, code: &str, stored: StoredRoom) -> SharedRoom {
        let seats = stored.seats.len();
        let entry = self
            .rooms
            .entry(code.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Room::from(stored))));
        let slot = Arc::clone(entry.value());
        drop(entry);
        info!(room = code, seats, "room restored from storage");
        slot
    }

    fn forget(&self, code: &str, slot: &SharedRoom, session_id: Option<String>) {
        self.rooms
            .remove_if(code, |_, existing| Arc::ptr_eq(existing, slot));
        if let Some(session_id) = session_id {
            self.sessions.remove(&session_id);
        }
        self.hub.close_room(code, "room closed");
    }

    fn make_session_id(&self) -> String {
        let seq = self.next_session_seq.fetch_add(1, Ordering::Relaxed);
        format!("session_{seq}_{}", random_suffix(8))
    }
}

fn session_not_found(session_id: &str) -> GameError {
    GameError::SessionNotFound {
        session_id: session_id.to_string(),
    }
}
