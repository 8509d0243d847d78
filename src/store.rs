//! Persistence boundary consumed by the registry and the turn coordinators.
//!
//! Every call is atomic: it either lands completely or returns an error and
//! leaves the stored document untouched. Two adapters ship with the crate, an
//! in-process [`MemoryStore`] and a [`JsonFileStore`] that keeps one versioned
//! JSON document on disk.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::GameError;
use crate::types::{MoveRecord, RoomStatus, Seat, SessionSnapshot, SessionStatus};

const STORE_FILE_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("conflicting write: {0}")]
    Conflict(String),
    #[error("missing record: {0}")]
    Missing(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub code: String,
    pub name: String,
    #[serde(rename = "hostId")]
    pub host_id: String,
    pub capacity: usize,
    pub private: bool,
    #[serde(default)]
    pub secret: Option<String>,
    pub status: RoomStatus,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StoredRoom {
    pub room: RoomRecord,
    pub seats: Vec<Seat>,
    /// Latest session started in this room since it was created.
    pub session_id: Option<String>,
}

impl StoredRoom {
    /// A waiting room whose host holds no seat was left behind by a failed
    /// create and cannot be played.
    pub fn is_orphaned(&self) -> bool {
        !self
            .seats
            .iter()
            .any(|seat| seat.player_id == self.room.host_id)
    }
}

#[async_trait]
pub trait GameStore: Send + Sync {
    async fn create_room(&self, room: &RoomRecord) -> Result<(), StoreError>;
    async fn find_room_by_code(&self, code: &str) -> Result<Option<StoredRoom>, StoreError>;
    async fn record_seat(&self, room_code: &str, seat: &Seat) -> Result<(), StoreError>;
    async fn release_seat(&self, room_code: &str, player_id: &str) -> Result<(), StoreError>;
    /// Deletes a room and its seats. Sessions and moves are kept.
    async fn remove_room(&self, code: &str) -> Result<(), StoreError>;
    async fn create_session(&self, session: &SessionSnapshot) -> Result<(), StoreError>;
    async fn append_move_record(
        &self,
        session_id: &str,
        record: &MoveRecord,
    ) -> Result<(), StoreError>;
    async fn update_session_state(&self, session: &SessionSnapshot) -> Result<(), StoreError>;
    async fn finish_session(&self, session: &SessionSnapshot) -> Result<(), StoreError>;
    async fn find_session(&self, session_id: &str) -> Result<Option<SessionSnapshot>, StoreError>;
    async fn list_moves(&self, session_id: &str) -> Result<Vec<MoveRecord>, StoreError>;
}

/// Shape of the persisted document, shared by both adapters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    version: u8,
    rooms: BTreeMap<String, RoomRecord>,
    seats: BTreeMap<String, Vec<Seat>>,
    sessions: BTreeMap<String, SessionSnapshot>,
    moves: BTreeMap<String, Vec<MoveRecord>>,
}

#[derive(Debug, Deserialize)]
struct StoreDocumentRaw {
    version: u8,
    #[serde(default)]
    rooms: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    seats: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    sessions: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    moves: BTreeMap<String, serde_json::Value>,
}

impl StoreDocument {
    fn empty() -> Self {
        Self {
            version: STORE_FILE_VERSION,
            ..Self::default()
        }
    }

    fn create_room(&mut self, room: &RoomRecord) -> Result<(), StoreError> {
        if let Some(existing) = self.rooms.get(&room.code) {
            if existing.status != RoomStatus::Finished {
                return Err(StoreError::Conflict(format!(
                    "room code {} is still in use",
                    room.code
                )));
            }
        }
        self.rooms.insert(room.code.clone(), room.clone());
        self.seats.insert(room.code.clone(), Vec::new());
        Ok(())
    }

    fn find_room(&self, code: &str) -> Option<StoredRoom> {
        let room = self.rooms.get(code)?.clone();
        let seats = self.seats.get(code).cloned().unwrap_or_default();
        let session_id = self
            .sessions
            .values()
            .filter(|session| session.room_code == code && session.started_at >= room.created_at)
            .max_by_key(|session| session.started_at)
            .map(|session| session.session_id.clone());
        Some(StoredRoom {
            room,
            seats,
            session_id,
        })
    }

    fn remove_room(&mut self, code: &str) {
        self.rooms.remove(code);
        self.seats.remove(code);
    }

    fn record_seat(&mut self, room_code: &str, seat: &Seat) -> Result<(), StoreError> {
        if !self.rooms.contains_key(room_code) {
            return Err(StoreError::Missing(format!("room {room_code}")));
        }
        let seats = self.seats.entry(room_code.to_string()).or_default();
        if seats.iter().any(|existing| existing.player_id == seat.player_id) {
            return Err(StoreError::Conflict(format!(
                "{} already seated in {room_code}",
                seat.player_id
            )));
        }
        seats.push(seat.clone());
        Ok(())
    }

    fn release_seat(&mut self, room_code: &str, player_id: &str) -> Result<(), StoreError> {
        if let Some(seats) = self.seats.get_mut(room_code) {
            seats.retain(|seat| seat.player_id != player_id);
        }
        let empty = self
            .seats
            .get(room_code)
            .map(Vec::is_empty)
            .unwrap_or(true);
        if empty {
            if let Some(room) = self.rooms.get_mut(room_code) {
                room.status = RoomStatus::Finished;
            }
        } else if let Some(room) = self.rooms.get_mut(room_code) {
            if room.host_id == player_id {
                if let Some(next) = self.seats.get(room_code).and_then(|seats| seats.first()) {
                    room.host_id = next.player_id.clone();
                }
            }
        }
        Ok(())
    }

    fn create_session(&mut self, session: &SessionSnapshot) -> Result<(), StoreError> {
        if self.sessions.contains_key(&session.session_id) {
            return Err(StoreError::Conflict(format!(
                "session {} already exists",
                session.session_id
            )));
        }
        let room = self
            .rooms
            .get_mut(&session.room_code)
            .ok_or_else(|| StoreError::Missing(format!("room {}", session.room_code)))?;
        room.status = RoomStatus::Active;
        self.sessions
            .insert(session.session_id.clone(), session.clone());
        self.moves.insert(session.session_id.clone(), Vec::new());
        Ok(())
    }

    fn append_move(&mut self, session_id: &str, record: &MoveRecord) -> Result<(), StoreError> {
        let moves = self
            .moves
            .get_mut(session_id)
            .ok_or_else(|| StoreError::Missing(format!("session {session_id}")))?;
        let expected = moves.len() as u64 + 1;
        // A retry of the last, never-acknowledged move replaces it instead of
        // conflicting, so a half-persisted move cannot wedge the session.
        let unacknowledged = self
            .sessions
            .get(session_id)
            .is_some_and(|session| session.move_count < record.sequence);
        let retry_of_last = unacknowledged
            && record.sequence + 1 == expected
            && moves
                .last()
                .is_some_and(|last| last.player_id == record.player_id);
        if retry_of_last {
            if let Some(last) = moves.last_mut() {
                *last = record.clone();
            }
            return Ok(());
        }
        if record.sequence != expected {
            return Err(StoreError::Conflict(format!(
                "move {} out of sequence for {session_id}, expected {expected}",
                record.sequence
            )));
        }
        moves.push(record.clone());
        Ok(())
    }

    fn update_session(&mut self, session: &SessionSnapshot) -> Result<(), StoreError> {
        let slot = self
            .sessions
            .get_mut(&session.session_id)
            .ok_or_else(|| StoreError::Missing(format!("session {}", session.session_id)))?;
        if slot.status == SessionStatus::Finished {
            return Err(StoreError::Conflict(format!(
                "session {} is already finished",
                session.session_id
            )));
        }
        *slot = session.clone();
        Ok(())
    }

    fn finish_session(&mut self, session: &SessionSnapshot) -> Result<(), StoreError> {
        self.update_session(session)?;
        if let Some(room) = self.rooms.get_mut(&session.room_code) {
            room.status = RoomStatus::Finished;
        }
        Ok(())
    }
}

/// In-process store. Availability and latency can be switched at runtime so
/// callers can exercise their failure paths.
pub struct MemoryStore {
    document: Mutex<StoreDocument>,
    available: AtomicBool,
    latency_ms: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            document: Mutex::new(StoreDocument::empty()),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn gate(&self) -> Result<(), StoreError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl GameStore for MemoryStore {
    async fn create_room(&self, room: &RoomRecord) -> Result<(), StoreError> {
        self.gate().await?;
        self.document.lock().await.create_room(room)
    }

    async fn find_room_by_code(&self, code: &str) -> Result<Option<StoredRoom>, StoreError> {
        self.gate().await?;
        Ok(self.document.lock().await.find_room(code))
    }

    async fn record_seat(&self, room_code: &str, seat: &Seat) -> Result<(), StoreError> {
        self.gate().await?;
        self.document.lock().await.record_seat(room_code, seat)
    }

    async fn release_seat(&self, room_code: &str, player_id: &str) -> Result<(), StoreError> {
        self.gate().await?;
        self.document.lock().await.release_seat(room_code, player_id)
    }

    async fn remove_room(&self, code: &str) -> Result<(), StoreError> {
        self.gate().await?;
        self.document.lock().await.remove_room(code);
        Ok(())
    }

    async fn create_session(&self, session: &SessionSnapshot) -> Result<(), StoreError> {
        self.gate().await?;
        self.document.lock().await.create_session(session)
    }

    async fn append_move_record(
        &self,
        session_id: &str,
        record: &MoveRecord,
    ) -> Result<(), StoreError> {
        self.gate().await?;
        self.document.lock().await.append_move(session_id, record)
    }

    async fn update_session_state(&self, session: &SessionSnapshot) -> Result<(), StoreError> {
        self.gate().await?;
        self.document.lock().await.update_session(session)
    }

    async fn finish_session(&self, session: &SessionSnapshot) -> Result<(), StoreError> {
        self.gate().await?;
        self.document.lock().await.finish_session(session)
    }

    async fn find_session(&self, session_id: &str) -> Result<Option<SessionSnapshot>, StoreError> {
        self.gate().await?;
        Ok(self.document.lock().await.sessions.get(session_id).cloned())
    }

    async fn list_moves(&self, session_id: &str) -> Result<Vec<MoveRecord>, StoreError> {
        self.gate().await?;
        let document = self.document.lock().await;
        Ok(document.moves.get(session_id).cloned().unwrap_or_default())
    }
}

/// Single JSON document on disk. Each write is applied to a copy, flushed to
/// a temp file and renamed over the original before the copy replaces the
/// in-memory document.
pub struct JsonFileStore {
    file_path: PathBuf,
    document: Mutex<StoreDocument>,
}

impl JsonFileStore {
    pub async fn open(file_path: PathBuf) -> Self {
        let document = load_document(&file_path).await;
        Self {
            file_path,
            document: Mutex::new(document),
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    async fn mutate<F>(&self, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut StoreDocument) -> Result<(), StoreError> + Send,
    {
        let mut guard = self.document.lock().await;
        let mut next = guard.clone();
        apply(&mut next)?;
        self.save(&next).await?;
        *guard = next;
        Ok(())
    }

    async fn save(&self, document: &StoreDocument) -> Result<(), StoreError> {
        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let text = serde_json::to_string_pretty(document)?;
        let temp_path = self.file_path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, text).await?;
        tokio::fs::rename(&temp_path, &self.file_path).await?;
        debug!(path = %self.file_path.display(), "store document saved");
        Ok(())
    }
}

#[async_trait]
impl GameStore for JsonFileStore {
    async fn create_room(&self, room: &RoomRecord) -> Result<(), StoreError> {
        self.mutate(|document| document.create_room(room)).await
    }

    async fn find_room_by_code(&self, code: &str) -> Result<Option<StoredRoom>, StoreError> {
        Ok(self.document.lock().await.find_room(code))
    }

    async fn record_seat(&self, room_code: &str, seat: &Seat) -> Result<(), StoreError> {
        self.mutate(|document| document.record_seat(room_code, seat))
            .await
    }

    async fn release_seat(&self, room_code: &str, player_id: &str) -> Result<(), StoreError> {
        self.mutate(|document| document.release_seat(room_code, player_id))
            .await
    }

    async fn remove_room(&self, code: &str) -> Result<(), StoreError> {
        self.mutate(|document| {
            document.remove_room(code);
            Ok(())
        })
        .await
    }

    async fn create_session(&self, session: &SessionSnapshot) -> Result<(), StoreError> {
        self.mutate(|document| document.create_session(session))
            .await
    }

    async fn append_move_record(
        &self,
        session_id: &str,
        record: &MoveRecord,
    ) -> Result<(), StoreError> {
        self.mutate(|document| document.append_move(session_id, record))
            .await
    }

    async fn update_session_state(&self, session: &SessionSnapshot) -> Result<(), StoreError> {
        self.mutate(|document| document.update_session(session))
            .await
    }

    async fn finish_session(&self, session: &SessionSnapshot) -> Result<(), StoreError> {
        self.mutate(|document| document.finish_session(session))
            .await
    }

    async fn find_session(&self, session_id: &str) -> Result<Option<SessionSnapshot>, StoreError> {
        Ok(self.document.lock().await.sessions.get(session_id).cloned())
    }

    async fn list_moves(&self, session_id: &str) -> Result<Vec<MoveRecord>, StoreError> {
        let document = self.document.lock().await;
        Ok(document.moves.get(session_id).cloned().unwrap_or_default())
    }
}

/// Runs one store call under `timeout`, folding failures into
/// [`GameError::StorageUnavailable`].
pub(crate) async fn bounded<T, F>(timeout: Duration, operation: &str, call: F) -> Result<T, GameError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => {
            warn!(operation, %error, "store call failed");
            Err(error.into())
        }
        Err(_) => {
            warn!(operation, timeout_ms = timeout.as_millis() as u64, "store call timed out");
            Err(GameError::storage(format!(
                "{operation} timed out after {}ms",
                timeout.as_millis()
            )))
        }
    }
}

async fn load_document(path: &Path) -> StoreDocument {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(value) => value,
        Err(error) => {
            if error.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), %error, "failed to read store file");
            }
            return StoreDocument::empty();
        }
    };
    let raw = match serde_json::from_str::<StoreDocumentRaw>(&text) {
        Ok(value) if value.version == STORE_FILE_VERSION => value,
        Ok(value) => {
            warn!(
                path = %path.display(),
                version = value.version,
                "unsupported store file version"
            );
            return StoreDocument::empty();
        }
        Err(error) => {
            warn!(path = %path.display(), %error, "failed to parse store file");
            return StoreDocument::empty();
        }
    };

    let mut document = StoreDocument::empty();
    document.rooms = parse_entries(path, "room", raw.rooms);
    document.seats = parse_entries(path, "seats", raw.seats);
    document.sessions = parse_entries(path, "session", raw.sessions);
    document.moves = parse_entries(path, "moves", raw.moves);
    document
        .seats
        .retain(|code, _| document.rooms.contains_key(code));
    document
        .moves
        .retain(|session_id, _| document.sessions.contains_key(session_id));
    document
}

fn parse_entries<T>(
    path: &Path,
    label: &str,
    raw: BTreeMap<String, serde_json::Value>,
) -> BTreeMap<String, T>
where
    T: for<'de> Deserialize<'de>,
{
    let mut parsed = BTreeMap::new();
    for (key, value) in raw {
        match serde_json::from_value::<T>(value) {
            Ok(entry) => {
                parsed.insert(key, entry);
            }
            Err(error) => {
                warn!(path = %path.display(), %key, %error, "skipping malformed {label} entry");
            }
        }
    }
    parsed
}
