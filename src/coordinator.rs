use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::GameError;
use crate::hub::BroadcastHub;
use crate::session::{PlannedMove, SessionState};
use crate::store::{bounded, GameStore};
use crate::types::{MoveRecord, MoveResult, RoomEvent, SessionSnapshot, SessionStatus};

/// Runs once, on the move task, after the winning move is stored and
/// broadcast.
pub type FinishHook = Box<dyn Fn(MoveResult) -> BoxFuture<'static, ()> + Send + Sync>;

/// Serialises every mutation of one session.
///
/// Move requests wait on a fair mutex, so they are applied in arrival order
/// and each one sees the turn index left by the previous. At most one request
/// per seated participant may be in flight or waiting; anything beyond that
/// is turned away with [`GameError::SessionBusy`].
pub struct TurnCoordinator {
    session_id: String,
    room_code: String,
    state: Mutex<SessionState>,
    pending: AtomicUsize,
    queue_limit: usize,
    store: Arc<dyn GameStore>,
    hub: Arc<BroadcastHub>,
    store_timeout: Duration,
    on_finish: Option<FinishHook>,
}

/// Holds one queue slot until the move finishes, even if the submitter is
/// dropped.
struct QueueSlot {
    coordinator: Arc<TurnCoordinator>,
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.coordinator.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TurnCoordinator {
    pub fn new(
        state: SessionState,
        store: Arc<dyn GameStore>,
        hub: Arc<BroadcastHub>,
        store_timeout: Duration,
    ) -> Arc<Self> {
        Self::build(state, store, hub, store_timeout, None)
    }

    pub fn with_finish_hook(
        state: SessionState,
        store: Arc<dyn GameStore>,
        hub: Arc<BroadcastHub>,
        store_timeout: Duration,
        on_finish: FinishHook,
    ) -> Arc<Self> {
        Self::build(state, store, hub, store_timeout, Some(on_finish))
    }

    fn build(
        state: SessionState,
        store: Arc<dyn GameStore>,
        hub: Arc<BroadcastHub>,
        store_timeout: Duration,
        on_finish: Option<FinishHook>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id: state.id().to_string(),
            room_code: state.room_code().to_string(),
            queue_limit: state.participant_count().max(1),
            state: Mutex::new(state),
            pending: AtomicUsize::new(0),
            store,
            hub,
            store_timeout,
            on_finish,
        })
    }

    pub fn room_code(&self) -> &str {
        &self.room_code
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Validates and applies one move.
    ///
    /// The work runs on its own task: once admitted, a move is persisted,
    /// applied, broadcast and, if it wins, handed to the finish hook even if
    /// the caller stops waiting for it.
    pub async fn submit_move(
        self: &Arc<Self>,
        mover_id: &str,
        step: u32,
    ) -> Result<MoveResult, GameError> {
        let slot = self.admit()?;
        let coordinator = Arc::clone(self);
        let mover_id = mover_id.to_string();
        let task = tokio::spawn(async move {
            let _slot = slot;
            coordinator.apply_in_turn(&mover_id, step).await
        });
        task.await.map_err(|error| GameError::Internal {
            detail: format!("move task for {} failed: {error}", self.session_id),
        })?
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.state.lock().await.snapshot()
    }

    pub async fn history(&self) -> Vec<MoveRecord> {
        self.state.lock().await.moves().to_vec()
    }

    fn admit(self: &Arc<Self>) -> Result<QueueSlot, GameError> {
        let previous = self.pending.fetch_add(1, Ordering::SeqCst);
        let slot = QueueSlot {
            coordinator: Arc::clone(self),
        };
        if previous >= self.queue_limit {
            drop(slot);
            warn!(session = %self.session_id, pending = previous, "move queue full");
            return Err(GameError::SessionBusy);
        }
        Ok(slot)
    }

    async fn apply_in_turn(&self, mover_id: &str, step: u32) -> Result<MoveResult, GameError> {
        let mut state = self.state.lock().await;
        let planned = state.plan_move(mover_id, step, Utc::now())?;
        let next = state.preview(&planned);
        self.persist(&planned, &next).await?;

        let result = state.commit(planned)?;
        let delivered = self
            .hub
            .publish(&self.room_code, &RoomEvent::move_made(&result));
        info!(
            session = %self.session_id,
            room = %self.room_code,
            player = mover_id,
            step,
            start = result.record.start_square,
            end = result.record.end_square,
            effect = ?result.record.effect.kind,
            delivered,
            "move applied"
        );
        drop(state);

        if result.status == SessionStatus::Finished {
            if let Some(on_finish) = &self.on_finish {
                on_finish(result.clone()).await;
            }
        }
        Ok(result)
    }

    async fn persist(&self, planned: &PlannedMove, next: &SessionSnapshot) -> Result<(), GameError> {
        bounded(
            self.store_timeout,
            "append_move_record",
            self.store.append_move_record(&self.session_id, &planned.record),
        )
        .await?;
        if planned.won() {
            bounded(
                self.store_timeout,
                "finish_session",
                self.store.finish_session(next),
            )
            .await
        } else {
            bounded(
                self.store_timeout,
                "update_session_state",
                self.store.update_session_state(next),
            )
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::Board;
    use crate::constants::DIE_FACES;
    use crate::hub::OutboundMessage;
    use crate::store::{MemoryStore, RoomRecord};
    use crate::types::RoomStatus;
    use futures_util::FutureExt;
    use tokio::sync::mpsc;

    async fn setup(players: &[&str]) -> (Arc<TurnCoordinator>, Arc<MemoryStore>, Arc<BroadcastHub>) {
        let store = Arc::new(MemoryStore::new());
        let hub = Arc::new(BroadcastHub::new());
        store
            .create_room(&RoomRecord {
                code: "ROOM01".to_string(),
                name: "Test".to_string(),
                host_id: players[0].to_string(),
                capacity: 4,
                private: false,
                secret: None,
                status: RoomStatus::Waiting,
                created_at: Utc::now(),
            })
            .await
            .expect("room stored");
        let state = SessionState::new(
            "session_1".to_string(),
            "ROOM01".to_string(),
            players.iter().map(|id| id.to_string()).collect(),
            Arc::new(Board::standard()),
            0,
            DIE_FACES,
            Utc::now(),
        );
        store
            .create_session(&state.snapshot())
            .await
            .expect("session stored");
        let coordinator = TurnCoordinator::new(
            state,
            store.clone(),
            hub.clone(),
            Duration::from_millis(200),
        );
        (coordinator, store, hub)
    }

    #[tokio::test]
    async fn accepted_move_is_persisted_then_broadcast() {
        let (coordinator, store, hub) = setup(&["p1", "p2"]).await;
        let (tx, mut rx) = mpsc::channel(8);
        hub.connect("ROOM01", 1, tx);

        let result = coordinator.submit_move("p1", 2).await.expect("move accepted");
        assert_eq!(result.record.end_square, 2);
        assert_eq!(result.next_player.as_deref(), Some("p2"));

        let stored = store.list_moves("session_1").await.expect("moves");
        assert_eq!(stored, vec![result.record.clone()]);
        let stored_session = store
            .find_session("session_1")
            .await
            .expect("store read")
            .expect("session stored");
        assert_eq!(stored_session.move_count, 1);
        assert_eq!(stored_session.current_player.as_deref(), Some("p2"));

        let Some(OutboundMessage::Text(payload)) = rx.recv().await else {
            panic!("expected a broadcast");
        };
        let value: serde_json::Value = serde_json::from_str(&payload).expect("json payload");
        assert_eq!(value["type"], "move_made");
        assert_eq!(value["endSquare"], 2);
        assert_eq!(value["nextPlayer"], "p2");
    }

    #[tokio::test]
    async fn storage_failure_leaves_state_and_clients_untouched() {
        let (coordinator, store, hub) = setup(&["p1", "p2"]).await;
        let (tx, mut rx) = mpsc::channel(8);
        hub.connect("ROOM01", 1, tx);
        store.set_available(false);

        let err = coordinator
            .submit_move("p1", 3)
            .await
            .expect_err("storage offline");
        assert_eq!(err.code(), "storage_unavailable");
        let snapshot = coordinator.snapshot().await;
        assert_eq!(snapshot.move_count, 0);
        assert_eq!(snapshot.current_player.as_deref(), Some("p1"));
        assert!(rx.try_recv().is_err());

        store.set_available(true);
        coordinator.submit_move("p1", 3).await.expect("retry succeeds");
        assert_eq!(coordinator.snapshot().await.move_count, 1);
    }

    #[tokio::test]
    async fn slow_store_times_out_as_storage_unavailable() {
        let (coordinator, store, _hub) = setup(&["p1", "p2"]).await;
        store.set_latency(Duration::from_millis(1_000));

        let err = coordinator
            .submit_move("p1", 1)
            .await
            .expect_err("store too slow");
        assert!(matches!(err, GameError::StorageUnavailable { .. }));
        assert_eq!(coordinator.snapshot().await.move_count, 0);
    }

    #[tokio::test]
    async fn out_of_turn_request_is_rejected() {
        let (coordinator, store, _hub) = setup(&["p1", "p2"]).await;
        let err = coordinator.submit_move("p2", 4).await.expect_err("not p2's turn");
        assert_eq!(err.code(), "not_your_turn");
        assert!(store.list_moves("session_1").await.expect("moves").is_empty());
        assert_eq!(coordinator.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_turns_are_applied_one_after_another() {
        let (coordinator, store, _hub) = setup(&["p1", "p2"]).await;
        store.set_latency(Duration::from_millis(20));

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.submit_move("p1", 2).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.submit_move("p2", 3).await })
        };

        let first = first.await.expect("join").expect("p1 applied");
        let second = second.await.expect("join").expect("p2 applied after p1");
        assert_eq!(first.record.sequence, 1);
        assert_eq!(second.record.sequence, 2);
        assert_eq!(second.next_player.as_deref(), Some("p1"));
        assert_eq!(store.list_moves("session_1").await.expect("moves").len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn duplicate_submissions_apply_exactly_once() {
        let (coordinator, _store, _hub) = setup(&["p1", "p2"]).await;

        let attempts: Vec<_> = (0..2)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.submit_move("p1", 2).await })
            })
            .collect();
        let mut accepted = 0;
        let mut rejected = 0;
        for attempt in attempts {
            match attempt.await.expect("join") {
                Ok(_) => accepted += 1,
                Err(GameError::NotYourTurn { .. }) => rejected += 1,
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert_eq!((accepted, rejected), (1, 1));
        assert_eq!(coordinator.snapshot().await.move_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn queue_beyond_participant_count_is_busy() {
        let (coordinator, store, _hub) = setup(&["p1", "p2"]).await;
        store.set_latency(Duration::from_millis(100));

        let in_flight: Vec<_> = ["p1", "p2"]
            .into_iter()
            .map(|player| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.submit_move(player, 1).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = coordinator
            .submit_move("p1", 1)
            .await
            .expect_err("queue is full");
        assert_eq!(err, GameError::SessionBusy);

        for task in in_flight {
            let _ = task.await.expect("join");
        }
        assert_eq!(coordinator.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn finish_hook_runs_after_caller_gives_up() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_room(&RoomRecord {
                code: "ROOM02".to_string(),
                name: "Endgame".to_string(),
                host_id: "p1".to_string(),
                capacity: 2,
                private: false,
                secret: None,
                status: RoomStatus::Waiting,
                created_at: Utc::now(),
            })
            .await
            .expect("room stored");
        let state = SessionState::new(
            "session_2".to_string(),
            "ROOM02".to_string(),
            vec!["p1".to_string(), "p2".to_string()],
            Arc::new(Board::standard()),
            94,
            DIE_FACES,
            Utc::now(),
        );
        store
            .create_session(&state.snapshot())
            .await
            .expect("session stored");

        let (done_tx, mut done_rx) = mpsc::channel(1);
        let hook: FinishHook = Box::new(move |result: MoveResult| {
            let done_tx = done_tx.clone();
            async move {
                let _ = done_tx.send(result).await;
            }
            .boxed()
        });
        let coordinator = TurnCoordinator::with_finish_hook(
            state,
            store.clone(),
            Arc::new(BroadcastHub::new()),
            Duration::from_millis(500),
            hook,
        );
        store.set_latency(Duration::from_millis(30));

        let abandoned =
            tokio::time::timeout(Duration::from_millis(5), coordinator.submit_move("p1", 6)).await;
        assert!(abandoned.is_err());

        let finished = tokio::time::timeout(Duration::from_secs(2), done_rx.recv())
            .await
            .expect("hook ran")
            .expect("hook result");
        assert_eq!(finished.winner_id.as_deref(), Some("p1"));
        assert_eq!(finished.record.end_square, 100);
        assert_eq!(coordinator.snapshot().await.status, SessionStatus::Finished);
    }
}
