use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::board::Board;
use crate::error::GameError;
use crate::resolver::resolve;
use crate::types::{
    EffectKind, MoveRecord, MoveResult, Positions, SessionSnapshot, SessionStatus,
};

/// A validated move that has not been applied yet.
///
/// Produced by [`SessionState::plan_move`] without touching the session, so the
/// caller can make it durable first and only then [`SessionState::commit`] it.
#[derive(Clone, Debug, PartialEq)]
pub struct PlannedMove {
    pub record: MoveRecord,
    pub next_turn_index: usize,
    pub finished: bool,
    base_move_count: u64,
}

impl PlannedMove {
    pub fn won(&self) -> bool {
        self.finished
    }
}

#[derive(Clone, Debug)]
pub struct SessionState {
    id: String,
    room_code: String,
    board: Arc<Board>,
    die_faces: u32,
    turn_order: Vec<String>,
    turn_index: usize,
    positions: Positions,
    move_count: u64,
    winner: Option<String>,
    status: SessionStatus,
    moves: Vec<MoveRecord>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl SessionState {
    pub fn new(
        id: String,
        room_code: String,
        turn_order: Vec<String>,
        board: Arc<Board>,
        start_square: u32,
        die_faces: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let positions = turn_order
            .iter()
            .map(|player_id| (player_id.clone(), start_square))
            .collect();
        Self {
            id,
            room_code,
            board,
            die_faces,
            turn_order,
            turn_index: 0,
            positions,
            move_count: 0,
            winner: None,
            status: SessionStatus::Active,
            moves: Vec::new(),
            started_at: now,
            finished_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn room_code(&self) -> &str {
        &self.room_code
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn turn_index(&self) -> usize {
        self.turn_index
    }

    pub fn turn_order(&self) -> &[String] {
        &self.turn_order
    }

    pub fn participant_count(&self) -> usize {
        self.turn_order.len()
    }

    pub fn move_count(&self) -> u64 {
        self.move_count
    }

    pub fn winner(&self) -> Option<&str> {
        self.winner.as_deref()
    }

    pub fn positions(&self) -> &Positions {
        &self.positions
    }

    pub fn position_of(&self, player_id: &str) -> Option<u32> {
        self.positions.get(player_id).copied()
    }

    pub fn moves(&self) -> &[MoveRecord] {
        &self.moves
    }

    /// Player expected to move next; `None` once the game is over.
    pub fn current_player(&self) -> Option<&str> {
        if self.status == SessionStatus::Finished {
            return None;
        }
        self.turn_order.get(self.turn_index).map(String::as_str)
    }

    pub fn plan_move(
        &self,
        mover_id: &str,
        step: u32,
        now: DateTime<Utc>,
    ) -> Result<PlannedMove, GameError> {
        if self.status == SessionStatus::Finished {
            return Err(GameError::GameAlreadyFinished);
        }
        if self.current_player() != Some(mover_id) {
            return Err(GameError::NotYourTurn {
                player_id: mover_id.to_string(),
            });
        }
        if step == 0 || step > self.die_faces {
            return Err(GameError::InvalidStep { step });
        }

        let start_square = self.position_of(mover_id).ok_or_else(|| GameError::Internal {
            detail: format!("{mover_id} is in the turn order but has no position"),
        })?;
        let resolution = resolve(&self.board, start_square, step)?;
        let effect = resolution.effect();
        let finished = effect.kind == EffectKind::Win;
        let next_turn_index = if finished {
            self.turn_index
        } else {
            (self.turn_index + 1) % self.turn_order.len()
        };

        Ok(PlannedMove {
            record: MoveRecord {
                sequence: self.move_count + 1,
                player_id: mover_id.to_string(),
                step,
                start_square,
                end_square: resolution.final_square,
                effect,
                at: now,
            },
            next_turn_index,
            finished,
            base_move_count: self.move_count,
        })
    }

    /// Applies a move planned against the current state.
    ///
    /// Fails without mutating if another move was committed since planning.
    pub fn commit(&mut self, planned: PlannedMove) -> Result<MoveResult, GameError> {
        if planned.base_move_count != self.move_count || self.status == SessionStatus::Finished {
            return Err(GameError::Internal {
                detail: format!(
                    "stale move plan for session {} (planned at {}, now {})",
                    self.id, planned.base_move_count, self.move_count
                ),
            });
        }

        let record = planned.record;
        self.positions
            .insert(record.player_id.clone(), record.end_square);
        self.move_count += 1;
        self.turn_index = planned.next_turn_index;
        if planned.finished {
            self.winner = Some(record.player_id.clone());
            self.status = SessionStatus::Finished;
            self.finished_at = Some(record.at);
        }
        self.moves.push(record.clone());

        Ok(MoveResult {
            record,
            positions: self.positions.clone(),
            next_player: self.current_player().map(str::to_string),
            winner_id: self.winner.clone(),
            status: self.status,
        })
    }

    pub fn apply_move(
        &mut self,
        mover_id: &str,
        step: u32,
        now: DateTime<Utc>,
    ) -> Result<MoveResult, GameError> {
        let planned = self.plan_move(mover_id, step, now)?;
        self.commit(planned)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            room_code: self.room_code.clone(),
            turn_order: self.turn_order.clone(),
            current_player: self.current_player().map(str::to_string),
            positions: self.positions.clone(),
            move_count: self.move_count,
            winner_id: self.winner.clone(),
            status: self.status,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }

    /// Snapshot as it would look after `planned` is committed, used to persist
    /// the next state before applying it in memory.
    pub fn preview(&self, planned: &PlannedMove) -> SessionSnapshot {
        let mut snapshot = self.snapshot();
        snapshot
            .positions
            .insert(planned.record.player_id.clone(), planned.record.end_square);
        snapshot.move_count = planned.record.sequence;
        if planned.finished {
            snapshot.status = SessionStatus::Finished;
            snapshot.winner_id = Some(planned.record.player_id.clone());
            snapshot.current_player = None;
            snapshot.finished_at = Some(planned.record.at);
        } else {
            snapshot.current_player = self.turn_order.get(planned.next_turn_index).cloned();
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::board::Redirect;
    use crate::constants::DIE_FACES;
    use crate::types::RedirectKind;

    fn make_session(players: &[&str], start_square: u32) -> SessionState {
        SessionState::new(
            "session_1".to_string(),
            "ABC123".to_string(),
            players.iter().map(|id| id.to_string()).collect(),
            Arc::new(Board::standard()),
            start_square,
            DIE_FACES,
            Utc::now(),
        )
    }

    fn place(session: &mut SessionState, player_id: &str, square: u32) {
        session.positions.insert(player_id.to_string(), square);
    }

    #[test]
    fn starts_active_with_everyone_on_start_square() {
        let session = make_session(&["p1", "p2", "p3"], 0);
        assert_eq!(session.status(), SessionStatus::Active);
        assert_eq!(session.turn_index(), 0);
        assert_eq!(session.current_player(), Some("p1"));
        assert!(session.positions().values().all(|square| *square == 0));
        assert_eq!(session.move_count(), 0);
    }

    #[test]
    fn turn_index_tracks_move_count_modulo_players() {
        let mut session = make_session(&["p1", "p2", "p3"], 0);
        let rolls = [2, 3, 5, 6, 2, 3, 5, 6, 2, 3, 5, 6];
        for roll in rolls {
            let mover = session
                .current_player()
                .expect("game still active")
                .to_string();
            session.apply_move(&mover, roll, Utc::now()).expect("move applies");
            if session.status() == SessionStatus::Active {
                assert_eq!(
                    session.turn_index() as u64,
                    session.move_count() % session.participant_count() as u64
                );
            }
        }
        assert_eq!(session.moves().len() as u64, session.move_count());
    }

    #[test]
    fn exact_landing_on_final_square_wins_despite_redirect_there() {
        let mut redirects = BTreeMap::new();
        redirects.insert(
            100,
            Redirect {
                target: 40,
                kind: RedirectKind::Descend,
                name: None,
            },
        );
        let mut session = SessionState::new(
            "session_1".to_string(),
            "ABC123".to_string(),
            vec!["p1".to_string(), "p2".to_string()],
            Arc::new(Board::unchecked(100, redirects)),
            0,
            DIE_FACES,
            Utc::now(),
        );
        place(&mut session, "p1", 94);

        let result = session.apply_move("p1", 6, Utc::now()).expect("move applies");
        assert_eq!(result.record.end_square, 100);
        assert_eq!(result.record.effect.kind, EffectKind::Win);
        assert!(result.record.effect.detail.is_empty());
        assert_eq!(result.status, SessionStatus::Finished);
        assert_eq!(result.winner_id.as_deref(), Some("p1"));
        assert_eq!(result.next_player, None);
        assert_eq!(session.positions()["p1"], 100);
    }

    #[test]
    fn out_of_turn_move_is_rejected_without_side_effects() {
        let mut session = make_session(&["p1", "p2"], 0);
        let before = session.snapshot();
        let err = session
            .apply_move("p2", 3, Utc::now())
            .expect_err("p2 moves out of turn");
        assert_eq!(
            err,
            GameError::NotYourTurn {
                player_id: "p2".to_string()
            }
        );
        assert_eq!(session.snapshot(), before);
        assert!(session.moves().is_empty());

        let err = session
            .apply_move("stranger", 3, Utc::now())
            .expect_err("unknown player rejected");
        assert_eq!(err.code(), "not_your_turn");
    }

    #[test]
    fn illegal_die_value_is_rejected() {
        let mut session = make_session(&["p1", "p2"], 0);
        assert_eq!(
            session.apply_move("p1", 7, Utc::now()),
            Err(GameError::InvalidStep { step: 7 })
        );
        assert_eq!(
            session.apply_move("p1", 0, Utc::now()),
            Err(GameError::InvalidStep { step: 0 })
        );
        assert_eq!(session.current_player(), Some("p1"));
    }

    #[test]
    fn overshooting_final_square_wins_and_freezes_turn() {
        let mut session = make_session(&["p1", "p2"], 0);
        place(&mut session, "p1", 97);

        let result = session.apply_move("p1", 5, Utc::now()).expect("winning move");
        assert_eq!(result.record.end_square, 100);
        assert_eq!(result.record.effect.kind, EffectKind::Win);
        assert_eq!(result.winner_id.as_deref(), Some("p1"));
        assert_eq!(result.next_player, None);
        assert_eq!(result.status, SessionStatus::Finished);
        assert_eq!(session.turn_index(), 0);

        assert_eq!(
            session.apply_move("p2", 1, Utc::now()),
            Err(GameError::GameAlreadyFinished)
        );
        assert_eq!(
            session.apply_move("p1", 1, Utc::now()),
            Err(GameError::GameAlreadyFinished)
        );
    }

    #[test]
    fn descend_scenario_records_redirect_detail() {
        let mut redirects = BTreeMap::new();
        redirects.insert(
            98,
            Redirect {
                target: 78,
                kind: RedirectKind::Descend,
                name: None,
            },
        );
        let board = Board::new(100, 10, redirects).expect("board valid");
        let mut session = SessionState::new(
            "session_2".to_string(),
            "ROOM01".to_string(),
            vec!["p1".to_string(), "p2".to_string()],
            Arc::new(board),
            1,
            DIE_FACES,
            Utc::now(),
        );
        place(&mut session, "p1", 95);

        let result = session.apply_move("p1", 3, Utc::now()).expect("move applies");
        assert_eq!(result.record.start_square, 95);
        assert_eq!(result.record.end_square, 78);
        assert_eq!(result.record.effect.kind, EffectKind::Descend);
        assert_eq!(result.record.effect.detail[0].origin, 98);
        assert_eq!(result.next_player.as_deref(), Some("p2"));
        assert_eq!(session.position_of("p1"), Some(78));
    }

    #[test]
    fn stale_plan_cannot_be_committed() {
        let mut session = make_session(&["p1", "p2"], 0);
        let plan = session.plan_move("p1", 2, Utc::now()).expect("plan");
        session.commit(plan.clone()).expect("first commit");
        assert!(session.commit(plan).is_err());
        assert_eq!(session.move_count(), 1);
    }

    #[test]
    fn preview_matches_committed_snapshot() {
        let mut session = make_session(&["p1", "p2"], 0);
        let plan = session.plan_move("p1", 4, Utc::now()).expect("plan");
        let preview = session.preview(&plan);
        session.commit(plan).expect("commit");
        assert_eq!(preview, session.snapshot());
    }
}
