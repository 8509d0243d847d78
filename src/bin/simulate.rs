use clap::Parser;
use eels_escalators_rust_server::board::Board;
use eels_escalators_rust_server::config::EngineConfig;
use eels_escalators_rust_server::constants::{MAX_ROOM_CAPACITY, MIN_ROOM_CAPACITY};
use eels_escalators_rust_server::error::GameError;
use eels_escalators_rust_server::hub::BroadcastHub;
use eels_escalators_rust_server::logging;
use eels_escalators_rust_server::registry::{CreateRoom, RoomRegistry};
use eels_escalators_rust_server::rng::SeededDice;
use eels_escalators_rust_server::store::MemoryStore;
use eels_escalators_rust_server::types::{EffectKind, SessionSnapshot, SessionStatus};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

const DEFAULT_MAX_MOVES: u64 = 2_000;

#[derive(Parser, Debug)]
#[command(author, version, about = "Seeded self-play games for balance and invariant checks")]
struct Cli {
    #[arg(long)]
    single: bool,
    #[arg(long)]
    players: Option<usize>,
    #[arg(long)]
    games: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    max_moves: Option<u64>,
    #[arg(long)]
    match_id: Option<String>,
    #[arg(long)]
    summary_out: Option<PathBuf>,
}

#[derive(Clone, Debug, Serialize)]
struct Scenario {
    name: String,
    players: usize,
    seed: u32,
}

#[derive(Clone, Debug, Serialize)]
struct ScenarioResultLine {
    scenario: String,
    seed: u32,
    players: usize,
    #[serde(rename = "winnerSeat")]
    winner_seat: Option<usize>,
    moves: u64,
    ascends: u32,
    descends: u32,
    #[serde(rename = "longestChain")]
    longest_chain: usize,
    anomalies: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
struct AnomalyRecord {
    #[serde(rename = "moveIndex")]
    move_index: u64,
    message: String,
}

#[derive(Clone, Debug, Serialize)]
struct ScenarioRunResult {
    #[serde(flatten)]
    result: ScenarioResultLine,
    #[serde(rename = "anomalyRecords")]
    anomaly_records: Vec<AnomalyRecord>,
}

#[derive(Clone, Debug, Serialize)]
struct RunSummary {
    #[serde(rename = "matchId")]
    match_id: String,
    #[serde(rename = "startedAtMs")]
    started_at_ms: u64,
    #[serde(rename = "finishedAtMs")]
    finished_at_ms: u64,
    #[serde(rename = "scenarioCount")]
    scenario_count: usize,
    #[serde(rename = "anomalyCount")]
    anomaly_count: usize,
    #[serde(rename = "averageMoves")]
    average_moves: u64,
    #[serde(rename = "winsBySeat")]
    wins_by_seat: BTreeMap<String, usize>,
    scenarios: Vec<ScenarioResultLine>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    logging::init_json("simulate=info,eels_escalators_rust_server=warn");
    let scenarios = resolve_scenarios(&cli);
    let max_moves = cli.max_moves.unwrap_or(DEFAULT_MAX_MOVES).max(1);
    let run_started_at_ms = now_ms();
    let seed_hint = scenarios.first().map(|scenario| scenario.seed).unwrap_or(0);
    let match_id = cli
        .match_id
        .clone()
        .unwrap_or_else(|| default_match_id(seed_hint, run_started_at_ms));
    let mut has_anomaly = false;
    let mut scenario_results = Vec::new();
    let mut wins_by_seat: BTreeMap<String, usize> = BTreeMap::new();
    let mut total_moves = 0u64;
    let mut total_anomalies = 0usize;

    for scenario in scenarios {
        info!(
            match_id = %match_id,
            scenario = %scenario.name,
            seed = scenario.seed,
            players = scenario.players,
            max_moves,
            "scenario started"
        );
        let scenario_run = match run_scenario(&scenario, max_moves).await {
            Ok(run) => run,
            Err(failure) => {
                error!(
                    match_id = %match_id,
                    scenario = %scenario.name,
                    seed = scenario.seed,
                    code = failure.code(),
                    error = %failure,
                    "scenario failed"
                );
                std::process::exit(2);
            }
        };

        for anomaly in &scenario_run.anomaly_records {
            warn!(
                match_id = %match_id,
                scenario = %scenario.name,
                seed = scenario.seed,
                move_index = anomaly.move_index,
                anomaly = %anomaly.message,
                "anomaly detected"
            );
        }

        if !scenario_run.result.anomalies.is_empty() {
            has_anomaly = true;
        }
        total_anomalies += scenario_run.anomaly_records.len();
        total_moves += scenario_run.result.moves;
        let seat_key = scenario_run
            .result
            .winner_seat
            .map(|seat| format!("seat_{seat}"))
            .unwrap_or_else(|| "none".to_string());
        *wins_by_seat.entry(seat_key).or_insert(0) += 1;

        info!(
            match_id = %match_id,
            scenario = %scenario.name,
            seed = scenario.seed,
            winner_seat = ?scenario_run.result.winner_seat,
            moves = scenario_run.result.moves,
            anomaly_count = scenario_run.anomaly_records.len(),
            "scenario finished"
        );

        match serde_json::to_string(&scenario_run.result) {
            Ok(line) => println!("{line}"),
            Err(failure) => error!(error = %failure, "failed to serialise scenario result"),
        }
        scenario_results.push(scenario_run.result);
    }

    let summary = build_run_summary(
        match_id.clone(),
        run_started_at_ms,
        now_ms(),
        scenario_results,
        wins_by_seat,
        total_anomalies,
        total_moves,
    );

    let mut summary_out_written: Option<String> = None;
    if let Some(path) = cli.summary_out.as_ref() {
        if let Err(failure) = write_summary(path, &summary) {
            error!(
                match_id = %match_id,
                path = %path.display(),
                error = %failure,
                "summary write failed"
            );
            std::process::exit(2);
        }
        summary_out_written = Some(path.to_string_lossy().to_string());
    }

    info!(
        match_id = %match_id,
        scenario_count = summary.scenario_count,
        anomaly_count = summary.anomaly_count,
        average_moves = summary.average_moves,
        wins_by_seat = ?summary.wins_by_seat,
        summary_out = ?summary_out_written,
        "run finished"
    );

    if has_anomaly {
        std::process::exit(1);
    }
}

/// Plays one game through the registry, exactly as clients would.
async fn run_scenario(scenario: &Scenario, max_moves: u64) -> Result<ScenarioRunResult, GameError> {
    let board = Arc::new(Board::standard());
    let registry = RoomRegistry::new(
        Arc::clone(&board),
        Arc::new(MemoryStore::new()),
        Arc::new(BroadcastHub::new()),
        EngineConfig::default(),
    );
    let players: Vec<String> = (1..=scenario.players)
        .map(|idx| format!("bot_{idx}"))
        .collect();
    let room = registry
        .create_room(
            &players[0],
            &players[0],
            CreateRoom {
                name: Some(scenario.name.clone()),
                capacity: Some(scenario.players as i64),
                ..CreateRoom::default()
            },
        )
        .await?;
    for player in &players[1..] {
        registry.join_room(&room.code, player, player, None).await?;
    }
    let started = registry.start_game(&room.code, &players[0]).await?;

    let mut dice = SeededDice::new(scenario.seed, registry.config().die_faces);
    let mut anomalies = Vec::new();
    let mut anomaly_records = Vec::new();
    let mut anomaly_seen = HashSet::new();
    let mut ascends = 0u32;
    let mut descends = 0u32;
    let mut longest_chain = 0usize;
    let mut snapshot = started;

    while snapshot.status == SessionStatus::Active && snapshot.move_count < max_moves {
        for message in collect_snapshot_anomalies(&snapshot, board.length()) {
            push_anomaly(
                &mut anomalies,
                &mut anomaly_records,
                &mut anomaly_seen,
                snapshot.move_count,
                message,
            );
        }
        let Some(mover) = snapshot.current_player.clone() else {
            break;
        };
        let result = registry
            .submit_move(&snapshot.session_id, &mover, dice.roll())
            .await?;
        match result.record.effect.kind {
            EffectKind::Ascend => ascends += 1,
            EffectKind::Descend => descends += 1,
            EffectKind::Normal | EffectKind::Win => {}
        }
        longest_chain = longest_chain.max(result.record.effect.detail.len());
        snapshot = registry.session_snapshot(&snapshot.session_id).await?;
    }

    for message in collect_snapshot_anomalies(&snapshot, board.length()) {
        push_anomaly(
            &mut anomalies,
            &mut anomaly_records,
            &mut anomaly_seen,
            snapshot.move_count,
            message,
        );
    }
    if snapshot.status != SessionStatus::Finished {
        push_anomaly(
            &mut anomalies,
            &mut anomaly_records,
            &mut anomaly_seen,
            snapshot.move_count,
            format!("no winner after {max_moves} moves"),
        );
    }

    let winner_seat = snapshot.winner_id.as_ref().and_then(|winner| {
        snapshot
            .turn_order
            .iter()
            .position(|player| player == winner)
            .map(|idx| idx + 1)
    });
    Ok(ScenarioRunResult {
        result: ScenarioResultLine {
            scenario: scenario.name.clone(),
            seed: scenario.seed,
            players: scenario.players,
            winner_seat,
            moves: snapshot.move_count,
            ascends,
            descends,
            longest_chain,
            anomalies,
        },
        anomaly_records,
    })
}

fn collect_snapshot_anomalies(snapshot: &SessionSnapshot, length: u32) -> Vec<String> {
    let mut anomalies = Vec::new();
    let players = snapshot.turn_order.len();
    if players == 0 {
        anomalies.push("session has no players".to_string());
        return anomalies;
    }

    match snapshot.status {
        SessionStatus::Active => {
            let expected = &snapshot.turn_order[(snapshot.move_count % players as u64) as usize];
            if snapshot.current_player.as_ref() != Some(expected) {
                anomalies.push(format!(
                    "turn drift: expected {expected}, got {:?}",
                    snapshot.current_player
                ));
            }
        }
        SessionStatus::Finished => {
            let winner_square = snapshot
                .winner_id
                .as_ref()
                .and_then(|winner| snapshot.positions.get(winner));
            if winner_square != Some(&length) {
                anomalies.push(format!("winner not on square {length}"));
            }
        }
    }

    for (player, square) in &snapshot.positions {
        if *square > length {
            anomalies.push(format!("{player} is off the board at {square}"));
        }
    }
    anomalies
}

fn resolve_scenarios(cli: &Cli) -> Vec<Scenario> {
    let seed = normalize_seed(cli.seed.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }));

    if cli.single || cli.players.is_some() {
        let players = cli
            .players
            .unwrap_or(MIN_ROOM_CAPACITY)
            .clamp(MIN_ROOM_CAPACITY, MAX_ROOM_CAPACITY);
        return vec![Scenario {
            name: format!("custom-p{players}"),
            players,
            seed,
        }];
    }

    let games = cli.games.unwrap_or(1).max(1);
    let mut scenarios = Vec::new();
    for round in 0..games {
        for players in MIN_ROOM_CAPACITY..=MAX_ROOM_CAPACITY {
            let offset = (round * (MAX_ROOM_CAPACITY + 1) + players) as u64;
            scenarios.push(Scenario {
                name: format!("table-p{players}-r{}", round + 1),
                players,
                seed: normalize_seed(seed as u64 + offset),
            });
        }
    }
    scenarios
}

fn normalize_seed(seed: u64) -> u32 {
    seed as u32
}

fn push_anomaly(
    anomalies: &mut Vec<String>,
    anomaly_records: &mut Vec<AnomalyRecord>,
    anomaly_seen: &mut HashSet<String>,
    move_index: u64,
    message: String,
) {
    anomaly_records.push(AnomalyRecord {
        move_index,
        message: message.clone(),
    });
    if anomaly_seen.insert(message.clone()) {
        anomalies.push(message);
    }
}

fn default_match_id(seed: u32, timestamp_ms: u64) -> String {
    format!("sim-{seed}-{timestamp_ms}")
}

fn build_run_summary(
    match_id: String,
    started_at_ms: u64,
    finished_at_ms: u64,
    scenarios: Vec<ScenarioResultLine>,
    wins_by_seat: BTreeMap<String, usize>,
    anomaly_count: usize,
    total_moves: u64,
) -> RunSummary {
    let scenario_count = scenarios.len();
    let average_moves = if scenario_count == 0 {
        0
    } else {
        total_moves / scenario_count as u64
    };
    RunSummary {
        match_id,
        started_at_ms,
        finished_at_ms,
        scenario_count,
        anomaly_count,
        average_moves,
        wins_by_seat,
        scenarios,
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn write_summary(path: &Path, summary: &RunSummary) -> io::Result<()> {
    let summary_text = serde_json::to_string_pretty(summary).map_err(io::Error::other)?;
    std::fs::write(path, summary_text)
}
