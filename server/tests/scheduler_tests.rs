mod common;

use self::common as fixtures;
use fixtures::{MemoryDatabase, RecordingKick, test_config};
use rand::SeedableRng;
use rand::rngs::StdRng;
use server::db::Database;
use server::db::models::{ExecutionMode, MatchStatus, MatchType, Transport};
use server::matchmaking::{run_tick_with_capacity, sweep_stuck_matches};

#[tokio::test]
async fn tick_pairs_agents_up_to_three_per_round() {
    let db = MemoryDatabase::new();
    for i in 0..8 {
        db.add_agent(ExecutionMode::Server, "first", 1500 + i * 10);
    }

    let cfg = test_config();
    let mut rng = StdRng::seed_from_u64(1);
    let created = run_tick_with_capacity(db.as_ref(), 8, &cfg, &mut rng).await.unwrap();
    assert_eq!(created, 3, "a tick emits at most three pairings");

    let matches = db.matches_of_type(MatchType::Matchmaking);
    assert_eq!(matches.len(), 3);
    for m in &matches {
        assert_eq!(m.status, MatchStatus::Pending);
        assert_ne!(m.white_agent_id, m.black_agent_id);
    }
}

#[tokio::test]
async fn tick_respects_the_capacity_ceiling() {
    let db = MemoryDatabase::new();
    let a = db.add_agent(ExecutionMode::Server, "first", 1500);
    let b = db.add_agent(ExecutionMode::Server, "first", 1510);
    // One match already active against a capacity of 1: no slots.
    db.create_match(a, b, MatchType::Matchmaking).await.unwrap();

    let cfg = test_config();
    let mut rng = StdRng::seed_from_u64(2);
    let created = run_tick_with_capacity(db.as_ref(), 1, &cfg, &mut rng).await.unwrap();
    assert_eq!(created, 0);
}

#[tokio::test]
async fn single_agent_emits_no_pairings() {
    let db = MemoryDatabase::new();
    db.add_agent(ExecutionMode::Server, "first", 1500);

    let cfg = test_config();
    let mut rng = StdRng::seed_from_u64(3);
    let created = run_tick_with_capacity(db.as_ref(), 8, &cfg, &mut rng).await.unwrap();
    assert_eq!(created, 0);
}

#[tokio::test]
async fn two_agents_emit_at_most_one_pairing_per_tick() {
    let db = MemoryDatabase::new();
    db.add_agent(ExecutionMode::Server, "first", 1500);
    db.add_agent(ExecutionMode::Server, "first", 1510);

    let cfg = test_config();
    let mut rng = StdRng::seed_from_u64(4);
    let created = run_tick_with_capacity(db.as_ref(), 8, &cfg, &mut rng).await.unwrap();
    // Each agent gets at most one new game per tick.
    assert_eq!(created, 1);
    assert_eq!(db.matches_of_type(MatchType::Matchmaking).len(), 1);
}

#[tokio::test]
async fn disconnected_local_agents_are_not_eligible() {
    let db = MemoryDatabase::new();
    db.add_agent(ExecutionMode::Server, "first", 1500);
    // Local agent with no connection row at all.
    db.add_agent(ExecutionMode::Local, "", 1505);

    let cfg = test_config();
    let mut rng = StdRng::seed_from_u64(5);
    let created = run_tick_with_capacity(db.as_ref(), 8, &cfg, &mut rng).await.unwrap();
    assert_eq!(created, 0, "lone server agent has nobody to play");
}

#[tokio::test]
async fn connected_local_agents_pair_with_server_agents() {
    let db = MemoryDatabase::new();
    db.add_agent(ExecutionMode::Server, "first", 1500);
    let local = db.add_agent(ExecutionMode::Local, "", 1505);
    db.connect_agent(local);

    let cfg = test_config();
    let mut rng = StdRng::seed_from_u64(6);
    let created = run_tick_with_capacity(db.as_ref(), 8, &cfg, &mut rng).await.unwrap();
    assert_eq!(created, 1);
}

#[tokio::test]
async fn local_agents_over_the_per_agent_cap_are_skipped() {
    let db = MemoryDatabase::new();
    let server = db.add_agent(ExecutionMode::Server, "first", 1500);
    let local = db.add_agent(ExecutionMode::Local, "", 1505);
    db.connect_agent(local);
    // The local agent already sits at the per-agent ceiling.
    for _ in 0..4 {
        db.create_match(local, server, MatchType::Matchmaking).await.unwrap();
    }

    let cfg = test_config();
    let mut rng = StdRng::seed_from_u64(7);
    let created = run_tick_with_capacity(db.as_ref(), 64, &cfg, &mut rng).await.unwrap();
    assert_eq!(created, 0);
}

#[tokio::test]
async fn stuck_matches_become_error_and_rekick() {
    let db = MemoryDatabase::new();
    let a = db.add_agent(ExecutionMode::Server, "first", 1500);
    let b = db.add_agent(ExecutionMode::Server, "first", 1510);
    let row = db.create_match(a, b, MatchType::Matchmaking).await.unwrap();
    db.mark_match_started(row.id).await.unwrap();
    db.backdate_match_start(row.id, 6);

    let cfg = test_config();
    let kick = RecordingKick::new();
    let swept = sweep_stuck_matches(db.as_ref(), kick.as_ref(), &cfg).await.unwrap();
    assert_eq!(swept, 1);

    let updated = db.get_match(row.id).await.unwrap().unwrap();
    assert_eq!(updated.status, MatchStatus::Error);
    assert_eq!(updated.termination.as_deref(), Some("stuck_timeout"));
    assert_eq!(kick.kicks(), 1);
}

#[tokio::test]
async fn fresh_in_progress_matches_are_left_alone() {
    let db = MemoryDatabase::new();
    let a = db.add_agent(ExecutionMode::Server, "first", 1500);
    let b = db.add_agent(ExecutionMode::Server, "first", 1510);
    let row = db.create_match(a, b, MatchType::Matchmaking).await.unwrap();
    db.mark_match_started(row.id).await.unwrap();

    let cfg = test_config();
    let kick = RecordingKick::new();
    let swept = sweep_stuck_matches(db.as_ref(), kick.as_ref(), &cfg).await.unwrap();
    assert_eq!(swept, 0);
    assert_eq!(kick.kicks(), 0);
}

#[tokio::test]
async fn reconnect_supersedes_old_connection_rows() {
    let db = MemoryDatabase::new();
    let local = db.add_agent(ExecutionMode::Local, "", 1500);

    db.open_connection(local, Transport::Ws, Some("10.0.0.1:1")).await.unwrap();
    db.open_connection(local, Transport::P2p, Some("10.0.0.2:2")).await.unwrap();
    db.open_connection(local, Transport::Ws, Some("10.0.0.3:3")).await.unwrap();

    // At most one non-disconnected connection row per agent.
    assert_eq!(db.open_connection_count(local).await.unwrap(), 1);
}
