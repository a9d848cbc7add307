//! Elo updates for completed matches. Ranking rows are locked in canonical
//! order by the persistence layer; this module owns the arithmetic.

use anyhow::Result;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::Database;
use crate::db::models::{GameOutcome, RatingUpdate, Winner};

/// New agents move fast, established agents settle down.
const K_FACTOR_NEW: i32 = 32;
const K_FACTOR_ESTABLISHED: i32 = 16;
const ESTABLISHED_GAMES: i32 = 20;

pub fn k_factor(games_played: i32) -> i32 {
    if games_played < ESTABLISHED_GAMES { K_FACTOR_NEW } else { K_FACTOR_ESTABLISHED }
}

pub fn expected_score(rating_a: i32, rating_b: i32) -> f64 {
    1.0 / (1.0 + 10f64.powf((rating_b - rating_a) as f64 / 400.0))
}

pub fn elo_change(rating_a: i32, rating_b: i32, score_a: f64, k: i32) -> i32 {
    (k as f64 * (score_a - expected_score(rating_a, rating_b))).round() as i32
}

fn scores_for(winner: Option<Winner>) -> (f64, f64) {
    match winner {
        Some(Winner::White) => (1.0, 0.0),
        Some(Winner::Black) => (0.0, 1.0),
        Some(Winner::Draw) | None => (0.5, 0.5),
    }
}

fn outcome_for(score: f64) -> GameOutcome {
    if score == 1.0 {
        GameOutcome::Win
    } else if score == 0.0 {
        GameOutcome::Loss
    } else {
        GameOutcome::Draw
    }
}

/// Recompute both agents' ratings for one completed match and persist the
/// deltas together with per-side average move times.
pub async fn update_match_ratings(db: &dyn Database, match_id: Uuid) -> Result<()> {
    let Some(ctx) = db.rating_context(match_id).await? else {
        warn!(%match_id, "Match not found or not completed, skipping rating update");
        return Ok(());
    };

    let (white_score, black_score) = scores_for(ctx.winner);
    let white_change = elo_change(
        ctx.white_rating,
        ctx.black_rating,
        white_score,
        k_factor(ctx.white_games),
    );
    let black_change = elo_change(
        ctx.black_rating,
        ctx.white_rating,
        black_score,
        k_factor(ctx.black_games),
    );

    let (white_avg, black_avg) = db.move_time_averages(match_id).await?;

    db.apply_rating_updates(&[
        RatingUpdate {
            agent_id: ctx.white_agent_id,
            change: white_change,
            outcome: outcome_for(white_score),
            avg_move_time_ms: white_avg,
        },
        RatingUpdate {
            agent_id: ctx.black_agent_id,
            change: black_change,
            outcome: outcome_for(black_score),
            avg_move_time_ms: black_avg,
        },
    ])
    .await?;

    info!(%match_id, white_change, black_change, "Ratings updated");
    Ok(())
}
