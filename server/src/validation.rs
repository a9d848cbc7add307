//! Validation queue processing: syntactic/behavioral probing of submitted
//! agents before an Agent row ever exists. A failed submission never
//! creates an agent; error messages shown to users are category-level,
//! never raw agent output or paths.

use anyhow::Result;
use common::{Color, boards};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::Database;
use crate::db::models::{ExecutionMode, NewAgent, ValidationEntry};
use crate::sandbox::AgentSandbox;

const VALIDATION_BATCH: i64 = 5;

/// Strip anything that looks like a filesystem path and truncate; user
/// visible failure text stays categorical.
pub fn sanitize_error(message: &str) -> String {
    let cleaned: String = message
        .split_whitespace()
        .map(|word| if word.starts_with('/') { "[path]" } else { word })
        .collect::<Vec<_>>()
        .join(" ");
    let mut out = cleaned;
    if out.len() > 150 {
        out.truncate(150);
    }
    out
}

pub async fn run_validation_loop(
    db: Arc<dyn Database>,
    sandbox: Arc<dyn AgentSandbox>,
    cfg: Arc<Config>,
    cancellation_token: CancellationToken,
) {
    info!("Starting validation queue processor");
    let mut interval = tokio::time::interval(cfg.validation_tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => {
                info!("Validation queue processor shutting down");
                break;
            }
            _ = interval.tick() => {
                if let Err(e) = process_pending(db.as_ref(), sandbox.as_ref(), &cfg).await {
                    error!(error = %e, "Validation tick failed");
                }
            }
        }
    }
}

/// Claim and process a batch of pending validation entries.
pub async fn process_pending(
    db: &dyn Database,
    sandbox: &dyn AgentSandbox,
    cfg: &Config,
) -> Result<usize> {
    let entries = db.pending_validation_entries(VALIDATION_BATCH).await?;
    let count = entries.len();
    for entry in entries {
        if let Err(e) = process_entry(db, sandbox, cfg, &entry).await {
            error!(entry_id = %entry.id, error = %e, "Validation entry failed internally");
            let _ = db.fail_validation(entry.id, "Internal validation error", 0).await;
        }
    }
    Ok(count)
}

async fn process_entry(
    db: &dyn Database,
    sandbox: &dyn AgentSandbox,
    cfg: &Config,
    entry: &ValidationEntry,
) -> Result<()> {
    // Double submission of identical code creates at most one agent.
    if let Some(existing) = db.get_agent_by_code_hash(&entry.code_hash).await? {
        info!(entry_id = %entry.id, agent_id = %existing.id, "Code hash already validated, reusing agent");
        db.pass_validation(entry.id, existing.id, 0).await?;
        return Ok(());
    }

    db.mark_validation_testing(entry.id).await?;
    info!(entry_id = %entry.id, name = %entry.name, version = entry.version, "Testing agent");

    let started = Instant::now();
    match probe_agent(sandbox, &entry.code_blob, cfg).await {
        Ok(()) => {
            let duration_ms = started.elapsed().as_millis() as i64;
            let agent = db
                .create_agent(NewAgent {
                    owner_id: entry.owner_id,
                    name: entry.name.clone(),
                    version: entry.version,
                    code_blob: entry.code_blob.clone(),
                    code_hash: entry.code_hash.clone(),
                    execution_mode: ExecutionMode::Server,
                    connection_token_hash: None,
                })
                .await?;
            db.create_ranking(agent.id).await?;
            db.pass_validation(entry.id, agent.id, duration_ms).await?;
            info!(entry_id = %entry.id, agent_id = %agent.id, duration_ms, "Agent validation passed");
        }
        Err(reason) => {
            let duration_ms = started.elapsed().as_millis() as i64;
            let sanitized = sanitize_error(&reason);
            warn!(entry_id = %entry.id, reason = %sanitized, "Agent validation failed");
            db.fail_validation(entry.id, &sanitized, duration_ms).await?;
        }
    }
    Ok(())
}

/// Exercise the agent on both canonical boards as both colors. The total
/// budget is one agent timeout, split across the probes.
async fn probe_agent(
    sandbox: &dyn AgentSandbox,
    code_blob: &str,
    cfg: &Config,
) -> Result<(), String> {
    let cases = [
        (boards::canonical0(), Color::White, "board 0 as white"),
        (boards::canonical0(), Color::Black, "board 0 as black"),
        (boards::canonical1(), Color::White, "board 1 as white"),
        (boards::canonical1(), Color::Black, "board 1 as black"),
    ];
    let per_case = Duration::from_secs_f64(cfg.agent_timeout_secs / cases.len() as f64);

    for (board, color, label) in cases {
        let verdict = sandbox
            .request_move(code_blob, &board, color, common::agent_var(1), per_case)
            .await;
        if verdict.timed_out {
            return Err(format!(
                "Agent exceeded {} second timeout (failed on {label})",
                cfg.agent_timeout_secs
            ));
        }
        if let Some(error) = verdict.error {
            return Err(format!("{error} (failed on {label})"));
        }
        if verdict.chosen.is_none() && !common::legal_moves(&board, color).is_empty() {
            return Err(format!(
                "Agent returned no move when legal moves were available (failed on {label})"
            ));
        }
    }
    Ok(())
}
