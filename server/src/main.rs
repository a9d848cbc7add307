use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use server::bridge::router::BusBridge;
use server::bridge::session::{run_bus_listener, run_session_monitor};
use server::bridge::{GameContextCache, MoveRouter, SessionManager, tcp_gateway, ws_gateway};
use server::config::Config;
use server::db::Database;
use server::db::postgres::PostgresDatabase;
use server::executor_registry::ExecutorRegistry;
use server::match_runner::MatchRunner;
use server::matchmaking::{self, BusSchedulerKick};
use server::sandbox::BuiltinSandbox;
use server::tournament::{TournamentController, run_tournament_loop};
use server::validation::run_validation_loop;
use server::{bus, worker};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if exists
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cfg = Arc::new(Config::from_env()?);
    info!(ws_port = cfg.ws_port, tcp_port = cfg.tcp_port, "Starting agent arena server");

    let db_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&cfg.database_url)
        .await
        .context("Failed to create PostgreSQL connection pool")?;
    let db: Arc<dyn Database> = Arc::new(PostgresDatabase::new(db_pool));

    let redis_client =
        redis::Client::open(cfg.redis_url.as_str()).context("Failed to create Redis client")?;
    let redis_conn = bus::create_connection_manager(redis_client.clone()).await?;

    let cancellation_token = CancellationToken::new();
    let mut services = Vec::new();

    // Gateways + session layer
    let sessions = SessionManager::new(db.clone(), redis_conn.clone(), cfg.clone());
    services.push(tokio::spawn(run_bus_listener(
        sessions.clone(),
        cfg.redis_url.clone(),
        cancellation_token.clone(),
    )));
    services.push(tokio::spawn(run_session_monitor(
        sessions.clone(),
        cancellation_token.clone(),
    )));
    {
        let addr = format!("0.0.0.0:{}", cfg.ws_port);
        let sessions = sessions.clone();
        let token = cancellation_token.clone();
        services.push(tokio::spawn(async move {
            if let Err(e) = ws_gateway::run_ws_gateway(&addr, sessions, token).await {
                tracing::error!(error = %e, "WebSocket gateway failed");
            }
        }));
    }
    {
        let addr = format!("0.0.0.0:{}", cfg.tcp_port);
        let sessions = sessions.clone();
        let token = cancellation_token.clone();
        services.push(tokio::spawn(async move {
            if let Err(e) = tcp_gateway::run_tcp_gateway(&addr, sessions, token).await {
                tracing::error!(error = %e, "TCP gateway failed");
            }
        }));
    }

    // Match runner plumbing
    let cache = Arc::new(GameContextCache::new());
    let bridge = Arc::new(BusBridge::new(
        MoveRouter::new(redis_client.clone(), redis_conn.clone(), cfg.move_timeout()),
        cache.clone(),
    ));
    let kick: Arc<dyn matchmaking::SchedulerKick> = Arc::new(BusSchedulerKick::new(redis_conn.clone()));
    let sandbox: Arc<dyn server::sandbox::AgentSandbox> = Arc::new(BuiltinSandbox::new());
    let runner = MatchRunner::new(
        db.clone(),
        sandbox.clone(),
        bridge,
        cache,
        kick.clone(),
        cfg.clone(),
    );

    // Worker: registry membership + match claim loop
    let registry = ExecutorRegistry::new(redis_conn.clone(), &cfg);
    {
        let db = db.clone();
        let registry = registry.clone();
        let runner = runner.clone();
        let cfg = cfg.clone();
        let token = cancellation_token.clone();
        services.push(tokio::spawn(async move {
            if let Err(e) = worker::run_worker(db, registry, runner, cfg, token).await {
                tracing::error!(error = %e, "Worker failed");
            }
        }));
    }

    // Schedulers
    services.push(tokio::spawn(matchmaking::run_matchmaking_loop(
        db.clone(),
        registry.clone(),
        cfg.clone(),
        cancellation_token.clone(),
    )));
    services.push(tokio::spawn(matchmaking::run_stuck_sweep(
        db.clone(),
        kick.clone(),
        cfg.clone(),
        cancellation_token.clone(),
    )));
    services.push(tokio::spawn(run_tournament_loop(
        TournamentController::new(db.clone(), redis_conn.clone(), cfg.clone()),
        cfg.clone(),
        cancellation_token.clone(),
    )));
    services.push(tokio::spawn(run_validation_loop(
        db.clone(),
        sandbox,
        cfg.clone(),
        cancellation_token.clone(),
    )));

    info!("Server started. Waiting for shutdown signal.");
    tokio::signal::ctrl_c().await?;

    info!("Received shutdown signal. Shutting down.");
    cancellation_token.cancel();
    for handle in services {
        let _ = handle.await;
    }
    Ok(())
}
