use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::env;
use std::time::Duration;

/// Runtime configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,

    /// Hard per-move limit enforced against agents, in seconds.
    pub agent_timeout_secs: f64,
    /// Extra server-side wait on top of the agent timeout, covering dispatch
    /// and reply routing across the bus.
    pub dispatch_buffer_secs: f64,
    /// Slack allowed on agent-reported elapsed time before a move counts as
    /// a timeout.
    pub check_buffer_secs: f64,

    pub heartbeat_interval_secs: u64,
    pub stale_threshold_secs: u64,
    pub matches_per_executor: u32,
    pub executor_concurrency: u32,
    pub fallback_capacity: u32,

    pub per_local_cap: i64,
    pub max_connections_total: usize,
    pub max_message_bytes: usize,

    pub game_time_budget_secs: u64,
    pub max_moves: u32,
    pub exhibition_move_delay: Duration,

    pub tournament_start: Option<DateTime<Utc>>,

    pub ws_port: u16,
    pub tcp_port: u16,

    pub matchmaking_tick: Duration,
    pub stuck_sweep_tick: Duration,
    pub stuck_match_age: chrono::Duration,
    pub tournament_tick: Duration,
    pub validation_tick: Duration,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Config> {
        let database_url = env::var("DATABASE_URL")
            .context("DATABASE_URL must be set in environment or .env file")?;
        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let tournament_start = match env::var("TOURNAMENT_START") {
            Ok(raw) => Some(
                DateTime::parse_from_rfc3339(&raw)
                    .context("TOURNAMENT_START must be an RFC3339 timestamp")?
                    .with_timezone(&Utc),
            ),
            Err(_) => None,
        };

        Ok(Config {
            database_url,
            redis_url,
            agent_timeout_secs: env_parse("AGENT_TIMEOUT_SECONDS", common::DEFAULT_AGENT_TIMEOUT_SECS),
            dispatch_buffer_secs: env_parse("DISPATCH_BUFFER_SECONDS", 5.0),
            check_buffer_secs: env_parse("TIMEOUT_CHECK_BUFFER_SECONDS", 1.0),
            heartbeat_interval_secs: env_parse("EXECUTOR_HEARTBEAT_INTERVAL", 10),
            stale_threshold_secs: env_parse("EXECUTOR_STALE_THRESHOLD", 30),
            matches_per_executor: env_parse("MATCHES_PER_EXECUTOR", 4),
            executor_concurrency: env_parse("EXECUTOR_CONCURRENCY", 8),
            fallback_capacity: env_parse("FALLBACK_MAX_MATCHES", 8),
            per_local_cap: env_parse("PER_LOCAL_CAP", 4),
            max_connections_total: env_parse("MAX_CONNECTIONS_TOTAL", 10_000),
            max_message_bytes: 100 * 1024,
            game_time_budget_secs: env_parse("GAME_TIME_BUDGET", 300),
            max_moves: env_parse("MAX_MOVES", 500),
            exhibition_move_delay: Duration::from_millis(env_parse("EXHIBITION_MOVE_DELAY_MS", 1500)),
            tournament_start,
            ws_port: env_parse("WS_PORT", 8765),
            tcp_port: env_parse("TCP_PORT", 8766),
            matchmaking_tick: Duration::from_secs(env_parse("MATCHMAKING_TICK_SECONDS", 5)),
            stuck_sweep_tick: Duration::from_secs(60),
            stuck_match_age: chrono::Duration::minutes(5),
            tournament_tick: Duration::from_secs(5),
            validation_tick: Duration::from_secs(10),
        })
    }

    /// Server-side wait for a remote move: the agent's budget plus the
    /// dispatch buffer.
    pub fn move_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.agent_timeout_secs + self.dispatch_buffer_secs)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.agent_timeout_secs)
    }

    /// How long an unauthenticated connection may sit before the gateway
    /// drops it.
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.agent_timeout_secs * 3.0)
    }

    /// Silence threshold after which a session is treated as disconnected.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.agent_timeout_secs * 5.0)
    }

    pub fn stale_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_threshold_secs as i64)
    }

    /// TTL on executor records: slightly longer than the stale threshold so
    /// redis expiry lags the scan-time eviction.
    pub fn executor_record_ttl_secs(&self) -> u64 {
        self.stale_threshold_secs + 10
    }
}
