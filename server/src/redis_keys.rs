/// Utility module for building bus keys and channel names.
/// Isolation between environments is handled by Redis database selection.
use uuid::Uuid;

/// Redis key builder
#[derive(Clone, Debug, Default)]
pub struct RedisKeys;

impl RedisKeys {
    pub fn new() -> Self {
        Self
    }

    // === Live-agent bridge channels ===

    /// Move requests destined for one agent's gateway session
    pub fn move_requests(&self, agent_id: Uuid) -> String {
        format!("requests:{}", agent_id)
    }

    /// Per-request reply channel
    pub fn move_reply(&self, request_id: &str) -> String {
        format!("reply:{}", request_id)
    }

    /// Session disconnect events for an agent
    pub fn agent_disconnect(&self, agent_id: Uuid) -> String {
        format!("disconnect:{}", agent_id)
    }

    /// Game start/end notifications forwarded to an agent
    pub fn agent_notifications(&self, agent_id: Uuid) -> String {
        format!("notifications:{}", agent_id)
    }

    /// Pattern matching every agent's request channel
    pub fn move_requests_pattern(&self) -> &'static str {
        "requests:*"
    }

    /// Pattern matching every agent's notification channel
    pub fn notifications_pattern(&self) -> &'static str {
        "notifications:*"
    }

    // === Presence ===

    /// Presence mirror hash for an agent (fields: status, last_seen)
    pub fn presence(&self, agent_id: Uuid) -> String {
        format!("presence:{}", agent_id)
    }

    // === Executor registry ===

    /// Executor record hash
    pub fn executor_record(&self, worker_id: &str) -> String {
        format!("executors:{}", worker_id)
    }

    /// Membership set of live executors
    pub fn executors_active(&self) -> &'static str {
        "executors:active"
    }

    // === Schedulers ===

    /// Tournament bracket snapshot (JSON)
    pub fn tournament_brackets(&self) -> &'static str {
        "tournament:brackets"
    }

    /// Channel the matchmaking loop listens on for immediate re-kicks
    pub fn scheduler_kick(&self) -> &'static str {
        "scheduler:kick"
    }

    /// Agent id embedded in a per-agent channel name, if any.
    pub fn agent_from_channel(channel: &str) -> Option<Uuid> {
        channel.split(':').nth(1).and_then(|s| Uuid::parse_str(s).ok())
    }
}
