use anyhow::Result;
use chrono::Utc;
use common::frames::{ClientFrame, GatewayFrame};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{DisconnectNotice, MoveRequestMsg, ReplyFrame};
use crate::config::Config;
use crate::db::Database;
use crate::db::models::{Agent, ConnectionStatus, MatchStatus, Transport};
use crate::redis_keys::RedisKeys;

const DB_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// One authenticated agent session, owned by whichever gateway accepted it.
pub struct SessionHandle {
    pub agent_id: Uuid,
    pub agent_name: String,
    pub transport: Transport,
    outbound: mpsc::Sender<GatewayFrame>,
    cancel: CancellationToken,
    state: Mutex<SessionState>,
}

struct SessionState {
    last_heartbeat: Instant,
    last_db_heartbeat: Option<Instant>,
    status: ConnectionStatus,
    /// request_id -> (reply channel, game). Lifetime of one move each.
    pending: HashMap<String, PendingRequest>,
    active_games: HashSet<Uuid>,
}

struct PendingRequest {
    reply_channel: String,
    game_id: Uuid,
}

impl SessionHandle {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn send(&self, frame: GatewayFrame) -> bool {
        self.outbound.send(frame).await.is_ok()
    }
}

/// Registry of live sessions shared by both gateway transports. Enforces
/// single-session-per-agent at the auth step.
pub struct SessionManager {
    db: Arc<dyn Database>,
    conn: ConnectionManager,
    keys: RedisKeys,
    cfg: Arc<Config>,
    sessions: RwLock<HashMap<Uuid, Arc<SessionHandle>>>,
}

pub enum AuthOutcome {
    Accepted(Arc<SessionHandle>),
    Rejected(&'static str),
}

impl SessionManager {
    pub fn new(db: Arc<dyn Database>, conn: ConnectionManager, cfg: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            db,
            conn,
            keys: RedisKeys::new(),
            cfg,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Handle the initial `connect` frame. On success the previous session
    /// for the same agent, if any, is superseded: it receives a disconnect
    /// frame, its pending requests fail, and its socket task is cancelled.
    pub async fn authenticate(
        &self,
        agent_id_raw: &str,
        connection_token: &str,
        transport: Transport,
        remote_addr: Option<&str>,
        outbound: mpsc::Sender<GatewayFrame>,
    ) -> Result<AuthOutcome> {
        if self.sessions.read().await.len() >= self.cfg.max_connections_total {
            return Ok(AuthOutcome::Rejected("Server at capacity"));
        }
        if agent_id_raw.is_empty() || connection_token.is_empty() {
            return Ok(AuthOutcome::Rejected("Invalid agent credentials"));
        }
        if agent_id_raw.len() > 100 || connection_token.len() > 1000 {
            return Ok(AuthOutcome::Rejected("Invalid agent credentials"));
        }
        let Ok(agent_id) = Uuid::parse_str(agent_id_raw) else {
            return Ok(AuthOutcome::Rejected("Invalid agent credentials"));
        };

        let token_hash = hash_connection_token(connection_token);
        let agent: Agent = match self.db.authenticate_local_agent(agent_id, &token_hash).await? {
            Some(agent) => agent,
            None => {
                warn!(%agent_id, "Agent authentication failed");
                return Ok(AuthOutcome::Rejected("Invalid agent credentials"));
            }
        };

        // Supersede any existing session before allocating state for the
        // new one.
        let previous = self.sessions.write().await.remove(&agent_id);
        if let Some(old) = previous {
            info!(%agent_id, "Superseding existing session");
            old.send(GatewayFrame::Disconnect { reason: "superseded".to_string() }).await;
            self.fail_pending_requests(&old, "superseded").await;
            old.cancel.cancel();
        }

        let session = Arc::new(SessionHandle {
            agent_id,
            agent_name: agent.name.clone(),
            transport,
            outbound,
            cancel: CancellationToken::new(),
            state: Mutex::new(SessionState {
                last_heartbeat: Instant::now(),
                last_db_heartbeat: None,
                status: ConnectionStatus::Connected,
                pending: HashMap::new(),
                active_games: HashSet::new(),
            }),
        });
        self.sessions.write().await.insert(agent_id, session.clone());

        self.db.open_connection(agent_id, transport, remote_addr).await?;
        self.write_presence(agent_id, ConnectionStatus::Connected).await;

        session
            .send(GatewayFrame::Connected {
                agent_id: agent_id.to_string(),
                agent_name: agent.name.clone(),
            })
            .await;

        info!(%agent_id, agent_name = %agent.name, transport = transport.as_str(), "Agent connected");
        Ok(AuthOutcome::Accepted(session))
    }

    /// Dispatch a post-auth frame from the client. Any frame counts as a
    /// sign of life for staleness purposes.
    pub async fn handle_frame(&self, session: &Arc<SessionHandle>, frame: ClientFrame) {
        session.state.lock().await.last_heartbeat = Instant::now();
        match frame {
            ClientFrame::Connect { .. } => {
                debug!(agent_id = %session.agent_id, "Ignoring repeated connect frame");
            }
            ClientFrame::Heartbeat => self.handle_heartbeat(session).await,
            ClientFrame::Move { request_id, mv, elapsed } => {
                self.resolve_request(session, &request_id, |rid| ReplyFrame::Move {
                    request_id: rid,
                    mv: mv.clone(),
                    elapsed,
                })
                .await;
                self.restore_idle_status(session).await;
            }
            ClientFrame::Timeout { request_id } => {
                self.resolve_request(session, &request_id, |rid| ReplyFrame::Timeout {
                    request_id: rid,
                })
                .await;
                self.restore_idle_status(session).await;
            }
            ClientFrame::Error { request_id, error } => {
                if let Some(request_id) = request_id {
                    self.resolve_request(session, &request_id, |rid| ReplyFrame::Error {
                        request_id: rid,
                        error: error.clone(),
                    })
                    .await;
                } else {
                    warn!(agent_id = %session.agent_id, error, "Agent error without request id");
                }
                self.restore_idle_status(session).await;
            }
            ClientFrame::Status { status } => {
                let Some(status) = ConnectionStatus::parse(&status) else {
                    warn!(agent_id = %session.agent_id, status, "Unknown status from agent");
                    return;
                };
                session.state.lock().await.status = status;
                if let Err(e) = self.db.set_connection_status(session.agent_id, status).await {
                    error!(agent_id = %session.agent_id, error = %e, "Failed to persist agent status");
                }
                self.write_presence(session.agent_id, status).await;
            }
        }
    }

    async fn handle_heartbeat(&self, session: &Arc<SessionHandle>) {
        let mut state = session.state.lock().await;
        state.last_heartbeat = Instant::now();

        // The DB row is refreshed at most every 10s per agent; the
        // in-memory timestamp is what staleness checks use.
        let due = state
            .last_db_heartbeat
            .map(|t| t.elapsed() >= DB_HEARTBEAT_INTERVAL)
            .unwrap_or(true);
        if due {
            state.last_db_heartbeat = Some(Instant::now());
            drop(state);
            if let Err(e) = self.db.touch_connection_heartbeat(session.agent_id).await {
                error!(agent_id = %session.agent_id, error = %e, "Failed to persist heartbeat");
            }
        }
    }

    /// Resolve a pending move request (first reply wins; anything after the
    /// request has been removed is dropped).
    async fn resolve_request(
        &self,
        session: &Arc<SessionHandle>,
        request_id: &str,
        build: impl Fn(String) -> ReplyFrame,
    ) {
        let pending = session.state.lock().await.pending.remove(request_id);
        let Some(pending) = pending else {
            debug!(agent_id = %session.agent_id, request_id, "Dropping reply for unknown request");
            return;
        };
        let frame = build(request_id.to_string());
        self.publish_reply(&pending.reply_channel, &frame).await;
    }

    async fn restore_idle_status(&self, session: &Arc<SessionHandle>) {
        let status = {
            let state = session.state.lock().await;
            if state.status == ConnectionStatus::Draining {
                ConnectionStatus::Draining
            } else {
                ConnectionStatus::Connected
            }
        };
        if let Err(e) = self.db.set_connection_status(session.agent_id, status).await {
            error!(agent_id = %session.agent_id, error = %e, "Failed to restore connection status");
        }
        self.write_presence(session.agent_id, status).await;
    }

    async fn publish_reply(&self, channel: &str, frame: &ReplyFrame) {
        let payload = match serde_json::to_vec(frame) {
            Ok(p) => p,
            Err(e) => {
                error!(channel, error = %e, "Failed to serialize reply");
                return;
            }
        };
        let mut conn = self.conn.clone();
        if let Err(e) = conn.publish::<_, _, ()>(channel, payload).await {
            error!(channel, error = %e, "Failed to publish reply");
        }
    }

    async fn write_presence(&self, agent_id: Uuid, status: ConnectionStatus) {
        let mut conn = self.conn.clone();
        if status == ConnectionStatus::Disconnected {
            if let Err(e) = conn.del::<_, ()>(self.keys.presence(agent_id)).await {
                warn!(%agent_id, error = %e, "Failed to clear presence");
            }
            return;
        }
        let fields = [
            ("status", status.as_str().to_string()),
            ("last_seen", Utc::now().timestamp().to_string()),
        ];
        if let Err(e) = conn.hset_multiple::<_, _, _, ()>(self.keys.presence(agent_id), &fields).await {
            warn!(%agent_id, error = %e, "Failed to write presence");
        }
    }

    /// A move request arrived on `requests:{agent_id}`. If this gateway
    /// holds the session, forward it; otherwise the request belongs to
    /// another gateway and is ignored.
    pub async fn handle_move_request(&self, agent_id: Uuid, request: MoveRequestMsg) {
        let session = self.sessions.read().await.get(&agent_id).cloned();
        let Some(session) = session else {
            debug!(%agent_id, "Ignoring move request for agent not connected here");
            return;
        };

        {
            let mut state = session.state.lock().await;
            state.pending.insert(
                request.request_id.clone(),
                PendingRequest {
                    reply_channel: request.response_channel.clone(),
                    game_id: request.game_id,
                },
            );
            state.active_games.insert(request.game_id);
        }

        if let Err(e) = self.db.set_connection_status(agent_id, ConnectionStatus::InGame).await {
            error!(%agent_id, error = %e, "Failed to mark agent in_game");
        }
        self.write_presence(agent_id, ConnectionStatus::InGame).await;

        let delivered = session
            .send(GatewayFrame::MoveRequest {
                request_id: request.request_id.clone(),
                game_id: request.game_id.to_string(),
                initial_board: request.initial_board,
                moves: request.moves,
                player: request.player,
                var: request.var,
            })
            .await;

        if !delivered {
            warn!(%agent_id, game_id = %request.game_id, "Session outbound closed, replying disconnected");
            let pending = session.state.lock().await.pending.remove(&request.request_id);
            if let Some(pending) = pending {
                self.publish_reply(
                    &pending.reply_channel,
                    &ReplyFrame::Disconnected {
                        request_id: request.request_id,
                        game_id: Some(pending.game_id),
                        reason: "Agent not connected".to_string(),
                    },
                )
                .await;
            }
        }
    }

    /// Forward a game notification to the owning session, if it lives here.
    pub async fn handle_notification(&self, agent_id: Uuid, frame: GatewayFrame) {
        let session = self.sessions.read().await.get(&agent_id).cloned();
        let Some(session) = session else {
            return;
        };
        if let GatewayFrame::GameEnd { game_id, .. } = &frame {
            if let Ok(game_id) = Uuid::parse_str(game_id) {
                session.state.lock().await.active_games.remove(&game_id);
            }
        }
        session.send(frame).await;
    }

    /// Fail every pending request of a session with a disconnected reply.
    async fn fail_pending_requests(&self, session: &Arc<SessionHandle>, reason: &str) {
        let pending: Vec<(String, PendingRequest)> =
            session.state.lock().await.pending.drain().collect();
        for (request_id, request) in pending {
            self.publish_reply(
                &request.reply_channel,
                &ReplyFrame::Disconnected {
                    request_id,
                    game_id: Some(request.game_id),
                    reason: reason.to_string(),
                },
            )
            .await;
        }
    }

    /// Tear down a session: pending waiters fail, a disconnect event is
    /// published for each game the agent still owns (when the match is
    /// still live), the connection row flips to disconnected and the
    /// presence mirror is cleared. Does nothing if the handle was already
    /// superseded by a newer session.
    pub async fn disconnect(&self, session: &Arc<SessionHandle>, reason: &str) {
        {
            let mut sessions = self.sessions.write().await;
            match sessions.get(&session.agent_id) {
                Some(current) if Arc::ptr_eq(current, session) => {
                    sessions.remove(&session.agent_id);
                }
                _ => {
                    // Superseded; the newer session owns the shared state.
                    debug!(agent_id = %session.agent_id, "Skipping cleanup for superseded session");
                    return;
                }
            }
        }

        session.cancel.cancel();
        self.fail_pending_requests(session, reason).await;

        let games: Vec<Uuid> = session.state.lock().await.active_games.drain().collect();
        for game_id in games {
            match self.db.match_status(game_id).await {
                Ok(Some(MatchStatus::Pending)) | Ok(Some(MatchStatus::InProgress)) => {
                    let notice = DisconnectNotice { game_id, reason: reason.to_string() };
                    let payload = match serde_json::to_vec(&notice) {
                        Ok(p) => p,
                        Err(_) => continue,
                    };
                    let mut conn = self.conn.clone();
                    if let Err(e) = conn
                        .publish::<_, _, ()>(self.keys.agent_disconnect(session.agent_id), payload)
                        .await
                    {
                        error!(agent_id = %session.agent_id, %game_id, error = %e,
                               "Failed to publish disconnect event");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!(agent_id = %session.agent_id, %game_id, error = %e,
                           "Failed to check match status on disconnect");
                }
            }
        }

        if let Err(e) = self.db.close_connections(session.agent_id).await {
            error!(agent_id = %session.agent_id, error = %e, "Failed to close connection rows");
        }
        self.write_presence(session.agent_id, ConnectionStatus::Disconnected).await;
        info!(agent_id = %session.agent_id, reason, "Agent session closed");
    }

    /// Sessions silent past the heartbeat timeout are told to disconnect
    /// and torn down.
    pub async fn sweep_stale_sessions(&self) {
        let timeout = self.cfg.heartbeat_timeout();
        let mut stale = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for session in sessions.values() {
                let last = session.state.lock().await.last_heartbeat;
                if last.elapsed() > timeout {
                    stale.push(session.clone());
                }
            }
        }
        for session in stale {
            warn!(agent_id = %session.agent_id, "Agent heartbeat timeout");
            session
                .send(GatewayFrame::Disconnect { reason: "heartbeat timeout".to_string() })
                .await;
            self.disconnect(&session, "heartbeat timeout").await;
        }
    }
}

pub fn hash_connection_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Heartbeat staleness monitor shared by every gateway on this process.
pub async fn run_session_monitor(manager: Arc<SessionManager>, cancellation_token: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!("Starting session heartbeat monitor");

    loop {
        tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => {
                info!("Session heartbeat monitor shutting down");
                break;
            }
            _ = interval.tick() => {
                manager.sweep_stale_sessions().await;
            }
        }
    }
}

/// Bus listener: move requests and notifications fan in here and are routed
/// to whichever session (if any) this process owns.
pub async fn run_bus_listener(
    manager: Arc<SessionManager>,
    redis_url: String,
    cancellation_token: CancellationToken,
) {
    let keys = RedisKeys::new();
    let mut rx = crate::bus::psubscribe(
        redis_url,
        vec![
            keys.move_requests_pattern().to_string(),
            keys.notifications_pattern().to_string(),
        ],
    );

    info!("Gateway bus listener started");
    loop {
        tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => {
                info!("Gateway bus listener shutting down");
                break;
            }
            msg = rx.recv() => {
                let Some((channel, payload)) = msg else { break };
                let Some(agent_id) = RedisKeys::agent_from_channel(&channel) else {
                    warn!(channel, "Bus message on unparsable channel");
                    continue;
                };
                if channel.starts_with("requests:") {
                    match serde_json::from_slice::<MoveRequestMsg>(&payload) {
                        Ok(request) => manager.handle_move_request(agent_id, request).await,
                        Err(e) => warn!(channel, error = %e, "Invalid move request payload"),
                    }
                } else if channel.starts_with("notifications:") {
                    match serde_json::from_slice::<GatewayFrame>(&payload) {
                        Ok(frame) => manager.handle_notification(agent_id, frame).await,
                        Err(e) => warn!(channel, error = %e, "Invalid notification payload"),
                    }
                }
            }
        }
    }
}

/// Parse and size-check one raw client message. Oversize or malformed
/// frames are dropped with a log, mirroring the wire contract.
pub fn parse_client_frame(raw: &str, max_bytes: usize, agent: Option<Uuid>) -> Option<ClientFrame> {
    if raw.len() > max_bytes {
        warn!(size = raw.len(), ?agent, "Dropping oversized message");
        return None;
    }
    match serde_json::from_str::<ClientFrame>(raw) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(?agent, error = %e, "Dropping malformed frame");
            None
        }
    }
}
