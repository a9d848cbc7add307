use anyhow::{Context, Result};
use common::frames::{ClientFrame, GatewayFrame};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tungstenite::Utf8Bytes;

use super::session::{AuthOutcome, SessionManager, parse_client_frame};
use crate::db::models::Transport;

/// WebSocket gateway for local agent sessions.
pub async fn run_ws_gateway(
    addr: &str,
    manager: Arc<SessionManager>,
    cancellation_token: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await.context("Failed to bind WebSocket gateway")?;
    info!(addr, "WebSocket gateway listening");

    let mut connection_handles: Vec<JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => {
                info!("WebSocket gateway shutdown received");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        debug!(%peer_addr, "Accepted WebSocket connection");
                        let manager = manager.clone();
                        let token = cancellation_token.child_token();
                        connection_handles.push(tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer_addr.to_string(), manager, token).await {
                                warn!(%peer_addr, error = %e, "WebSocket connection ended with error");
                            }
                        }));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept WebSocket connection");
                    }
                }
            }
        }
    }

    info!(count = connection_handles.len(), "Waiting for WebSocket connections to drain");
    for handle in connection_handles {
        let _ = handle.await;
    }
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: String,
    manager: Arc<SessionManager>,
    cancellation_token: CancellationToken,
) -> Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .context("WebSocket handshake failed")?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let max_bytes = manager.config().max_message_bytes;
    let auth_timeout = manager.config().auth_timeout();

    // Writer task: everything the gateway sends flows through this channel.
    let (out_tx, mut out_rx) = mpsc::channel::<GatewayFrame>(64);
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(j) => j,
                Err(e) => {
                    error!(error = %e, "Failed to serialize gateway frame");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(Utf8Bytes::from(json))).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // First frame must be `connect`, within the auth window.
    let session = match tokio::time::timeout(auth_timeout, ws_rx.next()).await {
        Err(_) => {
            let _ = out_tx
                .send(GatewayFrame::Error { error: "Authentication timeout".to_string() })
                .await;
            None
        }
        Ok(None) | Ok(Some(Err(_))) => None,
        Ok(Some(Ok(msg))) => {
            let raw = msg.into_text().unwrap_or_default();
            match parse_client_frame(raw.as_str(), max_bytes, None) {
                Some(ClientFrame::Connect { agent_id, connection_token }) => {
                    match manager
                        .authenticate(
                            &agent_id,
                            &connection_token,
                            Transport::Ws,
                            Some(peer_addr.as_str()),
                            out_tx.clone(),
                        )
                        .await?
                    {
                        AuthOutcome::Accepted(session) => Some(session),
                        AuthOutcome::Rejected(reason) => {
                            let _ = out_tx
                                .send(GatewayFrame::Error { error: reason.to_string() })
                                .await;
                            None
                        }
                    }
                }
                _ => {
                    let _ = out_tx
                        .send(GatewayFrame::Error { error: "Must authenticate first".to_string() })
                        .await;
                    None
                }
            }
        }
    };

    let Some(session) = session else {
        drop(out_tx);
        let _ = writer.await;
        return Ok(());
    };

    let session_cancel = session.cancel_token();
    loop {
        tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => {
                let _ = out_tx
                    .send(GatewayFrame::Disconnect { reason: "server shutdown".to_string() })
                    .await;
                break;
            }
            _ = session_cancel.cancelled() => {
                // Superseded or force-closed elsewhere; the disconnect frame
                // was already delivered.
                break;
            }
            message = ws_rx.next() => {
                match message {
                    Some(Ok(msg)) => {
                        if msg.is_close() {
                            break;
                        }
                        let Ok(raw) = msg.into_text() else { continue };
                        let Some(frame) = parse_client_frame(raw.as_str(), max_bytes, Some(session.agent_id)) else {
                            continue;
                        };
                        manager.handle_frame(&session, frame).await;
                    }
                    Some(Err(e)) => {
                        debug!(agent_id = %session.agent_id, error = %e, "WebSocket receive error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    manager.disconnect(&session, "Agent disconnected").await;
    // The session handle holds an outbound sender; release it so the writer
    // drains and exits.
    drop(session);
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}
