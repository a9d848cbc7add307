use anyhow::{Context, Result};
use common::frames::{ClientFrame, GatewayFrame};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::session::{AuthOutcome, SessionManager, parse_client_frame};
use crate::db::models::Transport;

/// Newline-delimited TCP gateway: same session semantics as the WebSocket
/// transport, one JSON frame per line.
pub async fn run_tcp_gateway(
    addr: &str,
    manager: Arc<SessionManager>,
    cancellation_token: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await.context("Failed to bind TCP gateway")?;
    info!(addr, "TCP gateway listening");

    let mut connection_handles: Vec<JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => {
                info!("TCP gateway shutdown received");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        debug!(%peer_addr, "Accepted TCP agent connection");
                        let manager = manager.clone();
                        let token = cancellation_token.child_token();
                        connection_handles.push(tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer_addr.to_string(), manager, token).await {
                                warn!(%peer_addr, error = %e, "TCP connection ended with error");
                            }
                        }));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept TCP connection");
                    }
                }
            }
        }
    }

    info!(count = connection_handles.len(), "Waiting for TCP connections to drain");
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
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let max_bytes = manager.config().max_message_bytes;
    let auth_timeout = manager.config().auth_timeout();

    let (out_tx, mut out_rx) = mpsc::channel::<GatewayFrame>(64);
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let mut json = match serde_json::to_string(&frame) {
                Ok(j) => j,
                Err(e) => {
                    error!(error = %e, "Failed to serialize gateway frame");
                    continue;
                }
            };
            json.push('\n');
            if write_half.write_all(json.as_bytes()).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let session = match tokio::time::timeout(auth_timeout, lines.next_line()).await {
        Err(_) => {
            let _ = out_tx
                .send(GatewayFrame::Error { error: "Authentication timeout".to_string() })
                .await;
            None
        }
        Ok(Err(_)) | Ok(Ok(None)) => None,
        Ok(Ok(Some(line))) => match parse_client_frame(&line, max_bytes, None) {
            Some(ClientFrame::Connect { agent_id, connection_token }) => {
                match manager
                    .authenticate(
                        &agent_id,
                        &connection_token,
                        Transport::P2p,
                        Some(peer_addr.as_str()),
                        out_tx.clone(),
                    )
                    .await?
                {
                    AuthOutcome::Accepted(session) => Some(session),
                    AuthOutcome::Rejected(reason) => {
                        let _ = out_tx.send(GatewayFrame::Error { error: reason.to_string() }).await;
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
        },
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
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(raw)) => {
                        let Some(frame) = parse_client_frame(&raw, max_bytes, Some(session.agent_id)) else {
                            continue;
                        };
                        manager.handle_frame(&session, frame).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(agent_id = %session.agent_id, error = %e, "TCP receive error");
                        break;
                    }
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
