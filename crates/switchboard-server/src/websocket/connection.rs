//! Per-connection pump between a WebSocket and the hub.
//!
//! A writer task drains the session's outbound queue into the socket and
//! pings on the heartbeat interval. The reader runs inline and hands every
//! inbound text frame to the hub in arrival order, so a session's callbacks
//! never overlap. Either side closing ends both; the hub then delivers
//! `on_close` once. Only application frames count as activity: a client
//! that merely answers pings still goes idle.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::{SinkExt, StreamExt};
use switchboard_core::SessionFault;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::hub::Hub;
use crate::session::{ChannelTransport, HandshakeInfo, Outbound};

/// Drive one upgraded socket until it closes.
pub async fn run_connection(socket: WebSocket, hub: Arc<Hub>, path: String, handshake: HandshakeInfo) {
    let (transport, outbound) = ChannelTransport::new(hub.config().send_queue_capacity);
    let session = match hub.accept(&path, handshake, Arc::new(transport)).await {
        Ok(session) => session,
        Err(err) => {
            warn!(path, error = %err, "connection refused after upgrade");
            let mut socket = socket;
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: err.to_string().into(),
                })))
                .await;
            return;
        }
    };

    let (ws_tx, mut ws_rx) = socket.split();
    let closed = outbound.closed.clone();
    let writer = tokio::spawn(write_loop(ws_tx, outbound, hub.config().heartbeat_interval));

    loop {
        tokio::select! {
            () = closed.cancelled() => break,
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => hub.message(&session, text.as_str()).await,
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => hub.message(&session, text).await,
                    Err(_) => {
                        hub.fault(&session, SessionFault::Protocol("binary frame is not UTF-8".into()))
                            .await;
                    }
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => trace!(session_id = %session.id(), "control frame"),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(err)) => {
                    hub.fault(&session, SessionFault::Protocol(err.to_string())).await;
                    break;
                }
            },
        }
    }

    session.close();
    if let Err(err) = writer.await {
        warn!(session_id = %session.id(), error = %err, "writer task failed");
    }
    hub.disconnect(&session).await;
}

async fn write_loop<S>(mut ws_tx: S, mut outbound: Outbound, ping_every: Duration)
where
    S: futures::Sink<Message> + Unpin,
{
    let closed: CancellationToken = outbound.closed.clone();
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_every, ping_every);

    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(text) => {
                    if ws_tx.send(Message::Text(String::from(&*text).into())).await.is_err() {
                        debug!("socket write failed, closing");
                        break;
                    }
                }
                None => break,
            },
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                trace!("sent ping");
            }
        }
    }

    closed.cancel();
    let _ = ws_tx
        .send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "".into(),
        })))
        .await;
    let _ = ws_tx.close().await;
}
