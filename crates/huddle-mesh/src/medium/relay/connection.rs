//! Background WebSocket connection loop with auto-reconnect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use huddle_common::wire::{ClientFrame, ServerFrame};
use huddle_common::{MediumError, MediumEvent};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::{debug, error, info, warn};

use super::types::{lock, Pending, RelayMediumConfig};

// ---------------------------------------------------------------------------
// Ref Counter
// ---------------------------------------------------------------------------

/// Monotonically increasing ref counter for relay requests.
static REF_COUNTER: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_ref() -> u64 {
    REF_COUNTER.fetch_add(1, Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Connection Loop
// ---------------------------------------------------------------------------

/// Background task managing the WebSocket connection with auto-reconnect.
///
/// The heartbeat and forwarder tasks of a connection live in a `JoinSet`
/// owned by this future, so aborting it also closes the socket.
pub(crate) async fn connection_loop(
    config: RelayMediumConfig,
    pending: Arc<Mutex<Pending>>,
    connectivity: watch::Sender<bool>,
    outbound_rx: mpsc::UnboundedReceiver<ClientFrame>,
) {
    let outbound_rx = Arc::new(AsyncMutex::new(outbound_rx));
    let mut reconnect_delay = config.reconnect_delay_secs;

    loop {
        info!(url = %config.url, "Connecting to relay");

        match tokio::time::timeout(
            Duration::from_secs(15),
            tokio_tungstenite::connect_async(config.url.as_str()),
        )
        .await
        {
            Ok(Ok((ws_stream, _))) => {
                reconnect_delay = config.reconnect_delay_secs;
                lock(&pending).refusal = None;

                let (ws_write, ws_read) = ws_stream.split();
                let ws_write = Arc::new(AsyncMutex::new(ws_write));

                // Re-send live subscriptions; the relay answers each with a
                // fresh snapshot.
                let resubscribe: Vec<ClientFrame> = lock(&pending)
                    .subscriptions
                    .iter()
                    .map(|(sub, live)| ClientFrame::Subscribe {
                        msg_ref: next_ref(),
                        sub: *sub,
                        prefix: live.prefix.clone(),
                    })
                    .collect();
                if !resubscribe.is_empty() {
                    debug!(count = resubscribe.len(), "Resubscribing after connect");
                }
                {
                    let mut writer = ws_write.lock().await;
                    for frame in &resubscribe {
                        let _ = send_frame(&mut *writer, frame).await;
                    }
                }

                connectivity.send_replace(true);
                info!("Connected to relay");

                let mut tasks = JoinSet::new();
                tasks.spawn(heartbeat_task(
                    Arc::clone(&ws_write),
                    config.heartbeat_interval_secs,
                ));
                tasks.spawn(command_forwarder(
                    Arc::clone(&outbound_rx),
                    Arc::clone(&ws_write),
                ));
                drop(ws_write);

                // Process incoming frames.
                let mut read_stream = ws_read;
                while let Some(msg_result) = read_stream.next().await {
                    match msg_result {
                        Ok(WsMessage::Text(text)) => {
                            match serde_json::from_str::<ServerFrame>(&text) {
                                Ok(frame) => handle_server_frame(frame, &pending),
                                Err(e) => {
                                    debug!(error = %e, text = %text, "Unrecognized frame from relay");
                                }
                            }
                        }
                        Ok(WsMessage::Close(_)) => {
                            info!("Relay closed connection");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "WebSocket error");
                            break;
                        }
                        _ => {}
                    }
                }

                // Cleanup.
                tasks.shutdown().await;
                connectivity.send_replace(false);
                lock(&pending).fail_requests();
                // Frames queued while the socket was dying belong to
                // requests that were just failed.
                let mut rx = outbound_rx.lock().await;
                while rx.try_recv().is_ok() {}
            }
            Ok(Err(e)) => {
                let refusal = handshake_refusal(&e);
                if let Some(reason) = &refusal {
                    error!(reason = %reason, "Relay refused the connection");
                } else {
                    error!(error = %e, "Failed to connect to relay");
                }
                lock(&pending).refusal = refusal;
            }
            Err(_elapsed) => {
                error!("Relay connection timed out after 15s");
            }
        }

        // Exponential backoff reconnect.
        info!(
            delay = reconnect_delay,
            "Reconnecting in {} seconds", reconnect_delay
        );
        tokio::time::sleep(Duration::from_secs(reconnect_delay)).await;
        reconnect_delay = (reconnect_delay * 2).min(config.max_reconnect_delay_secs);
    }
}

/// The reason a failed handshake was an authorization refusal, if it was.
fn handshake_refusal(error: &WsError) -> Option<String> {
    match error {
        WsError::Http(response) => refusal_reason(response.status()),
        _ => None,
    }
}

fn refusal_reason(status: StatusCode) -> Option<String> {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Some(format!("relay answered {status}")),
        _ => None,
    }
}

/// Route one frame from the relay to the request or subscription it
/// belongs to.
pub(crate) fn handle_server_frame(frame: ServerFrame, pending: &Mutex<Pending>) {
    match frame {
        ServerFrame::Ack { msg_ref, key } => {
            if let Some(reply) = lock(pending).requests.remove(&msg_ref) {
                let _ = reply.send(Ok(key));
            }
        }
        ServerFrame::Error {
            msg_ref: Some(msg_ref),
            message,
        } => {
            if let Some(reply) = lock(pending).requests.remove(&msg_ref) {
                let _ = reply.send(Err(MediumError::Rejected(message)));
            }
        }
        ServerFrame::Error {
            msg_ref: None,
            message,
        } => {
            warn!(message = %message, "Relay reported an error");
        }
        ServerFrame::Added { sub, key, value } => {
            route(pending, sub, MediumEvent::Added { key, value });
        }
        ServerFrame::Removed { sub, key } => {
            route(pending, sub, MediumEvent::Removed { key });
        }
        ServerFrame::Pong => {}
    }
}

fn route(pending: &Mutex<Pending>, sub: u64, event: MediumEvent) {
    let mut state = lock(pending);
    let Some(live) = state.subscriptions.get(&sub) else {
        debug!(sub, "Event for unknown subscription");
        return;
    };
    if live.tx.send(event).is_err() {
        state.subscriptions.remove(&sub);
    }
}

async fn send_frame<S>(writer: &mut S, frame: &ClientFrame) -> Result<(), ()>
where
    S: futures_util::Sink<WsMessage> + Unpin,
{
    let Ok(json) = serde_json::to_string(frame) else {
        return Err(());
    };
    writer
        .send(WsMessage::Text(json.into()))
        .await
        .map_err(|_| ())
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

async fn heartbeat_task<S>(ws_write: Arc<AsyncMutex<S>>, interval_secs: u64)
where
    S: futures_util::Sink<WsMessage> + Unpin,
{
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        interval.tick().await;
        let mut writer = ws_write.lock().await;
        if send_frame(&mut *writer, &ClientFrame::Ping).await.is_err() {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Command Forwarder
// ---------------------------------------------------------------------------

async fn command_forwarder<S>(
    outbound_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<ClientFrame>>>,
    ws_write: Arc<AsyncMutex<S>>,
) where
    S: futures_util::Sink<WsMessage> + Unpin,
{
    let mut rx = outbound_rx.lock().await;
    while let Some(frame) = rx.recv().await {
        let mut writer = ws_write.lock().await;
        if send_frame(&mut *writer, &frame).await.is_err() {
            break;
        }
    }
}
