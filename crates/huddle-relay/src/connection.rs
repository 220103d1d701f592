//! Per-connection handler: register with the hub, then pump frames both
//! ways until the client closes or goes idle.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use huddle_common::wire::{ClientFrame, ServerFrame};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use crate::hub::Hub;

/// Handle a single WebSocket connection.
pub async fn handle_connection(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    addr: SocketAddr,
    hub: Hub,
    idle_timeout: Duration,
) {
    let (mut sink, mut stream) = ws.split();
    let (connection, mut outbound) = hub.register().await;
    info!(peer = %addr, connection, "Client connected");

    let mut last_seen = Instant::now();
    loop {
        tokio::select! {
            Some(frame) = outbound.recv() => {
                if send_frame(&mut sink, &frame).await.is_err() {
                    break;
                }
            }

            _ = tokio::time::sleep_until(last_seen + idle_timeout) => {
                info!(peer = %addr, connection, "Client idle, closing");
                let _ = sink.send(Message::Close(None)).await;
                break;
            }

            incoming = stream.next() => {
                last_seen = Instant::now();
                match incoming {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(frame) => hub.apply(connection, frame).await,
                        Err(e) => {
                            debug!(connection, error = %e, "Invalid frame");
                            hub.reject(connection, request_ref(&text), e.to_string()).await;
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(peer = %addr, error = %e, "WS error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    hub.disconnect(connection).await;
    info!(peer = %addr, connection, "Client disconnected");
}

/// Best-effort recovery of the `ref` of a frame that failed to parse, so the
/// client's request fails immediately instead of timing out.
fn request_ref(text: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()?
        .get("ref")?
        .as_u64()
}

/// Send a ServerFrame as a JSON text frame.
async fn send_frame(
    sink: &mut futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
        Message,
    >,
    frame: &ServerFrame,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let json = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(e) => {
            debug!(error = %e, "Failed to encode frame");
            return Ok(());
        }
    };
    sink.send(Message::Text(json.into())).await
}
