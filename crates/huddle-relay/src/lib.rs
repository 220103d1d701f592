//! huddle-relay: WebSocket signaling relay for huddle voice rooms.
//!
//! Keeps one shared record store for every connected client. Clients write,
//! delete and append records, subscribe to key prefixes, and register writes
//! the relay commits on their behalf once their socket is gone. Payloads are
//! opaque JSON; the relay never interprets room or signaling semantics.

pub mod connection;
pub mod hub;

use std::time::Duration;

use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;

pub use crate::connection::handle_connection;
pub use crate::hub::Hub;

/// Accept connections on `listener` forever.
pub async fn serve(listener: TcpListener, hub: Hub, idle_timeout: Duration) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let hub = hub.clone();
                tokio::spawn(async move {
                    match accept_async(stream).await {
                        Ok(ws) => handle_connection(ws, addr, hub, idle_timeout).await,
                        Err(e) => {
                            tracing::warn!(peer = %addr, error = %e, "WS handshake failed");
                        }
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "TCP accept error");
            }
        }
    }
}
