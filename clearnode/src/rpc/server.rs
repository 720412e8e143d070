use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tracing::*;

use super::handler::{self, ConnectionState};
use crate::broker::Broker;

pub fn router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/ws", get(upgrade))
        .with_state(broker)
}

pub async fn serve(broker: Arc<Broker>, listen_address: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen_address).await?;
    info!(address = %listener.local_addr()?, "rpc server listening");
    axum::serve(listener, router(broker)).await?;
    Ok(())
}

async fn upgrade(ws: WebSocketUpgrade, State(broker): State<Arc<Broker>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection(socket, broker))
}

/// Serves one client: requests in order, interleaved with notifications for the wallet the connection authenticated
/// as.
async fn connection(socket: WebSocket, broker: Arc<Broker>) {
    let (mut sender, mut receiver) = socket.split();
    let mut notifications = BroadcastStream::new(broker.notifier().subscribe());
    let mut state = ConnectionState::default();
    debug!("connection opened");

    loop {
        tokio::select! {
            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let response = handler::handle(&broker, &mut state, &text).await;
                    if sender.send(Message::Text(response)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Pings are answered by axum itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%e, "connection failed");
                    break;
                }
            },
            notification = notifications.next() => match notification {
                Some(Ok(notification)) if Some(notification.wallet) == state.wallet => {
                    let text = match handler::notification_text(&broker, notification.kind.method(), notification.params) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(%e, "failed to render notification");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    warn!(wallet = ?state.wallet, skipped, "connection missed notifications");
                }
                None => break,
            },
        }
    }
    debug!(wallet = ?state.wallet, "connection closed");
}
