//! Websocket endpoint of Websocket-class operations.
//!
//! The peer's secret is checked and its channel bound before the upgrade, so
//! a bad secret is an ordinary HTTP error. After the upgrade the socket is
//! pumped to and from the operation's end of the [`Channel`].

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use hostd_operations::{Channel, OperationClass};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::response::AppError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SecretQuery {
    #[serde(default)]
    pub secret: String,
}

/// `GET /1.0/operations/:id/websocket?secret=`
#[instrument(skip(state, ws, query))]
pub async fn operation_websocket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<SecretQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let op = state.registry.get(&id)?;
    if op.class() != OperationClass::Websocket {
        return Err(AppError::BadRequest(
            "Only websocket operations can be connected".to_string(),
        ));
    }

    let (local, remote) = Channel::pair();
    state.registry.connect(&id, &query.secret, remote).await?;
    info!("Websocket peer bound to operation {}", id);

    Ok(ws
        .on_upgrade(move |socket| bridge(socket, local, id))
        .into_response())
}

/// Pump messages between the socket and the channel until either side ends.
async fn bridge(socket: WebSocket, channel: Channel, id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = channel.split();

    // Operation -> peer
    let forward_id = id.clone();
    let mut forward_task = tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if let Err(e) = ws_tx.send(Message::Binary(data)).await {
                debug!("Websocket send error for operation {}: {}", forward_id, e);
                return;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    // Peer -> operation
    let receive_id = id.clone();
    let mut receive_task = tokio::spawn(async move {
        while let Some(msg) = ws_rx.next().await {
            let data = match msg {
                Ok(Message::Binary(data)) => data,
                Ok(Message::Text(text)) => text.into_bytes(),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!("Websocket error for operation {}: {}", receive_id, e);
                    break;
                }
            };
            if tx.send(data).await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut forward_task => receive_task.abort(),
        _ = &mut receive_task => forward_task.abort(),
    }

    info!("Websocket disconnected from operation {}", id);
}
