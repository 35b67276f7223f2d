//! WebSocket fan-out transport.
//!
//! Binary frames carry audio in both directions. Text frames from the client
//! are control commands (`start` / `stop`, bare or as `{"type": "..."}`);
//! text frames to the client are [`ServerEvent`](vigil_core::ServerEvent) JSON.

use std::sync::atomic::Ordering;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};
use vigil_core::{outbound_channel, InboundFrame, Outbound};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub username: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Query(params): Query<ConnectParams>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, client_id, params.username))
}

async fn handle_socket(socket: WebSocket, state: AppState, client_id: String, username: Option<String>) {
    let (mut sender, mut receiver) = socket.split();

    let (outbound_tx, mut outbound_rx) = outbound_channel(state.engine.config().outbound_queue_depth);
    let handle = match state.engine.connect(username.as_deref(), outbound_tx) {
        Ok(handle) => handle,
        Err(e) => {
            state.transport.connections_rejected.fetch_add(1, Ordering::Relaxed);
            warn!(client_id = %client_id, error = %e, "connection rejected");
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };
    state.transport.connections_accepted.fetch_add(1, Ordering::Relaxed);
    let session = handle.id();
    info!(client_id = %client_id, session = %session, user = handle.display_name(), "client connected");

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let message = match frame {
                Outbound::Audio { bytes, .. } => Message::Binary(bytes.to_vec()),
                Outbound::Event(event) => match serde_json::to_string(&event) {
                    Ok(json) => Message::Text(json),
                    Err(e) => {
                        warn!(session = %session, error = %e, "event serialization failed");
                        continue;
                    }
                },
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let frame = match msg {
            Ok(Message::Binary(bytes)) => {
                state.transport.audio_frames_in.fetch_add(1, Ordering::Relaxed);
                InboundFrame::Audio(bytes)
            }
            Ok(Message::Text(text)) => match parse_command(&text) {
                Some(frame) => {
                    state.transport.control_frames_in.fetch_add(1, Ordering::Relaxed);
                    frame
                }
                None => {
                    debug!(session = %session, "ignoring unrecognised text frame");
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(session = %session, error = %e, "socket read failed");
                break;
            }
        };
        if !handle.push(frame).await {
            break;
        }
    }

    let name = state.engine.disconnect(handle);
    writer.abort();
    info!(client_id = %client_id, session = %session, user = %name, "client disconnected");
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientCommand {
    Start,
    Stop,
}

impl From<ClientCommand> for InboundFrame {
    fn from(command: ClientCommand) -> Self {
        match command {
            ClientCommand::Start => InboundFrame::Start,
            ClientCommand::Stop => InboundFrame::Stop,
        }
    }
}

fn parse_command(text: &str) -> Option<InboundFrame> {
    let trimmed = text.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "start" => return Some(InboundFrame::Start),
        "stop" => return Some(InboundFrame::Stop),
        _ => {}
    }
    serde_json::from_str::<ClientCommand>(trimmed).ok().map(Into::into)
}
