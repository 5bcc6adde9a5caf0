use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use tvdesk_types::api::Handshake;
use tvdesk_types::events::ClientCommand;

use crate::dispatcher::Dispatcher;
use crate::registry::ConnectionId;

/// Longest slice of a bad frame echoed into the log.
const LOGGED_FRAME_CHARS: usize = 200;

/// Drive one WebSocket from upgrade to close.
///
/// A writer task forwards outbound events and runs the heartbeat; the reader
/// handles commands one at a time, so a connection's commands never overlap.
/// Whichever side ends first stops the other, then the connection is cleaned up.
/// The writer is aborted outright; the reader is asked to stop between frames.
pub async fn handle_socket(socket: WebSocket, dispatcher: Dispatcher, handshake: Handshake) {
    let mut handle = dispatcher.connect(&handshake).await;
    let Some(mut events) = handle.take_events() else {
        handle.close().await;
        return;
    };
    let conn_id = handle.id();
    let label = format!("{} ({})", handle.identity().display_name, handle.identity().user_id);

    let (mut sender, receiver) = socket.split();

    // Heartbeat: set by the reader on Pong, consumed by the writer each tick.
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();

    let heartbeat_interval = dispatcher.config().heartbeat_interval;
    let send_label = label.clone();
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Could not encode {} for {}: {}", event.name(), send_label, e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("{} heartbeat timeout (missed {} pongs), dropping connection", send_label, missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let (stop_reader, reader_stopped) = oneshot::channel();
    let mut recv_task = tokio::spawn(read_frames(
        receiver,
        dispatcher.clone(),
        conn_id,
        label,
        pong_received,
        reader_stopped,
    ));

    tokio::select! {
        _ = &mut send_task => {
            // Let a command already being handled finish before cleanup.
            let _ = stop_reader.send(());
            let _ = recv_task.await;
        }
        _ = &mut recv_task => send_task.abort(),
    }

    handle.close().await;
}

/// Reader half of a connection: parse and handle frames one at a time until
/// the client closes, the stream ends or `stop` fires.
///
/// `stop` is only checked between frames, so a command that has started is
/// always carried through to its broadcasts.
pub async fn read_frames<S>(
    mut frames: S,
    dispatcher: Dispatcher,
    conn_id: ConnectionId,
    label: String,
    pong_received: Arc<AtomicBool>,
    mut stop: oneshot::Receiver<()>,
) where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        let msg = tokio::select! {
            biased;
            _ = &mut stop => break,
            msg = frames.next() => msg,
        };
        let Some(Ok(msg)) = msg else { break };

        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(command) => {
                    debug!("{} -> {}", label, command.name());
                    dispatcher.handle(conn_id, command).await;
                }
                Err(e) => {
                    warn!(
                        "{} bad command: {} -- raw: {}",
                        label,
                        e,
                        truncate(&text, LOGGED_FRAME_CHARS)
                    );
                    dispatcher
                        .reject_frame(conn_id, &frame_type(&text), &format!("malformed command: {e}"))
                        .await;
                }
            },
            Message::Binary(_) => {
                dispatcher
                    .reject_frame(conn_id, "binary", "binary frames are not supported")
                    .await;
            }
            Message::Pong(_) => {
                pong_received.store(true, Ordering::Release);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// The `type` tag of a frame that failed to parse, when it has one.
fn frame_type(text: &str) -> String {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}
