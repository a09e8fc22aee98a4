// ABOUTME: Axum WebSocket bridge that pumps frames between a socket and a Connection task.
// ABOUTME: Text frames are parsed into client messages; outbound messages are written as JSON text frames.

use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::response::Response;
use futures::{Sink, SinkExt, StreamExt};
use seqcast_core::{ClientMessage, CloseReason, ProtocolError, ServerMessage};
use tokio::sync::mpsc;

use crate::app_state::SharedState;
use crate::connection::{Connection, ConnectionContext, ConnectionEnd, Inbound};

const INBOUND_BUFFER: usize = 32;

/// WebSocket upgrade handler for `GET /ws`.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> Response {
    let ctx = state.connection_context();
    ws.on_upgrade(move |socket| serve_socket(socket, ctx))
}

/// WebSocket close code sent alongside each close reason.
pub fn close_code_for(reason: CloseReason) -> u16 {
    match reason {
        CloseReason::ServerShutdown => close_code::AWAY,
        CloseReason::ProtocolError => close_code::PROTOCOL,
        CloseReason::AuthTimeout => 4001,
        CloseReason::AuthFailed => 4003,
        CloseReason::HeartbeatTimeout => 4008,
        CloseReason::QueueOverflow => 4009,
    }
}

/// Run one client session over `socket`.
pub async fn serve_socket(socket: WebSocket, ctx: ConnectionContext) {
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(ctx.settings.queue_capacity);
    let (in_tx, in_rx) = mpsc::channel::<Inbound>(INBOUND_BUFFER);
    let mut session = tokio::spawn(Connection::new(ctx, out_tx).run(in_rx));
    let (mut sink, mut stream) = socket.split();

    // Resolves to true when the client went away, false when the session
    // stopped taking frames.
    let mut reader = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            let inbound = match frame {
                Ok(Message::Text(text)) => ClientMessage::parse(text.as_str()),
                Ok(Message::Binary(_)) => Err(ProtocolError::BinaryFrame),
                Ok(Message::Close(_)) | Err(_) => return true,
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            };
            if in_tx.send(inbound).await.is_err() {
                return false;
            }
        }
        true
    });

    let mut reader_done = false;
    let mut hung_up = false;
    let end = loop {
        tokio::select! {
            biased;
            end = &mut session => break end.ok(),
            joined = &mut reader, if !reader_done => {
                reader_done = true;
                if joined.unwrap_or(true) {
                    hung_up = true;
                    break None;
                }
            }
            msg = out_rx.recv() => match msg {
                Some(msg) => {
                    if write_message(&mut sink, &msg).await.is_err() {
                        hung_up = true;
                        break None;
                    }
                }
                None => break (&mut session).await.ok(),
            },
        }
    };

    if hung_up {
        // Closing the queue is what the session races against replay reads
        // and snapshot fetches, so they are abandoned right away.
        reader.abort();
        drop(out_rx);
        let _ = session.await;
        return;
    }
    reader.abort();

    let Some(ConnectionEnd::Closed(reason)) = end else {
        return;
    };

    if reason == CloseReason::QueueOverflow {
        // The client is not keeping up; skip whatever is still queued.
        let _ = write_message(&mut sink, &ServerMessage::Close { reason_code: reason }).await;
    } else {
        while let Ok(msg) = out_rx.try_recv() {
            if write_message(&mut sink, &msg).await.is_err() {
                return;
            }
        }
    }

    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: close_code_for(reason),
            reason: reason.as_str().into(),
        })))
        .await;
}

async fn write_message<S>(sink: &mut S, msg: &ServerMessage) -> Result<(), axum::Error>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let json = match msg.to_json() {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode outbound message");
            return Ok(());
        }
    };
    sink.send(Message::Text(json.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_codes_are_distinct() {
        let reasons = [
            CloseReason::AuthTimeout,
            CloseReason::AuthFailed,
            CloseReason::HeartbeatTimeout,
            CloseReason::QueueOverflow,
            CloseReason::ServerShutdown,
            CloseReason::ProtocolError,
        ];
        let mut codes: Vec<u16> = reasons.iter().map(|r| close_code_for(*r)).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), reasons.len());
        assert_eq!(close_code_for(CloseReason::ServerShutdown), 1001);
    }
}
