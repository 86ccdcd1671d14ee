//! `/ws` transport for the control channel.
//!
//! One task per connection reads frames and hands parsed envelopes to
//! [`ControlChannel`]; a writer task drains the session's outbound queue.

use crate::routes::AppState;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::Arc;
use tickscope_core::control::{
    ControlChannel, Dispatch, Envelope, Outbound, Registration, RegisterRequest, Role,
    SessionHandle, CLOSE_PROTOCOL_ERROR, MAX_MESSAGE_BYTES,
};
use tokio::sync::mpsc;

pub async fn handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| handle_socket(state, socket))
}

fn to_message(item: Outbound) -> Message {
    match item {
        Outbound::Text(text) => Message::Text(text),
        Outbound::Close { code, reason } => Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Owned(reason),
        })),
    }
}

fn text_of(message: Message) -> Option<String> {
    match message {
        Message::Text(text) => Some(text),
        Message::Binary(bytes) => String::from_utf8(bytes).ok(),
        _ => None,
    }
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let write_task = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            let closing = matches!(item, Outbound::Close { .. });
            if ws_sender.send(to_message(item)).await.is_err() || closing {
                break;
            }
        }
    });

    let channel = state.store.channel();
    let handle = match register(channel, &tx, ws_receiver.next().await) {
        Some(handle) => handle,
        None => {
            drop(tx);
            let _ = write_task.await;
            return;
        }
    };

    if handle.role == Role::Display {
        state.store.on_display_registered().await;
    }

    loop {
        let message = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = tx.closed() => break,
            message = ws_receiver.next() => message,
        };
        let message = match message {
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                tracing::debug!(session_id = handle.id, error = %e, "Socket read failed");
                break;
            }
        };
        let Some(text) = text_of(message) else {
            continue;
        };

        let envelope = match Envelope::parse(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                channel.reply(handle, &Envelope::error(e.to_string(), None));
                continue;
            }
        };

        match channel.dispatch(handle, envelope) {
            Ok(Dispatch::Done) => {}
            Ok(Dispatch::Server(command)) => {
                let store = Arc::clone(&state.store);
                tokio::spawn(async move {
                    let reply = store.handle_server_command(&command).await;
                    store.channel().reply(handle, &reply);
                });
            }
            Err(e) => {
                tracing::info!(session_id = handle.id, error = %e, "Closing session");
                let _ = tx.send(Outbound::Close {
                    code: CLOSE_PROTOCOL_ERROR,
                    reason: e.to_string(),
                });
                break;
            }
        }
    }

    channel.unregister(handle);
    drop(tx);
    let _ = write_task.await;
}

/// Handle the first frame, which must be a `register` message.
fn register(
    channel: &ControlChannel,
    tx: &mpsc::UnboundedSender<Outbound>,
    first: Option<Result<Message, axum::Error>>,
) -> Option<SessionHandle> {
    let text = first.and_then(|m| m.ok()).and_then(text_of)?;
    let request = Envelope::parse(&text).and_then(|e| RegisterRequest::from_envelope(&e));
    match request {
        Ok(request) => match channel.register(request, tx.clone()) {
            Registration::Accepted(handle) => Some(handle),
            // The channel already queued the close frame
            Registration::Rejected { .. } => None,
        },
        Err(e) => {
            tracing::debug!(error = %e, "Registration refused");
            let _ = tx.send(Outbound::Close {
                code: CLOSE_PROTOCOL_ERROR,
                reason: e.to_string(),
            });
            None
        }
    }
}
