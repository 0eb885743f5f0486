// =============================================================================
// WebSocket endpoint: the subscription channel
// =============================================================================
//
// Clients connect to `/api/v1/ws` and drive subscriptions with JSON frames:
//
//   {"op":"subscribe","symbol":"600000.SH","period":"1m"}
//   {"op":"unsubscribe","symbol":"600000.SH","period":"1m"}
//
// The connection task owns the socket. Outbound traffic (bar and status
// events from the poller, acks and errors from here) arrives through an
// unbounded channel registered with the hub, so producers never block on a
// slow socket. A frame that fails schema validation earns an `error` event;
// the connection stays open. Disconnecting drops every subscription.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::hub::{ConnId, OutboundSender, SubscriptionHub};
use crate::state::AppState;
use crate::types::{ClientRequest, ServerMessage};

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let conn_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let (mut sender, mut receiver) = socket.split();
    info!(conn = %conn_id, "WebSocket connection established");

    loop {
        tokio::select! {
            // Outbound: frames queued by the poller or by inbound handling.
            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(e) = sender.send(Message::Text(frame)).await {
                            debug!(conn = %conn_id, error = %e, "send failed, disconnecting");
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Inbound: subscription requests and socket lifecycle frames.
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_frame(&state.hub, conn_id, &tx, &text);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!(conn = %conn_id, "close frame received");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(conn = %conn_id, error = %e, "receive error, disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    state.hub.remove(conn_id);
    info!(conn = %conn_id, "WebSocket connection closed");
}

/// Apply one inbound frame against the hub and queue the reply, if any.
fn handle_client_frame(hub: &SubscriptionHub, conn_id: ConnId, tx: &OutboundSender, text: &str) {
    let reply = |message: &ServerMessage| {
        if let Ok(frame) = serde_json::to_string(message) {
            // A closed channel just means we are tearing down.
            let _ = tx.send(frame);
        }
    };

    match serde_json::from_str::<ClientRequest>(text) {
        Err(e) => {
            debug!(conn = %conn_id, error = %e, "malformed client frame");
            reply(&ServerMessage::Error {
                reason: "invalid request".to_string(),
            });
        }
        Ok(ClientRequest::Subscribe { symbol, period }) => {
            match hub.subscribe(conn_id, tx, &symbol, period) {
                Ok(()) => {
                    debug!(conn = %conn_id, symbol = %symbol, period = %period, "subscribed");
                    reply(&ServerMessage::Subscribed { symbol, period });
                }
                Err(e) => reply(&ServerMessage::Error {
                    reason: e.to_string(),
                }),
            }
        }
        Ok(ClientRequest::Unsubscribe { symbol, period }) => {
            debug!(conn = %conn_id, symbol = %symbol, period = %period, "unsubscribed");
            hub.unsubscribe(conn_id, &symbol, period);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Period;

    fn setup() -> (
        SubscriptionHub,
        ConnId,
        OutboundSender,
        mpsc::UnboundedReceiver<String>,
    ) {
        let hub = SubscriptionHub::new(10);
        let (tx, rx) = mpsc::unbounded_channel();
        (hub, Uuid::new_v4(), tx, rx)
    }

    #[test]
    fn subscribe_acks_and_registers() {
        let (hub, conn, tx, mut rx) = setup();
        handle_client_frame(
            &hub,
            conn,
            &tx,
            r#"{"op":"subscribe","symbol":"600000.SH","period":"1m"}"#,
        );
        let frame = rx.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["op"], "subscribed");
        assert_eq!(value["symbol"], "600000.SH");
        assert_eq!(value["period"], "1m");
        assert_eq!(hub.get_active_symbols(), vec!["600000.SH"]);
    }

    #[test]
    fn malformed_frame_yields_error_event() {
        let (hub, conn, tx, mut rx) = setup();
        handle_client_frame(&hub, conn, &tx, "not json at all");
        let value: serde_json::Value =
            serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(value["op"], "error");
        assert_eq!(value["reason"], "invalid request");
        assert!(hub.get_active_symbols().is_empty());
    }

    #[test]
    fn bad_period_yields_error_event() {
        let (hub, conn, tx, mut rx) = setup();
        handle_client_frame(
            &hub,
            conn,
            &tx,
            r#"{"op":"subscribe","symbol":"600000.SH","period":"13m"}"#,
        );
        let value: serde_json::Value =
            serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(value["op"], "error");
    }

    #[test]
    fn unsubscribe_is_silent_and_removes() {
        let (hub, conn, tx, mut rx) = setup();
        handle_client_frame(
            &hub,
            conn,
            &tx,
            r#"{"op":"subscribe","symbol":"600000.SH","period":"1m"}"#,
        );
        let _ = rx.try_recv();
        handle_client_frame(
            &hub,
            conn,
            &tx,
            r#"{"op":"unsubscribe","symbol":"600000.SH","period":"1m"}"#,
        );
        assert!(rx.try_recv().is_err());
        assert!(hub.get_active_symbols().is_empty());
    }

    #[test]
    fn symbol_cap_surfaces_as_error_event() {
        let hub = SubscriptionHub::new(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Uuid::new_v4();
        handle_client_frame(
            &hub,
            conn,
            &tx,
            r#"{"op":"subscribe","symbol":"600000.SH","period":"1m"}"#,
        );
        let _ = rx.try_recv();
        handle_client_frame(
            &hub,
            conn,
            &tx,
            r#"{"op":"subscribe","symbol":"000001.SZ","period":"1m"}"#,
        );
        let value: serde_json::Value =
            serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(value["op"], "error");
        assert!(value["reason"]
            .as_str()
            .unwrap()
            .contains("active symbol limit"));
    }
}
