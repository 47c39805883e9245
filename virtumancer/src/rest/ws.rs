//! `/ws`: one hub client per socket.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

use crate::error::ErrorCode;
use crate::hub::{ClientId, ClientMessage, HubHandle, ServerMessage, Subject};
use crate::rest::AppState;

pub async fn ws_handler(State(service): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let hub = service.hub.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: HubHandle) {
    let (client, mut outbound) = hub.register().await;
    let (mut sink, mut stream) = socket.split();

    // Ends when the hub drops the client (disconnect, eviction or shutdown).
    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(client, error = %e, "failed to encode message");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        let frame = tokio::select! {
            _ = &mut writer => break,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => handle_client_message(&hub, client, text.as_str()).await,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(client, error = %e, "websocket receive failed");
                break;
            }
        }
    }

    hub.unregister(client).await;
    writer.abort();
    debug!(client, "websocket closed");
}

async fn handle_client_message(hub: &HubHandle, client: ClientId, text: &str) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            hub.send_to(
                client,
                ServerMessage::Error {
                    subject: None,
                    code: ErrorCode::BadRequest,
                    message: format!("invalid message: {}", e),
                },
            )
            .await;
            return;
        }
    };

    match message {
        ClientMessage::Subscribe { subject } => hub.subscribe(client, subject).await,
        ClientMessage::Unsubscribe { subject } => hub.unsubscribe(client, subject).await,
        ClientMessage::HostSubscribe { host_id } => {
            hub.subscribe(client, Subject::Host(host_id)).await
        }
        ClientMessage::HostUnsubscribe { host_id } => {
            hub.unsubscribe(client, Subject::Host(host_id)).await
        }
    }
}
