//! Chat WebSocket ingress.
//!
//! All chat traffic goes through the admission queue; this handler only
//! validates, estimates tokens, enqueues and replies with the queue
//! acknowledgement. Streaming back to the client happens in the worker
//! via the multiplexer; every outgoing frame for a handle flows
//! through the same mux channel, which is what preserves the
//! `queued → processing → token* → done/error` order.

use axum::{
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gantry_foundation::persistence::ConversationStore;
use gantry_kernel::frames::{ClientFrame, HistoryMessage, ServerFrame};
use gantry_kernel::request::{ChatRequest, OriginTier, estimate_tokens};
use gantry_kernel::route::RouteKind;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Caller identity until token verification fronts this endpoint.
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub tier: Option<String>,
}

/// `GET /ws/chat/{conversation_id}`
pub async fn chat_websocket(
    ws: WebSocketUpgrade,
    Path(conversation_id): Path<String>,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, conversation_id, query, state))
}

async fn handle_socket(
    socket: WebSocket,
    conversation_id: String,
    query: WsQuery,
    state: AppState,
) {
    let user_id = query.user_id.unwrap_or_else(|| "anonymous".to_string());
    let tier = match query.tier.as_deref() {
        Some("priority") => OriginTier::Priority,
        Some("admin") => OriginTier::Admin,
        _ => OriginTier::Normal,
    };

    // Unique per connection so a reconnect cannot hijack frames meant
    // for the previous socket.
    let handle = format!("web_{}_{}", conversation_id, Uuid::new_v4().simple());
    let mut frames = state.mux.register(&handle);
    info!(conversation_id = %conversation_id, handle = %handle, "chat client connected");

    let (mut sink, mut stream) = socket.split();

    // Pump task: mux frames → socket, single writer per connection.
    let pump = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = stream.next().await {
        let Ok(message) = message else {
            break;
        };
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        let frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                state
                    .mux
                    .send(
                        &handle,
                        ServerFrame::Error {
                            error: format!("unrecognised frame: {e}"),
                        },
                    )
                    .await;
                continue;
            }
        };

        match frame {
            ClientFrame::Message {
                content,
                model,
                temperature,
                thinking,
                file_refs,
            } => {
                if content.trim().is_empty() && file_refs.is_empty() {
                    state
                        .mux
                        .send(
                            &handle,
                            ServerFrame::Error {
                                error: "message content or file attachments required".into(),
                            },
                        )
                        .await;
                    continue;
                }

                let mut request =
                    ChatRequest::new(&handle, &conversation_id, &user_id, content).with_tier(tier);
                request.model = model;
                request.temperature = temperature;
                request.thinking = thinking;
                request.file_refs = file_refs;
                if request.has_image_attachment() {
                    request.classification = Some(RouteKind::Vision);
                }
                request.estimated_tokens = estimate_tokens(&request.content_with_files());

                let request_id = request.id.clone();
                match state.queue.enqueue(request) {
                    Ok(position) => {
                        debug!(request_id = %request_id, position = position, "request enqueued");
                        state
                            .mux
                            .send(
                                &handle,
                                ServerFrame::Queued {
                                    request_id,
                                    queue_position: position,
                                },
                            )
                            .await;
                    }
                    Err(e) => {
                        warn!(error = %e, "enqueue rejected");
                        state
                            .mux
                            .send(&handle, ServerFrame::Error { error: e.to_string() })
                            .await;
                    }
                }
            }

            ClientFrame::Ping => {
                state.mux.send(&handle, ServerFrame::Pong).await;
            }

            ClientFrame::History => {
                let frame = match state.conversations.all_messages(&conversation_id).await {
                    Ok(messages) => ServerFrame::History {
                        conversation_id: conversation_id.clone(),
                        messages: messages.iter().map(HistoryMessage::from).collect(),
                    },
                    Err(e) => ServerFrame::Error {
                        error: format!("failed to fetch history: {e}"),
                    },
                };
                state.mux.send(&handle, frame).await;
            }

            ClientFrame::Close => {
                let frame = match state.conversations.delete_conversation(&conversation_id).await {
                    Ok(deleted_count) => {
                        info!(
                            conversation_id = %conversation_id,
                            deleted = deleted_count,
                            "conversation closed"
                        );
                        ServerFrame::CloseComplete {
                            conversation_id: conversation_id.clone(),
                            deleted_count,
                        }
                    }
                    Err(e) => ServerFrame::Error {
                        error: format!("failed to close conversation: {e}"),
                    },
                };
                state.mux.send(&handle, frame).await;
            }
        }
    }

    // Disconnect: invalidate the handle, which also raises client-gone
    // for any worker mid-stream on this connection.
    state.mux.unregister(&handle);
    pump.abort();
    info!(handle = %handle, "chat client disconnected");
}
