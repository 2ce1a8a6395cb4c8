//! services/reader/src/web/ws_handler.rs
//!
//! This is the main entry point and control loop for a chapter-view
//! WebSocket connection. It brackets the view's lifecycle: mount (content
//! fetch, snapshot loads, session open), the interaction loop, and teardown
//! (timer cancellation, final flush, session close) on every exit path.

use crate::web::{
    progress_task::{progress_ticker, teardown_view},
    protocol::{ClientMessage, ServerMessage},
    state::{AppState, ChapterViewState, SELECTION_SETTLE},
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    Extension,
};
use futures::{
    stream::{SplitSink, StreamExt},
    SinkExt,
};
use marginalia_core::domain::CommentThread;
use marginalia_core::ports::PortError;
use std::sync::Arc;
use std::time::Instant;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

type WsSender = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// The handler for upgrading HTTP requests to WebSocket connections.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>, // from auth middleware
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state, user_id))
}

async fn send_message(sender: &WsSender, msg: &ServerMessage) -> bool {
    let json = serde_json::to_string(msg).expect("server messages always serialize");
    sender
        .lock()
        .await
        .send(Message::Text(json.into()))
        .await
        .is_ok()
}

async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>, user_id: Uuid) {
    info!("New chapter view connection for user {user_id}");

    // The sender is wrapped in an Arc<Mutex<>> to allow for shared mutable
    // access from the settle tasks.
    let (sender, mut receiver) = socket.split();
    let ws_sender: WsSender = Arc::new(Mutex::new(sender));

    // --- 1. Mount Phase ---
    let view_lock: Arc<Mutex<ChapterViewState>>;
    if let Some(Ok(Message::Text(open_json))) = receiver.next().await {
        match serde_json::from_str::<ClientMessage>(&open_json) {
            Ok(ClientMessage::Open {
                book_slug,
                chapter_slug,
                viewport_width,
                viewport_height,
                user_agent,
            }) => {
                info!("Mounting chapter view {book_slug}/{chapter_slug}");
                match ChapterViewState::open(
                    app_state.clone(),
                    user_id,
                    &book_slug,
                    &chapter_slug,
                    viewport_width,
                    viewport_height,
                    user_agent,
                )
                .await
                {
                    Ok((state, chapter, html)) => {
                        let ready = ServerMessage::ViewReady {
                            chapter,
                            html,
                            restore_scroll_pct: state.scroll_pct,
                            time_spent_seconds: state.time_spent_seconds,
                            threads: state.threads(),
                        };
                        view_lock = Arc::new(Mutex::new(state));
                        if !send_message(&ws_sender, &ready).await {
                            error!("Failed to send ViewReady message.");
                            return;
                        }
                    }
                    Err(e) => {
                        // Terminal for this view: the client renders an
                        // error state and no retry happens.
                        let message = match &e {
                            PortError::NotFound(_) => "Chapter not found".to_string(),
                            _ => "Failed to load chapter content".to_string(),
                        };
                        warn!("Chapter view mount failed: {e}");
                        let _ =
                            send_message(&ws_sender, &ServerMessage::ContentError { message })
                                .await;
                        return;
                    }
                }
            }
            _ => {
                error!("First message was not a valid Open message.");
                let _ = send_message(
                    &ws_sender,
                    &ServerMessage::Error {
                        message: "Expected an open message".to_string(),
                    },
                )
                .await;
                return;
            }
        }
    } else {
        error!("Client disconnected before sending Open message.");
        return;
    }

    // --- 2. Timers + Main Message Loop ---
    let cancellation_token = CancellationToken::new();
    let ticker_handle: JoinHandle<()> = {
        let app_state = app_state.clone();
        let view_lock = view_lock.clone();
        let token = cancellation_token.clone();
        tokio::spawn(async move {
            progress_ticker(app_state, view_lock, token).await;
        })
    };

    loop {
        if let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_client_message(
                        text.to_string(),
                        &app_state,
                        &view_lock,
                        &ws_sender,
                    )
                    .await;
                }
                Message::Close(_) => {
                    info!("Client sent close message.");
                    break;
                }
                _ => {}
            }
        } else {
            info!("Client disconnected.");
            break;
        }
    }

    // --- 3. Teardown (every exit path) ---
    cancellation_token.cancel();
    let _ = ticker_handle.await;
    teardown_view(&app_state, &view_lock).await;
    info!("Chapter view connection closed.");
}

/// Helper function to handle the logic for different `ClientMessage` variants.
async fn handle_client_message(
    text: String,
    app_state: &Arc<AppState>,
    view_lock: &Arc<Mutex<ChapterViewState>>,
    ws_sender: &WsSender,
) {
    let client_msg = match serde_json::from_str::<ClientMessage>(&text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Failed to deserialize client message: {e}");
            return;
        }
    };

    match client_msg {
        ClientMessage::Scroll {
            offset,
            document_height,
            viewport_height,
        } => {
            view_lock
                .lock()
                .await
                .observe_scroll(offset, document_height, viewport_height, Instant::now());
        }
        ClientMessage::Activity => {
            view_lock.lock().await.note_activity(Instant::now());
        }
        ClientMessage::PointerDown => {
            view_lock.lock().await.pointer_down(Instant::now());
        }
        ClientMessage::SelectionChanged { text, container_id } => {
            view_lock
                .lock()
                .await
                .selection_changed(&text, &container_id, Instant::now());
        }
        ClientMessage::PointerUp => {
            let epoch = view_lock.lock().await.pointer_up(Instant::now());
            // Let the selection stabilize before inspecting it. The epoch
            // token makes a settle task from a superseded selection a no-op.
            let view_lock = view_lock.clone();
            let ws_sender = ws_sender.clone();
            tokio::spawn(async move {
                tokio::time::sleep(SELECTION_SETTLE).await;
                let anchor = view_lock.lock().await.settle_selection(epoch);
                if let Some(anchor_text) = anchor {
                    let _ =
                        send_message(&ws_sender, &ServerMessage::ComposerOpened { anchor_text })
                            .await;
                }
            });
        }
        ClientMessage::SubmitComment { content, reply_to } => {
            submit_comment(app_state, view_lock, ws_sender, &content, reply_to).await;
        }
        ClientMessage::CancelComposer => {
            view_lock.lock().await.cancel_composer();
        }
        ClientMessage::ToggleResolved { comment_id } => {
            toggle_resolved(app_state, view_lock, ws_sender, comment_id).await;
        }
        ClientMessage::SetShowResolved { show } => {
            let threads = {
                let mut view = view_lock.lock().await;
                view.show_resolved = show;
                view.threads()
            };
            let _ = send_message(ws_sender, &ServerMessage::Threads { threads }).await;
        }
        ClientMessage::Open { .. } => {
            warn!("Received subsequent Open message, which is ignored.");
        }
    }
}

/// Validates and persists a submission, updating the local cache only after
/// the store confirms the insert. The composer resets to idle in every
/// branch: success, rejection, and store failure alike.
async fn submit_comment(
    app_state: &Arc<AppState>,
    view_lock: &Arc<Mutex<ChapterViewState>>,
    ws_sender: &WsSender,
    content: &str,
    reply_to: Option<Uuid>,
) {
    let submission = view_lock.lock().await.resolve_submission(content, reply_to);

    let new_comment = match submission {
        Ok(new_comment) => new_comment,
        Err(message) => {
            view_lock.lock().await.cancel_composer();
            let _ = send_message(ws_sender, &ServerMessage::CommentError { message }).await;
            return;
        }
    };

    match app_state.store.insert_comment(new_comment).await {
        Ok(comment) => {
            let threads = {
                let mut view = view_lock.lock().await;
                view.apply_new_comment(comment);
                view.cancel_composer();
                view.threads()
            };
            let _ = send_message(ws_sender, &ServerMessage::Threads { threads }).await;
        }
        Err(e) => {
            error!("Failed to save comment: {e}");
            view_lock.lock().await.cancel_composer();
            let _ = send_message(
                ws_sender,
                &ServerMessage::CommentError {
                    message: "Failed to save comment".to_string(),
                },
            )
            .await;
        }
    }
}

/// Flips the resolved flag on one comment: reads the current flag, writes
/// the flip to the store, and applies it to the local cache only after the
/// store confirms. On any failure the cache is left untouched and the
/// user-facing message is returned for `CommentError`.
pub async fn apply_resolved_toggle(
    app_state: &Arc<AppState>,
    view_lock: &Arc<Mutex<ChapterViewState>>,
    comment_id: Uuid,
) -> Result<Vec<CommentThread>, String> {
    let current = view_lock
        .lock()
        .await
        .resolved_state(comment_id)
        .ok_or_else(|| "Comment not found".to_string())?;

    app_state
        .store
        .set_comment_resolved(comment_id, !current)
        .await
        .map_err(|e| {
            error!("Failed to toggle comment resolution: {e}");
            "Failed to update comment".to_string()
        })?;

    let mut view = view_lock.lock().await;
    view.apply_resolved(comment_id, !current);
    Ok(view.threads())
}

async fn toggle_resolved(
    app_state: &Arc<AppState>,
    view_lock: &Arc<Mutex<ChapterViewState>>,
    ws_sender: &WsSender,
    comment_id: Uuid,
) {
    match apply_resolved_toggle(app_state, view_lock, comment_id).await {
        Ok(threads) => {
            let _ = send_message(ws_sender, &ServerMessage::Threads { threads }).await;
        }
        Err(message) => {
            let _ = send_message(ws_sender, &ServerMessage::CommentError { message }).await;
        }
    }
}
