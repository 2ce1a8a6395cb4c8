//! services/reader/src/web/progress_task.rs
//!
//! This module contains the asynchronous "worker" task that runs the timers
//! for one mounted chapter view: the one-second active-time accrual, the
//! idle poll, and the debounced progress flush.
//!
//! The task is bracketed by a `CancellationToken`: the WebSocket handler
//! cancels it on every exit path and then performs the final unconditional
//! flush and session close itself, so no timer outlives its view.

use crate::web::state::{
    AppState, ChapterViewState, ACCRUAL_TICK, FLUSH_WINDOW, IDLE_POLL_INTERVAL,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Runs the view's timers until cancelled.
pub async fn progress_ticker(
    app_state: Arc<AppState>,
    view_lock: Arc<Mutex<ChapterViewState>>,
    cancellation_token: CancellationToken,
) {
    let mut accrual = tokio::time::interval(ACCRUAL_TICK);
    let mut idle_poll = tokio::time::interval(IDLE_POLL_INTERVAL);
    let mut flush = tokio::time::interval(FLUSH_WINDOW);

    // An interval's first tick completes immediately; consume those so the
    // first real accrual happens one full tick after mount.
    accrual.tick().await;
    idle_poll.tick().await;
    flush.tick().await;

    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => {
                debug!("Progress ticker stopped.");
                return;
            }
            _ = accrual.tick() => {
                view_lock.lock().await.tick_second();
            }
            _ = idle_poll.tick() => {
                view_lock.lock().await.poll_idle(Instant::now());
            }
            _ = flush.tick() => {
                let due = view_lock.lock().await.should_flush(Instant::now());
                if due {
                    flush_progress(&app_state, &view_lock).await;
                }
            }
        }
    }
}

/// Upserts the current in-memory progress values.
///
/// Write failures are logged and swallowed: progress persistence is
/// best-effort telemetry and must never interrupt the reading experience.
/// The payload snapshots the values at call time, so the racing interval
/// and unmount writes both land on the same upsert key with last write
/// visible.
pub async fn flush_progress(app_state: &Arc<AppState>, view_lock: &Arc<Mutex<ChapterViewState>>) {
    let payload = {
        let mut view = view_lock.lock().await;
        let payload = view.progress_payload(Utc::now());
        view.mark_flushed(Instant::now());
        payload
    };

    if let Err(e) = app_state.store.upsert_progress(payload).await {
        warn!("Progress write failed: {e}");
    }
}

/// Tears a view down: final unconditional flush, then the session close.
///
/// The close write is only attempted when the open write succeeded and
/// returned an id; a dangling open session is an accepted failure mode.
pub async fn teardown_view(app_state: &Arc<AppState>, view_lock: &Arc<Mutex<ChapterViewState>>) {
    flush_progress(app_state, view_lock).await;

    let (session_id, max_scroll_pct) = {
        let view = view_lock.lock().await;
        (view.session_id, view.max_scroll_pct)
    };

    if let Some(session_id) = session_id {
        if let Err(e) = app_state
            .store
            .close_session(session_id, Utc::now(), max_scroll_pct)
            .await
        {
            warn!("Failed to close reading session {session_id}: {e}");
        }
    }
}
