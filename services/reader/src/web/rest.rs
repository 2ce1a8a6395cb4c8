//! services/reader/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST endpoints (engagement analytics
//! and supplementary content) and the master definition for the OpenAPI
//! specification.

use crate::web::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Json},
};
use marginalia_core::domain::{Chapter, Comment, ReadingProgress, ReadingSession};
use marginalia_core::ports::PortError;
use serde::Serialize;
use std::sync::Arc;
use tracing::error;
use utoipa::{OpenApi, ToSchema};

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        book_analytics_handler,
        supplementary_handler,
    ),
    components(
        schemas(BookAnalytics, ChapterStats)
    ),
    tags(
        (name = "Marginalia Reader API", description = "Engagement analytics and supplementary content for the private reading platform.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response Structs
//=========================================================================================

/// Per-chapter engagement figures.
#[derive(Serialize, ToSchema, Debug, PartialEq)]
pub struct ChapterStats {
    pub slug: String,
    pub title: String,
    pub number: u32,
    pub total_readers: u64,
    pub completed_readers: u64,
    pub avg_scroll_pct: u8,
    pub total_time_minutes: u64,
    pub session_count: u64,
    pub avg_session_minutes: u64,
    pub comment_count: u64,
    pub unresolved_comments: u64,
}

/// The full analytics payload for one book.
#[derive(Serialize, ToSchema, Debug)]
pub struct BookAnalytics {
    pub chapters: Vec<ChapterStats>,
    pub total_sessions: u64,
    pub total_reading_minutes: u64,
    pub avg_completion_rate_pct: u8,
    pub total_comments: u64,
}

//=========================================================================================
// Aggregation
//=========================================================================================

/// Folds the book-scoped rows into per-chapter and overall figures.
pub fn compute_book_analytics(
    chapters: &[Chapter],
    progress: &[ReadingProgress],
    sessions: &[ReadingSession],
    comments: &[Comment],
) -> BookAnalytics {
    let chapter_stats: Vec<ChapterStats> = chapters
        .iter()
        .map(|chapter| {
            let chapter_progress: Vec<&ReadingProgress> = progress
                .iter()
                .filter(|p| p.chapter_slug == chapter.slug)
                .collect();
            let chapter_sessions: Vec<&ReadingSession> = sessions
                .iter()
                .filter(|s| s.chapter_slug == chapter.slug)
                .collect();
            let chapter_comments: Vec<&Comment> = comments
                .iter()
                .filter(|c| c.chapter_slug == chapter.slug)
                .collect();

            let total_readers = chapter_progress.len() as u64;
            let completed_readers = chapter_progress
                .iter()
                .filter(|p| p.completed_at.is_some())
                .count() as u64;
            let avg_scroll_pct = if total_readers > 0 {
                let sum: u64 = chapter_progress.iter().map(|p| p.scroll_pct as u64).sum();
                ((sum as f64 / total_readers as f64).round()) as u8
            } else {
                0
            };
            let total_seconds: u64 = chapter_progress
                .iter()
                .map(|p| p.time_spent_seconds)
                .sum();
            let total_time_minutes = ((total_seconds as f64) / 60.0).round() as u64;

            let session_count = chapter_sessions.len() as u64;
            let avg_session_minutes = if session_count > 0 {
                // Sessions that never closed contribute zero but still
                // count toward the denominator.
                let closed_minutes: f64 = chapter_sessions
                    .iter()
                    .filter_map(|s| {
                        s.ended_at
                            .map(|end| (end - s.started_at).num_seconds() as f64 / 60.0)
                    })
                    .sum();
                (closed_minutes / session_count as f64).round() as u64
            } else {
                0
            };

            ChapterStats {
                slug: chapter.slug.clone(),
                title: chapter.title.clone(),
                number: chapter.number,
                total_readers,
                completed_readers,
                avg_scroll_pct,
                total_time_minutes,
                session_count,
                avg_session_minutes,
                comment_count: chapter_comments.len() as u64,
                unresolved_comments: chapter_comments
                    .iter()
                    .filter(|c| !c.is_resolved)
                    .count() as u64,
            }
        })
        .collect();

    let total_reading_seconds: u64 = progress.iter().map(|p| p.time_spent_seconds).sum();
    let avg_completion_rate_pct = if chapter_stats.is_empty() {
        0
    } else {
        let rate_sum: f64 = chapter_stats
            .iter()
            .map(|c| {
                if c.total_readers > 0 {
                    c.completed_readers as f64 / c.total_readers as f64 * 100.0
                } else {
                    0.0
                }
            })
            .sum();
        (rate_sum / chapter_stats.len() as f64).round() as u8
    };

    BookAnalytics {
        chapters: chapter_stats,
        total_sessions: sessions.len() as u64,
        total_reading_minutes: ((total_reading_seconds as f64) / 60.0).round() as u64,
        avg_completion_rate_pct,
        total_comments: comments.len() as u64,
    }
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// Engagement analytics for one book: per-chapter reader, completion,
/// scroll, time, session and comment figures plus overall totals.
#[utoipa::path(
    get,
    path = "/books/{book_slug}/analytics",
    responses(
        (status = 200, description = "Engagement analytics for the book", body = BookAnalytics),
        (status = 404, description = "Book not found"),
        (status = 500, description = "Internal server error")
    ),
    params(
        ("book_slug" = String, Path, description = "The book's URL slug.")
    )
)]
pub async fn book_analytics_handler(
    State(app_state): State<Arc<AppState>>,
    Path(book_slug): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let book = app_state
        .store
        .resolve_book(&book_slug)
        .await
        .map_err(|e| match e {
            PortError::NotFound(_) => (StatusCode::NOT_FOUND, "Book not found".to_string()),
            e => {
                error!("Failed to resolve book: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to load analytics".to_string(),
                )
            }
        })?;

    let internal = |e: PortError| {
        error!("Failed to load analytics data: {e}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to load analytics".to_string(),
        )
    };

    let manifest = app_state
        .content
        .load_manifest(&book_slug)
        .await
        .map_err(internal)?;
    let progress = app_state
        .store
        .progress_for_book(book.id)
        .await
        .map_err(internal)?;
    let sessions = app_state
        .store
        .sessions_for_book(book.id)
        .await
        .map_err(internal)?;
    let comments = app_state
        .store
        .comments_for_book(book.id)
        .await
        .map_err(internal)?;

    let analytics =
        compute_book_analytics(&manifest.chapters, &progress, &sessions, &comments);
    Ok(Json(analytics))
}

/// Serves a supplementary document (references, appendix, glossary, ...)
/// listed in the book manifest. Read-only: no progress tracking, no comments.
#[utoipa::path(
    get,
    path = "/books/{book_slug}/supplementary/{slug}",
    responses(
        (status = 200, description = "The supplementary HTML", content_type = "text/html", body = String),
        (status = 404, description = "Content not found"),
        (status = 500, description = "Internal server error")
    ),
    params(
        ("book_slug" = String, Path, description = "The book's URL slug."),
        ("slug" = String, Path, description = "The supplementary resource's slug.")
    )
)]
pub async fn supplementary_handler(
    State(app_state): State<Arc<AppState>>,
    Path((book_slug, slug)): Path<(String, String)>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let not_found = || (StatusCode::NOT_FOUND, "Content not found".to_string());

    let manifest = app_state
        .content
        .load_manifest(&book_slug)
        .await
        .map_err(|e| match e {
            PortError::NotFound(_) => not_found(),
            e => {
                error!("Failed to load manifest: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to load content".to_string(),
                )
            }
        })?;

    if manifest.find_supplementary(&slug).is_none() {
        return Err(not_found());
    }

    let html = app_state
        .content
        .fetch_document(&book_slug, &slug)
        .await
        .map_err(|e| match e {
            PortError::NotFound(_) => not_found(),
            e => {
                error!("Failed to load supplementary content: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to load content".to_string(),
                )
            }
        })?;

    Ok(Html(html))
}
