//! crates/marginalia_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the reader engine.
//! These traits form the boundary of the hexagonal architecture, allowing the
//! engine to be independent of specific external implementations like the
//! database or the static document store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{Book, Comment, Manifest, ReadingProgress, ReadingSession};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, filesystem).
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
    #[error("Unauthorized")]
    Unauthorized,
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Write Payloads
//=========================================================================================

/// The full value set written by one progress persist. The store upserts it
/// by the composite key `(book_id, chapter_slug, user_id)`; re-running with
/// the same key always replaces rather than duplicates.
#[derive(Debug, Clone)]
pub struct ProgressUpsert {
    pub book_id: Uuid,
    pub chapter_slug: String,
    pub user_id: Uuid,
    pub scroll_pct: u8,
    pub time_spent_seconds: u64,
    pub last_read_at: DateTime<Utc>,
    /// Set when the completion threshold was reached during this visit.
    /// The store keeps the earliest non-null value it has seen, so
    /// completion is sticky once recorded.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Client metadata captured when a chapter view mounts.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub book_id: Uuid,
    pub chapter_slug: String,
    pub user_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub user_agent: String,
}

#[derive(Debug, Clone)]
pub struct NewComment {
    pub book_id: Uuid,
    pub chapter_slug: String,
    pub user_id: Uuid,
    pub anchor_text: String,
    pub anchor_paragraph: String,
    pub content: String,
    pub parent_id: Option<Uuid>,
}

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

/// Row-scoped persistence for progress, sessions and comments.
///
/// The store, not the engine, enforces that a user may only write rows under
/// their own identity and may only read comments for chapters they can access.
#[async_trait]
pub trait ReaderStore: Send + Sync {
    // --- Books ---
    async fn resolve_book(&self, slug: &str) -> PortResult<Book>;

    // --- Reading Progress ---
    async fn upsert_progress(&self, progress: ProgressUpsert) -> PortResult<()>;

    async fn get_progress(
        &self,
        book_id: Uuid,
        chapter_slug: &str,
        user_id: Uuid,
    ) -> PortResult<Option<ReadingProgress>>;

    // --- Reading Sessions ---
    async fn open_session(&self, session: NewSession) -> PortResult<Uuid>;

    async fn close_session(
        &self,
        session_id: Uuid,
        ended_at: DateTime<Utc>,
        max_scroll_pct: u8,
    ) -> PortResult<()>;

    // --- Comments ---
    async fn insert_comment(&self, comment: NewComment) -> PortResult<Comment>;

    async fn set_comment_resolved(&self, comment_id: Uuid, resolved: bool) -> PortResult<()>;

    async fn comments_for_chapter(
        &self,
        book_id: Uuid,
        chapter_slug: &str,
    ) -> PortResult<Vec<Comment>>;

    // --- Book-scoped reads (engagement analytics) ---
    async fn progress_for_book(&self, book_id: Uuid) -> PortResult<Vec<ReadingProgress>>;

    async fn sessions_for_book(&self, book_id: Uuid) -> PortResult<Vec<ReadingSession>>;

    async fn comments_for_book(&self, book_id: Uuid) -> PortResult<Vec<Comment>>;
}

/// Yields the stable user identifier behind an opaque session token.
/// The engine trusts this identifier for all writes.
#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn validate_session(&self, token: &str) -> PortResult<Uuid>;
}

/// Serves chapter and supplementary HTML by (book slug, content slug),
/// read-only from the engine's perspective.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn fetch_document(&self, book_slug: &str, slug: &str) -> PortResult<String>;

    async fn load_manifest(&self, book_slug: &str) -> PortResult<Manifest>;
}
