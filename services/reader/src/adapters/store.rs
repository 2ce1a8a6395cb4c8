//! services/reader/src/adapters/store.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `ReaderStore` and `IdentityService` ports from the core crate. It handles
//! all interactions with the PostgreSQL database using `sqlx`.
//!
//! Row-level access control lives here and in the schema, not in the engine:
//! every write is scoped to the authenticated user's id and every read is
//! scoped to one book or chapter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marginalia_core::domain::{Book, Comment, ReadingProgress, ReadingSession};
use marginalia_core::ports::{
    IdentityService, NewComment, NewSession, PortError, PortResult, ProgressUpsert, ReaderStore,
};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `ReaderStore` and `IdentityService` ports.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Creates a new `PgStore`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn unexpected(e: sqlx::Error) -> PortError {
    PortError::Unexpected(e.to_string())
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct BookRecord {
    id: Uuid,
    slug: String,
    title: String,
}
impl BookRecord {
    fn to_domain(self) -> Book {
        Book {
            id: self.id,
            slug: self.slug,
            title: self.title,
        }
    }
}

#[derive(FromRow)]
struct ProgressRecord {
    book_id: Uuid,
    chapter_slug: String,
    user_id: Uuid,
    scroll_pct: i32,
    time_spent_seconds: i64,
    last_read_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}
impl ProgressRecord {
    fn to_domain(self) -> ReadingProgress {
        ReadingProgress {
            book_id: self.book_id,
            chapter_slug: self.chapter_slug,
            user_id: self.user_id,
            scroll_pct: self.scroll_pct.clamp(0, 100) as u8,
            time_spent_seconds: self.time_spent_seconds.max(0) as u64,
            last_read_at: self.last_read_at,
            completed_at: self.completed_at,
        }
    }
}

#[derive(FromRow)]
struct SessionRecord {
    id: Uuid,
    book_id: Uuid,
    chapter_slug: String,
    user_id: Uuid,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    max_scroll_pct: i32,
    viewport_width: i32,
    viewport_height: i32,
    user_agent: String,
}
impl SessionRecord {
    fn to_domain(self) -> ReadingSession {
        ReadingSession {
            id: self.id,
            book_id: self.book_id,
            chapter_slug: self.chapter_slug,
            user_id: self.user_id,
            started_at: self.started_at,
            ended_at: self.ended_at,
            max_scroll_pct: self.max_scroll_pct.clamp(0, 100) as u8,
            viewport_width: self.viewport_width.max(0) as u32,
            viewport_height: self.viewport_height.max(0) as u32,
            user_agent: self.user_agent,
        }
    }
}

#[derive(FromRow)]
struct CommentRecord {
    id: Uuid,
    book_id: Uuid,
    chapter_slug: String,
    user_id: Uuid,
    anchor_text: String,
    anchor_paragraph: String,
    content: String,
    parent_id: Option<Uuid>,
    is_resolved: bool,
    created_at: DateTime<Utc>,
}
impl CommentRecord {
    fn to_domain(self) -> Comment {
        Comment {
            id: self.id,
            book_id: self.book_id,
            chapter_slug: self.chapter_slug,
            user_id: self.user_id,
            anchor_text: self.anchor_text,
            anchor_paragraph: self.anchor_paragraph,
            content: self.content,
            parent_id: self.parent_id,
            is_resolved: self.is_resolved,
            created_at: self.created_at,
        }
    }
}

//=========================================================================================
// `ReaderStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl ReaderStore for PgStore {
    async fn resolve_book(&self, slug: &str) -> PortResult<Book> {
        let record = sqlx::query_as::<_, BookRecord>(
            "SELECT id, slug, title FROM books WHERE slug = $1",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?
        .ok_or_else(|| PortError::NotFound(format!("Book '{}' not found", slug)))?;

        Ok(record.to_domain())
    }

    async fn upsert_progress(&self, progress: ProgressUpsert) -> PortResult<()> {
        // The composite-key uniqueness constraint is the concurrency-safety
        // mechanism: concurrent writers for the same (book, chapter, user)
        // converge to one row, last write visible. `completed_at` keeps the
        // earliest recorded value so completion is sticky.
        sqlx::query(
            "INSERT INTO reading_progress \
                 (book_id, chapter_slug, user_id, scroll_pct, time_spent_seconds, last_read_at, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (book_id, chapter_slug, user_id) DO UPDATE SET \
                 scroll_pct = EXCLUDED.scroll_pct, \
                 time_spent_seconds = EXCLUDED.time_spent_seconds, \
                 last_read_at = EXCLUDED.last_read_at, \
                 completed_at = COALESCE(reading_progress.completed_at, EXCLUDED.completed_at)",
        )
        .bind(progress.book_id)
        .bind(&progress.chapter_slug)
        .bind(progress.user_id)
        .bind(progress.scroll_pct as i32)
        .bind(progress.time_spent_seconds as i64)
        .bind(progress.last_read_at)
        .bind(progress.completed_at)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(())
    }

    async fn get_progress(
        &self,
        book_id: Uuid,
        chapter_slug: &str,
        user_id: Uuid,
    ) -> PortResult<Option<ReadingProgress>> {
        let record = sqlx::query_as::<_, ProgressRecord>(
            "SELECT book_id, chapter_slug, user_id, scroll_pct, time_spent_seconds, last_read_at, completed_at \
             FROM reading_progress \
             WHERE book_id = $1 AND chapter_slug = $2 AND user_id = $3",
        )
        .bind(book_id)
        .bind(chapter_slug)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;

        Ok(record.map(|r| r.to_domain()))
    }

    async fn open_session(&self, session: NewSession) -> PortResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO reading_sessions \
                 (id, book_id, chapter_slug, user_id, started_at, max_scroll_pct, \
                  viewport_width, viewport_height, user_agent) \
             VALUES ($1, $2, $3, $4, $5, 0, $6, $7, $8)",
        )
        .bind(id)
        .bind(session.book_id)
        .bind(&session.chapter_slug)
        .bind(session.user_id)
        .bind(session.started_at)
        .bind(session.viewport_width as i32)
        .bind(session.viewport_height as i32)
        .bind(&session.user_agent)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(id)
    }

    async fn close_session(
        &self,
        session_id: Uuid,
        ended_at: DateTime<Utc>,
        max_scroll_pct: u8,
    ) -> PortResult<()> {
        sqlx::query(
            "UPDATE reading_sessions SET ended_at = $1, max_scroll_pct = $2 WHERE id = $3",
        )
        .bind(ended_at)
        .bind(max_scroll_pct as i32)
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(())
    }

    async fn insert_comment(&self, comment: NewComment) -> PortResult<Comment> {
        let record = sqlx::query_as::<_, CommentRecord>(
            "INSERT INTO comments \
                 (id, book_id, chapter_slug, user_id, anchor_text, anchor_paragraph, content, parent_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING id, book_id, chapter_slug, user_id, anchor_text, anchor_paragraph, \
                       content, parent_id, is_resolved, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(comment.book_id)
        .bind(&comment.chapter_slug)
        .bind(comment.user_id)
        .bind(&comment.anchor_text)
        .bind(&comment.anchor_paragraph)
        .bind(&comment.content)
        .bind(comment.parent_id)
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)?;

        Ok(record.to_domain())
    }

    async fn set_comment_resolved(&self, comment_id: Uuid, resolved: bool) -> PortResult<()> {
        let result = sqlx::query("UPDATE comments SET is_resolved = $1 WHERE id = $2")
            .bind(resolved)
            .bind(comment_id)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;

        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!(
                "Comment {} not found",
                comment_id
            )));
        }
        Ok(())
    }

    async fn comments_for_chapter(
        &self,
        book_id: Uuid,
        chapter_slug: &str,
    ) -> PortResult<Vec<Comment>> {
        let records = sqlx::query_as::<_, CommentRecord>(
            "SELECT id, book_id, chapter_slug, user_id, anchor_text, anchor_paragraph, \
                    content, parent_id, is_resolved, created_at \
             FROM comments \
             WHERE book_id = $1 AND chapter_slug = $2 \
             ORDER BY created_at ASC",
        )
        .bind(book_id)
        .bind(chapter_slug)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;

        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }

    async fn progress_for_book(&self, book_id: Uuid) -> PortResult<Vec<ReadingProgress>> {
        let records = sqlx::query_as::<_, ProgressRecord>(
            "SELECT book_id, chapter_slug, user_id, scroll_pct, time_spent_seconds, last_read_at, completed_at \
             FROM reading_progress WHERE book_id = $1",
        )
        .bind(book_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;

        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }

    async fn sessions_for_book(&self, book_id: Uuid) -> PortResult<Vec<ReadingSession>> {
        let records = sqlx::query_as::<_, SessionRecord>(
            "SELECT id, book_id, chapter_slug, user_id, started_at, ended_at, max_scroll_pct, \
                    viewport_width, viewport_height, user_agent \
             FROM reading_sessions WHERE book_id = $1",
        )
        .bind(book_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;

        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }

    async fn comments_for_book(&self, book_id: Uuid) -> PortResult<Vec<Comment>> {
        let records = sqlx::query_as::<_, CommentRecord>(
            "SELECT id, book_id, chapter_slug, user_id, anchor_text, anchor_paragraph, \
                    content, parent_id, is_resolved, created_at \
             FROM comments WHERE book_id = $1 ORDER BY created_at ASC",
        )
        .bind(book_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;

        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }
}

//=========================================================================================
// `IdentityService` Trait Implementation
//=========================================================================================

#[async_trait]
impl IdentityService for PgStore {
    async fn validate_session(&self, token: &str) -> PortResult<Uuid> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            "SELECT user_id FROM auth_sessions WHERE id = $1 AND expires_at > NOW()",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;

        row.map(|(user_id,)| user_id)
            .ok_or(PortError::Unauthorized)
    }
}
